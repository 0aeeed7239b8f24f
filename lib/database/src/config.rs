//! Key/value config with snapshot and atomic revert.

use std::collections::BTreeMap;

use docksmith_client::entities::docksmith_timestamp;
use rusqlite::params;

use crate::{Database, DbError};

/// One row of `config_history`.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
  pub id: i64,
  pub snapshot_time: i64,
  pub entries: BTreeMap<String, String>,
  pub changed_by: Option<String>,
}

impl Database {
  pub fn set_config(
    &self,
    key: &str,
    value: &str,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO config (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![key, value, docksmith_timestamp()],
      )?;
      Ok(())
    })
  }

  pub fn get_config(
    &self,
    key: &str,
  ) -> Result<Option<String>, DbError> {
    self.read(|conn| {
      let mut stmt = conn
        .prepare("SELECT value FROM config WHERE key = ?1")?;
      let mut rows =
        stmt.query_map([key], |row| row.get::<_, String>(0))?;
      Ok(rows.next().transpose()?)
    })
  }

  pub fn all_config(
    &self,
  ) -> Result<BTreeMap<String, String>, DbError> {
    self.read(|conn| {
      let mut stmt =
        conn.prepare("SELECT key, value FROM config")?;
      let rows = stmt
        .query_map([], |row| {
          Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
      Ok(rows)
    })
  }

  /// Record the current config rows as a new snapshot. Returns the
  /// snapshot id.
  pub fn snapshot_config(
    &self,
    changed_by: Option<&str>,
  ) -> Result<i64, DbError> {
    self.with_retry(|conn| {
      let tx = conn.transaction()?;
      let entries = {
        let mut stmt =
          tx.prepare("SELECT key, value FROM config")?;
        let rows = stmt
          .query_map([], |row| {
            Ok((
              row.get::<_, String>(0)?,
              row.get::<_, String>(1)?,
            ))
          })?
          .collect::<Result<BTreeMap<_, _>, _>>()?;
        rows
      };
      tx.execute(
        "INSERT INTO config_history (snapshot_time, \
         config_snapshot_json, changed_by)
         VALUES (?1, ?2, ?3)",
        params![
          docksmith_timestamp(),
          serde_json::to_string(&entries)?,
          changed_by,
        ],
      )?;
      let id = tx.last_insert_rowid();
      tx.commit()?;
      Ok(id)
    })
  }

  pub fn config_snapshot(
    &self,
    id: i64,
  ) -> Result<Option<ConfigSnapshot>, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(
        "SELECT id, snapshot_time, config_snapshot_json, \
         changed_by
         FROM config_history WHERE id = ?1",
      )?;
      let mut rows = stmt.query_map([id], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, i64>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Option<String>>(3)?,
        ))
      })?;
      let Some(row) = rows.next().transpose()? else {
        return Ok(None);
      };
      let (id, snapshot_time, entries_json, changed_by) = row;
      Ok(Some(ConfigSnapshot {
        id,
        snapshot_time,
        entries: serde_json::from_str(&entries_json)?,
        changed_by,
      }))
    })
  }

  /// Atomically replace the current config rows with a snapshot's
  /// entries, then record a new snapshot documenting the revert.
  pub fn revert_to_snapshot(
    &self,
    id: i64,
    changed_by: Option<&str>,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      let tx = conn.transaction()?;
      let entries_json: String = tx
        .query_row(
          "SELECT config_snapshot_json FROM config_history
           WHERE id = ?1",
          [id],
          |row| row.get(0),
        )
        .map_err(|e| match e {
          rusqlite::Error::QueryReturnedNoRows => {
            DbError::NotFound(format!("config snapshot {id}"))
          }
          e => e.into(),
        })?;
      let entries: BTreeMap<String, String> =
        serde_json::from_str(&entries_json)?;
      let now = docksmith_timestamp();
      tx.execute("DELETE FROM config", [])?;
      {
        let mut stmt = tx.prepare(
          "INSERT INTO config (key, value, updated_at)
           VALUES (?1, ?2, ?3)",
        )?;
        for (key, value) in &entries {
          stmt.execute(params![key, value, now])?;
        }
      }
      tx.execute(
        "INSERT INTO config_history (snapshot_time, \
         config_snapshot_json, changed_by)
         VALUES (?1, ?2, ?3)",
        params![
          now,
          &entries_json,
          changed_by
            .map(|by| format!("{by} (revert to {id})"))
            .unwrap_or_else(|| format!("revert to {id}")),
        ],
      )?;
      tx.commit()?;
      Ok(())
    })
  }
}
