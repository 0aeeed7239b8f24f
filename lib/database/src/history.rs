//! Append-only history tables and the version cache.

use docksmith_client::entities::{
  docksmith_timestamp,
  update::{ChangeKind, ContainerCheck, UpdateStatus},
};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Database, DbError};

/// What the update log records.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogOperation {
  Pull,
  Restart,
  Rollback,
}

impl Database {
  /// Persist one discovery pass in a single transaction.
  pub fn insert_check_batch(
    &self,
    checks: &[ContainerCheck],
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      let tx = conn.transaction()?;
      {
        let mut stmt = tx.prepare(
          "INSERT INTO check_history (container_name, stack_name, \
           image_ref, current_version, latest_version, status, \
           change_kind, checked_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for check in checks {
          stmt.execute(params![
            check.container_name,
            check.stack,
            check.image,
            check.current_version,
            check.latest_version,
            check.status.to_string(),
            check.change_kind.to_string(),
            check.checked_at,
          ])?;
        }
      }
      tx.commit()?;
      Ok(())
    })
  }

  pub fn recent_checks(
    &self,
    container_name: &str,
    limit: u32,
  ) -> Result<Vec<ContainerCheck>, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(
        "SELECT container_name, stack_name, image_ref, \
         current_version, latest_version, status, change_kind, \
         checked_at
         FROM check_history WHERE container_name = ?1
         ORDER BY checked_at DESC LIMIT ?2",
      )?;
      let rows = stmt
        .query_map(params![container_name, limit], |row| {
          let status: String = row.get(5)?;
          let change: Option<String> = row.get(6)?;
          Ok(ContainerCheck {
            container_name: row.get(0)?,
            stack: row.get(1)?,
            image: row.get(2)?,
            current_version: row
              .get::<_, Option<String>>(3)?
              .unwrap_or_default(),
            latest_version: row.get(4)?,
            current_digest: None,
            status: status
              .parse()
              .unwrap_or(UpdateStatus::Unknown),
            change_kind: change
              .and_then(|c| c.parse().ok())
              .unwrap_or(ChangeKind::Unknown),
            checked_at: row.get(7)?,
          })
        })?
        .collect::<Result<Vec<_>, _>>()?;
      Ok(rows)
    })
  }

  pub fn append_update_log(
    &self,
    container_name: &str,
    operation: LogOperation,
    from_version: Option<&str>,
    to_version: Option<&str>,
    success: bool,
    message: Option<&str>,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO update_log (container_name, operation, \
         from_version, to_version, success, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
          container_name,
          operation.to_string(),
          from_version,
          to_version,
          success,
          message,
          docksmith_timestamp(),
        ],
      )?;
      Ok(())
    })
  }

  // ---- version cache ----

  /// A cached resolution, honoring `ttl_secs` from config. Expired
  /// rows read as misses.
  pub fn cached_version(
    &self,
    sha256: &str,
    image_ref: &str,
    arch: &str,
    ttl_secs: u64,
  ) -> Result<Option<String>, DbError> {
    let oldest =
      docksmith_timestamp() - (ttl_secs as i64).saturating_mul(1000);
    self.read(|conn| {
      let mut stmt = conn.prepare(
        "SELECT resolved_version FROM version_cache
         WHERE sha256 = ?1 AND image_ref = ?2 AND arch = ?3
           AND resolved_at >= ?4",
      )?;
      let mut rows = stmt.query_map(
        params![sha256, image_ref, arch, oldest],
        |row| row.get::<_, String>(0),
      )?;
      Ok(rows.next().transpose()?)
    })
  }

  pub fn cache_version(
    &self,
    sha256: &str,
    image_ref: &str,
    arch: &str,
    resolved_version: &str,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO version_cache (sha256, image_ref, arch, \
         resolved_version, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (sha256, image_ref, arch) DO UPDATE SET
           resolved_version = excluded.resolved_version,
           resolved_at = excluded.resolved_at",
        params![
          sha256,
          image_ref,
          arch,
          resolved_version,
          docksmith_timestamp(),
        ],
      )?;
      Ok(())
    })
  }
}
