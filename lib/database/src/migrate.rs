//! Ordered, monotonic migrations. Every migration carries an `up`
//! and a `down`; applied versions are recorded in the `migrations`
//! table.

use rusqlite::params;

use crate::{Database, DbError};

pub(crate) struct Migration {
  pub version: i64,
  pub name: &'static str,
  pub up: &'static str,
  pub down: &'static str,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    name: "initial",
    up: "
      CREATE TABLE version_cache (
        sha256 TEXT NOT NULL,
        image_ref TEXT NOT NULL,
        arch TEXT NOT NULL,
        resolved_version TEXT NOT NULL,
        resolved_at INTEGER NOT NULL,
        PRIMARY KEY (sha256, image_ref, arch)
      );
      CREATE TABLE check_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        container_name TEXT NOT NULL,
        stack_name TEXT,
        image_ref TEXT NOT NULL,
        current_version TEXT,
        latest_version TEXT,
        status TEXT NOT NULL,
        change_kind TEXT,
        checked_at INTEGER NOT NULL
      );
      CREATE TABLE update_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        container_name TEXT NOT NULL,
        operation TEXT NOT NULL
          CHECK (operation IN ('pull','restart','rollback')),
        from_version TEXT,
        to_version TEXT,
        success INTEGER NOT NULL,
        message TEXT,
        created_at INTEGER NOT NULL
      );
      CREATE TABLE config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
      );
      CREATE TABLE config_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        snapshot_time INTEGER NOT NULL,
        config_snapshot_json TEXT NOT NULL,
        changed_by TEXT
      );
    ",
    down: "
      DROP TABLE config_history;
      DROP TABLE config;
      DROP TABLE update_log;
      DROP TABLE check_history;
      DROP TABLE version_cache;
    ",
  },
  Migration {
    version: 2,
    name: "operations",
    up: "
      CREATE TABLE update_operations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation_id TEXT NOT NULL UNIQUE,
        container_name TEXT NOT NULL,
        stack_name TEXT,
        operation_type TEXT,
        status TEXT NOT NULL,
        old_version TEXT,
        new_version TEXT,
        started_at INTEGER,
        completed_at INTEGER,
        error TEXT,
        error_kind TEXT,
        force_retry INTEGER NOT NULL DEFAULT 0,
        dependents_affected_json TEXT NOT NULL DEFAULT '[]',
        dependents_blocked_json TEXT NOT NULL DEFAULT '[]',
        rollback_occurred INTEGER NOT NULL DEFAULT 0,
        batch_details_json TEXT,
        batch_group_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
      );
      CREATE INDEX idx_update_operations_status
        ON update_operations (status);
      CREATE TABLE update_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation_id TEXT NOT NULL UNIQUE,
        stack_name TEXT NOT NULL,
        containers_json TEXT NOT NULL DEFAULT '[]',
        operation_type TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        queued_at INTEGER NOT NULL,
        estimated_start INTEGER,
        target_versions_json TEXT NOT NULL DEFAULT '{}'
      );
      CREATE TABLE compose_backups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation_id TEXT NOT NULL,
        container_name TEXT NOT NULL,
        stack_name TEXT,
        compose_file_path TEXT NOT NULL,
        backup_file_path TEXT NOT NULL,
        backup_timestamp INTEGER NOT NULL
      );
    ",
    down: "
      DROP TABLE compose_backups;
      DROP TABLE update_queue;
      DROP INDEX idx_update_operations_status;
      DROP TABLE update_operations;
    ",
  },
  Migration {
    version: 3,
    name: "policies_and_assignments",
    up: "
      CREATE TABLE rollback_policies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL
          CHECK (entity_type IN ('global','container','stack')),
        entity_id TEXT,
        auto_rollback_enabled INTEGER NOT NULL DEFAULT 1,
        health_check_required INTEGER NOT NULL DEFAULT 1,
        UNIQUE (entity_type, entity_id)
      );
      INSERT INTO rollback_policies (entity_type, entity_id)
        VALUES ('global', NULL);
      CREATE TABLE script_assignments (
        container_name TEXT PRIMARY KEY,
        script_path TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        ignore INTEGER NOT NULL DEFAULT 0,
        allow_latest INTEGER NOT NULL DEFAULT 0
      );
    ",
    down: "
      DROP TABLE script_assignments;
      DROP TABLE rollback_policies;
    ",
  },
];

impl Database {
  pub(crate) fn migrate_up(&self) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at INTEGER NOT NULL
        );",
      )?;
      let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
      )?;
      for migration in
        MIGRATIONS.iter().filter(|m| m.version > current)
      {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
          "INSERT INTO migrations (version, name, applied_at)
           VALUES (?1, ?2, ?3)",
          params![
            migration.version,
            migration.name,
            docksmith_client::entities::docksmith_timestamp(),
          ],
        )?;
        tx.commit()?;
        tracing::info!(
          version = migration.version,
          name = migration.name,
          "applied migration"
        );
      }
      Ok(())
    })
  }

  /// Roll back to (and including keeping) `target` version.
  pub fn migrate_down(&self, target: i64) -> Result<(), DbError> {
    self.with_retry(|conn| {
      let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
      )?;
      for migration in MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version <= current && m.version > target)
      {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.down)?;
        tx.execute(
          "DELETE FROM migrations WHERE version = ?1",
          params![migration.version],
        )?;
        tx.commit()?;
        tracing::info!(
          version = migration.version,
          name = migration.name,
          "reverted migration"
        );
      }
      Ok(())
    })
  }

  pub fn schema_version(&self) -> Result<i64, DbError> {
    self.read(|conn| {
      Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
      )?)
    })
  }
}
