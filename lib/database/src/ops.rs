//! Operation records, the per-stack queue, compose backups,
//! rollback policies and script assignments.

use docksmith_client::entities::{
  docksmith_timestamp,
  operation::{
    BatchDetail, ComposeBackup, ErrorKind, OperationRecord,
    OperationStatus, OperationType, PolicyEntityType, QueueEntry,
    RollbackPolicy, ScriptAssignment,
  },
};
use rusqlite::{Row, params};

use crate::{Database, DbError, from_json, to_json};

fn row_to_operation(row: &Row) -> rusqlite::Result<OperationRecord> {
  let operation_type: Option<String> = row.get("operation_type")?;
  let status: String = row.get("status")?;
  let error_kind: Option<String> = row.get("error_kind")?;
  let affected: Option<String> =
    row.get("dependents_affected_json")?;
  let blocked: Option<String> = row.get("dependents_blocked_json")?;
  let batch: Option<String> = row.get("batch_details_json")?;
  Ok(OperationRecord {
    operation_id: row.get("operation_id")?,
    container_name: row.get("container_name")?,
    stack_name: row.get("stack_name")?,
    operation_type: operation_type
      .and_then(|t| t.parse::<OperationType>().ok()),
    status: status.parse().unwrap_or_default(),
    old_version: row.get("old_version")?,
    new_version: row.get("new_version")?,
    started_at: row.get("started_at")?,
    completed_at: row.get("completed_at")?,
    error: row.get("error")?,
    error_kind: error_kind
      .and_then(|k| k.parse::<ErrorKind>().ok()),
    force_retry: row.get("force_retry")?,
    dependents_affected: from_json(affected, Vec::new()),
    dependents_blocked: from_json(blocked, Vec::new()),
    rollback_occurred: row.get("rollback_occurred")?,
    batch_details: batch
      .map(|text| from_json(Some(text), Vec::<BatchDetail>::new())),
    batch_group_id: row.get("batch_group_id")?,
    created_at: row.get("created_at")?,
    updated_at: row.get("updated_at")?,
  })
}

const OPERATION_COLUMNS: &str = "operation_id, container_name, \
  stack_name, operation_type, status, old_version, new_version, \
  started_at, completed_at, error, error_kind, force_retry, \
  dependents_affected_json, dependents_blocked_json, \
  rollback_occurred, batch_details_json, batch_group_id, \
  created_at, updated_at";

impl Database {
  pub fn insert_operation(
    &self,
    record: &OperationRecord,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO update_operations (operation_id, \
         container_name, stack_name, operation_type, status, \
         old_version, new_version, started_at, completed_at, \
         error, error_kind, force_retry, \
         dependents_affected_json, dependents_blocked_json, \
         rollback_occurred, batch_details_json, batch_group_id, \
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
         ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
          record.operation_id,
          record.container_name,
          record.stack_name,
          record.operation_type.map(|t| t.to_string()),
          record.status.to_string(),
          record.old_version,
          record.new_version,
          record.started_at,
          record.completed_at,
          record.error,
          record.error_kind.map(|k| k.to_string()),
          record.force_retry,
          to_json(&record.dependents_affected)?,
          to_json(&record.dependents_blocked)?,
          record.rollback_occurred,
          record
            .batch_details
            .as_ref()
            .map(to_json)
            .transpose()?,
          record.batch_group_id,
          record.created_at,
          record.updated_at,
        ],
      )?;
      Ok(())
    })
  }

  pub fn get_operation(
    &self,
    operation_id: &str,
  ) -> Result<Option<OperationRecord>, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM update_operations
         WHERE operation_id = ?1"
      ))?;
      let mut rows =
        stmt.query_map([operation_id], row_to_operation)?;
      Ok(rows.next().transpose()?)
    })
  }

  /// Advance the status, enforcing the transition DAG. Sets
  /// `started_at` on the first live stage and `completed_at` on
  /// terminal transitions.
  pub fn set_operation_status(
    &self,
    operation_id: &str,
    next: OperationStatus,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      let tx = conn.transaction()?;
      let current: String = tx
        .query_row(
          "SELECT status FROM update_operations
           WHERE operation_id = ?1",
          [operation_id],
          |row| row.get(0),
        )
        .map_err(|e| match e {
          rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(
            format!("operation {operation_id}"),
          ),
          e => e.into(),
        })?;
      let current: OperationStatus =
        current.parse().unwrap_or_default();
      if !current.can_transition_to(next) {
        return Err(DbError::StatusRegression {
          operation_id: operation_id.to_string(),
          from: current,
          to: next,
        });
      }
      let now = docksmith_timestamp();
      tx.execute(
        "UPDATE update_operations SET
           status = ?2,
           updated_at = ?3,
           started_at = CASE
             WHEN started_at IS NULL AND ?2 != 'queued'
             THEN ?3 ELSE started_at END,
           completed_at = CASE
             WHEN ?2 IN ('complete','partial','failed','cancelled')
             THEN ?3 ELSE completed_at END
         WHERE operation_id = ?1",
        params![operation_id, next.to_string(), now],
      )?;
      tx.commit()?;
      Ok(())
    })
  }

  pub fn fail_operation(
    &self,
    operation_id: &str,
    error: &str,
    kind: ErrorKind,
    force_retry: bool,
  ) -> Result<(), DbError> {
    self.set_operation_status(
      operation_id,
      OperationStatus::Failed,
    )?;
    self.with_retry(|conn| {
      conn.execute(
        "UPDATE update_operations SET
           error = ?2, error_kind = ?3, force_retry = ?4,
           updated_at = ?5
         WHERE operation_id = ?1",
        params![
          operation_id,
          error,
          kind.to_string(),
          force_retry,
          docksmith_timestamp(),
        ],
      )?;
      Ok(())
    })
  }

  pub fn set_operation_versions(
    &self,
    operation_id: &str,
    old_version: Option<&str>,
    new_version: Option<&str>,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "UPDATE update_operations SET
           old_version = ?2, new_version = ?3, updated_at = ?4
         WHERE operation_id = ?1",
        params![
          operation_id,
          old_version,
          new_version,
          docksmith_timestamp(),
        ],
      )?;
      Ok(())
    })
  }

  pub fn set_rollback_occurred(
    &self,
    operation_id: &str,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "UPDATE update_operations SET
           rollback_occurred = 1, updated_at = ?2
         WHERE operation_id = ?1",
        params![operation_id, docksmith_timestamp()],
      )?;
      Ok(())
    })
  }

  pub fn set_operation_dependents(
    &self,
    operation_id: &str,
    affected: &[String],
    blocked: &[String],
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "UPDATE update_operations SET
           dependents_affected_json = ?2,
           dependents_blocked_json = ?3,
           updated_at = ?4
         WHERE operation_id = ?1",
        params![
          operation_id,
          to_json(&affected)?,
          to_json(&blocked)?,
          docksmith_timestamp(),
        ],
      )?;
      Ok(())
    })
  }

  pub fn set_batch_details(
    &self,
    operation_id: &str,
    details: &[BatchDetail],
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "UPDATE update_operations SET
           batch_details_json = ?2, updated_at = ?3
         WHERE operation_id = ?1",
        params![
          operation_id,
          to_json(&details)?,
          docksmith_timestamp(),
        ],
      )?;
      Ok(())
    })
  }

  /// Every operation not in a terminal state, for startup
  /// recovery.
  pub fn non_terminal_operations(
    &self,
  ) -> Result<Vec<OperationRecord>, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM update_operations
         WHERE status NOT IN
           ('complete','partial','failed','cancelled')
         ORDER BY created_at ASC"
      ))?;
      let rows = stmt
        .query_map([], row_to_operation)?
        .collect::<Result<Vec<_>, _>>()?;
      Ok(rows)
    })
  }

  /// Mean duration (ms) of the last `limit` completed operations
  /// on a stack, for queue estimates.
  pub fn mean_recent_duration(
    &self,
    stack_name: &str,
    limit: u32,
  ) -> Result<Option<i64>, DbError> {
    self.read(|conn| {
      let mean: Option<f64> = conn.query_row(
        "SELECT AVG(completed_at - started_at) FROM (
           SELECT completed_at, started_at FROM update_operations
           WHERE stack_name = ?1 AND status = 'complete'
             AND started_at IS NOT NULL
             AND completed_at IS NOT NULL
           ORDER BY completed_at DESC LIMIT ?2
         )",
        params![stack_name, limit],
        |row| row.get(0),
      )?;
      Ok(mean.map(|mean| mean as i64))
    })
  }

  // ---- queue ----

  pub fn enqueue(&self, entry: &QueueEntry) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO update_queue (operation_id, stack_name, \
         containers_json, operation_type, priority, queued_at, \
         estimated_start, target_versions_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
          entry.operation_id,
          entry.stack_name,
          to_json(&entry.containers)?,
          entry.operation_type.map(|t| t.to_string()),
          entry.priority,
          entry.queued_at,
          entry.estimated_start,
          to_json(&entry.target_versions)?,
        ],
      )?;
      Ok(())
    })
  }

  /// Pop the next entry for a stack: highest priority first, FIFO
  /// within a priority. The row is deleted in the same
  /// transaction.
  pub fn dequeue_next(
    &self,
    stack_name: &str,
  ) -> Result<Option<QueueEntry>, DbError> {
    self.with_retry(|conn| {
      let tx = conn.transaction()?;
      let entry = {
        let mut stmt = tx.prepare(
          "SELECT operation_id, stack_name, containers_json, \
           operation_type, priority, queued_at, estimated_start, \
           target_versions_json
           FROM update_queue WHERE stack_name = ?1
           ORDER BY priority DESC, queued_at ASC, id ASC
           LIMIT 1",
        )?;
        let mut rows =
          stmt.query_map([stack_name], row_to_queue_entry)?;
        rows.next().transpose()?
      };
      if let Some(entry) = &entry {
        tx.execute(
          "DELETE FROM update_queue WHERE operation_id = ?1",
          [&entry.operation_id],
        )?;
      }
      tx.commit()?;
      Ok(entry)
    })
  }

  pub fn remove_queued(
    &self,
    operation_id: &str,
  ) -> Result<bool, DbError> {
    self.with_retry(|conn| {
      let removed = conn.execute(
        "DELETE FROM update_queue WHERE operation_id = ?1",
        [operation_id],
      )?;
      Ok(removed > 0)
    })
  }

  pub fn queued_entries(
    &self,
  ) -> Result<Vec<QueueEntry>, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(
        "SELECT operation_id, stack_name, containers_json, \
         operation_type, priority, queued_at, estimated_start, \
         target_versions_json
         FROM update_queue
         ORDER BY priority DESC, queued_at ASC, id ASC",
      )?;
      let rows = stmt
        .query_map([], row_to_queue_entry)?
        .collect::<Result<Vec<_>, _>>()?;
      Ok(rows)
    })
  }

  // ---- compose backups ----

  pub fn insert_compose_backup(
    &self,
    backup: &ComposeBackup,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO compose_backups (operation_id, \
         container_name, stack_name, compose_file_path, \
         backup_file_path, backup_timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
          backup.operation_id,
          backup.container_name,
          backup.stack_name,
          backup.compose_file_path,
          backup.backup_file_path,
          backup.backup_timestamp,
        ],
      )?;
      Ok(())
    })
  }

  pub fn compose_backup_for(
    &self,
    operation_id: &str,
    container_name: &str,
  ) -> Result<Option<ComposeBackup>, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(
        "SELECT operation_id, container_name, stack_name, \
         compose_file_path, backup_file_path, backup_timestamp
         FROM compose_backups
         WHERE operation_id = ?1 AND container_name = ?2
         ORDER BY backup_timestamp DESC LIMIT 1",
      )?;
      let mut rows = stmt.query_map(
        params![operation_id, container_name],
        |row| {
          Ok(ComposeBackup {
            operation_id: row.get(0)?,
            container_name: row.get(1)?,
            stack_name: row.get(2)?,
            compose_file_path: row.get(3)?,
            backup_file_path: row.get(4)?,
            backup_timestamp: row.get(5)?,
          })
        },
      )?;
      Ok(rows.next().transpose()?)
    })
  }

  // ---- rollback policies ----

  pub fn upsert_rollback_policy(
    &self,
    policy: &RollbackPolicy,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO rollback_policies (entity_type, entity_id, \
         auto_rollback_enabled, health_check_required)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (entity_type, entity_id) DO UPDATE SET
           auto_rollback_enabled = excluded.auto_rollback_enabled,
           health_check_required = excluded.health_check_required",
        params![
          policy.entity_type.to_string(),
          policy.entity_id,
          policy.auto_rollback_enabled,
          policy.health_check_required,
        ],
      )?;
      Ok(())
    })
  }

  /// Hierarchical resolution: container > stack > global. The
  /// global row is seeded by migration and always present.
  pub fn effective_rollback_policy(
    &self,
    container_name: &str,
    stack_name: Option<&str>,
  ) -> Result<RollbackPolicy, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, auto_rollback_enabled, \
         health_check_required
         FROM rollback_policies
         WHERE (entity_type = 'container' AND entity_id = ?1)
            OR (entity_type = 'stack' AND entity_id = ?2)
            OR entity_type = 'global'
         ORDER BY CASE entity_type
           WHEN 'container' THEN 0
           WHEN 'stack' THEN 1
           ELSE 2 END
         LIMIT 1",
      )?;
      let mut rows = stmt.query_map(
        params![container_name, stack_name],
        |row| {
          let entity_type: String = row.get(0)?;
          Ok(RollbackPolicy {
            entity_type: entity_type
              .parse()
              .unwrap_or(PolicyEntityType::Global),
            entity_id: row.get(1)?,
            auto_rollback_enabled: row.get(2)?,
            health_check_required: row.get(3)?,
          })
        },
      )?;
      rows.next().transpose()?.ok_or_else(|| {
        DbError::NotFound(String::from("global rollback policy"))
      })
    })
  }

  // ---- script assignments ----

  pub fn upsert_script_assignment(
    &self,
    assignment: &ScriptAssignment,
  ) -> Result<(), DbError> {
    self.with_retry(|conn| {
      conn.execute(
        "INSERT INTO script_assignments (container_name, \
         script_path, enabled, ignore, allow_latest)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (container_name) DO UPDATE SET
           script_path = excluded.script_path,
           enabled = excluded.enabled,
           ignore = excluded.ignore,
           allow_latest = excluded.allow_latest",
        params![
          assignment.container_name,
          assignment.script_path,
          assignment.enabled,
          assignment.ignore,
          assignment.allow_latest,
        ],
      )?;
      Ok(())
    })
  }

  pub fn script_assignment(
    &self,
    container_name: &str,
  ) -> Result<Option<ScriptAssignment>, DbError> {
    self.read(|conn| {
      let mut stmt = conn.prepare(
        "SELECT container_name, script_path, enabled, ignore, \
         allow_latest
         FROM script_assignments WHERE container_name = ?1",
      )?;
      let mut rows = stmt.query_map([container_name], |row| {
        Ok(ScriptAssignment {
          container_name: row.get(0)?,
          script_path: row.get(1)?,
          enabled: row.get(2)?,
          ignore: row.get(3)?,
          allow_latest: row.get(4)?,
        })
      })?;
      Ok(rows.next().transpose()?)
    })
  }
}

fn row_to_queue_entry(row: &Row) -> rusqlite::Result<QueueEntry> {
  let containers: Option<String> = row.get(2)?;
  let operation_type: Option<String> = row.get(3)?;
  let targets: Option<String> = row.get(7)?;
  Ok(QueueEntry {
    operation_id: row.get(0)?,
    stack_name: row.get(1)?,
    containers: from_json(containers, Vec::new()),
    operation_type: operation_type
      .and_then(|t| t.parse::<OperationType>().ok()),
    priority: row.get(4)?,
    queued_at: row.get(5)?,
    estimated_start: row.get(6)?,
    target_versions: from_json(targets, Default::default()),
  })
}
