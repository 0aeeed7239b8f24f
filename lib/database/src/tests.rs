use docksmith_client::entities::{
  docksmith_timestamp,
  operation::{
    BatchDetail, ErrorKind, OperationRecord, OperationStatus,
    OperationType, PolicyEntityType, QueueEntry, RollbackPolicy,
    ScriptAssignment,
  },
  update::{ChangeKind, ContainerCheck, UpdateStatus},
};

use super::*;

fn db() -> Database {
  Database::open_in_memory().unwrap()
}

fn operation(container: &str) -> OperationRecord {
  OperationRecord::new(
    OperationType::Single,
    container,
    Some(String::from("media")),
  )
}

#[test]
fn migrations_apply_and_revert() {
  let db = db();
  assert_eq!(db.schema_version().unwrap(), 3);
  db.migrate_down(1).unwrap();
  assert_eq!(db.schema_version().unwrap(), 1);
  db.migrate_up().unwrap();
  assert_eq!(db.schema_version().unwrap(), 3);
}

#[test]
fn operation_round_trips_json_columns() {
  let db = db();
  let mut record = operation("web");
  record.dependents_affected =
    vec![String::from("a"), String::from("b")];
  record.batch_details = Some(vec![BatchDetail {
    container_name: String::from("web"),
    status: OperationStatus::Queued,
    old_digest: Some(String::from("sha256:aaa")),
    ..Default::default()
  }]);
  db.insert_operation(&record).unwrap();

  let loaded =
    db.get_operation(&record.operation_id).unwrap().unwrap();
  assert_eq!(loaded.container_name, "web");
  assert_eq!(loaded.stack_name.as_deref(), Some("media"));
  assert_eq!(loaded.operation_type, Some(OperationType::Single));
  assert_eq!(loaded.dependents_affected, vec!["a", "b"]);
  let details = loaded.batch_details.unwrap();
  assert_eq!(details[0].old_digest.as_deref(), Some("sha256:aaa"));
}

#[test]
fn status_transitions_are_monotonic() {
  let db = db();
  let record = operation("web");
  db.insert_operation(&record).unwrap();
  let id = record.operation_id.as_str();

  db.set_operation_status(id, OperationStatus::Validating)
    .unwrap();
  db.set_operation_status(id, OperationStatus::PullingImage)
    .unwrap();
  // Regression is rejected by the store.
  let err = db
    .set_operation_status(id, OperationStatus::Backup)
    .unwrap_err();
  assert!(matches!(err, DbError::StatusRegression { .. }));

  db.set_operation_status(id, OperationStatus::Complete)
    .unwrap();
  let loaded = db.get_operation(id).unwrap().unwrap();
  assert_eq!(loaded.status, OperationStatus::Complete);
  assert!(loaded.started_at.is_some());
  assert!(loaded.completed_at.is_some());

  // Terminal states never change.
  let err = db
    .set_operation_status(id, OperationStatus::Failed)
    .unwrap_err();
  assert!(matches!(err, DbError::StatusRegression { .. }));
}

#[test]
fn fail_operation_records_error_and_force_retry() {
  let db = db();
  let record = operation("web");
  db.insert_operation(&record).unwrap();
  db.fail_operation(
    &record.operation_id,
    "pre-update check exited 1",
    ErrorKind::Precheck,
    true,
  )
  .unwrap();
  let loaded =
    db.get_operation(&record.operation_id).unwrap().unwrap();
  assert_eq!(loaded.status, OperationStatus::Failed);
  assert_eq!(loaded.error_kind, Some(ErrorKind::Precheck));
  assert!(loaded.force_retry);
  assert!(loaded.completed_at.is_some());
}

#[test]
fn queue_is_priority_then_fifo() {
  let db = db();
  let entry = |id: &str, priority: i64, queued_at: i64| QueueEntry {
    operation_id: id.to_string(),
    stack_name: String::from("media"),
    containers: vec![String::from("web")],
    operation_type: Some(OperationType::Single),
    priority,
    queued_at,
    estimated_start: None,
    target_versions: Default::default(),
  };
  db.enqueue(&entry("first", 0, 100)).unwrap();
  db.enqueue(&entry("second", 0, 200)).unwrap();
  db.enqueue(&entry("urgent", 5, 300)).unwrap();

  let popped = db.dequeue_next("media").unwrap().unwrap();
  assert_eq!(popped.operation_id, "urgent");
  let popped = db.dequeue_next("media").unwrap().unwrap();
  assert_eq!(popped.operation_id, "first");
  let popped = db.dequeue_next("media").unwrap().unwrap();
  assert_eq!(popped.operation_id, "second");
  assert!(db.dequeue_next("media").unwrap().is_none());
}

#[test]
fn remove_queued_cancels_pending_entry() {
  let db = db();
  db.enqueue(&QueueEntry {
    operation_id: String::from("op"),
    stack_name: String::from("media"),
    queued_at: docksmith_timestamp(),
    ..Default::default()
  })
  .unwrap();
  assert!(db.remove_queued("op").unwrap());
  assert!(!db.remove_queued("op").unwrap());
}

#[test]
fn version_cache_honors_ttl() {
  let db = db();
  db.cache_version("sha256:abc", "nginx", "amd64", "1.25.3")
    .unwrap();
  assert_eq!(
    db.cached_version("sha256:abc", "nginx", "amd64", 3600)
      .unwrap()
      .as_deref(),
    Some("1.25.3")
  );
  // TTL zero: everything is expired.
  assert_eq!(
    db.cached_version("sha256:abc", "nginx", "amd64", 0)
      .unwrap(),
    None
  );
}

#[test]
fn rollback_policy_hierarchy() {
  let db = db();
  // Seeded global default always present.
  let global =
    db.effective_rollback_policy("web", Some("media")).unwrap();
  assert_eq!(global.entity_type, PolicyEntityType::Global);
  assert!(global.auto_rollback_enabled);

  db.upsert_rollback_policy(&RollbackPolicy {
    entity_type: PolicyEntityType::Stack,
    entity_id: Some(String::from("media")),
    auto_rollback_enabled: false,
    health_check_required: true,
  })
  .unwrap();
  let stack =
    db.effective_rollback_policy("web", Some("media")).unwrap();
  assert_eq!(stack.entity_type, PolicyEntityType::Stack);
  assert!(!stack.auto_rollback_enabled);

  db.upsert_rollback_policy(&RollbackPolicy {
    entity_type: PolicyEntityType::Container,
    entity_id: Some(String::from("web")),
    auto_rollback_enabled: true,
    health_check_required: false,
  })
  .unwrap();
  let container =
    db.effective_rollback_policy("web", Some("media")).unwrap();
  assert_eq!(container.entity_type, PolicyEntityType::Container);
  assert!(!container.health_check_required);
}

#[test]
fn script_assignment_upsert() {
  let db = db();
  db.upsert_script_assignment(&ScriptAssignment {
    container_name: String::from("web"),
    script_path: Some(String::from("/opt/checks/web.sh")),
    enabled: true,
    ignore: false,
    allow_latest: false,
  })
  .unwrap();
  db.upsert_script_assignment(&ScriptAssignment {
    container_name: String::from("web"),
    script_path: Some(String::from("/opt/checks/web.sh")),
    enabled: false,
    ignore: true,
    allow_latest: true,
  })
  .unwrap();
  let loaded = db.script_assignment("web").unwrap().unwrap();
  assert!(!loaded.enabled);
  assert!(loaded.ignore);
  assert!(db.script_assignment("db").unwrap().is_none());
}

#[test]
fn config_snapshot_and_revert() {
  let db = db();
  db.set_config("poll_interval", "300").unwrap();
  db.set_config("theme", "dark").unwrap();
  let snapshot = db.snapshot_config(Some("test")).unwrap();

  db.set_config("poll_interval", "60").unwrap();
  db.set_config("new_key", "x").unwrap();

  db.revert_to_snapshot(snapshot, Some("test")).unwrap();
  let config = db.all_config().unwrap();
  assert_eq!(config.get("poll_interval").unwrap(), "300");
  assert_eq!(config.get("theme").unwrap(), "dark");
  assert!(!config.contains_key("new_key"));

  // The revert itself is recorded as a new snapshot.
  let restored = db.config_snapshot(snapshot + 1).unwrap();
  assert!(restored.is_some());
}

#[test]
fn revert_to_missing_snapshot_is_not_found() {
  let db = db();
  let err = db.revert_to_snapshot(99, None).unwrap_err();
  assert!(matches!(err, DbError::NotFound(_)));
}

#[test]
fn check_history_batch_and_read_back() {
  let db = db();
  let checks = vec![
    ContainerCheck {
      container_name: String::from("web"),
      stack: Some(String::from("media")),
      image: String::from("nginx:1.25.3"),
      current_version: String::from("1.25.3"),
      latest_version: Some(String::from("1.25.4")),
      status: UpdateStatus::UpdateAvailable,
      change_kind: ChangeKind::Patch,
      checked_at: docksmith_timestamp(),
      ..Default::default()
    },
    ContainerCheck {
      container_name: String::from("db"),
      image: String::from("postgres:16.1"),
      current_version: String::from("16.1"),
      status: UpdateStatus::UpToDate,
      change_kind: ChangeKind::NoChange,
      checked_at: docksmith_timestamp(),
      ..Default::default()
    },
  ];
  db.insert_check_batch(&checks).unwrap();
  let recent = db.recent_checks("web", 10).unwrap();
  assert_eq!(recent.len(), 1);
  assert_eq!(recent[0].status, UpdateStatus::UpdateAvailable);
  assert_eq!(recent[0].change_kind, ChangeKind::Patch);
}

#[test]
fn update_log_appends() {
  let db = db();
  db.append_update_log(
    "web",
    LogOperation::Pull,
    Some("1.25.3"),
    Some("1.25.4"),
    true,
    None,
  )
  .unwrap();
  db.append_update_log(
    "web",
    LogOperation::Rollback,
    Some("1.25.4"),
    Some("1.25.3"),
    true,
    Some("unhealthy after update"),
  )
  .unwrap();
}

#[test]
fn mean_recent_duration_feeds_estimates() {
  let db = db();
  for (id, start, end) in
    [("a", 0i64, 10_000i64), ("b", 0, 20_000)]
  {
    let mut record = operation(id);
    record.operation_id = id.to_string();
    db.insert_operation(&record).unwrap();
    db.set_operation_status(id, OperationStatus::Validating)
      .unwrap();
    db.set_operation_status(id, OperationStatus::Complete)
      .unwrap();
    // Pin deterministic timestamps for the math.
    db.with_retry(|conn| {
      conn.execute(
        "UPDATE update_operations SET started_at = ?2, \
         completed_at = ?3 WHERE operation_id = ?1",
        rusqlite::params![id, start, end],
      )?;
      Ok(())
    })
    .unwrap();
  }
  assert_eq!(
    db.mean_recent_duration("media", 10).unwrap(),
    Some(15_000)
  );
  assert_eq!(db.mean_recent_duration("empty", 10).unwrap(), None);
}
