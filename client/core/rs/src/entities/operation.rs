use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::docksmith_timestamp;

/// The kind of mutation an operation performs.
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
pub enum OperationType {
  /// Update one container to a selected tag.
  Single,
  /// Update a set of containers, grouped by stack.
  Batch,
  /// Update every eligible container in one stack.
  Stack,
  Restart,
  Rollback,
  LabelChange,
  /// Cycle a container back to the image its compose file declares.
  FixMismatch,
  Stop,
  Start,
  Remove,
  BatchRestart,
  BatchStop,
  BatchStart,
}

impl OperationType {
  pub fn is_batch(&self) -> bool {
    matches!(
      self,
      OperationType::Batch
        | OperationType::Stack
        | OperationType::BatchRestart
        | OperationType::BatchStop
        | OperationType::BatchStart
    )
  }
}

/// Stage / terminal status of an operation. Forward stages are
/// strictly ordered; the store rejects regressions.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
  #[default]
  Queued,
  Validating,
  Backup,
  UpdatingCompose,
  PullingImage,
  Stopping,
  Starting,
  HealthCheck,
  RestartingDependents,
  Complete,
  /// Batch terminal: some containers completed, some failed.
  Partial,
  RollingBack,
  Failed,
  Cancelled,
  /// Legacy synonym for "some non-terminal stage". Accepted on
  /// parse, never written.
  InProgress,
}

impl OperationStatus {
  /// Position in the forward stage order. Branch / terminal states
  /// have no rank.
  pub fn rank(&self) -> Option<u8> {
    match self {
      OperationStatus::Queued => Some(0),
      OperationStatus::Validating | OperationStatus::InProgress => {
        Some(1)
      }
      OperationStatus::Backup => Some(2),
      OperationStatus::UpdatingCompose => Some(3),
      OperationStatus::PullingImage => Some(4),
      OperationStatus::Stopping => Some(5),
      OperationStatus::Starting => Some(6),
      OperationStatus::HealthCheck => Some(7),
      OperationStatus::RestartingDependents => Some(8),
      OperationStatus::Complete => Some(9),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      OperationStatus::Complete
        | OperationStatus::Partial
        | OperationStatus::Failed
        | OperationStatus::Cancelled
    )
  }

  /// Whether a transition respects the status machine: forward
  /// stages never regress, terminal states never change, and the
  /// branch states (`failed`, `rolling_back`, `cancelled`) are
  /// reachable from any live state.
  pub fn can_transition_to(&self, next: OperationStatus) -> bool {
    if self.is_terminal() {
      return false;
    }
    match (self.rank(), next.rank()) {
      (Some(from), Some(to)) => to >= from,
      // into failed / rolling_back / cancelled / partial
      (Some(_), None) => true,
      // out of rolling_back
      (None, _) => matches!(
        next,
        OperationStatus::Failed
          | OperationStatus::Cancelled
          | OperationStatus::Complete
      ),
    }
  }

  /// Rough completion percentage surfaced on progress events.
  pub fn percent(&self) -> u8 {
    match self.rank() {
      Some(rank) => (rank as u16 * 100 / 9) as u8,
      None => 100,
    }
  }
}

/// Failure classification. Determines retryability.
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
pub enum ErrorKind {
  Transport,
  Timeout,
  Backend,
  Precheck,
  Recovery,
  Validation,
}

impl ErrorKind {
  /// Precheck failures are retryable with `force: true`;
  /// transport / timeout failures are retryable as-is.
  pub fn retryable(&self) -> bool {
    matches!(
      self,
      ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Precheck
    )
  }
}

/// Exit kinds surfaced to a CLI / API for reporting.
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
pub enum ExitKind {
  Ok,
  PrecheckFailed,
  ValidationFailed,
  ConflictQueued,
  EngineError,
  RegistryError,
  StorageError,
  Cancelled,
}

/// Per-container progress inside a batch operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDetail {
  pub container_name: String,
  pub status: OperationStatus,
  pub old_version: Option<String>,
  pub new_version: Option<String>,
  /// Captured before cycling; rollback target.
  pub old_digest: Option<String>,
  pub error: Option<String>,
}

/// Persisted operation record. Identity is immutable, the rest is
/// mutated as the state machine advances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationRecord {
  pub operation_id: String,
  pub container_name: String,
  pub stack_name: Option<String>,
  pub operation_type: Option<OperationType>,
  pub status: OperationStatus,
  pub old_version: Option<String>,
  pub new_version: Option<String>,
  pub started_at: Option<i64>,
  pub completed_at: Option<i64>,
  pub error: Option<String>,
  pub error_kind: Option<ErrorKind>,
  /// Precheck failures set this so an operator may resubmit with
  /// `force: true`.
  pub force_retry: bool,
  pub dependents_affected: Vec<String>,
  /// Dependents whose own precheck failed in non-force mode.
  pub dependents_blocked: Vec<String>,
  pub rollback_occurred: bool,
  pub batch_details: Option<Vec<BatchDetail>>,
  pub batch_group_id: Option<String>,
  pub created_at: i64,
  pub updated_at: i64,
}

impl OperationRecord {
  pub fn new(
    operation_type: OperationType,
    container_name: impl Into<String>,
    stack_name: Option<String>,
  ) -> OperationRecord {
    let now = docksmith_timestamp();
    OperationRecord {
      operation_id: uuid::Uuid::new_v4().to_string(),
      container_name: container_name.into(),
      stack_name,
      operation_type: Some(operation_type),
      status: OperationStatus::Queued,
      created_at: now,
      updated_at: now,
      ..Default::default()
    }
  }
}

/// Persisted queue entry. FIFO within a stack, higher priority
/// jumps ahead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueEntry {
  pub operation_id: String,
  pub stack_name: String,
  pub containers: Vec<String>,
  pub operation_type: Option<OperationType>,
  pub priority: i64,
  pub queued_at: i64,
  pub estimated_start: Option<i64>,
  pub target_versions: HashMap<String, String>,
}

/// Mapping from an operation to the compose backup taken before its
/// first mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeBackup {
  pub operation_id: String,
  pub container_name: String,
  pub stack_name: Option<String>,
  pub compose_file_path: String,
  pub backup_file_path: String,
  pub backup_timestamp: i64,
}

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
pub enum PolicyEntityType {
  Global,
  Container,
  Stack,
}

/// Rollback policy row. Resolution is container > stack > global;
/// a global default row always exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPolicy {
  pub entity_type: PolicyEntityType,
  pub entity_id: Option<String>,
  pub auto_rollback_enabled: bool,
  pub health_check_required: bool,
}

impl Default for RollbackPolicy {
  fn default() -> RollbackPolicy {
    RollbackPolicy {
      entity_type: PolicyEntityType::Global,
      entity_id: None,
      auto_rollback_enabled: true,
      health_check_required: true,
    }
  }
}

/// Database-only per-container overrides, applied on the next
/// discovery pass without touching compose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptAssignment {
  pub container_name: String,
  pub script_path: Option<String>,
  pub enabled: bool,
  pub ignore: bool,
  pub allow_latest: bool,
}

/// An inbound mutation request accepted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationRequest {
  Update {
    container: String,
    /// Explicit target tag; resolved from the registry when absent.
    target_version: Option<String>,
    /// Bypass a failed pre-update check.
    #[serde(default)]
    force: bool,
  },
  Batch {
    containers: Vec<String>,
    #[serde(default)]
    target_versions: HashMap<String, String>,
    #[serde(default)]
    force: bool,
  },
  Stack {
    stack: String,
    #[serde(default)]
    force: bool,
  },
  Restart {
    container: String,
  },
  Rollback {
    operation_id: String,
  },
  LabelChange {
    container: String,
    #[serde(default)]
    set: Vec<(String, String)>,
    #[serde(default)]
    remove: Vec<String>,
  },
  FixMismatch {
    container: String,
  },
  Stop {
    container: String,
  },
  Start {
    container: String,
  },
  Remove {
    container: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    volumes: bool,
  },
}

impl OperationRequest {
  pub fn operation_type(&self) -> OperationType {
    match self {
      OperationRequest::Update { .. } => OperationType::Single,
      OperationRequest::Batch { .. } => OperationType::Batch,
      OperationRequest::Stack { .. } => OperationType::Stack,
      OperationRequest::Restart { .. } => OperationType::Restart,
      OperationRequest::Rollback { .. } => OperationType::Rollback,
      OperationRequest::LabelChange { .. } => {
        OperationType::LabelChange
      }
      OperationRequest::FixMismatch { .. } => {
        OperationType::FixMismatch
      }
      OperationRequest::Stop { .. } => OperationType::Stop,
      OperationRequest::Start { .. } => OperationType::Start,
      OperationRequest::Remove { .. } => OperationType::Remove,
    }
  }

  /// The container the request names, when it names exactly one.
  pub fn container(&self) -> Option<&str> {
    match self {
      OperationRequest::Update { container, .. }
      | OperationRequest::Restart { container }
      | OperationRequest::LabelChange { container, .. }
      | OperationRequest::FixMismatch { container }
      | OperationRequest::Stop { container }
      | OperationRequest::Start { container }
      | OperationRequest::Remove { container, .. } => {
        Some(container)
      }
      _ => None,
    }
  }

  pub fn force(&self) -> bool {
    match self {
      OperationRequest::Update { force, .. }
      | OperationRequest::Batch { force, .. }
      | OperationRequest::Stack { force, .. } => *force,
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn forward_stages_never_regress() {
    use OperationStatus::*;
    assert!(Queued.can_transition_to(Validating));
    assert!(Validating.can_transition_to(Backup));
    assert!(PullingImage.can_transition_to(PullingImage));
    assert!(!PullingImage.can_transition_to(Backup));
    assert!(!Complete.can_transition_to(Failed));
    assert!(!Failed.can_transition_to(Queued));
  }

  #[test]
  fn branch_states_reachable_from_live_stages() {
    use OperationStatus::*;
    assert!(Stopping.can_transition_to(Failed));
    assert!(HealthCheck.can_transition_to(RollingBack));
    assert!(RollingBack.can_transition_to(Failed));
    assert!(RollingBack.can_transition_to(Complete));
    assert!(!RollingBack.can_transition_to(Stopping));
  }

  #[test]
  fn in_progress_is_legacy_non_terminal() {
    let parsed: OperationStatus = "in_progress".parse().unwrap();
    assert_eq!(parsed, OperationStatus::InProgress);
    assert!(!parsed.is_terminal());
    assert!(
      parsed.can_transition_to(OperationStatus::PullingImage)
    );
  }

  #[test]
  fn status_round_trips_through_strings() {
    let status = OperationStatus::RestartingDependents;
    let text = status.to_string();
    assert_eq!(text, "restarting_dependents");
    assert_eq!(text.parse::<OperationStatus>().unwrap(), status);
  }
}
