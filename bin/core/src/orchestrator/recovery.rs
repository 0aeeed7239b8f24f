//! Startup recovery: reconcile every non-terminal operation row
//! against the engine's view of the world, then resume queued
//! work.

use std::{collections::HashSet, sync::Arc};

use docksmith_client::entities::{
  ImageRef,
  container::{ContainerInfo, ContainerState},
  operation::{ErrorKind, OperationRecord, OperationStatus, OperationType},
};

use super::Orchestrator;

impl Orchestrator {
  /// Run once at startup, before the checker and queue begin.
  pub async fn recover_on_startup(self: &Arc<Self>) {
    let records = match self.deps.db.non_terminal_operations() {
      Ok(records) => records,
      Err(e) => {
        error!("recovery: failed to read operations | {e}");
        return;
      }
    };
    for record in records {
      if record.status == OperationStatus::Queued {
        // Still queued; the queue drain below picks it up.
        continue;
      }
      let reached_target =
        self.reached_target_state(&record).await;
      let result = if reached_target {
        info!(
          operation_id = %record.operation_id,
          "recovery: container in expected state, closing complete"
        );
        self.deps.db.set_operation_status(
          &record.operation_id,
          OperationStatus::Complete,
        )
      } else {
        self
          .deps
          .db
          .fail_operation(
            &record.operation_id,
            "process restarted mid-operation and the container \
             is not in the expected state",
            ErrorKind::Recovery,
            false,
          )
          .map(|_| ())
      };
      if let Err(e) = result {
        error!(
          operation_id = %record.operation_id,
          "recovery: failed to close operation | {e}"
        );
      }
    }

    // Queued rows were persisted; resume each stack in original
    // priority / order.
    let stacks: HashSet<String> = match self.deps.db.queued_entries()
    {
      Ok(entries) => entries
        .into_iter()
        .map(|entry| entry.stack_name)
        .collect(),
      Err(e) => {
        error!("recovery: failed to read queue | {e}");
        return;
      }
    };
    for stack in stacks {
      self.drain_stack(stack).await;
    }
  }

  /// Whether the engine already reports the operation's intended
  /// end state.
  async fn reached_target_state(
    &self,
    record: &OperationRecord,
  ) -> bool {
    let container = self
      .deps
      .engine
      .get_by_name(&record.container_name)
      .await;
    match record.operation_type {
      Some(OperationType::Remove) => container.is_err(),
      Some(OperationType::Stop) => matches!(
        container,
        Ok(ContainerInfo {
          state: ContainerState::Exited,
          ..
        })
      ),
      Some(OperationType::Single)
      | Some(OperationType::Batch)
      | Some(OperationType::Stack) => match container {
        Ok(container)
          if container.state == ContainerState::Running =>
        {
          match &record.new_version {
            Some(new_version) => {
              ImageRef::parse(&container.image).tag == *new_version
            }
            None => false,
          }
        }
        _ => false,
      },
      _ => matches!(
        container,
        Ok(ContainerInfo {
          state: ContainerState::Running,
          ..
        })
      ),
    }
  }
}
