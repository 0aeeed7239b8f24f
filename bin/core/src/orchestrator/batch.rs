//! Batch / stack operations: one stack-group advanced in update
//! order under a single stack lock, with per-container progress in
//! `batch_details`.

use std::{collections::HashMap, sync::Arc};

use docksmith_client::entities::operation::{
  BatchDetail, ErrorKind, OperationRecord, OperationStatus,
};
use tokio_util::sync::CancellationToken;

use super::{OpError, OpResult, Orchestrator, run::Report};

impl Orchestrator {
  pub(crate) async fn run_batch(
    self: &Arc<Self>,
    record: &OperationRecord,
    containers: Vec<String>,
    target_versions: HashMap<String, String>,
    force: bool,
    token: &CancellationToken,
  ) -> OpResult<()> {
    if self.already_terminal(record)? {
      return Ok(());
    }
    let operation_id = record.operation_id.as_str();
    self.advance(
      operation_id,
      None,
      OperationStatus::Validating,
      "ordering batch by dependencies",
    )?;

    // Dependencies first within the stack group.
    let order = match &record.stack_name {
      Some(stack) => {
        let peers = self.stack_containers(stack).await?;
        let graph =
          depgraph::DependencyGraph::from_containers(&peers);
        graph
          .update_order()
          .map_err(|e| OpError::validation(e.to_string()))?
          .into_iter()
          .filter(|name| containers.contains(name))
          .collect::<Vec<_>>()
      }
      None => containers.clone(),
    };
    if order.len() != containers.len() {
      return Err(OpError::validation(format!(
        "batch names containers outside stack {:?}",
        record.stack_name
      )));
    }

    let mut details: Vec<BatchDetail> = order
      .iter()
      .map(|name| BatchDetail {
        container_name: name.clone(),
        status: OperationStatus::Queued,
        ..Default::default()
      })
      .collect();
    self.deps.db.set_batch_details(operation_id, &details)?;

    let mut backed_up = HashMap::new();
    let mut affected = Vec::new();
    let mut blocked = Vec::new();
    let mut completed = 0usize;
    let mut failed = 0usize;

    for index in 0..order.len() {
      let name = order[index].clone();
      if token.is_cancelled() {
        for detail in details.iter_mut().skip(index) {
          detail.status = OperationStatus::Cancelled;
        }
        self
          .deps
          .db
          .set_batch_details(operation_id, &details)?;
        return Err(OpError::Cancelled);
      }
      let result = {
        let mut report = Report::Batch {
          details: &mut details,
          index,
        };
        self
          .update_container(
            operation_id,
            &name,
            force,
            target_versions.get(&name).cloned(),
            &order,
            &mut backed_up,
            &mut report,
            token,
          )
          .await
      };
      match result {
        Ok(outcome) => {
          details[index].status = OperationStatus::Complete;
          completed += 1;
          affected.extend(outcome.dependents_affected);
          blocked.extend(outcome.dependents_blocked);
        }
        Err(OpError::Cancelled) => {
          for detail in details.iter_mut().skip(index) {
            detail.status = OperationStatus::Cancelled;
          }
          self
            .deps
            .db
            .set_batch_details(operation_id, &details)?;
          return Err(OpError::Cancelled);
        }
        Err(OpError::Failed { message, .. }) => {
          // Per-container rollback already ran inside the update
          // path; the batch advances to the next container.
          details[index].status = OperationStatus::Failed;
          details[index].error = Some(message.clone());
          failed += 1;
          warn!(
            container = %name,
            operation_id, "batch item failed | {message}"
          );
        }
      }
      self.deps.db.set_batch_details(operation_id, &details)?;
    }

    affected.sort();
    affected.dedup();
    blocked.sort();
    blocked.dedup();
    self.deps.db.set_operation_dependents(
      operation_id,
      &affected,
      &blocked,
    )?;

    let total = order.len();
    if failed == total {
      self.deps.db.fail_operation(
        operation_id,
        "every container in the batch failed",
        ErrorKind::Backend,
        false,
      )?;
      self.deps.bus.publish(
        docksmith_client::entities::event::Event::new(
          docksmith_client::entities::event::topics::OPERATION_FAILED,
        )
        .with("operation_id", operation_id)
        .with("error", "every container in the batch failed"),
      );
      return Ok(());
    }
    let final_status = if completed == total {
      OperationStatus::Complete
    } else {
      OperationStatus::Partial
    };
    self.advance(
      operation_id,
      None,
      final_status,
      "batch finished",
    )?;
    self.publish_terminal(operation_id, None, false, false);
    Ok(())
  }
}
