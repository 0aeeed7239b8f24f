//! Rollback: revert compose to the captured backup and cycle the
//! container back to the pre-operation image.

use std::{path::Path, sync::Arc};

use database::LogOperation;
use docksmith_client::entities::{
  ImageRef,
  operation::{OperationRecord, OperationStatus},
};
use tokio_util::sync::CancellationToken;

use super::{
  OpError, OpResult, Orchestrator,
  run::{EditUndo, restore_file},
};

impl Orchestrator {
  /// Automatic rollback after a failed cycle: revert the
  /// declarative edit byte-for-byte, make sure the old image is
  /// present, cycle the container back, and record the reversion.
  pub(crate) async fn rollback_cycled(
    &self,
    operation_id: &str,
    container_name: &str,
    old_image: &ImageRef,
    undo: &EditUndo,
    compose_path: &Path,
  ) -> anyhow::Result<()> {
    self.publish_stage(
      operation_id,
      Some(container_name),
      OperationStatus::RollingBack,
      "rolling back to previous version",
    );
    if let Err(e) = self
      .deps
      .db
      .set_operation_status(operation_id, OperationStatus::RollingBack)
    {
      warn!(%operation_id, "rolling_back transition | {e}");
    }

    self.apply_undo(undo, compose_path);

    let old_ref = old_image.to_string();
    if self.deps.engine.inspect_image(&old_ref).await.is_err() {
      self.deps.engine.pull(&old_ref).await?;
    }
    self.deps.engine.stop(container_name, None).await?;
    self.deps.engine.start(container_name).await?;

    self.deps.db.set_rollback_occurred(operation_id)?;
    let _ = self.deps.db.append_update_log(
      container_name,
      LogOperation::Rollback,
      None,
      Some(&old_image.tag),
      true,
      Some("automatic rollback after failed update"),
    );
    info!(container_name, "rolled back to {old_ref}");
    Ok(())
  }

  /// An explicit rollback operation against a previously completed
  /// operation: compose backup restored, old version repulled, the
  /// container cycled back.
  pub(crate) async fn run_rollback_operation(
    self: &Arc<Self>,
    record: &OperationRecord,
    target_operation: &str,
    token: &CancellationToken,
  ) -> OpResult<()> {
    if self.already_terminal(record)? {
      return Ok(());
    }
    let operation_id = record.operation_id.as_str();
    let name = record.container_name.as_str();
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Validating,
      "validating rollback target",
    )?;
    let target = self
      .deps
      .db
      .get_operation(target_operation)?
      .ok_or_else(|| {
        OpError::validation(format!(
          "operation {target_operation} not found"
        ))
      })?;
    let old_version =
      target.old_version.clone().ok_or_else(|| {
        OpError::validation(format!(
          "operation {target_operation} captured no old version"
        ))
      })?;
    let container = self.resolve_container(name).await?;
    let backup = self
      .deps
      .db
      .compose_backup_for(target_operation, name)?;
    self.deps.db.set_operation_versions(
      operation_id,
      target.new_version.as_deref(),
      Some(&old_version),
    )?;
    let policy = self
      .deps
      .db
      .effective_rollback_policy(name, container.stack.as_deref())?;
    self.check_cancelled(token)?;

    self.advance(
      operation_id,
      Some(name),
      OperationStatus::UpdatingCompose,
      "restoring compose backup",
    )?;
    if let Some(backup) = &backup {
      restore_file(
        Path::new(&backup.backup_file_path),
        Path::new(&backup.compose_file_path),
      );
    }

    self.advance(
      operation_id,
      Some(name),
      OperationStatus::PullingImage,
      "pulling previous image",
    )?;
    let old_ref =
      ImageRef::parse(&container.image).with_tag(&old_version);
    self
      .stage_call(
        "engine pull",
        self.deps.engine.pull(&old_ref.to_string()),
      )
      .await?;

    let mut report = super::run::Report::Op;
    self
      .cycle_container(
        operation_id,
        name,
        &policy,
        &mut report,
        token,
      )
      .await?;

    self.deps.db.set_rollback_occurred(target_operation)?;
    let _ = self.deps.db.append_update_log(
      name,
      LogOperation::Rollback,
      target.new_version.as_deref(),
      Some(&old_version),
      true,
      Some("operator requested rollback"),
    );
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Complete,
      "rollback complete",
    )?;
    self.publish_terminal(operation_id, Some(name), false, true);
    Ok(())
  }
}
