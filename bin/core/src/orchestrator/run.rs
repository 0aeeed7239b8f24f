//! The staged state machine for single-container operations.

use std::{
  collections::HashMap,
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

use compose_edit::TagEdit;
use database::LogOperation;
use docksmith_client::entities::{
  ImageRef,
  container::{ContainerHealth, ContainerInfo, ContainerState},
  docksmith_labels, docksmith_timestamp,
  event::{Event, topics},
  operation::{
    BatchDetail, ComposeBackup, ErrorKind, OperationRecord,
    OperationStatus, RollbackPolicy,
  },
};
use environment::EnvFile;
use tokio_util::sync::CancellationToken;
use versioning::{PinLevel, SelectionPolicy};

use super::{OpError, OpResult, Orchestrator, stack_key};
use crate::{
  precheck::{self, PrecheckError},
  stackfile,
};

/// Where stage transitions are recorded: the operation row itself,
/// or one entry of a batch's details.
pub(crate) enum Report<'a> {
  Op,
  Batch {
    details: &'a mut Vec<BatchDetail>,
    index: usize,
  },
}

/// What a completed container update leaves behind.
#[derive(Debug, Default)]
pub(crate) struct UpdateOutcome {
  pub old_version: Option<String>,
  pub new_version: Option<String>,
  pub dependents_affected: Vec<String>,
  pub dependents_blocked: Vec<String>,
}

/// How to revert the declarative edit this operation made. Scoped
/// to the single edit so reverting one container of a batch never
/// clobbers the edits of the others.
#[derive(Debug, Clone)]
pub(crate) enum EditUndo {
  /// File bytes as they were immediately before this edit.
  Compose { previous: String },
  /// The `.env` value as it was immediately before this edit.
  Env { var: String, previous: String },
}

impl Orchestrator {
  pub(crate) fn report(
    &self,
    report: &mut Report<'_>,
    operation_id: &str,
    container_name: &str,
    status: OperationStatus,
    message: &str,
  ) -> OpResult<()> {
    match report {
      Report::Op => self.advance(
        operation_id,
        Some(container_name),
        status,
        message,
      )?,
      Report::Batch { details, index } => {
        details[*index].status = status;
        self.deps.db.set_batch_details(operation_id, details)?;
        self.publish_stage(
          operation_id,
          Some(container_name),
          status,
          message,
        );
      }
    }
    self.deps.bus.publish(
      Event::new(topics::UPDATE_PROGRESS)
        .with("operation_id", operation_id)
        .with("container_name", container_name)
        .with("percent", status.percent()),
    );
    Ok(())
  }

  fn record_versions(
    &self,
    report: &mut Report<'_>,
    operation_id: &str,
    old_version: &str,
    new_version: &str,
    old_digest: Option<String>,
  ) -> OpResult<()> {
    match report {
      Report::Op => Ok(self.deps.db.set_operation_versions(
        operation_id,
        Some(old_version),
        Some(new_version),
      )?),
      Report::Batch { details, index } => {
        details[*index].old_version = Some(old_version.into());
        details[*index].new_version = Some(new_version.into());
        details[*index].old_digest = old_digest;
        Ok(
          self
            .deps
            .db
            .set_batch_details(operation_id, details)?,
        )
      }
    }
  }

  /// The full single-container update path, shared between
  /// single operations and batch items.
  #[allow(clippy::too_many_arguments)]
  pub(crate) async fn update_container(
    &self,
    operation_id: &str,
    container_name: &str,
    force: bool,
    target_version: Option<String>,
    skip_dependents: &[String],
    backed_up: &mut HashMap<PathBuf, PathBuf>,
    report: &mut Report<'_>,
    token: &CancellationToken,
  ) -> OpResult<UpdateOutcome> {
    // validating
    self.check_cancelled(token)?;
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::Validating,
      "validating request",
    )?;
    let container = self.resolve_container(container_name).await?;
    let mut editor = stackfile::bind_editor(
      &container,
      &self.translator,
    )
    .map_err(|e| OpError::validation(format!("{e:#}")))?;
    let script = self.resolve_precheck(&container)?;
    let current = ImageRef::parse(&container.image);
    let parsed_current = versioning::parse(&current.tag);
    let old_digest = self
      .deps
      .engine
      .image_digest(&container.image)
      .await
      .ok()
      .flatten();
    let new_tag = match target_version {
      Some(tag) => tag,
      None => {
        self.select_target(&container, &current, &parsed_current).await?
      }
    };
    let change = versioning::change_kind(
      &parsed_current,
      &versioning::parse(&new_tag),
    );
    self.record_versions(
      report,
      operation_id,
      &current.tag,
      &new_tag,
      old_digest.clone(),
    )?;
    debug!(
      container_name,
      from = %current.tag,
      to = %new_tag,
      change = %change,
      "update target selected"
    );
    let policy = self.deps.db.effective_rollback_policy(
      container_name,
      container.stack.as_deref(),
    )?;

    // backup
    self.check_cancelled(token)?;
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::Backup,
      "backing up compose file",
    )?;
    let compose_path = editor.path().to_path_buf();
    self.take_backup(operation_id, &container, &editor, backed_up)?;

    // updating_compose
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::UpdatingCompose,
      "rewriting image tag",
    )?;
    let pre_edit = editor.contents();
    let undo = match editor
      .set_image_tag(&new_tag)
      .map_err(|e| OpError::validation(format!("{e:#}")))?
    {
      TagEdit::Edited => {
        editor.save().map_err(|e| {
          OpError::failed(
            ErrorKind::Backend,
            format!("compose save: {e:#}"),
          )
        })?;
        EditUndo::Compose { previous: pre_edit }
      }
      TagEdit::NeedsEnvFile { var } => {
        let previous =
          self.rewrite_env_tag(&compose_path, &var, &new_tag)?;
        EditUndo::Env { var, previous }
      }
    };

    // pulling_image
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::PullingImage,
      "pulling target image",
    )?;
    let new_ref = current.with_tag(&new_tag);
    if let Err(e) = self
      .stage_call(
        "engine pull",
        self.deps.engine.pull(&new_ref.to_string()),
      )
      .await
    {
      // Nothing has been cycled yet; only the declarative edit
      // needs reverting.
      self.apply_undo(&undo, &compose_path);
      let _ = self.deps.db.append_update_log(
        container_name,
        LogOperation::Pull,
        Some(&current.tag),
        Some(&new_tag),
        false,
        None,
      );
      return Err(e);
    }
    let _ = self.deps.db.append_update_log(
      container_name,
      LogOperation::Pull,
      Some(&current.tag),
      Some(&new_tag),
      true,
      None,
    );

    // pre-update check gate
    if let Some(script) = &script
      && !force
    {
      self.report(
        report,
        operation_id,
        container_name,
        OperationStatus::HealthCheck,
        "running pre-update check",
      )?;
      self.run_gate(script, container_name).await?;
    }

    // stopping / starting / post-update health
    if let Err(e) = self
      .cycle_container(
        operation_id,
        container_name,
        &policy,
        report,
        token,
      )
      .await
    {
      if matches!(e, OpError::Cancelled) {
        return Err(e);
      }
      if policy.auto_rollback_enabled {
        match self
          .rollback_cycled(
            operation_id,
            container_name,
            &current,
            &undo,
            &compose_path,
          )
          .await
        {
          Ok(()) => return Err(e.with_rollback()),
          Err(rollback_err) => {
            error!(
              container_name,
              "rollback failed | {rollback_err:?}"
            );
            return Err(e);
          }
        }
      }
      return Err(e);
    }

    // restarting_dependents
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::RestartingDependents,
      "restarting dependent containers",
    )?;
    let (dependents_affected, dependents_blocked) = self
      .restart_dependents(&container, skip_dependents, force, token)
      .await?;

    self.deps.bus.publish(
      Event::new(topics::CONTAINER_UPDATED)
        .with("container_name", container_name)
        .with("from_version", current.tag.clone())
        .with("to_version", new_tag.clone())
        .with("change_kind", change.to_string()),
    );

    Ok(UpdateOutcome {
      old_version: Some(current.tag),
      new_version: Some(new_tag),
      dependents_affected,
      dependents_blocked,
    })
  }

  pub(crate) async fn run_update(
    self: &Arc<Self>,
    record: &OperationRecord,
    force: bool,
    target_version: Option<String>,
    token: &CancellationToken,
  ) -> OpResult<()> {
    if self.already_terminal(record)? {
      return Ok(());
    }
    let mut backed_up = HashMap::new();
    let mut report = Report::Op;
    let outcome = self
      .update_container(
        &record.operation_id,
        &record.container_name,
        force,
        target_version,
        &[],
        &mut backed_up,
        &mut report,
        token,
      )
      .await?;
    self.deps.db.set_operation_dependents(
      &record.operation_id,
      &outcome.dependents_affected,
      &outcome.dependents_blocked,
    )?;
    self.advance(
      &record.operation_id,
      Some(&record.container_name),
      OperationStatus::Complete,
      "update complete",
    )?;
    self.publish_terminal(
      &record.operation_id,
      Some(&record.container_name),
      false,
      false,
    );
    Ok(())
  }

  /// Fix-mismatch: the compose file is authoritative; cycle the
  /// container to what it declares. No tag selection, no compose
  /// edit, no backup.
  pub(crate) async fn run_fix_mismatch(
    self: &Arc<Self>,
    record: &OperationRecord,
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
      "reading compose declaration",
    )?;
    let container = self.resolve_container(name).await?;
    let editor = stackfile::bind_editor(
      &container,
      &self.translator,
    )
    .map_err(|e| OpError::validation(format!("{e:#}")))?;
    let declared =
      stackfile::declared_image(&editor).ok_or_else(|| {
        OpError::validation(format!(
          "service for {name} declares no image"
        ))
      })?;
    if declared == container.image {
      self.advance(
        operation_id,
        Some(name),
        OperationStatus::Complete,
        "running image already matches compose",
      )?;
      self.publish_terminal(operation_id, Some(name), false, false);
      return Ok(());
    }
    let declared_ref = ImageRef::parse(&declared);
    let running_ref = ImageRef::parse(&container.image);
    self.deps.db.set_operation_versions(
      operation_id,
      Some(&running_ref.tag),
      Some(&declared_ref.tag),
    )?;
    let policy = self
      .deps
      .db
      .effective_rollback_policy(name, container.stack.as_deref())?;

    self.advance(
      operation_id,
      Some(name),
      OperationStatus::PullingImage,
      "pulling declared image",
    )?;
    self
      .stage_call("engine pull", self.deps.engine.pull(&declared))
      .await?;

    let mut report = Report::Op;
    self
      .cycle_container(
        operation_id,
        name,
        &policy,
        &mut report,
        token,
      )
      .await?;
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Complete,
      "container matches compose declaration",
    )?;
    self.publish_terminal(operation_id, Some(name), false, false);
    Ok(())
  }

  pub(crate) async fn run_restart(
    self: &Arc<Self>,
    record: &OperationRecord,
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
      "validating request",
    )?;
    let container = self.resolve_container(name).await?;
    self.check_cancelled(token)?;
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Stopping,
      "restarting container",
    )?;
    self
      .stage_call(
        "engine restart",
        self.deps.engine.restart(name, None),
      )
      .await?;
    let _ = self.deps.db.append_update_log(
      name,
      LogOperation::Restart,
      None,
      None,
      true,
      None,
    );
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::RestartingDependents,
      "restarting dependent containers",
    )?;
    let (affected, blocked) = self
      .restart_dependents(&container, &[], false, token)
      .await?;
    self.deps.db.set_operation_dependents(
      operation_id,
      &affected,
      &blocked,
    )?;
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Complete,
      "restart complete",
    )?;
    self.publish_terminal(operation_id, Some(name), false, false);
    Ok(())
  }

  pub(crate) async fn run_stop(
    self: &Arc<Self>,
    record: &OperationRecord,
    token: &CancellationToken,
  ) -> OpResult<()> {
    self
      .run_engine_only(record, token, OperationStatus::Stopping, |name| {
        format!("docker stop {name}")
      })
      .await
  }

  pub(crate) async fn run_start(
    self: &Arc<Self>,
    record: &OperationRecord,
    token: &CancellationToken,
  ) -> OpResult<()> {
    self
      .run_engine_only(record, token, OperationStatus::Starting, |name| {
        format!("docker start {name}")
      })
      .await
  }

  async fn run_engine_only(
    self: &Arc<Self>,
    record: &OperationRecord,
    token: &CancellationToken,
    stage: OperationStatus,
    describe: impl Fn(&str) -> String,
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
      "validating request",
    )?;
    self.resolve_container(name).await?;
    self.check_cancelled(token)?;
    self.advance(
      operation_id,
      Some(name),
      stage,
      &describe(name),
    )?;
    match stage {
      OperationStatus::Stopping => {
        self
          .stage_call(
            "engine stop",
            self.deps.engine.stop(name, None),
          )
          .await?;
      }
      _ => {
        self
          .stage_call("engine start", self.deps.engine.start(name))
          .await?;
      }
    }
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Complete,
      "done",
    )?;
    self.publish_terminal(operation_id, Some(name), false, false);
    Ok(())
  }

  pub(crate) async fn run_remove(
    self: &Arc<Self>,
    record: &OperationRecord,
    force: bool,
    volumes: bool,
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
      "validating request",
    )?;
    let container = self.resolve_container(name).await?;
    self.check_cancelled(token)?;
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Stopping,
      "stopping and removing container",
    )?;
    if container.state == ContainerState::Running && !force {
      self
        .stage_call(
          "engine stop",
          self.deps.engine.stop(name, None),
        )
        .await?;
    }
    self
      .stage_call(
        "engine remove",
        self.deps.engine.remove(name, force, volumes),
      )
      .await?;
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Complete,
      "container removed",
    )?;
    self.publish_terminal(operation_id, Some(name), false, false);
    Ok(())
  }

  pub(crate) async fn run_label_change(
    self: &Arc<Self>,
    record: &OperationRecord,
    set: Vec<(String, String)>,
    remove: Vec<String>,
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
      "validating request",
    )?;
    let container = self.resolve_container(name).await?;
    let mut editor = stackfile::bind_editor(
      &container,
      &self.translator,
    )
    .map_err(|e| OpError::validation(format!("{e:#}")))?;
    self.check_cancelled(token)?;

    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Backup,
      "backing up compose file",
    )?;
    let mut backed_up = HashMap::new();
    self.take_backup(
      operation_id,
      &container,
      &editor,
      &mut backed_up,
    )?;

    self.advance(
      operation_id,
      Some(name),
      OperationStatus::UpdatingCompose,
      "applying label changes",
    )?;
    for (key, value) in &set {
      editor.set_label(key, value).map_err(|e| {
        OpError::validation(format!("set label {key}: {e:#}"))
      })?;
    }
    for key in &remove {
      editor.remove_label(key).map_err(|e| {
        OpError::validation(format!("remove label {key}: {e:#}"))
      })?;
    }
    editor.save().map_err(|e| {
      OpError::failed(
        ErrorKind::Backend,
        format!("compose save: {e:#}"),
      )
    })?;
    self.advance(
      operation_id,
      Some(name),
      OperationStatus::Complete,
      "labels updated",
    )?;
    self.publish_terminal(operation_id, Some(name), false, false);
    Ok(())
  }

  // ---- shared stage helpers ----

  /// Re-running a terminal operation is a no-op.
  pub(crate) fn already_terminal(
    &self,
    record: &OperationRecord,
  ) -> OpResult<bool> {
    let current = self
      .deps
      .db
      .get_operation(&record.operation_id)?
      .unwrap_or_else(|| record.clone());
    Ok(current.status.is_terminal())
  }

  /// Take (or reuse, within a batch) the compose backup for the
  /// file behind `editor`, recording the mapping.
  pub(crate) fn take_backup(
    &self,
    operation_id: &str,
    container: &ContainerInfo,
    editor: &compose_edit::ServiceEditor,
    backed_up: &mut HashMap<PathBuf, PathBuf>,
  ) -> OpResult<PathBuf> {
    let compose_path = editor.path().to_path_buf();
    let timestamp = docksmith_timestamp();
    let backup_path = match backed_up.get(&compose_path) {
      Some(existing) => existing.clone(),
      None => {
        let path = editor.backup(timestamp).map_err(|e| {
          OpError::failed(
            ErrorKind::Backend,
            format!("compose backup: {e:#}"),
          )
        })?;
        backed_up.insert(compose_path.clone(), path.clone());
        path
      }
    };
    self.deps.db.insert_compose_backup(&ComposeBackup {
      operation_id: operation_id.to_string(),
      container_name: container.name.clone(),
      stack_name: container.stack.clone(),
      compose_file_path: compose_path.to_string_lossy().into_owned(),
      backup_file_path: backup_path.to_string_lossy().into_owned(),
      backup_timestamp: timestamp,
    })?;
    Ok(backup_path)
  }

  /// Rewrite the tag stored in the adjacent `.env` when the image
  /// value is a plain `${VAR}` reference. Returns the previous
  /// value for undo.
  fn rewrite_env_tag(
    &self,
    compose_path: &std::path::Path,
    var: &str,
    new_tag: &str,
  ) -> OpResult<String> {
    let env_path = stackfile::adjacent_env_file(compose_path);
    let mut env_file = EnvFile::load(&env_path).map_err(|e| {
      OpError::validation(format!(
        "image tag lives in ${{{var}}} but {env_path:?} is unreadable: {e:#}"
      ))
    })?;
    let current = env_file.get(var).ok_or_else(|| {
      OpError::validation(format!(
        "{env_path:?} does not assign {var}"
      ))
    })?;
    let rewritten =
      environment::rewrite_image_tag(&current, new_tag);
    env_file.set(var, &rewritten);
    env_file.save().map_err(|e| {
      OpError::failed(
        ErrorKind::Backend,
        format!("env save: {e:#}"),
      )
    })?;
    Ok(current)
  }

  /// Revert the declarative edit of one container.
  pub(crate) fn apply_undo(
    &self,
    undo: &EditUndo,
    compose_path: &std::path::Path,
  ) {
    match undo {
      EditUndo::Compose { previous } => {
        if let Err(e) = std::fs::write(compose_path, previous) {
          error!(
            "failed to revert compose edit at {compose_path:?} | {e}"
          );
        }
      }
      EditUndo::Env { var, previous } => {
        let env_path = stackfile::adjacent_env_file(compose_path);
        match EnvFile::load(&env_path) {
          Ok(mut env_file) => {
            env_file.set(var, previous);
            if let Err(e) = env_file.save() {
              error!(
                "failed to revert {var} in {env_path:?} | {e}"
              );
            }
          }
          Err(e) => error!(
            "failed to revert {var} in {env_path:?} | {e:#}"
          ),
        }
      }
    }
  }

  /// Resolve the pre-update check: the assignment store wins over
  /// the label. The path is validated here so bad configuration
  /// fails in `validating`.
  pub(crate) fn resolve_precheck(
    &self,
    container: &ContainerInfo,
  ) -> OpResult<Option<String>> {
    let assigned =
      self.deps.db.script_assignment(&container.name)?;
    let script = match assigned {
      Some(assignment) if !assignment.enabled => None,
      Some(assignment) if assignment.script_path.is_some() => {
        assignment.script_path
      }
      _ => container.pre_update_check().cloned(),
    };
    if let Some(script) = &script {
      precheck::validate_path(script)
        .map_err(|e| OpError::validation(e.to_string()))?;
    }
    Ok(script)
  }

  /// Run the pre-update gate, classifying failures by kind.
  async fn run_gate(
    &self,
    script: &str,
    container_name: &str,
  ) -> OpResult<()> {
    let timeout = Duration::from_secs(
      self.deps.config.precheck_timeout_secs,
    );
    match precheck::run_precheck(script, container_name, timeout)
      .await
    {
      Ok(_) => Ok(()),
      Err(PrecheckError::Timeout) => Err(OpError::failed(
        ErrorKind::Timeout,
        format!("pre-update check {script} timed out"),
      )),
      Err(PrecheckError::Invalid(reason)) => {
        Err(OpError::validation(reason))
      }
      Err(PrecheckError::Failed {
        code,
        stdout,
        stderr,
      }) => Err(OpError::failed(
        ErrorKind::Precheck,
        format!(
          "pre-update check exited {code}; stdout: {}; stderr: {}",
          stdout.trim(),
          stderr.trim()
        ),
      )),
      Err(PrecheckError::Spawn(reason)) => Err(OpError::failed(
        ErrorKind::Precheck,
        format!("pre-update check failed to start: {reason}"),
      )),
    }
  }

  /// stopping -> starting -> post-update health check.
  pub(crate) async fn cycle_container(
    &self,
    operation_id: &str,
    container_name: &str,
    policy: &RollbackPolicy,
    report: &mut Report<'_>,
    token: &CancellationToken,
  ) -> OpResult<()> {
    // Safe checkpoint: cancellation cannot interrupt a stop in
    // progress, but it can prevent one from starting.
    self.check_cancelled(token)?;
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::Stopping,
      "stopping container",
    )?;
    self
      .stage_call(
        "engine stop",
        self.deps.engine.stop(container_name, None),
      )
      .await?;
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::Starting,
      "starting container",
    )?;
    self
      .stage_call(
        "engine start",
        self.deps.engine.start(container_name),
      )
      .await?;
    self.report(
      report,
      operation_id,
      container_name,
      OperationStatus::HealthCheck,
      "post-update health check",
    )?;
    if policy.health_check_required {
      let healthy = self.wait_healthy(container_name).await?;
      if !healthy {
        return Err(OpError::failed(
          ErrorKind::Backend,
          format!(
            "container {container_name} unhealthy after update"
          ),
        ));
      }
    }
    self.check_cancelled(token)?;
    Ok(())
  }

  /// Poll engine health up to the configured deadline with
  /// exponential check intervals.
  async fn wait_healthy(
    &self,
    container_name: &str,
  ) -> OpResult<bool> {
    let deadline = Duration::from_secs(
      self.deps.config.health_check_timeout_secs,
    );
    let started = Instant::now();
    let mut interval = Duration::from_secs(1);
    loop {
      let container = self
        .deps
        .engine
        .get_by_name(container_name)
        .await
        .map_err(|e| {
          OpError::transport(format!("engine inspect: {e:#}"))
        })?;
      match container.health {
        ContainerHealth::Healthy => return Ok(true),
        ContainerHealth::Unhealthy => return Ok(false),
        ContainerHealth::None
          if container.state == ContainerState::Running =>
        {
          return Ok(true);
        }
        _ => {}
      }
      if started.elapsed() >= deadline {
        return Ok(false);
      }
      tokio::time::sleep(interval).await;
      interval = (interval * 2).min(Duration::from_secs(8));
    }
  }

  /// Restart everything that (transitively) depends on
  /// `container`, in restart order. A dependent whose own
  /// pre-update check fails is skipped and surfaced as blocked
  /// unless the caller forced.
  pub(crate) async fn restart_dependents(
    &self,
    container: &ContainerInfo,
    skip: &[String],
    force: bool,
    token: &CancellationToken,
  ) -> OpResult<(Vec<String>, Vec<String>)> {
    let stack = stack_key(container);
    let peers = if container.stack.is_some() {
      self.stack_containers(&stack).await?
    } else {
      vec![container.clone()]
    };
    let graph = depgraph::DependencyGraph::from_containers(&peers);
    let mut members: Vec<String> = Vec::new();
    let mut frontier = vec![container.name.clone()];
    while let Some(next) = frontier.pop() {
      for dependent in graph.dependents(&next) {
        if !members.contains(&dependent) {
          members.push(dependent.clone());
          frontier.push(dependent);
        }
      }
    }
    let order = graph
      .restart_order()
      .map_err(|e| OpError::validation(e.to_string()))?;
    let mut affected = Vec::new();
    let mut blocked = Vec::new();
    for name in order {
      if name == container.name
        || !members.contains(&name)
        || skip.contains(&name)
      {
        continue;
      }
      self.check_cancelled(token)?;
      let Some(dependent) =
        peers.iter().find(|peer| peer.name == name)
      else {
        continue;
      };
      if !force {
        if let Some(script) = self.resolve_precheck(dependent)? {
          let timeout = Duration::from_secs(
            self.deps.config.precheck_timeout_secs,
          );
          if let Err(e) =
            precheck::run_precheck(&script, &name, timeout).await
          {
            warn!(
              dependent = %name,
              "pre-update check blocked dependent restart | {e}"
            );
            blocked.push(name);
            continue;
          }
        }
      }
      match self
        .stage_call(
          "engine restart",
          self.deps.engine.restart(&name, None),
        )
        .await
      {
        Ok(()) => {
          let _ = self.deps.db.append_update_log(
            &name,
            LogOperation::Restart,
            None,
            None,
            true,
            None,
          );
          affected.push(name);
        }
        Err(e) => {
          warn!(
            dependent = %name,
            "failed to restart dependent | {e:?}"
          );
          blocked.push(name);
        }
      }
    }
    Ok((affected, blocked))
  }

  async fn select_target(
    &self,
    container: &ContainerInfo,
    current: &ImageRef,
    parsed_current: &versioning::ParsedTag,
  ) -> OpResult<String> {
    let policy = selection_policy(container)?;
    let tags = self.list_tags_with_retry(current).await?;
    if tags.is_empty() {
      return Err(OpError::validation(format!(
        "registry returned no candidate tags for {current}"
      )));
    }
    versioning::select_candidate(parsed_current, &tags, &policy)
      .map(|selected| selected.tag)
      .ok_or_else(|| {
        OpError::validation(format!(
          "no eligible update candidate for {current}"
        ))
      })
  }

  async fn list_tags_with_retry(
    &self,
    image: &ImageRef,
  ) -> OpResult<Vec<String>> {
    registry::list_tags_with_retry(
      self.deps.registry.as_ref(),
      image,
      self.deps.config.registry_max_retries,
    )
    .await
    .map_err(|e| {
      OpError::transport(format!(
        "registry list_tags for {image}: {e}"
      ))
    })
  }
}

pub(crate) fn selection_policy(
  container: &ContainerInfo,
) -> OpResult<SelectionPolicy> {
  use docksmith_client::entities::label_truthy;
  let pin = if label_truthy(
    container.labels.get(docksmith_labels::PIN_PATCH),
  ) {
    Some(PinLevel::Patch)
  } else if label_truthy(
    container.labels.get(docksmith_labels::PIN_MINOR),
  ) {
    Some(PinLevel::Minor)
  } else if label_truthy(
    container.labels.get(docksmith_labels::PIN_MAJOR),
  ) {
    Some(PinLevel::Major)
  } else {
    None
  };
  let tag_regex = container
    .labels
    .get(docksmith_labels::TAG_REGEX)
    .map(|pattern| {
      regex::Regex::new(pattern).map_err(|e| {
        OpError::validation(format!(
          "invalid tag-regex label: {e}"
        ))
      })
    })
    .transpose()?;
  Ok(SelectionPolicy { pin, tag_regex })
}

/// Byte-exact restore of a backed-up file.
pub(crate) fn restore_file(
  backup: &std::path::Path,
  target: &std::path::Path,
) {
  if let Err(e) = std::fs::copy(backup, target) {
    error!(
      "failed to restore {target:?} from backup {backup:?} | {e}"
    );
  }
}
