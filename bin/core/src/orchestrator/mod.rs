//! # Operation Orchestrator
//!
//! Accepts mutation requests, serializes them per stack, drives
//! each through the staged state machine, emits progress events,
//! cycles containers in dependency order, and keeps the compose
//! artifacts authoritative (backup before first mutation, restore
//! on rollback).

use std::{
  collections::HashMap, future::Future, pin::Pin, sync::Arc,
};

use dashmap::DashMap;
use database::DbError;
use docksmith_client::entities::{
  container::ContainerInfo,
  docksmith_timestamp,
  event::{Event, topics},
  operation::{
    ErrorKind, ExitKind, OperationRecord, OperationRequest,
    OperationStatus, OperationType, QueueEntry,
  },
};
use tokio_util::sync::CancellationToken;

use crate::{paths::PathTranslator, state::Deps};

mod batch;
mod recovery;
mod rollback;
pub(crate) mod run;

/// How many completed operations feed a queue estimate.
const ESTIMATE_SAMPLE: u32 = 10;

pub type OpResult<T> = Result<T, OpError>;

/// Stage-level failure. Every stage returns a result value; no
/// control-flow exceptions cross stage boundaries.
#[derive(Debug, Clone)]
pub enum OpError {
  Cancelled,
  Failed {
    kind: ErrorKind,
    message: String,
    /// Set when a rollback was performed before surfacing.
    rolled_back: bool,
  },
}

impl OpError {
  pub fn failed(
    kind: ErrorKind,
    message: impl Into<String>,
  ) -> OpError {
    OpError::Failed {
      kind,
      message: message.into(),
      rolled_back: false,
    }
  }

  pub fn validation(message: impl Into<String>) -> OpError {
    OpError::failed(ErrorKind::Validation, message)
  }

  pub fn transport(message: impl Into<String>) -> OpError {
    OpError::failed(ErrorKind::Transport, message)
  }

  pub fn kind(&self) -> Option<ErrorKind> {
    match self {
      OpError::Cancelled => None,
      OpError::Failed { kind, .. } => Some(*kind),
    }
  }

  fn with_rollback(self) -> OpError {
    match self {
      OpError::Failed { kind, message, .. } => OpError::Failed {
        kind,
        message,
        rolled_back: true,
      },
      other => other,
    }
  }
}

impl From<DbError> for OpError {
  fn from(e: DbError) -> OpError {
    OpError::failed(ErrorKind::Backend, format!("storage: {e}"))
  }
}

/// The exit kind a CLI / API reports for an operation record.
pub fn exit_kind(record: &OperationRecord) -> ExitKind {
  match record.status {
    OperationStatus::Complete | OperationStatus::Partial => {
      ExitKind::Ok
    }
    OperationStatus::Cancelled => ExitKind::Cancelled,
    OperationStatus::Queued => ExitKind::ConflictQueued,
    _ => match record.error_kind {
      Some(ErrorKind::Validation) => ExitKind::ValidationFailed,
      Some(ErrorKind::Precheck) => ExitKind::PrecheckFailed,
      Some(ErrorKind::Backend) => ExitKind::StorageError,
      Some(ErrorKind::Transport) | Some(ErrorKind::Timeout) => {
        if record
          .error
          .as_deref()
          .is_some_and(|error| error.starts_with("registry"))
        {
          ExitKind::RegistryError
        } else {
          ExitKind::EngineError
        }
      }
      _ => ExitKind::EngineError,
    },
  }
}

/// Normalized work description carried from submission to the
/// worker task (and reconstructed from the queue after restart).
#[derive(Debug, Clone)]
pub(crate) enum RunSpec {
  Update {
    force: bool,
    target_version: Option<String>,
  },
  FixMismatch,
  Restart,
  Stop,
  Start,
  Remove {
    force: bool,
    volumes: bool,
  },
  LabelChange {
    set: Vec<(String, String)>,
    remove: Vec<String>,
  },
  Batch {
    containers: Vec<String>,
    target_versions: HashMap<String, String>,
    force: bool,
  },
  Rollback {
    target_operation: String,
  },
}

pub struct Orchestrator {
  pub(crate) deps: Arc<Deps>,
  pub(crate) translator: Arc<PathTranslator>,
  locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
  cancels: DashMap<String, CancellationToken>,
  /// Specs for queued operations, lost on restart (queued work is
  /// then reconstructed from the persisted queue entry).
  pending: DashMap<String, RunSpec>,
}

impl Orchestrator {
  pub fn new(
    deps: Arc<Deps>,
    translator: Arc<PathTranslator>,
  ) -> Arc<Orchestrator> {
    Arc::new(Orchestrator {
      deps,
      translator,
      locks: Default::default(),
      cancels: Default::default(),
      pending: Default::default(),
    })
  }

  /// Accept a request. Returns the operation id synchronously;
  /// execution is asynchronous. A request against a locked stack
  /// is persisted to the queue instead of starting.
  pub async fn submit(
    self: &Arc<Self>,
    request: OperationRequest,
  ) -> OpResult<String> {
    match request {
      OperationRequest::Update {
        container,
        target_version,
        force,
      } => {
        let target = self.resolve_container(&container).await?;
        self.check_stack_acyclic(target.stack.as_deref()).await?;
        self
          .submit_one(
            OperationType::Single,
            target,
            RunSpec::Update {
              force,
              target_version,
            },
          )
          .await
      }
      OperationRequest::FixMismatch { container } => {
        let target = self.resolve_container(&container).await?;
        self
          .submit_one(
            OperationType::FixMismatch,
            target,
            RunSpec::FixMismatch,
          )
          .await
      }
      OperationRequest::Restart { container } => {
        let target = self.resolve_container(&container).await?;
        self.check_stack_acyclic(target.stack.as_deref()).await?;
        self
          .submit_one(
            OperationType::Restart,
            target,
            RunSpec::Restart,
          )
          .await
      }
      OperationRequest::Stop { container } => {
        let target = self.resolve_container(&container).await?;
        self
          .submit_one(OperationType::Stop, target, RunSpec::Stop)
          .await
      }
      OperationRequest::Start { container } => {
        let target = self.resolve_container(&container).await?;
        self
          .submit_one(OperationType::Start, target, RunSpec::Start)
          .await
      }
      OperationRequest::Remove {
        container,
        force,
        volumes,
      } => {
        let target = self.resolve_container(&container).await?;
        self
          .submit_one(
            OperationType::Remove,
            target,
            RunSpec::Remove { force, volumes },
          )
          .await
      }
      OperationRequest::LabelChange {
        container,
        set,
        remove,
      } => {
        let target = self.resolve_container(&container).await?;
        self
          .submit_one(
            OperationType::LabelChange,
            target,
            RunSpec::LabelChange { set, remove },
          )
          .await
      }
      OperationRequest::Rollback { operation_id } => {
        let target = self
          .deps
          .db
          .get_operation(&operation_id)?
          .ok_or_else(|| {
            OpError::validation(format!(
              "operation {operation_id} not found"
            ))
          })?;
        let container =
          self.resolve_container(&target.container_name).await?;
        self
          .submit_one(
            OperationType::Rollback,
            container,
            RunSpec::Rollback {
              target_operation: operation_id,
            },
          )
          .await
      }
      OperationRequest::Batch {
        containers,
        target_versions,
        force,
      } => {
        self
          .submit_batch(
            OperationType::Batch,
            containers,
            target_versions,
            force,
          )
          .await
      }
      OperationRequest::Stack { stack, force } => {
        let containers = self
          .stack_containers(&stack)
          .await?
          .into_iter()
          .filter(|container| !container.is_ignored())
          .map(|container| container.name)
          .collect::<Vec<_>>();
        if containers.is_empty() {
          return Err(OpError::validation(format!(
            "stack {stack} has no eligible containers"
          )));
        }
        self
          .submit_batch(
            OperationType::Stack,
            containers,
            Default::default(),
            force,
          )
          .await
      }
    }
  }

  /// Split a batch into one operation per stack group, linked by a
  /// shared batch group id. Returns the first operation id.
  async fn submit_batch(
    self: &Arc<Self>,
    typ: OperationType,
    containers: Vec<String>,
    target_versions: HashMap<String, String>,
    force: bool,
  ) -> OpResult<String> {
    if containers.is_empty() {
      return Err(OpError::validation(
        "batch request names no containers",
      ));
    }
    let mut groups: Vec<(String, Vec<ContainerInfo>)> = Vec::new();
    for name in &containers {
      let container = self.resolve_container(name).await?;
      let stack = stack_key(&container);
      match groups.iter_mut().find(|(key, _)| *key == stack) {
        Some((_, group)) => group.push(container),
        None => groups.push((stack, vec![container])),
      }
    }
    for (_, group) in &groups {
      self
        .check_stack_acyclic(group[0].stack.as_deref())
        .await?;
    }
    let batch_group_id = uuid::Uuid::new_v4().to_string();
    let mut first_id = None;
    for (_, group) in groups {
      let names = group
        .iter()
        .map(|container| container.name.clone())
        .collect::<Vec<_>>();
      let mut record = OperationRecord::new(
        typ,
        names.join(","),
        group[0].stack.clone(),
      );
      record.batch_group_id = Some(batch_group_id.clone());
      let spec = RunSpec::Batch {
        containers: names,
        target_versions: target_versions.clone(),
        force,
      };
      let id = self
        .insert_and_start(record, &group[0], spec)
        .await?;
      first_id.get_or_insert(id);
    }
    first_id.ok_or_else(|| {
      OpError::validation("batch request names no containers")
    })
  }

  async fn submit_one(
    self: &Arc<Self>,
    typ: OperationType,
    container: ContainerInfo,
    spec: RunSpec,
  ) -> OpResult<String> {
    let record = OperationRecord::new(
      typ,
      container.name.clone(),
      container.stack.clone(),
    );
    self.insert_and_start(record, &container, spec).await
  }

  async fn insert_and_start(
    self: &Arc<Self>,
    record: OperationRecord,
    container: &ContainerInfo,
    spec: RunSpec,
  ) -> OpResult<String> {
    self.deps.db.insert_operation(&record)?;
    let operation_id = record.operation_id.clone();
    self.start_or_enqueue(record, container, spec).await?;
    Ok(operation_id)
  }

  /// Acquire the stack lock and start the worker, or persist a
  /// queue entry when the stack is busy.
  async fn start_or_enqueue(
    self: &Arc<Self>,
    record: OperationRecord,
    container: &ContainerInfo,
    spec: RunSpec,
  ) -> OpResult<()> {
    let stack = stack_key(container);
    let lock = self
      .locks
      .entry(stack.clone())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone();
    match lock.try_lock_owned() {
      Ok(guard) => {
        let token = CancellationToken::new();
        self
          .cancels
          .insert(record.operation_id.clone(), token.clone());
        let orchestrator = self.clone();
        tokio::spawn(async move {
          orchestrator
            .run_operation(record, spec, stack, guard, token)
            .await;
        });
        Ok(())
      }
      Err(_) => {
        let estimated_start = self
          .deps
          .db
          .mean_recent_duration(&stack, ESTIMATE_SAMPLE)?
          .map(|mean| docksmith_timestamp() + mean);
        let (containers, target_versions) = match &spec {
          RunSpec::Batch {
            containers,
            target_versions,
            ..
          } => (containers.clone(), target_versions.clone()),
          RunSpec::Update {
            target_version: Some(version),
            ..
          } => (
            vec![record.container_name.clone()],
            HashMap::from([(
              record.container_name.clone(),
              version.clone(),
            )]),
          ),
          _ => {
            (vec![record.container_name.clone()], Default::default())
          }
        };
        self.deps.db.enqueue(&QueueEntry {
          operation_id: record.operation_id.clone(),
          stack_name: stack,
          containers,
          operation_type: record.operation_type,
          priority: 0,
          queued_at: docksmith_timestamp(),
          estimated_start,
          target_versions,
        })?;
        self.pending.insert(record.operation_id.clone(), spec);
        debug!(
          operation_id = %record.operation_id,
          "stack busy, operation queued"
        );
        Ok(())
      }
    }
  }

  /// The current record for an operation.
  pub fn status(
    &self,
    operation_id: &str,
  ) -> OpResult<Option<OperationRecord>> {
    Ok(self.deps.db.get_operation(operation_id)?)
  }

  /// Cancel: a queued operation transitions to `cancelled`; an
  /// in-progress one is signalled and stops at the next safe
  /// checkpoint.
  pub async fn cancel(&self, operation_id: &str) -> OpResult<()> {
    if self.deps.db.remove_queued(operation_id)? {
      self.pending.remove(operation_id);
      self
        .deps
        .db
        .set_operation_status(
          operation_id,
          OperationStatus::Cancelled,
        )?;
      self.publish_terminal(operation_id, None, true, false);
      return Ok(());
    }
    if let Some(token) = self.cancels.get(operation_id) {
      token.cancel();
      return Ok(());
    }
    Err(OpError::validation(format!(
      "operation {operation_id} is not queued or running"
    )))
  }

  fn run_operation(
    self: Arc<Self>,
    record: OperationRecord,
    spec: RunSpec,
    stack: String,
    guard: tokio::sync::OwnedMutexGuard<()>,
    token: CancellationToken,
  ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
    let operation_id = record.operation_id.clone();
    let container = record.container_name.clone();
    let result = self.dispatch(&record, spec, &token).await;
    match result {
      Ok(()) => {}
      Err(OpError::Cancelled) => {
        if let Err(e) = self.deps.db.set_operation_status(
          &operation_id,
          OperationStatus::Cancelled,
        ) {
          error!(
            %operation_id,
            "failed to record cancellation | {e:#}"
          );
        }
        self.publish_terminal(
          &operation_id,
          Some(&container),
          true,
          false,
        );
      }
      Err(OpError::Failed {
        kind,
        message,
        rolled_back,
      }) => {
        let force_retry = kind == ErrorKind::Precheck;
        if let Err(e) = self.deps.db.fail_operation(
          &operation_id,
          &message,
          kind,
          force_retry,
        ) {
          error!(
            %operation_id,
            "failed to record failure | {e:#}"
          );
        }
        if rolled_back {
          self.publish_terminal(
            &operation_id,
            Some(&container),
            false,
            true,
          );
        } else {
          self.deps.bus.publish(
            Event::new(topics::OPERATION_FAILED)
              .with("operation_id", operation_id.clone())
              .with("container_name", container.clone())
              .with("error", message)
              .with("kind", kind.to_string()),
          );
        }
      }
    }
    self.cancels.remove(&operation_id);
    drop(guard);
    let orchestrator = self.clone();
    tokio::spawn(async move {
      orchestrator.drain_stack(stack).await;
    });
    })
  }

  async fn dispatch(
    self: &Arc<Self>,
    record: &OperationRecord,
    spec: RunSpec,
    token: &CancellationToken,
  ) -> OpResult<()> {
    match spec {
      RunSpec::Update {
        force,
        target_version,
      } => {
        self.run_update(record, force, target_version, token).await
      }
      RunSpec::FixMismatch => {
        self.run_fix_mismatch(record, token).await
      }
      RunSpec::Restart => self.run_restart(record, token).await,
      RunSpec::Stop => self.run_stop(record, token).await,
      RunSpec::Start => self.run_start(record, token).await,
      RunSpec::Remove { force, volumes } => {
        self.run_remove(record, force, volumes, token).await
      }
      RunSpec::LabelChange { set, remove } => {
        self.run_label_change(record, set, remove, token).await
      }
      RunSpec::Batch {
        containers,
        target_versions,
        force,
      } => {
        self
          .run_batch(record, containers, target_versions, force, token)
          .await
      }
      RunSpec::Rollback { target_operation } => {
        self
          .run_rollback_operation(record, &target_operation, token)
          .await
      }
    }
  }

  /// Start the next queued operation for a stack, if any.
  async fn drain_stack(self: &Arc<Self>, stack: String) {
    let entry = match self.deps.db.dequeue_next(&stack) {
      Ok(Some(entry)) => entry,
      Ok(None) => return,
      Err(e) => {
        error!(%stack, "failed to read queue | {e:#}");
        return;
      }
    };
    let record =
      match self.deps.db.get_operation(&entry.operation_id) {
        Ok(Some(record))
          if record.status == OperationStatus::Queued =>
        {
          record
        }
        Ok(_) => return,
        Err(e) => {
          error!(%stack, "failed to load queued operation | {e:#}");
          return;
        }
      };
    let spec = match self
      .pending
      .remove(&record.operation_id)
      .map(|(_, spec)| spec)
      .or_else(|| spec_from_queue_entry(&entry))
    {
      Some(spec) => spec,
      None => {
        warn!(
          operation_id = %record.operation_id,
          "queued operation cannot be reconstructed"
        );
        let _ = self.deps.db.fail_operation(
          &record.operation_id,
          "queued request lost across restart",
          ErrorKind::Recovery,
          false,
        );
        return;
      }
    };
    let container = match self
      .resolve_container(queue_target(&entry))
      .await
    {
      Ok(container) => container,
      Err(e) => {
        let message = match &e {
          OpError::Failed { message, .. } => message.clone(),
          OpError::Cancelled => String::from("cancelled"),
        };
        let _ = self.deps.db.fail_operation(
          &record.operation_id,
          &message,
          ErrorKind::Validation,
          false,
        );
        return;
      }
    };
    if let Err(e) =
      self.start_or_enqueue(record, &container, spec).await
    {
      error!(%stack, "failed to start queued operation | {e:?}");
    }
  }

  // ---- shared helpers ----

  pub(crate) async fn resolve_container(
    &self,
    name: &str,
  ) -> OpResult<ContainerInfo> {
    self.deps.engine.get_by_name(name).await.map_err(|e| {
      OpError::validation(format!("container {name}: {e:#}"))
    })
  }

  pub(crate) async fn stack_containers(
    &self,
    stack: &str,
  ) -> OpResult<Vec<ContainerInfo>> {
    let containers =
      self.deps.engine.list_containers().await.map_err(|e| {
        OpError::transport(format!("engine list: {e:#}"))
      })?;
    Ok(
      containers
        .into_iter()
        .filter(|container| {
          container.stack.as_deref() == Some(stack)
        })
        .collect(),
    )
  }

  /// Build the stack graph and reject submission on a cycle, with
  /// the concrete path in the error.
  async fn check_stack_acyclic(
    &self,
    stack: Option<&str>,
  ) -> OpResult<()> {
    let Some(stack) = stack else {
      return Ok(());
    };
    let containers = self.stack_containers(stack).await?;
    let graph =
      depgraph::DependencyGraph::from_containers(&containers);
    graph
      .topological_sort()
      .map(|_| ())
      .map_err(|e| OpError::validation(e.to_string()))
  }

  /// Advance the status (store-guarded) and emit the stage event.
  pub(crate) fn advance(
    &self,
    operation_id: &str,
    container_name: Option<&str>,
    status: OperationStatus,
    message: &str,
  ) -> OpResult<()> {
    self.deps.db.set_operation_status(operation_id, status)?;
    self.publish_stage(
      operation_id,
      container_name,
      status,
      message,
    );
    Ok(())
  }

  pub(crate) fn publish_stage(
    &self,
    operation_id: &str,
    container_name: Option<&str>,
    status: OperationStatus,
    message: &str,
  ) {
    let mut event = Event::new(topics::OPERATION_STAGE)
      .with("operation_id", operation_id)
      .with("stage", status.to_string())
      .with("percent", status.percent())
      .with("message", message);
    if let Some(name) = container_name {
      event = event.with("container_name", name);
    }
    self.deps.bus.publish(event);
  }

  pub(crate) fn publish_terminal(
    &self,
    operation_id: &str,
    container_name: Option<&str>,
    cancelled: bool,
    rolled_back: bool,
  ) {
    let mut event = Event::new(topics::OPERATION_COMPLETED)
      .with("operation_id", operation_id)
      .with("cancelled", cancelled)
      .with("rolled_back", rolled_back);
    if let Some(name) = container_name {
      event = event.with("container_name", name);
    }
    self.deps.bus.publish(event);
  }

  pub(crate) fn check_cancelled(
    &self,
    token: &CancellationToken,
  ) -> OpResult<()> {
    if token.is_cancelled() {
      Err(OpError::Cancelled)
    } else {
      Ok(())
    }
  }

  /// Run an engine call under the stage deadline.
  pub(crate) async fn stage_call<T>(
    &self,
    what: &str,
    fut: impl Future<Output = anyhow::Result<T>>,
  ) -> OpResult<T> {
    let deadline = std::time::Duration::from_secs(
      self.deps.config.stage_timeout_secs,
    );
    match tokio::time::timeout(deadline, fut).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(e)) => {
        Err(OpError::transport(format!("{what}: {e:#}")))
      }
      Err(_) => Err(OpError::failed(
        ErrorKind::Timeout,
        format!("{what}: stage deadline exceeded"),
      )),
    }
  }
}

pub(crate) fn stack_key(container: &ContainerInfo) -> String {
  container.stack.clone().unwrap_or_else(|| {
    format!("__standalone:{}", container.name)
  })
}

fn queue_target(entry: &QueueEntry) -> &str {
  entry
    .containers
    .first()
    .map(String::as_str)
    .unwrap_or(entry.stack_name.as_str())
}

/// Best-effort spec reconstruction for queue entries that survive
/// a restart. Label changes cannot be reconstructed.
fn spec_from_queue_entry(entry: &QueueEntry) -> Option<RunSpec> {
  Some(match entry.operation_type? {
    OperationType::Single => RunSpec::Update {
      force: false,
      target_version: entry
        .containers
        .first()
        .and_then(|name| entry.target_versions.get(name).cloned()),
    },
    OperationType::FixMismatch => RunSpec::FixMismatch,
    OperationType::Restart => RunSpec::Restart,
    OperationType::Stop => RunSpec::Stop,
    OperationType::Start => RunSpec::Start,
    OperationType::Remove => RunSpec::Remove {
      force: false,
      volumes: false,
    },
    OperationType::Batch
    | OperationType::Stack
    | OperationType::BatchRestart
    | OperationType::BatchStop
    | OperationType::BatchStart => RunSpec::Batch {
      containers: entry.containers.clone(),
      target_versions: entry.target_versions.clone(),
      force: false,
    },
    OperationType::LabelChange | OperationType::Rollback => {
      return None;
    }
  })
}
