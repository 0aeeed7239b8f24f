//! Shared fixtures: an in-memory engine and registry, plus compose
//! file scaffolding.
#![allow(dead_code)]

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use database::Database;
use docksmith_client::entities::{
  ImageRef, compose_labels,
  config::CoreConfig,
  container::{ContainerHealth, ContainerInfo, ContainerState},
  operation::{OperationRecord, OperationStatus},
};
use docksmith_core::{
  orchestrator::Orchestrator, paths::PathTranslator, state::Deps,
};
use engine::{
  BindMount, ContainerEngine, ImageInspect, PruneResult,
  PruneTarget,
};
use events::EventBus;
use registry::{RegistryError, TagRegistry};

/// Engine actions recorded in order, for ordering assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
  Pull(String),
  Stop(String),
  Start(String),
  Restart(String),
  Remove(String),
}

#[derive(Default)]
pub struct MockEngine {
  pub containers: Mutex<Vec<ContainerInfo>>,
  pub images: Mutex<HashMap<String, ImageInspect>>,
  pub actions: Mutex<Vec<EngineAction>>,
  /// Health reported once a container has been started again.
  pub health_after_start: Mutex<HashMap<String, ContainerHealth>>,
  /// Per-image pull failures.
  pub failing_pulls: Mutex<Vec<String>>,
  /// Extra latency on pull, to hold stack locks in tests.
  pub pull_delay: Mutex<Option<Duration>>,
}

impl MockEngine {
  pub fn new() -> Arc<MockEngine> {
    Arc::new(MockEngine::default())
  }

  pub fn add_container(&self, container: ContainerInfo) {
    // Seed the image so digest probes resolve.
    self.seed_image(&container.image);
    self.containers.lock().unwrap().push(container);
  }

  pub fn seed_image(&self, reference: &str) {
    self.images.lock().unwrap().insert(
      reference.to_string(),
      ImageInspect {
        id: Some(format!("id-{reference}")),
        repo_digests: vec![format!(
          "{}@sha256:digest-{reference}",
          ImageRef::parse(reference).repository
        )],
        labels: Default::default(),
        architecture: Some(String::from("amd64")),
      },
    );
  }

  pub fn actions(&self) -> Vec<EngineAction> {
    self.actions.lock().unwrap().clone()
  }

  pub fn restarted(&self) -> Vec<String> {
    self
      .actions()
      .into_iter()
      .filter_map(|action| match action {
        EngineAction::Restart(name) => Some(name),
        _ => None,
      })
      .collect()
  }

  pub fn pulled(&self) -> Vec<String> {
    self
      .actions()
      .into_iter()
      .filter_map(|action| match action {
        EngineAction::Pull(image) => Some(image),
        _ => None,
      })
      .collect()
  }

  fn find(&self, name: &str) -> Option<ContainerInfo> {
    self
      .containers
      .lock()
      .unwrap()
      .iter()
      .find(|container| container.name == name)
      .cloned()
  }
}

#[async_trait]
impl ContainerEngine for MockEngine {
  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<ContainerInfo>> {
    Ok(self.containers.lock().unwrap().clone())
  }

  async fn get_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerInfo> {
    self
      .find(name)
      .ok_or_else(|| anyhow::anyhow!("no container named {name}"))
  }

  async fn inspect_image(
    &self,
    image: &str,
  ) -> anyhow::Result<ImageInspect> {
    self
      .images
      .lock()
      .unwrap()
      .get(image)
      .cloned()
      .ok_or_else(|| anyhow::anyhow!("image not found: {image}"))
  }

  async fn pull(&self, image: &str) -> anyhow::Result<()> {
    let delay = *self.pull_delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self
      .actions
      .lock()
      .unwrap()
      .push(EngineAction::Pull(image.to_string()));
    if self
      .failing_pulls
      .lock()
      .unwrap()
      .contains(&image.to_string())
    {
      anyhow::bail!("pull access denied for {image}");
    }
    self.seed_image(image);
    Ok(())
  }

  async fn stop(
    &self,
    name: &str,
    _timeout: Option<i32>,
  ) -> anyhow::Result<()> {
    self
      .actions
      .lock()
      .unwrap()
      .push(EngineAction::Stop(name.to_string()));
    let mut containers = self.containers.lock().unwrap();
    for container in containers.iter_mut() {
      if container.name == name {
        container.state = ContainerState::Exited;
        container.health = ContainerHealth::None;
      }
    }
    Ok(())
  }

  async fn start(&self, name: &str) -> anyhow::Result<()> {
    self
      .actions
      .lock()
      .unwrap()
      .push(EngineAction::Start(name.to_string()));
    let health = self
      .health_after_start
      .lock()
      .unwrap()
      .get(name)
      .copied()
      .unwrap_or(ContainerHealth::None);
    let mut containers = self.containers.lock().unwrap();
    for container in containers.iter_mut() {
      if container.name == name {
        container.state = ContainerState::Running;
        container.health = health;
      }
    }
    Ok(())
  }

  async fn restart(
    &self,
    name: &str,
    _timeout: Option<i32>,
  ) -> anyhow::Result<()> {
    self
      .actions
      .lock()
      .unwrap()
      .push(EngineAction::Restart(name.to_string()));
    Ok(())
  }

  async fn remove(
    &self,
    name: &str,
    _force: bool,
    _volumes: bool,
  ) -> anyhow::Result<()> {
    self
      .actions
      .lock()
      .unwrap()
      .push(EngineAction::Remove(name.to_string()));
    self
      .containers
      .lock()
      .unwrap()
      .retain(|container| container.name != name);
    Ok(())
  }

  async fn container_mounts(
    &self,
    _name: &str,
  ) -> anyhow::Result<Vec<BindMount>> {
    Ok(Vec::new())
  }

  async fn prune(
    &self,
    _target: PruneTarget,
  ) -> anyhow::Result<PruneResult> {
    Ok(PruneResult::default())
  }
}

#[derive(Default)]
pub struct MockRegistry {
  /// repository -> tags
  pub tags: Mutex<HashMap<String, Vec<String>>>,
  /// image ref -> manifest digest
  pub manifests: Mutex<HashMap<String, String>>,
}

impl MockRegistry {
  pub fn new() -> Arc<MockRegistry> {
    Arc::new(MockRegistry::default())
  }

  pub fn set_tags(&self, repository: &str, tags: &[&str]) {
    self.tags.lock().unwrap().insert(
      repository.to_string(),
      tags.iter().map(|t| t.to_string()).collect(),
    );
  }
}

#[async_trait]
impl TagRegistry for MockRegistry {
  async fn list_tags(
    &self,
    image: &ImageRef,
  ) -> Result<Vec<String>, RegistryError> {
    Ok(
      self
        .tags
        .lock()
        .unwrap()
        .get(&image.repository)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn head_manifest(
    &self,
    image: &ImageRef,
  ) -> Result<String, RegistryError> {
    self
      .manifests
      .lock()
      .unwrap()
      .get(&image.to_string())
      .cloned()
      .ok_or_else(|| RegistryError::NotFound(image.to_string()))
  }
}

pub struct Harness {
  pub engine: Arc<MockEngine>,
  pub registry: Arc<MockRegistry>,
  pub deps: Arc<Deps>,
  pub orchestrator: Arc<Orchestrator>,
}

pub fn harness() -> Harness {
  let engine = MockEngine::new();
  let registry = MockRegistry::new();
  let mut config = CoreConfig::default();
  config.health_check_timeout_secs = 2;
  config.precheck_timeout_secs = 5;
  config.stage_timeout_secs = 30;
  config.registry_max_retries = 1;
  let deps = Arc::new(Deps {
    db: Arc::new(Database::open_in_memory().unwrap()),
    engine: engine.clone(),
    registry: registry.clone(),
    bus: Arc::new(EventBus::new()),
    config,
  });
  let orchestrator = Orchestrator::new(
    deps.clone(),
    Arc::new(PathTranslator::default()),
  );
  Harness {
    engine,
    registry,
    deps,
    orchestrator,
  }
}

/// A running container bound to a compose file on disk.
pub fn container(
  name: &str,
  image: &str,
  stack: &str,
  compose_path: &Path,
  extra_labels: &[(&str, &str)],
) -> ContainerInfo {
  let mut labels: HashMap<String, String> = extra_labels
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
  labels.insert(
    compose_labels::PROJECT.to_string(),
    stack.to_string(),
  );
  labels.insert(compose_labels::SERVICE.to_string(), name.to_string());
  labels.insert(
    compose_labels::CONFIG_FILES.to_string(),
    compose_path.to_string_lossy().into_owned(),
  );
  ContainerInfo {
    id: format!("id-{name}"),
    name: name.to_string(),
    image: image.to_string(),
    image_id: Some(format!("img-{name}")),
    state: ContainerState::Running,
    health: ContainerHealth::None,
    network_mode: None,
    labels,
    stack: Some(stack.to_string()),
    service: Some(name.to_string()),
  }
}

pub fn write_compose(dir: &Path, contents: &str) -> PathBuf {
  let path = dir.join("compose.yaml");
  std::fs::write(&path, contents).unwrap();
  path
}

/// Poll an operation until it reaches a terminal status.
pub async fn wait_terminal(
  orchestrator: &Arc<Orchestrator>,
  operation_id: &str,
) -> OperationRecord {
  for _ in 0..200 {
    let record = orchestrator
      .status(operation_id)
      .unwrap()
      .expect("operation exists");
    if record.status.is_terminal() {
      return record;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
  panic!("operation {operation_id} never reached a terminal state");
}

/// Statuses that imply the operation is done regardless of result.
pub fn assert_status(
  record: &OperationRecord,
  expected: OperationStatus,
) {
  assert_eq!(
    record.status, expected,
    "operation {} ended {:?} (error: {:?})",
    record.operation_id, record.status, record.error
  );
}
