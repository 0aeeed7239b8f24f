use std::sync::{Arc, OnceLock};

use database::Database;
use docksmith_client::entities::config::CoreConfig;
use engine::{ContainerEngine, DockerEngine};
use events::EventBus;
use registry::{RegistryClient, StaticCredentials, TagRegistry};

use crate::config::core_config;

/// Everything the orchestrator and checker need, threaded
/// explicitly so tests can substitute their own engine / registry
/// / database.
pub struct Deps {
  pub db: Arc<Database>,
  pub engine: Arc<dyn ContainerEngine>,
  pub registry: Arc<dyn TagRegistry>,
  pub bus: Arc<EventBus>,
  pub config: CoreConfig,
}

pub fn db_client() -> &'static Arc<Database> {
  static DB: OnceLock<Arc<Database>> = OnceLock::new();
  DB.get_or_init(|| {
    Arc::new(
      Database::open(&core_config().database_path)
        .expect("failed to open database"),
    )
  })
}

pub fn docker_engine() -> &'static Arc<dyn ContainerEngine> {
  static ENGINE: OnceLock<Arc<dyn ContainerEngine>> =
    OnceLock::new();
  ENGINE.get_or_init(|| {
    Arc::new(
      DockerEngine::connect(core_config().manual_stacks.clone())
        .expect("failed to connect to docker daemon"),
    )
  })
}

pub fn registry_client() -> &'static Arc<dyn TagRegistry> {
  static REGISTRY: OnceLock<Arc<dyn TagRegistry>> = OnceLock::new();
  REGISTRY.get_or_init(|| {
    Arc::new(RegistryClient::new(Arc::new(StaticCredentials(
      core_config().registry_tokens.clone(),
    ))))
  })
}

pub fn event_bus() -> &'static Arc<EventBus> {
  static BUS: OnceLock<Arc<EventBus>> = OnceLock::new();
  BUS.get_or_init(|| Arc::new(EventBus::new()))
}

/// The live dependency set backed by the process singletons.
pub fn deps() -> Arc<Deps> {
  static DEPS: OnceLock<Arc<Deps>> = OnceLock::new();
  DEPS
    .get_or_init(|| {
      Arc::new(Deps {
        db: db_client().clone(),
        engine: docker_engine().clone(),
        registry: registry_client().clone(),
        bus: event_bus().clone(),
        config: core_config().clone(),
      })
    })
    .clone()
}
