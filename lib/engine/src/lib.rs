//! # Engine
//!
//! The container engine capability set consumed by the
//! orchestrator and the background checker, plus the Docker
//! implementation. Reads go over the engine API (bollard);
//! mutations (pull / stop / start / restart / rm / prune) go
//! through the docker CLI.

use std::collections::HashMap;

use async_trait::async_trait;
use docksmith_client::entities::container::ContainerInfo;

mod docker;
mod version;

pub use docker::DockerEngine;
pub use version::{parse_status_health, version_from_labels};

/// Inspection of one image.
#[derive(Debug, Clone, Default)]
pub struct ImageInspect {
  pub id: Option<String>,
  pub repo_digests: Vec<String>,
  pub labels: HashMap<String, String>,
  pub architecture: Option<String>,
}

impl ImageInspect {
  /// `sha256:…` from the first repo digest, else the image id.
  pub fn digest(&self) -> Option<String> {
    self
      .repo_digests
      .first()
      .map(|digest| {
        digest
          .split_once('@')
          .map(|(_, digest)| digest.to_string())
          .unwrap_or_else(|| digest.clone())
      })
      .or_else(|| self.id.clone())
  }

  /// An image with no repo digests was never pushed anywhere: it
  /// is local-only and has nothing to check against a registry.
  pub fn is_local(&self) -> bool {
    self.repo_digests.is_empty()
  }
}

/// A bind mount as seen from inside / outside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
  pub source: String,
  pub destination: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTarget {
  Containers,
  Images,
  Networks,
  Volumes,
  System,
}

#[derive(Debug, Clone, Default)]
pub struct PruneResult {
  pub items_deleted: Vec<String>,
  pub space_reclaimed: u64,
}

/// Capability set over the container engine. The orchestrator only
/// ever talks to this; tests substitute their own implementation.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
  /// Every container, running or stopped, with labels and health.
  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<ContainerInfo>>;

  /// Exact-match lookup by unique name.
  async fn get_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerInfo>;

  async fn inspect_image(
    &self,
    image: &str,
  ) -> anyhow::Result<ImageInspect>;

  async fn pull(&self, image: &str) -> anyhow::Result<()>;

  async fn stop(
    &self,
    name: &str,
    timeout: Option<i32>,
  ) -> anyhow::Result<()>;

  async fn start(&self, name: &str) -> anyhow::Result<()>;

  async fn restart(
    &self,
    name: &str,
    timeout: Option<i32>,
  ) -> anyhow::Result<()>;

  async fn remove(
    &self,
    name: &str,
    force: bool,
    volumes: bool,
  ) -> anyhow::Result<()>;

  /// Bind mounts of a container, for host / container path
  /// translation.
  async fn container_mounts(
    &self,
    name: &str,
  ) -> anyhow::Result<Vec<BindMount>>;

  async fn prune(
    &self,
    target: PruneTarget,
  ) -> anyhow::Result<PruneResult>;

  /// True iff the image has no repo digests.
  async fn is_local_image(
    &self,
    image: &str,
  ) -> anyhow::Result<bool> {
    Ok(self.inspect_image(image).await?.is_local())
  }

  /// Best-effort version from a priority-ordered label list.
  async fn image_version(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    let inspect = self.inspect_image(image).await?;
    Ok(version_from_labels(&inspect.labels))
  }

  /// `sha256:…` digest of the image.
  async fn image_digest(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(self.inspect_image(image).await?.digest())
  }
}
