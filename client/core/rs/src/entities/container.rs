use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{compose_labels, docksmith_labels, label_truthy};

/// Container lifecycle state as reported by the engine.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerState {
  #[default]
  Created,
  Running,
  Paused,
  Restarting,
  Removing,
  Exited,
  Dead,
}

/// Health derived from the engine's status string. `None` when the
/// container defines no healthcheck.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerHealth {
  #[default]
  None,
  Starting,
  Healthy,
  Unhealthy,
}

/// A container as observed from the engine, with the derived
/// attributes docksmith cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
  /// Stable engine-assigned id.
  pub id: String,
  /// Unique name, leading `/` stripped.
  pub name: String,
  /// Image reference the container was created from.
  pub image: String,
  /// Engine image id (`sha256:…`).
  pub image_id: Option<String>,
  pub state: ContainerState,
  pub health: ContainerHealth,
  /// Raw `network_mode`, eg `service:vpn` or `container:<id>`.
  pub network_mode: Option<String>,
  pub labels: HashMap<String, String>,
  /// Compose project, or a manual mapping applied by config.
  pub stack: Option<String>,
  /// Compose service key.
  pub service: Option<String>,
}

impl ContainerInfo {
  pub fn label(&self, key: &str) -> Option<&String> {
    self.labels.get(key)
  }

  /// Compose project from labels. Manual mappings are applied by
  /// the engine adapter before this is read.
  pub fn compose_project(&self) -> Option<&String> {
    self.labels.get(compose_labels::PROJECT)
  }

  pub fn compose_service(&self) -> Option<&String> {
    self.labels.get(compose_labels::SERVICE)
  }

  /// First compose file recorded by compose for this project.
  pub fn compose_file(&self) -> Option<&str> {
    self
      .labels
      .get(compose_labels::CONFIG_FILES)
      .map(|files| {
        files.split(',').next().unwrap_or(files.as_str()).trim()
      })
  }

  pub fn is_ignored(&self) -> bool {
    label_truthy(self.labels.get(docksmith_labels::IGNORE))
  }

  pub fn allows_latest(&self) -> bool {
    label_truthy(self.labels.get(docksmith_labels::ALLOW_LATEST))
  }

  pub fn pre_update_check(&self) -> Option<&String> {
    self.labels.get(docksmith_labels::PRE_UPDATE_CHECK)
  }

  /// Names out of `docksmith.restart-after`, trimmed, empties
  /// dropped.
  pub fn restart_after(&self) -> Vec<String> {
    self
      .labels
      .get(docksmith_labels::RESTART_AFTER)
      .map(|value| {
        value
          .split(',')
          .map(str::trim)
          .filter(|name| !name.is_empty())
          .map(String::from)
          .collect()
      })
      .unwrap_or_default()
  }

  /// Service names out of the compose `depends_on` label. The label
  /// value is `svc:condition:restart` triples joined by commas; only
  /// the service name is relevant here.
  pub fn depends_on(&self) -> Vec<String> {
    self
      .labels
      .get(compose_labels::DEPENDS_ON)
      .map(|value| {
        value
          .split(',')
          .filter_map(|entry| {
            let name =
              entry.split(':').next().unwrap_or(entry).trim();
            (!name.is_empty()).then(|| name.to_string())
          })
          .collect()
      })
      .unwrap_or_default()
  }

  /// The dependency implied by `network_mode: service:X`, if any.
  pub fn network_mode_dependency(&self) -> Option<String> {
    self
      .network_mode
      .as_deref()
      .and_then(|mode| mode.strip_prefix("service:"))
      .map(String::from)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn container_with_labels(
    labels: &[(&str, &str)],
  ) -> ContainerInfo {
    ContainerInfo {
      name: String::from("web"),
      labels: labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
      ..Default::default()
    }
  }

  #[test]
  fn depends_on_strips_conditions() {
    let container = container_with_labels(&[(
      compose_labels::DEPENDS_ON,
      "db:service_started:false,cache:service_healthy:true",
    )]);
    assert_eq!(container.depends_on(), vec!["db", "cache"]);
  }

  #[test]
  fn restart_after_trims_and_drops_empty() {
    let container = container_with_labels(&[(
      docksmith_labels::RESTART_AFTER,
      "vpn, gateway,,",
    )]);
    assert_eq!(container.restart_after(), vec!["vpn", "gateway"]);
  }

  #[test]
  fn network_mode_service_dependency() {
    let mut container = container_with_labels(&[]);
    container.network_mode = Some(String::from("service:vpn"));
    assert_eq!(
      container.network_mode_dependency(),
      Some(String::from("vpn"))
    );
    container.network_mode = Some(String::from("bridge"));
    assert_eq!(container.network_mode_dependency(), None);
  }

  #[test]
  fn compose_file_takes_first_of_list() {
    let container = container_with_labels(&[(
      compose_labels::CONFIG_FILES,
      "/srv/stack/compose.yaml,/srv/stack/override.yaml",
    )]);
    assert_eq!(
      container.compose_file(),
      Some("/srv/stack/compose.yaml")
    );
  }
}
