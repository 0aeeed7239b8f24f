//! Best-effort version probes from image labels and engine status
//! strings.

use std::collections::HashMap;

use docksmith_client::entities::container::ContainerHealth;

/// Labels consulted for a version string, in priority order.
const VERSION_LABELS: &[&str] = &[
  "org.opencontainers.image.version",
  "org.label-schema.version",
  "version",
  "app_version",
  "build_version",
];

/// Best-effort version from a priority-ordered label list, with a
/// special case for LinuxServer's
/// `Linuxserver.io version:- X Build-date:- …` format.
pub fn version_from_labels(
  labels: &HashMap<String, String>,
) -> Option<String> {
  for key in VERSION_LABELS {
    let Some(value) = labels.get(*key) else {
      continue;
    };
    let value = value.trim();
    if value.is_empty() {
      continue;
    }
    if let Some(version) = parse_linuxserver_build_version(value) {
      return Some(version);
    }
    return Some(value.to_string());
  }
  None
}

/// `… version:- 4.0.9-ls97 Build-date:- 2024-…` -> `4.0.9-ls97`
fn parse_linuxserver_build_version(value: &str) -> Option<String> {
  let rest = value.split("version:- ").nth(1)?;
  let version = rest.split_whitespace().next()?;
  (!version.is_empty()).then(|| version.to_string())
}

/// Health derived from an engine status string like
/// `Up 3 hours (healthy)` or `Up 2 minutes (health: starting)`.
pub fn parse_status_health(status: &str) -> ContainerHealth {
  if status.contains("(healthy)") {
    ContainerHealth::Healthy
  } else if status.contains("(unhealthy)") {
    ContainerHealth::Unhealthy
  } else if status.contains("(health: starting)") {
    ContainerHealth::Starting
  } else {
    ContainerHealth::None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn opencontainers_label_wins() {
    let labels = labels(&[
      ("org.opencontainers.image.version", "1.25.3"),
      ("build_version", "Linuxserver.io version:- 9.9.9 Build-date:- x"),
    ]);
    assert_eq!(
      version_from_labels(&labels).as_deref(),
      Some("1.25.3")
    );
  }

  #[test]
  fn linuxserver_build_version_is_parsed() {
    let labels = labels(&[(
      "build_version",
      "Linuxserver.io version:- 4.0.9-ls97 Build-date:- 2024-05-01T10:00:00+00:00",
    )]);
    assert_eq!(
      version_from_labels(&labels).as_deref(),
      Some("4.0.9-ls97")
    );
  }

  #[test]
  fn missing_labels_give_none() {
    assert_eq!(version_from_labels(&labels(&[])), None);
  }

  #[test]
  fn health_from_status_string() {
    assert_eq!(
      parse_status_health("Up 3 hours (healthy)"),
      ContainerHealth::Healthy
    );
    assert_eq!(
      parse_status_health("Up 10 seconds (health: starting)"),
      ContainerHealth::Starting
    );
    assert_eq!(
      parse_status_health("Up 2 minutes (unhealthy)"),
      ContainerHealth::Unhealthy
    );
    assert_eq!(
      parse_status_health("Exited (0) 2 hours ago"),
      ContainerHealth::None
    );
  }
}
