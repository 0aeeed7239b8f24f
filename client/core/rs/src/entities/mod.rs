use serde::{Deserialize, Serialize};

pub mod config;
pub mod container;
pub mod event;
pub mod operation;
pub mod update;

/// Compose labels docksmith reads to derive stack / service /
/// dependency information from observed containers.
pub mod compose_labels {
  pub const PROJECT: &str = "com.docker.compose.project";
  pub const SERVICE: &str = "com.docker.compose.service";
  pub const DEPENDS_ON: &str = "com.docker.compose.depends_on";
  pub const CONFIG_FILES: &str =
    "com.docker.compose.project.config_files";
  pub const WORKING_DIR: &str =
    "com.docker.compose.project.working_dir";
}

/// The `docksmith.` label namespace, consumed as per-container
/// configuration.
pub mod docksmith_labels {
  /// Exclude the container from discovery.
  pub const IGNORE: &str = "docksmith.ignore";
  /// Suppress the pinning recommendation for `:latest`.
  pub const ALLOW_LATEST: &str = "docksmith.allow-latest";
  /// Restrict candidate tags to the same major segment.
  pub const PIN_MAJOR: &str = "docksmith.version-pin-major";
  /// Restrict candidate tags to the same minor segment.
  pub const PIN_MINOR: &str = "docksmith.version-pin-minor";
  /// Restrict candidate tags to the same patch segment.
  pub const PIN_PATCH: &str = "docksmith.version-pin-patch";
  /// Restrict candidate tags by regex.
  pub const TAG_REGEX: &str = "docksmith.tag-regex";
  /// Path to a validator script run before cycling the container.
  pub const PRE_UPDATE_CHECK: &str = "docksmith.pre-update-check";
  /// Comma-separated names this container must restart after.
  pub const RESTART_AFTER: &str = "docksmith.restart-after";
}

/// Unix timestamp in milliseconds as i64
pub fn docksmith_timestamp() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

pub fn optional_string(string: impl Into<String>) -> Option<String> {
  let string = string.into();
  if string.is_empty() { None } else { Some(string) }
}

/// Truthy check for label values. A label present with no value
/// (sequence style `- docksmith.ignore`) counts as set.
pub fn label_truthy(value: Option<&String>) -> bool {
  match value {
    Some(value) => {
      let value = value.trim();
      value.is_empty()
        || value.eq_ignore_ascii_case("true")
        || value == "1"
        || value.eq_ignore_ascii_case("yes")
    }
    None => false,
  }
}

/// A parsed `registry/repository:tag` image reference.
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ImageRef {
  /// Empty for Docker Hub images.
  pub registry: String,
  pub repository: String,
  pub tag: String,
}

impl ImageRef {
  /// Parse an image reference. The tag is whatever follows the last
  /// `:` after the last `/`, so registries with ports
  /// (`host:5000/img:tag`) parse correctly. Missing tag defaults to
  /// `latest`.
  pub fn parse(reference: &str) -> ImageRef {
    let (name, tag) = match reference.rsplit_once(':') {
      Some((name, tag)) if !tag.contains('/') => {
        (name, tag.to_string())
      }
      _ => (reference, String::from("latest")),
    };
    let (registry, repository) = match name.split_once('/') {
      Some((first, rest))
        if first.contains('.')
          || first.contains(':')
          || first == "localhost" =>
      {
        (first.to_string(), rest.to_string())
      }
      _ => (String::new(), name.to_string()),
    };
    ImageRef {
      registry,
      repository,
      tag,
    }
  }

  /// The reference with a different tag, everything else unchanged.
  pub fn with_tag(&self, tag: impl Into<String>) -> ImageRef {
    ImageRef {
      registry: self.registry.clone(),
      repository: self.repository.clone(),
      tag: tag.into(),
    }
  }
}

impl std::fmt::Display for ImageRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.registry.is_empty() {
      write!(f, "{}:{}", self.repository, self.tag)
    } else {
      write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn image_ref_parses_registry_with_port() {
    let image =
      ImageRef::parse("registry.example.com:5000/myapp:v1");
    assert_eq!(image.registry, "registry.example.com:5000");
    assert_eq!(image.repository, "myapp");
    assert_eq!(image.tag, "v1");
    assert_eq!(
      image.to_string(),
      "registry.example.com:5000/myapp:v1"
    );
  }

  #[test]
  fn image_ref_defaults_tag_to_latest() {
    let image = ImageRef::parse("nginx");
    assert_eq!(image.registry, "");
    assert_eq!(image.repository, "nginx");
    assert_eq!(image.tag, "latest");
  }

  #[test]
  fn image_ref_parses_namespaced_hub_image() {
    let image = ImageRef::parse("linuxserver/radarr:5.2.6");
    assert_eq!(image.registry, "");
    assert_eq!(image.repository, "linuxserver/radarr");
    assert_eq!(image.tag, "5.2.6");
  }

  #[test]
  fn label_truthy_accepts_bare_and_true() {
    assert!(label_truthy(Some(&String::new())));
    assert!(label_truthy(Some(&String::from("true"))));
    assert!(label_truthy(Some(&String::from("1"))));
    assert!(!label_truthy(Some(&String::from("false"))));
    assert!(!label_truthy(None));
  }
}
