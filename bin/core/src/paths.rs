//! Host / container path translation.
//!
//! When the process runs inside a container, compose file paths
//! read from engine labels are host paths. The translator builds a
//! prefix map from the process's own bind mounts and applies
//! longest-prefix matching in both directions.

use std::path::{Path, PathBuf};

use engine::{BindMount, ContainerEngine};

/// Marker docker places in every container filesystem.
const CONTAINER_MARKER: &str = "/.dockerenv";

#[derive(Debug, Default)]
pub struct PathTranslator {
  /// (host_prefix, container_prefix), longest container prefix
  /// first.
  mounts: Vec<BindMount>,
}

impl PathTranslator {
  /// Detect containerization and build the mount map from the
  /// process's own container. Outside a container this is an
  /// identity translator.
  pub async fn detect(
    engine: &dyn ContainerEngine,
  ) -> PathTranslator {
    if !Path::new(CONTAINER_MARKER).exists() {
      return PathTranslator::default();
    }
    // The container id doubles as the default hostname.
    let Ok(hostname) = std::env::var("HOSTNAME") else {
      return PathTranslator::default();
    };
    match engine.container_mounts(&hostname).await {
      Ok(mounts) => PathTranslator::from_mounts(mounts),
      Err(e) => {
        warn!(
          "failed to inspect own container mounts, path \
           translation disabled | {e:#}"
        );
        PathTranslator::default()
      }
    }
  }

  pub fn from_mounts(
    mut mounts: Vec<BindMount>,
  ) -> PathTranslator {
    mounts
      .sort_by_key(|mount| std::cmp::Reverse(mount.source.len()));
    PathTranslator { mounts }
  }

  pub fn is_identity(&self) -> bool {
    self.mounts.is_empty()
  }

  /// Host path -> path visible to this process. Longest-prefix
  /// match; unknown paths pass through unchanged.
  pub fn to_container(&self, path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    for mount in &self.mounts {
      if let Some(rest) = strip_path_prefix(&text, &mount.source) {
        return PathBuf::from(format!(
          "{}{rest}",
          mount.destination
        ));
      }
    }
    path.to_path_buf()
  }

  /// Path visible to this process -> host path.
  pub fn to_host(&self, path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    let mut best: Option<(&BindMount, &str)> = None;
    for mount in &self.mounts {
      if let Some(rest) =
        strip_path_prefix(&text, &mount.destination)
      {
        let better = match best {
          Some((current, _)) => {
            mount.destination.len() > current.destination.len()
          }
          None => true,
        };
        if better {
          best = Some((mount, rest));
        }
      }
    }
    match best {
      Some((mount, rest)) => {
        PathBuf::from(format!("{}{rest}", mount.source))
      }
      None => path.to_path_buf(),
    }
  }

  /// Best-effort resolution of a path that matches no mount:
  /// progressively strip leading components and test each against
  /// the known mount destinations, toggling `.yml` / `.yaml`.
  pub fn resolve_unknown(&self, path: &Path) -> Option<PathBuf> {
    let translated = self.to_container(path);
    for candidate in extension_variants(&translated) {
      if candidate.is_file() {
        return Some(candidate);
      }
    }
    let components: Vec<String> = path
      .components()
      .filter_map(|component| match component {
        std::path::Component::Normal(part) => {
          Some(part.to_string_lossy().into_owned())
        }
        _ => None,
      })
      .collect();
    for skip in 1..components.len() {
      let tail = components[skip..].join("/");
      for mount in &self.mounts {
        let candidate =
          PathBuf::from(format!("{}/{tail}", mount.destination));
        for candidate in extension_variants(&candidate) {
          if candidate.is_file() {
            return Some(candidate);
          }
        }
      }
    }
    None
  }
}

/// Prefix strip respecting path component boundaries.
fn strip_path_prefix<'a>(
  path: &'a str,
  prefix: &str,
) -> Option<&'a str> {
  let rest = path.strip_prefix(prefix)?;
  (rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'))
    .then_some(rest)
}

fn extension_variants(path: &Path) -> Vec<PathBuf> {
  let mut variants = vec![path.to_path_buf()];
  match path.extension().and_then(|e| e.to_str()) {
    Some("yml") => variants.push(path.with_extension("yaml")),
    Some("yaml") => variants.push(path.with_extension("yml")),
    _ => {}
  }
  variants
}

#[cfg(test)]
mod tests {
  use super::*;

  fn translator() -> PathTranslator {
    PathTranslator::from_mounts(vec![
      BindMount {
        source: String::from("/srv/compose"),
        destination: String::from("/data"),
      },
      BindMount {
        source: String::from("/srv/compose/media"),
        destination: String::from("/media"),
      },
    ])
  }

  #[test]
  fn to_container_uses_longest_prefix() {
    let translator = translator();
    assert_eq!(
      translator
        .to_container(Path::new("/srv/compose/media/stack.yaml")),
      PathBuf::from("/media/stack.yaml")
    );
    assert_eq!(
      translator.to_container(Path::new("/srv/compose/a.yaml")),
      PathBuf::from("/data/a.yaml")
    );
    // Component boundary: /srv/composer is not under /srv/compose
    assert_eq!(
      translator.to_container(Path::new("/srv/composer/x.yaml")),
      PathBuf::from("/srv/composer/x.yaml")
    );
  }

  #[test]
  fn to_host_reverses_the_mapping() {
    let translator = translator();
    assert_eq!(
      translator.to_host(Path::new("/media/stack.yaml")),
      PathBuf::from("/srv/compose/media/stack.yaml")
    );
    assert_eq!(
      translator.to_host(Path::new("/elsewhere/x")),
      PathBuf::from("/elsewhere/x")
    );
  }

  #[test]
  fn identity_outside_container() {
    let translator = PathTranslator::default();
    assert!(translator.is_identity());
    assert_eq!(
      translator.to_container(Path::new("/srv/x.yaml")),
      PathBuf::from("/srv/x.yaml")
    );
  }

  #[test]
  fn resolve_unknown_strips_components_and_toggles_extension() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stack.yaml");
    std::fs::write(&file, "services: {}\n").unwrap();
    let translator = PathTranslator::from_mounts(vec![BindMount {
      source: String::from("/mnt/user/appdata"),
      destination: dir.path().to_string_lossy().into_owned(),
    }]);
    // Unknown host root, declared with the other extension.
    let resolved = translator
      .resolve_unknown(Path::new("/volume1/docker/stack.yml"))
      .unwrap();
    assert_eq!(resolved, file);
  }
}
