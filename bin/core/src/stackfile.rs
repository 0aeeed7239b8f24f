//! Binding observed containers back to their compose
//! declarations.

use std::path::{Path, PathBuf};

use compose_edit::ServiceEditor;
use docksmith_client::entities::container::ContainerInfo;
use environment::EnvFile;

use crate::paths::PathTranslator;

/// The compose file path for a container, translated into this
/// process's namespace and resolved best-effort when the direct
/// translation does not exist.
pub fn compose_path(
  container: &ContainerInfo,
  translator: &PathTranslator,
) -> anyhow::Result<PathBuf> {
  let declared = container.compose_file().ok_or_else(|| {
    anyhow::anyhow!(
      "container {} carries no compose file label",
      container.name
    )
  })?;
  let declared = Path::new(declared);
  let translated = translator.to_container(declared);
  if translated.is_file() {
    return Ok(translated);
  }
  translator.resolve_unknown(declared).ok_or_else(|| {
    anyhow::anyhow!(
      "compose file {declared:?} not found (translated to {translated:?})"
    )
  })
}

/// Bind an editor for a container: by container name first, then
/// by its compose service key.
pub fn bind_editor(
  container: &ContainerInfo,
  translator: &PathTranslator,
) -> anyhow::Result<ServiceEditor> {
  let path = compose_path(container, translator)?;
  match ServiceEditor::bind(&path, &container.name) {
    Ok(editor) => Ok(editor),
    Err(by_name) => match &container.service {
      Some(service) => ServiceEditor::bind(&path, service)
        .map_err(|_| by_name),
      None => Err(by_name),
    },
  }
}

/// The `.env` file adjacent to a compose file.
pub fn adjacent_env_file(compose: &Path) -> PathBuf {
  compose
    .parent()
    .map(|dir| dir.join(".env"))
    .unwrap_or_else(|| PathBuf::from(".env"))
}

/// The image a compose file declares for a service, with env-var
/// expressions expanded against the process env and the adjacent
/// `.env` file.
pub fn declared_image(editor: &ServiceEditor) -> Option<String> {
  let raw = editor.image()?;
  if !raw.contains("${") {
    return Some(raw);
  }
  let env_path = adjacent_env_file(editor.path());
  let env_file = EnvFile::load(&env_path).ok();
  let expanded = environment::expand(&raw, |name| {
    std::env::var(name).ok().or_else(|| {
      env_file.as_ref().and_then(|file| file.get(name))
    })
  });
  Some(expanded)
}

#[cfg(test)]
mod tests {
  use super::*;
  use docksmith_client::entities::compose_labels;

  #[test]
  fn declared_image_expands_env_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let compose = dir.path().join("compose.yaml");
    std::fs::write(
      &compose,
      "services:\n  app:\n    image: ${APP_IMAGE:-ghcr.io/me/app:v1}\n",
    )
    .unwrap();
    let editor = ServiceEditor::bind(&compose, "app").unwrap();
    assert_eq!(
      declared_image(&editor).unwrap(),
      "ghcr.io/me/app:v1"
    );
  }

  #[test]
  fn declared_image_reads_adjacent_env_file() {
    let dir = tempfile::tempdir().unwrap();
    let compose = dir.path().join("compose.yaml");
    std::fs::write(
      &compose,
      "services:\n  app:\n    image: ${SOME_UNSET_IMAGE_VAR}\n",
    )
    .unwrap();
    std::fs::write(
      dir.path().join(".env"),
      "SOME_UNSET_IMAGE_VAR=app:v7\n",
    )
    .unwrap();
    let editor = ServiceEditor::bind(&compose, "app").unwrap();
    assert_eq!(declared_image(&editor).unwrap(), "app:v7");
  }

  #[test]
  fn compose_path_requires_label() {
    let container = ContainerInfo {
      name: String::from("web"),
      ..Default::default()
    };
    let translator = PathTranslator::default();
    assert!(compose_path(&container, &translator).is_err());

    let dir = tempfile::tempdir().unwrap();
    let compose = dir.path().join("compose.yaml");
    std::fs::write(&compose, "services: {}\n").unwrap();
    let mut container = container;
    container.labels.insert(
      compose_labels::CONFIG_FILES.to_string(),
      compose.to_string_lossy().into_owned(),
    );
    assert_eq!(
      compose_path(&container, &translator).unwrap(),
      compose
    );
  }
}
