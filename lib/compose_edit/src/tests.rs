use std::{fs, path::PathBuf};

use super::*;

const STACK: &str = r#"# media stack
services:
  web:
    container_name: web
    image: nginx:1.25.3 # pinned
    labels:
      - docksmith.allow-latest
      - "traefik.enable=true"
    depends_on:
      - db

  db:
    image: "postgres:16.1"
    labels:
      app.team: media
      app.tier: "backend"

volumes:
  data: {}
"#;

fn editor(target: &str) -> ServiceEditor {
  let file = ComposeFile::parse(
    PathBuf::from("/srv/stack/compose.yaml"),
    STACK,
  )
  .unwrap();
  ServiceEditor::from_file(file, target).unwrap()
}

#[test]
fn round_trip_without_edits_is_byte_identical() {
  let editor = editor("web");
  assert_eq!(editor.contents(), STACK);
}

#[test]
fn binds_container_name_before_service_key() {
  let source = "services:\n  a:\n    container_name: b\n  b:\n    image: x:1\n";
  let file = ComposeFile::parse(
    PathBuf::from("/srv/compose.yaml"),
    source,
  )
  .unwrap();
  // container_name wins over the service literally keyed `b`
  assert_eq!(file.bind_service("b").unwrap(), "a");
}

#[test]
fn set_image_tag_rewrites_only_the_tag() {
  let mut editor = editor("web");
  assert_eq!(
    editor.set_image_tag("1.25.4").unwrap(),
    TagEdit::Edited
  );
  let expected =
    STACK.replace("nginx:1.25.3 # pinned", "nginx:1.25.4 # pinned");
  assert_eq!(editor.contents(), expected);
}

#[test]
fn set_image_tag_preserves_quotes() {
  let mut editor = editor("db");
  editor.set_image_tag("16.2").unwrap();
  let expected = STACK.replace("\"postgres:16.1\"", "\"postgres:16.2\"");
  assert_eq!(editor.contents(), expected);
}

#[test]
fn set_image_tag_rewrites_env_default() {
  let source = "services:\n  app:\n    image: \"${APP_IMAGE:-ghcr.io/me/app:v1}\"\n";
  let file = ComposeFile::parse(
    PathBuf::from("/srv/compose.yaml"),
    source,
  )
  .unwrap();
  let mut editor = ServiceEditor::from_file(file, "app").unwrap();
  assert_eq!(editor.set_image_tag("v2").unwrap(), TagEdit::Edited);
  assert_eq!(
    editor.contents(),
    "services:\n  app:\n    image: \"${APP_IMAGE:-ghcr.io/me/app:v2}\"\n"
  );
}

#[test]
fn set_image_tag_reports_env_indirection() {
  let source = "services:\n  app:\n    image: ${APP_IMAGE}\n";
  let file = ComposeFile::parse(
    PathBuf::from("/srv/compose.yaml"),
    source,
  )
  .unwrap();
  let mut editor = ServiceEditor::from_file(file, "app").unwrap();
  assert_eq!(
    editor.set_image_tag("v2").unwrap(),
    TagEdit::NeedsEnvFile {
      var: String::from("APP_IMAGE")
    }
  );
  assert_eq!(editor.contents(), source);
}

#[test]
fn set_image_tag_keeps_registry_port() {
  let source =
    "services:\n  app:\n    image: registry.example.com:5000/myapp:v1\n";
  let file = ComposeFile::parse(
    PathBuf::from("/srv/compose.yaml"),
    source,
  )
  .unwrap();
  let mut editor = ServiceEditor::from_file(file, "app").unwrap();
  editor.set_image_tag("v2").unwrap();
  assert_eq!(
    editor.contents(),
    "services:\n  app:\n    image: registry.example.com:5000/myapp:v2\n"
  );
}

#[test]
fn set_label_replaces_sequence_item_preserving_quotes() {
  let mut editor = editor("web");
  editor.set_label("traefik.enable", "false").unwrap();
  let expected = STACK.replace(
    "\"traefik.enable=true\"",
    "\"traefik.enable=false\"",
  );
  assert_eq!(editor.contents(), expected);
}

#[test]
fn set_label_appends_sequence_item() {
  let mut editor = editor("web");
  editor.set_label("docksmith.tag-regex", "^1\\.").unwrap();
  assert!(editor.contents().contains(
    "      - docksmith.tag-regex=^1\\.\n"
  ));
  let labels = editor.labels();
  assert_eq!(labels.get("docksmith.tag-regex").unwrap(), "^1\\.");
}

#[test]
fn set_label_replaces_mapping_value_in_place() {
  let mut editor = editor("db");
  editor.set_label("app.team", "platform").unwrap();
  let expected = STACK.replace("app.team: media", "app.team: platform");
  assert_eq!(editor.contents(), expected);
}

#[test]
fn set_label_preserves_mapping_value_quotes() {
  let mut editor = editor("db");
  editor.set_label("app.tier", "frontend").unwrap();
  let expected =
    STACK.replace("app.tier: \"backend\"", "app.tier: \"frontend\"");
  assert_eq!(editor.contents(), expected);
}

#[test]
fn set_label_twice_is_byte_identical() {
  let mut editor = editor("web");
  editor.set_label("docksmith.ignore", "true").unwrap();
  let first = editor.contents();
  editor.set_label("docksmith.ignore", "true").unwrap();
  assert_eq!(editor.contents(), first);
}

#[test]
fn set_label_creates_sequence_node_by_default() {
  let source = "services:\n  app:\n    image: x:1\n";
  let file = ComposeFile::parse(
    PathBuf::from("/srv/compose.yaml"),
    source,
  )
  .unwrap();
  let mut editor = ServiceEditor::from_file(file, "app").unwrap();
  editor.set_label("docksmith.ignore", "true").unwrap();
  assert_eq!(
    editor.contents(),
    "services:\n  app:\n    image: x:1\n    labels:\n      - docksmith.ignore=true\n"
  );
}

#[test]
fn remove_label_is_idempotent() {
  let mut editor = editor("web");
  assert!(editor.remove_label("docksmith.allow-latest").unwrap());
  let after_first = editor.contents();
  assert!(!editor.remove_label("docksmith.allow-latest").unwrap());
  assert_eq!(editor.contents(), after_first);
  assert!(!after_first.contains("docksmith.allow-latest"));
}

#[test]
fn labels_reads_both_styles() {
  let web = editor("web").labels();
  assert_eq!(web.get("traefik.enable").unwrap(), "true");
  assert_eq!(web.get("docksmith.allow-latest").unwrap(), "");

  let db = editor("db").labels();
  assert_eq!(db.get("app.team").unwrap(), "media");
  assert_eq!(db.get("app.tier").unwrap(), "backend");
}

#[test]
fn missing_services_and_include_is_an_error() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("compose.yaml");
  fs::write(&path, "volumes:\n  data: {}\n").unwrap();
  let err = find_service_file(&path, "web").unwrap_err();
  assert!(err.to_string().contains("no services section"));
}

#[test]
fn include_graph_is_followed_with_extension_swap() {
  let dir = tempfile::tempdir().unwrap();
  let root = dir.path().join("compose.yaml");
  // Declared as .yml, exists as .yaml
  fs::write(
    &root,
    "include:\n  - path: stacks/media.yml\n",
  )
  .unwrap();
  fs::create_dir(dir.path().join("stacks")).unwrap();
  let child = dir.path().join("stacks/media.yaml");
  fs::write(
    &child,
    "services:\n  web:\n    container_name: web\n    image: nginx:1.25\n",
  )
  .unwrap();

  let (file, service) = find_service_file(&root, "web").unwrap();
  assert_eq!(file.path(), child.as_path());
  assert_eq!(service, "web");
}

#[test]
fn save_is_atomic_and_backup_is_timestamped_sibling() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("compose.yaml");
  fs::write(&path, STACK).unwrap();

  let mut editor = ServiceEditor::bind(&path, "web").unwrap();
  let backup = editor.backup(1722500000000).unwrap();
  assert_eq!(
    backup.file_name().unwrap().to_str().unwrap(),
    "compose.yaml.backup.1722500000000"
  );
  assert_eq!(fs::read_to_string(&backup).unwrap(), STACK);

  editor.set_image_tag("1.25.4").unwrap();
  editor.save().unwrap();
  let on_disk = fs::read_to_string(&path).unwrap();
  assert!(on_disk.contains("nginx:1.25.4 # pinned"));
  // restore == backup bytes
  fs::copy(&backup, &path).unwrap();
  assert_eq!(fs::read_to_string(&path).unwrap(), STACK);
}
