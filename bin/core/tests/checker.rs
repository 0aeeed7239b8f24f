//! Discovery passes over the in-memory engine and registry.

mod common;

use std::sync::Arc;

use common::*;
use docksmith_client::entities::{
  docksmith_labels,
  update::{ChangeKind, UpdateStatus},
};
use docksmith_core::{checker::Checker, paths::PathTranslator};

fn checker_for(h: &Harness) -> Arc<Checker> {
  Checker::new(h.deps.clone(), Arc::new(PathTranslator::default()))
}

fn find<'a>(
  snapshot: &'a docksmith_client::entities::update::DiscoveryResult,
  name: &str,
) -> &'a docksmith_client::entities::update::ContainerCheck {
  snapshot
    .containers
    .iter()
    .find(|check| check.container_name == name)
    .unwrap_or_else(|| panic!("no check for {name}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_derives_statuses() {
  let h = harness();
  let dir = tempfile::tempdir().unwrap();
  let compose = write_compose(
    dir.path(),
    concat!(
      "services:\n",
      "  web:\n",
      "    container_name: web\n",
      "    image: nginx:1.25.3\n",
      "  caddy:\n",
      "    container_name: caddy\n",
      "    image: caddy:latest\n",
      "  pinned:\n",
      "    container_name: pinned\n",
      "    image: app:1.0.0\n",
      "  drifted:\n",
      "    container_name: drifted\n",
      "    image: img:2.0.0\n",
      "  orphan:\n",
      "    container_name: orphan\n",
      "    image: ghost:3.0.0\n",
    ),
  );

  // Patch available.
  h.engine.add_container(container(
    "web",
    "nginx:1.25.3",
    "media",
    &compose,
    &[],
  ));
  h.registry.set_tags("nginx", &["1.25.3", "1.25.4"]);

  // Tracking latest, digest unchanged, no opt-out: pinnable.
  h.engine.add_container(container(
    "caddy",
    "caddy:latest",
    "media",
    &compose,
    &[],
  ));
  h.registry.manifests.lock().unwrap().insert(
    String::from("caddy:latest"),
    String::from("sha256:digest-caddy:latest"),
  );

  // A newer tag exists but the regex gate blocks it.
  h.engine.add_container(container(
    "pinned",
    "app:1.0.0",
    "media",
    &compose,
    &[(docksmith_labels::TAG_REGEX, "^9\\.")],
  ));
  h.registry.set_tags("app", &["1.0.0", "2.0.0"]);

  // Running image differs from the compose declaration.
  h.engine.add_container(container(
    "drifted",
    "img:1.0.0",
    "media",
    &compose,
    &[],
  ));

  // Registry has no tags at all.
  h.engine.add_container(container(
    "orphan",
    "ghost:3.0.0",
    "media",
    &compose,
    &[],
  ));

  // Ignored by label.
  h.engine.add_container(container(
    "hidden",
    "secret:1.0.0",
    "media",
    &compose,
    &[(docksmith_labels::IGNORE, "true")],
  ));

  let checker = checker_for(&h);
  checker.trigger().await;
  let snapshot = checker.snapshot();
  assert!(!snapshot.checking);
  assert!(snapshot.last_check.is_some());

  let web = find(&snapshot, "web");
  assert_eq!(web.status, UpdateStatus::UpdateAvailable);
  assert_eq!(web.latest_version.as_deref(), Some("1.25.4"));
  assert_eq!(web.change_kind, ChangeKind::Patch);

  let caddy = find(&snapshot, "caddy");
  assert_eq!(caddy.status, UpdateStatus::UpToDatePinnable);

  let pinned = find(&snapshot, "pinned");
  assert_eq!(
    pinned.status,
    UpdateStatus::UpdateAvailableBlocked
  );
  assert_eq!(pinned.latest_version.as_deref(), Some("2.0.0"));

  let drifted = find(&snapshot, "drifted");
  assert_eq!(drifted.status, UpdateStatus::ComposeMismatch);
  assert_eq!(drifted.latest_version.as_deref(), Some("2.0.0"));

  let orphan = find(&snapshot, "orphan");
  assert_eq!(
    orphan.status,
    UpdateStatus::MetadataUnavailable
  );

  let hidden = find(&snapshot, "hidden");
  assert_eq!(hidden.status, UpdateStatus::Ignored);

  // The pass was persisted as one check_history batch.
  let history = h.deps.db.recent_checks("web", 5).unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(
    history[0].status,
    UpdateStatus::UpdateAvailable
  );
}

#[tokio::test(flavor = "multi_thread")]
async fn allow_latest_suppresses_pinning_recommendation() {
  let h = harness();
  let dir = tempfile::tempdir().unwrap();
  let compose = write_compose(
    dir.path(),
    "services:\n  caddy:\n    container_name: caddy\n    image: caddy:latest\n",
  );
  h.engine.add_container(container(
    "caddy",
    "caddy:latest",
    "media",
    &compose,
    &[(docksmith_labels::ALLOW_LATEST, "true")],
  ));
  h.registry.manifests.lock().unwrap().insert(
    String::from("caddy:latest"),
    String::from("sha256:digest-caddy:latest"),
  );

  let checker = checker_for(&h);
  checker.trigger().await;
  let snapshot = checker.snapshot();
  assert_eq!(
    find(&snapshot, "caddy").status,
    UpdateStatus::UpToDate
  );
}

#[tokio::test(flavor = "multi_thread")]
async fn meta_tag_rebuild_is_reported_as_informational() {
  let h = harness();
  let dir = tempfile::tempdir().unwrap();
  let compose = write_compose(
    dir.path(),
    "services:\n  caddy:\n    container_name: caddy\n    image: caddy:latest\n",
  );
  h.engine.add_container(container(
    "caddy",
    "caddy:latest",
    "media",
    &compose,
    &[],
  ));
  // Remote digest moved on under the same tag.
  h.registry.manifests.lock().unwrap().insert(
    String::from("caddy:latest"),
    String::from("sha256:rebuilt"),
  );

  let checker = checker_for(&h);
  checker.trigger().await;
  let snapshot = checker.snapshot();
  let caddy = find(&snapshot, "caddy");
  assert_eq!(caddy.status, UpdateStatus::UpdateAvailable);
  // Same version, different digest: a rebuild, not a version
  // change.
  assert_eq!(caddy.change_kind, ChangeKind::NoChange);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_pass_hits_the_version_cache() {
  let h = harness();
  let dir = tempfile::tempdir().unwrap();
  let compose = write_compose(
    dir.path(),
    "services:\n  web:\n    container_name: web\n    image: nginx:1.25.3\n",
  );
  h.engine.add_container(container(
    "web",
    "nginx:1.25.3",
    "media",
    &compose,
    &[],
  ));
  h.registry.set_tags("nginx", &["1.25.3", "1.25.4"]);

  let checker = checker_for(&h);
  checker.trigger().await;
  // Remove the registry data; the cached resolution must carry
  // the second pass.
  h.registry.set_tags("nginx", &[]);
  checker.trigger().await;

  let snapshot = checker.snapshot();
  let web = find(&snapshot, "web");
  assert_eq!(web.status, UpdateStatus::UpdateAvailable);
  assert_eq!(web.latest_version.as_deref(), Some("1.25.4"));
}
