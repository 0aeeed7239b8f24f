//! # Background Checker
//!
//! Periodic and on-demand discovery: enumerate containers,
//! resolve current vs latest versions (through the version
//! cache), derive a per-container status, persist the pass as one
//! `check_history` batch, and publish progress events. An
//! in-flight check is advertised on the cached snapshot;
//! on-demand triggers coalesce with it.

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use arc_swap::ArcSwap;
use docksmith_client::entities::{
  ImageRef,
  container::ContainerInfo,
  docksmith_timestamp,
  event::{Event, topics},
  update::{
    ChangeKind, ContainerCheck, DiscoveryResult, UpdateStatus,
  },
};
use versioning::{SelectionPolicy, TagKind};

use crate::{
  orchestrator::run::selection_policy, paths::PathTranslator,
  stackfile, state::Deps,
};

pub struct Checker {
  deps: Arc<Deps>,
  translator: Arc<PathTranslator>,
  result: ArcSwap<DiscoveryResult>,
  in_flight: AtomicBool,
}

impl Checker {
  pub fn new(
    deps: Arc<Deps>,
    translator: Arc<PathTranslator>,
  ) -> Arc<Checker> {
    Arc::new(Checker {
      deps,
      translator,
      result: ArcSwap::from_pointee(DiscoveryResult::default()),
      in_flight: AtomicBool::new(false),
    })
  }

  /// The latest discovery snapshot.
  pub fn snapshot(&self) -> Arc<DiscoveryResult> {
    self.result.load_full()
  }

  /// Spawn the interval loop.
  pub fn spawn(self: &Arc<Self>) {
    let checker = self.clone();
    tokio::spawn(async move {
      let period = Duration::from_secs(
        checker.deps.config.poll_interval_secs.max(1),
      );
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Delay,
      );
      loop {
        interval.tick().await;
        checker.run_check().await;
      }
    });
  }

  /// On-demand check. Coalesces with an in-flight run instead of
  /// starting a second one.
  pub async fn trigger(&self) {
    self.run_check().await;
  }

  async fn run_check(&self) {
    if self.in_flight.swap(true, Ordering::SeqCst) {
      debug!("check already in flight, coalescing");
      return;
    }
    let previous = self.result.load_full();
    self.result.store(Arc::new(DiscoveryResult {
      containers: previous.containers.clone(),
      checking: true,
      last_check: previous.last_check,
    }));

    let outcome = self.check_all(&previous).await;
    let now = docksmith_timestamp();
    match outcome {
      Ok(containers) => {
        if let Err(e) =
          self.deps.db.insert_check_batch(&containers)
        {
          error!("failed to persist check batch | {e}");
        }
        self.result.store(Arc::new(DiscoveryResult {
          containers,
          checking: false,
          last_check: Some(now),
        }));
      }
      Err(e) => {
        error!("discovery pass failed | {e:#}");
        self.result.store(Arc::new(DiscoveryResult {
          containers: previous.containers.clone(),
          checking: false,
          last_check: previous.last_check,
        }));
      }
    }
    self.in_flight.store(false, Ordering::SeqCst);
  }

  async fn check_all(
    &self,
    previous: &DiscoveryResult,
  ) -> anyhow::Result<Vec<ContainerCheck>> {
    let containers = self.deps.engine.list_containers().await?;
    let total = containers.len();
    let mut checks = Vec::with_capacity(total);
    for (done, container) in containers.into_iter().enumerate() {
      let check = self.check_container(&container).await;
      self.deps.bus.publish(
        Event::new(topics::CHECK_PROGRESS)
          .with("completed", (done + 1) as i64)
          .with("total", total as i64)
          .with("container_name", container.name.clone()),
      );
      let prior = previous
        .containers
        .iter()
        .find(|prior| prior.container_name == check.container_name);
      let changed = prior.is_none_or(|prior| {
        prior.status != check.status
          || prior.latest_version != check.latest_version
      });
      if changed {
        self.deps.bus.publish(
          Event::new(topics::CONTAINER_UPDATED)
            .with("container_name", check.container_name.clone())
            .with("status", check.status.to_string())
            .with(
              "latest_version",
              check.latest_version.clone().unwrap_or_default(),
            )
            .with("change_kind", check.change_kind.to_string()),
        );
      }
      checks.push(check);
    }
    Ok(checks)
  }

  async fn check_container(
    &self,
    container: &ContainerInfo,
  ) -> ContainerCheck {
    let current_ref = ImageRef::parse(&container.image);
    let mut check = ContainerCheck {
      container_name: container.name.clone(),
      stack: container.stack.clone(),
      image: container.image.clone(),
      current_version: current_ref.tag.clone(),
      checked_at: docksmith_timestamp(),
      ..Default::default()
    };

    let assignment = self
      .deps
      .db
      .script_assignment(&container.name)
      .ok()
      .flatten();
    let ignored = container.is_ignored()
      || assignment
        .as_ref()
        .is_some_and(|assignment| assignment.ignore);
    if ignored {
      check.status = UpdateStatus::Ignored;
      return check;
    }

    let inspect =
      match self.deps.engine.inspect_image(&container.image).await
      {
        Ok(inspect) => inspect,
        Err(e) => {
          debug!(
            container = %container.name,
            "image inspect failed | {e:#}"
          );
          check.status = UpdateStatus::CheckFailed;
          return check;
        }
      };
    if inspect.is_local() {
      check.status = UpdateStatus::LocalImage;
      return check;
    }
    let digest = inspect.digest().unwrap_or_default();
    let arch = inspect.architecture.clone().unwrap_or_default();
    check.current_digest = Some(digest.clone());

    // The compose declaration is authoritative; flag drift before
    // looking for updates.
    if let Some(declared) = self.declared_image(container) {
      if declared != container.image {
        check.status = UpdateStatus::ComposeMismatch;
        check.latest_version =
          Some(ImageRef::parse(&declared).tag);
        return check;
      }
    }

    let parsed = versioning::parse(&current_ref.tag);
    match parsed.kind {
      TagKind::Meta => {
        self
          .check_meta_tag(container, &current_ref, assignment, &digest, &mut check)
          .await;
      }
      TagKind::Semantic | TagKind::Date => {
        self
          .check_versioned_tag(
            container,
            &current_ref,
            &parsed,
            &digest,
            &arch,
            &mut check,
          )
          .await;
      }
      TagKind::Hash | TagKind::Unknown => {
        check.status = UpdateStatus::Unknown;
      }
    }
    check
  }

  /// Meta tags (`latest`, …): a digest difference is a rebuild;
  /// otherwise recommend pinning unless the container opts out.
  async fn check_meta_tag(
    &self,
    container: &ContainerInfo,
    current_ref: &ImageRef,
    assignment: Option<
      docksmith_client::entities::operation::ScriptAssignment,
    >,
    local_digest: &str,
    check: &mut ContainerCheck,
  ) {
    match self.deps.registry.head_manifest(current_ref).await {
      Ok(remote_digest) => {
        if remote_digest != local_digest {
          // Same tag, different content: informational rebuild.
          check.status = UpdateStatus::UpdateAvailable;
          check.change_kind = ChangeKind::NoChange;
          check.latest_version = Some(current_ref.tag.clone());
        } else {
          let allows_latest = container.allows_latest()
            || assignment
              .is_some_and(|assignment| assignment.allow_latest);
          check.status = if allows_latest {
            UpdateStatus::UpToDate
          } else {
            UpdateStatus::UpToDatePinnable
          };
          check.change_kind = ChangeKind::NoChange;
        }
      }
      Err(e) => {
        debug!(
          container = %container.name,
          "manifest probe failed | {e}"
        );
        check.status = UpdateStatus::CheckFailed;
      }
    }
  }

  async fn check_versioned_tag(
    &self,
    container: &ContainerInfo,
    current_ref: &ImageRef,
    parsed: &versioning::ParsedTag,
    digest: &str,
    arch: &str,
    check: &mut ContainerCheck,
  ) {
    let image_key = current_ref.to_string();
    let ttl = self.deps.config.version_cache_ttl_secs;
    let cached = self
      .deps
      .db
      .cached_version(digest, &image_key, arch, ttl)
      .ok()
      .flatten();
    let latest = match cached {
      Some(latest) => latest,
      None => {
        let tags = match registry::list_tags_with_retry(
          self.deps.registry.as_ref(),
          current_ref,
          self.deps.config.registry_max_retries,
        )
        .await
        {
          Ok(tags) => tags,
          Err(e) => {
            debug!(
              container = %container.name,
              "tag listing failed | {e}"
            );
            check.status = UpdateStatus::CheckFailed;
            return;
          }
        };
        if tags.is_empty() {
          check.status = UpdateStatus::MetadataUnavailable;
          return;
        }
        let policy = match selection_policy(container) {
          Ok(policy) => policy,
          Err(_) => {
            check.status = UpdateStatus::CheckFailed;
            return;
          }
        };
        let restricted =
          versioning::select_candidate(parsed, &tags, &policy);
        let resolved = match restricted {
          Some(selected) => selected.tag,
          None => {
            // Would an unrestricted pass have found something?
            let open = versioning::select_candidate(
              parsed,
              &tags,
              &SelectionPolicy::default(),
            );
            match open {
              Some(selected) => {
                check.status =
                  UpdateStatus::UpdateAvailableBlocked;
                check.latest_version = Some(selected.tag);
                check.change_kind = ChangeKind::Unknown;
                return;
              }
              None => parsed.raw.clone(),
            }
          }
        };
        let _ = self.deps.db.cache_version(
          digest,
          &image_key,
          arch,
          &resolved,
        );
        resolved
      }
    };
    let latest_parsed = versioning::parse(&latest);
    let change = versioning::change_kind(parsed, &latest_parsed);
    check.change_kind = change;
    if latest != parsed.raw && change != ChangeKind::NoChange {
      check.status = UpdateStatus::UpdateAvailable;
      check.latest_version = Some(latest);
    } else {
      check.status = UpdateStatus::UpToDate;
    }
  }

  fn declared_image(
    &self,
    container: &ContainerInfo,
  ) -> Option<String> {
    let editor =
      stackfile::bind_editor(container, &self.translator).ok()?;
    stackfile::declared_image(&editor)
  }
}
