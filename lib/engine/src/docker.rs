use std::collections::HashMap;

use anyhow::{Context, anyhow};
use bollard::Docker;
use bollard::query_parameters::{
  InspectContainerOptions, ListContainersOptions,
};
use docksmith_client::entities::{
  compose_labels,
  container::{ContainerInfo, ContainerState},
};
use run_command::{CommandOutput, async_run_command};

use crate::{
  BindMount, ContainerEngine, ImageInspect, PruneResult,
  PruneTarget, version::parse_status_health,
};

/// Docker-backed engine. Reads use the engine API; mutations go
/// through the docker CLI.
pub struct DockerEngine {
  docker: Docker,
  /// Manual container -> stack mappings for containers without a
  /// compose project label.
  manual_stacks: HashMap<String, String>,
}

impl DockerEngine {
  pub fn connect(
    manual_stacks: HashMap<String, String>,
  ) -> anyhow::Result<DockerEngine> {
    let docker = Docker::connect_with_defaults()
      .context("failed to connect to docker daemon")?;
    Ok(DockerEngine {
      docker,
      manual_stacks,
    })
  }

  fn convert_summary(
    &self,
    container: bollard::secret::ContainerSummary,
  ) -> anyhow::Result<ContainerInfo> {
    let name = container
      .names
      .context("no names on container")?
      .pop()
      .context("no names on container (empty vec)")?
      .replace('/', "");
    let labels = container.labels.unwrap_or_default();
    let stack = labels
      .get(compose_labels::PROJECT)
      .cloned()
      .or_else(|| self.manual_stacks.get(&name).cloned());
    let service = labels.get(compose_labels::SERVICE).cloned();
    let status = container.status.unwrap_or_default();
    Ok(ContainerInfo {
      id: container.id.unwrap_or_default(),
      name,
      image: container.image.unwrap_or_default(),
      image_id: container.image_id,
      state: container
        .state
        .map(convert_summary_container_state)
        .unwrap_or_default(),
      health: parse_status_health(&status),
      network_mode: container
        .host_config
        .and_then(|config| config.network_mode),
      labels,
      stack,
      service,
    })
  }
}

/// Engine 5xx responses get exactly one retry before surfacing.
fn is_server_error(e: &bollard::errors::Error) -> bool {
  matches!(
    e,
    bollard::errors::Error::DockerResponseServerError {
      status_code,
      ..
    } if *status_code >= 500
  )
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<ContainerInfo>> {
    let options = ListContainersOptions {
      all: true,
      ..Default::default()
    };
    let containers = match self
      .docker
      .list_containers(Some(options.clone()))
      .await
    {
      Err(e) if is_server_error(&e) => {
        self.docker.list_containers(Some(options)).await?
      }
      other => other?,
    };
    let mut containers = containers
      .into_iter()
      .flat_map(|container| self.convert_summary(container))
      .collect::<Vec<_>>();
    let id_to_name = containers
      .iter()
      .map(|c| (c.id.clone(), c.name.clone()))
      .collect::<HashMap<_, _>>();
    // Rewrite `container:<id>` network modes to the service form
    // the dependency graph understands.
    containers.iter_mut().for_each(|container| {
      let Some(mode) = &container.network_mode else {
        return;
      };
      let Some(container_id) = mode.strip_prefix("container:")
      else {
        return;
      };
      container.network_mode = id_to_name
        .get(container_id)
        .map(|name| format!("service:{name}"));
    });
    Ok(containers)
  }

  async fn get_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerInfo> {
    let filters = HashMap::from([(
      String::from("name"),
      vec![format!("^/{name}$")],
    )]);
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        filters: Some(filters),
        ..Default::default()
      }))
      .await?;
    // The name filter is substring-happy even when anchored;
    // verify the exact match client-side.
    containers
      .into_iter()
      .flat_map(|container| self.convert_summary(container))
      .find(|container| container.name == name)
      .with_context(|| format!("no container named {name}"))
  }

  async fn inspect_image(
    &self,
    image: &str,
  ) -> anyhow::Result<ImageInspect> {
    let image = match self.docker.inspect_image(image).await {
      Err(e) if is_server_error(&e) => {
        self.docker.inspect_image(image).await?
      }
      other => other?,
    };
    Ok(ImageInspect {
      id: image.id,
      repo_digests: image.repo_digests.unwrap_or_default(),
      labels: image
        .config
        .and_then(|config| config.labels)
        .unwrap_or_default(),
      architecture: image.architecture,
    })
  }

  async fn pull(&self, image: &str) -> anyhow::Result<()> {
    run_docker(&format!("docker pull {image}"))
      .await
      .with_context(|| format!("failed to pull {image}"))?;
    Ok(())
  }

  async fn stop(
    &self,
    name: &str,
    timeout: Option<i32>,
  ) -> anyhow::Result<()> {
    let time = timeout
      .map(|time| format!(" --time {time}"))
      .unwrap_or_default();
    run_docker(&format!("docker stop{time} {name}"))
      .await
      .with_context(|| format!("failed to stop {name}"))?;
    Ok(())
  }

  async fn start(&self, name: &str) -> anyhow::Result<()> {
    run_docker(&format!("docker start {name}"))
      .await
      .with_context(|| format!("failed to start {name}"))?;
    Ok(())
  }

  async fn restart(
    &self,
    name: &str,
    timeout: Option<i32>,
  ) -> anyhow::Result<()> {
    let time = timeout
      .map(|time| format!(" --time {time}"))
      .unwrap_or_default();
    run_docker(&format!("docker restart{time} {name}"))
      .await
      .with_context(|| format!("failed to restart {name}"))?;
    Ok(())
  }

  async fn remove(
    &self,
    name: &str,
    force: bool,
    volumes: bool,
  ) -> anyhow::Result<()> {
    let force = if force { " --force" } else { "" };
    let volumes = if volumes { " --volumes" } else { "" };
    run_docker(&format!("docker rm{force}{volumes} {name}"))
      .await
      .with_context(|| format!("failed to remove {name}"))?;
    Ok(())
  }

  async fn container_mounts(
    &self,
    name: &str,
  ) -> anyhow::Result<Vec<BindMount>> {
    let container = self
      .docker
      .inspect_container(
        name,
        InspectContainerOptions { size: false }.into(),
      )
      .await?;
    Ok(
      container
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter(|mount| {
          matches!(
            mount.typ,
            Some(bollard::secret::MountPointTypeEnum::BIND)
          )
        })
        .filter_map(|mount| {
          Some(BindMount {
            source: mount.source?,
            destination: mount.destination?,
          })
        })
        .collect(),
    )
  }

  async fn prune(
    &self,
    target: PruneTarget,
  ) -> anyhow::Result<PruneResult> {
    let command = match target {
      PruneTarget::Containers => "docker container prune -f",
      PruneTarget::Images => "docker image prune -f",
      PruneTarget::Networks => "docker network prune -f",
      PruneTarget::Volumes => "docker volume prune -f",
      PruneTarget::System => "docker system prune -f",
    };
    let output = run_docker(command).await?;
    Ok(parse_prune_output(&output.stdout))
  }
}

/// Run a docker CLI command, turning a failure into an error whose
/// context chain is the command's output.
async fn run_docker(
  command: &str,
) -> anyhow::Result<CommandOutput> {
  let log = async_run_command(command).await;
  if log.success() {
    return Ok(log);
  }
  let mut e = anyhow!("End of trace");
  for line in
    log.stderr.split('\n').filter(|line| !line.is_empty()).rev()
  {
    e = e.context(line.to_string());
  }
  for line in
    log.stdout.split('\n').filter(|line| !line.is_empty()).rev()
  {
    e = e.context(line.to_string());
  }
  Err(e.context(format!("command failed: {command}")))
}

fn convert_summary_container_state(
  state: bollard::secret::ContainerSummaryStateEnum,
) -> ContainerState {
  use bollard::secret::ContainerSummaryStateEnum::*;
  match state {
    EMPTY | CREATED => ContainerState::Created,
    RUNNING => ContainerState::Running,
    PAUSED => ContainerState::Paused,
    RESTARTING => ContainerState::Restarting,
    REMOVING => ContainerState::Removing,
    EXITED => ContainerState::Exited,
    DEAD => ContainerState::Dead,
  }
}

fn parse_prune_output(stdout: &str) -> PruneResult {
  let mut result = PruneResult::default();
  for line in stdout.lines() {
    let line = line.trim();
    if line.is_empty() || line.ends_with(':') {
      continue;
    }
    if let Some(size) =
      line.strip_prefix("Total reclaimed space: ")
    {
      result.space_reclaimed = parse_size(size.trim());
      continue;
    }
    let item = line
      .strip_prefix("deleted: ")
      .or_else(|| line.strip_prefix("untagged: "))
      .unwrap_or(line);
    result.items_deleted.push(item.to_string());
  }
  result
}

/// `1.5GB` / `120MB` / `3.2kB` / `0B` -> bytes, docker's decimal
/// units.
fn parse_size(size: &str) -> u64 {
  let split = size
    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
    .unwrap_or(size.len());
  let (number, unit) = size.split_at(split);
  let number: f64 = number.parse().unwrap_or(0.0);
  let multiplier = match unit.trim() {
    "B" | "" => 1.0,
    "kB" | "KB" => 1e3,
    "MB" => 1e6,
    "GB" => 1e9,
    "TB" => 1e12,
    _ => 1.0,
  };
  (number * multiplier) as u64
}
