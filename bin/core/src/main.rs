#[macro_use]
extern crate tracing;

use std::{sync::Arc, time::Duration};

use docksmith_core::{
  checker::Checker,
  config::core_config,
  orchestrator::Orchestrator,
  paths::PathTranslator,
  state::{self, Deps},
};
use engine::PruneTarget;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging)?;

  info!("Docksmith Core version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{:?}", config.sanitized());

  // Init database first to crash early on storage failure.
  state::db_client();
  let deps = state::deps();

  let translator =
    Arc::new(PathTranslator::detect(deps.engine.as_ref()).await);
  if !translator.is_identity() {
    info!("running containerized, path translation enabled");
  }

  let orchestrator =
    Orchestrator::new(deps.clone(), translator.clone());
  orchestrator.recover_on_startup().await;

  let checker = Checker::new(deps.clone(), translator);
  checker.spawn();
  spawn_prune_loop(deps.clone());

  info!("Docksmith Core running");
  tokio::signal::ctrl_c().await?;
  info!("shutting down");
  Ok(())
}

/// Config-gated maintenance: prune dangling images on an
/// interval.
fn spawn_prune_loop(deps: Arc<Deps>) {
  if !deps.config.prune_enabled {
    return;
  }
  tokio::spawn(async move {
    let period =
      Duration::from_secs(deps.config.prune_interval_secs.max(60));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(
      tokio::time::MissedTickBehavior::Delay,
    );
    // The first tick fires immediately; skip it so a restart loop
    // cannot turn into a prune loop.
    interval.tick().await;
    loop {
      interval.tick().await;
      match deps.engine.prune(PruneTarget::Images).await {
        Ok(result) => info!(
          deleted = result.items_deleted.len(),
          space_reclaimed = result.space_reclaimed,
          "image prune finished"
        ),
        Err(e) => error!("error in image prune | {e:#}"),
      }
    }
  });
}

#[tokio::main]
async fn main() {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )
  .expect("failed to create sigterm listener");

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => match res {
      Ok(Ok(())) => info!("app exited"),
      Ok(Err(e)) => error!("app exited with error | {e:#}"),
      Err(e) => error!("app task panicked | {e:#}"),
    },
    _ = term_signal.recv() => info!("sigterm received, exiting"),
  }
}
