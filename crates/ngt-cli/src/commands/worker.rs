//! `ngt worker jobs|orders`: long-running worker processes.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use ngt_config::WorkerSettings;
use ngt_execution::VenueClient;
use ngt_runtime::{
    shutdown_channel, spawn_signal_listener, JobContext, JobEngine, JobRegistry, OrderManager,
};
use ngt_schemas::WorkerKind;

use super::load_settings;

#[derive(Args, Clone)]
pub struct WorkerOpts {
    /// Layered config paths in merge order.
    #[arg(long = "config")]
    config_paths: Vec<String>,

    /// Run one pass and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Overrides `<section>.poll_seconds`.
    #[arg(long)]
    poll_seconds: Option<f64>,
}

#[derive(Subcommand)]
pub enum WorkerCmd {
    /// Job queue worker.
    Jobs(WorkerOpts),
    /// Order lifecycle worker.
    Orders(WorkerOpts),
}

fn settings_for(kind: WorkerKind, opts: &WorkerOpts) -> Result<WorkerSettings> {
    let mut settings = load_settings(&opts.config_paths, kind)?;
    if let Some(p) = opts.poll_seconds {
        match kind {
            WorkerKind::Jobs => settings.jobs.poll_seconds = p,
            WorkerKind::Orders => settings.orders.poll_seconds = p,
        }
        settings.validate()?;
    }
    Ok(settings)
}

fn venue_for(settings: &WorkerSettings) -> Result<Arc<dyn VenueClient>> {
    match settings.venue.kind.as_str() {
        "paper" => {
            tracing::warn!("venue=paper: orders are simulated in-process and never leave this worker");
            Ok(Arc::new(ngt_broker_paper::PaperVenue::new()))
        }
        other => bail!("venue.kind {other:?} has no adapter in this build"),
    }
}

pub async fn run(cmd: WorkerCmd) -> Result<()> {
    let (kind, opts) = match cmd {
        WorkerCmd::Jobs(o) => (WorkerKind::Jobs, o),
        WorkerCmd::Orders(o) => (WorkerKind::Orders, o),
    };
    let settings = settings_for(kind, &opts)?;
    let venue = venue_for(&settings)?;
    let pool = ngt_db::connect_from_env().await?;

    let (trigger, shutdown) = shutdown_channel();
    spawn_signal_listener(trigger);

    match kind {
        WorkerKind::Jobs => {
            let engine = JobEngine::new(
                JobContext {
                    pool,
                    venue,
                    settings,
                },
                JobRegistry::with_builtin(),
            );
            tracing::info!(worker = %engine.worker_id(), once = opts.once, "job worker starting");
            engine.run(shutdown, opts.once).await?;
        }
        WorkerKind::Orders => {
            let manager = OrderManager::new(pool, venue, settings);
            tracing::info!(worker = %manager.worker_id(), once = opts.once, "order worker starting");
            manager.run(shutdown, opts.once).await?;
        }
    }
    println!("worker={} stopped=true", kind.as_str());
    Ok(())
}
