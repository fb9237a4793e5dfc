//! `imagespy update` command.

use clap::{Args, Subcommand};
use imagespy_queue::{Updater, UpdaterBuilder};
use imagespy_runtime::metrics::UpdaterMetrics;

use crate::context::Context;
use crate::output;

#[derive(Args)]
pub struct UpdateArgs {
    #[command(subcommand)]
    pub target: UpdateTarget,
}

#[derive(Subcommand)]
pub enum UpdateTarget {
    /// Re-check every tag currently flagged latest
    Latest(RunArgs),
    /// Scrape every registry tag of every stored repository
    All(RunArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Repositories scraped concurrently (defaults to updater.worker_count)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Print updater metrics in Prometheus text format after the run
    #[arg(long)]
    pub metrics: bool,
}

pub async fn execute(args: UpdateArgs, context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let (run_args, latest) = match args.target {
        UpdateTarget::Latest(run_args) => (run_args, true),
        UpdateTarget::All(run_args) => (run_args, false),
    };

    let metrics = UpdaterMetrics::new()?;
    let builder = UpdaterBuilder::new(
        context.store.clone(),
        context.registry.clone(),
        context.scraper.clone(),
    )
    .with_config(&context.config.updater)
    .with_metrics(metrics.clone())
    .with_events(context.events.clone());
    let builder = match run_args.workers {
        Some(workers) => builder.with_worker_count(workers),
        None => builder,
    };

    let report = if latest {
        builder.build_latest()?.run().await?
    } else {
        builder.build_all()?.run().await?
    };

    println!("{}", output::to_json(&report)?);
    if run_args.metrics {
        print!("{}", metrics.render()?);
    }
    Ok(())
}
