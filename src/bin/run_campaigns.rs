use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use ahorro_notify::{config, scheduler, triggers, Services};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run every notification campaign once, record cron health and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single trigger instead of every campaign (no health record is written)
    #[arg(long)]
    trigger: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let services = Services::connect(&cfg).await?;

    if let Some(key) = args.trigger {
        let summary = services.executor.run_trigger(&key, None).await?;
        info!(
            trigger = %summary.trigger,
            sent = summary.sent,
            skipped_ineligible = summary.skipped_ineligible,
            skipped_rate_limited = summary.skipped_rate_limited,
            failed = summary.failed,
            "trigger finished"
        );
        return Ok(());
    }

    info!(campaigns = triggers::definitions().len(), "starting scheduled run");
    let report = scheduler::run_scheduled(
        &services.executor,
        &services.pool,
        &cfg.monitoring,
        services.alerts.as_deref(),
        Utc::now(),
    )
    .await?;

    for campaign in &report.campaigns {
        match (&campaign.counts, &campaign.error) {
            (Some(counts), _) => info!(
                trigger = %campaign.trigger,
                targets = counts.targets,
                sent = counts.sent,
                failed = counts.failed,
                "campaign processed"
            ),
            (None, Some(err)) => error!(trigger = %campaign.trigger, %err, "campaign failed"),
            (None, None) => {}
        }
    }

    if !report.success {
        bail!(
            "{} of {} campaigns failed",
            report.triggers_evaluated - report.campaigns_processed,
            report.triggers_evaluated
        );
    }
    info!("scheduled run complete");
    Ok(())
}
