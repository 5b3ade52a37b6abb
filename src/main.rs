use ahorro_notify::api::{self, AppState};
use ahorro_notify::{config, Services};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Notification trigger and campaign service")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override `app.bind` from the config file
    #[arg(long)]
    bind: Option<String>,
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
    let state = AppState {
        executor: services.executor.clone(),
        pool: services.pool.clone(),
        monitoring: cfg.monitoring.clone(),
        cron_secret: cfg.app.cron_secret.clone(),
        alerts: services.alerts.clone(),
    };
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let bind = args.bind.unwrap_or_else(|| cfg.app.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!(%bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}
