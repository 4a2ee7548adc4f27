use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use care_reminders::channel::ChannelRouter;
use care_reminders::config;
use care_reminders::db;
use care_reminders::service::NotificationService;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let router = ChannelRouter::from_config(&cfg.channels, cfg.dispatch.send_timeout())?;
    if router.kinds().next().is_none() {
        warn!("no channels configured; every delivery will fail permanently");
    }
    info!(channels = ?router.kinds().collect::<Vec<_>>(), "channels ready");

    let service = NotificationService::from_config(pool.clone(), Arc::new(router), &cfg);
    service.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if let Some(report) = service.stop().await {
        info!(
            in_flight = report.in_flight,
            abandoned = report.abandoned,
            dispatched = report.counters.dispatched,
            "shutdown complete"
        );
    }
    pool.close().await;
    Ok(())
}
