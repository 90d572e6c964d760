use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use release_herald::notify::{HttpCalendar, HttpMailer};
use release_herald::orchestrator::DeliveryOrchestrator;
use release_herald::plan_store::PlanStore;
use release_herald::{config, db};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Run a single delivery cycle and exit
    #[arg(long)]
    once: bool,
    /// Treat every pending batch as due regardless of its window
    #[arg(long)]
    force_send: bool,
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
    let delivery = cfg.delivery_config()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/herald.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let plan_store = PlanStore::new(PathBuf::from(&cfg.app.data_dir).join("delivery_plan.json"));
    let mail = Arc::new(HttpMailer::new(
        Url::parse(&cfg.mail.endpoint).context("mail.endpoint must be a valid URL")?,
        cfg.mail.token.clone(),
        cfg.mail.from.clone(),
        cfg.mail.to.clone(),
    ));
    let calendar = Arc::new(HttpCalendar::new(
        Url::parse(&cfg.calendar.endpoint).context("calendar.endpoint must be a valid URL")?,
        cfg.calendar.token.clone(),
        cfg.calendar.calendar_id.clone(),
    ));

    let orchestrator =
        DeliveryOrchestrator::new(pool.clone(), plan_store, mail, calendar, delivery);

    let shutdown = orchestrator.shutdown_handle();
    let signal_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing current batch before exit");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    if args.once {
        let summary = orchestrator.run_cycle(Utc::now(), args.force_send).await?;
        info!(?summary, "single cycle finished");
        return Ok(());
    }

    info!(interval_secs = cfg.app.cycle_interval_secs, "starting delivery loop");
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.app.cycle_interval_secs));
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            info!("shutting down");
            break;
        }

        match orchestrator.run_cycle(Utc::now(), args.force_send).await {
            Ok(summary) => {
                if !summary.failures.is_empty() {
                    error!(failures = summary.failures.len(), ?summary, "cycle had failures");
                }
            }
            Err(err) => error!(?err, "delivery cycle aborted"),
        }

        if let Err(err) = db::delete_notified_older_than(&pool, cfg.app.retention_days).await {
            error!(?err, "retention cleanup failed");
        }
    }

    Ok(())
}
