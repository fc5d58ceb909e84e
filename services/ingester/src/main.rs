//! Weather frame ingester service.
//!
//! Polls upstream model output (NOMADS, AWS Open Data) and builds published
//! map frames on the local filesystem.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ingester::{IngesterConfig, Scheduler};
use ingestion::Model;

#[derive(Parser, Debug)]
#[command(name = "ingester")]
#[command(about = "Builds and publishes weather map frames")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "INGESTER_CONFIG", default_value = "config/ingester.yaml")]
    config: PathBuf,

    /// Overrides `data_dir` from the configuration
    #[arg(long, env = "INGESTER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run one pass and exit (vs continuous polling)
    #[arg(long)]
    once: bool,

    /// Specific model to ingest (default: all enabled)
    #[arg(short, long)]
    model: Option<String>,

    /// Overrides `concurrency` from the configuration
    #[arg(long, env = "INGESTER_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Roll MODEL's pointer back to its previous run, hold it there and exit
    #[arg(long, value_name = "MODEL", conflicts_with = "release_hold")]
    rollback: Option<String>,

    /// Let publishes move MODEL's pointer again after a rollback, then exit
    #[arg(long, value_name = "MODEL")]
    release_hold: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting weather frame ingester");

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(addr = %addr, "Prometheus metrics exporter listening");
    }

    let mut config = IngesterConfig::load(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.concurrency = max_concurrent;
    }
    config.validate()?;
    info!(
        config = %args.config.display(),
        data_dir = %config.data_dir.display(),
        models = ?config.models.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        "Loaded configuration"
    );

    let scheduler = Scheduler::from_config(&config, args.model.as_deref())?;

    if let Some(model) = &args.rollback {
        let model: Model = model.parse()?;
        let run = scheduler.pipeline().rollback(model).await?;
        info!(model = %model, run = %run, "Pointer held until --release-hold");
        return Ok(());
    }
    if let Some(model) = &args.release_hold {
        let model: Model = model.parse()?;
        let released = scheduler.pipeline().release_hold(model).await?;
        info!(model = %model, released, "Release hold");
        return Ok(());
    }

    if args.once {
        info!("Running single ingestion pass");
        let reports = scheduler.run_once().await;
        for report in &reports {
            info!(
                model = %report.model,
                run = %report.run,
                variables = report.builds.len(),
                failed = report.failed.len(),
                serving = report.serving.len(),
                "Pass summary"
            );
        }
        if reports.len() < scheduler.plans().len() {
            bail!(
                "{} of {} model passes failed",
                scheduler.plans().len() - reports.len(),
                scheduler.plans().len()
            );
        }
    } else {
        info!("Starting continuous polling");
        scheduler.run_forever().await?;
    }

    Ok(())
}
