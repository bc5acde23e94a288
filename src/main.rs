use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use lecture_ingest::config;
use lecture_ingest::db;
use lecture_ingest::fetch::HttpFetcher;
use lecture_ingest::queue::SqliteJobQueue;
use lecture_ingest::worker::IngestionWorker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run the resource download worker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override `ingest.concurrency`
    #[arg(long)]
    concurrency: Option<usize>,
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

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let queue = SqliteJobQueue::new(pool.clone(), cfg.queue_config());
    let fetcher = HttpFetcher::new(cfg.fetch_timeout())?;
    let mut worker_cfg = cfg.worker_config();
    if let Some(n) = args.concurrency.filter(|n| *n > 0) {
        worker_cfg.concurrency = n;
    }

    info!(
        queue = queue.name(),
        storage_dir = %worker_cfg.storage_dir.display(),
        "starting ingestion worker"
    );
    let worker = Arc::new(IngestionWorker::new(
        pool,
        Arc::new(queue),
        Arc::new(fetcher),
        worker_cfg,
    ));

    worker
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
}
