use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use lecture_ingest::config;
use lecture_ingest::db;
use lecture_ingest::model::Credential;
use lecture_ingest::queue::SqliteJobQueue;
use lecture_ingest::source::LmsClient;
use lecture_ingest::syncer::MetadataSyncer;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync one course's file listing and queue downloads, then exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Course identifier on the LMS
    #[arg(long)]
    course: String,

    /// Opaque owner reference stored on new records
    #[arg(long, default_value = "cli")]
    owner: String,

    /// LMS token to use instead of `lms.token`
    #[arg(long, env = "LMS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Reset failed resources of the course to pending and queue them again
    #[arg(long)]
    requeue_failed: bool,

    /// Print per-status counts for the course and exit
    #[arg(long)]
    status: bool,
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

    let source = LmsClient::from_config(&cfg)?;
    let queue = SqliteJobQueue::new(pool.clone(), cfg.queue_config());
    let syncer = MetadataSyncer::new(pool, Arc::new(source), Arc::new(queue));

    if args.status {
        let counts = syncer.status(&args.course).await?;
        println!(
            "course {}: pending={} downloaded={} failed={} total={}",
            args.course,
            counts.pending,
            counts.downloaded,
            counts.failed,
            counts.total()
        );
        return Ok(());
    }

    if args.requeue_failed {
        let n = syncer.requeue_failed(&args.course).await?;
        info!(course = %args.course, requeued = n, "requeue finished");
        return Ok(());
    }

    let credential = Credential::new(args.token.unwrap_or_else(|| cfg.lms.token.clone()));
    let report = syncer.sync(&args.owner, &args.course, &credential).await?;
    info!(
        course = %args.course,
        listed = report.listed,
        created = report.created,
        refreshed = report.refreshed,
        enqueued = report.enqueued,
        deduplicated = report.deduplicated,
        failed = report.failures.len(),
        "sync finished; downloads continue in the worker"
    );
    Ok(())
}
