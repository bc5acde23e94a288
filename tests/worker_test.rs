use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lecture_ingest::db;
use lecture_ingest::error::FetchError;
use lecture_ingest::fetch::{Fetcher, HttpFetcher};
use lecture_ingest::model::{Credential, Job, ResourceDescriptor, ResourceStatus};
use lecture_ingest::queue::{JobQueue, QueueConfig, SqliteJobQueue};
use lecture_ingest::source::{RawDescriptor, ResourceSource};
use lecture_ingest::syncer::MetadataSyncer;
use lecture_ingest::worker::{IngestionWorker, JobOutcome, WorkerConfig};

const MIB: usize = 1024 * 1024;
const PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone)]
enum Reply {
    Body(Vec<u8>),
    Timeout,
    Status(u16),
}

#[derive(Clone, Default)]
struct RecordingFetcher {
    replies: Arc<Mutex<HashMap<String, Reply>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingFetcher {
    fn with_replies(replies: Vec<(&str, Reply)>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(
                replies
                    .into_iter()
                    .map(|(u, r)| (u.to_string(), r))
                    .collect(),
            )),
            ..Default::default()
        }
    }

    async fn set_reply(&self, url: &str, reply: Reply) {
        self.replies.lock().await.insert(url.to_string(), reply);
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        self.calls.lock().await.push(url.to_string());
        match self.replies.lock().await.get(url).cloned() {
            Some(Reply::Body(b)) if b.len() as u64 > max_bytes => {
                Err(FetchError::TooLarge { limit: max_bytes })
            }
            Some(Reply::Body(b)) => Ok(b),
            Some(Reply::Timeout) => Err(FetchError::Timeout),
            Some(Reply::Status(s)) => Err(FetchError::Status(s)),
            None => Err(FetchError::Status(404)),
        }
    }
}

#[derive(Clone)]
struct StaticSource(Vec<RawDescriptor>);

#[async_trait::async_trait]
impl ResourceSource for StaticSource {
    async fn list_resources(&self, _course: &str, _cred: &Credential) -> Result<Vec<RawDescriptor>> {
        Ok(self.0.clone())
    }
}

fn worker_with(
    pool: &sqlx::SqlitePool,
    queue: Arc<SqliteJobQueue>,
    fetcher: Arc<dyn Fetcher>,
    storage: &Path,
) -> IngestionWorker {
    let mut cfg = WorkerConfig::new(storage);
    cfg.poll_interval = Duration::from_millis(20);
    IngestionWorker::new(pool.clone(), queue, fetcher, cfg)
}

async fn insert(pool: &sqlx::SqlitePool, external_id: &str, name: &str, ct: Option<&str>) -> i64 {
    let d = ResourceDescriptor {
        external_id: external_id.into(),
        display_name: name.into(),
        fetch_url: format!("https://files.example/{}", external_id),
        content_type: ct.map(str::to_string),
    };
    db::upsert_resource(pool, "u", "C1", &d).await.unwrap().id
}

fn storage_entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn course_scenario_end_to_end() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = td.path().join("files");
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));

    let source = StaticSource(vec![
        serde_json::from_value(json!({ "id": 101, "display_name": "a.pdf", "url": "https://u/1" })).unwrap(),
        serde_json::from_value(json!({ "id": 102, "display_name": "b.docx", "url": "https://u/2" })).unwrap(),
        serde_json::from_value(json!({
            "id": 103, "display_name": "notes", "url": "https://u/3",
            "content-type": "application/msword"
        }))
        .unwrap(),
    ]);
    let syncer = MetadataSyncer::new(pool.clone(), Arc::new(source), queue.clone());
    let report = syncer.sync("u", "C1", &Credential::new("t")).await.unwrap();
    assert_eq!(report.created, 3);
    assert_eq!(queue.len().await.unwrap(), 3);

    let fetcher = RecordingFetcher::with_replies(vec![
        ("https://u/1", Reply::Body(vec![7u8; 2 * MIB])),
        ("https://u/2", Reply::Timeout),
        ("https://u/3", Reply::Body(b"doc".to_vec())),
    ]);
    let worker = worker_with(&pool, queue.clone(), Arc::new(fetcher.clone()), &storage);

    while worker.process_next().await.unwrap() {}
    assert!(queue.is_empty().await.unwrap());

    let a = db::get_resource_by_external_id(&pool, "101").await.unwrap().unwrap();
    assert_eq!(a.status, ResourceStatus::Downloaded);
    assert_eq!(a.byte_size, Some(2_097_152));
    let a_path = a.local_path.unwrap();
    assert!(a_path.ends_with("_a.pdf"));
    assert!(a_path.ends_with(&format!("{}_a.pdf", a.id)));
    assert_eq!(std::fs::metadata(&a_path).unwrap().len(), 2_097_152);
    assert!(a.downloaded_at.is_some());

    let b = db::get_resource_by_external_id(&pool, "102").await.unwrap().unwrap();
    assert_eq!(b.status, ResourceStatus::Failed);
    assert!(b.local_path.is_none());
    assert!(b.byte_size.is_none());

    let n = db::get_resource_by_external_id(&pool, "103").await.unwrap().unwrap();
    assert_eq!(n.status, ResourceStatus::Downloaded);
    assert!(n.local_path.unwrap().ends_with(&format!("{}_notes.doc", n.id)));

    let mut entries = storage_entries(&storage);
    entries.sort();
    assert_eq!(entries.len(), 2, "no temp or partial files left: {:?}", entries);
    assert_eq!(fetcher.calls().await.len(), 3);
}

#[tokio::test]
async fn failed_fetch_is_acked_not_retried() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));
    let id = insert(&pool, "9", "slides.pdf", None).await;
    queue.enqueue(Job::download(id)).await.unwrap();

    let fetcher = RecordingFetcher::with_replies(vec![("https://files.example/9", Reply::Status(503))]);
    let worker = worker_with(&pool, queue.clone(), Arc::new(fetcher.clone()), td.path());

    let d = queue.dequeue().await.unwrap().unwrap();
    let outcome = worker.process_delivery(d).await.unwrap().unwrap();
    match outcome {
        JobOutcome::Failed { resource_id, reason } => {
            assert_eq!(resource_id, id);
            assert!(reason.contains("503"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(queue.is_empty().await.unwrap());
    assert!(!worker.process_next().await.unwrap());
    assert_eq!(fetcher.calls().await.len(), 1);
}

#[tokio::test]
async fn oversize_body_fails_without_local_path() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));
    let id = insert(&pool, "big", "lecture.mp4", None).await;
    queue.enqueue(Job::download(id)).await.unwrap();

    let fetcher = RecordingFetcher::with_replies(vec![(
        "https://files.example/big",
        Reply::Body(vec![0u8; 3 * MIB / 2]),
    )]);
    let mut cfg = WorkerConfig::new(td.path());
    cfg.max_download_bytes = MIB as u64;
    let worker = IngestionWorker::new(pool.clone(), queue.clone(), Arc::new(fetcher), cfg);

    assert!(worker.process_next().await.unwrap());
    let rec = db::get_resource(&pool, id).await.unwrap().unwrap();
    assert_eq!(rec.status, ResourceStatus::Failed);
    assert!(rec.local_path.is_none());
    assert!(storage_entries(td.path()).is_empty());
}

#[tokio::test]
async fn oversize_http_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4096]))
        .mount(&server)
        .await;

    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));
    let d = ResourceDescriptor {
        external_id: "big".into(),
        display_name: "big.pdf".into(),
        fetch_url: format!("{}/big.pdf", server.uri()),
        content_type: None,
    };
    let id = db::upsert_resource(&pool, "u", "C1", &d).await.unwrap().id;
    queue.enqueue(Job::download(id)).await.unwrap();

    let mut cfg = WorkerConfig::new(td.path());
    cfg.max_download_bytes = 1024;
    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let worker = IngestionWorker::new(pool.clone(), queue.clone(), Arc::new(fetcher), cfg);

    assert!(worker.process_next().await.unwrap());
    let rec = db::get_resource(&pool, id).await.unwrap().unwrap();
    assert_eq!(rec.status, ResourceStatus::Failed);
    assert!(rec.local_path.is_none());
    assert!(rec.byte_size.is_none());
    assert!(storage_entries(td.path()).is_empty());
}

#[tokio::test]
async fn stale_job_is_acked_silently() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = td.path().join("files");
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));

    let id = insert(&pool, "gone", "gone.pdf", None).await;
    queue.enqueue(Job::download(id)).await.unwrap();
    assert!(db::delete_resource(&pool, id).await.unwrap());

    let fetcher = RecordingFetcher::default();
    let worker = worker_with(&pool, queue.clone(), Arc::new(fetcher.clone()), &storage);

    let d = queue.dequeue().await.unwrap().unwrap();
    let outcome = worker.process_delivery(d).await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Stale { resource_id: id }));
    assert!(queue.is_empty().await.unwrap());
    assert!(fetcher.calls().await.is_empty());
    assert_eq!(db::count_resources(&pool).await.unwrap(), 0);
    assert!(!storage.exists());
}

#[tokio::test]
async fn names_are_sanitized_and_extension_inferred() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));
    let odd = insert(&pool, "1", "My File?.pdf", None).await;
    let deck = insert(&pool, "2", "notes", Some(PPTX)).await;

    let fetcher = RecordingFetcher::with_replies(vec![
        ("https://files.example/1", Reply::Body(b"pdf".to_vec())),
        ("https://files.example/2", Reply::Body(b"pptx".to_vec())),
    ]);
    let worker = worker_with(&pool, queue, Arc::new(fetcher), td.path());

    let outcome = worker.handle(&Job::download(odd)).await.unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Downloaded {
            resource_id: odd,
            path: td.path().join(format!("{}_My_File_.pdf", odd)),
            byte_size: 3,
        }
    );

    worker.handle(&Job::download(deck)).await.unwrap();
    let rec = db::get_resource(&pool, deck).await.unwrap().unwrap();
    assert!(rec.local_path.unwrap().ends_with(".pptx"));
}

#[tokio::test]
async fn redelivered_job_rewrites_same_file() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));
    let id = insert(&pool, "r", "week1.pdf", None).await;

    let fetcher = RecordingFetcher::with_replies(vec![("https://files.example/r", Reply::Body(b"v1".to_vec()))]);
    let worker = worker_with(&pool, queue, Arc::new(fetcher.clone()), td.path());

    worker.handle(&Job::download(id)).await.unwrap();
    fetcher
        .set_reply("https://files.example/r", Reply::Body(b"v2-longer".to_vec()))
        .await;
    worker.handle(&Job::download(id)).await.unwrap();

    let rec = db::get_resource(&pool, id).await.unwrap().unwrap();
    assert_eq!(rec.status, ResourceStatus::Downloaded);
    assert_eq!(rec.byte_size, Some(9));
    assert_eq!(std::fs::read(rec.local_path.unwrap()).unwrap(), b"v2-longer");
    assert_eq!(storage_entries(td.path()).len(), 1);
}

#[tokio::test]
async fn worker_reads_current_fetch_url() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));
    let id = insert(&pool, "s", "s.pdf", None).await;
    queue.enqueue(Job::download(id)).await.unwrap();

    // Resync rotates the signed url after the job was queued.
    let rotated = ResourceDescriptor {
        external_id: "s".into(),
        display_name: "s.pdf".into(),
        fetch_url: "https://files.example/s?sig=new".into(),
        content_type: None,
    };
    db::upsert_resource(&pool, "u", "C1", &rotated).await.unwrap();

    let fetcher = RecordingFetcher::with_replies(vec![(
        "https://files.example/s?sig=new",
        Reply::Body(b"ok".to_vec()),
    )]);
    let worker = worker_with(&pool, queue, Arc::new(fetcher.clone()), td.path());
    assert!(worker.process_next().await.unwrap());
    assert_eq!(fetcher.calls().await, vec!["https://files.example/s?sig=new"]);
}

#[tokio::test]
async fn store_failure_releases_job_for_redelivery() {
    let queue_pool = setup_pool().await;
    let store_pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(queue_pool, QueueConfig::default()));
    queue.enqueue(Job::download(1)).await.unwrap();
    store_pool.close().await;

    let worker = worker_with(&store_pool, queue.clone(), Arc::new(RecordingFetcher::default()), td.path());
    let d = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(worker.process_delivery(d).await.unwrap(), None);

    // Still queued, hidden behind the backoff delay.
    assert_eq!(queue.len().await.unwrap(), 1);
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn run_drains_queue_and_stops_on_shutdown() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), QueueConfig::default()));

    let mut replies = Vec::new();
    let mut ids = Vec::new();
    for i in 0..5 {
        let id = insert(&pool, &format!("e{}", i), &format!("file{}.txt", i), None).await;
        queue.enqueue(Job::download(id)).await.unwrap();
        ids.push(id);
        replies.push((format!("https://files.example/e{}", i), Reply::Body(vec![b'x'; i + 1])));
    }
    let fetcher = RecordingFetcher::with_replies(
        replies.iter().map(|(u, r)| (u.as_str(), r.clone())).collect(),
    );

    let mut cfg = WorkerConfig::new(td.path());
    cfg.concurrency = 3;
    cfg.poll_interval = Duration::from_millis(20);
    let worker = Arc::new(IngestionWorker::new(pool.clone(), queue.clone(), Arc::new(fetcher), cfg));

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(worker.run(async move {
        let _ = rx.await;
    }));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let counts = db::status_counts(&pool, "C1").await.unwrap();
        if counts.downloaded == 5 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker did not finish: {:?}", counts);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert!(queue.is_empty().await.unwrap());
    for (i, id) in ids.iter().enumerate() {
        let rec = db::get_resource(&pool, *id).await.unwrap().unwrap();
        assert_eq!(rec.byte_size, Some(i as i64 + 1));
    }
}
