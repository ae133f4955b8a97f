//! End-to-end tests for the delivery pipeline
//!
//! Each test runs a mock collector (axum on its own runtime thread) and drives
//! a real `EventQueue` against it: SQLite store in a temp dir, HTTP transport,
//! dispatcher thread.

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use beacon_core::collector::codec::{decode, string_hash};
use beacon_core::{ConfigHandler, Database, EventQueue, EventStore, QueueConfig};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ============================================
// Mock collector
// ============================================

#[derive(Debug, Clone)]
struct Upload {
    records: Vec<Value>,
    data: String,
    crc: Option<String>,
    gzip: Option<String>,
    dry_run: bool,
    user_agent: Option<String>,
}

#[derive(Clone, Default)]
struct Collector {
    uploads: Arc<Mutex<Vec<Upload>>>,
    /// Statuses to answer with, in order; 200 once exhausted
    statuses: Arc<Mutex<VecDeque<u16>>>,
    config_body: Arc<Mutex<String>>,
}

impl Collector {
    fn answer(self, statuses: &[u16]) -> Self {
        self.statuses.lock().unwrap().extend(statuses);
        self
    }

    fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    fn sizes(&self) -> Vec<usize> {
        self.uploads().iter().map(|u| u.records.len()).collect()
    }

    fn records(&self) -> Vec<Value> {
        self.uploads().into_iter().flat_map(|u| u.records).collect()
    }
}

async fn receive_batch(
    State(collector): State<Collector>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, String) {
    let data = form.get("data_list").cloned().unwrap_or_default();
    let records = decode(&data).unwrap_or_default();
    collector.uploads.lock().unwrap().push(Upload {
        records,
        data,
        crc: form.get("crc").cloned(),
        gzip: form.get("gzip").cloned(),
        dry_run: headers.get("Dry-Run").is_some_and(|v| v == "true"),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    let status = collector.statuses.lock().unwrap().pop_front().unwrap_or(200);
    (
        StatusCode::from_u16(status).unwrap(),
        format!("{{\"status\":{status}}}"),
    )
}

async fn serve_config(State(collector): State<Collector>) -> String {
    collector.config_body.lock().unwrap().clone()
}

/// Start the collector on an ephemeral port and return its address
fn start(collector: Collector) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            let app = Router::new()
                .route("/sa", post(receive_batch))
                .route("/config", get(serve_config))
                .with_state(collector);
            axum::serve(listener, app).await.unwrap();
        });
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

// ============================================
// Helpers
// ============================================

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn queue_config(addr: SocketAddr) -> QueueConfig {
    QueueConfig {
        server_url: Some(format!("http://{addr}/sa")),
        config_url: Some(format!("http://{addr}/config")),
        flush_interval_ms: 60_000,
        flush_bulk_size: 1_000,
        timeout_secs: 5,
        user_agent: Some("beacon-test".to_string()),
        ..Default::default()
    }
}

fn open_queue(config: &QueueConfig, dir: &TempDir) -> (EventQueue, Arc<Database>) {
    beacon_core::logging::init_test();
    let db = Database::open(&dir.path().join("queue.db"))
        .unwrap()
        .with_capacity(config.max_entries);
    db.migrate().unwrap();
    let db = Arc::new(db);
    let queue = EventQueue::builder(config, db.clone()).build().unwrap();
    (queue, db)
}

/// An address nothing listens on
fn dead_address() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

// ============================================
// Delivery
// ============================================

#[test]
fn test_drain_delivers_everything_in_order() {
    let collector = Collector::default();
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let (queue, db) = open_queue(&queue_config(addr), &dir);

    for n in 0..120 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    queue.flush();

    wait_until("drain", || queue.stats().events_delivered == 120);
    assert_eq!(collector.sizes(), vec![50, 50, 20]);
    assert_eq!(db.backlog().unwrap(), 0);

    let order: Vec<_> = collector
        .records()
        .iter()
        .map(|r| r["data"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..120).collect::<Vec<_>>());
}

#[test]
fn test_upload_form_and_headers() {
    let collector = Collector::default();
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let (queue, _db) = open_queue(&queue_config(addr), &dir);

    queue.track("track_signup", json!({"plan": "free"})).unwrap();
    wait_until("signup flush", || collector.uploads().len() == 1);

    let upload = &collector.uploads()[0];
    assert_eq!(upload.gzip.as_deref(), Some("1"));
    assert_eq!(upload.crc, Some(string_hash(&upload.data).to_string()));
    assert_eq!(upload.user_agent.as_deref(), Some("beacon-test"));
    assert!(!upload.dry_run);

    let record = &upload.records[0];
    assert_eq!(record["type"], "track_signup");
    assert_eq!(record["data"]["plan"], "free");
    assert!(record["event_id"].is_string());
}

#[test]
fn test_verification_mode_sends_dry_run_header() {
    let collector = Collector::default();
    let addr = start(collector.clone());

    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        verification_mode: true,
        ..queue_config(addr)
    };
    let (queue, _db) = open_queue(&config, &dir);
    queue.track("track", json!({})).unwrap();
    wait_until("verification upload", || collector.uploads().len() == 1);
    assert!(collector.uploads()[0].dry_run);
    queue.shutdown();

    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        verification_mode: true,
        verification_write_through: true,
        ..queue_config(addr)
    };
    let (queue, _db) = open_queue(&config, &dir);
    queue.track("track", json!({})).unwrap();
    wait_until("write-through upload", || collector.uploads().len() == 2);
    assert!(!collector.uploads()[1].dry_run);
}

// ============================================
// Failure policy
// ============================================

#[test]
fn test_rejected_batch_is_discarded_and_drain_continues() {
    let collector = Collector::default().answer(&[400]);
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let (queue, db) = open_queue(&queue_config(addr), &dir);

    for n in 0..60 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    queue.flush();

    wait_until("drain after rejection", || db.backlog().unwrap() == 0);
    wait_until("stats", || queue.stats().flushes == 1);
    assert_eq!(collector.sizes(), vec![50, 10]);

    let stats = queue.stats();
    assert_eq!(stats.events_discarded, 50);
    assert_eq!(stats.events_delivered, 10);
}

#[test]
fn test_server_error_keeps_batch_until_next_flush() {
    let collector = Collector::default().answer(&[503]);
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let (queue, db) = open_queue(&queue_config(addr), &dir);

    for n in 0..5 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    queue.flush();
    wait_until("failed flush", || queue.stats().failures == 1);
    assert_eq!(db.backlog().unwrap(), 5);

    queue.flush();
    wait_until("retry", || db.backlog().unwrap() == 0);
    assert_eq!(collector.sizes(), vec![5, 5]);
}

#[test]
fn test_server_error_discards_when_retry_disabled() {
    let collector = Collector::default().answer(&[500]);
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        retry_server_errors: false,
        ..queue_config(addr)
    };
    let (queue, db) = open_queue(&config, &dir);

    queue.track("track", json!({})).unwrap();
    queue.flush();

    wait_until("discard", || queue.stats().events_discarded == 1);
    assert_eq!(db.backlog().unwrap(), 0);
}

#[test]
fn test_unreachable_collector_keeps_events() {
    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        timeout_secs: 2,
        ..queue_config(dead_address())
    };
    let (queue, db) = open_queue(&config, &dir);

    for n in 0..3 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    queue.flush();

    wait_until("connection failure", || queue.stats().failures == 1);
    assert_eq!(db.backlog().unwrap(), 3);
    assert_eq!(queue.stats().events_discarded, 0);
}

#[test]
fn test_events_survive_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("queue.db");

    let offline = QueueConfig {
        timeout_secs: 2,
        ..queue_config(dead_address())
    };
    let queue = EventQueue::open(&offline, &db_path).unwrap();
    for n in 0..7 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    queue.shutdown();
    drop(queue);

    let collector = Collector::default();
    let addr = start(collector.clone());
    let queue = EventQueue::open(&queue_config(addr), &db_path).unwrap();
    assert_eq!(queue.backlog().unwrap(), 7);

    queue.flush();
    wait_until("delivery after restart", || queue.backlog().unwrap() == 0);
    assert_eq!(collector.sizes(), vec![7]);
}

// ============================================
// Scheduling
// ============================================

#[test]
fn test_concurrent_producers_keep_their_own_order() {
    let collector = Collector::default();
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let (queue, db) = open_queue(&queue_config(addr), &dir);
    let queue = Arc::new(queue);

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for seq in 0..50 {
                    queue
                        .track("track", json!({ "producer": producer, "seq": seq }))
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    queue.flush();

    wait_until("drain", || db.backlog().unwrap() == 0);
    let records = collector.records();
    assert_eq!(records.len(), 200);

    for producer in 0..4 {
        let seqs: Vec<_> = records
            .iter()
            .filter(|r| r["data"]["producer"] == producer)
            .map(|r| r["data"]["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>(), "producer {producer}");
    }
}

#[test]
fn test_bulk_threshold_flushes_immediately_and_rest_waits() {
    let collector = Collector::default();
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        flush_bulk_size: 50,
        batch_size: 50,
        ..queue_config(addr)
    };
    let (queue, db) = open_queue(&config, &dir);

    // The 51st enqueue pushes the backlog past the threshold
    for n in 0..51 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    wait_until("bulk flush", || queue.stats().events_delivered == 51);
    assert_eq!(collector.sizes(), vec![50, 1]);

    // Below the threshold again: these wait for the debounce window
    for n in 51..60 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(db.backlog().unwrap(), 9);
    assert_eq!(collector.uploads().len(), 2);
}

#[test]
fn test_overflow_flushes_without_waiting() {
    let collector = Collector::default();
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        max_entries: 10,
        batch_size: 10,
        ..queue_config(addr)
    };
    let (queue, db) = open_queue(&config, &dir);

    for n in 0..10 {
        queue.track("track", json!({ "n": n })).unwrap();
    }
    std::thread::sleep(Duration::from_millis(300));
    assert!(collector.uploads().is_empty());
    assert_eq!(db.backlog().unwrap(), 10);

    // At capacity: the oldest entry is evicted and the rest go out now
    queue.track("track", json!({ "n": 10 })).unwrap();
    wait_until("overflow flush", || queue.stats().events_delivered == 10);

    assert_eq!(collector.sizes(), vec![10]);
    let order: Vec<_> = collector
        .records()
        .iter()
        .map(|r| r["data"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, (1..=10).collect::<Vec<_>>());
    assert_eq!(db.backlog().unwrap(), 0);
}

#[test]
fn test_debounced_enqueues_coalesce_into_one_upload() {
    let collector = Collector::default();
    let addr = start(collector.clone());
    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        flush_interval_ms: 300,
        ..queue_config(addr)
    };
    let (queue, db) = open_queue(&config, &dir);

    for n in 0..20 {
        queue.track("track", json!({ "n": n })).unwrap();
    }

    wait_until("debounced flush", || db.backlog().unwrap() == 0);
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(collector.sizes(), vec![20]);
}

// ============================================
// Remote configuration
// ============================================

#[derive(Default)]
struct Recorder {
    bindings: Mutex<Vec<Vec<Value>>>,
    urls: Mutex<Vec<String>>,
}

impl ConfigHandler for Recorder {
    fn set_event_bindings(&self, bindings: Vec<Value>) {
        self.bindings.lock().unwrap().push(bindings);
    }

    fn set_remote_server_url(&self, url: &str) {
        self.urls.lock().unwrap().push(url.to_string());
    }
}

#[test]
fn test_config_with_empty_url_notifies_once() {
    let collector = Collector::default();
    *collector.config_body.lock().unwrap() = r#"{"vtrack_server_url": ""}"#.to_string();
    let addr = start(collector);
    let dir = TempDir::new().unwrap();
    let (queue, _db) = open_queue(&queue_config(addr), &dir);
    let recorder = Arc::new(Recorder::default());

    queue.check_config(recorder.clone());
    wait_until("config", || !recorder.urls.lock().unwrap().is_empty());
    queue.shutdown();

    assert_eq!(*recorder.urls.lock().unwrap(), vec![String::new()]);
    assert!(recorder.bindings.lock().unwrap().is_empty());
}

#[test]
fn test_config_bindings_are_delivered() {
    let collector = Collector::default();
    *collector.config_body.lock().unwrap() = json!({
        "event_bindings": { "events": [{ "event_name": "click" }] },
        "vtrack_server_url": "wss://bindings.test/ws"
    })
    .to_string();
    let addr = start(collector);
    let dir = TempDir::new().unwrap();
    let (queue, _db) = open_queue(&queue_config(addr), &dir);
    let recorder = Arc::new(Recorder::default());

    queue.check_config(recorder.clone());
    wait_until("config", || !recorder.urls.lock().unwrap().is_empty());

    assert_eq!(
        *recorder.bindings.lock().unwrap(),
        vec![vec![json!({ "event_name": "click" })]]
    );
    assert_eq!(
        *recorder.urls.lock().unwrap(),
        vec!["wss://bindings.test/ws".to_string()]
    );
}
