//! Engine integration tests: real sockets against a local test server.
//!
//! Each test builds one or more workers, points them at a [`support`]
//! server, and checks the exchanged counters (and the server's own hit
//! counts) after the run.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use loadline::counters::Counters;
use loadline::url::UrlTable;
use loadline::worker::Worker;
use loadline::WorkerConfig;

use support::TestServer;

fn make_worker(url: &str, config: WorkerConfig) -> Worker {
    let urls = Arc::new(UrlTable::init_one(url).expect("url"));
    Worker::new(0, config, urls).expect("worker")
}

fn drain(worker: &Worker) -> Box<Counters> {
    worker.exchange_counters()
}

#[test]
fn sustained_get_load() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 4,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_secs(1));
    worker.stop();

    let counters = drain(&worker);
    assert!(
        counters.requests_ok >= 100,
        "expected at least 100 ok requests, got {}",
        counters.requests_ok
    );
    assert_eq!(counters.requests_failed, 0);
    assert!(counters.bytes_read > 0);
    assert!(counters.bytes_written > 0);
    // Every completed request was seen by the server.
    assert!(server.hits("/hello") >= counters.requests_ok);
}

#[test]
fn run_once_sends_exactly_one_request_per_connection() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 3,
            run_once: true,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    worker.join();

    let counters = drain(&worker);
    assert_eq!(counters.requests_ok, 3);
    assert_eq!(counters.requests_failed, 0);
    assert_eq!(server.hits("/hello"), 3);
}

#[test]
fn no_keep_alive_opens_a_connection_per_request() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 1,
            no_keep_alive: true,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(500));
    worker.stop();

    let counters = drain(&worker);
    assert!(counters.requests_ok > 0);
    assert_eq!(counters.requests_failed, 0);
    // Each request rode its own connection (the final one may still be
    // opening when the stop lands).
    assert!(
        counters.connects_opened >= counters.requests_ok,
        "connects {} < ok {}",
        counters.connects_opened,
        counters.requests_ok
    );
}

#[test]
fn keep_alive_reuses_one_connection() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 1,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(500));
    worker.stop();

    let counters = drain(&worker);
    assert!(counters.requests_ok > 1);
    assert_eq!(counters.connects_opened, 1);
}

#[test]
fn graceful_stop_finishes_in_flight_requests() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 8,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    worker.request_stop(Duration::from_secs(1));
    let begin = Instant::now();
    worker.join();
    let took = begin.elapsed();
    assert!(took < Duration::from_secs(3), "join took {took:?}");

    let counters = drain(&worker);
    assert!(counters.requests_ok > 0);
    assert_eq!(counters.requests_failed, 0);
    // No double counting: the server cannot have answered fewer requests
    // than the client recorded, and in-flight slack is at most one request
    // per connection.
    let hits = server.hits("/hello");
    assert!(hits >= counters.requests_ok);
    assert!(hits - counters.requests_ok <= 8);
}

#[test]
fn hard_stop_fails_stalled_requests() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/stall"),
        WorkerConfig {
            num_connections: 4,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    worker.request_stop(Duration::from_secs(1));
    let begin = Instant::now();
    worker.join();
    let took = begin.elapsed();
    assert!(
        took >= Duration::from_millis(800) && took < Duration::from_secs(3),
        "join took {took:?}"
    );

    let counters = drain(&worker);
    assert_eq!(counters.requests_ok, 0);
    assert!(
        counters.requests_failed >= 4,
        "stalled requests should count as failures, got {}",
        counters.requests_failed
    );
}

#[test]
fn resize_up_adds_connections() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 2,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    worker.set_connections(10);
    std::thread::sleep(Duration::from_millis(500));
    worker.stop();

    let counters = drain(&worker);
    assert!(
        counters.connects_opened >= 10,
        "expected 8 new connections after resize, got {} total",
        counters.connects_opened
    );
    assert_eq!(counters.requests_failed, 0);
}

#[test]
fn resize_to_zero_stays_responsive() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 4,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    worker.set_connections(0);
    // Let in-flight requests finish and drain their counts.
    std::thread::sleep(Duration::from_millis(300));
    drop(drain(&worker));

    // With zero connections nothing gets requested.
    std::thread::sleep(Duration::from_millis(300));
    let quiet = drain(&worker);
    assert_eq!(quiet.requests_ok, 0);
    assert_eq!(quiet.requests_failed, 0);

    // The worker still answers commands.
    worker.set_connections(2);
    std::thread::sleep(Duration::from_millis(400));
    let resumed = drain(&worker);
    assert!(
        resumed.requests_ok > 0,
        "worker did not resume after resize to zero"
    );
    worker.stop();
}

#[test]
fn url_file_spreads_load_across_paths() {
    let server = TestServer::start();
    let dir = std::env::temp_dir();
    let path = dir.join(format!("loadline-engine-urls-{}.txt", std::process::id()));
    std::fs::write(
        &path,
        format!(
            "{}\n{}\n{}\n",
            server.url("/a"),
            server.url("/b"),
            server.url("/c")
        ),
    )
    .unwrap();

    let urls = Arc::new(UrlTable::init_file(&path).unwrap());
    std::fs::remove_file(&path).ok();
    assert_eq!(urls.len(), 3);

    let mut worker = Worker::new(
        0,
        WorkerConfig {
            num_connections: 4,
            ..WorkerConfig::default()
        },
        urls,
    )
    .unwrap();
    worker.start().unwrap();
    std::thread::sleep(Duration::from_secs(1));
    worker.stop();

    let total = server.total_hits();
    assert!(total > 50, "too few requests to judge spread: {total}");
    for p in ["/a", "/b", "/c"] {
        let hits = server.hits(p);
        assert!(
            hits > total / 10,
            "path {p} got {hits} of {total} requests"
        );
    }
}

#[test]
fn think_time_paces_requests() {
    let server = TestServer::start();
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 1,
            think_time: Some(Duration::from_millis(50)),
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(600));
    worker.stop();

    let counters = drain(&worker);
    assert!(counters.requests_ok >= 2);
    assert!(
        counters.requests_ok <= 14,
        "think time not respected: {} requests in 600ms",
        counters.requests_ok
    );
}

#[test]
fn custom_headers_and_body_are_sent() {
    let server = TestServer::start();
    let mut headers_set = loadline::HeaderOverrides::default();
    headers_set.note("X-Run");
    let mut worker = make_worker(
        &server.url("/hello"),
        WorkerConfig {
            num_connections: 1,
            run_once: true,
            http_verb: "POST".to_string(),
            send_data: bytes::Bytes::from_static(b"payload-bytes"),
            headers: vec!["X-Run: loadline-test".to_string()],
            headers_set,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    worker.join();

    let counters = drain(&worker);
    assert_eq!(counters.requests_ok, 1);
    assert_eq!(server.hits("/hello"), 1);
    // Request line + headers + body all hit the wire.
    assert!(counters.bytes_written as usize > "payload-bytes".len());
}
