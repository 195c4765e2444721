//! TLS integration: the engine against a rustls test server with a
//! self-signed certificate and a no-verification client config.

mod support;

use std::sync::Arc;
use std::time::Duration;

use loadline::config::TlsClientConfig;
use loadline::url::UrlTable;
use loadline::worker::Worker;
use loadline::WorkerConfig;

use support::TestServer;

fn tls_worker(url: &str, mut config: WorkerConfig) -> Worker {
    config.tls = Some(TlsClientConfig {
        client_config: support::insecure_client_config(),
    });
    let urls = Arc::new(UrlTable::init_one(url).expect("url"));
    Worker::new(0, config, urls).expect("worker")
}

#[test]
fn https_load_counts_only_2xx() {
    let server = TestServer::start_tls();
    let mut worker = tls_worker(
        &server.tls_url("/hello"),
        WorkerConfig {
            num_connections: 4,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_secs(1));
    worker.stop();

    let counters = worker.exchange_counters();
    assert!(
        counters.requests_ok >= 20,
        "expected steady TLS throughput, got {}",
        counters.requests_ok
    );
    assert_eq!(counters.requests_failed, 0);
    assert!(server.hits("/hello") >= counters.requests_ok);
}

#[test]
fn https_keep_alive_handshakes_once_per_connection() {
    let server = TestServer::start_tls();
    let mut worker = tls_worker(
        &server.tls_url("/hello"),
        WorkerConfig {
            num_connections: 2,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(700));
    worker.stop();

    let counters = worker.exchange_counters();
    assert!(counters.requests_ok > 2);
    assert_eq!(counters.connects_opened, 2);
    assert_eq!(server.accepted(), 2);
}

#[test]
fn https_run_once() {
    let server = TestServer::start_tls();
    let mut worker = tls_worker(
        &server.tls_url("/hello"),
        WorkerConfig {
            num_connections: 1,
            run_once: true,
            ..WorkerConfig::default()
        },
    );
    worker.start().unwrap();
    worker.join();

    let counters = worker.exchange_counters();
    assert_eq!(counters.requests_ok, 1);
    assert_eq!(counters.requests_failed, 0);
}
