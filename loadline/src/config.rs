//! Worker configuration.
//!
//! The controller fills a [`WorkerConfig`] and hands a clone to each worker
//! before `start()`. Everything here is read-only once the worker runs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::url::UrlInfo;

/// TLS configuration for https targets. Pass a pre-built rustls
/// ClientConfig; the engine treats verification policy, roots, and ALPN as
/// opaque.
#[derive(Clone)]
pub struct TlsClientConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

/// Capability for signing outgoing requests. The engine asks for the value
/// of the Authorization header right before each request is serialized.
pub trait RequestSigner: Send + Sync {
    fn authorization(&self, verb: &str, url: &UrlInfo, rng: &mut fastrand::Rng) -> String;
}

/// Which of the automatically inserted headers the user supplied explicitly.
/// A set flag suppresses the corresponding auto header.
#[derive(Clone, Copy, Default)]
pub struct HeaderOverrides {
    pub host: bool,
    pub content_length: bool,
    pub content_type: bool,
    pub authorization: bool,
    pub connection: bool,
    pub user_agent: bool,
}

impl HeaderOverrides {
    /// Record a user-supplied header by name (case-insensitive).
    pub fn note(&mut self, name: &str) {
        if name.eq_ignore_ascii_case("Host") {
            self.host = true;
        } else if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = true;
        } else if name.eq_ignore_ascii_case("Content-Type") {
            self.content_type = true;
        } else if name.eq_ignore_ascii_case("Authorization") {
            self.authorization = true;
        } else if name.eq_ignore_ascii_case("Connection") {
            self.connection = true;
        } else if name.eq_ignore_ascii_case("User-Agent") {
            self.user_agent = true;
        }
    }
}

/// Per-worker configuration. All fields must be populated before `start()`.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Connections this worker opens at startup.
    pub num_connections: usize,
    /// Log the full I/O trace for every connection.
    pub verbose: bool,
    /// HTTP request method.
    pub http_verb: String,
    /// Request body. Empty means no body and no body headers.
    pub send_data: Bytes,
    /// Extra header lines, sent verbatim (`Name: Value`).
    pub headers: Vec<String>,
    /// Which auto headers the `headers` list overrides.
    pub headers_set: HeaderOverrides,
    /// Pause inserted between a response and the next request.
    pub think_time: Option<Duration>,
    /// Send `Connection: close` and reconnect for every request.
    pub no_keep_alive: bool,
    /// Every connection performs exactly one request, then the worker exits.
    pub run_once: bool,
    /// TLS client configuration; required when any target is https.
    pub tls: Option<TlsClientConfig>,
    /// Optional request signer (e.g. OAuth); inserts Authorization.
    pub signer: Option<Arc<dyn RequestSigner>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            num_connections: 1,
            verbose: false,
            http_verb: "GET".to_string(),
            send_data: Bytes::new(),
            headers: Vec::new(),
            headers_set: HeaderOverrides::default(),
            think_time: None,
            no_keep_alive: false,
            run_once: false,
            tls: None,
            signer: None,
        }
    }
}
