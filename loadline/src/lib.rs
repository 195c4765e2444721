//! loadline — closed-loop HTTP/HTTPS load generator.
//!
//! N worker threads each drive many non-blocking HTTP connections through a
//! single-threaded readiness event loop. Concurrency is closed-loop: every
//! connection holds at most one request in flight and starts the next only
//! when the previous one completes, optionally after a think-time pause.
//! Workers are steered while running (stop, resize) through per-worker
//! command queues, and their counters are observed through an atomic
//! snapshot swap, so the hot path takes no locks.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use loadline::{Recorder, UrlTable, Worker, WorkerConfig};
//!
//! fn main() -> loadline::error::Result<()> {
//!     let urls = Arc::new(UrlTable::init_one("http://127.0.0.1:8080/hello")?);
//!     let config = WorkerConfig {
//!         num_connections: 10,
//!         ..WorkerConfig::default()
//!     };
//!     let mut workers = vec![Worker::new(0, config, urls)?];
//!     for w in &mut workers {
//!         w.start()?;
//!     }
//!     let mut recorder = Recorder::start(&workers);
//!     std::thread::sleep(Duration::from_secs(10));
//!     for w in &mut workers {
//!         w.stop();
//!     }
//!     recorder.finish(&workers);
//!     recorder.summary().write_text(&mut std::io::stdout().lock())?;
//!     Ok(())
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod connection;
pub(crate) mod parse;
pub(crate) mod sock;

// ── Public modules ──────────────────────────────────────────────────────
pub mod command;
pub mod config;
pub mod counters;
pub mod error;
pub mod lines;
pub mod report;
pub mod url;
pub mod worker;

/// Cross-thread worker directives.
pub use command::{Command, CommandQueue};
/// Auto-header override mask.
pub use config::HeaderOverrides;
/// Request-signing capability (e.g. OAuth).
pub use config::RequestSigner;
/// Pre-built rustls client configuration wrapper.
pub use config::TlsClientConfig;
/// Per-worker configuration.
pub use config::WorkerConfig;
/// One accumulation period of a single worker.
pub use counters::Counters;
/// Engine errors.
pub use error::Error;
/// Buffered line-oriented reader.
pub use lines::LineState;
/// Controller-side counter aggregation.
pub use report::{IntervalReport, Recorder, RunSummary};
/// Parsed target URL.
pub use url::UrlInfo;
/// Immutable target registry with round-robin addresses.
pub use url::UrlTable;
/// One event-loop worker thread.
pub use worker::Worker;
