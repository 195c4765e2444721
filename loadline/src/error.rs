use std::io;

use thiserror::Error;

/// Errors returned by the load engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A target URL did not match the accepted grammar.
    #[error("invalid URL {0:?}")]
    InvalidUrl(String),
    /// DNS resolution produced no usable address.
    #[error("cannot resolve host {host:?}: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },
    /// A URL file could not be used, with the offending line.
    #[error("URL file {path:?}, line {line}: {reason}")]
    UrlFile {
        path: String,
        line: usize,
        reason: String,
    },
    /// TLS session setup failed.
    #[error("TLS setup: {0}")]
    Tls(#[from] rustls::Error),
    /// The server sent a response the parser could not frame.
    #[error("malformed HTTP response: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
