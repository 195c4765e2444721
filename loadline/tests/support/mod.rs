//! Threaded HTTP test servers for the engine integration tests.
//!
//! Plain and TLS variants accept real connections, speak enough HTTP/1.1
//! for the engine (keep-alive, Connection: close, per-path bodies), count
//! hits per path, and can stall a request forever (`/stall`) to exercise
//! hard shutdown.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Clone, Default)]
struct Stats {
    hits: Arc<Mutex<HashMap<String, u64>>>,
    accepted: Arc<AtomicU64>,
}

pub struct TestServer {
    addr: SocketAddr,
    stats: Stats,
    stop: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Start a plain-HTTP server on an ephemeral port.
    pub fn start() -> TestServer {
        Self::start_inner(None)
    }

    /// Start a TLS server with a fresh self-signed certificate.
    pub fn start_tls() -> TestServer {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .expect("generate certificate");
        let certs = vec![cert.cert.der().clone()];
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
            cert.key_pair.serialize_der().into(),
        );
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .expect("server TLS config");
        Self::start_inner(Some(Arc::new(config)))
    }

    fn start_inner(tls: Option<Arc<rustls::ServerConfig>>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let stats = Stats::default();
        let stop = Arc::new(AtomicBool::new(false));

        let accept_stats = stats.clone();
        let accept_stop = Arc::clone(&stop);
        let accept_thread = thread::spawn(move || {
            loop {
                if accept_stop.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        accept_stats.accepted.fetch_add(1, Ordering::Relaxed);
                        let stats = accept_stats.clone();
                        let stop = Arc::clone(&accept_stop);
                        let tls = tls.clone();
                        thread::spawn(move || match tls {
                            Some(config) => serve_tls(stream, config, stats, stop),
                            None => {
                                stream.set_nonblocking(false).ok();
                                serve(stream, stats, stop);
                            }
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        TestServer {
            addr,
            stats,
            stop,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }

    pub fn tls_url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.addr.port(), path)
    }

    /// Requests observed for one path.
    pub fn hits(&self, path: &str) -> u64 {
        *self.stats.hits.lock().unwrap().get(path).unwrap_or(&0)
    }

    /// Requests observed across all paths.
    pub fn total_hits(&self) -> u64 {
        self.stats.hits.lock().unwrap().values().sum()
    }

    /// Connections accepted.
    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.accept_thread.take() {
            t.join().ok();
        }
    }
}

fn serve(mut stream: TcpStream, stats: Stats, stop: Arc<AtomicBool>) {
    stream
        .set_read_timeout(Some(Duration::from_secs(1)))
        .ok();
    serve_stream(&mut stream, stats, stop);
}

fn serve_tls(stream: TcpStream, config: Arc<rustls::ServerConfig>, stats: Stats, stop: Arc<AtomicBool>) {
    stream.set_nonblocking(false).ok();
    stream.set_read_timeout(Some(Duration::from_secs(1))).ok();
    let conn = match rustls::ServerConnection::new(config) {
        Ok(c) => c,
        Err(_) => return,
    };
    let mut tls = rustls::StreamOwned::new(conn, stream);
    serve_stream(&mut tls, stats, stop);
    tls.conn.send_close_notify();
    let _ = tls.flush();
}

/// One connection's request loop. Returns when the client goes away, sends
/// `Connection: close`, or the server is stopped.
fn serve_stream<S: Read + Write>(stream: &mut S, stats: Stats, stop: Arc<AtomicBool>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        // Read until the header block is complete.
        let header_end = loop {
            if let Some(pos) = find_blank_line(&buf) {
                break pos;
            }
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => return,
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        let path = request_line.split(' ').nth(1).unwrap_or("/").to_string();
        let mut close = false;
        let mut content_length = 0usize;
        for line in lines {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("connection:") && lower.contains("close") {
                close = true;
            }
            if let Some(v) = lower.strip_prefix("content-length:") {
                content_length = v.trim().parse().unwrap_or(0);
            }
        }

        // Drain the request body.
        let body_start = header_end + 4;
        while buf.len() < body_start + content_length {
            match stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
        buf.drain(..body_start + content_length);

        *stats.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

        if path == "/stall" {
            // Hold the request open without answering until shutdown.
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(20));
            }
            return;
        }

        let body: &[u8] = if path == "/hello" {
            b"world"
        } else {
            path.as_bytes()
        };
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n",
            body.len()
        )
        .into_bytes();
        if close {
            response.extend_from_slice(b"Connection: close\r\n");
        }
        response.extend_from_slice(b"\r\n");
        response.extend_from_slice(body);
        if stream.write_all(&response).is_err() {
            return;
        }
        let _ = stream.flush();
        if close {
            return;
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Accept any certificate; the TLS tests use a self-signed one.
#[derive(Debug)]
pub struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl NoVerification {
    pub fn new() -> Self {
        NoVerification(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// A client config that trusts anything, for tests against the TLS server.
pub fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
            .with_no_client_auth(),
    )
}
