//! Target URL registry.
//!
//! URLs are parsed and DNS-resolved once at startup; afterwards the table is
//! immutable and shared read-only across workers. Selection is uniform
//! random, which converges to round-robin proportions across many draws.

use std::fs::File;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use crate::error::{Error, Result};
use crate::lines::LineState;

const URL_FILE_BUF: usize = 8192;

/// One parsed target. Immutable after construction.
#[derive(Debug)]
pub struct UrlInfo {
    pub is_tls: bool,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
    /// Value for the Host header: the port is appended only when it is not
    /// the scheme default.
    pub host_header: String,
    /// Resolved IPv4 addresses, each carrying `port`.
    pub addresses: Vec<SocketAddr>,
}

impl UrlInfo {
    /// Parse a URL of the form `http[s]://host[:port][/path]` and resolve
    /// the host. Fails fast on grammar or DNS errors.
    pub fn init(url: &str) -> Result<UrlInfo> {
        let (is_tls, rest) = if let Some(r) = url.strip_prefix("http://") {
            (false, r)
        } else if let Some(r) = url.strip_prefix("https://") {
            (true, r)
        } else {
            return Err(Error::InvalidUrl(url.to_string()));
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        let default_port = if is_tls { 443 } else { 80 };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| Error::InvalidUrl(url.to_string()))?;
                (h, port)
            }
            None => (authority, default_port),
        };

        if host.is_empty()
            || !host
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
        {
            return Err(Error::InvalidUrl(url.to_string()));
        }

        let host_header = if port == default_port {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };

        let addresses: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Dns {
                host: host.to_string(),
                source: e,
            })?
            .filter(SocketAddr::is_ipv4)
            .collect();
        if addresses.is_empty() {
            return Err(Error::Dns {
                host: host.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no IPv4 addresses",
                ),
            });
        }

        Ok(UrlInfo {
            is_tls,
            host: host.to_string(),
            port,
            path: path.to_string(),
            host_header,
            addresses,
        })
    }
}

/// Immutable set of targets with round-robin address selection.
#[derive(Debug)]
pub struct UrlTable {
    urls: Vec<UrlInfo>,
}

impl UrlTable {
    /// Build a table holding a single URL.
    pub fn init_one(url: &str) -> Result<UrlTable> {
        Ok(UrlTable {
            urls: vec![UrlInfo::init(url)?],
        })
    }

    /// Build a table from a file of LF-terminated URLs, one per line.
    /// Blank or malformed lines fail with a diagnostic naming the line.
    pub fn init_file<P: AsRef<Path>>(path: P) -> Result<UrlTable> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let mut file = File::open(path).map_err(|e| Error::UrlFile {
            path: path_str.clone(),
            line: 0,
            reason: e.to_string(),
        })?;

        let mut urls = Vec::new();
        let mut line_no = 0usize;
        let mut ls = LineState::new(URL_FILE_BUF);
        loop {
            // A zero-byte read only means end of file when there was room
            // to read into.
            let had_space = !ls.read_info().is_empty();
            let n = ls.read_file(&mut file)?;
            while ls.next() {
                line_no += 1;
                let raw = ls.line().to_vec();
                let text = std::str::from_utf8(&raw)
                    .map_err(|_| Error::UrlFile {
                        path: path_str.clone(),
                        line: line_no,
                        reason: "not valid UTF-8".to_string(),
                    })?
                    .trim();
                if text.is_empty() {
                    return Err(Error::UrlFile {
                        path: path_str.clone(),
                        line: line_no,
                        reason: "blank line".to_string(),
                    });
                }
                let url = UrlInfo::init(text).map_err(|e| Error::UrlFile {
                    path: path_str.clone(),
                    line: line_no,
                    reason: e.to_string(),
                })?;
                urls.push(url);
            }
            if !ls.consume() {
                return Err(Error::UrlFile {
                    path: path_str.clone(),
                    line: line_no + 1,
                    reason: format!("line longer than {URL_FILE_BUF} bytes"),
                });
            }
            if had_space && n == 0 {
                break;
            }
        }

        if urls.is_empty() {
            return Err(Error::UrlFile {
                path: path_str,
                line: 0,
                reason: "no URLs in file".to_string(),
            });
        }
        Ok(UrlTable { urls })
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn get(&self, index: usize) -> &UrlInfo {
        &self.urls[index]
    }

    /// Whether any target uses the https scheme.
    pub fn any_tls(&self) -> bool {
        self.urls.iter().any(|u| u.is_tls)
    }

    /// Draw the index of the next target. A single-entry table always
    /// returns that entry regardless of the random value.
    pub fn get_next(&self, rng: &mut fastrand::Rng) -> usize {
        if self.urls.len() == 1 {
            0
        } else {
            rng.usize(..self.urls.len())
        }
    }

    /// The address connection `sequence` should dial for this target:
    /// `addresses[sequence % count]`, so a connection walks the A-record set.
    pub fn address(&self, index: usize, sequence: usize) -> SocketAddr {
        let addrs = &self.urls[index].addresses;
        addrs[sequence % addrs.len()]
    }

    /// Whether two targets resolve to the same server from the point of view
    /// of connection `sequence`: equal address counts and the same dialed
    /// address, so round-robin equivalence holds across the switch.
    pub fn is_same_server(&self, a: usize, b: usize, sequence: usize) -> bool {
        if a == b {
            return true;
        }
        let ua = &self.urls[a];
        let ub = &self.urls[b];
        ua.addresses.len() == ub.addresses.len()
            && self.address(a, sequence) == self.address(b, sequence)
    }
}
