//! Non-blocking client sockets, plain and TLS.
//!
//! Every operation either completes, reports EOF, or reports would-block
//! together with the readiness direction the caller must wait for. For TLS
//! the direction comes from rustls and can differ from the logical
//! operation: a read may need the socket writable while handshake records
//! are pending, and vice versa. The handshake itself runs transparently
//! inside `read_some`/`write_some`; `shutdown` flushes close_notify before
//! the stream goes down.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::pki_types::ServerName;
use rustls::ClientConnection;

use crate::error::{Error, Result};

/// Readiness direction to wait for after a would-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// Outcome of a read or write attempt.
#[derive(Debug)]
pub(crate) enum Progress {
    Done(usize),
    WouldBlock(Direction),
    Eof,
}

/// Outcome of a shutdown attempt.
#[derive(Debug)]
pub(crate) enum ShutdownProgress {
    Done,
    WouldBlock(Direction),
}

struct TlsState {
    conn: ClientConnection,
    tcp_eof: bool,
    close_notify_sent: bool,
}

pub(crate) struct ClientSock {
    stream: TcpStream,
    tls: Option<TlsState>,
}

impl ClientSock {
    /// Start a non-blocking connect. The socket is ready once it reports
    /// writable; connect errors surface through `take_connect_error`.
    pub fn connect(
        addr: SocketAddr,
        tls: Option<(Arc<rustls::ClientConfig>, &str)>,
    ) -> Result<ClientSock> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let tls = match tls {
            Some((config, host)) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| Error::InvalidUrl(host.to_string()))?;
                Some(TlsState {
                    conn: ClientConnection::new(config, name)?,
                    tcp_eof: false,
                    close_notify_sent: false,
                })
            }
            None => None,
        };
        Ok(ClientSock { stream, tls })
    }

    pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// After the first writable event on a connecting socket: `Some(err)`
    /// if the connect failed, `None` if it is established.
    pub fn take_connect_error(&mut self) -> Option<io::Error> {
        match self.stream.take_error() {
            Ok(Some(e)) => Some(e),
            Ok(None) => match self.stream.peer_addr() {
                Ok(_) => None,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    Some(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
                }
                Err(e) => Some(e),
            },
            Err(e) => Some(e),
        }
    }

    pub fn read_some(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        match &mut self.tls {
            None => loop {
                match self.stream.read(buf) {
                    Ok(0) => return Ok(Progress::Eof),
                    Ok(n) => return Ok(Progress::Done(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Progress::WouldBlock(Direction::Read));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
            Some(t) => tls_read(&mut self.stream, t, buf),
        }
    }

    pub fn write_some(&mut self, buf: &[u8]) -> io::Result<Progress> {
        match &mut self.tls {
            None => loop {
                match self.stream.write(buf) {
                    Ok(n) => return Ok(Progress::Done(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Progress::WouldBlock(Direction::Write));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
            Some(t) => tls_write(&mut self.stream, t, buf),
        }
    }

    /// Close the stream for good. TLS sends close_notify, flushes it, and
    /// then drains until the peer acknowledges or the stream ends.
    pub fn shutdown(&mut self) -> io::Result<ShutdownProgress> {
        match &mut self.tls {
            None => {
                self.stream.shutdown(std::net::Shutdown::Both)?;
                Ok(ShutdownProgress::Done)
            }
            Some(t) => {
                if !t.close_notify_sent {
                    t.conn.send_close_notify();
                    t.close_notify_sent = true;
                }
                if let Some(dir) = tls_flush(&mut self.stream, t)? {
                    return Ok(ShutdownProgress::WouldBlock(dir));
                }
                loop {
                    if t.tcp_eof {
                        break;
                    }
                    match t.conn.read_tls(&mut self.stream) {
                        Ok(0) => {
                            t.tcp_eof = true;
                            break;
                        }
                        Ok(_) => match t.conn.process_new_packets() {
                            Ok(state) if state.peer_has_closed() => break,
                            Ok(_) => continue,
                            Err(_) => break,
                        },
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(ShutdownProgress::WouldBlock(Direction::Read));
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                let _ = self.stream.shutdown(std::net::Shutdown::Both);
                Ok(ShutdownProgress::Done)
            }
        }
    }
}

/// Push pending TLS records (handshake, alerts, buffered data) onto the
/// wire. Returns the direction to wait for if the socket pushes back.
fn tls_flush(stream: &mut TcpStream, t: &mut TlsState) -> io::Result<Option<Direction>> {
    while t.conn.wants_write() {
        match t.conn.write_tls(stream) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(Some(Direction::Write));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

fn tls_read(stream: &mut TcpStream, t: &mut TlsState, buf: &mut [u8]) -> io::Result<Progress> {
    loop {
        // Handshake and alert output takes priority over plaintext.
        if let Some(dir) = tls_flush(stream, t)? {
            return Ok(Progress::WouldBlock(dir));
        }
        match t.conn.reader().read(buf) {
            Ok(0) => return Ok(Progress::Eof),
            Ok(n) => return Ok(Progress::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Progress::Eof),
            Err(e) => return Err(e),
        }
        if t.tcp_eof {
            return Ok(Progress::Eof);
        }
        match t.conn.read_tls(stream) {
            Ok(0) => {
                t.tcp_eof = true;
                let _ = t.conn.process_new_packets();
                return Ok(Progress::Eof);
            }
            Ok(_) => {
                t.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let dir = if t.conn.wants_write() {
                    Direction::Write
                } else {
                    Direction::Read
                };
                return Ok(Progress::WouldBlock(dir));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

fn tls_write(stream: &mut TcpStream, t: &mut TlsState, buf: &[u8]) -> io::Result<Progress> {
    // rustls buffers the plaintext (also during the handshake) and turns it
    // into records; the flush below moves them to the socket.
    let n = t.conn.writer().write(buf)?;
    match tls_flush(stream, t)? {
        Some(dir) if n == 0 => Ok(Progress::WouldBlock(dir)),
        // Ciphertext is still queued inside rustls; the next read_some or
        // write_some flushes it.
        _ => Ok(Progress::Done(n)),
    }
}
