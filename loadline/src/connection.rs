//! Per-connection request/response state machine.
//!
//! A connection drives one HTTP exchange at a time: connect, serialize and
//! send the request, stream-parse the response, then recycle (optionally
//! pausing for think time) or close. All I/O is non-blocking; a would-block
//! re-arms the readiness registration for the direction the socket asked
//! for and yields back to the worker loop.

use std::io::Write as _;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::{Interest, Token};

use crate::parse::{ParseProgress, ResponseParser};
use crate::sock::{ClientSock, Direction, Progress, ShutdownProgress};
use crate::worker::LoopCtx;

/// Read buffer size per connection; a response header line must fit.
const READ_BUF_SIZE: usize = 8192;
/// Wait between connect failures. If this is ever hit the benchmark is in
/// trouble anyway, but it keeps a dead server from melting the client.
pub(crate) const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

const USER_AGENT: &str = concat!("loadline ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Idle,
    Connecting,
    Writing,
    Reading,
    Thinking,
    Closing,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerKind {
    Think,
    Retry,
}

pub(crate) struct Connection {
    index: usize,
    state: ConnState,
    /// Cleared when this connection is asked to stop (shrink or shutdown).
    keep_running: bool,
    needs_open: bool,
    /// The serialized request must be rebuilt before the next send.
    write_dirty: bool,
    url: usize,
    /// Which resolved address to dial; advanced on connect failure.
    addr_seq: usize,
    sock: Option<ClientSock>,
    write_buf: Vec<u8>,
    write_pos: usize,
    line: crate::lines::LineState,
    parser: ResponseParser,
    start_time: Instant,
    timer: Option<(Instant, TimerKind)>,
    interest: Option<Interest>,
}

impl Connection {
    pub fn new(index: usize, ctx: &mut LoopCtx) -> Connection {
        let url = ctx.urls.get_next(&mut ctx.rng);
        let mut line = crate::lines::LineState::new(READ_BUF_SIZE);
        line.set_http_mode(true);
        Connection {
            index,
            state: ConnState::Idle,
            keep_running: true,
            needs_open: true,
            write_dirty: true,
            url,
            addr_seq: ctx.index,
            sock: None,
            write_buf: Vec::with_capacity(512),
            write_pos: 0,
            line,
            parser: ResponseParser::new(),
            start_time: Instant::now(),
            timer: None,
            interest: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn token(&self) -> Token {
        Token(self.index + 1)
    }

    pub fn done(&self) -> bool {
        self.state == ConnState::Done
    }

    /// Ask this connection to terminate once its current request finishes.
    pub fn stop(&mut self) {
        debug!("conn {}: stop requested", self.index);
        self.keep_running = false;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|(when, _)| when)
    }

    /// Kick off the first request.
    pub fn start_connect(&mut self, ctx: &mut LoopCtx) {
        self.connect_and_send(ctx);
    }

    /// Fire the pending timer if it is due.
    pub fn poll_timer(&mut self, now: Instant, ctx: &mut LoopCtx) {
        let Some((when, kind)) = self.timer else {
            return;
        };
        if when > now {
            return;
        }
        self.timer = None;
        debug!("conn {}: timer fired ({kind:?})", self.index);
        if !ctx.keep_running || !self.keep_running {
            // Stop arrived while we were pausing; there is no request in
            // flight, so just wind down.
            self.close(ctx);
            return;
        }
        self.connect_and_send(ctx);
    }

    /// Readiness event dispatch.
    pub fn on_ready(&mut self, ctx: &mut LoopCtx) {
        match self.state {
            ConnState::Connecting => self.finish_connect(ctx),
            ConnState::Writing => self.do_write(ctx),
            ConnState::Reading => self.do_read(ctx),
            ConnState::Closing => self.do_close(ctx),
            // Stale event for a state with no pending I/O.
            ConnState::Idle | ConnState::Thinking | ConnState::Done => {}
        }
    }

    /// Force the connection down during hard shutdown. An in-flight request
    /// is recorded as a failure.
    pub fn force_close(&mut self, ctx: &mut LoopCtx) {
        match self.state {
            ConnState::Connecting | ConnState::Writing | ConnState::Reading => {
                let elapsed = self.start_time.elapsed().as_nanos() as u64;
                ctx.counters.with(|c| {
                    c.record_socket_error();
                    c.record_result(0, elapsed);
                });
            }
            _ => {}
        }
        self.drop_sock(ctx);
        self.timer = None;
        self.state = ConnState::Done;
    }

    // ── Connect ─────────────────────────────────────────────────────

    fn connect_and_send(&mut self, ctx: &mut LoopCtx) {
        self.start_time = Instant::now();
        if self.needs_open {
            let url = ctx.urls.get(self.url);
            let addr = ctx.urls.address(self.url, self.addr_seq);
            debug!(
                "conn {}: connecting to {addr} (tls = {})",
                self.index, url.is_tls
            );
            let tls = if url.is_tls {
                match &ctx.cfg.tls {
                    Some(t) => Some((t.client_config.clone(), url.host.as_str())),
                    None => {
                        warn!("conn {}: https target but no TLS config", self.index);
                        self.connect_failed(ctx);
                        return;
                    }
                }
            } else {
                None
            };
            match ClientSock::connect(addr, tls) {
                Ok(mut sock) => {
                    if let Err(e) = sock.register(&ctx.registry, self.token(), Interest::WRITABLE)
                    {
                        warn!("conn {}: register failed: {e}", self.index);
                        self.connect_failed(ctx);
                        return;
                    }
                    ctx.counters.with(|c| c.record_connect_open());
                    self.interest = Some(Interest::WRITABLE);
                    self.sock = Some(sock);
                    self.state = ConnState::Connecting;
                }
                Err(e) => {
                    debug!("conn {}: error opening connection: {e}", self.index);
                    self.connect_failed(ctx);
                }
            }
        } else {
            self.write_request(ctx);
            self.state = ConnState::Writing;
            self.do_write(ctx);
        }
    }

    fn finish_connect(&mut self, ctx: &mut LoopCtx) {
        let Some(sock) = self.sock.as_mut() else {
            return;
        };
        if let Some(e) = sock.take_connect_error() {
            if e.kind() == std::io::ErrorKind::NotConnected {
                // Spurious wakeup; the connect is still in progress.
                return;
            }
            debug!("conn {}: connect failed: {e}", self.index);
            self.drop_sock(ctx);
            self.connect_failed(ctx);
            return;
        }
        debug!("conn {}: connected", self.index);
        self.write_request(ctx);
        self.state = ConnState::Writing;
        self.do_write(ctx);
    }

    fn connect_failed(&mut self, ctx: &mut LoopCtx) {
        let elapsed = self.start_time.elapsed().as_nanos() as u64;
        ctx.counters.with(|c| {
            c.record_socket_error();
            c.record_result(0, elapsed);
        });
        self.drop_sock(ctx);
        self.needs_open = true;
        // Roll to the next resolved address; one bad A record should not
        // stall the connection forever.
        self.addr_seq += 1;
        if !ctx.keep_running || !self.keep_running {
            self.state = ConnState::Done;
            return;
        }
        self.state = ConnState::Thinking;
        self.timer = Some((Instant::now() + CONNECT_RETRY_DELAY, TimerKind::Retry));
    }

    // ── Request serialization ───────────────────────────────────────

    fn write_request(&mut self, ctx: &mut LoopCtx) {
        if !self.write_dirty && ctx.cfg.signer.is_none() {
            // Same URL on a reused connection: resend the cached bytes.
            self.write_pos = 0;
            return;
        }
        let cfg = &ctx.cfg;
        let url = ctx.urls.get(self.url);
        let set = &cfg.headers_set;
        let buf = &mut self.write_buf;
        buf.clear();
        let _ = write!(buf, "{} {} HTTP/1.1\r\n", cfg.http_verb, url.path);
        if !set.user_agent {
            let _ = write!(buf, "User-Agent: {USER_AGENT}\r\n");
        }
        if !set.host {
            let _ = write!(buf, "Host: {}\r\n", url.host_header);
        }
        if !cfg.send_data.is_empty() {
            if !set.content_type {
                let _ = write!(buf, "Content-Type: text/plain\r\n");
            }
            if !set.content_length {
                let _ = write!(buf, "Content-Length: {}\r\n", cfg.send_data.len());
            }
        }
        if let Some(signer) = &cfg.signer {
            let auth = signer.authorization(&cfg.http_verb, url, &mut ctx.rng);
            let _ = write!(buf, "Authorization: {auth}\r\n");
        }
        if cfg.no_keep_alive && !set.connection {
            let _ = write!(buf, "Connection: close\r\n");
        }
        for h in &cfg.headers {
            let _ = write!(buf, "{h}\r\n");
        }
        let _ = write!(buf, "\r\n");
        buf.extend_from_slice(&cfg.send_data);
        self.write_pos = 0;
        self.write_dirty = false;
        debug!(
            "conn {}: request is {} bytes",
            self.index,
            self.write_buf.len()
        );
    }

    // ── Write path ──────────────────────────────────────────────────

    fn do_write(&mut self, ctx: &mut LoopCtx) {
        loop {
            let Some(sock) = self.sock.as_mut() else {
                return;
            };
            let pending = &self.write_buf[self.write_pos..];
            match sock.write_some(pending) {
                Ok(Progress::Done(n)) => {
                    ctx.counters.with(|c| c.record_write(n));
                    self.write_pos += n;
                    if self.write_pos == self.write_buf.len() {
                        self.write_done(ctx);
                        return;
                    }
                }
                Ok(Progress::WouldBlock(dir)) => {
                    self.arm(ctx, dir);
                    return;
                }
                Ok(Progress::Eof) => {
                    debug!("conn {}: peer closed during write", self.index);
                    self.request_failed(ctx);
                    return;
                }
                Err(e) => {
                    debug!("conn {}: error on write: {e}", self.index);
                    self.request_failed(ctx);
                    return;
                }
            }
        }
    }

    fn write_done(&mut self, ctx: &mut LoopCtx) {
        debug!("conn {}: write complete, reading", self.index);
        self.parser
            .reset(ctx.cfg.http_verb.eq_ignore_ascii_case("HEAD"));
        self.state = ConnState::Reading;
        self.do_read(ctx);
    }

    // ── Read path ───────────────────────────────────────────────────

    fn do_read(&mut self, ctx: &mut LoopCtx) {
        loop {
            // Consume whatever is already buffered before reading again.
            match self.parser.parse(&mut self.line) {
                Ok(ParseProgress::Complete) => {
                    self.read_done(ctx);
                    return;
                }
                Ok(ParseProgress::NeedMore) => {}
                Err(e) => {
                    debug!("conn {}: parse error: {e}", self.index);
                    self.request_failed(ctx);
                    return;
                }
            }
            if !self.line.consume() {
                debug!("conn {}: response line exceeds buffer", self.index);
                self.request_failed(ctx);
                return;
            }
            let Some(sock) = self.sock.as_mut() else {
                return;
            };
            match sock.read_some(self.line.read_info()) {
                Ok(Progress::Done(n)) => {
                    ctx.counters.with(|c| c.record_read(n));
                    self.line.add_length(n);
                }
                Ok(Progress::WouldBlock(dir)) => {
                    self.arm(ctx, dir);
                    return;
                }
                Ok(Progress::Eof) => {
                    debug!("conn {}: EOF from server", self.index);
                    if self.parser.on_eof() {
                        self.read_done(ctx);
                    } else {
                        self.request_failed(ctx);
                    }
                    return;
                }
                Err(e) => {
                    debug!("conn {}: error reading from socket: {e}", self.index);
                    self.request_failed(ctx);
                    return;
                }
            }
        }
    }

    fn read_done(&mut self, ctx: &mut LoopCtx) {
        let elapsed = self.start_time.elapsed().as_nanos() as u64;
        let status = self.parser.status();
        ctx.counters.with(|c| c.record_result(status, elapsed));
        debug!("conn {}: {status} in {elapsed}ns", self.index);

        if !self.parser.keep_alive() {
            debug!("conn {}: server does not want keep-alive", self.index);
            self.recycle(ctx, true);
            return;
        }

        let old = self.url;
        self.url = ctx.urls.get_next(&mut ctx.rng);
        if !ctx.urls.is_same_server(old, self.url, ctx.index) {
            debug!("conn {}: switching to a different server", self.index);
            self.write_dirty = true;
            self.recycle(ctx, true);
        } else {
            if self.url != old {
                self.write_dirty = true;
            }
            self.recycle(ctx, false);
        }
    }

    /// Transport or framing failure mid-request: status 0, close, recycle.
    fn request_failed(&mut self, ctx: &mut LoopCtx) {
        let elapsed = self.start_time.elapsed().as_nanos() as u64;
        ctx.counters.with(|c| {
            c.record_socket_error();
            c.record_result(0, elapsed);
        });
        self.recycle(ctx, true);
    }

    // ── Recycle and close ───────────────────────────────────────────

    fn recycle(&mut self, ctx: &mut LoopCtx, close_conn: bool) {
        if close_conn || ctx.cfg.no_keep_alive || !ctx.keep_running || !self.keep_running {
            self.needs_open = true;
            self.close(ctx);
            return;
        }
        self.needs_open = false;
        if let Some(think) = ctx.cfg.think_time {
            self.add_think_time(think);
        } else {
            self.connect_and_send(ctx);
        }
    }

    fn add_think_time(&mut self, think: Duration) {
        debug!("conn {}: thinking for {think:?}", self.index);
        self.state = ConnState::Thinking;
        self.timer = Some((Instant::now() + think, TimerKind::Think));
    }

    fn close(&mut self, ctx: &mut LoopCtx) {
        if self.sock.is_none() {
            self.close_done(ctx);
            return;
        }
        self.state = ConnState::Closing;
        self.do_close(ctx);
    }

    fn do_close(&mut self, ctx: &mut LoopCtx) {
        let Some(sock) = self.sock.as_mut() else {
            self.close_done(ctx);
            return;
        };
        match sock.shutdown() {
            Ok(ShutdownProgress::Done) => {
                self.drop_sock(ctx);
                self.close_done(ctx);
            }
            Ok(ShutdownProgress::WouldBlock(dir)) => self.arm(ctx, dir),
            Err(e) => {
                debug!("conn {}: close finished with error: {e}", self.index);
                self.drop_sock(ctx);
                self.close_done(ctx);
            }
        }
    }

    fn close_done(&mut self, ctx: &mut LoopCtx) {
        if !self.keep_running || !ctx.keep_running {
            debug!("conn {}: closed and done", self.index);
            self.state = ConnState::Done;
            return;
        }
        if let Some(think) = ctx.cfg.think_time {
            self.add_think_time(think);
        } else {
            self.connect_and_send(ctx);
        }
    }

    fn drop_sock(&mut self, ctx: &mut LoopCtx) {
        if let Some(mut sock) = self.sock.take() {
            let _ = sock.deregister(&ctx.registry);
        }
        self.interest = None;
        // A fresh socket must not see stale bytes from the old one.
        self.line.clear();
    }

    fn arm(&mut self, ctx: &mut LoopCtx, dir: Direction) {
        let want = dir.interest();
        if self.interest == Some(want) {
            return;
        }
        let token = self.token();
        let Some(sock) = self.sock.as_mut() else {
            return;
        };
        match sock.reregister(&ctx.registry, token, want) {
            Ok(()) => self.interest = Some(want),
            Err(e) => warn!("conn {}: reregister failed: {e}", self.index),
        }
    }
}
