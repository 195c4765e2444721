//! Event-loop worker threads.
//!
//! A [`Worker`] owns one OS thread running a single-threaded `mio::Poll`
//! loop over its connections. The controller steers it through the command
//! queue (wake + drain) and observes it through the counter slot; nothing
//! else crosses the thread boundary.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::{Events, Poll, Registry, Token, Waker};

use crate::command::{Command, CommandQueue};
use crate::config::WorkerConfig;
use crate::connection::Connection;
use crate::counters::{CounterSlot, Counters};
use crate::error::Result;
use crate::url::UrlTable;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

/// Controller-side handle for one I/O worker thread.
pub struct Worker {
    index: usize,
    config: Arc<WorkerConfig>,
    urls: Arc<UrlTable>,
    queue: Arc<CommandQueue>,
    waker: Arc<Waker>,
    counters: Arc<CounterSlot>,
    poll: Option<Poll>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Create a worker. The event loop and waker exist from this point, so
    /// commands may be posted before `start()`; they are drained as soon as
    /// the loop runs.
    pub fn new(index: usize, config: WorkerConfig, urls: Arc<UrlTable>) -> Result<Worker> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Worker {
            index,
            config: Arc::new(config),
            urls,
            queue: Arc::new(CommandQueue::new()),
            waker: Arc::new(waker),
            counters: Arc::new(CounterSlot::new()),
            poll: Some(poll),
            thread: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Spawn the worker thread and start driving connections.
    pub fn start(&mut self) -> Result<()> {
        let poll = self.poll.take().expect("worker already started");
        let registry = poll.registry().try_clone()?;
        let inner = Inner {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            queue: Arc::clone(&self.queue),
            conns: Vec::new(),
            live: Vec::new(),
            hard_deadline: None,
            initial_connections: self.config.num_connections,
            ctx: LoopCtx {
                index: self.index,
                cfg: Arc::clone(&self.config),
                urls: Arc::clone(&self.urls),
                rng: fastrand::Rng::with_seed(0x10ad11e + self.index as u64),
                counters: Arc::clone(&self.counters),
                registry,
                keep_running: !self.config.run_once,
            },
        };
        let handle = thread::Builder::new()
            .name(format!("loadline-worker-{}", self.index))
            .spawn(move || inner.run())
            .map_err(crate::error::Error::Io)?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Change the number of active connections. Excess connections finish
    /// their current request before closing.
    pub fn set_connections(&self, n: usize) {
        self.queue.push(Command::SetConnections(n));
        self.wake();
    }

    /// Ask the worker to finish in-flight requests and exit; after
    /// `timeout` its remaining sockets are closed forcibly.
    pub fn request_stop(&self, timeout: Duration) {
        debug!("worker {}: stop requested ({timeout:?})", self.index);
        self.queue.push(Command::Stop { timeout });
        self.wake();
    }

    /// Wait for the worker thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            warn!("worker {} panicked", self.index);
        }
    }

    /// Stop with a one-second grace period and wait for exit.
    pub fn stop(&mut self) {
        self.request_stop(Duration::from_secs(1));
        self.join();
    }

    /// Swap in a fresh zeroed counter snapshot and return the previous one.
    pub fn exchange_counters(&self) -> Box<Counters> {
        self.counters.exchange()
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("worker {}: wake failed: {e}", self.index);
        }
    }
}

/// State shared by the loop and its connections, split off from the
/// connection vector so a `&mut Connection` and `&mut LoopCtx` can coexist.
pub(crate) struct LoopCtx {
    /// Worker index; also the starting point for address round-robin.
    pub index: usize,
    pub cfg: Arc<WorkerConfig>,
    pub urls: Arc<UrlTable>,
    pub rng: fastrand::Rng,
    pub counters: Arc<CounterSlot>,
    pub registry: Registry,
    /// Cleared by the Stop command; connections consult it when recycling.
    pub keep_running: bool,
}

struct Inner {
    poll: Poll,
    events: Events,
    queue: Arc<CommandQueue>,
    /// All connections ever created, indexed by token - 1. Finished ones
    /// stay as inert `Done` entries so tokens remain stable.
    conns: Vec<Connection>,
    /// Indices of the connections making up the current target count, in
    /// creation order; shrinking pops from the back.
    live: Vec<usize>,
    hard_deadline: Option<Instant>,
    initial_connections: usize,
    ctx: LoopCtx,
}

impl Inner {
    fn run(mut self) {
        debug!(
            "worker {}: starting with {} connections",
            self.ctx.index, self.initial_connections
        );
        self.resize(self.initial_connections);

        loop {
            if self.finished() {
                break;
            }
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("worker {}: poll failed: {e}", self.ctx.index);
                break;
            }
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue; // commands are drained below
                }
                let idx = token.0 - 1;
                if let Some(conn) = self.conns.get_mut(idx) {
                    conn.on_ready(&mut self.ctx);
                }
            }
            self.drain_commands();
            self.fire_timers();
            if let Some(deadline) = self.hard_deadline
                && Instant::now() >= deadline
                && !self.all_done()
            {
                debug!("worker {}: going down for a hard shutdown", self.ctx.index);
                for conn in &mut self.conns {
                    if !conn.done() {
                        conn.force_close(&mut self.ctx);
                    }
                }
                break;
            }
        }
        debug!("worker {}: event loop finished", self.ctx.index);
    }

    fn finished(&self) -> bool {
        !self.ctx.keep_running && self.all_done()
    }

    fn all_done(&self) -> bool {
        self.conns.iter().all(Connection::done)
    }

    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut next: Option<Instant> = self.hard_deadline;
        for conn in &self.conns {
            if let Some(when) = conn.next_deadline() {
                next = Some(match next {
                    Some(cur) => cur.min(when),
                    None => when,
                });
            }
        }
        next.map(|when| when.saturating_duration_since(now))
    }

    fn drain_commands(&mut self) {
        while let Some(cmd) = self.queue.pop() {
            match cmd {
                Command::Stop { timeout } => {
                    debug!("worker {}: marking loop to stop", self.ctx.index);
                    self.ctx.keep_running = false;
                    self.hard_deadline = Some(Instant::now() + timeout);
                }
                Command::SetConnections(n) => self.resize(n),
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for conn in &mut self.conns {
            conn.poll_timer(now, &mut self.ctx);
        }
    }

    fn resize(&mut self, target: usize) {
        debug!(
            "worker {}: current connections = {}, new = {target}",
            self.ctx.index,
            self.live.len()
        );
        while self.live.len() > target {
            if let Some(idx) = self.live.pop() {
                debug!(
                    "worker {}: asking connection {} to terminate",
                    self.ctx.index,
                    self.conns[idx].index()
                );
                self.conns[idx].stop();
            }
        }
        while self.live.len() < target {
            let idx = self.conns.len();
            let mut conn = Connection::new(idx, &mut self.ctx);
            conn.start_connect(&mut self.ctx);
            self.conns.push(conn);
            self.live.push(idx);
        }
    }
}
