//! Lock-free result accounting.
//!
//! Each worker owns exactly one [`Counters`] snapshot at a time and mutates
//! it only from its own thread. The controller observes by swapping in a
//! fresh zeroed snapshot through a single pointer-sized atomic
//! ([`CounterSlot::exchange`]) and then owns the one it got back. No other
//! cross-thread access exists.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Instant;

use hdrhistogram::Histogram;

/// Latency histogram range: 1ns to 60s at three significant figures.
const LATENCY_MAX_NS: u64 = 60_000_000_000;

pub(crate) fn latency_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, LATENCY_MAX_NS, 3).expect("latency histogram bounds")
}

/// One accumulation period of a single worker.
pub struct Counters {
    pub requests_ok: u64,
    pub requests_failed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub connects_opened: u64,
    pub socket_errors: u64,
    /// Request latencies in nanoseconds.
    pub latency: Histogram<u64>,
    pub started: Instant,
    pub ended: Option<Instant>,
}

impl Counters {
    pub fn new() -> Self {
        Counters {
            requests_ok: 0,
            requests_failed: 0,
            bytes_read: 0,
            bytes_written: 0,
            connects_opened: 0,
            socket_errors: 0,
            latency: latency_histogram(),
            started: Instant::now(),
            ended: None,
        }
    }

    /// Record a finished exchange. 2xx counts as success, anything else
    /// (including status 0 for transport errors) as failure.
    pub fn record_result(&mut self, status: u16, latency_ns: u64) {
        if (200..300).contains(&status) {
            self.requests_ok += 1;
        } else {
            self.requests_failed += 1;
        }
        self.latency.saturating_record(latency_ns.max(1));
    }

    pub fn record_read(&mut self, n: usize) {
        self.bytes_read += n as u64;
    }

    pub fn record_write(&mut self, n: usize) {
        self.bytes_written += n as u64;
    }

    pub fn record_connect_open(&mut self) {
        self.connects_opened += 1;
    }

    pub fn record_socket_error(&mut self) {
        self.socket_errors += 1;
    }

    /// Fold another snapshot into this one.
    pub fn merge(&mut self, other: &Counters) {
        self.requests_ok += other.requests_ok;
        self.requests_failed += other.requests_failed;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.connects_opened += other.connects_opened;
        self.socket_errors += other.socket_errors;
        self.latency
            .add(&other.latency)
            .expect("latency histograms share bounds");
    }
}

impl Default for Counters {
    fn default() -> Self {
        Counters::new()
    }
}

/// The atomic slot holding a worker's current snapshot.
///
/// Protocol: the owning worker is the single writer and goes through
/// [`with`](Self::with) for every update, re-loading the pointer each time
/// and never holding it across a loop step. The controller only calls
/// [`exchange`](Self::exchange), which installs a fresh snapshot and
/// transfers ownership of the previous one.
pub struct CounterSlot {
    ptr: AtomicPtr<Counters>,
}

// Safety: Counters is only ever written through `with` on the owning
// worker's thread; other threads touch nothing but the pointer itself,
// which is an atomic.
unsafe impl Send for CounterSlot {}
unsafe impl Sync for CounterSlot {}

impl CounterSlot {
    pub fn new() -> Self {
        CounterSlot {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(Counters::new()))),
        }
    }

    /// Run `f` against the current snapshot. Worker thread only.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
        let p = self.ptr.load(Ordering::Acquire);
        // Safety: single-writer protocol above; `p` is always a live
        // allocation installed by `new` or `exchange`.
        f(unsafe { &mut *p })
    }

    /// Swap in a fresh zeroed snapshot and take ownership of the previous
    /// one. Its `ended` timestamp is set on the way out.
    pub fn exchange(&self) -> Box<Counters> {
        let fresh = Box::into_raw(Box::new(Counters::new()));
        let old = self.ptr.swap(fresh, Ordering::AcqRel);
        // Safety: `old` was the installed snapshot; after the swap no new
        // writer access can begin through it.
        let mut snap = unsafe { Box::from_raw(old) };
        snap.ended = Some(Instant::now());
        snap
    }
}

impl Default for CounterSlot {
    fn default() -> Self {
        CounterSlot::new()
    }
}

impl Drop for CounterSlot {
    fn drop(&mut self) {
        let p = self.ptr.load(Ordering::Acquire);
        if !p.is_null() {
            // Safety: the slot owns the installed snapshot.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}
