//! Controller-side aggregation of worker counters.
//!
//! The [`Recorder`] drains counter snapshots out of the workers (each drain
//! zeroes the worker's accumulators), folds them into run totals, and
//! produces interval throughput figures while the run is live and a final
//! [`RunSummary`] afterwards. Latency percentiles come from the merged
//! histogram, in milliseconds.

use std::io;
use std::time::Instant;

use hdrhistogram::Histogram;

use crate::counters::Counters;
use crate::worker::Worker;

const NS_PER_MS: f64 = 1_000_000.0;
const MEGABIT: f64 = 1_048_576.0;

pub struct Recorder {
    requests_ok: u64,
    requests_failed: u64,
    bytes_read: u64,
    bytes_written: u64,
    connects_opened: u64,
    socket_errors: u64,
    latency: Histogram<u64>,
    run_start: Instant,
    interval_start: Instant,
    run_end: Option<Instant>,
}

/// Progress over one reporting interval.
pub struct IntervalReport {
    /// Requests completed successfully in this interval.
    pub requests: u64,
    /// Seconds since the recorder started.
    pub elapsed: f64,
    /// Length of this interval in seconds.
    pub interval: f64,
    /// Successful requests per second over this interval.
    pub throughput: f64,
}

impl Recorder {
    /// Begin measuring. Any counts the workers accumulated before this
    /// moment (e.g. during warmup) are discarded.
    pub fn start(workers: &[Worker]) -> Recorder {
        for w in workers {
            drop(w.exchange_counters());
        }
        let now = Instant::now();
        Recorder {
            requests_ok: 0,
            requests_failed: 0,
            bytes_read: 0,
            bytes_written: 0,
            connects_opened: 0,
            socket_errors: 0,
            latency: crate::counters::latency_histogram(),
            run_start: now,
            interval_start: now,
            run_end: None,
        }
    }

    fn absorb(&mut self, snap: &Counters) {
        self.requests_ok += snap.requests_ok;
        self.requests_failed += snap.requests_failed;
        self.bytes_read += snap.bytes_read;
        self.bytes_written += snap.bytes_written;
        self.connects_opened += snap.connects_opened;
        self.socket_errors += snap.socket_errors;
        self.latency
            .add(&snap.latency)
            .expect("latency histograms share bounds");
    }

    /// Drain the workers and report progress since the previous interval.
    pub fn interval(&mut self, workers: &[Worker]) -> IntervalReport {
        let before = self.requests_ok;
        for w in workers {
            self.absorb(&w.exchange_counters());
        }
        let now = Instant::now();
        let requests = self.requests_ok - before;
        let interval = now.duration_since(self.interval_start).as_secs_f64();
        self.interval_start = now;
        IntervalReport {
            requests,
            elapsed: now.duration_since(self.run_start).as_secs_f64(),
            interval,
            throughput: if interval > 0.0 {
                requests as f64 / interval
            } else {
                0.0
            },
        }
    }

    /// Final drain; the run's elapsed time stops here.
    pub fn finish(&mut self, workers: &[Worker]) {
        for w in workers {
            self.absorb(&w.exchange_counters());
        }
        self.run_end = Some(Instant::now());
    }

    pub fn summary(&self) -> RunSummary {
        let end = self.run_end.unwrap_or_else(Instant::now);
        let elapsed = end.duration_since(self.run_start).as_secs_f64();
        let completed = self.requests_ok + self.requests_failed;
        let pct = |q: f64| self.latency.value_at_quantile(q) as f64 / NS_PER_MS;
        RunSummary {
            completed,
            successful: self.requests_ok,
            failed: self.requests_failed,
            socket_errors: self.socket_errors,
            connections_opened: self.connects_opened,
            elapsed,
            throughput: if elapsed > 0.0 {
                completed as f64 / elapsed
            } else {
                0.0
            },
            latency_mean: self.latency.mean() / NS_PER_MS,
            latency_stddev: self.latency.stdev() / NS_PER_MS,
            latency_min: self.latency.min() as f64 / NS_PER_MS,
            latency_max: self.latency.max() as f64 / NS_PER_MS,
            latency_p50: pct(0.50),
            latency_p90: pct(0.90),
            latency_p98: pct(0.98),
            latency_p99: pct(0.99),
            bytes_sent: self.bytes_written,
            bytes_received: self.bytes_read,
            send_mbps: mbps(self.bytes_written, elapsed),
            receive_mbps: mbps(self.bytes_read, elapsed),
        }
    }
}

fn mbps(bytes: u64, elapsed: f64) -> f64 {
    if elapsed > 0.0 {
        (bytes as f64 * 8.0 / MEGABIT) / elapsed
    } else {
        0.0
    }
}

/// Totals for one benchmark run. Latencies are in milliseconds.
pub struct RunSummary {
    pub completed: u64,
    pub successful: u64,
    pub failed: u64,
    pub socket_errors: u64,
    pub connections_opened: u64,
    pub elapsed: f64,
    pub throughput: f64,
    pub latency_mean: f64,
    pub latency_stddev: f64,
    pub latency_min: f64,
    pub latency_max: f64,
    pub latency_p50: f64,
    pub latency_p90: f64,
    pub latency_p98: f64,
    pub latency_p99: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_mbps: f64,
    pub receive_mbps: f64,
}

impl RunSummary {
    pub fn write_text<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Duration:             {:.3} seconds", self.elapsed)?;
        writeln!(out, "Attempted requests:   {}", self.completed)?;
        writeln!(out, "Successful requests:  {}", self.successful)?;
        writeln!(out, "Non-2xx results:      {}", self.failed)?;
        writeln!(out, "Connections opened:   {}", self.connections_opened)?;
        writeln!(out, "Socket errors:        {}", self.socket_errors)?;
        writeln!(out)?;
        writeln!(
            out,
            "Throughput:           {:.3} requests/second",
            self.throughput
        )?;
        writeln!(
            out,
            "Average latency:      {:.3} milliseconds",
            self.latency_mean
        )?;
        writeln!(
            out,
            "Minimum latency:      {:.3} milliseconds",
            self.latency_min
        )?;
        writeln!(
            out,
            "Maximum latency:      {:.3} milliseconds",
            self.latency_max
        )?;
        writeln!(
            out,
            "Latency std. dev:     {:.3} milliseconds",
            self.latency_stddev
        )?;
        writeln!(out, "50% latency:          {:.3} milliseconds", self.latency_p50)?;
        writeln!(out, "90% latency:          {:.3} milliseconds", self.latency_p90)?;
        writeln!(out, "98% latency:          {:.3} milliseconds", self.latency_p98)?;
        writeln!(out, "99% latency:          {:.3} milliseconds", self.latency_p99)?;
        writeln!(out)?;
        writeln!(
            out,
            "Total bytes sent:     {:.2} megabytes",
            self.bytes_sent as f64 / MEGABIT
        )?;
        writeln!(
            out,
            "Total bytes received: {:.2} megabytes",
            self.bytes_received as f64 / MEGABIT
        )?;
        writeln!(
            out,
            "Send bandwidth:       {:.2} megabits / second",
            self.send_mbps
        )?;
        writeln!(
            out,
            "Receive bandwidth:    {:.2} megabits / second",
            self.receive_mbps
        )
    }

    pub fn write_csv_header<W: io::Write>(out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "Name,Throughput,Avg. Latency,Threads,Connections,Duration,\
             Completed,Successful,Errors,Sockets,\
             Min. latency,Max. latency,50% Latency,90% Latency,\
             98% Latency,99% Latency,Latency Std Dev,\
             Avg. Send Bandwidth,Avg. Recv. Bandwidth"
        )
    }

    pub fn write_csv<W: io::Write>(
        &self,
        out: &mut W,
        name: &str,
        threads: usize,
        connections: usize,
    ) -> io::Result<()> {
        writeln!(
            out,
            "{},{:.3},{:.3},{},{},{:.3},{},{},{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.2},{:.2}",
            name,
            self.throughput,
            self.latency_mean,
            threads,
            connections,
            self.elapsed,
            self.completed,
            self.successful,
            self.socket_errors,
            self.connections_opened,
            self.latency_min,
            self.latency_max,
            self.latency_p50,
            self.latency_p90,
            self.latency_p98,
            self.latency_p99,
            self.latency_stddev,
            self.send_mbps,
            self.receive_mbps,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder_with(counts: &[(u16, u64)]) -> Recorder {
        let mut r = Recorder::start(&[]);
        let mut snap = Counters::new();
        for &(status, latency) in counts {
            snap.record_result(status, latency);
        }
        snap.record_read(1000);
        snap.record_write(500);
        r.absorb(&snap);
        r.run_end = Some(Instant::now());
        r
    }

    #[test]
    fn totals_fold() {
        let r = recorder_with(&[(200, 1_000_000), (200, 3_000_000), (500, 2_000_000)]);
        let s = r.summary();
        assert_eq!(s.completed, 3);
        assert_eq!(s.successful, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.bytes_received, 1000);
        assert_eq!(s.bytes_sent, 500);
        assert!(s.latency_mean > 0.9 && s.latency_mean < 3.1);
        assert!(s.latency_max >= s.latency_min);
    }

    #[test]
    fn csv_shape() {
        let r = recorder_with(&[(200, 1_000_000)]);
        let s = r.summary();
        let mut header = Vec::new();
        RunSummary::write_csv_header(&mut header).unwrap();
        let mut line = Vec::new();
        s.write_csv(&mut line, "test", 2, 8).unwrap();
        let header_cols = String::from_utf8(header).unwrap().trim().split(',').count();
        let line_cols = String::from_utf8(line).unwrap().trim().split(',').count();
        assert_eq!(header_cols, line_cols);
    }
}
