//! Per-worker resource accounting.

use std::time::{Duration, Instant};
use tracing::info;

/// Wall time, CPU time and event count since creation.
#[derive(Debug)]
pub(crate) struct UsageTracker {
    started: Instant,
    cpu_start: Duration,
    events: u64,
}

/// Snapshot produced by [`UsageTracker::finish`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Usage {
    pub wall: Duration,
    pub cpu: Duration,
    pub events: u64,
}

impl Usage {
    /// Events per wall-clock second.
    pub fn rate(&self) -> f64 {
        let secs = self.wall.as_secs_f64();
        if secs > 0.0 {
            self.events as f64 / secs
        } else {
            0.0
        }
    }
}

impl UsageTracker {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            cpu_start: cpu_time(),
            events: 0,
        }
    }

    pub fn add_events(&mut self, n: u64) {
        self.events += n;
    }

    pub fn finish(&self) -> Usage {
        Usage {
            wall: self.started.elapsed(),
            cpu: cpu_time().saturating_sub(self.cpu_start),
            events: self.events,
        }
    }

    /// Log the current totals under `worker`.
    pub fn log(&self, worker: usize) -> Usage {
        let usage = self.finish();
        info!(
            worker,
            wall_ms = usage.wall.as_millis() as u64,
            cpu_ms = usage.cpu.as_millis() as u64,
            requests = usage.events,
            rate = usage.rate(),
            "Worker usage"
        );
        usage
    }
}

#[cfg(target_os = "linux")]
const RUSAGE_WHO: libc::c_int = libc::RUSAGE_THREAD;
#[cfg(not(target_os = "linux"))]
const RUSAGE_WHO: libc::c_int = libc::RUSAGE_SELF;

/// User plus system CPU time of the calling thread (the whole process where
/// per-thread accounting is unavailable).
fn cpu_time() -> Duration {
    // SAFETY: rusage is plain old data and getrusage only writes into it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(RUSAGE_WHO, &mut usage) } != 0 {
        return Duration::ZERO;
    }
    timeval(usage.ru_utime) + timeval(usage.ru_stime)
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}
