//! Multi-worker runtime.
//!
//! Each worker is an independent mio event loop with its own listener and
//! connections. The calling thread runs worker 0; the others get dedicated
//! threads. Workers share nothing but the shutdown signal, and their reports
//! are combined once all of them have stopped.

mod buffer;
mod connection;
mod event_loop;
pub mod request;
mod shutdown;
mod usage;

pub(crate) use connection::ConnectionSettings;
pub(crate) use event_loop::{bind_listeners, WorkerSettings};
pub use shutdown::ShutdownHandle;
pub(crate) use shutdown::ShutdownSignal;

use crate::server::Handler;
use event_loop::{worker_loop, WorkerReport};
use std::io;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Totals across all workers, returned by [`crate::Server::serve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeReport {
    /// Workers that ran to completion.
    pub workers: usize,
    /// Connections closed, including those dropped at shutdown.
    pub connections: u64,
    /// Requests handed to the handler.
    pub requests: u64,
    /// Summed CPU time of the workers.
    pub cpu: Duration,
}

impl ServeReport {
    fn add(&mut self, report: &WorkerReport) {
        self.workers += 1;
        self.connections += report.connections;
        self.requests += report.requests;
        self.cpu += report.usage.cpu;
    }
}

/// Run one worker per listener until shutdown.
pub(crate) fn run(
    listeners: Vec<TcpListener>,
    signal: &ShutdownSignal,
    handler: &dyn Handler,
    settings: &WorkerSettings,
) -> io::Result<ServeReport> {
    let shutdown_fd = signal.reader_fd();
    let mut listeners = listeners.into_iter().enumerate();
    let Some((_, first)) = listeners.next() else {
        return Ok(ServeReport::default());
    };

    let mut report = ServeReport::default();
    thread::scope(|s| {
        let mut handles = Vec::new();
        for (worker_id, listener) in listeners {
            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn_scoped(s, move || {
                    worker_loop(worker_id, listener, shutdown_fd, handler, settings)
                });
            match spawned {
                Ok(handle) => handles.push((worker_id, handle)),
                Err(e) => {
                    // stop the workers already running before bailing out
                    signal.handle().shutdown();
                    for (_, handle) in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        let mut collect = |worker_id: usize, result: io::Result<WorkerReport>| match result {
            Ok(worker_report) => report.add(&worker_report),
            Err(e) => error!(worker = worker_id, error = %e, "Worker failed"),
        };

        collect(0, worker_loop(0, first, shutdown_fd, handler, settings));
        for (worker_id, handle) in handles {
            match handle.join() {
                Ok(result) => collect(worker_id, result),
                Err(_) => error!(worker = worker_id, "Worker panicked"),
            }
        }
        Ok(())
    })?;

    info!(
        workers = report.workers,
        connections = report.connections,
        requests = report.requests,
        "All workers stopped"
    );
    Ok(report)
}
