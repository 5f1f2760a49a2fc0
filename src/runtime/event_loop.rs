//! mio event loop.
//!
//! Readiness-based model: each worker owns a `Poll`, its own `SO_REUSEPORT`
//! listener and the connections it accepted. Sockets are edge-triggered, so
//! every readiness event is drained until the read would block.

use crate::error::ConnectionError;
use crate::runtime::connection::{Connection, ConnectionRegistry, ConnectionSettings};
use crate::runtime::usage::{Usage, UsageTracker};
use crate::server::Handler;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const SHUTDOWN_TOKEN: Token = Token(usize::MAX - 1);

/// Settings every worker runs with.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub events_capacity: usize,
    pub max_connections: usize,
    pub connection: ConnectionSettings,
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerReport {
    pub connections: u64,
    pub requests: u64,
    pub usage: Usage,
}

type Connections = ConnectionRegistry<TcpStream>;

/// Per-worker state.
struct Worker<'a> {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    listen_addr: SocketAddr,
    connections: Connections,
    handler: &'a dyn Handler,
    settings: &'a WorkerSettings,
    usage: UsageTracker,
    closed: u64,
}

/// Run one worker until the shutdown descriptor becomes readable.
pub(crate) fn worker_loop(
    worker_id: usize,
    listener: std::net::TcpListener,
    shutdown_fd: RawFd,
    handler: &dyn Handler,
    settings: &WorkerSettings,
) -> io::Result<WorkerReport> {
    let poll = Poll::new()?;
    let mut events = Events::with_capacity(settings.events_capacity.max(1));

    let mut listener = TcpListener::from_std(listener);
    let listen_addr = listener.local_addr()?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    poll.registry().register(
        &mut SourceFd(&shutdown_fd),
        SHUTDOWN_TOKEN,
        Interest::READABLE,
    )?;

    let mut worker = Worker {
        id: worker_id,
        poll,
        listener,
        listen_addr,
        connections: ConnectionRegistry::new(settings.max_connections),
        handler,
        settings,
        usage: UsageTracker::start(),
        closed: 0,
    };

    info!(worker = worker_id, addr = %listen_addr, "Worker started");

    'run: loop {
        match worker.poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                SHUTDOWN_TOKEN => break 'run,
                LISTENER_TOKEN => worker.accept_connections(),
                Token(conn_id) => worker.handle_readable(conn_id),
            }
        }
    }

    Ok(worker.stop(shutdown_fd))
}

impl Worker<'_> {
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.add_connection(stream, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn add_connection(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        if peer_addr.is_ipv4() != self.listen_addr.is_ipv4() {
            warn!(worker = self.id, peer = %peer_addr, "Peer address family mismatch");
            return;
        }
        if self.connections.is_full() {
            warn!(worker = self.id, "Connection limit reached");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(worker = self.id, peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            return;
        }

        let fd = stream.as_raw_fd();
        let conn = Connection::new(stream, &self.settings.connection);
        let Some(conn_id) = self.connections.insert(conn) else {
            return;
        };
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(conn_id), Interest::READABLE)
        {
            warn!(worker = self.id, conn_id, error = %e, "Failed to register connection");
            self.connections.remove(conn_id);
            return;
        }

        debug!(
            worker = self.id,
            conn_id,
            peer = %peer_addr,
            "Accepted connection"
        );
    }

    fn handle_readable(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        let Err(e) = conn.on_readable(self.handler) else {
            return;
        };

        match e {
            ConnectionError::PeerClosed => {}
            ConnectionError::Protocol(_) | ConnectionError::Capacity { .. } => {
                warn!(worker = self.id, conn_id, error = %e, "Closing connection");
            }
            _ => debug!(worker = self.id, conn_id, error = %e, "Connection error"),
        }
        self.close_connection(conn_id);
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.remove(conn_id) {
            self.retire(conn);
            debug!(worker = self.id, conn_id, "Connection closed");
        }
    }

    /// Deregister and account for a connection leaving the worker.
    fn retire(&mut self, conn: Connection<TcpStream>) {
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&conn.stream().as_raw_fd()));
        self.usage.add_events(conn.requests());
        self.closed += 1;
        debug!(worker = self.id, requests = conn.requests(), "Connection retired");
    }

    fn stop(mut self, shutdown_fd: RawFd) -> WorkerReport {
        if !self.connections.is_empty() {
            info!(
                worker = self.id,
                live = self.connections.len(),
                "Closing live connections"
            );
        }
        let live: Vec<_> = self.connections.drain().collect();
        for conn in live {
            self.retire(conn);
        }

        let registry = self.poll.registry();
        let _ = registry.deregister(&mut self.listener);
        let _ = registry.deregister(&mut SourceFd(&shutdown_fd));

        let usage = self.usage.log(self.id);
        info!(
            worker = self.id,
            connections = self.closed,
            "Worker stopped"
        );
        WorkerReport {
            connections: self.closed,
            requests: usage.events,
            usage,
        }
    }
}

/// Bind `count` listeners sharing one address with `SO_REUSEPORT`.
///
/// Port 0 is resolved by the first bind; the others reuse the chosen port.
pub(crate) fn bind_listeners(
    addr: SocketAddr,
    count: usize,
) -> io::Result<Vec<std::net::TcpListener>> {
    let first = create_listener_with_reuseport(addr)?;
    let addr = first.local_addr()?;

    let mut listeners = Vec::with_capacity(count.max(1));
    listeners.push(first);
    for _ in 1..count {
        listeners.push(create_listener_with_reuseport(addr)?);
    }
    Ok(listeners)
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listeners_share_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listeners = bind_listeners(addr, 3).unwrap();
        assert_eq!(listeners.len(), 3);

        let port = listeners[0].local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert!(listeners
            .iter()
            .all(|l| l.local_addr().unwrap().port() == port));
    }

    #[test]
    fn test_bind_conflict_without_reuseport() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        assert!(bind_listeners(addr, 1).is_err());
    }
}
