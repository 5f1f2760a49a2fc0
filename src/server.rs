//! FastCGI responder server.
//!
//! A [`Server`] binds one `SO_REUSEPORT` listener per worker up front, then
//! [`Server::serve`] runs the workers until shutdown is requested through
//! [`Server::shutdown`], a [`ShutdownHandle`], or SIGINT/SIGTERM once
//! [`Server::register_signal_handlers`] has been called.

use crate::config::Config;
use crate::runtime::request::Request;
use crate::runtime::{
    self, bind_listeners, ConnectionSettings, ServeReport, ShutdownHandle, ShutdownSignal,
    WorkerSettings,
};
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::info;

/// Application callback, invoked once per completed request on the worker
/// thread that owns the connection.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request);
}

impl<F> Handler for F
where
    F: Fn(&Request) + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) {
        self(request)
    }
}

/// Server instance
pub struct Server {
    handler: Arc<dyn Handler>,
    settings: WorkerSettings,
    listeners: Mutex<Option<Vec<TcpListener>>>,
    local_addr: SocketAddr,
    signal: ShutdownSignal,
}

impl Server {
    /// Bind the listeners described by `config`.
    ///
    /// Bind errors are reported here rather than from [`Server::serve`].
    pub fn new(config: Config, handler: impl Handler) -> io::Result<Self> {
        let ip: IpAddr = config
            .host
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let workers = config.worker_count();

        let listeners = bind_listeners(SocketAddr::new(ip, config.port), workers)?;
        let local_addr = listeners[0].local_addr()?;

        info!(
            addr = %local_addr,
            workers,
            max_request_len = config.max_request_len,
            params = config.params.len(),
            "Server bound"
        );

        Ok(Server {
            handler: Arc::new(handler),
            settings: WorkerSettings {
                events_capacity: config.events_capacity,
                max_connections: config.max_connections,
                connection: ConnectionSettings::from_config(&config),
            },
            listeners: Mutex::new(Some(listeners)),
            local_addr,
            signal: ShutdownSignal::new()?,
        })
    }

    /// Address the listeners are bound to, with port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the workers and block until shutdown. The calling thread becomes
    /// worker 0.
    ///
    /// A server serves once; later calls fail.
    pub fn serve(&self) -> io::Result<ServeReport> {
        let listeners = self.listeners.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "server has already been started")
        })?;
        runtime::run(listeners, &self.signal, &*self.handler, &self.settings)
    }

    /// Ask every worker to stop.
    pub fn shutdown(&self) {
        self.signal.handle().shutdown();
    }

    /// A handle that can stop the server from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.signal.handle()
    }

    /// Stop this server on SIGINT or SIGTERM.
    ///
    /// Signals are delivered to one server per process: registering another
    /// server takes them over.
    pub fn register_signal_handlers(&self) -> io::Result<()> {
        self.signal.register_signal_handlers()
    }
}
