//! fastcgi-responder: a multi-worker FastCGI responder server
//!
//! Speaks the responder role of FastCGI 1.0 over TCP to a front-end web
//! server and hands each completed request to an application [`Handler`].
//!
//! Features:
//! - One mio event loop per worker, fed by its own `SO_REUSEPORT` listener
//! - Bounded per-connection receive buffer, requests reused per connection
//! - CGI-style responses buffered into STDOUT records
//! - Graceful shutdown from any thread or on SIGINT/SIGTERM
//!
//! ```no_run
//! use fastcgi_responder::{Config, Request, Server};
//!
//! let server = Server::new(Config::default(), |request: &Request| {
//!     let _ = request.write_header("Content-Type", "text/plain");
//!     let _ = request.write_body("Hello world");
//!     let _ = request.end();
//! })?;
//! server.register_signal_handlers()?;
//! server.serve()?;
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod protocol;
mod runtime;
pub mod server;

pub use config::{CliArgs, Config};
pub use error::{ConfigError, ConnectionError, OutputError, ProtocolError};
pub use runtime::request::{Request, RequestState};
pub use runtime::{ServeReport, ShutdownHandle};
pub use server::{Handler, Server};
