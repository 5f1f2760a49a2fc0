//! Demo FastCGI responder answering every request with "Hello world".
//!
//! Point a front-end at it, e.g. nginx:
//!
//! ```text
//! location / {
//!     fastcgi_pass [::1]:9000;
//!     include fastcgi_params;
//! }
//! ```

use fastcgi_responder::{Config, Request, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_count(),
        max_request_len = config.max_request_len,
        "Starting fastcgi-responder"
    );

    let server = Server::new(config, hello_world)?;
    server.register_signal_handlers()?;

    let report = server.serve()?;
    info!(
        connections = report.connections,
        requests = report.requests,
        cpu_ms = report.cpu.as_millis() as u64,
        "Shutdown complete"
    );
    Ok(())
}

fn hello_world(request: &Request) {
    let result = request.transaction(|request| {
        request.write_header("Content-Type", "text/plain")?;
        request.write_body("Hello world")?;
        request.end()
    });
    if let Err(e) = result {
        warn!(
            request_id = request.request_id(),
            uri = request.param_str("REQUEST_URI").unwrap_or("-"),
            error = %e,
            "Failed to send response"
        );
    }
}
