//! oneshot-server binary.
//!
//! Serves one of the built-in responders (echo, reverse, ping) on a TCP
//! port. Configuration via CLI arguments or TOML file. The process serves
//! until it is killed.

use oneshot_server::config::Config;
use oneshot_server::{net, Server};
use tracing::{error, info};
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
        port = config.port,
        buffer_size = config.buffer_size,
        max_clients = config.max_clients,
        local_only = config.local_only,
        responder = ?config.responder,
        "Starting oneshot-server"
    );

    net::init()?;

    let server = Server::with_options(&config.server_options());
    if !server.is_listening() {
        let code = server.error().unwrap_or(oneshot_server::listener::UNKNOWN_ERROR);
        let err = std::io::Error::from_raw_os_error(code);
        error!(port = config.port, error = %err, "Server failed to start");
        net::shutdown();
        return Err(err.into());
    }

    let callback = config.responder.into_callback();
    loop {
        server.accept(&callback);
    }
}
