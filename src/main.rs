//! HTTP/1.x connection engine demo server.
//!
//! ```text
//!     Client ──TCP──▶ Listener ──sniff──▶ Peer ──request──▶ EchoHandler
//!                                          ▲                    │
//!                                          └──── Session::write ┘
//! ```
//!
//! Replies to every request with its request line, headers and body, keeping
//! the connection alive when the client asks for it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};

use http_peer::config::{load_config, ServerConfig};
use http_peer::lifecycle::signals::spawn_signal_handler;
use http_peer::observability::{logging, metrics};
use http_peer::{Handler, Listener, PeerError, Response, Server, Session, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "http-peer", version, about = "HTTP/1.x echo server")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

/// Echoes the request back to the client.
struct EchoHandler;

impl Handler for EchoHandler {
    fn on_request(&self, session: &Session) {
        let Some(request) = session.request() else {
            session.close(true);
            return;
        };

        let mut body = format!("{} {} {:?}\n", request.method(), request.uri(), request.version()).into_bytes();
        for (name, value) in request.headers() {
            body.extend_from_slice(name.as_str().as_bytes());
            body.extend_from_slice(b": ");
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(request.body());
        let keep_alive = request.keep_alive();
        let response = Response::new(StatusCode::OK)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .body(body);

        session.write(response.encode(keep_alive));
        if keep_alive {
            session.complete();
        } else {
            session.close(true);
        }
    }

    fn on_close(&self, session: &Session, error: Option<&PeerError>) {
        let stats = session.stats();
        match error {
            Some(e) if !e.is_timeout() => tracing::debug!(
                connection_id = %session.id(),
                error = %e,
                requests = stats.requests,
                "Connection failed"
            ),
            _ => tracing::debug!(
                connection_id = %session.id(),
                requests = stats.requests,
                bytes_in = stats.bytes_in,
                bytes_out = stats.bytes_out,
                "Connection closed"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!("http-peer v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        timeout_secs = config.connection.timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let shutdown = Shutdown::new();
    let server = Server::new(config, Arc::new(EchoHandler));
    let signals = spawn_signal_handler(shutdown.clone());

    server.run(listener, shutdown.subscribe()).await?;
    signals.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
