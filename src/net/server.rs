//! Accept loop that turns TCP connections into connection engines.
//!
//! # Data Flow
//! ```text
//! Listener::accept (permit)
//!     → Handler::on_accept (refuse?)
//!     → ConnectionRegistry::admit
//!     → sniff first bytes (TLS refused when plaintext is required)
//!     → Peer::new(stream, pre-read bytes)
//!     → Admission::register (closed at once when draining)
//!     → Peer::run on its own task (permit released when it ends)
//! ```
//!
//! # Design Decisions
//! - On shutdown the listener stops first, then every live connection is
//!   closed gracefully and the server waits for all of them to end
//! - Connections still being sniffed count as live, so they are drained too

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::config::ServerConfig;
use crate::net::connection::ConnectionRegistry;
use crate::net::listener::{sniff, ConnectionPermit, Listener, ListenerError, Sniffed};
use crate::peer::Peer;
use crate::session::Handler;

/// A plaintext HTTP/1.x server running one [`Peer`] per connection.
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    registry: ConnectionRegistry,
}

impl Server {
    /// Create a server that hands every connection to `handler`.
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        Self {
            config: Arc::new(config),
            handler,
            registry: ConnectionRegistry::new(),
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(
        &self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping listener");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr, permit)) => self.spawn_connection(stream, remote_addr, permit),
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        drop(listener);
        tracing::info!(
            active_connections = self.registry.active_count(),
            "Draining connections"
        );
        self.registry.close_all(true);
        self.registry.wait_idle().await;
        tracing::info!("All connections closed");
        Ok(())
    }

    fn spawn_connection(&self, mut stream: TcpStream, remote_addr: SocketAddr, permit: ConnectionPermit) {
        if !self.handler.on_accept(remote_addr) {
            tracing::debug!(peer_addr = %remote_addr, "Connection refused by handler");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let config = Arc::clone(&self.config);
        let handler = Arc::clone(&self.handler);
        let admission = self.registry.admit();

        tokio::spawn(async move {
            let _permit = permit;
            let sniff_limit = config.connection.read_chunk_size.max(1);
            let pre_read = match sniff(&mut stream, &config.listener, sniff_limit).await {
                Ok(Sniffed::Serve(bytes)) => bytes,
                Ok(Sniffed::Tls) => {
                    tracing::debug!(peer_addr = %remote_addr, "Refusing TLS handshake on plaintext listener");
                    return;
                }
                Ok(Sniffed::Closed) => return,
                Err(e) => {
                    tracing::debug!(peer_addr = %remote_addr, error = %e, "Failed to read from new connection");
                    return;
                }
            };

            let peer: Peer<TcpStream> = Peer::new(stream, remote_addr, &pre_read, config, handler);
            let _registration = admission.register(peer.session().clone());
            peer.run().await;
        });
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_address", &self.config.listener.bind_address)
            .field("active_connections", &self.registry.active_count())
            .finish()
    }
}
