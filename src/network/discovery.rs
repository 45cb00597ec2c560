//! Peer discovery for joining nodes.
//!
//! A [`DiscoveryServer`] answers each inbound query with the addresses
//! currently held in a node's [`ConnectionRegistry`], one `host:port` per
//! line, then closes the socket. [`fetch_peers`] is the client side: a
//! joining node uses it to obtain its initial dial list.

use crate::network::registry::{canonicalize, ConnectionRegistry};
use crate::utils::{signalled, NetworkError, OverlayError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

/// Serves the address list of a registry to joining nodes
#[derive(Debug, Clone)]
pub struct DiscoveryServer {
    /// Registry whose addresses are handed out (read-only use)
    registry: ConnectionRegistry,
    /// Flips to `true` when the owning node shuts down
    shutdown: watch::Receiver<bool>,
}

impl DiscoveryServer {
    /// Create a server over `registry` that stops when `shutdown` flips
    pub fn new(registry: ConnectionRegistry, shutdown: watch::Receiver<bool>) -> Self {
        Self { registry, shutdown }
    }

    /// Bind `address` and answer queries in a background task
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the address cannot be bound.
    pub async fn start(self, address: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let local = listener.local_addr()?;
        log::info!("Discovery server listening on {}", local);

        tokio::spawn(self.serve(listener));
        Ok(local)
    }

    /// Accept loop; a failed accept is logged and never stops the server
    pub async fn serve(mut self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = signalled(&mut self.shutdown) => {
                    log::debug!("Discovery server stopped");
                    return;
                }
            };

            match accepted {
                Ok((stream, remote)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.answer(stream, remote).await {
                            log::warn!("Discovery reply to {} failed: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Discovery server failed to accept a query: {}", e);
                }
            }
        }
    }

    async fn answer(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<usize> {
        let remote = canonicalize(&remote.to_string());
        log::info!("Discovery query from {}", remote);

        if self.registry.contains(&remote) {
            log::info!("{} is already connected; no peer list sent", remote);
            return Ok(0);
        }

        let addresses = self.registry.addresses();
        let mut reply = String::new();
        for address in &addresses {
            reply.push_str(address);
            reply.push('\n');
        }

        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(addresses.len())
    }
}

/// Ask the discovery server at `server` for its known addresses
///
/// # Errors
///
/// Returns [`NetworkError::DialFailed`] if the server is unreachable and
/// [`NetworkError::Timeout`] if the full list does not arrive in time.
pub async fn fetch_peers(server: &str, deadline: Duration) -> Result<Vec<String>> {
    let exchange = async {
        let stream = TcpStream::connect(server)
            .await
            .map_err(|e| NetworkError::DialFailed {
                peer: server.to_string(),
                reason: e.to_string(),
            })?;

        let mut lines = BufReader::new(stream).lines();
        let mut peers = Vec::new();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if !line.is_empty() {
                peers.push(line.to_string());
            }
        }
        Ok::<_, OverlayError>(peers)
    };

    timeout(deadline, exchange).await.map_err(|_| NetworkError::Timeout {
        operation: format!("peer list from {server}"),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, Envelope, Timings};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    async fn fake_connection(address: &str) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let timings = Timings {
            ping_interval: Duration::from_secs(60),
            ping_deadline: Duration::from_secs(90),
            ..Timings::default()
        };
        let (connection, _inbound) =
            Connection::open(address, client.unwrap(), Envelope::info("test"), timings).await;
        (connection, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_server_lists_registered_addresses() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = fake_connection("10.1.1.1:4000").await;
        let (b, _rb) = fake_connection("10.1.1.2:4000").await;
        registry.register("10.1.1.1:4000", a);
        registry.register("10.1.1.2:4000", b);

        let (_stop, shutdown) = watch::channel(false);
        let server = DiscoveryServer::new(registry, shutdown);
        let address = server.start("127.0.0.1:0").await.unwrap();

        let mut peers = assert_ok!(fetch_peers(&address.to_string(), Duration::from_secs(2)).await);
        peers.sort();
        assert_eq!(peers, vec!["10.1.1.1:4000", "10.1.1.2:4000"]);
    }

    #[tokio::test]
    async fn test_empty_registry_yields_empty_list() {
        let (_stop, shutdown) = watch::channel(false);
        let server = DiscoveryServer::new(ConnectionRegistry::new(), shutdown);
        let address = server.start("127.0.0.1:0").await.unwrap();

        let peers = fetch_peers(&address.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_from_unreachable_server() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = fetch_peers(&address.to_string(), Duration::from_secs(2)).await;
        assert!(matches!(
            result,
            Err(OverlayError::Network(NetworkError::DialFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let (stop, shutdown) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = DiscoveryServer::new(ConnectionRegistry::new(), shutdown);
        let handle = tokio::spawn(server.serve(listener));

        stop.send_replace(true);
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
