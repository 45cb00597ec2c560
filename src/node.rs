//! Peer node lifecycle and coordination.
//!
//! A [`PeerNode`] ties the pieces together: it accepts inbound links, dials
//! outbound ones with a fixed backoff, registers every live link in its
//! [`ConnectionRegistry`] and runs one dispatch task per link that routes
//! inbound envelopes by kind. Anything a front end might want to show is
//! published on a [`NodeEvent`] channel.

use crate::network::{canonicalize, ConnectionRegistry, DiscoveryServer};
use crate::transport::{Connection, ConnectionInfo, Envelope, Inbound, MessageKind, Timings};
use crate::utils::{
    read_lock as read, signalled, write_lock as write, IdentityConfig, NetworkError, NodeConfig,
    Result,
};
use futures::future::join_all;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

/// Local identity of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Display name announced to peers
    pub name: String,
    /// Host to bind and advertise
    pub host: String,
    /// Port to bind; `0` picks an ephemeral one
    pub port: u16,
}

impl NodeIdentity {
    /// Create an identity
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// Configured `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&IdentityConfig> for NodeIdentity {
    fn from(config: &IdentityConfig) -> Self {
        Self::new(config.name.clone(), config.host.clone(), config.port)
    }
}

/// Things that happen on a node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A link was registered
    PeerConnected {
        /// Registry address of the peer
        address: String,
    },
    /// A link was torn down
    PeerDisconnected {
        /// Registry address of the peer
        address: String,
    },
    /// A chat message arrived
    MessageReceived {
        /// Link it arrived on
        address: String,
        /// The message
        envelope: Envelope,
    },
    /// A peer announced a file
    FileAnnounced {
        /// Link it arrived on
        address: String,
        /// The announcement, filename included
        envelope: Envelope,
    },
    /// A peer sent a diagnostic log line
    Diagnostic {
        /// Link it arrived on
        address: String,
        /// The log line
        envelope: Envelope,
    },
}

/// Per-peer outcome of a fan-out send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Peers the envelope was written to
    pub delivered: Vec<String>,
    /// Peers whose write failed; their links are gone
    pub failed: Vec<String>,
}

impl BroadcastSummary {
    /// Number of peers a send was attempted on
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// Whether every attempted send succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A participant in the overlay. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct PeerNode {
    inner: Arc<NodeState>,
}

#[derive(Debug)]
struct NodeState {
    identity: NodeIdentity,
    timings: Timings,
    registry: ConnectionRegistry,
    local_addr: OnceLock<SocketAddr>,
    // Rolling feeds; the oldest entry goes once `log_capacity` is reached.
    chat: RwLock<VecDeque<Envelope>>,
    diagnostics: RwLock<VecDeque<Envelope>>,
    log_capacity: usize,
    events: broadcast::Sender<NodeEvent>,
    shutdown: watch::Sender<bool>,
}

impl PeerNode {
    /// Create a node that is not yet listening
    pub fn new(identity: NodeIdentity, timings: Timings) -> Self {
        Self::with_log_capacity(identity, timings, crate::defaults::LOG_CAPACITY)
    }

    /// Create a node whose chat and diagnostic feeds keep at most
    /// `log_capacity` entries each
    pub fn with_log_capacity(
        identity: NodeIdentity,
        timings: Timings,
        log_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(NodeState {
                identity,
                timings,
                registry: ConnectionRegistry::new(),
                local_addr: OnceLock::new(),
                chat: RwLock::new(VecDeque::new()),
                diagnostics: RwLock::new(VecDeque::new()),
                log_capacity: log_capacity.max(1),
                events,
                shutdown,
            }),
        }
    }

    /// Create a node from a validated configuration
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(NodeIdentity::from(&config.node), config.liveness.timings())
    }

    /// Bind the configured address and accept peers in the background.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the address cannot be bound or
    /// the node is already listening.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let address = self.inner.identity.address();
        if self.inner.local_addr.get().is_some() {
            return Err(NetworkError::BindFailed {
                address,
                reason: "node is already listening".to_string(),
            }
            .into());
        }

        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local = listener.local_addr()?;
        if self.inner.local_addr.set(local).is_err() {
            return Err(NetworkError::BindFailed {
                address,
                reason: "node is already listening".to_string(),
            }
            .into());
        }

        log::info!("{} listening for peers on {}", self.inner.identity.name, local);
        tokio::spawn(self.clone().accept_loop(listener));
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = signalled(&mut shutdown) => {
                    log::debug!("Accept loop on {} stopped", self.address());
                    return;
                }
            };

            match accepted {
                Ok((stream, remote)) => {
                    log::info!("Incoming connection from {}", remote);
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.register_connection(&remote.to_string(), stream).await;
                    });
                }
                Err(e) => {
                    let error = NetworkError::AcceptFailed {
                        reason: e.to_string(),
                    };
                    log::warn!("{}: {}", self.address(), error);
                    tokio::time::sleep(crate::defaults::ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }

    /// Make sure a link to `address` exists.
    ///
    /// Returns the registered link straight away if there is one. Otherwise
    /// dials until it succeeds, pausing `redial_backoff` between attempts;
    /// only shutdown ends the retry loop, in which case `None` is returned.
    pub async fn connect_to(&self, address: &str) -> Option<Arc<Connection>> {
        let key = canonicalize(address);
        let backoff = self.inner.timings.redial_backoff;
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            if self.is_shutting_down() {
                return None;
            }
            if let Some(existing) = self.inner.registry.lookup(&key) {
                return Some(existing);
            }

            let dialed = tokio::select! {
                dialed = TcpStream::connect(&key) => dialed,
                _ = signalled(&mut shutdown) => return None,
            };

            match dialed {
                Ok(stream) => {
                    // An inbound link from the same address may have won the race.
                    return match self.register_connection(&key, stream).await {
                        Some(connection) => Some(connection),
                        None => self.inner.registry.lookup(&key),
                    };
                }
                Err(e) => {
                    let error = NetworkError::DialFailed {
                        peer: key.clone(),
                        reason: e.to_string(),
                    };
                    log::warn!("{}: {}; retrying in {:?}", self.address(), error, backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = signalled(&mut shutdown) => return None,
                    }
                }
            }
        }
    }

    /// Dial every address in its own task
    pub fn connect_to_peers<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for address in addresses {
            let node = self.clone();
            let address = address.into();
            tokio::spawn(async move {
                node.connect_to(&address).await;
            });
        }
    }

    /// Turn an established socket into a registered link.
    ///
    /// Announces the local name, then inserts the link under the canonical
    /// form of `address`. Returns `None` when the announcement could not be
    /// written or another link already holds the address; in both cases the
    /// new link is closed without disturbing the existing one.
    pub async fn register_connection(
        &self,
        address: &str,
        stream: TcpStream,
    ) -> Option<Arc<Connection>> {
        let key = canonicalize(address);
        let info = Envelope::info(self.inner.identity.name.clone());
        let (connection, inbound) =
            Connection::open(key.clone(), stream, info, self.inner.timings).await;

        if connection.is_closed() {
            log::warn!("Discarding connection to {}: handshake failed", key);
            return None;
        }

        if !self.inner.registry.register(&key, Arc::clone(&connection)) {
            log::info!("Already connected to {}; closing duplicate link", key);
            connection.close().await;
            return None;
        }

        if self.is_shutting_down() {
            connection.close().await;
            self.inner.registry.remove_connection(&connection);
            return None;
        }

        log::info!("Connected to {}", key);
        self.emit(NodeEvent::PeerConnected {
            address: key.clone(),
        });
        tokio::spawn(self.clone().dispatch(Arc::clone(&connection), inbound));
        Some(connection)
    }

    async fn dispatch(self, connection: Arc<Connection>, mut inbound: Inbound) {
        let deadline = self.inner.timings.read_deadline;
        loop {
            match inbound.next_frame(deadline).await {
                Ok(Some(frame)) => match Envelope::decode_bytes(&frame) {
                    Ok(envelope) => self.route(&connection, envelope),
                    Err(e) => {
                        log::warn!("{}: dropping unreadable message: {}", connection.address(), e);
                    }
                },
                Ok(None) => {
                    log::debug!("{}: stream ended", connection.address());
                    break;
                }
                Err(e) if e.is_protocol_violation() => {
                    log::warn!("{}: protocol violation, dropping link: {}", connection.address(), e);
                    break;
                }
                Err(e) => {
                    log::info!("{}: read ended: {}", connection.address(), e);
                    break;
                }
            }
        }

        drop(inbound);
        connection.close().await;
        if self.inner.registry.remove_connection(&connection) {
            log::info!("Removed {} from the registry", connection.address());
        }
        self.emit(NodeEvent::PeerDisconnected {
            address: connection.address().to_string(),
        });
    }

    fn route(&self, connection: &Connection, envelope: Envelope) {
        let address = connection.address().to_string();
        match envelope.kind() {
            MessageKind::Info => {
                log::info!("{} identifies as {}", address, envelope.sender());
                connection.set_display_name(envelope.sender());
            }
            MessageKind::Heartbeat => {
                log::trace!("Heartbeat from {}", address);
            }
            MessageKind::Text => {
                log::info!("[from {}]: {}", envelope.sender(), envelope.content());
                connection.record(envelope.clone());
                self.push_rolling(&self.inner.chat, envelope.clone());
                self.emit(NodeEvent::MessageReceived { address, envelope });
            }
            MessageKind::Log => {
                log::debug!("Diagnostic from {}: {}", envelope.sender(), envelope.content());
                self.push_rolling(&self.inner.diagnostics, envelope.clone());
                self.emit(NodeEvent::Diagnostic { address, envelope });
            }
            MessageKind::File => {
                log::info!(
                    "{} announced file '{}' ({} bytes)",
                    envelope.sender(),
                    envelope.filename().unwrap_or_default(),
                    envelope.content().len()
                );
                self.emit(NodeEvent::FileAnnounced { address, envelope });
            }
        }
    }

    /// Send a chat message to every registered peer at once.
    ///
    /// Peers whose write fails are dropped from the registry; the rest are
    /// unaffected.
    pub async fn broadcast(&self, text: &str) -> BroadcastSummary {
        let sender = self.address();
        self.fan_out(|| Envelope::text(sender.clone(), text)).await
    }

    /// Announce a file to every registered peer
    ///
    /// # Errors
    ///
    /// Returns a protocol error, before anything is sent, if `filename` is
    /// empty.
    pub async fn broadcast_file(&self, filename: &str, content: &str) -> Result<BroadcastSummary> {
        let announcement = Envelope::file(self.address(), filename, content)?;
        Ok(self.fan_out(|| announcement.clone()).await)
    }

    /// Send a diagnostic log line to every registered peer
    pub async fn send_log(&self, text: &str) -> BroadcastSummary {
        let sender = self.address();
        self.fan_out(|| Envelope::log(sender.clone(), text)).await
    }

    async fn fan_out<F>(&self, build: F) -> BroadcastSummary
    where
        F: Fn() -> Envelope,
    {
        let sends = self.inner.registry.snapshot().map(|(address, connection)| {
            let envelope = build();
            async move {
                let result = connection.send(&envelope).await;
                (address, connection, result)
            }
        });

        let mut summary = BroadcastSummary::default();
        for (address, connection, result) in join_all(sends).await {
            match result {
                Ok(()) => summary.delivered.push(address),
                Err(e) => {
                    log::warn!("{}: delivery to {} failed: {}", self.address(), address, e);
                    self.inner.registry.remove_connection(&connection);
                    summary.failed.push(address);
                }
            }
        }
        summary
    }

    /// Serve the registry's addresses to joining nodes on `address`
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the address cannot be bound.
    pub async fn start_discovery(&self, address: &str) -> Result<SocketAddr> {
        DiscoveryServer::new(self.inner.registry.clone(), self.inner.shutdown.subscribe())
            .start(address)
            .await
    }

    /// Stop accepting, dialing and serving discovery, then close every link.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        log::info!("Shutting down node {}", self.address());

        let closes = self.inner.registry.snapshot().map(|(_, connection)| {
            let registry = self.inner.registry.clone();
            async move {
                connection.close().await;
                registry.remove_connection(&connection);
            }
        });
        join_all(closes).await;
    }

    /// Whether [`PeerNode::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Advertised `host:port`; uses the bound port once listening
    pub fn address(&self) -> String {
        match self.inner.local_addr.get() {
            Some(local) => format!("{}:{}", self.inner.identity.host, local.port()),
            None => self.inner.identity.address(),
        }
    }

    /// Local identity
    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Liveness settings applied to every link
    pub fn timings(&self) -> Timings {
        self.inner.timings
    }

    /// Shared connection registry
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Snapshot of every registered link, sorted by address
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<_> = self
            .inner
            .registry
            .snapshot()
            .map(|(_, connection)| connection.info())
            .collect();
        connections.sort_by(|a, b| a.address.cmp(&b.address));
        connections
    }

    /// Chat history of the link registered for `address`
    pub fn history(&self, address: &str) -> Option<Vec<Envelope>> {
        self.inner
            .registry
            .lookup(address)
            .map(|connection| connection.history())
    }

    /// Most recent chat messages received, oldest first
    pub fn chat_log(&self) -> Vec<Envelope> {
        read(&self.inner.chat).iter().cloned().collect()
    }

    /// Most recent diagnostic lines received, oldest first
    pub fn diagnostics(&self) -> Vec<Envelope> {
        read(&self.inner.diagnostics).iter().cloned().collect()
    }

    /// Subscribe to node events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    fn push_rolling(&self, log: &RwLock<VecDeque<Envelope>>, envelope: Envelope) {
        let mut log = write(log);
        while log.len() >= self.inner.log_capacity {
            log.pop_front();
        }
        log.push_back(envelope);
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}
