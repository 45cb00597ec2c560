//! # P2P Fileshare
//!
//! A minimal peer-to-peer overlay: every node is both a server and a client,
//! keeps one long-lived TCP link per peer, and exchanges newline-delimited
//! JSON envelopes over those links.
//!
//! ## Features
//!
//! - **Connection lifecycle**: dial with fixed backoff, announce with `info`,
//!   register once per address, tear down exactly once
//! - **Liveness**: one-directional heartbeats and a read deadline per link
//! - **Broadcast**: fan a message out to every peer concurrently; a failed
//!   peer never holds up the others
//! - **Discovery**: hand the current peer list to joining nodes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use p2p_fileshare::{NodeIdentity, PeerNode, Timings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = PeerNode::new(NodeIdentity::new("alice", "127.0.0.1", 9000), Timings::default());
//!     node.listen().await?;
//!     node.connect_to("127.0.0.1:9001").await;
//!     node.broadcast("hello").await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`]: wire envelopes and the per-link [`Connection`]
//! - [`network`]: the connection registry and the discovery service
//! - [`node`]: accept, dial, dispatch and broadcast
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod network;
pub mod node;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use network::{ConnectionRegistry, DiscoveryServer};
pub use node::{BroadcastSummary, NodeEvent, NodeIdentity, PeerNode};
pub use transport::{Connection, ConnectionInfo, Envelope, MessageKind, Timings};
pub use utils::{NodeConfig, OverlayError, Result};

/// Maximum envelope size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default host to bind and advertise
    pub const DEFAULT_HOST: &str = "127.0.0.1";

    /// Default port for peer links
    pub const DEFAULT_PORT: u16 = 9000;

    /// Default port for the discovery service
    pub const DEFAULT_DISCOVERY_PORT: u16 = 8000;

    /// Interval between heartbeats
    pub const PING_INTERVAL: Duration = Duration::from_secs(10);

    /// Write deadline for every send
    pub const PING_DEADLINE: Duration = Duration::from_secs(15);

    /// Idle time after which an inbound link is dropped (20 minutes)
    pub const READ_DEADLINE: Duration = Duration::from_secs(1200);

    /// Pause between failed dial attempts
    pub const REDIAL_BACKOFF: Duration = Duration::from_secs(5);

    /// Deadline for a full discovery exchange
    pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Time given to in-flight work after shutdown is requested
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

    /// Entries kept in a node's rolling chat and diagnostic feeds
    pub const LOG_CAPACITY: usize = 1000;

    /// Pause after a failed accept before trying again
    pub const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);
}
