//! Transport layer for peer links.
//!
//! This module provides the line-delimited JSON envelope format and the
//! per-link connection with its heartbeat and read deadline.

pub mod connection;
pub mod protocol;

pub use connection::{Connection, ConnectionInfo, Inbound, Timings};
pub use protocol::*;
