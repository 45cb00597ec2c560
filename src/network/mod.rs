//! Network layer for peer bookkeeping and discovery.
//!
//! This module provides the registry of live links shared by all tasks of a
//! node, and the discovery service joining nodes query for peers.

pub mod discovery;
pub mod registry;

pub use discovery::*;
pub use registry::*;
