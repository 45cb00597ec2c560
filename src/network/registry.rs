//! Concurrent registry of live connections, keyed by peer address.
//!
//! The registry is the only state shared by every task of a node. Insertion
//! and removal are atomic per key, so no outer lock is needed: a DashMap
//! shards its entries and the entry API gives check-and-insert for free.

use crate::transport::Connection;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Rewrite `localhost:<port>` to `127.0.0.1:<port>` so both spellings share
/// one registry key. Every other address passes through unchanged.
pub fn canonicalize(address: &str) -> String {
    match address.rsplit_once(':') {
        Some((host, port)) if host.eq_ignore_ascii_case("localhost") => {
            format!("127.0.0.1:{port}")
        }
        _ => address.to_string(),
    }
}

/// Map from canonical peer address to its live connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `connection` unless `address` is already taken.
    ///
    /// Returns `false` when an entry exists; the caller keeps ownership of
    /// the rejected connection and must close it.
    pub fn register(&self, address: &str, connection: Arc<Connection>) -> bool {
        match self.connections.entry(canonicalize(address)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(connection);
                true
            }
        }
    }

    /// Connection registered for `address`, if any
    pub fn lookup(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(&canonicalize(address))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `address` has a registered connection
    pub fn contains(&self, address: &str) -> bool {
        self.connections.contains_key(&canonicalize(address))
    }

    /// Remove the entry for `address`; no-op when absent
    pub fn remove(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections
            .remove(&canonicalize(address))
            .map(|(_, connection)| connection)
    }

    /// Remove `connection`'s entry only if it is still the registered one
    pub fn remove_connection(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .remove_if(&canonicalize(connection.address()), |_, registered| {
                Arc::ptr_eq(registered, connection)
            })
            .is_some()
    }

    /// Point-in-time copy of every entry.
    ///
    /// The copy is taken shard by shard, so entries added or removed while it
    /// is being taken may or may not appear. Iterating the snapshot holds no
    /// locks; call again for a fresh view.
    pub fn snapshot(&self) -> Snapshot {
        let entries: Vec<_> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        Snapshot {
            entries: entries.into_iter(),
        }
    }

    /// Registered addresses
    pub fn addresses(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Iterator over a registry snapshot
#[derive(Debug)]
pub struct Snapshot {
    entries: std::vec::IntoIter<(String, Arc<Connection>)>,
}

impl Iterator for Snapshot {
    type Item = (String, Arc<Connection>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for Snapshot {}
