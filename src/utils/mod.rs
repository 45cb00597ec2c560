//! Utility modules for configuration, error handling, and common functions.

pub mod config;
pub mod errors;

pub use config::*;
pub use errors::*;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read guard that ignores poisoning; the guarded values stay valid even if
/// a writer panicked.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write guard that ignores poisoning
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve once `flag` reads `true`, or once its sender is gone.
pub(crate) async fn signalled(flag: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}
