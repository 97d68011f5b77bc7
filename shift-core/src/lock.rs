//! Bounded acquisition of per-device and per-channel exclusive sections.

use crate::types::{ChannelId, DeviceId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// The resource a caller was waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    KeyPool(DeviceId),
    Channel(ChannelId),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::KeyPool(id) => write!(f, "key pool {id}"),
            Resource::Channel(id) => write!(f, "channel {id}"),
        }
    }
}

/// Transient contention failure. Safe to retry with the same idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcurrencyError {
    #[error("Timed out after {waited:?} waiting for {resource}")]
    LockTimeout { resource: Resource, waited: Duration },
}

/// Lock `cell`, giving up after `timeout`.
pub async fn acquire<T>(
    cell: &Arc<Mutex<T>>,
    timeout: Duration,
    resource: Resource,
) -> Result<OwnedMutexGuard<T>, ConcurrencyError> {
    tokio::time::timeout(timeout, Arc::clone(cell).lock_owned())
        .await
        .map_err(|_| {
            tracing::debug!(%resource, ?timeout, "lock acquisition timed out");
            ConcurrencyError::LockTimeout {
                resource,
                waited: timeout,
            }
        })
}
