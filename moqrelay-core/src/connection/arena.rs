//! Generational connection storage
//!
//! Subscriptions never hold a connection directly. They keep a
//! [`ConnectionHandle`] and resolve it on every use; once the connection is
//! removed its slot epoch moves on and old handles stop resolving, even after the
//! slot is reused.

use super::ConnectionState;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Stable id of a connection in a [`ConnectionArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    epoch: u64,
}

impl ConnectionHandle {
    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation the handle was issued for
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.epoch)
    }
}

#[derive(Debug)]
struct Slot {
    epoch: u64,
    connection: Option<Arc<ConnectionState>>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of live connections
#[derive(Debug, Default)]
pub struct ConnectionArena {
    inner: RwLock<Slots>,
}

impl ConnectionArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a connection and return its handle
    pub fn insert(&self, connection: Arc<ConnectionState>) -> ConnectionHandle {
        let mut inner = self.inner.write();
        inner.live += 1;

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.connection = Some(connection);
            let handle = ConnectionHandle {
                index,
                epoch: slot.epoch,
            };
            debug!("Reused arena slot for {}", handle);
            return handle;
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            epoch: 0,
            connection: Some(connection),
        });
        ConnectionHandle { index, epoch: 0 }
    }

    /// Look up a live connection
    pub fn resolve(&self, handle: ConnectionHandle) -> Option<Arc<ConnectionState>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(handle.index as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.connection.clone()
    }

    /// Whether `handle` still refers to a live connection
    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Remove a connection, invalidating every outstanding handle to it
    pub fn remove(&self, handle: ConnectionHandle) -> Option<Arc<ConnectionState>> {
        let mut inner = self.inner.write();
        let slot = inner.slots.get_mut(handle.index as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        let connection = slot.connection.take()?;
        slot.epoch += 1;
        inner.free.push(handle.index);
        inner.live -= 1;
        debug!("Removed {} from arena", handle);
        Some(connection)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    /// Whether the arena holds no connections
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
