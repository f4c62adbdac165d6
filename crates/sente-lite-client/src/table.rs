//! Process-wide handle -> client-state lookup table.
//!
//! Background tasks (the heartbeat ping sender, the reconnect timer) are
//! spawned independently of the [`crate::client::Client`] handle the
//! application holds, so they cannot hold a strong reference back to their
//! own owner without creating a reference cycle. Instead they carry an
//! opaque [`ClientHandle`] and resolve it through this table, which holds
//! only a weak reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use crate::client::ClientInner;

/// Opaque id identifying a registered client's state in the process-wide
/// table. Cheap to copy and pass into spawned tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(u64);

fn table() -> &'static RwLock<HashMap<ClientHandle, Weak<ClientInner>>> {
    static TABLE: OnceLock<RwLock<HashMap<ClientHandle, Weak<ClientInner>>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn next_handle() -> ClientHandle {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ClientHandle(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Register a client's state, returning the handle background tasks should
/// carry to resolve it later.
pub fn register(inner: &Arc<ClientInner>) -> ClientHandle {
    let handle = next_handle();
    table()
        .write()
        .unwrap()
        .insert(handle, Arc::downgrade(inner));
    handle
}

/// Resolve a handle back to live client state. Returns `None` once the
/// client has been dropped.
pub fn lookup(handle: ClientHandle) -> Option<Arc<ClientInner>> {
    table().read().unwrap().get(&handle)?.upgrade()
}

/// Remove a handle from the table. Called when a client shuts down.
pub fn unregister(handle: ClientHandle) {
    table().write().unwrap().remove(&handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_none_after_the_client_is_dropped() {
        let inner = Arc::new(ClientInner::new_for_test());
        let handle = register(&inner);
        assert!(lookup(handle).is_some());
        drop(inner);
        assert!(lookup(handle).is_none());
        unregister(handle);
    }
}
