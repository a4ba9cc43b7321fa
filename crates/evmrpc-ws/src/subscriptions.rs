//! WebSocket subscription bookkeeping.
//!
//! Each subscription gets a local key that stays fixed for its lifetime,
//! plus a route from the server-assigned id while the node knows about it.
//! On disconnect, routes are dropped and confirmed subscriptions are parked
//! so they can be replayed with their original params after reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use evmrpc_core::error::TransportError;

/// A subscription id returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(TransportError) + Send + Sync>;

struct SubscriptionEntry {
    /// Full `eth_subscribe` params, replayed verbatim on reconnect.
    params: Vec<Value>,
    on_data: DataCallback,
    on_error: ErrorCallback,
    server_id: Option<SubscriptionId>,
    parked: bool,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<u64, SubscriptionEntry>,
    routes: HashMap<SubscriptionId, u64>,
    next_key: u64,
}

/// Shared between the client handle and the connection task.
#[derive(Clone, Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unconfirmed subscription and return its local key.
    pub fn insert(&self, params: Vec<Value>, on_data: DataCallback, on_error: ErrorCallback) -> u64 {
        let mut reg = self.inner.lock().unwrap();
        reg.next_key += 1;
        let key = reg.next_key;
        reg.entries.insert(
            key,
            SubscriptionEntry {
                params,
                on_data,
                on_error,
                server_id: None,
                parked: false,
            },
        );
        key
    }

    /// Route pushes for `server_id` to the entry under `key`.
    ///
    /// Returns `false` when the entry is gone, in which case the caller
    /// should tell the node to drop the subscription.
    pub fn bind(&self, key: u64, server_id: SubscriptionId) -> bool {
        let mut reg = self.inner.lock().unwrap();
        let Some(entry) = reg.entries.get_mut(&key) else {
            return false;
        };
        entry.parked = false;
        let previous = entry.server_id.replace(server_id.clone());
        if let Some(previous) = previous {
            reg.routes.remove(&previous);
        }
        reg.routes.insert(server_id, key);
        true
    }

    /// Deliver a push. Returns `false` if no subscription is routed there.
    pub fn dispatch(&self, server_id: &SubscriptionId, result: Value) -> bool {
        let on_data = {
            let reg = self.inner.lock().unwrap();
            reg.routes
                .get(server_id)
                .and_then(|key| reg.entries.get(key))
                .map(|entry| entry.on_data.clone())
        };
        match on_data {
            Some(on_data) => {
                on_data(result);
                true
            }
            None => false,
        }
    }

    /// Remove an entry; yields the server id it was routed under, if any.
    pub fn remove(&self, key: u64) -> Option<SubscriptionId> {
        let mut reg = self.inner.lock().unwrap();
        let server_id = reg.entries.remove(&key)?.server_id?;
        reg.routes.remove(&server_id);
        Some(server_id)
    }

    /// Remove an entry and hand back its error callback.
    pub fn fail(&self, key: u64) -> Option<ErrorCallback> {
        let mut reg = self.inner.lock().unwrap();
        let entry = reg.entries.remove(&key)?;
        if let Some(server_id) = &entry.server_id {
            reg.routes.remove(server_id);
        }
        Some(entry.on_error)
    }

    pub fn server_id(&self, key: u64) -> Option<SubscriptionId> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&key)
            .and_then(|entry| entry.server_id.clone())
    }

    /// Drop every route and park each confirmed subscription.
    ///
    /// Returns the error callbacks of the parked entries; each must be
    /// told about the disconnect once. Unconfirmed entries are left alone,
    /// their `subscribe` call fails on its own.
    pub fn park(&self) -> Vec<ErrorCallback> {
        let mut reg = self.inner.lock().unwrap();
        reg.routes.clear();
        reg.entries
            .values_mut()
            .filter_map(|entry| {
                entry.server_id.take()?;
                entry.parked = true;
                Some(entry.on_error.clone())
            })
            .collect()
    }

    /// Params of every parked entry, for replay on a fresh connection.
    pub fn parked(&self) -> Vec<(u64, Vec<Value>)> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|(_, entry)| entry.parked)
            .map(|(key, entry)| (*key, entry.params.clone()))
            .collect()
    }

    pub fn clear(&self) {
        let mut reg = self.inner.lock().unwrap();
        reg.entries.clear();
        reg.routes.clear();
    }

    /// Number of live subscriptions, parked ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}
