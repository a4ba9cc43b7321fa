//! Request-id allocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::request::RpcId;

/// Monotonic request-id counter.
///
/// Clones share the same counter, so handing one generator to several
/// transports keeps their ids disjoint. Independently created generators
/// count on their own.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    next: Arc<AtomicU64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    /// Take the next id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_rpc_id(&self) -> RpcId {
        RpcId::Number(self.next_id())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counter() {
        let a = IdGenerator::new();
        let b = a.clone();
        assert_eq!(a.next_id(), 1);
        assert_eq!(b.next_id(), 2);
        assert_eq!(a.next_id(), 3);
    }

    #[test]
    fn independent_generators() {
        let a = IdGenerator::starting_at(10);
        let b = IdGenerator::starting_at(10);
        assert_eq!(a.next_id(), 10);
        assert_eq!(b.next_id(), 10);
    }

    #[test]
    fn unique_under_contention() {
        let ids = IdGenerator::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
