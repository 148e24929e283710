//! Process-wide cache of loaded contract instances.
//!
//! An instance is checked out for exclusive use during a call and checked back
//! in only after a successful, non-reentrant call has reset it to a clean
//! state. Entries remember the block at which they were loaded so a batch for
//! an earlier or equal block (a reorg) never sees an instance loaded later.

use alloy_primitives::Address;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A cached instance plus the block it was loaded at.
#[derive(Debug)]
pub struct CachedDApp<D> {
    pub dapp: Arc<D>,
    pub loaded_block: u64,
    stamp: u64,
}

/// Bounded cache keyed by contract address.
///
/// When full, the entry checked in longest ago is evicted.
#[derive(Debug)]
pub struct DAppCache<D> {
    entries: DashMap<Address, CachedDApp<D>>,
    capacity: usize,
    clock: AtomicU64,
}

impl<D> DAppCache<D> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            clock: AtomicU64::new(0),
        }
    }

    /// Removes and returns the instance for `address`.
    pub fn checkout(&self, address: &Address) -> Option<CachedDApp<D>> {
        self.entries.remove(address).map(|(_, entry)| entry)
    }

    /// Returns an instance to the cache.
    pub fn checkin(&self, address: Address, dapp: Arc<D>, loaded_block: u64) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            address,
            CachedDApp {
                dapp,
                loaded_block,
                stamp,
            },
        );
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().stamp)
                .map(|entry| *entry.key());
            match oldest {
                Some(address) => {
                    self.entries.remove(&address);
                }
                None => break,
            }
        }
    }

    /// Drops every instance loaded at `block` or later.
    pub fn invalidate_from_block(&self, block: u64) {
        self.entries.retain(|_, entry| entry.loaded_block < block);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_is_exclusive() {
        let cache = DAppCache::new(4);
        let address = Address::with_last_byte(1);
        cache.checkin(address, Arc::new("dapp"), 5);

        let entry = cache.checkout(&address).unwrap();
        assert_eq!(*entry.dapp, "dapp");
        assert_eq!(entry.loaded_block, 5);
        assert!(cache.checkout(&address).is_none());
    }

    #[test]
    fn test_eviction_drops_oldest_checkin() {
        let cache = DAppCache::new(2);
        cache.checkin(Address::with_last_byte(1), Arc::new(1), 1);
        cache.checkin(Address::with_last_byte(2), Arc::new(2), 1);
        cache.checkin(Address::with_last_byte(3), Arc::new(3), 1);

        assert_eq!(cache.len(), 2);
        assert!(cache.checkout(&Address::with_last_byte(1)).is_none());
        assert!(cache.checkout(&Address::with_last_byte(3)).is_some());
    }

    #[test]
    fn test_invalidate_from_block() {
        let cache = DAppCache::new(8);
        cache.checkin(Address::with_last_byte(1), Arc::new(1), 3);
        cache.checkin(Address::with_last_byte(2), Arc::new(2), 7);

        cache.invalidate_from_block(5);

        assert!(cache.checkout(&Address::with_last_byte(1)).is_some());
        assert!(cache.checkout(&Address::with_last_byte(2)).is_none());
    }
}
