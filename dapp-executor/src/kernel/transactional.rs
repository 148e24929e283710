//! Copy-on-write kernel layer.

use super::{apply_delta, BlockContext, Kernel};
use alloy_primitives::{Address, Bytes, B256, I256, U256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Writes buffered by one layer.
///
/// Everything is keyed through ordered maps so that a commit replays writes in
/// a deterministic order regardless of the order they were made in.
#[derive(Debug, Default)]
struct Overlay {
    code: BTreeMap<Address, Bytes>,
    /// `None` marks a removed slot.
    storage: BTreeMap<(Address, B256), Option<Bytes>>,
    balance_deltas: BTreeMap<Address, I256>,
    nonce_increments: BTreeMap<Address, u64>,
    created: BTreeSet<Address>,
    /// Accounts deleted in this layer. Reads for them never fall through.
    deleted: BTreeSet<Address>,
}

impl Overlay {
    fn touches(&self, address: &Address) -> bool {
        self.code.contains_key(address)
            || self.balance_deltas.contains_key(address)
            || self.nonce_increments.contains_key(address)
            || self.created.contains(address)
            || self.storage.keys().any(|(owner, _)| owner == address)
    }

    fn forget(&mut self, address: &Address) {
        self.code.remove(address);
        self.balance_deltas.remove(address);
        self.nonce_increments.remove(address);
        self.created.remove(address);
        self.storage.retain(|(owner, _), _| owner != address);
    }
}

/// A kernel layer that buffers all writes until [`commit`](Self::commit).
///
/// Reads fall through to the parent on a local miss. Layers nest: each
/// internal call stacks a fresh layer on its caller's layer, and a task's root
/// layer sits on the batch's base kernel.
pub struct TransactionalKernel {
    parent: Arc<dyn Kernel>,
    overlay: RwLock<Overlay>,
}

impl TransactionalKernel {
    pub fn new(parent: Arc<dyn Kernel>) -> Self {
        Self {
            parent,
            overlay: RwLock::new(Overlay::default()),
        }
    }

    /// Creates a child layer on top of this one.
    pub fn child(self: &Arc<Self>) -> Arc<TransactionalKernel> {
        let parent: Arc<dyn Kernel> = self.clone();
        Arc::new(TransactionalKernel::new(parent))
    }

    /// True when nothing has been written since creation or the last commit.
    pub fn is_clean(&self) -> bool {
        let overlay = self.overlay.read();
        overlay.code.is_empty()
            && overlay.storage.is_empty()
            && overlay.balance_deltas.is_empty()
            && overlay.nonce_increments.is_empty()
            && overlay.created.is_empty()
            && overlay.deleted.is_empty()
    }

    /// Pushes every buffered write into the parent and clears this layer.
    ///
    /// Order: code, storage, balance and nonce deltas, then account creations
    /// and deletions. An account that was deleted and then written again in
    /// this layer is deleted in the parent first, so its new writes land on a
    /// fresh account.
    pub fn commit(&self) {
        let overlay = std::mem::take(&mut *self.overlay.write());
        let (recreated, removed): (Vec<Address>, Vec<Address>) = overlay
            .deleted
            .iter()
            .copied()
            .partition(|address| overlay.touches(address));

        for address in &recreated {
            self.parent.delete_account(*address);
        }
        for (address, code) in overlay.code {
            self.parent.put_code(address, code);
        }
        for ((address, key), value) in overlay.storage {
            match value {
                Some(value) => self.parent.put_storage(address, key, value),
                None => self.parent.remove_storage(address, key),
            }
        }
        for (address, delta) in overlay.balance_deltas {
            self.parent.adjust_balance(address, delta);
        }
        for (address, increments) in overlay.nonce_increments {
            for _ in 0..increments {
                self.parent.increment_nonce(address);
            }
        }
        for address in overlay.created {
            self.parent.create_account(address);
        }
        for address in removed {
            self.parent.delete_account(address);
        }
    }

    fn is_deleted(&self, address: &Address) -> bool {
        self.overlay.read().deleted.contains(address)
    }
}

impl fmt::Debug for TransactionalKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overlay = self.overlay.read();
        f.debug_struct("TransactionalKernel")
            .field("code_writes", &overlay.code.len())
            .field("storage_writes", &overlay.storage.len())
            .field("balance_deltas", &overlay.balance_deltas.len())
            .field("nonce_increments", &overlay.nonce_increments.len())
            .field("created", &overlay.created.len())
            .field("deleted", &overlay.deleted.len())
            .finish()
    }
}

impl Kernel for TransactionalKernel {
    fn create_account(&self, address: Address) {
        self.overlay.write().created.insert(address);
    }

    fn has_account_state(&self, address: &Address) -> bool {
        let overlay = self.overlay.read();
        if overlay.touches(address) {
            return true;
        }
        !overlay.deleted.contains(address) && self.parent.has_account_state(address)
    }

    fn delete_account(&self, address: Address) {
        let mut overlay = self.overlay.write();
        overlay.forget(&address);
        overlay.deleted.insert(address);
    }

    fn balance(&self, address: &Address) -> U256 {
        let (deleted, delta) = {
            let overlay = self.overlay.read();
            (
                overlay.deleted.contains(address),
                overlay.balance_deltas.get(address).copied(),
            )
        };
        let base = if deleted {
            U256::ZERO
        } else {
            self.parent.balance(address)
        };
        match delta {
            Some(delta) => apply_delta(base, delta),
            None => base,
        }
    }

    fn adjust_balance(&self, address: Address, delta: I256) {
        let mut overlay = self.overlay.write();
        let entry = overlay.balance_deltas.entry(address).or_insert(I256::ZERO);
        *entry = entry.saturating_add(delta);
    }

    fn nonce(&self, address: &Address) -> u64 {
        let (deleted, increments) = {
            let overlay = self.overlay.read();
            (
                overlay.deleted.contains(address),
                overlay.nonce_increments.get(address).copied().unwrap_or(0),
            )
        };
        let base = if deleted { 0 } else { self.parent.nonce(address) };
        base + increments
    }

    fn increment_nonce(&self, address: Address) {
        *self
            .overlay
            .write()
            .nonce_increments
            .entry(address)
            .or_insert(0) += 1;
    }

    fn code(&self, address: &Address) -> Option<Bytes> {
        if let Some(code) = self.overlay.read().code.get(address) {
            return Some(code.clone());
        }
        if self.is_deleted(address) {
            return None;
        }
        self.parent.code(address)
    }

    fn put_code(&self, address: Address, code: Bytes) {
        self.overlay.write().code.insert(address, code);
    }

    fn storage(&self, address: &Address, key: &B256) -> Option<Bytes> {
        if let Some(value) = self.overlay.read().storage.get(&(*address, *key)) {
            return value.clone();
        }
        if self.is_deleted(address) {
            return None;
        }
        self.parent.storage(address, key)
    }

    fn put_storage(&self, address: Address, key: B256, value: Bytes) {
        self.overlay
            .write()
            .storage
            .insert((address, key), Some(value));
    }

    fn remove_storage(&self, address: Address, key: B256) {
        self.overlay.write().storage.insert((address, key), None);
    }

    fn block(&self) -> BlockContext {
        self.parent.block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{credit, debit, MemoryKernel};

    fn base() -> Arc<MemoryKernel> {
        Arc::new(MemoryKernel::default())
    }

    #[test]
    fn test_commit_data_onto_empty() {
        let base = base();
        let layer = TransactionalKernel::new(base.clone());
        let contract = Address::with_last_byte(1);
        let account = Address::with_last_byte(2);
        let key = B256::with_last_byte(3);

        layer.put_code(contract, Bytes::from_static(&[0]));
        layer.put_storage(contract, key, Bytes::from_static(&[4, 5]));
        layer.create_account(account);
        layer.adjust_balance(account, credit(U256::from(50)));
        assert_eq!(layer.code(&contract).map(|c| c.len()), Some(1));
        assert_eq!(layer.balance(&account), U256::from(50));

        // Nothing is visible below until the commit.
        assert_eq!(base.code(&contract), None);
        assert_eq!(base.storage(&contract, &key), None);
        assert_eq!(base.balance(&account), U256::ZERO);

        layer.commit();
        assert_eq!(base.code(&contract).map(|c| c.len()), Some(1));
        assert_eq!(base.storage(&contract, &key), Some(Bytes::from_static(&[4, 5])));
        assert_eq!(base.balance(&account), U256::from(50));
        assert!(layer.is_clean());
    }

    #[test]
    fn test_commit_data_onto_partial() {
        let base = base();
        let address = Address::with_last_byte(1);
        let key1 = B256::with_last_byte(1);
        let key2 = B256::with_last_byte(2);
        base.put_storage(address, key1, Bytes::from_static(&[1]));

        let layer = TransactionalKernel::new(base.clone());
        layer.put_storage(address, key1, Bytes::from_static(&[2]));
        layer.put_storage(address, key2, Bytes::from_static(&[3]));
        assert_eq!(base.storage(&address, &key1), Some(Bytes::from_static(&[1])));
        assert_eq!(base.storage(&address, &key2), None);

        layer.commit();
        assert_eq!(base.storage(&address, &key1), Some(Bytes::from_static(&[2])));
        assert_eq!(base.storage(&address, &key2), Some(Bytes::from_static(&[3])));
    }

    #[test]
    fn test_commit_adjustment() {
        let base = base();
        let address = Address::with_last_byte(1);
        let other = Address::with_last_byte(2);
        base.adjust_balance(address, credit(U256::from(1)));

        let layer = TransactionalKernel::new(base.clone());
        assert_eq!(layer.balance(&address), U256::from(1));
        layer.adjust_balance(address, credit(U256::from(10)));
        assert_eq!(layer.balance(&address), U256::from(11));
        layer.adjust_balance(address, debit(U256::from(5)));
        layer.adjust_balance(other, credit(U256::from(1)));

        layer.commit();
        assert_eq!(base.balance(&address), U256::from(6));
        assert_eq!(base.balance(&other), U256::from(1));
    }

    #[test]
    fn test_commit_delete() {
        let base = base();
        let address = Address::with_last_byte(1);
        base.adjust_balance(address, credit(U256::from(1)));

        let layer = TransactionalKernel::new(base.clone());
        layer.adjust_balance(address, credit(U256::from(10)));
        assert_eq!(layer.balance(&address), U256::from(11));
        layer.delete_account(address);
        assert_eq!(base.balance(&address), U256::from(1));
        assert_eq!(layer.balance(&address), U256::ZERO);

        layer.commit();
        assert_eq!(base.balance(&address), U256::ZERO);
        assert!(!base.has_account_state(&address));
    }

    #[test]
    fn test_commit_delete_recreate() {
        let base = base();
        let address = Address::with_last_byte(1);
        let key = B256::with_last_byte(7);
        base.adjust_balance(address, credit(U256::from(1)));
        base.put_storage(address, key, Bytes::from_static(&[1]));

        let layer = TransactionalKernel::new(base.clone());
        layer.delete_account(address);
        assert_eq!(layer.storage(&address, &key), None);
        layer.adjust_balance(address, credit(U256::from(2)));
        assert_eq!(layer.balance(&address), U256::from(2));

        layer.commit();
        assert_eq!(base.balance(&address), U256::from(2));
        assert_eq!(base.storage(&address, &key), None);
    }

    #[test]
    fn test_nested_layers_only_reach_base_through_each_commit() {
        let base = base();
        let address = Address::with_last_byte(1);
        let root = Arc::new(TransactionalKernel::new(base.clone()));
        let child = root.child();

        child.increment_nonce(address);
        child.adjust_balance(address, credit(U256::from(3)));
        assert_eq!(root.nonce(&address), 0);

        child.commit();
        assert_eq!(root.nonce(&address), 1);
        assert_eq!(base.nonce(&address), 0);

        root.commit();
        assert_eq!(base.nonce(&address), 1);
        assert_eq!(base.balance(&address), U256::from(3));
    }

    #[test]
    fn test_discarded_layer_leaves_parent_untouched() {
        let base = base();
        let address = Address::with_last_byte(1);
        let root = Arc::new(TransactionalKernel::new(base.clone()));
        {
            let child = root.child();
            child.put_code(address, Bytes::from_static(&[1]));
            child.remove_storage(address, B256::ZERO);
        }
        assert!(root.is_clean());
        assert_eq!(root.code(&address), None);
    }
}
