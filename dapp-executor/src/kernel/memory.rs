//! In-memory kernel used as the base state of a batch in tests and benches.

use super::{apply_delta, BlockContext, Kernel};
use alloy_primitives::{Address, Bytes, B256, I256, U256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Account state stored by [`MemoryKernel`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: U256,
    pub nonce: u64,
    pub code: Option<Bytes>,
    pub storage: BTreeMap<B256, Bytes>,
}

impl AccountState {
    pub fn new(nonce: u64, balance: U256) -> Self {
        Self {
            balance,
            nonce,
            ..Default::default()
        }
    }
}

/// Thread-safe in-memory [`Kernel`].
#[derive(Debug, Default)]
pub struct MemoryKernel {
    accounts: RwLock<HashMap<Address, AccountState>>,
    block: BlockContext,
}

impl MemoryKernel {
    pub fn new(block: BlockContext) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            block,
        }
    }

    /// Inserts (or replaces) an account with the given balance and nonce 0.
    pub fn with_account(self, address: Address, balance: U256) -> Self {
        self.accounts
            .write()
            .insert(address, AccountState::new(0, balance));
        self
    }

    /// Installs code at `address`, creating the account if needed.
    pub fn with_code(self, address: Address, code: Bytes) -> Self {
        self.put_code(address, code);
        self
    }

    /// A deterministic copy of every account, for state comparisons.
    pub fn snapshot(&self) -> BTreeMap<Address, AccountState> {
        self.accounts
            .read()
            .iter()
            .map(|(address, state)| (*address, state.clone()))
            .collect()
    }

    /// Copies the full account state into a fresh kernel with the same block.
    pub fn duplicate(&self) -> Self {
        Self {
            accounts: RwLock::new(self.accounts.read().clone()),
            block: self.block,
        }
    }

    /// Copies the full account state into a kernel for the following block.
    pub fn next_block(&self) -> Self {
        let mut block = self.block;
        block.number += 1;
        block.timestamp += 1;
        Self {
            accounts: RwLock::new(self.accounts.read().clone()),
            block,
        }
    }
}

impl Kernel for MemoryKernel {
    fn create_account(&self, address: Address) {
        self.accounts.write().entry(address).or_default();
    }

    fn has_account_state(&self, address: &Address) -> bool {
        self.accounts.read().contains_key(address)
    }

    fn delete_account(&self, address: Address) {
        self.accounts.write().remove(&address);
    }

    fn balance(&self, address: &Address) -> U256 {
        self.accounts
            .read()
            .get(address)
            .map(|account| account.balance)
            .unwrap_or(U256::ZERO)
    }

    fn adjust_balance(&self, address: Address, delta: I256) {
        let mut accounts = self.accounts.write();
        let account = accounts.entry(address).or_default();
        account.balance = apply_delta(account.balance, delta);
    }

    fn nonce(&self, address: &Address) -> u64 {
        self.accounts
            .read()
            .get(address)
            .map(|account| account.nonce)
            .unwrap_or(0)
    }

    fn increment_nonce(&self, address: Address) {
        let mut accounts = self.accounts.write();
        let account = accounts.entry(address).or_default();
        account.nonce += 1;
    }

    fn code(&self, address: &Address) -> Option<Bytes> {
        self.accounts
            .read()
            .get(address)
            .and_then(|account| account.code.clone())
    }

    fn put_code(&self, address: Address, code: Bytes) {
        self.accounts.write().entry(address).or_default().code = Some(code);
    }

    fn storage(&self, address: &Address, key: &B256) -> Option<Bytes> {
        self.accounts
            .read()
            .get(address)
            .and_then(|account| account.storage.get(key).cloned())
    }

    fn put_storage(&self, address: Address, key: B256, value: Bytes) {
        self.accounts
            .write()
            .entry(address)
            .or_default()
            .storage
            .insert(key, value);
    }

    fn remove_storage(&self, address: Address, key: B256) {
        if let Some(account) = self.accounts.write().get_mut(&address) {
            account.storage.remove(&key);
        }
    }

    fn block(&self) -> BlockContext {
        self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{credit, debit};

    #[test]
    fn test_balance_and_nonce() {
        let address = Address::with_last_byte(1);
        let kernel = MemoryKernel::default().with_account(address, U256::from(100));

        kernel.adjust_balance(address, credit(U256::from(5)));
        kernel.adjust_balance(address, debit(U256::from(20)));
        kernel.increment_nonce(address);

        assert_eq!(kernel.balance(&address), U256::from(85));
        assert_eq!(kernel.nonce(&address), 1);
        assert_eq!(kernel.balance(&Address::with_last_byte(2)), U256::ZERO);
    }

    #[test]
    fn test_delete_removes_code_and_storage() {
        let address = Address::with_last_byte(1);
        let kernel = MemoryKernel::default().with_code(address, Bytes::from_static(&[1, 2]));
        kernel.put_storage(address, B256::ZERO, Bytes::from_static(&[9]));

        kernel.delete_account(address);

        assert!(!kernel.has_account_state(&address));
        assert_eq!(kernel.code(&address), None);
        assert_eq!(kernel.storage(&address, &B256::ZERO), None);
    }
}
