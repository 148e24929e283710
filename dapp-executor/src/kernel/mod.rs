//! World-state access.
//!
//! The engine never touches persistent storage: it reads and writes through a
//! [`Kernel`]. A batch runs against a base kernel supplied by the caller, and
//! every task and every call level layers a [`TransactionalKernel`] on top of
//! it so that speculative writes stay private until committed.

mod memory;
mod transactional;

pub use memory::{AccountState, MemoryKernel};
pub use transactional::TransactionalKernel;

use alloy_primitives::{Address, Bytes, B256, I256, U256};

/// Block metadata visible to transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub timestamp: u64,
    pub energy_limit: u64,
    pub difficulty: U256,
    /// The fee recipient for this block.
    pub miner: Address,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            number: 1,
            timestamp: 0,
            energy_limit: 10_000_000,
            difficulty: U256::from(10_000_000u64),
            miner: Address::ZERO,
        }
    }
}

/// Minimum and maximum energy limits accepted for a contract deployment.
pub const CREATE_ENERGY_LIMIT_MIN: u64 = 200_000;
pub const CREATE_ENERGY_LIMIT_MAX: u64 = 5_000_000;

/// Minimum and maximum energy limits accepted for a call or transfer.
pub const CALL_ENERGY_LIMIT_MIN: u64 = 21_000;
pub const CALL_ENERGY_LIMIT_MAX: u64 = 2_000_000;

/// Read/write access to account state and block metadata.
///
/// All methods take `&self`: implementations are shared across executor
/// threads and use interior mutability. Balance changes are expressed as
/// signed deltas so that writes to an address nobody holds (the miner's fee
/// account) commute between tasks.
pub trait Kernel: Send + Sync {
    fn create_account(&self, address: Address);

    fn has_account_state(&self, address: &Address) -> bool;

    /// Removes the account together with its code and storage.
    fn delete_account(&self, address: Address);

    fn balance(&self, address: &Address) -> U256;

    fn adjust_balance(&self, address: Address, delta: I256);

    fn nonce(&self, address: &Address) -> u64;

    fn increment_nonce(&self, address: Address);

    fn code(&self, address: &Address) -> Option<Bytes>;

    fn put_code(&self, address: Address, code: Bytes);

    fn storage(&self, address: &Address, key: &B256) -> Option<Bytes>;

    fn put_storage(&self, address: Address, key: B256, value: Bytes);

    fn remove_storage(&self, address: Address, key: B256);

    fn block(&self) -> BlockContext;

    fn miner_address(&self) -> Address {
        self.block().miner
    }

    fn block_number(&self) -> u64 {
        self.block().number
    }

    fn balance_is_at_least(&self, address: &Address, amount: U256) -> bool {
        self.balance(address) >= amount
    }

    fn nonce_equals(&self, address: &Address, nonce: u64) -> bool {
        self.nonce(address) == nonce
    }

    fn refund_account(&self, address: Address, amount: U256) {
        self.adjust_balance(address, credit(amount));
    }

    fn is_valid_energy_limit_for_create(&self, limit: u64) -> bool {
        (CREATE_ENERGY_LIMIT_MIN..=CREATE_ENERGY_LIMIT_MAX).contains(&limit)
    }

    fn is_valid_energy_limit_for_non_create(&self, limit: u64) -> bool {
        (CALL_ENERGY_LIMIT_MIN..=CALL_ENERGY_LIMIT_MAX).contains(&limit)
    }
}

/// A positive balance delta.
pub fn credit(amount: U256) -> I256 {
    I256::try_from(amount).unwrap_or(I256::MAX)
}

/// A negative balance delta.
pub fn debit(amount: U256) -> I256 {
    -credit(amount)
}

/// Applies a signed delta to a balance, saturating at zero and `U256::MAX`.
pub fn apply_delta(balance: U256, delta: I256) -> U256 {
    if delta.is_negative() {
        balance.saturating_sub(delta.unsigned_abs())
    } else {
        balance.saturating_add(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_delta_saturates() {
        let ten = U256::from(10);
        assert_eq!(apply_delta(ten, credit(U256::from(5))), U256::from(15));
        assert_eq!(apply_delta(ten, debit(U256::from(4))), U256::from(6));
        assert_eq!(apply_delta(ten, debit(U256::from(11))), U256::ZERO);
    }

    #[test]
    fn test_energy_limit_bounds() {
        let kernel = MemoryKernel::new(BlockContext::default());
        assert!(kernel.is_valid_energy_limit_for_non_create(21_000));
        assert!(!kernel.is_valid_energy_limit_for_non_create(20_999));
        assert!(!kernel.is_valid_energy_limit_for_non_create(2_000_001));
        assert!(kernel.is_valid_energy_limit_for_create(5_000_000));
        assert!(!kernel.is_valid_energy_limit_for_create(21_000));
    }
}
