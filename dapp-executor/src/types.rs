//! Core transaction types shared by the engine and its collaborators.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use std::fmt;

/// Submission index of a transaction within its batch (0-based).
pub type TxnIndex = usize;

/// What a transaction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    /// Deploy a new contract from the payload.
    Create,
    /// Call (or transfer value to) an existing address.
    Call(Address),
}

/// An external transaction as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Address,
    pub kind: TxKind,
    pub nonce: u64,
    pub value: U256,
    pub data: Bytes,
    pub energy_limit: u64,
    pub energy_price: u64,
}

impl Transaction {
    /// Builds a call (or plain value transfer) transaction.
    pub fn call(
        sender: Address,
        destination: Address,
        nonce: u64,
        value: U256,
        data: Bytes,
        energy_limit: u64,
        energy_price: u64,
    ) -> Self {
        Self {
            sender,
            kind: TxKind::Call(destination),
            nonce,
            value,
            data,
            energy_limit,
            energy_price,
        }
    }

    /// Builds a contract deployment transaction.
    pub fn create(
        sender: Address,
        nonce: u64,
        value: U256,
        code: Bytes,
        energy_limit: u64,
        energy_price: u64,
    ) -> Self {
        Self {
            sender,
            kind: TxKind::Create,
            nonce,
            value,
            data: code,
            energy_limit,
            energy_price,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self.kind, TxKind::Create)
    }
}

/// Default contract address derivation: `keccak256(sender ‖ nonce)[12..]`.
pub fn derive_contract_address(sender: Address, nonce: u64) -> Address {
    let mut data = Vec::with_capacity(20 + 8);
    data.extend_from_slice(sender.as_slice());
    data.extend_from_slice(&nonce.to_be_bytes());
    let hash = keccak256(&data);
    Address::from_slice(&hash[12..])
}

/// A transaction whose destination is always concrete.
///
/// External transactions are resolved once when a batch is submitted; internal
/// calls are resolved by the invocation that spawns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransaction {
    pub sender: Address,
    pub destination: Address,
    pub is_create: bool,
    pub nonce: u64,
    pub value: U256,
    pub data: Bytes,
    pub energy_limit: u64,
    pub energy_price: u64,
}

impl ResolvedTransaction {
    /// Resolves an external transaction, using `contract_address` for creates.
    pub fn resolve(
        tx: &Transaction,
        contract_address: impl FnOnce(&Transaction) -> Address,
    ) -> Self {
        let (destination, is_create) = match tx.kind {
            TxKind::Create => (contract_address(tx), true),
            TxKind::Call(to) => (to, false),
        };
        Self {
            sender: tx.sender,
            destination,
            is_create,
            nonce: tx.nonce,
            value: tx.value,
            data: tx.data.clone(),
            energy_limit: tx.energy_limit,
            energy_price: tx.energy_price,
        }
    }

    /// The record kept in the side-effects ledger for this call.
    pub fn to_internal_record(&self) -> InternalTransaction {
        InternalTransaction {
            sender: self.sender,
            destination: self.destination,
            is_create: self.is_create,
            nonce: self.nonce,
            value: self.value,
            data: self.data.clone(),
            energy_limit: self.energy_limit,
            energy_price: self.energy_price,
            rejected: false,
        }
    }
}

/// A contract-to-contract call spawned while executing an external transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalTransaction {
    pub sender: Address,
    pub destination: Address,
    pub is_create: bool,
    pub nonce: u64,
    pub value: U256,
    pub data: Bytes,
    pub energy_limit: u64,
    pub energy_price: u64,
    rejected: bool,
}

impl InternalTransaction {
    pub fn mark_rejected(&mut self) {
        self.rejected = true;
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }
}

/// A log raised by a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

impl Log {
    pub fn new(address: Address, topics: Vec<B256>, data: Bytes) -> Self {
        Self { address, topics, data }
    }
}

impl fmt::Display for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Log({}, topics={}, data={})", self.address, self.topics.len(), self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_create_uses_derived_address() {
        let sender = Address::with_last_byte(1);
        let tx = Transaction::create(sender, 7, U256::ZERO, Bytes::new(), 1_000_000, 1);

        let resolved =
            ResolvedTransaction::resolve(&tx, |t| derive_contract_address(t.sender, t.nonce));

        assert!(resolved.is_create);
        assert_eq!(resolved.destination, derive_contract_address(sender, 7));
        assert_ne!(derive_contract_address(sender, 7), derive_contract_address(sender, 8));
    }

    #[test]
    fn test_resolve_call_keeps_destination() {
        let tx = Transaction::call(
            Address::with_last_byte(1),
            Address::with_last_byte(2),
            0,
            U256::from(5),
            Bytes::new(),
            21_000,
            1,
        );

        let resolved = ResolvedTransaction::resolve(&tx, |_| Address::ZERO);

        assert!(!resolved.is_create);
        assert_eq!(resolved.destination, Address::with_last_byte(2));
        assert!(!resolved.to_internal_record().is_rejected());
    }
}
