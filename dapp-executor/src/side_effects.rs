//! Logs and internal-transaction records produced while executing a transaction.
//!
//! Every call level gets its own [`SideEffects`] entry on a
//! [`SideEffectsStack`]. When an internal call finishes, its entry is popped
//! and merged into its parent; when it fails, the entry is first stripped of
//! its logs and every internal transaction in it is marked rejected. Once the
//! external transaction finishes, only its entry remains and it is extracted
//! into the transaction result.

use crate::error::EngineError;
use crate::types::{InternalTransaction, Log};

/// The side effects attributable to one call level.
///
/// Values are treated as snapshots: every operation consumes the ledger and
/// returns the updated one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    logs: Vec<Log>,
    internal_transactions: Vec<InternalTransaction>,
}

impl SideEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: Log) -> Self {
        self.logs.push(log);
        self
    }

    pub fn with_internal_transaction(mut self, transaction: InternalTransaction) -> Self {
        self.internal_transactions.push(transaction);
        self
    }

    /// Appends `other`'s logs and internal transactions after this ledger's own.
    pub fn absorb(mut self, other: SideEffects) -> Self {
        self.logs.extend(other.logs);
        self.internal_transactions.extend(other.internal_transactions);
        self
    }

    /// Drops every log and marks every internal transaction rejected.
    pub fn cleared_and_rejected(mut self) -> Self {
        self.logs.clear();
        for transaction in &mut self.internal_transactions {
            transaction.mark_rejected();
        }
        self
    }

    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    pub fn internal_transactions(&self) -> &[InternalTransaction] {
        &self.internal_transactions
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.internal_transactions.is_empty()
    }
}

/// LIFO stack of [`SideEffects`], one entry per open call level.
#[derive(Debug, Clone)]
pub struct SideEffectsStack {
    entries: Vec<SideEffects>,
}

impl SideEffectsStack {
    /// Creates a stack holding the single entry of an external transaction.
    pub fn for_external_transaction() -> Self {
        Self {
            entries: vec![SideEffects::new()],
        }
    }

    /// Opens an entry for an internal call, seeded with the call's own record.
    pub fn start_internal_entry(&mut self, internal_transaction: InternalTransaction) {
        self.entries
            .push(SideEffects::new().with_internal_transaction(internal_transaction));
    }

    /// Adds a log to the innermost open entry.
    pub fn add_log(&mut self, log: Log) -> Result<(), EngineError> {
        self.replace_top(|top| top.with_log(log))
    }

    /// Clears the innermost entry's logs and rejects its internal transactions.
    pub fn clear_logs_and_reject_current(&mut self) -> Result<(), EngineError> {
        self.replace_top(SideEffects::cleared_and_rejected)
    }

    /// Pops the innermost internal-call entry and merges it into its parent.
    pub fn finish_internal_entry(&mut self) -> Result<(), EngineError> {
        if self.entries.len() < 2 {
            return Err(EngineError::Invariant(
                "finishing an internal entry requires a parent entry",
            ));
        }
        let top = self.entries.pop().unwrap_or_default();
        self.replace_top(|parent| parent.absorb(top))
    }

    /// Number of open entries; 1 while only the external transaction is running.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// True only after the external transaction's entry has been extracted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Extracts the external transaction's entry, leaving the stack empty.
    pub fn take_external(&mut self) -> Result<SideEffects, EngineError> {
        if self.entries.len() != 1 {
            return Err(EngineError::Invariant(
                "external side effects taken while internal entries are open",
            ));
        }
        Ok(self.entries.pop().unwrap_or_default())
    }

    fn replace_top(
        &mut self,
        update: impl FnOnce(SideEffects) -> SideEffects,
    ) -> Result<(), EngineError> {
        let top = self
            .entries
            .pop()
            .ok_or(EngineError::Invariant("side-effects stack is empty"))?;
        self.entries.push(update(top));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes, B256, U256};

    fn log(byte: u8) -> Log {
        Log::new(Address::with_last_byte(byte), vec![B256::with_last_byte(byte)], Bytes::new())
    }

    fn internal(byte: u8) -> InternalTransaction {
        crate::types::ResolvedTransaction {
            sender: Address::with_last_byte(byte),
            destination: Address::with_last_byte(byte + 1),
            is_create: false,
            nonce: 0,
            value: U256::ZERO,
            data: Bytes::new(),
            energy_limit: 100_000,
            energy_price: 1,
        }
        .to_internal_record()
    }

    #[test]
    fn test_successful_internal_entry_merges_into_parent() {
        let mut stack = SideEffectsStack::for_external_transaction();
        stack.add_log(log(1)).unwrap();

        stack.start_internal_entry(internal(2));
        stack.add_log(log(2)).unwrap();
        assert_eq!(stack.depth(), 2);
        stack.finish_internal_entry().unwrap();

        let effects = stack.take_external().unwrap();
        assert_eq!(effects.logs(), &[log(1), log(2)]);
        assert_eq!(effects.internal_transactions().len(), 1);
        assert!(!effects.internal_transactions()[0].is_rejected());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_failed_internal_entry_keeps_sibling_effects() {
        let mut stack = SideEffectsStack::for_external_transaction();

        // A sibling call that succeeds.
        stack.start_internal_entry(internal(1));
        stack.add_log(log(1)).unwrap();
        stack.finish_internal_entry().unwrap();

        // A call that spawns a nested call and then fails.
        stack.start_internal_entry(internal(3));
        stack.start_internal_entry(internal(5));
        stack.add_log(log(5)).unwrap();
        stack.finish_internal_entry().unwrap();
        stack.add_log(log(3)).unwrap();
        stack.clear_logs_and_reject_current().unwrap();
        stack.finish_internal_entry().unwrap();

        let effects = stack.take_external().unwrap();
        assert_eq!(effects.logs(), &[log(1)]);
        let rejected: Vec<bool> = effects
            .internal_transactions()
            .iter()
            .map(InternalTransaction::is_rejected)
            .collect();
        assert_eq!(rejected, vec![false, true, true]);
    }

    #[test]
    fn test_stack_misuse_is_reported() {
        let mut stack = SideEffectsStack::for_external_transaction();
        assert!(stack.finish_internal_entry().is_err());

        stack.start_internal_entry(internal(1));
        assert!(stack.take_external().is_err());

        stack.finish_internal_entry().unwrap();
        stack.take_external().unwrap();
        assert!(stack.add_log(log(1)).is_err());
        assert!(stack.take_external().is_err());
    }
}
