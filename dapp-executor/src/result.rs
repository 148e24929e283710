//! Transaction outcomes.

use crate::kernel::TransactionalKernel;
use crate::side_effects::SideEffects;
use alloy_primitives::Bytes;
use std::fmt;
use std::sync::Arc;

/// Outcome classification of one transaction (or internal call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    /// Static validation failed. Nothing is charged, nothing changes.
    Rejected,
    RejectedInvalidNonce,
    RejectedInsufficientBalance,
    /// Generic execution failure.
    Failed,
    FailedRevert,
    FailedOutOfEnergy,
    FailedOutOfStack,
    FailedCallDepthLimitExceeded,
    /// The contract code could not be loaded or deployed.
    FailedInvalid,
    /// The contract raised an exception it did not catch.
    FailedException,
    /// An internal call was refused before running (insufficient contract balance).
    FailedRejected,
    /// The runtime hit an unexpected internal error while running the contract.
    FailedUnexpected,
    /// Commit-order conflict; the task is retried and this code is never surfaced.
    FailedAbort,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }

    pub fn is_rejected(self) -> bool {
        matches!(
            self,
            ResultCode::Rejected
                | ResultCode::RejectedInvalidNonce
                | ResultCode::RejectedInsufficientBalance
        )
    }

    pub fn is_failed(self) -> bool {
        !self.is_success() && !self.is_rejected()
    }

    pub fn is_abort(self) -> bool {
        matches!(self, ResultCode::FailedAbort)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::Rejected => "REJECTED",
            ResultCode::RejectedInvalidNonce => "REJECTED_INVALID_NONCE",
            ResultCode::RejectedInsufficientBalance => "REJECTED_INSUFFICIENT_BALANCE",
            ResultCode::Failed => "FAILED",
            ResultCode::FailedRevert => "FAILED_REVERT",
            ResultCode::FailedOutOfEnergy => "FAILED_OUT_OF_ENERGY",
            ResultCode::FailedOutOfStack => "FAILED_OUT_OF_STACK",
            ResultCode::FailedCallDepthLimitExceeded => "FAILED_CALL_DEPTH_LIMIT_EXCEEDED",
            ResultCode::FailedInvalid => "FAILED_INVALID",
            ResultCode::FailedException => "FAILED_EXCEPTION",
            ResultCode::FailedRejected => "FAILED_REJECTED",
            ResultCode::FailedUnexpected => "FAILED_UNEXPECTED",
            ResultCode::FailedAbort => "FAILED_ABORT",
        };
        f.write_str(name)
    }
}

/// The externally visible outcome of a transaction.
///
/// `energy_used + energy_remaining() == energy_limit` always holds.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    code: ResultCode,
    energy_limit: u64,
    energy_used: u64,
    return_data: Bytes,
    side_effects: SideEffects,
    kernel: Option<Arc<TransactionalKernel>>,
}

impl TransactionResult {
    /// Creates a result that has already consumed `initial_energy_used`.
    pub fn new(energy_limit: u64, initial_energy_used: u64) -> Self {
        Self {
            code: ResultCode::Success,
            energy_limit,
            energy_used: initial_energy_used.min(energy_limit),
            return_data: Bytes::new(),
            side_effects: SideEffects::new(),
            kernel: None,
        }
    }

    /// A rejection: the whole limit is reported as used, but nothing is charged.
    pub fn rejected(code: ResultCode, energy_limit: u64) -> Self {
        let mut result = Self::new(energy_limit, energy_limit);
        result.code = code;
        result
    }

    pub fn aborted(energy_limit: u64) -> Self {
        Self::rejected(ResultCode::FailedAbort, energy_limit)
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn set_code(&mut self, code: ResultCode) {
        self.code = code;
    }

    pub fn energy_limit(&self) -> u64 {
        self.energy_limit
    }

    pub fn energy_used(&self) -> u64 {
        self.energy_used
    }

    pub fn energy_remaining(&self) -> u64 {
        self.energy_limit - self.energy_used
    }

    /// Adds `amount` to the energy used, saturating at the limit.
    pub fn charge_energy(&mut self, amount: u64) {
        self.energy_used = self.energy_used.saturating_add(amount).min(self.energy_limit);
    }

    /// Marks the whole limit as used.
    pub fn use_all_energy(&mut self) {
        self.energy_used = self.energy_limit;
    }

    pub fn return_data(&self) -> &Bytes {
        &self.return_data
    }

    pub fn set_return_data(&mut self, data: Bytes) {
        self.return_data = data;
    }

    pub fn side_effects(&self) -> &SideEffects {
        &self.side_effects
    }

    pub(crate) fn set_side_effects(&mut self, side_effects: SideEffects) {
        self.side_effects = side_effects;
    }

    /// The task's transactional kernel, attached only to terminal results.
    pub fn kernel(&self) -> Option<&Arc<TransactionalKernel>> {
        self.kernel.as_ref()
    }

    pub(crate) fn set_kernel(&mut self, kernel: Arc<TransactionalKernel>) {
        self.kernel = Some(kernel);
    }
}

impl fmt::Display for TransactionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransactionResult(code={}, energy_used={}, energy_remaining={}, logs={}, internal_txs={})",
            self.code,
            self.energy_used,
            self.energy_remaining(),
            self.side_effects.logs().len(),
            self.side_effects.internal_transactions().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_classification() {
        assert!(ResultCode::Success.is_success());
        assert!(ResultCode::RejectedInvalidNonce.is_rejected());
        assert!(!ResultCode::RejectedInvalidNonce.is_failed());
        assert!(ResultCode::FailedRevert.is_failed());
        assert!(ResultCode::FailedAbort.is_abort());
        assert!(!ResultCode::FailedRejected.is_rejected());
    }

    #[test]
    fn test_energy_accounting_never_exceeds_limit() {
        let mut result = TransactionResult::new(50_000, 21_000);
        result.charge_energy(10_000);
        assert_eq!(result.energy_used() + result.energy_remaining(), 50_000);

        result.charge_energy(u64::MAX);
        assert_eq!(result.energy_used(), 50_000);
        assert_eq!(result.energy_remaining(), 0);

        let oversized = TransactionResult::new(1_000, 21_000);
        assert_eq!(oversized.energy_used(), 1_000);
    }
}
