//! The unit of work handed to an executor thread.

use crate::error::EngineError;
use crate::kernel::{Kernel, TransactionalKernel};
use crate::monitor::{AbortSignal, TaskIdentity};
use crate::side_effects::{SideEffects, SideEffectsStack};
use crate::types::{InternalTransaction, Log, ResolvedTransaction, TxnIndex};
use alloy_primitives::Address;
use std::sync::Arc;

/// A contract instance open somewhere on the current task's call stack.
#[derive(Debug)]
pub struct ReentrantFrame<D> {
    pub address: Address,
    pub dapp: Arc<D>,
}

/// Contract instances entered earlier in this task's call chain.
///
/// A nested call back into an address that is already on the stack resumes
/// that same instance instead of loading another one.
#[derive(Debug)]
pub struct ReentrantDAppStack<D> {
    frames: Vec<ReentrantFrame<D>>,
}

impl<D> Default for ReentrantDAppStack<D> {
    fn default() -> Self {
        Self { frames: Vec::new() }
    }
}

impl<D> ReentrantDAppStack<D> {
    pub fn push(&mut self, address: Address, dapp: Arc<D>) {
        self.frames.push(ReentrantFrame { address, dapp });
    }

    pub fn pop(&mut self) -> Option<ReentrantFrame<D>> {
        self.frames.pop()
    }

    /// The innermost open instance for `address`, if any.
    pub fn try_share_state(&self, address: &Address) -> Option<Arc<D>> {
        self.frames
            .iter()
            .rev()
            .find(|frame| frame.address == *address)
            .map(|frame| frame.dapp.clone())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}

/// One transaction's execution context.
///
/// The transaction itself never changes; everything else is reset by
/// [`start_new_attempt`](Self::start_new_attempt) before each (re-)execution,
/// so an aborted attempt leaves no trace.
pub struct TransactionTask<D> {
    index: TxnIndex,
    /// Handoff ticket used to route the result back to its future.
    pub(crate) ticket: u64,
    transaction: ResolvedTransaction,
    base: Arc<dyn Kernel>,
    kernel: Arc<TransactionalKernel>,
    side_effects: SideEffectsStack,
    reentrant: ReentrantDAppStack<D>,
    abort: AbortSignal,
    attempts: u32,
}

impl<D> TransactionTask<D> {
    pub fn new(base: Arc<dyn Kernel>, transaction: ResolvedTransaction, index: TxnIndex) -> Self {
        Self {
            index,
            ticket: 0,
            transaction,
            kernel: Arc::new(TransactionalKernel::new(base.clone())),
            base,
            side_effects: SideEffectsStack::for_external_transaction(),
            reentrant: ReentrantDAppStack::default(),
            abort: AbortSignal::new(),
            attempts: 0,
        }
    }

    /// Resets all mutable execution state for a fresh attempt.
    pub fn start_new_attempt(&mut self) {
        self.kernel = Arc::new(TransactionalKernel::new(self.base.clone()));
        self.side_effects = SideEffectsStack::for_external_transaction();
        self.reentrant.clear();
        self.abort.clear();
        self.attempts += 1;
    }

    pub fn index(&self) -> TxnIndex {
        self.index
    }

    pub fn transaction(&self) -> &ResolvedTransaction {
        &self.transaction
    }

    /// The task's root kernel layer, chained to the batch's base kernel.
    pub fn kernel(&self) -> &Arc<TransactionalKernel> {
        &self.kernel
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.index, self.abort.clone())
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.is_raised()
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reentrant_stack(&self) -> &ReentrantDAppStack<D> {
        &self.reentrant
    }

    pub fn reentrant_stack_mut(&mut self) -> &mut ReentrantDAppStack<D> {
        &mut self.reentrant
    }

    pub fn side_effects(&self) -> &SideEffectsStack {
        &self.side_effects
    }

    pub fn push_internal_side_effects(&mut self, record: InternalTransaction) {
        self.side_effects.start_internal_entry(record);
    }

    pub fn add_log(&mut self, log: Log) -> Result<(), EngineError> {
        self.side_effects.add_log(log)
    }

    pub fn discard_current_side_effects(&mut self) -> Result<(), EngineError> {
        self.side_effects.clear_logs_and_reject_current()
    }

    pub fn pop_internal_side_effects(&mut self) -> Result<(), EngineError> {
        self.side_effects.finish_internal_entry()
    }

    pub fn take_external_side_effects(&mut self) -> Result<SideEffects, EngineError> {
        self.side_effects.take_external()
    }
}
