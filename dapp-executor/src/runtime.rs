//! The seam between the engine and the contract runtime.
//!
//! The engine owns ordering, state isolation and bookkeeping; a
//! [`ContractRuntime`] only deploys and runs contract code. While running, the
//! runtime talks back to the engine through an [`Invocation`], which exposes
//! the call's kernel layer, log emission, address acquisition and nested
//! calls.

use crate::engine::EngineCore;
use crate::error::EngineError;
use crate::kernel::{BlockContext, Kernel, TransactionalKernel};
use crate::result::{ResultCode, TransactionResult};
use crate::task::TransactionTask;
use crate::types::{derive_contract_address, Log, ResolvedTransaction, Transaction};
use alloy_primitives::{Address, Bytes, B256, U256};
use std::sync::Arc;

/// Nested calls deeper than this fail with
/// [`ResultCode::FailedCallDepthLimitExceeded`].
pub const MAX_CALL_DEPTH: usize = 10;

/// What a contract call reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub status: ResultCode,
    pub energy_used: u64,
    pub return_data: Bytes,
    /// Diagnostic text for failed calls.
    pub message: Option<String>,
}

impl CallOutcome {
    pub fn success(energy_used: u64, return_data: Bytes) -> Self {
        Self {
            status: ResultCode::Success,
            energy_used,
            return_data,
            message: None,
        }
    }

    pub fn failure(status: ResultCode, energy_used: u64, message: impl Into<String>) -> Self {
        Self {
            status,
            energy_used,
            return_data: Bytes::new(),
            message: Some(message.into()),
        }
    }
}

/// What a deployment reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub status: ResultCode,
    pub energy_used: u64,
    /// Code to store at the new contract address on success.
    pub code: Bytes,
    pub message: Option<String>,
}

/// A nested call requested by running contract code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalCall {
    /// `None` deploys `data` as a new contract.
    pub destination: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub energy_limit: u64,
}

/// Executes contract code on behalf of the engine.
///
/// Implementations are shared by every executor thread. `Err` is reserved for
/// faults that make the engine unusable; contract-level failures are reported
/// through the outcome status.
pub trait ContractRuntime: Sized + Send + Sync + 'static {
    /// A loaded, callable contract instance.
    type DApp: Send + Sync + 'static;

    /// Address of the contract a create transaction will deploy.
    fn contract_address(&self, tx: &Transaction) -> Address {
        derive_contract_address(tx.sender, tx.nonce)
    }

    fn deploy(
        &self,
        invocation: &mut Invocation<'_, Self>,
        code: &Bytes,
    ) -> Result<DeployOutcome, EngineError>;

    /// Loads deployed code. `Ok(None)` means the code is not a valid contract.
    fn load(
        &self,
        code: &Bytes,
        preserve_debuggability: bool,
    ) -> Result<Option<Self::DApp>, EngineError>;

    /// Runs `dapp`. `reentrant` is set when the instance is already active
    /// further up this transaction's call stack.
    fn call(
        &self,
        invocation: &mut Invocation<'_, Self>,
        dapp: &Self::DApp,
        reentrant: bool,
    ) -> Result<CallOutcome, EngineError>;

    /// Resets instance state before the instance goes back to the hot cache.
    fn clean_for_cache(&self, _dapp: &Self::DApp) {}
}

/// The engine as seen by one running call.
pub struct Invocation<'a, R: ContractRuntime> {
    core: &'a EngineCore<R>,
    task: &'a mut TransactionTask<R::DApp>,
    kernel: Arc<TransactionalKernel>,
    transaction: ResolvedTransaction,
    energy_budget: u64,
}

impl<'a, R: ContractRuntime> Invocation<'a, R> {
    pub(crate) fn new(
        core: &'a EngineCore<R>,
        task: &'a mut TransactionTask<R::DApp>,
        kernel: Arc<TransactionalKernel>,
        transaction: ResolvedTransaction,
        energy_budget: u64,
    ) -> Self {
        Self {
            core,
            task,
            kernel,
            transaction,
            energy_budget,
        }
    }

    /// This call's private kernel layer.
    pub fn kernel(&self) -> &Arc<TransactionalKernel> {
        &self.kernel
    }

    pub fn transaction(&self) -> &ResolvedTransaction {
        &self.transaction
    }

    /// Address of the contract being run.
    pub fn address(&self) -> Address {
        self.transaction.destination
    }

    pub fn caller(&self) -> Address {
        self.transaction.sender
    }

    /// Energy available to contract code for this call.
    pub fn energy_budget(&self) -> u64 {
        self.energy_budget
    }

    /// 0 for the external transaction, +1 for every nested call.
    pub fn depth(&self) -> usize {
        self.task.side_effects().depth().saturating_sub(1)
    }

    pub fn block(&self) -> BlockContext {
        self.kernel.block()
    }

    pub fn preserve_debuggability(&self) -> bool {
        self.core.config.preserve_debuggability
    }

    /// Records a log emitted by the running contract.
    pub fn emit_log(&mut self, topics: Vec<B256>, data: Bytes) -> Result<(), EngineError> {
        let log = Log::new(self.address(), topics, data);
        self.task.add_log(log)
    }

    /// Takes ownership of `address` for the rest of the transaction.
    ///
    /// Must be called before touching any account other than the caller and
    /// the running contract. `false` means the transaction is being aborted and
    /// the runtime should return [`ResultCode::FailedAbort`] promptly.
    pub fn acquire(&mut self, address: Address) -> bool {
        self.core.monitor.acquire(address, &self.task.identity())
            && self.core.may_touch(&*self.kernel, &address, self.task.index())
    }

    /// Whether the runtime should stop and return [`ResultCode::FailedAbort`].
    pub fn is_abort_requested(&self) -> bool {
        self.task.is_abort_requested() || self.core.fault.get().is_some()
    }

    /// Runs a nested call from the current contract.
    ///
    /// The callee's result is returned as-is; charging its energy to the
    /// caller is up to the runtime.
    pub fn call(&mut self, call: InternalCall) -> Result<TransactionResult, EngineError> {
        let energy_limit = call.energy_limit.min(self.energy_budget);
        if self.depth() >= MAX_CALL_DEPTH {
            let mut result = TransactionResult::new(energy_limit, 0);
            result.set_code(ResultCode::FailedCallDepthLimitExceeded);
            return Ok(result);
        }

        let sender = self.address();
        // Nonces only ever move on the task's root layer.
        let nonce = self.task.kernel().nonce(&sender);
        let price = self.transaction.energy_price;
        let tx = match call.destination {
            Some(destination) => Transaction::call(
                sender,
                destination,
                nonce,
                call.value,
                call.data,
                energy_limit,
                price,
            ),
            None => Transaction::create(sender, nonce, call.value, call.data, energy_limit, price),
        };
        let resolved =
            ResolvedTransaction::resolve(&tx, |tx| self.core.runtime.contract_address(tx));
        self.core
            .run_internal_transaction(self.task, &self.kernel, resolved)
    }
}
