//! The concurrent transaction engine.
//!
//! [`Engine::run`] turns a batch of transactions into tasks and hands them to
//! a fixed pool of executor threads. Each thread executes its task
//! speculatively against a private kernel layer, then asks the
//! [`AddressResourceMonitor`] to commit it. Commits happen strictly in
//! submission order; a task that conflicts or finishes early is reset and run
//! again. The final state and every reported result therefore match a serial
//! execution of the batch.

use crate::billing::basic_transaction_cost;
use crate::cache::DAppCache;
use crate::error::EngineError;
use crate::handoff::{FaultLatch, HandoffMonitor, ResultFuture};
use crate::kernel::{credit, debit, Kernel, TransactionalKernel};
use crate::monitor::AddressResourceMonitor;
use crate::result::{ResultCode, TransactionResult};
use crate::runtime::{ContractRuntime, Invocation};
use crate::task::TransactionTask;
use crate::types::{ResolvedTransaction, Transaction, TxnIndex};
use alloy_primitives::{Address, Bytes, U256};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, trace, warn};

/// Upper bound on how long an aborted task waits for the commit cursor to move
/// before retrying anyway.
const COMMIT_PROGRESS_WAIT: Duration = Duration::from_millis(2);

/// Engine settings fixed at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of executor threads. Must be at least 1.
    pub thread_count: usize,
    /// Passed to the runtime when loading contracts.
    pub preserve_debuggability: bool,
    /// Log contract failure messages at `warn` instead of `debug`.
    pub enable_verbose_contract_errors: bool,
    /// Log task lifecycle events at `info` instead of `debug`.
    pub enable_verbose_concurrent_executor: bool,
    /// Maximum number of contract instances kept in the hot cache.
    pub hot_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_count: 4,
            preserve_debuggability: false,
            enable_verbose_contract_errors: false,
            enable_verbose_concurrent_executor: false,
            hot_cache_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_threads(thread_count: usize) -> Self {
        Self {
            thread_count,
            ..Default::default()
        }
    }
}

/// State shared by the submitting thread and every executor thread.
pub(crate) struct EngineCore<R: ContractRuntime> {
    pub(crate) runtime: R,
    pub(crate) config: EngineConfig,
    pub(crate) monitor: AddressResourceMonitor,
    pub(crate) hot_cache: DAppCache<R::DApp>,
    pub(crate) fault: Arc<FaultLatch>,
}

/// A running engine. Dropping it shuts the executor threads down.
pub struct Engine<R: ContractRuntime> {
    core: Arc<EngineCore<R>>,
    handoff: Arc<HandoffMonitor<R::DApp>>,
    /// Held for the whole of [`Engine::run`] so batches never interleave.
    submission: Mutex<()>,
    stopped: bool,
}

impl<R: ContractRuntime> Engine<R> {
    /// Starts `config.thread_count` executor threads.
    pub fn start(config: EngineConfig, runtime: R) -> Result<Self, EngineError> {
        if config.thread_count == 0 {
            return Err(EngineError::InvalidThreadCount);
        }
        let fault = Arc::new(FaultLatch::new());
        let thread_count = config.thread_count;
        let core = Arc::new(EngineCore {
            runtime,
            hot_cache: DAppCache::new(config.hot_cache_capacity),
            config,
            monitor: AddressResourceMonitor::new(),
            fault: fault.clone(),
        });
        let handoff = Arc::new(HandoffMonitor::new(fault));

        let body = {
            let core = core.clone();
            let handoff = handoff.clone();
            Arc::new(move |worker_id: usize| run_worker(worker_id, &core, &handoff))
        };
        if let Err(error) = handoff.start_executor_threads(thread_count, body) {
            let _ = handoff.stop_and_wait_for_shutdown();
            return Err(error);
        }

        info!(threads = thread_count, "Engine started");
        Ok(Self {
            core,
            handoff,
            submission: Mutex::new(()),
            stopped: false,
        })
    }

    /// Submits a batch executed against `kernel`.
    ///
    /// Returns one future per transaction, in submission order. The previous
    /// batch must be fully drained first; concurrent callers are serialized
    /// and all but the first see [`EngineError::BatchInProgress`].
    pub fn run(
        &self,
        kernel: Arc<dyn Kernel>,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<ResultFuture>, EngineError> {
        let _submission = self.submission.lock();
        self.core.fault.check()?;
        if self.stopped {
            return Err(EngineError::ShutDown);
        }
        if !self.handoff.is_idle() {
            return Err(EngineError::BatchInProgress);
        }
        self.core.monitor.clear()?;

        let block = kernel.block_number();
        if !transactions.is_empty() {
            // Instances loaded at this block or later belong to a replaced fork.
            self.core.hot_cache.invalidate_from_block(block);
        }

        let tasks: Vec<_> = transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                let resolved =
                    ResolvedTransaction::resolve(tx, |tx| self.core.runtime.contract_address(tx));
                TransactionTask::new(kernel.clone(), resolved, index)
            })
            .collect();
        debug!(block, transactions = tasks.len(), "Submitting batch");
        Ok(self.handoff.send_transactions_asynchronously(tasks))
    }

    /// Stops the executor threads and reports any background fault.
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        self.stop()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn runtime(&self) -> &R {
        &self.core.runtime
    }

    /// Number of contract instances currently in the hot cache.
    pub fn cached_dapp_count(&self) -> usize {
        self.core.hot_cache.len()
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let outcome = self.handoff.stop_and_wait_for_shutdown();
        if !self.core.hot_cache.is_empty() {
            debug!(entries = self.core.hot_cache.len(), "Clearing hot cache");
            self.core.hot_cache.clear();
        }
        info!("Engine shut down");
        outcome
    }
}

impl<R: ContractRuntime> Drop for Engine<R> {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            error!(%error, "Engine stopped after a fault");
        }
    }
}

fn run_worker<R: ContractRuntime>(
    worker_id: usize,
    core: &EngineCore<R>,
    handoff: &HandoffMonitor<R::DApp>,
) {
    let span = info_span!("executor_worker", worker_id);
    let _guard = span.enter();

    let error = match panic::catch_unwind(AssertUnwindSafe(|| worker_loop(core, handoff))) {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error,
        Err(payload) => EngineError::WorkerPanicked(panic_message(&*payload)),
    };
    error!(%error, "Executor thread failed");
    handoff.set_background_fault(error);
    core.monitor.poison();
}

fn worker_loop<R: ContractRuntime>(
    core: &EngineCore<R>,
    handoff: &HandoffMonitor<R::DApp>,
) -> Result<(), EngineError> {
    let verbose = core.config.enable_verbose_concurrent_executor;
    let mut previous = None;
    while let Some(mut task) = handoff.blocking_poll_for_transaction(previous.take()) {
        let backoff = Backoff::new();
        let result = loop {
            task.start_new_attempt();
            let observed = core.monitor.commit_cursor();
            if verbose {
                info!(index = task.index(), attempt = task.attempts(), "Starting task");
            } else {
                debug!(index = task.index(), attempt = task.attempts(), "Starting task");
            }

            let result = core.background_process_transaction(&mut task)?;
            if !result.code().is_abort() {
                break result;
            }
            if core.fault.get().is_some() {
                // The faulting thread already reported; futures observe the fault.
                return Ok(());
            }
            if verbose {
                info!(index = task.index(), attempt = task.attempts(), "Task aborted");
            } else {
                debug!(index = task.index(), attempt = task.attempts(), "Task aborted");
            }
            if backoff.is_completed() {
                core.monitor
                    .wait_for_commit_progress(observed, COMMIT_PROGRESS_WAIT);
            } else {
                backoff.snooze();
            }
        };

        if verbose {
            info!(
                index = task.index(),
                code = %result.code(),
                attempts = task.attempts(),
                "Task finished"
            );
        } else {
            debug!(
                index = task.index(),
                code = %result.code(),
                attempts = task.attempts(),
                "Task finished"
            );
        }
        previous = Some((task, result));
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<R: ContractRuntime> EngineCore<R> {
    /// Runs one attempt of an external transaction and tries to commit it.
    ///
    /// Returns a [`ResultCode::FailedAbort`] result when the attempt must be
    /// retried.
    fn background_process_transaction(
        &self,
        task: &mut TransactionTask<R::DApp>,
    ) -> Result<TransactionResult, EngineError> {
        let tx = task.transaction().clone();
        let identity = task.identity();
        let kernel = task.kernel().clone();

        let result = if let Some(code) = static_rejection(&*kernel, &tx) {
            TransactionResult::rejected(code, tx.energy_limit)
        } else if !self.monitor.acquire(tx.sender, &identity)
            || !self.monitor.acquire(tx.destination, &identity)
            || !self.may_touch(&*kernel, &tx.sender, task.index())
            || !self.may_touch(&*kernel, &tx.destination, task.index())
        {
            TransactionResult::aborted(tx.energy_limit)
        } else if !kernel.nonce_equals(&tx.sender, tx.nonce) {
            TransactionResult::rejected(ResultCode::RejectedInvalidNonce, tx.energy_limit)
        } else {
            self.run_external_invoke(task, &tx)?
        };

        if result.code().is_abort() {
            self.monitor.release(&identity);
            return Ok(result);
        }
        if !self
            .monitor
            .commit_for_task(&identity, &kernel, result.code().is_rejected())
        {
            return Ok(TransactionResult::aborted(tx.energy_limit));
        }

        let mut result = result;
        result.set_side_effects(task.take_external_side_effects()?);
        result.set_kernel(kernel);
        Ok(result)
    }

    /// Charges fees, runs the transaction and settles the sender and miner.
    fn run_external_invoke(
        &self,
        task: &mut TransactionTask<R::DApp>,
        tx: &ResolvedTransaction,
    ) -> Result<TransactionResult, EngineError> {
        let root = task.kernel().clone();
        let price = U256::from(tx.energy_price);
        let fee = U256::from(tx.energy_limit) * price;
        if !root.balance_is_at_least(&tx.sender, fee.saturating_add(tx.value)) {
            return Ok(TransactionResult::rejected(
                ResultCode::RejectedInsufficientBalance,
                tx.energy_limit,
            ));
        }
        root.adjust_balance(tx.sender, debit(fee));

        let base_cost = basic_transaction_cost(&tx.data);
        let result = self.common_invoke(task, &root, tx, base_cost)?;
        if result.code().is_abort() {
            return Ok(result);
        }

        root.refund_account(tx.sender, U256::from(result.energy_remaining()) * price);
        root.adjust_balance(
            root.miner_address(),
            credit(U256::from(result.energy_used()) * price),
        );
        if result.code().is_failed() {
            task.discard_current_side_effects()?;
        }
        Ok(result)
    }

    /// Runs a nested call spawned by the contract executing in `parent`.
    pub(crate) fn run_internal_transaction(
        &self,
        task: &mut TransactionTask<R::DApp>,
        parent: &Arc<TransactionalKernel>,
        tx: ResolvedTransaction,
    ) -> Result<TransactionResult, EngineError> {
        self.fault.check()?;
        if task.side_effects().is_empty() {
            return Err(EngineError::Invariant(
                "internal transaction started without an external entry",
            ));
        }
        if !self.monitor.acquire(tx.destination, &task.identity())
            || !self.may_touch(&**parent, &tx.destination, task.index())
        {
            return Ok(TransactionResult::aborted(tx.energy_limit));
        }

        task.push_internal_side_effects(tx.to_internal_record());
        let result = self.common_invoke(task, parent, &tx, 0)?;
        if !result.code().is_success() {
            task.discard_current_side_effects()?;
        }
        task.pop_internal_side_effects()?;
        Ok(result)
    }

    /// Shared by external and internal transactions: value transfer, nonce
    /// bump and dispatch, all in a child of `parent` that is committed only
    /// on success.
    fn common_invoke(
        &self,
        task: &mut TransactionTask<R::DApp>,
        parent: &Arc<TransactionalKernel>,
        tx: &ResolvedTransaction,
        base_cost: u64,
    ) -> Result<TransactionResult, EngineError> {
        // Nonce bumps go to the task's root layer so that they survive a
        // failure anywhere up the call chain.
        let root = task.kernel().clone();
        let mut result = TransactionResult::new(tx.energy_limit, base_cost);
        if base_cost > tx.energy_limit {
            result.set_code(ResultCode::FailedOutOfEnergy);
            result.use_all_energy();
            root.increment_nonce(tx.sender);
            return Ok(result);
        }

        let child = parent.child();
        if !child.balance_is_at_least(&tx.sender, tx.value) {
            result.set_code(ResultCode::FailedRejected);
            return Ok(result);
        }
        child.adjust_balance(tx.sender, debit(tx.value));
        child.adjust_balance(tx.destination, credit(tx.value));
        root.increment_nonce(tx.sender);

        if tx.is_create {
            self.run_create(task, &child, tx, &mut result)?;
        } else {
            self.run_call(task, &child, tx, &mut result)?;
        }

        match result.code() {
            ResultCode::Success if !child.is_clean() => child.commit(),
            ResultCode::FailedUnexpected => {
                error!(destination = %tx.destination, "Runtime reported an unexpected failure");
            }
            _ => {}
        }
        Ok(result)
    }

    fn run_create(
        &self,
        task: &mut TransactionTask<R::DApp>,
        child: &Arc<TransactionalKernel>,
        tx: &ResolvedTransaction,
        result: &mut TransactionResult,
    ) -> Result<(), EngineError> {
        child.create_account(tx.destination);
        let budget = result.energy_remaining();
        let outcome = {
            let mut invocation = Invocation::new(self, task, child.clone(), tx.clone(), budget);
            self.runtime.deploy(&mut invocation, &tx.data)?
        };
        apply_energy(result, outcome.status, outcome.energy_used);
        self.log_contract_message(tx, outcome.status, outcome.message.as_deref());
        if outcome.status.is_success() {
            child.put_code(tx.destination, outcome.code);
            result.set_return_data(Bytes::copy_from_slice(tx.destination.as_slice()));
        }
        Ok(())
    }

    fn run_call(
        &self,
        task: &mut TransactionTask<R::DApp>,
        child: &Arc<TransactionalKernel>,
        tx: &ResolvedTransaction,
        result: &mut TransactionResult,
    ) -> Result<(), EngineError> {
        let Some(code) = child.code(&tx.destination) else {
            // Plain value transfer. Any cached instance is stale.
            self.hot_cache.checkout(&tx.destination);
            return Ok(());
        };

        let (dapp, reentrant, loaded_block) =
            if let Some(dapp) = task.reentrant_stack().try_share_state(&tx.destination) {
                trace!(
                    contract = %tx.destination,
                    frames = task.reentrant_stack().len(),
                    "Resuming reentrant instance"
                );
                (dapp, true, 0)
            } else if let Some(cached) = self.hot_cache.checkout(&tx.destination) {
                (cached.dapp, false, cached.loaded_block)
            } else {
                match self
                    .runtime
                    .load(&code, self.config.preserve_debuggability)?
                {
                    Some(dapp) => (Arc::new(dapp), false, child.block_number()),
                    None => {
                        result.set_code(ResultCode::FailedInvalid);
                        result.use_all_energy();
                        self.log_contract_message(
                            tx,
                            ResultCode::FailedInvalid,
                            Some("code could not be loaded"),
                        );
                        return Ok(());
                    }
                }
            };

        task.reentrant_stack_mut().push(tx.destination, dapp.clone());
        let budget = result.energy_remaining();
        let outcome = {
            let mut invocation = Invocation::new(self, task, child.clone(), tx.clone(), budget);
            self.runtime.call(&mut invocation, &dapp, reentrant)
        };
        task.reentrant_stack_mut().pop();
        let outcome = outcome?;

        apply_energy(result, outcome.status, outcome.energy_used);
        result.set_return_data(outcome.return_data);
        self.log_contract_message(tx, outcome.status, outcome.message.as_deref());

        if !reentrant && outcome.status.is_success() {
            self.runtime.clean_for_cache(&dapp);
            self.hot_cache.checkin(tx.destination, dapp, loaded_block);
        }
        Ok(())
    }

    /// Whether `index` may read or write `address` yet.
    ///
    /// The miner is never acquired: every task credits it through a balance
    /// delta applied at commit. A task that touches the miner directly must
    /// therefore wait until every lower-indexed task has committed.
    pub(crate) fn may_touch(
        &self,
        kernel: &dyn Kernel,
        address: &Address,
        index: TxnIndex,
    ) -> bool {
        *address != kernel.miner_address() || self.monitor.commit_cursor() == index
    }

    fn log_contract_message(
        &self,
        tx: &ResolvedTransaction,
        status: ResultCode,
        message: Option<&str>,
    ) {
        let Some(message) = message else {
            return;
        };
        if self.config.enable_verbose_contract_errors {
            warn!(contract = %tx.destination, code = %status, reason = message, "Contract failed");
        } else {
            debug!(contract = %tx.destination, code = %status, reason = message, "Contract failed");
        }
    }
}

/// Checks that need no account state.
fn static_rejection(kernel: &dyn Kernel, tx: &ResolvedTransaction) -> Option<ResultCode> {
    let valid_limit = if tx.is_create {
        kernel.is_valid_energy_limit_for_create(tx.energy_limit)
    } else {
        kernel.is_valid_energy_limit_for_non_create(tx.energy_limit)
    };
    if tx.energy_price == 0 || !valid_limit {
        Some(ResultCode::Rejected)
    } else {
        None
    }
}

fn apply_energy(result: &mut TransactionResult, status: ResultCode, energy_used: u64) {
    result.set_code(status);
    if status == ResultCode::FailedOutOfEnergy {
        result.use_all_energy();
    } else {
        result.charge_energy(energy_used);
    }
}
