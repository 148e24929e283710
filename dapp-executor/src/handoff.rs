//! Queue between the submitting thread and the executor threads.
//!
//! Submitted tasks wait in FIFO order, so a task is only ever picked up after
//! every lower-indexed task of its batch has been picked up. Each submitted
//! task gets a [`ResultFuture`] that resolves once an executor thread publishes
//! the task's terminal result, or fails if the engine faults or shuts down
//! first.

use crate::error::EngineError;
use crate::result::TransactionResult;
use crate::task::TransactionTask;
use crate::types::TxnIndex;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// The first unrecoverable error seen by any executor thread.
#[derive(Debug, Default)]
pub struct FaultLatch {
    fault: Mutex<Option<EngineError>>,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error` unless a fault was already recorded.
    pub fn record(&self, error: EngineError) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(error);
        }
    }

    pub fn get(&self) -> Option<EngineError> {
        self.fault.lock().clone()
    }

    pub fn check(&self) -> Result<(), EngineError> {
        match self.get() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct BoardState {
    /// Tickets whose future is still alive.
    live: HashSet<u64>,
    results: HashMap<u64, TransactionResult>,
    workers_exited: bool,
}

/// Terminal results waiting to be claimed by their futures.
#[derive(Debug)]
pub struct ResultBoard {
    state: Mutex<BoardState>,
    ready: Condvar,
    fault: Arc<FaultLatch>,
}

impl ResultBoard {
    fn new(fault: Arc<FaultLatch>) -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            ready: Condvar::new(),
            fault,
        }
    }

    fn register(&self, tickets: impl IntoIterator<Item = u64>) {
        self.state.lock().live.extend(tickets);
    }

    /// Stores `result` for its future. Results of dropped futures are discarded.
    fn publish(&self, ticket: u64, result: TransactionResult) {
        let mut state = self.state.lock();
        if state.live.contains(&ticket) {
            state.results.insert(ticket, result);
            self.ready.notify_all();
        }
    }

    #[cfg(test)]
    fn pending_results(&self) -> usize {
        self.state.lock().results.len()
    }

    fn wake_all(&self) {
        let _state = self.state.lock();
        self.ready.notify_all();
    }

    fn mark_workers_exited(&self) {
        self.state.lock().workers_exited = true;
        self.ready.notify_all();
    }
}

/// Handle to the eventual result of one submitted transaction.
#[derive(Debug)]
pub struct ResultFuture {
    board: Arc<ResultBoard>,
    ticket: u64,
    index: TxnIndex,
}

impl ResultFuture {
    /// Position of the transaction within its batch.
    pub fn index(&self) -> TxnIndex {
        self.index
    }

    /// Blocks until the result is available.
    ///
    /// Fails with the engine's fault if one was recorded, even when the
    /// result itself had already been published.
    pub fn get(self) -> Result<TransactionResult, EngineError> {
        let mut state = self.board.state.lock();
        loop {
            self.board.fault.check()?;
            if let Some(result) = state.results.remove(&self.ticket) {
                return Ok(result);
            }
            if state.workers_exited {
                return Err(EngineError::ShutDown);
            }
            self.board.ready.wait(&mut state);
        }
    }
}

impl Drop for ResultFuture {
    fn drop(&mut self) {
        let mut state = self.board.state.lock();
        state.live.remove(&self.ticket);
        state.results.remove(&self.ticket);
    }
}

struct QueueState<D> {
    incoming: VecDeque<TransactionTask<D>>,
    /// Tasks submitted whose result has not been published yet.
    in_flight: usize,
    next_ticket: u64,
    shutdown_requested: bool,
}

/// Hands tasks to executor threads and results back to callers.
pub struct HandoffMonitor<D> {
    queue: Mutex<QueueState<D>>,
    available: Condvar,
    board: Arc<ResultBoard>,
    fault: Arc<FaultLatch>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Send + Sync + 'static> HandoffMonitor<D> {
    pub fn new(fault: Arc<FaultLatch>) -> Self {
        Self {
            queue: Mutex::new(QueueState {
                incoming: VecDeque::new(),
                in_flight: 0,
                next_ticket: 0,
                shutdown_requested: false,
            }),
            available: Condvar::new(),
            board: Arc::new(ResultBoard::new(fault.clone())),
            fault,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `count` named executor threads, each running `body(worker_id)`.
    pub fn start_executor_threads<F>(&self, count: usize, body: Arc<F>) -> Result<(), EngineError>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let mut workers = self.workers.lock();
        for worker_id in 0..count {
            let body = body.clone();
            let handle = thread::Builder::new()
                .name(format!("executor-{worker_id}"))
                .spawn(move || body(worker_id))
                .map_err(|e| EngineError::Spawn(e.to_string()))?;
            workers.push(handle);
        }
        debug!(count, "Started executor threads");
        Ok(())
    }

    /// Enqueues `tasks` in order and returns one future per task.
    pub fn send_transactions_asynchronously(
        &self,
        tasks: Vec<TransactionTask<D>>,
    ) -> Vec<ResultFuture> {
        let mut queue = self.queue.lock();
        let mut futures = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.ticket = queue.next_ticket;
            queue.next_ticket += 1;
            futures.push(ResultFuture {
                board: self.board.clone(),
                ticket: task.ticket,
                index: task.index(),
            });
            queue.incoming.push_back(task);
            queue.in_flight += 1;
        }
        self.board.register(futures.iter().map(|future| future.ticket));
        self.available.notify_all();
        futures
    }

    /// Publishes `previous` (if any) and blocks for the next task.
    ///
    /// Returns `None` once shutdown was requested or a fault was recorded.
    pub fn blocking_poll_for_transaction(
        &self,
        previous: Option<(TransactionTask<D>, TransactionResult)>,
    ) -> Option<TransactionTask<D>> {
        let mut queue = self.queue.lock();
        if let Some((task, result)) = previous {
            // Decremented under the queue lock before the result becomes
            // visible, so a caller holding every result sees an idle queue.
            queue.in_flight -= 1;
            self.board.publish(task.ticket, result);
        }
        loop {
            if queue.shutdown_requested || self.fault.get().is_some() {
                return None;
            }
            if let Some(task) = queue.incoming.pop_front() {
                return Some(task);
            }
            self.available.wait(&mut queue);
        }
    }

    /// Records a fatal fault and wakes every thread blocked on the handoff.
    pub fn set_background_fault(&self, error: EngineError) {
        self.fault.record(error);
        {
            let _queue = self.queue.lock();
            self.available.notify_all();
        }
        self.board.wake_all();
    }

    /// Whether every submitted task has a published result.
    pub fn is_idle(&self) -> bool {
        self.queue.lock().in_flight == 0
    }

    /// Stops the executor threads and waits for them to exit.
    ///
    /// Tasks still queued are dropped; their futures fail with
    /// [`EngineError::ShutDown`]. Returns the recorded fault, if any.
    pub fn stop_and_wait_for_shutdown(&self) -> Result<(), EngineError> {
        {
            let mut queue = self.queue.lock();
            queue.shutdown_requested = true;
            queue.incoming.clear();
            self.available.notify_all();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                self.fault.record(EngineError::WorkerPanicked(
                    "executor thread did not exit cleanly".into(),
                ));
            }
        }
        self.board.mark_workers_exited();
        self.fault.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;
    use crate::result::ResultCode;
    use crate::types::{ResolvedTransaction, Transaction};
    use alloy_primitives::{Address, Bytes, U256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tasks(count: usize) -> Vec<TransactionTask<()>> {
        let base = Arc::new(MemoryKernel::default());
        (0..count)
            .map(|index| {
                let tx = Transaction::call(
                    Address::with_last_byte(1),
                    Address::with_last_byte(2),
                    index as u64,
                    U256::ZERO,
                    Bytes::new(),
                    21_000,
                    1,
                );
                let resolved = ResolvedTransaction::resolve(&tx, |_| Address::ZERO);
                TransactionTask::new(base.clone(), resolved, index)
            })
            .collect()
    }

    fn echo_worker(handoff: Arc<HandoffMonitor<()>>, seen: Arc<AtomicUsize>) -> impl Fn(usize) {
        move |_| {
            let mut previous = None;
            while let Some(task) = handoff.blocking_poll_for_transaction(previous.take()) {
                seen.fetch_add(1, Ordering::SeqCst);
                let result = TransactionResult::new(task.transaction().energy_limit, 21_000);
                previous = Some((task, result));
            }
        }
    }

    #[test]
    fn test_results_reach_their_futures() {
        let handoff = Arc::new(HandoffMonitor::new(Arc::new(FaultLatch::new())));
        let seen = Arc::new(AtomicUsize::new(0));
        handoff
            .start_executor_threads(2, Arc::new(echo_worker(handoff.clone(), seen.clone())))
            .unwrap();

        let futures = handoff.send_transactions_asynchronously(tasks(5));
        for (expected, future) in futures.into_iter().enumerate() {
            assert_eq!(future.index(), expected);
            let result = future.get().unwrap();
            assert_eq!(result.code(), ResultCode::Success);
            assert_eq!(result.energy_used(), 21_000);
        }

        assert!(handoff.is_idle());
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        handoff.stop_and_wait_for_shutdown().unwrap();
    }

    #[test]
    fn test_fault_fails_pending_futures() {
        let handoff: Arc<HandoffMonitor<()>> =
            Arc::new(HandoffMonitor::new(Arc::new(FaultLatch::new())));
        let futures = handoff.send_transactions_asynchronously(tasks(1));

        handoff.set_background_fault(EngineError::fatal("kernel unavailable"));

        let error = futures.into_iter().next().unwrap().get().unwrap_err();
        assert_eq!(error, EngineError::fatal("kernel unavailable"));
        assert!(handoff.blocking_poll_for_transaction(None).is_none());
        assert!(handoff.stop_and_wait_for_shutdown().is_err());
    }

    #[test]
    fn test_shutdown_fails_unclaimed_futures() {
        let handoff: Arc<HandoffMonitor<()>> =
            Arc::new(HandoffMonitor::new(Arc::new(FaultLatch::new())));
        let futures = handoff.send_transactions_asynchronously(tasks(2));

        handoff.stop_and_wait_for_shutdown().unwrap();

        for future in futures {
            assert_eq!(future.get().unwrap_err(), EngineError::ShutDown);
        }
    }

    #[test]
    fn test_results_of_dropped_futures_are_discarded() {
        let handoff = Arc::new(HandoffMonitor::new(Arc::new(FaultLatch::new())));
        let seen = Arc::new(AtomicUsize::new(0));

        let mut futures = handoff.send_transactions_asynchronously(tasks(3));
        let last = futures.pop().unwrap();
        drop(futures);
        handoff
            .start_executor_threads(1, Arc::new(echo_worker(handoff.clone(), seen.clone())))
            .unwrap();

        assert_eq!(last.get().unwrap().code(), ResultCode::Success);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(handoff.board.pending_results(), 0);
        handoff.stop_and_wait_for_shutdown().unwrap();
    }

    #[test]
    fn test_first_fault_wins() {
        let latch = FaultLatch::new();
        latch.record(EngineError::fatal("first"));
        latch.record(EngineError::fatal("second"));
        assert_eq!(latch.get(), Some(EngineError::fatal("first")));
    }
}
