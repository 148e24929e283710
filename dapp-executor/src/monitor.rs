//! Per-address ownership and in-order commit arbitration.
//!
//! Tasks execute speculatively and in parallel. Before touching an account a
//! task must [`acquire`](AddressResourceMonitor::acquire) its address; at most
//! one task holds an address at a time. The only serialization point is
//! [`commit_for_task`](AddressResourceMonitor::commit_for_task): a task may
//! commit only when every lower-indexed task of the batch has committed. A
//! task that arrives early is aborted and retried rather than blocked, which
//! avoids a lower task waiting on an address held by a higher task that is in
//! turn waiting for the lower task to commit.
//!
//! When a lower-indexed task finds one of its addresses held by a
//! higher-indexed task, it raises the holder's [`AbortSignal`]. The holder
//! notices at its next safe point (another `acquire`, a runtime check, or its
//! commit) and gives everything back.

use crate::error::EngineError;
use crate::kernel::TransactionalKernel;
use crate::types::TxnIndex;
use alloy_primitives::Address;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Cooperative abort request for one task.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// How the monitor identifies a task: its submission index and abort signal.
#[derive(Debug, Clone)]
pub struct TaskIdentity {
    pub index: TxnIndex,
    pub abort: AbortSignal,
}

impl TaskIdentity {
    pub fn new(index: TxnIndex, abort: AbortSignal) -> Self {
        Self { index, abort }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    owners: HashMap<Address, TaskIdentity>,
    /// Index of the next task allowed to commit.
    commit_cursor: TxnIndex,
    /// Set once the engine has failed; every waiter gives up.
    poisoned: bool,
}

/// Registry of address owners plus the batch commit cursor.
#[derive(Debug, Default)]
pub struct AddressResourceMonitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl AddressResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `task` holds `address`.
    ///
    /// Reentrant for the current holder. Returns `false` instead of blocking
    /// further if the task is asked to abort while waiting (or the monitor is
    /// poisoned); the caller must then unwind and treat the attempt as aborted.
    pub fn acquire(&self, address: Address, task: &TaskIdentity) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.poisoned || task.abort.is_raised() {
                return false;
            }
            match state.owners.get(&address) {
                None => {
                    state.owners.insert(address, task.clone());
                    return true;
                }
                Some(owner) if owner.index == task.index => return true,
                Some(owner) => {
                    if task.index < owner.index && !owner.abort.is_raised() {
                        trace!(
                            %address,
                            waiter = task.index,
                            holder = owner.index,
                            "Requesting abort of higher-indexed holder"
                        );
                        owner.abort.raise();
                        self.changed.notify_all();
                    }
                }
            }
            self.changed.wait(&mut state);
        }
    }

    /// Attempts to commit `task`'s kernel into its parent.
    ///
    /// Succeeds only if the task has not been asked to abort and every
    /// lower-indexed task has already committed. A rejected task advances the
    /// cursor without writing anything. Either way the task's addresses are
    /// released; on `false` the caller must retry the task from scratch.
    pub fn commit_for_task(
        &self,
        task: &TaskIdentity,
        kernel: &TransactionalKernel,
        is_rejected: bool,
    ) -> bool {
        let mut state = self.state.lock();
        let in_order =
            !state.poisoned && !task.abort.is_raised() && state.commit_cursor == task.index;
        if in_order {
            if !is_rejected {
                kernel.commit();
            }
            state.commit_cursor += 1;
        }
        state.owners.retain(|_, owner| owner.index != task.index);
        self.changed.notify_all();
        in_order
    }

    /// Gives back every address held by `task` without committing.
    pub fn release(&self, task: &TaskIdentity) {
        let mut state = self.state.lock();
        state.owners.retain(|_, owner| owner.index != task.index);
        self.changed.notify_all();
    }

    /// Index of the next task allowed to commit.
    pub fn commit_cursor(&self) -> TxnIndex {
        self.state.lock().commit_cursor
    }

    /// Waits until the commit cursor moves past `observed`, or `timeout` elapses.
    pub fn wait_for_commit_progress(&self, observed: TxnIndex, timeout: Duration) {
        let mut state = self.state.lock();
        if state.commit_cursor == observed && !state.poisoned {
            let _ = self.changed.wait_for(&mut state, timeout);
        }
    }

    /// Number of addresses currently held.
    pub fn held_count(&self) -> usize {
        self.state.lock().owners.len()
    }

    /// Resets the registry for a new batch.
    pub fn clear(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.owners.is_empty() {
            return Err(EngineError::Invariant(
                "resource monitor cleared while addresses are still held",
            ));
        }
        state.commit_cursor = 0;
        Ok(())
    }

    /// Wakes every waiter and makes all further acquires and commits fail.
    pub fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        state.owners.clear();
        self.changed.notify_all();
    }
}
