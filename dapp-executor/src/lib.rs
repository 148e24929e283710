//! Concurrent executor for contract transactions.
//!
//! A batch of transactions is executed by a pool of threads, speculatively and
//! in parallel, while producing exactly the results and final state of running
//! the batch one transaction at a time in submission order.
//!
//! # Core Components
//!
//! - **Engine**: owns the executor threads and turns batches into futures
//! - **AddressResourceMonitor**: per-address ownership plus in-order commits
//! - **TransactionalKernel**: layered, discardable view of world state
//! - **SideEffectsStack**: logs and internal-call records per call level
//! - **DAppCache**: loaded contract instances reused across transactions
//!
//! # Algorithm Overview
//!
//! 1. Every task runs against its own kernel layer over the batch's base state
//! 2. Before touching an account a task acquires its address
//! 3. A lower-indexed task that needs an address held by a higher one aborts it
//! 4. Tasks commit in submission order; an early or aborted task is re-run
//! 5. The committed state equals a serial run of the batch
//!
//! # Example
//!
//! ```rust,ignore
//! use dapp_executor::{Engine, EngineConfig, MemoryKernel, ScriptRuntime, Transaction};
//! use alloy_primitives::{Address, Bytes, U256};
//! use std::sync::Arc;
//!
//! let engine = Engine::start(EngineConfig::with_threads(4), ScriptRuntime::new())?;
//! let kernel = Arc::new(MemoryKernel::default().with_account(sender, U256::from(10u64.pow(9))));
//! let tx = Transaction::call(sender, recipient, 0, U256::from(5), Bytes::new(), 21_000, 1);
//!
//! for future in engine.run(kernel, vec![tx])? {
//!     println!("{}", future.get()?);
//! }
//! engine.shutdown()?;
//! ```

pub mod billing;
pub mod cache;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod kernel;
pub mod monitor;
pub mod result;
pub mod runtime;
pub mod script;
pub mod side_effects;
pub mod task;
pub mod types;

pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use handoff::ResultFuture;
pub use kernel::{BlockContext, Kernel, MemoryKernel, TransactionalKernel};
pub use result::{ResultCode, TransactionResult};
pub use runtime::{CallOutcome, ContractRuntime, DeployOutcome, InternalCall, Invocation};
pub use script::{ScriptBuilder, ScriptRuntime};
pub use side_effects::SideEffects;
pub use types::{InternalTransaction, Log, Transaction, TxKind, TxnIndex};
