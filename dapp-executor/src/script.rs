//! A tiny bytecode runtime for exercising the engine.
//!
//! Contract code is a flat list of ops. Every op costs [`OP_COST`] energy and
//! the runtime checks for abort requests between ops, so scripts can model
//! storage writes, logs, nested and reentrant calls, and every failure mode
//! the engine distinguishes.
//!
//! | tag    | op              | operands                                  |
//! |--------|-----------------|-------------------------------------------|
//! | `0x01` | burn            | `u64` extra energy                        |
//! | `0x02` | increment       | 32-byte storage key                       |
//! | `0x03` | log             | 32-byte topic (payload is the call data)  |
//! | `0x04` | call            | 20-byte address, `u64` value, `u64` energy|
//! | `0x05` | revert          |                                           |
//! | `0x06` | fail            |                                           |
//! | `0x07` | fatal           |                                           |
//! | `0x08` | return if depth | `u8` depth                                |
//! | `0x09` | create          | `u64` energy                              |
//!
//! Integers are big-endian.

use crate::error::EngineError;
use crate::kernel::Kernel;
use crate::result::ResultCode;
use crate::runtime::{CallOutcome, ContractRuntime, DeployOutcome, InternalCall, Invocation};
use alloy_primitives::{Address, Bytes, B256, U256};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Energy charged per executed op.
pub const OP_COST: u64 = 100;
/// Energy charged for a deployment.
pub const DEPLOY_COST: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Burn(u64),
    Increment(B256),
    Log(B256),
    Call { to: Address, value: u64, energy: u64 },
    Revert,
    Fail,
    Fatal,
    ReturnIfDepth(u8),
    Create { energy: u64 },
}

/// A parsed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDApp {
    ops: Vec<Op>,
}

impl ScriptDApp {
    /// Parses `code`, returning `None` on an unknown tag or truncated operand.
    pub fn parse(code: &[u8]) -> Option<Self> {
        let mut reader = Reader { code, position: 0 };
        let mut ops = Vec::new();
        while let Some(tag) = reader.byte() {
            let op = match tag {
                0x01 => Op::Burn(reader.u64()?),
                0x02 => Op::Increment(reader.word()?),
                0x03 => Op::Log(reader.word()?),
                0x04 => Op::Call {
                    to: reader.address()?,
                    value: reader.u64()?,
                    energy: reader.u64()?,
                },
                0x05 => Op::Revert,
                0x06 => Op::Fail,
                0x07 => Op::Fatal,
                0x08 => Op::ReturnIfDepth(reader.byte()?),
                0x09 => Op::Create {
                    energy: reader.u64()?,
                },
                _ => return None,
            };
            ops.push(op);
        }
        Some(Self { ops })
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }
}

struct Reader<'a> {
    code: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(len)?;
        let slice = self.code.get(self.position..end)?;
        self.position = end;
        Some(slice)
    }

    fn byte(&mut self) -> Option<u8> {
        self.take(1).map(|bytes| bytes[0])
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    fn word(&mut self) -> Option<B256> {
        self.take(32).map(B256::from_slice)
    }

    fn address(&mut self) -> Option<Address> {
        self.take(20).map(Address::from_slice)
    }
}

/// Encodes scripts op by op.
#[derive(Debug, Clone, Default)]
pub struct ScriptBuilder {
    code: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn burn(mut self, energy: u64) -> Self {
        self.code.push(0x01);
        self.code.extend_from_slice(&energy.to_be_bytes());
        self
    }

    pub fn increment(mut self, key: B256) -> Self {
        self.code.push(0x02);
        self.code.extend_from_slice(key.as_slice());
        self
    }

    pub fn log(mut self, topic: B256) -> Self {
        self.code.push(0x03);
        self.code.extend_from_slice(topic.as_slice());
        self
    }

    pub fn call(mut self, to: Address, value: u64, energy: u64) -> Self {
        self.code.push(0x04);
        self.code.extend_from_slice(to.as_slice());
        self.code.extend_from_slice(&value.to_be_bytes());
        self.code.extend_from_slice(&energy.to_be_bytes());
        self
    }

    pub fn revert(mut self) -> Self {
        self.code.push(0x05);
        self
    }

    pub fn fail(mut self) -> Self {
        self.code.push(0x06);
        self
    }

    pub fn fatal(mut self) -> Self {
        self.code.push(0x07);
        self
    }

    pub fn return_if_depth(mut self, depth: u8) -> Self {
        self.code.push(0x08);
        self.code.push(depth);
        self
    }

    pub fn create(mut self, energy: u64) -> Self {
        self.code.push(0x09);
        self.code.extend_from_slice(&energy.to_be_bytes());
        self
    }

    pub fn build(self) -> Bytes {
        Bytes::from(self.code)
    }
}

/// Reads a counter written by [`Op::Increment`].
pub fn read_counter(kernel: &dyn Kernel, address: &Address, key: &B256) -> u64 {
    kernel
        .storage(address, key)
        .and_then(|value| <[u8; 8]>::try_from(&value[..]).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

/// [`ContractRuntime`] that interprets [`ScriptDApp`]s.
#[derive(Debug, Default)]
pub struct ScriptRuntime {
    loads: AtomicUsize,
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times contract code has been loaded (cache misses).
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ContractRuntime for ScriptRuntime {
    type DApp = ScriptDApp;

    fn deploy(
        &self,
        invocation: &mut Invocation<'_, Self>,
        code: &Bytes,
    ) -> Result<DeployOutcome, EngineError> {
        let budget = invocation.energy_budget();
        let outcome = if DEPLOY_COST > budget {
            DeployOutcome {
                status: ResultCode::FailedOutOfEnergy,
                energy_used: budget,
                code: Bytes::new(),
                message: Some("out of energy during deployment".into()),
            }
        } else if ScriptDApp::parse(code).is_none() {
            DeployOutcome {
                status: ResultCode::FailedInvalid,
                energy_used: budget,
                code: Bytes::new(),
                message: Some("malformed script".into()),
            }
        } else {
            DeployOutcome {
                status: ResultCode::Success,
                energy_used: DEPLOY_COST,
                code: code.clone(),
                message: None,
            }
        };
        Ok(outcome)
    }

    fn load(
        &self,
        code: &Bytes,
        _preserve_debuggability: bool,
    ) -> Result<Option<ScriptDApp>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptDApp::parse(code))
    }

    fn call(
        &self,
        invocation: &mut Invocation<'_, Self>,
        dapp: &ScriptDApp,
        _reentrant: bool,
    ) -> Result<CallOutcome, EngineError> {
        let budget = invocation.energy_budget();
        let mut used = 0u64;
        for op in dapp.ops() {
            if invocation.is_abort_requested() {
                return Ok(CallOutcome::failure(
                    ResultCode::FailedAbort,
                    used,
                    "abort requested",
                ));
            }
            used = used.saturating_add(OP_COST);
            if let Op::Burn(extra) = op {
                used = used.saturating_add(*extra);
            }
            if used > budget {
                return Ok(out_of_energy(budget));
            }

            match *op {
                Op::Burn(_) => {}
                Op::Increment(key) => {
                    let address = invocation.address();
                    let kernel = invocation.kernel().clone();
                    let next = read_counter(&*kernel, &address, &key) + 1;
                    kernel.put_storage(address, key, Bytes::copy_from_slice(&next.to_be_bytes()));
                }
                Op::Log(topic) => {
                    let data = invocation.transaction().data.clone();
                    invocation.emit_log(vec![topic], data)?;
                }
                Op::Call { to, value, energy } => {
                    let result = invocation.call(InternalCall {
                        destination: Some(to),
                        value: U256::from(value),
                        data: Bytes::new(),
                        energy_limit: energy.min(budget - used),
                    })?;
                    if result.code().is_abort() {
                        return Ok(CallOutcome::failure(
                            ResultCode::FailedAbort,
                            used,
                            "nested call aborted",
                        ));
                    }
                    used = used.saturating_add(result.energy_used());
                    if used > budget {
                        return Ok(out_of_energy(budget));
                    }
                }
                Op::Create { energy } => {
                    let result = invocation.call(InternalCall {
                        destination: None,
                        value: U256::ZERO,
                        data: Bytes::new(),
                        energy_limit: energy.min(budget - used),
                    })?;
                    if result.code().is_abort() {
                        return Ok(CallOutcome::failure(
                            ResultCode::FailedAbort,
                            used,
                            "nested create aborted",
                        ));
                    }
                    used = used.saturating_add(result.energy_used()).min(budget);
                }
                Op::Revert => {
                    return Ok(CallOutcome::failure(ResultCode::FailedRevert, used, "reverted"));
                }
                Op::Fail => {
                    return Ok(CallOutcome::failure(
                        ResultCode::FailedException,
                        used,
                        "uncaught exception",
                    ));
                }
                Op::Fatal => {
                    return Err(EngineError::fatal(format!(
                        "script at {} requested a fatal fault",
                        invocation.address()
                    )));
                }
                Op::ReturnIfDepth(depth) => {
                    if invocation.depth() >= depth as usize {
                        break;
                    }
                }
            }
        }
        Ok(CallOutcome::success(used, Bytes::new()))
    }
}

fn out_of_energy(budget: u64) -> CallOutcome {
    CallOutcome::failure(ResultCode::FailedOutOfEnergy, budget, "out of energy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_output_parses_back() {
        let to = Address::with_last_byte(7);
        let code = ScriptBuilder::new()
            .burn(5)
            .increment(B256::ZERO)
            .call(to, 1, 30_000)
            .return_if_depth(2)
            .revert()
            .build();

        let dapp = ScriptDApp::parse(&code).unwrap();
        assert_eq!(
            dapp.ops(),
            &[
                Op::Burn(5),
                Op::Increment(B256::ZERO),
                Op::Call { to, value: 1, energy: 30_000 },
                Op::ReturnIfDepth(2),
                Op::Revert,
            ]
        );
    }

    #[test]
    fn test_malformed_scripts_are_rejected() {
        assert!(ScriptDApp::parse(&[0xff]).is_none());
        assert!(ScriptDApp::parse(&[0x01, 0, 0]).is_none());
        assert_eq!(ScriptDApp::parse(&[]).map(|dapp| dapp.ops().len()), Some(0));
    }
}
