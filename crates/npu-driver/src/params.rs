// SPDX-License-Identifier: AGPL-3.0-only

//! Parameter channel.

use crate::dispatcher::Dispatcher;
use crate::error::{NpuError, Result};
use crate::protocol::{NetworkCommand, SessionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Run a firmware self-test case; value is the case number
pub const PARAM_FW_TC_EXECUTE: u32 = 0x0000_0100;
/// Requested NPU clock floor
pub const PARAM_QOS_NPU: u32 = 0x0000_0200;
/// Requested memory-interface clock floor
pub const PARAM_QOS_MIF: u32 = 0x0000_0201;
/// Requested interconnect clock floor
pub const PARAM_QOS_INT: u32 = 0x0000_0202;

/// One `{target, value}` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    /// Parameter target
    pub target: u32,
    /// Value
    pub value: u32,
}

impl Param {
    /// Create a pair
    pub const fn new(target: u32, value: u32) -> Self {
        Self { target, value }
    }
}

/// Whether a handler claimed a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOutcome {
    /// Claimed and applied
    Handled,
    /// Not this handler's target
    NotMine,
}

/// Link in the handler chain
pub trait ParamHandler: Send + Sync + fmt::Debug {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Try to apply `param` for `session`
    ///
    /// # Errors
    ///
    /// Any error means the pair was claimed but could not be applied.
    fn handle(&self, session: SessionId, param: Param) -> Result<ParamOutcome>;
}

/// Ordered handler chain
#[derive(Debug, Default)]
pub struct ParamChain {
    handlers: Vec<Box<dyn ParamHandler>>,
}

impl ParamChain {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler
    pub fn push(&mut self, handler: Box<dyn ParamHandler>) {
        self.handlers.push(handler);
    }

    /// Offer every pair to the chain
    ///
    /// # Errors
    ///
    /// [`NpuError::ParamsRejected`] listing each target that failed or had no
    /// handler.
    pub fn dispatch(&self, session: SessionId, params: &[Param]) -> Result<()> {
        let mut rejected = Vec::new();
        for param in params {
            if !self.offer(session, *param) {
                rejected.push(param.target);
            }
        }
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(NpuError::ParamsRejected { targets: rejected })
        }
    }

    fn offer(&self, session: SessionId, param: Param) -> bool {
        for handler in &self.handlers {
            match handler.handle(session, param) {
                Ok(ParamOutcome::Handled) => {
                    tracing::debug!(session = %session, "{} handled target {:#x}", handler.name(), param.target);
                    return true;
                }
                Ok(ParamOutcome::NotMine) => {}
                Err(e) => {
                    tracing::warn!(session = %session, "{} failed target {:#x}: {e}", handler.name(), param.target);
                    return false;
                }
            }
        }
        tracing::warn!(session = %session, "No handler for target {:#x}", param.target);
        false
    }
}

/// Firmware self-test handler
#[derive(Debug)]
pub struct FirmwareTestHandler {
    dispatcher: Arc<Dispatcher>,
}

impl FirmwareTestHandler {
    /// Handler issuing FW_TC_EXECUTE through `dispatcher`
    pub const fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl ParamHandler for FirmwareTestHandler {
    fn name(&self) -> &'static str {
        "fw-test"
    }

    fn handle(&self, _session: SessionId, param: Param) -> Result<ParamOutcome> {
        if param.target != PARAM_FW_TC_EXECUTE {
            return Ok(ParamOutcome::NotMine);
        }
        self.dispatcher
            .call(None, NetworkCommand::FwTcExecute, None, param.value)?;
        Ok(ParamOutcome::Handled)
    }
}

/// Quality-of-service domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosKind {
    /// NPU clock
    Npu,
    /// Memory interface clock
    Mif,
    /// Interconnect clock
    Int,
}

impl QosKind {
    const fn from_target(target: u32) -> Option<Self> {
        match target {
            PARAM_QOS_NPU => Some(Self::Npu),
            PARAM_QOS_MIF => Some(Self::Mif),
            PARAM_QOS_INT => Some(Self::Int),
            _ => None,
        }
    }
}

/// Per-session QoS requests, aggregated as the maximum
#[derive(Debug, Default)]
pub struct QosTable {
    requests: Mutex<HashMap<(SessionId, QosKind), u32>>,
}

impl QosTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` for `session`
    pub fn request(&self, session: SessionId, kind: QosKind, value: u32) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((session, kind), value);
    }

    /// Drop every request of `session`
    pub fn clear(&self, session: SessionId) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(owner, _), _| *owner != session);
    }

    /// Effective floor for `kind`; zero when nobody asks
    pub fn current(&self, kind: QosKind) -> u32 {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, value)| *value)
            .max()
            .unwrap_or(0)
    }
}

/// QoS handler
#[derive(Debug)]
pub struct QosHandler {
    table: Arc<QosTable>,
}

impl QosHandler {
    /// Handler recording into `table`
    pub const fn new(table: Arc<QosTable>) -> Self {
        Self { table }
    }
}

impl ParamHandler for QosHandler {
    fn name(&self) -> &'static str {
        "qos"
    }

    fn handle(&self, session: SessionId, param: Param) -> Result<ParamOutcome> {
        let Some(kind) = QosKind::from_target(param.target) else {
            return Ok(ParamOutcome::NotMine);
        };
        self.table.request(session, kind, param.value);
        tracing::debug!(session = %session, "QoS {kind:?} request {} -> effective {}", param.value, self.table.current(kind));
        Ok(ParamOutcome::Handled)
    }
}
