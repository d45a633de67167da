// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for NPU session operations

use crate::frame::{BufState, Direction};
use crate::protocol::{NetworkCommand, ResultCode};
use crate::state::Stage;
use npu_ncp::NcpError;
use std::fmt;
use thiserror::Error;

/// Result type alias for NPU session operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Errors that can occur while driving an NPU session
#[derive(Debug, Error)]
pub enum NpuError {
    /// NCP blob is malformed or out of bounds
    #[error("NCP format error: {source}")]
    Format {
        /// Underlying parse error
        #[from]
        source: NcpError,
    },

    /// DMA allocation failed
    #[error("DMA allocation of {size} bytes failed: {reason}")]
    AllocFailed {
        /// Requested size in bytes
        size: usize,
        /// Reason for failure
        reason: String,
    },

    /// Mapping the caller's NCP handle failed
    #[error("NCP mapping failed: {reason}")]
    MapFailed {
        /// Reason for failure
        reason: String,
    },

    /// A device address does not fit a 32-bit table field
    #[error("device address {daddr:#x} does not fit a 32-bit table entry")]
    AddressOverflow {
        /// Offending device address
        daddr: u64,
    },

    /// Firmware answered a network command with a failure code
    #[error("{command} failed with result {code}")]
    Protocol {
        /// Command that failed
        command: NetworkCommand,
        /// Result code passed through from firmware
        code: ResultCode,
    },

    /// Operation invoked before its prerequisite stage
    #[error("{operation} requires stage {required:?}")]
    Ordering {
        /// Operation that was rejected
        operation: &'static str,
        /// Stage that must be reached first
        required: Stage,
    },

    /// Buffer slot is not in a state that allows the operation
    #[error("{operation} on {direction} slot {index} in state {state:?}")]
    BufferState {
        /// Operation that was rejected
        operation: &'static str,
        /// Buffer direction
        direction: Direction,
        /// Slot index
        index: usize,
        /// Current state of the slot
        state: BufState,
    },

    /// Caller passed an argument that cannot be honoured
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for rejection
        reason: String,
    },

    /// Device is in emergency mode; the graceful path is disabled
    #[error("NPU device is in emergency state")]
    Emergency,

    /// Blocking wait for a network command expired
    #[error("{command} timed out waiting for {phase} after {duration_ms}ms")]
    Timeout {
        /// Command being waited on
        command: NetworkCommand,
        /// Phase that expired
        phase: WaitPhase,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// No frame completed within the dequeue wait
    #[error("no {direction} frame completed within {duration_ms}ms")]
    DequeueTimeout {
        /// Direction being dequeued
        direction: Direction,
        /// Wait in milliseconds
        duration_ms: u64,
    },

    /// Request queue stayed full for every retry
    #[error("{queue} queue full after {attempts} attempts")]
    QueueFull {
        /// Queue name
        queue: &'static str,
        /// Push attempts made
        attempts: u32,
    },

    /// All session slots are in use
    #[error("session limit of {max} reached")]
    SessionLimit {
        /// Configured maximum
        max: usize,
    },

    /// One or more parameters were not handled
    #[error("parameters rejected for targets {targets:x?}")]
    ParamsRejected {
        /// Targets that failed or had no handler
        targets: Vec<u32>,
    },

    /// Protocol worker is not running
    #[error("protocol worker stopped")]
    WorkerStopped,

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

/// Phase of a blocking network-command wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// Waiting for the worker to pick the request up
    Accept,
    /// Waiting for the firmware result
    Complete,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "acceptance",
            Self::Complete => "completion",
        })
    }
}

/// Error taxonomy used for reporting and recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed NCP; fatal to the parse
    Format,
    /// Allocation or mapping failure; unwound through the undo chain
    Resource,
    /// Firmware-side failure passed through verbatim
    Protocol,
    /// Operation called out of order; no side effects
    Ordering,
    /// Device-level fatal condition
    Emergency,
    /// Caller misuse (bad argument, buffer state)
    Usage,
}

impl NpuError {
    /// Create an allocation failure
    pub fn alloc_failed(size: usize, reason: impl Into<String>) -> Self {
        Self::AllocFailed {
            size,
            reason: reason.into(),
        }
    }

    /// Create a mapping failure
    pub fn map_failed(reason: impl Into<String>) -> Self {
        Self::MapFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an ordering error
    pub const fn ordering(operation: &'static str, required: Stage) -> Self {
        Self::Ordering {
            operation,
            required,
        }
    }

    /// Classify into the error taxonomy
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Format { .. } => ErrorClass::Format,
            Self::AllocFailed { .. } | Self::MapFailed { .. } | Self::AddressOverflow { .. } | Self::Io { .. } => {
                ErrorClass::Resource
            }
            Self::Protocol { .. } | Self::QueueFull { .. } | Self::DequeueTimeout { .. } | Self::WorkerStopped => {
                ErrorClass::Protocol
            }
            Self::Ordering { .. } => ErrorClass::Ordering,
            Self::Emergency | Self::Timeout { .. } => ErrorClass::Emergency,
            Self::BufferState { .. }
            | Self::InvalidArgument { .. }
            | Self::SessionLimit { .. }
            | Self::ParamsRejected { .. } => ErrorClass::Usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_convert() {
        let err: NpuError = NcpError::build("truncated").into();
        assert_eq!(err.class(), ErrorClass::Format);
    }

    #[test]
    fn classes() {
        assert_eq!(NpuError::alloc_failed(64, "oom").class(), ErrorClass::Resource);
        assert_eq!(
            NpuError::ordering("queue", Stage::FormatOutSet).class(),
            ErrorClass::Ordering
        );
        assert_eq!(NpuError::Emergency.class(), ErrorClass::Emergency);
        assert_eq!(
            NpuError::Protocol {
                command: NetworkCommand::Load,
                code: ResultCode::from_raw(7)
            }
            .class(),
            ErrorClass::Protocol
        );
    }

    #[test]
    fn display_messages() {
        let err = NpuError::Timeout {
            command: NetworkCommand::StreamOn,
            phase: WaitPhase::Accept,
            duration_ms: 250,
        };
        assert_eq!(err.to_string(), "STREAMON timed out waiting for acceptance after 250ms");
    }
}
