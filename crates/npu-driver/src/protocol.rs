// SPDX-License-Identifier: AGPL-3.0-only

//! Request and response objects exchanged between sessions, the protocol
//! worker and firmware.
//!
//! ```text
//! Session ──NetworkRequest──▶ ring ──▶ worker ──NetworkMessage──▶ firmware
//!         ──FrameRequest────▶ ring ──▶ worker ──FrameMessage────▶ firmware
//!                                        ◀──FirmwareResponse (by request id)
//! Session ◀─Completion (network) / FrameDone over mpsc (frames)
//! ```

use crate::dispatcher::Completion;
use crate::frame::BufferSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Unique id of an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result code carried by every request
///
/// Firmware codes pass through untouched; driver codes carry
/// [`ResultCode::DRIVER`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(u32);

impl ResultCode {
    /// Origin flag for driver-generated codes
    pub const DRIVER: u32 = 0x0100_0000;
    /// Severity flag for codes that trigger emergency handling
    pub const CRITICAL: u32 = 0x8000_0000;

    /// Success
    pub const OK: Self = Self(0);
    /// Request still in flight
    pub const PENDING: Self = Self(Self::DRIVER | 0x00FF_FFFF);
    /// No session reference for the request
    pub const INVALID_SESSION: Self = Self(Self::DRIVER | 0x05);
    /// Command not allowed in the session's current state
    pub const INVALID_STATE: Self = Self(Self::DRIVER | 0x06);
    /// Frame cancelled by stream-off
    pub const FRAME_CANCELED: Self = Self(Self::DRIVER | 0x0A);
    /// Completed locally because the device is in emergency mode
    pub const EMERGENCY: Self = Self(Self::DRIVER | 0x30);
    /// Request never left the REQUESTED state in time
    pub const SCHED_TIMEOUT: Self = Self(Self::CRITICAL | Self::DRIVER | 0x21);
    /// Frame never answered by firmware
    pub const NPU_TIMEOUT: Self = Self(Self::CRITICAL | Self::DRIVER | 0x22);
    /// Network command never answered by firmware
    pub const QUEUE_TIMEOUT: Self = Self(Self::CRITICAL | Self::DRIVER | 0x23);

    /// Wrap a raw code
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether the request succeeded
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Whether the request is still in flight
    pub const fn is_pending(self) -> bool {
        self.0 == Self::PENDING.0
    }

    /// Whether the code was generated by the driver rather than firmware
    pub const fn is_driver(self) -> bool {
        self.0 & Self::DRIVER != 0
    }

    /// Whether the code marks a critical failure
    pub const fn is_critical(self) -> bool {
        self.0 & Self::CRITICAL != 0
    }

    /// Whether a request finishing with this code must be parked as stuck
    pub const fn is_stuck(self) -> bool {
        self.0 == Self::NPU_TIMEOUT.0 || self.0 == Self::QUEUE_TIMEOUT.0
    }

    const fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "OK",
            Self::PENDING => "PENDING",
            Self::INVALID_SESSION => "INVALID_SESSION",
            Self::INVALID_STATE => "INVALID_STATE",
            Self::FRAME_CANCELED => "FRAME_CANCELED",
            Self::EMERGENCY => "EMERGENCY",
            Self::SCHED_TIMEOUT => "SCHED_TIMEOUT",
            Self::NPU_TIMEOUT => "NPU_TIMEOUT",
            Self::QUEUE_TIMEOUT => "QUEUE_TIMEOUT",
            _ => return None,
        })
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{:#010x} ({name})", self.0),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Network-level command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkCommand {
    /// Load the mapped NCP into firmware
    Load,
    /// Start accepting frames
    StreamOn,
    /// Drain and stop frames
    StreamOff,
    /// Release the network in firmware
    Unload,
    /// Drop every pending callback and the firmware reference of a session
    ClearCb,
    /// Power the NPU down; requires no live session
    PowerDown,
    /// Run a firmware self-test case
    FwTcExecute,
}

impl NetworkCommand {
    /// Whether the command is issued on behalf of a session
    pub const fn is_session_bound(self) -> bool {
        !matches!(self, Self::PowerDown | Self::FwTcExecute)
    }

    /// Whether the caller waits for the result
    ///
    /// CLEAR_CB is posted during emergency teardown and never notifies.
    pub const fn notifies(self) -> bool {
        !matches!(self, Self::ClearCb)
    }
}

impl fmt::Display for NetworkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "LOAD",
            Self::StreamOn => "STREAMON",
            Self::StreamOff => "STREAMOFF",
            Self::Unload => "UNLOAD",
            Self::ClearCb => "CLEAR_CB",
            Self::PowerDown => "POWER_DOWN",
            Self::FwTcExecute => "FW_TC_EXECUTE",
        })
    }
}

/// Location of a mapped NCP as firmware sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcpRef {
    /// Device address of the blob
    pub daddr: u64,
    /// Size of the blob in bytes
    pub size: usize,
}

/// Network command on its way to the worker
#[derive(Debug)]
pub struct NetworkRequest {
    /// Issuing session, `None` for device-level commands
    pub session_id: Option<SessionId>,
    /// Correlation id
    pub request_id: u32,
    /// Command
    pub command: NetworkCommand,
    /// Mapped NCP for LOAD
    pub ncp: Option<NcpRef>,
    /// Command argument (self-test case for FW_TC_EXECUTE)
    pub payload: u32,
    /// Result slot the caller is parked on, if it waits
    pub notify: Option<Arc<Completion>>,
    /// Result so far
    pub result: ResultCode,
}

/// Callback channel for finished frames
pub type FrameSink = Sender<FrameDone>;

/// Frame queue command on its way to the worker
#[derive(Debug)]
pub struct FrameRequest {
    /// Issuing session
    pub session_id: SessionId,
    /// Correlation id
    pub request_id: u32,
    /// Caller frame id
    pub frame_id: u32,
    /// I/O table slot
    pub slot: usize,
    /// Device address of the slot's I/O table
    pub io_table_daddr: u64,
    /// Entries in the I/O table
    pub vector_count: u32,
    /// Input buffer set
    pub input: BufferSet,
    /// Output buffer set
    pub output: BufferSet,
    /// Completion channel, cleared by CLEAR_CB
    pub reply: Option<FrameSink>,
    /// Result so far
    pub result: ResultCode,
}

/// Finished frame as delivered to the session's buffer queue
#[derive(Debug, Clone)]
pub struct FrameDone {
    /// Correlation id
    pub request_id: u32,
    /// Caller frame id
    pub frame_id: u32,
    /// I/O table slot
    pub slot: usize,
    /// Input buffer set
    pub input: BufferSet,
    /// Output buffer set
    pub output: BufferSet,
    /// Final result
    pub result: ResultCode,
}

/// Network command as posted to firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    /// Correlation id
    pub request_id: u32,
    /// Issuing session
    pub session_id: Option<SessionId>,
    /// Command
    pub command: NetworkCommand,
    /// Mapped NCP for LOAD
    pub ncp: Option<NcpRef>,
    /// Command argument
    pub payload: u32,
}

/// Frame command as posted to firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    /// Correlation id
    pub request_id: u32,
    /// Issuing session
    pub session_id: SessionId,
    /// Caller frame id
    pub frame_id: u32,
    /// Device address of the I/O table
    pub io_table_daddr: u64,
    /// Entries in the I/O table
    pub vector_count: u32,
}

/// Request class of a firmware response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Network command
    Network,
    /// Frame command
    Frame,
}

/// Firmware answer, matched to a request by id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareResponse {
    /// Request class
    pub kind: RequestKind,
    /// Correlation id
    pub request_id: u32,
    /// Result code
    pub result: ResultCode,
}

/// Request id generator
///
/// Ids are 32-bit and wrap; zero is never handed out.
#[derive(Debug)]
pub struct RequestIds(AtomicU32);

impl RequestIds {
    /// Start at 1
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Start at an arbitrary value (rollover tests)
    pub const fn starting_at(first: u32) -> Self {
        Self(AtomicU32::new(first))
    }

    /// Next id
    pub fn next(&self) -> u32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}
