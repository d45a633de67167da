// SPDX-License-Identifier: AGPL-3.0-only

//! Session and resource manager for an NCP-driven NPU.
//!
//! A [`Session`] maps a compiled network (NCP), loads it through the
//! firmware mailbox and streams frames through per-slot I/O tables.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`state`] | Stage bitmask and undo chain |
//! | [`memory`] | [`DmaAllocator`] seam, [`HostMemory`] IOVA allocator |
//! | [`frame`] | Caller buffer sets, per-slot binding state, layouts |
//! | [`mailbox`] | Bounded request rings with doorbell notification |
//! | [`dispatcher`] | Blocking network calls with two-tier timeout, frame submission |
//! | [`worker`] | Protocol worker thread: request lifecycle, deadlines, emergency |
//! | [`firmware`] | [`Firmware`] seam and the [`LoopbackFirmware`] |
//! | [`params`] | Parameter handler chain |
//! | [`config`] | [`DriverConfig`] with environment overrides |
//!
//! # Quick start
//!
//! ```
//! use npu_driver::prelude::*;
//! use npu_ncp::{MemoryType, NcpBuilder};
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let blob = NcpBuilder::new(2048)
//!     .feature_map(MemoryType::InputFeatureMap, 1024)
//!     .feature_map(MemoryType::OutputFeatureMap, 512)
//!     .weight(64, 256)
//!     .build()?;
//!
//! let device = NpuDevice::loopback(DriverConfig::default())?;
//! let mut session = device.open()?;
//! session.set_graph(&NcpHandle::new(&blob))?;
//! session.set_format(Direction::Input, &[Layout::linear(1024)])?;
//! session.set_format(Direction::Output, &[Layout::linear(512)])?;
//! session.start()?;
//!
//! let input = device.memory().alloc(1024)?;
//! let output = device.memory().alloc(512)?;
//! let ifm = BufferSet::new(Direction::Input, 0, 1, vec![DeviceBuffer::of(&input)?]);
//! let ofm = BufferSet::new(Direction::Output, 0, 1, vec![DeviceBuffer::of(&output)?]);
//! session.prepare(&ifm)?;
//! session.prepare(&ofm)?;
//! session.queue(&ifm, &ofm)?;
//! assert!(session.dequeue(Direction::Output)?.result.is_ok());
//!
//! session.stop()?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
mod device;
pub mod dispatcher;
mod error;
pub mod firmware;
pub mod frame;
pub mod mailbox;
pub mod memory;
pub mod params;
pub mod protocol;
mod session;
pub mod state;
pub mod worker;

pub use config::{Backoff, DriverConfig, WorkerTimeouts};
pub use device::{NpuDevice, SessionRegistry};
pub use dispatcher::{Completion, Dispatcher, Emergency};
pub use error::{ErrorClass, NpuError, Result, WaitPhase};
pub use firmware::{Firmware, HoldRule, LoopbackFirmware, LoopbackStats, FIRMWARE_ERROR};
pub use frame::{BufState, BufferSet, Dequeued, DeviceBuffer, Direction, Layout};
pub use mailbox::{Doorbell, Mailbox, Ring};
pub use memory::{DmaAllocator, DmaBuffer, HostMemory, NcpHandle};
pub use params::{Param, ParamChain, ParamHandler, ParamOutcome, QosKind, QosTable};
pub use protocol::{NetworkCommand, ResultCode, SessionId};
pub use session::Session;
pub use state::{Progress, Stage};
pub use worker::WorkerSnapshot;

/// Commonly used types
pub mod prelude {
    pub use crate::{
        BufferSet, DeviceBuffer, Direction, DmaAllocator, DriverConfig, Layout, NcpHandle, NpuDevice,
        NpuError, Param, Result, Session, Stage,
    };
}
