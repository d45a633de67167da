// SPDX-License-Identifier: AGPL-3.0-only

//! Firmware side of the mailbox.
//!
//! The protocol worker is the only caller. Posting never blocks: a full
//! firmware mailbox reports `false` and the worker retries on its next pass.

mod loopback;

pub use loopback::{HoldRule, LoopbackFirmware, LoopbackStats, FIRMWARE_ERROR};

use crate::protocol::{FirmwareResponse, FrameMessage, NetworkMessage};
use std::fmt;

/// Transport to the NPU firmware
pub trait Firmware: Send + Sync + fmt::Debug {
    /// Post a network command; `false` if the mailbox is full
    fn post_network(&self, message: NetworkMessage) -> bool;

    /// Post a frame command; `false` if the mailbox is full
    fn post_frame(&self, message: FrameMessage) -> bool;

    /// Next answer, if any
    fn fetch(&self) -> Option<FirmwareResponse>;
}
