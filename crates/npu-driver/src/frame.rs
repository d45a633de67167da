// SPDX-License-Identifier: AGPL-3.0-only

//! Caller buffer sets and per-slot binding state.
//!
//! Each I/O slot carries its own copy of the resolved IFM and OFM tables so a
//! caller buffer can be bound into one slot without touching the others.
//! Slot state cycles `Unprepared → Prepared → Queued → Dequeued → Prepared`.

use crate::error::{NpuError, Result};
use crate::memory::DmaBuffer;
use npu_ncp::AddrInfo;
use std::fmt;

/// Buffer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Input feature maps
    Input,
    /// Output feature maps
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

/// Binding state of one slot in one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BufState {
    /// No caller buffer bound
    #[default]
    Unprepared,
    /// Caller buffers bound, not queued
    Prepared,
    /// Handed to firmware
    Queued,
    /// Returned by dequeue, may be queued again
    Dequeued,
}

/// One caller buffer as the device sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    /// Device address
    pub daddr: u64,
    /// Host address
    pub vaddr: u64,
    /// Size in bytes
    pub size: u32,
}

impl DeviceBuffer {
    /// Describe a buffer of `size` bytes
    ///
    /// # Errors
    ///
    /// [`NpuError::InvalidArgument`] if `size` does not fit the 32-bit size
    /// field of a memory vector.
    pub fn new(daddr: u64, vaddr: u64, size: usize) -> Result<Self> {
        let size = u32::try_from(size).map_err(|_| {
            NpuError::invalid_argument(format!("buffer of {size} bytes at {daddr:#x} exceeds 4 GiB"))
        })?;
        Ok(Self { daddr, vaddr, size })
    }

    /// Describe an allocated buffer
    ///
    /// # Errors
    ///
    /// As [`Self::new`].
    pub fn of(buffer: &DmaBuffer) -> Result<Self> {
        Self::new(buffer.daddr(), buffer.vaddr(), buffer.size())
    }
}

/// Caller buffers for one direction of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSet {
    /// Direction
    pub direction: Direction,
    /// I/O slot the set binds to
    pub index: usize,
    /// Caller frame id, echoed back on dequeue
    pub frame_id: u32,
    /// One buffer per feature map of the direction, in resolved order
    pub buffers: Vec<DeviceBuffer>,
}

impl BufferSet {
    /// Create a set
    pub const fn new(direction: Direction, index: usize, frame_id: u32, buffers: Vec<DeviceBuffer>) -> Self {
        Self {
            direction,
            index,
            frame_id,
            buffers,
        }
    }
}

/// Negotiated layout of one feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Bits per pixel
    pub pixel_format: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channel count
    pub channels: u32,
    /// Row stride written into the memory vector
    pub stride: u32,
}

impl Layout {
    /// 8-bit single-row layout of `size` bytes
    pub const fn linear(size: u32) -> Self {
        Self {
            pixel_format: 8,
            width: size,
            height: 1,
            channels: 1,
            stride: size,
        }
    }

    /// Layout matching the geometry the compiler recorded for `info`
    pub const fn of(info: &AddrInfo) -> Self {
        Self {
            pixel_format: info.pixel_format,
            width: info.width,
            height: info.height,
            channels: info.channels,
            stride: info.width.saturating_mul(info.pixel_format / 8),
        }
    }

    /// Byte size implied by the layout
    pub fn byte_size(&self) -> u64 {
        u64::from(self.pixel_format / 8)
            * u64::from(self.channels)
            * u64::from(self.width)
            * u64::from(self.height)
    }

    /// Check that the layout can hold `info`
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidArgument`] if the implied size is smaller
    /// than the resolved buffer.
    pub fn check_fits(&self, info: &AddrInfo) -> Result<()> {
        let computed = self.byte_size();
        if u64::from(info.size) > computed {
            return Err(NpuError::invalid_argument(format!(
                "layout {}x{}x{} @{}bpp holds {computed} bytes, buffer {} needs {}",
                self.width, self.height, self.channels, self.pixel_format, info.av_index, info.size
            )));
        }
        Ok(())
    }
}

/// Bound tables and state of one direction of an I/O slot
#[derive(Debug, Clone)]
pub struct SlotSide {
    /// Per-slot copy of the resolved feature maps
    pub maps: Vec<AddrInfo>,
    /// Binding state
    pub state: BufState,
    /// Frame id of the bound set
    pub frame_id: u32,
}

impl SlotSide {
    /// Unbound copy of `maps`
    pub fn new(maps: &[AddrInfo]) -> Self {
        Self {
            maps: maps.to_vec(),
            state: BufState::Unprepared,
            frame_id: 0,
        }
    }

    /// Bind `set` into the tables
    ///
    /// # Errors
    ///
    /// [`NpuError::BufferState`] while queued, [`NpuError::InvalidArgument`]
    /// if the set does not carry one buffer per feature map or a buffer is
    /// too small.
    pub fn prepare(&mut self, set: &BufferSet) -> Result<()> {
        if self.state == BufState::Queued {
            return Err(self.state_error("prepare", set));
        }
        if set.buffers.len() != self.maps.len() {
            return Err(NpuError::invalid_argument(format!(
                "{} set for slot {} has {} buffers, network has {}",
                set.direction,
                set.index,
                set.buffers.len(),
                self.maps.len()
            )));
        }
        if let Some((info, buffer)) = self
            .maps
            .iter()
            .zip(&set.buffers)
            .find(|(info, buffer)| buffer.size < info.size)
        {
            return Err(NpuError::invalid_argument(format!(
                "{} buffer for av {} holds {} bytes, needs {}",
                set.direction, info.av_index, buffer.size, info.size
            )));
        }
        for (info, buffer) in self.maps.iter_mut().zip(&set.buffers) {
            info.daddr = buffer.daddr;
            info.vaddr = buffer.vaddr;
        }
        self.frame_id = set.frame_id;
        self.state = BufState::Prepared;
        Ok(())
    }

    /// Drop the binding
    ///
    /// # Errors
    ///
    /// [`NpuError::BufferState`] while queued.
    pub fn unprepare(&mut self, set: &BufferSet) -> Result<()> {
        if self.state == BufState::Queued {
            return Err(self.state_error("unprepare", set));
        }
        for info in &mut self.maps {
            info.daddr = 0;
            info.vaddr = 0;
        }
        self.state = BufState::Unprepared;
        Ok(())
    }

    /// Whether the side may be queued
    pub const fn queueable(&self) -> bool {
        matches!(self.state, BufState::Prepared | BufState::Dequeued)
    }

    /// Current bound set
    pub fn bound_set(&self, direction: Direction, index: usize) -> BufferSet {
        BufferSet {
            direction,
            index,
            frame_id: self.frame_id,
            buffers: self
                .maps
                .iter()
                .map(|info| DeviceBuffer {
                    daddr: info.daddr,
                    vaddr: info.vaddr,
                    size: info.size,
                })
                .collect(),
        }
    }

    fn state_error(&self, operation: &'static str, set: &BufferSet) -> NpuError {
        NpuError::BufferState {
            operation,
            direction: set.direction,
            index: set.index,
            state: self.state,
        }
    }
}

/// Per-slot input and output bindings
#[derive(Debug, Clone)]
pub struct FmSlot {
    /// Input side
    pub input: SlotSide,
    /// Output side
    pub output: SlotSide,
}

impl FmSlot {
    /// Fresh slot over the resolved tables
    pub fn new(ifm: &[AddrInfo], ofm: &[AddrInfo]) -> Self {
        Self {
            input: SlotSide::new(ifm),
            output: SlotSide::new(ofm),
        }
    }

    /// One side of the slot
    pub const fn side(&self, direction: Direction) -> &SlotSide {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    /// One side of the slot, mutably
    pub fn side_mut(&mut self, direction: Direction) -> &mut SlotSide {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }
}

/// Dequeued buffer set with the frame's result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dequeued {
    /// Returned set
    pub set: BufferSet,
    /// Firmware result for the frame
    pub result: crate::protocol::ResultCode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use npu_ncp::MemoryType;

    fn info(av_index: u32, size: u32) -> AddrInfo {
        AddrInfo {
            av_index,
            memory_type: MemoryType::InputFeatureMap,
            size,
            vaddr: 0,
            daddr: 0,
            pixel_format: 8,
            width: size,
            height: 1,
            channels: 1,
            stride: 0,
        }
    }

    fn set(size: u32) -> BufferSet {
        BufferSet::new(
            Direction::Input,
            0,
            11,
            vec![DeviceBuffer {
                daddr: 0x2000_0000,
                vaddr: 0xdead_0000,
                size,
            }],
        )
    }

    #[test]
    fn prepare_binds_addresses() {
        let mut side = SlotSide::new(&[info(0, 1024)]);
        side.prepare(&set(1024)).unwrap();
        assert_eq!(side.state, BufState::Prepared);
        assert_eq!(side.maps[0].daddr, 0x2000_0000);
        assert_eq!(side.bound_set(Direction::Input, 0), set(1024));
    }

    #[test]
    fn prepare_rejects_wrong_count_and_small_buffers() {
        let mut side = SlotSide::new(&[info(0, 1024), info(1, 64)]);
        assert!(side.prepare(&set(1024)).is_err());

        let mut side = SlotSide::new(&[info(0, 1024)]);
        assert!(side.prepare(&set(512)).is_err());
        assert_eq!(side.state, BufState::Unprepared);
    }

    #[test]
    fn queued_side_cannot_be_rebound() {
        let mut side = SlotSide::new(&[info(0, 16)]);
        side.prepare(&set(16)).unwrap();
        side.state = BufState::Queued;
        assert!(matches!(
            side.prepare(&set(16)),
            Err(NpuError::BufferState {
                state: BufState::Queued,
                ..
            })
        ));
        assert!(side.unprepare(&set(16)).is_err());
        side.state = BufState::Dequeued;
        side.unprepare(&set(16)).unwrap();
        assert_eq!(side.maps[0].daddr, 0);
    }

    #[test]
    fn oversized_buffers_are_refused() {
        let buffer = DeviceBuffer::new(0x2000_0000, 0, 4096).unwrap();
        assert_eq!(buffer.size, 4096);
        assert!(matches!(
            DeviceBuffer::new(0x2000_0000, 0, u32::MAX as usize + 1),
            Err(NpuError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn layout_must_cover_buffer() {
        let layout = Layout {
            pixel_format: 8,
            width: 32,
            height: 32,
            channels: 1,
            stride: 32,
        };
        layout.check_fits(&info(0, 1024)).unwrap();
        assert!(layout.check_fits(&info(0, 1025)).is_err());
    }
}
