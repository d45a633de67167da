// SPDX-License-Identifier: AGPL-3.0-only

//! Bit-exact NCP layout.
//!
//! All multi-byte fields are little-endian `u32`. All offsets are byte
//! offsets from the start of the blob.
//!
//! ```text
//! 0x00  NcpHeader (32 B)
//!       ...  weight / micro-code payload at compiler-chosen offsets
//! mvo   MemoryVector[memory_vector_count]    (28 B each)
//! avo   AddressVector[address_vector_count]  (8 B each)
//! ```

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Magic recorded by the network compiler in [`NcpHeader::magic_number`].
///
/// Informational only; the driver does not reject other values.
pub const NCP_MAGIC: u32 = 0x0C0F_FEE0;

/// Header version emitted by [`crate::NcpBuilder`].
pub const NCP_VERSION: u32 = 2;

/// NCP header at byte 0 of the blob
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct NcpHeader {
    /// Byte offset of the memory-vector table
    pub memory_vector_offset: u32,
    /// Number of memory-vector entries
    pub memory_vector_count: u32,
    /// Byte offset of the address-vector table
    pub address_vector_offset: u32,
    /// Number of address-vector entries
    pub address_vector_count: u32,
    /// Compiler magic
    pub magic_number: u32,
    /// Header format version
    pub hdr_version: u32,
    /// Header size in bytes
    pub hdr_size: u32,
    /// Reserved, zero
    pub reserved: u32,
}

/// One logical buffer used by the network
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MemoryVector {
    /// Raw [`MemoryType`] tag
    pub memory_type: u32,
    /// Index into the address-vector table
    pub address_vector_index: u32,
    /// Bits per pixel
    pub pixel_format: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channel count
    pub channels: u32,
    /// Row stride, rewritten by the session from the negotiated format
    pub stride: u32,
}

/// `{base, size}` pair as emitted by the compiler
///
/// Weight bases hold an offset into the blob until the driver rewrites them
/// to `ncp_device_base + offset`. Intermediate-buffer bases are rewritten to
/// the allocation's device address.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct AddressVector {
    /// Device address (or blob offset for weights before patching)
    pub base_address: u32,
    /// Region size in bytes
    pub size: u32,
}

/// Entry of a per-slot I/O table handed to firmware with each frame.
///
/// Input feature maps come first, then output feature maps.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IoVector {
    /// Address-vector index this entry binds
    pub index: u32,
    /// Device address of the caller buffer bound for the current frame
    pub base_address: u32,
    /// Region size in bytes
    pub size: u32,
}

impl NcpHeader {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl MemoryVector {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
    /// Byte offset of `stride` inside an entry
    pub const STRIDE_OFFSET: usize = std::mem::offset_of!(Self, stride);

    /// Decoded type tag
    pub const fn kind(&self) -> MemoryType {
        MemoryType::from_raw(self.memory_type)
    }
}

impl AddressVector {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
    /// Byte offset of `base_address` inside an entry
    pub const BASE_OFFSET: usize = std::mem::offset_of!(Self, base_address);
}

impl IoVector {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Memory-vector type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Compute-unit micro-code
    MicroCode,
    /// Weights
    Weight,
    /// Weight mask
    WeightMask,
    /// Input feature map
    InputFeatureMap,
    /// Output feature map
    OutputFeatureMap,
    /// Intermediate feature map
    IntermediateFeatureMap,
    /// Any tag the driver does not bind
    Other(u32),
}

impl MemoryType {
    /// Decode a raw tag
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::MicroCode,
            1 => Self::Weight,
            2 => Self::WeightMask,
            3 => Self::InputFeatureMap,
            4 => Self::OutputFeatureMap,
            5 => Self::IntermediateFeatureMap,
            other => Self::Other(other),
        }
    }

    /// Encode back to the on-wire tag
    pub const fn raw(self) -> u32 {
        match self {
            Self::MicroCode => 0,
            Self::Weight => 1,
            Self::WeightMask => 2,
            Self::InputFeatureMap => 3,
            Self::OutputFeatureMap => 4,
            Self::IntermediateFeatureMap => 5,
            Self::Other(other) => other,
        }
    }

    /// Resource class the driver files this type under, if any
    pub const fn class(self) -> Option<MemoryClass> {
        match self {
            Self::InputFeatureMap => Some(MemoryClass::Ifm),
            Self::OutputFeatureMap => Some(MemoryClass::Ofm),
            Self::IntermediateFeatureMap => Some(MemoryClass::Imb),
            Self::MicroCode | Self::Weight | Self::WeightMask => Some(MemoryClass::Weight),
            Self::Other(_) => None,
        }
    }
}

/// Resource class of a resolved buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Input feature map, bound per frame to a caller buffer
    Ifm,
    /// Output feature map, bound per frame to a caller buffer
    Ofm,
    /// Intermediate buffer, allocated once per session
    Imb,
    /// Weight, micro-code or mask, resident in the NCP blob
    Weight,
}

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ifm => "IFM",
            Self::Ofm => "OFM",
            Self::Imb => "IMB",
            Self::Weight => "WGT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_sizes_are_bit_exact() {
        assert_eq!(NcpHeader::SIZE, 32);
        assert_eq!(MemoryVector::SIZE, 28);
        assert_eq!(AddressVector::SIZE, 8);
        assert_eq!(IoVector::SIZE, 12);
        assert_eq!(MemoryVector::STRIDE_OFFSET, 24);
        assert_eq!(AddressVector::BASE_OFFSET, 0);
    }

    #[test]
    fn memory_type_classes() {
        assert_eq!(MemoryType::from_raw(3).class(), Some(MemoryClass::Ifm));
        assert_eq!(MemoryType::from_raw(4).class(), Some(MemoryClass::Ofm));
        assert_eq!(MemoryType::from_raw(5).class(), Some(MemoryClass::Imb));
        for raw in 0..=2 {
            assert_eq!(MemoryType::from_raw(raw).class(), Some(MemoryClass::Weight));
        }
        assert_eq!(MemoryType::from_raw(42), MemoryType::Other(42));
        assert_eq!(MemoryType::Other(42).class(), None);
    }

    #[test]
    fn memory_type_raw_is_inverse() {
        for raw in 0..8 {
            assert_eq!(MemoryType::from_raw(raw).raw(), raw);
        }
    }
}
