// SPDX-License-Identifier: AGPL-3.0-only

//! NCP blob construction.
//!
//! The builder places the header at byte 0 and both tables at the end of the
//! blob, leaving the space in between for weight payload at whatever offsets
//! the caller names. It performs no semantic validation: malformed networks
//! (dangling indices, weights past the end, inflated counts) are built on
//! request so the reader's checks can be exercised.

use crate::error::{NcpError, Result};
use crate::layout::{AddressVector, MemoryType, MemoryVector, NcpHeader, NCP_MAGIC, NCP_VERSION};

/// Pixel geometry of a feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bits per pixel
    pub pixel_format: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channel count
    pub channels: u32,
}

impl Geometry {
    /// Byte size implied by the geometry
    pub fn byte_size(&self) -> u64 {
        u64::from(self.pixel_format / 8)
            * u64::from(self.channels)
            * u64::from(self.width)
            * u64::from(self.height)
    }

    /// 8-bit single-row, single-channel geometry of `size` bytes
    pub const fn linear(size: u32) -> Self {
        Self {
            pixel_format: 8,
            width: size,
            height: 1,
            channels: 1,
        }
    }
}

/// Builder for NCP blobs
#[derive(Debug, Clone)]
pub struct NcpBuilder {
    blob_len: usize,
    memory_vectors: Vec<MemoryVector>,
    address_vectors: Vec<AddressVector>,
    address_vector_count: Option<u32>,
    memory_vector_offset: Option<u32>,
}

impl NcpBuilder {
    /// Start a blob of `blob_len` bytes
    pub const fn new(blob_len: usize) -> Self {
        Self {
            blob_len,
            memory_vectors: Vec::new(),
            address_vectors: Vec::new(),
            address_vector_count: None,
            memory_vector_offset: None,
        }
    }

    /// Add a linear 8-bit feature map of `size` bytes with its own address vector
    #[must_use]
    pub fn feature_map(self, memory_type: MemoryType, size: u32) -> Self {
        self.feature_map_with_stride(memory_type, size, 0)
    }

    /// Add a linear feature map whose memory vector carries a compiler stride
    #[must_use]
    pub fn feature_map_with_stride(self, memory_type: MemoryType, size: u32, stride: u32) -> Self {
        self.shaped_feature_map(memory_type, Geometry::linear(size), size, stride)
    }

    /// Add a feature map with explicit geometry and address-vector size
    #[must_use]
    pub fn shaped_feature_map(
        mut self,
        memory_type: MemoryType,
        geometry: Geometry,
        size: u32,
        stride: u32,
    ) -> Self {
        let index = self.push_address_vector(0, size);
        self.memory_vectors.push(MemoryVector {
            memory_type: memory_type.raw(),
            address_vector_index: index,
            pixel_format: geometry.pixel_format,
            width: geometry.width,
            height: geometry.height,
            channels: geometry.channels,
            stride,
        });
        self
    }

    /// Add an intermediate buffer of `size` bytes
    #[must_use]
    pub fn intermediate(self, size: u32) -> Self {
        self.feature_map(MemoryType::IntermediateFeatureMap, size)
    }

    /// Add a weight region at blob `offset`
    #[must_use]
    pub fn weight(self, offset: u32, size: u32) -> Self {
        self.resident(MemoryType::Weight, offset, size)
    }

    /// Add a blob-resident region (weight, micro-code or mask)
    #[must_use]
    pub fn resident(mut self, memory_type: MemoryType, offset: u32, size: u32) -> Self {
        let index = self.push_address_vector(offset, size);
        self.memory_vectors.push(MemoryVector {
            memory_type: memory_type.raw(),
            address_vector_index: index,
            ..MemoryVector::default()
        });
        self
    }

    /// Append a bare address vector
    #[must_use]
    pub fn address_vector(mut self, base_address: u32, size: u32) -> Self {
        self.push_address_vector(base_address, size);
        self
    }

    /// Append a bare memory vector referencing `address_vector_index`
    #[must_use]
    pub fn memory_vector(mut self, memory_type: MemoryType, address_vector_index: u32) -> Self {
        self.memory_vectors.push(MemoryVector {
            memory_type: memory_type.raw(),
            address_vector_index,
            ..MemoryVector::default()
        });
        self
    }

    /// Record a different address-vector count in the header
    #[must_use]
    pub const fn with_address_vector_count(mut self, count: u32) -> Self {
        self.address_vector_count = Some(count);
        self
    }

    /// Record a different memory-vector offset in the header
    #[must_use]
    pub const fn with_memory_vector_offset(mut self, offset: u32) -> Self {
        self.memory_vector_offset = Some(offset);
        self
    }

    /// Emit the blob
    ///
    /// # Errors
    ///
    /// Returns [`NcpError::Build`] if header and tables do not fit in the
    /// requested blob size.
    pub fn build(self) -> Result<Vec<u8>> {
        let av_bytes = self.address_vectors.len() * AddressVector::SIZE;
        let mv_bytes = self.memory_vectors.len() * MemoryVector::SIZE;
        let tables = av_bytes + mv_bytes;
        if NcpHeader::SIZE + tables > self.blob_len {
            return Err(NcpError::build(format!(
                "header and tables need {} bytes, blob is {}",
                NcpHeader::SIZE + tables,
                self.blob_len
            )));
        }

        let av_offset = self.blob_len - av_bytes;
        let mv_offset = av_offset - mv_bytes;
        let to_u32 = |value: usize| {
            u32::try_from(value).map_err(|_| NcpError::build(format!("{value} does not fit u32")))
        };

        let header = NcpHeader {
            memory_vector_offset: match self.memory_vector_offset {
                Some(offset) => offset,
                None => to_u32(mv_offset)?,
            },
            memory_vector_count: to_u32(self.memory_vectors.len())?,
            address_vector_offset: to_u32(av_offset)?,
            address_vector_count: match self.address_vector_count {
                Some(count) => count,
                None => to_u32(self.address_vectors.len())?,
            },
            magic_number: NCP_MAGIC,
            hdr_version: NCP_VERSION,
            hdr_size: to_u32(NcpHeader::SIZE)?,
            reserved: 0,
        };

        let mut blob = vec![0u8; self.blob_len];
        blob[..NcpHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        blob[mv_offset..av_offset].copy_from_slice(bytemuck::cast_slice(&self.memory_vectors));
        blob[av_offset..].copy_from_slice(bytemuck::cast_slice(&self.address_vectors));

        tracing::debug!(
            "Built NCP: {} bytes, {} memory vectors @ {:#x}, {} address vectors @ {:#x}",
            self.blob_len,
            self.memory_vectors.len(),
            mv_offset,
            self.address_vectors.len(),
            av_offset
        );
        Ok(blob)
    }

    fn push_address_vector(&mut self, base_address: u32, size: u32) -> u32 {
        self.address_vectors.push(AddressVector { base_address, size });
        // Table sizes are bounded by the blob, far below u32::MAX entries.
        u32::try_from(self.address_vectors.len() - 1).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::NcpView;

    #[test]
    fn tables_sit_at_end_of_blob() {
        let blob = NcpBuilder::new(2048)
            .feature_map(MemoryType::InputFeatureMap, 1024)
            .weight(64, 256)
            .build()
            .unwrap();

        let view = NcpView::new(&blob).unwrap();
        let header = view.header();
        assert_eq!(header.address_vector_offset as usize, 2048 - 2 * 8);
        assert_eq!(header.memory_vector_offset as usize, 2048 - 2 * 8 - 2 * 28);
        assert_eq!(header.magic_number, NCP_MAGIC);

        let avs: Vec<_> = view.address_vectors().unwrap().iter().collect();
        assert_eq!(avs[1], AddressVector { base_address: 64, size: 256 });
    }

    #[test]
    fn too_small_blob_fails() {
        let result = NcpBuilder::new(40)
            .feature_map(MemoryType::InputFeatureMap, 16)
            .build();
        assert!(matches!(result, Err(NcpError::Build { .. })));
    }

    #[test]
    fn header_overrides_are_recorded() {
        let blob = NcpBuilder::new(256)
            .feature_map(MemoryType::InputFeatureMap, 16)
            .with_address_vector_count(9)
            .with_memory_vector_offset(250)
            .build()
            .unwrap();
        let view = NcpView::new(&blob).unwrap();
        assert_eq!(view.header().address_vector_count, 9);
        assert!(view.memory_vectors().is_err());
        assert!(view.address_vectors().is_err());
    }

    #[test]
    fn geometry_size() {
        let geometry = Geometry {
            pixel_format: 16,
            width: 4,
            height: 2,
            channels: 3,
        };
        assert_eq!(geometry.byte_size(), 48);
        assert_eq!(Geometry::linear(100).byte_size(), 100);
    }
}
