// SPDX-License-Identifier: AGPL-3.0-only

//! Bounds-checked views over an NCP blob.

use crate::error::{NcpError, Result};
use crate::layout::{AddressVector, MemoryVector, NcpHeader};
use bytemuck::Pod;
use std::marker::PhantomData;
use std::mem::size_of;

/// Typed, bounds-checked table of `T` inside a blob
#[derive(Debug, Clone, Copy)]
pub struct Table<'a, T> {
    bytes: &'a [u8],
    _entry: PhantomData<T>,
}

impl<'a, T: Pod> Table<'a, T> {
    /// Borrow `count` entries starting at `offset`
    ///
    /// # Errors
    ///
    /// Returns [`NcpError::OutOfBounds`] if the table does not fit in `blob`
    /// (including arithmetic overflow of the extent).
    pub fn new(blob: &'a [u8], what: &'static str, offset: usize, count: usize) -> Result<Self> {
        let len = count.saturating_mul(size_of::<T>());
        let bytes = offset
            .checked_add(len)
            .and_then(|end| blob.get(offset..end))
            .ok_or(NcpError::out_of_bounds(what, offset, len, blob.len()))?;

        Ok(Self {
            bytes,
            _entry: PhantomData,
        })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.bytes.len() / size_of::<T>()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode entry `index`
    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(size_of::<T>())?;
        let end = start.checked_add(size_of::<T>())?;
        let chunk = self.bytes.get(start..end)?;
        Some(bytemuck::pod_read_unaligned(chunk))
    }

    /// Iterate decoded entries in table order
    pub fn iter(&self) -> impl Iterator<Item = T> + 'a {
        self.bytes
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }
}

/// Validated placement of both tables inside a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcpLayout {
    /// Byte offset of the memory-vector table
    pub memory_vector_offset: usize,
    /// Number of memory vectors
    pub memory_vector_count: usize,
    /// Byte offset of the address-vector table
    pub address_vector_offset: usize,
    /// Number of address vectors
    pub address_vector_count: usize,
    /// Size of the blob the layout was validated against
    pub blob_len: usize,
}

impl NcpLayout {
    /// Byte offset of the `stride` field of memory vector `index`
    pub fn stride_offset(&self, index: usize) -> Option<usize> {
        (index < self.memory_vector_count)
            .then(|| self.memory_vector_offset + index * MemoryVector::SIZE + MemoryVector::STRIDE_OFFSET)
    }

    /// Byte offset of the `base_address` field of address vector `index`
    pub fn base_offset(&self, index: usize) -> Option<usize> {
        (index < self.address_vector_count)
            .then(|| self.address_vector_offset + index * AddressVector::SIZE + AddressVector::BASE_OFFSET)
    }
}

/// Read-only view of an NCP blob with a decoded header
#[derive(Debug, Clone, Copy)]
pub struct NcpView<'a> {
    blob: &'a [u8],
    header: NcpHeader,
}

impl<'a> NcpView<'a> {
    /// Decode the header of `blob`
    ///
    /// # Errors
    ///
    /// Returns [`NcpError::OutOfBounds`] if the blob is shorter than the header.
    pub fn new(blob: &'a [u8]) -> Result<Self> {
        let raw = blob
            .get(..NcpHeader::SIZE)
            .ok_or(NcpError::out_of_bounds("NCP header", 0, NcpHeader::SIZE, blob.len()))?;
        let header: NcpHeader = bytemuck::pod_read_unaligned(raw);

        tracing::debug!(
            "NCP header: magic {:#x} v{} mv {}@{:#x} av {}@{:#x} ({} bytes)",
            header.magic_number,
            header.hdr_version,
            header.memory_vector_count,
            header.memory_vector_offset,
            header.address_vector_count,
            header.address_vector_offset,
            blob.len()
        );

        Ok(Self { blob, header })
    }

    /// Decoded header
    pub const fn header(&self) -> &NcpHeader {
        &self.header
    }

    /// Size of the underlying blob
    pub const fn blob_len(&self) -> usize {
        self.blob.len()
    }

    /// Memory-vector table
    ///
    /// # Errors
    ///
    /// Returns [`NcpError::OutOfBounds`] if the table runs past the blob.
    pub fn memory_vectors(&self) -> Result<Table<'a, MemoryVector>> {
        Table::new(
            self.blob,
            "memory vector table",
            self.header.memory_vector_offset as usize,
            self.header.memory_vector_count as usize,
        )
    }

    /// Address-vector table
    ///
    /// # Errors
    ///
    /// Returns [`NcpError::OutOfBounds`] if the table runs past the blob.
    pub fn address_vectors(&self) -> Result<Table<'a, AddressVector>> {
        Table::new(
            self.blob,
            "address vector table",
            self.header.address_vector_offset as usize,
            self.header.address_vector_count as usize,
        )
    }

    /// Validate both tables and return their placement
    ///
    /// # Errors
    ///
    /// Returns [`NcpError::OutOfBounds`] if either table runs past the blob.
    pub fn layout(&self) -> Result<NcpLayout> {
        let mv = self.memory_vectors()?;
        let av = self.address_vectors()?;
        Ok(NcpLayout {
            memory_vector_offset: self.header.memory_vector_offset as usize,
            memory_vector_count: mv.len(),
            address_vector_offset: self.header.address_vector_offset as usize,
            address_vector_count: av.len(),
            blob_len: self.blob.len(),
        })
    }
}

/// Read a little-endian `u32` at `at`
///
/// # Errors
///
/// Returns [`NcpError::OutOfBounds`] if the field does not fit in `blob`.
pub fn read_u32(blob: &[u8], what: &'static str, at: usize) -> Result<u32> {
    let field = at
        .checked_add(4)
        .and_then(|end| blob.get(at..end))
        .ok_or(NcpError::out_of_bounds(what, at, 4, blob.len()))?;
    Ok(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}

/// Write a little-endian `u32` at `at`
///
/// # Errors
///
/// Returns [`NcpError::OutOfBounds`] if the field does not fit in `blob`.
pub fn write_u32(blob: &mut [u8], what: &'static str, at: usize, value: u32) -> Result<()> {
    let blob_len = blob.len();
    let field = at
        .checked_add(4)
        .and_then(|end| blob.get_mut(at..end))
        .ok_or(NcpError::out_of_bounds(what, at, 4, blob_len))?;
    field.copy_from_slice(&value.to_le_bytes());
    Ok(())
}
