// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for NCP parsing

use crate::layout::MemoryClass;
use thiserror::Error;

/// Result type alias for NCP operations
pub type Result<T> = std::result::Result<T, NcpError>;

/// Errors raised while reading, resolving or patching an NCP blob
///
/// Every variant is fatal to the parse: nothing resolved before the error
/// is handed back to the caller.
#[derive(Debug, Error)]
pub enum NcpError {
    /// A header or table would extend past the end of the blob
    #[error("{what} out of bounds: offset {offset} + {len} bytes exceeds blob of {blob_len} bytes")]
    OutOfBounds {
        /// Region being read
        what: &'static str,
        /// Byte offset of the region
        offset: usize,
        /// Length of the region in bytes
        len: usize,
        /// Size of the backing blob
        blob_len: usize,
    },

    /// A memory vector references an address vector that does not exist
    #[error("memory vector {entry} references address vector {index}, table has {count}")]
    AddressIndex {
        /// Memory-vector entry number
        entry: usize,
        /// Referenced address-vector index
        index: u32,
        /// Address vectors present in the table
        count: u32,
    },

    /// More address vectors than memory vectors
    #[error("address vector count {address_vectors} exceeds memory vector count {memory_vectors}")]
    VectorCount {
        /// Address-vector count from the header
        address_vectors: u32,
        /// Memory-vector count from the header
        memory_vectors: u32,
    },

    /// Weight region does not lie inside the blob
    #[error("weight at address vector {index}: offset {offset:#x} + size {size:#x} exceeds blob of {blob_len:#x} bytes")]
    WeightBounds {
        /// Address-vector index of the weight
        index: u32,
        /// Offset recorded by the compiler
        offset: u32,
        /// Size of the region
        size: u32,
        /// Size of the backing blob
        blob_len: usize,
    },

    /// Classification pass saw a different number of entries than the counting pass
    #[error("{class} entries: counted {counted}, classified {classified}")]
    ClassMismatch {
        /// Resource class
        class: MemoryClass,
        /// Entries tallied by the counting pass
        counted: usize,
        /// Entries consumed by the classification pass
        classified: usize,
    },

    /// A device address does not fit the 32-bit address-vector field
    #[error("device address {daddr:#x} does not fit a 32-bit address vector")]
    AddressOverflow {
        /// Offending device address
        daddr: u64,
    },

    /// Blob construction failed
    #[error("Failed to build NCP: {reason}")]
    Build {
        /// Reason for failure
        reason: String,
    },
}

impl NcpError {
    /// Create an out-of-bounds error
    pub const fn out_of_bounds(what: &'static str, offset: usize, len: usize, blob_len: usize) -> Self {
        Self::OutOfBounds {
            what,
            offset,
            len,
            blob_len,
        }
    }

    /// Create a build error
    pub fn build(reason: impl Into<String>) -> Self {
        Self::Build {
            reason: reason.into(),
        }
    }
}
