// SPDX-License-Identifier: AGPL-3.0-only

//! Reader and address resolver for NCP (network compiled program) binaries.
//!
//! An NCP is the artifact the network compiler hands to the NPU driver. It
//! carries a fixed header, a memory-vector table describing every logical
//! buffer the network touches, an address-vector table with the placeholder
//! addresses firmware will dereference, and the weight/micro-code payload.
//!
//! This crate has **no hardware access**. It only reads and patches bytes:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`layout`] | Bit-exact `#[repr(C)]` header and table entries, memory type tags |
//! | [`view`] | Bounds-checked views over a blob, typed tables |
//! | [`resolve`] | Two-pass classification into per-class [`AddrInfo`] tables |
//! | [`builder`] | [`NcpBuilder`], emits well-formed (or deliberately broken) blobs |
//!
//! # Example
//!
//! ```
//! use npu_ncp::{resolve, NcpBase, NcpBuilder, MemoryType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let blob = NcpBuilder::new(2048)
//!     .feature_map(MemoryType::InputFeatureMap, 1024)
//!     .feature_map(MemoryType::OutputFeatureMap, 512)
//!     .weight(64, 256)
//!     .build()?;
//!
//! let resolved = resolve(&blob, NcpBase::new(0x1000_0000, 0))?;
//! assert_eq!(resolved.counts.ifm, 1);
//! assert_eq!(resolved.weights[0].daddr, 0x1000_0000 + 64);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod builder;
mod error;
pub mod layout;
pub mod resolve;
pub mod view;

pub use builder::{Geometry, NcpBuilder};
pub use error::{NcpError, Result};
pub use layout::{
    AddressVector, IoVector, MemoryClass, MemoryType, MemoryVector, NcpHeader,
};
pub use resolve::{
    apply_patches, count_classes, resolve, AddrInfo, ClassCounts, NcpBase, Patch, ResolvedNcp,
};
pub use view::{read_u32, write_u32, NcpLayout, NcpView, Table};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        resolve, AddrInfo, MemoryClass, MemoryType, NcpBase, NcpBuilder, NcpError, NcpView,
        ResolvedNcp, Result,
    };
}
