// SPDX-License-Identifier: AGPL-3.0-only

//! Two-pass address resolution.
//!
//! Pass 1 ([`count_classes`]) tallies memory vectors per [`MemoryClass`]
//! without allocating. Pass 2 ([`resolve`]) sizes every per-class table from
//! those counts and fills it:
//!
//! - feature maps and intermediate buffers are de-duplicated by address-vector
//!   index, so several memory vectors naming one logical buffer share a slot;
//! - weights are always appended and produce an address-vector rewrite to
//!   `ncp_device_base + offset`.
//!
//! Resolution never writes to the blob. The rewrites are returned as a list
//! of [`Patch`]es that the owner applies with [`ResolvedNcp::apply`], which
//! hands back the inverse patches needed to restore the compiler's values.
//! Resolving the same blob twice therefore yields identical tables.

use crate::error::{NcpError, Result};
use crate::layout::{MemoryClass, MemoryType, MemoryVector};
use crate::view::{write_u32, NcpLayout, NcpView};

/// Where the NCP blob lives once mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcpBase {
    /// Device-visible address of byte 0
    pub daddr: u64,
    /// Host address of byte 0
    pub vaddr: u64,
}

impl NcpBase {
    /// Create a base from device and host addresses
    pub const fn new(daddr: u64, vaddr: u64) -> Self {
        Self { daddr, vaddr }
    }
}

/// Memory-vector tally per resource class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    /// Input feature map entries
    pub ifm: usize,
    /// Output feature map entries
    pub ofm: usize,
    /// Intermediate buffer entries
    pub imb: usize,
    /// Weight, micro-code and mask entries
    pub weight: usize,
    /// Entries with a type the driver does not bind
    pub ignored: usize,
}

impl ClassCounts {
    /// Count for one class
    pub const fn get(&self, class: MemoryClass) -> usize {
        match class {
            MemoryClass::Ifm => self.ifm,
            MemoryClass::Ofm => self.ofm,
            MemoryClass::Imb => self.imb,
            MemoryClass::Weight => self.weight,
        }
    }

    fn bump(&mut self, class: Option<MemoryClass>) -> usize {
        let slot = match class {
            Some(MemoryClass::Ifm) => &mut self.ifm,
            Some(MemoryClass::Ofm) => &mut self.ofm,
            Some(MemoryClass::Imb) => &mut self.imb,
            Some(MemoryClass::Weight) => &mut self.weight,
            None => &mut self.ignored,
        };
        *slot += 1;
        *slot
    }
}

/// Resolved, de-duplicated description of one logical buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// Address-vector index firmware uses to find the buffer
    pub av_index: u32,
    /// Memory-vector type tag
    pub memory_type: MemoryType,
    /// Size in bytes, from the address vector
    pub size: u32,
    /// Host address, zero until bound
    pub vaddr: u64,
    /// Device address, zero until bound
    pub daddr: u64,
    /// Bits per pixel
    pub pixel_format: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channel count
    pub channels: u32,
    /// Row stride (zero until a format is negotiated)
    pub stride: u32,
}

impl AddrInfo {
    fn unbound(mv: &MemoryVector, size: u32) -> Self {
        Self {
            av_index: mv.address_vector_index,
            memory_type: mv.kind(),
            size,
            vaddr: 0,
            daddr: 0,
            pixel_format: mv.pixel_format,
            width: mv.width,
            height: mv.height,
            channels: mv.channels,
            stride: 0,
        }
    }
}

/// One in-place rewrite of a mutable NCP field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch {
    /// Rewrite `base_address` of an address vector
    AddressBase {
        /// Address-vector index
        index: u32,
        /// New base
        value: u32,
    },
    /// Rewrite `stride` of a memory vector
    Stride {
        /// Memory-vector entry number
        entry: u32,
        /// New stride
        value: u32,
    },
}

impl Patch {
    fn offset(self, layout: &NcpLayout) -> Result<usize> {
        let (what, located) = match self {
            Self::AddressBase { index, .. } => ("address vector base", layout.base_offset(index as usize)),
            Self::Stride { entry, .. } => ("memory vector stride", layout.stride_offset(entry as usize)),
        };
        located.ok_or(NcpError::out_of_bounds(what, 0, 4, layout.blob_len))
    }

    const fn with_value(self, value: u32) -> Self {
        match self {
            Self::AddressBase { index, .. } => Self::AddressBase { index, value },
            Self::Stride { entry, .. } => Self::Stride { entry, value },
        }
    }

    const fn value(self) -> u32 {
        match self {
            Self::AddressBase { value, .. } | Self::Stride { value, .. } => value,
        }
    }
}

/// Apply `patches` to `blob` and return the inverse patches, newest first
///
/// All targets are validated before the first write, so a failed call
/// leaves the blob untouched.
///
/// # Errors
///
/// Returns [`NcpError::OutOfBounds`] if `blob` does not match `layout` or a
/// patch names an entry outside its table.
pub fn apply_patches(layout: &NcpLayout, blob: &mut [u8], patches: &[Patch]) -> Result<Vec<Patch>> {
    if blob.len() != layout.blob_len {
        return Err(NcpError::out_of_bounds("NCP blob", 0, layout.blob_len, blob.len()));
    }
    let offsets = patches
        .iter()
        .map(|patch| patch.offset(layout))
        .collect::<Result<Vec<_>>>()?;

    let mut inverse = Vec::with_capacity(patches.len());
    for (patch, at) in patches.iter().zip(offsets) {
        let previous = crate::view::read_u32(blob, "patch target", at)?;
        write_u32(blob, "patch target", at, patch.value())?;
        inverse.push(patch.with_value(previous));
    }
    inverse.reverse();
    Ok(inverse)
}

/// Output of the classification pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNcp {
    /// Validated table placement
    pub layout: NcpLayout,
    /// Pass-1 tallies
    pub counts: ClassCounts,
    /// Unique input feature maps
    pub ifm: Vec<AddrInfo>,
    /// Unique output feature maps
    pub ofm: Vec<AddrInfo>,
    /// Unique intermediate buffers
    pub imb: Vec<AddrInfo>,
    /// Weight regions, one per memory vector
    pub weights: Vec<AddrInfo>,
    /// Rewrites to apply to the blob (weight bases, feature-map strides)
    pub patches: Vec<Patch>,
}

impl ResolvedNcp {
    /// Entries in one per-slot I/O table (inputs then outputs)
    pub fn io_vector_count(&self) -> usize {
        self.ifm.len() + self.ofm.len()
    }

    /// Resolved table for one class
    pub fn class(&self, class: MemoryClass) -> &[AddrInfo] {
        match class {
            MemoryClass::Ifm => &self.ifm,
            MemoryClass::Ofm => &self.ofm,
            MemoryClass::Imb => &self.imb,
            MemoryClass::Weight => &self.weights,
        }
    }

    /// Apply [`Self::patches`] to the blob this was resolved from
    ///
    /// # Errors
    ///
    /// See [`apply_patches`].
    pub fn apply(&self, blob: &mut [u8]) -> Result<Vec<Patch>> {
        apply_patches(&self.layout, blob, &self.patches)
    }
}

/// Pass 1: tally memory vectors per class
///
/// # Errors
///
/// Returns [`NcpError::OutOfBounds`] if the memory-vector table runs past the blob.
pub fn count_classes(view: &NcpView<'_>) -> Result<ClassCounts> {
    let mut counts = ClassCounts::default();
    for mv in view.memory_vectors()?.iter() {
        counts.bump(mv.kind().class());
    }
    tracing::debug!(
        "NCP pass 1: IFM {} OFM {} IMB {} WGT {} (ignored {})",
        counts.ifm, counts.ofm, counts.imb, counts.weight, counts.ignored
    );
    Ok(counts)
}

/// Pass 1 and pass 2 over `blob`, mapped at `base`
///
/// # Errors
///
/// Any [`NcpError`]: out-of-bounds tables, an address-vector index past the
/// table, a weight region outside the blob, a rewritten address that does not
/// fit 32 bits, or a class count that changed between passes.
pub fn resolve(blob: &[u8], base: NcpBase) -> Result<ResolvedNcp> {
    let view = NcpView::new(blob)?;
    let layout = view.layout()?;
    let header = view.header();
    if header.address_vector_count > header.memory_vector_count {
        return Err(NcpError::VectorCount {
            address_vectors: header.address_vector_count,
            memory_vectors: header.memory_vector_count,
        });
    }

    let counts = count_classes(&view)?;
    let memory_vectors = view.memory_vectors()?;
    let address_vectors = view.address_vectors()?;

    let mut resolved = ResolvedNcp {
        layout,
        counts,
        ifm: Vec::with_capacity(counts.ifm),
        ofm: Vec::with_capacity(counts.ofm),
        imb: Vec::with_capacity(counts.imb),
        weights: Vec::with_capacity(counts.weight),
        patches: Vec::with_capacity(counts.weight),
    };
    let mut consumed = ClassCounts::default();

    for (entry, mv) in memory_vectors.iter().enumerate() {
        let class = mv.kind().class();
        let seen = consumed.bump(class);
        let Some(class) = class else {
            tracing::trace!("mv[{entry}]: type {} not bound", mv.memory_type);
            continue;
        };
        if seen > counts.get(class) {
            return Err(NcpError::ClassMismatch {
                class,
                counted: counts.get(class),
                classified: seen,
            });
        }

        let index = mv.address_vector_index;
        let av = address_vectors
            .get(index as usize)
            .ok_or(NcpError::AddressIndex {
                entry,
                index,
                count: header.address_vector_count,
            })?;

        if class == MemoryClass::Weight {
            let offset = av.base_address;
            if u64::from(offset) + u64::from(av.size) > blob.len() as u64 {
                return Err(NcpError::WeightBounds {
                    index,
                    offset,
                    size: av.size,
                    blob_len: blob.len(),
                });
            }
            let daddr = base.daddr.saturating_add(u64::from(offset));
            let rewritten = u32::try_from(daddr).map_err(|_| NcpError::AddressOverflow { daddr })?;
            resolved.patches.push(Patch::AddressBase {
                index,
                value: rewritten,
            });

            let mut info = AddrInfo::unbound(&mv, av.size);
            info.daddr = daddr;
            info.vaddr = base.vaddr.wrapping_add(u64::from(offset));
            tracing::trace!("mv[{entry}]: {class} av {index} offset {offset:#x} -> {daddr:#x}");
            resolved.weights.push(info);
            continue;
        }

        let table = match class {
            MemoryClass::Ifm => &mut resolved.ifm,
            MemoryClass::Ofm => &mut resolved.ofm,
            _ => &mut resolved.imb,
        };
        if table.iter().any(|known| known.av_index == index) {
            tracing::trace!("mv[{entry}]: {class} av {index} already resolved");
            continue;
        }
        if mv.stride != 0 {
            resolved.patches.push(Patch::Stride {
                entry: u32::try_from(entry).map_err(|_| NcpError::build("memory vector entry overflow"))?,
                value: 0,
            });
        }
        tracing::trace!("mv[{entry}]: {class} av {index} size {}", av.size);
        table.push(AddrInfo::unbound(&mv, av.size));
    }

    for class in [MemoryClass::Ifm, MemoryClass::Ofm, MemoryClass::Imb, MemoryClass::Weight] {
        if consumed.get(class) != counts.get(class) {
            return Err(NcpError::ClassMismatch {
                class,
                counted: counts.get(class),
                classified: consumed.get(class),
            });
        }
    }

    tracing::debug!(
        "NCP pass 2: IFM {} OFM {} IMB {} WGT {} unique, {} patches",
        resolved.ifm.len(),
        resolved.ofm.len(),
        resolved.imb.len(),
        resolved.weights.len(),
        resolved.patches.len()
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::NcpBuilder;
    use crate::layout::MemoryType;
    use crate::view::read_u32;

    const BASE: NcpBase = NcpBase::new(0x1000_0000, 0x7f00_0000_0000);

    fn reference_blob() -> Vec<u8> {
        NcpBuilder::new(2048)
            .feature_map(MemoryType::InputFeatureMap, 1024)
            .feature_map(MemoryType::OutputFeatureMap, 512)
            .weight(64, 256)
            .build()
            .unwrap()
    }

    #[test]
    fn reference_network_resolves() {
        let blob = reference_blob();
        let resolved = resolve(&blob, BASE).unwrap();

        assert_eq!(resolved.counts.ifm, 1);
        assert_eq!(resolved.counts.ofm, 1);
        assert_eq!(resolved.counts.imb, 0);
        assert_eq!(resolved.counts.weight, 1);
        assert_eq!(resolved.io_vector_count(), 2);

        assert_eq!(resolved.ifm[0].av_index, 0);
        assert_eq!(resolved.ifm[0].size, 1024);
        assert_eq!(resolved.ofm[0].av_index, 1);
        assert_eq!(resolved.ofm[0].size, 512);

        let weight = &resolved.weights[0];
        assert_eq!(weight.daddr, BASE.daddr + 64);
        assert_eq!(weight.vaddr, BASE.vaddr + 64);
        assert_eq!(weight.size, 256);
        assert_eq!(weight.memory_type, MemoryType::Weight);
    }

    #[test]
    fn resolution_is_idempotent() {
        let blob = reference_blob();
        let first = resolve(&blob, BASE).unwrap();
        let second = resolve(&blob, BASE).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn address_index_past_table_is_fatal() {
        let blob = NcpBuilder::new(2048)
            .feature_map(MemoryType::InputFeatureMap, 1024)
            .feature_map(MemoryType::OutputFeatureMap, 512)
            .weight(64, 256)
            .address_vector(0, 16)
            .memory_vector(MemoryType::InputFeatureMap, 7)
            .build()
            .unwrap();

        let err = resolve(&blob, BASE).unwrap_err();
        assert!(matches!(
            err,
            NcpError::AddressIndex {
                index: 7,
                count: 4,
                ..
            }
        ));
    }

    #[test]
    fn weight_past_blob_is_fatal() {
        let blob = NcpBuilder::new(1024).weight(900, 256).build().unwrap();
        assert!(matches!(
            resolve(&blob, BASE),
            Err(NcpError::WeightBounds {
                offset: 900,
                size: 256,
                ..
            })
        ));
    }

    #[test]
    fn weight_filling_blob_exactly_is_accepted() {
        let blob = NcpBuilder::new(1024).weight(768, 256).build().unwrap();
        let resolved = resolve(&blob, BASE).unwrap();
        assert_eq!(resolved.weights[0].daddr, BASE.daddr + 768);
    }

    #[test]
    fn more_address_than_memory_vectors_is_fatal() {
        let blob = NcpBuilder::new(1024)
            .feature_map(MemoryType::InputFeatureMap, 64)
            .address_vector(0, 64)
            .build()
            .unwrap();
        assert!(matches!(
            resolve(&blob, BASE),
            Err(NcpError::VectorCount {
                address_vectors: 2,
                memory_vectors: 1
            })
        ));
    }

    #[test]
    fn feature_maps_deduplicate_by_address_index() {
        let blob = NcpBuilder::new(2048)
            .feature_map(MemoryType::InputFeatureMap, 256)
            .memory_vector(MemoryType::InputFeatureMap, 0)
            .feature_map(MemoryType::IntermediateFeatureMap, 128)
            .memory_vector(MemoryType::IntermediateFeatureMap, 1)
            .build()
            .unwrap();

        let resolved = resolve(&blob, BASE).unwrap();
        assert_eq!(resolved.counts.ifm, 2);
        assert_eq!(resolved.ifm.len(), 1);
        assert_eq!(resolved.counts.imb, 2);
        assert_eq!(resolved.imb.len(), 1);
        assert_eq!(resolved.imb[0].size, 128);
    }

    #[test]
    fn unknown_types_are_ignored() {
        let blob = NcpBuilder::new(1024)
            .feature_map(MemoryType::InputFeatureMap, 64)
            .feature_map(MemoryType::Other(9), 64)
            .build()
            .unwrap();
        let resolved = resolve(&blob, BASE).unwrap();
        assert_eq!(resolved.counts.ignored, 1);
        assert_eq!(resolved.ifm.len(), 1);
    }

    #[test]
    fn weight_rewrite_overflowing_32_bits_is_fatal() {
        let blob = NcpBuilder::new(1024).weight(64, 64).build().unwrap();
        assert!(matches!(
            resolve(&blob, NcpBase::new(0xffff_fff0, 0)),
            Err(NcpError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn apply_rewrites_weights_and_inverse_restores() {
        let mut blob = reference_blob();
        let pristine = blob.clone();
        let resolved = resolve(&blob, BASE).unwrap();
        let inverse = resolved.apply(&mut blob).unwrap();

        let at = resolved.layout.base_offset(2).unwrap();
        assert_eq!(read_u32(&blob, "wgt", at).unwrap(), 0x1000_0000 + 64);

        apply_patches(&resolved.layout, &mut blob, &inverse).unwrap();
        assert_eq!(blob, pristine);
    }

    #[test]
    fn apply_rejects_foreign_blob_without_writing() {
        let blob = reference_blob();
        let resolved = resolve(&blob, BASE).unwrap();
        let mut other = vec![0u8; 16];
        assert!(resolved.apply(&mut other).is_err());
        assert_eq!(other, vec![0u8; 16]);
    }

    #[test]
    fn strides_reset_until_format_negotiated() {
        let blob = NcpBuilder::new(1024)
            .feature_map_with_stride(MemoryType::InputFeatureMap, 64, 16)
            .build()
            .unwrap();
        let resolved = resolve(&blob, BASE).unwrap();
        assert_eq!(resolved.ifm[0].stride, 0);
        assert_eq!(resolved.patches, vec![Patch::Stride { entry: 0, value: 0 }]);
    }
}
