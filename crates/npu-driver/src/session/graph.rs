// SPDX-License-Identifier: AGPL-3.0-only

//! Graph setup and format negotiation.

use super::{Rollback, Session};
use crate::error::{NpuError, Result};
use crate::frame::{Direction, FmSlot, Layout};
use crate::memory::{DmaBuffer, NcpHandle};
use crate::protocol::{NcpRef, NetworkCommand};
use crate::state::Stage;
use npu_ncp::{apply_patches, IoVector, MemoryClass, NcpBase, NcpError, NcpView, Patch};

impl Session {
    /// Map, resolve and load a compiled network
    ///
    /// Stages run in order: map the blob, rewrite weight addresses, create
    /// per-slot tables, allocate per-slot I/O tables, allocate intermediate
    /// buffers and patch their addresses in, then LOAD. Every buffer firmware
    /// reads is synced before LOAD is sent.
    ///
    /// # Errors
    ///
    /// - [`NpuError::Ordering`] before `open` completed or after close
    /// - [`NpuError::InvalidArgument`] if a graph is already set
    /// - [`NpuError::Format`] if the blob is malformed; nothing is allocated
    /// - resource errors from the allocator
    /// - [`NpuError::Protocol`] if firmware rejects LOAD
    ///
    /// On any error after the ordering checks the session is unwound back to
    /// its freshly-opened state.
    pub fn set_graph(&mut self, handle: &NcpHandle) -> Result<()> {
        self.progress.require("set_graph", Stage::Registered)?;
        if self.progress.reached(Stage::NcpMapped) {
            return Err(NpuError::invalid_argument(format!("session {} already has a graph", self.id)));
        }

        match self.build_graph(handle) {
            Ok(()) => {
                tracing::info!(
                    session = %self.id,
                    "Graph loaded: {} I/O slots, {} IMBs, undo depth {}",
                    self.slots.len(),
                    self.imbs.len(),
                    self.undo.len()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.id, "set_graph failed: {e}");
                self.unwind(Some(Stage::Registered));
                Err(e)
            }
        }
    }

    fn build_graph(&mut self, handle: &NcpHandle) -> Result<()> {
        self.map_ncp(handle)?;
        self.rewrite_weights()?;
        self.create_slots()?;
        self.alloc_io_tables()?;
        self.alloc_imbs()?;
        self.load()
    }

    fn map_ncp(&mut self, handle: &NcpHandle) -> Result<()> {
        let ncp = self.ctx.memory.map(handle)?;
        tracing::debug!(session = %self.id, "NCP mapped: daddr={:#x}, {} bytes", ncp.daddr(), ncp.size());
        self.ncp = Some(ncp);
        self.undo.push(Stage::NcpMapped, Rollback::Unmap);
        self.progress.advance(Stage::NcpMapped)
    }

    fn rewrite_weights(&mut self) -> Result<()> {
        let ncp = mapped(self.ncp.as_ref())?;
        let base = NcpBase::new(ncp.daddr(), ncp.vaddr());
        let resolved = ncp.read(|blob| npu_ncp::resolve(blob, base))?;
        let layout = resolved.layout;

        let resolved = self.resolved.insert(resolved);
        self.undo.push(Stage::WeightTableAllocated, Rollback::Forget);

        let patches = ncp.write(|blob| resolved.apply(blob))?;
        tracing::debug!(
            session = %self.id,
            "Rewrote {} NCP fields for {} weight regions",
            patches.len(),
            resolved.weights.len()
        );
        self.undo.push(Stage::WeightTableAllocated, Rollback::Restore { layout, patches });

        self.ctx.memory.sync_for_device(ncp, 0, ncp.size())?;
        self.progress.advance(Stage::WeightTableAllocated)
    }

    fn create_slots(&mut self) -> Result<()> {
        let resolved = self
            .resolved
            .as_ref()
            .ok_or(NpuError::ordering("create slots", Stage::WeightTableAllocated))?;
        self.undo.push(Stage::IoTableAllocated, Rollback::DropSlots);
        self.slots = (0..self.ctx.config.io_slots)
            .map(|_| FmSlot::new(&resolved.ifm, &resolved.ofm))
            .collect();
        self.progress.advance(Stage::IoTableAllocated)
    }

    fn alloc_io_tables(&mut self) -> Result<()> {
        let resolved = self
            .resolved
            .as_ref()
            .ok_or(NpuError::ordering("allocate I/O tables", Stage::WeightTableAllocated))?;
        let vectors: Vec<IoVector> = resolved
            .ifm
            .iter()
            .chain(&resolved.ofm)
            .map(|info| IoVector {
                index: info.av_index,
                base_address: 0,
                size: info.size,
            })
            .collect();
        let bytes = vectors.len() * IoVector::SIZE;

        self.undo.push(Stage::IoBuffersAllocated, Rollback::FreeIoTables);
        for slot in 0..self.ctx.config.io_slots {
            let table = self.ctx.memory.alloc(bytes)?;
            write_vectors(&table, &vectors)?;
            tracing::trace!(session = %self.id, "I/O table {slot} at daddr={:#x}", table.daddr());
            self.io_tables.push(table);
        }
        tracing::debug!(
            session = %self.id,
            "Allocated {} I/O tables of {} entries",
            self.io_tables.len(),
            vectors.len()
        );
        self.progress.advance(Stage::IoBuffersAllocated)
    }

    fn alloc_imbs(&mut self) -> Result<()> {
        let ncp = mapped(self.ncp.as_ref())?;
        let resolved = self
            .resolved
            .as_mut()
            .ok_or(NpuError::ordering("allocate intermediate buffers", Stage::WeightTableAllocated))?;
        let layout = resolved.layout;

        self.undo.push(Stage::ImbBuffersAllocated, Rollback::FreeImbs);
        let mut patches = Vec::with_capacity(resolved.imb.len());
        for info in &mut resolved.imb {
            let buffer = self.ctx.memory.alloc(info.size as usize)?;
            let daddr = buffer.daddr();
            let base = u32::try_from(daddr).map_err(|_| NpuError::AddressOverflow { daddr })?;
            info.daddr = daddr;
            info.vaddr = buffer.vaddr();
            patches.push(Patch::AddressBase {
                index: info.av_index,
                value: base,
            });
            tracing::trace!(session = %self.id, "IMB av {} at daddr={daddr:#x}, {} bytes", info.av_index, info.size);
            self.imbs.push(buffer);
        }

        let inverse = ncp.write(|blob| apply_patches(&layout, blob, &patches))?;
        self.undo.push(Stage::ImbBuffersAllocated, Rollback::Restore { layout, patches: inverse });

        self.ctx.memory.sync_for_device(ncp, 0, ncp.size())?;
        for imb in &self.imbs {
            self.ctx.memory.sync_for_device(imb, 0, imb.size())?;
        }
        self.progress.advance(Stage::ImbBuffersAllocated)
    }

    fn load(&mut self) -> Result<()> {
        let ncp = mapped(self.ncp.as_ref())?;
        let ncp = NcpRef {
            daddr: ncp.daddr(),
            size: ncp.size(),
        };
        self.ctx
            .dispatcher
            .call(Some(self.id), NetworkCommand::Load, Some(ncp), 0)?;
        self.loaded = true;
        self.undo.push(Stage::ImbBuffersAllocated, Rollback::Unload);
        Ok(())
    }

    /// Negotiate the per-buffer layout of one direction
    ///
    /// Input must be set before output. Each layout must be able to hold the
    /// resolved buffer it describes, and its stride is written into every
    /// memory vector of that buffer. Setting a direction again replaces the
    /// earlier layout and, for input, drops the output layout.
    ///
    /// # Errors
    ///
    /// - [`NpuError::Ordering`] before `set_graph` (input) or before the input
    ///   layout (output)
    /// - [`NpuError::InvalidArgument`] while streaming, on a count mismatch
    ///   or a layout too small for its buffer
    ///
    /// Errors other than ordering and streaming checks unwind the session to
    /// its freshly-opened state.
    pub fn set_format(&mut self, direction: Direction, layouts: &[Layout]) -> Result<()> {
        let (required, stage) = match direction {
            Direction::Input => (Stage::ImbBuffersAllocated, Stage::FormatInSet),
            Direction::Output => (Stage::FormatInSet, Stage::FormatOutSet),
        };
        self.progress.require("set_format", required)?;
        if self.is_streaming() {
            return Err(NpuError::invalid_argument("format cannot change while streaming"));
        }
        if self.progress.reached(stage) {
            tracing::debug!(session = %self.id, "Replacing {direction} format");
            self.unwind(Some(required));
        }

        match self.apply_format(direction, stage, layouts) {
            Ok(()) => {
                self.progress.advance(stage)?;
                tracing::info!(session = %self.id, "{direction} format set for {} buffers", layouts.len());
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.id, "set_format({direction}) failed: {e}");
                self.unwind(Some(Stage::Registered));
                Err(e)
            }
        }
    }

    fn apply_format(&mut self, direction: Direction, stage: Stage, layouts: &[Layout]) -> Result<()> {
        let ncp = mapped(self.ncp.as_ref())?;
        let resolved = self
            .resolved
            .as_mut()
            .ok_or(NpuError::ordering("set_format", Stage::WeightTableAllocated))?;
        let layout = resolved.layout;
        let (class, infos) = match direction {
            Direction::Input => (MemoryClass::Ifm, &mut resolved.ifm),
            Direction::Output => (MemoryClass::Ofm, &mut resolved.ofm),
        };

        if layouts.len() != infos.len() {
            return Err(NpuError::invalid_argument(format!(
                "{direction} format has {} layouts, network has {} {class} buffers",
                layouts.len(),
                infos.len()
            )));
        }
        for (format, info) in layouts.iter().zip(infos.iter()) {
            format.check_fits(info)?;
        }

        let strides: Vec<(u32, u32)> = infos
            .iter()
            .zip(layouts)
            .map(|(info, format)| (info.av_index, format.stride))
            .collect();
        let patches = ncp.read(|blob| stride_patches(blob, class, &strides))?;
        let inverse = ncp.write(|blob| apply_patches(&layout, blob, &patches))?;
        self.undo.push(stage, Rollback::Restore { layout, patches: inverse });
        tracing::trace!(session = %self.id, "{} {class} stride fields rewritten", patches.len());

        for (info, format) in infos.iter_mut().zip(layouts) {
            info.stride = format.stride;
        }
        for slot in &mut self.slots {
            for (info, format) in slot.side_mut(direction).maps.iter_mut().zip(layouts) {
                info.stride = format.stride;
            }
        }
        self.ctx.memory.sync_for_device(ncp, 0, ncp.size())
    }
}

fn mapped(ncp: Option<&DmaBuffer>) -> Result<&DmaBuffer> {
    ncp.ok_or(NpuError::ordering("graph setup", Stage::NcpMapped))
}

/// Stride rewrites for every memory vector of `class` naming one of `strides`' buffers
fn stride_patches(blob: &[u8], class: MemoryClass, strides: &[(u32, u32)]) -> npu_ncp::Result<Vec<Patch>> {
    let view = NcpView::new(blob)?;
    let mut patches = Vec::new();
    for (entry, mv) in view.memory_vectors()?.iter().enumerate() {
        if mv.kind().class() != Some(class) {
            continue;
        }
        let Some(&(_, stride)) = strides.iter().find(|(av, _)| *av == mv.address_vector_index) else {
            continue;
        };
        let entry = u32::try_from(entry).map_err(|_| NcpError::build("memory vector entry overflow"))?;
        patches.push(Patch::Stride { entry, value: stride });
    }
    Ok(patches)
}

/// Copy `vectors` into an I/O table
pub(super) fn write_vectors(table: &DmaBuffer, vectors: &[IoVector]) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(vectors);
    if bytes.len() != table.size() {
        return Err(NpuError::invalid_argument(format!(
            "I/O table holds {} bytes, {} entries need {}",
            table.size(),
            vectors.len(),
            bytes.len()
        )));
    }
    table.write(|dst| dst.copy_from_slice(bytes));
    Ok(())
}
