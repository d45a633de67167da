// SPDX-License-Identifier: AGPL-3.0-only

//! Session lifecycle.
//!
//! A [`Session`] owns one loaded network and every device resource it needs.
//! Setup walks [`Stage`] in order. Each acquired resource pushes a
//! [`Rollback`] onto the undo chain under the stage it belongs to, so a
//! failure at any point unwinds exactly what was acquired, newest first.
//!
//! ```text
//! open ──► set_graph ──► set_format(in) ──► set_format(out) ──► start ⇄ stop
//!   │         │ map, resolve, slots, I/O tables, IMBs, LOAD            │
//!   └─────────┴──────────────── close (unwind everything) ◄────────────┘
//! ```

mod graph;
mod stream;

use crate::device::DeviceContext;
use crate::error::Result;
use crate::frame::{BufState, Dequeued, Direction, FmSlot};
use crate::memory::DmaBuffer;
use crate::params::Param;
use crate::protocol::{FrameDone, FrameSink, NetworkCommand, SessionId};
use crate::state::{Progress, Stage, UndoChain};
use npu_ncp::{apply_patches, IoVector, NcpLayout, Patch, ResolvedNcp};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

/// Teardown step recorded as a resource is acquired
#[derive(Debug)]
enum Rollback {
    /// Give the session id back to the registry
    Unregister,
    /// Drop the NCP mapping
    Unmap,
    /// Write back NCP fields rewritten in place
    Restore {
        layout: NcpLayout,
        patches: Vec<Patch>,
    },
    /// Forget the resolved tables
    Forget,
    /// Drop the per-slot bindings
    DropSlots,
    /// Free the per-slot I/O tables
    FreeIoTables,
    /// Free the intermediate buffers
    FreeImbs,
    /// Ask firmware to drop the network
    Unload,
}

/// Completed frames not yet dequeued, per direction
///
/// Requeueing a slot drops whatever it still holds here, so each queue
/// holds at most one entry per slot.
#[derive(Debug, Default)]
struct Completed {
    input: VecDeque<Dequeued>,
    output: VecDeque<Dequeued>,
}

impl Completed {
    fn queue(&mut self, direction: Direction) -> &mut VecDeque<Dequeued> {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    fn len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Input => self.input.len(),
            Direction::Output => self.output.len(),
        }
    }

    fn holds(&self, direction: Direction, index: usize) -> bool {
        let queue = match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        };
        queue.iter().any(|done| done.set.index == index)
    }

    fn forget(&mut self, index: usize) {
        self.input.retain(|done| done.set.index != index);
        self.output.retain(|done| done.set.index != index);
    }

    fn push(&mut self, done: FrameDone) {
        self.input.push_back(Dequeued {
            set: done.input,
            result: done.result,
        });
        self.output.push_back(Dequeued {
            set: done.output,
            result: done.result,
        });
    }

    fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}

/// One loaded network and its resources
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    ctx: Arc<DeviceContext>,
    progress: Progress,
    undo: UndoChain<Rollback>,
    ncp: Option<DmaBuffer>,
    resolved: Option<ResolvedNcp>,
    slots: Vec<FmSlot>,
    io_tables: Vec<DmaBuffer>,
    imbs: Vec<DmaBuffer>,
    loaded: bool,
    streaming: bool,
    sink: FrameSink,
    completions: Receiver<FrameDone>,
    completed: Completed,
    closed: bool,
}

impl Session {
    pub(crate) fn open(ctx: Arc<DeviceContext>) -> Result<Self> {
        let id = ctx.registry.acquire()?;
        let (sink, completions) = mpsc::channel();
        let mut session = Self {
            id,
            ctx,
            progress: Progress::default(),
            undo: UndoChain::new(),
            ncp: None,
            resolved: None,
            slots: Vec::new(),
            io_tables: Vec::new(),
            imbs: Vec::new(),
            loaded: false,
            streaming: false,
            sink,
            completions,
            completed: Completed::default(),
            closed: false,
        };
        session.progress.advance(Stage::Open)?;
        session.undo.push(Stage::Registered, Rollback::Unregister);
        session.progress.advance(Stage::Registered)?;
        tracing::info!(session = %id, "Session opened");
        Ok(session)
    }

    /// Registry id
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Setup progress
    pub const fn progress(&self) -> Progress {
        self.progress
    }

    /// Whether STREAMON succeeded and no stop followed
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether [`Self::close`] has run
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether firmware holds the network
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Resolved tables, once a graph is set
    pub const fn resolved(&self) -> Option<&ResolvedNcp> {
        self.resolved.as_ref()
    }

    /// Device address of the mapped NCP
    pub fn ncp_daddr(&self) -> Option<u64> {
        self.ncp.as_ref().map(DmaBuffer::daddr)
    }

    /// Device addresses of the intermediate buffers
    pub fn imb_daddrs(&self) -> Vec<u64> {
        self.imbs.iter().map(DmaBuffer::daddr).collect()
    }

    /// Number of I/O slots set up
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Binding state of one slot side
    pub fn slot_state(&self, direction: Direction, index: usize) -> Option<BufState> {
        self.slots.get(index).map(|slot| slot.side(direction).state)
    }

    /// Current contents of a slot's I/O table
    pub fn io_vectors(&self, index: usize) -> Option<Vec<IoVector>> {
        self.io_tables.get(index).map(|table| {
            table.read(|bytes| {
                bytes
                    .chunks_exact(IoVector::SIZE)
                    .map(bytemuck::pod_read_unaligned)
                    .collect()
            })
        })
    }

    /// Completed sets of `direction` waiting to be dequeued
    pub fn completed(&self, direction: Direction) -> usize {
        self.completed.len(direction)
    }

    /// Pending rollback actions
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Dispatch parameters through the device's handler chain
    ///
    /// # Errors
    ///
    /// [`crate::NpuError::ParamsRejected`] listing every target that failed or
    /// had no handler.
    pub fn set_params(&self, params: &[Param]) -> Result<()> {
        self.ctx.params.dispatch(self.id, params)
    }

    /// Tear the session down
    ///
    /// In emergency mode the STREAMOFF/UNLOAD handshake is skipped and only
    /// CLEAR_CB is posted. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// None today; teardown problems are logged and the unwind continues.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.ctx.dispatcher.emergency().is_raised() {
            tracing::warn!(session = %self.id, "Emergency close, skipping STREAMOFF/UNLOAD handshake");
        } else if self.is_streaming() {
            if let Err(e) = self.stop() {
                tracing::warn!(session = %self.id, "STREAMOFF during close failed: {e}");
            }
        }
        self.streaming = false;

        if let Err(e) = self.progress.advance(Stage::Closed) {
            tracing::warn!(session = %self.id, "{e}");
        }
        self.unwind(None);
        self.ctx.qos.clear(self.id);
        self.closed = true;
        tracing::info!(session = %self.id, "Session closed");
        Ok(())
    }

    /// Pop and run rollback actions until only `target` and below remain
    fn unwind(&mut self, target: Option<Stage>) {
        tracing::debug!(session = %self.id, "Unwinding to {target:?} ({} actions)", self.undo.len());
        while let Some((stage, action)) = self.undo.pop_above(target) {
            tracing::trace!(session = %self.id, "Undo {action:?} ({stage:?})");
            self.rollback(action);
        }
        self.progress.clear_above(target);
        if target.map_or(true, |stage| stage < Stage::FormatOutSet) {
            self.completed.clear();
            while self.completions.try_recv().is_ok() {}
        }
    }

    fn rollback(&mut self, action: Rollback) {
        match action {
            Rollback::Unregister => self.ctx.registry.release(self.id),
            Rollback::Unmap => {
                if let Some(ncp) = self.ncp.take() {
                    tracing::debug!(session = %self.id, "Unmapped NCP at daddr={:#x}", ncp.daddr());
                }
            }
            Rollback::Restore { layout, patches } => {
                if let Some(ncp) = &self.ncp {
                    if let Err(e) = ncp.write(|blob| apply_patches(&layout, blob, &patches)) {
                        tracing::warn!(session = %self.id, "Failed to restore {} NCP fields: {e}", patches.len());
                    }
                }
            }
            Rollback::Forget => self.resolved = None,
            Rollback::DropSlots => self.slots.clear(),
            Rollback::FreeIoTables => {
                tracing::debug!(session = %self.id, "Freeing {} I/O tables", self.io_tables.len());
                self.io_tables.clear();
            }
            Rollback::FreeImbs => {
                tracing::debug!(session = %self.id, "Freeing {} intermediate buffers", self.imbs.len());
                self.imbs.clear();
            }
            Rollback::Unload => self.unload(),
        }
    }

    /// UNLOAD and wait for firmware; CLEAR_CB when UNLOAD cannot be used
    fn unload(&mut self) {
        if !self.ctx.dispatcher.emergency().is_raised() {
            match self
                .ctx
                .dispatcher
                .call(Some(self.id), NetworkCommand::Unload, None, 0)
            {
                Ok(()) => {
                    self.loaded = false;
                    return;
                }
                Err(e) => tracing::error!(session = %self.id, "UNLOAD failed: {e}"),
            }
        }
        match self.ctx.dispatcher.post(Some(self.id), NetworkCommand::ClearCb) {
            Ok(_) => self.loaded = false,
            Err(e) => tracing::error!(session = %self.id, "Failed to post CLEAR_CB: {e}"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::error!(session = %self.id, "Close on drop failed: {e}");
            }
        }
    }
}
