// SPDX-License-Identifier: AGPL-3.0-only

//! Buffer binding, frame queueing and streaming control.

use super::graph::write_vectors;
use super::Session;
use crate::error::{NpuError, Result};
use crate::frame::{BufState, BufferSet, Dequeued, Direction, SlotSide};
use crate::protocol::{FrameDone, FrameRequest, NetworkCommand, ResultCode};
use crate::state::Stage;
use npu_ncp::IoVector;
use std::sync::mpsc::RecvTimeoutError;

impl Session {
    /// Bind caller buffers into one slot side
    ///
    /// # Errors
    ///
    /// [`NpuError::Ordering`] before `set_graph`, [`NpuError::InvalidArgument`]
    /// for an unknown slot or a set that does not match the network, and
    /// [`NpuError::BufferState`] while the side is queued.
    pub fn prepare(&mut self, set: &BufferSet) -> Result<()> {
        self.progress.require("prepare", Stage::IoTableAllocated)?;
        self.side_mut(set)?.prepare(set)?;
        tracing::trace!(session = %self.id, "Prepared {} slot {}", set.direction, set.index);
        Ok(())
    }

    /// Drop the binding of one slot side
    ///
    /// # Errors
    ///
    /// As [`Self::prepare`].
    pub fn unprepare(&mut self, set: &BufferSet) -> Result<()> {
        self.progress.require("unprepare", Stage::IoTableAllocated)?;
        self.side_mut(set)?.unprepare(set)?;
        tracing::trace!(session = %self.id, "Unprepared {} slot {}", set.direction, set.index);
        Ok(())
    }

    /// Hand one frame to firmware
    ///
    /// Both sets must name the same slot, and both sides of that slot must
    /// be prepared or dequeued. Once one side of a finished frame has been
    /// dequeued, the other side may be requeued without dequeueing it; its
    /// completed set is discarded. On any error the slot is unchanged.
    ///
    /// # Errors
    ///
    /// - [`NpuError::Ordering`] before the output format is set
    /// - [`NpuError::InvalidArgument`] for mismatched sets
    /// - [`NpuError::BufferState`] if a side is unprepared or already queued
    /// - [`NpuError::AddressOverflow`] if a buffer lies above 4 GiB
    /// - [`NpuError::Emergency`], [`NpuError::WorkerStopped`] or
    ///   [`NpuError::QueueFull`] from the dispatcher
    pub fn queue(&mut self, input: &BufferSet, output: &BufferSet) -> Result<()> {
        self.progress.require("queue", Stage::FormatOutSet)?;
        if input.direction != Direction::Input || output.direction != Direction::Output {
            return Err(NpuError::invalid_argument("queue takes an input set and an output set"));
        }
        if input.index != output.index {
            return Err(NpuError::invalid_argument(format!(
                "input slot {} and output slot {} differ",
                input.index, output.index
            )));
        }
        let index = input.index;
        while let Ok(done) = self.completions.try_recv() {
            self.accept(done);
        }
        let slot = self.slots.get(index).ok_or_else(|| out_of_range(index, self.slots.len()))?;
        let consumed = slot.input.queueable() || slot.output.queueable();
        for (side, set) in [(&slot.input, input), (&slot.output, output)] {
            if !side.queueable() && !(consumed && self.completed.holds(set.direction, index)) {
                return Err(NpuError::BufferState {
                    operation: "queue",
                    direction: set.direction,
                    index,
                    state: side.state,
                });
            }
        }

        let mut staged = slot.clone();
        for side in [&mut staged.input, &mut staged.output] {
            if side.state == BufState::Queued {
                side.state = BufState::Dequeued;
            }
        }
        staged.input.prepare(input)?;
        staged.output.prepare(output)?;

        let vectors = staged
            .input
            .maps
            .iter()
            .chain(&staged.output.maps)
            .map(|info| {
                let daddr = info.daddr;
                Ok(IoVector {
                    index: info.av_index,
                    base_address: u32::try_from(daddr).map_err(|_| NpuError::AddressOverflow { daddr })?,
                    size: info.size,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let table = self.io_tables.get(index).ok_or_else(|| out_of_range(index, self.io_tables.len()))?;
        write_vectors(table, &vectors)?;
        self.ctx.memory.sync_for_device(table, 0, table.size())?;

        let vector_count = u32::try_from(vectors.len())
            .map_err(|_| NpuError::invalid_argument(format!("{} I/O vectors", vectors.len())))?;
        let request_id = self.ctx.dispatcher.next_request_id();
        self.ctx.dispatcher.submit_frame(FrameRequest {
            session_id: self.id,
            request_id,
            frame_id: input.frame_id,
            slot: index,
            io_table_daddr: table.daddr(),
            vector_count,
            input: input.clone(),
            output: output.clone(),
            reply: Some(self.sink.clone()),
            result: ResultCode::PENDING,
        })?;

        staged.input.state = BufState::Queued;
        staged.output.state = BufState::Queued;
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = staged;
        }
        self.completed.forget(index);
        tracing::trace!(session = %self.id, "Queued frame {} in slot {index} (#{request_id})", input.frame_id);
        Ok(())
    }

    /// Return the next completed buffer set of `direction`
    ///
    /// Frames complete in submission order. The returned slot side moves to
    /// dequeued and may be queued again.
    ///
    /// # Errors
    ///
    /// - [`NpuError::Ordering`] before the output format is set
    /// - [`NpuError::InvalidArgument`] if nothing of `direction` is queued
    /// - [`NpuError::Emergency`] if the device failed with frames in flight
    /// - [`NpuError::DequeueTimeout`] if no frame completes in time
    pub fn dequeue(&mut self, direction: Direction) -> Result<Dequeued> {
        self.progress.require("dequeue", Stage::FormatOutSet)?;
        loop {
            if let Some(done) = self.completed.queue(direction).pop_front() {
                if let Some(slot) = self.slots.get_mut(done.set.index) {
                    let side = slot.side_mut(direction);
                    if side.state == BufState::Queued {
                        side.state = BufState::Dequeued;
                    }
                }
                if !done.result.is_ok() {
                    tracing::debug!(session = %self.id, "Frame {} finished with {}", done.set.frame_id, done.result);
                }
                return Ok(done);
            }

            if !self.slots.iter().any(|slot| slot.side(direction).state == BufState::Queued) {
                return Err(NpuError::invalid_argument(format!("no {direction} buffer is queued")));
            }

            if let Ok(done) = self.completions.try_recv() {
                self.accept(done);
                continue;
            }
            if self.ctx.dispatcher.emergency().is_raised() {
                return Err(NpuError::Emergency);
            }

            let timeout = self.ctx.config.dequeue_timeout;
            match self.completions.recv_timeout(timeout) {
                Ok(done) => self.accept(done),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(session = %self.id, "No {direction} frame within {timeout:?}");
                    return Err(NpuError::DequeueTimeout {
                        direction,
                        duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(NpuError::WorkerStopped),
            }
        }
    }

    fn accept(&mut self, done: FrameDone) {
        tracing::trace!(session = %self.id, "Frame {} (#{}) done: {}", done.frame_id, done.request_id, done.result);
        self.completed.push(done);
    }

    /// STREAMON
    ///
    /// A stopped session may be started again.
    ///
    /// # Errors
    ///
    /// [`NpuError::Ordering`] before the output format is set,
    /// [`NpuError::InvalidArgument`] if already streaming, and any dispatcher
    /// error.
    pub fn start(&mut self) -> Result<()> {
        self.progress.require("start", Stage::FormatOutSet)?;
        if self.streaming {
            return Err(NpuError::invalid_argument(format!("session {} is already streaming", self.id)));
        }
        self.ctx
            .dispatcher
            .call(Some(self.id), NetworkCommand::StreamOn, None, 0)?;
        if !self.progress.contains(Stage::Started) {
            self.progress.advance(Stage::Started)?;
        }
        self.streaming = true;
        tracing::info!(session = %self.id, "Streaming started");
        Ok(())
    }

    /// STREAMOFF
    ///
    /// Firmware answers once every outstanding frame has finished. The
    /// session counts as stopped even when STREAMOFF fails. In emergency
    /// mode only CLEAR_CB is posted.
    ///
    /// # Errors
    ///
    /// [`NpuError::Ordering`] before `start`, [`NpuError::Emergency`] in
    /// emergency mode, and any dispatcher error.
    pub fn stop(&mut self) -> Result<()> {
        self.progress.require("stop", Stage::Started)?;
        if !self.streaming {
            return Ok(());
        }

        let result = if self.ctx.dispatcher.emergency().is_raised() {
            self.ctx
                .dispatcher
                .post(Some(self.id), NetworkCommand::ClearCb)
                .and(Err(NpuError::Emergency))
        } else {
            self.ctx
                .dispatcher
                .call(Some(self.id), NetworkCommand::StreamOff, None, 0)
        };
        self.streaming = false;
        if !self.progress.contains(Stage::Stopped) {
            self.progress.advance(Stage::Stopped)?;
        }
        match &result {
            Ok(()) => tracing::info!(session = %self.id, "Streaming stopped"),
            Err(e) => tracing::warn!(session = %self.id, "Stopped with error: {e}"),
        }
        result
    }

    fn side_mut(&mut self, set: &BufferSet) -> Result<&mut SlotSide> {
        let count = self.slots.len();
        self.slots
            .get_mut(set.index)
            .map(|slot| slot.side_mut(set.direction))
            .ok_or_else(|| out_of_range(set.index, count))
    }
}

fn out_of_range(index: usize, count: usize) -> NpuError {
    NpuError::invalid_argument(format!("slot {index} out of range ({count} slots)"))
}
