// SPDX-License-Identifier: AGPL-3.0-only

//! Session progress tracking and the undo chain.

use crate::error::{NpuError, Result};

/// Ordered session setup stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Session object exists
    Open = 0,
    /// Session holds a registry slot
    Registered,
    /// NCP blob mapped for device access
    NcpMapped,
    /// Weight addresses rewritten into the NCP
    WeightTableAllocated,
    /// Per-slot feature-map tables created
    IoTableAllocated,
    /// Per-slot device I/O tables allocated
    IoBuffersAllocated,
    /// Intermediate buffers allocated, network loaded
    ImbBuffersAllocated,
    /// Input layout negotiated
    FormatInSet,
    /// Output layout negotiated
    FormatOutSet,
    /// Streaming
    Started,
    /// Streaming stopped
    Stopped,
    /// Close in progress
    Closed,
}

impl Stage {
    /// All stages in order
    pub const ALL: [Self; 12] = [
        Self::Open,
        Self::Registered,
        Self::NcpMapped,
        Self::WeightTableAllocated,
        Self::IoTableAllocated,
        Self::IoBuffersAllocated,
        Self::ImbBuffersAllocated,
        Self::FormatInSet,
        Self::FormatOutSet,
        Self::Started,
        Self::Stopped,
        Self::Closed,
    ];

    /// Bit for this stage
    pub const fn bit(self) -> u32 {
        1 << self as u8
    }
}

/// Progress bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress(u32);

impl Progress {
    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether no stage is recorded
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `stage` itself is recorded
    pub const fn contains(self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    /// Highest recorded stage
    pub fn highest(self) -> Option<Stage> {
        Stage::ALL.iter().rev().copied().find(|stage| self.contains(*stage))
    }

    /// Whether the session has reached `stage` or beyond
    pub const fn reached(self, stage: Stage) -> bool {
        self.0 >= stage.bit()
    }

    /// Fail with an ordering error unless `stage` has been reached
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Ordering`] naming `operation` and `stage`.
    pub fn require(self, operation: &'static str, stage: Stage) -> Result<()> {
        if self.reached(stage) {
            Ok(())
        } else {
            Err(NpuError::ordering(operation, stage))
        }
    }

    /// Record `stage`
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Ordering`] if a later stage is already recorded.
    pub fn advance(&mut self, stage: Stage) -> Result<()> {
        if let Some(highest) = self.highest() {
            if highest > stage {
                return Err(NpuError::ordering("advance", highest));
            }
        }
        self.0 |= stage.bit();
        Ok(())
    }

    /// Clear every stage above `target`; `None` clears everything
    pub fn clear_above(&mut self, target: Option<Stage>) {
        self.0 &= match target {
            Some(stage) => (stage.bit() << 1) - 1,
            None => 0,
        };
    }
}

/// Stack of `(stage, rollback)` pairs
#[derive(Debug)]
pub struct UndoChain<A> {
    entries: Vec<(Stage, A)>,
}

impl<A> UndoChain<A> {
    /// Empty chain
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register `action` as the rollback of `stage`
    pub fn push(&mut self, stage: Stage, action: A) {
        self.entries.push((stage, action));
    }

    /// Pop the newest action registered above `target`
    ///
    /// `None` as target pops every entry.
    pub fn pop_above(&mut self, target: Option<Stage>) -> Option<(Stage, A)> {
        let newest = self.entries.last().map(|(stage, _)| *stage)?;
        if target.is_some_and(|target| newest <= target) {
            return None;
        }
        self.entries.pop()
    }

    /// Registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stages with a registered rollback, oldest first
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.entries.iter().map(|(stage, _)| *stage)
    }
}

impl<A> Default for UndoChain<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_checks_highest_stage() {
        let mut progress = Progress::default();
        assert!(progress.require("set_graph", Stage::Registered).is_err());
        progress.advance(Stage::Open).unwrap();
        progress.advance(Stage::Registered).unwrap();
        progress.require("set_graph", Stage::Registered).unwrap();
        assert!(matches!(
            progress.require("queue", Stage::FormatOutSet),
            Err(NpuError::Ordering {
                operation: "queue",
                required: Stage::FormatOutSet
            })
        ));
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut progress = Progress::default();
        progress.advance(Stage::Open).unwrap();
        progress.advance(Stage::NcpMapped).unwrap();
        assert!(progress.advance(Stage::Registered).is_err());
        assert_eq!(progress.highest(), Some(Stage::NcpMapped));
    }

    #[test]
    fn clear_above_keeps_prefix() {
        let mut progress = Progress::default();
        for stage in &Stage::ALL[..8] {
            progress.advance(*stage).unwrap();
        }
        progress.clear_above(Some(Stage::Registered));
        assert_eq!(progress.bits(), Stage::Open.bit() | Stage::Registered.bit());
        progress.clear_above(None);
        assert!(progress.is_empty());
    }

    #[test]
    fn undo_chain_pops_in_reverse_until_target() {
        let mut chain = UndoChain::new();
        chain.push(Stage::Registered, "unregister");
        chain.push(Stage::NcpMapped, "unmap");
        chain.push(Stage::ImbBuffersAllocated, "free imb");
        chain.push(Stage::ImbBuffersAllocated, "unload");

        let mut popped = Vec::new();
        while let Some((_, action)) = chain.pop_above(Some(Stage::Registered)) {
            popped.push(action);
        }
        assert_eq!(popped, ["unload", "free imb", "unmap"]);
        assert_eq!(chain.len(), 1);

        assert_eq!(chain.pop_above(None), Some((Stage::Registered, "unregister")));
        assert!(chain.is_empty());
        assert_eq!(chain.pop_above(None), None);
    }
}
