//! Block analysis and base-register selection.

use smallvec::SmallVec;

use crate::consts::MAX_BLOCK_VALUE_SLOTS;

mod analyzer;
mod base_register;

pub use analyzer::analyze_blocks;
pub use base_register::select_base_register;

/// One tracked memory access recorded in a [`BlockDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEvent {
    pub pc: u64,
    pub size: u8,
}

/// A block can hold at most [`MAX_BLOCK_VALUE_SLOTS`] events (the cheapest
/// tracked access costs one slot), so inlining that many [`MemEvent`]s keeps
/// every block descriptor off the heap — the common case of a handful of
/// accesses per block never allocates.
type EventVec = SmallVec<[MemEvent; MAX_BLOCK_VALUE_SLOTS]>;

/// Per-block summary needed to emit memory-event notifications.
/// Allocated only for block types that actually emit events (`Common`,
/// `LockedUpdate`, `IoMemOp`); sized on creation and never resized.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    pub max_events: usize,
    pub read_mask: u16,
    pub write_mask: u16,
    pub string_op_mask: u16,
    pub events: EventVec,
}

impl BlockDescriptor {
    pub fn new(max_events: usize) -> Self {
        BlockDescriptor {
            max_events,
            read_mask: 0,
            write_mask: 0,
            string_op_mask: 0,
            events: EventVec::with_capacity(max_events),
        }
    }

    /// Record one tracked access. Panics if called past `max_events` — the
    /// descriptor is sized exactly to what the analyzer counted, so an
    /// overflow here means the analyzer and the transformer disagree about
    /// a block's contents.
    pub fn push_event(&mut self, pc: u64, size: u8, is_write: bool, is_string_op: bool) {
        assert!(self.events.len() < self.max_events, "block descriptor event capacity exceeded");
        let bit = 1u16 << self.events.len();
        if is_write {
            self.write_mask |= bit;
        } else {
            self.read_mask |= bit;
        }
        if is_string_op {
            self.string_op_mask |= bit;
        }
        self.events.push(MemEvent { pc, size });
    }
}
