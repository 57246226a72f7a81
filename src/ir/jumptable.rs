//! Jump tables.

use crate::ir::NodeId;

/// A single jump-table slot. Starts out naming the destination node inside
/// the arena; the deployer overwrites it with a concrete address once the
/// instrumented copy is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTableSlot {
    /// Not yet resolved past its IR destination.
    Node(NodeId),
    /// Resolved to a byte offset within the instrumented function, before
    /// the function's base address is known.
    Offset(u32),
    /// Resolved to an absolute runtime address ("a second time" for
    /// the fallback copy).
    Absolute(u64),
}

/// An indirect jump-table dispatch extracted from `JMP [disp32 + reg*scale]`:
/// original address, element count, and the node that refers to it.
#[derive(Debug, Clone)]
pub struct JumpTable {
    /// Address of the table in the original module.
    pub orig_addr: u64,
    /// The IR node whose `FF /4` dispatch refers to this table.
    pub referring_node: NodeId,
    pub slots: Vec<JumpTableSlot>,
    /// Each slot's destination expressed as a byte offset from the
    /// function's *original* start address, captured once during IR build
    /// and never touched by transformation or emission. Deployment uses
    /// this (rather than `slots`, which ends up holding instrumented-side
    /// offsets after emission) to fix up the fallback copy's table a
    /// second time: `fallback_base_of_function + fallback_offsets[i]`.
    pub fallback_offsets: Vec<u32>,
}

impl JumpTable {
    pub fn new(orig_addr: u64, referring_node: NodeId) -> Self {
        JumpTable { orig_addr, referring_node, slots: Vec::new(), fallback_offsets: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `true` once every slot has been pushed past node-level resolution.
    pub fn is_resolved_to_offsets(&self) -> bool {
        self.slots.iter().all(|s| !matches!(s, JumpTableSlot::Node(_)))
    }

    /// Merge `other` into `self` when two extracted tables end at the same
    /// address: the longer one absorbs the shorter.
    pub fn absorb_shorter(&mut self, other: &JumpTable) {
        if other.slots.len() > self.slots.len() {
            self.slots = other.slots.clone();
            self.fallback_offsets = other.fallback_offsets.clone();
        }
    }
}
