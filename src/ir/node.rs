//! IR node.
//!
//! The reference source links nodes through raw `first`/`last`/`dest_inner`
//! pointers into an intrusive list. this is re-architected as an
//! arena: a function's nodes live in one `Vec<IrNode>`, and every cross-node
//! reference is an index into it rather than a pointer.

use kedr_asm::{DecodedInsn, RegMask};

/// Index of a node within its function's node arena.
pub type NodeId = usize;

/// Which kind of block a block-starting node heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Common,
    CommonNoMemOps,
    LockedUpdate,
    IoMemOp,
    BarrierOther,
    JumpBackwards,
    CallRel32Out,
    JumpRel32Out,
    CallIndirect,
    JumpIndirectInner,
    JumpIndirectOut,
    ControlOutOther,
}

impl BlockType {
    /// Only these block types emit memory-event notifications and get a
    /// [`crate::block::BlockDescriptor`] allocated.
    pub const fn allocates_descriptor(self) -> bool {
        matches!(self, BlockType::Common | BlockType::LockedUpdate | BlockType::IoMemOp)
    }
}

/// Memory-barrier classification surfaced to the event handler plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Full,
    Load,
    Store,
}

/// One node in a function's IR. Either a *reference* node (mirrors an
/// original instruction; `orig_addr != 0`) or an *added* node (created
/// during transformation; `orig_addr == 0`).
#[derive(Debug, Clone)]
pub struct IrNode {
    /// The decoded instruction this node carries. For an added node this is
    /// whatever bytes the transformer synthesized, re-decoded so its
    /// length/operands stay authoritative after emission's short/near
    /// fix-point loop.
    pub insn: DecodedInsn,
    /// Nonzero for a reference node; zero for an added node.
    pub orig_addr: u64,
    /// Byte offset within the instrumented function, assigned by the code
    /// emitter. `u32::MAX` before emission.
    pub emit_offset: u32,
    /// `(first, last)` range into the owning function's node arena bounding
    /// the contiguous group this reference node expanded into (e.g. a
    /// `JCXZ`/`LOOP*` three-node expansion). Replaces the source's `first`/
    /// `last` pointers.
    pub first: NodeId,
    pub last: NodeId,
    /// Destination node for a direct internal jump, replacing the source's
    /// `dest_inner` pointer. `None` for indirect or out-of-function
    /// transfers.
    pub dest_inner: Option<NodeId>,
    /// Absolute destination address when the instruction transfers control,
    /// `0` if none or if the destination is computed.
    pub dest_addr: u64,
    /// Address to be patched at deploy time for RIP-relative operands and
    /// for outward `rel32` call/jump targets. `0` when not applicable.
    pub iprel_addr: u64,
    /// Set on the first node of a block.
    pub block_start: bool,
    pub block_type: Option<BlockType>,
    /// For a block-start node, the last reference node belonging to that
    /// block.
    pub end_node: Option<NodeId>,
    /// Index into the owning function's `blocks`/`calls` vectors, set for
    /// nodes that participate in a block or a call site.
    pub block_desc_idx: Option<usize>,
    pub call_desc_idx: Option<usize>,
    /// Registers this instruction reads or writes.
    pub reg_use_mask: RegMask,
    pub barrier_kind: Option<BarrierKind>,
    /// A forward jump whose destination lies past its block's last
    /// reference node.
    pub jump_past_last: bool,
    /// An indirect inner jump-table dispatch.
    pub inner_jmp_indirect: bool,
    pub needs_addr32_reloc: bool,
    /// Set on a block-start node when some jump inside the block has
    /// `jump_past_last` set.
    pub block_has_jumps_out: bool,
    pub is_tracked_mem_op: bool,
    pub is_string_op: bool,
    pub is_string_op_xy: bool,
}

impl IrNode {
    /// Build a reference node directly from a decoded instruction.
    pub fn reference(insn: DecodedInsn, orig_addr: u64, self_id: NodeId) -> Self {
        let is_tracked_mem_op = insn.is_tracked_mem_op();
        let is_string_op = insn.is_string_op();
        let is_string_op_xy = insn.is_string_op_xy();
        IrNode {
            insn,
            orig_addr,
            emit_offset: u32::MAX,
            first: self_id,
            last: self_id,
            dest_inner: None,
            dest_addr: insn.jump_target.unwrap_or(0),
            iprel_addr: 0,
            block_start: false,
            block_type: None,
            end_node: None,
            block_desc_idx: None,
            call_desc_idx: None,
            reg_use_mask: insn.reg_use_mask,
            barrier_kind: None,
            jump_past_last: false,
            inner_jmp_indirect: false,
            needs_addr32_reloc: false,
            block_has_jumps_out: false,
            is_tracked_mem_op,
            is_string_op,
            is_string_op_xy,
        }
    }

    /// Build an added node out of raw synthesized bytes, already decoded by
    /// the transformer so its operand/length fields are authoritative.
    pub fn added(insn: DecodedInsn, self_id: NodeId) -> Self {
        let mut node = IrNode::reference(insn, 0, self_id);
        node.dest_addr = 0;
        node
    }

    pub fn is_added(&self) -> bool {
        self.orig_addr == 0
    }

    /// `true` once the emitter has assigned this node a real offset.
    pub fn is_emitted(&self) -> bool {
        self.emit_offset != u32::MAX
    }
}
