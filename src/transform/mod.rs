//! IR transformation (phase 1 + phase 2).
//!
//! Runs once per function, after block analysis and base-register selection,
//! immediately before emission. Walks the block-annotated node arena built by
//! [`crate::ir::build_function_ir`]/[`crate::block::analyze_blocks`] in
//! program order and rebuilds it node by node: control-flow instructions
//! (entry, exits, calls, jumps, `PUSHAD`/`POPAD`) are wrapped or replaced;
//! tracked memory accesses, locked updates, I/O ops and barriers get the
//! capture/hook sequences spliced in alongside them. Reference nodes that
//! need neither pass through unchanged save for a `%base` save/restore wrap
//! when they touch it.
//!
//! The reference source runs these as two separate passes over the pointer-
//! linked IR (`kedr_process_function_for_ir` calling first the phase-1, then
//! the phase-2 callbacks per node). Doing both in one walk here is
//! equivalent: neither pass's output depends on the other having already
//! been laid out in its final byte positions (that only happens at
//! emission), so nothing is lost by merging the two traversals into one
//! arena rebuild.

mod capture;
mod control;
mod regalloc;

use kedr_asm::{Bitness, Reg};
use tracing::debug;

use crate::function::{CallDescriptor, FunctionRecord};
use crate::ir::{IrNode, NodeId};
use crate::runtime::WrapperTable;

pub(crate) use regalloc::choose_work_registers;

/// Shared state threaded through one function's transformation.
pub(crate) struct Ctx<'a> {
    pub bitness: Bitness,
    pub base: Reg,
    pub wrappers: &'a WrapperTable,
    pub fallback_addr: u64,
    pub nodes: Vec<IrNode>,
    /// Call descriptors allocated so far, in call-site order. Reserved to
    /// its final capacity up front (at most one per old node) so that
    /// pointers taken into it while staging `LocalStorage.current_call`
    /// never dangle from a reallocation mid-transform.
    pub calls: Vec<CallDescriptor>,
    /// Maps an index into the *old* (pre-transform) arena to its
    /// counterpart in `nodes`, the arena under construction. Every old
    /// node produces exactly one counterpart, even when replaced outright
    /// (e.g. an indirect call becomes a call to a thunk) — this is what
    /// lets `dest_inner`/`end_node`/block links be remapped afterward the
    /// same way [`crate::ir::build_function_ir`]'s short-form rewrite does.
    pub old_to_new: Vec<NodeId>,
    /// Address of each of `record.blocks`'s descriptors, by index, computed
    /// once up front — block analysis already ran and sized that vector for
    /// good, so these addresses are stable for the rest of the function's
    /// life (mirroring the `calls` invariant above).
    pub block_addrs: Vec<u64>,
    /// Old-arena id of the last reference node in the `Common`/
    /// `CommonNoMemOps` block currently being walked, `None` outside one.
    pub block_end: Option<NodeId>,
    /// Next free index into `LocalStorage.values` within the block
    /// currently being walked.
    pub block_slot: usize,
}

impl<'a> Ctx<'a> {
    fn push(&mut self, insn: kedr_asm::DecodedInsn) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(IrNode::added(insn, id));
        id
    }

    /// Carry an old-arena node into the new arena verbatim, preserving every
    /// link field (`first`/`last`/`dest_inner`/`end_node` as old-arena
    /// indices, fixed up afterward by [`remap_links`]) so later stages still
    /// see the same block/jump-table structure the analyzer computed.
    fn clone_node(&mut self, old: &IrNode) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(old.clone());
        id
    }

    /// Like [`Ctx::clone_node`] but with the instruction swapped out — used
    /// where a reference node's control-flow role survives transformation
    /// unchanged (its `dest_inner`/block membership/etc. all still apply)
    /// but its bytes are replaced by a call to a thunk.
    fn replace_node(&mut self, old: &IrNode, insn: kedr_asm::DecodedInsn) -> NodeId {
        let id = self.clone_node(old);
        self.nodes[id].insn = insn;
        id
    }

    /// Push a bare `CALL rel32` to one of the fixed wrapper trampolines,
    /// wired through the same generic `iprel_addr` relocation mechanism the
    /// emitter already applies to outward direct calls.
    /// Callers are responsible for the wrapper calling convention's single
    /// argument: use [`Ctx::call_wrapper_with_storage`] unless the
    /// argument is something other than the storage pointer (the entry
    /// prologue passes the original function address instead).
    fn call_wrapper(&mut self, target: u64) -> NodeId {
        let insn = crate::asm_gen::call_rel32(self.bitness, 0);
        let id = self.push(insn);
        self.nodes[id].iprel_addr = target;
        id
    }

    /// Call a wrapper trampoline with the current storage pointer as its
    /// argument, preserving `%eax` around the call the way every hook site
    /// needs to (the original instruction on either side of a pre/post pair
    /// may still depend on it). Requires `%base` to currently hold the
    /// storage pointer, not a restored logical value.
    fn call_wrapper_with_storage(&mut self, target: u64) -> NodeId {
        self.push(crate::asm_gen::push_reg(self.bitness, Reg::EAX, 0));
        self.push(crate::asm_gen::mov_reg_reg(self.bitness, Reg::EAX, self.base, 0));
        let id = self.call_wrapper(target);
        self.push(crate::asm_gen::pop_reg(self.bitness, Reg::EAX, 0));
        id
    }
}

/// Transform `record`'s IR in place, consuming the block- and
/// base-register-annotated arena [`crate::ir::build_function_ir`] /
/// [`crate::block::analyze_blocks`] / [`crate::block::select_base_register`]
/// produced and replacing it with the version ready for [`crate::emit`].
#[tracing::instrument(skip(record, wrappers), fields(addr = format_args!("{:#x}", record.orig_addr)))]
pub fn transform_function(record: &mut FunctionRecord, bitness: Bitness, base: Reg, wrappers: &WrapperTable) {
    let old_nodes = std::mem::take(&mut record.nodes);
    let block_addrs = record.blocks.iter().map(|b| b as *const _ as u64).collect();
    let mut ctx = Ctx {
        bitness,
        base,
        wrappers,
        fallback_addr: record.fallback_addr,
        nodes: Vec::with_capacity(old_nodes.len() * 2),
        calls: Vec::with_capacity(old_nodes.len()),
        old_to_new: vec![0; old_nodes.len()],
        block_addrs,
        block_end: None,
        block_slot: 0,
    };

    control::emit_entry_prologue(&mut ctx, record.orig_addr);

    for old_id in 0..old_nodes.len() {
        let old = &old_nodes[old_id];

        if old.insn.is_exit() {
            control::emit_simple_exit(&mut ctx);
        }

        let new_id = match old.block_type {
            Some(crate::ir::BlockType::CallIndirect) => control::transform_indirect_call(&mut ctx, old),
            Some(crate::ir::BlockType::JumpIndirectOut) => control::transform_indirect_jump_out(&mut ctx, old),
            Some(crate::ir::BlockType::JumpIndirectInner) => control::transform_indirect_jump_inner(&mut ctx, old),
            Some(crate::ir::BlockType::CallRel32Out) | Some(crate::ir::BlockType::JumpRel32Out) => {
                control::transform_direct_outward(&mut ctx, old)
            }
            _ if matches!(old.insn.mnemonic, kedr_asm::Mnemonic::Pushad) => control::transform_pushad(&mut ctx, old),
            _ if matches!(old.insn.mnemonic, kedr_asm::Mnemonic::Popad) => control::transform_popad(&mut ctx, old),
            _ => capture::transform_tracked_node(&mut ctx, old_id, old),
        };

        ctx.old_to_new[old_id] = new_id;
    }

    remap_links(&mut ctx.nodes, &ctx.old_to_new);
    remap_jump_tables(&mut record.jump_tables, &ctx.old_to_new);
    debug!(node_count = ctx.nodes.len(), "transform produced final node arena");
    record.nodes = ctx.nodes;
    record.calls = ctx.calls;
}

/// Jump tables are built against the pre-transform arena, so their
/// `referring_node`/`JumpTableSlot::Node` ids need the same old-to-new
/// translation as [`remap_links`] before [`crate::emit`] can resolve them
/// against the rebuilt arena.
fn remap_jump_tables(jump_tables: &mut [crate::ir::JumpTable], old_to_new: &[NodeId]) {
    for table in jump_tables.iter_mut() {
        table.referring_node = old_to_new.get(table.referring_node).copied().unwrap_or(table.referring_node);
        for slot in table.slots.iter_mut() {
            if let crate::ir::JumpTableSlot::Node(id) = slot {
                *id = old_to_new.get(*id).copied().unwrap_or(*id);
            }
        }
    }
}

/// Second pass: rewrite every `dest_inner`/`end_node` old-arena index into
/// its new-arena counterpart, mirroring
/// [`crate::ir::build_function_ir`]'s short-jump-expansion remap.
fn remap_links(nodes: &mut [IrNode], old_to_new: &[NodeId]) {
    for node in nodes.iter_mut() {
        // Added nodes' `first == last == self` and `dest_inner == None`
        // already refer to the new arena (set at construction); only nodes
        // carried over from the old arena (`clone_node`/`replace_node`)
        // still hold old-arena indices that need translating.
        if node.is_added() {
            continue;
        }
        if let Some(dest) = node.dest_inner {
            node.dest_inner = old_to_new.get(dest).copied();
        }
        if let Some(end) = node.end_node {
            node.end_node = old_to_new.get(end).copied();
        }
        node.first = old_to_new.get(node.first).copied().unwrap_or(node.first);
        node.last = old_to_new.get(node.last).copied().unwrap_or(node.last);
    }
}
