//! Phase 2: memory-event capture, locked/I/O/barrier pre/post hooks,
//! and the general-case `%base` save/restore wrap for everything the
//! control-flow cases in [`super::control`] don't already handle.

use kedr_asm::Reg;

use crate::asm_gen;
use crate::ir::{BarrierKind, BlockType, IrNode, NodeId};
use crate::runtime::{spill_slot_offset, value_slot_offset, CURRENT_BLOCK_OFFSET, SCRATCH_OFFSET, WRITE_MASK_OFFSET};

use super::{choose_work_registers, Ctx};

/// Dispatches on `old.block_type` (set only on a block's first reference
/// node) or, for a `None` continuation node, on whatever block
/// [`Ctx::block_end`] says is currently open (set by the block-start branch
/// below and cleared once that block's last node has been walked).
pub(super) fn transform_tracked_node(ctx: &mut Ctx, old_id: NodeId, old: &IrNode) -> NodeId {
    match old.block_type {
        Some(BlockType::LockedUpdate) => wrap_pre_post(ctx, old, ctx.wrappers.on_locked_op_pre, ctx.wrappers.on_locked_op_post),
        Some(BlockType::IoMemOp) => wrap_pre_post(ctx, old, ctx.wrappers.on_io_mem_op_pre, ctx.wrappers.on_io_mem_op_post),
        Some(BlockType::BarrierOther) => wrap_barrier(ctx, old),
        Some(BlockType::Common) => {
            ctx.block_end = old.end_node;
            ctx.block_slot = 0;
            stage_current_block(ctx, old);
            common_block_node(ctx, old_id, old)
        }
        Some(BlockType::CommonNoMemOps) => {
            ctx.block_end = old.end_node;
            common_block_node(ctx, old_id, old)
        }
        Some(BlockType::JumpBackwards) | Some(BlockType::ControlOutOther) => wrap_general(ctx, old),
        // Every other `Some(_)` variant (indirect/direct outward transfers)
        // is intercepted by `super::control` before reaching here.
        Some(_) => wrap_general(ctx, old),
        None if ctx.block_end.is_some() => common_block_node(ctx, old_id, old),
        None => wrap_general(ctx, old),
    }
}

/// One reference node inside an open `Common`/`CommonNoMemOps` block: emit
/// its memory-event capture if it has one, run it through the general
/// `%base` wrap, then close the block out with `on_common_block_end` if this
/// was the block's last node.
fn common_block_node(ctx: &mut Ctx, old_id: NodeId, old: &IrNode) -> NodeId {
    if old.is_tracked_mem_op {
        emit_mem_capture(ctx, old);
    }
    let id = wrap_general(ctx, old);
    if ctx.block_end == Some(old_id) {
        ctx.call_wrapper(ctx.wrappers.on_common_block_end);
        ctx.block_end = None;
    }
    id
}

/// `LEA` the tracked instruction's effective address into a work register
/// and store it into this block's next `values` slot; string ops
/// additionally stage their repeat count (from `%ecx`) in the following slot
/// (`SLOTS_STRING_OP_XY_*` budget).
fn emit_mem_capture(ctx: &mut Ctx, old: &IrNode) {
    let wreg = choose_work_registers(ctx.bitness, ctx.base, old.reg_use_mask, 1)[0];
    ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
    ctx.push(asm_gen::lea_from_modrm(ctx.bitness, &old.insn, wreg, 0));
    let slot = ctx.block_slot;
    ctx.push(asm_gen::mov_mem_disp32_reg(ctx.bitness, ctx.base, value_slot_offset(slot), wreg, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));
    ctx.block_slot += 1;

    if old.is_string_op {
        ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
        ctx.push(asm_gen::mov_reg_reg(ctx.bitness, wreg, Reg::ECX, 0));
        ctx.push(asm_gen::mov_mem_disp32_reg(ctx.bitness, ctx.base, value_slot_offset(ctx.block_slot), wreg, 0));
        ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));
        ctx.block_slot += 1;
    }
}

/// Stage this block's descriptor pointer into `LocalStorage.current_block`
/// and clear `write_mask`, the way [`super::control`]'s call-descriptor
/// staging does — same mechanism, different field. A no-op for
/// `CommonNoMemOps` blocks, which never allocate a descriptor.
fn stage_current_block(ctx: &mut Ctx, old: &IrNode) {
    let Some(idx) = old.block_desc_idx else { return };
    let addr = ctx.block_addrs[idx];
    let wreg = choose_work_registers(ctx.bitness, ctx.base, old.reg_use_mask, 1)[0];
    ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
    if matches!(ctx.bitness, kedr_asm::Bitness::X64) {
        ctx.push(asm_gen::mov_reg_imm64(wreg, addr, 0));
        ctx.push(asm_gen::mov_mem_disp32_reg(ctx.bitness, ctx.base, CURRENT_BLOCK_OFFSET, wreg, 0));
    } else {
        ctx.push(asm_gen::mov_mem_disp32_imm32(ctx.bitness, ctx.base, CURRENT_BLOCK_OFFSET, addr as i32, 0));
    }
    ctx.push(asm_gen::mov_mem_disp32_imm32(ctx.bitness, ctx.base, WRITE_MASK_OFFSET, 0, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));
}

/// Locked-update and I/O-memory-op blocks (always solo): call the
/// matching pre-hook, run the original instruction, call the post-hook.
fn wrap_pre_post(ctx: &mut Ctx, old: &IrNode, pre: u64, post: u64) -> NodeId {
    ctx.call_wrapper(pre);
    let id = wrap_general(ctx, old);
    ctx.call_wrapper(post);
    id
}

/// Barrier blocks: stage the barrier's kind into
/// `LocalStorage.scratch` — barriers don't carry their kind in any register
/// the handler could read off the original instruction the way locked
/// updates and I/O ops do — so `on_barrier_pre`/`on_barrier_post` can report
/// it, then wrap as usual.
fn wrap_barrier(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    let kind = match old.barrier_kind {
        Some(BarrierKind::Full) => 0,
        Some(BarrierKind::Load) => 1,
        Some(BarrierKind::Store) => 2,
        None => 0,
    };
    ctx.push(asm_gen::mov_mem_disp32_imm32(ctx.bitness, ctx.base, SCRATCH_OFFSET, kind, 0));
    wrap_pre_post(ctx, old, ctx.wrappers.on_barrier_pre, ctx.wrappers.on_barrier_post)
}

/// The fallback case for every reference node not otherwise handled: if it
/// doesn't touch `%base` at all, carry it through unchanged; if it does,
/// swap `%base`'s storage-pointer value out for its logical value (held in
/// the spill slot) around the original instruction, since `%base` inside
/// the instrumented body always holds the `LocalStorage` pointer rather than
/// whatever the original code expects to find there.
pub(super) fn wrap_general(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    if !old.reg_use_mask.contains_reg(ctx.base) {
        return ctx.clone_node(old);
    }

    let wreg = choose_work_registers(ctx.bitness, ctx.base, old.reg_use_mask, 1)[0];
    ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, wreg, ctx.base, 0));
    ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, ctx.base, wreg, spill_slot_offset(ctx.base), 0));

    let id = ctx.clone_node(old);

    ctx.push(asm_gen::mov_mem_disp8_reg(ctx.bitness, wreg, spill_slot_offset(ctx.base), ctx.base, 0));
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, ctx.base, wreg, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));

    id
}
