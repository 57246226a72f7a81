//! Phase 1: entry/exit prologues, call and jump handling,
//! `PUSHAD`/`POPAD`, and the general `%base`-use wrap.

use kedr_asm::{Bitness, Mnemonic, Reg, RegMask};

use crate::asm_gen;
use crate::function::CallDescriptor;
use crate::ir::{IrNode, NodeId};
use crate::runtime::{spill_slot_offset, CURRENT_CALL_OFFSET, SCRATCH_OFFSET};

use super::{choose_work_registers, Ctx};

/// "Entry prologue": on entry, hand off to `kedr_on_function_entry`
/// with the original address in `%eax`/`%rax` (sign-extended, the same trick
/// the original source relies on since kernel module text lives in the
/// negative-canonical half of the 64-bit address space); fall back to the
/// uninstrumented copy if the allocator returned null; otherwise swap
/// `%base` for the returned local-storage pointer, spilling its original
/// value first.
pub(super) fn emit_entry_prologue(ctx: &mut Ctx, orig_addr: u64) {
    ctx.push(asm_gen::push_reg(ctx.bitness, Reg::EAX, 0));
    ctx.push(asm_gen::mov_reg_imm32(ctx.bitness, Reg::EAX, orig_addr as i64 as i32, 0));
    let call_id = ctx.call_wrapper(ctx.wrappers.on_function_entry);
    ctx.push(asm_gen::test_reg_reg(ctx.bitness, Reg::EAX, Reg::EAX, 0));

    // `jnz go_on` / `pop %rax` / `jmp <fallback>` / `go_on:` — the jump
    // target (`go_on`) isn't known until the nodes after it exist, so patch
    // `dest_inner` once they do instead of threading a forward label.
    let jnz_id = ctx.push(asm_gen::jcc_rel32(ctx.bitness, 0x5 /* JNZ */, 0));
    let pop_id = ctx.push(asm_gen::pop_reg(ctx.bitness, Reg::EAX, 0));
    let jmp_fallback_id = ctx.push(asm_gen::jmp_rel32(ctx.bitness, 0));
    ctx.nodes[jmp_fallback_id].iprel_addr = ctx.fallback_addr;

    let go_on = ctx.nodes.len();
    ctx.nodes[jnz_id].dest_inner = Some(go_on);

    ctx.push(asm_gen::mov_mem_disp8_reg(ctx.bitness, Reg::EAX, spill_slot_offset(ctx.base), ctx.base, 0));
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, ctx.base, Reg::EAX, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, Reg::EAX, 0));

    let _ = (call_id, pop_id);
}

/// "Simple function exit": prepended before every `RET`/`IRET`/`UD2`/
/// `JMP far`.
pub(super) fn emit_simple_exit(ctx: &mut Ctx) {
    ctx.push(asm_gen::push_reg(ctx.bitness, Reg::EAX, 0));
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, Reg::EAX, ctx.base, 0));
    ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, ctx.base, Reg::EAX, spill_slot_offset(ctx.base), 0));
    ctx.call_wrapper(ctx.wrappers.on_function_exit);
    ctx.push(asm_gen::pop_reg(ctx.bitness, Reg::EAX, 0));
}

/// "Indirect call `CALL *<expr>`": evaluate `<expr>` into a work
/// register, stage the call descriptor's address for the thunk to find via
/// `%base`, let `kedr_fill_call_info` resolve pre/post/replacement, then
/// replace the instruction with `CALL call_thunk`.
pub(super) fn transform_indirect_call(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    let mut descriptor = CallDescriptor::new(old.orig_addr);
    // Resolved lazily by the runtime wrapper on first execution; the
    // pipeline cannot know the target of an indirect call ahead of time.
    descriptor.target_addr = 0;
    let call_idx = push_call_descriptor(ctx, descriptor);

    transform_indirect(ctx, old, ctx.wrappers.call_thunk, call_idx, false)
}

/// "Indirect outward `JMP *<expr>`": same preamble as the indirect
/// call, but replaces the instruction with `JMP jump_thunk` and, since this
/// transfer never returns here, restores `%base` to its logical value
/// before handing off (the call thunk skips this: it returns back into
/// this function, which still needs `%base` holding the storage pointer).
pub(super) fn transform_indirect_jump_out(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    let mut descriptor = CallDescriptor::new(old.orig_addr);
    descriptor.target_addr = 0;
    let call_idx = push_call_descriptor(ctx, descriptor);

    transform_indirect(ctx, old, ctx.wrappers.jump_thunk, call_idx, true)
}

fn transform_indirect(ctx: &mut Ctx, old: &IrNode, thunk_addr: u64, call_idx: usize, restore_base_for_jump: bool) -> NodeId {
    let wregs = choose_work_registers(ctx.bitness, ctx.base, old.reg_use_mask, 2);
    let (wreg, wreg2) = (wregs[0], wregs[1]);

    ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
    ctx.push(asm_gen::push_reg(ctx.bitness, wreg2, 0));

    // Evaluate the original `<expr>` the same way the original instruction
    // would: if it references `%base`, that means its *logical* value, not
    // whatever `%base` currently holds (the storage pointer), so restore it
    // around the evaluation exactly like the general case does.
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, wreg2, ctx.base, 0));
    ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, ctx.base, wreg2, spill_slot_offset(ctx.base), 0));
    ctx.push(asm_gen::mov_ptr_from_rm(ctx.bitness, &old.insn, wreg, 0));
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, ctx.base, wreg2, 0));

    // Hand the computed target to `kedr_fill_call_info` through
    // `LocalStorage.scratch` (the wrapper convention only carries one
    // argument, the storage pointer itself, so anything else rides along in
    // a fixed field — the same trick barrier-kind staging uses).
    ctx.push(asm_gen::mov_mem_disp32_reg(ctx.bitness, ctx.base, SCRATCH_OFFSET, wreg, 0));
    stage_call_descriptor(ctx, wreg2, call_idx);
    ctx.call_wrapper_with_storage(ctx.wrappers.fill_call_info);

    if restore_base_for_jump {
        ctx.push(asm_gen::mov_reg_reg(ctx.bitness, wreg2, ctx.base, 0));
        ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, ctx.base, wreg2, spill_slot_offset(ctx.base), 0));
    }

    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg2, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));

    let thunk_insn = asm_gen::call_rel32(ctx.bitness, 0);
    let id = ctx.replace_node(old, thunk_insn);
    ctx.nodes[id].iprel_addr = thunk_addr;
    ctx.nodes[id].call_desc_idx = Some(call_idx);
    id
}

/// "Indirect inner `JMP *<expr>`" (jump-table dispatch within the
/// function). Untouched when `%base` doesn't appear in `<expr>`; otherwise
/// restore `%base` to its logical value long enough to evaluate `<expr>`
/// the way the original code would, stash the result in
/// `LocalStorage.scratch` once `%base` is back to holding the storage
/// pointer, and jump through that slot — leaving both work registers and
/// `%base` exactly as the destination code (still inside this function)
/// expects to find them.
pub(super) fn transform_indirect_jump_inner(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    if !old.reg_use_mask.contains_reg(ctx.base) {
        return ctx.clone_node(old);
    }

    let wregs = choose_work_registers(ctx.bitness, ctx.base, old.reg_use_mask, 2);
    let (wreg, wreg2) = (wregs[0], wregs[1]);

    ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
    ctx.push(asm_gen::push_reg(ctx.bitness, wreg2, 0));

    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, wreg2, ctx.base, 0));
    ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, ctx.base, wreg2, spill_slot_offset(ctx.base), 0));
    ctx.push(asm_gen::mov_ptr_from_rm(ctx.bitness, &old.insn, wreg, 0));
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, ctx.base, wreg2, 0));
    ctx.push(asm_gen::mov_mem_disp32_reg(ctx.bitness, ctx.base, SCRATCH_OFFSET, wreg, 0));

    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg2, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));

    ctx.push(asm_gen::jmp_mem_disp32(ctx.bitness, ctx.base, SCRATCH_OFFSET, 0))
}

/// "Direct call/Jxx rel32 outward": spill `%rax`, stage the descriptor
/// pointer, load `%base` into `%rax` (and restore it for outward jumps),
/// then replace the instruction with a call/jump to the matching thunk.
pub(super) fn transform_direct_outward(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    let is_jump = matches!(old.insn.mnemonic, Mnemonic::JmpRel | Mnemonic::JccRel);

    let mut descriptor = CallDescriptor::new(old.orig_addr);
    descriptor.target_addr = old.iprel_addr;
    let call_idx = push_call_descriptor(ctx, descriptor);

    ctx.push(asm_gen::push_reg(ctx.bitness, Reg::EAX, 0));
    stage_call_descriptor(ctx, Reg::EAX, call_idx);
    ctx.push(asm_gen::mov_reg_reg(ctx.bitness, Reg::EAX, ctx.base, 0));
    if is_jump {
        ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, ctx.base, ctx.base, spill_slot_offset(ctx.base), 0));
    }
    ctx.push(asm_gen::pop_reg(ctx.bitness, Reg::EAX, 0));

    let thunk_addr = if is_jump { ctx.wrappers.jump_thunk } else { ctx.wrappers.call_thunk };
    let thunk_insn = match old.insn.mnemonic {
        Mnemonic::JccRel => asm_gen::jcc_rel32(ctx.bitness, old.insn.cc.expect("JccRel carries cc"), 0),
        Mnemonic::JmpRel => asm_gen::jmp_rel32(ctx.bitness, 0),
        _ => asm_gen::call_rel32(ctx.bitness, 0),
    };
    let id = ctx.replace_node(old, thunk_insn);
    ctx.nodes[id].iprel_addr = thunk_addr;
    ctx.nodes[id].call_desc_idx = Some(call_idx);
    id
}

/// `PUSHAD` (32-bit only): run the original instruction, then
/// overwrite the copy of `%base` it just pushed with the *logical* value
/// held in its spill slot, so a later `POPAD`-free read of the stack image
/// still sees what the original code expects.
pub(super) fn transform_pushad(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    let id = ctx.clone_node(old);
    // `PUSHAD` only reads registers, it clobbers none, so any register other
    // than `%base` is free to borrow here (it gets its value back via the
    // trailing `pop`) regardless of what the instruction's own use-mask says.
    let wreg = choose_work_registers(ctx.bitness, ctx.base, RegMask::empty(), 1)[0];
    ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
    ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, wreg, ctx.base, spill_slot_offset(ctx.base), 0));
    // `+4`: our own push just below the `PUSHAD`-saved image shifts every
    // slot down one word.
    ctx.push(asm_gen::mov_mem_disp8_reg(ctx.bitness, Reg::ESP, pushad_stack_slot(ctx.base) + 4, wreg, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));
    id
}

/// `POPAD` (32-bit only): before it runs, save the logical `%base`
/// value `PUSHAD` left on the stack into the spill slot, then overwrite
/// that stack slot with the current storage pointer, so the real `POPAD`
/// hands `%base` back the storage pointer rather than the logical value.
pub(super) fn transform_popad(ctx: &mut Ctx, old: &IrNode) -> NodeId {
    // Same reasoning as `transform_pushad`: the real `POPAD` hasn't run yet,
    // so every register still holds whatever the function had in it, but
    // that's exactly what the upcoming `POPAD` is about to overwrite anyway.
    let wreg = choose_work_registers(ctx.bitness, ctx.base, RegMask::empty(), 1)[0];
    ctx.push(asm_gen::push_reg(ctx.bitness, wreg, 0));
    ctx.push(asm_gen::mov_reg_mem_disp8(ctx.bitness, wreg, Reg::ESP, pushad_stack_slot(ctx.base) + 4, 0));
    ctx.push(asm_gen::mov_mem_disp8_reg(ctx.bitness, ctx.base, spill_slot_offset(ctx.base), wreg, 0));
    ctx.push(asm_gen::mov_mem_disp8_reg(ctx.bitness, Reg::ESP, pushad_stack_slot(ctx.base) + 4, ctx.base, 0));
    ctx.push(asm_gen::pop_reg(ctx.bitness, wreg, 0));
    ctx.clone_node(old)
}

/// `PUSHAD`/`POPAD` push all 8 32-bit GP registers in a fixed order
/// (`EAX,ECX,EDX,EBX,ESP(original),EBP,ESI,EDI`); `%base`'s slot on the
/// stack sits at `4 * (7 - base.0)` bytes from `%esp` immediately after the
/// push (the format is architectural, not something `kedr-asm` decodes).
fn pushad_stack_slot(base: Reg) -> i8 {
    (4 * (7 - base.0 as i32)) as i8
}

fn push_call_descriptor(ctx: &mut Ctx, descriptor: CallDescriptor) -> usize {
    ctx.calls.push(descriptor);
    ctx.calls.len() - 1
}

/// Write `&ctx.calls[call_idx]` into `LocalStorage.current_call` through
/// `work_reg` (`record.calls` is sized once during transform and never
/// reallocated afterward, so this address is stable for the life of the
/// deployed function).
fn stage_call_descriptor(ctx: &mut Ctx, work_reg: Reg, call_idx: usize) {
    let ptr = &ctx.calls[call_idx] as *const CallDescriptor as u64;
    if matches!(ctx.bitness, Bitness::X64) {
        ctx.push(asm_gen::mov_reg_imm64(work_reg, ptr, 0));
        ctx.push(asm_gen::mov_mem_disp32_reg(ctx.bitness, ctx.base, CURRENT_CALL_OFFSET, work_reg, 0));
    } else {
        ctx.push(asm_gen::mov_mem_disp32_imm32(ctx.bitness, ctx.base, CURRENT_CALL_OFFSET, ptr as i32, 0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushad_stack_slot_places_eax_furthest_and_edi_nearest() {
        assert_eq!(pushad_stack_slot(Reg::EAX), 28);
        assert_eq!(pushad_stack_slot(Reg::EDI), 0);
    }
}
