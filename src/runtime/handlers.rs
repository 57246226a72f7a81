//! Wrapper trampoline entry points the transformer splices calls to.
//!
//! The injected code's calling convention is a single argument in
//! `%rax`/`%eax` with every other scratch register and `EFLAGS` preserved
//! — nothing like the host's ordinary C ABI. Since the injected code
//! contract is architecture-specific machine bytes, not source language,
//! [`assemble_wrapper`] builds the wrapper bytes as a raw byte sequence
//! rather than hand-rolled assembly; the handler it calls into is
//! implemented in the host language behind a stable C-ABI entry point.
use kedr_asm::{Bitness, Reg};

use crate::asm_gen;
use crate::ir::Relocation;

#[derive(Debug, Clone, Copy)]
pub struct WrapperTable {
    pub on_function_entry: u64,
    pub on_function_exit: u64,
    pub fill_call_info: u64,
    pub call_thunk: u64,
    pub jump_thunk: u64,
    pub on_common_block_end: u64,
    pub on_locked_op_pre: u64,
    pub on_locked_op_post: u64,
    pub on_io_mem_op_pre: u64,
    pub on_io_mem_op_post: u64,
    pub on_barrier_pre: u64,
    pub on_barrier_post: u64,
}

impl WrapperTable {
    /// Every field zeroed. Only useful in tests; a real session resolves
    /// each address from the host-language wrapper implementations before
    /// running the transformer.
    pub fn unresolved() -> Self {
        WrapperTable {
            on_function_entry: 0,
            on_function_exit: 0,
            fill_call_info: 0,
            call_thunk: 0,
            jump_thunk: 0,
            on_common_block_end: 0,
            on_locked_op_pre: 0,
            on_locked_op_post: 0,
            on_io_mem_op_pre: 0,
            on_io_mem_op_post: 0,
            on_barrier_pre: 0,
            on_barrier_post: 0,
        }
    }
}

/// Build the raw byte sequence for one wrapper trampoline: save the scratch
/// registers other than `%rax`, move `%rax` into the first C-ABI argument
/// register (`%rdi` on 64-bit; a no-op on 32-bit, where the stack-based
/// argument is `%eax` itself), call `underlying_addr`, restore, return.
/// Returns the bytes alongside the one relocation the emitter/
/// deployer must apply to reach `underlying_addr`.
pub fn assemble_wrapper(bitness: Bitness, underlying_addr: u64, pc: u64) -> (Vec<u8>, Vec<Relocation>) {
    let mut bytes = Vec::new();
    let mut cursor = pc;
    let mut push = |insn: kedr_asm::DecodedInsn| {
        bytes.extend_from_slice(insn.slice());
        cursor += insn.len as u64;
    };

    push(asm_gen::push_reg(bitness, Reg::ECX, cursor));
    push(asm_gen::push_reg(bitness, Reg::EDX, cursor));

    if matches!(bitness, Bitness::X64) {
        push(asm_gen::mov_reg_reg(bitness, Reg::EDI, Reg::EAX, cursor));
    }

    let call_insn = asm_gen::call_rel32(bitness, cursor);
    let call_field_offset = bytes.len() as u32 + call_insn.len as u32 - 4;
    push(call_insn);

    push(asm_gen::pop_reg(bitness, Reg::EDX, cursor));
    push(asm_gen::pop_reg(bitness, Reg::ECX, cursor));
    push(asm_gen::ret(bitness, cursor));

    (bytes, vec![Relocation::rip_like(call_field_offset, underlying_addr)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_carries_exactly_one_relocation_to_the_handler() {
        let (bytes, relocs) = assemble_wrapper(Bitness::X64, 0xffff_ffff_8000_0000, 0x1000);
        assert_eq!(relocs.len(), 1);
        assert!(bytes.ends_with(&[0xC3])); // ret
    }
}
