//! Base register selection.

use kedr_asm::{Bitness, Mnemonic, Reg, RegMask};

use crate::error::{Error, Result};
use crate::ir::IrNode;

/// Registers the injected wrapper trampolines use for their own calling
/// convention (single argument in `%rax`/`%eax`, other scratch registers
/// preserved around the callback but still clobbered by it) — never eligible
/// to hold `%base` across a call.
const SCRATCH: RegMask = RegMask::from_bits_truncate(RegMask::EAX.bits() | RegMask::ECX.bits() | RegMask::EDX.bits());

fn is_outward_transfer(node: &IrNode) -> bool {
    matches!(node.insn.mnemonic, Mnemonic::CallIndirect | Mnemonic::JmpIndirect)
        || (matches!(node.insn.mnemonic, Mnemonic::CallRel | Mnemonic::JmpRel | Mnemonic::JccRel)
            && node.iprel_addr != 0)
}

/// Pick the general-purpose register used to hold the local-storage address
/// for the lifetime of one instrumented function. Fails the function if any
/// instruction (other than `PUSHAD`/`POPAD`) uses every GP register at once.
pub fn select_base_register(nodes: &[IrNode], bitness: Bitness) -> Result<Reg> {
    let all = if matches!(bitness, Bitness::X64) { RegMask::ALL_64 } else { RegMask::ALL_32 };

    for node in nodes {
        let saturates = (node.reg_use_mask & all) == all
            && !matches!(node.insn.mnemonic, Mnemonic::Pushad | Mnemonic::Popad);
        if saturates {
            return Err(Error::UnsupportedInstruction(
                "instruction uses every general-purpose register and is not PUSHAD/POPAD",
            ));
        }
    }

    let uses_si_string_op = nodes
        .iter()
        .any(|n| matches!(n.insn.mnemonic, Mnemonic::Ins | Mnemonic::Movs | Mnemonic::Lods));
    let uses_di_string_op = nodes
        .iter()
        .any(|n| matches!(n.insn.mnemonic, Mnemonic::Outs | Mnemonic::Movs | Mnemonic::Stos));

    let mut excluded = SCRATCH.with(Reg::ESP);
    if uses_si_string_op {
        excluded = excluded.with(Reg::ESI);
    }
    if uses_di_string_op {
        excluded = excluded.with(Reg::EDI);
    }

    let candidates = all & !excluded;
    if candidates.is_empty() {
        return Err(Error::RegisterPressure(nodes.first().map(|n| n.orig_addr).unwrap_or(0)));
    }

    let mut best: Option<(Reg, u32)> = None;
    for bit in 0u8..16 {
        let reg = Reg(bit);
        if !candidates.contains_reg(reg) {
            continue;
        }
        let refs = count_references(nodes, reg);
        if best.map(|(_, best_refs)| refs < best_refs).unwrap_or(true) {
            best = Some((reg, refs));
        }
    }

    Ok(best.expect("candidates is non-empty, so at least one register was scored").0)
}

fn count_references(nodes: &[IrNode], reg: Reg) -> u32 {
    nodes
        .iter()
        .filter(|node| {
            let effective = if is_outward_transfer(node) { node.reg_use_mask | SCRATCH } else { node.reg_use_mask };
            effective.contains_reg(reg)
        })
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use kedr_asm::Decoder;

    fn decode_nodes(bytes: &[u8], base: u64, bitness: Bitness) -> Vec<IrNode> {
        let decoder = Decoder::new(bitness);
        let mut nodes = Vec::new();
        let mut pc = base;
        let mut offset = 0usize;
        while offset < bytes.len() {
            let insn = decoder.decode(&bytes[offset..], pc).unwrap();
            let id = nodes.len();
            nodes.push(IrNode::reference(insn, pc, id));
            offset += insn.len as usize;
            pc += insn.len as u64;
        }
        nodes
    }

    #[test]
    fn picks_an_unreferenced_register_over_a_busy_one() {
        // mov (%rdi), %rax; ret -- touches rax and rdi (addressing); rbx is
        // untouched.
        let nodes = decode_nodes(&[0x48, 0x8B, 0x07, 0xC3], 0x1000, Bitness::X64);
        let chosen = select_base_register(&nodes, Bitness::X64).unwrap();
        assert!(!chosen.is_sp());
        assert_ne!(chosen, Reg::EAX);
        assert_ne!(chosen, Reg::ECX);
        assert_ne!(chosen, Reg::EDX);
    }

    #[test]
    fn excludes_esi_when_function_contains_lods() {
        // lodsb; ret
        let nodes = decode_nodes(&[0xAC, 0xC3], 0x1000, Bitness::X86);
        let chosen = select_base_register(&nodes, Bitness::X86).unwrap();
        assert_ne!(chosen, Reg::ESI);
    }
}
