//! IR construction.

use std::collections::HashMap;

use kedr_asm::{Bitness, Decoder, Mnemonic};
use tracing::trace;

use crate::asm_gen;
use crate::error::{Error, Result};
use crate::ir::jumptable::{JumpTable, JumpTableSlot};
use crate::ir::node::{IrNode, NodeId};
use crate::module::ModuleImage;

/// Build the IR for one function: decode its instructions, link direct
/// jumps, expand short/loop-family jumps into near equivalents, and extract
/// jump tables (steps 1-4).
pub fn build_function_ir(
    module: &ModuleImage,
    bitness: Bitness,
    orig_addr: u64,
    orig_size: u32,
) -> Result<(Vec<IrNode>, Vec<JumpTable>)> {
    let fn_end = orig_addr + orig_size as u64;
    let decoder = Decoder::new(bitness);

    // Step 1: decode every instruction into a reference node.
    let mut nodes = Vec::new();
    let mut pc = orig_addr;
    while pc < fn_end {
        let section = module
            .section_containing(pc)
            .expect("function address must lie within a known section");
        let offset = (pc - section.base) as usize;
        let insn = decoder.decode(&section.bytes[offset..], pc)?;
        trace!(pc = format_args!("{pc:#x}"), mnemonic = %insn.mnemonic, len = insn.len, "decoded instruction");

        let id = nodes.len();
        let mut node = IrNode::reference(insn, pc, id);

        if insn.rip_relative {
            let next_insn_addr = pc + insn.len as u64;
            let target = next_insn_addr.wrapping_add(insn.disp.value as u64);
            if target >= orig_addr && target < fn_end {
                return Err(Error::UnsupportedInstruction(
                    "RIP-relative addressing points back into the same function",
                ));
            }
            node.iprel_addr = target;
        } else if matches!(insn.mnemonic, Mnemonic::JmpRel | Mnemonic::JccRel | Mnemonic::CallRel) {
            if let Some(target) = insn.jump_target {
                let leaves_function = target < orig_addr || target >= fn_end;
                if leaves_function {
                    node.iprel_addr = target;
                }
            }
        }

        nodes.push(node);
        pc += insn.len as u64;
    }

    if let Some(last) = nodes.last() {
        if !last.insn.is_control_transfer() {
            return Err(Error::IncompleteFunction(orig_addr));
        }
    } else {
        return Err(Error::IncompleteFunction(orig_addr));
    }

    // Step 2: address -> node map, then link direct-jump dest_inner.
    let addr_to_node = address_map(&nodes);
    for id in 0..nodes.len() {
        let (mnemonic, target) = (nodes[id].insn.mnemonic, nodes[id].dest_addr);
        if target == 0 || !is_direct_inner_jump_candidate(mnemonic) {
            continue;
        }
        if target < orig_addr || target >= fn_end {
            continue; // handled as an outward transfer above, not an inner link.
        }
        match addr_to_node.get(&target) {
            Some(&dest) => nodes[id].dest_inner = Some(dest),
            None => {
                return Err(Error::UnsupportedInstruction(
                    "direct jump target does not align with an instruction boundary",
                ))
            }
        }
    }

    // Step 3: short-form rewriting.
    rewrite_short_forms(bitness, orig_addr, fn_end, &mut nodes)?;

    // Step 4: jump table extraction, over the final node list.
    let addr_to_node = address_map(&nodes);
    let jump_tables = extract_jump_tables(module, bitness, orig_addr, fn_end, &nodes, &addr_to_node)?;

    Ok((nodes, jump_tables))
}

fn address_map(nodes: &[IrNode]) -> HashMap<u64, NodeId> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| !n.is_added())
        .map(|(id, n)| (n.orig_addr, id))
        .collect()
}

fn is_direct_inner_jump_candidate(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::JmpRel | Mnemonic::JccRel | Mnemonic::Jcxz | Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne
    )
}

/// `JMP rel8` -> `JMP rel32`, `Jcc rel8` -> `Jcc rel32`, and the
/// `JCXZ`/`LOOP*` three-node expansion.
fn rewrite_short_forms(
    bitness: Bitness,
    orig_addr: u64,
    fn_end: u64,
    nodes: &mut Vec<IrNode>,
) -> Result<()> {
    // In-place rel8 -> rel32 upgrades for plain short jumps; these keep the
    // node count (and therefore every index) unchanged.
    for node in nodes.iter_mut() {
        match node.insn.mnemonic {
            Mnemonic::JmpRel if node.insn.len == 2 => {
                node.insn = asm_gen::jmp_rel32(bitness, node.orig_addr);
            }
            Mnemonic::JccRel if node.insn.len == 2 => {
                let cc = node.insn.cc.expect("JccRel always carries a condition code");
                node.insn = asm_gen::jcc_rel32(bitness, cc, node.orig_addr);
            }
            _ => {}
        }
    }

    let needs_expansion = |m: Mnemonic| matches!(m, Mnemonic::Jcxz | Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne);
    if !nodes.iter().any(|n| needs_expansion(n.insn.mnemonic)) {
        return Ok(());
    }

    let mut expanded = Vec::with_capacity(nodes.len() + 2 * nodes.len() / 8);
    let mut old_to_new = vec![0usize; nodes.len()];

    for (old_id, node) in nodes.iter().enumerate() {
        if needs_expansion(node.insn.mnemonic) {
            let insn_end = node.orig_addr + node.insn.len as u64;
            if insn_end == fn_end {
                return Err(Error::UnsupportedInstruction(
                    "JCXZ/LOOP family at the last byte of the function (likely misjoined split)",
                ));
            }

            let first_new = expanded.len();
            old_to_new[old_id] = first_new;

            // Node 0: the original conditional (same opcode: `JCXZ`/`LOOP*`
            // keep their own single-byte encoding, unlike `Jcc`), whose
            // 2-byte forward displacement — skipping the near jump below
            // it — is finalized once offsets are known.
            let mut cond = node.clone();
            cond.first = first_new;
            expanded.push(cond);

            // Node 1: `JMP rel8` skipping the near jump that follows it.
            let skip_id = first_new + 1;
            let mut skip = IrNode::added(asm_gen::jmp_rel8(bitness, 0), skip_id);
            skip.first = skip_id;
            skip.last = skip_id;
            expanded.push(skip);

            // Node 2: `JMP rel32` carrying the true destination.
            let true_jump_id = first_new + 2;
            let mut true_jump = IrNode::added(asm_gen::jmp_rel32(bitness, 0), true_jump_id);
            true_jump.dest_addr = node.dest_addr;
            true_jump.first = true_jump_id;
            true_jump.last = true_jump_id;
            expanded.push(true_jump);

            expanded[first_new].last = true_jump_id;
        } else {
            old_to_new[old_id] = expanded.len();
            let mut moved = node.clone();
            moved.first = expanded.len();
            moved.last = expanded.len();
            expanded.push(moved);
        }
    }

    for node in expanded.iter_mut() {
        if let Some(dest) = node.dest_inner {
            node.dest_inner = Some(old_to_new[dest]);
        }
    }

    // The true-jump's dest_inner, if its destination lies inside the
    // function, still needs linking now that node indices are final.
    let addr_to_node = address_map(&expanded);
    for node in expanded.iter_mut() {
        if node.is_added() && node.dest_addr != 0 && node.dest_inner.is_none() {
            if node.dest_addr >= orig_addr && node.dest_addr < fn_end {
                node.dest_inner = addr_to_node.get(&node.dest_addr).copied();
            }
        }
    }

    *nodes = expanded;
    Ok(())
}

/// Extract jump tables referenced by `JMP [disp32 + reg*scale]` dispatches.
fn extract_jump_tables(
    module: &ModuleImage,
    bitness: Bitness,
    orig_addr: u64,
    fn_end: u64,
    nodes: &[IrNode],
    addr_to_node: &HashMap<u64, NodeId>,
) -> Result<Vec<JumpTable>> {
    let width = if matches!(bitness, Bitness::X64) { 8 } else { 4 };
    let mut tables: Vec<JumpTable> = Vec::new();

    for (id, node) in nodes.iter().enumerate() {
        if node.insn.mnemonic != Mnemonic::JmpIndirect {
            continue;
        }
        let Some(modrm) = node.insn.modrm else { continue };
        let Some(sib) = node.insn.sib else { continue };
        if !(modrm.is_sib_indexed_no_disp8() && sib.base_is_disp32_only()) {
            continue;
        }
        let table_addr = node.insn.disp.value as u64;

        let mut table = JumpTable::new(table_addr, id);
        let mut i = 0u64;
        loop {
            let Some(candidate) = module.read_word(table_addr + i * width as u64, width) else {
                break;
            };
            if candidate < orig_addr || candidate >= fn_end {
                break;
            }
            match addr_to_node.get(&candidate) {
                Some(&dest) => {
                    table.slots.push(JumpTableSlot::Node(dest));
                    table.fallback_offsets.push((candidate - orig_addr) as u32);
                }
                None => return Err(Error::SpuriousJumpTable(table_addr)),
            }
            i += 1;
        }

        if let Some(existing) = tables.iter_mut().find(|t| {
            t.orig_addr + (t.len() as u64) * width as u64 == table.orig_addr + (table.len() as u64) * width as u64
        }) {
            existing.absorb_shorter(&table);
        } else {
            tables.push(table);
        }
    }

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Section;

    fn single_section_module(bytes: Vec<u8>, base: u64) -> ModuleImage {
        ModuleImage::new("test").with_section(Section::new(".text", base, bytes))
    }

    #[test]
    fn builds_ir_for_straight_line_function() {
        // mov (%rdi), %rax; ret
        let module = single_section_module(vec![0x48, 0x8B, 0x07, 0xC3], 0x1000);
        let (nodes, tables) = build_function_ir(&module, Bitness::X64, 0x1000, 4).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(tables.is_empty());
        assert!(nodes[1].insn.is_exit());
    }

    #[test]
    fn rejects_incomplete_function() {
        // mov eax, ebx (no control transfer at all)
        let module = single_section_module(vec![0x89, 0xD8], 0x1000);
        let err = build_function_ir(&module, Bitness::X86, 0x1000, 2).unwrap_err();
        assert!(matches!(err, Error::IncompleteFunction(_)));
    }

    #[test]
    fn rejects_self_referential_rip_relative() {
        // mov eax, [rip+0]; ret -- disp32 = 0 means it targets the very
        // next instruction, which is still inside this 7-byte function.
        let module = single_section_module(vec![0x8B, 0x05, 0x00, 0x00, 0x00, 0x00, 0xC3], 0x1000);
        let err = build_function_ir(&module, Bitness::X64, 0x1000, 7).unwrap_err();
        assert!(matches!(err, Error::UnsupportedInstruction(_)));
    }

    #[test]
    fn expands_loop_into_three_nodes() {
        // loop -2 (self-loop placeholder byte); nop; ret
        let module = single_section_module(vec![0xE2, 0xFE, 0x90, 0xC3], 0x1000);
        let (nodes, _) = build_function_ir(&module, Bitness::X86, 0x1000, 4).unwrap();
        // loop expands to 3 + nop + ret = 5
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0].first, 0);
        assert_eq!(nodes[0].last, 2);
    }

    #[test]
    fn upgrades_short_jump_to_near_form() {
        // jmp +2 (to the ret past a 2-byte nop/nop); nop; nop; ret
        let module = single_section_module(vec![0xEB, 0x02, 0x90, 0x90, 0xC3], 0x1000);
        let (nodes, _) = build_function_ir(&module, Bitness::X86, 0x1000, 5).unwrap();
        assert_eq!(nodes[0].insn.len, 5); // rel32 form after rewriting
        assert_eq!(nodes[0].dest_inner, Some(3));
    }
}
