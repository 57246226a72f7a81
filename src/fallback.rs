//! Fallback copier.
//!
//! Grounded on `alloc_fallback_areas`/`relocate_insn_in_fallback` in
//! `original_source/sources/core/i13n.c`: copy each of the target's code
//! sections into a freshly allocated buffer, then walk every instruction
//! inside each known function and rewrite any `CALL`/`JMP`/`Jcc rel32` (or,
//! on 64-bit, RIP-relative access) whose target lies outside that function
//! so the copy keeps referring to the same absolute address. A `JMP [disp32
//! + reg*scale]` table dispatch gets the opposite treatment: its disp32 is
//! retargeted at the copy's own table (which sits at the same offset as the
//! original, since the whole section came over byte for byte), so the
//! fallback path's table can be patched a second time at deployment
//! without disturbing the live module's copy.
//!
//! Real kernel glue allocates the buffer with `module_alloc`, out of scope
//! here; callers supply the base address each section's copy will live
//! at (`fallback_bases`) the way the real core would supply a
//! `module_alloc` result.

use std::collections::HashMap;

use kedr_asm::{Bitness, Decoder, Mnemonic};
use tracing::debug;

use crate::error::Result;
use crate::function::FunctionRecord;
use crate::module::ModuleImage;

/// A relocated copy of one of the target's code sections.
#[derive(Debug, Clone)]
pub struct FallbackArea {
    pub section_name: String,
    pub base: u64,
    pub bytes: Vec<u8>,
}

/// Build one relocated fallback copy per section and stamp each function
/// record's `fallback_addr` to point into it.
///
/// `fallback_bases` supplies the runtime address each section's copy will
/// be deployed at, keyed by section name; every section named in `module`
/// must have an entry.
#[tracing::instrument(skip(module, records, fallback_bases), fields(module = %module.name))]
pub fn build_fallback_copies(
    module: &ModuleImage,
    bitness: Bitness,
    records: &mut [FunctionRecord],
    fallback_bases: &HashMap<String, u64>,
) -> Result<Vec<FallbackArea>> {
    let mut areas = Vec::with_capacity(module.sections.len());

    for section in &module.sections {
        let fallback_base = *fallback_bases
            .get(&section.name)
            .unwrap_or_else(|| panic!("no fallback base supplied for section {:?}", section.name));

        let mut bytes = section.bytes.clone();

        for record in records.iter() {
            if !section.contains(record.orig_addr) {
                continue;
            }
            relocate_function_in_fallback(&mut bytes, bitness, section.base, fallback_base, record);
        }

        debug!(section = %section.name, base = format_args!("{fallback_base:#x}"), "built fallback copy");
        areas.push(FallbackArea { section_name: section.name.clone(), base: fallback_base, bytes });
    }

    for record in records.iter_mut() {
        let Some(section) = module.section_containing(record.orig_addr) else { continue };
        let fallback_base = fallback_bases[&section.name];
        record.fallback_addr = fallback_base + (record.orig_addr - section.base);
    }

    Ok(areas)
}

/// Relocate every out-of-function `rel32` transfer and RIP-relative access
/// within one function's extent in `bytes` (already a straight copy of the
/// section), in place.
fn relocate_function_in_fallback(
    bytes: &mut [u8],
    bitness: Bitness,
    section_base: u64,
    fallback_base: u64,
    record: &FunctionRecord,
) {
    let decoder = Decoder::new(bitness);
    let fn_start = record.orig_addr;
    let fn_end = fn_start + record.orig_size as u64;
    let mut pc = fn_start;

    while pc < fn_end {
        let offset = (pc - section_base) as usize;
        let Ok(insn) = decoder.decode(&bytes[offset..], pc) else { break };
        let insn_len = insn.len as usize;
        let fallback_pc = fallback_base + (pc - section_base);

        let is_rel32_transfer =
            matches!(insn.mnemonic, Mnemonic::CallRel | Mnemonic::JmpRel | Mnemonic::JccRel);
        let is_jump_table_dispatch = insn.mnemonic == Mnemonic::JmpIndirect
            && insn.modrm.is_some_and(|m| m.is_sib_indexed_no_disp8())
            && insn.sib.is_some_and(|s| s.base_is_disp32_only());

        if is_rel32_transfer {
            if let Some(target) = insn.jump_target {
                if target < fn_start || target >= fn_end {
                    let field = offset + insn_len - 4;
                    let next_insn_fallback_addr = fallback_pc + insn_len as u64;
                    let disp = target.wrapping_sub(next_insn_fallback_addr) as i64 as i32;
                    bytes[field..field + 4].copy_from_slice(&disp.to_le_bytes());
                }
            }
        } else if is_jump_table_dispatch {
            // The table itself still lives at its absolute original address
            // in `bytes` (a raw copy of the section); retarget the dispatch
            // at the copy's own table instead, so the fallback copy's
            // entries can diverge from the live module's table — each
            // table gets patched a second time, independently, so the
            // live and fallback paths never fight over one set of slots.
            let table_addr = insn.disp.value as u64;
            let field = offset + insn_len - 4;
            let fallback_table_addr = fallback_base + (table_addr - section_base);
            bytes[field..field + 4].copy_from_slice(&(fallback_table_addr as u32).to_le_bytes());
        } else if matches!(bitness, Bitness::X64) && insn.rip_relative {
            let next_insn_orig_addr = pc + insn_len as u64;
            let target = next_insn_orig_addr.wrapping_add(insn.disp.value as u64);
            let field = offset + insn_len - 4;
            let next_insn_fallback_addr = fallback_pc + insn_len as u64;
            let disp = target.wrapping_sub(next_insn_fallback_addr) as i64 as i32;
            bytes[field..field + 4].copy_from_slice(&disp.to_le_bytes());
        }

        pc += insn_len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Section;

    #[test]
    fn outward_call_keeps_referring_to_the_same_absolute_target() {
        // call rel32 to 0x2000 (outside this tiny function), then ret.
        let mut bytes = vec![0xE8, 0, 0, 0, 0, 0xC3];
        let disp = (0x2000i64 - (0x1000 + 5)) as i32;
        bytes[1..5].copy_from_slice(&disp.to_le_bytes());

        let module = ModuleImage::new("m").with_section(Section::new(".text", 0x1000, bytes));
        let mut records = vec![FunctionRecord::new(0x1000, 6, None)];
        let bases = HashMap::from([(".text".to_string(), 0x9000_0000)]);

        let areas = build_fallback_copies(&module, Bitness::X64, &mut records, &bases).unwrap();
        assert_eq!(records[0].fallback_addr, 0x9000_0000);

        let area = &areas[0];
        let new_disp = i32::from_le_bytes(area.bytes[1..5].try_into().unwrap());
        let next_insn_fallback_addr = area.base + 5;
        let target = (next_insn_fallback_addr as i64 + new_disp as i64) as u64;
        assert_eq!(target, 0x2000, "call must still reach the original absolute target");
    }

    #[test]
    fn jump_table_dispatch_is_retargeted_at_the_copied_table() {
        // jmp [0x3000 + eax*1], FF /4 with SIB.base == 5 (no base register).
        let mut bytes = vec![0xFF, 0x24, 0x25, 0, 0, 0, 0];
        bytes[3..7].copy_from_slice(&0x3000u32.to_le_bytes());

        let module = ModuleImage::new("m").with_section(Section::new(".text", 0x1000, bytes));
        let mut records = vec![FunctionRecord::new(0x1000, 7, None)];
        let bases = HashMap::from([(".text".to_string(), 0x9000_0000)]);

        let areas = build_fallback_copies(&module, Bitness::X86, &mut records, &bases).unwrap();
        let area = &areas[0];
        let new_table_addr = u32::from_le_bytes(area.bytes[3..7].try_into().unwrap());
        assert_eq!(
            new_table_addr as u64,
            0x9000_0000 + (0x3000 - 0x1000),
            "dispatch must point at the table's own copy, not the live module's"
        );
    }

    #[test]
    fn inward_jump_is_left_untouched() {
        // jmp rel32 to the ret two bytes later (inside the function).
        let mut bytes = vec![0xE9, 0, 0, 0, 0, 0x90, 0xC3];
        let disp = (0x1000i64 + 5 - (0x1000 + 5)) as i32;
        bytes[1..5].copy_from_slice(&disp.to_le_bytes());
        let original = bytes.clone();

        let module = ModuleImage::new("m").with_section(Section::new(".text", 0x1000, bytes));
        let mut records = vec![FunctionRecord::new(0x1000, 7, None)];
        let bases = HashMap::from([(".text".to_string(), 0x9000_0000)]);

        build_fallback_copies(&module, Bitness::X64, &mut records, &bases).unwrap();
        assert_eq!(module.sections[0].bytes, original, "module's own bytes must never be mutated");
    }
}
