//! Deployment: lay out every emitted function in a detour buffer,
//! apply relocations, resolve jump tables to runtime addresses, and patch
//! each original function's entry to divert into its instrumented twin.
//!
//! Allocating the detour buffer itself out of a pool guaranteed to lie
//! within ±2 GiB of the target's mapped code is `module_alloc`-equivalent
//! glue, out of scope here the same way `fallback_bases` stands in for
//! it in [`crate::fallback`]; callers supply the buffer.

use kedr_asm::Bitness;
use tracing::debug;

use crate::consts::{DETOUR_ALIGNMENT, NEAR_JUMP_LEN, OPCODE_JMP_REL32, PADDING_BYTE, REL32_RANGE};
use crate::error::{Error, Result};
use crate::fallback::FallbackArea;
use crate::function::FunctionRecord;
use crate::ir::JumpTableSlot;
use crate::module::ModuleImage;

/// The instrumented copy of every function, laid out contiguously at a
/// fixed base address ("16-byte boundary").
pub struct DetourBuffer {
    pub base: u64,
    pub bytes: Vec<u8>,
}

impl DetourBuffer {
    pub fn new(base: u64, len: usize) -> Self {
        DetourBuffer { base, bytes: vec![0u8; len] }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// `true` when a `rel32` field at `from` can reach `to` ("x86-32/
/// x86-64 only").
fn fits_in_rel32(from: u64, to: u64) -> bool {
    let disp = to as i64 - from as i64;
    disp >= -REL32_RANGE && disp < REL32_RANGE
}

/// Compute each function's byte offset within the detour buffer — every
/// body starts 16-byte aligned — and the buffer's minimum size.
pub fn layout_detour_buffer(records: &[FunctionRecord]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(records.len());
    let mut cursor = 0usize;
    for record in records {
        cursor = align_up(cursor, DETOUR_ALIGNMENT);
        offsets.push(cursor);
        cursor += record.instrumented_size as usize;
    }
    (offsets, cursor)
}

/// Deploy every emitted function in `records`: copy its instrumented body
/// into `detour`, apply its relocations, publish its live jump table,
/// retarget the matching fallback table, and patch the original entry with
/// `E9 rel32` + `0xCC` padding.
///
/// `init_hook`/`exit_hook` name the original address of the target module's
/// own `init`/`exit` function, when either was among the instrumented set;
/// the corresponding [`crate::function::FunctionInfo`] gets an on-init-post
/// or on-exit-pre callback published into it.
#[tracing::instrument(skip(module, records, fallback_areas, detour), fields(functions = records.len()))]
pub fn deploy_functions(
    module: &mut ModuleImage,
    bitness: Bitness,
    records: &mut [FunctionRecord],
    fallback_areas: &mut [FallbackArea],
    detour: &mut DetourBuffer,
    init_hook: Option<(u64, u64)>,
    exit_hook: Option<(u64, u64)>,
) -> Result<()> {
    let width = if matches!(bitness, Bitness::X64) { 8usize } else { 4usize };
    let (offsets, total) = layout_detour_buffer(records);
    if total > detour.bytes.len() {
        return Err(Error::OutOfMemory);
    }

    for (record, &offset) in records.iter_mut().zip(&offsets) {
        let instrumented_addr = detour.base + offset as u64;
        if !fits_in_rel32(record.orig_addr + NEAR_JUMP_LEN as u64, instrumented_addr) {
            return Err(Error::UnsupportedInstruction("instrumented copy outside rel32 range of original"));
        }

        let len = record.emission_buffer.len();
        detour.bytes[offset..offset + len].copy_from_slice(&record.emission_buffer);
        record.instrumented_addr = instrumented_addr;

        for reloc in &record.relocations {
            reloc.apply(&mut detour.bytes[offset..offset + len], instrumented_addr);
        }

        for table in record.jump_tables.iter_mut() {
            for slot in table.slots.iter_mut() {
                if let JumpTableSlot::Offset(off) = *slot {
                    *slot = JumpTableSlot::Absolute(instrumented_addr + off as u64);
                }
            }
        }

        publish_live_jump_tables(module, &record.jump_tables, width)?;
        retarget_fallback_jump_tables(module, fallback_areas, record, width)?;

        patch_entry(module, record.orig_addr, record.orig_size, instrumented_addr)?;

        debug!(
            addr = format_args!("{:#x}", record.orig_addr),
            instrumented = format_args!("{:#x}", instrumented_addr),
            "deployed function"
        );
    }

    if let Some((init_addr, hook)) = init_hook {
        if let Some(record) = records.iter().find(|r| r.orig_addr == init_addr) {
            record.info.publish_post_handler(hook);
        }
    }
    if let Some((exit_addr, hook)) = exit_hook {
        if let Some(record) = records.iter().find(|r| r.orig_addr == exit_addr) {
            record.info.publish_pre_handler(hook);
        }
    }

    Ok(())
}

/// Overwrite each table's live entries in the target module with the
/// instrumented-side absolute addresses just resolved (first pass).
fn publish_live_jump_tables(module: &mut ModuleImage, jump_tables: &[crate::ir::JumpTable], width: usize) -> Result<()> {
    for table in jump_tables {
        for (i, slot) in table.slots.iter().enumerate() {
            let JumpTableSlot::Absolute(addr) = *slot else {
                continue;
            };
            module
                .write_word(table.orig_addr + (i * width) as u64, width, addr)
                .ok_or(Error::SpuriousJumpTable(table.orig_addr))?;
        }
    }
    Ok(())
}

/// Patch the fallback copy's own table a second time ("a second
/// time, so the fallback copy uses them correctly"): the table's bytes
/// already sit in the fallback area at the same section-relative offset as
/// the original (copies sections byte for byte), so each slot gets
/// `fallback_base_of_function + fallback_offsets[i]` rather than the
/// instrumented-side address written above.
fn retarget_fallback_jump_tables(
    module: &ModuleImage,
    fallback_areas: &mut [FallbackArea],
    record: &FunctionRecord,
    width: usize,
) -> Result<()> {
    for table in &record.jump_tables {
        let Some(section) = module.section_containing(table.orig_addr) else {
            return Err(Error::SpuriousJumpTable(table.orig_addr));
        };
        let Some(area) = fallback_areas.iter_mut().find(|a| a.section_name == section.name) else {
            return Err(Error::SpuriousJumpTable(table.orig_addr));
        };
        let table_offset = (table.orig_addr - section.base) as usize;

        for (i, &fallback_offset) in table.fallback_offsets.iter().enumerate() {
            let value = record.fallback_addr + fallback_offset as u64;
            let field = table_offset + i * width;
            area.bytes
                .get_mut(field..field + width)
                .ok_or(Error::SpuriousJumpTable(table.orig_addr))?
                .copy_from_slice(&value.to_le_bytes()[..width]);
        }
    }
    Ok(())
}

/// Overwrite the original function's first 5 bytes with `E9 <disp32>` to
/// `instrumented_addr`, padding the rest of its reserved span with `0xCC`.
fn patch_entry(module: &mut ModuleImage, orig_addr: u64, orig_size: u32, instrumented_addr: u64) -> Result<()> {
    let span = module.bytes_at_mut(orig_addr, orig_size as usize).ok_or(Error::OutOfMemory)?;
    let disp = (instrumented_addr as i64 - (orig_addr as i64 + NEAR_JUMP_LEN as i64)) as i32;

    span[0] = OPCODE_JMP_REL32;
    span[1..NEAR_JUMP_LEN as usize].copy_from_slice(&disp.to_le_bytes());
    for byte in &mut span[NEAR_JUMP_LEN as usize..] {
        *byte = PADDING_BYTE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Section;
    use std::collections::HashMap;

    fn simple_function(module: &ModuleImage, bitness: Bitness, addr: u64, size: u32) -> FunctionRecord {
        let (nodes, jump_tables) = crate::ir::build_function_ir(module, bitness, addr, size).unwrap();
        let mut record = FunctionRecord::new(addr, size, None);
        record.nodes = nodes;
        record.jump_tables = jump_tables;
        crate::emit::emit_function(&mut record, bitness);
        record
    }

    #[test]
    fn patches_original_entry_with_near_jump_and_int3_padding() {
        // mov (%rdi),%rax; ret; ret; ret; ret; ret — eight bytes so the
        // 0xCC fill past the 5-byte jump has somewhere to land.
        let bytes = vec![0x48, 0x8B, 0x07, 0xC3, 0xC3, 0xC3, 0xC3, 0xC3];
        let mut module = ModuleImage::new("m").with_section(Section::new(".text", 0x1000, bytes));

        let mut records = vec![simple_function(&module, Bitness::X64, 0x1000, 8)];
        let mut fallback_areas: Vec<FallbackArea> = Vec::new();
        let mut detour = DetourBuffer::new(0x9000_0000, 4096);

        deploy_functions(&mut module, Bitness::X64, &mut records, &mut fallback_areas, &mut detour, None, None)
            .unwrap();

        let section = &module.sections[0];
        assert_eq!(section.bytes[0], 0xE9);
        let disp = i32::from_le_bytes(section.bytes[1..5].try_into().unwrap());
        let target = (0x1000i64 + 5 + disp as i64) as u64;
        assert_eq!(target, records[0].instrumented_addr);
        assert_eq!(&section.bytes[5..8], &[0xCC, 0xCC, 0xCC]);
    }

    #[test]
    fn rejects_a_detour_buffer_too_small_for_the_batch() {
        let bytes = vec![0x48, 0x8B, 0x07, 0xC3, 0xC3];
        let mut module = ModuleImage::new("m").with_section(Section::new(".text", 0x1000, bytes));
        let mut records = vec![simple_function(&module, Bitness::X64, 0x1000, 5)];
        let mut fallback_areas: Vec<FallbackArea> = Vec::new();
        let mut detour = DetourBuffer::new(0x9000_0000, 0);

        let err = deploy_functions(&mut module, Bitness::X64, &mut records, &mut fallback_areas, &mut detour, None, None);
        assert!(matches!(err, Err(Error::OutOfMemory)));
    }

    #[test]
    fn retargets_fallback_jump_table_independently_of_the_live_one() {
        // jmp [0x1010 + eax*4], alone (7 bytes — the table lives past
        // `fn_end` so the decode loop never walks into it as code). Two
        // entries, each pointing back at the dispatch instruction itself.
        let mut bytes = vec![0u8; 24];
        bytes[0] = 0xFF;
        bytes[1] = 0x24;
        bytes[2] = 0x85; // SIB: scale=10(eax*4), index=000(eax), base=101
        bytes[3..7].copy_from_slice(&0x1010u32.to_le_bytes());
        bytes[16..20].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[20..24].copy_from_slice(&0x1000u32.to_le_bytes());

        let module_ro = ModuleImage::new("m").with_section(Section::new(".text", 0x1000, bytes));
        let mut module = module_ro.clone();

        let mut record = simple_function(&module_ro, Bitness::X86, 0x1000, 7);
        assert!(!record.jump_tables.is_empty(), "table must have been extracted");

        let bases = HashMap::from([(".text".to_string(), 0x9000_0000u64)]);
        let mut fallback_records = vec![FunctionRecord::new(0x1000, 7, None)];
        let areas =
            crate::fallback::build_fallback_copies(&module_ro, Bitness::X86, &mut fallback_records, &bases).unwrap();
        record.fallback_addr = fallback_records[0].fallback_addr;
        let mut fallback_areas = areas;

        let mut detour = DetourBuffer::new(0xA000_0000, 4096);
        let mut records = vec![record];

        deploy_functions(&mut module, Bitness::X86, &mut records, &mut fallback_areas, &mut detour, None, None)
            .unwrap();

        let live_entry = u32::from_le_bytes(module.sections[0].bytes[16..20].try_into().unwrap());
        assert_eq!(live_entry as u64, records[0].instrumented_addr, "live table must point into the detour buffer");

        let fallback_entry = u32::from_le_bytes(fallback_areas[0].bytes[16..20].try_into().unwrap());
        assert_eq!(
            fallback_entry as u64,
            records[0].fallback_addr,
            "fallback table must point into the fallback copy, independent of the live table"
        );
    }
}
