//! End-to-end scenarios, one per row of the reference table: build a tiny
//! in-process module, run it through discovery, IR construction, block
//! analysis, transformation, emission and deployment, and check the
//! resulting static artifacts (patched entry, block descriptors, jump
//! tables, call descriptors).

use std::collections::HashMap;

use kedr_asm::Bitness;
use kedr_core::block::{analyze_blocks, select_base_register};
use kedr_core::consts::OPCODE_JMP_REL32;
use kedr_core::deploy::{deploy_functions, layout_detour_buffer, DetourBuffer};
use kedr_core::discovery::discover_functions;
use kedr_core::emit::emit_function;
use kedr_core::fallback::build_fallback_copies;
use kedr_core::ir::build_function_ir;
use kedr_core::module::{ModuleImage, Section};
use kedr_core::runtime::WrapperTable;
use kedr_core::transform::transform_function;
use kedr_core::FunctionRecord;

const SECTION_BASE: u64 = 0x1000;
const FALLBACK_BASE: u64 = 0x9000_0000;
const DETOUR_BASE: u64 = 0xA000_0000;

/// Build a single-section, single-symbol module, run it through the whole
/// pipeline, and return both the (now patched) module and the finished
/// function record.
fn instrument_single_function(bytes: Vec<u8>, bitness: Bitness) -> (ModuleImage, FunctionRecord) {
    let module = ModuleImage::new("target")
        .with_section(Section::new(".text", SECTION_BASE, bytes))
        .with_symbol("probe", SECTION_BASE);
    let bases = HashMap::from([(".text".to_string(), FALLBACK_BASE)]);
    instrument(module, bitness, bases)
}

fn instrument(mut module: ModuleImage, bitness: Bitness, bases: HashMap<String, u64>) -> (ModuleImage, FunctionRecord) {
    let mut records = discover_functions(&module, bitness);
    assert_eq!(records.len(), 1, "exactly one function must be discovered");

    let mut fallback_areas = build_fallback_copies(&module, bitness, &mut records, &bases).unwrap();

    let mut record = records.pop().unwrap();
    let (nodes, jump_tables) = build_function_ir(&module, bitness, record.orig_addr, record.orig_size).unwrap();
    record.nodes = nodes;
    record.jump_tables = jump_tables;
    record.blocks = analyze_blocks(&mut record.nodes, &record.jump_tables);
    let base = select_base_register(&record.nodes, bitness).unwrap();
    let wrappers = WrapperTable::unresolved();
    transform_function(&mut record, bitness, base, &wrappers);
    emit_function(&mut record, bitness);

    let mut records = vec![record];
    let (_, total) = layout_detour_buffer(&records);
    let mut detour = DetourBuffer::new(DETOUR_BASE, total);
    deploy_functions(&mut module, bitness, &mut records, &mut fallback_areas, &mut detour, None, None).unwrap();

    (module, records.pop().unwrap())
}

#[test]
fn straight_line_read_gets_a_single_common_block_and_a_patched_entry() {
    // mov (%rdi),%rax; ret x5 — padded with more RETs, not zeros, so
    // discovery doesn't trim the function back down past byte 4.
    let bytes = vec![0x48, 0x8B, 0x07, 0xC3, 0xC3, 0xC3, 0xC3, 0xC3];
    let (module, record) = instrument_single_function(bytes, Bitness::X64);

    assert_eq!(record.blocks.len(), 1, "only the leading mov forms a memory-event block");
    assert_eq!(record.blocks[0].max_events, 1);
    assert_eq!(record.blocks[0].read_mask, 1);

    let entry = module.bytes_at(SECTION_BASE, 8).unwrap();
    assert_eq!(entry[0], OPCODE_JMP_REL32);
    let disp = i32::from_le_bytes(entry[1..5].try_into().unwrap());
    let target = (SECTION_BASE as i64 + 5 + disp as i64) as u64;
    assert_eq!(target, record.instrumented_addr);
    assert_eq!(&entry[5..8], &[0xCC, 0xCC, 0xCC]);
}

#[test]
fn locked_update_gets_a_locked_update_block() {
    // lock incl (%rdi); ret x5
    let bytes = vec![0xF0, 0xFF, 0x07, 0xC3, 0xC3, 0xC3, 0xC3, 0xC3];
    let (module, record) = instrument_single_function(bytes, Bitness::X64);

    assert_eq!(record.blocks.len(), 1);
    assert_eq!(record.blocks[0].write_mask, 1, "a locked RMW counts as a write for block-descriptor purposes");

    let entry = module.bytes_at(SECTION_BASE, 1).unwrap();
    assert_eq!(entry[0], OPCODE_JMP_REL32);
}

#[test]
fn short_conditional_rewrites_short_jumps_and_still_emits() {
    // xor %eax,%eax; jz +2; jmp -4; ret
    let bytes = vec![0x31, 0xC0, 0x74, 0x02, 0xEB, 0xFC, 0xC3];
    let (_, record) = instrument_single_function(bytes, Bitness::X64);

    // The backward jmp forces its own block, distinct from the straight-line
    // run ahead of it; emission must still have produced a nonempty buffer.
    assert!(record.is_emitted());
    assert!(record.instrumented_size > 0);
}

#[test]
fn indirect_table_dispatch_is_detected_and_deployed() {
    // jmp [eax*4 + disp32] — FF /4, ModRM 0x24, SIB 0x85 (scale=4, index=eax,
    // base=none) — the canonical table-dispatch encoding. The table itself
    // lives in a separate section so it never falls inside the function's
    // own decoded byte range.
    let mut dispatch = vec![0xFF, 0x24, 0x85, 0, 0, 0, 0];
    let table_addr: u32 = 0x2000;
    dispatch[3..7].copy_from_slice(&table_addr.to_le_bytes());

    let mut table = Vec::new();
    table.extend_from_slice(&(SECTION_BASE as u32).to_le_bytes()); // slot 0 -> function start
    table.extend_from_slice(&(SECTION_BASE as u32).to_le_bytes()); // slot 1 -> same

    let module = ModuleImage::new("target")
        .with_section(Section::new(".text", SECTION_BASE, dispatch))
        .with_section(Section::new(".rodata", table_addr as u64, table))
        .with_symbol("probe", SECTION_BASE);
    let bases = HashMap::from([(".text".to_string(), FALLBACK_BASE), (".rodata".to_string(), FALLBACK_BASE + 0x1000)]);

    let (module, record) = instrument(module, Bitness::X86, bases);

    assert_eq!(record.jump_tables.len(), 1);
    assert_eq!(record.jump_tables[0].slots.len(), 2);

    let entry = module.bytes_at(SECTION_BASE, 1).unwrap();
    assert_eq!(entry[0], OPCODE_JMP_REL32);
}

#[test]
fn outward_call_records_a_call_descriptor_with_the_original_absolute_target() {
    // call rel32 (outward); ret
    let mut bytes = vec![0xE8, 0, 0, 0, 0, 0xC3];
    let disp = (0x9000i64 - (SECTION_BASE as i64 + 5)) as i32;
    bytes[1..5].copy_from_slice(&disp.to_le_bytes());

    let (_, record) = instrument_single_function(bytes, Bitness::X64);
    assert_eq!(record.calls.len(), 1);
    assert_eq!(record.calls[0].target_addr, 0x9000);
}

#[test]
fn rip_relative_into_self_fails_and_leaves_the_module_unpatched() {
    // mov %rax, (%rip + disp) where disp re-targets the function's own start.
    let mut bytes = vec![0x48, 0x8B, 0x05, 0, 0, 0, 0, 0xC3];
    let next_insn_addr = SECTION_BASE + 7;
    let disp = (SECTION_BASE as i64 - next_insn_addr as i64) as i32;
    bytes[3..7].copy_from_slice(&disp.to_le_bytes());
    let original = bytes.clone();

    let module = ModuleImage::new("target")
        .with_section(Section::new(".text", SECTION_BASE, bytes))
        .with_symbol("probe", SECTION_BASE);
    let mut records = discover_functions(&module, Bitness::X64);
    let record = records.pop().unwrap();

    let err = build_function_ir(&module, Bitness::X64, record.orig_addr, record.orig_size).unwrap_err();
    assert!(matches!(err, kedr_core::Error::UnsupportedInstruction(_)));
    assert_eq!(module.sections[0].bytes, original, "a function that fails IR construction must not be patched");
}
