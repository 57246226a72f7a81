//! Function discovery.
//!
//! Grounded on `find_functions`/`compare_items`/`remove_aliases_and_small_funcs`
//! in `original_source/sources/core/ifunc.c`: collect every eligible symbol,
//! add a sentinel at each section start and at the end of the init/core
//! areas, sort `(address, insertion index)` stably, size each real function
//! as the gap to the next record, trim trailing padding, then drop anything
//! under a near jump's length.

use kedr_asm::{Bitness, Decoder};
use tracing::{debug, warn};

use crate::consts::NEAR_JUMP_LEN;
use crate::function::FunctionRecord;
use crate::module::ModuleImage;

/// One entry in the boundary-sort array: either a real function or a
/// sentinel with no name. Sentinels never become [`FunctionRecord`]s
/// themselves; they only bound the preceding function's size.
struct Boundary {
    addr: u64,
    name: Option<String>,
}

const ALIASES: &[&str] = &["init_module", "cleanup_module"];

/// Enumerate every instrumentable function in `module`.
#[tracing::instrument(skip(module), fields(module = %module.name))]
pub fn discover_functions(module: &ModuleImage, bitness: Bitness) -> Vec<FunctionRecord> {
    let mut boundaries: Vec<Boundary> = Vec::new();

    for symbol in &module.symbols {
        if ALIASES.contains(&symbol.name.as_str()) {
            continue;
        }
        if !module.contains_addr(symbol.addr) {
            continue;
        }
        boundaries.push(Boundary { addr: symbol.addr, name: Some(symbol.name.clone()) });
    }

    if boundaries.is_empty() {
        debug!("no candidate symbols found in target module");
        return Vec::new();
    }

    // Sentinels: one per section start, one at the end of each section
    // (stands in for "end of init"/"end of core" text areas).
    for section in &module.sections {
        boundaries.push(Boundary { addr: section.base, name: None });
        boundaries.push(Boundary { addr: section.end(), name: None });
    }

    // Stable sort by (address, insertion index) — Rust's slice::sort_by_key
    // is a stable sort, so insertion order is preserved for ties exactly as
    // `compare_items`'s lexicographic (addr, index) comparison requires
    // ("sorting of function boundaries is stable").
    boundaries.sort_by_key(|b| b.addr);

    let mut records = Vec::new();
    for i in 0..boundaries.len() {
        let Some(name) = &boundaries[i].name else { continue };
        let addr = boundaries[i].addr;
        let next_addr = boundaries[i + 1..].iter().map(|b| b.addr).find(|&a| a > addr).unwrap_or(addr);
        let raw_size = next_addr.saturating_sub(addr);
        if raw_size == 0 {
            continue; // alias of another symbol at the same address
        }

        let Some(trimmed) = trim_trailing_padding(module, addr, raw_size as usize) else {
            warn!(function = %name, addr = format_args!("{addr:#x}"), "could not read function bytes, skipping");
            continue;
        };

        let adjusted = adjust_for_truncated_instruction(module, bitness, addr, trimmed);

        if adjusted < NEAR_JUMP_LEN {
            debug!(function = %name, size = adjusted, "function too small to detour, skipping");
            continue;
        }

        records.push(FunctionRecord::new(addr, adjusted as u32, Some(name.clone())));
    }

    records
}

/// Trim trailing zero-padding bytes. Returns `None` if the function's
/// bytes are not fully readable from a single section.
fn trim_trailing_padding(module: &ModuleImage, addr: u64, raw_size: usize) -> Option<usize> {
    let bytes = module.bytes_at(addr, raw_size)?;
    let mut size = raw_size;
    while size > 0 && bytes[size - 1] == 0 {
        size -= 1;
    }
    Some(size)
}

/// Re-decode the function to recover any trailing instruction the zero trim
/// would have truncated: walk instructions until `size` is reached or
/// exceeded, and if the last decoded instruction spills past `size`, grow
/// `size` to cover it in full.
fn adjust_for_truncated_instruction(module: &ModuleImage, bitness: Bitness, addr: u64, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let decoder = Decoder::new(bitness);
    let mut offset = 0usize;
    let mut adjusted = size;
    while offset < size {
        let Some(bytes) = module.bytes_at(addr + offset as u64, 15.min(module_remaining(module, addr + offset as u64))) else {
            break;
        };
        let Ok(insn) = decoder.decode(bytes, addr + offset as u64) else { break };
        let end = offset + insn.len as usize;
        if end > adjusted {
            adjusted = end;
        }
        offset = end;
    }
    adjusted
}

fn module_remaining(module: &ModuleImage, addr: u64) -> usize {
    module.section_containing(addr).map(|s| (s.end() - addr) as usize).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Section;

    fn module_with(bytes: Vec<u8>, base: u64, symbols: &[(&str, u64)]) -> ModuleImage {
        let mut module = ModuleImage::new("test_mod").with_section(Section::new(".text", base, bytes));
        for (name, addr) in symbols {
            module = module.with_symbol(*name, *addr);
        }
        module
    }

    #[test]
    fn discovers_a_single_function_sized_to_section_end() {
        // mov (%rdi), %rax; ret, padded with zeros to 8 bytes.
        let bytes = vec![0x48, 0x8B, 0x07, 0xC3, 0, 0, 0, 0];
        let module = module_with(bytes, 0x1000, &[("probe", 0x1000)]);
        let records = discover_functions(&module, Bitness::X64);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].orig_addr, 0x1000);
        assert_eq!(records[0].orig_size, 4);
        assert_eq!(records[0].name.as_deref(), Some("probe"));
    }

    #[test]
    fn discards_functions_shorter_than_a_near_jump() {
        // A 3-byte function (ret padded) can never host a 5-byte detour jump.
        let bytes = vec![0xC3, 0, 0];
        let module = module_with(bytes, 0x1000, &[("tiny", 0x1000)]);
        let records = discover_functions(&module, Bitness::X64);
        assert!(records.is_empty());
    }

    #[test]
    fn filters_out_init_module_and_cleanup_module_aliases() {
        let bytes = vec![0xC3, 0, 0, 0, 0, 0, 0, 0];
        let module = module_with(bytes, 0x1000, &[("init_module", 0x1000)]);
        let records = discover_functions(&module, Bitness::X64);
        assert!(records.is_empty());
    }

    #[test]
    fn stable_sort_preserves_insertion_order_for_aliased_addresses() {
        let bytes = vec![0x48, 0x8B, 0x07, 0xC3, 0, 0, 0, 0];
        let module = module_with(bytes, 0x1000, &[("first_name", 0x1000), ("second_name", 0x1000)]);
        let records = discover_functions(&module, Bitness::X64);
        // Both symbols alias the same address; only the first survives
        // (the second has raw_size == 0 relative to the first).
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("first_name"));
    }
}
