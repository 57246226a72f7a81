//! Local storage: the per-call activation record the instrumented code
//! uses as working memory.

use std::ptr::NonNull;

use kedr_asm::Reg;

use crate::consts::MAX_BLOCK_VALUE_SLOTS;

/// Number of general-purpose registers the spill area reserves a slot for —
/// sized for the 64-bit register file so the same layout serves both
/// bitnesses (32-bit functions simply never address slots 8..=15).
pub const GP_REGISTER_COUNT: usize = 16;

/// Per-call activation record. `#[repr(C)]` because the transformer
/// addresses its fields directly with hand-encoded `disp8` loads/stores
/// rather than through any Rust-visible accessor.
#[repr(C)]
pub struct LocalStorage {
    /// One spill slot per general-purpose register; `%base`'s logical value
    /// lives at `spill_slot_offset(base_reg)` for the duration of a call.
    pub reg_spill: [u64; GP_REGISTER_COUNT],
    pub thread_id: u64,
    /// Set only when sampling is enabled (`sampling_rate`).
    pub thread_index: Option<u32>,
    /// Raw because the pointee is owned by the pipeline's function records,
    /// which outlive any single call; the instrumented code never
    /// dereferences these from safe Rust, only from the generated machine
    /// code that reads/writes this struct by fixed offset.
    pub current_block: *const (),
    pub current_call: *const (),
    /// Staged effective addresses for the current block's memory events,
    /// capacity matching the block analyzer's per-block slot budget.
    pub values: [u64; MAX_BLOCK_VALUE_SLOTS],
    pub write_mask: u16,
    pub scratch: u64,
    pub scratch_pc: u64,
}

impl LocalStorage {
    pub fn new(thread_id: u64, thread_index: Option<u32>) -> Self {
        LocalStorage {
            reg_spill: [0; GP_REGISTER_COUNT],
            thread_id,
            thread_index,
            current_block: std::ptr::null(),
            current_call: std::ptr::null(),
            values: [0; MAX_BLOCK_VALUE_SLOTS],
            write_mask: 0,
            scratch: 0,
            scratch_pc: 0,
        }
    }
}

/// Byte offset of `reg`'s spill slot within [`LocalStorage`], assuming
/// `reg_spill` is the struct's first field. The transformer uses this to
/// hand-encode `disp8` spill loads/stores; the largest offset (`R15`
/// at 120) still fits an `i8`, so every spill slot is reachable with the
/// 1-byte displacement form.
pub const fn spill_slot_offset(reg: Reg) -> i8 {
    (reg.0 as i32 * 8) as i8
}

/// Byte offsets of the fields past the spill area, addressed with `disp32`
/// since they fall outside `i8` range (memory-event capture, barrier
/// staging, call descriptor linkage).
pub const CURRENT_BLOCK_OFFSET: i32 = std::mem::offset_of!(LocalStorage, current_block) as i32;
pub const CURRENT_CALL_OFFSET: i32 = std::mem::offset_of!(LocalStorage, current_call) as i32;
pub const VALUES_OFFSET: i32 = std::mem::offset_of!(LocalStorage, values) as i32;
pub const WRITE_MASK_OFFSET: i32 = std::mem::offset_of!(LocalStorage, write_mask) as i32;
pub const SCRATCH_OFFSET: i32 = std::mem::offset_of!(LocalStorage, scratch) as i32;
pub const SCRATCH_PC_OFFSET: i32 = std::mem::offset_of!(LocalStorage, scratch_pc) as i32;

/// Byte offset of value slot `n` within `values` (per-block budget).
pub const fn value_slot_offset(n: usize) -> i32 {
    VALUES_OFFSET + (n as i32) * 8
}

/// Exchangeable local-storage allocator. Must be callable in atomic
/// context: the instrumented code may run with interrupts disabled, so
/// implementations may not block or sleep.
pub trait LocalStorageAllocator: Send + Sync {
    fn alloc(&self, thread_id: u64, thread_index: Option<u32>) -> Option<NonNull<LocalStorage>>;
    fn free(&self, storage: NonNull<LocalStorage>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_slot_offsets_are_8_byte_aligned() {
        assert_eq!(spill_slot_offset(Reg::EAX), 0);
        assert_eq!(spill_slot_offset(Reg::EDX), 16);
    }
}
