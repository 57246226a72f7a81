//! Function record and call descriptor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::block::BlockDescriptor;
use crate::ir::{IrNode, JumpTable, Relocation};

/// One per instrumentable function, owning everything the pipeline builds
/// for it ("Ownership").
pub struct FunctionRecord {
    /// Original start address in the target module.
    pub orig_addr: u64,
    /// Upper-bound size established during discovery; always `>= 5`.
    pub orig_size: u32,
    /// Borrowed from the module's string table, when one exists.
    pub name: Option<String>,
    /// IR nodes built for this function, in program order.
    pub nodes: Vec<IrNode>,
    /// Jump tables extracted from this function's indirect jumps.
    pub jump_tables: Vec<JumpTable>,
    /// Pending relocations recorded during emission.
    pub relocations: Vec<Relocation>,
    /// Block descriptors, one per memory-event-emitting block.
    pub blocks: Vec<BlockDescriptor>,
    /// Call descriptors, one per call site (direct and indirect).
    pub calls: Vec<CallDescriptor>,
    /// Address of the relocated fallback copy. Nonzero once built.
    pub fallback_addr: u64,
    /// Address and size of the instrumented copy, set once emitted and
    /// deployed.
    pub instrumented_addr: u64,
    pub instrumented_size: u32,
    /// Emission buffer, populated by the code emitter and consumed
    /// by the deployer.
    pub emission_buffer: Vec<u8>,
    /// Shared with the instrumented code's prologue/epilogue, which reads
    /// `pre_handler`/`post_handler` through acquire loads.
    pub info: Arc<FunctionInfo>,
}

impl FunctionRecord {
    pub fn new(orig_addr: u64, orig_size: u32, name: Option<String>) -> Self {
        FunctionRecord {
            orig_addr,
            orig_size,
            name,
            nodes: Vec::new(),
            jump_tables: Vec::new(),
            relocations: Vec::new(),
            blocks: Vec::new(),
            calls: Vec::new(),
            fallback_addr: 0,
            instrumented_addr: 0,
            instrumented_size: 0,
            emission_buffer: Vec::new(),
            info: Arc::new(FunctionInfo::new(orig_addr)),
        }
    }

    /// `original_size >= 5` (invariant).
    pub fn has_minimum_size(&self) -> bool {
        self.orig_size as usize >= crate::consts::NEAR_JUMP_LEN
    }

    pub fn is_emitted(&self) -> bool {
        self.instrumented_size > 0
    }
}

/// Per-function info record visible to handlers: carries the owner
/// module, pre/post handler slots published under a sequence-consistency
/// discipline, and the original address.
///
/// The handler pointers are stored as `AtomicU64` (the address of the
/// handler function, `0` meaning "unset") rather than `AtomicPtr<>` so
/// that [`FunctionInfo`] stays `Send + Sync` without `unsafe impl`: callers
/// reinterpret the stored address back into a function pointer at the
/// FFI boundary where the handler is actually invoked.
pub struct FunctionInfo {
    pub orig_addr: u64,
    pre_handler: AtomicU64,
    post_handler: AtomicU64,
}

impl FunctionInfo {
    pub fn new(orig_addr: u64) -> Self {
        FunctionInfo { orig_addr, pre_handler: AtomicU64::new(0), post_handler: AtomicU64::new(0) }
    }

    /// Publish a new pre-handler address. Release-ordered so that a
    /// concurrent acquire load on the instrumented code's fast path sees
    /// either the old or the new pointer, never a torn value.
    pub fn publish_pre_handler(&self, addr: u64) {
        self.pre_handler.store(addr, Ordering::Release);
    }

    pub fn publish_post_handler(&self, addr: u64) {
        self.post_handler.store(addr, Ordering::Release);
    }

    pub fn load_pre_handler(&self) -> u64 {
        self.pre_handler.load(Ordering::Acquire)
    }

    pub fn load_post_handler(&self) -> u64 {
        self.post_handler.load(Ordering::Acquire)
    }
}

/// Per-call-site record, populated eagerly for direct calls at
/// instrumentation time and lazily by the runtime wrapper for indirect
/// calls.
#[derive(Debug, Clone, Default)]
pub struct CallDescriptor {
    /// Original PC of the call site.
    pub orig_pc: u64,
    /// Resolved target address, `0` until known (always known for direct
    /// calls; filled in lazily for indirect calls at first execution).
    pub target_addr: u64,
    /// Function-handler plugin hooks, `0` meaning "not registered".
    pub pre_handler: u64,
    pub post_handler: u64,
    pub replacement: u64,
}

impl CallDescriptor {
    pub fn new(orig_pc: u64) -> Self {
        CallDescriptor { orig_pc, ..Default::default() }
    }

    pub fn is_resolved(&self) -> bool {
        self.target_addr != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_undersized_functions_via_has_minimum_size() {
        let record = FunctionRecord::new(0x1000, 4, None);
        assert!(!record.has_minimum_size());
        let record = FunctionRecord::new(0x1000, 5, None);
        assert!(record.has_minimum_size());
    }

    #[test]
    fn function_info_publishes_handlers_with_acquire_visibility() {
        let info = FunctionInfo::new(0x2000);
        assert_eq!(info.load_pre_handler(), 0);
        info.publish_pre_handler(0xdead_beef);
        assert_eq!(info.load_pre_handler(), 0xdead_beef);
    }
}
