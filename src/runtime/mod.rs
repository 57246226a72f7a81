//! Runtime support the transformer's generated code leans on at instrumented
//! run time: the wrapper trampolines, per-call local storage, and sampling
//! counters.

pub mod handlers;
pub mod localstorage;
pub mod sampling;

pub use handlers::{assemble_wrapper, WrapperTable};
pub use localstorage::{
    spill_slot_offset, value_slot_offset, LocalStorage, LocalStorageAllocator,
    CURRENT_BLOCK_OFFSET, CURRENT_CALL_OFFSET, GP_REGISTER_COUNT, SCRATCH_OFFSET, SCRATCH_PC_OFFSET,
    VALUES_OFFSET, WRITE_MASK_OFFSET,
};
pub use sampling::SamplingCounters;
