//! Pipeline error types.

use kedr_asm::DecodeError;

/// Result alias for pipeline-internal work that is not scoped to a single
/// function (discovery, deployment, registration).
pub type Result<T> = core::result::Result<T, Error>;

/// Result alias for work scoped to a single function: any `Err` here causes
/// that function to be skipped rather than aborting the whole session.
pub type PerFunctionResult<T> = core::result::Result<T, FunctionError>;

/// Top-level error kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An instruction could not be decoded.
    #[error("failed to decode instruction: {0}")]
    Decode(#[from] DecodeError),
    /// RIP-relative addressing points back into the same function, or an
    /// instruction saturates every general-purpose register without being
    /// `PUSHAD`/`POPAD`.
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(&'static str),
    /// A function's decoded instruction stream ends without reaching a
    /// control-transfer instruction.
    #[error("function at {0:#x} ends without a control-transfer instruction")]
    IncompleteFunction(u64),
    /// An allocation (detour buffer, local storage, function record) failed.
    #[error("out of memory")]
    OutOfMemory,
    /// No work register is available after excluding `%base`, scratchless
    /// requirements, and the instruction's own operands.
    #[error("no work register available at {0:#x}")]
    RegisterPressure(u64),
    /// Jump-table extraction produced a table whose entries land outside the
    /// target module (heuristic overcounting case).
    #[error("jump table at {0:#x} resolved outside the module")]
    SpuriousJumpTable(u64),
    /// Registration attempted while a target is already loaded, or a second
    /// registration of the same kind.
    #[error("lifecycle conflict: {0}")]
    LifecycleConflict(&'static str),
    /// A `SessionConfig` field failed validation at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// A per-function error, carrying enough context for the "skip, warn,
/// continue" rule to log something actionable.
#[derive(Debug, thiserror::Error)]
#[error("function {name:?} at {addr:#x}: {source}")]
pub struct FunctionError {
    /// Original start address of the function that failed.
    pub addr: u64,
    /// Function name, when the module's string table had one.
    pub name: Option<String>,
    #[source]
    pub source: Error,
}

impl FunctionError {
    pub fn new(addr: u64, name: Option<String>, source: Error) -> Self {
        FunctionError { addr, name, source }
    }
}
