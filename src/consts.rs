//! Pipeline-wide constants.

/// Size, in bytes, of a near-relative jump (`E9 rel32`) — the minimum size a
/// discovered function must have to be instrumentable, and the patch
/// written at deployment time over each original function's entry.
pub const NEAR_JUMP_LEN: usize = 5;

/// Opcode byte for `JMP rel32`.
pub const OPCODE_JMP_REL32: u8 = 0xE9;

/// Padding byte (`INT3`) filling the remainder of an original function's
/// body after the `E9 rel32` patch.
pub const PADDING_BYTE: u8 = 0xCC;

/// Maximum number of "value slots" a single block may require.
/// Non-string trackable accesses need 1 slot; type-X/Y string ops need 2;
/// type-XY string ops (`MOVS`, `CMPS`) need 4.
pub const MAX_BLOCK_VALUE_SLOTS: usize = 16;

/// Value slots consumed by a non-string trackable memory access.
pub const SLOTS_PLAIN_MEM_OP: usize = 1;

/// Value slots consumed by a type-X or type-Y string op (`STOS`, `LODS`,
/// `SCAS`, `INS`, `OUTS`).
pub const SLOTS_STRING_OP_XY_SINGLE: usize = 2;

/// Value slots consumed by a type-XY string op (`MOVS`, `CMPS`), which touch
/// two memory operands.
pub const SLOTS_STRING_OP_XY_DOUBLE: usize = 4;

/// Maximum distance (in bytes) a short jump's displacement may cover — the
/// emitter's short/near downgrade threshold.
pub const SHORT_JUMP_RANGE: core::ops::RangeInclusive<i64> = -128..=127;

/// Alignment, in bytes, of the detour buffer's start address and of each
/// instrumented function's body within it.
pub const DETOUR_ALIGNMENT: usize = 16;

/// Maximum signed displacement a `rel32` field can encode — the radius
/// within which the detour buffer must be allocated relative to the
/// target's mapped code.
pub const REL32_RANGE: i64 = 1 << 31;

static_assertions::const_assert!(NEAR_JUMP_LEN < MAX_BLOCK_VALUE_SLOTS);
