//! Decoder errors.

/// Why an instruction could not be decoded.
///
/// Per §4.1, any of these collapses to "length computes to 0" at the call
/// site: the decoder never returns a partial instruction, and it never
/// advances past the byte it failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer than the required bytes remained in the buffer for the opcode,
    /// ModRM/SIB, displacement, or immediate the opcode requires.
    #[error("instruction truncated at offset {0}")]
    Truncated(usize),
    /// The primary, two-byte, or three-byte opcode table has no entry (and
    /// no group/escape expansion) for the byte(s) seen.
    #[error("undefined opcode byte 0x{0:02x}")]
    UndefinedOpcode(u8),
    /// A ModRM.reg-indexed group table had no entry for the given index.
    #[error("undefined group opcode extension /{0}")]
    UndefinedGroupExtension(u8),
    /// More than four legacy prefix bytes preceded the opcode; treated as a
    /// malformed stream rather than decoded further.
    #[error("too many legacy prefix bytes")]
    ExcessPrefixes,
}
