//! Legacy prefix and REX parsing.
//!
//! x86 instructions carry zero or more legacy prefix bytes (up to four are
//! architecturally meaningful; a run longer than that is almost always a
//! malformed stream and the decoder treats it as one) followed, in 64-bit
//! mode, by an optional REX byte immediately before the opcode.

bitflags::bitflags! {
    /// Legacy prefix bytes seen before the opcode. Segment override prefixes
    /// are tracked individually even though the decoder does not act on the
    /// segment itself, because their presence still consumes a prefix byte
    /// that the last-prefix rule (§4.1) must see.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LegacyPrefix: u16 {
        /// `F0` — turns the following read-modify-write instruction into a
        /// locked (atomic) bus operation (§4.5 `LockedUpdate`).
        const LOCK       = 1 << 0;
        /// `F2` — REPNE/REPNZ, or a mandatory prefix selecting an SSE2 variant.
        const REPNE      = 1 << 1;
        /// `F3` — REP/REPE/REPZ, or a mandatory prefix selecting an SSE variant.
        const REP        = 1 << 2;
        /// `66` — operand-size override.
        const OPSIZE     = 1 << 3;
        /// `67` — address-size override.
        const ADDRSIZE   = 1 << 4;
        const SEG_CS     = 1 << 5;
        const SEG_SS     = 1 << 6;
        const SEG_DS     = 1 << 7;
        const SEG_ES     = 1 << 8;
        const SEG_FS     = 1 << 9;
        const SEG_GS     = 1 << 10;
    }
}

impl LegacyPrefix {
    /// Classify a single byte as a legacy prefix, if it is one.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0xF0 => Self::LOCK,
            0xF2 => Self::REPNE,
            0xF3 => Self::REP,
            0x66 => Self::OPSIZE,
            0x67 => Self::ADDRSIZE,
            0x2E => Self::SEG_CS,
            0x36 => Self::SEG_SS,
            0x3E => Self::SEG_DS,
            0x26 => Self::SEG_ES,
            0x64 => Self::SEG_FS,
            0x65 => Self::SEG_GS,
            _ => return None,
        })
    }

    /// The "last mandatory prefix" used by the last-prefix rule: `F3` beats
    /// `F2` beats `66` when more than one is present (this matches how a
    /// real decoder resolves `F2 66 0F ...`-style streams, where only the
    /// last of `66`/`F2`/`F3` selects the escape-table variant).
    pub fn last_mandatory(self, order: &[u8]) -> Option<MandatoryPrefix> {
        for &byte in order.iter().rev() {
            match byte {
                0xF3 if self.contains(Self::REP) => return Some(MandatoryPrefix::Rep),
                0xF2 if self.contains(Self::REPNE) => return Some(MandatoryPrefix::Repne),
                0x66 if self.contains(Self::OPSIZE) => return Some(MandatoryPrefix::Opsize),
                _ => continue,
            }
        }
        None
    }
}

/// Which of the three "mandatory prefix" bytes was seen last, for group and
/// escape table variant selection (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MandatoryPrefix {
    Opsize,
    Repne,
    Rep,
}

/// REX prefix (`0100WRXB`), 64-bit mode only. Must immediately precede the
/// opcode (any prefix after it, including another REX byte, invalidates it
/// per the real architecture, but our decoder only needs to recognize the
/// one REX that actually governs the opcode it decoded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    pub const fn is_rex_byte(byte: u8) -> bool {
        byte & 0xF0 == 0x40
    }

    pub const fn from_byte(byte: u8) -> Self {
        Rex {
            w: byte & 0b1000 != 0,
            r: byte & 0b0100 != 0,
            x: byte & 0b0010 != 0,
            b: byte & 0b0001 != 0,
        }
    }
}
