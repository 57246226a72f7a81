//! General-purpose register identifiers and register-use bitmasks.
//!
//! The decoder never materializes a full register-file model; it only needs
//! to know *which* of the 8 (x86-32) or 16 (x86-64) general-purpose registers
//! a decoded instruction reads or writes, so that later stages (base register
//! selection, work-register allocation) can reason about conflicts without
//! re-decoding.

use core::fmt;

/// A general-purpose register, identified the way ModRM.reg / ModRM.rm /
/// SIB.index / SIB.base / the REX extension bits name it: 0..=7 on x86-32,
/// 0..=15 once REX.R/X/B is folded in on x86-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

impl Reg {
    pub const EAX: Reg = Reg(0);
    pub const ECX: Reg = Reg(1);
    pub const EDX: Reg = Reg(2);
    pub const EBX: Reg = Reg(3);
    pub const ESP: Reg = Reg(4);
    pub const EBP: Reg = Reg(5);
    pub const ESI: Reg = Reg(6);
    pub const EDI: Reg = Reg(7);

    /// `true` for the stack pointer, which may never be chosen as `%base`
    /// (§4.6) nor as a work register.
    pub const fn is_sp(self) -> bool {
        self.0 == 4
    }

    /// Bit position of this register within a [`RegMask`].
    pub const fn bit(self) -> u32 {
        1u32 << (self.0 as u32)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES32: [&str; 8] = [
            "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi",
        ];
        const NAMES64_EXT: [&str; 8] = [
            "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
        ];
        match self.0 {
            0..=7 => write!(f, "{}", NAMES32[self.0 as usize]),
            8..=15 => write!(f, "{}", NAMES64_EXT[(self.0 - 8) as usize]),
            _ => write!(f, "r{}", self.0),
        }
    }
}

bitflags::bitflags! {
    /// One bit per general-purpose register, used to track which registers
    /// an instruction reads/writes/addresses-with (§4.1), and which remain
    /// free to serve as `%base` (§4.6) or a work register (§4.7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegMask: u16 {
        const EAX = 1 << 0;
        const ECX = 1 << 1;
        const EDX = 1 << 2;
        const EBX = 1 << 3;
        const ESP = 1 << 4;
        const EBP = 1 << 5;
        const ESI = 1 << 6;
        const EDI = 1 << 7;
        const R8  = 1 << 8;
        const R9  = 1 << 9;
        const R10 = 1 << 10;
        const R11 = 1 << 11;
        const R12 = 1 << 12;
        const R13 = 1 << 13;
        const R14 = 1 << 14;
        const R15 = 1 << 15;

        /// All 8 registers addressable without a REX prefix.
        const ALL_32 = Self::EAX.bits() | Self::ECX.bits() | Self::EDX.bits()
            | Self::EBX.bits() | Self::ESP.bits() | Self::EBP.bits()
            | Self::ESI.bits() | Self::EDI.bits();
        /// All 16 registers, x86-64 only.
        const ALL_64 = Self::ALL_32.bits()
            | Self::R8.bits() | Self::R9.bits() | Self::R10.bits() | Self::R11.bits()
            | Self::R12.bits() | Self::R13.bits() | Self::R14.bits() | Self::R15.bits();
    }
}

impl RegMask {
    /// Add a single register to the mask.
    pub fn with(self, r: Reg) -> Self {
        self | RegMask::from(r)
    }

    /// Whether `r` is a member of this mask.
    pub fn contains_reg(self, r: Reg) -> bool {
        self.bits() & (r.bit() as u16) != 0
    }

    /// Number of registers present, used by §4.6 to rank base-register
    /// candidates by reference count.
    pub fn count(self) -> u32 {
        self.bits().count_ones()
    }
}

impl From<Reg> for RegMask {
    fn from(r: Reg) -> Self {
        RegMask::from_bits_truncate(r.bit() as u16)
    }
}
