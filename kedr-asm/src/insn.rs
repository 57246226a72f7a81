//! The decoded-instruction value type.
//!
//! A `DecodedInsn` owns a fixed 15-byte copy of the instruction (the
//! architectural maximum x86 instruction length) plus every field §4.1
//! requires the decoder to expose. There is no "source" view that aliases a
//! live IR node's bytes — `kedr-core` copies this value type into its IR
//! nodes outright (§9 "no aliasing between a source decoded view and a
//! destination node").

use crate::attr::{Mnemonic, Operand};
use crate::prefix::{LegacyPrefix, Rex};
use crate::reg::{Reg, RegMask};

pub const MAX_INSN_LEN: usize = 15;

/// The ModRM byte, split into its three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub raw: u8,
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub const fn decode(raw: u8) -> Self {
        ModRm { raw, md: raw >> 6, reg: (raw >> 3) & 7, rm: raw & 7 }
    }

    pub const fn is_register_direct(self) -> bool {
        self.md == 0b11
    }

    /// `true` for the `FF /4` jump-table dispatch pattern §4.4 step 4 looks
    /// for: `ModRM == 0x24` (mod=00, reg=100=/4, rm=100=SIB-follows).
    pub const fn is_sib_indexed_no_disp8(self) -> bool {
        self.raw == 0x24
    }
}

/// The SIB byte, split into its three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sib {
    pub raw: u8,
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

impl Sib {
    pub const fn decode(raw: u8) -> Self {
        Sib { raw, scale: raw >> 6, index: (raw >> 3) & 7, base: raw & 7 }
    }

    /// `true` for `SIB.base == 5` with no ModRM-level base register, the
    /// other half of the `FF /4` jump-table pattern.
    pub const fn base_is_disp32_only(self) -> bool {
        self.base == 5
    }
}

/// A displacement or immediate field: its value (sign-extended into an
/// `i64`/`i32`) and the number of bytes it actually occupied (`0` means the
/// field is absent), matching §4.1's `size ∈ {0,1,2,4,8}` / `{0,1,4}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Field {
    pub value: i64,
    pub size: u8,
}

impl Field {
    pub const ABSENT: Field = Field { value: 0, size: 0 };

    pub const fn present(self) -> bool {
        self.size != 0
    }
}

/// A fully decoded x86/x86-64 instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedInsn {
    pub bytes: [u8; MAX_INSN_LEN],
    pub len: u8,
    pub prefixes: LegacyPrefix,
    pub rex: Option<Rex>,
    pub mnemonic: Mnemonic,
    pub operands: [Operand; 3],
    pub modrm: Option<ModRm>,
    pub sib: Option<Sib>,
    pub disp: Field,
    pub imm: [Field; 2],
    /// Registers this instruction reads or writes, independent of whether
    /// they appear as an operand or as part of an addressing expression.
    pub reg_use_mask: RegMask,
    /// Registers appearing in the addressing expression itself (ModRM.rm,
    /// SIB.index, SIB.base) — the subset §4.6 checks against string-op
    /// implicit registers and scratch-register exclusion.
    pub addressing_regs: RegMask,
    /// `LOCK` prefix present, or an implicit-lock form (`XCHG mem, reg`).
    pub is_locked: bool,
    pub is_nop: bool,
    /// Condition code (low nibble of the opcode byte), set only for
    /// `Mnemonic::JccRel` — both the `7x` short form and the `0F 8x` near
    /// form share this encoding, which is what lets the IR builder
    /// re-synthesize one from the other (§4.4 step 3).
    pub cc: Option<u8>,
    /// Absolute jump/call target, when statically known (direct rel8/rel32
    /// forms). `None` for indirect transfers or non-control-transfer
    /// instructions, matching §4.1 "0 if none, or if destination is computed".
    pub jump_target: Option<u64>,
    /// `true` when this instruction addresses memory via RIP-relative
    /// addressing (ModRM mod=00, rm=101, 64-bit mode only).
    pub rip_relative: bool,
    /// Effective operand size in bytes for the memory-accessing operand
    /// (1/2/4/8), used by the block descriptor to record `(pc, size)`.
    pub mem_operand_size: u8,
}

impl DecodedInsn {
    pub fn slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub const fn is_control_transfer(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::JmpRel
                | Mnemonic::JccRel
                | Mnemonic::CallRel
                | Mnemonic::JmpIndirect
                | Mnemonic::CallIndirect
                | Mnemonic::JmpFar
                | Mnemonic::CallFar
                | Mnemonic::Ret
                | Mnemonic::Retf
                | Mnemonic::Iret
                | Mnemonic::Jcxz
                | Mnemonic::Loop
                | Mnemonic::Loope
                | Mnemonic::Loopne
                | Mnemonic::Ud2
        )
    }

    pub const fn is_exit(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Ret | Mnemonic::Iret | Mnemonic::Ud2 | Mnemonic::JmpFar)
    }

    pub const fn is_string_op(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::Movs
                | Mnemonic::Cmps
                | Mnemonic::Stos
                | Mnemonic::Lods
                | Mnemonic::Scas
                | Mnemonic::Ins
                | Mnemonic::Outs
        )
    }

    /// `MOVS`/`CMPS` touch two memory operands and need 4 value slots
    /// (§4.5); the other string ops touch one and need 2.
    pub const fn is_string_op_xy(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Movs | Mnemonic::Cmps)
    }

    pub const fn is_io_mem_op(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Ins | Mnemonic::Outs)
    }

    pub const fn is_barrier(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::Lfence
                | Mnemonic::Mfence
                | Mnemonic::Sfence
                | Mnemonic::In
                | Mnemonic::Out
                | Mnemonic::Invd
                | Mnemonic::Wbinvd
                | Mnemonic::Invlpg
                | Mnemonic::Cpuid
                | Mnemonic::MovCr
                | Mnemonic::MovDr
        )
    }

    /// `true` when this instruction accesses memory through ModRM in a way
    /// the block analyzer tracks (§4.5 `Common`/`LockedUpdate` blocks):
    /// excludes `PUSH`/`POP reg` per the Non-goals in §1.
    pub const fn is_tracked_mem_op(&self) -> bool {
        if self.is_string_op() {
            return true;
        }
        match self.modrm {
            Some(m) if !m.is_register_direct() => matches!(
                self.mnemonic,
                Mnemonic::Mov
                    | Mnemonic::Alu(_)
                    | Mnemonic::Test
                    | Mnemonic::Not
                    | Mnemonic::Neg
                    | Mnemonic::Inc
                    | Mnemonic::Dec
                    | Mnemonic::Xchg
            ),
            _ => false,
        }
    }
}
