//! Primary, escape, and group opcode attribute tables.
//!
//! The three lookups mirror the three-level structure §4.1 requires:
//! [`primary_entry`] for the one- or two-byte-prefixed primary opcode space,
//! [`escape_entry`] for `0F xx` (two-byte opcodes), and [`group_entry`] for
//! ModRM.reg-indexed expansions of an entry that named a [`GroupId`]. Each
//! accepts the last-seen [`MandatoryPrefix`] so that an entry with
//! prefix-dependent variants can select on it; none of the mnemonics this
//! decoder resolves currently differ by mandatory prefix, but the signature
//! keeps the last-prefix rule enforceable as coverage grows.

use crate::attr::{AluOp, GroupId, Mnemonic, Operand, OpcodeEntry};
use crate::prefix::MandatoryPrefix;

const NONE3: [Operand; 3] = [Operand::None, Operand::None, Operand::None];

fn op1(a: Operand) -> [Operand; 3] {
    [a, Operand::None, Operand::None]
}

fn op2(a: Operand, b: Operand) -> [Operand; 3] {
    [a, b, Operand::None]
}

fn op3(a: Operand, b: Operand, c: Operand) -> [Operand; 3] {
    [a, b, c]
}

/// Look up the primary (one-byte) opcode table, honoring ALU-family opcodes
/// (`00`-`3D`, excluding the `26`/`2E`/`36`/`3E` segment overrides and `0F`
/// escape which the caller strips out before reaching here) via the
/// `(op << 3) | form` formula real x86 encodes them with, rather than 48
/// separate match arms.
pub fn primary_entry(byte: u8, _mandatory: Option<MandatoryPrefix>) -> Option<OpcodeEntry> {
    // ALU family: 00-3D, skipping bytes ending in 6 or 7 (segment prefixes)
    // and 0F (escape), both handled by the caller before this is reached.
    if byte < 0x40 && (byte & 0x07) <= 5 {
        let op = AluOp::from_index(byte >> 3);
        let form = byte & 0x07;
        let operands = match form {
            0 => op2(Operand::Eb, Operand::Gb),
            1 => op2(Operand::Ev, Operand::Gv),
            2 => op2(Operand::Gb, Operand::Eb),
            3 => op2(Operand::Gv, Operand::Ev),
            4 => op2(Operand::ImplicitAcc, Operand::Ib),
            5 => op2(Operand::ImplicitAcc, Operand::Iz),
            _ => unreachable!(),
        };
        return Some(OpcodeEntry::new(Mnemonic::Alu(op), operands));
    }

    if (0x50..=0x57).contains(&byte) {
        return Some(OpcodeEntry::new(Mnemonic::Push, op1(Operand::OpcodeReg)));
    }
    if (0x58..=0x5F).contains(&byte) {
        return Some(OpcodeEntry::new(Mnemonic::Pop, op1(Operand::OpcodeReg)));
    }
    if (0x91..=0x97).contains(&byte) {
        return Some(OpcodeEntry::new(
            Mnemonic::Xchg,
            op2(Operand::ImplicitAcc, Operand::OpcodeReg),
        ));
    }
    if (0xB0..=0xB7).contains(&byte) {
        return Some(OpcodeEntry::new(Mnemonic::Mov, op2(Operand::OpcodeReg, Operand::Ib)));
    }
    if (0xB8..=0xBF).contains(&byte) {
        return Some(OpcodeEntry::new(Mnemonic::Mov, op2(Operand::OpcodeReg, Operand::Iz)));
    }
    if (0x70..=0x7F).contains(&byte) {
        return Some(OpcodeEntry::new(Mnemonic::JccRel, op1(Operand::Jb)));
    }

    Some(match byte {
        0x60 => OpcodeEntry::new(Mnemonic::Pushad, NONE3),
        0x61 => OpcodeEntry::new(Mnemonic::Popad, NONE3),
        0x68 => OpcodeEntry::new(Mnemonic::Push, op1(Operand::Iz)),
        0x6A => OpcodeEntry::new(Mnemonic::Push, op1(Operand::Ib)),
        0x6C => OpcodeEntry::new(Mnemonic::Ins, NONE3),
        0x6D => OpcodeEntry::new(Mnemonic::Ins, NONE3),
        0x6E => OpcodeEntry::new(Mnemonic::Outs, NONE3),
        0x6F => OpcodeEntry::new(Mnemonic::Outs, NONE3),
        0x80 => OpcodeEntry::group(GroupId::Group1),
        0x81 => OpcodeEntry::group(GroupId::Group1),
        0x83 => OpcodeEntry::group(GroupId::Group1),
        0x84 => OpcodeEntry::new(Mnemonic::Test, op2(Operand::Eb, Operand::Gb)),
        0x85 => OpcodeEntry::new(Mnemonic::Test, op2(Operand::Ev, Operand::Gv)),
        0x86 => OpcodeEntry::new(Mnemonic::Xchg, op2(Operand::Eb, Operand::Gb)),
        0x87 => OpcodeEntry::new(Mnemonic::Xchg, op2(Operand::Ev, Operand::Gv)),
        0x88 => OpcodeEntry::new(Mnemonic::Mov, op2(Operand::Eb, Operand::Gb)),
        0x89 => OpcodeEntry::new(Mnemonic::Mov, op2(Operand::Ev, Operand::Gv)),
        0x8A => OpcodeEntry::new(Mnemonic::Mov, op2(Operand::Gb, Operand::Eb)),
        0x8B => OpcodeEntry::new(Mnemonic::Mov, op2(Operand::Gv, Operand::Ev)),
        0x8D => OpcodeEntry::new(Mnemonic::Lea, op2(Operand::Gv, Operand::M)),
        0x90 => OpcodeEntry::new(Mnemonic::Nop, NONE3),
        0x9A => OpcodeEntry::new(Mnemonic::CallFar, op1(Operand::Iz)),
        0xA4 => OpcodeEntry::new(Mnemonic::Movs, NONE3),
        0xA5 => OpcodeEntry::new(Mnemonic::Movs, NONE3),
        0xA6 => OpcodeEntry::new(Mnemonic::Cmps, NONE3),
        0xA7 => OpcodeEntry::new(Mnemonic::Cmps, NONE3),
        0xA8 => OpcodeEntry::new(Mnemonic::Test, op2(Operand::ImplicitAcc, Operand::Ib)),
        0xA9 => OpcodeEntry::new(Mnemonic::Test, op2(Operand::ImplicitAcc, Operand::Iz)),
        0xAA => OpcodeEntry::new(Mnemonic::Stos, NONE3),
        0xAB => OpcodeEntry::new(Mnemonic::Stos, NONE3),
        0xAC => OpcodeEntry::new(Mnemonic::Lods, NONE3),
        0xAD => OpcodeEntry::new(Mnemonic::Lods, NONE3),
        0xAE => OpcodeEntry::new(Mnemonic::Scas, NONE3),
        0xAF => OpcodeEntry::new(Mnemonic::Scas, NONE3),
        0xC2 => OpcodeEntry::new(Mnemonic::Ret, op1(Operand::Iw)),
        0xC3 => OpcodeEntry::new(Mnemonic::Ret, NONE3),
        0xC6 => OpcodeEntry::group(GroupId::Group11),
        0xC7 => OpcodeEntry::group(GroupId::Group11),
        0xCA => OpcodeEntry::new(Mnemonic::Retf, op1(Operand::Iw)),
        0xCB => OpcodeEntry::new(Mnemonic::Retf, NONE3),
        0xCF => OpcodeEntry::new(Mnemonic::Iret, NONE3),
        0xE0 => OpcodeEntry::new(Mnemonic::Loopne, op1(Operand::Jb)),
        0xE1 => OpcodeEntry::new(Mnemonic::Loope, op1(Operand::Jb)),
        0xE2 => OpcodeEntry::new(Mnemonic::Loop, op1(Operand::Jb)),
        0xE3 => OpcodeEntry::new(Mnemonic::Jcxz, op1(Operand::Jb)),
        0xE4 => OpcodeEntry::new(Mnemonic::In, op2(Operand::ImplicitAcc, Operand::Ib)),
        0xE5 => OpcodeEntry::new(Mnemonic::In, op2(Operand::ImplicitAcc, Operand::Ib)),
        0xE6 => OpcodeEntry::new(Mnemonic::Out, op2(Operand::Ib, Operand::ImplicitAcc)),
        0xE7 => OpcodeEntry::new(Mnemonic::Out, op2(Operand::Ib, Operand::ImplicitAcc)),
        0xE8 => OpcodeEntry::new(Mnemonic::CallRel, op1(Operand::Jz)),
        0xE9 => OpcodeEntry::new(Mnemonic::JmpRel, op1(Operand::Jz)),
        0xEA => OpcodeEntry::new(Mnemonic::JmpFar, op1(Operand::Iz)),
        0xEB => OpcodeEntry::new(Mnemonic::JmpRel, op1(Operand::Jb)),
        0xEC => OpcodeEntry::new(Mnemonic::In, op2(Operand::ImplicitAcc, Operand::ImplicitDx)),
        0xED => OpcodeEntry::new(Mnemonic::In, op2(Operand::ImplicitAcc, Operand::ImplicitDx)),
        0xEE => OpcodeEntry::new(Mnemonic::Out, op2(Operand::ImplicitDx, Operand::ImplicitAcc)),
        0xEF => OpcodeEntry::new(Mnemonic::Out, op2(Operand::ImplicitDx, Operand::ImplicitAcc)),
        0xF0 => return None, // LOCK is consumed as a legacy prefix, never an opcode byte
        0xF4 => OpcodeEntry::new(Mnemonic::Other, NONE3), // HLT
        0xF6 => OpcodeEntry::group(GroupId::Group3),
        0xF7 => OpcodeEntry::group(GroupId::Group3),
        0xFE => OpcodeEntry::group(GroupId::GroupFe),
        0xFF => OpcodeEntry::group(GroupId::Group5),
        _ => return None,
    })
}

/// `0F xx` two-byte escape table.
pub fn escape_entry(byte: u8, _mandatory: Option<MandatoryPrefix>) -> Option<OpcodeEntry> {
    if (0x80..=0x8F).contains(&byte) {
        return Some(OpcodeEntry::new(Mnemonic::JccRel, op1(Operand::Jz)));
    }
    if (0x20..=0x23).contains(&byte) {
        let (mnem, operands) = match byte {
            0x20 => (Mnemonic::MovCr, op2(Operand::Gv, Operand::Cd)),
            0x21 => (Mnemonic::MovDr, op2(Operand::Gv, Operand::Dd)),
            0x22 => (Mnemonic::MovCr, op2(Operand::Cd, Operand::Gv)),
            0x23 => (Mnemonic::MovDr, op2(Operand::Dd, Operand::Gv)),
            _ => unreachable!(),
        };
        return Some(OpcodeEntry::new(mnem, operands));
    }
    Some(match byte {
        0x01 => OpcodeEntry::group(GroupId::Group7),
        0x08 => OpcodeEntry::new(Mnemonic::Invd, NONE3),
        0x09 => OpcodeEntry::new(Mnemonic::Wbinvd, NONE3),
        0x0B => OpcodeEntry::new(Mnemonic::Ud2, NONE3),
        0x1F => OpcodeEntry::new(Mnemonic::Nop, op1(Operand::Ev)),
        0xA2 => OpcodeEntry::new(Mnemonic::Cpuid, NONE3),
        0xAE => OpcodeEntry::group(GroupId::Group15),
        _ => return None,
    })
}

/// ModRM.reg-indexed group table. `reg` is already masked to 0..=7.
pub fn group_entry(
    group: GroupId,
    reg: u8,
    modrm_mod_is_reg: bool,
    opcode_byte: u8,
    _mandatory: Option<MandatoryPrefix>,
) -> Option<OpcodeEntry> {
    Some(match group {
        GroupId::Group1 => {
            // `80` is always byte-sized; `81` is full operand size with a
            // `Iz` immediate; `83` is full operand size with a sign-extended
            // `Ib` immediate (real x86 saves 3 bytes this way).
            let operands = match opcode_byte {
                0x80 => op2(Operand::Eb, Operand::Ib),
                0x81 => op2(Operand::Ev, Operand::Iz),
                0x83 => op2(Operand::Ev, Operand::Ib),
                _ => NONE3,
            };
            OpcodeEntry::new(Mnemonic::Alu(AluOp::from_index(reg)), operands)
        }
        GroupId::GroupFe => match reg {
            0 => OpcodeEntry::new(Mnemonic::Inc, op1(Operand::Eb)),
            1 => OpcodeEntry::new(Mnemonic::Dec, op1(Operand::Eb)),
            _ => return None,
        },
        GroupId::Group3 => {
            let (e, i) = if opcode_byte == 0xF6 {
                (Operand::Eb, Operand::Ib)
            } else {
                (Operand::Ev, Operand::Iz)
            };
            match reg {
                0 | 1 => OpcodeEntry::new(Mnemonic::Test, op2(e, i)),
                2 => OpcodeEntry::new(Mnemonic::Not, op1(e)),
                3 => OpcodeEntry::new(Mnemonic::Neg, op1(e)),
                4..=7 => OpcodeEntry::new(Mnemonic::Other, op1(e)),
                _ => return None,
            }
        }
        GroupId::Group5 => match reg {
            0 => OpcodeEntry::new(Mnemonic::Inc, op1(Operand::Ev)),
            1 => OpcodeEntry::new(Mnemonic::Dec, op1(Operand::Ev)),
            2 => OpcodeEntry::new(Mnemonic::CallIndirect, op1(Operand::Ev)),
            3 => OpcodeEntry::new(Mnemonic::CallFar, op1(Operand::M)),
            4 => OpcodeEntry::new(Mnemonic::JmpIndirect, op1(Operand::Ev)),
            5 => OpcodeEntry::new(Mnemonic::JmpFar, op1(Operand::M)),
            6 => OpcodeEntry::new(Mnemonic::Push, op1(Operand::Ev)),
            _ => return None,
        },
        GroupId::Group11 => match (reg, opcode_byte) {
            (0, 0xC6) => OpcodeEntry::new(Mnemonic::Mov, op2(Operand::Eb, Operand::Ib)),
            (0, 0xC7) => OpcodeEntry::new(Mnemonic::Mov, op2(Operand::Ev, Operand::Iz)),
            _ => return None,
        },
        GroupId::Group7 => match reg {
            7 if !modrm_mod_is_reg => OpcodeEntry::new(Mnemonic::Invlpg, op1(Operand::M)),
            _ => OpcodeEntry::new(Mnemonic::Other, NONE3),
        },
        GroupId::Group15 => {
            if modrm_mod_is_reg {
                match reg {
                    5 => OpcodeEntry::new(Mnemonic::Lfence, NONE3),
                    6 => OpcodeEntry::new(Mnemonic::Mfence, NONE3),
                    7 => OpcodeEntry::new(Mnemonic::Sfence, NONE3),
                    _ => OpcodeEntry::new(Mnemonic::Other, NONE3),
                }
            } else {
                OpcodeEntry::new(Mnemonic::Other, op1(Operand::M))
            }
        }
    })
}
