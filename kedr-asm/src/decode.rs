//! The one-at-a-time instruction decoder (§4.1).

use crate::attr::{Bitness, Mnemonic, Operand};
use crate::error::DecodeError;
use crate::insn::{DecodedInsn, Field, ModRm, Sib, MAX_INSN_LEN};
use crate::prefix::{LegacyPrefix, Rex};
use crate::reg::{Reg, RegMask};
use crate::tables::{escape_entry, group_entry, primary_entry};

const MAX_LEGACY_PREFIXES: usize = 4;

/// Decodes one instruction at a time from a byte slice. Stateless except for
/// the bitness it was constructed with — callers decode a whole function by
/// repeatedly calling [`Decoder::decode`] at increasing offsets.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    pub bitness: Bitness,
}

impl Decoder {
    pub const fn new(bitness: Bitness) -> Self {
        Decoder { bitness }
    }

    /// Decode the instruction starting at `input[0]`. `pc` is the absolute
    /// address `input[0]` is mapped at, used to resolve relative jump
    /// targets into absolute addresses.
    pub fn decode(&self, input: &[u8], pc: u64) -> Result<DecodedInsn, DecodeError> {
        let mut cursor = 0usize;
        let mut prefixes = LegacyPrefix::empty();
        let mut prefix_order = [0u8; MAX_LEGACY_PREFIXES];
        let mut n_prefixes = 0usize;

        loop {
            let byte = *input.get(cursor).ok_or(DecodeError::Truncated(cursor))?;
            match LegacyPrefix::from_byte(byte) {
                Some(p) => {
                    if n_prefixes == MAX_LEGACY_PREFIXES {
                        return Err(DecodeError::ExcessPrefixes);
                    }
                    prefixes |= p;
                    prefix_order[n_prefixes] = byte;
                    n_prefixes += 1;
                    cursor += 1;
                }
                None => break,
            }
        }

        let mut rex = None;
        if self.bitness.is_long_mode() {
            let byte = *input.get(cursor).ok_or(DecodeError::Truncated(cursor))?;
            if Rex::is_rex_byte(byte) {
                rex = Some(Rex::from_byte(byte));
                cursor += 1;
            }
        }

        let mandatory = prefixes.last_mandatory(&prefix_order[..n_prefixes]);

        let opcode_start = cursor;
        let first = *input.get(cursor).ok_or(DecodeError::Truncated(cursor))?;
        cursor += 1;

        let entry = if first == 0x0F {
            let second = *input.get(cursor).ok_or(DecodeError::Truncated(cursor))?;
            cursor += 1;
            escape_entry(second, mandatory).ok_or(DecodeError::UndefinedOpcode(second))?
        } else {
            primary_entry(first, mandatory).ok_or(DecodeError::UndefinedOpcode(first))?
        };
        let opcode_byte_for_variant = if first == 0x0F {
            *input.get(opcode_start + 1).expect("checked above")
        } else {
            first
        };

        let mut modrm = None;
        let mut sib = None;
        let mut disp = Field::ABSENT;

        let entry = if let Some(group) = entry.group {
            let raw = *input.get(cursor).ok_or(DecodeError::Truncated(cursor))?;
            let m = ModRm::decode(raw);
            modrm = Some(m);
            cursor += 1;
            group_entry(group, m.reg, m.is_register_direct(), opcode_byte_for_variant, mandatory)
                .ok_or(DecodeError::UndefinedGroupExtension(m.reg))?
        } else {
            entry
        };

        let needs_modrm = entry.operands.iter().any(|o| {
            matches!(o, Operand::Eb | Operand::Ev | Operand::Ez | Operand::M | Operand::Gb | Operand::Gv | Operand::Cd | Operand::Dd)
        });
        if needs_modrm && modrm.is_none() {
            let raw = *input.get(cursor).ok_or(DecodeError::Truncated(cursor))?;
            modrm = Some(ModRm::decode(raw));
            cursor += 1;
        }

        let mut rip_relative = false;
        if let Some(m) = modrm {
            if !m.is_register_direct() {
                if m.rm == 0b100 {
                    let raw = *input.get(cursor).ok_or(DecodeError::Truncated(cursor))?;
                    let s = Sib::decode(raw);
                    sib = Some(s);
                    cursor += 1;
                    if m.md == 0b00 && s.base_is_disp32_only() {
                        disp = read_disp(input, &mut cursor, 4)?;
                    } else if m.md == 0b01 {
                        disp = read_disp(input, &mut cursor, 1)?;
                    } else if m.md == 0b10 {
                        disp = read_disp(input, &mut cursor, 4)?;
                    }
                } else if m.rm == 0b101 && m.md == 0b00 {
                    disp = read_disp(input, &mut cursor, 4)?;
                    rip_relative = self.bitness.is_long_mode();
                } else {
                    match m.md {
                        0b01 => disp = read_disp(input, &mut cursor, 1)?,
                        0b10 => disp = read_disp(input, &mut cursor, 4)?,
                        _ => {}
                    }
                }
            }
        }

        let opsize_override = prefixes.contains(LegacyPrefix::OPSIZE);
        let rex_w = rex.map(|r| r.w).unwrap_or(false);
        let iz_size: u8 = if rex_w { 4 } else if opsize_override { 2 } else { 4 };

        let mut imm = [Field::ABSENT; 2];
        for (slot, operand) in imm.iter_mut().zip(entry.operands.iter()) {
            *slot = match operand {
                Operand::Ib => read_imm(input, &mut cursor, 1)?,
                Operand::Iz => read_imm(input, &mut cursor, iz_size)?,
                Operand::Iw => read_imm(input, &mut cursor, 2)?,
                Operand::Jb => read_imm(input, &mut cursor, 1)?,
                Operand::Jz => read_imm(input, &mut cursor, iz_size)?,
                _ => Field::ABSENT,
            };
        }

        if cursor > MAX_INSN_LEN {
            return Err(DecodeError::Truncated(cursor));
        }

        let mut bytes = [0u8; MAX_INSN_LEN];
        bytes[..cursor].copy_from_slice(&input[..cursor]);

        let jump_target = compute_jump_target(&entry.operands, &imm, pc, cursor as u64);
        let (reg_use_mask, addressing_regs) = compute_reg_masks(
            &entry.mnemonic,
            &entry.operands,
            modrm,
            sib,
            rex,
            opcode_byte_for_variant,
        );
        let is_locked = prefixes.contains(LegacyPrefix::LOCK)
            || (entry.mnemonic == Mnemonic::Xchg && modrm.is_some_and(|m| !m.is_register_direct()));
        let is_nop = entry.mnemonic == Mnemonic::Nop;
        let cc = (entry.mnemonic == Mnemonic::JccRel).then_some(opcode_byte_for_variant & 0x0F);
        let mem_operand_size = compute_mem_operand_size(&entry.operands, opsize_override, rex_w);

        Ok(DecodedInsn {
            bytes,
            len: cursor as u8,
            prefixes,
            rex,
            mnemonic: entry.mnemonic,
            operands: entry.operands,
            modrm,
            sib,
            disp,
            imm,
            reg_use_mask,
            addressing_regs,
            is_locked,
            is_nop,
            cc,
            jump_target,
            rip_relative,
            mem_operand_size,
        })
    }
}

fn read_disp(input: &[u8], cursor: &mut usize, size: usize) -> Result<Field, DecodeError> {
    read_field(input, cursor, size)
}

fn read_imm(input: &[u8], cursor: &mut usize, size: u8) -> Result<Field, DecodeError> {
    read_field(input, cursor, size as usize)
}

fn read_field(input: &[u8], cursor: &mut usize, size: usize) -> Result<Field, DecodeError> {
    let start = *cursor;
    let end = start + size;
    let raw = input.get(start..end).ok_or(DecodeError::Truncated(start))?;
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(raw);
    let unsigned = u64::from_le_bytes(buf);
    // Sign-extend from `size` bytes.
    let shift = (8 - size) * 8;
    let value = ((unsigned << shift) as i64) >> shift;
    *cursor = end;
    Ok(Field { value, size: size as u8 })
}

fn compute_jump_target(operands: &[Operand; 3], imm: &[Field; 2], pc: u64, total_len: u64) -> Option<u64> {
    for (operand, field) in operands.iter().zip(imm.iter()) {
        if matches!(operand, Operand::Jb | Operand::Jz) && field.present() {
            return Some(pc.wrapping_add(total_len).wrapping_add(field.value as u64));
        }
    }
    None
}

fn compute_mem_operand_size(operands: &[Operand; 3], opsize_override: bool, rex_w: bool) -> u8 {
    let v_size = if rex_w { 8 } else if opsize_override { 2 } else { 4 };
    for operand in operands {
        match operand {
            Operand::Eb => return 1,
            Operand::Ev => return v_size,
            Operand::Ez => return if opsize_override { 2 } else { 4 },
            Operand::M => return v_size,
            _ => {}
        }
    }
    0
}

fn reg_from_field(field: u8, rex_bit: bool) -> Reg {
    Reg(field | if rex_bit { 0b1000 } else { 0 })
}

fn compute_reg_masks(
    mnemonic: &Mnemonic,
    operands: &[Operand; 3],
    modrm: Option<ModRm>,
    sib: Option<Sib>,
    rex: Option<Rex>,
    opcode_byte: u8,
) -> (RegMask, RegMask) {
    let mut used = RegMask::empty();
    let mut addressing = RegMask::empty();
    let (rex_r, rex_x, rex_b) = rex.map(|r| (r.r, r.x, r.b)).unwrap_or((false, false, false));

    for operand in operands {
        match operand {
            Operand::Gb | Operand::Gv | Operand::Cd | Operand::Dd => {
                if let Some(m) = modrm {
                    used |= reg_from_field(m.reg, rex_r).into();
                }
            }
            Operand::Eb | Operand::Ev | Operand::Ez | Operand::M => {
                if let Some(m) = modrm {
                    if m.is_register_direct() {
                        used |= reg_from_field(m.rm, rex_b).into();
                    } else if let Some(s) = sib {
                        let combined_index = s.index | if rex_x { 0b1000 } else { 0 };
                        if combined_index != 0b0100 {
                            let r = reg_from_field(s.index, rex_x);
                            used |= r.into();
                            addressing |= r.into();
                        }
                        if !(m.md == 0b00 && s.base_is_disp32_only()) {
                            let r = reg_from_field(s.base, rex_b);
                            used |= r.into();
                            addressing |= r.into();
                        }
                    } else if !(m.md == 0b00 && m.rm == 0b101) {
                        let r = reg_from_field(m.rm, rex_b);
                        used |= r.into();
                        addressing |= r.into();
                    }
                }
            }
            Operand::OpcodeReg => {
                used |= reg_from_field(opcode_byte & 0b111, rex_b).into();
            }
            Operand::ImplicitAcc => used |= Reg::EAX.into(),
            Operand::ImplicitDx => used |= Reg::EDX.into(),
            Operand::None => {}
        }
    }

    if matches!(
        mnemonic,
        Mnemonic::Movs | Mnemonic::Cmps | Mnemonic::Lods
    ) {
        used |= Reg::ESI.into();
    }
    if matches!(
        mnemonic,
        Mnemonic::Movs | Mnemonic::Cmps | Mnemonic::Stos | Mnemonic::Scas
    ) {
        used |= Reg::EDI.into();
    }
    if matches!(mnemonic, Mnemonic::Ins | Mnemonic::Outs | Mnemonic::In | Mnemonic::Out) {
        used |= Reg::EDX.into();
        if matches!(mnemonic, Mnemonic::Ins) {
            used |= Reg::EDI.into();
        }
        if matches!(mnemonic, Mnemonic::Outs) {
            used |= Reg::ESI.into();
        }
    }

    (used, addressing)
}
