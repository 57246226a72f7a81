//! Raw byte-sequence encoders for instructions the pipeline synthesizes
//! itself: jump/call forms used by short-form rewriting and by the
//! emitter's short/near downgrade, plus the small fixed instruction
//! sequences the transformer splices in.
//!
//! `kedr-asm` only decodes; it has no encoder. Every sequence produced here
//! is immediately re-decoded through [`kedr_asm::Decoder`] so the resulting
//! [`crate::ir::IrNode`] carries authoritative length/operand metadata
//! rather than a bag of raw bytes the rest of the pipeline has to
//! special-case.

use kedr_asm::{Bitness, DecodedInsn, Decoder, Reg};

fn decode_one(bitness: Bitness, bytes: &[u8], pc: u64) -> DecodedInsn {
    Decoder::new(bitness)
        .decode(bytes, pc)
        .expect("synthesized instruction must be decodable by construction")
}

fn reg_low3(reg: Reg) -> u8 {
    reg.0 & 0b111
}

fn reg_ext(reg: Reg) -> bool {
    reg.0 & 0b1000 != 0
}

fn modrm_byte(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// SIB byte encoding "no index register, `base` as the base" (index field
/// `100` with no REX.X, per the decoder's own `combined_index != 0b0100`
/// check in `compute_reg_masks`) — needed whenever the chosen base/work
/// register is `%esp`/`%r12`, which cannot be named directly in ModRM.rm.
fn sib_no_index(base: u8) -> u8 {
    (0b100 << 3) | (base & 7)
}

fn push_rex_if_needed(bitness: Bitness, w: bool, r: bool, x: bool, b: bool, out: &mut Vec<u8>) {
    if !matches!(bitness, Bitness::X64) {
        return;
    }
    if w || r || x || b {
        out.push(0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8));
    }
}

/// `PUSH reg` (`50+r`).
pub fn push_reg(bitness: Bitness, reg: Reg, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(2);
    push_rex_if_needed(bitness, false, false, false, reg_ext(reg), &mut bytes);
    bytes.push(0x50 | reg_low3(reg));
    decode_one(bitness, &bytes, pc)
}

/// `POP reg` (`58+r`).
pub fn pop_reg(bitness: Bitness, reg: Reg, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(2);
    push_rex_if_needed(bitness, false, false, false, reg_ext(reg), &mut bytes);
    bytes.push(0x58 | reg_low3(reg));
    decode_one(bitness, &bytes, pc)
}

/// `MOV r/m, imm32` (`C7 /0`), sign-extended into a 64-bit destination when
/// `bitness` is `X64` (entry prologue: "sign-extended on 64-bit").
pub fn mov_reg_imm32(bitness: Bitness, reg: Reg, imm: i32, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(7);
    let widen = matches!(bitness, Bitness::X64);
    push_rex_if_needed(bitness, widen, false, false, reg_ext(reg), &mut bytes);
    bytes.push(0xC7);
    bytes.push(modrm_byte(0b11, 0, reg_low3(reg)));
    bytes.extend_from_slice(&imm.to_le_bytes());
    decode_one(bitness, &bytes, pc)
}

/// `MOV reg64, imm64` (`B8+r`, REX.W) — the only way to materialize a full
/// 64-bit constant (a descriptor pointer) into a register; on 32-bit
/// targets callers use [`mov_reg_imm32`] instead, since every address there
/// already fits 32 bits.
pub fn mov_reg_imm64(reg: Reg, imm: u64, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(10);
    push_rex_if_needed(Bitness::X64, true, false, false, reg_ext(reg), &mut bytes);
    bytes.push(0xB8 | reg_low3(reg));
    bytes.extend_from_slice(&imm.to_le_bytes());
    decode_one(Bitness::X64, &bytes, pc)
}

/// `MOV dst, src` between two GP registers, full operand width (`89 /r`).
pub fn mov_reg_reg(bitness: Bitness, dst: Reg, src: Reg, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(3);
    let widen = matches!(bitness, Bitness::X64);
    push_rex_if_needed(bitness, widen, reg_ext(src), false, reg_ext(dst), &mut bytes);
    bytes.push(0x89);
    bytes.push(modrm_byte(0b11, reg_low3(src), reg_low3(dst)));
    decode_one(bitness, &bytes, pc)
}

/// `MOV dst, [base + disp8]` (`8B /r`, mod=01) — a spill-slot load.
pub fn mov_reg_mem_disp8(bitness: Bitness, dst: Reg, base: Reg, disp8: i8, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(4);
    let widen = matches!(bitness, Bitness::X64);
    push_rex_if_needed(bitness, widen, reg_ext(dst), false, reg_ext(base), &mut bytes);
    bytes.push(0x8B);
    let rm = reg_low3(base);
    bytes.push(modrm_byte(0b01, reg_low3(dst), rm));
    if rm == 0b100 {
        bytes.push(sib_no_index(rm));
    }
    bytes.push(disp8 as u8);
    decode_one(bitness, &bytes, pc)
}

/// `MOV [base + disp8], src` (`89 /r`, mod=01) — a spill-slot store.
pub fn mov_mem_disp8_reg(bitness: Bitness, base: Reg, disp8: i8, src: Reg, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(4);
    let widen = matches!(bitness, Bitness::X64);
    push_rex_if_needed(bitness, widen, reg_ext(src), false, reg_ext(base), &mut bytes);
    bytes.push(0x89);
    let rm = reg_low3(base);
    bytes.push(modrm_byte(0b01, reg_low3(src), rm));
    if rm == 0b100 {
        bytes.push(sib_no_index(rm));
    }
    bytes.push(disp8 as u8);
    decode_one(bitness, &bytes, pc)
}

/// `MOV dst, [base + disp32]` (`8B /r`, mod=10) — local-storage field loads
/// that sit past `disp8` range (reads from `values`/`current_block`).
pub fn mov_reg_mem_disp32(bitness: Bitness, dst: Reg, base: Reg, disp32: i32, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(7);
    let widen = matches!(bitness, Bitness::X64);
    push_rex_if_needed(bitness, widen, reg_ext(dst), false, reg_ext(base), &mut bytes);
    bytes.push(0x8B);
    let rm = reg_low3(base);
    bytes.push(modrm_byte(0b10, reg_low3(dst), rm));
    if rm == 0b100 {
        bytes.push(sib_no_index(rm));
    }
    bytes.extend_from_slice(&disp32.to_le_bytes());
    decode_one(bitness, &bytes, pc)
}

/// `MOV [base + disp32], src` (`89 /r`, mod=10) — local-storage field stores.
pub fn mov_mem_disp32_reg(bitness: Bitness, base: Reg, disp32: i32, src: Reg, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(7);
    let widen = matches!(bitness, Bitness::X64);
    push_rex_if_needed(bitness, widen, reg_ext(src), false, reg_ext(base), &mut bytes);
    bytes.push(0x89);
    let rm = reg_low3(base);
    bytes.push(modrm_byte(0b10, reg_low3(src), rm));
    if rm == 0b100 {
        bytes.push(sib_no_index(rm));
    }
    bytes.extend_from_slice(&disp32.to_le_bytes());
    decode_one(bitness, &bytes, pc)
}

/// `MOV [base + disp32], imm32` (`C7 /0`, mod=10) — stages a constant (e.g. a
/// barrier kind) directly into a local-storage field without spending a work
/// register.
pub fn mov_mem_disp32_imm32(bitness: Bitness, base: Reg, disp32: i32, imm: i32, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(11);
    push_rex_if_needed(bitness, false, false, false, reg_ext(base), &mut bytes);
    bytes.push(0xC7);
    let rm = reg_low3(base);
    bytes.push(modrm_byte(0b10, 0, rm));
    if rm == 0b100 {
        bytes.push(sib_no_index(rm));
    }
    bytes.extend_from_slice(&disp32.to_le_bytes());
    bytes.extend_from_slice(&imm.to_le_bytes());
    decode_one(bitness, &bytes, pc)
}

/// `JMP [base + disp32]` (`FF /4`, mod=10) — an indirect jump through a
/// fixed memory slot, used to transfer to a target address staged in
/// `LocalStorage.scratch` once `%base` has been restored to the storage
/// pointer (inner indirect jump).
pub fn jmp_mem_disp32(bitness: Bitness, base: Reg, disp32: i32, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(7);
    push_rex_if_needed(bitness, false, false, false, reg_ext(base), &mut bytes);
    bytes.push(0xFF);
    let rm = reg_low3(base);
    bytes.push(modrm_byte(0b10, 4, rm));
    if rm == 0b100 {
        bytes.push(sib_no_index(rm));
    }
    bytes.extend_from_slice(&disp32.to_le_bytes());
    decode_one(bitness, &bytes, pc)
}

/// `LEA dst, <the original instruction's memory operand>` (`8D /r`): reuses
/// `insn`'s ModRM/SIB/displacement bytes verbatim but swaps the opcode for
/// `LEA` and the ModRM `reg` field for `dst`, so the result computes the same
/// effective address as `insn` without touching memory (capture).
/// `insn.modrm` must be `Some` and not register-direct.
pub fn lea_from_modrm(bitness: Bitness, insn: &DecodedInsn, dst: Reg, pc: u64) -> DecodedInsn {
    debug_assert!(!insn.modrm.expect("lea_from_modrm requires a ModRM operand").is_register_direct());
    reuse_modrm(bitness, insn, 0x8D, dst, true, pc)
}

/// `MOV dst, <insn's own r/m operand>` (`8B /r`): reuses `insn`'s ModRM/SIB/
/// displacement bytes verbatim, register-direct or memory alike, with the
/// opcode swapped for `MOV` and the ModRM `reg` field for `dst`. Used to
/// evaluate an indirect call/jump's target expression into a work register
/// without disturbing the instruction's own operand encoding.
pub fn mov_ptr_from_rm(bitness: Bitness, insn: &DecodedInsn, dst: Reg, pc: u64) -> DecodedInsn {
    reuse_modrm(bitness, insn, 0x8B, dst, matches!(bitness, Bitness::X64), pc)
}

/// Re-encode `insn` with the same ModRM/SIB/displacement bytes but a new
/// opcode and ModRM `reg` field, widening to 64 bits on request.
fn reuse_modrm(bitness: Bitness, insn: &DecodedInsn, opcode: u8, reg: Reg, widen: bool, pc: u64) -> DecodedInsn {
    let modrm = insn.modrm.expect("reuse_modrm requires a ModRM operand");
    let mut bytes = Vec::with_capacity(insn.len as usize);
    let (x, b) = insn.rex.map(|r| (r.x, r.b)).unwrap_or((false, false));
    push_rex_if_needed(bitness, widen, reg_ext(reg), x, b, &mut bytes);
    bytes.push(opcode);
    bytes.push(modrm_byte(modrm.md, reg_low3(reg), modrm.rm));
    if let Some(sib) = insn.sib {
        bytes.push(sib.raw);
    }
    if insn.disp.present() {
        match insn.disp.size {
            1 => bytes.push(insn.disp.value as u8),
            4 => bytes.extend_from_slice(&(insn.disp.value as i32).to_le_bytes()),
            _ => unreachable!("ModRM displacement is either 1 or 4 bytes"),
        }
    }
    decode_one(bitness, &bytes, pc)
}

/// `TEST a, a` (`85 /r`, mod=11) — used by the entry prologue to check the
/// allocator's return value.
pub fn test_reg_reg(bitness: Bitness, a: Reg, b: Reg, pc: u64) -> DecodedInsn {
    let mut bytes = Vec::with_capacity(3);
    let widen = matches!(bitness, Bitness::X64);
    push_rex_if_needed(bitness, widen, reg_ext(a), false, reg_ext(b), &mut bytes);
    bytes.push(0x85);
    bytes.push(modrm_byte(0b11, reg_low3(a), reg_low3(b)));
    decode_one(bitness, &bytes, pc)
}

/// `JMP rel32`, displacement not yet known (placeholder `0`); finalized by
/// the emitter once offsets stabilize.
pub fn jmp_rel32(bitness: Bitness, pc: u64) -> DecodedInsn {
    let mut bytes = [0u8; 5];
    bytes[0] = 0xE9;
    decode_one(bitness, &bytes, pc)
}

/// `JMP rel8`, placeholder displacement.
pub fn jmp_rel8(bitness: Bitness, pc: u64) -> DecodedInsn {
    decode_one(bitness, &[0xEB, 0x00], pc)
}

/// `Jcc rel32` (`0F 8x`), `cc` the condition nibble shared with the short
/// form.
pub fn jcc_rel32(bitness: Bitness, cc: u8, pc: u64) -> DecodedInsn {
    let mut bytes = [0u8; 6];
    bytes[0] = 0x0F;
    bytes[1] = 0x80 | (cc & 0x0F);
    decode_one(bitness, &bytes, pc)
}

/// `Jcc rel8` (`7x`), placeholder displacement.
pub fn jcc_rel8(bitness: Bitness, cc: u8, pc: u64) -> DecodedInsn {
    decode_one(bitness, &[0x70 | (cc & 0x0F), 0x00], pc)
}

/// `CALL rel32`, placeholder displacement.
pub fn call_rel32(bitness: Bitness, pc: u64) -> DecodedInsn {
    let mut bytes = [0u8; 5];
    bytes[0] = 0xE8;
    decode_one(bitness, &bytes, pc)
}

/// `RET` (no operand).
pub fn ret(bitness: Bitness, pc: u64) -> DecodedInsn {
    decode_one(bitness, &[0xC3], pc)
}

/// Patch a 1-byte-opcode `rel8` jump's displacement in place (`JMP rel8`,
/// `Jcc rel8`, `LOOP*`/`JCXZ`'s `Jb` forms — all single opcode byte + 1-byte
/// displacement).
pub fn patch_rel8(bytes: &mut [u8], disp: i8) {
    let last = bytes.len() - 1;
    bytes[last] = disp as u8;
}

/// Patch a `rel32` jump/call's trailing 4-byte displacement in place.
pub fn patch_rel32(bytes: &mut [u8], disp: i32) {
    let len = bytes.len();
    bytes[len - 4..].copy_from_slice(&disp.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jmp_rel32_decodes_to_five_bytes() {
        let insn = jmp_rel32(Bitness::X86, 0x1000);
        assert_eq!(insn.len, 5);
    }

    #[test]
    fn jcc_rel32_round_trips_condition_code() {
        let insn = jcc_rel32(Bitness::X86, 0x4, 0x1000); // JZ
        assert_eq!(insn.cc, Some(0x4));
        assert_eq!(insn.len, 6);
    }

    #[test]
    fn patch_rel32_writes_little_endian_displacement() {
        let mut bytes = [0xE9u8, 0, 0, 0, 0];
        patch_rel32(&mut bytes, -16);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), -16);
    }

    #[test]
    fn push_pop_round_trip_same_register() {
        let r12 = Reg(12);
        let push = push_reg(Bitness::X64, r12, 0x1000);
        let pop = pop_reg(Bitness::X64, r12, 0x1000);
        assert_eq!(push.len, 2, "R12 needs a REX.B prefix");
        assert_eq!(pop.len, 2);
    }

    #[test]
    fn mov_reg_imm32_widens_on_64_bit() {
        let insn = mov_reg_imm32(Bitness::X64, Reg::EAX, -1, 0x1000);
        assert_eq!(insn.len, 7); // REX.W + C7 + modrm + imm32
        let insn32 = mov_reg_imm32(Bitness::X86, Reg::EAX, -1, 0x1000);
        assert_eq!(insn32.len, 6);
    }

    #[test]
    fn mov_mem_disp8_uses_sib_for_esp_base() {
        let insn = mov_reg_mem_disp8(Bitness::X64, Reg::EAX, Reg::ESP, 8, 0x1000);
        assert_eq!(insn.len, 5); // REX + 8B + modrm + sib + disp8
    }
}
