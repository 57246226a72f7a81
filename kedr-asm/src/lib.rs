//! x86/x86-64 instruction decoding.
//!
//! `kedr-asm` decodes one instruction at a time from a raw byte slice into a
//! [`DecodedInsn`] value. It knows nothing about functions, basic blocks, or
//! instrumentation — that belongs to `kedr-core`, which walks a function's
//! bytes by repeatedly calling [`Decoder::decode`] and folds the results into
//! its own IR.

#![forbid(unsafe_code)]

mod attr;
mod decode;
mod error;
mod insn;
mod prefix;
mod reg;
mod tables;

pub use attr::{AluOp, Bitness, GroupId, Mnemonic, Operand, OpcodeEntry};
pub use decode::Decoder;
pub use error::DecodeError;
pub use insn::{DecodedInsn, Field, ModRm, Sib, MAX_INSN_LEN};
pub use prefix::{LegacyPrefix, MandatoryPrefix, Rex};
pub use reg::{Reg, RegMask};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode32(bytes: &[u8]) -> DecodedInsn {
        Decoder::new(Bitness::X86).decode(bytes, 0x1000).unwrap()
    }

    fn decode64(bytes: &[u8]) -> DecodedInsn {
        Decoder::new(Bitness::X64).decode(bytes, 0x1000).unwrap()
    }

    // mov eax, ebx / mov eax, [ebx] / lea eax, [ebx+4] / lock add [eax], ebx
    #[rstest::rstest]
    #[case(&[0x89, 0xD8], Mnemonic::Mov, false, false)]
    #[case(&[0x8B, 0x03], Mnemonic::Mov, true, false)]
    #[case(&[0x8D, 0x43, 0x04], Mnemonic::Lea, false, false)]
    #[case(&[0xF0, 0x01, 0x18], Mnemonic::Alu(AluOp::Add), true, true)]
    fn decodes_primary_opcode_forms(
        #[case] bytes: &[u8],
        #[case] expected_mnemonic: Mnemonic,
        #[case] expected_tracked: bool,
        #[case] expected_locked: bool,
    ) {
        let insn = decode32(bytes);
        assert_eq!(insn.mnemonic, expected_mnemonic);
        assert_eq!(insn.is_tracked_mem_op(), expected_tracked);
        assert_eq!(insn.is_locked, expected_locked);
    }

    #[test]
    fn decodes_short_jump_with_target() {
        // jmp +2
        let insn = decode32(&[0xEB, 0x02]);
        assert_eq!(insn.mnemonic, Mnemonic::JmpRel);
        assert_eq!(insn.jump_target, Some(0x1000 + 2 + 2));
    }

    #[test]
    fn decodes_near_call_with_target() {
        // call -5 (rel32, little-endian 0xFFFFFFFB)
        let insn = decode32(&[0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
        assert_eq!(insn.mnemonic, Mnemonic::CallRel);
        assert_eq!(insn.jump_target, Some(0x1000 + 5 - 5));
    }

    #[test]
    fn decodes_ff_slash_4_indirect_jump_table_pattern() {
        // jmp [table + eax*4]: FF 24 85 disp32
        let insn = decode32(&[0xFF, 0x24, 0x85, 0x00, 0x00, 0x00, 0x10]);
        assert_eq!(insn.mnemonic, Mnemonic::JmpIndirect);
        let modrm = insn.modrm.unwrap();
        assert!(modrm.is_sib_indexed_no_disp8());
        let sib = insn.sib.unwrap();
        assert!(sib.base_is_disp32_only());
    }

    #[test]
    fn decodes_rip_relative_in_long_mode_only() {
        // mov eax, [rip+0x10]
        let insn = decode64(&[0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
        assert!(insn.rip_relative);

        let insn32 = decode32(&[0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
        assert!(!insn32.rip_relative);
    }

    #[test]
    fn rejects_truncated_instruction() {
        // mov eax, imm32 missing its immediate bytes
        let err = Decoder::new(Bitness::X86).decode(&[0xB8, 0x01], 0x1000).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(_)));
    }

    #[test]
    fn rejects_undefined_opcode() {
        let err = Decoder::new(Bitness::X86).decode(&[0x0F, 0xFF], 0x1000).unwrap_err();
        assert!(matches!(err, DecodeError::UndefinedOpcode(0xFF)));
    }

    #[test]
    fn rex_w_widens_immediate_group_operand_to_32_bits_not_64() {
        // add rax, imm32 (REX.W + 81 /0): our subset never decodes a 64-bit
        // immediate, matching real x86 (there is no Iq form for ALU-imm).
        let insn = decode64(&[0x48, 0x81, 0xC0, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(insn.imm[0].size, 4);
    }

    #[test]
    fn string_op_marks_implicit_registers() {
        let insn = decode32(&[0xA4]); // movsb
        assert!(insn.reg_use_mask.contains_reg(Reg::ESI));
        assert!(insn.reg_use_mask.contains_reg(Reg::EDI));
        assert!(insn.is_barrier() == false);
        assert!(insn.is_string_op());
    }

    #[test]
    fn barrier_instructions_are_flagged() {
        let insn = decode32(&[0x0F, 0xAE, 0xE8]); // lfence
        assert_eq!(insn.mnemonic, Mnemonic::Lfence);
        assert!(insn.is_barrier());
    }

    #[quickcheck_macros::quickcheck]
    fn decode_never_reports_zero_length(seed: u8) -> bool {
        // Any single-byte NOP-family opcode decodes to a non-zero length, or
        // the decoder rejects it outright; it never claims success with
        // `len == 0`.
        let bytes = [seed];
        match Decoder::new(Bitness::X86).decode(&bytes, 0) {
            Ok(insn) => insn.len > 0,
            Err(_) => true,
        }
    }
}
