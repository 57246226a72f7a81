//! Relocations: pending rewrites of 4 bytes in the emitted instrumented
//! code, applied once at deployment.

/// Which kind of 32-bit field a relocation rewrites, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// Rewrite a 32-bit immediate or displacement so the instruction's
    /// effective target address equals `destination`. Used for RIP-relative
    /// operands and for direct call/jump targets outside the function.
    RipLike { destination: u64 },
    /// Replace `imm32` with `imm32 + address_of_next_instruction` (low 32
    /// bits, on 64-bit). Used where the patched field is an absolute value
    /// rather than a destination-relative one; `orig_imm` is the value the
    /// field held before any relocation ran.
    Addr32 { orig_imm: i32 },
}

/// A pending rewrite, recorded during emission and applied at
/// deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the field to rewrite within the instrumented function.
    pub offset: u32,
    pub kind: RelocationKind,
}

impl Relocation {
    pub fn rip_like(offset: u32, destination: u64) -> Self {
        Relocation { offset, kind: RelocationKind::RipLike { destination } }
    }

    /// `orig_imm` is the 32-bit immediate the node carried *before* any
    /// relocation is applied, captured at emission time — not read back
    /// from `code`, which is what makes repeated application idempotent:
    /// the field is always recomputed from `orig_imm`, so a second `apply`
    /// with the same `function_addr` overwrites the first result with
    /// itself rather than compounding it.
    pub fn addr32(offset: u32, orig_imm: i32) -> Self {
        Relocation { offset, kind: RelocationKind::Addr32 { orig_imm } }
    }

    /// Apply this relocation to `code`, which must contain the full
    /// instrumented function starting at offset 0. `function_addr` is the
    /// runtime address `code[0]` will be mapped at.
    ///
    /// Idempotent: applying the same relocation twice with the same
    /// `function_addr` produces the same bytes, since the rewritten
    /// field is always derived from `destination`/`function_addr` (or
    /// `orig_imm`/`function_addr`) alone, never from the field's prior
    /// contents.
    pub fn apply(&self, code: &mut [u8], function_addr: u64) {
        let field = self.offset as usize;
        // The relocated field is always the last 4 bytes of the
        // instruction it belongs to; the caller guarantees `offset` points
        // at it directly (decoded during emission, not re-derived here).
        match self.kind {
            RelocationKind::RipLike { destination } => {
                let next_insn_addr = function_addr + field as u64 + 4;
                let disp = destination.wrapping_sub(next_insn_addr) as i64;
                let bytes = (disp as i32).to_le_bytes();
                code[field..field + 4].copy_from_slice(&bytes);
            }
            RelocationKind::Addr32 { orig_imm } => {
                let next_insn_addr = function_addr + field as u64 + 4;
                let value = (orig_imm as i64).wrapping_add(next_insn_addr as i64) as u32;
                code[field..field + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rip_like_application_is_idempotent() {
        let mut code = vec![0u8; 16];
        let reloc = Relocation::rip_like(4, 0x4000);
        reloc.apply(&mut code, 0x1000);
        let once = code.clone();
        reloc.apply(&mut code, 0x1000);
        assert_eq!(once, code);
    }

    #[test]
    fn rip_like_encodes_correct_displacement() {
        let mut code = vec![0u8; 16];
        // next_insn_addr = 0x1000 + 4 + 4 = 0x1008; destination 0x2008
        // => disp = 0x1000
        let reloc = Relocation::rip_like(4, 0x2008);
        reloc.apply(&mut code, 0x1000);
        let disp = i32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!(disp, 0x1000);
    }

    #[test]
    fn addr32_application_is_idempotent() {
        let mut code = vec![0u8; 16];
        code[4..8].copy_from_slice(&100i32.to_le_bytes());
        let reloc = Relocation::addr32(4, 100);
        reloc.apply(&mut code, 0x1000);
        let once = code.clone();
        reloc.apply(&mut code, 0x1000);
        assert_eq!(once, code, "a second apply must not compound onto the already-patched field");
    }
}
