//! Work-register selection for synthesized sequences ("wreg").
//!
//! Unlike `%base` (chosen once per function), a work register only
//! needs to survive the handful of added instructions around one site, so
//! it is picked fresh each time and always saved/restored with a
//! `push`/`pop` pair around its use — the same idiom the entry prologue
//! uses for `%rax` — rather than tracked across the whole function.

use kedr_asm::{Bitness, Reg, RegMask};

/// Registers usable as scratch work registers, in preference order: avoid
/// `%esp` (never addressable as a plain operand without SIB) and the chosen
/// `%base` and the instruction's own operands, which the caller folds into
/// `excluded`.
fn candidates(bitness: Bitness) -> &'static [Reg] {
    const X86: [Reg; 7] = [Reg::EAX, Reg::ECX, Reg::EDX, Reg::EBX, Reg::EBP, Reg::ESI, Reg::EDI];
    const X64: [Reg; 15] = [
        Reg::EAX,
        Reg::ECX,
        Reg::EDX,
        Reg::EBX,
        Reg::EBP,
        Reg::ESI,
        Reg::EDI,
        Reg(8),
        Reg(9),
        Reg(10),
        Reg(11),
        Reg(12),
        Reg(13),
        Reg(14),
        Reg(15),
    ];
    if matches!(bitness, Bitness::X64) {
        &X64
    } else {
        &X86
    }
}

/// Pick `count` distinct work registers excluding `%base` and anything in
/// `excluded` (typically the instruction's own `reg_use_mask`). Panics if
/// fewer than `count` remain — callers that can legitimately run out (none
/// currently do; every site needs at most two registers and `%base` is
/// already carved out of the instruction's own operand set by construction)
/// should check register pressure themselves first, the way
/// [`crate::block::select_base_register`] does for `%base` itself.
pub(crate) fn choose_work_registers(bitness: Bitness, base: Reg, excluded: RegMask, count: usize) -> Vec<Reg> {
    let mut picked = Vec::with_capacity(count);
    for &reg in candidates(bitness) {
        if picked.len() == count {
            break;
        }
        if reg == base || excluded.contains_reg(reg) {
            continue;
        }
        picked.push(reg);
    }
    assert_eq!(picked.len(), count, "no work register available at this site");
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_base_and_given_mask() {
        let picked = choose_work_registers(Bitness::X64, Reg::EBX, RegMask::EAX, 2);
        assert_eq!(picked.len(), 2);
        assert!(!picked.contains(&Reg::EBX));
        assert!(!picked.contains(&Reg::EAX));
    }
}
