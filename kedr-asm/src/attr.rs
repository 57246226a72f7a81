//! Opcode attribute types: addressing methods and operand-type codes, the
//! vocabulary the primary/escape/group tables (`tables.rs`) are expressed in.
//!
//! Naming follows the Intel SDM's addressing-method / operand-type letters
//! (`Eb`, `Gv`, `Jz`, ...) since that is the least ambiguous way to describe
//! "ModRM r/m, byte size" to a reader who already knows x86 encoding.

/// Bitness the decoder is operating in. Only two are in scope (§1 Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    pub const fn is_long_mode(self) -> bool {
        matches!(self, Bitness::X64)
    }
}

/// One decoded operand's addressing method and size, enough to know which
/// extra bytes (ModRM/SIB/disp/imm) the operand consumes and which registers
/// it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Operand is not used by this instruction.
    None,
    /// ModRM.rm, byte size, may be memory or register.
    Eb,
    /// ModRM.rm, operand-size-dependent (16/32/64), may be memory or register.
    Ev,
    /// ModRM.rm, 16/32-bit depending on operand size (never 64), memory or register.
    Ez,
    /// ModRM.rm, memory only (instruction is illegal with mod==11).
    M,
    /// ModRM.reg, byte size.
    Gb,
    /// ModRM.reg, operand-size-dependent.
    Gv,
    /// ModRM.reg names a control register (MOV to/from CRn).
    Cd,
    /// ModRM.reg names a debug register (MOV to/from DRn).
    Dd,
    /// Immediate byte, sign-extended where the instruction form calls for it.
    Ib,
    /// Immediate, operand-size-dependent (16/32, never 64; 64-bit immediates
    /// do not occur in the subset this decoder covers).
    Iz,
    /// Immediate word (used by `RET imm16`).
    Iw,
    /// Relative offset, byte size (short jump family).
    Jb,
    /// Relative offset, operand-size-dependent (near jump family).
    Jz,
    /// Register encoded in the low 3 bits of the opcode byte (+ REX.B),
    /// as in `PUSH r32` (`50+r`) or `MOV r32, imm32` (`B8+r`).
    OpcodeReg,
    /// Implicit `AL`/`AX`/`EAX`/`RAX`, not encoded anywhere in the bytes.
    ImplicitAcc,
    /// Implicit `DX`, used by `IN`/`OUT`.
    ImplicitDx,
}

/// Which group (ModRM.reg-indexed) table, if any, an opcode dispatches
/// through. Named after the Intel SDM's "Group N" numbering so the mapping
/// in `tables.rs` is checkable against a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupId {
    /// `80`/`81`/`83` — ALU op selected by ModRM.reg.
    Group1,
    /// `FE` — `INC`/`DEC` (byte only).
    GroupFe,
    /// `F6`/`F7` — `TEST`/`NOT`/`NEG`/`MUL`/`IMUL`/`DIV`/`IDIV`.
    Group3,
    /// `FF` — `INC`/`DEC`/`CALL`/`JMP`/`PUSH`.
    Group5,
    /// `C6`/`C7` — `MOV` (the only ModRM.reg value defined is 0).
    Group11,
    /// `0F 01` — system group; only `/7` (`INVLPG`) is decoded specifically.
    Group7,
    /// `0F AE` — `LFENCE`/`MFENCE`/`SFENCE` plus memory-operand state ops.
    Group15,
}

/// A fully resolved opcode attribute entry: mnemonic class plus up to three
/// operand descriptors, as returned by a primary/escape/group table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeEntry {
    pub mnemonic: Mnemonic,
    pub operands: [Operand; 3],
    /// Set when this entry is itself a group header: the real mnemonic and
    /// operands are resolved by a second lookup keyed on ModRM.reg.
    pub group: Option<GroupId>,
}

impl OpcodeEntry {
    pub const fn new(mnemonic: Mnemonic, operands: [Operand; 3]) -> Self {
        OpcodeEntry { mnemonic, operands, group: None }
    }

    pub const fn group(group: GroupId) -> Self {
        OpcodeEntry { mnemonic: Mnemonic::GroupDispatch, operands: [Operand::None; 3], group: Some(group) }
    }
}

/// The mnemonic classes the decoder distinguishes. This is not a complete
/// x86 mnemonic list — only what the block analyzer and IR transformer
/// (`kedr-core`) need to tell apart (§4.5, §4.7): control transfers, locked
/// updates, string/IO/barrier ops, and an `Other` bucket for everything else
/// that decodes cleanly but carries no special instrumentation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Mnemonic {
    Mov,
    MovCr,
    MovDr,
    Lea,
    Alu(AluOp),
    Test,
    Not,
    Neg,
    Inc,
    Dec,
    Push,
    Pop,
    Pushad,
    Popad,
    Xchg,
    Nop,
    JmpRel,
    JccRel,
    CallRel,
    JmpIndirect,
    CallIndirect,
    JmpFar,
    CallFar,
    Ret,
    Retf,
    Iret,
    Jcxz,
    Loop,
    Loope,
    Loopne,
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
    In,
    Out,
    Cpuid,
    Invd,
    Wbinvd,
    Invlpg,
    Lfence,
    Mfence,
    Sfence,
    Ud2,
    /// Placeholder used only by [`OpcodeEntry::group`]; never returned as a
    /// final decode result.
    GroupDispatch,
    /// Decodes (length and operand shape are known) but carries no specific
    /// instrumentation behavior — treated as a plain data-processing
    /// instruction by the block analyzer.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub const ALL: [AluOp; 8] = [
        AluOp::Add, AluOp::Or, AluOp::Adc, AluOp::Sbb,
        AluOp::And, AluOp::Sub, AluOp::Xor, AluOp::Cmp,
    ];

    pub const fn from_index(i: u8) -> Self {
        Self::ALL[(i & 7) as usize]
    }
}
