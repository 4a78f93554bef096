//! Typed instructions: mnemonics, value types, operand forms and
//! passthrough descriptors.

use core::fmt;

use bitflags::bitflags;

use crate::cond::Cond;
use crate::operand::Operand;

/// Operand width / value interpretation of an instruction or operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// No meaningful value type (e.g. `ret`).
    #[default]
    None,
    /// The width is implied by the opcode; the encoder must not derive
    /// REX.W from it.
    Implicit,
    /// 8 bits.
    V8,
    /// 16 bits.
    V16,
    /// 32 bits.
    V32,
    /// 64 bits.
    V64,
    /// 128 bits (XMM).
    V128,
    /// 256 bits (YMM).
    V256,
}

impl ValueType {
    /// Width in bits, if the type is a concrete integer/vector width.
    pub const fn bits(&self) -> Option<u32> {
        match self {
            ValueType::V8 => Some(8),
            ValueType::V16 => Some(16),
            ValueType::V32 => Some(32),
            ValueType::V64 => Some(64),
            ValueType::V128 => Some(128),
            ValueType::V256 => Some(256),
            _ => None,
        }
    }

    /// Width in bytes, if concrete.
    pub const fn bytes(&self) -> Option<u32> {
        match self.bits() {
            Some(b) => Some(b / 8),
            None => None,
        }
    }

    /// The GP integer width for a byte count (1, 2, 4 or 8).
    pub const fn from_bytes(n: u32) -> ValueType {
        match n {
            1 => ValueType::V8,
            2 => ValueType::V16,
            4 => ValueType::V32,
            _ => ValueType::V64,
        }
    }
}

/// Operand-encoding schema, named after the Intel manual's Op/En column.
///
/// The decoder uses it to parse operand bytes; the encoder dispatches on it
/// to lay ModR/M, SIB, displacement and immediates back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)] // schema names follow the manual
pub enum Encoding {
    MR,
    RM,
    MI,
    M1,
    MC,
    RMI,
    OI,
    O,
    I,
    IA,
    D,
    M,
    NP,
}

bitflags! {
    /// Prefix bytes observed during decoding, re-emitted for passthrough
    /// instructions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Prefixes: u8 {
        /// Operand-size override 0x66.
        const OPSIZE = 1 << 0;
        /// 0xF3 (REP / mandatory prefix).
        const REP = 1 << 1;
        /// 0xF2 (REPNE / mandatory prefix).
        const REPNE = 1 << 2;
        /// Branch hint 0x2E.
        const HINT = 1 << 3;
        /// REX.W was set on the source instruction.
        const REXW = 1 << 4;
    }
}

/// How an unmodeled (passthrough) instruction changes tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StateChange {
    /// Touches no tracked location.
    #[default]
    None,
    /// The destination operand (when it is a tracked GP register) becomes
    /// dynamic.
    DstDyn,
    /// The arithmetic flags become dynamic.
    FlagsDyn,
}

/// VEX encoding request for a passthrough instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vex {
    /// Opcode map (`mm`): 1 = 0F, 2 = 0F38, 3 = 0F3A.
    pub map: u8,
    /// Implied legacy prefix (`pp`): 0 = none, 1 = 66, 2 = F3, 3 = F2.
    pub pp: u8,
    /// VEX.W bit.
    pub w: bool,
    /// VEX.L bit (256-bit).
    pub l: bool,
    /// Inverted second-source register field, unencoded index.
    pub vvvv: u8,
}

/// Re-emission descriptor for instructions the emulator does not model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Passthrough {
    /// Mandatory/legacy prefixes of the source instruction.
    pub prefixes: Prefixes,
    /// Opcode bytes (1 to 3 of them).
    pub opcode: [u8; 3],
    /// How many opcode bytes are significant.
    pub opc_len: u8,
    /// Operand-encoding schema.
    pub enc: Encoding,
    /// Effect on tracked state.
    pub change: StateChange,
    /// VEX variant, if the instruction must be emitted VEX-encoded.
    pub vex: Option<Vex>,
}

/// Mnemonic enumeration.
///
/// The three conditional families (`J*`, `SET*`, `CMOV*`) are laid out in
/// condition-code order so the decoder can derive the member from the low
/// opcode nibble; [`InstrKind::jcc`] and friends rely on the contiguous
/// discriminants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::FromRepr, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u16)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)] // mnemonics
pub enum InstrKind {
    /// Decoder marker for an unrecognized byte sequence.
    Invalid,
    Nop,
    // integer ALU
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Mul,
    Imul,
    Div,
    Idiv,
    Shl,
    Shr,
    Sar,
    // data movement
    Mov,
    Movsx,
    Movsxd,
    Movzx,
    Xchg,
    Bswap,
    Lea,
    Push,
    Pop,
    Leave,
    Cltq,
    Cqto,
    Movs,
    #[strum(serialize = "rep movs")]
    RepMovs,
    // control transfer
    Call,
    Ret,
    Jmp,
    /// Indirect jump through a register or memory operand.
    #[strum(serialize = "jmp*")]
    JmpI,
    // Jcc family, condition-code order
    Jo,
    Jno,
    Jb,
    Jae,
    Je,
    Jne,
    Jbe,
    Ja,
    Js,
    Jns,
    Jp,
    Jnp,
    Jl,
    Jge,
    Jle,
    Jg,
    // SETcc family, condition-code order
    Seto,
    Setno,
    Setb,
    Setae,
    Sete,
    Setne,
    Setbe,
    Seta,
    Sets,
    Setns,
    Setp,
    Setnp,
    Setl,
    Setge,
    Setle,
    Setg,
    // CMOVcc family, condition-code order
    Cmovo,
    Cmovno,
    Cmovb,
    Cmovae,
    Cmove,
    Cmovne,
    Cmovbe,
    Cmova,
    Cmovs,
    Cmovns,
    Cmovp,
    Cmovnp,
    Cmovl,
    Cmovge,
    Cmovle,
    Cmovg,
    // SSE/SSE2 passthrough set
    Movss,
    Movsd,
    Movups,
    Movupd,
    Movaps,
    Movapd,
    Movdqa,
    Movdqu,
    Movd,
    Movq,
    Movlps,
    Movlpd,
    Movhps,
    Movhpd,
    Unpcklps,
    Unpcklpd,
    Addss,
    Addsd,
    Addps,
    Addpd,
    Subss,
    Subsd,
    Subps,
    Subpd,
    Mulss,
    Mulsd,
    Mulps,
    Mulpd,
    Divss,
    Divsd,
    Divps,
    Divpd,
    Minss,
    Minsd,
    Minps,
    Minpd,
    Maxss,
    Maxsd,
    Maxps,
    Maxpd,
    Sqrtss,
    Sqrtsd,
    Andps,
    Andpd,
    Orps,
    Orpd,
    Xorps,
    Xorpd,
    Pand,
    Por,
    Pxor,
    Paddq,
    Ucomiss,
    Ucomisd,
    Comiss,
    Comisd,
    Cvtsi2ss,
    Cvtsi2sd,
    Cvtss2si,
    Cvtsd2si,
    Cvttss2si,
    Cvttsd2si,
    Cvtss2sd,
    Cvtsd2ss,
}

impl InstrKind {
    /// Conditional jump for a condition code.
    pub fn jcc(cond: Cond) -> InstrKind {
        InstrKind::from_repr(InstrKind::Jo as u16 + cond as u16).expect("contiguous family")
    }

    /// `SETcc` for a condition code.
    pub fn setcc(cond: Cond) -> InstrKind {
        InstrKind::from_repr(InstrKind::Seto as u16 + cond as u16).expect("contiguous family")
    }

    /// `CMOVcc` for a condition code.
    pub fn cmovcc(cond: Cond) -> InstrKind {
        InstrKind::from_repr(InstrKind::Cmovo as u16 + cond as u16).expect("contiguous family")
    }

    /// The condition code, if this mnemonic belongs to a conditional family.
    pub fn cond(&self) -> Option<Cond> {
        let d = *self as u16;
        for base in [InstrKind::Jo, InstrKind::Seto, InstrKind::Cmovo] {
            let b = base as u16;
            if (b..b + 16).contains(&d) {
                return Cond::from_repr((d - b) as u8);
            }
        }
        None
    }

    /// Whether this is a conditional jump.
    pub fn is_jcc(&self) -> bool {
        let d = *self as u16;
        (InstrKind::Jo as u16..=InstrKind::Jg as u16).contains(&d)
    }

    /// Whether this is a conditional move.
    pub fn is_cmovcc(&self) -> bool {
        let d = *self as u16;
        (InstrKind::Cmovo as u16..=InstrKind::Cmovg as u16).contains(&d)
    }

    /// Whether this is a `SETcc`.
    pub fn is_setcc(&self) -> bool {
        let d = *self as u16;
        (InstrKind::Seto as u16..=InstrKind::Setg as u16).contains(&d)
    }

    /// Whether this mnemonic ends a decoded basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstrKind::Call | InstrKind::Ret | InstrKind::Jmp | InstrKind::JmpI
        ) || self.is_jcc()
    }
}

/// Arity of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InstrForm {
    /// No operands.
    #[default]
    Nullary,
    /// One operand (`dst`).
    Unary,
    /// Two operands (`dst`, `src`).
    Binary,
    /// Three operands (`dst`, `src`, `src2`).
    Ternary,
}

/// A decoded (or residual) instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    /// Source-program address the instruction was decoded from, or the
    /// synthetic address 0 for instructions the rewriter fabricates.
    pub addr: u64,
    /// Decoded byte length (0 for fabricated instructions until encoding).
    pub len: u8,
    /// Mnemonic.
    pub kind: InstrKind,
    /// Arity.
    pub form: InstrForm,
    /// Default value type.
    pub vtype: ValueType,
    /// First operand (destination for most forms).
    pub dst: Option<Operand>,
    /// Second operand.
    pub src: Option<Operand>,
    /// Third operand.
    pub src2: Option<Operand>,
    /// Present when the emulator must re-emit the instruction verbatim.
    pub passthrough: Option<Passthrough>,
}

impl Instr {
    /// An instruction with no operands.
    pub const fn nullary(kind: InstrKind) -> Self {
        Self {
            addr: 0,
            len: 0,
            kind,
            form: InstrForm::Nullary,
            vtype: ValueType::None,
            dst: None,
            src: None,
            src2: None,
            passthrough: None,
        }
    }

    /// A one-operand instruction.
    pub const fn unary(kind: InstrKind, vtype: ValueType, dst: Operand) -> Self {
        Self {
            addr: 0,
            len: 0,
            kind,
            form: InstrForm::Unary,
            vtype,
            dst: Some(dst),
            src: None,
            src2: None,
            passthrough: None,
        }
    }

    /// A two-operand instruction.
    pub const fn binary(kind: InstrKind, vtype: ValueType, dst: Operand, src: Operand) -> Self {
        Self {
            addr: 0,
            len: 0,
            kind,
            form: InstrForm::Binary,
            vtype,
            dst: Some(dst),
            src: Some(src),
            src2: None,
            passthrough: None,
        }
    }

    /// A three-operand instruction.
    pub const fn ternary(
        kind: InstrKind,
        vtype: ValueType,
        dst: Operand,
        src: Operand,
        src2: Operand,
    ) -> Self {
        Self {
            addr: 0,
            len: 0,
            kind,
            form: InstrForm::Ternary,
            vtype,
            dst: Some(dst),
            src: Some(src),
            src2: Some(src2),
            passthrough: None,
        }
    }

    /// Attach source address and length.
    pub const fn at(mut self, addr: u64, len: u8) -> Self {
        self.addr = addr;
        self.len = len;
        self
    }

    /// Attach a passthrough descriptor.
    pub const fn with_passthrough(mut self, pt: Passthrough) -> Self {
        self.passthrough = Some(pt);
        self
    }

    /// Whether the instruction ends a decoded basic block.
    pub fn is_terminator(&self) -> bool {
        self.kind.is_terminator()
    }

    /// Operands in order, as a fixed array.
    pub const fn operands(&self) -> [Option<Operand>; 3] {
        [self.dst, self.src, self.src2]
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_ref())?;
        // AT&T operand order: sources first.
        let mut ops = [self.src2, self.src, self.dst].into_iter().flatten();
        if let Some(first) = ops.next() {
            write!(f, " {first}")?;
            for op in ops {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::gp;
    use strum::IntoEnumIterator;

    #[test]
    fn conditional_families_are_contiguous() {
        assert_eq!(InstrKind::Jo as u16 + 15, InstrKind::Jg as u16);
        assert_eq!(InstrKind::Seto as u16 + 15, InstrKind::Setg as u16);
        assert_eq!(InstrKind::Cmovo as u16 + 15, InstrKind::Cmovg as u16);
        for cond in Cond::iter() {
            assert_eq!(InstrKind::jcc(cond).cond(), Some(cond));
            assert_eq!(InstrKind::setcc(cond).cond(), Some(cond));
            assert_eq!(InstrKind::cmovcc(cond).cond(), Some(cond));
        }
    }

    #[test]
    fn terminators() {
        assert!(InstrKind::Ret.is_terminator());
        assert!(InstrKind::Call.is_terminator());
        assert!(InstrKind::Jne.is_terminator());
        assert!(InstrKind::JmpI.is_terminator());
        assert!(!InstrKind::Cmove.is_terminator());
        assert!(!InstrKind::Setg.is_terminator());
        assert!(!InstrKind::Add.is_terminator());
    }

    #[test]
    fn display_att_order() {
        let i = Instr::binary(
            InstrKind::Add,
            ValueType::V64,
            Operand::reg(gp::RDI),
            Operand::imm(ValueType::V32, 3),
        );
        assert_eq!(i.to_string(), "add $0x3, %rdi");
    }
}
