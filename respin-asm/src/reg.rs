//! Register identity.
//!
//! A [`Reg`] is a storage-class kind plus an unencoded index. The decoder
//! produces plain indices 0..=15; REX/VEX decoration is recomputed by the
//! encoder, so `R8` here is just the general-purpose index 8.

use core::fmt;

/// Storage class of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegKind {
    /// Low 8-bit general purpose (AL, CL, .., SPL with REX, .., R15B).
    Gp8,
    /// Legacy high-byte registers AH, CH, DH, BH (indices 4..=7, no REX).
    Gp8h,
    /// 16-bit general purpose.
    Gp16,
    /// 32-bit general purpose.
    Gp32,
    /// 64-bit general purpose.
    Gp64,
    /// 128-bit vector register.
    Xmm,
    /// 256-bit vector register.
    Ymm,
    /// 512-bit vector register.
    Zmm,
    /// A single condition flag.
    Flag,
    /// The instruction pointer.
    Ip,
}

impl RegKind {
    /// Whether this kind names a general-purpose register of any width.
    pub const fn is_gp(&self) -> bool {
        matches!(
            self,
            RegKind::Gp8 | RegKind::Gp8h | RegKind::Gp16 | RegKind::Gp32 | RegKind::Gp64
        )
    }

    /// Whether this kind names a vector register.
    pub const fn is_vec(&self) -> bool {
        matches!(self, RegKind::Xmm | RegKind::Ymm | RegKind::Zmm)
    }
}

/// A register reference: kind plus numeric index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reg {
    kind: RegKind,
    index: u8,
}

/// Number of addressable general-purpose (and vector) registers.
pub const REG_COUNT: usize = 16;

impl Reg {
    /// Construct a register from kind and index.
    ///
    /// Indices above 15 are meaningless for GP and vector kinds; callers feed
    /// decoded 4-bit fields here.
    pub const fn new(kind: RegKind, index: u8) -> Self {
        Self { kind, index }
    }

    /// 64-bit GP register with the given index (0 = RAX .. 15 = R15).
    pub const fn gp64(index: u8) -> Self {
        Self::new(RegKind::Gp64, index)
    }

    /// 32-bit GP register with the given index.
    pub const fn gp32(index: u8) -> Self {
        Self::new(RegKind::Gp32, index)
    }

    /// 16-bit GP register with the given index.
    pub const fn gp16(index: u8) -> Self {
        Self::new(RegKind::Gp16, index)
    }

    /// 8-bit GP register with the given index.
    pub const fn gp8(index: u8) -> Self {
        Self::new(RegKind::Gp8, index)
    }

    /// XMM register with the given index.
    pub const fn xmm(index: u8) -> Self {
        Self::new(RegKind::Xmm, index)
    }

    /// The instruction pointer pseudo-register.
    pub const RIP: Reg = Reg::new(RegKind::Ip, 0);

    /// Register kind.
    pub const fn kind(&self) -> RegKind {
        self.kind
    }

    /// Unencoded register index.
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Whether this is a general-purpose register.
    pub const fn is_gp(&self) -> bool {
        self.kind.is_gp()
    }

    /// Whether this is a vector register.
    pub const fn is_vec(&self) -> bool {
        self.kind.is_vec()
    }

    /// The same register index at a different width.
    ///
    /// High-byte registers map to the low-byte register of the same index.
    pub const fn with_kind(&self, kind: RegKind) -> Reg {
        Reg::new(kind, self.index)
    }

    /// Whether encoding this register requires an extension bit (index >= 8).
    pub const fn needs_ext_bit(&self) -> bool {
        self.index >= 8
    }

    /// SPL/BPL/SIL/DIL need an empty REX prefix to select the low byte.
    pub const fn needs_empty_rex(&self) -> bool {
        matches!(self.kind, RegKind::Gp8) && self.index >= 4 && self.index <= 7
    }
}

/// 64-bit GP register constants, in encoding order.
pub mod gp {
    use super::Reg;

    /// RAX.
    pub const RAX: Reg = Reg::gp64(0);
    /// RCX.
    pub const RCX: Reg = Reg::gp64(1);
    /// RDX.
    pub const RDX: Reg = Reg::gp64(2);
    /// RBX.
    pub const RBX: Reg = Reg::gp64(3);
    /// RSP.
    pub const RSP: Reg = Reg::gp64(4);
    /// RBP.
    pub const RBP: Reg = Reg::gp64(5);
    /// RSI.
    pub const RSI: Reg = Reg::gp64(6);
    /// RDI.
    pub const RDI: Reg = Reg::gp64(7);
    /// R8.
    pub const R8: Reg = Reg::gp64(8);
    /// R9.
    pub const R9: Reg = Reg::gp64(9);
    /// R10.
    pub const R10: Reg = Reg::gp64(10);
    /// R11.
    pub const R11: Reg = Reg::gp64(11);
    /// R12.
    pub const R12: Reg = Reg::gp64(12);
    /// R13.
    pub const R13: Reg = Reg::gp64(13);
    /// R14.
    pub const R14: Reg = Reg::gp64(14);
    /// R15.
    pub const R15: Reg = Reg::gp64(15);
}

/// System V AMD64 integer parameter register for the given slot, if any.
///
/// Slots 0..=5 map to RDI, RSI, RDX, RCX, R8, R9. Stack-passed parameters
/// are not supported by the rewriter.
pub const fn param_reg(slot: usize) -> Option<Reg> {
    match slot {
        0 => Some(gp::RDI),
        1 => Some(gp::RSI),
        2 => Some(gp::RDX),
        3 => Some(gp::RCX),
        4 => Some(gp::R8),
        5 => Some(gp::R9),
        _ => None,
    }
}

/// Whether a GP index is callee-saved under the System V AMD64 ABI.
pub const fn is_callee_saved(index: u8) -> bool {
    matches!(index, 3 | 5 | 12 | 13 | 14 | 15)
}

const GP64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
    "r12", "r13", "r14", "r15",
];

const GP32_NAMES: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d",
    "r11d", "r12d", "r13d", "r14d", "r15d",
];

const GP16_NAMES: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w",
    "r12w", "r13w", "r14w", "r15w",
];

const GP8_NAMES: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b",
    "r12b", "r13b", "r14b", "r15b",
];

const GP8H_NAMES: [&str; 4] = ["ah", "ch", "dh", "bh"];

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = (self.index & 0x0f) as usize;
        match self.kind {
            RegKind::Gp64 => write!(f, "%{}", GP64_NAMES[i]),
            RegKind::Gp32 => write!(f, "%{}", GP32_NAMES[i]),
            RegKind::Gp16 => write!(f, "%{}", GP16_NAMES[i]),
            RegKind::Gp8 => write!(f, "%{}", GP8_NAMES[i]),
            RegKind::Gp8h => write!(f, "%{}", GP8H_NAMES[i & 3]),
            RegKind::Xmm => write!(f, "%xmm{i}"),
            RegKind::Ymm => write!(f, "%ymm{i}"),
            RegKind::Zmm => write!(f, "%zmm{i}"),
            RegKind::Flag => write!(f, "%flag{i}"),
            RegKind::Ip => write!(f, "%rip"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_registers_follow_sysv_order() {
        let regs: Vec<_> = (0..6).map(|i| param_reg(i).unwrap()).collect();
        assert_eq!(
            regs,
            vec![gp::RDI, gp::RSI, gp::RDX, gp::RCX, gp::R8, gp::R9]
        );
        assert!(param_reg(6).is_none());
    }

    #[test]
    fn callee_saved_set() {
        let saved: Vec<u8> = (0..16).filter(|i| is_callee_saved(*i)).collect();
        assert_eq!(saved, vec![3, 5, 12, 13, 14, 15]);
    }

    #[test]
    fn display_widths() {
        assert_eq!(gp::RAX.to_string(), "%rax");
        assert_eq!(gp::RAX.with_kind(RegKind::Gp32).to_string(), "%eax");
        assert_eq!(gp::R13.with_kind(RegKind::Gp8).to_string(), "%r13b");
        assert_eq!(Reg::new(RegKind::Gp8h, 4).to_string(), "%ah");
    }

    #[test]
    fn low_byte_rex_set() {
        assert!(Reg::gp8(4).needs_empty_rex());
        assert!(Reg::gp8(7).needs_empty_rex());
        assert!(!Reg::gp8(3).needs_empty_rex());
        assert!(!Reg::gp8(8).needs_empty_rex());
    }
}
