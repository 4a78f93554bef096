//! Operand model: immediates, registers and memory references.

use core::fmt;

use crate::reg::{Reg, RegKind};
use crate::ValueType;

/// Segment override carried by a memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Segment {
    /// `fs:` override (prefix 0x64).
    Fs,
    /// `gs:` override (prefix 0x65).
    Gs,
}

/// A memory reference `base + index*scale + disp`, with optional segment
/// override.
///
/// `scale == 0` means "no index"; otherwise scale is 1, 2, 4 or 8. A base of
/// [`Reg::RIP`] denotes RIP-relative addressing with the displacement already
/// rebased by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemRef {
    /// Optional segment override.
    pub seg: Option<Segment>,
    /// Base register (GP64 or RIP), if any.
    pub base: Option<Reg>,
    /// Index register (GP64), if any.
    pub index: Option<Reg>,
    /// Index scale: 0 (no index), 1, 2, 4 or 8.
    pub scale: u8,
    /// Signed displacement.
    pub disp: i64,
}

impl MemRef {
    /// A bare `[base]` reference.
    pub const fn base(base: Reg) -> Self {
        Self {
            seg: None,
            base: Some(base),
            index: None,
            scale: 0,
            disp: 0,
        }
    }

    /// A `[base + disp]` reference.
    pub const fn base_disp(base: Reg, disp: i64) -> Self {
        Self {
            seg: None,
            base: Some(base),
            index: None,
            scale: 0,
            disp,
        }
    }

    /// An absolute `[disp]` reference with neither base nor index.
    pub const fn abs(disp: i64) -> Self {
        Self {
            seg: None,
            base: None,
            index: None,
            scale: 0,
            disp,
        }
    }

    /// Whether this reference uses RIP-relative addressing.
    pub fn is_rip_relative(&self) -> bool {
        self.base.map_or(false, |b| b.kind() == RegKind::Ip)
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.seg {
            Some(Segment::Fs) => write!(f, "%fs:")?,
            Some(Segment::Gs) => write!(f, "%gs:")?,
            None => {}
        }
        if self.disp != 0 || (self.base.is_none() && self.index.is_none()) {
            if self.disp < 0 {
                write!(f, "-0x{:x}", self.disp.unsigned_abs())?;
            } else {
                write!(f, "0x{:x}", self.disp)?;
            }
        }
        if self.base.is_some() || self.index.is_some() {
            write!(f, "(")?;
            if let Some(base) = self.base {
                write!(f, "{base}")?;
            }
            if let Some(index) = self.index {
                write!(f, ",{index},{}", self.scale.max(1))?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// A decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    /// Immediate value; `vt` gives the encoded width (8/16/32/64).
    Imm {
        /// Encoded width of the immediate.
        vt: ValueType,
        /// Value, sign-extension already applied where the encoding calls
        /// for it.
        val: u64,
    },
    /// Register operand at a given width.
    Reg(Reg),
    /// Memory operand; `vt` is the access width.
    Ind {
        /// Access width.
        vt: ValueType,
        /// The address expression.
        mem: MemRef,
    },
}

impl Operand {
    /// Immediate constructor.
    pub const fn imm(vt: ValueType, val: u64) -> Self {
        Operand::Imm { vt, val }
    }

    /// Register constructor.
    pub const fn reg(reg: Reg) -> Self {
        Operand::Reg(reg)
    }

    /// Memory constructor.
    pub const fn ind(vt: ValueType, mem: MemRef) -> Self {
        Operand::Ind { vt, mem }
    }

    /// The register, if this is a register operand.
    pub const fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// The memory reference, if this is a memory operand.
    pub const fn as_mem(&self) -> Option<&MemRef> {
        match self {
            Operand::Ind { mem, .. } => Some(mem),
            _ => None,
        }
    }

    /// The immediate value, if this is an immediate operand.
    pub const fn as_imm(&self) -> Option<u64> {
        match self {
            Operand::Imm { val, .. } => Some(*val),
            _ => None,
        }
    }

    /// Whether this operand is a memory reference.
    pub const fn is_mem(&self) -> bool {
        matches!(self, Operand::Ind { .. })
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm { val, .. } => {
                let v = *val as i64;
                if v < 0 {
                    write!(f, "$-0x{:x}", v.unsigned_abs())
                } else {
                    write!(f, "$0x{val:x}")
                }
            }
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Ind { mem, .. } => write!(f, "{mem}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::gp;

    #[test]
    fn memref_display_forms() {
        assert_eq!(MemRef::base(gp::RAX).to_string(), "(%rax)");
        assert_eq!(MemRef::base_disp(gp::RBP, -8).to_string(), "-0x8(%rbp)");
        assert_eq!(MemRef::abs(0x1000).to_string(), "0x1000");
        let full = MemRef {
            seg: None,
            base: Some(gp::RDI),
            index: Some(gp::RSI),
            scale: 4,
            disp: 0x20,
        };
        assert_eq!(full.to_string(), "0x20(%rdi,%rsi,4)");
    }

    #[test]
    fn segment_prefix_display() {
        let m = MemRef {
            seg: Some(Segment::Fs),
            base: None,
            index: None,
            scale: 0,
            disp: 0x28,
        };
        assert_eq!(m.to_string(), "%fs:0x28");
    }

    #[test]
    fn imm_display_signs() {
        assert_eq!(Operand::imm(ValueType::V32, 10).to_string(), "$0xa");
        assert_eq!(
            Operand::imm(ValueType::V64, (-16i64) as u64).to_string(),
            "$-0x10"
        );
    }
}
