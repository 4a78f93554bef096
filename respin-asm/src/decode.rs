//! Length-complete x86-64 decoder.
//!
//! The decoder walks a byte window and produces typed [`Instr`]s one at a
//! time. It is deliberately table-shaped: every reachable opcode is an arm of
//! one declarative dispatch match (no process-global tables), and group
//! opcodes dispatch a second time on the ModR/M digit. On a malformed
//! instruction the cursor is left at the instruction start and the error
//! carries the offending bytes.

use core::fmt;

use crate::cond::Cond;
use crate::instr::{
    Encoding, Instr, InstrKind, Passthrough, Prefixes, StateChange, ValueType,
};
use crate::operand::{MemRef, Operand, Segment};
use crate::reg::{Reg, RegKind};

/// Architectural upper bound on instruction length.
pub const MAX_INSTR_LEN: usize = 15;

/// Up to [`MAX_INSTR_LEN`] raw bytes of a rejected instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    /// The bytes, valid up to `len`.
    pub bytes: [u8; MAX_INSTR_LEN],
    /// Number of valid bytes.
    pub len: u8,
}

impl ByteWindow {
    fn capture(buf: &[u8], start: usize) -> Self {
        let mut bytes = [0u8; MAX_INSTR_LEN];
        let avail = buf.len().saturating_sub(start).min(MAX_INSTR_LEN);
        bytes[..avail].copy_from_slice(&buf[start..start + avail]);
        Self {
            bytes,
            len: avail as u8,
        }
    }

    /// The valid bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Display for ByteWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.as_slice().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Decoder failure, with the byte offset relative to the decode window and
/// the raw bytes that were rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The opcode (or required sub-opcode digit) is not in the supported
    /// subset.
    #[error("bad opcode at offset {offset}: [{window}]")]
    BadOpcode {
        /// Offset of the instruction start.
        offset: usize,
        /// The offending bytes.
        window: ByteWindow,
    },
    /// Malformed or overlong prefix run.
    #[error("bad prefix sequence at offset {offset}: [{window}]")]
    BadPrefix {
        /// Offset of the instruction start.
        offset: usize,
        /// The offending bytes.
        window: ByteWindow,
    },
    /// The window ended in the middle of an instruction.
    #[error("truncated instruction at offset {offset}")]
    Truncated {
        /// Offset of the instruction start.
        offset: usize,
    },
}

impl DecodeError {
    /// Offset of the rejected instruction within the decode window.
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::BadOpcode { offset, .. }
            | DecodeError::BadPrefix { offset, .. }
            | DecodeError::Truncated { offset } => *offset,
        }
    }
}

/// Decoded prefix run.
#[derive(Debug, Clone, Copy, Default)]
struct Pfx {
    prefixes: Prefixes,
    seg: Option<Segment>,
    rex: u8,
}

impl Pfx {
    fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }
    fn rex_r(&self) -> u8 {
        (self.rex >> 2) & 1
    }
    fn rex_x(&self) -> u8 {
        (self.rex >> 1) & 1
    }
    fn rex_b(&self) -> u8 {
        self.rex & 1
    }
    fn has_rex(&self) -> bool {
        self.rex != 0
    }

    /// Standard operand width: 64 with REX.W, 16 with 0x66, else 32.
    fn vt_std(&self) -> ValueType {
        if self.rex_w() {
            ValueType::V64
        } else if self.prefixes.contains(Prefixes::OPSIZE) {
            ValueType::V16
        } else {
            ValueType::V32
        }
    }
}

/// ModR/M register-or-memory half.
enum Rm {
    Reg(u8),
    Mem(MemRef),
}

/// Streaming decoder over a byte window.
///
/// `base` is the source address of `buf[0]`; decoded instructions carry
/// absolute addresses and branch targets.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    base: u64,
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Create a decoder over `buf`, whose first byte lives at `base`.
    pub fn new(buf: &'a [u8], base: u64) -> Self {
        Self { buf, base, pos: 0 }
    }

    /// Current offset into the window.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Source address of the next instruction.
    pub fn addr(&self) -> u64 {
        self.base.wrapping_add(self.pos as u64)
    }

    /// Whether the window is exhausted.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Decode the next instruction.
    ///
    /// On error the cursor stays at the instruction start.
    pub fn decode_next(&mut self) -> Result<Instr, DecodeError> {
        let start = self.pos;
        match self.decode_inner(start) {
            Ok(instr) => Ok(instr.at(
                self.base.wrapping_add(start as u64),
                (self.pos - start) as u8,
            )),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    fn decode_inner(&mut self, start: usize) -> Result<Instr, DecodeError> {
        let mut pfx = Pfx::default();
        loop {
            if self.pos - start >= MAX_INSTR_LEN {
                return Err(self.bad_prefix(start));
            }
            match self.peek(start)? {
                0x66 => pfx.prefixes |= Prefixes::OPSIZE,
                0xf3 => pfx.prefixes |= Prefixes::REP,
                0xf2 => pfx.prefixes |= Prefixes::REPNE,
                0x2e => pfx.prefixes |= Prefixes::HINT,
                0x64 => pfx.seg = Some(Segment::Fs),
                0x65 => pfx.seg = Some(Segment::Gs),
                b @ 0x40..=0x4f => pfx.rex = b,
                _ => break,
            }
            self.pos += 1;
        }
        if pfx.rex_w() {
            pfx.prefixes |= Prefixes::REXW;
        }
        let op = self.take(start)?;
        if op == 0x0f {
            let op2 = self.take(start)?;
            if op2 == 0x38 || op2 == 0x3a {
                // three-byte maps are reserved
                return Err(self.bad_opcode(start));
            }
            self.op_0f(start, &pfx, op2)
        } else {
            self.op_one(start, &pfx, op)
        }
    }

    // --- byte access ------------------------------------------------------

    fn peek(&self, start: usize) -> Result<u8, DecodeError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::Truncated { offset: start })
    }

    fn take(&mut self, start: usize) -> Result<u8, DecodeError> {
        let b = self.peek(start)?;
        self.pos += 1;
        Ok(b)
    }

    fn take_n<const N: usize>(&mut self, start: usize) -> Result<[u8; N], DecodeError> {
        if self.pos + N > self.buf.len() {
            return Err(DecodeError::Truncated { offset: start });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn read_i8(&mut self, start: usize) -> Result<i64, DecodeError> {
        Ok(self.take(start)? as i8 as i64)
    }

    fn read_u16(&mut self, start: usize) -> Result<u64, DecodeError> {
        Ok(u16::from_le_bytes(self.take_n(start)?) as u64)
    }

    fn read_i32(&mut self, start: usize) -> Result<i64, DecodeError> {
        Ok(i32::from_le_bytes(self.take_n(start)?) as i64)
    }

    fn read_u32(&mut self, start: usize) -> Result<u64, DecodeError> {
        Ok(u32::from_le_bytes(self.take_n(start)?) as u64)
    }

    fn read_u64(&mut self, start: usize) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take_n(start)?))
    }

    fn bad_opcode(&self, start: usize) -> DecodeError {
        DecodeError::BadOpcode {
            offset: start,
            window: ByteWindow::capture(self.buf, start),
        }
    }

    fn bad_prefix(&self, start: usize) -> DecodeError {
        DecodeError::BadPrefix {
            offset: start,
            window: ByteWindow::capture(self.buf, start),
        }
    }

    // --- operand helpers --------------------------------------------------

    /// GP register at the given width; without REX, byte indices 4..=7 name
    /// the legacy high-byte registers.
    fn gp_reg(pfx: &Pfx, idx: u8, vt: ValueType) -> Reg {
        match vt {
            ValueType::V8 => {
                if !pfx.has_rex() && (4..8).contains(&idx) {
                    Reg::new(RegKind::Gp8h, idx)
                } else {
                    Reg::gp8(idx)
                }
            }
            ValueType::V16 => Reg::gp16(idx),
            ValueType::V32 => Reg::gp32(idx),
            _ => Reg::gp64(idx),
        }
    }

    fn parse_modrm(&mut self, start: usize, pfx: &Pfx) -> Result<(Rm, u8), DecodeError> {
        let m = self.take(start)?;
        let mod_ = m >> 6;
        let reg = ((m >> 3) & 7) | (pfx.rex_r() << 3);
        let rm = m & 7;

        if mod_ == 3 {
            return Ok((Rm::Reg(rm | (pfx.rex_b() << 3)), reg));
        }

        let mut mem = MemRef {
            seg: pfx.seg,
            base: None,
            index: None,
            scale: 0,
            disp: 0,
        };
        let mut disp32_forced = false;

        if rm == 4 {
            let sib = self.take(start)?;
            let ss = sib >> 6;
            let idx = ((sib >> 3) & 7) | (pfx.rex_x() << 3);
            let base = sib & 7;
            // index 100 with REX.X clear encodes "no index"
            if idx != 4 || pfx.rex_x() == 1 {
                mem.index = Some(Reg::gp64(idx));
                mem.scale = 1 << ss;
            }
            if base == 5 && mod_ == 0 {
                disp32_forced = true;
            } else {
                mem.base = Some(Reg::gp64(base | (pfx.rex_b() << 3)));
            }
        } else if rm == 5 && mod_ == 0 {
            mem.base = Some(Reg::RIP);
            disp32_forced = true;
        } else {
            mem.base = Some(Reg::gp64(rm | (pfx.rex_b() << 3)));
        }

        mem.disp = if disp32_forced || mod_ == 2 {
            self.read_i32(start)?
        } else if mod_ == 1 {
            self.read_i8(start)?
        } else {
            0
        };

        Ok((Rm::Mem(mem), reg))
    }

    fn rm_gp_operand(pfx: &Pfx, rm: Rm, vt: ValueType) -> Operand {
        match rm {
            Rm::Reg(i) => Operand::reg(Self::gp_reg(pfx, i, vt)),
            Rm::Mem(mem) => Operand::ind(vt, mem),
        }
    }

    fn rm_vec_operand(rm: Rm, vt: ValueType) -> Operand {
        match rm {
            Rm::Reg(i) => Operand::reg(Reg::xmm(i)),
            Rm::Mem(mem) => Operand::ind(vt, mem),
        }
    }

    /// Standard-width immediate: 16-bit with 0x66, otherwise 32-bit,
    /// sign-extended to 64 under REX.W.
    fn read_imm_std(&mut self, start: usize, vt: ValueType) -> Result<u64, DecodeError> {
        Ok(match vt {
            ValueType::V16 => self.read_u16(start)?,
            ValueType::V64 => self.read_i32(start)? as u64,
            _ => self.read_u32(start)?,
        })
    }

    /// Branch displacement to an absolute target address.
    fn branch_target(&mut self, start: usize, short: bool) -> Result<u64, DecodeError> {
        let rel = if short {
            self.read_i8(start)?
        } else {
            self.read_i32(start)?
        };
        let end = self.base.wrapping_add(self.pos as u64);
        Ok(end.wrapping_add(rel as u64))
    }

    // --- one-byte opcode map ----------------------------------------------

    fn op_one(&mut self, start: usize, pfx: &Pfx, op: u8) -> Result<Instr, DecodeError> {
        const ALU_KINDS: [InstrKind; 8] = [
            InstrKind::Add,
            InstrKind::Or,
            InstrKind::Adc,
            InstrKind::Sbb,
            InstrKind::And,
            InstrKind::Sub,
            InstrKind::Xor,
            InstrKind::Cmp,
        ];

        match op {
            // ALU family: op = base + {0..5}
            0x00..=0x3d if op & 0x07 <= 5 => {
                let kind = ALU_KINDS[(op >> 3) as usize];
                self.alu_form(start, pfx, kind, op & 0x07)
            }
            0x50..=0x57 => {
                let reg = Reg::gp64((op & 7) | (pfx.rex_b() << 3));
                Ok(Instr::unary(InstrKind::Push, ValueType::V64, reg.into()))
            }
            0x58..=0x5f => {
                let reg = Reg::gp64((op & 7) | (pfx.rex_b() << 3));
                Ok(Instr::unary(InstrKind::Pop, ValueType::V64, reg.into()))
            }
            0x63 => {
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_gp_operand(pfx, rm, ValueType::V32);
                Ok(Instr::binary(InstrKind::Movsxd, vt, dst, src))
            }
            0x68 => {
                let val = self.read_i32(start)? as u64;
                let imm = Operand::imm(ValueType::V64, val);
                Ok(Instr::unary(InstrKind::Push, ValueType::V64, imm))
            }
            0x69 | 0x6b => {
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_gp_operand(pfx, rm, vt);
                let val = if op == 0x6b {
                    self.read_i8(start)? as u64
                } else {
                    self.read_imm_std(start, vt)?
                };
                let imm = Operand::imm(vt, val);
                Ok(Instr::ternary(InstrKind::Imul, vt, dst, src, imm))
            }
            0x6a => {
                let val = self.read_i8(start)? as u64;
                let imm = Operand::imm(ValueType::V64, val);
                Ok(Instr::unary(InstrKind::Push, ValueType::V64, imm))
            }
            0x70..=0x7f => {
                let cond = Cond::from_repr(op & 0x0f).expect("nibble");
                let target = self.branch_target(start, true)?;
                let imm = Operand::imm(ValueType::V64, target);
                Ok(Instr::unary(InstrKind::jcc(cond), ValueType::V64, imm))
            }
            0x80 | 0x81 | 0x83 => {
                let vt = if op == 0x80 {
                    ValueType::V8
                } else {
                    pfx.vt_std()
                };
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                let kind = ALU_KINDS[(digit & 7) as usize];
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let val = match op {
                    0x80 => self.take(start)? as u64,
                    0x83 => self.read_i8(start)? as u64,
                    _ => self.read_imm_std(start, vt)?,
                };
                Ok(Instr::binary(kind, vt, dst, Operand::imm(vt, val)))
            }
            0x84 | 0x85 => {
                let vt = if op == 0x84 { ValueType::V8 } else { pfx.vt_std() };
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let src = Operand::reg(Self::gp_reg(pfx, reg, vt));
                Ok(Instr::binary(InstrKind::Test, vt, dst, src))
            }
            0x86 | 0x87 => {
                let vt = if op == 0x86 { ValueType::V8 } else { pfx.vt_std() };
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let src = Operand::reg(Self::gp_reg(pfx, reg, vt));
                Ok(Instr::binary(InstrKind::Xchg, vt, dst, src))
            }
            0x88 | 0x89 => {
                let vt = if op == 0x88 { ValueType::V8 } else { pfx.vt_std() };
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let src = Operand::reg(Self::gp_reg(pfx, reg, vt));
                Ok(Instr::binary(InstrKind::Mov, vt, dst, src))
            }
            0x8a | 0x8b => {
                let vt = if op == 0x8a { ValueType::V8 } else { pfx.vt_std() };
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_gp_operand(pfx, rm, vt);
                Ok(Instr::binary(InstrKind::Mov, vt, dst, src))
            }
            0x8d => {
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                match rm {
                    Rm::Mem(mem) => {
                        Ok(Instr::binary(InstrKind::Lea, vt, dst, Operand::ind(vt, mem)))
                    }
                    Rm::Reg(_) => Err(self.bad_opcode(start)),
                }
            }
            0x8f => {
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                if digit & 7 != 0 {
                    return Err(self.bad_opcode(start));
                }
                let dst = Self::rm_gp_operand(pfx, rm, ValueType::V64);
                Ok(Instr::unary(InstrKind::Pop, ValueType::V64, dst))
            }
            0x90 => Ok(Instr::nullary(InstrKind::Nop)),
            0x91..=0x97 => {
                let vt = pfx.vt_std();
                let acc = Operand::reg(Self::gp_reg(pfx, 0, vt));
                let other =
                    Operand::reg(Self::gp_reg(pfx, (op & 7) | (pfx.rex_b() << 3), vt));
                Ok(Instr::binary(InstrKind::Xchg, vt, other, acc))
            }
            0x98 => Ok(Instr {
                vtype: pfx.vt_std(),
                ..Instr::nullary(InstrKind::Cltq)
            }),
            0x99 => Ok(Instr {
                vtype: pfx.vt_std(),
                ..Instr::nullary(InstrKind::Cqto)
            }),
            0xa4 | 0xa5 => {
                let vt = if op == 0xa4 { ValueType::V8 } else { pfx.vt_std() };
                let kind = if pfx.prefixes.contains(Prefixes::REP) {
                    InstrKind::RepMovs
                } else {
                    InstrKind::Movs
                };
                Ok(Instr {
                    vtype: vt,
                    ..Instr::nullary(kind)
                })
            }
            0xa8 | 0xa9 => {
                let vt = if op == 0xa8 { ValueType::V8 } else { pfx.vt_std() };
                let acc = Operand::reg(Self::gp_reg(pfx, 0, vt));
                let val = if op == 0xa8 {
                    self.take(start)? as u64
                } else {
                    self.read_imm_std(start, vt)?
                };
                Ok(Instr::binary(InstrKind::Test, vt, acc, Operand::imm(vt, val)))
            }
            0xb0..=0xb7 => {
                let reg = Self::gp_reg(pfx, (op & 7) | (pfx.rex_b() << 3), ValueType::V8);
                let val = self.take(start)? as u64;
                let imm = Operand::imm(ValueType::V8, val);
                Ok(Instr::binary(InstrKind::Mov, ValueType::V8, reg.into(), imm))
            }
            0xb8..=0xbf => {
                let vt = pfx.vt_std();
                let reg = Self::gp_reg(pfx, (op & 7) | (pfx.rex_b() << 3), vt);
                // the only x86-64 form with a true 64-bit immediate
                let val = match vt {
                    ValueType::V16 => self.read_u16(start)?,
                    ValueType::V64 => self.read_u64(start)?,
                    _ => self.read_u32(start)?,
                };
                Ok(Instr::binary(InstrKind::Mov, vt, reg.into(), Operand::imm(vt, val)))
            }
            0xc0 | 0xc1 => {
                let vt = if op == 0xc0 { ValueType::V8 } else { pfx.vt_std() };
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                let kind = Self::shift_kind(digit).ok_or_else(|| self.bad_opcode(start))?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let val = self.take(start)? as u64;
                Ok(Instr::binary(kind, vt, dst, Operand::imm(ValueType::V8, val)))
            }
            0xc2 => {
                let val = self.read_u16(start)?;
                let imm = Operand::imm(ValueType::V16, val);
                Ok(Instr::unary(InstrKind::Ret, ValueType::None, imm))
            }
            0xc3 => Ok(Instr::nullary(InstrKind::Ret)),
            0xc6 | 0xc7 => {
                let vt = if op == 0xc6 { ValueType::V8 } else { pfx.vt_std() };
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                if digit & 7 != 0 {
                    return Err(self.bad_opcode(start));
                }
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let val = if op == 0xc6 {
                    self.take(start)? as u64
                } else {
                    self.read_imm_std(start, vt)?
                };
                Ok(Instr::binary(InstrKind::Mov, vt, dst, Operand::imm(vt, val)))
            }
            0xc9 => Ok(Instr::nullary(InstrKind::Leave)),
            0xd0..=0xd3 => {
                let vt = if op & 1 == 0 { ValueType::V8 } else { pfx.vt_std() };
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                let kind = Self::shift_kind(digit).ok_or_else(|| self.bad_opcode(start))?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let src = if op < 0xd2 {
                    Operand::imm(ValueType::V8, 1)
                } else {
                    Operand::reg(Reg::gp8(1)) // CL
                };
                Ok(Instr::binary(kind, vt, dst, src))
            }
            0xe8 => {
                let target = self.branch_target(start, false)?;
                let imm = Operand::imm(ValueType::V64, target);
                Ok(Instr::unary(InstrKind::Call, ValueType::V64, imm))
            }
            0xe9 | 0xeb => {
                let target = self.branch_target(start, op == 0xeb)?;
                let imm = Operand::imm(ValueType::V64, target);
                Ok(Instr::unary(InstrKind::Jmp, ValueType::V64, imm))
            }
            0xf6 | 0xf7 => {
                let vt = if op == 0xf6 { ValueType::V8 } else { pfx.vt_std() };
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                match digit & 7 {
                    0 | 1 => {
                        let val = if op == 0xf6 {
                            self.take(start)? as u64
                        } else {
                            self.read_imm_std(start, vt)?
                        };
                        Ok(Instr::binary(InstrKind::Test, vt, dst, Operand::imm(vt, val)))
                    }
                    2 => Ok(Instr::unary(InstrKind::Not, vt, dst)),
                    3 => Ok(Instr::unary(InstrKind::Neg, vt, dst)),
                    4 => Ok(Instr::unary(InstrKind::Mul, vt, dst)),
                    5 => Ok(Instr::unary(InstrKind::Imul, vt, dst)),
                    6 => Ok(Instr::unary(InstrKind::Div, vt, dst)),
                    _ => Ok(Instr::unary(InstrKind::Idiv, vt, dst)),
                }
            }
            0xfe => {
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, ValueType::V8);
                match digit & 7 {
                    0 => Ok(Instr::unary(InstrKind::Inc, ValueType::V8, dst)),
                    1 => Ok(Instr::unary(InstrKind::Dec, ValueType::V8, dst)),
                    _ => Err(self.bad_opcode(start)),
                }
            }
            0xff => {
                let vt = pfx.vt_std();
                let (rm, digit) = self.parse_modrm(start, pfx)?;
                match digit & 7 {
                    0 => Ok(Instr::unary(
                        InstrKind::Inc,
                        vt,
                        Self::rm_gp_operand(pfx, rm, vt),
                    )),
                    1 => Ok(Instr::unary(
                        InstrKind::Dec,
                        vt,
                        Self::rm_gp_operand(pfx, rm, vt),
                    )),
                    2 => Ok(Instr::unary(
                        InstrKind::Call,
                        ValueType::V64,
                        Self::rm_gp_operand(pfx, rm, ValueType::V64),
                    )),
                    4 => Ok(Instr::unary(
                        InstrKind::JmpI,
                        ValueType::V64,
                        Self::rm_gp_operand(pfx, rm, ValueType::V64),
                    )),
                    6 => Ok(Instr::unary(
                        InstrKind::Push,
                        ValueType::V64,
                        Self::rm_gp_operand(pfx, rm, ValueType::V64),
                    )),
                    _ => Err(self.bad_opcode(start)),
                }
            }
            _ => Err(self.bad_opcode(start)),
        }
    }

    fn alu_form(
        &mut self,
        start: usize,
        pfx: &Pfx,
        kind: InstrKind,
        low3: u8,
    ) -> Result<Instr, DecodeError> {
        let vt = if low3 & 1 == 0 { ValueType::V8 } else { pfx.vt_std() };
        match low3 {
            0 | 1 => {
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let src = Operand::reg(Self::gp_reg(pfx, reg, vt));
                Ok(Instr::binary(kind, vt, dst, src))
            }
            2 | 3 => {
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_gp_operand(pfx, rm, vt);
                Ok(Instr::binary(kind, vt, dst, src))
            }
            4 | 5 => {
                let acc = Operand::reg(Self::gp_reg(pfx, 0, vt));
                let val = if low3 == 4 {
                    self.take(start)? as u64
                } else {
                    self.read_imm_std(start, vt)?
                };
                Ok(Instr::binary(kind, vt, acc, Operand::imm(vt, val)))
            }
            _ => Err(self.bad_opcode(start)),
        }
    }

    fn shift_kind(digit: u8) -> Option<InstrKind> {
        match digit & 7 {
            4 => Some(InstrKind::Shl),
            5 => Some(InstrKind::Shr),
            7 => Some(InstrKind::Sar),
            _ => None,
        }
    }

    // --- two-byte opcode map ----------------------------------------------

    /// Select an SSE mnemonic by mandatory prefix:
    /// `[none, 0x66, 0xF3, 0xF2]`; `None` entries reject.
    fn sse_by_prefix(
        &self,
        start: usize,
        pfx: &Pfx,
        table: [Option<InstrKind>; 4],
    ) -> Result<InstrKind, DecodeError> {
        let slot = if pfx.prefixes.contains(Prefixes::REPNE) {
            3
        } else if pfx.prefixes.contains(Prefixes::REP) {
            2
        } else if pfx.prefixes.contains(Prefixes::OPSIZE) {
            1
        } else {
            0
        };
        table[slot].ok_or_else(|| self.bad_opcode(start))
    }

    fn passthrough(pfx: &Pfx, op2: u8, enc: Encoding, change: StateChange) -> Passthrough {
        Passthrough {
            prefixes: pfx.prefixes,
            opcode: [0x0f, op2, 0],
            opc_len: 2,
            enc,
            change,
            vex: None,
        }
    }

    /// XMM reg/rm instruction; `to_reg` picks RM (load) vs MR (store) shape.
    fn sse_rm(
        &mut self,
        start: usize,
        pfx: &Pfx,
        op2: u8,
        kind: InstrKind,
        mem_vt: ValueType,
        to_reg: bool,
        change: StateChange,
    ) -> Result<Instr, DecodeError> {
        let (rm, reg) = self.parse_modrm(start, pfx)?;
        let xmm = Operand::reg(Reg::xmm(reg));
        let rm_op = Self::rm_vec_operand(rm, mem_vt);
        let enc = if to_reg { Encoding::RM } else { Encoding::MR };
        let (dst, src) = if to_reg { (xmm, rm_op) } else { (rm_op, xmm) };
        Ok(Instr::binary(kind, ValueType::Implicit, dst, src)
            .with_passthrough(Self::passthrough(pfx, op2, enc, change)))
    }

    fn op_0f(&mut self, start: usize, pfx: &Pfx, op2: u8) -> Result<Instr, DecodeError> {
        match op2 {
            0x10 | 0x11 => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [
                        Some(InstrKind::Movups),
                        Some(InstrKind::Movupd),
                        Some(InstrKind::Movss),
                        Some(InstrKind::Movsd),
                    ],
                )?;
                let mem_vt = match kind {
                    InstrKind::Movss => ValueType::V32,
                    InstrKind::Movsd => ValueType::V64,
                    _ => ValueType::V128,
                };
                self.sse_rm(start, pfx, op2, kind, mem_vt, op2 == 0x10, StateChange::None)
            }
            0x12 | 0x13 => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [Some(InstrKind::Movlps), Some(InstrKind::Movlpd), None, None],
                )?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V64, op2 == 0x12, StateChange::None)
            }
            0x14 => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [
                        Some(InstrKind::Unpcklps),
                        Some(InstrKind::Unpcklpd),
                        None,
                        None,
                    ],
                )?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, true, StateChange::None)
            }
            0x16 | 0x17 => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [Some(InstrKind::Movhps), Some(InstrKind::Movhpd), None, None],
                )?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V64, op2 == 0x16, StateChange::None)
            }
            0x1f => {
                // multi-byte NOP; the operand only pads the length
                let _ = self.parse_modrm(start, pfx)?;
                Ok(Instr::nullary(InstrKind::Nop))
            }
            0x28 | 0x29 => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [Some(InstrKind::Movaps), Some(InstrKind::Movapd), None, None],
                )?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, op2 == 0x28, StateChange::None)
            }
            0x2a => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [None, None, Some(InstrKind::Cvtsi2ss), Some(InstrKind::Cvtsi2sd)],
                )?;
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Reg::xmm(reg));
                let src = Self::rm_gp_operand(pfx, rm, vt);
                Ok(Instr::binary(kind, ValueType::Implicit, dst, src)
                    .with_passthrough(Self::passthrough(pfx, op2, Encoding::RM, StateChange::None)))
            }
            0x2c | 0x2d => {
                let table = if op2 == 0x2c {
                    [None, None, Some(InstrKind::Cvttss2si), Some(InstrKind::Cvttsd2si)]
                } else {
                    [None, None, Some(InstrKind::Cvtss2si), Some(InstrKind::Cvtsd2si)]
                };
                let kind = self.sse_by_prefix(start, pfx, table)?;
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_vec_operand(rm, ValueType::V64);
                Ok(Instr::binary(kind, ValueType::Implicit, dst, src)
                    .with_passthrough(Self::passthrough(pfx, op2, Encoding::RM, StateChange::DstDyn)))
            }
            0x2e | 0x2f => {
                let table = if op2 == 0x2e {
                    [Some(InstrKind::Ucomiss), Some(InstrKind::Ucomisd), None, None]
                } else {
                    [Some(InstrKind::Comiss), Some(InstrKind::Comisd), None, None]
                };
                let kind = self.sse_by_prefix(start, pfx, table)?;
                let mem_vt = if pfx.prefixes.contains(Prefixes::OPSIZE) {
                    ValueType::V64
                } else {
                    ValueType::V32
                };
                self.sse_rm(start, pfx, op2, kind, mem_vt, true, StateChange::FlagsDyn)
            }
            0x40..=0x4f => {
                let cond = Cond::from_repr(op2 & 0x0f).expect("nibble");
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_gp_operand(pfx, rm, vt);
                Ok(Instr::binary(InstrKind::cmovcc(cond), vt, dst, src))
            }
            0x51 => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [None, None, Some(InstrKind::Sqrtss), Some(InstrKind::Sqrtsd)],
                )?;
                let mem_vt = if kind == InstrKind::Sqrtss {
                    ValueType::V32
                } else {
                    ValueType::V64
                };
                self.sse_rm(start, pfx, op2, kind, mem_vt, true, StateChange::None)
            }
            0x54 => self.sse_binop(start, pfx, op2, InstrKind::Andps, InstrKind::Andpd),
            0x56 => self.sse_binop(start, pfx, op2, InstrKind::Orps, InstrKind::Orpd),
            0x57 => self.sse_binop(start, pfx, op2, InstrKind::Xorps, InstrKind::Xorpd),
            0x58 | 0x59 | 0x5c | 0x5d | 0x5e | 0x5f => {
                let table: [[InstrKind; 4]; 6] = [
                    [InstrKind::Addps, InstrKind::Addpd, InstrKind::Addss, InstrKind::Addsd],
                    [InstrKind::Mulps, InstrKind::Mulpd, InstrKind::Mulss, InstrKind::Mulsd],
                    [InstrKind::Subps, InstrKind::Subpd, InstrKind::Subss, InstrKind::Subsd],
                    [InstrKind::Minps, InstrKind::Minpd, InstrKind::Minss, InstrKind::Minsd],
                    [InstrKind::Divps, InstrKind::Divpd, InstrKind::Divss, InstrKind::Divsd],
                    [InstrKind::Maxps, InstrKind::Maxpd, InstrKind::Maxss, InstrKind::Maxsd],
                ];
                let row = match op2 {
                    0x58 => 0,
                    0x59 => 1,
                    0x5c => 2,
                    0x5d => 3,
                    0x5e => 4,
                    _ => 5,
                };
                let kinds = table[row];
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [Some(kinds[0]), Some(kinds[1]), Some(kinds[2]), Some(kinds[3])],
                )?;
                let mem_vt = if pfx.prefixes.contains(Prefixes::REP) {
                    ValueType::V32
                } else if pfx.prefixes.contains(Prefixes::REPNE) {
                    ValueType::V64
                } else {
                    ValueType::V128
                };
                self.sse_rm(start, pfx, op2, kind, mem_vt, true, StateChange::None)
            }
            0x5a => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [None, None, Some(InstrKind::Cvtss2sd), Some(InstrKind::Cvtsd2ss)],
                )?;
                let mem_vt = if kind == InstrKind::Cvtss2sd {
                    ValueType::V32
                } else {
                    ValueType::V64
                };
                self.sse_rm(start, pfx, op2, kind, mem_vt, true, StateChange::None)
            }
            0x6e => {
                if !pfx.prefixes.contains(Prefixes::OPSIZE) {
                    return Err(self.bad_opcode(start));
                }
                let kind = if pfx.rex_w() { InstrKind::Movq } else { InstrKind::Movd };
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Reg::xmm(reg));
                let src = Self::rm_gp_operand(pfx, rm, vt);
                Ok(Instr::binary(kind, ValueType::Implicit, dst, src)
                    .with_passthrough(Self::passthrough(pfx, op2, Encoding::RM, StateChange::None)))
            }
            0x6f => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [None, Some(InstrKind::Movdqa), Some(InstrKind::Movdqu), None],
                )?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, true, StateChange::None)
            }
            0x7e => {
                if pfx.prefixes.contains(Prefixes::REP) {
                    // movq xmm, xmm/m64
                    return self.sse_rm(
                        start,
                        pfx,
                        op2,
                        InstrKind::Movq,
                        ValueType::V64,
                        true,
                        StateChange::None,
                    );
                }
                if !pfx.prefixes.contains(Prefixes::OPSIZE) {
                    return Err(self.bad_opcode(start));
                }
                let kind = if pfx.rex_w() { InstrKind::Movq } else { InstrKind::Movd };
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, vt);
                let src = Operand::reg(Reg::xmm(reg));
                Ok(Instr::binary(kind, ValueType::Implicit, dst, src)
                    .with_passthrough(Self::passthrough(pfx, op2, Encoding::MR, StateChange::DstDyn)))
            }
            0x7f => {
                let kind = self.sse_by_prefix(
                    start,
                    pfx,
                    [None, Some(InstrKind::Movdqa), Some(InstrKind::Movdqu), None],
                )?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, false, StateChange::None)
            }
            0x80..=0x8f => {
                let cond = Cond::from_repr(op2 & 0x0f).expect("nibble");
                let target = self.branch_target(start, false)?;
                let imm = Operand::imm(ValueType::V64, target);
                Ok(Instr::unary(InstrKind::jcc(cond), ValueType::V64, imm))
            }
            0x90..=0x9f => {
                let cond = Cond::from_repr(op2 & 0x0f).expect("nibble");
                let (rm, _) = self.parse_modrm(start, pfx)?;
                let dst = Self::rm_gp_operand(pfx, rm, ValueType::V8);
                Ok(Instr::unary(InstrKind::setcc(cond), ValueType::V8, dst))
            }
            0xaf => {
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_gp_operand(pfx, rm, vt);
                Ok(Instr::binary(InstrKind::Imul, vt, dst, src))
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let kind = if op2 < 0xbe { InstrKind::Movzx } else { InstrKind::Movsx };
                let src_vt = if op2 & 1 == 0 { ValueType::V8 } else { ValueType::V16 };
                let vt = pfx.vt_std();
                let (rm, reg) = self.parse_modrm(start, pfx)?;
                let dst = Operand::reg(Self::gp_reg(pfx, reg, vt));
                let src = Self::rm_gp_operand(pfx, rm, src_vt);
                Ok(Instr::binary(kind, vt, dst, src))
            }
            0xc8..=0xcf => {
                let vt = pfx.vt_std();
                let reg = Self::gp_reg(pfx, (op2 & 7) | (pfx.rex_b() << 3), vt);
                Ok(Instr::unary(InstrKind::Bswap, vt, reg.into()))
            }
            0xd4 => {
                let kind = self.sse_by_prefix(start, pfx, [None, Some(InstrKind::Paddq), None, None])?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, true, StateChange::None)
            }
            0xd6 => {
                let kind = self.sse_by_prefix(start, pfx, [None, Some(InstrKind::Movq), None, None])?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V64, false, StateChange::None)
            }
            0xdb => {
                let kind = self.sse_by_prefix(start, pfx, [None, Some(InstrKind::Pand), None, None])?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, true, StateChange::None)
            }
            0xeb => {
                let kind = self.sse_by_prefix(start, pfx, [None, Some(InstrKind::Por), None, None])?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, true, StateChange::None)
            }
            0xef => {
                let kind = self.sse_by_prefix(start, pfx, [None, Some(InstrKind::Pxor), None, None])?;
                self.sse_rm(start, pfx, op2, kind, ValueType::V128, true, StateChange::None)
            }
            _ => Err(self.bad_opcode(start)),
        }
    }

    fn sse_binop(
        &mut self,
        start: usize,
        pfx: &Pfx,
        op2: u8,
        ps: InstrKind,
        pd: InstrKind,
    ) -> Result<Instr, DecodeError> {
        let kind = self.sse_by_prefix(start, pfx, [Some(ps), Some(pd), None, None])?;
        self.sse_rm(start, pfx, op2, kind, ValueType::V128, true, StateChange::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::gp;

    fn decode_one(bytes: &[u8]) -> Instr {
        let mut d = Decoder::new(bytes, 0x1000);
        let i = d.decode_next().expect("decodes");
        assert_eq!(i.len as usize, bytes.len(), "consumed everything");
        i
    }

    #[test]
    fn add_rm_reg() {
        // add %rsi, %rdi
        let i = decode_one(&[0x48, 0x01, 0xf7]);
        assert_eq!(i.kind, InstrKind::Add);
        assert_eq!(i.vtype, ValueType::V64);
        assert_eq!(i.dst, Some(Operand::reg(gp::RDI)));
        assert_eq!(i.src, Some(Operand::reg(gp::RSI)));
    }

    #[test]
    fn add_with_extended_registers() {
        // add %r9, %r8
        let i = decode_one(&[0x4d, 0x01, 0xc8]);
        assert_eq!(i.dst, Some(Operand::reg(gp::R8)));
        assert_eq!(i.src, Some(Operand::reg(gp::R9)));
    }

    #[test]
    fn lea_sib_form() {
        // lea (%rdi,%rsi,1), %rax
        let i = decode_one(&[0x48, 0x8d, 0x04, 0x37]);
        assert_eq!(i.kind, InstrKind::Lea);
        let mem = i.src.unwrap();
        let m = mem.as_mem().unwrap();
        assert_eq!(m.base, Some(gp::RDI));
        assert_eq!(m.index, Some(gp::RSI));
        assert_eq!(m.scale, 1);
        assert_eq!(i.dst, Some(Operand::reg(gp::RAX)));
    }

    #[test]
    fn rip_relative_load() {
        // mov 0x20(%rip), %rax
        let i = decode_one(&[0x48, 0x8b, 0x05, 0x20, 0x00, 0x00, 0x00]);
        let m = *i.src.unwrap().as_mem().unwrap();
        assert_eq!(m.base, Some(Reg::RIP));
        assert_eq!(m.disp, 0x20);
    }

    #[test]
    fn rbp_disp8_and_r12_sib() {
        // mov -0x8(%rbp), %rax — rbp base requires mod=01
        let i = decode_one(&[0x48, 0x8b, 0x45, 0xf8]);
        let m = *i.src.unwrap().as_mem().unwrap();
        assert_eq!(m.base, Some(gp::RBP));
        assert_eq!(m.disp, -8);
        // mov (%r12), %rax — r12 base requires a SIB byte
        let i = decode_one(&[0x49, 0x8b, 0x04, 0x24]);
        let m = *i.src.unwrap().as_mem().unwrap();
        assert_eq!(m.base, Some(gp::R12));
        assert_eq!(m.index, None);
    }

    #[test]
    fn mov_imm64() {
        let i = decode_one(&[0x48, 0xb8, 0xef, 0xbe, 0xad, 0xde, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(i.kind, InstrKind::Mov);
        assert_eq!(i.src.unwrap().as_imm(), Some(0x12345678deadbeef));
    }

    #[test]
    fn imm8_sign_extension() {
        // sub $-8, %rsp  (0x83 /5 with imm8 = 0xf8)
        let i = decode_one(&[0x48, 0x83, 0xec, 0xf8]);
        assert_eq!(i.kind, InstrKind::Sub);
        assert_eq!(i.src.unwrap().as_imm(), Some((-8i64) as u64));
    }

    #[test]
    fn jcc_targets_are_absolute() {
        // jne +4 at 0x1000, instruction is 2 bytes
        let i = decode_one(&[0x75, 0x04]);
        assert_eq!(i.kind, InstrKind::Jne);
        assert_eq!(i.dst.unwrap().as_imm(), Some(0x1006));
        assert_eq!(i.kind.cond(), Some(Cond::Ne));
    }

    #[test]
    fn jcc_rel32_backward() {
        // jge -0x20 via 0f 8d
        let i = decode_one(&[0x0f, 0x8d, 0xe0, 0xff, 0xff, 0xff]);
        assert_eq!(i.kind, InstrKind::Jge);
        assert_eq!(i.dst.unwrap().as_imm(), Some(0x1000 + 6 - 0x20));
    }

    #[test]
    fn conditional_family_from_nibble() {
        for (byte, kind) in [(0x70u8, InstrKind::Jo), (0x74, InstrKind::Je), (0x7f, InstrKind::Jg)]
        {
            let i = decode_one(&[byte, 0x00]);
            assert_eq!(i.kind, kind);
        }
    }

    #[test]
    fn cmov_and_setcc() {
        // cmovle %rdi, %rax
        let i = decode_one(&[0x48, 0x0f, 0x4e, 0xc7]);
        assert_eq!(i.kind, InstrKind::Cmovle);
        assert_eq!(i.dst, Some(Operand::reg(gp::RAX)));
        // sete %al
        let i = decode_one(&[0x0f, 0x94, 0xc0]);
        assert_eq!(i.kind, InstrKind::Sete);
        assert_eq!(i.vtype, ValueType::V8);
    }

    #[test]
    fn high_byte_vs_rex_byte_registers() {
        // mov %ah, %al without REX
        let i = decode_one(&[0x88, 0xe0]);
        assert_eq!(
            i.src.unwrap().as_reg().unwrap().kind(),
            RegKind::Gp8h
        );
        // with REX, the same encoding names %spl
        let i = decode_one(&[0x40, 0x88, 0xe0]);
        assert_eq!(i.src.unwrap().as_reg().unwrap().kind(), RegKind::Gp8);
        assert_eq!(i.src.unwrap().as_reg().unwrap().index(), 4);
    }

    #[test]
    fn group3_digits() {
        // neg %rax
        let i = decode_one(&[0x48, 0xf7, 0xd8]);
        assert_eq!(i.kind, InstrKind::Neg);
        // test $0x10, %rdi
        let i = decode_one(&[0x48, 0xf7, 0xc7, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(i.kind, InstrKind::Test);
        assert_eq!(i.src.unwrap().as_imm(), Some(0x10));
    }

    #[test]
    fn indirect_jump_and_push() {
        let i = decode_one(&[0xff, 0xe0]);
        assert_eq!(i.kind, InstrKind::JmpI);
        assert!(i.kind.is_terminator());
        let i = decode_one(&[0xff, 0x75, 0x08]);
        assert_eq!(i.kind, InstrKind::Push);
    }

    #[test]
    fn sse_passthrough_by_prefix() {
        // movsd (%rdi), %xmm0
        let i = decode_one(&[0xf2, 0x0f, 0x10, 0x07]);
        assert_eq!(i.kind, InstrKind::Movsd);
        let pt = i.passthrough.expect("passthrough");
        assert_eq!(pt.enc, Encoding::RM);
        assert!(pt.prefixes.contains(Prefixes::REPNE));
        // movaps %xmm1, %xmm0 without prefix
        let i = decode_one(&[0x0f, 0x28, 0xc1]);
        assert_eq!(i.kind, InstrKind::Movaps);
    }

    #[test]
    fn ucomis_flags_hint() {
        let i = decode_one(&[0x66, 0x0f, 0x2e, 0xc1]);
        assert_eq!(i.kind, InstrKind::Ucomisd);
        assert_eq!(i.passthrough.unwrap().change, StateChange::FlagsDyn);
    }

    #[test]
    fn rep_movs() {
        let i = decode_one(&[0xf3, 0x48, 0xa5]);
        assert_eq!(i.kind, InstrKind::RepMovs);
        assert_eq!(i.vtype, ValueType::V64);
    }

    #[test]
    fn bad_opcode_keeps_cursor_and_reports_bytes() {
        let bytes = [0x0f, 0x0b, 0x90]; // ud2
        let mut d = Decoder::new(&bytes, 0);
        let err = d.decode_next().unwrap_err();
        match err {
            DecodeError::BadOpcode { offset, window } => {
                assert_eq!(offset, 0);
                assert_eq!(&window.as_slice()[..2], &[0x0f, 0x0b]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(d.offset(), 0);
    }

    #[test]
    fn truncated_instruction() {
        let mut d = Decoder::new(&[0x48, 0x8b], 0);
        assert!(matches!(
            d.decode_next(),
            Err(DecodeError::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn segment_override_applies_to_memory_operand() {
        // mov %fs:0x28, %rax
        let i = decode_one(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00]);
        let m = *i.src.unwrap().as_mem().unwrap();
        assert_eq!(m.seg, Some(Segment::Fs));
        assert_eq!(m.base, None);
        assert_eq!(m.disp, 0x28);
    }

    #[test]
    fn multi_byte_nop() {
        // 0f 1f 44 00 00 — five-byte nop
        let i = decode_one(&[0x0f, 0x1f, 0x44, 0x00, 0x00]);
        assert_eq!(i.kind, InstrKind::Nop);
        assert_eq!(i.len, 5);
    }
}
