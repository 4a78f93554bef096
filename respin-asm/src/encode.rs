//! x86-64 instruction encoder.
//!
//! Re-emits [`Instr`]s as machine code. Each operand-encoding schema maps to
//! one assembly path over the shared ModR/M+SIB layouter. The encoder picks
//! shorter forms where a peephole allows it (imm64 that fits 32 bits, imm32
//! that fits 8, `mov r, 0` as `xor r, r`); the result then re-decodes to a
//! semantically equivalent instruction, not necessarily the same bytes.

use crate::cond::Cond;
use crate::instr::{Encoding, Instr, InstrKind, Prefixes, ValueType, Vex};
use crate::operand::{MemRef, Operand, Segment};
use crate::reg::{Reg, RegKind};

/// Upper bound on an encoded instruction.
pub const MAX_ENC_LEN: usize = 16;

/// Encoded bytes of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedInstr {
    bytes: [u8; MAX_ENC_LEN],
    len: u8,
}

impl EncodedInstr {
    /// The encoded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether nothing was encoded.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Encoder failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// No supported form covers this operand combination.
    #[error("no encodable form for {0:?} with the given operands")]
    UnsupportedOperands(InstrKind),
}

#[derive(Debug, Clone, Copy)]
enum Disp {
    None,
    D8(i8),
    D32(i32),
}

/// ModR/M mod+rm half plus SIB and displacement, with the REX extension bits
/// the choice implies.
#[derive(Debug, Clone, Copy)]
struct RmParts {
    mod_rm: u8, // mod in bits 6..7, r/m in bits 0..2
    sib: Option<u8>,
    disp: Disp,
    rex_x: bool,
    rex_b: bool,
}

impl RmParts {
    fn direct(idx: u8) -> Self {
        Self {
            mod_rm: 0xc0 | (idx & 7),
            sib: None,
            disp: Disp::None,
            rex_x: false,
            rex_b: idx >= 8,
        }
    }
}

fn scale_bits(scale: u8) -> Result<u8, EncodeError> {
    match scale {
        0 | 1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        8 => Ok(3),
        _ => Err(EncodeError::UnsupportedOperands(InstrKind::Invalid)),
    }
}

/// Lay out a memory reference as mod+r/m, SIB and displacement.
fn mem_parts(mem: &MemRef) -> Result<RmParts, EncodeError> {
    // RIP-relative: mod=00, r/m=101, disp32
    if mem.is_rip_relative() {
        let disp =
            i32::try_from(mem.disp).map_err(|_| EncodeError::UnsupportedOperands(InstrKind::Invalid))?;
        return Ok(RmParts {
            mod_rm: 0x05,
            sib: None,
            disp: Disp::D32(disp),
            rex_x: false,
            rex_b: false,
        });
    }

    let disp32 =
        i32::try_from(mem.disp).map_err(|_| EncodeError::UnsupportedOperands(InstrKind::Invalid))?;

    match (mem.base, mem.index) {
        (None, None) => {
            // disp32-only: SIB with index=100, base=101, mod=00
            Ok(RmParts {
                mod_rm: 0x04,
                sib: Some(0x25),
                disp: Disp::D32(disp32),
                rex_x: false,
                rex_b: false,
            })
        }
        (base, index) => {
            let index_bits = match index {
                Some(r) => {
                    if r.index() == 4 {
                        // RSP cannot be an index
                        return Err(EncodeError::UnsupportedOperands(InstrKind::Invalid));
                    }
                    Some((r.index(), scale_bits(mem.scale)?))
                }
                None => None,
            };

            let (mod_bits, disp) = match base {
                Some(b) if disp32 == 0 && b.index() & 7 != 5 => (0u8, Disp::None),
                // RBP/R13 have no mod=00 form; use mod=01 with disp8=0
                Some(_) if i8::try_from(disp32).is_ok() => (1, Disp::D8(disp32 as i8)),
                Some(_) => (2, Disp::D32(disp32)),
                // index without base: SIB with base=101, mod=00, disp32
                None => (0, Disp::D32(disp32)),
            };

            let need_sib = index_bits.is_some() || base.is_none() || base.map_or(false, |b| b.index() & 7 == 4);

            if need_sib {
                let (idx, ss, rex_x) = match index_bits {
                    Some((i, ss)) => (i & 7, ss, i >= 8),
                    None => (4, 0, false),
                };
                let (base_bits, rex_b) = match base {
                    Some(b) => (b.index() & 7, b.index() >= 8),
                    None => (5, false),
                };
                Ok(RmParts {
                    mod_rm: 0x04 | (mod_bits << 6),
                    sib: Some((ss << 6) | (idx << 3) | base_bits),
                    disp,
                    rex_x,
                    rex_b,
                })
            } else {
                let b = base.expect("no-base handled above");
                Ok(RmParts {
                    mod_rm: (mod_bits << 6) | (b.index() & 7),
                    sib: None,
                    disp,
                    rex_x: false,
                    rex_b: b.index() >= 8,
                })
            }
        }
    }
}

/// Immediate bytes staged for emission.
#[derive(Debug, Clone, Copy, Default)]
struct ImmBytes {
    bytes: [u8; 8],
    len: u8,
}

impl ImmBytes {
    fn none() -> Self {
        Self::default()
    }
    fn i8(v: i8) -> Self {
        let mut s = Self::default();
        s.bytes[0] = v as u8;
        s.len = 1;
        s
    }
    fn u8(v: u8) -> Self {
        let mut s = Self::default();
        s.bytes[0] = v;
        s.len = 1;
        s
    }
    fn u16(v: u16) -> Self {
        let mut s = Self::default();
        s.bytes[..2].copy_from_slice(&v.to_le_bytes());
        s.len = 2;
        s
    }
    fn i32(v: i32) -> Self {
        let mut s = Self::default();
        s.bytes[..4].copy_from_slice(&v.to_le_bytes());
        s.len = 4;
        s
    }
    fn u64(v: u64) -> Self {
        let mut s = Self::default();
        s.bytes.copy_from_slice(&v.to_le_bytes());
        s.len = 8;
        s
    }

    /// Standard-width immediate for the given operand width.
    fn std(vt: ValueType, val: u64) -> Result<Self, EncodeError> {
        match vt {
            ValueType::V8 => Ok(Self::u8(val as u8)),
            ValueType::V16 => Ok(Self::u16(val as u16)),
            ValueType::V32 => Ok(Self::i32(val as u32 as i32)),
            _ => i32::try_from(val as i64)
                .map(Self::i32)
                .map_err(|_| EncodeError::UnsupportedOperands(InstrKind::Invalid)),
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Everything `assemble` needs besides operand layout.
#[derive(Debug, Clone, Copy)]
struct Parts<'a> {
    vtype: ValueType,
    seg: Option<Segment>,
    mandatory: Prefixes,
    vex: Option<Vex>,
    opcode: &'a [u8],
    /// reg-field value (register index or sub-opcode digit) and the rm half.
    modrm: Option<(u8, RmParts)>,
    imm: ImmBytes,
    /// REX.B for a register embedded in the opcode byte (`push r`, `B8+r`).
    opreg_ext: bool,
    /// SPL/BPL/SIL/DIL present: force an empty REX.
    force_rex: bool,
    /// AH/CH/DH/BH present: any REX at all is unencodable.
    forbid_rex: bool,
}

fn assemble(kind: InstrKind, p: Parts<'_>) -> Result<EncodedInstr, EncodeError> {
    let mut out = [0u8; MAX_ENC_LEN];
    let mut n = 0usize;
    let mut push = |b: u8, out: &mut [u8; MAX_ENC_LEN], n: &mut usize| {
        out[*n] = b;
        *n += 1;
    };

    // segment override first
    match p.seg {
        Some(Segment::Fs) => push(0x64, &mut out, &mut n),
        Some(Segment::Gs) => push(0x65, &mut out, &mut n),
        None => {}
    }

    let rex_w = p.vtype == ValueType::V64 || p.mandatory.contains(Prefixes::REXW);
    let (rex_r, rex_x, rex_b) = match p.modrm {
        Some((reg, rm)) => (reg >= 8, rm.rex_x, rm.rex_b),
        None => (false, false, p.opreg_ext),
    };

    if let Some(vex) = p.vex {
        // VEX replaces both the legacy mandatory prefixes and REX
        let r_bit = (!rex_r as u8) << 7;
        if !rex_x && !rex_b && !vex.w && vex.map == 1 {
            push(0xc5, &mut out, &mut n);
            let vvvv = (!vex.vvvv & 0x0f) << 3;
            push(r_bit | vvvv | ((vex.l as u8) << 2) | (vex.pp & 3), &mut out, &mut n);
        } else {
            push(0xc4, &mut out, &mut n);
            let x_bit = (!rex_x as u8) << 6;
            let b_bit = (!rex_b as u8) << 5;
            push(r_bit | x_bit | b_bit | (vex.map & 0x1f), &mut out, &mut n);
            let vvvv = (!vex.vvvv & 0x0f) << 3;
            push(((vex.w as u8) << 7) | vvvv | ((vex.l as u8) << 2) | (vex.pp & 3), &mut out, &mut n);
        }
        // the leading 0F escape is folded into the map field
        let opcode = if p.opcode.first() == Some(&0x0f) {
            &p.opcode[1..]
        } else {
            p.opcode
        };
        for &b in opcode {
            push(b, &mut out, &mut n);
        }
    } else {
        if p.vtype == ValueType::V16 || p.mandatory.contains(Prefixes::OPSIZE) {
            push(0x66, &mut out, &mut n);
        }
        if p.mandatory.contains(Prefixes::REPNE) {
            push(0xf2, &mut out, &mut n);
        }
        if p.mandatory.contains(Prefixes::REP) {
            push(0xf3, &mut out, &mut n);
        }

        let mut rex = 0x40u8;
        if rex_w {
            rex |= 0x08;
        }
        if rex_r {
            rex |= 0x04;
        }
        if rex_x {
            rex |= 0x02;
        }
        if rex_b {
            rex |= 0x01;
        }
        if rex != 0x40 || p.force_rex {
            if p.forbid_rex {
                return Err(EncodeError::UnsupportedOperands(kind));
            }
            push(rex, &mut out, &mut n);
        }

        for &b in p.opcode {
            push(b, &mut out, &mut n);
        }
    }

    if let Some((reg, rm)) = p.modrm {
        push(rm.mod_rm | ((reg & 7) << 3), &mut out, &mut n);
        if let Some(sib) = rm.sib {
            push(sib, &mut out, &mut n);
        }
        match rm.disp {
            Disp::None => {}
            Disp::D8(d) => push(d as u8, &mut out, &mut n),
            Disp::D32(d) => {
                for b in d.to_le_bytes() {
                    push(b, &mut out, &mut n);
                }
            }
        }
    }

    for &b in p.imm.as_slice() {
        push(b, &mut out, &mut n);
    }

    Ok(EncodedInstr {
        bytes: out,
        len: n as u8,
    })
}

/// Whether the operand forces or forbids a REX prefix (byte registers).
fn byte_reg_constraints(op: Option<&Operand>) -> (bool, bool) {
    match op {
        Some(Operand::Reg(r)) => (r.needs_empty_rex(), r.kind() == RegKind::Gp8h),
        _ => (false, false),
    }
}

fn constraints(instr: &Instr) -> (bool, bool) {
    let mut force = false;
    let mut forbid = false;
    for op in [&instr.dst, &instr.src, &instr.src2] {
        let (f, b) = byte_reg_constraints(op.as_ref());
        force |= f;
        forbid |= b;
    }
    (force, forbid)
}

/// Byte-width variant of a default opcode (the `op - 1` convention of the
/// legacy map).
fn vt_is_byte(vt: ValueType) -> bool {
    vt == ValueType::V8
}

struct FormCtx<'i> {
    instr: &'i Instr,
    force_rex: bool,
    forbid_rex: bool,
}

impl<'i> FormCtx<'i> {
    fn new(instr: &'i Instr) -> Self {
        let (force_rex, forbid_rex) = constraints(instr);
        Self {
            instr,
            force_rex,
            forbid_rex,
        }
    }

    fn seg(&self) -> Option<Segment> {
        for op in [&self.instr.dst, &self.instr.src, &self.instr.src2] {
            if let Some(Operand::Ind { mem, .. }) = op {
                return mem.seg;
            }
        }
        None
    }

    fn parts<'a>(&self, opcode: &'a [u8], modrm: Option<(u8, RmParts)>, imm: ImmBytes) -> Parts<'a> {
        Parts {
            vtype: self.instr.vtype,
            seg: self.seg(),
            mandatory: Prefixes::empty(),
            vex: None,
            opcode,
            modrm,
            imm,
            opreg_ext: false,
            force_rex: self.force_rex,
            forbid_rex: self.forbid_rex,
        }
    }

    fn rm_parts(&self, op: &Operand) -> Result<RmParts, EncodeError> {
        match op {
            Operand::Reg(r) => Ok(RmParts::direct(r.index())),
            Operand::Ind { mem, .. } => mem_parts(mem),
            Operand::Imm { .. } => Err(EncodeError::UnsupportedOperands(self.instr.kind)),
        }
    }
}

/// Encode one instruction.
///
/// For relative branches (`D` form) the displacement is computed against
/// `instr.addr`, i.e. the instruction re-encodes correctly only at its
/// recorded address; block layout uses [`encode_jcc`]/[`encode_jmp_rel32`]
/// with explicit displacements instead.
pub fn encode(instr: &Instr) -> Result<EncodedInstr, EncodeError> {
    let cx = FormCtx::new(instr);
    let kind = instr.kind;
    let unsupported = || EncodeError::UnsupportedOperands(kind);

    if instr.passthrough.is_some() {
        return encode_passthrough(instr, &cx);
    }

    match kind {
        InstrKind::Nop => assemble(kind, cx.parts(&[0x90], None, ImmBytes::none())),
        InstrKind::Leave => assemble(kind, cx.parts(&[0xc9], None, ImmBytes::none())),
        InstrKind::Ret => match instr.dst {
            None => assemble(kind, cx.parts(&[0xc3], None, ImmBytes::none())),
            Some(Operand::Imm { val, .. }) => {
                assemble(kind, cx.parts(&[0xc2], None, ImmBytes::u16(val as u16)))
            }
            Some(_) => Err(unsupported()),
        },
        InstrKind::Cltq | InstrKind::Cqto => {
            let op = if kind == InstrKind::Cltq { 0x98 } else { 0x99 };
            assemble(kind, cx.parts(&[op], None, ImmBytes::none()))
        }
        InstrKind::Movs | InstrKind::RepMovs => {
            let opcode = [if vt_is_byte(instr.vtype) { 0xa4 } else { 0xa5 }];
            let mut p = cx.parts(&opcode, None, ImmBytes::none());
            if kind == InstrKind::RepMovs {
                p.mandatory |= Prefixes::REP;
            }
            assemble(kind, p)
        }

        InstrKind::Push => match instr.dst.as_ref().ok_or_else(unsupported)? {
            Operand::Reg(r) => {
                let opcode = [0x50 | (r.index() & 7)];
                let mut p = cx.parts(&opcode, None, ImmBytes::none());
                // push defaults to 64-bit; only the index extension matters
                p.vtype = ValueType::Implicit;
                p.opreg_ext = r.index() >= 8;
                assemble(kind, p)
            }
            Operand::Imm { val, .. } => {
                let v = *val as i64;
                if let Ok(v8) = i8::try_from(v) {
                    assemble(kind, cx.parts(&[0x6a], None, ImmBytes::i8(v8)))
                } else if let Ok(v32) = i32::try_from(v) {
                    assemble(kind, cx.parts(&[0x68], None, ImmBytes::i32(v32)))
                } else {
                    Err(unsupported())
                }
            }
            op @ Operand::Ind { .. } => {
                let rm = cx.rm_parts(op)?;
                let mut p = cx.parts(&[0xff], Some((6, rm)), ImmBytes::none());
                p.vtype = ValueType::Implicit;
                assemble(kind, p)
            }
        },
        InstrKind::Pop => match instr.dst.as_ref().ok_or_else(unsupported)? {
            Operand::Reg(r) => {
                let opcode = [0x58 | (r.index() & 7)];
                let mut p = cx.parts(&opcode, None, ImmBytes::none());
                p.vtype = ValueType::Implicit;
                p.opreg_ext = r.index() >= 8;
                assemble(kind, p)
            }
            op @ Operand::Ind { .. } => {
                let rm = cx.rm_parts(op)?;
                let mut p = cx.parts(&[0x8f], Some((0, rm)), ImmBytes::none());
                p.vtype = ValueType::Implicit;
                assemble(kind, p)
            }
            _ => Err(unsupported()),
        },

        InstrKind::Add
        | InstrKind::Or
        | InstrKind::Adc
        | InstrKind::Sbb
        | InstrKind::And
        | InstrKind::Sub
        | InstrKind::Xor
        | InstrKind::Cmp => encode_alu(instr, &cx),

        InstrKind::Test => {
            let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
            let src = instr.src.as_ref().ok_or_else(unsupported)?;
            match src {
                Operand::Reg(r) => {
                    let rm = cx.rm_parts(dst)?;
                    let op = if vt_is_byte(instr.vtype) { 0x84 } else { 0x85 };
                    assemble(kind, cx.parts(&[op], Some((r.index(), rm)), ImmBytes::none()))
                }
                Operand::Imm { val, .. } => {
                    let rm = cx.rm_parts(dst)?;
                    let op = if vt_is_byte(instr.vtype) { 0xf6 } else { 0xf7 };
                    let imm = ImmBytes::std(instr.vtype, *val)?;
                    assemble(kind, cx.parts(&[op], Some((0, rm)), imm))
                }
                _ => Err(unsupported()),
            }
        }

        InstrKind::Mov => encode_mov(instr, &cx),

        InstrKind::Xchg => {
            let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
            let src = instr.src.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let rm = cx.rm_parts(dst)?;
            let op = if vt_is_byte(instr.vtype) { 0x86 } else { 0x87 };
            assemble(kind, cx.parts(&[op], Some((src.index(), rm)), ImmBytes::none()))
        }
        InstrKind::Bswap => {
            let r = instr.dst.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let opcode = [0x0f, 0xc8 | (r.index() & 7)];
            let mut p = cx.parts(&opcode, None, ImmBytes::none());
            p.opreg_ext = r.index() >= 8;
            assemble(kind, p)
        }

        InstrKind::Movsx | InstrKind::Movzx => {
            let dst = instr.dst.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let src = instr.src.as_ref().ok_or_else(unsupported)?;
            let src_vt = match src {
                Operand::Reg(r) => match r.kind() {
                    RegKind::Gp8 | RegKind::Gp8h => ValueType::V8,
                    RegKind::Gp16 => ValueType::V16,
                    _ => return Err(unsupported()),
                },
                Operand::Ind { vt, .. } => *vt,
                _ => return Err(unsupported()),
            };
            let second = match (kind, src_vt) {
                (InstrKind::Movzx, ValueType::V8) => 0xb6,
                (InstrKind::Movzx, ValueType::V16) => 0xb7,
                (InstrKind::Movsx, ValueType::V8) => 0xbe,
                (InstrKind::Movsx, ValueType::V16) => 0xbf,
                _ => return Err(unsupported()),
            };
            let rm = cx.rm_parts(src)?;
            assemble(
                kind,
                cx.parts(&[0x0f, second], Some((dst.index(), rm)), ImmBytes::none()),
            )
        }
        InstrKind::Movsxd => {
            let dst = instr.dst.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let src = instr.src.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(src)?;
            assemble(kind, cx.parts(&[0x63], Some((dst.index(), rm)), ImmBytes::none()))
        }
        InstrKind::Lea => {
            let dst = instr.dst.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let src = instr.src.as_ref().ok_or_else(unsupported)?;
            if !src.is_mem() {
                return Err(unsupported());
            }
            let rm = cx.rm_parts(src)?;
            assemble(kind, cx.parts(&[0x8d], Some((dst.index(), rm)), ImmBytes::none()))
        }

        InstrKind::Inc | InstrKind::Dec => {
            let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(dst)?;
            let op = if vt_is_byte(instr.vtype) { 0xfe } else { 0xff };
            let digit = if kind == InstrKind::Inc { 0 } else { 1 };
            assemble(kind, cx.parts(&[op], Some((digit, rm)), ImmBytes::none()))
        }
        InstrKind::Not | InstrKind::Neg | InstrKind::Mul | InstrKind::Div | InstrKind::Idiv => {
            let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(dst)?;
            let op = if vt_is_byte(instr.vtype) { 0xf6 } else { 0xf7 };
            let digit = match kind {
                InstrKind::Not => 2,
                InstrKind::Neg => 3,
                InstrKind::Mul => 4,
                InstrKind::Div => 6,
                _ => 7,
            };
            assemble(kind, cx.parts(&[op], Some((digit, rm)), ImmBytes::none()))
        }
        InstrKind::Imul => encode_imul(instr, &cx),

        InstrKind::Shl | InstrKind::Shr | InstrKind::Sar => {
            let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(dst)?;
            let digit = match kind {
                InstrKind::Shl => 4,
                InstrKind::Shr => 5,
                _ => 7,
            };
            let byte = vt_is_byte(instr.vtype);
            match instr.src.as_ref().ok_or_else(unsupported)? {
                Operand::Imm { val: 1, .. } => {
                    let op = if byte { 0xd0 } else { 0xd1 };
                    assemble(kind, cx.parts(&[op], Some((digit, rm)), ImmBytes::none()))
                }
                Operand::Imm { val, .. } => {
                    let op = if byte { 0xc0 } else { 0xc1 };
                    assemble(kind, cx.parts(&[op], Some((digit, rm)), ImmBytes::u8(*val as u8)))
                }
                Operand::Reg(r) if r.index() == 1 && r.kind() == RegKind::Gp8 => {
                    let op = if byte { 0xd2 } else { 0xd3 };
                    assemble(kind, cx.parts(&[op], Some((digit, rm)), ImmBytes::none()))
                }
                _ => Err(unsupported()),
            }
        }

        _ if kind.is_setcc() => {
            let cond = kind.cond().expect("setcc");
            let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(dst)?;
            assemble(
                kind,
                cx.parts(&[0x0f, 0x90 | cond as u8], Some((0, rm)), ImmBytes::none()),
            )
        }
        _ if kind.is_cmovcc() => {
            let cond = kind.cond().expect("cmovcc");
            let dst = instr.dst.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let src = instr.src.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(src)?;
            assemble(
                kind,
                cx.parts(&[0x0f, 0x40 | cond as u8], Some((dst.index(), rm)), ImmBytes::none()),
            )
        }
        _ if kind.is_jcc() => {
            let target = instr.dst.as_ref().and_then(|o| o.as_imm()).ok_or_else(unsupported)?;
            let cond = kind.cond().expect("jcc");
            let rel = target.wrapping_sub(instr.addr.wrapping_add(6)) as i64;
            let rel = i32::try_from(rel).map_err(|_| unsupported())?;
            Ok(encode_jcc(cond, rel, false))
        }
        InstrKind::Jmp => {
            let target = instr.dst.as_ref().and_then(|o| o.as_imm()).ok_or_else(unsupported)?;
            let rel = target.wrapping_sub(instr.addr.wrapping_add(5)) as i64;
            let rel = i32::try_from(rel).map_err(|_| unsupported())?;
            Ok(encode_jmp_rel32(rel))
        }
        InstrKind::Call => match instr.dst.as_ref().ok_or_else(unsupported)? {
            Operand::Imm { val, .. } => {
                let rel = val.wrapping_sub(instr.addr.wrapping_add(5)) as i64;
                let rel = i32::try_from(rel).map_err(|_| unsupported())?;
                let mut out = EncodedInstr {
                    bytes: [0; MAX_ENC_LEN],
                    len: 5,
                };
                out.bytes[0] = 0xe8;
                out.bytes[1..5].copy_from_slice(&rel.to_le_bytes());
                Ok(out)
            }
            op => {
                let rm = cx.rm_parts(op)?;
                let mut p = cx.parts(&[0xff], Some((2, rm)), ImmBytes::none());
                p.vtype = ValueType::Implicit;
                assemble(kind, p)
            }
        },
        InstrKind::JmpI => {
            let op = instr.dst.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(op)?;
            let mut p = cx.parts(&[0xff], Some((4, rm)), ImmBytes::none());
            p.vtype = ValueType::Implicit;
            assemble(kind, p)
        }

        _ => Err(unsupported()),
    }
}

fn encode_alu(instr: &Instr, cx: &FormCtx<'_>) -> Result<EncodedInstr, EncodeError> {
    let kind = instr.kind;
    let unsupported = || EncodeError::UnsupportedOperands(kind);
    let family = match kind {
        InstrKind::Add => 0u8,
        InstrKind::Or => 1,
        InstrKind::Adc => 2,
        InstrKind::Sbb => 3,
        InstrKind::And => 4,
        InstrKind::Sub => 5,
        InstrKind::Xor => 6,
        InstrKind::Cmp => 7,
        _ => unreachable!("alu family"),
    };
    let base = family << 3;
    let byte = vt_is_byte(instr.vtype);
    let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
    let src = instr.src.as_ref().ok_or_else(unsupported)?;

    match (dst, src) {
        (_, Operand::Reg(r)) => {
            let rm = cx.rm_parts(dst)?;
            let op = base + if byte { 0x00 } else { 0x01 };
            assemble(kind, cx.parts(&[op], Some((r.index(), rm)), ImmBytes::none()))
        }
        (Operand::Reg(r), Operand::Ind { .. }) => {
            let rm = cx.rm_parts(src)?;
            let op = base + if byte { 0x02 } else { 0x03 };
            assemble(kind, cx.parts(&[op], Some((r.index(), rm)), ImmBytes::none()))
        }
        (_, Operand::Imm { val, .. }) => {
            let rm = cx.rm_parts(dst)?;
            if byte {
                return assemble(
                    kind,
                    cx.parts(&[0x80], Some((family, rm)), ImmBytes::u8(*val as u8)),
                );
            }
            // imm8 form when the value survives sign-extension
            if let Ok(v8) = i8::try_from(*val as i64) {
                assemble(kind, cx.parts(&[0x83], Some((family, rm)), ImmBytes::i8(v8)))
            } else {
                let imm = ImmBytes::std(instr.vtype, *val)?;
                assemble(kind, cx.parts(&[0x81], Some((family, rm)), imm))
            }
        }
        _ => Err(unsupported()),
    }
}

fn encode_mov(instr: &Instr, cx: &FormCtx<'_>) -> Result<EncodedInstr, EncodeError> {
    let kind = instr.kind;
    let unsupported = || EncodeError::UnsupportedOperands(kind);
    let byte = vt_is_byte(instr.vtype);
    let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
    let src = instr.src.as_ref().ok_or_else(unsupported)?;

    match (dst, src) {
        (_, Operand::Reg(r)) => {
            let rm = cx.rm_parts(dst)?;
            let op = if byte { 0x88 } else { 0x89 };
            assemble(kind, cx.parts(&[op], Some((r.index(), rm)), ImmBytes::none()))
        }
        (Operand::Reg(r), Operand::Ind { .. }) => {
            let rm = cx.rm_parts(src)?;
            let op = if byte { 0x8a } else { 0x8b };
            assemble(kind, cx.parts(&[op], Some((r.index(), rm)), ImmBytes::none()))
        }
        (Operand::Reg(r), Operand::Imm { val, .. }) => {
            if byte {
                let opcode = [0xb0 | (r.index() & 7)];
                let mut p = cx.parts(&opcode, None, ImmBytes::u8(*val as u8));
                p.opreg_ext = r.index() >= 8;
                return assemble(kind, p);
            }
            // mov r, 0 is emitted as the shorter flag-clobbering xor
            if *val == 0 && matches!(instr.vtype, ValueType::V32 | ValueType::V64) {
                let reg32 = Reg::gp32(r.index());
                let xor = Instr::binary(
                    InstrKind::Xor,
                    ValueType::V32,
                    Operand::reg(reg32),
                    Operand::reg(reg32),
                );
                return encode(&xor);
            }
            match instr.vtype {
                ValueType::V16 => {
                    let imm = ImmBytes::u16(*val as u16);
                    oi_form(cx, kind, r, imm, ValueType::V16)
                }
                ValueType::V32 => {
                    let imm = ImmBytes::i32(*val as u32 as i32);
                    oi_form(cx, kind, r, imm, ValueType::V32)
                }
                ValueType::V64 => {
                    if *val <= u32::MAX as u64 {
                        // imm32 zero-extends into the 64-bit register
                        oi_form(cx, kind, r, ImmBytes::i32(*val as u32 as i32), ValueType::V32)
                    } else if let Ok(v32) = i32::try_from(*val as i64) {
                        // sign-extending r/m64 form
                        let rm = RmParts::direct(r.index());
                        assemble(kind, cx.parts(&[0xc7], Some((0, rm)), ImmBytes::i32(v32)))
                    } else {
                        oi_form(cx, kind, r, ImmBytes::u64(*val), ValueType::V64)
                    }
                }
                _ => Err(unsupported()),
            }
        }
        (Operand::Ind { .. }, Operand::Imm { val, .. }) => {
            let rm = cx.rm_parts(dst)?;
            if byte {
                assemble(kind, cx.parts(&[0xc6], Some((0, rm)), ImmBytes::u8(*val as u8)))
            } else {
                let imm = ImmBytes::std(instr.vtype, *val)?;
                assemble(kind, cx.parts(&[0xc7], Some((0, rm)), imm))
            }
        }
        _ => Err(unsupported()),
    }
}

/// `B8+r`-style form: opcode carries the register, REX.B carries bit 3.
fn oi_form(
    cx: &FormCtx<'_>,
    kind: InstrKind,
    r: &Reg,
    imm: ImmBytes,
    width: ValueType,
) -> Result<EncodedInstr, EncodeError> {
    let opcode = [0xb8 | (r.index() & 7)];
    let mut p = cx.parts(&opcode, None, imm);
    p.vtype = width;
    p.opreg_ext = r.index() >= 8;
    assemble(kind, p)
}

fn encode_imul(instr: &Instr, cx: &FormCtx<'_>) -> Result<EncodedInstr, EncodeError> {
    let kind = instr.kind;
    let unsupported = || EncodeError::UnsupportedOperands(kind);
    match instr.form {
        crate::instr::InstrForm::Unary => {
            let dst = instr.dst.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(dst)?;
            let op = if vt_is_byte(instr.vtype) { 0xf6 } else { 0xf7 };
            assemble(kind, cx.parts(&[op], Some((5, rm)), ImmBytes::none()))
        }
        crate::instr::InstrForm::Binary => {
            let dst = instr.dst.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let src = instr.src.as_ref().ok_or_else(unsupported)?;
            let rm = cx.rm_parts(src)?;
            assemble(kind, cx.parts(&[0x0f, 0xaf], Some((dst.index(), rm)), ImmBytes::none()))
        }
        crate::instr::InstrForm::Ternary => {
            let dst = instr.dst.as_ref().and_then(|o| o.as_reg()).ok_or_else(unsupported)?;
            let src = instr.src.as_ref().ok_or_else(unsupported)?;
            let val = instr.src2.as_ref().and_then(|o| o.as_imm()).ok_or_else(unsupported)?;
            let rm = cx.rm_parts(src)?;
            if let Ok(v8) = i8::try_from(val as i64) {
                assemble(kind, cx.parts(&[0x6b], Some((dst.index(), rm)), ImmBytes::i8(v8)))
            } else {
                let imm = ImmBytes::std(instr.vtype, val)?;
                assemble(kind, cx.parts(&[0x69], Some((dst.index(), rm)), imm))
            }
        }
        crate::instr::InstrForm::Nullary => Err(unsupported()),
    }
}

fn encode_passthrough(instr: &Instr, cx: &FormCtx<'_>) -> Result<EncodedInstr, EncodeError> {
    let kind = instr.kind;
    let unsupported = || EncodeError::UnsupportedOperands(kind);
    let pt = instr.passthrough.as_ref().expect("caller checked");
    let opcode = &pt.opcode[..pt.opc_len as usize];

    let (reg_op, rm_op) = match pt.enc {
        Encoding::RM => (
            instr.dst.as_ref().ok_or_else(unsupported)?,
            instr.src.as_ref().ok_or_else(unsupported)?,
        ),
        Encoding::MR => (
            instr.src.as_ref().ok_or_else(unsupported)?,
            instr.dst.as_ref().ok_or_else(unsupported)?,
        ),
        _ => return Err(unsupported()),
    };
    let reg = reg_op.as_reg().ok_or_else(unsupported)?;
    let rm = cx.rm_parts(rm_op)?;

    let mut p = cx.parts(opcode, Some((reg.index(), rm)), ImmBytes::none());
    p.vtype = ValueType::Implicit;
    p.mandatory = pt.prefixes;
    p.vex = pt.vex;
    assemble(kind, p)
}

/// Encode a conditional jump with an explicit displacement.
///
/// `short` selects the 2-byte `Jcc rel8` form; the caller guarantees the
/// displacement fits.
pub fn encode_jcc(cond: Cond, rel: i32, short: bool) -> EncodedInstr {
    let mut out = EncodedInstr {
        bytes: [0; MAX_ENC_LEN],
        len: 0,
    };
    if short {
        debug_assert!(i8::try_from(rel).is_ok(), "short branch reach {rel}");
        out.bytes[0] = 0x70 | cond as u8;
        out.bytes[1] = rel as i8 as u8;
        out.len = 2;
    } else {
        out.bytes[0] = 0x0f;
        out.bytes[1] = 0x80 | cond as u8;
        out.bytes[2..6].copy_from_slice(&rel.to_le_bytes());
        out.len = 6;
    }
    out
}

/// Encode a 5-byte `JMP rel32`.
pub fn encode_jmp_rel32(rel: i32) -> EncodedInstr {
    let mut out = EncodedInstr {
        bytes: [0; MAX_ENC_LEN],
        len: 5,
    };
    out.bytes[0] = 0xe9;
    out.bytes[1..5].copy_from_slice(&rel.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use crate::reg::gp;

    fn roundtrip(bytes: &[u8]) {
        let mut d = Decoder::new(bytes, 0x4000);
        let i = d.decode_next().expect("decodes");
        assert_eq!(i.len as usize, bytes.len());
        let e = encode(&i).expect("encodes");
        assert_eq!(e.as_slice(), bytes, "canonical form must round-trip");
    }

    #[test]
    fn canonical_roundtrips() {
        // add %rsi, %rdi
        roundtrip(&[0x48, 0x01, 0xf7]);
        // add (%rdi), %eax
        roundtrip(&[0x03, 0x07]);
        // sub $8, %rsp (imm8 form)
        roundtrip(&[0x48, 0x83, 0xec, 0x08]);
        // cmp $0x12345, %rdi (imm32 form)
        roundtrip(&[0x48, 0x81, 0xff, 0x45, 0x23, 0x01, 0x00]);
        // mov %rdi, -0x10(%rbp)
        roundtrip(&[0x48, 0x89, 0x7d, 0xf0]);
        // mov (%r12), %rax (forced SIB)
        roundtrip(&[0x49, 0x8b, 0x04, 0x24]);
        // mov (%r13), %rax (forced disp8)
        roundtrip(&[0x49, 0x8b, 0x45, 0x00]);
        // lea 0x8(%rdi,%rsi,4), %rax
        roundtrip(&[0x48, 0x8d, 0x44, 0xb7, 0x08]);
        // movzbl (%rdi), %eax
        roundtrip(&[0x0f, 0xb6, 0x07]);
        // movswq %ax, %rdx — movsx with REX.W
        roundtrip(&[0x48, 0x0f, 0xbf, 0xd0]);
        // imul $0x40, %rsi, %rax would take imm8; canonical imm8 form:
        roundtrip(&[0x48, 0x6b, 0xc6, 0x40]);
        // neg %rdi
        roundtrip(&[0x48, 0xf7, 0xdf]);
        // inc %r11
        roundtrip(&[0x49, 0xff, 0xc3]);
        // sar $3, %rdi
        roundtrip(&[0x48, 0xc1, 0xff, 0x03]);
        // shl %cl, %rdi
        roundtrip(&[0x48, 0xd3, 0xe7]);
        // push %rbp / pop %rbp
        roundtrip(&[0x55]);
        roundtrip(&[0x5d]);
        // push %r12 / pop %r12
        roundtrip(&[0x41, 0x54]);
        roundtrip(&[0x41, 0x5c]);
        // test %rdi, %rdi
        roundtrip(&[0x48, 0x85, 0xff]);
        // cmovle %rdi, %rax
        roundtrip(&[0x48, 0x0f, 0x4e, 0xc7]);
        // sete %al
        roundtrip(&[0x0f, 0x94, 0xc0]);
        // ret
        roundtrip(&[0xc3]);
        // leave
        roundtrip(&[0xc9]);
        // cltq
        roundtrip(&[0x48, 0x98]);
        // jmp *%rax
        roundtrip(&[0xff, 0xe0]);
        // call *%r11
        roundtrip(&[0x41, 0xff, 0xd3]);
        // movsd (%rdi), %xmm0 (passthrough)
        roundtrip(&[0xf2, 0x0f, 0x10, 0x07]);
        // movaps %xmm1, %xmm0
        roundtrip(&[0x0f, 0x28, 0xc1]);
        // pxor %xmm1, %xmm0
        roundtrip(&[0x66, 0x0f, 0xef, 0xc1]);
        // cvtsi2sd %rdi, %xmm0
        roundtrip(&[0xf2, 0x48, 0x0f, 0x2a, 0xc7]);
        // rep movsq
        roundtrip(&[0xf3, 0x48, 0xa5]);
    }

    #[test]
    fn d_form_roundtrips_at_same_address() {
        // jne / jmp re-encode byte-equal at their original address in the
        // rel32 form
        let bytes = [0x0f, 0x85, 0x10, 0x00, 0x00, 0x00];
        let mut d = Decoder::new(&bytes, 0x4000);
        let i = d.decode_next().unwrap();
        assert_eq!(encode(&i).unwrap().as_slice(), &bytes);

        let bytes = [0xe9, 0xf0, 0xff, 0xff, 0xff];
        let mut d = Decoder::new(&bytes, 0x4000);
        let i = d.decode_next().unwrap();
        assert_eq!(encode(&i).unwrap().as_slice(), &bytes);

        let bytes = [0xe8, 0x20, 0x00, 0x00, 0x00];
        let mut d = Decoder::new(&bytes, 0x4000);
        let i = d.decode_next().unwrap();
        assert_eq!(encode(&i).unwrap().as_slice(), &bytes);
    }

    #[test]
    fn mov_imm_peepholes() {
        // mov $0, %rax becomes xor %eax, %eax
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            Operand::reg(gp::RAX),
            Operand::imm(ValueType::V64, 0),
        );
        assert_eq!(encode(&i).unwrap().as_slice(), &[0x31, 0xc0]);

        // mov $0x2a, %rax shrinks to the 32-bit zero-extending form
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            Operand::reg(gp::RAX),
            Operand::imm(ValueType::V64, 0x2a),
        );
        assert_eq!(encode(&i).unwrap().as_slice(), &[0xb8, 0x2a, 0x00, 0x00, 0x00]);

        // negative values that fit i32 use the sign-extending C7 form
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            Operand::reg(gp::RAX),
            Operand::imm(ValueType::V64, (-2i64) as u64),
        );
        assert_eq!(
            encode(&i).unwrap().as_slice(),
            &[0x48, 0xc7, 0xc0, 0xfe, 0xff, 0xff, 0xff]
        );

        // full 64-bit immediate keeps the 10-byte form
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            Operand::reg(gp::RAX),
            Operand::imm(ValueType::V64, 0x1234_5678_9abc_def0),
        );
        assert_eq!(
            encode(&i).unwrap().as_slice(),
            &[0x48, 0xb8, 0xf0, 0xde, 0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn imm32_shrinks_to_imm8() {
        let i = Instr::binary(
            InstrKind::Add,
            ValueType::V64,
            Operand::reg(gp::RDI),
            Operand::imm(ValueType::V32, 3),
        );
        assert_eq!(encode(&i).unwrap().as_slice(), &[0x48, 0x83, 0xc7, 0x03]);
    }

    #[test]
    fn extended_register_imm_mov() {
        // mov $5, %r9 (32-bit zero-extending form with REX.B)
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            Operand::reg(gp::R9),
            Operand::imm(ValueType::V64, 5),
        );
        assert_eq!(encode(&i).unwrap().as_slice(), &[0x41, 0xb9, 0x05, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn empty_rex_for_low_byte_registers() {
        // mov %sil, %al needs 0x40
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V8,
            Operand::reg(Reg::gp8(0)),
            Operand::reg(Reg::gp8(6)),
        );
        assert_eq!(encode(&i).unwrap().as_slice(), &[0x40, 0x88, 0xf0]);
    }

    #[test]
    fn high_byte_with_rex_is_rejected() {
        // mov %ah, %r8b cannot be encoded
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V8,
            Operand::reg(Reg::gp8(8)),
            Operand::reg(Reg::new(RegKind::Gp8h, 4)),
        );
        assert!(matches!(
            encode(&i),
            Err(EncodeError::UnsupportedOperands(InstrKind::Mov))
        ));
    }

    #[test]
    fn disp32_only_uses_sib_escape() {
        // mov 0x601000, %eax
        let i = Instr::binary(
            InstrKind::Mov,
            ValueType::V32,
            Operand::reg(Reg::gp32(0)),
            Operand::ind(ValueType::V32, MemRef::abs(0x601000)),
        );
        assert_eq!(
            encode(&i).unwrap().as_slice(),
            &[0x8b, 0x04, 0x25, 0x00, 0x10, 0x60, 0x00]
        );
    }

    #[test]
    fn jcc_and_jmp_helpers() {
        let e = encode_jcc(Cond::Ne, 0x10, true);
        assert_eq!(e.as_slice(), &[0x75, 0x10]);
        let e = encode_jcc(Cond::Ge, -0x20, false);
        assert_eq!(e.as_slice(), &[0x0f, 0x8d, 0xe0, 0xff, 0xff, 0xff]);
        let e = encode_jmp_rel32(0x100);
        assert_eq!(e.as_slice(), &[0xe9, 0x00, 0x01, 0x00, 0x00]);
    }
}
