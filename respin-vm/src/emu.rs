//! The capturing emulator: abstract per-instruction execution that folds
//! what it knows and emits residual instructions for what it does not.
//!
//! Processing is four-phased: read operands abstractly, evaluate, combine
//! capture states, then decide whether a residual instruction must be
//! emitted. Residual operands are rewritten on the way out: known registers
//! fold into immediates, known address parts fold into displacements, and
//! stack-anchored addresses are rebased onto the runtime RSP (which the
//! generated code never moves).

use respin_asm::{
    gp, Flag, FlagSet, Instr, InstrForm, InstrKind, MemRef, Operand, Reg, RegKind, Segment,
    StateChange, ValueType,
};

use crate::error::{ErrorKind, ErrorModule, RewriteError, RwResult};
use crate::rewriter::Rewriter;
use crate::state::{CaptureState, CapVal};

pub(crate) mod alu;
pub(crate) mod flow;
pub(crate) mod state;

use alu::FlagVals;

/// Where execution goes after one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Fall through to the next instruction.
    Next,
    /// Continue at an address (resolved branch, inlined call, return).
    Goto(u64),
    /// The current captured block is finished.
    End,
}

/// Operand width in bits, from the instruction's value type.
fn vt_bits(vt: ValueType) -> u32 {
    vt.bits().unwrap_or(64)
}

/// Kinds whose destination operand is also an input.
fn reads_dst(instr: &Instr) -> bool {
    matches!(
        instr.kind,
        InstrKind::Add
            | InstrKind::Adc
            | InstrKind::Sub
            | InstrKind::Sbb
            | InstrKind::And
            | InstrKind::Or
            | InstrKind::Xor
            | InstrKind::Cmp
            | InstrKind::Test
            | InstrKind::Inc
            | InstrKind::Dec
            | InstrKind::Neg
            | InstrKind::Not
            | InstrKind::Shl
            | InstrKind::Shr
            | InstrKind::Sar
            | InstrKind::Xchg
            | InstrKind::Bswap
    ) || instr.kind.is_cmovcc()
        || (instr.kind == InstrKind::Imul && instr.form == InstrForm::Binary)
}

/// Whether a known source value may be folded into an immediate operand for
/// this kind and width.
fn fold_imm_ok(kind: InstrKind, vt: ValueType, val: u64) -> bool {
    if matches!(kind, InstrKind::Shl | InstrKind::Shr | InstrKind::Sar) {
        return true; // imm8 count
    }
    let has_imm_form = matches!(
        kind,
        InstrKind::Add
            | InstrKind::Adc
            | InstrKind::Sub
            | InstrKind::Sbb
            | InstrKind::And
            | InstrKind::Or
            | InstrKind::Xor
            | InstrKind::Cmp
            | InstrKind::Test
            | InstrKind::Mov
            | InstrKind::Push
            | InstrKind::Imul
    );
    if !has_imm_form {
        return false;
    }
    match vt {
        ValueType::V8 | ValueType::V16 | ValueType::V32 => true,
        // sign-extending imm32 forms; MOV has a true imm64
        ValueType::V64 => kind == InstrKind::Mov || i32::try_from(val as i64).is_ok(),
        _ => false,
    }
}

/// Registers an instruction's operands name, as an index bitmask.
fn used_reg_mask(instr: &Instr) -> u16 {
    let mut mask = 0u16;
    for op in instr.operands().into_iter().flatten() {
        match op {
            Operand::Reg(r) if r.is_gp() => mask |= 1 << (r.index() & 0x0f),
            Operand::Ind { mem, .. } => {
                if let Some(b) = mem.base {
                    if b.kind() != RegKind::Ip {
                        mask |= 1 << (b.index() & 0x0f);
                    }
                }
                if let Some(i) = mem.index {
                    mask |= 1 << (i.index() & 0x0f);
                }
            }
            _ => {}
        }
    }
    mask
}

impl Rewriter {
    // --- operand access ---------------------------------------------------

    /// Abstract value of an operand.
    pub(crate) fn read_op(&mut self, instr: &Instr, op: &Operand) -> RwResult<CapVal> {
        match op {
            Operand::Imm { val, .. } => Ok(CapVal::known(*val)),
            Operand::Reg(r) if r.is_gp() => Ok(self.st.read_gp(*r)),
            Operand::Reg(_) => Ok(CapVal::dynamic()), // vector registers are untracked
            Operand::Ind { vt, mem } => self.read_mem(instr, mem, *vt),
        }
    }

    /// Abstract effective address of a memory operand.
    pub(crate) fn eval_addr(&self, instr: &Instr, mem: &MemRef) -> CapVal {
        let mut acc = CapVal::known(mem.disp as u64);
        if let Some(base) = mem.base {
            let b = if base.kind() == RegKind::Ip {
                // RIP is always known: it points past the instruction
                CapVal::known(instr.addr.wrapping_add(instr.len as u64))
            } else {
                self.st.regs[(base.index() & 0x0f) as usize]
            };
            acc = CapVal::with_state(
                acc.val.wrapping_add(b.val),
                CaptureState::combine(acc.state, b.state, acc.val == b.val),
            );
        }
        if let Some(index) = mem.index {
            let i = self.st.regs[(index.index() & 0x0f) as usize];
            let scaled = i.val.wrapping_mul(mem.scale.max(1) as u64);
            acc = CapVal::with_state(
                acc.val.wrapping_add(scaled),
                CaptureState::combine(acc.state, i.state, acc.val == scaled),
            );
        }
        acc
    }

    /// Abstract load.
    fn read_mem(&mut self, instr: &Instr, mem: &MemRef, vt: ValueType) -> RwResult<CapVal> {
        if mem.seg == Some(Segment::Gs) {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::UnsupportedInstr,
                "gs-relative memory access",
            ));
        }
        let size = vt.bytes().unwrap_or(8).min(8) as u64;
        let ea = self.eval_addr(instr, mem);
        if ea.state == CaptureState::StackRel && self.st.stack_contains(ea.val, size) {
            return Ok(self.st.stack_read(ea.val, size).expect("range checked"));
        }
        if mem.seg.is_none() {
            // viral pointers vouch for their own targets; plain known
            // addresses only fold inside registered constant data
            if ea.state == CaptureState::Static2 {
                return Ok(CapVal::known_viral(read_host(ea.val, size)));
            }
            if ea.state == CaptureState::Static
                && self.cfg.constant_range(ea.val, size).is_some()
            {
                return Ok(CapVal::known(read_host(ea.val, size)));
            }
        }
        Ok(CapVal::dynamic())
    }

    /// Abstract store. Returns whether the target is a tracked stack range.
    fn store_mem(&mut self, instr: &Instr, mem: &MemRef, vt: ValueType, v: CapVal) -> RwResult<bool> {
        if mem.seg == Some(Segment::Gs) {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::UnsupportedInstr,
                "gs-relative memory access",
            ));
        }
        let size = vt.bytes().unwrap_or(8).min(8) as u64;
        let ea = self.eval_addr(instr, mem);
        if ea.state == CaptureState::StackRel && self.st.stack_contains(ea.val, size) {
            self.st.stack_write(ea.val, size, v);
            return Ok(true);
        }
        Ok(false)
    }

    /// Register write that also invalidates the materialization cache.
    pub(crate) fn set_gp(&mut self, reg: Reg, v: CapVal) {
        self.materialized &= !(1 << (reg.index() & 0x0f));
        self.st.write_gp(reg, v);
    }

    // --- residual emission ------------------------------------------------

    /// Append a residual instruction to the current captured block.
    pub(crate) fn emit(&mut self, instr: Instr) -> RwResult<()> {
        if !self.capturing {
            return Ok(());
        }
        let cur = self.cur.expect("capturing without a block");
        if self.verbose.emu_steps {
            tracing::trace!(target: "respin::emu", addr = instr.addr, "capture {instr}");
        }
        self.capture.capture(cur, instr)
    }

    /// Whether residual code downstream may still read the hardware flags.
    fn flags_maybe_live(&self) -> bool {
        self.st
            .flags
            .iter()
            .any(|f| f.state == CaptureState::Dynamic)
    }

    /// Emit `mov r, imm` / `lea r, [rsp+k]` so the runtime register matches
    /// the known abstract value. Skipped when the register was already
    /// materialized and not written since.
    pub(crate) fn materialize_reg(&mut self, idx: u8, pre: &mut Vec<Instr>) {
        if self.materialized & (1 << idx) != 0 {
            return;
        }
        let cell = self.st.regs[idx as usize];
        let reg = Reg::gp64(idx);
        match cell.state {
            CaptureState::Static | CaptureState::Static2 => {
                if cell.val == 0 && self.flags_maybe_live() {
                    // the mov-zero peephole becomes an xor; go through the
                    // stack to keep live flags intact
                    pre.push(Instr::unary(
                        InstrKind::Push,
                        ValueType::V64,
                        Operand::imm(ValueType::V64, 0),
                    ));
                    pre.push(Instr::unary(InstrKind::Pop, ValueType::V64, Operand::reg(reg)));
                } else {
                    pre.push(Instr::binary(
                        InstrKind::Mov,
                        ValueType::V64,
                        Operand::reg(reg),
                        Operand::imm(ValueType::V64, cell.val),
                    ));
                }
            }
            CaptureState::StackRel => {
                let disp = cell.val.wrapping_sub(self.st.anchor()) as i64;
                pre.push(Instr::binary(
                    InstrKind::Lea,
                    ValueType::V64,
                    Operand::reg(reg),
                    Operand::ind(ValueType::V64, MemRef::base_disp(gp::RSP, disp)),
                ));
            }
            _ => return,
        }
        self.materialized |= 1 << idx;
    }

    /// A scratch register for address materialization: a dead one if
    /// possible, otherwise a caller-saved register spilled around the use.
    fn pick_scratch(&self, avoid: u16) -> (u8, bool) {
        for idx in 0..16u8 {
            if avoid & (1 << idx) != 0 || idx == 4 {
                continue;
            }
            if self.st.regs[idx as usize].state == CaptureState::Dead {
                return (idx, false);
            }
        }
        // caller-saved preference for the spill path
        for idx in [11u8, 10, 9, 8, 0, 1, 2, 6, 7] {
            if avoid & (1 << idx) == 0 {
                return (idx, true);
            }
        }
        (3, true)
    }

    /// Rewrite one memory operand for emission: fold known parts into the
    /// displacement, rebase stack addresses onto the runtime RSP, and
    /// synthesize a scratch register when the folded displacement leaves
    /// 32-bit range.
    fn rewrite_mem(
        &mut self,
        instr: &Instr,
        mem: &MemRef,
        avoid: u16,
        pre: &mut Vec<Instr>,
        post: &mut Vec<Instr>,
    ) -> RwResult<MemRef> {
        let ea = self.eval_addr(instr, mem);

        if ea.state == CaptureState::StackRel {
            let disp = ea.val.wrapping_sub(self.st.anchor()) as i64;
            return Ok(MemRef::base_disp(gp::RSP, disp));
        }

        if ea.state.is_imm_foldable() && mem.seg.is_none() {
            if i32::try_from(ea.val as i64).is_ok() {
                return Ok(MemRef::abs(ea.val as i64));
            }
            let (scratch, spill) = self.pick_scratch(avoid);
            self.spill_scratch(scratch, spill, ea.val, pre, post);
            return Ok(MemRef::base(Reg::gp64(scratch)));
        }

        // partial folding
        let mut out = *mem;
        let mut disp = mem.disp;
        if let Some(base) = out.base {
            if base.kind() == RegKind::Ip {
                disp = disp.wrapping_add((instr.addr + instr.len as u64) as i64);
                out.base = None;
            } else {
                let cell = self.st.regs[(base.index() & 0x0f) as usize];
                match cell.state {
                    CaptureState::Static | CaptureState::Static2 => {
                        disp = disp.wrapping_add(cell.val as i64);
                        out.base = None;
                    }
                    CaptureState::StackRel => {
                        disp = disp
                            .wrapping_add(cell.val.wrapping_sub(self.st.anchor()) as i64);
                        out.base = Some(gp::RSP);
                    }
                    _ => {}
                }
            }
        }
        if let Some(index) = out.index {
            let cell = self.st.regs[(index.index() & 0x0f) as usize];
            match cell.state {
                CaptureState::Static | CaptureState::Static2 => {
                    disp = disp
                        .wrapping_add((cell.val.wrapping_mul(out.scale.max(1) as u64)) as i64);
                    out.index = None;
                    out.scale = 0;
                }
                CaptureState::StackRel => {
                    let mut mat = Vec::new();
                    self.materialize_reg(index.index(), &mut mat);
                    pre.append(&mut mat);
                }
                _ => {}
            }
        }

        // an unscaled index without a base is just a base
        if out.base.is_none() && out.scale <= 1 {
            if let Some(i) = out.index.take() {
                out.base = Some(i);
                out.scale = 0;
            }
        }

        if i32::try_from(disp).is_err() {
            let (scratch, spill) = self.pick_scratch(avoid);
            self.spill_scratch(scratch, spill, disp as u64, pre, post);
            let scratch_reg = Reg::gp64(scratch);
            if out.base.is_none() {
                out.base = Some(scratch_reg);
            } else if out.index.is_none() {
                out.index = Some(scratch_reg);
                out.scale = 1;
            } else {
                // both parts live: fold the base into the scratch
                pre.push(Instr::binary(
                    InstrKind::Add,
                    ValueType::V64,
                    Operand::reg(scratch_reg),
                    Operand::reg(out.base.expect("checked")),
                ));
                out.base = Some(scratch_reg);
            }
            disp = 0;
        }
        out.disp = disp;
        Ok(out)
    }

    fn spill_scratch(
        &mut self,
        scratch: u8,
        spill: bool,
        value: u64,
        pre: &mut Vec<Instr>,
        post: &mut Vec<Instr>,
    ) {
        let reg = Reg::gp64(scratch);
        if spill {
            pre.push(Instr::unary(InstrKind::Push, ValueType::V64, Operand::reg(reg)));
            post.push(Instr::unary(InstrKind::Pop, ValueType::V64, Operand::reg(reg)));
        }
        pre.push(Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            Operand::reg(reg),
            Operand::imm(ValueType::V64, value),
        ));
        if !spill {
            // a dead scratch now holds a known value at runtime
            self.st.regs[scratch as usize] = CapVal::known(value);
            self.materialized |= 1 << scratch;
        }
    }

    /// Emit a residual instruction, rewriting operands so the runtime sees
    /// the values the abstract state knows about.
    pub(crate) fn emit_residual(&mut self, instr: &Instr) -> RwResult<()> {
        if !self.capturing {
            return Ok(());
        }
        let mut ins = *instr;
        let avoid = used_reg_mask(instr);
        let mut pre: Vec<Instr> = Vec::new();
        let mut post: Vec<Instr> = Vec::new();

        // memory operands first: folding may drop register uses entirely
        for slot in [&mut ins.dst, &mut ins.src, &mut ins.src2] {
            let (vt, mem) = match slot {
                Some(Operand::Ind { vt, mem }) => (*vt, *mem),
                _ => continue,
            };
            let new_mem = self.rewrite_mem(instr, &mem, avoid, &mut pre, &mut post)?;
            *slot = Some(Operand::ind(vt, new_mem));
        }

        // a spilled scratch shifts the runtime RSP by 8 for the duration of
        // the instruction; anchor-relative operands must compensate
        if !post.is_empty() {
            for slot in [&mut ins.dst, &mut ins.src, &mut ins.src2] {
                if let Some(Operand::Ind { mem, .. }) = slot {
                    if mem.base == Some(gp::RSP) {
                        mem.disp += 8;
                    }
                }
            }
        }

        // source register: fold to an immediate or materialize
        if let Some(Operand::Reg(r)) = ins.src {
            if r.is_gp() {
                let cell = self.st.regs[(r.index() & 0x0f) as usize];
                if cell.state.is_imm_foldable() {
                    let v = self.st.read_gp(r).val;
                    if fold_imm_ok(ins.kind, ins.vtype, v) {
                        if ins.kind == InstrKind::Imul && ins.form == InstrForm::Binary {
                            // imul r, imm only exists as the three-operand form
                            ins.src = ins.dst;
                            ins.src2 = Some(Operand::imm(ins.vtype, v));
                            ins.form = InstrForm::Ternary;
                        } else {
                            ins.src = Some(Operand::imm(ins.vtype, v));
                        }
                    } else {
                        self.materialize_reg(r.index(), &mut pre);
                    }
                } else if cell.state == CaptureState::StackRel {
                    self.materialize_reg(r.index(), &mut pre);
                }
            }
        }

        // unary Push folds its single operand the same way
        if ins.kind == InstrKind::Push {
            if let Some(Operand::Reg(r)) = ins.dst {
                let cell = self.st.regs[(r.index() & 0x0f) as usize];
                if cell.state.is_imm_foldable()
                    && i32::try_from(cell.val as i64).is_ok()
                {
                    ins.dst = Some(Operand::imm(ValueType::V64, cell.val));
                } else if cell.state.is_known() {
                    self.materialize_reg(r.index(), &mut pre);
                }
            }
        }

        // a destination that is also read must hold its known value
        if reads_dst(&ins) || ins.kind == InstrKind::Call {
            if let Some(Operand::Reg(r)) = ins.dst {
                if r.is_gp() && self.st.regs[(r.index() & 0x0f) as usize].state.is_known() {
                    self.materialize_reg(r.index(), &mut pre);
                }
            }
        }

        for p in pre {
            self.emit(p)?;
        }
        self.emit(ins)?;
        for p in post {
            self.emit(p)?;
        }
        Ok(())
    }

    // --- capture decision -------------------------------------------------

    /// Phase 4: update the destination and flags, emitting a residual
    /// instruction when the result is not statically known.
    fn finish_op(
        &mut self,
        instr: &Instr,
        dest: Option<Operand>,
        mut result: CapVal,
        flags: Option<(FlagVals, CaptureState)>,
    ) -> RwResult<Flow> {
        if self
            .cfg
            .force_unknown
            .get(self.st.depth())
            .copied()
            .unwrap_or(false)
            && result.state.is_known()
        {
            result.state = CaptureState::Dynamic;
        }

        match dest {
            Some(Operand::Reg(r)) if r.is_gp() => {
                if !result.state.is_known() {
                    self.emit_residual(instr)?;
                }
                self.set_gp(r, result);
            }
            Some(Operand::Reg(_)) => {
                // vector destination: never tracked
                self.emit_residual(instr)?;
            }
            Some(Operand::Ind { vt, mem }) => {
                let tracked = self.store_mem(instr, &mem, vt, result)?;
                if !tracked || !result.state.is_known() {
                    // untracked stores always happen at runtime
                    self.emit_residual(instr)?;
                }
            }
            Some(Operand::Imm { .. }) => unreachable!("immediate destination"),
            None => {
                // compare/test: only the flags matter
                if !result.state.is_known() {
                    self.emit_residual(instr)?;
                }
            }
        }

        if let Some((fl, state)) = flags {
            for f in [Flag::Zf, Flag::Cf, Flag::Sf, Flag::Of, Flag::Pf] {
                let bit = FlagSet::from_flag(f);
                if fl.written.contains(bit) {
                    let fstate = if fl.undef.contains(bit) {
                        CaptureState::Dynamic
                    } else {
                        state
                    };
                    self.st.set_flag(f, fl.vals[f.index()], fstate);
                }
            }
        }
        Ok(Flow::Next)
    }

    // --- the dispatcher ---------------------------------------------------

    /// Execute one instruction abstractly.
    pub(crate) fn step(&mut self, instr: &Instr) -> RwResult<Flow> {
        if self.verbose.emu_steps {
            tracing::trace!(target: "respin::emu", addr = instr.addr, depth = self.st.depth(), "step {instr}");
        }

        let kind = instr.kind;
        match kind {
            InstrKind::Nop => Ok(Flow::Next),

            InstrKind::Add
            | InstrKind::Adc
            | InstrKind::Sub
            | InstrKind::Sbb
            | InstrKind::And
            | InstrKind::Or
            | InstrKind::Xor
            | InstrKind::Cmp
            | InstrKind::Test => self.step_alu_binary(instr),

            InstrKind::Inc | InstrKind::Dec | InstrKind::Neg | InstrKind::Not => {
                let dst = instr.dst.expect("unary operand");
                let a = self.read_op(instr, &dst)?;
                let w = vt_bits(instr.vtype);
                let (val, fl) = alu::eval_unary(kind, w, a.val);
                let result = CapVal::with_state(val, a.state);
                let flags = (kind != InstrKind::Not).then_some((fl, a.state.demote_for_flags()));
                self.finish_op(instr, Some(dst), result, flags)
            }

            InstrKind::Mov => {
                let dst = instr.dst.expect("mov dst");
                let src = instr.src.expect("mov src");
                let v = self.read_op(instr, &src)?;
                self.finish_op(instr, Some(dst), v, None)
            }

            InstrKind::Xchg => self.step_xchg(instr),

            InstrKind::Bswap => {
                let dst = instr.dst.expect("bswap dst");
                let a = self.read_op(instr, &dst)?;
                let w = vt_bits(instr.vtype);
                let val = if w == 64 {
                    a.val.swap_bytes()
                } else {
                    (a.val as u32).swap_bytes() as u64
                };
                let state = demote_nonadditive(kind, a.state);
                self.finish_op(instr, Some(dst), CapVal::with_state(val, state), None)
            }

            InstrKind::Movsx | InstrKind::Movsxd | InstrKind::Movzx => {
                let dst = instr.dst.expect("ext dst");
                let src = instr.src.expect("ext src");
                let v = self.read_op(instr, &src)?;
                let src_w = operand_bits(&src, instr.vtype);
                let val = if kind == InstrKind::Movzx {
                    v.val & alu::mask(src_w)
                } else {
                    alu::sign_extend(src_w, v.val) as u64 & alu::mask(vt_bits(instr.vtype))
                };
                self.finish_op(instr, Some(dst), CapVal::with_state(val, v.state), None)
            }

            InstrKind::Lea => {
                let dst = instr.dst.expect("lea dst");
                let mem = *instr.src.as_ref().and_then(|o| o.as_mem()).ok_or_else(|| {
                    RewriteError::plain(
                        ErrorModule::Emulator,
                        ErrorKind::BadOperands,
                        "lea without memory source",
                    )
                })?;
                let ea = self.eval_addr(instr, &mem);
                let w = vt_bits(instr.vtype);
                let result = CapVal::with_state(ea.val & alu::mask(w), ea.state);
                self.finish_op(instr, Some(dst), result, None)
            }

            InstrKind::Imul if instr.form != InstrForm::Unary => self.step_imul(instr),

            InstrKind::Mul | InstrKind::Imul | InstrKind::Div | InstrKind::Idiv => {
                self.step_muldiv_unary(instr)
            }

            InstrKind::Shl | InstrKind::Shr | InstrKind::Sar => self.step_shift(instr),

            InstrKind::Cltq => {
                let w = vt_bits(instr.vtype);
                let (src_w, reg) = match w {
                    16 => (8, Reg::gp16(0)),
                    32 => (16, Reg::gp32(0)),
                    _ => (32, gp::RAX),
                };
                let a = self.st.read_gp(gp::RAX);
                let val = alu::sign_extend(src_w, a.val) as u64 & alu::mask(w);
                let result = CapVal::with_state(val, a.state);
                if result.state.is_known() {
                    self.set_gp(reg, result);
                } else {
                    self.emit_residual(instr)?;
                    self.set_gp(reg, result);
                }
                Ok(Flow::Next)
            }

            InstrKind::Cqto => {
                let w = vt_bits(instr.vtype);
                let a = self.st.read_gp(gp::RAX);
                let sign = if alu::sign_extend(w, a.val) < 0 {
                    alu::mask(w)
                } else {
                    0
                };
                let dreg = if w == 32 { Reg::gp32(2) } else { gp::RDX };
                let result = CapVal::with_state(sign, a.state);
                if result.state.is_known() {
                    self.set_gp(dreg, result);
                } else {
                    self.emit_residual(instr)?;
                    self.set_gp(dreg, result);
                }
                Ok(Flow::Next)
            }

            InstrKind::Push => self.step_push(instr),
            InstrKind::Pop => self.step_pop(instr),
            InstrKind::Leave => self.step_leave(instr),

            _ if kind.is_setcc() => self.step_setcc(instr),
            _ if kind.is_cmovcc() => self.step_cmov(instr),

            InstrKind::Movs | InstrKind::RepMovs => self.step_movs(instr),

            _ if instr.passthrough.is_some() => self.step_passthrough(instr),

            // control transfers live in flow.rs
            _ if kind.is_jcc() => self.step_jcc(instr),
            InstrKind::Jmp => self.step_jmp(instr),
            InstrKind::JmpI => self.step_jmp_indirect(instr),
            InstrKind::Call => self.step_call(instr),
            InstrKind::Ret => self.step_ret(instr),

            InstrKind::Invalid => Err(RewriteError::plain(
                ErrorModule::Decoder,
                ErrorKind::BadOpcode,
                format!("invalid instruction at {:#x}", instr.addr),
            )),
            other => Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::UnsupportedInstr,
                format!("unmodeled instruction {other:?} at {:#x}", instr.addr),
            )),
        }
    }

    fn step_alu_binary(&mut self, instr: &Instr) -> RwResult<Flow> {
        let kind = instr.kind;
        let dst = instr.dst.expect("alu dst");
        let src = instr.src.expect("alu src");
        let a = self.read_op(instr, &dst)?;
        let b = self.read_op(instr, &src)?;
        let w = vt_bits(instr.vtype);
        let cf_in = self.st.flag(Flag::Cf);

        let mut state = CaptureState::combine(
            demote_nonadditive(kind, a.state),
            demote_nonadditive(kind, b.state),
            a.val == b.val,
        );
        if matches!(kind, InstrKind::Adc | InstrKind::Sbb) {
            state = CaptureState::combine(state, cf_in.state, false);
        }
        // sub of two same-anchor stack addresses is a known distance
        if kind == InstrKind::Sub
            && a.state == CaptureState::StackRel
            && b.state == CaptureState::StackRel
        {
            state = CaptureState::Static;
        }

        // forced zero idioms are known regardless of the inputs
        let same_reg = dst == src && dst.as_reg().is_some();
        if (kind == InstrKind::Xor && same_reg)
            || (kind == InstrKind::And && b.state.is_imm_foldable() && b.val & alu::mask(w) == 0)
        {
            let (_, fl) = alu::eval_binary(InstrKind::Xor, w, 1, 1, false);
            return self.finish_op(
                instr,
                Some(dst),
                CapVal::known(0),
                Some((fl, CaptureState::Static)),
            );
        }

        // no-op elimination when the known source changes nothing
        if b.state.is_imm_foldable() && is_alu_noop(kind, w, b.val) {
            return Ok(Flow::Next);
        }

        let (val, fl) = alu::eval_binary(kind, w, a.val, b.val, cf_in.val != 0);
        let result = CapVal::with_state(val, state);
        let dest = (!matches!(kind, InstrKind::Cmp | InstrKind::Test)).then_some(dst);
        if dest.is_none() {
            // cmp/test: the "result" driving the capture decision is the flags
            return self.finish_op(
                instr,
                None,
                CapVal::with_state(0, state),
                Some((fl, state.demote_for_flags())),
            );
        }
        self.finish_op(instr, dest, result, Some((fl, state.demote_for_flags())))
    }

    fn step_imul(&mut self, instr: &Instr) -> RwResult<Flow> {
        let dst = instr.dst.expect("imul dst");
        let (a, b) = match instr.form {
            InstrForm::Binary => {
                let a = self.read_op(instr, &dst)?;
                let b = self.read_op(instr, &instr.src.expect("imul src"))?;
                (a, b)
            }
            _ => {
                let a = self.read_op(instr, &instr.src.expect("imul src"))?;
                let b = self.read_op(instr, &instr.src2.expect("imul imm"))?;
                (a, b)
            }
        };
        let w = vt_bits(instr.vtype);

        // multiplying a known one changes nothing
        if instr.form == InstrForm::Binary && b.state.is_imm_foldable() && b.val & alu::mask(w) == 1
        {
            return Ok(Flow::Next);
        }

        let state = CaptureState::combine(
            demote_nonadditive(InstrKind::Imul, a.state),
            demote_nonadditive(InstrKind::Imul, b.state),
            a.val == b.val,
        );
        let (val, fl) = alu::eval_binary(InstrKind::Imul, w, a.val, b.val, false);
        self.finish_op(
            instr,
            Some(dst),
            CapVal::with_state(val, state),
            Some((fl, state.demote_for_flags())),
        )
    }

    fn step_muldiv_unary(&mut self, instr: &Instr) -> RwResult<Flow> {
        let kind = instr.kind;
        let op = instr.dst.expect("muldiv operand");
        let b = self.read_op(instr, &op)?;
        let w = vt_bits(instr.vtype);
        let rax = self.st.read_gp(gp::RAX);
        let rdx = self.st.read_gp(gp::RDX);
        let m = alu::mask(w);
        let is_div = matches!(kind, InstrKind::Div | InstrKind::Idiv);

        // the 8-bit forms use AX / AL:AH instead of the RDX:RAX pair
        let (lo_reg, hi_reg) = if w == 8 {
            (Reg::gp8(0), Reg::new(RegKind::Gp8h, 4))
        } else {
            (gp::RAX, gp::RDX)
        };

        let known = rax.state.is_imm_foldable()
            && b.state.is_imm_foldable()
            && (!is_div || w == 8 || rdx.state.is_imm_foldable());

        if known && !(is_div && b.val & m == 0) {
            let (lo, hi) = match kind {
                InstrKind::Mul => {
                    let full = (rax.val & m) as u128 * (b.val & m) as u128;
                    ((full as u64) & m, ((full >> w) as u64) & m)
                }
                InstrKind::Imul => {
                    let full =
                        alu::sign_extend(w, rax.val) as i128 * alu::sign_extend(w, b.val) as i128;
                    ((full as u64) & m, ((full >> w) as u64) & m)
                }
                InstrKind::Div => {
                    let hi_in = if w == 8 { (rax.val >> 8) & 0xff } else { rdx.val & m };
                    let n = ((hi_in as u128) << w) | (rax.val & m) as u128;
                    let d = (b.val & m) as u128;
                    ((n / d) as u64 & m, (n % d) as u64 & m)
                }
                _ => {
                    let n = alu::sign_extend(w, rax.val) as i128;
                    let d = alu::sign_extend(w, b.val) as i128;
                    ((n / d) as u64 & m, (n % d) as u64 & m)
                }
            };
            self.set_gp(lo_reg, CapVal::known(widen32(w, lo)));
            self.set_gp(hi_reg, CapVal::known(widen32(w, hi)));
            // flags are undefined; be honest about it
            for f in [Flag::Zf, Flag::Cf, Flag::Sf, Flag::Of, Flag::Pf] {
                self.st.set_flag(f, false, CaptureState::Dynamic);
            }
            return Ok(Flow::Next);
        }

        self.emit_residual(instr)?;
        self.set_gp(lo_reg, CapVal::dynamic());
        self.set_gp(hi_reg, CapVal::dynamic());
        for f in [Flag::Zf, Flag::Cf, Flag::Sf, Flag::Of, Flag::Pf] {
            self.st.set_flag(f, false, CaptureState::Dynamic);
        }
        Ok(Flow::Next)
    }

    fn step_shift(&mut self, instr: &Instr) -> RwResult<Flow> {
        let dst = instr.dst.expect("shift dst");
        let src = instr.src.expect("shift count");
        let a = self.read_op(instr, &dst)?;
        let c = self.read_op(instr, &src)?;
        let w = vt_bits(instr.vtype);
        let count = (c.val & alu::shift_count_mask(w)) as u32;

        // a known zero count changes neither the value nor the flags
        if c.state.is_imm_foldable() && count == 0 {
            return Ok(Flow::Next);
        }

        let state = CaptureState::combine(
            demote_nonadditive(instr.kind, a.state),
            demote_nonadditive(instr.kind, c.state),
            a.val == c.val,
        );
        if !c.state.is_imm_foldable() {
            // unknown count: value and flags both unknown
            let result = CapVal::with_state(0, state);
            let fl = FlagVals {
                written: FlagSet::ARITH,
                undef: FlagSet::ARITH,
                ..FlagVals::default()
            };
            return self.finish_op(instr, Some(dst), result, Some((fl, CaptureState::Dynamic)));
        }
        let (val, fl) = alu::eval_shift(instr.kind, w, a.val, count);
        self.finish_op(
            instr,
            Some(dst),
            CapVal::with_state(val, state),
            Some((fl, state.demote_for_flags())),
        )
    }

    fn step_setcc(&mut self, instr: &Instr) -> RwResult<Flow> {
        let cond = instr.kind.cond().expect("setcc");
        let dst = instr.dst.expect("setcc dst");
        let need = cond.flags_read();
        let state = self.flags_state(need);
        if state.is_known() {
            let v = cond.eval(|f| self.st.flag(f).val != 0);
            self.finish_op(instr, Some(dst), CapVal::known(v as u64), None)
        } else {
            self.finish_op(instr, Some(dst), CapVal::dynamic(), None)
        }
    }

    fn step_cmov(&mut self, instr: &Instr) -> RwResult<Flow> {
        let cond = instr.kind.cond().expect("cmov");
        let dst = instr.dst.expect("cmov dst");
        let src = instr.src.expect("cmov src");
        let need = cond.flags_read();
        let state = self.flags_state(need);
        if state.is_known() {
            if cond.eval(|f| self.st.flag(f).val != 0) {
                let v = self.read_op(instr, &src)?;
                // a taken cmov behaves like a plain mov
                let mov = Instr::binary(InstrKind::Mov, instr.vtype, dst, src).at(instr.addr, 0);
                return self.finish_op(&mov, Some(dst), v, None);
            }
            return Ok(Flow::Next);
        }
        let _ = self.read_op(instr, &src)?;
        // unknown condition: whatever happens, the destination is unknown
        self.finish_op(instr, Some(dst), CapVal::dynamic(), None)
    }

    fn step_xchg(&mut self, instr: &Instr) -> RwResult<Flow> {
        let dst = instr.dst.expect("xchg dst");
        let src = instr.src.expect("xchg src");
        let a = self.read_op(instr, &dst)?;
        let b = self.read_op(instr, &src)?;

        // both sides known: the swap happens entirely in the abstract state
        if let (Some(rd), Some(rs)) = (dst.as_reg(), src.as_reg()) {
            if a.state.is_known() && b.state.is_known() {
                self.set_gp(rd, b);
                self.set_gp(rs, a);
                return Ok(Flow::Next);
            }
        }

        // otherwise the swap must happen at runtime, with any known side
        // pinned into its register first
        self.emit_residual(instr)?;
        if let Some(rs) = src.as_reg() {
            self.set_gp(rs, a);
        }
        match dst {
            Operand::Reg(rd) => self.set_gp(rd, b),
            Operand::Ind { vt, mem } => {
                self.store_mem(instr, &mem, vt, b)?;
            }
            Operand::Imm { .. } => unreachable!("immediate xchg destination"),
        }
        Ok(Flow::Next)
    }

    fn step_movs(&mut self, instr: &Instr) -> RwResult<Flow> {
        // the move itself is not modeled: re-materialize the operand
        // registers and re-emit the instruction verbatim
        let mut pre = Vec::new();
        for idx in [1u8, 6, 7] {
            // RCX only matters for the REP form
            if idx == 1 && instr.kind != InstrKind::RepMovs {
                continue;
            }
            if self.st.regs[idx as usize].state.is_known() {
                self.materialize_reg(idx, &mut pre);
            }
        }
        for p in pre {
            self.emit(p)?;
        }
        self.emit(*instr)?;
        if instr.kind == InstrKind::RepMovs {
            self.set_gp(Reg::gp64(1), CapVal::dynamic());
        }
        self.set_gp(gp::RSI, CapVal::dynamic());
        self.set_gp(gp::RDI, CapVal::dynamic());
        Ok(Flow::Next)
    }

    fn step_passthrough(&mut self, instr: &Instr) -> RwResult<Flow> {
        let change = instr.passthrough.expect("passthrough").change;
        self.emit_residual(instr)?;
        match change {
            StateChange::None => {}
            StateChange::DstDyn => {
                if let Some(Operand::Reg(r)) = instr.dst {
                    if r.is_gp() {
                        self.set_gp(r, CapVal::dynamic());
                    }
                }
            }
            StateChange::FlagsDyn => {
                for f in [Flag::Zf, Flag::Cf, Flag::Sf, Flag::Of, Flag::Pf] {
                    self.st.set_flag(f, false, CaptureState::Dynamic);
                }
            }
        }
        Ok(Flow::Next)
    }

    /// Folded state of a set of flags.
    pub(crate) fn flags_state(&self, need: respin_asm::FlagSet) -> CaptureState {
        let mut state = CaptureState::Static;
        for f in need.iter_flags() {
            let s = self.st.flag(f).state;
            state = match (state, s) {
                (CaptureState::Static, x) if x.is_known() => CaptureState::Static,
                _ => return CaptureState::Dynamic,
            };
        }
        state
    }
}

/// 32-bit results zero-extend into 64-bit registers.
fn widen32(w: u32, v: u64) -> u64 {
    if w == 32 {
        v & 0xffff_ffff
    } else {
        v
    }
}

/// Operand width in bits, preferring the operand's own width over the
/// instruction default.
fn operand_bits(op: &Operand, default: ValueType) -> u32 {
    match op {
        Operand::Reg(r) => match r.kind() {
            RegKind::Gp8 | RegKind::Gp8h => 8,
            RegKind::Gp16 => 16,
            RegKind::Gp32 => 32,
            _ => 64,
        },
        Operand::Ind { vt, .. } => vt_bits(*vt),
        Operand::Imm { .. } => vt_bits(default),
    }
}

/// Stack-anchored values survive only additive arithmetic; anything else
/// turns them unknown.
fn demote_nonadditive(kind: InstrKind, s: CaptureState) -> CaptureState {
    let additive = matches!(
        kind,
        InstrKind::Add | InstrKind::Sub | InstrKind::Lea | InstrKind::Inc | InstrKind::Dec
            | InstrKind::Mov
            | InstrKind::Cmp
    ) || kind.is_cmovcc();
    if s == CaptureState::StackRel && !additive {
        CaptureState::Dynamic
    } else {
        s
    }
}

/// ALU no-ops with a known source: `add/or/... dst, 0`, `and dst, -1`.
fn is_alu_noop(kind: InstrKind, w: u32, b: u64) -> bool {
    let b = b & alu::mask(w);
    match kind {
        InstrKind::Add | InstrKind::Sub | InstrKind::Or | InstrKind::Xor => b == 0,
        InstrKind::And => b == alu::mask(w),
        _ => false,
    }
}

/// Read `size` bytes from the host process at `addr`.
fn read_host(addr: u64, size: u64) -> u64 {
    let mut val = 0u64;
    // Safety: the caller registered [addr, addr+size) as constant data.
    unsafe {
        for i in (0..size).rev() {
            val = (val << 8) | *((addr + i) as *const u8) as u64;
        }
    }
    val
}
