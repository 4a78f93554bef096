//! Control transfers and the outer capture loop: branch forking over state
//! snapshots, call inlining and bypassing, return-address checking, and the
//! stack operations that keep the runtime RSP pinned at the entry anchor.

use respin_asm::{gp, Instr, InstrKind, MemRef, Operand, Reg, ValueType};

use crate::capture::{CbbId, CbbTerm};
use crate::config::{make_dynamic, make_static, FcFlags, FunctionConfig};
use crate::consts::{EMU_MAX_STEPS, MAX_CALLDEPTH};
use crate::emu::state::{EmuState, EsId};
use crate::emu::Flow;
use crate::error::{ErrorKind, ErrorModule, RewriteError, RwResult};
use crate::rewriter::Rewriter;
use crate::state::{CaptureState, CapVal};

impl Rewriter {
    // --- outer loop -------------------------------------------------------

    /// Capture the whole function reachable from `entry`: emit the entry
    /// block, then drain the worklist the branch splits feed.
    pub(crate) fn run_capture(
        &mut self,
        entry: u64,
        params: &[(u64, CaptureState)],
    ) -> RwResult<()> {
        self.st = EmuState::init(entry, self.cfg.stack_size, params, self.run_id);
        self.capturing = true;
        let es0 = self.snapshot()?;
        let first = self.capture.get_cbb(entry, es0)?;
        self.capture.push_work(first)?;

        while let Some(id) = self.capture.pop_work() {
            if self.capture.get(id).emitted {
                continue;
            }
            self.capture.get_mut(id).emitted = true;
            let (addr, es) = {
                let cbb = self.capture.get(id);
                (cbb.addr, cbb.es)
            };
            tracing::debug!(target: "respin::emu", addr, es = es.index(), "emitting block");
            self.st = self.saved.get(es).clone();
            self.st.ip = addr;
            if self.verbose.emu_state {
                for (i, cell) in self.st.regs.iter().enumerate() {
                    tracing::trace!(
                        target: "respin::emu",
                        reg = i,
                        val = cell.val,
                        state = ?cell.state,
                        "entry register"
                    );
                }
            }
            self.cur = Some(id);
            self.materialized = 0;
            self.emit_block(id)?;
        }
        self.cur = None;
        Ok(())
    }

    /// Abstract execution without capture; stops at the depth-0 return.
    pub(crate) fn run_emulate(&mut self, entry: u64, params: &[(u64, CaptureState)]) -> RwResult<()> {
        self.st = EmuState::init(entry, self.cfg.stack_size, params, self.run_id);
        self.capturing = false;
        self.cur = None;
        self.run_stream()
    }

    fn emit_block(&mut self, id: CbbId) -> RwResult<()> {
        let res = self.run_stream();
        if res.is_err() {
            self.capture.get_mut(id).term = CbbTerm::Open;
        }
        res
    }

    fn run_stream(&mut self) -> RwResult<()> {
        let mut steps = 0u64;
        loop {
            steps += 1;
            if steps > EMU_MAX_STEPS {
                return Err(RewriteError::plain(
                    ErrorModule::Emulator,
                    ErrorKind::BufferOverflow,
                    "abstract-execution step budget exhausted",
                ));
            }
            let addr = self.st.ip;
            let instr = self.fetch(addr)?;
            match self.step(&instr)? {
                Flow::Next => self.st.ip = addr.wrapping_add(instr.len as u64),
                Flow::Goto(t) => self.st.ip = t,
                Flow::End => return Ok(()),
            }
        }
    }

    /// The instruction at `addr`, decoding its block on demand.
    fn fetch(&mut self, addr: u64) -> RwResult<Instr> {
        if let Some(i) = self.dbbs.instr_at(addr) {
            return Ok(*i);
        }
        let dbb = self.dbbs.get_or_decode(addr)?;
        Ok(dbb.instrs[0])
    }

    /// Intern the current state. The instruction pointer is not part of a
    /// snapshot; the block key carries the address.
    pub(crate) fn snapshot(&mut self) -> RwResult<EsId> {
        self.saved.intern(&self.st)
    }

    // --- stack operations -------------------------------------------------

    pub(crate) fn step_push(&mut self, instr: &Instr) -> RwResult<Flow> {
        let op = instr.dst.expect("push operand");
        let v = self.read_op(instr, &op)?;
        let rsp = self.st.read_gp(gp::RSP);
        if rsp.state != CaptureState::StackRel {
            // the program made RSP unknown; its stack traffic was emitted too
            self.emit_residual(instr)?;
            self.set_gp(gp::RSP, CapVal::dynamic());
            return Ok(Flow::Next);
        }
        let new_sp = rsp.val.wrapping_sub(8);
        if !self.st.stack_contains(new_sp, 8) {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BufferOverflow,
                "emulated stack exhausted",
            ));
        }
        self.set_gp(gp::RSP, CapVal::stack_rel(new_sp));
        self.st.stack_write(new_sp, 8, v);
        if !v.state.is_known() {
            // the runtime RSP never moves, so a dynamic push becomes a store
            // relative to the anchor
            let disp = new_sp.wrapping_sub(self.st.anchor()) as i64;
            let dst = Operand::ind(ValueType::V64, MemRef::base_disp(gp::RSP, disp));
            match op {
                Operand::Reg(r) => {
                    self.emit(Instr::binary(InstrKind::Mov, ValueType::V64, dst, r.into()))?;
                }
                _ => {
                    return Err(RewriteError::plain(
                        ErrorModule::Emulator,
                        ErrorKind::UnsupportedOperands,
                        "push of an unknown memory operand",
                    ));
                }
            }
        }
        Ok(Flow::Next)
    }

    pub(crate) fn step_pop(&mut self, instr: &Instr) -> RwResult<Flow> {
        let op = instr.dst.expect("pop operand");
        let rsp = self.st.read_gp(gp::RSP);
        if rsp.state != CaptureState::StackRel {
            self.emit_residual(instr)?;
            self.set_gp(gp::RSP, CapVal::dynamic());
            if let Operand::Reg(r) = op {
                self.set_gp(r, CapVal::dynamic());
            }
            return Ok(Flow::Next);
        }
        let v = self.st.stack_read(rsp.val, 8).ok_or_else(|| {
            RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BadOperands,
                "pop beyond the emulated stack",
            )
        })?;
        let new_sp = rsp.val.wrapping_add(8);
        self.set_gp(gp::RSP, CapVal::stack_rel(new_sp));
        match op {
            Operand::Reg(r) => {
                if !v.state.is_known() {
                    let disp = rsp.val.wrapping_sub(self.st.anchor()) as i64;
                    let src = Operand::ind(ValueType::V64, MemRef::base_disp(gp::RSP, disp));
                    self.emit(Instr::binary(InstrKind::Mov, ValueType::V64, r.into(), src))?;
                }
                self.set_gp(r, v);
            }
            _ => {
                return Err(RewriteError::plain(
                    ErrorModule::Emulator,
                    ErrorKind::UnsupportedOperands,
                    "pop to a memory operand",
                ));
            }
        }
        Ok(Flow::Next)
    }

    pub(crate) fn step_leave(&mut self, instr: &Instr) -> RwResult<Flow> {
        // leave = mov rsp, rbp; pop rbp
        let rbp = self.st.read_gp(gp::RBP);
        if rbp.state != CaptureState::StackRel {
            self.emit_residual(instr)?;
            self.set_gp(gp::RSP, CapVal::dynamic());
            self.set_gp(gp::RBP, CapVal::dynamic());
            return Ok(Flow::Next);
        }
        self.set_gp(gp::RSP, CapVal::stack_rel(rbp.val));
        let pop = Instr::unary(InstrKind::Pop, ValueType::V64, Operand::reg(gp::RBP))
            .at(instr.addr, instr.len);
        self.step_pop(&pop)
    }

    // --- branches ---------------------------------------------------------

    pub(crate) fn step_jcc(&mut self, instr: &Instr) -> RwResult<Flow> {
        let cond = instr.kind.cond().expect("jcc");
        let target = instr
            .dst
            .as_ref()
            .and_then(|o| o.as_imm())
            .expect("decoded branch target");
        let next = instr.addr.wrapping_add(instr.len as u64);
        let known = self.flags_state(cond.flags_read()).is_known();
        let backward = target <= instr.addr;

        let inhibit = backward && {
            let owner = self.st.call_stack.last().copied().or(self.entry);
            owner
                .and_then(|a| self.cfg.func(a))
                .map_or(false, |fc| fc.flags.contains(FcFlags::INHIBIT_LOOP_UNROLL))
        };

        if self.cfg.branches_known || (known && !inhibit) {
            let taken = cond.eval(|f| self.st.flag(f).val != 0);
            return Ok(Flow::Goto(if taken { target } else { next }));
        }

        if !self.capturing {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::InvalidRequest,
                "conditional branch on unknown flags during pure emulation",
            ));
        }

        let cur = self.cur.expect("capturing without a block");

        // Re-splitting toward an already-captured address means we are going
        // around a loop whose condition is unknown. Loop-carried known
        // values would produce a fresh snapshot every lap; pin them into
        // their registers and treat them as unknown so the snapshots
        // converge and the loop closes.
        if self.capture.has_addr(target) || self.capture.has_addr(next) {
            let mut pre = Vec::new();
            for idx in 0..16u8 {
                if self.st.regs[idx as usize].state.is_imm_foldable() {
                    self.materialize_reg(idx, &mut pre);
                    self.st.regs[idx as usize].state = CaptureState::Dynamic;
                }
            }
            for p in pre {
                self.emit(p)?;
            }
        }

        let es = self.snapshot()?;
        let taken_cbb = self.capture.get_cbb(target, es)?;
        let fall_cbb = self.capture.get_cbb(next, es)?;
        {
            let c = self.capture.get_mut(cur);
            c.term = CbbTerm::Jcc(cond);
            c.next_branch = Some(taken_cbb);
            c.next_fall = Some(fall_cbb);
            // backward branches predict taken
            c.preferred_taken = backward;
        }
        // the predicted side is pushed last so it is emitted first
        if backward {
            self.capture.push_work(fall_cbb)?;
            self.capture.push_work(taken_cbb)?;
        } else {
            self.capture.push_work(taken_cbb)?;
            self.capture.push_work(fall_cbb)?;
        }
        tracing::trace!(
            target: "respin::emu",
            at = instr.addr,
            target,
            next,
            "split on {cond:?}"
        );
        Ok(Flow::End)
    }

    pub(crate) fn step_jmp(&mut self, instr: &Instr) -> RwResult<Flow> {
        let target = instr
            .dst
            .as_ref()
            .and_then(|o| o.as_imm())
            .expect("decoded jump target");
        Ok(Flow::Goto(target))
    }

    pub(crate) fn step_jmp_indirect(&mut self, instr: &Instr) -> RwResult<Flow> {
        let target = self.resolve_indirect(instr)?;
        Ok(Flow::Goto(target))
    }

    /// Resolve an indirect branch/call operand to a concrete target.
    fn resolve_indirect(&mut self, instr: &Instr) -> RwResult<u64> {
        let op = instr.dst.expect("indirect operand");
        let unknown = || {
            RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BufferOverflow,
                format!("unknown indirect target at {:#x}", instr.addr),
            )
        };
        match op {
            Operand::Reg(r) => {
                let v = self.st.read_gp(r);
                if v.state.is_imm_foldable() {
                    Ok(v.val)
                } else {
                    Err(unknown())
                }
            }
            Operand::Ind { mem, .. } => {
                // a known slot address is followed through host memory: the
                // resolved-PLT pattern
                let ea = self.eval_addr(instr, &mem);
                if ea.state == CaptureState::StackRel {
                    let v = self.st.stack_read(ea.val, 8).ok_or_else(unknown)?;
                    if v.state.is_imm_foldable() {
                        return Ok(v.val);
                    }
                    return Err(unknown());
                }
                if ea.state.is_imm_foldable() && mem.seg.is_none() {
                    // Safety: resolving a code pointer the target itself
                    // would have dereferenced
                    let mut val = 0u64;
                    unsafe {
                        for i in (0..8).rev() {
                            val = (val << 8) | *((ea.val + i) as *const u8) as u64;
                        }
                    }
                    return Ok(val);
                }
                Err(unknown())
            }
            Operand::Imm { val, .. } => Ok(val),
        }
    }

    // --- calls ------------------------------------------------------------

    pub(crate) fn step_call(&mut self, instr: &Instr) -> RwResult<Flow> {
        let target = self.resolve_indirect(instr)?;
        let next = instr.addr.wrapping_add(instr.len as u64);

        if target == make_dynamic as usize as u64 {
            return self.step_make_dynamic();
        }
        if target == make_static as usize as u64 {
            let v = self.st.read_gp(gp::RDI);
            self.set_gp(gp::RAX, CapVal::known_viral(v.val));
            return Ok(Flow::Next);
        }

        let fc = self.cfg.func(target).cloned();
        if let Some(fc) = &fc {
            if fc.flags.contains(FcFlags::BYPASS_EMU) {
                return self.step_bypass_call(target, fc);
            }
            if fc.flags.contains(FcFlags::KEEP_CALL_INSTR) {
                self.emit_literal_call(target, Some(fc))?;
                self.after_literal_call(fc, None);
                return Ok(Flow::Next);
            }
        }

        // recursion accounting halts inlining, leaving a literal call
        let occurrences = self
            .st
            .call_stack
            .iter()
            .filter(|t| **t == target)
            .count() as u32;
        if occurrences >= fc.as_ref().map_or(u32::MAX, |f| f.max_rec_depth) {
            self.emit_literal_call(target, fc.as_ref())?;
            self.after_literal_call(&fc.unwrap_or_default(), None);
            return Ok(Flow::Next);
        }

        if self.st.depth() + 1 > MAX_CALLDEPTH {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BufferOverflow,
                "inlined call depth exhausted",
            ));
        }

        let rsp = self.st.read_gp(gp::RSP);
        if rsp.state != CaptureState::StackRel {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BadOperands,
                "untracked stack pointer at call",
            ));
        }
        let new_sp = rsp.val.wrapping_sub(8);
        if !self.st.stack_contains(new_sp, 8) {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BufferOverflow,
                "emulated stack exhausted",
            ));
        }
        self.set_gp(gp::RSP, CapVal::stack_rel(new_sp));
        self.st.stack_write(new_sp, 8, CapVal::known(next));
        self.st.ret_stack.push(next);
        self.st.call_stack.push(target);
        tracing::trace!(target: "respin::emu", target, ret = next, depth = self.st.depth(), "inlining call");
        Ok(Flow::Goto(target))
    }

    fn step_make_dynamic(&mut self) -> RwResult<Flow> {
        let v = self.st.read_gp(gp::RDI);
        let mut pre = Vec::new();
        if v.state.is_known() {
            self.materialize_reg(7, &mut pre);
        }
        for p in pre {
            self.emit(p)?;
        }
        self.emit(Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            Operand::reg(gp::RAX),
            Operand::reg(gp::RDI),
        ))?;
        self.set_gp(gp::RDI, CapVal::with_state(v.val, CaptureState::Dynamic));
        self.set_gp(gp::RAX, CapVal::with_state(v.val, CaptureState::Dynamic));
        Ok(Flow::Next)
    }

    fn step_bypass_call(&mut self, target: u64, fc: &FunctionConfig) -> RwResult<Flow> {
        // marshal the six integer parameter registers; callees with fewer
        // parameters ignore the rest
        let a = |i: usize| self.st.regs[respin_asm::param_reg(i).expect("slot").index() as usize].val;
        let args = [a(0), a(1), a(2), a(3), a(4), a(5)];
        // Safety: the caller registered this address as a bypassable
        // function with the System V integer ABI.
        let f: extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64 =
            unsafe { core::mem::transmute(target as usize) };
        let ret = f(args[0], args[1], args[2], args[3], args[4], args[5]);
        tracing::debug!(target: "respin::emu", target, ret, "bypassed call");

        self.emit_literal_call(target, Some(fc))?;
        self.after_literal_call(fc, Some(ret));
        Ok(Flow::Next)
    }

    /// Registers the ABI hands to a callee are unknown after a real call;
    /// RAX is then refined by the function's flags.
    fn after_literal_call(&mut self, fc: &FunctionConfig, bypass_ret: Option<u64>) {
        for idx in [0u8, 1, 2, 6, 7, 8, 9, 10, 11] {
            self.set_gp(Reg::gp64(idx), CapVal::dynamic());
        }
        for f in [
            respin_asm::Flag::Zf,
            respin_asm::Flag::Cf,
            respin_asm::Flag::Sf,
            respin_asm::Flag::Of,
            respin_asm::Flag::Pf,
        ] {
            self.st.set_flag(f, false, CaptureState::Dynamic);
        }

        let ret = if fc.flags.contains(FcFlags::RET_VALUE_HINT) {
            Some(fc.ret_value)
        } else {
            bypass_ret
        };
        if fc.flags.contains(FcFlags::SET_RETURN_DYNAMIC) {
            return;
        }
        if let Some(val) = ret {
            if fc.flags.contains(FcFlags::SET_RET_KNOWN_VIRAL) {
                self.set_gp(gp::RAX, CapVal::known_viral(val));
            } else if fc.flags.contains(FcFlags::SET_RET_KNOWN) {
                self.set_gp(gp::RAX, CapVal::known(val));
            }
        }
    }

    /// Emit a position-independent literal call: materialized static
    /// arguments, the target in a scratch register, and the stack kept
    /// aligned around the `call`.
    fn emit_literal_call(&mut self, target: u64, fc: Option<&FunctionConfig>) -> RwResult<()> {
        if !self.capturing {
            return Ok(());
        }
        if !self.cfg.keep_large_call_addrs && i32::try_from(target as i64).is_err() {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::UnsupportedOperands,
                "call target beyond 32-bit reach",
            ));
        }

        let mut pre = Vec::new();
        let mut avoid = 0u16;
        let par_count = fc.map_or(0, |f| f.par_count).min(6) as usize;
        for slot in 0..par_count {
            let reg = respin_asm::param_reg(slot).expect("slot");
            avoid |= 1 << reg.index();
            if self.st.regs[reg.index() as usize].state.is_known() {
                self.materialize_reg(reg.index(), &mut pre);
            }
        }
        for p in pre {
            self.emit(p)?;
        }

        let (scratch, spill) = self.pick_scratch_for_call(avoid);
        let sreg = Reg::gp64(scratch);
        if spill {
            self.emit(Instr::unary(InstrKind::Push, ValueType::V64, sreg.into()))?;
        } else {
            self.emit(Instr::binary(
                InstrKind::Sub,
                ValueType::V64,
                Operand::reg(gp::RSP),
                Operand::imm(ValueType::V32, 8),
            ))?;
        }
        self.emit(Instr::binary(
            InstrKind::Mov,
            ValueType::V64,
            sreg.into(),
            Operand::imm(ValueType::V64, target),
        ))?;
        self.emit(Instr::unary(InstrKind::Call, ValueType::V64, sreg.into()))?;
        if spill {
            self.emit(Instr::unary(InstrKind::Pop, ValueType::V64, sreg.into()))?;
        } else {
            self.emit(Instr::binary(
                InstrKind::Add,
                ValueType::V64,
                Operand::reg(gp::RSP),
                Operand::imm(ValueType::V32, 8),
            ))?;
        }
        Ok(())
    }

    /// Scratch for a call target: caller-saved registers are clobbered by
    /// the call anyway, so prefer an unused one outright.
    fn pick_scratch_for_call(&self, avoid: u16) -> (u8, bool) {
        for idx in [11u8, 10, 9, 8, 2, 1, 0, 6, 7] {
            if avoid & (1 << idx) == 0 {
                return (idx, false);
            }
        }
        (3, true)
    }

    // --- returns ----------------------------------------------------------

    pub(crate) fn step_ret(&mut self, instr: &Instr) -> RwResult<Flow> {
        let extra = instr.dst.as_ref().and_then(|o| o.as_imm()).unwrap_or(0);
        let rsp = self.st.read_gp(gp::RSP);
        if rsp.state != CaptureState::StackRel {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BadOperands,
                "untracked stack pointer at return",
            ));
        }
        let slot = self.st.stack_read(rsp.val, 8).ok_or_else(|| {
            RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BadOperands,
                "return address outside the emulated stack",
            )
        })?;
        let expected = *self.st.ret_stack.last().expect("sentinel present");
        if !slot.state.is_known() || slot.val != expected {
            return Err(RewriteError::plain(
                ErrorModule::Emulator,
                ErrorKind::BadOperands,
                "return address modified",
            ));
        }
        self.st.ret_stack.pop();
        let new_sp = rsp.val.wrapping_add(8).wrapping_add(extra);
        self.set_gp(gp::RSP, CapVal::stack_rel(new_sp));

        if self.st.ret_stack.is_empty() {
            // depth-0 return: the function result must be live in RAX
            let mut pre = Vec::new();
            if self.st.regs[0].state.is_known() {
                self.materialize_reg(0, &mut pre);
            }
            for p in pre {
                self.emit(p)?;
            }
            self.emit(*instr)?;
            if let Some(cur) = self.cur {
                self.capture.get_mut(cur).term = CbbTerm::Ret;
            }
            return Ok(Flow::End);
        }

        self.st.call_stack.pop();
        Ok(Flow::Goto(expected))
    }
}
