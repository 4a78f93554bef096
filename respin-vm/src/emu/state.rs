//! Abstract machine state: registers, flags and the byte-granular stack,
//! plus the interned snapshot pool that keys captured blocks.

use respin_asm::{Flag, Reg, RegKind, FLAG_COUNT, REG_COUNT};

use crate::consts::{MAX_CALLDEPTH, RET_SENTINEL, SAVEDSTATE_MAX};
use crate::error::{ErrorKind, ErrorModule, RewriteError, RwResult};
use crate::state::{CaptureState, CapVal};

/// Handle of an interned state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EsId(pub(crate) u32);

impl EsId {
    /// Raw index into the snapshot pool.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The abstract machine state the emulator executes over.
///
/// Stack values and their capture states live in two parallel arrays indexed
/// by offset from the buffer start; `accessed` is the low-water mark that
/// bounds every scan. Register values are stored at full width; narrower
/// reads and writes mask in place.
#[derive(Debug, Clone)]
pub struct EmuState {
    /// GP register file, indexed by encoding index.
    pub regs: [CapVal; REG_COUNT],
    /// Arithmetic flags, indexed by [`Flag::index`].
    pub flags: [CapVal; FLAG_COUNT],
    /// Next instruction address.
    pub ip: u64,
    stack: Vec<u8>,
    stack_state: Vec<CaptureState>,
    stack_base: u64,
    /// Lowest stack offset written so far.
    pub accessed: usize,
    /// Expected return addresses, bottom is the depth-0 sentinel.
    pub ret_stack: Vec<u64>,
    /// Targets of the currently inlined calls, for recursion accounting.
    pub call_stack: Vec<u64>,
    /// Rewrite-run generation; stack-relative values from different runs are
    /// never the same.
    pub run_id: u32,
}

impl EmuState {
    /// Fresh state for one rewrite run.
    ///
    /// `params` land in the System V parameter registers with the given
    /// capture states; RSP points at the sentinel return-address slot;
    /// callee-saved registers are unknown, everything else is dead.
    pub fn init(
        entry: u64,
        stack_size: usize,
        params: &[(u64, CaptureState)],
        run_id: u32,
    ) -> Self {
        let stack = vec![0u8; stack_size];
        let stack_base = stack.as_ptr() as u64;
        let mut st = Self {
            regs: [CapVal::dead(); REG_COUNT],
            flags: [CapVal::dynamic(); FLAG_COUNT],
            ip: entry,
            stack,
            stack_state: vec![CaptureState::Dead; stack_size],
            stack_base,
            accessed: stack_size,
            ret_stack: Vec::with_capacity(MAX_CALLDEPTH),
            call_stack: Vec::with_capacity(MAX_CALLDEPTH),
            run_id,
        };

        for idx in 0..16u8 {
            if respin_asm::is_callee_saved(idx) {
                st.regs[idx as usize] = CapVal::dynamic();
            }
        }
        for (slot, (val, state)) in params.iter().enumerate() {
            if let Some(reg) = respin_asm::param_reg(slot) {
                st.regs[reg.index() as usize] = CapVal::with_state(*val, *state);
            }
        }

        let anchor = st.anchor();
        st.regs[4] = CapVal::stack_rel(anchor); // RSP
        st.stack_write(anchor, 8, CapVal::known(RET_SENTINEL));
        st.ret_stack.push(RET_SENTINEL);
        st
    }

    /// First tracked stack address.
    pub fn stack_start(&self) -> u64 {
        self.stack_base
    }

    /// One past the last tracked stack address.
    pub fn stack_top(&self) -> u64 {
        self.stack_base + self.stack.len() as u64
    }

    /// Entry RSP: the anchor every stack-relative value is an offset from.
    /// The eight bytes at the anchor hold the sentinel return address.
    pub fn anchor(&self) -> u64 {
        self.stack_top() - 8
    }

    /// Inlined call depth.
    pub fn depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Whether `[addr, addr+size)` lies inside the tracked stack.
    pub fn stack_contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.stack_base && addr.wrapping_add(size) <= self.stack_top()
    }

    // --- registers --------------------------------------------------------

    /// Read a GP register at its operand width.
    pub fn read_gp(&self, reg: Reg) -> CapVal {
        let cell = self.regs[(reg.index() & 0x0f) as usize];
        let val = match reg.kind() {
            RegKind::Gp8 => cell.val & 0xff,
            RegKind::Gp8h => (cell.val >> 8) & 0xff,
            RegKind::Gp16 => cell.val & 0xffff,
            RegKind::Gp32 => cell.val & 0xffff_ffff,
            _ => cell.val,
        };
        CapVal::with_state(val, cell.state)
    }

    /// Write a GP register at its operand width.
    ///
    /// 32-bit writes zero the upper half; 8/16-bit writes merge. A partial
    /// write over a cell whose remaining bits are unknown leaves the cell
    /// unknown.
    pub fn write_gp(&mut self, reg: Reg, v: CapVal) {
        let slot = (reg.index() & 0x0f) as usize;
        let old = self.regs[slot];
        let merged = |mask: u64, shift: u32, old: CapVal, v: CapVal| {
            let val = (old.val & !(mask << shift)) | ((v.val & mask) << shift);
            // a partially known cell is only usable if the rest is known too
            let state = if v.state.is_known() && old.state.is_known() {
                CaptureState::Static
            } else {
                CaptureState::Dynamic
            };
            CapVal::with_state(val, state)
        };
        self.regs[slot] = match reg.kind() {
            RegKind::Gp64 => v,
            RegKind::Gp32 => CapVal::with_state(v.val & 0xffff_ffff, v.state),
            RegKind::Gp16 => merged(0xffff, 0, old, v),
            RegKind::Gp8 => merged(0xff, 0, old, v),
            RegKind::Gp8h => merged(0xff, 8, old, v),
            _ => v,
        };
    }

    /// Read a flag.
    pub fn flag(&self, f: Flag) -> CapVal {
        self.flags[f.index()]
    }

    /// Write a flag; address-like states are demoted first.
    pub fn set_flag(&mut self, f: Flag, val: bool, state: CaptureState) {
        self.flags[f.index()] = CapVal::with_state(val as u64, state.demote_for_flags());
    }

    // --- stack ------------------------------------------------------------

    /// Read `size` bytes (1..=8) from the tracked stack. Returns `None` when
    /// the range is outside the buffer.
    pub fn stack_read(&self, addr: u64, size: u64) -> Option<CapVal> {
        if !self.stack_contains(addr, size) {
            return None;
        }
        let off = (addr - self.stack_base) as usize;
        let n = size as usize;
        let mut val = 0u64;
        for i in (0..n).rev() {
            val = (val << 8) | self.stack[off + i] as u64;
        }
        let mut state = self.stack_state[off];
        for i in 1..n {
            state = fold_byte_states(state, self.stack_state[off + i]);
        }
        // reading bytes never written yields no usable value
        let state = match state {
            CaptureState::Dead => CaptureState::Dynamic,
            s => s,
        };
        Some(CapVal::with_state(val, state))
    }

    /// Write `size` bytes (1..=8) to the tracked stack. Returns `false` when
    /// the range is outside the buffer.
    pub fn stack_write(&mut self, addr: u64, size: u64, v: CapVal) -> bool {
        if !self.stack_contains(addr, size) {
            return false;
        }
        let off = (addr - self.stack_base) as usize;
        let n = size as usize;
        for i in 0..n {
            self.stack[off + i] = (v.val >> (8 * i)) as u8;
            self.stack_state[off + i] = v.state;
        }
        self.accessed = self.accessed.min(off);
        true
    }

    // --- snapshot equality ------------------------------------------------

    /// Snapshot equality: registers, flags, call depth and the known portion
    /// of the stack must agree; stack-relative sameness additionally
    /// requires the same rewrite run.
    pub fn same_as(&self, other: &EmuState) -> bool {
        // the instruction pointer is not compared: block keys carry the
        // address, snapshots carry only the machine state
        if self.ret_stack != other.ret_stack || self.call_stack != other.call_stack {
            return false;
        }
        for (a, b) in self.regs.iter().zip(other.regs.iter()) {
            if !capval_same(a, b, self.run_id, other.run_id) {
                return false;
            }
        }
        for (a, b) in self.flags.iter().zip(other.flags.iter()) {
            if !capval_same(a, b, self.run_id, other.run_id) {
                return false;
            }
        }
        if self.stack.len() != other.stack.len() {
            return false;
        }
        let lo = self.accessed.min(other.accessed);
        for i in lo..self.stack.len() {
            let (sa, sb) = (self.stack_state[i], other.stack_state[i]);
            if sa != sb {
                return false;
            }
            if sa.is_known() && self.stack[i] != other.stack[i] {
                return false;
            }
        }
        true
    }
}

fn capval_same(a: &CapVal, b: &CapVal, run_a: u32, run_b: u32) -> bool {
    if a.state != b.state {
        return false;
    }
    match a.state {
        CaptureState::StackRel => a.val == b.val && run_a == run_b,
        s if s.is_known() => a.val == b.val,
        _ => true,
    }
}

/// Per-byte state folding for multi-byte stack reads.
fn fold_byte_states(a: CaptureState, b: CaptureState) -> CaptureState {
    use CaptureState::*;
    match (a, b) {
        (Dead, _) | (_, Dead) => Dead,
        (Dynamic, _) | (_, Dynamic) => Dynamic,
        (StackRel, StackRel) => StackRel,
        (StackRel, _) | (_, StackRel) => Dynamic,
        (Static2, _) | (_, Static2) => Static2,
        (Static, Static) => Static,
    }
}

/// Bounded pool of interned state snapshots.
#[derive(Debug, Default)]
pub struct SavedStates {
    pool: Vec<EmuState>,
}

impl SavedStates {
    /// Intern a snapshot: an equal existing snapshot is reused, otherwise
    /// the state is copied into the pool.
    pub fn intern(&mut self, st: &EmuState) -> RwResult<EsId> {
        for (i, existing) in self.pool.iter().enumerate() {
            if existing.same_as(st) {
                return Ok(EsId(i as u32));
            }
        }
        if self.pool.len() >= SAVEDSTATE_MAX {
            return Err(RewriteError::plain(
                ErrorModule::Rewriter,
                ErrorKind::BufferOverflow,
                "saved-state pool exhausted",
            ));
        }
        self.pool.push(st.clone());
        Ok(EsId((self.pool.len() - 1) as u32))
    }

    /// The snapshot behind a handle.
    pub fn get(&self, id: EsId) -> &EmuState {
        &self.pool[id.index()]
    }

    /// Number of interned snapshots.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Whether no snapshot exists yet.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Drop all snapshots; the allocation is reused by the next run.
    pub fn reset(&mut self) {
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use respin_asm::gp;

    fn fresh() -> EmuState {
        EmuState::init(0x1000, 256, &[(3, CaptureState::Static)], 1)
    }

    #[test]
    fn entry_state_layout() {
        let st = fresh();
        assert_eq!(st.read_gp(gp::RDI).val, 3);
        assert_eq!(st.read_gp(gp::RDI).state, CaptureState::Static);
        assert_eq!(st.read_gp(gp::RSI).state, CaptureState::Dead);
        assert_eq!(st.read_gp(gp::RBX).state, CaptureState::Dynamic);
        assert_eq!(st.read_gp(gp::RBP).state, CaptureState::Dynamic);
        assert_eq!(st.read_gp(gp::RSP).state, CaptureState::StackRel);
        assert_eq!(st.read_gp(gp::RSP).val, st.anchor());
        // sentinel return address sits at the anchor
        let ret = st.stack_read(st.anchor(), 8).unwrap();
        assert_eq!(ret.val, RET_SENTINEL);
        assert_eq!(ret.state, CaptureState::Static);
    }

    #[test]
    fn partial_register_writes() {
        let mut st = fresh();
        st.write_gp(gp::RAX, CapVal::known(0x1122_3344_5566_7788));
        st.write_gp(gp::RAX.with_kind(RegKind::Gp8), CapVal::known(0xaa));
        let v = st.read_gp(gp::RAX);
        assert_eq!(v.val, 0x1122_3344_5566_77aa);
        assert_eq!(v.state, CaptureState::Static);
        // 32-bit write zero-extends
        st.write_gp(gp::RAX.with_kind(RegKind::Gp32), CapVal::known(0x5));
        assert_eq!(st.read_gp(gp::RAX).val, 5);
        // partial write over an unknown cell stays unknown
        st.write_gp(gp::RDX, CapVal::dynamic());
        st.write_gp(gp::RDX.with_kind(RegKind::Gp8), CapVal::known(1));
        assert_eq!(st.read_gp(gp::RDX).state, CaptureState::Dynamic);
    }

    #[test]
    fn stack_round_trip_and_low_water() {
        let mut st = fresh();
        let addr = st.anchor() - 16;
        assert!(st.stack_write(addr, 8, CapVal::known(0xdead_beef)));
        let v = st.stack_read(addr, 8).unwrap();
        assert_eq!(v.val, 0xdead_beef);
        assert_eq!(v.state, CaptureState::Static);
        assert_eq!(st.accessed, (addr - st.stack_start()) as usize);
        // out-of-range access is rejected
        assert!(st.stack_read(st.stack_top(), 8).is_none());
        assert!(!st.stack_write(st.stack_start() - 8, 8, CapVal::known(0)));
    }

    #[test]
    fn uninitialized_stack_reads_are_unknown() {
        let st = fresh();
        let v = st.stack_read(st.anchor() - 64, 8).unwrap();
        assert_eq!(v.state, CaptureState::Dynamic);
    }

    #[test]
    fn snapshot_interning_dedupes() {
        let mut pool = SavedStates::default();
        let st = fresh();
        let a = pool.intern(&st).unwrap();
        let b = pool.intern(&st.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);

        let mut changed = st.clone();
        changed.write_gp(gp::RSI, CapVal::known(1));
        let c = pool.intern(&changed).unwrap();
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn dynamic_values_compare_by_state_only() {
        let mut pool = SavedStates::default();
        let mut a = fresh();
        a.write_gp(gp::RSI, CapVal::dynamic());
        let ia = pool.intern(&a).unwrap();
        // a dynamic register with different garbage bits is still the same
        // snapshot
        let mut b = a.clone();
        b.regs[6].val = 0x1234;
        let ib = pool.intern(&b).unwrap();
        assert_eq!(ia, ib);
    }

    #[test]
    fn different_runs_never_share_stack_relative_values() {
        let a = EmuState::init(0x1000, 256, &[], 1);
        let mut b = a.clone();
        b.run_id = 2;
        assert!(!a.same_as(&b));
    }
}
