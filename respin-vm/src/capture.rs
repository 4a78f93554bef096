//! Captured basic blocks: the residual-instruction store and the worklist
//! driving block emission.

use hashbrown::HashMap;

use respin_asm::{Cond, Instr};

use crate::consts::CAPTURESTACK_LEN;
use crate::emu::state::EsId;
use crate::error::{ErrorKind, ErrorModule, RewriteError, RwResult};

/// Handle of a captured block. Successor links use handles rather than
/// references because the block graph contains cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CbbId(u32);

impl CbbId {
    /// Raw arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a captured block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CbbTerm {
    /// Still being emitted, or aborted.
    #[default]
    Open,
    /// Function return; the `ret` itself is the last body instruction.
    Ret,
    /// Conditional branch on the given condition.
    Jcc(Cond),
}

/// One captured basic block: the residual instructions for a
/// `(source address, state snapshot)` pair.
#[derive(Debug, Default)]
pub struct Cbb {
    /// Source address the block was captured from.
    pub addr: u64,
    /// State snapshot at block entry.
    pub es: EsId,
    /// Residual instructions.
    pub instrs: Vec<Instr>,
    /// Terminator.
    pub term: CbbTerm,
    /// Taken-branch successor.
    pub next_branch: Option<CbbId>,
    /// Fall-through successor.
    pub next_fall: Option<CbbId>,
    /// Whether the taken side is the statically predicted one.
    pub preferred_taken: bool,
    /// Whether the body has been emitted.
    pub emitted: bool,

    // layout fields, written by the three layout passes
    /// Pass-1 address of the body.
    pub addr1: u64,
    /// Final address after compaction.
    pub addr2: u64,
    /// Body size in bytes.
    pub size: u32,
    /// Whether the terminator uses the short `Jcc rel8` form.
    pub gen_jcc8: bool,
    /// Whether an explicit `JMP rel32` to the fall-through is required.
    pub gen_jump: bool,
}

impl Cbb {
    fn new(addr: u64, es: EsId) -> Self {
        Self {
            addr,
            es,
            ..Self::default()
        }
    }
}

/// Arena of captured blocks plus the emission worklist.
#[derive(Debug)]
pub struct CaptureStore {
    cbbs: Vec<Cbb>,
    index: HashMap<(u64, EsId), CbbId>,
    worklist: Vec<CbbId>,
    instr_cap: usize,
    bb_cap: usize,
    instr_count: usize,
}

impl CaptureStore {
    /// Store with the given pool capacities.
    pub fn new(instr_cap: usize, bb_cap: usize) -> Self {
        Self {
            cbbs: Vec::new(),
            index: HashMap::new(),
            worklist: Vec::new(),
            instr_cap,
            bb_cap,
            instr_count: 0,
        }
    }

    /// Update pool capacities.
    pub fn set_capacity(&mut self, instr_cap: usize, bb_cap: usize) {
        self.instr_cap = instr_cap;
        self.bb_cap = bb_cap;
    }

    /// Drop all captured blocks; allocations are reused.
    pub fn reset(&mut self) {
        self.cbbs.clear();
        self.index.clear();
        self.worklist.clear();
        self.instr_count = 0;
    }

    /// The block for `(addr, es)`, created on first request. The same key
    /// always yields the same handle.
    pub fn get_cbb(&mut self, addr: u64, es: EsId) -> RwResult<CbbId> {
        if let Some(id) = self.index.get(&(addr, es)) {
            return Ok(*id);
        }
        if self.cbbs.len() >= self.bb_cap {
            return Err(RewriteError::plain(
                ErrorModule::Capture,
                ErrorKind::BufferOverflow,
                "captured-block pool exhausted",
            ));
        }
        let id = CbbId(self.cbbs.len() as u32);
        self.cbbs.push(Cbb::new(addr, es));
        self.index.insert((addr, es), id);
        Ok(id)
    }

    /// Push a block onto the emission worklist.
    pub fn push_work(&mut self, id: CbbId) -> RwResult<()> {
        if self.worklist.len() >= CAPTURESTACK_LEN {
            return Err(RewriteError::plain(
                ErrorModule::Capture,
                ErrorKind::BufferOverflow,
                "capture worklist exhausted",
            ));
        }
        self.worklist.push(id);
        Ok(())
    }

    /// Pop the most recently pushed block.
    pub fn pop_work(&mut self) -> Option<CbbId> {
        self.worklist.pop()
    }

    /// Append a residual instruction to a block.
    pub fn capture(&mut self, id: CbbId, instr: Instr) -> RwResult<()> {
        if self.instr_count >= self.instr_cap {
            return Err(RewriteError::plain(
                ErrorModule::Capture,
                ErrorKind::BufferOverflow,
                "captured-instruction pool exhausted",
            ));
        }
        self.instr_count += 1;
        self.cbbs[id.index()].instrs.push(instr);
        Ok(())
    }

    /// Shared access to a block.
    pub fn get(&self, id: CbbId) -> &Cbb {
        &self.cbbs[id.index()]
    }

    /// Exclusive access to a block.
    pub fn get_mut(&mut self, id: CbbId) -> &mut Cbb {
        &mut self.cbbs[id.index()]
    }

    /// Whether any captured block starts at `addr`, under any snapshot.
    pub fn has_addr(&self, addr: u64) -> bool {
        self.index.keys().any(|(a, _)| *a == addr)
    }

    /// Number of captured blocks.
    pub fn len(&self) -> usize {
        self.cbbs.len()
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.cbbs.is_empty()
    }

    /// Handles of all blocks, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = CbbId> {
        (0..self.cbbs.len() as u32).map(CbbId)
    }
}
