//! Rewrite configuration: parameter knowledge, per-function call handling,
//! and registered memory ranges.

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::consts::{EMU_STACK_SIZE, MAX_CALLDEPTH};

bitflags! {
    /// Per-function call-handling flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FcFlags: u16 {
        /// Invoke the function natively at rewrite time instead of emulating
        /// its body.
        const BYPASS_EMU = 1 << 0;
        /// Emit a literal `call` instead of inlining the callee.
        const KEEP_CALL_INSTR = 1 << 1;
        /// The function is a known intrinsic; kept for configuration
        /// compatibility.
        const INTRINSIC_HINT = 1 << 2;
        /// After the call, RAX holds a known value.
        const SET_RET_KNOWN = 1 << 3;
        /// After the call, RAX holds a known viral value.
        const SET_RET_KNOWN_VIRAL = 1 << 4;
        /// After the call, RAX is unknown even if the callee was bypassed.
        const SET_RETURN_DYNAMIC = 1 << 5;
        /// Use the configured `ret_value` instead of a bypass result.
        const RET_VALUE_HINT = 1 << 6;
        /// Keep conditional back edges as real branches even when the loop
        /// condition folds, preventing unrolling.
        const INHIBIT_LOOP_UNROLL = 1 << 7;
    }
}

/// Call handling for one target function.
#[derive(Debug, Clone)]
pub struct FunctionConfig {
    /// Handling flags.
    pub flags: FcFlags,
    /// How often the function may appear on the inlined call stack before
    /// the engine stops inlining and emits a literal call.
    pub max_rec_depth: u32,
    /// Number of integer parameters the function consumes (for marshalling
    /// and for materializing arguments ahead of a kept call).
    pub par_count: u8,
    /// Return value used with `RET_VALUE_HINT`.
    pub ret_value: u64,
    /// Display name for traces.
    pub name: Option<String>,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            flags: FcFlags::empty(),
            max_rec_depth: u32::MAX,
            par_count: 0,
            ret_value: 0,
            name: None,
        }
    }
}

impl FunctionConfig {
    /// Config with the given flags and everything else defaulted.
    pub fn with_flags(flags: FcFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }
}

/// Caller-declared knowledge about one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParState {
    /// Unknown at rewrite time.
    Dynamic,
    /// Known at rewrite time.
    Known,
    /// Known, and memory reached through it is known too.
    KnownViral,
}

/// Purpose of a registered memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRangeKind {
    /// Loads from this range at a known address yield known values.
    ConstantData,
}

/// A registered memory range.
#[derive(Debug, Clone)]
pub struct MemRange {
    /// First byte of the range.
    pub start: u64,
    /// Byte length.
    pub len: u64,
    /// What the range may be used for.
    pub kind: MemRangeKind,
    /// Display name for traces.
    pub name: Option<String>,
}

impl MemRange {
    fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.start && addr.wrapping_add(size) <= self.start.wrapping_add(self.len)
    }
}

/// Everything the engine consumes from the caller.
#[derive(Debug, Clone)]
pub struct RewriterConfig {
    /// Resolve every conditional branch against the concrete flag values
    /// instead of splitting.
    pub branches_known: bool,
    /// Force results computed at the given call depth to be unknown.
    pub force_unknown: [bool; MAX_CALLDEPTH],
    /// Materialize call targets beyond 32-bit reach through a scratch
    /// register instead of failing.
    pub keep_large_call_addrs: bool,
    /// On failure, report the original entry instead of 0.
    pub return_original: bool,
    /// Caller-declared parameter states for the up to six register
    /// parameters.
    pub par_state: [Option<ParState>; 6],
    /// Parameter names for traces.
    pub par_name: [Option<String>; 6],
    /// Per-function call handling, keyed by entry address.
    pub funcs: HashMap<u64, FunctionConfig>,
    /// Registered memory ranges.
    pub ranges: Vec<MemRange>,
    /// Byte size of the abstract stack.
    pub stack_size: usize,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            branches_known: false,
            force_unknown: [false; MAX_CALLDEPTH],
            keep_large_call_addrs: true,
            return_original: false,
            par_state: [None; 6],
            par_name: Default::default(),
            funcs: HashMap::new(),
            ranges: Vec::new(),
            stack_size: EMU_STACK_SIZE,
        }
    }
}

impl RewriterConfig {
    /// The registered constant-data range covering `[addr, addr+size)`, if
    /// any.
    pub fn constant_range(&self, addr: u64, size: u64) -> Option<&MemRange> {
        self.ranges
            .iter()
            .find(|r| r.kind == MemRangeKind::ConstantData && r.contains(addr, size))
    }

    /// Call handling for a target address.
    pub fn func(&self, addr: u64) -> Option<&FunctionConfig> {
        self.funcs.get(&addr)
    }

    /// Register or replace call handling for a target address.
    pub fn set_func(&mut self, addr: u64, cfg: FunctionConfig) {
        self.funcs.insert(addr, cfg);
    }

    /// Register a constant-data range.
    pub fn add_constant_range(&mut self, start: u64, len: u64, name: Option<String>) {
        self.ranges.push(MemRange {
            start,
            len,
            kind: MemRangeKind::ConstantData,
            name,
        });
    }
}

/// Marks its argument unknown for a surrounding rewrite. The rewriter
/// recognizes calls to this helper by address; at runtime it is the
/// identity.
#[inline(never)]
pub extern "C" fn make_dynamic(x: u64) -> u64 {
    x
}

/// Marks its argument known-and-viral for a surrounding rewrite. The
/// rewriter recognizes calls to this helper by address; at runtime it is the
/// identity.
#[inline(never)]
pub extern "C" fn make_static(x: u64) -> u64 {
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_range_bounds() {
        let mut cfg = RewriterConfig::default();
        cfg.add_constant_range(0x1000, 0x100, None);
        assert!(cfg.constant_range(0x1000, 1).is_some());
        assert!(cfg.constant_range(0x10ff, 1).is_some());
        assert!(cfg.constant_range(0x10f9, 8).is_none());
        assert!(cfg.constant_range(0xfff, 1).is_none());
        assert!(cfg.constant_range(0x1100, 1).is_none());
    }

    #[test]
    fn helpers_are_identity() {
        assert_eq!(make_dynamic(7), 7);
        assert_eq!(make_static(9), 9);
    }
}
