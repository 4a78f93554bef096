//! Engine parameters and pool bounds.

use static_assertions::const_assert;

/// Maximum inlined call depth during abstract execution.
pub const MAX_CALLDEPTH: usize = 16;

/// Bound of the worklist stack of captured blocks awaiting emission.
pub const CAPTURESTACK_LEN: usize = 256;

/// Bound of the saved-state pool; snapshot interning walks this linearly.
pub const SAVEDSTATE_MAX: usize = 64;

/// Default byte size of the abstract stack.
pub const EMU_STACK_SIZE: usize = 1024;

/// Default capacity of the decoded-instruction pool.
pub const DECODE_INSTR_CAP: usize = 2048;

/// Default capacity of the decoded-block pool.
pub const DECODE_BB_CAP: usize = 64;

/// Default capacity of the captured-instruction pool.
pub const CAPTURE_INSTR_CAP: usize = 4096;

/// Default capacity of the captured-block pool.
pub const CAPTURE_BB_CAP: usize = 128;

/// Default size of the generated-code arena (rounded up to whole pages).
pub const CODE_ARENA_SIZE: usize = 16 * 1024;

/// Reserved per-block space for the terminator: worst case is a 6-byte
/// `Jcc rel32` plus a 5-byte `JMP rel32`, padded.
pub const TERMINATOR_HOLE: usize = 26;

/// Alignment of every generated function entry.
pub const CODE_ALIGN: usize = 64;

/// Abstract-execution step bound; folded-away loops still consume steps, so
/// a statically infinite loop aborts instead of hanging the rewrite.
pub const EMU_MAX_STEPS: u64 = 1_000_000;

/// Sentinel stored in the depth-0 return-address slot of the abstract stack.
/// A `ret` that pops anything else reports a tampered return address.
pub const RET_SENTINEL: u64 = 0x5250_4e49_5053_4552; // "RESPINPR"

// the abstract stack always holds at least the sentinel slot
const_assert!(EMU_STACK_SIZE >= 64);
const_assert!(TERMINATOR_HOLE >= 6 + 5);
