//! Runtime specialization of x86-64 functions.
//!
//! A [`Rewriter`] takes the entry address of an in-memory function plus
//! concrete values for some of its parameters, partially evaluates the
//! machine code against them, and emits a specialized native function into
//! its own writable+executable arena. The result is observationally
//! equivalent to the original for the remaining free parameters but skips
//! the work that depended only on the fixed ones.
//!
//! ```no_run
//! use respin_vm::{ParState, Rewriter};
//!
//! # fn target() {}
//! let mut rw = Rewriter::new();
//! rw.set_function(target as u64);
//! rw.config_mut().par_state[0] = Some(ParState::Known); // bind the first argument
//! let specialized = rw.rewrite(&[3, 0]);
//! assert_ne!(specialized, 0);
//! ```

#![warn(missing_docs)]

mod capture;
mod config;
pub mod consts;
mod dbb;
mod emu;
mod error;
mod layout;
mod rewriter;
mod state;
mod storage;

#[cfg(test)]
mod tests;

pub use config::{
    make_dynamic, make_static, FcFlags, FunctionConfig, MemRange, MemRangeKind, ParState,
    RewriterConfig,
};
pub use error::{ErrorKind, ErrorModule, RewriteError, RwResult};
pub use rewriter::Rewriter;
pub use state::{CaptureState, CapVal};
pub use storage::{page_size, CodeStorage};
