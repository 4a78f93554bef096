//! Atomic x86-64 types of the respin rewriter: registers, operands, typed
//! instructions, and the byte-level decoder and encoder.
//!
//! The crate is deliberately free of rewriting policy. It turns bytes into
//! [`Instr`]s and [`Instr`]s back into bytes; what to keep, fold or re-emit
//! is the engine crate's business.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

mod cond;
mod decode;
mod encode;
#[cfg(test)]
mod encoding_tests;
mod instr;
mod operand;
mod reg;

pub use cond::{Cond, Flag, FlagSet, FLAG_COUNT};
pub use decode::{ByteWindow, DecodeError, Decoder, MAX_INSTR_LEN};
pub use encode::{
    encode, encode_jcc, encode_jmp_rel32, EncodeError, EncodedInstr, MAX_ENC_LEN,
};
pub use instr::{
    Encoding, Instr, InstrForm, InstrKind, Passthrough, Prefixes, StateChange, ValueType, Vex,
};
pub use operand::{MemRef, Operand, Segment};
pub use reg::{gp, is_callee_saved, param_reg, Reg, RegKind, REG_COUNT};
