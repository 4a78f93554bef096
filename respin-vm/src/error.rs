//! Rewrite error model: every failure is classified by the module that
//! raised it and a reason kind, with extra context for decode and generate
//! failures.

use core::fmt;

use respin_asm::{ByteWindow, DecodeError, EncodeError};

/// The component that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ErrorModule {
    /// Byte decoding.
    Decoder,
    /// Abstract execution.
    Emulator,
    /// Byte generation and layout.
    Generator,
    /// Captured-block bookkeeping.
    Capture,
    /// Request handling and pool management.
    Rewriter,
}

impl fmt::Display for ErrorModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why an operation failed. The absence of an error is a `Result::Ok`, not a
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ErrorKind {
    /// Unclassified failure.
    Unknown,
    /// The request itself was malformed (no entry set, too many parameters).
    InvalidRequest,
    /// A bounded pool or the code arena ran out of room.
    BufferOverflow,
    /// The instruction is outside the supported subset.
    UnsupportedInstr,
    /// The instruction is supported but this operand combination is not.
    UnsupportedOperands,
    /// Malformed prefix run.
    BadPrefix,
    /// Unrecognized opcode bytes.
    BadOpcode,
    /// Operands are structurally invalid for the operation (e.g. a modified
    /// return address).
    BadOperands,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A failed rewrite.
///
/// `Decode` and `Generate` extend the base module×kind classification with
/// the owning block and position.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RewriteError {
    /// Classified failure without positional context.
    #[error("{module} error: {kind}: {detail}")]
    Plain {
        /// Raising module.
        module: ErrorModule,
        /// Failure kind.
        kind: ErrorKind,
        /// Human-readable context.
        detail: String,
    },
    /// Decoding failed inside a decoded basic block.
    #[error("Decoder error: {kind} in block {block_addr:#x} at +{offset}: [{bytes}]")]
    Decode {
        /// Failure kind.
        kind: ErrorKind,
        /// Start address of the owning decoded block.
        block_addr: u64,
        /// Byte offset of the rejected instruction within the block.
        offset: usize,
        /// Up to 15 bytes of the offending stream.
        bytes: ByteWindow,
    },
    /// Encoding failed for a captured instruction.
    #[error("Generator error: {kind} in block {cbb_addr:#x} instr {index}: {detail}")]
    Generate {
        /// Failure kind.
        kind: ErrorKind,
        /// Source address of the owning captured block.
        cbb_addr: u64,
        /// Index of the instruction within the block.
        index: usize,
        /// Human-readable context.
        detail: String,
    },
}

impl RewriteError {
    /// Classified failure without positional context.
    pub fn plain(module: ErrorModule, kind: ErrorKind, detail: impl Into<String>) -> Self {
        RewriteError::Plain {
            module,
            kind,
            detail: detail.into(),
        }
    }

    /// The module that raised the error.
    pub fn module(&self) -> ErrorModule {
        match self {
            RewriteError::Plain { module, .. } => *module,
            RewriteError::Decode { .. } => ErrorModule::Decoder,
            RewriteError::Generate { .. } => ErrorModule::Generator,
        }
    }

    /// The failure kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RewriteError::Plain { kind, .. }
            | RewriteError::Decode { kind, .. }
            | RewriteError::Generate { kind, .. } => *kind,
        }
    }

    /// Wrap a raw decode failure with its owning block.
    pub fn from_decode(err: DecodeError, block_addr: u64) -> Self {
        let kind = match err {
            DecodeError::BadOpcode { .. } => ErrorKind::BadOpcode,
            DecodeError::BadPrefix { .. } => ErrorKind::BadPrefix,
            DecodeError::Truncated { .. } => ErrorKind::BadOpcode,
        };
        let bytes = match err {
            DecodeError::BadOpcode { window, .. } | DecodeError::BadPrefix { window, .. } => window,
            DecodeError::Truncated { .. } => ByteWindow {
                bytes: [0; respin_asm::MAX_INSTR_LEN],
                len: 0,
            },
        };
        RewriteError::Decode {
            kind,
            block_addr,
            offset: err.offset(),
            bytes,
        }
    }

    /// Wrap an encode failure with the captured block and instruction index.
    pub fn from_encode(err: EncodeError, cbb_addr: u64, index: usize) -> Self {
        let EncodeError::UnsupportedOperands(kind) = err;
        RewriteError::Generate {
            kind: ErrorKind::UnsupportedOperands,
            cbb_addr,
            index,
            detail: format!("{kind:?}"),
        }
    }
}

/// Result alias used across the engine.
pub type RwResult<T> = Result<T, RewriteError>;
