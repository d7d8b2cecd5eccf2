//! Emission errors
//!
//! These are the "compiler bug or pathological input" class of failures:
//! unencodable operands, out-of-range branches, symbol-table violations.
//! They are never silently truncated into bad machine code; every encoder
//! range check aborts compilation with the symbol and offset involved.

use thiserror::Error;

pub type EmitResult<T> = Result<T, EmitError>;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("immediate {value:#x} not encodable as {what} at offset {offset:#x}")]
    UnencodableImmediate { value: i64, what: &'static str, offset: usize },

    #[error("branch to `{symbol}` out of range: displacement {disp:#x} exceeds {what}")]
    BranchOutOfRange { symbol: String, disp: i64, what: &'static str },

    #[error("branch displacement {disp:#x} to `{symbol}` not {align}-byte aligned")]
    MisalignedBranch { symbol: String, disp: i64, align: u32 },

    #[error("symbol `{name}` already defined in segment {segment}")]
    DuplicateSymbol { name: String, segment: &'static str },

    #[error("undefined symbol `{name}` at patch offset {offset:#x}")]
    UndefinedSymbol { name: String, offset: usize },

    #[error("symbol `{name}` has no assigned address (segment base not set)")]
    UnresolvedAddress { name: String },

    #[error("stack frame too large: {size} bytes")]
    FrameTooLarge { size: usize },

    #[error("internal emitter error: {message}")]
    Internal { message: String },
}
