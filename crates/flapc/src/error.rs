//! Driver errors
//!
//! The three layers of the taxonomy: source errors arrive pre-aggregated
//! from the diagnostics collector (several per report, railway style);
//! emitter errors abort immediately with symbol and offset; I/O errors
//! carry their context verbatim. Nothing panics - everything bubbles to
//! `compile`, which formats and exits nonzero in the CLI collaborator.

use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{count} source error(s):\n{report}")]
    Source { report: String, count: usize },

    #[error("unsupported target triple `{triple}`")]
    UnsupportedTarget { triple: String },

    #[error(transparent)]
    Emit(#[from] flap_codegen::EmitError),

    #[error(transparent)]
    Object(#[from] flap_obj::ObjectError),

    #[error("cannot write `{path}`: {source}")]
    Output {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
