//! Object-writing errors

use thiserror::Error;

pub type ObjectResult<T> = Result<T, ObjectError>;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("unsupported target: {what}")]
    UnsupportedTarget { what: String },

    #[error("library `{lib}` could not be resolved to a soname")]
    LibraryNotFound { lib: String },

    #[error("image layout overflow: {what}")]
    LayoutOverflow { what: &'static str },

    #[error(transparent)]
    Emit(#[from] flap_codegen::EmitError),

    #[error("i/o error writing object: {0}")]
    Io(#[from] std::io::Error),
}
