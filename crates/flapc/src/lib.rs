//! flapc: the Flap ahead-of-time compiler driver
//!
//! One entry point: [`compile`] takes a typed AST (delivered by the
//! parser collaborator), a target triple, and options, and writes a
//! complete executable image - ELF64, PE32+, or Mach-O - with no external
//! assembler or linker involved. The compiler itself is single-threaded;
//! all sinks, tables, and patch lists are exclusively owned by the
//! driver, and a fatal error aborts the compilation with a located
//! diagnostic.

mod error;
mod options;
mod pipeline;
mod target;

pub use error::{CompileError, CompileResult};
pub use options::CompileOptions;
pub use target::{ObjectFormat, Target};

use flap_ast::Program;
use log::{debug, info};
use std::path::Path;

/// Summary of a successful compilation.
#[derive(Debug, Clone)]
pub struct CompileReport {
    pub image_bytes: usize,
    pub text_bytes: usize,
    pub imports: usize,
}

/// Compile `program` into an executable at `output_path`.
///
/// `target_triple` is a standard triple (`x86_64-unknown-linux-gnu`) or
/// `host`. On failure nothing is written; source errors arrive aggregated
/// (up to the collector's cap), emitter and I/O errors individually.
pub fn compile(
    program: &Program,
    output_path: &Path,
    target_triple: &str,
    options: &CompileOptions,
) -> CompileResult<CompileReport> {
    let target = Target::parse(target_triple)?;
    debug!(
        "compiling {} for {} ({:?}), opt_timeout={}s",
        program.file,
        target_triple,
        target.format,
        options.opt_timeout
    );
    let report = pipeline::run(program, output_path, target, options)?;
    info!(
        "wrote {} ({} bytes, {} text, {} imports)",
        output_path.display(),
        report.image_bytes,
        report.text_bytes,
        report.imports
    );
    Ok(report)
}
