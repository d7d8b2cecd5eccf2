//! Compilation options
//!
//! The recognized configuration surface, nothing invented: the
//! optimization timeout and the dependency/include switches are forwarded
//! to their external collaborators (AST-level optimizers, the dependency
//! fetcher, the file gatherer) and do not change code generation.

use flap_codegen::SimdLevel;

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Seconds of wall time allowed for AST-level optimization passes;
    /// 0 disables them. Consumed by the optimizer collaborator.
    pub opt_timeout: u64,
    /// Per-stage diagnostic traces to stderr.
    pub verbose: bool,
    /// Suppress sibling-file auto-inclusion (front-end concern).
    pub single_file: bool,
    /// Re-fetch Git dependencies (dependency-resolver concern).
    pub update_deps: bool,
    /// SIMD level of the emitted runtime helpers (x86-64 only).
    pub simd: SimdLevel,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            opt_timeout: 5,
            verbose: false,
            single_file: false,
            update_deps: false,
            simd: SimdLevel::default(),
        }
    }
}
