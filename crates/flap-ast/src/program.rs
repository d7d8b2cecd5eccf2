//! Top-level program structure

use crate::expr::Expr;
use crate::span::Span;

/// A lambda definition.
///
/// The parser pre-computes the capture list: names referenced in the body
/// that resolve to an enclosing scope. Non-capturing lambdas have an empty
/// list and compile to plain functions.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    /// Stable name; anonymous lambdas are named by the parser
    /// (`lambda_0`, `lambda_1`, ...) in source order.
    pub name: String,
    pub params: Vec<String>,
    /// Captured variable names, in the order the environment block is laid out
    pub captures: Vec<String>,
    pub body: Expr,
    pub span: Span,
}

/// A user library import: `import sdl3 as sdl`.
///
/// The compiler resolves `lib` to a versioned soname for the NEEDED table;
/// calls through the alias namespace become PLT imports.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub lib: String,
    pub alias: String,
    pub span: Span,
}

/// A complete Flap program as delivered by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Source file path, carried into diagnostics
    pub file: String,
    /// Top-level statements, run in order as the body of `main`
    pub stmts: Vec<Expr>,
    /// User library imports
    pub imports: Vec<ImportDecl>,
}

impl Program {
    pub fn new(file: impl Into<String>) -> Self {
        Program { file: file.into(), stmts: Vec::new(), imports: Vec::new() }
    }
}
