//! AST node types for the Flap language
//!
//! This crate is the contract between the parser (an external collaborator)
//! and the compiler: a closed set of expression variants, each carrying a
//! source span. The tree arrives fully resolved - every identifier refers to
//! a declaration in scope or a known external name, and every lambda carries
//! a pre-computed capture list. The tree is immutable during compilation.

pub mod expr;
pub mod ops;
pub mod program;
pub mod span;

pub use expr::{Expr, MatchArm};
pub use ops::{BinaryOp, CType, PipeKind, UnaryOp};
pub use program::{ImportDecl, Lambda, Program};
pub use span::Span;
