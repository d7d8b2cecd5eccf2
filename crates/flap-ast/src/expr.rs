//! Expression AST nodes
//!
//! Flap is expression-oriented: statements are expressions whose value is
//! discarded. This module defines the closed set of variants the compiler
//! is polymorphic over. Every node carries a [`Span`].

use crate::ops::{BinaryOp, CType, PipeKind, UnaryOp};
use crate::program::Lambda;
use crate::span::Span;

/// One arm of a `match`-style expression: a guard and a body.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub guard: Expr,
    pub body: Expr,
}

/// A Flap expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Number literal: 42, 3.14 (all numbers are f64)
    Number { value: f64, span: Span },

    /// String literal: "hello" (UTF-8)
    Str { value: String, span: Span },

    /// List literal: [1, 2, 3]
    List { elems: Vec<Expr>, span: Span },

    /// Map literal: {0: 100, 1: 30}
    MapLit { entries: Vec<(Expr, Expr)>, span: Span },

    /// The empty/nil value
    Nil { span: Span },

    /// Variable reference
    Ident { name: String, span: Span },

    /// Immutable definition: `x = expr`
    Define { name: String, value: Box<Expr>, span: Span },

    /// Mutable definition: `x := expr`
    DefineMut { name: String, value: Box<Expr>, span: Span },

    /// Update of a mutable variable: `x <- expr`
    Update { name: String, value: Box<Expr>, span: Span },

    /// Indexed read: `m[k]`
    Index { target: Box<Expr>, key: Box<Expr>, span: Span },

    /// Indexed write: `m[k] <- v`
    IndexUpdate { target: Box<Expr>, key: Box<Expr>, value: Box<Expr>, span: Span },

    /// Binary operation (including short-circuit and/or)
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr>, span: Span },

    /// Unary operation
    Unary { op: UnaryOp, operand: Box<Expr>, span: Span },

    /// Call by name. The name is already resolved by the parser to a user
    /// lambda, a builtin, or an external symbol (`c.printf` style FFI).
    Call { name: String, args: Vec<Expr>, span: Span },

    /// Indirect call through a variable holding a lambda value
    CallIndirect { target: Box<Expr>, args: Vec<Expr>, span: Span },

    /// Lambda expression; capturing lambdas carry their capture list
    LambdaExpr { lambda: Box<Lambda>, span: Span },

    /// Ordered guard/body arms with optional default: first match wins
    Match { arms: Vec<MatchArm>, default: Option<Box<Expr>>, span: Span },

    /// Range loop: `@ i in a..<b { body }` (parallel when `@@`)
    RangeLoop {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        body: Box<Expr>,
        parallel: bool,
        span: Span,
    },

    /// For-each loop: `@ x in xs { body }` (parallel when `@@`)
    ForEachLoop { var: String, seq: Box<Expr>, body: Box<Expr>, parallel: bool, span: Span },

    /// Infinite loop: `@ { body }` with optional `max N` bound
    InfiniteLoop { body: Box<Expr>, max: Option<u64>, span: Span },

    /// Pipe: `x | f`, `xs || f`, `xs ||| red`
    Pipe { kind: PipeKind, value: Box<Expr>, func: Box<Expr>, span: Span },

    /// Resource scope: `arena { body }` with nested-arena semantics
    Arena { body: Box<Expr>, span: Span },

    /// `defer expr` attached to the enclosing scope
    Defer { expr: Box<Expr>, span: Span },

    /// Postfix move: `x!` - ownership transfer of the 64-bit value
    Move { name: String, span: Span },

    /// FFI cast: `x as i32`, `x as cstr`, ...
    Cast { expr: Box<Expr>, ctype: CType, span: Span },

    /// Error default: `lhs or! rhs` - substitutes rhs when lhs is a
    /// NaN-tagged error value
    OrDefault { value: Box<Expr>, default: Box<Expr>, span: Span },

    /// Early return from the enclosing lambda
    Return { value: Option<Box<Expr>>, span: Span },

    /// Statement sequence; the value is the last expression's value
    Block { exprs: Vec<Expr>, span: Span },
}

impl Expr {
    /// Get the span of this expression
    pub fn span(&self) -> Span {
        match self {
            Expr::Number { span, .. }
            | Expr::Str { span, .. }
            | Expr::List { span, .. }
            | Expr::MapLit { span, .. }
            | Expr::Nil { span }
            | Expr::Ident { span, .. }
            | Expr::Define { span, .. }
            | Expr::DefineMut { span, .. }
            | Expr::Update { span, .. }
            | Expr::Index { span, .. }
            | Expr::IndexUpdate { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Call { span, .. }
            | Expr::CallIndirect { span, .. }
            | Expr::LambdaExpr { span, .. }
            | Expr::Match { span, .. }
            | Expr::RangeLoop { span, .. }
            | Expr::ForEachLoop { span, .. }
            | Expr::InfiniteLoop { span, .. }
            | Expr::Pipe { span, .. }
            | Expr::Arena { span, .. }
            | Expr::Defer { span, .. }
            | Expr::Move { span, .. }
            | Expr::Cast { span, .. }
            | Expr::OrDefault { span, .. }
            | Expr::Return { span, .. }
            | Expr::Block { span, .. } => *span,
        }
    }

    /// True when this expression is a lambda literal.
    pub fn is_lambda(&self) -> bool {
        matches!(self, Expr::LambdaExpr { .. })
    }
}
