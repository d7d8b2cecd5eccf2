//! Pass one: symbol collection
//!
//! Walks the AST without emitting a byte. Registers every function and
//! sizes its frame, interns `.rodata` literals (content-addressed so the
//! second pass finds them regardless of emission order), accumulates the
//! external import set, and performs the source-level checks: undefined
//! names, immutable reassignment, use-after-move, and atomic operations
//! inside `@@` bodies. Idempotent; runs once per compilation.

use super::{FuncDecl, FuncKind, Translator, LIBM_NAMES};
use crate::error::EmitResult;
use crate::value;
use flap_ast::{Expr, Lambda, PipeKind, Program};
use rustc_hash::{FxHashMap, FxHashSet};

/// Rodata literal kinds; part of the interning key so a string used both
/// as a value and as raw print bytes gets two symbols.
pub(crate) const LIT_STR_MAP: u8 = b'm';
pub(crate) const LIT_STR_BYTES: u8 = b'b';
pub(crate) const LIT_LIST: u8 = b'l';
pub(crate) const LIT_MAP: u8 = b'p';
pub(crate) const LIT_NUM: u8 = b'n';

pub(crate) const BUILTINS: &[&str] = &[
    "println", "printf", "len", "sqrt", "abs", "atomic_add", "atomic_store", "atomic_load",
    "spawn",
];

/// How a call by name resolves.
pub(crate) enum Callee {
    UserLambda(String),
    Builtin(&'static str),
    /// PLT import; the bool marks a double-returning libm symbol.
    Extern(String, bool),
}

impl<'a> Translator<'a> {
    /// Classify a call name against the function registry, the builtin set,
    /// and the FFI namespaces (`c.`, import aliases).
    pub(crate) fn classify_call(&self, name: &str) -> Option<Callee> {
        if self.func_index.contains_key(name) {
            return Some(Callee::UserLambda(name.to_string()));
        }
        if let Some(b) = BUILTINS.iter().find(|b| **b == name).copied() {
            return Some(Callee::Builtin(b));
        }
        if let Some((ns, sym)) = name.split_once('.') {
            if ns == "c" {
                return Some(Callee::Extern(sym.to_string(), LIBM_NAMES.contains(&sym)));
            }
            if self.program.imports.iter().any(|imp| imp.alias == ns) {
                return Some(Callee::Extern(sym.to_string(), false));
            }
        }
        None
    }

    pub fn collect(&mut self) -> EmitResult<()> {
        if self.collected {
            return Ok(());
        }
        self.funcs.push(FuncDecl {
            name: "_flap_main".to_string(),
            kind: FuncKind::Main,
            lambda: None,
            par_var: None,
            par_body: None,
        });
        self.func_index.insert("_flap_main".to_string(), 0);

        // Registration pre-pass so forward references resolve.
        let program: &'a Program = self.program;
        let mut reg = Registrar { tr: self, par_seq: 0 };
        for stmt in &program.stmts {
            reg.register(stmt);
        }

        // Checking + frame-sizing pass.
        let mut chk = Checker {
            tr: self,
            scopes: vec![CScope::new(false)],
            in_parallel: false,
        };
        let mut main_slots = 1;
        for stmt in &program.stmts {
            main_slots += chk.walk(stmt);
        }
        self.frame_slots.insert("_flap_main".to_string(), main_slots);
        self.collected = true;
        Ok(())
    }

    /// Intern a literal; the first interning assigns the symbol name.
    pub(crate) fn intern_rodata(&mut self, kind: u8, bytes: Vec<u8>) -> String {
        if let Some(name) = self.rodata_names.get(&(kind, bytes.clone())) {
            return name.clone();
        }
        let prefix = match kind {
            LIT_STR_MAP => "str",
            LIT_STR_BYTES => "strb",
            LIT_LIST => "list",
            LIT_MAP => "map",
            _ => "num",
        };
        let name = format!("{prefix}_{}", self.rodata.len());
        self.rodata.push((name.clone(), bytes.clone()));
        self.rodata_names.insert((kind, bytes), name.clone());
        name
    }
}

/// Fold a list literal whose elements are all number literals.
pub(crate) fn const_list(elems: &[Expr]) -> Option<Vec<f64>> {
    elems
        .iter()
        .map(|e| match e {
            Expr::Number { value, .. } => Some(*value),
            _ => None,
        })
        .collect()
}

/// Fold a map literal whose keys and values are all number literals.
pub(crate) fn const_map(entries: &[(Expr, Expr)]) -> Option<Vec<(f64, f64)>> {
    entries
        .iter()
        .map(|(k, v)| match (k, v) {
            (Expr::Number { value: k, .. }, Expr::Number { value: v, .. }) => Some((*k, *v)),
            _ => None,
        })
        .collect()
}

/// Split a printf format string into literal chunks and `%v` slots.
pub(crate) fn split_format(fmt: &str) -> Vec<FormatPiece> {
    let mut out = Vec::new();
    let mut lit = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('v') => {
                    chars.next();
                    if !lit.is_empty() {
                        out.push(FormatPiece::Lit(std::mem::take(&mut lit)));
                    }
                    out.push(FormatPiece::Value);
                }
                Some('%') => {
                    chars.next();
                    lit.push('%');
                }
                _ => lit.push('%'),
            }
        } else {
            lit.push(c);
        }
    }
    if !lit.is_empty() {
        out.push(FormatPiece::Lit(lit));
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FormatPiece {
    Lit(String),
    Value,
}

// ---- registration pre-pass ----

struct Registrar<'a, 'b> {
    tr: &'b mut Translator<'a>,
    par_seq: u32,
}

impl<'a> Registrar<'a, '_> {
    fn register_lambda(&mut self, lambda: &'a Lambda) {
        if !self.tr.func_index.contains_key(&lambda.name) {
            let idx = self.tr.funcs.len();
            self.tr.funcs.push(FuncDecl {
                name: lambda.name.clone(),
                kind: FuncKind::Lambda,
                lambda: Some(lambda),
                par_var: None,
                par_body: None,
            });
            self.tr.func_index.insert(lambda.name.clone(), idx);
        }
        self.register(&lambda.body);
    }

    fn register_par(&mut self, node: &'a Expr, kind: FuncKind, var: &'a str, body: &'a Expr) {
        let name = format!("__par_{}", self.par_seq);
        self.par_seq += 1;
        let idx = self.tr.funcs.len();
        self.tr.funcs.push(FuncDecl {
            name: name.clone(),
            kind,
            lambda: None,
            par_var: Some(var),
            par_body: Some(body),
        });
        self.tr.func_index.insert(name.clone(), idx);
        self.tr.par_names.insert(node as *const Expr as usize, name);
        self.tr.uses_parallel = true;
        self.register(body);
    }

    fn register(&mut self, e: &'a Expr) {
        match e {
            Expr::LambdaExpr { lambda, .. } => self.register_lambda(lambda),
            Expr::RangeLoop { var, start, end, body, parallel, .. } => {
                self.register(start);
                self.register(end);
                if *parallel {
                    self.register_par(e, FuncKind::ParRange, var, body);
                } else {
                    self.register(body);
                }
            }
            Expr::ForEachLoop { var, seq, body, parallel, .. } => {
                self.register(seq);
                if *parallel {
                    self.register_par(e, FuncKind::ParForEach, var, body);
                } else {
                    self.register(body);
                }
            }
            Expr::List { elems, .. } => elems.iter().for_each(|x| self.register(x)),
            Expr::MapLit { entries, .. } => {
                for (k, v) in entries {
                    self.register(k);
                    self.register(v);
                }
            }
            Expr::Define { value, .. } | Expr::DefineMut { value, .. } | Expr::Update { value, .. } => {
                self.register(value)
            }
            Expr::Index { target, key, .. } => {
                self.register(target);
                self.register(key);
            }
            Expr::IndexUpdate { target, key, value, .. } => {
                self.register(target);
                self.register(key);
                self.register(value);
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.register(lhs);
                self.register(rhs);
            }
            Expr::Unary { operand, .. } => self.register(operand),
            Expr::Call { args, .. } => args.iter().for_each(|x| self.register(x)),
            Expr::CallIndirect { target, args, .. } => {
                self.register(target);
                args.iter().for_each(|x| self.register(x));
            }
            Expr::Match { arms, default, .. } => {
                for arm in arms {
                    self.register(&arm.guard);
                    self.register(&arm.body);
                }
                if let Some(d) = default {
                    self.register(d);
                }
            }
            Expr::InfiniteLoop { body, .. } => self.register(body),
            Expr::Pipe { value, func, .. } => {
                self.register(value);
                self.register(func);
            }
            Expr::Arena { body, .. } => self.register(body),
            Expr::Defer { expr, .. } => self.register(expr),
            Expr::Cast { expr, .. } => self.register(expr),
            Expr::OrDefault { value, default, .. } => {
                self.register(value);
                self.register(default);
            }
            Expr::Return { value, .. } => {
                if let Some(v) = value {
                    self.register(v);
                }
            }
            Expr::Block { exprs, .. } => exprs.iter().for_each(|x| self.register(x)),
            Expr::Number { .. }
            | Expr::Str { .. }
            | Expr::Nil { .. }
            | Expr::Ident { .. }
            | Expr::Move { .. } => {}
        }
    }
}

// ---- checking and frame-sizing pass ----

struct CScope {
    vars: FxHashMap<String, bool>, // name → mutable
    moved: FxHashSet<String>,
    /// Function boundary: name resolution stops here (lambdas); parallel
    /// bodies do not set it, their parent frame stays visible.
    boundary: bool,
}

impl CScope {
    fn new(boundary: bool) -> Self {
        CScope { vars: FxHashMap::default(), moved: FxHashSet::default(), boundary }
    }
}

struct Checker<'a, 'b> {
    tr: &'b mut Translator<'a>,
    scopes: Vec<CScope>,
    in_parallel: bool,
}

impl<'a> Checker<'a, '_> {
    fn resolve(&self, name: &str) -> Option<(usize, bool)> {
        for (depth, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(&mutable) = scope.vars.get(name) {
                return Some((depth, mutable));
            }
            if scope.boundary {
                break;
            }
        }
        None
    }

    fn check_read(&mut self, name: &str, span: flap_ast::Span) {
        match self.resolve(name) {
            None => {
                let msg = format!("undefined variable: `{name}`");
                self.tr.diags.push(
                    crate::diagnostics::Diagnostic::new(self.tr.diags.file(), span, msg)
                        .with_suggestion(format!("define it first: `{name} = ...`")),
                );
            }
            Some((depth, _)) => {
                if self.scopes[depth].moved.contains(name) {
                    let msg = format!("use after move: `{name}`");
                    self.tr.diags.push(
                        crate::diagnostics::Diagnostic::new(self.tr.diags.file(), span, msg)
                            .with_suggestion(format!("reassign `{name}` before reading it")),
                    );
                }
            }
        }
    }

    /// Walk an expression; the return value is the (generous) frame-slot
    /// cost the emitter may allocate for it.
    fn walk(&mut self, e: &'a Expr) -> usize {
        match e {
            Expr::Number { value, .. } => {
                let bits = value.to_bits() as i64;
                if i32::try_from(bits).is_err() {
                    self.tr.intern_rodata(LIT_NUM, value.to_le_bytes().to_vec());
                }
                0
            }
            Expr::Str { value, .. } => {
                self.tr.intern_rodata(LIT_STR_MAP, value::string_bytes(value));
                0
            }
            Expr::Nil { .. } => 0,
            Expr::Ident { name, span } => {
                self.check_read(name, *span);
                0
            }
            Expr::Move { name, span } => {
                self.check_read(name, *span);
                if let Some((depth, _)) = self.resolve(name) {
                    self.scopes[depth].moved.insert(name.clone());
                }
                0
            }
            Expr::Define { name, value, span } => {
                let cost = self.walk(value);
                let scope = self.scopes.last_mut().unwrap();
                if scope.vars.contains_key(name) {
                    let msg = format!("cannot reassign immutable `{name}`");
                    self.tr.diags.push(
                        crate::diagnostics::Diagnostic::new(self.tr.diags.file(), *span, msg)
                            .with_suggestion(format!("declare it mutable: `{name} := ...`")),
                    );
                } else {
                    scope.vars.insert(name.clone(), false);
                }
                1 + cost
            }
            Expr::DefineMut { name, value, .. } => {
                let cost = self.walk(value);
                self.scopes.last_mut().unwrap().vars.insert(name.clone(), true);
                1 + cost
            }
            Expr::Update { name, value, span } => {
                let cost = self.walk(value);
                match self.resolve(name) {
                    None => {
                        let msg = format!("undefined variable: `{name}`");
                        self.tr.diags.error(*span, msg);
                    }
                    Some((depth, mutable)) => {
                        if !mutable {
                            let msg = format!("cannot reassign immutable `{name}`");
                            self.tr.diags.push(
                                crate::diagnostics::Diagnostic::new(
                                    self.tr.diags.file(),
                                    *span,
                                    msg,
                                )
                                .with_suggestion(format!("declare it mutable: `{name} := ...`")),
                            );
                        }
                        self.scopes[depth].moved.remove(name);
                    }
                }
                cost
            }
            Expr::Index { target, key, .. } => self.walk(target) + self.walk(key),
            Expr::IndexUpdate { target, key, value, .. } => {
                self.walk(target) + self.walk(key) + self.walk(value)
            }
            Expr::Binary { lhs, rhs, .. } => self.walk(lhs) + self.walk(rhs),
            Expr::Unary { operand, .. } => self.walk(operand),
            Expr::List { elems, .. } => {
                if let Some(folded) = const_list(elems) {
                    self.tr.intern_rodata(LIT_LIST, value::list_bytes(&folded));
                    0
                } else {
                    1 + elems.iter().map(|x| self.walk(x)).sum::<usize>()
                }
            }
            Expr::MapLit { entries, .. } => {
                if let Some(folded) = const_map(entries) {
                    self.tr.intern_rodata(LIT_MAP, value::map_bytes(&folded));
                    0
                } else {
                    1 + entries.iter().map(|(k, v)| self.walk(k) + self.walk(v)).sum::<usize>()
                }
            }
            Expr::LambdaExpr { lambda, .. } => {
                self.walk_lambda(lambda);
                1
            }
            Expr::Call { name, args, span } => self.walk_call(name, args, *span),
            Expr::CallIndirect { target, args, .. } => {
                1 + self.walk(target) + args.iter().map(|x| self.walk(x)).sum::<usize>()
            }
            Expr::Match { arms, default, .. } => {
                let mut cost = 0;
                for arm in arms {
                    cost += self.walk(&arm.guard);
                    cost += self.walk(&arm.body);
                }
                if let Some(d) = default {
                    cost += self.walk(d);
                }
                cost
            }
            Expr::RangeLoop { var, start, end, body, parallel, .. } => {
                let mut cost = self.walk(start) + self.walk(end);
                if *parallel {
                    self.walk_par_body(e, var, body, None);
                    cost + 6
                } else {
                    self.scopes.push(CScope::new(false));
                    self.scopes.last_mut().unwrap().vars.insert(var.clone(), true);
                    cost += 2 + self.walk(body);
                    self.scopes.pop();
                    cost
                }
            }
            Expr::ForEachLoop { var, seq, body, parallel, .. } => {
                let mut cost = self.walk(seq);
                if *parallel {
                    self.walk_par_body(e, var, body, Some(seq));
                    cost + 6
                } else {
                    self.scopes.push(CScope::new(false));
                    self.scopes.last_mut().unwrap().vars.insert(var.clone(), true);
                    cost += 4 + self.walk(body);
                    self.scopes.pop();
                    cost
                }
            }
            Expr::InfiniteLoop { body, .. } => {
                self.scopes.push(CScope::new(false));
                let cost = 1 + self.walk(body);
                self.scopes.pop();
                cost
            }
            Expr::Pipe { kind, value, func, .. } => {
                let cost = self.walk(value) + self.walk(func);
                match kind {
                    PipeKind::Apply => 1 + cost,
                    PipeKind::Map | PipeKind::Reduce => 8 + cost,
                }
            }
            Expr::Arena { body, .. } => {
                self.scopes.push(CScope::new(false));
                let cost = 1 + self.walk(body);
                self.scopes.pop();
                cost
            }
            Expr::Defer { expr, .. } => self.walk(expr),
            Expr::Cast { expr, .. } => self.walk(expr),
            Expr::OrDefault { value, default, .. } => self.walk(value) + self.walk(default),
            Expr::Return { value, span } => {
                if self.in_parallel {
                    self.tr
                        .diags
                        .error(*span, "return is not allowed inside a parallel loop body");
                }
                value.as_ref().map(|v| self.walk(v)).unwrap_or(0)
            }
            Expr::Block { exprs, .. } => {
                self.scopes.push(CScope::new(false));
                let cost = 1 + exprs.iter().map(|x| self.walk(x)).sum::<usize>();
                self.scopes.pop();
                cost
            }
        }
    }

    fn walk_lambda(&mut self, lambda: &'a Lambda) {
        // Captured names must be visible at the definition site.
        for cap in &lambda.captures {
            self.check_read(cap, lambda.span);
        }
        let saved_parallel = self.in_parallel;
        self.in_parallel = false;
        self.scopes.push(CScope::new(true));
        let scope = self.scopes.last_mut().unwrap();
        for p in &lambda.params {
            scope.vars.insert(p.clone(), true);
        }
        for c in &lambda.captures {
            scope.vars.insert(c.clone(), true);
        }
        let cost = 1 + lambda.params.len() + lambda.captures.len() + self.walk(&lambda.body);
        self.scopes.pop();
        self.in_parallel = saved_parallel;
        self.tr.frame_slots.insert(lambda.name.clone(), cost);
    }

    fn walk_par_body(&mut self, node: &'a Expr, var: &str, body: &'a Expr, _seq: Option<&'a Expr>) {
        let name = self.tr.par_names[&(node as *const Expr as usize)].clone();
        let saved = self.in_parallel;
        self.in_parallel = true;
        // Parent frame stays visible: no boundary.
        self.scopes.push(CScope::new(false));
        self.scopes.last_mut().unwrap().vars.insert(var.to_string(), true);
        let cost = 8 + self.walk(body);
        self.scopes.pop();
        self.in_parallel = saved;
        self.tr.frame_slots.insert(name, cost);
    }

    fn walk_call(&mut self, name: &str, args: &'a [Expr], span: flap_ast::Span) -> usize {
        let callee = self.tr.classify_call(name);
        match callee {
            None => {
                let msg = format!("undefined function: `{name}`");
                self.tr.diags.error(span, msg);
                args.iter().map(|x| self.walk(x)).sum()
            }
            Some(Callee::Extern(sym, libm)) => {
                self.tr.externs.insert(sym);
                if libm {
                    self.tr.uses_libm = true;
                }
                let mut cost = 0;
                for arg in args {
                    if let Expr::Str { value, .. } = arg {
                        // FFI string arguments become zero-terminated bytes.
                        let mut bytes = value.as_bytes().to_vec();
                        bytes.push(0);
                        self.tr.intern_rodata(LIT_STR_BYTES, bytes);
                    } else {
                        cost += self.walk(arg);
                    }
                }
                cost
            }
            Some(Callee::Builtin(b)) => self.walk_builtin(b, args, span),
            // The extra slot covers the closure-cell spill when the callee
            // captures.
            Some(Callee::UserLambda(_)) => 1 + args.iter().map(|x| self.walk(x)).sum::<usize>(),
        }
    }

    fn walk_builtin(&mut self, b: &str, args: &'a [Expr], span: flap_ast::Span) -> usize {
        match b {
            "println" => {
                let mut cost = 0;
                for arg in args {
                    if let Expr::Str { value, .. } = arg {
                        self.tr.intern_rodata(LIT_STR_BYTES, value.as_bytes().to_vec());
                    } else {
                        cost += self.walk(arg);
                    }
                }
                cost
            }
            "printf" => {
                let mut cost = 0;
                match args.first() {
                    Some(Expr::Str { value, .. }) => {
                        for piece in split_format(value) {
                            if let FormatPiece::Lit(lit) = piece {
                                self.tr.intern_rodata(LIT_STR_BYTES, lit.into_bytes());
                            }
                        }
                    }
                    _ => {
                        self.tr.diags.error(span, "printf format must be a string literal");
                    }
                }
                for arg in args.iter().skip(1) {
                    cost += self.walk(arg);
                }
                cost
            }
            "atomic_add" | "atomic_store" | "atomic_load" => {
                if self.in_parallel {
                    let msg = format!(
                        "`{b}` is not allowed inside a `@@` parallel loop body; \
                         atomic operations are restricted to sequential loops"
                    );
                    self.tr.diags.error(span, msg);
                }
                match args.first() {
                    Some(Expr::Ident { name, span }) => self.check_read(name, *span),
                    _ => self.tr.diags.error(span, format!("`{b}` expects a variable")),
                }
                args.iter().skip(1).map(|x| self.walk(x)).sum()
            }
            "spawn" => {
                self.tr.uses_parallel = true;
                match args.first() {
                    Some(Expr::Ident { name, .. })
                        if self.tr.func_index.contains_key(name.as_str()) => {}
                    _ => {
                        self.tr.diags.error(
                            span,
                            "spawn expects the name of a non-capturing lambda",
                        );
                    }
                }
                0
            }
            _ => args.iter().map(|x| self.walk(x)).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::SimdLevel;
    use crate::isa::Isa;
    use flap_ast::{BinaryOp, Span};

    fn sp() -> Span {
        Span::new(1, 1)
    }

    fn num(v: f64) -> Expr {
        Expr::Number { value: v, span: sp() }
    }

    fn ident(n: &str) -> Expr {
        Expr::Ident { name: n.to_string(), span: sp() }
    }

    fn program(stmts: Vec<Expr>) -> Program {
        Program { file: "t.flap".to_string(), stmts, imports: vec![] }
    }

    fn collect(p: &Program) -> Translator<'_> {
        let mut tr = Translator::new(Isa::X86_64, SimdLevel::Scalar, p);
        tr.collect().unwrap();
        tr
    }

    #[test]
    fn test_undefined_variable_reported() {
        let p = program(vec![ident("nope")]);
        let tr = collect(&p);
        assert!(tr.diagnostics().has_errors());
        assert!(tr.diagnostics().report().contains("undefined variable"));
    }

    #[test]
    fn test_use_after_move_reported() {
        let p = program(vec![
            Expr::Define { name: "x".to_string(), value: Box::new(num(1.0)), span: sp() },
            Expr::Move { name: "x".to_string(), span: sp() },
            Expr::Ident { name: "x".to_string(), span: sp() },
        ]);
        let tr = collect(&p);
        assert!(tr.diagnostics().report().contains("use after move"));
    }

    #[test]
    fn test_reassignment_after_move_clears_it() {
        let p = program(vec![
            Expr::DefineMut { name: "x".to_string(), value: Box::new(num(1.0)), span: sp() },
            Expr::Move { name: "x".to_string(), span: sp() },
            Expr::Update { name: "x".to_string(), value: Box::new(num(2.0)), span: sp() },
            ident("x"),
        ]);
        let tr = collect(&p);
        assert!(!tr.diagnostics().has_errors());
    }

    #[test]
    fn test_immutable_reassignment_reported() {
        let p = program(vec![
            Expr::Define { name: "x".to_string(), value: Box::new(num(1.0)), span: sp() },
            Expr::Update { name: "x".to_string(), value: Box::new(num(2.0)), span: sp() },
        ]);
        let tr = collect(&p);
        assert!(tr.diagnostics().report().contains("immutable"));
    }

    #[test]
    fn test_atomic_in_parallel_rejected() {
        let body = Expr::Call {
            name: "atomic_add".to_string(),
            args: vec![ident("total"), num(1.0)],
            span: sp(),
        };
        let p = program(vec![
            Expr::DefineMut { name: "total".to_string(), value: Box::new(num(0.0)), span: sp() },
            Expr::RangeLoop {
                var: "i".to_string(),
                start: Box::new(num(0.0)),
                end: Box::new(num(10.0)),
                body: Box::new(body),
                parallel: true,
                span: sp(),
            },
        ]);
        let tr = collect(&p);
        assert!(tr.diagnostics().report().contains("parallel loop"));
    }

    #[test]
    fn test_atomic_in_sequential_loop_allowed() {
        let body = Expr::Call {
            name: "atomic_add".to_string(),
            args: vec![ident("total"), num(1.0)],
            span: sp(),
        };
        let p = program(vec![
            Expr::DefineMut { name: "total".to_string(), value: Box::new(num(0.0)), span: sp() },
            Expr::RangeLoop {
                var: "i".to_string(),
                start: Box::new(num(0.0)),
                end: Box::new(num(10.0)),
                body: Box::new(body),
                parallel: false,
                span: sp(),
            },
        ]);
        let tr = collect(&p);
        assert!(!tr.diagnostics().has_errors());
    }

    #[test]
    fn test_ffi_call_collects_extern_and_libm() {
        let p = program(vec![Expr::Call {
            name: "c.pow".to_string(),
            args: vec![num(2.0), num(10.0)],
            span: sp(),
        }]);
        let tr = collect(&p);
        assert!(tr.extern_imports().contains(&"pow".to_string()));
        assert!(tr.uses_libm());
    }

    #[test]
    fn test_parallel_loop_registers_worker_body() {
        let p = program(vec![Expr::RangeLoop {
            var: "i".to_string(),
            start: Box::new(num(0.0)),
            end: Box::new(num(100.0)),
            body: Box::new(num(0.0)),
            parallel: true,
            span: sp(),
        }]);
        let tr = collect(&p);
        assert!(tr.uses_parallel());
        assert!(tr.func_index.contains_key("__par_0"));
        assert!(tr.extern_imports().contains(&"pthread_create".to_string()));
    }

    #[test]
    fn test_const_literals_interned_once() {
        let p = program(vec![
            Expr::Define {
                name: "a".to_string(),
                value: Box::new(Expr::List { elems: vec![num(1.0), num(2.0)], span: sp() }),
                span: sp(),
            },
            Expr::Define {
                name: "b".to_string(),
                value: Box::new(Expr::List { elems: vec![num(1.0), num(2.0)], span: sp() }),
                span: sp(),
            },
        ]);
        let tr = collect(&p);
        let lists: Vec<_> =
            tr.rodata.iter().filter(|(n, _)| n.starts_with("list_")).collect();
        assert_eq!(lists.len(), 1);
    }

    #[test]
    fn test_split_format() {
        let pieces = split_format("%v,%v\n");
        assert_eq!(
            pieces,
            vec![
                FormatPiece::Value,
                FormatPiece::Lit(",".to_string()),
                FormatPiece::Value,
                FormatPiece::Lit("\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_binary_walk_costs_no_slots() {
        let p = program(vec![Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(num(1.0)),
            rhs: Box::new(num(2.0)),
            span: sp(),
        }]);
        let tr = collect(&p);
        // main: retval slot only
        assert_eq!(tr.frame_slots["_flap_main"], 1);
    }
}
