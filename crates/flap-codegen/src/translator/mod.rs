//! AST-to-code translation
//!
//! The translator runs in two phases. [`Translator::collect`] walks the
//! tree once without emitting a byte: it registers every function (the
//! top-level body, each lambda, each parallel-loop body), sizes their
//! frames, gathers `.rodata` literals and external imports, and performs
//! the source-level checks (undefined names, immutable reassignment,
//! use-after-move, atomics inside `@@`). [`Translator::emit`] then lowers
//! everything to machine code against the fixed register convention.
//!
//! The driver runs `emit` twice - first against estimated data addresses,
//! then against the final layout. Everything `emit` mutates lives in the
//! per-emission state and is recreated by [`Translator::reset_emission`],
//! so the second pass is a pure function of the AST and the address map;
//! the instruction stream keeps every label at the same offset across the
//! two passes.

mod collect;
mod expr;
mod loops;

use crate::diagnostics::Diagnostics;
use crate::error::{EmitError, EmitResult};
use crate::helpers::{HelperLib, SimdLevel, LIBC_IMPORTS};
use crate::isa::{Emitter, Isa};
use crate::sink::ByteSink;
use flap_ast::{Expr, Lambda, Program};
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Worker count for `@@` loops (main thread included).
pub const PARALLEL_WORKERS: i64 = 4;

/// libm symbols recognized in the `c.` namespace; importing any of them
/// adds `libm.so.6` to the NEEDED list and marks the call double-returning.
pub const LIBM_NAMES: &[&str] = &[
    "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "exp", "log", "log2", "log10", "pow",
    "fmod", "floor", "ceil", "round", "sqrt", "cbrt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FuncKind {
    /// Top-level statements compiled as `_flap_main`
    Main,
    /// A user lambda
    Lambda,
    /// Synthesized body of a parallel range loop
    ParRange,
    /// Synthesized body of a parallel for-each loop
    ParForEach,
}

pub(crate) struct FuncDecl<'a> {
    pub name: String,
    pub kind: FuncKind,
    pub lambda: Option<&'a Lambda>,
    /// Loop variable of a parallel body
    pub par_var: Option<&'a str>,
    /// Body expression (parallel bodies; lambdas carry theirs)
    pub par_body: Option<&'a Expr>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VarInfo {
    pub offset: i32,
    pub mutable: bool,
}

pub(crate) struct Scope<'a> {
    pub vars: FxHashMap<String, VarInfo>,
    pub defers: Vec<&'a Expr>,
    pub is_arena: bool,
}

impl<'a> Scope<'a> {
    fn new(is_arena: bool) -> Self {
        Scope { vars: FxHashMap::default(), defers: Vec::new(), is_arena }
    }
}

pub struct Translator<'a> {
    pub(crate) isa: Isa,
    pub(crate) simd: SimdLevel,
    pub(crate) program: &'a Program,
    pub(crate) diags: Diagnostics,

    // ---- collection results, stable across emission passes ----
    pub(crate) funcs: Vec<FuncDecl<'a>>,
    pub(crate) func_index: FxHashMap<String, usize>,
    pub(crate) frame_slots: FxHashMap<String, usize>,
    pub(crate) rodata: Vec<(String, Vec<u8>)>,
    /// (kind, content) → rodata symbol name; collect assigns names in walk
    /// order, emission looks contents up, so deferred expressions cannot
    /// desynchronize the passes.
    pub(crate) rodata_names: FxHashMap<(u8, Vec<u8>), String>,
    /// Parallel-body function names keyed by the loop node's address.
    pub(crate) par_names: FxHashMap<usize, String>,
    pub(crate) externs: BTreeSet<String>,
    pub(crate) uses_parallel: bool,
    pub(crate) uses_libm: bool,
    collected: bool,

    // ---- per-emission state, recreated between passes ----
    pub(crate) label_counter: u32,
    pub(crate) spill_depth: u32,
    pub(crate) scopes: Vec<Scope<'a>>,
    pub(crate) next_slot: usize,
    pub(crate) cur_fn: usize,
    /// Flattened parent-frame layouts for parallel bodies, keyed by the
    /// body's function name; recorded at the `@@` site during emission.
    pub(crate) par_layouts: FxHashMap<String, Vec<(String, i32)>>,
    pub(crate) tail_calls_opt: u32,
    pub(crate) tail_calls_total: u32,
    /// Set while emitting inside a `@@` body (worker function).
    pub(crate) in_parallel_body: bool,
    /// Parent-frame access info while emitting a parallel body.
    pub(crate) par_parent: Option<ParParent>,
    /// Exit label and return-value slot of the function being emitted.
    fn_meta: Option<FnMeta>,
}

/// How a parallel body reaches its parent's frame: the slot holding the
/// parent frame pointer, and the parent's visible variable layout.
pub(crate) struct ParParent {
    pub fp_slot: i32,
    pub layout: Vec<(String, i32)>,
}

impl<'a> Translator<'a> {
    pub fn new(isa: Isa, simd: SimdLevel, program: &'a Program) -> Self {
        Translator {
            isa,
            simd,
            program,
            diags: Diagnostics::new(&program.file),
            funcs: Vec::new(),
            func_index: FxHashMap::default(),
            frame_slots: FxHashMap::default(),
            rodata: Vec::new(),
            rodata_names: FxHashMap::default(),
            par_names: FxHashMap::default(),
            externs: BTreeSet::new(),
            uses_parallel: false,
            uses_libm: false,
            collected: false,
            label_counter: 0,
            spill_depth: 0,
            scopes: Vec::new(),
            next_slot: 0,
            cur_fn: 0,
            par_layouts: FxHashMap::default(),
            tail_calls_opt: 0,
            tail_calls_total: 0,
            in_parallel_body: false,
            par_parent: None,
            fn_meta: None,
        }
    }

    pub(crate) fn e(&self) -> &'static dyn Emitter {
        self.isa.emitter()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diags
    }

    /// Collected `.rodata` items, including the helper library's.
    pub fn rodata_items(&self) -> Vec<(String, Vec<u8>)> {
        let lib = HelperLib::new(self.isa, self.simd);
        let mut items: Vec<(String, Vec<u8>)> =
            lib.rodata_items().into_iter().map(|(n, b)| (n.to_string(), b)).collect();
        items.extend(self.rodata.iter().cloned());
        items
    }

    /// Zero-initialized `.data` cells (all owned by the helper library).
    pub fn data_items(&self) -> Vec<(String, usize)> {
        let lib = HelperLib::new(self.isa, self.simd);
        lib.data_items().into_iter().map(|(n, sz)| (n.to_string(), sz)).collect()
    }

    /// External functions imported through the PLT, sorted.
    pub fn extern_imports(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.externs.clone();
        for name in LIBC_IMPORTS {
            all.insert((*name).to_string());
        }
        if self.uses_parallel {
            all.insert("pthread_create".to_string());
        }
        all.into_iter().collect()
    }

    pub fn uses_parallel(&self) -> bool {
        self.uses_parallel
    }

    pub fn uses_libm(&self) -> bool {
        self.uses_libm
    }

    /// Reset every piece of per-emission state. Run between the two
    /// emission passes; forgetting any field here makes the passes diverge.
    pub fn reset_emission(&mut self) {
        self.label_counter = 0;
        self.spill_depth = 0;
        self.scopes.clear();
        self.next_slot = 0;
        self.cur_fn = 0;
        self.par_layouts.clear();
        self.tail_calls_opt = 0;
        self.tail_calls_total = 0;
        self.in_parallel_body = false;
        self.par_parent = None;
        self.fn_meta = None;
    }

    /// Emit the whole `.text` segment: entry stub, helper library, the main
    /// body, user lambdas, and parallel-loop bodies, in that order.
    pub fn emit(&mut self, text: &mut ByteSink) -> EmitResult<()> {
        if !self.collected {
            return Err(EmitError::Internal { message: "emit before collect".to_string() });
        }
        debug!("emitting text for {}", self.isa.name());
        self.emit_start(text)?;

        let lib = HelperLib::new(self.isa, self.simd);
        lib.emit(text)?;

        for idx in 0..self.funcs.len() {
            self.emit_function(text, idx)?;
        }

        if self.tail_calls_total > 0 {
            info!(
                "tail calls optimized: {}/{}",
                self.tail_calls_opt, self.tail_calls_total
            );
        }
        Ok(())
    }

    /// `_start`: align, initialize the runtime, run the main body, exit(0).
    fn emit_start(&mut self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        s.define_label("_start")?;
        e.call_label(s, "_flap_init")?;
        e.call_label(s, "_flap_main")?;
        e.mov_ri(s, r.syscall_args[0], 0)?;
        let nr_exit = match self.isa {
            Isa::X86_64 => 60,
            Isa::Aarch64 | Isa::Riscv64 => 93,
        };
        e.mov_ri(s, r.syscall_nr, nr_exit)?;
        e.syscall(s)
    }

    fn emit_function(&mut self, s: &mut ByteSink, idx: usize) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        self.cur_fn = idx;
        self.next_slot = 0;
        self.scopes.clear();
        self.scopes.push(Scope::new(false));

        let decl = &self.funcs[idx];
        let name = decl.name.clone();
        let kind = decl.kind;
        let slots = *self.frame_slots.get(&name).unwrap_or(&8);
        let frame = ((slots * 8 + 15) & !15) as u32;

        s.define_label(&name)?;
        e.prologue(s, frame)?;

        match kind {
            FuncKind::Main => {
                // Function-exit label for early returns.
                let exit = self.fresh_label("fn_exit");
                let retval = self.alloc_hidden()?;
                self.push_fn_meta(name.clone(), exit.clone(), retval);
                let program = self.program;
                let stmts: &'a [Expr] = program.stmts.as_slice();
                let last = stmts.len().saturating_sub(1);
                for (i, stmt) in stmts.iter().enumerate() {
                    self.emit_expr(s, stmt, i == last)?;
                }
                self.run_scope_defers(s, 0)?;
                s.define_label(&exit)?;
            }
            FuncKind::Lambda => {
                let lambda = self.funcs[idx].lambda.unwrap();
                let exit = self.fresh_label("fn_exit");
                let retval = self.alloc_hidden()?;
                self.push_fn_meta(name.clone(), exit.clone(), retval);

                // Spill parameters into their slots.
                for (i, param) in lambda.params.iter().enumerate() {
                    if i >= r.float_args.len() {
                        return Err(EmitError::Internal {
                            message: format!("too many parameters in {name}"),
                        });
                    }
                    let off = self.define_var(param, true)?;
                    e.fstore(s, r.fp, off, r.float_args[i])?;
                }
                // Copy captured values out of the environment block.
                if !lambda.captures.is_empty() {
                    for (i, cap) in lambda.captures.iter().enumerate() {
                        let off = self.define_var(cap, true)?;
                        e.fload(s, r.ftmp, r.chain, (i * 8) as i32)?;
                        e.fstore(s, r.fp, off, r.ftmp)?;
                    }
                }
                let body_label = format!("{name}.body");
                s.define_label(&body_label)?;
                self.emit_expr(s, &lambda.body, true)?;
                self.run_scope_defers(s, 0)?;
                s.define_label(&exit)?;
            }
            FuncKind::ParRange | FuncKind::ParForEach => {
                self.emit_par_body(s, idx)?;
            }
        }

        e.epilogue(s)?;
        self.pop_fn_meta();
        Ok(())
    }

    // ---- function metadata used by Return emission ----

    pub(crate) fn push_fn_meta(&mut self, name: String, exit: String, retval: i32) {
        self.fn_meta = Some(FnMeta { name, exit_label: exit, retval_slot: retval });
    }

    fn pop_fn_meta(&mut self) {
        self.fn_meta = None;
    }

    // ---- scope and slot management ----

    pub(crate) fn push_scope(&mut self, is_arena: bool) {
        self.scopes.push(Scope::new(is_arena));
    }

    /// Emit the scope's defers (LIFO), an arena pop where the scope owns
    /// one, and pop it.
    pub(crate) fn pop_scope(&mut self, s: &mut ByteSink) -> EmitResult<()> {
        let scope = self.scopes.last().expect("scope stack never empty during emission");
        let defers: Vec<&'a Expr> = scope.defers.clone();
        let is_arena = scope.is_arena;
        for &d in defers.iter().rev() {
            self.emit_expr(s, d, false)?;
        }
        if is_arena {
            self.emit_call_aligned(s, "_flap_arena_pop")?;
        }
        self.scopes.pop();
        Ok(())
    }

    /// Emit defers of every scope down to (and including) `until_depth`,
    /// without popping - used on early-return paths.
    pub(crate) fn run_scope_defers(&mut self, s: &mut ByteSink, until_depth: usize) -> EmitResult<()> {
        for depth in (until_depth..self.scopes.len()).rev() {
            let defers: Vec<&'a Expr> = self.scopes[depth].defers.clone();
            for &d in defers.iter().rev() {
                self.emit_expr(s, d, false)?;
            }
            if self.scopes[depth].is_arena {
                self.emit_call_aligned(s, "_flap_arena_pop")?;
            }
        }
        Ok(())
    }

    pub(crate) fn alloc_slot(&mut self) -> EmitResult<i32> {
        self.next_slot += 1;
        let cap = *self.frame_slots.get(&self.funcs[self.cur_fn].name).unwrap_or(&0);
        if self.next_slot > cap {
            return Err(EmitError::FrameTooLarge { size: self.next_slot * 8 });
        }
        Ok(-((self.next_slot * 8) as i32))
    }

    pub(crate) fn alloc_hidden(&mut self) -> EmitResult<i32> {
        self.alloc_slot()
    }

    pub(crate) fn define_var(&mut self, name: &str, mutable: bool) -> EmitResult<i32> {
        let offset = self.alloc_slot()?;
        self.scopes
            .last_mut()
            .expect("scope stack never empty during emission")
            .vars
            .insert(name.to_string(), VarInfo { offset, mutable });
        Ok(offset)
    }

    pub(crate) fn lookup_var(&self, name: &str) -> Option<VarInfo> {
        for scope in self.scopes.iter().rev() {
            if let Some(info) = scope.vars.get(name) {
                return Some(*info);
            }
        }
        None
    }

    /// Visible variables flattened innermost-last, for parallel-body
    /// parent-frame access.
    pub(crate) fn flatten_scope(&self) -> Vec<(String, i32)> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for scope in self.scopes.iter().rev() {
            let mut entries: Vec<(&String, &VarInfo)> = scope.vars.iter().collect();
            entries.sort_unstable_by_key(|(n, _)| n.as_str());
            for (name, info) in entries {
                if seen.insert(name.clone()) {
                    out.push((name.clone(), info.offset));
                }
            }
        }
        out
    }

    pub(crate) fn fresh_label(&mut self, what: &str) -> String {
        let n = self.label_counter;
        self.label_counter += 1;
        format!(".L{what}_{n}")
    }

    /// Look up the rodata symbol assigned during collection.
    pub(crate) fn rodata_name(&self, kind: u8, bytes: &[u8]) -> EmitResult<String> {
        self.rodata_names
            .get(&(kind, bytes.to_vec()))
            .cloned()
            .ok_or_else(|| EmitError::Internal {
                message: "literal missing from collection pass".to_string(),
            })
    }

    /// Parallel-body name assigned during collection, keyed by node address.
    pub(crate) fn par_name(&self, expr: &Expr) -> EmitResult<String> {
        self.par_names
            .get(&(expr as *const Expr as usize))
            .cloned()
            .ok_or_else(|| EmitError::Internal {
                message: "parallel body missing from collection pass".to_string(),
            })
    }

    // ---- call helpers keeping x86-64 16-byte alignment ----

    /// Direct call with stack realignment when an odd number of 8-byte
    /// spills is outstanding (x86-64 only; the other ISAs spill in
    /// 16-byte quanta).
    pub(crate) fn emit_call_aligned(&mut self, s: &mut ByteSink, label: &str) -> EmitResult<()> {
        let e = self.e();
        let pad = e.spill_misaligns() && self.spill_depth % 2 == 1;
        if pad {
            e.sp_adjust(s, -8)?;
        }
        e.call_label(s, label)?;
        if pad {
            e.sp_adjust(s, 8)?;
        }
        Ok(())
    }

    pub(crate) fn emit_call_plt_aligned(&mut self, s: &mut ByteSink, symbol: &str) -> EmitResult<()> {
        let e = self.e();
        let pad = e.spill_misaligns() && self.spill_depth % 2 == 1;
        if pad {
            e.sp_adjust(s, -8)?;
        }
        e.call_plt(s, symbol)?;
        if pad {
            e.sp_adjust(s, 8)?;
        }
        Ok(())
    }

    pub(crate) fn emit_call_reg_aligned(&mut self, s: &mut ByteSink, r: crate::regs::Reg) -> EmitResult<()> {
        let e = self.e();
        let pad = e.spill_misaligns() && self.spill_depth % 2 == 1;
        if pad {
            e.sp_adjust(s, -8)?;
        }
        e.call_reg(s, r)?;
        if pad {
            e.sp_adjust(s, 8)?;
        }
        Ok(())
    }

    pub(crate) fn spill_acc(&mut self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        e.fpush(s, e.regs().facc)?;
        self.spill_depth += 1;
        Ok(())
    }

    pub(crate) fn unspill(&mut self, s: &mut ByteSink, into: crate::regs::FReg) -> EmitResult<()> {
        let e = self.e();
        e.fpop(s, into)?;
        self.spill_depth -= 1;
        Ok(())
    }
}

/// Metadata of the function currently being emitted.
pub(crate) struct FnMeta {
    pub name: String,
    pub exit_label: String,
    pub retval_slot: i32,
}

impl<'a> Translator<'a> {
    pub(crate) fn fn_meta(&self) -> &FnMeta {
        self.fn_meta.as_ref().expect("fn_meta set during function emission")
    }
}
