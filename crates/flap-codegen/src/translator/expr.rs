//! Pass two: expression emission
//!
//! Every expression leaves its value in the float accumulator (xmm0 / d0 /
//! fa0). Binary operands follow the fixed discipline: left into the
//! accumulator, spill, right into the accumulator, reload left into the
//! second float register, apply. Statement-position values are simply
//! ignored in the accumulator.

use super::collect::{
    const_list, const_map, split_format, Callee, FormatPiece, LIT_LIST, LIT_MAP, LIT_NUM,
    LIT_STR_BYTES, LIT_STR_MAP,
};
use super::Translator;
use crate::error::{EmitError, EmitResult};
use crate::isa::Cond;
use crate::regs::Reg;
use crate::sink::ByteSink;
use crate::value;
use flap_ast::{BinaryOp, CType, Expr, PipeKind, UnaryOp};

/// Where a variable lives relative to the current frame.
pub(crate) enum VarRef {
    Local(i32),
    /// Offset within the parent frame of a parallel body.
    Parent(i32),
}

impl<'a> Translator<'a> {
    pub(crate) fn emit_expr(&mut self, s: &mut ByteSink, expr: &'a Expr, tail: bool) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        match expr {
            Expr::Number { value, .. } => self.emit_f64_const(s, *value),
            Expr::Str { value, .. } => {
                let name = self.rodata_name(LIT_STR_MAP, &value::string_bytes(value))?;
                e.lea_symbol(s, r.tmp0, &name)?;
                e.fmov_from_gpr(s, r.facc, r.tmp0)
            }
            Expr::Nil { .. } => self.emit_f64_const(s, 0.0),
            Expr::Ident { name, .. } | Expr::Move { name, .. } => self.emit_var_load(s, name),
            Expr::Define { name, value, .. } => {
                self.emit_binding(s, name, value, false)
            }
            Expr::DefineMut { name, value, .. } => {
                self.emit_binding(s, name, value, true)
            }
            Expr::Update { name, value, .. } => {
                self.emit_expr(s, value, false)?;
                self.emit_var_store(s, name)
            }
            Expr::Index { target, key, .. } => {
                self.emit_expr(s, target, false)?;
                self.spill_acc(s)?;
                self.emit_expr(s, key, false)?;
                self.unspill(s, r.ftmp2)?;
                e.fmov_to_gpr(s, r.int_args[0], r.ftmp2)?;
                self.emit_call_aligned(s, "_flap_map_lookup")
            }
            Expr::IndexUpdate { target, key, value, .. } => {
                self.emit_expr(s, target, false)?;
                self.spill_acc(s)?;
                self.emit_expr(s, key, false)?;
                self.spill_acc(s)?;
                self.emit_expr(s, value, false)?;
                e.fmov(s, r.float_args[1], r.facc)?;
                self.unspill(s, r.float_args[0])?;
                self.unspill(s, r.ftmp2)?;
                e.fmov_to_gpr(s, r.int_args[0], r.ftmp2)?;
                self.emit_call_aligned(s, "_flap_map_update")?;
                self.emit_f64_const(s, 0.0)
            }
            Expr::Binary { op, lhs, rhs, .. } => self.emit_binary(s, *op, lhs, rhs),
            Expr::Unary { op, operand, .. } => {
                self.emit_expr(s, operand, false)?;
                match op {
                    UnaryOp::Neg => e.fneg_(s, r.facc, r.facc),
                    UnaryOp::Not => {
                        self.emit_truthy(s, r.tmp1)?;
                        let e = self.e();
                        e.mov_ri(s, r.tmp0, 1)?;
                        e.xor_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
                        e.cvt_i2f(s, r.facc, r.tmp1)
                    }
                    UnaryOp::BitNot => {
                        e.cvt_f2i(s, r.tmp0, r.facc)?;
                        e.not_(s, r.tmp0)?;
                        e.cvt_i2f(s, r.facc, r.tmp0)
                    }
                }
            }
            Expr::List { elems, .. } => self.emit_list_literal(s, elems, false),
            Expr::MapLit { entries, .. } => self.emit_map_literal(s, entries, false),
            Expr::LambdaExpr { lambda, .. } => self.emit_closure_value(s, lambda),
            Expr::Call { name, args, .. } => {
                let argrefs: Vec<&'a Expr> = args.iter().collect();
                self.emit_call(s, name, &argrefs, tail)
            }
            Expr::CallIndirect { target, args, .. } => {
                self.emit_expr(s, target, false)?;
                let slot = self.alloc_hidden()?;
                let e = self.e();
                e.fstore(s, r.fp, slot, r.facc)?;
                let argrefs: Vec<&'a Expr> = args.iter().collect();
                self.emit_indirect_call(s, slot, &argrefs)
            }
            Expr::Match { arms, default, .. } => {
                let merge = self.fresh_label("match_end");
                for arm in arms {
                    let next = self.fresh_label("match_next");
                    self.emit_expr(s, &arm.guard, false)?;
                    self.emit_truthy(s, r.tmp1)?;
                    self.e().br_zero(s, r.tmp1, &next)?;
                    self.emit_expr(s, &arm.body, tail)?;
                    self.e().jump(s, &merge)?;
                    s.define_label(&next)?;
                }
                match default {
                    Some(d) => self.emit_expr(s, d, tail)?,
                    None => self.emit_f64_const(s, 0.0)?,
                }
                s.define_label(&merge)
            }
            Expr::RangeLoop { var, start, end, body, parallel, .. } => {
                if *parallel {
                    self.emit_parallel_range(s, expr, var, start, end, body)
                } else {
                    self.emit_range_loop(s, var, start, end, body)
                }
            }
            Expr::ForEachLoop { var, seq, body, parallel, .. } => {
                if *parallel {
                    self.emit_parallel_foreach(s, expr, var, seq, body)
                } else {
                    self.emit_foreach_loop(s, var, seq, body)
                }
            }
            Expr::InfiniteLoop { body, max, .. } => self.emit_infinite_loop(s, body, *max),
            Expr::Pipe { kind, value, func, .. } => match kind {
                PipeKind::Apply => self.emit_pipe_apply(s, value, func, tail),
                PipeKind::Map => self.emit_pipe_map(s, value, func),
                PipeKind::Reduce => self.emit_pipe_reduce(s, value, func),
            },
            Expr::Arena { body, .. } => {
                let slot = self.alloc_hidden()?;
                self.emit_call_aligned(s, "_flap_arena_push")?;
                self.push_scope(true);
                self.emit_expr(s, body, false)?;
                let e = self.e();
                e.fstore(s, r.fp, slot, r.facc)?;
                self.pop_scope(s)?;
                self.e().fload(s, r.facc, r.fp, slot)
            }
            Expr::Defer { expr: deferred, .. } => {
                self.scopes
                    .last_mut()
                    .expect("scope stack never empty during emission")
                    .defers
                    .push(deferred);
                self.emit_f64_const(s, 0.0)
            }
            Expr::Cast { expr: inner, ctype, .. } => {
                self.emit_expr(s, inner, false)?;
                self.emit_cast_value(s, *ctype)
            }
            Expr::OrDefault { value, default, .. } => {
                self.emit_expr(s, value, false)?;
                let keep = self.fresh_label("or_keep");
                let e = self.e();
                e.fmov_to_gpr(s, r.tmp0, r.facc)?;
                e.mov_rr(s, r.tmp1, r.tmp0)?;
                e.shr_ri(s, r.tmp1, 32)?;
                e.mov_ri(s, r.result, value::ERROR_HI as i64)?;
                e.br_cmp(s, Cond::Ne, r.tmp1, r.result, &keep)?;
                e.shl_ri(s, r.tmp0, 32)?;
                e.br_zero(s, r.tmp0, &keep)?;
                self.emit_expr(s, default, false)?;
                s.define_label(&keep)
            }
            Expr::Return { value, .. } => {
                match value {
                    Some(v) => self.emit_expr(s, v, false)?,
                    None => self.emit_f64_const(s, 0.0)?,
                }
                let meta_slot = self.fn_meta().retval_slot;
                let exit = self.fn_meta().exit_label.clone();
                let e = self.e();
                e.fstore(s, r.fp, meta_slot, r.facc)?;
                self.run_scope_defers(s, 0)?;
                self.e().fload(s, r.facc, r.fp, meta_slot)?;
                self.e().jump(s, &exit)
            }
            Expr::Block { exprs, .. } => {
                let slot = self.alloc_hidden()?;
                self.push_scope(false);
                if exprs.is_empty() {
                    self.emit_f64_const(s, 0.0)?;
                } else {
                    let last = exprs.len() - 1;
                    for (i, ex) in exprs.iter().enumerate() {
                        self.emit_expr(s, ex, tail && i == last)?;
                    }
                }
                let e = self.e();
                e.fstore(s, r.fp, slot, r.facc)?;
                self.pop_scope(s)?;
                self.e().fload(s, r.facc, r.fp, slot)
            }
        }
    }

    /// Materialize an f64 constant: short bit patterns inline, collected
    /// literals from `.rodata` via a pc-relative load, and synthetic
    /// constants (loop increments, logical results) as full immediates.
    pub(crate) fn emit_f64_const(&mut self, s: &mut ByteSink, v: f64) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let bits = v.to_bits() as i64;
        if i32::try_from(bits).is_ok() {
            e.mov_ri(s, r.tmp0, bits)?;
            return e.fmov_from_gpr(s, r.facc, r.tmp0);
        }
        if let Some(name) = self.rodata_names.get(&(LIT_NUM, v.to_le_bytes().to_vec())).cloned() {
            e.lea_symbol(s, r.tmp0, &name)?;
            return e.fload(s, r.facc, r.tmp0, 0);
        }
        e.mov_ri(s, r.tmp0, bits)?;
        e.fmov_from_gpr(s, r.facc, r.tmp0)
    }

    /// tmp := (facc != 0.0) as 0/1.
    pub(crate) fn emit_truthy(&mut self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        e.mov_ri(s, r.tmp0, 0)?;
        e.fmov_from_gpr(s, r.ftmp, r.tmp0)?;
        e.fset_cmp(s, Cond::Ne, dst, r.facc, r.ftmp)
    }

    pub(crate) fn var_ref(&mut self, name: &str) -> EmitResult<VarRef> {
        if let Some(info) = self.lookup_var(name) {
            return Ok(VarRef::Local(info.offset));
        }
        if let Some(parent) = &self.par_parent {
            if let Some((_, off)) = parent.layout.iter().find(|(n, _)| n == name) {
                return Ok(VarRef::Parent(*off));
            }
        }
        Err(EmitError::Internal { message: format!("unresolved variable `{name}`") })
    }

    pub(crate) fn emit_var_load(&mut self, s: &mut ByteSink, name: &str) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        match self.var_ref(name)? {
            VarRef::Local(off) => e.fload(s, r.facc, r.fp, off),
            VarRef::Parent(off) => {
                let fp_slot = self.par_parent.as_ref().unwrap().fp_slot;
                e.load(s, r.tmp0, r.fp, fp_slot)?;
                e.fload(s, r.facc, r.tmp0, off)
            }
        }
    }

    pub(crate) fn emit_var_store(&mut self, s: &mut ByteSink, name: &str) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        match self.var_ref(name)? {
            VarRef::Local(off) => e.fstore(s, r.fp, off, r.facc),
            VarRef::Parent(off) => {
                let fp_slot = self.par_parent.as_ref().unwrap().fp_slot;
                e.load(s, r.tmp0, r.fp, fp_slot)?;
                e.fstore(s, r.tmp0, off, r.facc)
            }
        }
    }

    fn emit_binding(
        &mut self,
        s: &mut ByteSink,
        name: &str,
        value: &'a Expr,
        mutable: bool,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        // Mutable bindings of constant aggregates copy into the arena.
        match value {
            Expr::List { elems, .. } if mutable && const_list(elems).is_some() => {
                self.emit_list_literal(s, elems, true)?;
            }
            Expr::MapLit { entries, .. } if mutable && const_map(entries).is_some() => {
                self.emit_map_literal(s, entries, true)?;
            }
            _ => self.emit_expr(s, value, false)?,
        }
        let off = self.define_var(name, mutable)?;
        self.e().fstore(s, r.fp, off, r.facc)
    }

    fn emit_binary(
        &mut self,
        s: &mut ByteSink,
        op: BinaryOp,
        lhs: &'a Expr,
        rhs: &'a Expr,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        if op.is_logical() {
            return self.emit_logical(s, op, lhs, rhs);
        }
        self.emit_expr(s, lhs, false)?;
        self.spill_acc(s)?;
        self.emit_expr(s, rhs, false)?;
        self.unspill(s, r.ftmp)?;
        // lhs in ftmp, rhs in facc
        let e = self.e();
        match op {
            BinaryOp::Add => e.fadd(s, r.facc, r.ftmp, r.facc),
            BinaryOp::Sub => e.fsub(s, r.facc, r.ftmp, r.facc),
            BinaryOp::Mul => e.fmul(s, r.facc, r.ftmp, r.facc),
            BinaryOp::Div => {
                let ok = self.fresh_label("div_ok");
                let end = self.fresh_label("div_end");
                e.mov_ri(s, r.tmp0, 0)?;
                e.fmov_from_gpr(s, r.ftmp2, r.tmp0)?;
                e.fset_cmp(s, Cond::Eq, r.tmp1, r.facc, r.ftmp2)?;
                e.br_zero(s, r.tmp1, &ok)?;
                e.mov_ri(s, r.tmp0, value::error_bits(value::TAG_DIV0) as i64)?;
                e.fmov_from_gpr(s, r.facc, r.tmp0)?;
                e.jump(s, &end)?;
                s.define_label(&ok)?;
                e.fdiv(s, r.facc, r.ftmp, r.facc)?;
                s.define_label(&end)
            }
            BinaryOp::Mod => {
                // lhs - trunc(lhs / rhs) * rhs
                e.fdiv(s, r.ftmp2, r.ftmp, r.facc)?;
                e.cvt_f2i(s, r.tmp0, r.ftmp2)?;
                e.cvt_i2f(s, r.ftmp2, r.tmp0)?;
                e.fmul(s, r.ftmp2, r.ftmp2, r.facc)?;
                e.fsub(s, r.facc, r.ftmp, r.ftmp2)
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt
            | BinaryOp::Ge => {
                let cond = match op {
                    BinaryOp::Eq => Cond::Eq,
                    BinaryOp::Ne => Cond::Ne,
                    BinaryOp::Lt => Cond::Lt,
                    BinaryOp::Le => Cond::Le,
                    BinaryOp::Gt => Cond::Gt,
                    _ => Cond::Ge,
                };
                e.fset_cmp(s, cond, r.tmp1, r.ftmp, r.facc)?;
                e.cvt_i2f(s, r.facc, r.tmp1)
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl
            | BinaryOp::Shr => {
                e.cvt_f2i(s, r.tmp0, r.ftmp)?;
                e.cvt_f2i(s, r.tmp1, r.facc)?;
                match op {
                    BinaryOp::BitAnd => e.and_rr(s, r.tmp0, r.tmp0, r.tmp1)?,
                    BinaryOp::BitOr => e.or_rr(s, r.tmp0, r.tmp0, r.tmp1)?,
                    BinaryOp::BitXor => e.xor_rr(s, r.tmp0, r.tmp0, r.tmp1)?,
                    BinaryOp::Shl => e.shl_rr(s, r.tmp0, r.tmp0, r.tmp1)?,
                    _ => e.sar_rr(s, r.tmp0, r.tmp0, r.tmp1)?,
                }
                e.cvt_i2f(s, r.facc, r.tmp0)
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("logical ops handled above"),
        }
    }

    fn emit_logical(
        &mut self,
        s: &mut ByteSink,
        op: BinaryOp,
        lhs: &'a Expr,
        rhs: &'a Expr,
    ) -> EmitResult<()> {
        let r = self.e().regs();
        let short = self.fresh_label("logic_short");
        let end = self.fresh_label("logic_end");
        self.emit_expr(s, lhs, false)?;
        self.emit_truthy(s, r.tmp1)?;
        match op {
            BinaryOp::And => self.e().br_zero(s, r.tmp1, &short)?,
            _ => self.e().br_nonzero(s, r.tmp1, &short)?,
        }
        self.emit_expr(s, rhs, false)?;
        self.emit_truthy(s, r.tmp1)?;
        self.e().cvt_i2f(s, r.facc, r.tmp1)?;
        self.e().jump(s, &end)?;
        s.define_label(&short)?;
        self.emit_f64_const(s, if op == BinaryOp::And { 0.0 } else { 1.0 })?;
        s.define_label(&end)
    }

    /// List literal. Constant lists live in `.rodata`; `copy` forces an
    /// arena clone (mutable binding), non-constant lists are built in place.
    fn emit_list_literal(&mut self, s: &mut ByteSink, elems: &'a [Expr], copy: bool) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        if let Some(folded) = const_list(elems) {
            let bytes = value::list_bytes(&folded);
            let name = self.rodata_name(LIT_LIST, &bytes)?;
            if !copy {
                e.lea_symbol(s, r.tmp0, &name)?;
                return e.fmov_from_gpr(s, r.facc, r.tmp0);
            }
            return self.emit_rodata_clone(s, &name, bytes.len(), bytes.len());
        }

        let slot = self.alloc_hidden()?;
        e.mov_ri(s, r.int_args[0], 8 * (elems.len() as i64 + 1))?;
        self.emit_call_aligned(s, "_flap_arena_alloc")?;
        let e = self.e();
        e.store(s, r.fp, slot, r.result)?;
        e.mov_ri(s, r.tmp0, (elems.len() as f64).to_bits() as i64)?;
        e.fmov_from_gpr(s, r.ftmp, r.tmp0)?;
        e.fstore(s, r.result, 0, r.ftmp)?;
        for (i, elem) in elems.iter().enumerate() {
            self.emit_expr(s, elem, false)?;
            let e = self.e();
            e.load(s, r.tmp0, r.fp, slot)?;
            e.fstore(s, r.tmp0, 8 * (i as i32 + 1), r.facc)?;
        }
        let e = self.e();
        e.load(s, r.tmp0, r.fp, slot)?;
        e.fmov_from_gpr(s, r.facc, r.tmp0)
    }

    /// Map literal; always allocated with growth headroom when built at
    /// runtime so `_flap_map_update` can append.
    fn emit_map_literal(
        &mut self,
        s: &mut ByteSink,
        entries: &'a [(Expr, Expr)],
        copy: bool,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        if let Some(folded) = const_map(entries) {
            let bytes = value::map_bytes(&folded);
            let name = self.rodata_name(LIT_MAP, &bytes)?;
            if !copy {
                e.lea_symbol(s, r.tmp0, &name)?;
                return e.fmov_from_gpr(s, r.facc, r.tmp0);
            }
            let headroom = 8 + 16 * (2 * folded.len() + 4);
            return self.emit_rodata_clone(s, &name, bytes.len(), headroom);
        }

        let slot = self.alloc_hidden()?;
        let headroom = 8 + 16 * (2 * entries.len() as i64 + 4);
        e.mov_ri(s, r.int_args[0], headroom)?;
        self.emit_call_aligned(s, "_flap_arena_alloc")?;
        let e = self.e();
        e.store(s, r.fp, slot, r.result)?;
        e.mov_ri(s, r.tmp0, (entries.len() as f64).to_bits() as i64)?;
        e.fmov_from_gpr(s, r.ftmp, r.tmp0)?;
        e.fstore(s, r.result, 0, r.ftmp)?;
        for (i, (k, v)) in entries.iter().enumerate() {
            self.emit_expr(s, k, false)?;
            let e = self.e();
            e.load(s, r.tmp0, r.fp, slot)?;
            e.fstore(s, r.tmp0, 8 + 16 * i as i32, r.facc)?;
            self.emit_expr(s, v, false)?;
            let e = self.e();
            e.load(s, r.tmp0, r.fp, slot)?;
            e.fstore(s, r.tmp0, 16 + 16 * i as i32, r.facc)?;
        }
        let e = self.e();
        e.load(s, r.tmp0, r.fp, slot)?;
        e.fmov_from_gpr(s, r.facc, r.tmp0)
    }

    /// Arena-allocate `alloc_len` bytes and copy `copy_len` bytes of a
    /// rodata template into it; leaves the clone's address in the
    /// accumulator.
    fn emit_rodata_clone(
        &mut self,
        s: &mut ByteSink,
        name: &str,
        copy_len: usize,
        alloc_len: usize,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        e.mov_ri(s, r.int_args[0], alloc_len as i64)?;
        self.emit_call_aligned(s, "_flap_arena_alloc")?;
        let e = self.e();
        let loop_top = self.fresh_label("clone");
        let loop_end = self.fresh_label("clone_end");
        e.lea_symbol(s, r.tmp0, name)?;
        e.mov_rr(s, r.int_args[2], r.result)?;
        e.mov_ri(s, r.tmp1, (copy_len / 8) as i64)?;
        s.define_label(&loop_top)?;
        e.br_zero(s, r.tmp1, &loop_end)?;
        e.fload(s, r.ftmp, r.tmp0, 0)?;
        e.fstore(s, r.int_args[2], 0, r.ftmp)?;
        e.add_ri(s, r.tmp0, 8)?;
        e.add_ri(s, r.int_args[2], 8)?;
        e.dec(s, r.tmp1)?;
        e.jump(s, &loop_top)?;
        s.define_label(&loop_end)?;
        e.fmov_from_gpr(s, r.facc, r.result)
    }

    /// Build a closure value: `[code_ptr][env_ptr]` cell in the arena.
    fn emit_closure_value(&mut self, s: &mut ByteSink, lambda: &'a flap_ast::Lambda) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let slot = self.alloc_hidden()?;
        if lambda.captures.is_empty() {
            let e = self.e();
            e.mov_ri(s, r.tmp0, 0)?;
            e.store(s, r.fp, slot, r.tmp0)?;
        } else {
            e.mov_ri(s, r.int_args[0], 8 * lambda.captures.len() as i64)?;
            self.emit_call_aligned(s, "_flap_arena_alloc")?;
            for (i, cap) in lambda.captures.iter().enumerate() {
                self.emit_capture_load(s, cap)?;
                let e = self.e();
                e.fstore(s, r.result, 8 * i as i32, r.ftmp)?;
            }
            let e = self.e();
            e.store(s, r.fp, slot, r.result)?;
        }
        let e = self.e();
        e.mov_ri(s, r.int_args[0], 16)?;
        self.emit_call_aligned(s, "_flap_arena_alloc")?;
        let e = self.e();
        e.lea_symbol(s, r.tmp1, &lambda.name)?;
        e.store(s, r.result, 0, r.tmp1)?;
        e.load(s, r.tmp0, r.fp, slot)?;
        e.store(s, r.result, 8, r.tmp0)?;
        e.fmov_from_gpr(s, r.facc, r.result)
    }

    /// Load a captured variable's current value into ftmp without touching
    /// the accumulator's role.
    fn emit_capture_load(&mut self, s: &mut ByteSink, name: &str) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        match self.var_ref(name)? {
            VarRef::Local(off) => e.fload(s, r.ftmp, r.fp, off),
            VarRef::Parent(off) => {
                let fp_slot = self.par_parent.as_ref().unwrap().fp_slot;
                e.load(s, r.tmp0, r.fp, fp_slot)?;
                e.fload(s, r.ftmp, r.tmp0, off)
            }
        }
    }

    pub(crate) fn emit_call(
        &mut self,
        s: &mut ByteSink,
        name: &str,
        args: &[&'a Expr],
        tail: bool,
    ) -> EmitResult<()> {
        match self.classify_call(name) {
            Some(Callee::UserLambda(fname)) => self.emit_user_call(s, &fname, args, tail),
            Some(Callee::Builtin(b)) => self.emit_builtin(s, b, args),
            Some(Callee::Extern(sym, libm)) => self.emit_extern_call(s, &sym, args, libm),
            None => Err(EmitError::Internal { message: format!("unresolved call `{name}`") }),
        }
    }

    fn emit_user_call(
        &mut self,
        s: &mut ByteSink,
        name: &str,
        args: &[&'a Expr],
        tail: bool,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let idx = self.func_index[name];
        let lambda = self.funcs[idx].lambda;
        let captures = lambda.map(|l| l.captures.len()).unwrap_or(0);

        if captures > 0 {
            // Capturing lambdas are invoked through the closure value bound
            // to their name.
            self.emit_var_load(s, name)?;
            let slot = self.alloc_hidden()?;
            self.e().fstore(s, r.fp, slot, r.facc)?;
            return self.emit_indirect_call(s, slot, args);
        }

        let recursive = tail && self.fn_meta().name == name;
        if tail {
            self.tail_calls_total += 1;
        }
        if args.len() > r.float_args.len() {
            return Err(EmitError::Internal { message: format!("too many arguments to {name}") });
        }

        for &arg in args {
            self.emit_expr(s, arg, false)?;
            self.spill_acc(s)?;
        }

        if recursive {
            // Frame reuse: store the new arguments into the parameter slots
            // and jump back to the body.
            self.tail_calls_opt += 1;
            let params = lambda.map(|l| l.params.clone()).unwrap_or_default();
            for pname in params.iter().rev() {
                self.unspill(s, r.ftmp)?;
                let e = self.e();
                match self.var_ref(pname)? {
                    VarRef::Local(off) => e.fstore(s, r.fp, off, r.ftmp)?,
                    VarRef::Parent(_) => {
                        return Err(EmitError::Internal {
                            message: "tail-call parameter outside frame".to_string(),
                        })
                    }
                }
            }
            return self.e().jump(s, &format!("{name}.body"));
        }

        for i in (0..args.len()).rev() {
            self.unspill(s, r.float_args[i])?;
        }
        self.emit_call_aligned(s, name)
    }

    /// Call through a closure cell whose address sits in a frame slot.
    fn emit_indirect_call(&mut self, s: &mut ByteSink, slot: i32, args: &[&'a Expr]) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        if args.len() > r.float_args.len() {
            return Err(EmitError::Internal { message: "too many arguments".to_string() });
        }
        for &arg in args {
            self.emit_expr(s, arg, false)?;
            self.spill_acc(s)?;
        }
        for i in (0..args.len()).rev() {
            self.unspill(s, r.float_args[i])?;
        }
        let e = self.e();
        e.load(s, r.tmp0, r.fp, slot)?;
        e.load(s, r.chain, r.tmp0, 8)?;
        e.load(s, r.tmp0, r.tmp0, 0)?;
        self.emit_call_reg_aligned(s, r.tmp0)
    }

    fn emit_extern_call(
        &mut self,
        s: &mut ByteSink,
        sym: &str,
        args: &[&'a Expr],
        libm: bool,
    ) -> EmitResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum ArgKind {
            Float,
            Int(CType),
            Ptr,
        }
        let e = self.e();
        let r = e.regs();
        let mut kinds = Vec::with_capacity(args.len());
        for &arg in args {
            match arg {
                Expr::Str { value, .. } => {
                    // FFI convenience: string literals pass as C strings.
                    let mut bytes = value.as_bytes().to_vec();
                    bytes.push(0);
                    let name = self.rodata_name(LIT_STR_BYTES, &bytes)?;
                    let e = self.e();
                    e.lea_symbol(s, r.tmp0, &name)?;
                    e.fmov_from_gpr(s, r.facc, r.tmp0)?;
                    kinds.push(ArgKind::Ptr);
                }
                Expr::Cast { expr: inner, ctype, .. } if ctype.is_integer() => {
                    self.emit_expr(s, inner, false)?;
                    kinds.push(ArgKind::Int(*ctype));
                }
                Expr::Cast { expr: inner, ctype: CType::Ptr, .. } => {
                    self.emit_expr(s, inner, false)?;
                    kinds.push(ArgKind::Ptr);
                }
                Expr::Cast { ctype: CType::CStr, .. } => {
                    self.emit_expr(s, arg, false)?;
                    kinds.push(ArgKind::Ptr);
                }
                _ => {
                    self.emit_expr(s, arg, false)?;
                    kinds.push(ArgKind::Float);
                }
            }
            self.spill_acc(s)?;
        }

        let nfloat = kinds.iter().filter(|k| **k == ArgKind::Float).count();
        let mut next_float = nfloat;
        let mut next_int = kinds.len() - nfloat;
        for kind in kinds.iter().rev() {
            match kind {
                ArgKind::Float => {
                    next_float -= 1;
                    self.unspill(s, r.float_args[next_float])?;
                }
                ArgKind::Int(ctype) => {
                    next_int -= 1;
                    self.unspill(s, r.ftmp)?;
                    let e = self.e();
                    e.cvt_f2i(s, r.int_args[next_int], r.ftmp)?;
                    self.emit_int_narrow(s, r.int_args[next_int], *ctype)?;
                }
                ArgKind::Ptr => {
                    next_int -= 1;
                    self.unspill(s, r.ftmp)?;
                    self.e().fmov_to_gpr(s, r.int_args[next_int], r.ftmp)?;
                }
            }
        }
        let e = self.e();
        e.set_vararg_count(s, nfloat as u8)?;
        self.emit_call_plt_aligned(s, sym)?;
        let e = self.e();
        if !libm {
            // Integer/pointer returns re-enter the universal representation.
            e.cvt_i2f(s, r.facc, r.result)?;
        }
        Ok(())
    }

    fn emit_int_narrow(&mut self, s: &mut ByteSink, reg: Reg, ctype: CType) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        match ctype {
            CType::I8 => {
                e.shl_ri(s, reg, 56)?;
                e.sar_ri(s, reg, 56)
            }
            CType::I16 => {
                e.shl_ri(s, reg, 48)?;
                e.sar_ri(s, reg, 48)
            }
            CType::I32 => {
                e.shl_ri(s, reg, 32)?;
                e.sar_ri(s, reg, 32)
            }
            CType::U8 => {
                e.mov_ri(s, r.tmp0, 0xFF)?;
                e.and_rr(s, reg, reg, r.tmp0)
            }
            CType::U16 => {
                e.shl_ri(s, reg, 48)?;
                e.shr_ri(s, reg, 48)
            }
            CType::U32 => {
                e.shl_ri(s, reg, 32)?;
                e.shr_ri(s, reg, 32)
            }
            _ => Ok(()),
        }
    }

    fn emit_cast_value(&mut self, s: &mut ByteSink, ctype: CType) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        match ctype {
            CType::F64 | CType::Ptr => Ok(()),
            CType::F32 => e.fround32(s, r.facc, r.facc),
            CType::CStr => {
                e.fmov_to_gpr(s, r.int_args[0], r.facc)?;
                self.emit_call_aligned(s, "_flap_flap_to_cstr")?;
                self.e().fmov_from_gpr(s, r.facc, r.result)
            }
            _ => {
                e.cvt_f2i(s, r.tmp1, r.facc)?;
                self.emit_int_narrow(s, r.tmp1, ctype)?;
                self.e().cvt_i2f(s, r.facc, r.tmp1)
            }
        }
    }

    fn emit_builtin(&mut self, s: &mut ByteSink, b: &str, args: &[&'a Expr]) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        match b {
            "println" => {
                for &arg in args {
                    self.emit_print_arg(s, arg)?;
                }
                let e = self.e();
                e.lea_symbol(s, r.int_args[0], "_flap_lit_nl")?;
                e.mov_ri(s, r.int_args[1], 1)?;
                self.emit_call_aligned(s, "_flap_print_cstr")?;
                self.emit_f64_const(s, 0.0)
            }
            "printf" => {
                let fmt = match args.first() {
                    Some(Expr::Str { value, .. }) => value.clone(),
                    _ => {
                        return Err(EmitError::Internal {
                            message: "printf format checked in collection".to_string(),
                        })
                    }
                };
                let mut next_arg = 1;
                for piece in split_format(&fmt) {
                    match piece {
                        FormatPiece::Lit(lit) => {
                            let name = self.rodata_name(LIT_STR_BYTES, lit.as_bytes())?;
                            let e = self.e();
                            e.lea_symbol(s, r.int_args[0], &name)?;
                            e.mov_ri(s, r.int_args[1], lit.len() as i64)?;
                            self.emit_call_aligned(s, "_flap_print_cstr")?;
                        }
                        FormatPiece::Value => {
                            if let Some(&arg) = args.get(next_arg) {
                                next_arg += 1;
                                self.emit_expr(s, arg, false)?;
                                self.emit_call_aligned(s, "_flap_print_value")?;
                            }
                        }
                    }
                }
                self.emit_f64_const(s, 0.0)
            }
            "len" => {
                self.emit_single_arg(s, b, args)?;
                let e = self.e();
                e.fmov_to_gpr(s, r.tmp0, r.facc)?;
                e.fload(s, r.facc, r.tmp0, 0)
            }
            "sqrt" => {
                self.emit_single_arg(s, b, args)?;
                self.e().fsqrt(s, r.facc, r.facc)
            }
            "abs" => {
                self.emit_single_arg(s, b, args)?;
                self.e().fabs_(s, r.facc, r.facc)
            }
            "atomic_add" | "atomic_store" | "atomic_load" => self.emit_atomic(s, b, args),
            "spawn" => {
                let fname = match args.first() {
                    Some(Expr::Ident { name, .. }) => name.clone(),
                    _ => {
                        return Err(EmitError::Internal {
                            message: "spawn target checked in collection".to_string(),
                        })
                    }
                };
                let e = self.e();
                e.mov_ri(s, r.int_args[0], 8)?;
                self.emit_call_aligned(s, "_flap_arena_alloc")?;
                let e = self.e();
                e.mov_rr(s, r.int_args[0], r.result)?;
                e.mov_ri(s, r.int_args[1], 0)?;
                e.lea_symbol(s, r.int_args[2], &fname)?;
                e.mov_ri(s, r.int_args[3], 0)?;
                self.emit_call_plt_aligned(s, "pthread_create")?;
                self.emit_f64_const(s, 0.0)
            }
            _ => Err(EmitError::Internal { message: format!("unknown builtin `{b}`") }),
        }
    }

    fn emit_single_arg(&mut self, s: &mut ByteSink, b: &str, args: &[&'a Expr]) -> EmitResult<()> {
        match args.first() {
            Some(&arg) => self.emit_expr(s, arg, false),
            None => Err(EmitError::Internal { message: format!("`{b}` expects one argument") }),
        }
    }

    fn emit_print_arg(&mut self, s: &mut ByteSink, arg: &'a Expr) -> EmitResult<()> {
        let r = self.e().regs();
        if let Expr::Str { value, .. } = arg {
            let name = self.rodata_name(LIT_STR_BYTES, value.as_bytes())?;
            let e = self.e();
            e.lea_symbol(s, r.int_args[0], &name)?;
            e.mov_ri(s, r.int_args[1], value.len() as i64)?;
            self.emit_call_aligned(s, "_flap_print_cstr")
        } else {
            self.emit_expr(s, arg, false)?;
            self.emit_call_aligned(s, "_flap_print_value")
        }
    }

    fn emit_atomic(&mut self, s: &mut ByteSink, b: &str, args: &[&'a Expr]) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let var = match args.first() {
            Some(Expr::Ident { name, .. }) => name.clone(),
            _ => {
                return Err(EmitError::Internal {
                    message: "atomic target checked in collection".to_string(),
                })
            }
        };
        let off = match self.var_ref(&var)? {
            VarRef::Local(off) => off,
            VarRef::Parent(_) => {
                return Err(EmitError::Internal {
                    message: "atomics are rejected inside parallel bodies".to_string(),
                })
            }
        };
        // Address of the slot.
        e.mov_rr(s, r.tmp0, r.fp)?;
        e.add_ri(s, r.tmp0, off)?;
        match b {
            "atomic_load" => {
                e.atomic_load(s, r.tmp1, r.tmp0)?;
                // Slots hold f64 bit patterns.
                e.mov_rr(s, r.result, r.tmp1)?;
                e.fmov_from_gpr(s, r.facc, r.result)
            }
            "atomic_store" => {
                let arg = *args.get(1).ok_or_else(|| EmitError::Internal {
                    message: "atomic_store expects a value".to_string(),
                })?;
                e.push(s, r.tmp0)?;
                self.spill_depth += 1;
                self.emit_expr(s, arg, false)?;
                let e = self.e();
                e.fmov_to_gpr(s, r.tmp1, r.facc)?;
                e.pop(s, r.tmp0)?;
                self.spill_depth -= 1;
                e.atomic_store(s, r.tmp0, r.tmp1)?;
                self.emit_f64_const(s, 0.0)
            }
            _ => {
                // atomic_add on the f64 bit pattern is only meaningful for
                // integer-valued contents; delta converts to an integer.
                let arg = *args.get(1).ok_or_else(|| EmitError::Internal {
                    message: "atomic_add expects a delta".to_string(),
                })?;
                e.push(s, r.tmp0)?;
                self.spill_depth += 1;
                self.emit_expr(s, arg, false)?;
                let e = self.e();
                e.cvt_f2i(s, r.tmp1, r.facc)?;
                e.pop(s, r.tmp0)?;
                self.spill_depth -= 1;
                e.atomic_fetch_add(s, r.result, r.tmp0, r.tmp1)?;
                e.cvt_i2f(s, r.facc, r.result)
            }
        }
    }
}
