//! Loop and pipe lowering
//!
//! Sequential loops are increment-compare-branch over frame slots. The
//! parallel forms compile their body into a synthesized worker function
//! taking a descriptor `[start][end][parent_fp][seq]`; the parent
//! statically partitions the index range across `PARALLEL_WORKERS`
//! workers, spawns all but the last through pthread_create, runs the last
//! slice itself, and everyone meets at the futex barrier.

use super::{FuncKind, ParParent, Translator, PARALLEL_WORKERS};
use crate::error::{EmitError, EmitResult};
use crate::isa::Cond;
use crate::sink::ByteSink;
use flap_ast::Expr;

/// How a pipe's function operand is invoked per element.
enum PipeTarget {
    /// Direct call to a known non-capturing lambda.
    Direct(String),
    /// Indirect call through a closure cell held in a frame slot.
    Slot(i32),
}

impl<'a> Translator<'a> {
    pub(crate) fn emit_range_loop(
        &mut self,
        s: &mut ByteSink,
        var: &str,
        start: &'a Expr,
        end: &'a Expr,
        body: &'a Expr,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        self.push_scope(false);
        let i_slot = self.define_var(var, true)?;
        let limit = self.alloc_hidden()?;
        self.emit_expr(s, start, false)?;
        self.e().fstore(s, r.fp, i_slot, r.facc)?;
        self.emit_expr(s, end, false)?;
        self.e().fstore(s, r.fp, limit, r.facc)?;

        let top = self.fresh_label("range_top");
        let done = self.fresh_label("range_done");
        s.define_label(&top)?;
        let e = self.e();
        e.fload(s, r.facc, r.fp, i_slot)?;
        e.fload(s, r.ftmp, r.fp, limit)?;
        // a..<b runs ascending; signed compare per the loop contract.
        e.fset_cmp(s, Cond::Lt, r.tmp1, r.facc, r.ftmp)?;
        e.br_zero(s, r.tmp1, &done)?;

        self.emit_expr(s, body, false)?;

        let e = self.e();
        e.fload(s, r.facc, r.fp, i_slot)?;
        e.mov_ri(s, r.tmp0, 1.0f64.to_bits() as i64)?;
        e.fmov_from_gpr(s, r.ftmp, r.tmp0)?;
        e.fadd(s, r.facc, r.facc, r.ftmp)?;
        e.fstore(s, r.fp, i_slot, r.facc)?;
        e.jump(s, &top)?;
        s.define_label(&done)?;
        self.pop_scope(s)?;
        self.emit_f64_const(s, 0.0)
    }

    pub(crate) fn emit_foreach_loop(
        &mut self,
        s: &mut ByteSink,
        var: &str,
        seq: &'a Expr,
        body: &'a Expr,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        self.push_scope(false);
        let var_slot = self.define_var(var, true)?;
        let ptr = self.alloc_hidden()?;
        let idx = self.alloc_hidden()?;
        let len = self.alloc_hidden()?;

        self.emit_expr(s, seq, false)?;
        let e = self.e();
        e.fmov_to_gpr(s, r.tmp0, r.facc)?;
        e.store(s, r.fp, ptr, r.tmp0)?;
        e.fload(s, r.ftmp, r.tmp0, 0)?;
        e.cvt_f2i(s, r.tmp1, r.ftmp)?;
        e.store(s, r.fp, len, r.tmp1)?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.store(s, r.fp, idx, r.tmp0)?;

        let top = self.fresh_label("each_top");
        let done = self.fresh_label("each_done");
        s.define_label(&top)?;
        let e = self.e();
        e.load(s, r.tmp0, r.fp, idx)?;
        e.load(s, r.tmp1, r.fp, len)?;
        e.br_cmp(s, Cond::Ge, r.tmp0, r.tmp1, &done)?;
        e.load(s, r.tmp1, r.fp, ptr)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.add_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
        e.fload(s, r.facc, r.tmp1, 8)?;
        e.fstore(s, r.fp, var_slot, r.facc)?;

        self.emit_expr(s, body, false)?;

        let e = self.e();
        e.load(s, r.tmp0, r.fp, idx)?;
        e.inc(s, r.tmp0)?;
        e.store(s, r.fp, idx, r.tmp0)?;
        e.jump(s, &top)?;
        s.define_label(&done)?;
        self.pop_scope(s)?;
        self.emit_f64_const(s, 0.0)
    }

    pub(crate) fn emit_infinite_loop(
        &mut self,
        s: &mut ByteSink,
        body: &'a Expr,
        max: Option<u64>,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        self.push_scope(false);
        let counter = match max {
            Some(_) => {
                let slot = self.alloc_hidden()?;
                let e = self.e();
                e.mov_ri(s, r.tmp0, 0)?;
                e.store(s, r.fp, slot, r.tmp0)?;
                Some(slot)
            }
            None => None,
        };
        let top = self.fresh_label("loop_top");
        s.define_label(&top)?;
        self.emit_expr(s, body, false)?;
        let e = self.e();
        match (max, counter) {
            (Some(n), Some(slot)) => {
                e.load(s, r.tmp0, r.fp, slot)?;
                e.inc(s, r.tmp0)?;
                e.store(s, r.fp, slot, r.tmp0)?;
                e.mov_ri(s, r.tmp1, n as i64)?;
                e.br_cmp(s, Cond::Lt, r.tmp0, r.tmp1, &top)?;
            }
            _ => e.jump(s, &top)?,
        }
        self.pop_scope(s)?;
        self.emit_f64_const(s, 0.0)
    }

    // ---- pipes ----

    /// Resolve a pipe's function operand once, before the loop.
    fn prepare_pipe_target(&mut self, s: &mut ByteSink, func: &'a Expr) -> EmitResult<PipeTarget> {
        let r = self.e().regs();
        match func {
            Expr::Ident { name, .. } => {
                if let Some(&idx) = self.func_index.get(name.as_str()) {
                    let caps =
                        self.funcs[idx].lambda.map(|l| l.captures.len()).unwrap_or(0);
                    if caps == 0 {
                        return Ok(PipeTarget::Direct(name.clone()));
                    }
                }
                self.emit_expr(s, func, false)?;
                let slot = self.alloc_hidden()?;
                self.e().fstore(s, r.fp, slot, r.facc)?;
                Ok(PipeTarget::Slot(slot))
            }
            Expr::LambdaExpr { lambda, .. } if lambda.captures.is_empty() => {
                Ok(PipeTarget::Direct(lambda.name.clone()))
            }
            _ => {
                self.emit_expr(s, func, false)?;
                let slot = self.alloc_hidden()?;
                self.e().fstore(s, r.fp, slot, r.facc)?;
                Ok(PipeTarget::Slot(slot))
            }
        }
    }

    /// Invoke the target with arguments already in the float registers.
    fn call_pipe_target(&mut self, s: &mut ByteSink, target: &PipeTarget) -> EmitResult<()> {
        let r = self.e().regs();
        match target {
            PipeTarget::Direct(name) => self.emit_call_aligned(s, name),
            PipeTarget::Slot(slot) => {
                let e = self.e();
                e.load(s, r.tmp0, r.fp, *slot)?;
                e.load(s, r.chain, r.tmp0, 8)?;
                e.load(s, r.tmp0, r.tmp0, 0)?;
                self.emit_call_reg_aligned(s, r.tmp0)
            }
        }
    }

    pub(crate) fn emit_pipe_apply(
        &mut self,
        s: &mut ByteSink,
        value: &'a Expr,
        func: &'a Expr,
        tail: bool,
    ) -> EmitResult<()> {
        if let Expr::Ident { name, .. } = func {
            if self.classify_call(name).is_some() {
                return self.emit_call(s, name, &[value], tail);
            }
        }
        let target = self.prepare_pipe_target(s, func)?;
        self.emit_expr(s, value, false)?;
        self.call_pipe_target(s, &target)
    }

    /// `xs || f`: element-wise map into a fresh list. A scalar loop on
    /// every target; element calls prevent vectorizing through the
    /// closure boundary.
    pub(crate) fn emit_pipe_map(
        &mut self,
        s: &mut ByteSink,
        value: &'a Expr,
        func: &'a Expr,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let src = self.alloc_hidden()?;
        let dst = self.alloc_hidden()?;
        let idx = self.alloc_hidden()?;
        let len = self.alloc_hidden()?;
        let target = self.prepare_pipe_target(s, func)?;

        self.emit_expr(s, value, false)?;
        let e = self.e();
        e.fmov_to_gpr(s, r.tmp0, r.facc)?;
        e.store(s, r.fp, src, r.tmp0)?;
        e.fload(s, r.ftmp, r.tmp0, 0)?;
        e.cvt_f2i(s, r.tmp1, r.ftmp)?;
        e.store(s, r.fp, len, r.tmp1)?;

        e.load(s, r.tmp0, r.fp, len)?;
        e.inc(s, r.tmp0)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.mov_rr(s, r.int_args[0], r.tmp0)?;
        self.emit_call_aligned(s, "_flap_arena_alloc")?;
        let e = self.e();
        e.store(s, r.fp, dst, r.result)?;
        e.load(s, r.tmp0, r.fp, len)?;
        e.cvt_i2f(s, r.ftmp, r.tmp0)?;
        e.fstore(s, r.result, 0, r.ftmp)?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.store(s, r.fp, idx, r.tmp0)?;

        let top = self.fresh_label("map_top");
        let done = self.fresh_label("map_done");
        s.define_label(&top)?;
        let e = self.e();
        e.load(s, r.tmp0, r.fp, idx)?;
        e.load(s, r.tmp1, r.fp, len)?;
        e.br_cmp(s, Cond::Ge, r.tmp0, r.tmp1, &done)?;
        e.load(s, r.tmp1, r.fp, src)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.add_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
        e.fload(s, r.facc, r.tmp1, 8)?;

        self.call_pipe_target(s, &target)?;

        let e = self.e();
        e.load(s, r.tmp0, r.fp, idx)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.load(s, r.tmp1, r.fp, dst)?;
        e.add_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
        e.fstore(s, r.tmp1, 8, r.facc)?;
        e.load(s, r.tmp0, r.fp, idx)?;
        e.inc(s, r.tmp0)?;
        e.store(s, r.fp, idx, r.tmp0)?;
        e.jump(s, &top)?;
        s.define_label(&done)?;
        let e = self.e();
        e.load(s, r.tmp0, r.fp, dst)?;
        e.fmov_from_gpr(s, r.facc, r.tmp0)
    }

    /// `xs ||| red`: left fold, zero-initialized accumulator.
    pub(crate) fn emit_pipe_reduce(
        &mut self,
        s: &mut ByteSink,
        value: &'a Expr,
        func: &'a Expr,
    ) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let src = self.alloc_hidden()?;
        let idx = self.alloc_hidden()?;
        let len = self.alloc_hidden()?;
        let acc = self.alloc_hidden()?;
        let target = self.prepare_pipe_target(s, func)?;

        self.emit_expr(s, value, false)?;
        let e = self.e();
        e.fmov_to_gpr(s, r.tmp0, r.facc)?;
        e.store(s, r.fp, src, r.tmp0)?;
        e.fload(s, r.ftmp, r.tmp0, 0)?;
        e.cvt_f2i(s, r.tmp1, r.ftmp)?;
        e.store(s, r.fp, len, r.tmp1)?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.store(s, r.fp, idx, r.tmp0)?;
        e.store(s, r.fp, acc, r.tmp0)?; // 0.0

        let top = self.fresh_label("fold_top");
        let done = self.fresh_label("fold_done");
        s.define_label(&top)?;
        let e = self.e();
        e.load(s, r.tmp0, r.fp, idx)?;
        e.load(s, r.tmp1, r.fp, len)?;
        e.br_cmp(s, Cond::Ge, r.tmp0, r.tmp1, &done)?;
        e.load(s, r.tmp1, r.fp, src)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.add_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
        e.fload(s, r.float_args[1], r.tmp1, 8)?;
        e.fload(s, r.facc, r.fp, acc)?;

        self.call_pipe_target(s, &target)?;

        let e = self.e();
        e.fstore(s, r.fp, acc, r.facc)?;
        e.load(s, r.tmp0, r.fp, idx)?;
        e.inc(s, r.tmp0)?;
        e.store(s, r.fp, idx, r.tmp0)?;
        e.jump(s, &top)?;
        s.define_label(&done)?;
        self.e().fload(s, r.facc, r.fp, acc)
    }

    // ---- parallel loops ----

    /// Parent side of `@@ i in a..<b`: partition, spawn, run own slice.
    pub(crate) fn emit_parallel_range(
        &mut self,
        s: &mut ByteSink,
        node: &'a Expr,
        _var: &str,
        start: &'a Expr,
        end: &'a Expr,
        _body: &'a Expr,
    ) -> EmitResult<()> {
        let name = self.par_name(node)?;
        self.par_layouts.insert(name.clone(), self.flatten_scope());

        let e = self.e();
        let r = e.regs();
        let a = self.alloc_hidden()?;
        let b = self.alloc_hidden()?;
        let chunk = self.alloc_hidden()?;
        let desc = self.alloc_hidden()?;

        self.emit_expr(s, start, false)?;
        let e = self.e();
        e.cvt_f2i(s, r.tmp0, r.facc)?;
        e.store(s, r.fp, a, r.tmp0)?;
        self.emit_expr(s, end, false)?;
        let e = self.e();
        e.cvt_f2i(s, r.tmp0, r.facc)?;
        e.store(s, r.fp, b, r.tmp0)?;

        e.load(s, r.tmp0, r.fp, b)?;
        e.load(s, r.tmp1, r.fp, a)?;
        e.sub_rr(s, r.tmp0, r.tmp0, r.tmp1)?;
        e.mov_ri(s, r.tmp1, PARALLEL_WORKERS)?;
        e.sdiv_rr(s, r.tmp0, r.tmp0, r.tmp1)?;
        e.store(s, r.fp, chunk, r.tmp0)?;

        self.emit_worker_spawns(s, &name, a, b, chunk, desc, None)
    }

    /// Parent side of `@@ x in xs`: index-partition the list.
    pub(crate) fn emit_parallel_foreach(
        &mut self,
        s: &mut ByteSink,
        node: &'a Expr,
        _var: &str,
        seq: &'a Expr,
        _body: &'a Expr,
    ) -> EmitResult<()> {
        let name = self.par_name(node)?;
        self.par_layouts.insert(name.clone(), self.flatten_scope());

        let e = self.e();
        let r = e.regs();
        let seqp = self.alloc_hidden()?;
        let b = self.alloc_hidden()?;
        let chunk = self.alloc_hidden()?;
        let desc = self.alloc_hidden()?;

        self.emit_expr(s, seq, false)?;
        let e = self.e();
        e.fmov_to_gpr(s, r.tmp0, r.facc)?;
        e.store(s, r.fp, seqp, r.tmp0)?;
        e.fload(s, r.ftmp, r.tmp0, 0)?;
        e.cvt_f2i(s, r.tmp1, r.ftmp)?;
        e.store(s, r.fp, b, r.tmp1)?;

        e.load(s, r.tmp0, r.fp, b)?;
        e.mov_ri(s, r.tmp1, PARALLEL_WORKERS)?;
        e.sdiv_rr(s, r.tmp0, r.tmp0, r.tmp1)?;
        e.store(s, r.fp, chunk, r.tmp0)?;

        self.emit_worker_spawns(s, &name, -1, b, chunk, desc, Some(seqp))
    }

    /// Unrolled worker setup: three pthread_create spawns plus the main
    /// thread's own slice. `a` is the start slot, or -1 meaning zero
    /// (for-each indexing starts at 0 and has no slot).
    fn emit_worker_spawns(
        &mut self,
        s: &mut ByteSink,
        name: &str,
        a: i32,
        b: i32,
        chunk: i32,
        desc: i32,
        seqp: Option<i32>,
    ) -> EmitResult<()> {
        let r = self.e().regs();
        for w in 0..PARALLEL_WORKERS {
            // 40-byte descriptor: start, end, parent_fp, seq, pad
            let e = self.e();
            e.mov_ri(s, r.int_args[0], 40)?;
            self.emit_call_aligned(s, "_flap_arena_alloc")?;
            let e = self.e();
            e.store(s, r.fp, desc, r.result)?;

            // start_w = a + w*chunk
            self.emit_slice_bound(s, a, chunk, w)?;
            let e = self.e();
            e.cvt_i2f(s, r.ftmp, r.tmp0)?;
            e.load(s, r.tmp1, r.fp, desc)?;
            e.fstore(s, r.tmp1, 0, r.ftmp)?;

            // end_w = last ? b : a + (w+1)*chunk
            if w == PARALLEL_WORKERS - 1 {
                let e = self.e();
                e.load(s, r.tmp0, r.fp, b)?;
            } else {
                self.emit_slice_bound(s, a, chunk, w + 1)?;
            }
            let e = self.e();
            e.cvt_i2f(s, r.ftmp, r.tmp0)?;
            e.load(s, r.tmp1, r.fp, desc)?;
            e.fstore(s, r.tmp1, 8, r.ftmp)?;

            e.store(s, r.tmp1, 16, r.fp)?;
            match seqp {
                Some(slot) => {
                    e.load(s, r.tmp0, r.fp, slot)?;
                    e.store(s, r.tmp1, 24, r.tmp0)?;
                }
                None => {
                    e.mov_ri(s, r.tmp0, 0)?;
                    e.store(s, r.tmp1, 24, r.tmp0)?;
                }
            }

            if w == PARALLEL_WORKERS - 1 {
                let e = self.e();
                e.load(s, r.int_args[0], r.fp, desc)?;
                self.emit_call_aligned(s, name)?;
            } else {
                let e = self.e();
                e.mov_ri(s, r.int_args[0], 8)?;
                self.emit_call_aligned(s, "_flap_arena_alloc")?;
                let e = self.e();
                e.mov_rr(s, r.int_args[0], r.result)?;
                e.mov_ri(s, r.int_args[1], 0)?;
                e.lea_symbol(s, r.int_args[2], name)?;
                e.load(s, r.int_args[3], r.fp, desc)?;
                self.emit_call_plt_aligned(s, "pthread_create")?;
            }
        }
        self.emit_f64_const(s, 0.0)
    }

    /// tmp0 := (a==-1 ? 0 : [a]) + w*chunk
    fn emit_slice_bound(&mut self, s: &mut ByteSink, a: i32, chunk: i32, w: i64) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        if a == -1 {
            e.mov_ri(s, r.tmp0, 0)?;
        } else {
            e.load(s, r.tmp0, r.fp, a)?;
        }
        if w > 0 {
            e.load(s, r.tmp1, r.fp, chunk)?;
            e.mov_ri(s, r.int_args[1], w)?;
            e.mul_rr(s, r.tmp1, r.tmp1, r.int_args[1])?;
            e.add_rr(s, r.tmp0, r.tmp0, r.tmp1)?;
        }
        Ok(())
    }

    /// Worker-function body: unpack the descriptor, run the slice, meet at
    /// the barrier.
    pub(crate) fn emit_par_body(&mut self, s: &mut ByteSink, idx: usize) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let decl = &self.funcs[idx];
        let name = decl.name.clone();
        let kind = decl.kind;
        let var = decl.par_var.expect("parallel body has a loop variable").to_string();
        let body = decl.par_body.expect("parallel body has a body");

        let exit = self.fresh_label("fn_exit");
        let retval = self.alloc_hidden()?;
        self.push_fn_meta(name.clone(), exit.clone(), retval);
        self.in_parallel_body = true;

        let parent_fp = self.alloc_hidden()?;
        let var_slot = self.define_var(&var, true)?;
        let limit = self.alloc_hidden()?;
        let seqp = self.alloc_hidden()?;
        let idx_slot = self.alloc_hidden()?;

        let layout = self.par_layouts.get(&name).cloned().unwrap_or_default();
        self.par_parent = Some(ParParent { fp_slot: parent_fp, layout });

        let e = self.e();
        let d = r.int_args[0];
        match kind {
            FuncKind::ParRange => {
                e.fload(s, r.ftmp, d, 0)?;
                e.fstore(s, r.fp, var_slot, r.ftmp)?;
                e.fload(s, r.ftmp, d, 8)?;
                e.fstore(s, r.fp, limit, r.ftmp)?;
            }
            FuncKind::ParForEach => {
                e.fload(s, r.ftmp, d, 0)?;
                e.cvt_f2i(s, r.tmp0, r.ftmp)?;
                e.store(s, r.fp, idx_slot, r.tmp0)?;
                e.fload(s, r.ftmp, d, 8)?;
                e.cvt_f2i(s, r.tmp0, r.ftmp)?;
                e.store(s, r.fp, limit, r.tmp0)?;
                e.load(s, r.tmp0, d, 24)?;
                e.store(s, r.fp, seqp, r.tmp0)?;
            }
            _ => {
                return Err(EmitError::Internal {
                    message: "emit_par_body on a non-parallel function".to_string(),
                })
            }
        }
        e.load(s, r.tmp0, d, 16)?;
        e.store(s, r.fp, parent_fp, r.tmp0)?;

        let top = self.fresh_label("par_top");
        let done = self.fresh_label("par_done");
        s.define_label(&top)?;
        let e = self.e();
        match kind {
            FuncKind::ParRange => {
                e.fload(s, r.facc, r.fp, var_slot)?;
                e.fload(s, r.ftmp, r.fp, limit)?;
                e.fset_cmp(s, Cond::Lt, r.tmp1, r.facc, r.ftmp)?;
                e.br_zero(s, r.tmp1, &done)?;
            }
            _ => {
                e.load(s, r.tmp0, r.fp, idx_slot)?;
                e.load(s, r.tmp1, r.fp, limit)?;
                e.br_cmp(s, Cond::Ge, r.tmp0, r.tmp1, &done)?;
                e.load(s, r.tmp1, r.fp, seqp)?;
                e.shl_ri(s, r.tmp0, 3)?;
                e.add_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
                e.fload(s, r.facc, r.tmp1, 8)?;
                e.fstore(s, r.fp, var_slot, r.facc)?;
            }
        }

        self.emit_expr(s, body, false)?;

        let e = self.e();
        match kind {
            FuncKind::ParRange => {
                e.fload(s, r.facc, r.fp, var_slot)?;
                e.mov_ri(s, r.tmp0, 1.0f64.to_bits() as i64)?;
                e.fmov_from_gpr(s, r.ftmp, r.tmp0)?;
                e.fadd(s, r.facc, r.facc, r.ftmp)?;
                e.fstore(s, r.fp, var_slot, r.facc)?;
            }
            _ => {
                e.load(s, r.tmp0, r.fp, idx_slot)?;
                e.inc(s, r.tmp0)?;
                e.store(s, r.fp, idx_slot, r.tmp0)?;
            }
        }
        e.jump(s, &top)?;
        s.define_label(&done)?;

        // Everyone meets here; the barrier publishes body writes.
        let e = self.e();
        e.lea_symbol(s, r.int_args[0], "_flap_barrier")?;
        e.mov_ri(s, r.int_args[1], PARALLEL_WORKERS)?;
        self.emit_call_aligned(s, "_flap_parallel_barrier")?;

        s.define_label(&exit)?;
        self.par_parent = None;
        self.in_parallel_body = false;
        Ok(())
    }
}
