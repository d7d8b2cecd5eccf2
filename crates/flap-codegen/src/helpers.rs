//! Runtime helper library
//!
//! A small set of routines emitted once per program, ahead of the user's
//! lambdas: decimal conversion, map probe/update, list and string ops,
//! arena allocation, the futex barrier backing parallel loops, and the
//! value printers. All of them are composed from the [`Emitter`] trait, so
//! one definition serves the three ISAs; the x86-64 map probe additionally
//! gets an SSE2 two-key unroll and an AVX-512 eight-key gather path, both
//! required to agree with the scalar loop (the correctness reference).
//!
//! Register discipline: a helper may clobber its argument registers, the
//! emitter scratch pair, and the result registers; every other caller-saved
//! register it touches is saved and restored. Helpers that call out
//! (`malloc`/`realloc`/`free` or other helpers) carry a full frame so the
//! return address survives and the stack stays 16-aligned at every call.
//! `_flap_itoa` touches no float registers, which `_flap_print_value`
//! relies on to keep the fractional part live across the call.

use crate::error::EmitResult;
use crate::isa::{Cond, Emitter, Isa};
use crate::regs::Reg;
use crate::sink::ByteSink;
use crate::value;

/// Worker-descriptor stack depth for nested `arena { }` blocks.
pub const MAX_ARENA_DEPTH: usize = 64;

/// Default arena block size.
const DEFAULT_ARENA_CAPACITY: i64 = 1 << 20;
/// Block size for explicit `arena { }` scopes.
const SCOPE_ARENA_CAPACITY: i64 = 1 << 16;

/// Every routine the library defines, in emission order.
pub const HELPER_NAMES: &[&str] = &[
    "_flap_init",
    "_flap_itoa",
    "_flap_map_lookup",
    "_flap_map_update",
    "_flap_list_concat",
    "_flap_string_concat",
    "_flap_string_eq",
    "_flap_cstr_to_flap",
    "_flap_flap_to_cstr",
    "_flap_arena_alloc",
    "_flap_arena_push",
    "_flap_arena_pop",
    "_flap_parallel_barrier",
    "_flap_print_value",
    "_flap_print_cstr",
];

/// Runtime-helper symbols are internal: they resolve to direct offsets and
/// are filtered out of the dynamic import set.
pub fn is_helper_symbol(name: &str) -> bool {
    name.starts_with("_flap_")
}

/// libc functions the helpers themselves import through the PLT.
pub const LIBC_IMPORTS: &[&str] = &["malloc", "realloc", "free"];

/// SIMD level of the emitted map probe (x86-64 only; other ISAs use the
/// scalar reference loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimdLevel {
    Scalar,
    #[default]
    Sse2,
    /// SSE2 plus the AVX-512 gather probe behind the runtime cpu flag.
    Avx512,
}

fn nr_write(isa: Isa) -> i64 {
    match isa {
        Isa::X86_64 => 1,
        Isa::Aarch64 | Isa::Riscv64 => 64,
    }
}

fn nr_futex(isa: Isa) -> i64 {
    match isa {
        Isa::X86_64 => 202,
        Isa::Aarch64 | Isa::Riscv64 => 98,
    }
}

pub struct HelperLib {
    isa: Isa,
    simd: SimdLevel,
}

impl HelperLib {
    pub fn new(isa: Isa, simd: SimdLevel) -> Self {
        // SIMD probe paths exist only in the x86-64 encoder.
        let simd = if isa == Isa::X86_64 { simd } else { SimdLevel::Scalar };
        HelperLib { isa, simd }
    }

    fn e(&self) -> &'static dyn Emitter {
        self.isa.emitter()
    }

    /// Callee-saved scratch triple used by helpers, excluding the frame
    /// pointer on every ISA.
    fn saved(&self) -> (Reg, Reg, Reg) {
        match self.isa {
            Isa::X86_64 => (Reg(3), Reg(12), Reg(13)),   // rbx, r12, r13
            Isa::Aarch64 => (Reg(19), Reg(20), Reg(21)), // x19-x21
            Isa::Riscv64 => (Reg(9), Reg(18), Reg(19)),  // s1-s3
        }
    }

    /// `.data` cells the helpers expect (name, size in bytes).
    pub fn data_items(&self) -> Vec<(&'static str, usize)> {
        let mut items = vec![
            ("_flap_default_arena", 32),
            ("_flap_arena_stack", 8 * MAX_ARENA_DEPTH),
            ("_flap_arena_depth", 8),
            ("_flap_itoa_buf", 32),
            ("_flap_fmt_buf", 64),
            ("_flap_barrier", 16),
        ];
        if self.isa == Isa::X86_64 {
            items.push(("_flap_cpu_has_avx512", 8));
        }
        items
    }

    /// `.rodata` constants the helpers reference.
    pub fn rodata_items(&self) -> Vec<(&'static str, Vec<u8>)> {
        let mut items = vec![
            ("_flap_lit_nan", b"nan".to_vec()),
            ("_flap_lit_nl", b"\n".to_vec()),
        ];
        if self.simd == SimdLevel::Avx512 {
            // Element indices of the eight keys in a 128-byte k/v block.
            let mut idx = Vec::with_capacity(64);
            for i in 0..8u64 {
                idx.extend_from_slice(&(i * 2).to_le_bytes());
            }
            items.push(("_flap_gather_idx", idx));
        }
        items
    }

    /// Emit the whole library at the sink's current position.
    pub fn emit(&self, s: &mut ByteSink) -> EmitResult<()> {
        self.emit_init(s)?;
        self.emit_itoa(s)?;
        self.emit_map_lookup(s)?;
        self.emit_map_update(s)?;
        self.emit_list_concat(s)?;
        self.emit_string_concat(s)?;
        self.emit_string_eq(s)?;
        self.emit_cstr_to_flap(s)?;
        self.emit_flap_to_cstr(s)?;
        self.emit_arena_alloc(s)?;
        self.emit_arena_push(s)?;
        self.emit_arena_pop(s)?;
        self.emit_parallel_barrier(s)?;
        self.emit_print_value(s)?;
        self.emit_print_cstr(s)?;
        Ok(())
    }

    /// Frame-carrying helper entry: saves the callee-saved triple into the
    /// first three frame slots.
    fn enter_frame(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let fp = e.regs().fp;
        let (s0, s1, s2) = self.saved();
        e.prologue(s, 48)?;
        e.store(s, fp, -8, s0)?;
        e.store(s, fp, -16, s1)?;
        e.store(s, fp, -24, s2)?;
        Ok(())
    }

    fn leave_frame(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let fp = e.regs().fp;
        let (s0, s1, s2) = self.saved();
        e.load(s, s0, fp, -8)?;
        e.load(s, s1, fp, -16)?;
        e.load(s, s2, fp, -24)?;
        e.epilogue(s)
    }

    /// write(1, sys_args[1], sys_args[2]) - buffer/length must already sit
    /// in the second and third syscall argument registers.
    fn emit_write_fd1(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        e.mov_ri(s, r.syscall_args[0], 1)?;
        e.mov_ri(s, r.syscall_nr, nr_write(self.isa))?;
        e.syscall(s)
    }

    /// Process startup: default arena from malloc, arena stack bottom, and
    /// the AVX-512 capability flag on x86-64.
    fn emit_init(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, _, _) = self.saved();
        s.define_label("_flap_init")?;
        self.enter_frame(s)?;

        e.mov_ri(s, r.int_args[0], DEFAULT_ARENA_CAPACITY)?;
        e.call_plt(s, "malloc")?;
        e.lea_symbol(s, s0, "_flap_default_arena")?;
        e.store(s, s0, 0, r.result)?; // base
        e.mov_ri(s, r.tmp0, 0)?;
        e.store(s, s0, 8, r.tmp0)?; // cursor
        e.mov_ri(s, r.tmp0, DEFAULT_ARENA_CAPACITY)?;
        e.store(s, s0, 16, r.tmp0)?; // capacity
        e.mov_ri(s, r.tmp0, 16)?;
        e.store(s, s0, 24, r.tmp0)?; // alignment

        e.lea_symbol(s, r.tmp1, "_flap_arena_stack")?;
        e.store(s, r.tmp1, 0, s0)?;
        e.lea_symbol(s, r.tmp1, "_flap_arena_depth")?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.store(s, r.tmp1, 0, r.tmp0)?;

        if self.isa == Isa::X86_64 {
            // cpuid leaf 7: AVX512F is EBX bit 16. cpuid clobbers rbx,
            // which still holds the arena-descriptor pointer.
            e.push(s, Reg(3))?;
            s.write_bytes(&[0xB8, 0x07, 0x00, 0x00, 0x00]); // mov eax, 7
            s.write_bytes(&[0x31, 0xC9]); // xor ecx, ecx
            s.write_bytes(&[0x0F, 0xA2]); // cpuid
            s.write_bytes(&[0x89, 0xD8]); // mov eax, ebx
            s.write_bytes(&[0xC1, 0xE8, 0x10]); // shr eax, 16
            s.write_bytes(&[0x83, 0xE0, 0x01]); // and eax, 1
            e.pop(s, Reg(3))?;
            e.lea_symbol(s, r.tmp1, "_flap_cpu_has_avx512")?;
            e.store(s, r.tmp1, 0, r.result)?;
            if self.simd != SimdLevel::Avx512 {
                // Force the probe onto the SSE2 path.
                e.mov_ri(s, r.tmp0, 0)?;
                e.store(s, r.tmp1, 0, r.tmp0)?;
            }
        }

        self.leave_frame(s)
    }

    /// `_flap_itoa(n)` → (ptr, len) in (result, result2). Digits are laid
    /// down backwards from the end of the scratch buffer; zero and the
    /// minus sign are the special cases.
    fn emit_itoa(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // p, n, neg
        s.define_label("_flap_itoa")?;
        e.push(s, s0)?;
        e.push(s, s1)?;
        e.push(s, s2)?;

        // Save the input first: the result register aliases the first
        // argument register on ARM64 and RISC-V.
        e.mov_rr(s, s1, r.int_args[0])?;
        e.lea_symbol(s, r.result, "_flap_itoa_buf")?;
        e.add_ri(s, r.result, 31)?; // end of buffer
        e.mov_rr(s, s0, r.result)?; // p = end

        e.br_nonzero(s, s1, "_flap_itoa.nonzero")?;
        e.mov_ri(s, r.tmp0, b'0' as i64)?;
        e.dec(s, s0)?;
        e.store_u8(s, s0, 0, r.tmp0)?;
        e.jump(s, "_flap_itoa.finish")?;

        s.define_label("_flap_itoa.nonzero")?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.set_cmp(s, Cond::Lt, s2, s1, r.tmp0)?; // neg = n < 0
        e.br_zero(s, s2, "_flap_itoa.digits")?;
        e.neg(s, s1)?;

        s.define_label("_flap_itoa.digits")?;
        e.mov_ri(s, r.tmp1, 10)?;
        e.sdiv_rr(s, r.tmp0, s1, r.tmp1)?; // q = n / 10
        e.mul_rr(s, r.tmp1, r.tmp0, r.tmp1)?; // q * 10
        e.sub_rr(s, r.tmp1, s1, r.tmp1)?; // digit
        e.add_ri(s, r.tmp1, b'0' as i32)?;
        e.dec(s, s0)?;
        e.store_u8(s, s0, 0, r.tmp1)?;
        e.mov_rr(s, s1, r.tmp0)?;
        e.br_nonzero(s, s1, "_flap_itoa.digits")?;

        e.br_zero(s, s2, "_flap_itoa.finish")?;
        e.mov_ri(s, r.tmp0, b'-' as i64)?;
        e.dec(s, s0)?;
        e.store_u8(s, s0, 0, r.tmp0)?;

        s.define_label("_flap_itoa.finish")?;
        e.lea_symbol(s, r.result2, "_flap_itoa_buf")?;
        e.add_ri(s, r.result2, 31)?;
        e.sub_rr(s, r.result2, r.result2, s0)?; // len = end - p
        e.mov_rr(s, r.result, s0)?;
        e.pop(s, s2)?;
        e.pop(s, s1)?;
        e.pop(s, s0)?;
        e.ret(s)
    }

    /// `_flap_map_lookup(map, key)` → value, or the `key!` error NaN.
    ///
    /// The scalar loop is the correctness reference. On x86-64 the probe
    /// runs two keys per iteration via the SSE2 unroll, and - behind the
    /// cpuid flag - eight keys per iteration via an AVX-512 gather; a
    /// vector hit falls back to the scalar scan of the surviving block, so
    /// all paths return identical results.
    fn emit_map_lookup(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let ptr = r.int_args[0];
        let count = r.int_args[1];
        s.define_label("_flap_map_lookup")?;
        e.push(s, count)?;
        e.fload(s, r.ftmp, ptr, 0)?;
        e.cvt_f2i(s, count, r.ftmp)?;
        e.add_ri(s, ptr, 8)?;

        if self.isa == Isa::X86_64 && self.simd == SimdLevel::Avx512 {
            e.lea_symbol(s, r.tmp0, "_flap_cpu_has_avx512")?;
            e.load(s, r.tmp0, r.tmp0, 0)?;
            e.br_zero(s, r.tmp0, "_flap_map_lookup.sse")?;
            // vpbroadcastq zmm1, rax ← key bits
            e.fmov_to_gpr(s, r.result, r.facc)?;
            s.write_bytes(&[0x62, 0xF2, 0xFD, 0x48, 0x7C, 0xC8]);
            // vmovdqu64 zmm3, [rcx] ← gather indices
            e.lea_symbol(s, r.tmp1, "_flap_gather_idx")?;
            s.write_bytes(&[0x62, 0xF1, 0xFE, 0x48, 0x6F, 0x19]);

            s.define_label("_flap_map_lookup.avx")?;
            e.mov_ri(s, r.tmp0, 8)?;
            e.br_cmp(s, Cond::Lt, count, r.tmp0, "_flap_map_lookup.sse")?;
            // kxnorb k1, k1, k1 - all-ones gather mask
            s.write_bytes(&[0xC5, 0xF5, 0x46, 0xC9]);
            // vgatherqpd zmm2{k1}, [rdi + zmm3*8]
            s.write_bytes(&[0x62, 0xF2, 0xFD, 0x49, 0x93, 0x14, 0xDF]);
            // vcmppd k2, zmm2, zmm1, EQ_OQ
            s.write_bytes(&[0x62, 0xF1, 0xF5, 0x48, 0xC2, 0xD2, 0x00]);
            // kmovb eax, k2
            s.write_bytes(&[0xC5, 0xF9, 0x93, 0xC2]);
            e.br_nonzero(s, r.result, "_flap_map_lookup.scan")?;
            e.add_ri(s, ptr, 128)?;
            e.add_ri(s, count, -8)?;
            e.jump(s, "_flap_map_lookup.avx")?;
        }

        if self.isa == Isa::X86_64 && self.simd != SimdLevel::Scalar {
            s.define_label("_flap_map_lookup.sse")?;
            e.mov_ri(s, r.tmp0, 2)?;
            e.br_cmp(s, Cond::Lt, count, r.tmp0, "_flap_map_lookup.scan")?;
            e.fload(s, r.ftmp, ptr, 0)?;
            e.fset_cmp(s, Cond::Eq, r.tmp1, r.facc, r.ftmp)?;
            e.br_nonzero(s, r.tmp1, "_flap_map_lookup.hit0")?;
            e.fload(s, r.ftmp, ptr, 16)?;
            e.fset_cmp(s, Cond::Eq, r.tmp1, r.facc, r.ftmp)?;
            e.br_nonzero(s, r.tmp1, "_flap_map_lookup.hit1")?;
            e.add_ri(s, ptr, 32)?;
            e.add_ri(s, count, -2)?;
            e.jump(s, "_flap_map_lookup.sse")?;
            s.define_label("_flap_map_lookup.hit1")?;
            e.add_ri(s, ptr, 16)?;
            s.define_label("_flap_map_lookup.hit0")?;
            e.fload(s, r.facc, ptr, 8)?;
            e.pop(s, count)?;
            e.ret(s)?;
        }

        s.define_label("_flap_map_lookup.scan")?;
        e.br_zero(s, count, "_flap_map_lookup.miss")?;
        e.fload(s, r.ftmp, ptr, 0)?;
        e.fset_cmp(s, Cond::Eq, r.tmp1, r.facc, r.ftmp)?;
        e.br_nonzero(s, r.tmp1, "_flap_map_lookup.hit")?;
        e.add_ri(s, ptr, 16)?;
        e.dec(s, count)?;
        e.jump(s, "_flap_map_lookup.scan")?;

        s.define_label("_flap_map_lookup.hit")?;
        e.fload(s, r.facc, ptr, 8)?;
        e.pop(s, count)?;
        e.ret(s)?;

        s.define_label("_flap_map_lookup.miss")?;
        e.mov_ri(s, r.tmp0, value::error_bits(value::TAG_KEY) as i64)?;
        e.fmov_from_gpr(s, r.facc, r.tmp0)?;
        e.pop(s, count)?;
        e.ret(s)
    }

    /// `_flap_map_update(map, key, value)`: overwrite in place, else append
    /// (map literals are allocated with growth headroom).
    fn emit_map_update(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let ptr = r.int_args[0];
        let count = r.int_args[1];
        let key = r.float_args[0];
        let val = r.float_args[1];
        s.define_label("_flap_map_update")?;
        e.push(s, count)?;
        e.push(s, ptr)?; // original map pointer, for the count bump
        e.fload(s, r.ftmp2, ptr, 0)?;
        e.cvt_f2i(s, count, r.ftmp2)?;
        e.add_ri(s, ptr, 8)?;

        s.define_label("_flap_map_update.loop")?;
        e.br_zero(s, count, "_flap_map_update.append")?;
        e.fload(s, r.ftmp2, ptr, 0)?;
        e.fset_cmp(s, Cond::Eq, r.tmp1, key, r.ftmp2)?;
        e.br_nonzero(s, r.tmp1, "_flap_map_update.hit")?;
        e.add_ri(s, ptr, 16)?;
        e.dec(s, count)?;
        e.jump(s, "_flap_map_update.loop")?;

        s.define_label("_flap_map_update.hit")?;
        e.fstore(s, ptr, 8, val)?;
        e.pop(s, r.tmp1)?;
        e.pop(s, count)?;
        e.ret(s)?;

        s.define_label("_flap_map_update.append")?;
        // ptr has walked to the append slot.
        e.fstore(s, ptr, 0, key)?;
        e.fstore(s, ptr, 8, val)?;
        e.pop(s, r.tmp1)?; // original map
        e.pop(s, count)?;
        e.fload(s, r.ftmp2, r.tmp1, 0)?;
        e.mov_ri(s, r.tmp0, 1.0f64.to_bits() as i64)?;
        e.fmov_from_gpr(s, key, r.tmp0)?;
        e.fadd(s, r.ftmp2, r.ftmp2, key)?;
        e.fstore(s, r.tmp1, 0, r.ftmp2)?;
        e.ret(s)
    }

    /// `_flap_list_concat(a, b)` → fresh arena list.
    fn emit_list_concat(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // a, b, na
        s.define_label("_flap_list_concat")?;
        self.enter_frame(s)?;
        e.mov_rr(s, s0, r.int_args[0])?;
        e.mov_rr(s, s1, r.int_args[1])?;

        e.fload(s, r.ftmp, s0, 0)?;
        e.cvt_f2i(s, s2, r.ftmp)?;
        e.fload(s, r.ftmp, s1, 0)?;
        e.cvt_f2i(s, r.tmp0, r.ftmp)?;
        e.add_rr(s, r.tmp0, r.tmp0, s2)?;
        e.inc(s, r.tmp0)?;
        e.shl_ri(s, r.tmp0, 3)?; // (1 + na + nb) * 8
        e.mov_rr(s, r.int_args[0], r.tmp0)?;
        e.call_label(s, "_flap_arena_alloc")?;

        // length = na + nb
        e.fload(s, r.ftmp, s0, 0)?;
        e.fload(s, r.ftmp2, s1, 0)?;
        e.fadd(s, r.ftmp, r.ftmp, r.ftmp2)?;
        e.fstore(s, r.result, 0, r.ftmp)?;

        // copy a
        e.mov_rr(s, r.int_args[1], r.result)?;
        e.add_ri(s, r.int_args[1], 8)?;
        e.add_ri(s, s0, 8)?;
        e.mov_rr(s, r.tmp0, s2)?;
        s.define_label("_flap_list_concat.copy_a")?;
        e.br_zero(s, r.tmp0, "_flap_list_concat.copy_b_init")?;
        e.fload(s, r.ftmp, s0, 0)?;
        e.fstore(s, r.int_args[1], 0, r.ftmp)?;
        e.add_ri(s, s0, 8)?;
        e.add_ri(s, r.int_args[1], 8)?;
        e.dec(s, r.tmp0)?;
        e.jump(s, "_flap_list_concat.copy_a")?;

        s.define_label("_flap_list_concat.copy_b_init")?;
        e.fload(s, r.ftmp, s1, 0)?;
        e.cvt_f2i(s, r.tmp0, r.ftmp)?;
        e.add_ri(s, s1, 8)?;
        s.define_label("_flap_list_concat.copy_b")?;
        e.br_zero(s, r.tmp0, "_flap_list_concat.done")?;
        e.fload(s, r.ftmp, s1, 0)?;
        e.fstore(s, r.int_args[1], 0, r.ftmp)?;
        e.add_ri(s, s1, 8)?;
        e.add_ri(s, r.int_args[1], 8)?;
        e.dec(s, r.tmp0)?;
        e.jump(s, "_flap_list_concat.copy_b")?;

        s.define_label("_flap_list_concat.done")?;
        self.leave_frame(s)
    }

    /// `_flap_string_concat(a, b)` → fresh dense codepoint map with the
    /// indices renumbered 0..na+nb.
    fn emit_string_concat(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // a, b, na
        let q = r.int_args[1];
        let idx = r.int_args[2];
        s.define_label("_flap_string_concat")?;
        self.enter_frame(s)?;
        e.mov_rr(s, s0, r.int_args[0])?;
        e.mov_rr(s, s1, r.int_args[1])?;

        e.fload(s, r.ftmp, s0, 0)?;
        e.cvt_f2i(s, s2, r.ftmp)?;
        e.fload(s, r.ftmp, s1, 0)?;
        e.cvt_f2i(s, r.tmp0, r.ftmp)?;
        e.add_rr(s, r.tmp0, r.tmp0, s2)?;
        e.shl_ri(s, r.tmp0, 4)?;
        e.add_ri(s, r.tmp0, 8)?; // 8 + 16*(na+nb)
        e.mov_rr(s, r.int_args[0], r.tmp0)?;
        e.call_label(s, "_flap_arena_alloc")?;

        e.fload(s, r.ftmp, s0, 0)?;
        e.fload(s, r.ftmp2, s1, 0)?;
        e.fadd(s, r.ftmp, r.ftmp, r.ftmp2)?;
        e.fstore(s, r.result, 0, r.ftmp)?;

        e.mov_rr(s, q, r.result)?;
        e.add_ri(s, q, 8)?;
        e.mov_ri(s, idx, 0)?;

        e.mov_rr(s, r.tmp0, s2)?;
        e.add_ri(s, s0, 8)?;
        s.define_label("_flap_string_concat.copy_a")?;
        e.br_zero(s, r.tmp0, "_flap_string_concat.copy_b_init")?;
        e.cvt_i2f(s, r.ftmp, idx)?;
        e.fstore(s, q, 0, r.ftmp)?;
        e.fload(s, r.ftmp, s0, 8)?;
        e.fstore(s, q, 8, r.ftmp)?;
        e.add_ri(s, s0, 16)?;
        e.add_ri(s, q, 16)?;
        e.inc(s, idx)?;
        e.dec(s, r.tmp0)?;
        e.jump(s, "_flap_string_concat.copy_a")?;

        s.define_label("_flap_string_concat.copy_b_init")?;
        e.fload(s, r.ftmp, s1, 0)?;
        e.cvt_f2i(s, r.tmp0, r.ftmp)?;
        e.add_ri(s, s1, 8)?;
        s.define_label("_flap_string_concat.copy_b")?;
        e.br_zero(s, r.tmp0, "_flap_string_concat.done")?;
        e.cvt_i2f(s, r.ftmp, idx)?;
        e.fstore(s, q, 0, r.ftmp)?;
        e.fload(s, r.ftmp, s1, 8)?;
        e.fstore(s, q, 8, r.ftmp)?;
        e.add_ri(s, s1, 16)?;
        e.add_ri(s, q, 16)?;
        e.inc(s, idx)?;
        e.dec(s, r.tmp0)?;
        e.jump(s, "_flap_string_concat.copy_b")?;

        s.define_label("_flap_string_concat.done")?;
        self.leave_frame(s)
    }

    /// `_flap_string_eq(a, b)` → 1.0 / 0.0 (dense representation assumed).
    fn emit_string_eq(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let a = r.int_args[0];
        let b = r.int_args[1];
        let n = r.int_args[2];
        s.define_label("_flap_string_eq")?;
        e.fload(s, r.ftmp, a, 0)?;
        e.fload(s, r.ftmp2, b, 0)?;
        e.fset_cmp(s, Cond::Eq, r.tmp1, r.ftmp, r.ftmp2)?;
        e.br_zero(s, r.tmp1, "_flap_string_eq.ne")?;
        e.cvt_f2i(s, n, r.ftmp)?;
        e.add_ri(s, a, 8)?;
        e.add_ri(s, b, 8)?;

        s.define_label("_flap_string_eq.loop")?;
        e.br_zero(s, n, "_flap_string_eq.eq")?;
        e.fload(s, r.ftmp, a, 8)?;
        e.fload(s, r.ftmp2, b, 8)?;
        e.fset_cmp(s, Cond::Eq, r.tmp1, r.ftmp, r.ftmp2)?;
        e.br_zero(s, r.tmp1, "_flap_string_eq.ne")?;
        e.add_ri(s, a, 16)?;
        e.add_ri(s, b, 16)?;
        e.dec(s, n)?;
        e.jump(s, "_flap_string_eq.loop")?;

        s.define_label("_flap_string_eq.eq")?;
        e.mov_ri(s, r.tmp0, 1.0f64.to_bits() as i64)?;
        e.fmov_from_gpr(s, r.facc, r.tmp0)?;
        e.ret(s)?;
        s.define_label("_flap_string_eq.ne")?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.fmov_from_gpr(s, r.facc, r.tmp0)?;
        e.ret(s)
    }

    /// `_flap_cstr_to_flap(cstr)` → dense codepoint map (bytes taken as
    /// codepoints).
    fn emit_cstr_to_flap(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // cstr, len, idx
        s.define_label("_flap_cstr_to_flap")?;
        self.enter_frame(s)?;
        e.mov_rr(s, s0, r.int_args[0])?;

        // strlen
        e.mov_ri(s, s1, 0)?;
        e.mov_rr(s, r.tmp1, s0)?;
        s.define_label("_flap_cstr_to_flap.len")?;
        e.load_u8(s, r.tmp0, r.tmp1, 0)?;
        e.br_zero(s, r.tmp0, "_flap_cstr_to_flap.alloc")?;
        e.inc(s, s1)?;
        e.inc(s, r.tmp1)?;
        e.jump(s, "_flap_cstr_to_flap.len")?;

        s.define_label("_flap_cstr_to_flap.alloc")?;
        e.mov_rr(s, r.tmp0, s1)?;
        e.shl_ri(s, r.tmp0, 4)?;
        e.add_ri(s, r.tmp0, 8)?;
        e.mov_rr(s, r.int_args[0], r.tmp0)?;
        e.call_label(s, "_flap_arena_alloc")?;
        e.cvt_i2f(s, r.ftmp, s1)?;
        e.fstore(s, r.result, 0, r.ftmp)?;

        e.mov_rr(s, r.int_args[1], r.result)?;
        e.add_ri(s, r.int_args[1], 8)?;
        e.mov_ri(s, s2, 0)?;
        s.define_label("_flap_cstr_to_flap.fill")?;
        e.br_cmp(s, Cond::Ge, s2, s1, "_flap_cstr_to_flap.done")?;
        e.cvt_i2f(s, r.ftmp, s2)?;
        e.fstore(s, r.int_args[1], 0, r.ftmp)?;
        e.load_u8(s, r.tmp0, s0, 0)?;
        e.cvt_i2f(s, r.ftmp, r.tmp0)?;
        e.fstore(s, r.int_args[1], 8, r.ftmp)?;
        e.inc(s, s0)?;
        e.add_ri(s, r.int_args[1], 16)?;
        e.inc(s, s2)?;
        e.jump(s, "_flap_cstr_to_flap.fill")?;

        s.define_label("_flap_cstr_to_flap.done")?;
        self.leave_frame(s)
    }

    /// `_flap_flap_to_cstr(str)` → arena-allocated zero-terminated bytes.
    fn emit_flap_to_cstr(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // str walk, len, idx
        s.define_label("_flap_flap_to_cstr")?;
        self.enter_frame(s)?;
        e.mov_rr(s, s0, r.int_args[0])?;
        e.fload(s, r.ftmp, s0, 0)?;
        e.cvt_f2i(s, s1, r.ftmp)?;
        e.mov_rr(s, r.tmp0, s1)?;
        e.inc(s, r.tmp0)?;
        e.mov_rr(s, r.int_args[0], r.tmp0)?;
        e.call_label(s, "_flap_arena_alloc")?;

        e.mov_rr(s, r.int_args[1], r.result)?;
        e.add_ri(s, s0, 8)?;
        e.mov_ri(s, s2, 0)?;
        s.define_label("_flap_flap_to_cstr.fill")?;
        e.br_cmp(s, Cond::Ge, s2, s1, "_flap_flap_to_cstr.done")?;
        e.fload(s, r.ftmp, s0, 8)?;
        e.cvt_f2i(s, r.tmp0, r.ftmp)?;
        e.store_u8(s, r.int_args[1], 0, r.tmp0)?;
        e.inc(s, r.int_args[1])?;
        e.add_ri(s, s0, 16)?;
        e.inc(s, s2)?;
        e.jump(s, "_flap_flap_to_cstr.fill")?;

        s.define_label("_flap_flap_to_cstr.done")?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.store_u8(s, r.int_args[1], 0, r.tmp0)?;
        self.leave_frame(s)
    }

    /// `_flap_arena_alloc(size)` → 16-aligned block on the current arena;
    /// the backing block doubles through host `realloc` on overflow.
    fn emit_arena_alloc(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // desc, size, newcap
        s.define_label("_flap_arena_alloc")?;
        self.enter_frame(s)?;
        e.mov_rr(s, s1, r.int_args[0])?;
        e.add_ri(s, s1, 15)?;
        e.mov_ri(s, r.tmp0, !15i64)?;
        e.and_rr(s, s1, s1, r.tmp0)?;

        // desc = arena_stack[depth]
        e.lea_symbol(s, r.tmp1, "_flap_arena_depth")?;
        e.load(s, r.tmp0, r.tmp1, 0)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.lea_symbol(s, r.tmp1, "_flap_arena_stack")?;
        e.add_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
        e.load(s, s0, r.tmp1, 0)?;

        e.load(s, r.tmp0, s0, 8)?; // cursor
        e.load(s, r.tmp1, s0, 16)?; // capacity
        e.mov_rr(s, r.int_args[1], r.tmp0)?;
        e.add_rr(s, r.int_args[1], r.int_args[1], s1)?; // newcur
        e.br_cmp(s, Cond::Ule, r.int_args[1], r.tmp1, "_flap_arena_alloc.fit")?;

        // grow: newcap = cap doubled until it fits
        e.mov_rr(s, s2, r.tmp1)?;
        s.define_label("_flap_arena_alloc.grow")?;
        e.shl_ri(s, s2, 1)?;
        e.br_cmp(s, Cond::Ult, s2, r.int_args[1], "_flap_arena_alloc.grow")?;
        e.load(s, r.int_args[0], s0, 0)?;
        e.mov_rr(s, r.int_args[1], s2)?;
        e.call_plt(s, "realloc")?;
        e.store(s, s0, 0, r.result)?;
        e.store(s, s0, 16, s2)?;

        s.define_label("_flap_arena_alloc.fit")?;
        e.load(s, r.tmp0, s0, 8)?;
        e.load(s, r.tmp1, s0, 0)?;
        e.mov_rr(s, r.result, r.tmp1)?;
        e.add_rr(s, r.result, r.result, r.tmp0)?; // base + cursor
        e.add_rr(s, r.tmp0, r.tmp0, s1)?;
        e.store(s, s0, 8, r.tmp0)?; // cursor += size
        self.leave_frame(s)
    }

    /// `arena { }` entry: push a fresh descriptor onto the meta-arena stack.
    fn emit_arena_push(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, _, _) = self.saved();
        s.define_label("_flap_arena_push")?;
        self.enter_frame(s)?;
        e.mov_ri(s, r.int_args[0], 32)?;
        e.call_plt(s, "malloc")?;
        e.mov_rr(s, s0, r.result)?;
        e.mov_ri(s, r.int_args[0], SCOPE_ARENA_CAPACITY)?;
        e.call_plt(s, "malloc")?;
        e.store(s, s0, 0, r.result)?;
        e.mov_ri(s, r.tmp0, 0)?;
        e.store(s, s0, 8, r.tmp0)?;
        e.mov_ri(s, r.tmp0, SCOPE_ARENA_CAPACITY)?;
        e.store(s, s0, 16, r.tmp0)?;
        e.mov_ri(s, r.tmp0, 16)?;
        e.store(s, s0, 24, r.tmp0)?;

        e.lea_symbol(s, r.tmp1, "_flap_arena_depth")?;
        e.load(s, r.tmp0, r.tmp1, 0)?;
        e.inc(s, r.tmp0)?;
        e.store(s, r.tmp1, 0, r.tmp0)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.lea_symbol(s, r.tmp1, "_flap_arena_stack")?;
        e.add_rr(s, r.tmp1, r.tmp1, r.tmp0)?;
        e.store(s, r.tmp1, 0, s0)?;
        self.leave_frame(s)
    }

    /// `arena { }` exit: free the block and descriptor, pop the stack.
    fn emit_arena_pop(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, _, _) = self.saved();
        s.define_label("_flap_arena_pop")?;
        self.enter_frame(s)?;
        e.lea_symbol(s, r.tmp1, "_flap_arena_depth")?;
        e.load(s, r.tmp0, r.tmp1, 0)?;
        e.shl_ri(s, r.tmp0, 3)?;
        e.lea_symbol(s, r.int_args[1], "_flap_arena_stack")?;
        e.add_rr(s, r.int_args[1], r.int_args[1], r.tmp0)?;
        e.load(s, s0, r.int_args[1], 0)?;

        e.lea_symbol(s, r.tmp1, "_flap_arena_depth")?;
        e.load(s, r.tmp0, r.tmp1, 0)?;
        e.dec(s, r.tmp0)?;
        e.store(s, r.tmp1, 0, r.tmp0)?;

        e.load(s, r.int_args[0], s0, 0)?;
        e.call_plt(s, "free")?;
        e.mov_rr(s, r.int_args[0], s0)?;
        e.call_plt(s, "free")?;
        self.leave_frame(s)
    }

    /// `_flap_parallel_barrier(bar, n)`: futex-based central barrier with a
    /// generation word. The last arrival resets the counter, bumps the
    /// generation, and wakes the waiters; the generation bump is the
    /// happens-before edge that publishes loop-body writes.
    fn emit_parallel_barrier(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // bar, n, generation
        s.define_label("_flap_parallel_barrier")?;
        self.enter_frame(s)?;
        e.mov_rr(s, s0, r.int_args[0])?;
        e.mov_rr(s, s1, r.int_args[1])?;

        e.mov_rr(s, r.tmp1, s0)?;
        e.add_ri(s, r.tmp1, 8)?;
        e.atomic_load(s, s2, r.tmp1)?; // generation

        e.mov_ri(s, r.tmp0, 1)?;
        e.atomic_fetch_add(s, r.int_args[2], s0, r.tmp0)?;
        e.inc(s, r.int_args[2])?;
        e.br_cmp(s, Cond::Ne, r.int_args[2], s1, "_flap_parallel_barrier.wait")?;

        // last arrival
        e.mov_ri(s, r.tmp0, 0)?;
        e.store(s, s0, 0, r.tmp0)?;
        e.mov_rr(s, r.tmp1, s0)?;
        e.add_ri(s, r.tmp1, 8)?;
        e.mov_ri(s, r.tmp0, 1)?;
        e.atomic_fetch_add(s, r.result, r.tmp1, r.tmp0)?;
        // futex_wake(bar+8, FUTEX_WAKE|PRIVATE, INT_MAX)
        e.mov_rr(s, r.syscall_args[0], s0)?;
        e.add_ri(s, r.syscall_args[0], 8)?;
        e.mov_ri(s, r.syscall_args[1], 129)?;
        e.mov_ri(s, r.syscall_args[2], i32::MAX as i64)?;
        e.mov_ri(s, r.syscall_nr, nr_futex(self.isa))?;
        e.syscall(s)?;
        e.jump(s, "_flap_parallel_barrier.done")?;

        s.define_label("_flap_parallel_barrier.wait")?;
        e.mov_rr(s, r.tmp1, s0)?;
        e.add_ri(s, r.tmp1, 8)?;
        e.atomic_load(s, r.result, r.tmp1)?;
        e.br_cmp(s, Cond::Ne, r.result, s2, "_flap_parallel_barrier.done")?;
        // futex_wait(bar+8, FUTEX_WAIT|PRIVATE, generation, NULL)
        e.mov_rr(s, r.syscall_args[0], s0)?;
        e.add_ri(s, r.syscall_args[0], 8)?;
        e.mov_ri(s, r.syscall_args[1], 128)?;
        e.mov_rr(s, r.syscall_args[2], s2)?;
        e.mov_ri(s, r.syscall_args[3], 0)?;
        e.mov_ri(s, r.syscall_nr, nr_futex(self.isa))?;
        e.syscall(s)?;
        e.jump(s, "_flap_parallel_barrier.wait")?;

        s.define_label("_flap_parallel_barrier.done")?;
        self.leave_frame(s)
    }

    /// `_flap_print_value(v)`: integral values print through `_flap_itoa`,
    /// non-integral with six fixed decimals, NaN as "nan".
    fn emit_print_value(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        let (s0, s1, s2) = self.saved(); // int part, digit ptr, digit count
        s.define_label("_flap_print_value")?;
        self.enter_frame(s)?;

        // NaN (including tagged errors) prints as "nan"
        e.fset_cmp(s, Cond::Eq, r.tmp1, r.facc, r.facc)?;
        e.br_zero(s, r.tmp1, "_flap_print_value.nan")?;

        e.cvt_f2i(s, r.tmp0, r.facc)?;
        e.cvt_i2f(s, r.ftmp, r.tmp0)?;
        e.fset_cmp(s, Cond::Eq, r.tmp1, r.facc, r.ftmp)?;
        e.br_zero(s, r.tmp1, "_flap_print_value.frac")?;

        // integral
        e.cvt_f2i(s, r.int_args[0], r.facc)?;
        e.call_label(s, "_flap_itoa")?;
        // Length before pointer: result2 aliases the second syscall
        // argument register on ARM64 and RISC-V.
        e.mov_rr(s, r.syscall_args[2], r.result2)?;
        e.mov_rr(s, r.syscall_args[1], r.result)?;
        self.emit_write_fd1(s)?;
        e.jump(s, "_flap_print_value.done")?;

        s.define_label("_flap_print_value.frac")?;
        // sign
        e.mov_ri(s, r.tmp0, 0)?;
        e.cvt_i2f(s, r.ftmp, r.tmp0)?;
        e.fset_cmp(s, Cond::Lt, r.tmp1, r.facc, r.ftmp)?;
        e.br_zero(s, r.tmp1, "_flap_print_value.pos")?;
        e.fneg_(s, r.facc, r.facc)?;
        e.lea_symbol(s, r.syscall_args[1], "_flap_fmt_buf")?;
        e.mov_ri(s, r.tmp0, b'-' as i64)?;
        e.store_u8(s, r.syscall_args[1], 0, r.tmp0)?;
        e.mov_ri(s, r.syscall_args[2], 1)?;
        self.emit_write_fd1(s)?;

        s.define_label("_flap_print_value.pos")?;
        e.cvt_f2i(s, s0, r.facc)?; // integer part
        e.cvt_i2f(s, r.ftmp, s0)?;
        e.fsub(s, r.facc, r.facc, r.ftmp)?; // fractional remainder
        e.mov_rr(s, r.int_args[0], s0)?;
        e.call_label(s, "_flap_itoa")?; // leaves float registers alone
        e.mov_rr(s, r.syscall_args[2], r.result2)?;
        e.mov_rr(s, r.syscall_args[1], r.result)?;
        self.emit_write_fd1(s)?;

        // decimal point
        e.lea_symbol(s, r.syscall_args[1], "_flap_fmt_buf")?;
        e.mov_ri(s, r.result, b'.' as i64)?;
        e.store_u8(s, r.syscall_args[1], 0, r.result)?;
        e.mov_ri(s, r.syscall_args[2], 1)?;
        self.emit_write_fd1(s)?;

        // six fixed decimals
        e.lea_symbol(s, s1, "_flap_fmt_buf")?;
        e.mov_ri(s, s2, 6)?;
        s.define_label("_flap_print_value.digit")?;
        e.mov_ri(s, r.tmp0, 10)?;
        e.cvt_i2f(s, r.ftmp, r.tmp0)?;
        e.fmul(s, r.facc, r.facc, r.ftmp)?;
        e.cvt_f2i(s, r.tmp0, r.facc)?;
        e.cvt_i2f(s, r.ftmp, r.tmp0)?;
        e.fsub(s, r.facc, r.facc, r.ftmp)?;
        e.add_ri(s, r.tmp0, b'0' as i32)?;
        e.store_u8(s, s1, 0, r.tmp0)?;
        e.inc(s, s1)?;
        e.dec(s, s2)?;
        e.br_nonzero(s, s2, "_flap_print_value.digit")?;
        e.lea_symbol(s, r.syscall_args[1], "_flap_fmt_buf")?;
        e.mov_ri(s, r.syscall_args[2], 6)?;
        self.emit_write_fd1(s)?;
        e.jump(s, "_flap_print_value.done")?;

        s.define_label("_flap_print_value.nan")?;
        e.lea_symbol(s, r.syscall_args[1], "_flap_lit_nan")?;
        e.mov_ri(s, r.syscall_args[2], 3)?;
        self.emit_write_fd1(s)?;

        s.define_label("_flap_print_value.done")?;
        self.leave_frame(s)
    }

    /// `_flap_print_cstr(ptr, len)`: one write(2) to stdout.
    fn emit_print_cstr(&self, s: &mut ByteSink) -> EmitResult<()> {
        let e = self.e();
        let r = e.regs();
        s.define_label("_flap_print_cstr")?;
        // Shuffle len before ptr: on x86-64 the length argument register is
        // also the second syscall argument's neighbor (rsi), so order matters.
        e.mov_rr(s, r.syscall_args[2], r.int_args[1])?;
        e.mov_rr(s, r.syscall_args[1], r.int_args[0])?;
        self.emit_write_fd1(s)?;
        e.ret(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::Segment;

    fn emit_for(isa: Isa, simd: SimdLevel) -> ByteSink {
        let lib = HelperLib::new(isa, simd);
        let mut s = ByteSink::new(Segment::Text);
        lib.emit(&mut s).unwrap();
        s
    }

    #[test]
    fn test_all_helpers_defined_on_every_isa() {
        for isa in [Isa::X86_64, Isa::Aarch64, Isa::Riscv64] {
            let s = emit_for(isa, SimdLevel::default());
            for name in HELPER_NAMES {
                assert!(s.label_offset(name).is_some(), "{name} missing on {}", isa.name());
            }
        }
    }

    #[test]
    fn test_patches_reference_known_symbols() {
        let s = emit_for(Isa::X86_64, SimdLevel::Avx512);
        let lib = HelperLib::new(Isa::X86_64, SimdLevel::Avx512);
        let data: Vec<&str> = lib.data_items().iter().map(|(n, _)| *n).collect();
        let rodata: Vec<&str> = lib.rodata_items().iter().map(|(n, _)| *n).collect();
        for patch in s.patches() {
            let sym = patch.symbol.as_str();
            let known = s.label_offset(sym.trim_end_matches("@plt")).is_some()
                || data.contains(&sym)
                || rodata.contains(&sym)
                || sym.ends_with("@plt");
            assert!(known, "unknown patch target {sym}");
        }
    }

    #[test]
    fn test_aarch64_emission_is_word_aligned() {
        let s = emit_for(Isa::Aarch64, SimdLevel::Scalar);
        assert_eq!(s.position() % 4, 0);
    }

    #[test]
    fn test_simd_levels_change_probe_only_on_x86() {
        let scalar = emit_for(Isa::Riscv64, SimdLevel::Scalar);
        let forced = emit_for(Isa::Riscv64, SimdLevel::Avx512);
        assert_eq!(scalar.bytes(), forced.bytes());

        let sse = emit_for(Isa::X86_64, SimdLevel::Sse2);
        let avx = emit_for(Isa::X86_64, SimdLevel::Avx512);
        assert!(avx.bytes().len() > sse.bytes().len());
    }

    #[test]
    fn test_helper_name_filter() {
        assert!(is_helper_symbol("_flap_itoa"));
        assert!(is_helper_symbol("_flap_arena_alloc"));
        assert!(!is_helper_symbol("printf"));
        assert!(!is_helper_symbol("malloc"));
    }
}
