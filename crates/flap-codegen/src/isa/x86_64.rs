//! x86-64 instruction encoder
//!
//! Encodings follow the Intel SDM Vol. 2 reference forms. All integer
//! operations are 64-bit (REX.W); floats are scalar SSE2 (movsd/addsd/...).
//! Branches and symbol loads emit 32-bit pc-relative placeholders patched
//! via [`PatchKind::PcRel32`], with the PC taken as the byte after the
//! displacement field.

use crate::error::{EmitError, EmitResult};
use crate::regs::{FReg, Reg};
use crate::sink::{ByteSink, Patch, PatchKind};

use super::{Cond, Emitter, Isa};

pub struct X86_64Emitter;

/// REX prefix: 0100WRXB
fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | (w as u8) << 3 | (r >> 3) << 2 | (x >> 3) << 1 | (b >> 3)
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    mode << 6 | (reg & 7) << 3 | (rm & 7)
}

/// setcc condition nibbles (0F 90+cc)
fn cc(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Lt => 0xC,
        Cond::Le => 0xE,
        Cond::Gt => 0xF,
        Cond::Ge => 0xD,
        Cond::Ult => 0x2,
        Cond::Ule => 0x6,
        Cond::Ugt => 0x7,
        Cond::Uge => 0x3,
    }
}

impl X86_64Emitter {
    /// ModRM memory operand [base + disp] with SIB where base requires it
    /// (rsp/r12 encodings collide with the SIB escape).
    fn mem_operand(&self, s: &mut ByteSink, reg: u8, base: u8, disp: i32) {
        let use_disp8 = (-128..=127).contains(&disp);
        let mode = if use_disp8 { 1 } else { 2 };
        if base & 7 == 4 {
            s.write_u8(modrm(mode, reg, 4));
            s.write_u8(0x24); // SIB: scale=0, no index, base=rsp/r12
        } else {
            s.write_u8(modrm(mode, reg, base));
        }
        if use_disp8 {
            s.write_u8(disp as i8 as u8);
        } else {
            s.write_u32(disp as u32);
        }
    }

    /// REX.W <op> /r with reg=`reg`, rm=`rm` (register-direct).
    fn alu_rr(&self, s: &mut ByteSink, opcode: u8, reg: Reg, rm: Reg) {
        s.write_u8(rex(true, reg.0, 0, rm.0));
        s.write_u8(opcode);
        s.write_u8(modrm(3, reg.0, rm.0));
    }

    /// Two-address lowering of `dst = a OP b` for ALU opcodes of the
    /// `op r/m64, r64` form (01 add, 29 sub, 21 and, 09 or, 31 xor).
    fn two_addr(
        &self,
        s: &mut ByteSink,
        opcode: u8,
        dst: Reg,
        a: Reg,
        b: Reg,
        commutative: bool,
    ) -> EmitResult<()> {
        if dst == a {
            self.alu_rr(s, opcode, b, dst);
        } else if dst == b {
            if commutative {
                self.alu_rr(s, opcode, a, dst);
            } else {
                // dst = a - dst  ⇒  neg dst; add dst, a
                self.neg(s, dst)?;
                self.alu_rr(s, 0x01, a, dst);
            }
        } else {
            self.mov_rr(s, dst, a)?;
            self.alu_rr(s, opcode, b, dst);
        }
        Ok(())
    }

    /// F2 [REX] 0F <op> /r - scalar double op, reg=dst, rm=src.
    fn sse_rr(&self, s: &mut ByteSink, op: u8, dst: u8, src: u8) {
        s.write_u8(0xF2);
        if dst >= 8 || src >= 8 {
            s.write_u8(rex(false, dst, 0, src));
        }
        s.write_u8(0x0F);
        s.write_u8(op);
        s.write_u8(modrm(3, dst, src));
    }

    /// Two-address lowering for scalar-double arithmetic.
    fn sse_two_addr(
        &self,
        s: &mut ByteSink,
        op: u8,
        dst: FReg,
        a: FReg,
        b: FReg,
        commutative: bool,
    ) -> EmitResult<()> {
        let regs = self.regs();
        if dst == a {
            self.sse_rr(s, op, dst.0, b.0);
        } else if dst == b {
            if commutative {
                self.sse_rr(s, op, dst.0, a.0);
            } else {
                self.fmov(s, regs.ftmp2, b)?;
                self.fmov(s, dst, a)?;
                self.sse_rr(s, op, dst.0, regs.ftmp2.0);
            }
        } else {
            self.fmov(s, dst, a)?;
            self.sse_rr(s, op, dst.0, b.0);
        }
        Ok(())
    }

    /// setcc into the low byte of `dst` (always REX-prefixed so the byte
    /// registers of rsp/rbp/rsi/rdi resolve to spl/bpl/sil/dil), then
    /// zero-extend to 64 bits.
    fn setcc_zx(&self, s: &mut ByteSink, cond_cc: u8, dst: Reg) {
        s.write_u8(rex(false, 0, 0, dst.0));
        s.write_u8(0x0F);
        s.write_u8(0x90 | cond_cc);
        s.write_u8(modrm(3, 0, dst.0));
        // movzx dst, dst_low
        s.write_u8(rex(true, dst.0, 0, dst.0));
        s.write_u8(0x0F);
        s.write_u8(0xB6);
        s.write_u8(modrm(3, dst.0, dst.0));
    }

    /// ucomisd a, b
    fn ucomisd(&self, s: &mut ByteSink, a: u8, b: u8) {
        s.write_u8(0x66);
        if a >= 8 || b >= 8 {
            s.write_u8(rex(false, a, 0, b));
        }
        s.write_u8(0x0F);
        s.write_u8(0x2E);
        s.write_u8(modrm(3, a, b));
    }

    /// jcc rel32 with a patch on the displacement field.
    fn jcc(&self, s: &mut ByteSink, cond_cc: u8, label: &str) {
        s.write_u8(0x0F);
        s.write_u8(0x80 | cond_cc);
        let at = s.position();
        s.request_patch(at, label, PatchKind::PcRel32);
        s.write_u32(0);
    }
}

impl Emitter for X86_64Emitter {
    fn isa(&self) -> Isa {
        Isa::X86_64
    }

    fn mov_rr(&self, s: &mut ByteSink, dst: Reg, src: Reg) -> EmitResult<()> {
        self.alu_rr(s, 0x89, src, dst);
        Ok(())
    }

    fn mov_ri(&self, s: &mut ByteSink, dst: Reg, imm: i64) -> EmitResult<()> {
        if i32::try_from(imm).is_ok() {
            // REX.W C7 /0 imm32 (sign-extended)
            s.write_u8(rex(true, 0, 0, dst.0));
            s.write_u8(0xC7);
            s.write_u8(modrm(3, 0, dst.0));
            s.write_u32(imm as i32 as u32);
        } else {
            // movabs: REX.W B8+rd imm64
            s.write_u8(rex(true, 0, 0, dst.0));
            s.write_u8(0xB8 | (dst.0 & 7));
            s.write_u64(imm as u64);
        }
        Ok(())
    }

    fn load(&self, s: &mut ByteSink, dst: Reg, base: Reg, disp: i32) -> EmitResult<()> {
        s.write_u8(rex(true, dst.0, 0, base.0));
        s.write_u8(0x8B);
        self.mem_operand(s, dst.0, base.0, disp);
        Ok(())
    }

    fn store(&self, s: &mut ByteSink, base: Reg, disp: i32, src: Reg) -> EmitResult<()> {
        s.write_u8(rex(true, src.0, 0, base.0));
        s.write_u8(0x89);
        self.mem_operand(s, src.0, base.0, disp);
        Ok(())
    }

    fn load_u8(&self, s: &mut ByteSink, dst: Reg, base: Reg, disp: i32) -> EmitResult<()> {
        // movzx r64, byte [base+disp]
        s.write_u8(rex(true, dst.0, 0, base.0));
        s.write_u8(0x0F);
        s.write_u8(0xB6);
        self.mem_operand(s, dst.0, base.0, disp);
        Ok(())
    }

    fn store_u8(&self, s: &mut ByteSink, base: Reg, disp: i32, src: Reg) -> EmitResult<()> {
        // mov byte [base+disp], src8 (REX keeps sil/dil/spl/bpl addressable)
        s.write_u8(rex(false, src.0, 0, base.0));
        s.write_u8(0x88);
        self.mem_operand(s, src.0, base.0, disp);
        Ok(())
    }

    fn fload(&self, s: &mut ByteSink, dst: FReg, base: Reg, disp: i32) -> EmitResult<()> {
        s.write_u8(0xF2);
        if dst.0 >= 8 || base.0 >= 8 {
            s.write_u8(rex(false, dst.0, 0, base.0));
        }
        s.write_u8(0x0F);
        s.write_u8(0x10);
        self.mem_operand(s, dst.0, base.0, disp);
        Ok(())
    }

    fn fstore(&self, s: &mut ByteSink, base: Reg, disp: i32, src: FReg) -> EmitResult<()> {
        s.write_u8(0xF2);
        if src.0 >= 8 || base.0 >= 8 {
            s.write_u8(rex(false, src.0, 0, base.0));
        }
        s.write_u8(0x0F);
        s.write_u8(0x11);
        self.mem_operand(s, src.0, base.0, disp);
        Ok(())
    }

    fn fmov(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        if dst != src {
            self.sse_rr(s, 0x10, dst.0, src.0);
        }
        Ok(())
    }

    fn fmov_to_gpr(&self, s: &mut ByteSink, dst: Reg, src: FReg) -> EmitResult<()> {
        // movq r/m64, xmm: 66 REX.W 0F 7E /r
        s.write_u8(0x66);
        s.write_u8(rex(true, src.0, 0, dst.0));
        s.write_u8(0x0F);
        s.write_u8(0x7E);
        s.write_u8(modrm(3, src.0, dst.0));
        Ok(())
    }

    fn fmov_from_gpr(&self, s: &mut ByteSink, dst: FReg, src: Reg) -> EmitResult<()> {
        // movq xmm, r/m64: 66 REX.W 0F 6E /r
        s.write_u8(0x66);
        s.write_u8(rex(true, dst.0, 0, src.0));
        s.write_u8(0x0F);
        s.write_u8(0x6E);
        s.write_u8(modrm(3, dst.0, src.0));
        Ok(())
    }

    fn lea_symbol(&self, s: &mut ByteSink, dst: Reg, symbol: &str) -> EmitResult<()> {
        // lea dst, [rip + disp32]
        s.write_u8(rex(true, dst.0, 0, 0));
        s.write_u8(0x8D);
        s.write_u8(modrm(0, dst.0, 5));
        let at = s.position();
        s.request_patch(at, symbol, PatchKind::PcRel32);
        s.write_u32(0);
        Ok(())
    }

    fn add_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.two_addr(s, 0x01, dst, a, b, true)
    }

    fn sub_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.two_addr(s, 0x29, dst, a, b, false)
    }

    fn mul_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        // imul r64, r/m64: REX.W 0F AF /r (reg = dst)
        let src = if dst == a {
            b
        } else if dst == b {
            a
        } else {
            self.mov_rr(s, dst, a)?;
            b
        };
        s.write_u8(rex(true, dst.0, 0, src.0));
        s.write_u8(0x0F);
        s.write_u8(0xAF);
        s.write_u8(modrm(3, dst.0, src.0));
        Ok(())
    }

    fn sdiv_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        // idiv divides rdx:rax; clobbers rax, rdx, tmp0. Order the two
        // setup moves so neither clobbers the other's source.
        let rax = Reg(0);
        let tmp = self.regs().tmp0;
        if b == rax {
            self.mov_rr(s, tmp, b)?;
            if a != rax {
                self.mov_rr(s, rax, a)?;
            }
        } else {
            if a != rax {
                self.mov_rr(s, rax, a)?;
            }
            self.mov_rr(s, tmp, b)?;
        }
        // cqo
        s.write_u8(0x48);
        s.write_u8(0x99);
        // idiv tmp: REX.W F7 /7
        s.write_u8(rex(true, 0, 0, tmp.0));
        s.write_u8(0xF7);
        s.write_u8(modrm(3, 7, tmp.0));
        if dst != rax {
            self.mov_rr(s, dst, rax)?;
        }
        Ok(())
    }

    fn and_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.two_addr(s, 0x21, dst, a, b, true)
    }

    fn or_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.two_addr(s, 0x09, dst, a, b, true)
    }

    fn xor_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.two_addr(s, 0x31, dst, a, b, true)
    }

    fn shl_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.shift_rr(s, 4, dst, a, b)
    }

    fn shr_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.shift_rr(s, 5, dst, a, b)
    }

    fn sar_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.shift_rr(s, 7, dst, a, b)
    }

    fn neg(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        s.write_u8(rex(true, 0, 0, dst.0));
        s.write_u8(0xF7);
        s.write_u8(modrm(3, 3, dst.0));
        Ok(())
    }

    fn not_(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        s.write_u8(rex(true, 0, 0, dst.0));
        s.write_u8(0xF7);
        s.write_u8(modrm(3, 2, dst.0));
        Ok(())
    }

    fn inc(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        s.write_u8(rex(true, 0, 0, dst.0));
        s.write_u8(0xFF);
        s.write_u8(modrm(3, 0, dst.0));
        Ok(())
    }

    fn dec(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        s.write_u8(rex(true, 0, 0, dst.0));
        s.write_u8(0xFF);
        s.write_u8(modrm(3, 1, dst.0));
        Ok(())
    }

    fn add_ri(&self, s: &mut ByteSink, dst: Reg, imm: i32) -> EmitResult<()> {
        self.alu_ri(s, 0, dst, imm);
        Ok(())
    }

    fn sub_ri(&self, s: &mut ByteSink, dst: Reg, imm: i32) -> EmitResult<()> {
        self.alu_ri(s, 5, dst, imm);
        Ok(())
    }

    fn shl_ri(&self, s: &mut ByteSink, dst: Reg, amount: u8) -> EmitResult<()> {
        self.shift_ri(s, 4, dst, amount);
        Ok(())
    }

    fn shr_ri(&self, s: &mut ByteSink, dst: Reg, amount: u8) -> EmitResult<()> {
        self.shift_ri(s, 5, dst, amount);
        Ok(())
    }

    fn sar_ri(&self, s: &mut ByteSink, dst: Reg, amount: u8) -> EmitResult<()> {
        self.shift_ri(s, 7, dst, amount);
        Ok(())
    }

    fn set_cmp(&self, s: &mut ByteSink, cond: Cond, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.alu_rr(s, 0x39, b, a); // cmp a, b
        self.setcc_zx(s, cc(cond), dst);
        Ok(())
    }

    fn fadd(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.sse_two_addr(s, 0x58, dst, a, b, true)
    }

    fn fsub(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.sse_two_addr(s, 0x5C, dst, a, b, false)
    }

    fn fmul(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.sse_two_addr(s, 0x59, dst, a, b, true)
    }

    fn fdiv(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.sse_two_addr(s, 0x5E, dst, a, b, false)
    }

    fn fsqrt(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        self.sse_rr(s, 0x51, dst.0, src.0);
        Ok(())
    }

    fn fabs_(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        // Clear the sign bit through a GPR: btr tmp, 63
        let tmp = self.regs().tmp0;
        self.fmov_to_gpr(s, tmp, src)?;
        s.write_u8(rex(true, 0, 0, tmp.0));
        s.write_u8(0x0F);
        s.write_u8(0xBA);
        s.write_u8(modrm(3, 6, tmp.0));
        s.write_u8(63);
        self.fmov_from_gpr(s, dst, tmp)
    }

    fn fneg_(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        // Flip the sign bit through a GPR: btc tmp, 63
        let tmp = self.regs().tmp0;
        self.fmov_to_gpr(s, tmp, src)?;
        s.write_u8(rex(true, 0, 0, tmp.0));
        s.write_u8(0x0F);
        s.write_u8(0xBA);
        s.write_u8(modrm(3, 7, tmp.0));
        s.write_u8(63);
        self.fmov_from_gpr(s, dst, tmp)
    }

    fn fround32(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        // cvtsd2ss then cvtss2sd
        self.sse_rr(s, 0x5A, dst.0, src.0);
        s.write_u8(0xF3);
        if dst.0 >= 8 {
            s.write_u8(rex(false, dst.0, 0, dst.0));
        }
        s.write_u8(0x0F);
        s.write_u8(0x5A);
        s.write_u8(modrm(3, dst.0, dst.0));
        Ok(())
    }

    fn cvt_i2f(&self, s: &mut ByteSink, dst: FReg, src: Reg) -> EmitResult<()> {
        // cvtsi2sd xmm, r64: F2 REX.W 0F 2A /r
        s.write_u8(0xF2);
        s.write_u8(rex(true, dst.0, 0, src.0));
        s.write_u8(0x0F);
        s.write_u8(0x2A);
        s.write_u8(modrm(3, dst.0, src.0));
        Ok(())
    }

    fn cvt_f2i(&self, s: &mut ByteSink, dst: Reg, src: FReg) -> EmitResult<()> {
        // cvttsd2si r64, xmm: F2 REX.W 0F 2C /r
        s.write_u8(0xF2);
        s.write_u8(rex(true, dst.0, 0, src.0));
        s.write_u8(0x0F);
        s.write_u8(0x2C);
        s.write_u8(modrm(3, dst.0, src.0));
        Ok(())
    }

    fn fset_cmp(&self, s: &mut ByteSink, cond: Cond, dst: Reg, a: FReg, b: FReg) -> EmitResult<()> {
        let tmp = self.regs().tmp0;
        match cond {
            // CF-based conditions are NaN-correct after ucomisd.
            Cond::Gt | Cond::Ugt => {
                self.ucomisd(s, a.0, b.0);
                self.setcc_zx(s, cc(Cond::Ugt), dst);
            }
            Cond::Ge | Cond::Uge => {
                self.ucomisd(s, a.0, b.0);
                self.setcc_zx(s, cc(Cond::Uge), dst);
            }
            Cond::Lt | Cond::Ult => {
                self.ucomisd(s, b.0, a.0);
                self.setcc_zx(s, cc(Cond::Ugt), dst);
            }
            Cond::Le | Cond::Ule => {
                self.ucomisd(s, b.0, a.0);
                self.setcc_zx(s, cc(Cond::Uge), dst);
            }
            Cond::Eq => {
                // sete ∧ setnp (ZF set and not unordered)
                self.ucomisd(s, a.0, b.0);
                self.setcc_zx(s, 0x4, dst);
                self.setcc_zx(s, 0xB, tmp); // setnp
                self.alu_rr(s, 0x21, tmp, dst); // and dst, tmp
            }
            Cond::Ne => {
                // setne ∨ setp
                self.ucomisd(s, a.0, b.0);
                self.setcc_zx(s, 0x5, dst);
                self.setcc_zx(s, 0xA, tmp); // setp
                self.alu_rr(s, 0x09, tmp, dst); // or dst, tmp
            }
        }
        Ok(())
    }

    fn jump(&self, s: &mut ByteSink, label: &str) -> EmitResult<()> {
        s.write_u8(0xE9);
        let at = s.position();
        s.request_patch(at, label, PatchKind::PcRel32);
        s.write_u32(0);
        Ok(())
    }

    fn br_cmp(&self, s: &mut ByteSink, cond: Cond, a: Reg, b: Reg, label: &str) -> EmitResult<()> {
        self.alu_rr(s, 0x39, b, a); // cmp a, b
        self.jcc(s, cc(cond), label);
        Ok(())
    }

    fn br_zero(&self, s: &mut ByteSink, r: Reg, label: &str) -> EmitResult<()> {
        self.alu_rr(s, 0x85, r, r); // test r, r
        self.jcc(s, cc(Cond::Eq), label);
        Ok(())
    }

    fn br_nonzero(&self, s: &mut ByteSink, r: Reg, label: &str) -> EmitResult<()> {
        self.alu_rr(s, 0x85, r, r);
        self.jcc(s, cc(Cond::Ne), label);
        Ok(())
    }

    fn call_label(&self, s: &mut ByteSink, label: &str) -> EmitResult<()> {
        s.write_u8(0xE8);
        let at = s.position();
        s.request_patch(at, label, PatchKind::PcRel32);
        s.write_u32(0);
        Ok(())
    }

    fn call_reg(&self, s: &mut ByteSink, r: Reg) -> EmitResult<()> {
        if r.0 >= 8 {
            s.write_u8(rex(false, 0, 0, r.0));
        }
        s.write_u8(0xFF);
        s.write_u8(modrm(3, 2, r.0));
        Ok(())
    }

    fn ret(&self, s: &mut ByteSink) -> EmitResult<()> {
        s.write_u8(0xC3);
        Ok(())
    }

    fn syscall(&self, s: &mut ByteSink) -> EmitResult<()> {
        s.write_u8(0x0F);
        s.write_u8(0x05);
        Ok(())
    }

    fn push(&self, s: &mut ByteSink, r: Reg) -> EmitResult<()> {
        if r.0 >= 8 {
            s.write_u8(0x41);
        }
        s.write_u8(0x50 | (r.0 & 7));
        Ok(())
    }

    fn pop(&self, s: &mut ByteSink, r: Reg) -> EmitResult<()> {
        if r.0 >= 8 {
            s.write_u8(0x41);
        }
        s.write_u8(0x58 | (r.0 & 7));
        Ok(())
    }

    fn fpush(&self, s: &mut ByteSink, f: FReg) -> EmitResult<()> {
        self.sub_ri(s, Reg(4), 8)?;
        self.fstore(s, Reg(4), 0, f)
    }

    fn fpop(&self, s: &mut ByteSink, f: FReg) -> EmitResult<()> {
        self.fload(s, f, Reg(4), 0)?;
        self.add_ri(s, Reg(4), 8)
    }

    fn prologue(&self, s: &mut ByteSink, frame_size: u32) -> EmitResult<()> {
        self.push(s, Reg(5))?; // push rbp
        self.mov_rr(s, Reg(5), Reg(4))?; // mov rbp, rsp
        if frame_size > 0 {
            self.sub_ri(s, Reg(4), frame_size as i32)?;
        }
        Ok(())
    }

    fn epilogue(&self, s: &mut ByteSink) -> EmitResult<()> {
        s.write_u8(0xC9); // leave
        s.write_u8(0xC3); // ret
        Ok(())
    }

    fn sp_adjust(&self, s: &mut ByteSink, delta: i32) -> EmitResult<()> {
        if delta > 0 {
            self.add_ri(s, Reg(4), delta)
        } else if delta < 0 {
            self.sub_ri(s, Reg(4), -delta)
        } else {
            Ok(())
        }
    }

    fn set_vararg_count(&self, s: &mut ByteSink, nfloat: u8) -> EmitResult<()> {
        // mov al, imm8
        s.write_u8(0xB0);
        s.write_u8(nfloat);
        Ok(())
    }

    fn spill_misaligns(&self) -> bool {
        true
    }

    fn atomic_fetch_add(
        &self,
        s: &mut ByteSink,
        old_dst: Reg,
        base: Reg,
        addend: Reg,
    ) -> EmitResult<()> {
        let val = if old_dst == addend {
            addend
        } else {
            self.mov_rr(s, old_dst, addend)?;
            old_dst
        };
        // lock xadd [base], val
        s.write_u8(0xF0);
        s.write_u8(rex(true, val.0, 0, base.0));
        s.write_u8(0x0F);
        s.write_u8(0xC1);
        self.mem_operand(s, val.0, base.0, 0);
        Ok(())
    }

    fn atomic_store(&self, s: &mut ByteSink, base: Reg, src: Reg) -> EmitResult<()> {
        // xchg is implicitly locked; clobbers tmp0 to preserve src.
        let tmp = self.regs().tmp0;
        self.mov_rr(s, tmp, src)?;
        s.write_u8(rex(true, tmp.0, 0, base.0));
        s.write_u8(0x87);
        self.mem_operand(s, tmp.0, base.0, 0);
        Ok(())
    }

    fn atomic_load(&self, s: &mut ByteSink, dst: Reg, base: Reg) -> EmitResult<()> {
        // Plain 64-bit loads are acquire on x86 (TSO).
        self.load(s, dst, base, 0)
    }

    fn apply_patch(&self, code: &mut [u8], patch: &Patch, target: u64, base: u64) -> EmitResult<()> {
        match patch.kind {
            PatchKind::PcRel32 => {
                let pc = base + patch.at as u64 + 4;
                let disp = target as i64 - pc as i64;
                if i32::try_from(disp).is_err() {
                    return Err(EmitError::BranchOutOfRange {
                        symbol: patch.symbol.clone(),
                        disp,
                        what: "rel32",
                    });
                }
                code[patch.at..patch.at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
                Ok(())
            }
            PatchKind::Abs64 => {
                code[patch.at..patch.at + 8].copy_from_slice(&target.to_le_bytes());
                Ok(())
            }
            _ => Err(EmitError::Internal {
                message: format!("patch kind {:?} on x86_64", patch.kind),
            }),
        }
    }
}

impl X86_64Emitter {
    fn alu_ri(&self, s: &mut ByteSink, ext: u8, dst: Reg, imm: i32) {
        if (-128..=127).contains(&imm) {
            s.write_u8(rex(true, 0, 0, dst.0));
            s.write_u8(0x83);
            s.write_u8(modrm(3, ext, dst.0));
            s.write_u8(imm as i8 as u8);
        } else {
            s.write_u8(rex(true, 0, 0, dst.0));
            s.write_u8(0x81);
            s.write_u8(modrm(3, ext, dst.0));
            s.write_u32(imm as u32);
        }
    }

    fn shift_ri(&self, s: &mut ByteSink, ext: u8, dst: Reg, amount: u8) {
        s.write_u8(rex(true, 0, 0, dst.0));
        s.write_u8(0xC1);
        s.write_u8(modrm(3, ext, dst.0));
        s.write_u8(amount & 63);
    }

    /// Shift dst = a OP b through cl. Clobbers rcx; dst must not be rcx.
    fn shift_rr(&self, s: &mut ByteSink, ext: u8, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        let rcx = Reg(1);
        if dst == rcx {
            return Err(EmitError::Internal {
                message: "shift destination may not be rcx".to_string(),
            });
        }
        if b != rcx {
            self.mov_rr(s, rcx, b)?;
        }
        if dst != a {
            self.mov_rr(s, dst, a)?;
        }
        s.write_u8(rex(true, 0, 0, dst.0));
        s.write_u8(0xD3);
        s.write_u8(modrm(3, ext, dst.0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::Segment;

    fn sink() -> ByteSink {
        ByteSink::new(Segment::Text)
    }

    #[test]
    fn test_mov_rr() {
        let e = X86_64Emitter;
        let mut s = sink();
        // mov rax, rdi → 48 89 F8
        e.mov_rr(&mut s, Reg(0), Reg(7)).unwrap();
        assert_eq!(s.bytes(), &[0x48, 0x89, 0xF8]);
    }

    #[test]
    fn test_mov_ri_small_and_large() {
        let e = X86_64Emitter;
        let mut s = sink();
        // mov rax, 42 → 48 C7 C0 2A 00 00 00
        e.mov_ri(&mut s, Reg(0), 42).unwrap();
        assert_eq!(s.bytes(), &[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00]);

        let mut s = sink();
        // movabs r11, 0x1122334455667788 → 49 BB 88 77 66 55 44 33 22 11
        e.mov_ri(&mut s, Reg(11), 0x1122334455667788).unwrap();
        assert_eq!(
            s.bytes(),
            &[0x49, 0xBB, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_load_store_disp8() {
        let e = X86_64Emitter;
        let mut s = sink();
        // mov rax, [rbp-8] → 48 8B 45 F8
        e.load(&mut s, Reg(0), Reg(5), -8).unwrap();
        assert_eq!(s.bytes(), &[0x48, 0x8B, 0x45, 0xF8]);

        let mut s = sink();
        // mov [rbp-16], rdi → 48 89 7D F0
        e.store(&mut s, Reg(5), -16, Reg(7)).unwrap();
        assert_eq!(s.bytes(), &[0x48, 0x89, 0x7D, 0xF0]);
    }

    #[test]
    fn test_rsp_base_uses_sib() {
        let e = X86_64Emitter;
        let mut s = sink();
        // mov rax, [rsp+8] → 48 8B 44 24 08
        e.load(&mut s, Reg(0), Reg(4), 8).unwrap();
        assert_eq!(s.bytes(), &[0x48, 0x8B, 0x44, 0x24, 0x08]);
    }

    #[test]
    fn test_movsd_load() {
        let e = X86_64Emitter;
        let mut s = sink();
        // movsd xmm0, [rbp-8] → F2 0F 10 45 F8
        e.fload(&mut s, FReg(0), Reg(5), -8).unwrap();
        assert_eq!(s.bytes(), &[0xF2, 0x0F, 0x10, 0x45, 0xF8]);
    }

    #[test]
    fn test_addsd() {
        let e = X86_64Emitter;
        let mut s = sink();
        // addsd xmm0, xmm1 → F2 0F 58 C1
        e.fadd(&mut s, FReg(0), FReg(0), FReg(1)).unwrap();
        assert_eq!(s.bytes(), &[0xF2, 0x0F, 0x58, 0xC1]);
    }

    #[test]
    fn test_movq_round_trip_encodings() {
        let e = X86_64Emitter;
        let mut s = sink();
        // movq rax, xmm0 → 66 48 0F 7E C0
        e.fmov_to_gpr(&mut s, Reg(0), FReg(0)).unwrap();
        // movq xmm0, rax → 66 48 0F 6E C0
        e.fmov_from_gpr(&mut s, FReg(0), Reg(0)).unwrap();
        assert_eq!(
            s.bytes(),
            &[0x66, 0x48, 0x0F, 0x7E, 0xC0, 0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
    }

    #[test]
    fn test_call_and_patch() {
        let e = X86_64Emitter;
        let mut s = sink();
        e.call_label(&mut s, "f").unwrap();
        assert_eq!(s.bytes()[0], 0xE8);
        assert_eq!(s.position(), 5);

        // Target 0x2010 from a call at base 0x2000: disp = 0x2010 - 0x2005.
        let patch = s.patches()[0].clone();
        let mut code = s.bytes().to_vec();
        e.apply_patch(&mut code, &patch, 0x2010, 0x2000).unwrap();
        let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(disp, 0x0B);
    }

    #[test]
    fn test_prologue_epilogue() {
        let e = X86_64Emitter;
        let mut s = sink();
        e.prologue(&mut s, 32).unwrap();
        // push rbp; mov rbp, rsp; sub rsp, 32
        assert_eq!(s.bytes(), &[0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20]);
        let mut s = sink();
        e.epilogue(&mut s).unwrap();
        assert_eq!(s.bytes(), &[0xC9, 0xC3]);
    }

    #[test]
    fn test_syscall_ret() {
        let e = X86_64Emitter;
        let mut s = sink();
        e.syscall(&mut s).unwrap();
        e.ret(&mut s).unwrap();
        assert_eq!(s.bytes(), &[0x0F, 0x05, 0xC3]);
    }

    #[test]
    fn test_push_pop_extended() {
        let e = X86_64Emitter;
        let mut s = sink();
        e.push(&mut s, Reg(13)).unwrap(); // push r13 → 41 55
        e.pop(&mut s, Reg(13)).unwrap(); // pop r13 → 41 5D
        assert_eq!(s.bytes(), &[0x41, 0x55, 0x41, 0x5D]);
    }

    #[test]
    fn test_sub_sets_up_two_address_form() {
        let e = X86_64Emitter;
        let mut s = sink();
        // dst==b non-commutative: rax = rdi - rax ⇒ neg rax; add rax, rdi
        e.sub_rr(&mut s, Reg(0), Reg(7), Reg(0)).unwrap();
        assert_eq!(s.bytes(), &[0x48, 0xF7, 0xD8, 0x48, 0x01, 0xF8]);
    }

    #[test]
    fn test_atomic_fetch_add() {
        let e = X86_64Emitter;
        let mut s = sink();
        // mov rax, rsi; lock xadd [rdi], rax
        e.atomic_fetch_add(&mut s, Reg(0), Reg(7), Reg(6)).unwrap();
        assert_eq!(
            s.bytes(),
            &[0x48, 0x89, 0xF0, 0xF0, 0x48, 0x0F, 0xC1, 0x47, 0x00]
        );
    }

    #[test]
    fn test_atomic_store_via_xchg() {
        let e = X86_64Emitter;
        let mut s = sink();
        // mov r11, rax; xchg [rdi], r11
        e.atomic_store(&mut s, Reg(7), Reg(0)).unwrap();
        assert_eq!(s.bytes(), &[0x49, 0x89, 0xC3, 0x4C, 0x87, 0x5F, 0x00]);
    }

    #[test]
    fn test_rel32_out_of_range_rejected() {
        let e = X86_64Emitter;
        let patch = Patch {
            at: 0,
            symbol: "far".to_string(),
            kind: PatchKind::PcRel32,
            anchor: 0,
        };
        let mut code = vec![0u8; 4];
        let err = e.apply_patch(&mut code, &patch, 0x2_0000_0000, 0).unwrap_err();
        assert!(matches!(err, EmitError::BranchOutOfRange { .. }));
    }
}
