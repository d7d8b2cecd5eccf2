//! ARM64 (AArch64) instruction encoder
//!
//! Fixed-width 32-bit little-endian instruction words per the Arm ARM
//! (A64 base + FP). Data references use ADRP+ADD pairs; branches carry
//! 26-bit (B/BL) or 19-bit (B.cond/CBZ) word-addressed displacements.
//! `sp` (encoding 31) aliases `xzr` in most ALU forms, so register moves
//! involving sp go through the ADD-immediate alias.

use crate::error::{EmitError, EmitResult};
use crate::regs::{FReg, Reg, A64_ZR};
use crate::sink::{ByteSink, Patch, PatchKind};

use super::{Cond, Emitter, Isa};

pub struct Aarch64Emitter;

const SP: u8 = 31;

/// A64 condition codes
fn cc(cond: Cond) -> u32 {
    match cond {
        Cond::Eq => 0b0000,
        Cond::Ne => 0b0001,
        Cond::Uge => 0b0010, // cs/hs
        Cond::Ult => 0b0011, // cc/lo
        Cond::Ugt => 0b1000, // hi
        Cond::Ule => 0b1001, // ls
        Cond::Ge => 0b1010,
        Cond::Lt => 0b1011,
        Cond::Gt => 0b1100,
        Cond::Le => 0b1101,
    }
}

/// Float condition codes chosen so unordered compares come out false
/// (mi/ls instead of lt/le), matching IEEE semantics after FCMP.
fn fcc(cond: Cond) -> u32 {
    match cond {
        Cond::Eq => 0b0000,
        Cond::Ne => 0b0001,
        Cond::Lt | Cond::Ult => 0b0100, // mi
        Cond::Le | Cond::Ule => 0b1001, // ls
        Cond::Gt | Cond::Ugt => 0b1100,
        Cond::Ge | Cond::Uge => 0b1010,
    }
}

impl Aarch64Emitter {
    fn word(&self, s: &mut ByteSink, w: u32) {
        s.write_u32(w);
    }

    /// ADD/SUB (immediate): op 0x91000000 add / 0xD1000000 sub.
    /// Falls back to a materialized constant for immediates beyond the
    /// 12-bit (optionally shifted) range.
    fn addsub_imm(&self, s: &mut ByteSink, sub: bool, dst: Reg, src: Reg, imm: u32) -> EmitResult<()> {
        let base: u32 = if sub { 0xD100_0000 } else { 0x9100_0000 };
        if imm < 0x1000 {
            self.word(s, base | imm << 10 | (src.0 as u32) << 5 | dst.0 as u32);
        } else if imm < 0x100_0000 && imm & 0xFFF == 0 {
            // shifted-by-12 form
            self.word(s, base | 1 << 22 | (imm >> 12) << 10 | (src.0 as u32) << 5 | dst.0 as u32);
        } else if imm < 0x100_0000 {
            self.addsub_imm(s, sub, dst, src, imm & !0xFFF)?;
            self.addsub_imm(s, sub, dst, dst, imm & 0xFFF)?;
        } else {
            return Err(EmitError::UnencodableImmediate {
                value: imm as i64,
                what: "A64 add/sub immediate",
                offset: s.position(),
            });
        }
        Ok(())
    }

    /// subs xzr, a, b - flag-setting compare.
    fn cmp_rr(&self, s: &mut ByteSink, a: Reg, b: Reg) {
        self.word(s, 0xEB00_001F | (b.0 as u32) << 16 | (a.0 as u32) << 5);
    }

    /// cset dst, cond ⇔ csinc dst, xzr, xzr, invert(cond)
    fn cset(&self, s: &mut ByteSink, cond_bits: u32, dst: Reg) {
        self.word(s, 0x9A9F_07E0 | (cond_bits ^ 1) << 12 | dst.0 as u32);
    }

    fn bcond(&self, s: &mut ByteSink, cond_bits: u32, label: &str) {
        let at = s.position();
        s.request_patch(at, label, PatchKind::A64Cond19);
        self.word(s, 0x5400_0000 | cond_bits);
    }
}

impl Emitter for Aarch64Emitter {
    fn isa(&self) -> Isa {
        Isa::Aarch64
    }

    fn mov_rr(&self, s: &mut ByteSink, dst: Reg, src: Reg) -> EmitResult<()> {
        if dst == src {
            return Ok(());
        }
        if dst.0 == SP || src.0 == SP {
            // mov (to/from SP) is ADD Xd, Xn, #0
            self.addsub_imm(s, false, dst, src, 0)
        } else {
            // orr Xd, xzr, Xm
            self.word(s, 0xAA00_03E0 | (src.0 as u32) << 16 | dst.0 as u32);
            Ok(())
        }
    }

    fn mov_ri(&self, s: &mut ByteSink, dst: Reg, imm: i64) -> EmitResult<()> {
        let bits = imm as u64;
        let chunks: [u16; 4] = std::array::from_fn(|i| (bits >> (16 * i)) as u16);
        let ones = chunks.iter().filter(|&&c| c == 0xFFFF).count();
        let zeros = chunks.iter().filter(|&&c| c == 0).count();
        if ones > zeros {
            // MOVN path: start from all-ones
            let first = chunks.iter().position(|&c| c != 0xFFFF).unwrap_or(0);
            self.word(
                s,
                0x9280_0000
                    | (first as u32) << 21
                    | ((!chunks[first]) as u32) << 5
                    | dst.0 as u32,
            );
            for (i, &c) in chunks.iter().enumerate() {
                if i != first && c != 0xFFFF {
                    self.word(s, 0xF280_0000 | (i as u32) << 21 | (c as u32) << 5 | dst.0 as u32);
                }
            }
        } else {
            // MOVZ path: start from zero
            let first = chunks.iter().position(|&c| c != 0).unwrap_or(0);
            self.word(
                s,
                0xD280_0000 | (first as u32) << 21 | (chunks[first] as u32) << 5 | dst.0 as u32,
            );
            for (i, &c) in chunks.iter().enumerate() {
                if i != first && c != 0 {
                    self.word(s, 0xF280_0000 | (i as u32) << 21 | (c as u32) << 5 | dst.0 as u32);
                }
            }
        }
        Ok(())
    }

    fn load(&self, s: &mut ByteSink, dst: Reg, base: Reg, disp: i32) -> EmitResult<()> {
        if disp >= 0 && disp <= 32760 && disp % 8 == 0 {
            // LDR (unsigned scaled offset)
            self.word(
                s,
                0xF940_0000 | ((disp as u32 / 8) << 10) | (base.0 as u32) << 5 | dst.0 as u32,
            );
        } else if (-256..=255).contains(&disp) {
            // LDUR
            self.word(
                s,
                0xF840_0000 | ((disp as u32 & 0x1FF) << 12) | (base.0 as u32) << 5 | dst.0 as u32,
            );
        } else {
            let scratch = self.mem_scratch(base)?;
            self.mov_ri(s, scratch, disp as i64)?;
            // add scratch, scratch, base
            self.add_rr(s, scratch, scratch, base)?;
            self.word(s, 0xF940_0000 | (scratch.0 as u32) << 5 | dst.0 as u32);
        }
        Ok(())
    }

    fn store(&self, s: &mut ByteSink, base: Reg, disp: i32, src: Reg) -> EmitResult<()> {
        if disp >= 0 && disp <= 32760 && disp % 8 == 0 {
            self.word(
                s,
                0xF900_0000 | ((disp as u32 / 8) << 10) | (base.0 as u32) << 5 | src.0 as u32,
            );
        } else if (-256..=255).contains(&disp) {
            // STUR
            self.word(
                s,
                0xF800_0000 | ((disp as u32 & 0x1FF) << 12) | (base.0 as u32) << 5 | src.0 as u32,
            );
        } else {
            let scratch = self.mem_scratch_excluding(base, src)?;
            self.mov_ri(s, scratch, disp as i64)?;
            self.add_rr(s, scratch, scratch, base)?;
            self.word(s, 0xF900_0000 | (scratch.0 as u32) << 5 | src.0 as u32);
        }
        Ok(())
    }

    fn load_u8(&self, s: &mut ByteSink, dst: Reg, base: Reg, disp: i32) -> EmitResult<()> {
        if (0..=4095).contains(&disp) {
            // ldrb Wt, [Xn, #imm]
            self.word(s, 0x3940_0000 | (disp as u32) << 10 | (base.0 as u32) << 5 | dst.0 as u32);
        } else if (-256..=255).contains(&disp) {
            // ldurb
            self.word(
                s,
                0x3840_0000 | ((disp as u32 & 0x1FF) << 12) | (base.0 as u32) << 5 | dst.0 as u32,
            );
        } else {
            let scratch = self.mem_scratch(base)?;
            self.mov_ri(s, scratch, disp as i64)?;
            self.add_rr(s, scratch, scratch, base)?;
            self.word(s, 0x3940_0000 | (scratch.0 as u32) << 5 | dst.0 as u32);
        }
        Ok(())
    }

    fn store_u8(&self, s: &mut ByteSink, base: Reg, disp: i32, src: Reg) -> EmitResult<()> {
        if (0..=4095).contains(&disp) {
            // strb Wt, [Xn, #imm]
            self.word(s, 0x3900_0000 | (disp as u32) << 10 | (base.0 as u32) << 5 | src.0 as u32);
        } else if (-256..=255).contains(&disp) {
            // sturb
            self.word(
                s,
                0x3800_0000 | ((disp as u32 & 0x1FF) << 12) | (base.0 as u32) << 5 | src.0 as u32,
            );
        } else {
            let scratch = self.mem_scratch_excluding(base, src)?;
            self.mov_ri(s, scratch, disp as i64)?;
            self.add_rr(s, scratch, scratch, base)?;
            self.word(s, 0x3900_0000 | (scratch.0 as u32) << 5 | src.0 as u32);
        }
        Ok(())
    }

    fn fload(&self, s: &mut ByteSink, dst: FReg, base: Reg, disp: i32) -> EmitResult<()> {
        if disp >= 0 && disp <= 32760 && disp % 8 == 0 {
            // LDR (SIMD&FP, 64-bit, unsigned scaled)
            self.word(
                s,
                0xFD40_0000 | ((disp as u32 / 8) << 10) | (base.0 as u32) << 5 | dst.0 as u32,
            );
        } else if (-256..=255).contains(&disp) {
            // LDUR (SIMD&FP)
            self.word(
                s,
                0xFC40_0000 | ((disp as u32 & 0x1FF) << 12) | (base.0 as u32) << 5 | dst.0 as u32,
            );
        } else {
            let scratch = self.mem_scratch(base)?;
            self.mov_ri(s, scratch, disp as i64)?;
            self.add_rr(s, scratch, scratch, base)?;
            self.word(s, 0xFD40_0000 | (scratch.0 as u32) << 5 | dst.0 as u32);
        }
        Ok(())
    }

    fn fstore(&self, s: &mut ByteSink, base: Reg, disp: i32, src: FReg) -> EmitResult<()> {
        if disp >= 0 && disp <= 32760 && disp % 8 == 0 {
            self.word(
                s,
                0xFD00_0000 | ((disp as u32 / 8) << 10) | (base.0 as u32) << 5 | src.0 as u32,
            );
        } else if (-256..=255).contains(&disp) {
            // STUR (SIMD&FP)
            self.word(
                s,
                0xFC00_0000 | ((disp as u32 & 0x1FF) << 12) | (base.0 as u32) << 5 | src.0 as u32,
            );
        } else {
            let scratch = self.mem_scratch(base)?;
            self.mov_ri(s, scratch, disp as i64)?;
            self.add_rr(s, scratch, scratch, base)?;
            self.word(s, 0xFD00_0000 | (scratch.0 as u32) << 5 | src.0 as u32);
        }
        Ok(())
    }

    fn fmov(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        if dst != src {
            // fmov Dd, Dn
            self.word(s, 0x1E60_4000 | (src.0 as u32) << 5 | dst.0 as u32);
        }
        Ok(())
    }

    fn fmov_to_gpr(&self, s: &mut ByteSink, dst: Reg, src: FReg) -> EmitResult<()> {
        // fmov Xd, Dn
        self.word(s, 0x9E66_0000 | (src.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fmov_from_gpr(&self, s: &mut ByteSink, dst: FReg, src: Reg) -> EmitResult<()> {
        // fmov Dd, Xn
        self.word(s, 0x9E67_0000 | (src.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn lea_symbol(&self, s: &mut ByteSink, dst: Reg, symbol: &str) -> EmitResult<()> {
        let at = s.position();
        s.request_patch(at, symbol, PatchKind::A64AdrpPage21);
        self.word(s, 0x9000_0000 | dst.0 as u32); // adrp dst, page
        let at = s.position();
        s.request_patch(at, symbol, PatchKind::A64Lo12);
        self.word(s, 0x9100_0000 | (dst.0 as u32) << 5 | dst.0 as u32); // add dst, dst, #lo12
        Ok(())
    }

    fn add_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.word(s, 0x8B00_0000 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn sub_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.word(s, 0xCB00_0000 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn mul_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        // madd dst, a, b, xzr
        self.word(
            s,
            0x9B00_0000
                | (b.0 as u32) << 16
                | (A64_ZR as u32) << 10
                | (a.0 as u32) << 5
                | dst.0 as u32,
        );
        Ok(())
    }

    fn sdiv_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.word(s, 0x9AC0_0C00 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn and_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.word(s, 0x8A00_0000 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn or_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.word(s, 0xAA00_0000 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn xor_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.word(s, 0xCA00_0000 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn shl_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        // lslv
        self.word(s, 0x9AC0_2000 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn shr_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        // lsrv
        self.word(s, 0x9AC0_2400 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn sar_rr(&self, s: &mut ByteSink, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        // asrv
        self.word(s, 0x9AC0_2800 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn neg(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        // sub dst, xzr, dst
        self.word(s, 0xCB00_03E0 | (dst.0 as u32) << 16 | dst.0 as u32);
        Ok(())
    }

    fn not_(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        // orn dst, xzr, dst
        self.word(s, 0xAA20_03E0 | (dst.0 as u32) << 16 | dst.0 as u32);
        Ok(())
    }

    fn inc(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        self.add_ri(s, dst, 1)
    }

    fn dec(&self, s: &mut ByteSink, dst: Reg) -> EmitResult<()> {
        self.sub_ri(s, dst, 1)
    }

    fn add_ri(&self, s: &mut ByteSink, dst: Reg, imm: i32) -> EmitResult<()> {
        if imm < 0 {
            self.addsub_imm(s, true, dst, dst, (-(imm as i64)) as u32)
        } else {
            self.addsub_imm(s, false, dst, dst, imm as u32)
        }
    }

    fn sub_ri(&self, s: &mut ByteSink, dst: Reg, imm: i32) -> EmitResult<()> {
        if imm < 0 {
            self.addsub_imm(s, false, dst, dst, (-(imm as i64)) as u32)
        } else {
            self.addsub_imm(s, true, dst, dst, imm as u32)
        }
    }

    fn shl_ri(&self, s: &mut ByteSink, dst: Reg, amount: u8) -> EmitResult<()> {
        let sh = (amount & 63) as u32;
        // lsl ⇔ ubfm dst, dst, #(64-sh)%64, #(63-sh)
        let immr = (64 - sh) % 64;
        let imms = 63 - sh;
        self.word(
            s,
            0xD340_0000 | immr << 16 | imms << 10 | (dst.0 as u32) << 5 | dst.0 as u32,
        );
        Ok(())
    }

    fn shr_ri(&self, s: &mut ByteSink, dst: Reg, amount: u8) -> EmitResult<()> {
        let sh = (amount & 63) as u32;
        // lsr ⇔ ubfm dst, dst, #sh, #63
        self.word(s, 0xD340_FC00 | sh << 16 | (dst.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn sar_ri(&self, s: &mut ByteSink, dst: Reg, amount: u8) -> EmitResult<()> {
        let sh = (amount & 63) as u32;
        // asr ⇔ sbfm dst, dst, #sh, #63
        self.word(s, 0x9340_FC00 | sh << 16 | (dst.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn set_cmp(&self, s: &mut ByteSink, cond: Cond, dst: Reg, a: Reg, b: Reg) -> EmitResult<()> {
        self.cmp_rr(s, a, b);
        self.cset(s, cc(cond), dst);
        Ok(())
    }

    fn fadd(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.word(s, 0x1E60_2800 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fsub(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.word(s, 0x1E60_3800 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fmul(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.word(s, 0x1E60_0800 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fdiv(&self, s: &mut ByteSink, dst: FReg, a: FReg, b: FReg) -> EmitResult<()> {
        self.word(s, 0x1E60_1800 | (b.0 as u32) << 16 | (a.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fsqrt(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        self.word(s, 0x1E61_C000 | (src.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fabs_(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        self.word(s, 0x1E60_C000 | (src.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fneg_(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        self.word(s, 0x1E61_4000 | (src.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fround32(&self, s: &mut ByteSink, dst: FReg, src: FReg) -> EmitResult<()> {
        // fcvt Sd, Dn; fcvt Dd, Sn
        self.word(s, 0x1E62_4000 | (src.0 as u32) << 5 | dst.0 as u32);
        self.word(s, 0x1E22_C000 | (dst.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn cvt_i2f(&self, s: &mut ByteSink, dst: FReg, src: Reg) -> EmitResult<()> {
        // scvtf Dd, Xn
        self.word(s, 0x9E62_0000 | (src.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn cvt_f2i(&self, s: &mut ByteSink, dst: Reg, src: FReg) -> EmitResult<()> {
        // fcvtzs Xd, Dn
        self.word(s, 0x9E78_0000 | (src.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn fset_cmp(&self, s: &mut ByteSink, cond: Cond, dst: Reg, a: FReg, b: FReg) -> EmitResult<()> {
        // fcmp Dn, Dm
        self.word(s, 0x1E60_2000 | (b.0 as u32) << 16 | (a.0 as u32) << 5);
        self.cset(s, fcc(cond), dst);
        Ok(())
    }

    fn jump(&self, s: &mut ByteSink, label: &str) -> EmitResult<()> {
        let at = s.position();
        s.request_patch(at, label, PatchKind::A64Branch26);
        self.word(s, 0x1400_0000);
        Ok(())
    }

    fn br_cmp(&self, s: &mut ByteSink, cond: Cond, a: Reg, b: Reg, label: &str) -> EmitResult<()> {
        self.cmp_rr(s, a, b);
        self.bcond(s, cc(cond), label);
        Ok(())
    }

    fn br_zero(&self, s: &mut ByteSink, r: Reg, label: &str) -> EmitResult<()> {
        let at = s.position();
        s.request_patch(at, label, PatchKind::A64Cond19);
        self.word(s, 0xB400_0000 | r.0 as u32); // cbz
        Ok(())
    }

    fn br_nonzero(&self, s: &mut ByteSink, r: Reg, label: &str) -> EmitResult<()> {
        let at = s.position();
        s.request_patch(at, label, PatchKind::A64Cond19);
        self.word(s, 0xB500_0000 | r.0 as u32); // cbnz
        Ok(())
    }

    fn call_label(&self, s: &mut ByteSink, label: &str) -> EmitResult<()> {
        let at = s.position();
        s.request_patch(at, label, PatchKind::A64Branch26);
        self.word(s, 0x9400_0000); // bl
        Ok(())
    }

    fn call_reg(&self, s: &mut ByteSink, r: Reg) -> EmitResult<()> {
        self.word(s, 0xD63F_0000 | (r.0 as u32) << 5); // blr
        Ok(())
    }

    fn ret(&self, s: &mut ByteSink) -> EmitResult<()> {
        self.word(s, 0xD65F_03C0);
        Ok(())
    }

    fn syscall(&self, s: &mut ByteSink) -> EmitResult<()> {
        self.word(s, 0xD400_0001); // svc #0
        Ok(())
    }

    fn push(&self, s: &mut ByteSink, r: Reg) -> EmitResult<()> {
        // str Xt, [sp, #-16]!
        self.word(s, 0xF81F_0FE0 | r.0 as u32);
        Ok(())
    }

    fn pop(&self, s: &mut ByteSink, r: Reg) -> EmitResult<()> {
        // ldr Xt, [sp], #16
        self.word(s, 0xF841_07E0 | r.0 as u32);
        Ok(())
    }

    fn fpush(&self, s: &mut ByteSink, f: FReg) -> EmitResult<()> {
        // str Dt, [sp, #-16]!
        self.word(s, 0xFC1F_0FE0 | f.0 as u32);
        Ok(())
    }

    fn fpop(&self, s: &mut ByteSink, f: FReg) -> EmitResult<()> {
        // ldr Dt, [sp], #16
        self.word(s, 0xFC41_07E0 | f.0 as u32);
        Ok(())
    }

    fn prologue(&self, s: &mut ByteSink, frame_size: u32) -> EmitResult<()> {
        // stp x29, x30, [sp, #-16]!
        self.word(s, 0xA9BF_7BFD);
        // mov x29, sp
        self.word(s, 0x9100_03FD);
        if frame_size > 0 {
            self.addsub_imm(s, true, Reg(SP), Reg(SP), frame_size)?;
        }
        Ok(())
    }

    fn epilogue(&self, s: &mut ByteSink) -> EmitResult<()> {
        // mov sp, x29
        self.word(s, 0x9100_03BF);
        // ldp x29, x30, [sp], #16
        self.word(s, 0xA8C1_7BFD);
        self.ret(s)
    }

    fn sp_adjust(&self, s: &mut ByteSink, delta: i32) -> EmitResult<()> {
        if delta > 0 {
            self.addsub_imm(s, false, Reg(SP), Reg(SP), delta as u32)
        } else if delta < 0 {
            self.addsub_imm(s, true, Reg(SP), Reg(SP), (-delta) as u32)
        } else {
            Ok(())
        }
    }

    fn atomic_fetch_add(
        &self,
        s: &mut ByteSink,
        old_dst: Reg,
        base: Reg,
        addend: Reg,
    ) -> EmitResult<()> {
        // ldaddal Xs, Xt, [Xn] (LSE)
        self.word(
            s,
            0xF8E0_0000 | (addend.0 as u32) << 16 | (base.0 as u32) << 5 | old_dst.0 as u32,
        );
        Ok(())
    }

    fn atomic_store(&self, s: &mut ByteSink, base: Reg, src: Reg) -> EmitResult<()> {
        // stlr Xt, [Xn]
        self.word(s, 0xC89F_FC00 | (base.0 as u32) << 5 | src.0 as u32);
        Ok(())
    }

    fn atomic_load(&self, s: &mut ByteSink, dst: Reg, base: Reg) -> EmitResult<()> {
        // ldar Xt, [Xn]
        self.word(s, 0xC8DF_FC00 | (base.0 as u32) << 5 | dst.0 as u32);
        Ok(())
    }

    fn apply_patch(&self, code: &mut [u8], patch: &Patch, target: u64, base: u64) -> EmitResult<()> {
        let insn_addr = base + patch.at as u64;
        let word = u32::from_le_bytes(code[patch.at..patch.at + 4].try_into().unwrap());
        let patched = match patch.kind {
            PatchKind::A64Branch26 => {
                let disp = target as i64 - insn_addr as i64;
                check_branch(&patch.symbol, disp, 1 << 27)?;
                word | (((disp >> 2) as u32) & 0x03FF_FFFF)
            }
            PatchKind::A64Cond19 => {
                let disp = target as i64 - insn_addr as i64;
                check_branch(&patch.symbol, disp, 1 << 20)?;
                word | ((((disp >> 2) as u32) & 0x7_FFFF) << 5)
            }
            PatchKind::A64AdrpPage21 => {
                let page_disp = (target as i64 >> 12) - (insn_addr as i64 >> 12);
                if page_disp >= 1 << 20 || page_disp < -(1 << 20) {
                    return Err(EmitError::BranchOutOfRange {
                        symbol: patch.symbol.clone(),
                        disp: page_disp,
                        what: "adrp ±1MiB pages",
                    });
                }
                let imm = page_disp as u32;
                word | (imm & 3) << 29 | ((imm >> 2) & 0x7_FFFF) << 5
            }
            PatchKind::A64Lo12 => word | ((target as u32) & 0xFFF) << 10,
            PatchKind::Abs64 => {
                code[patch.at..patch.at + 8].copy_from_slice(&target.to_le_bytes());
                return Ok(());
            }
            _ => {
                return Err(EmitError::Internal {
                    message: format!("patch kind {:?} on aarch64", patch.kind),
                })
            }
        };
        code[patch.at..patch.at + 4].copy_from_slice(&patched.to_le_bytes());
        Ok(())
    }
}

impl Aarch64Emitter {
    /// Scratch register for out-of-range displacement fallbacks.
    fn mem_scratch(&self, base: Reg) -> EmitResult<Reg> {
        let regs = self.regs();
        if base.0 == SP {
            return Err(EmitError::Internal {
                message: "sp-relative access with out-of-range displacement".to_string(),
            });
        }
        Ok(if base == regs.tmp1 { regs.tmp0 } else { regs.tmp1 })
    }

    fn mem_scratch_excluding(&self, base: Reg, other: Reg) -> EmitResult<Reg> {
        let regs = self.regs();
        if base.0 == SP {
            return Err(EmitError::Internal {
                message: "sp-relative access with out-of-range displacement".to_string(),
            });
        }
        Ok(if base == regs.tmp1 || other == regs.tmp1 { regs.tmp0 } else { regs.tmp1 })
    }
}

fn check_branch(symbol: &str, disp: i64, limit: i64) -> EmitResult<()> {
    if disp % 4 != 0 {
        return Err(EmitError::MisalignedBranch { symbol: symbol.to_string(), disp, align: 4 });
    }
    if disp >= limit || disp < -limit {
        return Err(EmitError::BranchOutOfRange {
            symbol: symbol.to_string(),
            disp,
            what: "A64 branch range",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::Segment;

    fn sink() -> ByteSink {
        ByteSink::new(Segment::Text)
    }

    fn words(s: &ByteSink) -> Vec<u32> {
        s.bytes().chunks(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn test_mov_rr() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // mov x0, x1 ⇔ orr x0, xzr, x1 → 0xAA0103E0
        e.mov_rr(&mut s, Reg(0), Reg(1)).unwrap();
        assert_eq!(words(&s), vec![0xAA0103E0]);
    }

    #[test]
    fn test_movz_movk() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // mov x0, #0x12345 → movz x0, #0x2345; movk x0, #0x1, lsl 16
        e.mov_ri(&mut s, Reg(0), 0x12345).unwrap();
        assert_eq!(words(&s), vec![0xD28468A0, 0xF2A00020]);
    }

    #[test]
    fn test_movn_for_minus_one() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // mov x3, #-1 → movn x3, #0
        e.mov_ri(&mut s, Reg(3), -1).unwrap();
        assert_eq!(words(&s), vec![0x92800003]);
    }

    #[test]
    fn test_ldr_str_scaled() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // ldr x0, [x29, #16] → 0xF9400BA0? imm12=2 → 0xF9400800|29<<5|0
        e.load(&mut s, Reg(0), Reg(29), 16).unwrap();
        assert_eq!(words(&s), vec![0xF9400BA0]);
        let mut s = sink();
        // ldur x0, [x29, #-8] → 0xF85F83A0
        e.load(&mut s, Reg(0), Reg(29), -8).unwrap();
        assert_eq!(words(&s), vec![0xF85F83A0]);
    }

    #[test]
    fn test_fadd() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // fadd d0, d0, d1 → 0x1E612800? m=1<<16, n=0<<5, d=0
        e.fadd(&mut s, FReg(0), FReg(0), FReg(1)).unwrap();
        assert_eq!(words(&s), vec![0x1E612800]);
    }

    #[test]
    fn test_prologue_words() {
        let e = Aarch64Emitter;
        let mut s = sink();
        e.prologue(&mut s, 32).unwrap();
        // stp x29,x30,[sp,#-16]!; mov x29, sp; sub sp, sp, #32
        assert_eq!(words(&s), vec![0xA9BF7BFD, 0x910003FD, 0xD10083FF]);
    }

    #[test]
    fn test_bl_patch() {
        let e = Aarch64Emitter;
        let mut s = sink();
        e.call_label(&mut s, "f").unwrap();
        let patch = s.patches()[0].clone();
        let mut code = s.bytes().to_vec();
        // bl at 0x1000 to 0x1010: imm26 = 4 words
        e.apply_patch(&mut code, &patch, 0x1010, 0x1000).unwrap();
        assert_eq!(u32::from_le_bytes(code[0..4].try_into().unwrap()), 0x94000004);
    }

    #[test]
    fn test_adrp_add_pair() {
        let e = Aarch64Emitter;
        let mut s = sink();
        e.lea_symbol(&mut s, Reg(0), "lit").unwrap();
        assert_eq!(s.patches().len(), 2);
        let mut code = s.bytes().to_vec();
        // Instruction at 0x401000, target 0x403028: page delta 2, lo12 0x28.
        for patch in s.patches() {
            e.apply_patch(&mut code, patch, 0x403028, 0x401000).unwrap();
        }
        let w = words_of(&code);
        assert_eq!(w[0], 0x90000000 | (2 & 3) << 29 | (2 >> 2) << 5); // adrp x0, +2 pages
        assert_eq!(w[1], 0x91000000 | 0x28 << 10); // add x0, x0, #0x28
    }

    #[test]
    fn test_misaligned_branch_rejected() {
        let e = Aarch64Emitter;
        let patch = Patch {
            at: 0,
            symbol: "odd".to_string(),
            kind: PatchKind::A64Branch26,
            anchor: 0,
        };
        let mut code = vec![0u8; 4];
        let err = e.apply_patch(&mut code, &patch, 0x1002, 0x1000).unwrap_err();
        assert!(matches!(err, EmitError::MisalignedBranch { .. }));
    }

    #[test]
    fn test_push_pop_sp_move() {
        let e = Aarch64Emitter;
        let mut s = sink();
        e.push(&mut s, Reg(0)).unwrap();
        e.pop(&mut s, Reg(0)).unwrap();
        assert_eq!(words(&s), vec![0xF81F0FE0, 0xF84107E0]);
    }

    #[test]
    fn test_atomic_fetch_add() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // ldaddal x2, x0, [x1]
        e.atomic_fetch_add(&mut s, Reg(0), Reg(1), Reg(2)).unwrap();
        assert_eq!(words(&s), vec![0xF8E20020]);
    }

    #[test]
    fn test_atomic_store_release() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // stlr x0, [x1]
        e.atomic_store(&mut s, Reg(1), Reg(0)).unwrap();
        assert_eq!(words(&s), vec![0xC89FFC20]);
    }

    #[test]
    fn test_atomic_load_acquire() {
        let e = Aarch64Emitter;
        let mut s = sink();
        // ldar x0, [x1]
        e.atomic_load(&mut s, Reg(0), Reg(1)).unwrap();
        assert_eq!(words(&s), vec![0xC8DFFC20]);
    }

    fn words_of(code: &[u8]) -> Vec<u32> {
        code.chunks(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
    }
}
