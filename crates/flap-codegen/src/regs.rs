//! Per-ISA register tables and calling-convention descriptors
//!
//! There is no register allocator: the translator works against a fixed
//! convention - a float accumulator, two integer scratch registers, a frame
//! pointer, and the ABI argument orders below. Each backend's encoders take
//! raw [`Reg`]/[`FReg`] encodings.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

/// A general-purpose register by its ISA encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

/// A floating-point register by its ISA encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FReg(pub u8);

/// Fixed register convention for one target.
#[derive(Debug)]
pub struct RegModel {
    /// Integer result / first scratch of the ABI
    pub result: Reg,
    /// Second integer result register (rdx / x1 / a1), used by helpers
    /// returning a (pointer, length) pair
    pub result2: Reg,
    /// Frame pointer
    pub fp: Reg,
    /// Stack pointer
    pub sp: Reg,
    /// Emitter scratch registers (never live across a helper call)
    pub tmp0: Reg,
    pub tmp1: Reg,
    /// Closure environment pointer for capturing lambdas
    pub chain: Reg,
    /// Integer argument order of the system ABI
    pub int_args: &'static [Reg],
    /// Float argument order of the system ABI
    pub float_args: &'static [FReg],
    /// Scalar float accumulator (xmm0 / d0 / fa0)
    pub facc: FReg,
    /// Secondary float operand register
    pub ftmp: FReg,
    /// Third float scratch
    pub ftmp2: FReg,
    pub callee_saved: &'static [Reg],
    pub caller_saved: &'static [Reg],
    /// Syscall number register
    pub syscall_nr: Reg,
    /// Syscall argument order
    pub syscall_args: &'static [Reg],
    /// Required stack alignment before any call
    pub call_align: usize,
}

pub static X86_64: RegModel = RegModel {
    result: Reg(0),                       // rax
    result2: Reg(2),                      // rdx
    fp: Reg(5),                           // rbp
    sp: Reg(4),                           // rsp
    tmp0: Reg(11),                        // r11
    tmp1: Reg(1),                         // rcx
    chain: Reg(10),                       // r10 (System V static chain)
    int_args: &[Reg(7), Reg(6), Reg(2), Reg(1), Reg(8), Reg(9)], // rdi rsi rdx rcx r8 r9
    float_args: &[FReg(0), FReg(1), FReg(2), FReg(3), FReg(4), FReg(5), FReg(6), FReg(7)],
    facc: FReg(0),
    ftmp: FReg(1),
    ftmp2: FReg(2),
    callee_saved: &[Reg(3), Reg(5), Reg(12), Reg(13), Reg(14), Reg(15)],
    caller_saved: &[Reg(0), Reg(1), Reg(2), Reg(6), Reg(7), Reg(8), Reg(9), Reg(10), Reg(11)],
    syscall_nr: Reg(0),                   // rax
    syscall_args: &[Reg(7), Reg(6), Reg(2), Reg(10), Reg(8), Reg(9)], // rdi rsi rdx r10 r8 r9
    call_align: 16,
};

pub static AARCH64: RegModel = RegModel {
    result: Reg(0),                       // x0
    result2: Reg(1),                      // x1
    fp: Reg(29),                          // x29
    sp: Reg(31),                          // sp
    tmp0: Reg(16),                        // x16 (ip0)
    tmp1: Reg(17),                        // x17 (ip1)
    chain: Reg(9),                        // x9
    int_args: &[Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(5), Reg(6), Reg(7)],
    float_args: &[FReg(0), FReg(1), FReg(2), FReg(3), FReg(4), FReg(5), FReg(6), FReg(7)],
    facc: FReg(0),
    ftmp: FReg(1),
    ftmp2: FReg(2),
    callee_saved: &[
        Reg(19), Reg(20), Reg(21), Reg(22), Reg(23), Reg(24), Reg(25), Reg(26), Reg(27), Reg(28),
    ],
    caller_saved: &[
        Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(5), Reg(6), Reg(7), Reg(8), Reg(9), Reg(10),
        Reg(11), Reg(12), Reg(13), Reg(14), Reg(15),
    ],
    syscall_nr: Reg(8),                   // x8
    syscall_args: &[Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(5)],
    call_align: 16,
};

pub static RISCV64: RegModel = RegModel {
    result: Reg(10),                      // a0
    result2: Reg(11),                     // a1
    fp: Reg(8),                           // s0
    sp: Reg(2),                           // sp
    tmp0: Reg(5),                         // t0
    tmp1: Reg(6),                         // t1
    chain: Reg(7),                        // t2
    int_args: &[Reg(10), Reg(11), Reg(12), Reg(13), Reg(14), Reg(15), Reg(16), Reg(17)],
    float_args: &[
        FReg(10), FReg(11), FReg(12), FReg(13), FReg(14), FReg(15), FReg(16), FReg(17),
    ],
    facc: FReg(10),                       // fa0
    ftmp: FReg(0),                        // ft0
    ftmp2: FReg(1),                       // ft1
    callee_saved: &[
        Reg(8), Reg(9), Reg(18), Reg(19), Reg(20), Reg(21), Reg(22), Reg(23), Reg(24), Reg(25),
        Reg(26), Reg(27),
    ],
    caller_saved: &[
        Reg(1), Reg(5), Reg(6), Reg(7), Reg(10), Reg(11), Reg(12), Reg(13), Reg(14), Reg(15),
        Reg(16), Reg(17), Reg(28), Reg(29), Reg(30), Reg(31),
    ],
    syscall_nr: Reg(17),                  // a7
    syscall_args: &[Reg(10), Reg(11), Reg(12), Reg(13), Reg(14), Reg(15)],
    call_align: 16,
};

/// RISC-V return-address register (x1); link register for JAL/JALR.
pub const RV_RA: Reg = Reg(1);
/// ARM64 link register (x30).
pub const A64_LR: Reg = Reg(30);
/// ARM64 zero register encoding (alias of sp in most encodings).
pub const A64_ZR: u8 = 31;

/// x86-64 register names → (encoding, size in bytes).
pub static X86_64_NAMES: Lazy<FxHashMap<&'static str, (u8, u8)>> = Lazy::new(|| {
    let gp = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    let mut map = FxHashMap::default();
    for (i, name) in gp.iter().enumerate() {
        map.insert(*name, (i as u8, 8));
    }
    for i in 0..16u8 {
        map.insert(xmm_name(i), (i, 8));
    }
    map
});

/// ARM64 register names → (encoding, size in bytes).
pub static AARCH64_NAMES: Lazy<FxHashMap<String, (u8, u8)>> = Lazy::new(|| {
    let mut map = FxHashMap::default();
    for i in 0..31u8 {
        map.insert(format!("x{i}"), (i, 8));
    }
    map.insert("sp".to_string(), (31, 8));
    for i in 0..32u8 {
        map.insert(format!("d{i}"), (i, 8));
    }
    map
});

/// RISC-V ABI register names → (encoding, size in bytes).
pub static RISCV64_NAMES: Lazy<FxHashMap<&'static str, (u8, u8)>> = Lazy::new(|| {
    let gp = [
        "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3",
        "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
        "t3", "t4", "t5", "t6",
    ];
    let fp = [
        "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1",
        "fa2", "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7",
        "fs8", "fs9", "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
    ];
    let mut map = FxHashMap::default();
    for (i, name) in gp.iter().enumerate() {
        map.insert(*name, (i as u8, 8));
    }
    for (i, name) in fp.iter().enumerate() {
        map.insert(*name, (i as u8, 8));
    }
    map
});

fn xmm_name(i: u8) -> &'static str {
    const NAMES: [&str; 16] = [
        "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
        "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
    ];
    NAMES[i as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_argument_orders() {
        // System V x86-64: rdi first
        assert_eq!(X86_64.int_args[0], Reg(7));
        // AAPCS64: x0 first
        assert_eq!(AARCH64.int_args[0], Reg(0));
        // RISC-V LP64D: a0 = x10 first
        assert_eq!(RISCV64.int_args[0], Reg(10));
    }

    #[test]
    fn test_call_alignment_is_16_everywhere() {
        assert_eq!(X86_64.call_align, 16);
        assert_eq!(AARCH64.call_align, 16);
        assert_eq!(RISCV64.call_align, 16);
    }

    #[test]
    fn test_name_tables() {
        assert_eq!(X86_64_NAMES["rdi"], (7, 8));
        assert_eq!(X86_64_NAMES["xmm0"], (0, 8));
        assert_eq!(AARCH64_NAMES["x29"], (29, 8));
        assert_eq!(RISCV64_NAMES["a7"], (17, 8));
        assert_eq!(RISCV64_NAMES["fa0"], (10, 8));
    }

    #[test]
    fn test_scratch_not_callee_saved() {
        for model in [&X86_64, &AARCH64, &RISCV64] {
            assert!(!model.callee_saved.contains(&model.tmp0));
            assert!(!model.callee_saved.contains(&model.chain));
        }
    }
}
