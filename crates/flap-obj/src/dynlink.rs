//! Dynamic-link table construction
//!
//! Builds the five runtime-linking tables plus `.plt`/`.got.plt` for the
//! lazy-binding dance: dynstr, dynsym (24-byte entries, entry 0 null), a
//! SysV hash with a single bucket and a linear chain, rela.plt with one
//! JUMP_SLOT per import, a `.got.plt` whose slots initially re-enter the
//! resolver stub, and the `.dynamic` tag table the loader walks. These
//! bytes must satisfy the host loader bit for bit; a wrong field shows up
//! as the program dying before `main`.
//!
//! Runtime helper symbols never reach this builder - the translator
//! resolves them to direct offsets and the driver filters them out.

use flap_codegen::Isa;

// Dynamic tags (Elf64_Dyn)
const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_PLTRELSZ: u64 = 2;
const DT_PLTGOT: u64 = 3;
const DT_HASH: u64 = 4;
const DT_STRTAB: u64 = 5;
const DT_SYMTAB: u64 = 6;
const DT_RELA: u64 = 7;
const DT_RELASZ: u64 = 8;
const DT_RELAENT: u64 = 9;
const DT_STRSZ: u64 = 10;
const DT_SYMENT: u64 = 11;
const DT_PLTREL: u64 = 20;
const DT_JMPREL: u64 = 23;

fn r_jump_slot(isa: Isa) -> u64 {
    match isa {
        Isa::X86_64 => 7,     // R_X86_64_JUMP_SLOT
        Isa::Aarch64 => 1026, // R_AARCH64_JUMP_SLOT
        Isa::Riscv64 => 5,    // R_RISCV_JUMP_SLOT
    }
}

/// Byte sizes of the tables, computable before layout.
#[derive(Debug, Clone, Copy)]
pub struct DynLinkSizes {
    pub dynstr: usize,
    pub dynsym: usize,
    pub hash: usize,
    pub rela_plt: usize,
    pub plt: usize,
    pub got_plt: usize,
    pub dynamic: usize,
}

/// Final addresses assigned by the layout step.
#[derive(Debug, Clone, Copy)]
pub struct DynLinkAddrs {
    pub dynstr: u64,
    pub dynsym: u64,
    pub hash: u64,
    pub rela_plt: u64,
    pub plt: u64,
    pub got_plt: u64,
    pub dynamic: u64,
}

/// The serialized tables.
#[derive(Debug)]
pub struct DynLinkTables {
    pub dynstr: Vec<u8>,
    pub dynsym: Vec<u8>,
    pub hash: Vec<u8>,
    pub rela_plt: Vec<u8>,
    pub plt: Vec<u8>,
    pub got_plt: Vec<u8>,
    pub dynamic: Vec<u8>,
    /// symbol → offset of its trampoline within `.plt`
    pub plt_offsets: Vec<(String, usize)>,
}

pub struct DynLinkBuilder {
    isa: Isa,
    /// Imported function names, sorted (determinism).
    imports: Vec<String>,
    /// NEEDED sonames, in declaration order.
    libraries: Vec<String>,
}

impl DynLinkBuilder {
    pub fn new(isa: Isa, imports: Vec<String>, libraries: Vec<String>) -> Self {
        DynLinkBuilder { isa, imports, libraries }
    }

    pub fn plt0_size(&self) -> usize {
        match self.isa {
            Isa::X86_64 => 16,
            Isa::Aarch64 | Isa::Riscv64 => 32,
        }
    }

    /// Offset of a symbol's trampoline within `.plt`.
    pub fn plt_offset_of(&self, symbol: &str) -> Option<usize> {
        self.imports
            .iter()
            .position(|s| s == symbol)
            .map(|i| self.plt0_size() + 16 * i)
    }

    pub fn sizes(&self) -> DynLinkSizes {
        let n = self.imports.len();
        let dynstr = 1
            + self.libraries.iter().map(|l| l.len() + 1).sum::<usize>()
            + self.imports.iter().map(|s| s.len() + 1).sum::<usize>();
        // NEEDED×libs + 12 fixed tags + NULL
        let dynamic = 16 * (self.libraries.len() + 13);
        DynLinkSizes {
            dynstr,
            dynsym: 24 * (n + 1),
            hash: 4 * (2 + 1 + (n + 1)),
            rela_plt: 24 * n,
            plt: self.plt0_size() + 16 * n,
            got_plt: 8 * (3 + n),
            dynamic,
        }
    }

    pub fn build(&self, addrs: &DynLinkAddrs) -> DynLinkTables {
        let n = self.imports.len();

        // ---- dynstr ----
        let mut dynstr = vec![0u8];
        let mut lib_offsets = Vec::with_capacity(self.libraries.len());
        for lib in &self.libraries {
            lib_offsets.push(dynstr.len() as u64);
            dynstr.extend_from_slice(lib.as_bytes());
            dynstr.push(0);
        }
        let mut name_offsets = Vec::with_capacity(n);
        for sym in &self.imports {
            name_offsets.push(dynstr.len() as u32);
            dynstr.extend_from_slice(sym.as_bytes());
            dynstr.push(0);
        }

        // ---- dynsym ----
        let mut dynsym = vec![0u8; 24]; // null symbol
        for &name_off in &name_offsets {
            dynsym.extend_from_slice(&name_off.to_le_bytes());
            dynsym.push(0x12); // (STB_GLOBAL << 4) | STT_FUNC
            dynsym.push(0); // st_other
            dynsym.extend_from_slice(&0u16.to_le_bytes()); // st_shndx = SHN_UNDEF
            dynsym.extend_from_slice(&0u64.to_le_bytes()); // st_value
            dynsym.extend_from_slice(&0u64.to_le_bytes()); // st_size
        }

        // ---- hash: one bucket, linear chain ----
        let mut hash = Vec::new();
        hash.extend_from_slice(&1u32.to_le_bytes()); // nbucket
        hash.extend_from_slice(&((n + 1) as u32).to_le_bytes()); // nchain
        hash.extend_from_slice(&(if n > 0 { 1u32 } else { 0 }).to_le_bytes());
        for i in 0..=n {
            let next = if i > 0 && i < n { (i + 1) as u32 } else { 0 };
            hash.extend_from_slice(&next.to_le_bytes());
        }

        // ---- rela.plt ----
        let mut rela_plt = Vec::with_capacity(24 * n);
        for i in 0..n {
            let r_offset = addrs.got_plt + 8 * (3 + i as u64);
            let r_info = ((i as u64 + 1) << 32) | r_jump_slot(self.isa);
            rela_plt.extend_from_slice(&r_offset.to_le_bytes());
            rela_plt.extend_from_slice(&r_info.to_le_bytes());
            rela_plt.extend_from_slice(&0u64.to_le_bytes()); // addend
        }

        // ---- plt + got.plt ----
        let (plt, got_plt) = self.build_plt_got(addrs);

        // ---- .dynamic ----
        let sizes = self.sizes();
        let mut dynamic = Vec::new();
        let mut tag = |t: u64, v: u64| {
            dynamic.extend_from_slice(&t.to_le_bytes());
            dynamic.extend_from_slice(&v.to_le_bytes());
        };
        for off in &lib_offsets {
            tag(DT_NEEDED, *off);
        }
        tag(DT_STRTAB, addrs.dynstr);
        tag(DT_SYMTAB, addrs.dynsym);
        tag(DT_HASH, addrs.hash);
        tag(DT_STRSZ, sizes.dynstr as u64);
        tag(DT_SYMENT, 24);
        tag(DT_RELA, addrs.rela_plt);
        tag(DT_RELASZ, sizes.rela_plt as u64);
        tag(DT_RELAENT, 24);
        tag(DT_PLTREL, DT_RELA);
        tag(DT_JMPREL, addrs.rela_plt);
        tag(DT_PLTRELSZ, sizes.rela_plt as u64);
        tag(DT_PLTGOT, addrs.got_plt);
        tag(DT_NULL, 0);

        let plt_offsets = self
            .imports
            .iter()
            .enumerate()
            .map(|(i, sym)| (sym.clone(), self.plt0_size() + 16 * i))
            .collect();

        DynLinkTables { dynstr, dynsym, hash, rela_plt, plt, got_plt, dynamic, plt_offsets }
    }

    /// Resolver stub + one 16-byte trampoline per import, and the GOT
    /// whose slots point back into the stub so the first call lazily binds.
    fn build_plt_got(&self, addrs: &DynLinkAddrs) -> (Vec<u8>, Vec<u8>) {
        let n = self.imports.len();
        let mut plt = Vec::new();
        let mut got = Vec::new();

        // got[0] = .dynamic, got[1] = link_map (loader), got[2] = resolver
        got.extend_from_slice(&addrs.dynamic.to_le_bytes());
        got.extend_from_slice(&0u64.to_le_bytes());
        got.extend_from_slice(&0u64.to_le_bytes());

        match self.isa {
            Isa::X86_64 => {
                // PLT0: push [rip+got+8]; jmp [rip+got+16]; pad
                let got8 = addrs.got_plt + 8;
                let got16 = addrs.got_plt + 16;
                plt.extend_from_slice(&[0xFF, 0x35]);
                plt.extend_from_slice(&rel32(got8, addrs.plt + 6).to_le_bytes());
                plt.extend_from_slice(&[0xFF, 0x25]);
                plt.extend_from_slice(&rel32(got16, addrs.plt + 12).to_le_bytes());
                plt.extend_from_slice(&[0x0F, 0x1F, 0x40, 0x00]); // nop
                for i in 0..n {
                    let entry = addrs.plt + 16 * (i as u64 + 1);
                    let slot = addrs.got_plt + 8 * (3 + i as u64);
                    // jmp [rip+got[n]]
                    plt.extend_from_slice(&[0xFF, 0x25]);
                    plt.extend_from_slice(&rel32(slot, entry + 6).to_le_bytes());
                    // push reloc-index
                    plt.push(0x68);
                    plt.extend_from_slice(&(i as u32).to_le_bytes());
                    // jmp plt0
                    plt.push(0xE9);
                    plt.extend_from_slice(&rel32(addrs.plt, entry + 16).to_le_bytes());
                    // lazy: slot starts at the push insn after the jmp
                    got.extend_from_slice(&(entry + 6).to_le_bytes());
                }
            }
            Isa::Aarch64 => {
                // PLT0 (8 words): save, load resolver from got[2], jump.
                let got2 = addrs.got_plt + 16;
                let plt0 = addrs.plt;
                plt.extend_from_slice(&0xA9BF_7BF0u32.to_le_bytes()); // stp x16,x30,[sp,#-16]!
                plt.extend_from_slice(&adrp(16, plt0 + 4, got2).to_le_bytes());
                plt.extend_from_slice(&ldr_imm(17, 16, got2 & 0xFFF).to_le_bytes());
                plt.extend_from_slice(&add_imm(16, 16, got2 & 0xFFF).to_le_bytes());
                plt.extend_from_slice(&0xD61F_0220u32.to_le_bytes()); // br x17
                for _ in 0..3 {
                    plt.extend_from_slice(&0xD503_201Fu32.to_le_bytes()); // nop
                }
                for i in 0..n {
                    let entry = addrs.plt + 32 + 16 * i as u64;
                    let slot = addrs.got_plt + 8 * (3 + i as u64);
                    plt.extend_from_slice(&adrp(16, entry, slot).to_le_bytes());
                    plt.extend_from_slice(&ldr_imm(17, 16, slot & 0xFFF).to_le_bytes());
                    plt.extend_from_slice(&add_imm(16, 16, slot & 0xFFF).to_le_bytes());
                    plt.extend_from_slice(&0xD61F_0220u32.to_le_bytes()); // br x17
                    got.extend_from_slice(&plt0.to_le_bytes());
                }
            }
            Isa::Riscv64 => {
                // PLT0 per the psABI resolver sequence.
                let plt0 = addrs.plt;
                let gotp = addrs.got_plt;
                let (hi, lo) = hi_lo(gotp, plt0);
                plt.extend_from_slice(&(0x17u32 | 7 << 7 | hi << 12).to_le_bytes()); // auipc t2
                plt.extend_from_slice(&0x41C3_0333u32.to_le_bytes()); // sub t1, t1, t3
                plt.extend_from_slice(
                    &(0x03u32 | 28 << 7 | 3 << 12 | 7 << 15 | lo << 20).to_le_bytes(),
                ); // ld t3, lo(t2)
                plt.extend_from_slice(&(0x13u32 | 6 << 7 | 6 << 15 | 0xFD4u32 << 20).to_le_bytes()); // addi t1, t1, -44
                plt.extend_from_slice(&(0x13u32 | 5 << 7 | 7 << 15 | lo << 20).to_le_bytes()); // addi t0, t2, lo
                plt.extend_from_slice(&(0x13u32 | 6 << 7 | 1 << 12 | 6 << 15 | 1 << 20).to_le_bytes()); // srli t1, t1, 1
                plt.extend_from_slice(&(0x03u32 | 5 << 7 | 3 << 12 | 5 << 15 | 8 << 20).to_le_bytes()); // ld t0, 8(t0)
                plt.extend_from_slice(&(0x67u32 | 28 << 15).to_le_bytes()); // jr t3
                for i in 0..n {
                    let entry = addrs.plt + 32 + 16 * i as u64;
                    let slot = addrs.got_plt + 8 * (3 + i as u64);
                    let (hi, lo) = hi_lo(slot, entry);
                    plt.extend_from_slice(&(0x17u32 | 28 << 7 | hi << 12).to_le_bytes()); // auipc t3
                    plt.extend_from_slice(
                        &(0x03u32 | 28 << 7 | 3 << 12 | 28 << 15 | lo << 20).to_le_bytes(),
                    ); // ld t3, lo(t3)
                    plt.extend_from_slice(&(0x67u32 | 6 << 7 | 28 << 15).to_le_bytes()); // jalr t1, t3
                    plt.extend_from_slice(&0x0000_0013u32.to_le_bytes()); // nop
                    got.extend_from_slice(&plt0.to_le_bytes());
                }
            }
        }
        (plt, got)
    }
}

fn rel32(target: u64, pc: u64) -> i32 {
    (target as i64 - pc as i64) as i32
}

/// ADRP Xd with the page delta from `pc` to `target`.
fn adrp(rd: u32, pc: u64, target: u64) -> u32 {
    let page_delta = ((target >> 12) as i64 - (pc >> 12) as i64) as u32;
    0x9000_0000 | (page_delta & 3) << 29 | ((page_delta >> 2) & 0x7_FFFF) << 5 | rd
}

/// LDR Xt, [Xn, #imm] (scaled unsigned)
fn ldr_imm(rt: u32, rn: u32, imm: u64) -> u32 {
    0xF940_0000 | ((imm as u32 / 8) << 10) | rn << 5 | rt
}

/// ADD Xd, Xn, #imm
fn add_imm(rd: u32, rn: u32, imm: u64) -> u32 {
    0x9100_0000 | (imm as u32) << 10 | rn << 5 | rd
}

/// RISC-V %hi/%lo split with the +0x800 carry.
fn hi_lo(target: u64, pc: u64) -> (u32, u32) {
    let disp = target as i64 - pc as i64;
    let hi = ((disp + 0x800) >> 12) as u32 & 0xF_FFFF;
    let lo = (disp - (((disp + 0x800) >> 12) << 12)) as u32 & 0xFFF;
    (hi, lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> DynLinkAddrs {
        DynLinkAddrs {
            dynstr: 0x400200,
            dynsym: 0x400300,
            hash: 0x400400,
            rela_plt: 0x400500,
            plt: 0x401000,
            got_plt: 0x403000,
            dynamic: 0x403800,
        }
    }

    fn builder() -> DynLinkBuilder {
        DynLinkBuilder::new(
            Isa::X86_64,
            vec!["malloc".to_string(), "printf".to_string()],
            vec!["libc.so.6".to_string()],
        )
    }

    #[test]
    fn test_sizes_match_built_tables() {
        let b = builder();
        let sizes = b.sizes();
        let tables = b.build(&addrs());
        assert_eq!(tables.dynstr.len(), sizes.dynstr);
        assert_eq!(tables.dynsym.len(), sizes.dynsym);
        assert_eq!(tables.hash.len(), sizes.hash);
        assert_eq!(tables.rela_plt.len(), sizes.rela_plt);
        assert_eq!(tables.plt.len(), sizes.plt);
        assert_eq!(tables.got_plt.len(), sizes.got_plt);
        assert_eq!(tables.dynamic.len(), sizes.dynamic);
    }

    #[test]
    fn test_dynsym_null_entry_and_info() {
        let tables = builder().build(&addrs());
        assert!(tables.dynsym[..24].iter().all(|&b| b == 0));
        // st_info of the first real symbol: GLOBAL|FUNC
        assert_eq!(tables.dynsym[24 + 4], 0x12);
    }

    #[test]
    fn test_dynstr_contains_names() {
        let tables = builder().build(&addrs());
        assert_eq!(tables.dynstr[0], 0);
        let s = String::from_utf8_lossy(&tables.dynstr);
        assert!(s.contains("libc.so.6"));
        assert!(s.contains("malloc"));
        assert!(s.contains("printf"));
    }

    #[test]
    fn test_rela_targets_got_slots() {
        let tables = builder().build(&addrs());
        let r_offset = u64::from_le_bytes(tables.rela_plt[0..8].try_into().unwrap());
        assert_eq!(r_offset, 0x403000 + 24);
        let r_info = u64::from_le_bytes(tables.rela_plt[8..16].try_into().unwrap());
        assert_eq!(r_info, (1 << 32) | 7); // sym 1, R_X86_64_JUMP_SLOT
    }

    #[test]
    fn test_got_lazy_slots_reenter_plt() {
        let tables = builder().build(&addrs());
        // got[0] = .dynamic
        assert_eq!(u64::from_le_bytes(tables.got_plt[0..8].try_into().unwrap()), 0x403800);
        // got[3] points at the push inside the first trampoline
        let slot = u64::from_le_bytes(tables.got_plt[24..32].try_into().unwrap());
        assert_eq!(slot, 0x401000 + 16 + 6);
    }

    #[test]
    fn test_plt_entry_offsets() {
        let b = builder();
        assert_eq!(b.plt_offset_of("malloc"), Some(16));
        assert_eq!(b.plt_offset_of("printf"), Some(32));
        assert_eq!(b.plt_offset_of("exit"), None);
    }

    #[test]
    fn test_hash_single_bucket_chain() {
        let tables = builder().build(&addrs());
        let words: Vec<u32> =
            tables.hash.chunks(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(words[0], 1); // nbucket
        assert_eq!(words[1], 3); // nchain (null + 2)
        assert_eq!(words[2], 1); // bucket → first symbol
        assert_eq!(words[3], 0); // chain[0]
        assert_eq!(words[4], 2); // chain[1] → 2
        assert_eq!(words[5], 0); // chain[2] ends
    }

    #[test]
    fn test_dynamic_terminates_with_null() {
        let tables = builder().build(&addrs());
        let len = tables.dynamic.len();
        assert_eq!(&tables.dynamic[len - 16..], &[0u8; 16]);
    }

    #[test]
    fn test_aarch64_plt_sizes() {
        let b = DynLinkBuilder::new(
            Isa::Aarch64,
            vec!["malloc".to_string()],
            vec!["libc.so.6".to_string()],
        );
        let tables = b.build(&addrs());
        assert_eq!(tables.plt.len(), 32 + 16);
        // Every ARM64 lazy slot starts at PLT0.
        let slot = u64::from_le_bytes(tables.got_plt[24..32].try_into().unwrap());
        assert_eq!(slot, 0x401000);
    }
}
