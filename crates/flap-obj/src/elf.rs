//! ELF64 executable writer
//!
//! Serializes the laid-out segments into a loadable ET_EXEC image:
//! header, program headers (PT_PHDR, PT_INTERP, three PT_LOADs, and
//! PT_DYNAMIC), section contents in layout order, then the section header
//! table with its shstrtab. Field values follow the gABI and the psABI of
//! each target; the image must satisfy `ld.so` exactly.

use crate::error::ObjectResult;
use crate::layout::Layout;
use flap_codegen::Isa;

const EI_NIDENT: usize = 16;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_PHDR: u32 = 6;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_HASH: u32 = 5;
const SHT_DYNAMIC: u32 = 6;
const SHT_NOBITS: u32 = 8;
const SHT_DYNSYM: u32 = 11;
const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;
const SHF_WRITE: u64 = 1;

fn e_machine(isa: Isa) -> u16 {
    match isa {
        Isa::X86_64 => 62,   // EM_X86_64
        Isa::Aarch64 => 183, // EM_AARCH64
        Isa::Riscv64 => 243, // EM_RISCV
    }
}

fn e_flags(isa: Isa) -> u32 {
    match isa {
        // EF_RISCV_FLOAT_ABI_DOUBLE; no compressed instructions emitted.
        Isa::Riscv64 => 0x4,
        _ => 0,
    }
}

pub fn interp_path(isa: Isa) -> &'static [u8] {
    match isa {
        Isa::X86_64 => b"/lib64/ld-linux-x86-64.so.2\0",
        Isa::Aarch64 => b"/lib/ld-linux-aarch64.so.1\0",
        Isa::Riscv64 => b"/lib/ld-linux-riscv64-lp64d.so.1\0",
    }
}

/// All segment contents, final bytes, ready for serialization.
pub struct ElfImage<'a> {
    pub isa: Isa,
    pub layout: Layout,
    pub entry: u64,
    pub plt: &'a [u8],
    pub text: &'a [u8],
    pub rodata: &'a [u8],
    pub data: &'a [u8],
    pub dynsym: &'a [u8],
    pub dynstr: &'a [u8],
    pub hash: &'a [u8],
    pub rela_plt: &'a [u8],
    pub dynamic: &'a [u8],
    pub got_plt: &'a [u8],
}

struct Shdr {
    name: &'static str,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

pub fn write(image: &ElfImage<'_>) -> ObjectResult<Vec<u8>> {
    let l = &image.layout;
    let phnum: u16 = 6;
    let phoff: u64 = 64;

    // ---- body: everything at its file offset ----
    let mut body = vec![0u8; l.file_offset(l.rw_end) as usize];
    let mut put = |off: u64, bytes: &[u8]| {
        let off = off as usize;
        body[off..off + bytes.len()].copy_from_slice(bytes);
    };
    put(l.file_offset(l.interp.addr), interp_path(image.isa));
    put(l.file_offset(l.dynsym.addr), image.dynsym);
    put(l.file_offset(l.dynstr.addr), image.dynstr);
    put(l.file_offset(l.hash.addr), image.hash);
    put(l.file_offset(l.rela_plt.addr), image.rela_plt);
    put(l.file_offset(l.plt.addr), image.plt);
    put(l.file_offset(l.text.addr), image.text);
    put(l.file_offset(l.dynamic.addr), image.dynamic);
    put(l.file_offset(l.got_plt.addr), image.got_plt);
    put(l.file_offset(l.rodata.addr), image.rodata);
    put(l.file_offset(l.data.addr), image.data);

    // ---- section headers ----
    let dynstr_index = 3u32; // null, .interp, .dynsym, .dynstr
    let shdrs = [
        Shdr {
            name: "",
            sh_type: 0,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            align: 0,
            entsize: 0,
        },
        Shdr {
            name: ".interp",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC,
            addr: l.interp.addr,
            offset: l.file_offset(l.interp.addr),
            size: l.interp.size as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        },
        Shdr {
            name: ".dynsym",
            sh_type: SHT_DYNSYM,
            flags: SHF_ALLOC,
            addr: l.dynsym.addr,
            offset: l.file_offset(l.dynsym.addr),
            size: l.dynsym.size as u64,
            link: dynstr_index,
            info: 1,
            align: 8,
            entsize: 24,
        },
        Shdr {
            name: ".dynstr",
            sh_type: SHT_STRTAB,
            flags: SHF_ALLOC,
            addr: l.dynstr.addr,
            offset: l.file_offset(l.dynstr.addr),
            size: l.dynstr.size as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        },
        Shdr {
            name: ".hash",
            sh_type: SHT_HASH,
            flags: SHF_ALLOC,
            addr: l.hash.addr,
            offset: l.file_offset(l.hash.addr),
            size: l.hash.size as u64,
            link: 2,
            info: 0,
            align: 8,
            entsize: 4,
        },
        Shdr {
            name: ".rela.plt",
            sh_type: SHT_RELA,
            flags: SHF_ALLOC,
            addr: l.rela_plt.addr,
            offset: l.file_offset(l.rela_plt.addr),
            size: l.rela_plt.size as u64,
            link: 2,
            info: 6,
            align: 8,
            entsize: 24,
        },
        Shdr {
            name: ".plt",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC | SHF_EXECINSTR,
            addr: l.plt.addr,
            offset: l.file_offset(l.plt.addr),
            size: l.plt.size as u64,
            link: 0,
            info: 0,
            align: 16,
            entsize: 16,
        },
        Shdr {
            name: ".text",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC | SHF_EXECINSTR,
            addr: l.text.addr,
            offset: l.file_offset(l.text.addr),
            size: l.text.size as u64,
            link: 0,
            info: 0,
            align: 16,
            entsize: 0,
        },
        Shdr {
            name: ".rodata",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC,
            addr: l.rodata.addr,
            offset: l.file_offset(l.rodata.addr),
            size: l.rodata.size as u64,
            link: 0,
            info: 0,
            align: 16,
            entsize: 0,
        },
        Shdr {
            name: ".dynamic",
            sh_type: SHT_DYNAMIC,
            flags: SHF_ALLOC | SHF_WRITE,
            addr: l.dynamic.addr,
            offset: l.file_offset(l.dynamic.addr),
            size: l.dynamic.size as u64,
            link: dynstr_index,
            info: 0,
            align: 8,
            entsize: 16,
        },
        Shdr {
            name: ".got.plt",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC | SHF_WRITE,
            addr: l.got_plt.addr,
            offset: l.file_offset(l.got_plt.addr),
            size: l.got_plt.size as u64,
            link: 0,
            info: 0,
            align: 8,
            entsize: 8,
        },
        Shdr {
            name: ".data",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC | SHF_WRITE,
            addr: l.data.addr,
            offset: l.file_offset(l.data.addr),
            size: l.data.size as u64,
            link: 0,
            info: 0,
            align: 16,
            entsize: 0,
        },
        Shdr {
            name: ".bss",
            sh_type: SHT_NOBITS,
            flags: SHF_ALLOC | SHF_WRITE,
            addr: l.bss.addr,
            offset: l.file_offset(l.rw_end),
            size: l.bss.size as u64,
            link: 0,
            info: 0,
            align: 16,
            entsize: 0,
        },
        Shdr {
            name: ".shstrtab",
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: 0, // patched below
            size: 0,   // patched below
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        },
    ];

    // shstrtab
    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::with_capacity(shdrs.len());
    for sh in &shdrs {
        if sh.name.is_empty() {
            name_offsets.push(0u32);
        } else {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(sh.name.as_bytes());
            shstrtab.push(0);
        }
    }

    let shstrtab_offset = body.len() as u64;
    let shoff = shstrtab_offset + shstrtab.len() as u64;
    let shnum = shdrs.len() as u16;
    let shstrndx = shnum - 1;

    // ---- ELF header ----
    let mut out = Vec::with_capacity(body.len() + shstrtab.len() + 64 * shdrs.len() + 64);
    let mut ident = [0u8; EI_NIDENT];
    ident[0..4].copy_from_slice(b"\x7fELF");
    ident[4] = 2; // ELFCLASS64
    ident[5] = 1; // ELFDATA2LSB
    ident[6] = 1; // EV_CURRENT
    ident[7] = 0; // ELFOSABI_SYSV
    out.extend_from_slice(&ident);
    out.extend_from_slice(&ET_EXEC.to_le_bytes());
    out.extend_from_slice(&e_machine(image.isa).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&image.entry.to_le_bytes());
    out.extend_from_slice(&phoff.to_le_bytes());
    out.extend_from_slice(&shoff.to_le_bytes());
    out.extend_from_slice(&e_flags(image.isa).to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    out.extend_from_slice(&phnum.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&shnum.to_le_bytes());
    out.extend_from_slice(&shstrndx.to_le_bytes());

    // ---- program headers ----
    let mut phdr = |p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64, align: u64| {
        out.extend_from_slice(&p_type.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes()); // paddr
        out.extend_from_slice(&filesz.to_le_bytes());
        out.extend_from_slice(&memsz.to_le_bytes());
        out.extend_from_slice(&align.to_le_bytes());
    };
    let ph_size = 56u64 * phnum as u64;
    phdr(PT_PHDR, PF_R, phoff, l.base + phoff, ph_size, ph_size, 8);
    phdr(
        PT_INTERP,
        PF_R,
        l.file_offset(l.interp.addr),
        l.interp.addr,
        l.interp.size as u64,
        l.interp.size as u64,
        1,
    );
    // LOAD 1: headers + loader tables, R
    phdr(PT_LOAD, PF_R, 0, l.base, l.file_offset(l.ro_end), l.file_offset(l.ro_end), 0x1000);
    // LOAD 2: plt + text, RX
    let rx_off = l.file_offset(l.plt.addr);
    let rx_size = l.rx_end - l.plt.addr;
    phdr(PT_LOAD, PF_R | PF_X, rx_off, l.plt.addr, rx_size, rx_size, 0x1000);
    // LOAD 3: dynamic + got + rodata + data (+bss), RW
    let rw_off = l.file_offset(l.dynamic.addr);
    let rw_filesz = l.rw_end - l.dynamic.addr;
    let rw_memsz = rw_filesz + l.bss.size as u64;
    phdr(PT_LOAD, PF_R | PF_W, rw_off, l.dynamic.addr, rw_filesz, rw_memsz, 0x1000);
    phdr(
        PT_DYNAMIC,
        PF_R | PF_W,
        l.file_offset(l.dynamic.addr),
        l.dynamic.addr,
        l.dynamic.size as u64,
        l.dynamic.size as u64,
        8,
    );

    // ---- body, shstrtab, section headers ----
    out.extend_from_slice(&body[out.len()..]);
    out.extend_from_slice(&shstrtab);
    for (i, sh) in shdrs.iter().enumerate() {
        let (offset, size) = if sh.name == ".shstrtab" {
            (shstrtab_offset, shstrtab.len() as u64)
        } else {
            (sh.offset, sh.size)
        };
        out.extend_from_slice(&name_offsets[i].to_le_bytes());
        out.extend_from_slice(&sh.sh_type.to_le_bytes());
        out.extend_from_slice(&sh.flags.to_le_bytes());
        out.extend_from_slice(&sh.addr.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&sh.link.to_le_bytes());
        out.extend_from_slice(&sh.info.to_le_bytes());
        out.extend_from_slice(&sh.align.to_le_bytes());
        out.extend_from_slice(&sh.entsize.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SectionSizes;

    fn image_bytes() -> Vec<u8> {
        let sizes = SectionSizes {
            interp: interp_path(Isa::X86_64).len(),
            dynsym: 48,
            dynstr: 32,
            hash: 20,
            rela_plt: 24,
            plt: 32,
            text: 128,
            dynamic: 15 * 16,
            got_plt: 32,
            rodata: 64,
            data: 640,
            bss: 0,
        };
        let layout = Layout::compute(&sizes);
        let text = vec![0xC3u8; 128];
        let image = ElfImage {
            isa: Isa::X86_64,
            layout,
            entry: layout.text.addr,
            plt: &[0u8; 32],
            text: &text,
            rodata: &[0u8; 64],
            data: &[0u8; 640],
            dynsym: &[0u8; 48],
            dynstr: &[0u8; 32],
            hash: &[0u8; 20],
            rela_plt: &[0u8; 24],
            dynamic: &[0u8; 240],
            got_plt: &[0u8; 32],
        };
        write(&image).unwrap()
    }

    #[test]
    fn test_elf_ident_and_header() {
        let bytes = image_bytes();
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], 2); // 64-bit
        assert_eq!(bytes[5], 1); // little-endian
        assert_eq!(u16::from_le_bytes(bytes[16..18].try_into().unwrap()), ET_EXEC);
        assert_eq!(u16::from_le_bytes(bytes[18..20].try_into().unwrap()), 62); // EM_X86_64
        assert_eq!(u16::from_le_bytes(bytes[54..56].try_into().unwrap()), 56); // phentsize
        assert_eq!(u16::from_le_bytes(bytes[56..58].try_into().unwrap()), 6); // phnum
    }

    #[test]
    fn test_entry_points_into_text() {
        let bytes = image_bytes();
        let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert!(entry >= Layout::EXEC_BASE);
        // The byte at the entry's file offset is the text's first byte.
        let off = (entry - Layout::EXEC_BASE) as usize;
        assert_eq!(bytes[off], 0xC3);
    }

    #[test]
    fn test_interp_segment_contains_loader_path() {
        let bytes = image_bytes();
        let s = String::from_utf8_lossy(&bytes);
        assert!(s.contains("/lib64/ld-linux-x86-64.so.2"));
    }

    #[test]
    fn test_program_header_types_in_order() {
        let bytes = image_bytes();
        let phoff = u64::from_le_bytes(bytes[32..40].try_into().unwrap()) as usize;
        let types: Vec<u32> = (0..6)
            .map(|i| u32::from_le_bytes(bytes[phoff + 56 * i..phoff + 56 * i + 4].try_into().unwrap()))
            .collect();
        assert_eq!(types, vec![PT_PHDR, PT_INTERP, PT_LOAD, PT_LOAD, PT_LOAD, PT_DYNAMIC]);
    }

    #[test]
    fn test_load_flags() {
        let bytes = image_bytes();
        let phoff = u64::from_le_bytes(bytes[32..40].try_into().unwrap()) as usize;
        let flags: Vec<u32> = (2..5)
            .map(|i| {
                u32::from_le_bytes(bytes[phoff + 56 * i + 4..phoff + 56 * i + 8].try_into().unwrap())
            })
            .collect();
        assert_eq!(flags, vec![PF_R, PF_R | PF_X, PF_R | PF_W]);
    }

    #[test]
    fn test_section_header_count_and_strtab() {
        let bytes = image_bytes();
        let shnum = u16::from_le_bytes(bytes[60..62].try_into().unwrap());
        assert_eq!(shnum, 14);
        let s = String::from_utf8_lossy(&bytes);
        for name in [".dynsym", ".rela.plt", ".got.plt", ".shstrtab", ".bss"] {
            assert!(s.contains(name), "missing section name {name}");
        }
    }
}
