//! Image layout
//!
//! Assigns final virtual addresses to every section, following the fixed
//! page plan: headers at the base, the read-only loader tables at the
//! first 0x1000-aligned offset, `.plt` + `.text` on the next page (RX),
//! and `.dynamic`, `.got.plt`, `.rodata`, `.data`, `.bss` on the page
//! after (RW). File offsets equal `vaddr - base` throughout, so each
//! PT_LOAD maps congruently.

const PAGE: u64 = 0x1000;

/// Section byte sizes fed into layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionSizes {
    pub interp: usize,
    pub dynsym: usize,
    pub dynstr: usize,
    pub hash: usize,
    pub rela_plt: usize,
    pub plt: usize,
    pub text: usize,
    pub dynamic: usize,
    pub got_plt: usize,
    pub rodata: usize,
    pub data: usize,
    pub bss: usize,
}

/// A placed section.
#[derive(Debug, Clone, Copy, Default)]
pub struct Placed {
    pub addr: u64,
    pub size: usize,
}

impl Placed {
    pub fn end(&self) -> u64 {
        self.addr + self.size as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub base: u64,
    pub interp: Placed,
    pub dynsym: Placed,
    pub dynstr: Placed,
    pub hash: Placed,
    pub rela_plt: Placed,
    pub plt: Placed,
    pub text: Placed,
    pub dynamic: Placed,
    pub got_plt: Placed,
    pub rodata: Placed,
    pub data: Placed,
    pub bss: Placed,
    /// End of the read-only header segment.
    pub ro_end: u64,
    /// End of the executable segment.
    pub rx_end: u64,
    /// End of the writable segment (file-backed part).
    pub rw_end: u64,
}

fn align_up(v: u64, a: u64) -> u64 {
    (v + a - 1) & !(a - 1)
}

impl Layout {
    /// Default link base for a fixed-address executable.
    pub const EXEC_BASE: u64 = 0x40_0000;

    pub fn compute(sizes: &SectionSizes) -> Layout {
        let base = Self::EXEC_BASE;
        // Headers live in the first page; loader tables on the next.
        let mut at = base + PAGE;

        let mut place = |size: usize, align: u64, at: &mut u64| {
            *at = align_up(*at, align);
            let p = Placed { addr: *at, size };
            *at += size as u64;
            p
        };

        let interp = place(sizes.interp, 1, &mut at);
        let dynsym = place(sizes.dynsym, 8, &mut at);
        let dynstr = place(sizes.dynstr, 1, &mut at);
        let hash = place(sizes.hash, 8, &mut at);
        let rela_plt = place(sizes.rela_plt, 8, &mut at);
        let ro_end = at;

        at = align_up(at, PAGE);
        let plt = place(sizes.plt, 16, &mut at);
        let text = place(sizes.text, 16, &mut at);
        let rx_end = at;

        at = align_up(at, PAGE);
        let dynamic = place(sizes.dynamic, 8, &mut at);
        let got_plt = place(sizes.got_plt, 8, &mut at);
        let rodata = place(sizes.rodata, 16, &mut at);
        let data = place(sizes.data, 16, &mut at);
        let rw_end = at;
        let bss = place(sizes.bss, 16, &mut at);

        Layout {
            base,
            interp,
            dynsym,
            dynstr,
            hash,
            rela_plt,
            plt,
            text,
            dynamic,
            got_plt,
            rodata,
            data,
            bss,
            ro_end,
            rx_end,
            rw_end,
        }
    }

    pub fn file_offset(&self, addr: u64) -> u64 {
        addr - self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> SectionSizes {
        SectionSizes {
            interp: 28,
            dynsym: 24 * 4,
            dynstr: 64,
            hash: 32,
            rela_plt: 72,
            plt: 64,
            text: 0x2000,
            dynamic: 15 * 16,
            got_plt: 48,
            rodata: 256,
            data: 640,
            bss: 0,
        }
    }

    #[test]
    fn test_page_plan() {
        let l = Layout::compute(&sizes());
        assert_eq!(l.interp.addr, l.base + 0x1000);
        // plt starts on its own page
        assert_eq!(l.plt.addr % 0x1000, 0);
        assert!(l.plt.addr >= l.ro_end);
        // text follows plt in the same RX region
        assert_eq!(l.text.addr, l.plt.end().next_multiple_of(16));
        // dynamic on the page after the RX region
        assert_eq!(l.dynamic.addr % 0x1000, 0);
        assert!(l.dynamic.addr >= l.rx_end);
    }

    #[test]
    fn test_monotonic_addresses() {
        let l = Layout::compute(&sizes());
        let addrs = [
            l.interp.addr,
            l.dynsym.addr,
            l.dynstr.addr,
            l.hash.addr,
            l.rela_plt.addr,
            l.plt.addr,
            l.text.addr,
            l.dynamic.addr,
            l.got_plt.addr,
            l.rodata.addr,
            l.data.addr,
            l.bss.addr,
        ];
        for pair in addrs.windows(2) {
            assert!(pair[0] <= pair[1], "layout must be monotonic");
        }
    }

    #[test]
    fn test_file_offsets_congruent() {
        let l = Layout::compute(&sizes());
        assert_eq!(l.file_offset(l.text.addr) % 0x1000, l.text.addr % 0x1000);
    }
}
