//! Append-only byte sink with labeled positions and deferred patches
//!
//! Every segment of the output image (.text, .rodata, .data, the plt/got
//! scratch) is one `ByteSink`. Emission appends little-endian bytes; branch
//! and data references whose targets are not yet placed append placeholder
//! bytes and record a [`Patch`] to be applied once addresses are assigned.

use crate::error::{EmitError, EmitResult};
use crate::symtab::Segment;
use rustc_hash::FxHashMap;

/// How the resolved target address is folded into the placeholder bytes.
///
/// The first four are ISA-independent in shape; the rest carry the split
/// bit fields of their ISA and are applied by the owning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// 64-bit absolute address
    Abs64,
    /// 32-bit pc-relative displacement; PC is the byte after the field
    /// (x86-64 call/jmp/lea semantics)
    PcRel32,
    /// ARM64 branch-with-link / unconditional branch, 26-bit word-addressed
    A64Branch26,
    /// ARM64 conditional branch / cbz-cbnz, 19-bit word-addressed
    A64Cond19,
    /// ARM64 ADRP page-relative 21-bit (page delta into immhi:immlo)
    A64AdrpPage21,
    /// ARM64 ADD/LDR low 12 bits of the target address
    A64Lo12,
    /// RISC-V JAL 20-bit split-field encoding
    RvJal20,
    /// RISC-V conditional branch 13-bit split-field encoding
    RvBranch13,
    /// RISC-V AUIPC upper-20 (with the +0x800 rounding carry)
    RvHi20,
    /// RISC-V I-type low-12 of the pc-relative pair (relative to the
    /// preceding AUIPC, whose offset is `anchor`)
    RvLo12,
}

/// A deferred fix-up recorded during emission.
#[derive(Debug, Clone)]
pub struct Patch {
    /// Offset of the *instruction* start within the segment
    pub at: usize,
    /// Symbol whose address resolves this patch
    pub symbol: String,
    pub kind: PatchKind,
    /// For paired encodings (AUIPC+lo12), offset of the anchor instruction
    pub anchor: usize,
}

/// An append-only byte buffer for one output segment.
#[derive(Debug)]
pub struct ByteSink {
    segment: Segment,
    bytes: Vec<u8>,
    labels: FxHashMap<String, usize>,
    patches: Vec<Patch>,
}

impl ByteSink {
    pub fn new(segment: Segment) -> Self {
        ByteSink {
            segment,
            bytes: Vec::new(),
            labels: FxHashMap::default(),
            patches: Vec::new(),
        }
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    /// Current length, i.e. the offset the next byte will land at.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Pad with zero bytes up to the given alignment.
    pub fn align_to(&mut self, align: usize) {
        while !self.bytes.len().is_multiple_of(align) {
            self.bytes.push(0);
        }
    }

    /// Bind `name` to the current cursor. Redefinition is a hard error:
    /// a symbol's offset is frozen the first time it is defined.
    pub fn define_label(&mut self, name: &str) -> EmitResult<()> {
        if self.labels.contains_key(name) {
            return Err(EmitError::DuplicateSymbol {
                name: name.to_string(),
                segment: self.segment.name(),
            });
        }
        self.labels.insert(name.to_string(), self.bytes.len());
        Ok(())
    }

    pub fn label_offset(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, usize)> {
        self.labels.iter().map(|(name, &off)| (name.as_str(), off))
    }

    /// Record a patch whose instruction started at `at`.
    pub fn request_patch(&mut self, at: usize, symbol: &str, kind: PatchKind) {
        self.patches.push(Patch { at, symbol: symbol.to_string(), kind, anchor: at });
    }

    /// Record a patch anchored to an earlier instruction (AUIPC pairs).
    pub fn request_patch_anchored(&mut self, at: usize, anchor: usize, symbol: &str, kind: PatchKind) {
        self.patches.push(Patch { at, symbol: symbol.to_string(), kind, anchor });
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Apply every recorded patch. `resolve` maps a symbol name to its final
    /// address; `apply` folds the address into the placeholder bytes per the
    /// patch kind (provided by the ISA backend). `base` is the segment's
    /// assigned base address, needed for pc-relative kinds.
    pub fn patch_all<R, A>(&mut self, base: u64, mut resolve: R, mut apply: A) -> EmitResult<()>
    where
        R: FnMut(&str) -> Option<u64>,
        A: FnMut(&mut [u8], &Patch, u64, u64) -> EmitResult<()>,
    {
        // Patches are applied in recording order; each touches only its
        // own placeholder bytes, so order does not affect the result.
        let patches = std::mem::take(&mut self.patches);
        for patch in &patches {
            let target = resolve(&patch.symbol).ok_or_else(|| EmitError::UndefinedSymbol {
                name: patch.symbol.clone(),
                offset: patch.at,
            })?;
            apply(&mut self.bytes, patch, target, base)?;
        }
        self.patches = patches;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_position() {
        let mut sink = ByteSink::new(Segment::Text);
        assert_eq!(sink.position(), 0);
        sink.write_u8(0xC3);
        sink.write_u32(0xDEADBEEF);
        assert_eq!(sink.position(), 5);
        assert_eq!(sink.bytes(), &[0xC3, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_label_redefinition_rejected() {
        let mut sink = ByteSink::new(Segment::Text);
        sink.define_label("entry").unwrap();
        let err = sink.define_label("entry").unwrap_err();
        assert!(matches!(err, EmitError::DuplicateSymbol { .. }));
    }

    #[test]
    fn test_align_to() {
        let mut sink = ByteSink::new(Segment::Rodata);
        sink.write_bytes(b"abc");
        sink.align_to(8);
        assert_eq!(sink.position(), 8);
        sink.align_to(8);
        assert_eq!(sink.position(), 8);
    }

    #[test]
    fn test_patch_all_resolves_symbols() {
        let mut sink = ByteSink::new(Segment::Text);
        sink.write_u8(0xE8);
        let at = sink.position();
        sink.request_patch(at, "target", PatchKind::PcRel32);
        sink.write_u32(0);

        sink.patch_all(
            0x1000,
            |name| (name == "target").then_some(0x2000),
            |bytes, patch, target, base| {
                let pc = base + patch.at as u64 + 4;
                let disp = (target as i64 - pc as i64) as i32;
                bytes[patch.at..patch.at + 4].copy_from_slice(&disp.to_le_bytes());
                Ok(())
            },
        )
        .unwrap();

        let disp = i32::from_le_bytes(sink.bytes()[1..5].try_into().unwrap());
        assert_eq!(disp, 0x2000 - (0x1000 + 1 + 4));
    }

    #[test]
    fn test_patch_undefined_symbol_fails() {
        let mut sink = ByteSink::new(Segment::Text);
        sink.request_patch(0, "nowhere", PatchKind::PcRel32);
        sink.write_u32(0);
        let err = sink
            .patch_all(0, |_| None, |_, _, _, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, EmitError::UndefinedSymbol { .. }));
    }
}
