//! Symbol and address table
//!
//! A flat keyed store mapping names to byte-level regions of the output
//! image. Offsets are frozen when a symbol is defined; addresses become
//! available once the owning segment is assigned a base. The only permitted
//! form of reassignment is the two-pass supersede: the driver re-assigns a
//! segment base (pass-one estimate replaced by the authoritative layout) and
//! may drop and re-import the text labels for the second emission pass.

use crate::error::{EmitError, EmitResult};
use crate::sink::ByteSink;
use rustc_hash::FxHashMap;

/// Output image segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Text,
    Rodata,
    Data,
    /// PLT trampolines (owned by the dynamic-link builder)
    Plt,
    /// .got.plt slots (owned by the dynamic-link builder)
    Got,
}

impl Segment {
    pub fn name(self) -> &'static str {
        match self {
            Segment::Text => ".text",
            Segment::Rodata => ".rodata",
            Segment::Data => ".data",
            Segment::Plt => ".plt",
            Segment::Got => ".got.plt",
        }
    }

    fn index(self) -> usize {
        match self {
            Segment::Text => 0,
            Segment::Rodata => 1,
            Segment::Data => 2,
            Segment::Plt => 3,
            Segment::Got => 4,
        }
    }
}

/// A named byte-level region of the image.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub segment: Segment,
    pub offset: usize,
    pub size: usize,
}

/// Name → region store with per-segment base addresses.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: FxHashMap<String, SymbolInfo>,
    bases: [Option<u64>; 5],
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Define a sized symbol at an explicit offset.
    pub fn define(&mut self, name: &str, segment: Segment, offset: usize, size: usize) -> EmitResult<()> {
        if self.symbols.contains_key(name) {
            return Err(EmitError::DuplicateSymbol {
                name: name.to_string(),
                segment: segment.name(),
            });
        }
        self.symbols.insert(name.to_string(), SymbolInfo { segment, offset, size });
        Ok(())
    }

    /// Define a zero-width symbol (function entries, loop labels).
    pub fn define_label(&mut self, name: &str, segment: Segment, offset: usize) -> EmitResult<()> {
        self.define(name, segment, offset, 0)
    }

    /// Copy every label a sink has accumulated into the table.
    pub fn import_labels(&mut self, sink: &ByteSink) -> EmitResult<()> {
        let segment = sink.segment();
        // Deterministic import order keeps duplicate reports stable.
        let mut labels: Vec<(&str, usize)> = sink.labels().collect();
        labels.sort_unstable();
        for (name, offset) in labels {
            self.define_label(name, segment, offset)?;
        }
        Ok(())
    }

    /// Make every symbol in `segment` resolvable.
    ///
    /// Re-assigning a base is the controlled supersede used between the two
    /// emission passes: offsets stay frozen, the base moves.
    pub fn assign_base(&mut self, segment: Segment, base: u64) {
        self.bases[segment.index()] = Some(base);
    }

    pub fn base_of(&self, segment: Segment) -> Option<u64> {
        self.bases[segment.index()]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Option<&SymbolInfo> {
        self.symbols.get(name)
    }

    /// Resolve a symbol to its runtime address.
    pub fn resolve(&self, name: &str) -> EmitResult<u64> {
        let info = self.symbols.get(name).ok_or_else(|| EmitError::UndefinedSymbol {
            name: name.to_string(),
            offset: 0,
        })?;
        let base = self.bases[info.segment.index()].ok_or_else(|| EmitError::UnresolvedAddress {
            name: name.to_string(),
        })?;
        Ok(base + info.offset as u64)
    }

    /// Drop every symbol belonging to `segment` so a re-emission pass can
    /// re-import fresh labels. Part of the two-pass supersede; all other
    /// redefinition is forbidden.
    pub fn reset_segment(&mut self, segment: Segment) {
        self.symbols.retain(|_, info| info.segment != segment);
    }

    /// Symbols of one segment, sorted by name (deterministic layout order).
    pub fn symbols_in(&self, segment: Segment) -> Vec<(&str, &SymbolInfo)> {
        let mut out: Vec<(&str, &SymbolInfo)> = self
            .symbols
            .iter()
            .filter(|(_, info)| info.segment == segment)
            .map(|(name, info)| (name.as_str(), info))
            .collect();
        out.sort_unstable_by_key(|(name, _)| *name);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_resolve() {
        let mut table = SymbolTable::new();
        table.define("str_0", Segment::Rodata, 0x20, 8).unwrap();
        assert!(table.resolve("str_0").is_err());
        table.assign_base(Segment::Rodata, 0x403000);
        assert_eq!(table.resolve("str_0").unwrap(), 0x403020);
    }

    #[test]
    fn test_redefinition_forbidden() {
        let mut table = SymbolTable::new();
        table.define_label("main", Segment::Text, 0).unwrap();
        let err = table.define_label("main", Segment::Text, 8).unwrap_err();
        assert!(matches!(err, EmitError::DuplicateSymbol { .. }));
    }

    #[test]
    fn test_base_supersede_moves_addresses() {
        let mut table = SymbolTable::new();
        table.define("lit", Segment::Rodata, 0x10, 8).unwrap();
        table.assign_base(Segment::Rodata, 0x1000);
        assert_eq!(table.resolve("lit").unwrap(), 0x1010);
        // Pass-one estimate superseded by the authoritative layout.
        table.assign_base(Segment::Rodata, 0x403000);
        assert_eq!(table.resolve("lit").unwrap(), 0x403010);
    }

    #[test]
    fn test_reset_segment_drops_only_that_segment() {
        let mut table = SymbolTable::new();
        table.define_label("f", Segment::Text, 0).unwrap();
        table.define("lit", Segment::Rodata, 0, 8).unwrap();
        table.reset_segment(Segment::Text);
        assert!(!table.contains("f"));
        assert!(table.contains("lit"));
        // Re-import after reset is allowed.
        table.define_label("f", Segment::Text, 4).unwrap();
    }

    #[test]
    fn test_sorted_segment_listing() {
        let mut table = SymbolTable::new();
        table.define("b", Segment::Rodata, 8, 8).unwrap();
        table.define("a", Segment::Rodata, 0, 8).unwrap();
        let names: Vec<&str> = table.symbols_in(Segment::Rodata).iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
