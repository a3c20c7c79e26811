//! ELF symbol table ingestion (spec.md §4.6 `record_elf`).
//!
//! Grounded on `mstange-samply`'s `samply-symbols` crate's use of the
//! `object` crate for cross-format symbol-table reads.

use object::{Object, ObjectSymbol, SymbolKind};

use crate::error::{PerfError, Result};

/// One `STT_FUNC` entry from a module's symbol table.
#[derive(Debug, Clone)]
pub struct ElfSymbol {
    pub start: u64,
    pub end: u64,
    pub name: String,
}

/// Per-module-path symbol table, sorted by start address (spec.md §3
/// `ElfMap`).
#[derive(Debug, Clone, Default)]
pub struct ElfMap {
    pub symbols: Vec<ElfSymbol>,
}

impl ElfMap {
    /// Binary search for the symbol enclosing `addr` (spec.md §4.6
    /// `map_addr`: "binary-search ELF for the enclosing symbol").
    pub fn find(&self, addr: u64) -> Option<&ElfSymbol> {
        let idx = match self.symbols.binary_search_by_key(&addr, |s| s.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let sym = &self.symbols[idx];
        if addr < sym.end || sym.end == sym.start {
            Some(sym)
        } else {
            None
        }
    }

    pub fn max_end(&self) -> u64 {
        self.symbols.iter().map(|s| s.end).max().unwrap_or(0)
    }
}

/// Reads both the dynamic and static symbol tables of `path`, extracts
/// `STT_FUNC` entries, and sorts by start address (spec.md §4.6
/// `record_elf`).
pub fn record_elf(path: &str) -> Result<ElfMap> {
    let data = std::fs::read(path)
        .map_err(|e| PerfError::SymbolOpenFailed(path.to_string(), e))?;
    let file = object::File::parse(&*data)
        .map_err(|e| PerfError::SymbolElfFormat(path.to_string(), e.to_string()))?;

    let mut symbols: Vec<ElfSymbol> = file
        .symbols()
        .chain(file.dynamic_symbols())
        .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition())
        .filter_map(|sym| {
            let name = sym.name().ok()?.to_string();
            if name.is_empty() {
                return None;
            }
            let start = sym.address();
            let size = sym.size();
            Some(ElfSymbol {
                start,
                end: start + size.max(1),
                name,
            })
        })
        .collect();
    symbols.sort_by_key(|s| s.start);
    symbols.dedup_by_key(|s| s.start);

    Ok(ElfMap { symbols })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(u64, u64, &str)]) -> ElfMap {
        ElfMap {
            symbols: entries
                .iter()
                .map(|&(start, end, name)| ElfSymbol {
                    start,
                    end,
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn find_returns_enclosing_symbol() {
        let m = map(&[(0x1000, 0x1010, "foo"), (0x1010, 0x1030, "bar")]);
        assert_eq!(m.find(0x1005).unwrap().name, "foo");
        assert_eq!(m.find(0x1020).unwrap().name, "bar");
    }

    #[test]
    fn find_returns_none_before_first_symbol() {
        let m = map(&[(0x1000, 0x1010, "foo")]);
        assert!(m.find(0x0fff).is_none());
    }

    #[test]
    fn find_returns_none_past_last_symbol_end() {
        let m = map(&[(0x1000, 0x1010, "foo")]);
        assert!(m.find(0x2000).is_none());
    }

    #[test]
    fn max_end_tracks_highest_boundary() {
        let m = map(&[(0x1000, 0x1010, "foo"), (0x2000, 0x2100, "bar")]);
        assert_eq!(m.max_end(), 0x2100);
    }
}
