//! DWARF line-table ingestion (spec.md §4.6 `record_dwarf`).
//!
//! Grounded on `mstange-samply`'s `samply-symbols` use of `gimli` for
//! `.debug_line` parsing. File path strings are interned through a
//! shared pool (spec.md §3 DwarfMap: "file strings are pooled in a
//! vector shared across all modules").

use std::sync::Arc;

use gimli::{EndianRcSlice, RunTimeEndian};
use object::Object;

use crate::error::{PerfError, Result};

/// One address's resolved line info.
#[derive(Debug, Clone)]
pub struct DwarfLine {
    pub address: u64,
    pub file: Arc<str>,
    pub line: Option<u32>,
}

/// Per-module-path ordered `address -> {file, line}` map (spec.md §3
/// `DwarfMap`).
#[derive(Debug, Clone, Default)]
pub struct DwarfMap {
    entries: Vec<DwarfLine>,
}

impl DwarfMap {
    /// `upper_bound` lookup over the address-ordered line map (spec.md
    /// §4.6 `map_addr`: "look up DWARF line by upper_bound").
    pub fn lookup(&self, addr: u64) -> Option<&DwarfLine> {
        match self.entries.binary_search_by_key(&addr, |e| e.address) {
            Ok(i) => Some(&self.entries[i]),
            Err(0) => None,
            Err(i) => Some(&self.entries[i - 1]),
        }
    }
}

/// Interns file-path strings so modules sharing source files (headers,
/// common libraries) share one allocation, matching spec.md's "pooled in
/// a vector shared across all modules".
#[derive(Debug, Default)]
pub struct FileInterner {
    pool: Vec<Arc<str>>,
}

impl FileInterner {
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.pool.iter().find(|p| p.as_ref() == s) {
            return Arc::clone(existing);
        }
        let rc: Arc<str> = Arc::from(s);
        self.pool.push(Arc::clone(&rc));
        rc
    }
}

fn load_section(
    object_file: &object::File,
    endian: RunTimeEndian,
    id: gimli::SectionId,
) -> EndianRcSlice<RunTimeEndian> {
    let data = object_file
        .section_by_name(id.name())
        .and_then(|s| s.uncompressed_data().ok())
        .unwrap_or_default();
    gimli::EndianRcSlice::new(Arc::from(&*data), endian)
}

/// Parses `path`'s `.debug_line` section(s) into an address-ordered
/// `DwarfMap`, interning file path strings via `interner`.
pub fn record_dwarf(path: &str, interner: &mut FileInterner) -> Result<DwarfMap> {
    let data = std::fs::read(path).map_err(|e| PerfError::SymbolOpenFailed(path.to_string(), e))?;
    let object_file = object::File::parse(&*data)
        .map_err(|e| PerfError::SymbolDwarfFormat(path.to_string(), e.to_string()))?;
    let endian = if object_file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let dwarf = gimli::Dwarf::load(|id| -> std::result::Result<_, gimli::Error> {
        Ok(load_section(&object_file, endian, id))
    })
    .map_err(|e| PerfError::SymbolDwarfFormat(path.to_string(), e.to_string()))?;

    let mut entries = Vec::new();
    let mut units = dwarf.units();
    while let Some(header) = units
        .next()
        .map_err(|e| PerfError::SymbolDwarfFormat(path.to_string(), e.to_string()))?
    {
        let unit = match dwarf.unit(header) {
            Ok(u) => u,
            Err(_) => continue,
        };
        let program = match unit.line_program.clone() {
            Some(p) => p,
            None => continue,
        };
        let file_header = program.header().clone();
        let mut rows = program.rows();
        while let Ok(Some((_, row))) = rows.next_row() {
            if row.end_sequence() {
                continue;
            }
            let file_name = row
                .file(&file_header)
                .and_then(|f| dwarf.attr_string(&unit, f.path_name()).ok())
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "<unknown>".to_string());
            entries.push(DwarfLine {
                address: row.address(),
                file: interner.intern(&file_name),
                line: row.line().map(|l| l.get() as u32),
            });
        }
    }
    entries.sort_by_key(|e| e.address);
    entries.dedup_by_key(|e| e.address);

    Ok(DwarfMap { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interner_dedupes_identical_paths() {
        let mut interner = FileInterner::default();
        let a = interner.intern("main.c");
        let b = interner.intern("main.c");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lookup_uses_upper_bound() {
        let map = DwarfMap {
            entries: vec![
                DwarfLine { address: 0x1000, file: Arc::from("a.c"), line: Some(10) },
                DwarfLine { address: 0x2000, file: Arc::from("a.c"), line: Some(20) },
            ],
        };
        let hit = map.lookup(0x1500).unwrap();
        assert_eq!(hit.line, Some(10));
        assert!(map.lookup(0x0fff).is_none());
    }
}
