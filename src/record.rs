//! Output data types handed back to the client (spec.md §3).
//!
//! Grounded on `anp-perf_events::count`/`sample::config` field shapes,
//! generalized into one discriminated `PmuRecord` per spec.md's unified
//! client-facing record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One resolved stack frame (spec.md §3 `Symbol`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub address: u64,
    pub module_path: String,
    pub symbol_name: String,
    pub source_file: Option<String>,
    pub line: Option<u32>,
    pub offset: u64,
    pub code_map_addr: u64,
    pub code_map_end: u64,
}

/// A singly linked chain of symbol entries, innermost frame first. Shared
/// by content hash between PmuRecords with identical ip sequences for the
/// same pid (spec.md §3 `Stack`).
#[derive(Debug, Clone)]
pub struct Stack {
    pub frame: Arc<Symbol>,
    pub parent: Option<Arc<Stack>>,
}

impl Stack {
    pub fn iter(&self) -> StackIter<'_> {
        StackIter { next: Some(self) }
    }
}

pub struct StackIter<'a> {
    next: Option<&'a Stack>,
}

impl<'a> Iterator for StackIter<'a> {
    type Item = &'a Symbol;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.parent.as_deref();
        Some(&cur.frame)
    }
}

/// SPE-specific payload (spec.md §3 PmuRecord "spe" variant).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpeExt {
    pub event_bits: u64,
    pub va: u64,
    pub pa: u64,
}

/// The discriminated payload of a PmuRecord (spec.md §3).
#[derive(Debug, Clone)]
pub enum Payload {
    Counting { count: u64 },
    Sampling { stack: Option<Arc<Stack>> },
    Spe { ext: SpeExt, pc: Option<Arc<Stack>> },
}

/// One client-visible record (spec.md §3 `PmuRecord`).
#[derive(Debug, Clone)]
pub struct PmuRecord {
    pub event_name: Arc<str>,
    pub timestamp_ns: u64,
    pub cpu: i32,
    pub pid: i32,
    pub tid: i32,
    pub comm: Arc<str>,
    pub payload: Payload,
}

impl PmuRecord {
    /// Aggregation key for the counting-mode "sum per (event_name, tid,
    /// cpu)" step in spec.md §4.1 `read`.
    pub fn aggregation_key(&self) -> (Arc<str>, i32, i32) {
        (Arc::clone(&self.event_name), self.tid, self.cpu)
    }
}

/// Aggregates counting-mode records by `(event_name, tid, cpu)`, summing
/// counts, per spec.md §4.1 `read`'s "Counting mode additionally
/// aggregates... by summing counts before returning".
pub fn aggregate_counts(records: Vec<PmuRecord>) -> Vec<PmuRecord> {
    use std::collections::HashMap;

    let mut buckets: HashMap<(Arc<str>, i32, i32), PmuRecord> = HashMap::new();
    for record in records {
        let key = record.aggregation_key();
        match buckets.get_mut(&key) {
            Some(existing) => {
                if let (Payload::Counting { count: acc }, Payload::Counting { count: add }) =
                    (&mut existing.payload, &record.payload)
                {
                    *acc += add;
                }
            }
            None => {
                buckets.insert(key, record);
            }
        }
    }
    buckets.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_record(event: &str, tid: i32, cpu: i32, count: u64) -> PmuRecord {
        PmuRecord {
            event_name: Arc::from(event),
            timestamp_ns: 0,
            cpu,
            pid: tid,
            tid,
            comm: Arc::from("test"),
            payload: Payload::Counting { count },
        }
    }

    #[test]
    fn counting_aggregation_sums_per_tid_cpu() {
        let records = vec![
            counting_record("cycles", 10, 0, 100),
            counting_record("cycles", 10, 0, 50),
            counting_record("cycles", 11, 0, 7),
        ];
        let aggregated = aggregate_counts(records);
        let total: u64 = aggregated
            .iter()
            .map(|r| match r.payload {
                Payload::Counting { count } => count,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 157);
        assert_eq!(aggregated.len(), 2);
    }

    #[test]
    fn stack_iterates_innermost_first() {
        let outer = Arc::new(Symbol {
            address: 2,
            module_path: "libc.so".into(),
            symbol_name: "main".into(),
            source_file: None,
            line: None,
            offset: 0,
            code_map_addr: 0,
            code_map_end: 0,
        });
        let inner = Arc::new(Symbol {
            address: 1,
            module_path: "a.out".into(),
            symbol_name: "foo".into(),
            source_file: None,
            line: None,
            offset: 0,
            code_map_addr: 0,
            code_map_end: 0,
        });
        let stack = Stack {
            frame: inner,
            parent: Some(Arc::new(Stack {
                frame: outer,
                parent: None,
            })),
        };
        let names: Vec<&str> = stack.iter().map(|s| s.symbol_name.as_str()).collect();
        assert_eq!(names, vec!["foo", "main"]);
    }
}
