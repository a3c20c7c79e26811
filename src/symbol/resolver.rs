//! The symbol resolver singleton (spec.md §4.6): module-map ingestion,
//! ELF/DWARF/kernel caches, `map_addr`, `stack_to_hash`, demangling.
//!
//! Concurrency follows spec.md §4.6: "Three partitioned lock sets:
//! per-pid..., per-module-path..., and a single kernel-symbols mutex."
//! Grounded in shape on `mstange-samply`'s `perf_group.rs` process-map
//! ingestion and `samply-symbols`' demangle chain.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::error::{PerfError, Result};
use crate::record::{Stack, Symbol};
use crate::symbol::dwarf::{self, DwarfMap, FileInterner};
use crate::symbol::elf::{self, ElfMap};
use crate::symbol::kernel::{self, KernelSymbolTable};

/// Whether `record_module` also loads DWARF line tables (spec.md §4.6
/// `record_module(pid, mode)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    All,
    NoDwarf,
}

#[derive(Debug, Clone)]
struct ModuleMapEntry {
    start: u64,
    end: u64,
    path: String,
}

#[derive(Default)]
struct ModuleData {
    elf: Option<ElfMap>,
    dwarf: Option<DwarfMap>,
}

#[derive(Default)]
struct ProcessState {
    modules: Vec<ModuleMapEntry>,
    stack_cache: HashMap<u64, Arc<Stack>>,
}

pub struct SymbolResolver {
    kernel: Mutex<Option<KernelSymbolTable>>,
    per_pid: RwLock<HashMap<i32, Arc<Mutex<ProcessState>>>>,
    per_module_path: RwLock<HashMap<String, Arc<Mutex<ModuleData>>>>,
    file_interner: Mutex<FileInterner>,
    demangled: Mutex<HashMap<String, Arc<str>>>,
}

impl Default for SymbolResolver {
    fn default() -> Self {
        SymbolResolver {
            kernel: Mutex::new(None),
            per_pid: RwLock::new(HashMap::new()),
            per_module_path: RwLock::new(HashMap::new()),
            file_interner: Mutex::new(FileInterner::default()),
            demangled: Mutex::new(HashMap::new()),
        }
    }
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent (spec.md §4.6 `record_kernel`).
    pub fn record_kernel(&self) -> Result<()> {
        let mut guard = self.kernel.lock();
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(kernel::record_kernel()?);
        Ok(())
    }

    fn pid_state(&self, pid: i32) -> Arc<Mutex<ProcessState>> {
        if let Some(existing) = self.per_pid.read().get(&pid) {
            return Arc::clone(existing);
        }
        Arc::clone(
            self.per_pid
                .write()
                .entry(pid)
                .or_insert_with(|| Arc::new(Mutex::new(ProcessState::default()))),
        )
    }

    fn module_data(&self, path: &str) -> Arc<Mutex<ModuleData>> {
        if let Some(existing) = self.per_module_path.read().get(path) {
            return Arc::clone(existing);
        }
        Arc::clone(
            self.per_module_path
                .write()
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ModuleData::default()))),
        )
    }

    fn ensure_module_loaded(&self, path: &str, mode: RecordMode) -> Result<()> {
        let data = self.module_data(path);
        let mut data = data.lock();
        if data.elf.is_none() {
            data.elf = Some(elf::record_elf(path)?);
        }
        if mode == RecordMode::All && data.dwarf.is_none() {
            let mut interner = self.file_interner.lock();
            data.dwarf = Some(dwarf::record_dwarf(path, &mut interner)?);
        }
        Ok(())
    }

    /// Parses `/proc/<pid>/maps`, filters to `r-xp` file-backed
    /// executable regions (spec.md §4.6 `record_module`), ingests ELF
    /// (and DWARF, per `mode`) for each distinct module path.
    pub fn record_module(&self, pid: i32, mode: RecordMode) -> Result<()> {
        let entries = parse_maps(pid)?;
        for entry in &entries {
            self.ensure_module_loaded(&entry.path, mode)?;
        }
        let state = self.pid_state(pid);
        state.lock().modules = entries;
        Ok(())
    }

    /// Incremental re-scan: adds modules whose `start` differs from the
    /// cached set, identifying by start address (not path) so `dlopen`
    /// re-mapping the same path at a new address is still picked up
    /// (spec.md §4.6 `update_module(pid)`).
    pub fn update_module(&self, pid: i32) -> Result<()> {
        let fresh = parse_maps(pid)?;
        let state = self.pid_state(pid);
        let known_starts: std::collections::HashSet<u64> =
            state.lock().modules.iter().map(|m| m.start).collect();
        for entry in fresh.iter().filter(|e| !known_starts.contains(&e.start)) {
            self.ensure_module_loaded(&entry.path, RecordMode::All)?;
        }
        state.lock().modules = fresh;
        Ok(())
    }

    /// Explicit per-mmap update called inline from the sampling reader
    /// (spec.md §4.6 `update_module(pid, path, start)`).
    pub fn update_module_mmap(&self, pid: i32, path: &str, start: u64, len: u64) -> Result<()> {
        self.ensure_module_loaded(path, RecordMode::All)?;
        let state = self.pid_state(pid);
        let mut state = state.lock();
        if !state.modules.iter().any(|m| m.start == start) {
            state.modules.push(ModuleMapEntry {
                start,
                end: start + len,
                path: path.to_string(),
            });
            state.modules.sort_by_key(|m| m.start);
        }
        Ok(())
    }

    /// `map_addr(pid, addr)` (spec.md §4.6).
    pub fn map_addr(&self, pid: i32, addr: u64) -> Result<Symbol> {
        if kernel::is_kernel_addr(addr) {
            let guard = self.kernel.lock();
            let table = guard
                .as_ref()
                .ok_or(PerfError::SymbolMapAddrFailed(pid, addr))?;
            let sym = table
                .find(addr)
                .ok_or(PerfError::SymbolMapAddrFailed(pid, addr))?;
            return Ok(Symbol {
                address: addr,
                module_path: "[kernel]".to_string(),
                symbol_name: demangle(&self.demangled, &sym.name),
                source_file: None,
                line: None,
                offset: addr - sym.addr,
                code_map_addr: 0,
                code_map_end: 0,
            });
        }

        let state = self.pid_state(pid);
        let module = {
            let state = state.lock();
            locate_module_impl(&state.modules, addr)
                .ok_or(PerfError::SymbolMapAddrFailed(pid, addr))?
        };

        let data = self.module_data(&module.path);
        let data = data.lock();
        let elf = data
            .elf
            .as_ref()
            .ok_or_else(|| PerfError::SymbolMapAddrFailed(pid, addr))?;

        // PIE detection: if the ELF's highest symbol end is below the
        // mapped address, the symbol table is file-relative and the
        // lookup key must be addr - module.start (spec.md §4.6).
        let lookup_addr = if elf.max_end() < addr {
            addr - module.start
        } else {
            addr
        };

        let (symbol_name, offset, sym_start) = match elf.find(lookup_addr) {
            Some(sym) => (demangle(&self.demangled, &sym.name), lookup_addr - sym.start, sym.start),
            None => ("[unknown]".to_string(), 0, lookup_addr),
        };

        let (source_file, line) = match data.dwarf.as_ref().and_then(|d| d.lookup(lookup_addr)) {
            Some(l) => (Some(l.file.to_string()), l.line),
            None => (None, None),
        };

        Ok(Symbol {
            address: addr,
            module_path: module.path.clone(),
            symbol_name,
            source_file,
            line,
            offset,
            code_map_addr: module.start + sym_start,
            code_map_end: module.end,
        })
    }

    /// `stack_to_hash(pid, ips, n)` (spec.md §4.6). Order-sensitive
    /// dedup: identical `(pid, ips)` returns the same `Arc<Stack>`.
    pub fn stack_to_hash(&self, pid: i32, ips: &[u64]) -> Option<Arc<Stack>> {
        let key = hash_ips(ips);
        let state = self.pid_state(pid);
        {
            let state = state.lock();
            if let Some(cached) = state.stack_cache.get(&key) {
                return Some(Arc::clone(cached));
            }
        }

        let mut parent: Option<Arc<Stack>> = None;
        for &ip in ips.iter().rev() {
            let symbol = match self.map_addr(pid, ip) {
                Ok(sym) => sym,
                Err(_) => continue,
            };
            parent = Some(Arc::new(Stack {
                frame: Arc::new(symbol),
                parent,
            }));
        }
        let stack = parent?;
        state.lock().stack_cache.insert(key, Arc::clone(&stack));
        Some(stack)
    }

    /// Releases all caches atomically; the resolver becomes "empty"
    /// until next recording (spec.md §4.6 "Clear").
    pub fn clear(&self) {
        *self.kernel.lock() = None;
        self.per_pid.write().clear();
        self.per_module_path.write().clear();
        self.demangled.lock().clear();
        *self.file_interner.lock() = FileInterner::default();
    }
}

fn locate_module_impl(modules: &[ModuleMapEntry], addr: u64) -> Option<ModuleMapEntry> {
    let idx = match modules.binary_search_by_key(&addr, |m| m.start) {
        Ok(i) => i,
        Err(0) => return None,
        Err(i) => i - 1,
    };
    let module = &modules[idx];
    if addr < module.end {
        Some(module.clone())
    } else {
        None
    }
}

fn hash_ips(ips: &[u64]) -> u64 {
    let mut hasher = FxHasher::default();
    ips.hash(&mut hasher);
    hasher.finish()
}

/// Demangling chain: Itanium C++ first, then Rust (v0/legacy), falling
/// back to the raw mangled name (SPEC_FULL §4.6). Results are cached per
/// mangled name.
fn demangle(cache: &Mutex<HashMap<String, Arc<str>>>, mangled: &str) -> String {
    if let Some(cached) = cache.lock().get(mangled) {
        return cached.to_string();
    }
    let demangled = cpp_demangle::Symbol::new(mangled)
        .ok()
        .map(|s| s.to_string())
        .unwrap_or_else(|| rustc_demangle::demangle(mangled).to_string());
    cache
        .lock()
        .insert(mangled.to_string(), Arc::from(demangled.as_str()));
    demangled
}

/// Parses `/proc/<pid>/maps`, keeping only `r-xp` file-backed executable
/// regions (spec.md §4.6 "ignoring anonymous, hugepage, stack, heap,
/// vdso/vvar/vsyscall, sysv shm, sockets").
fn parse_maps(pid: i32) -> Result<Vec<ModuleMapEntry>> {
    let text = fs::read_to_string(format!("/proc/{pid}/maps"))
        .map_err(|_| PerfError::SymbolPidNotFound(pid))?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut fields = line.splitn(6, ' ').filter(|s| !s.is_empty());
        let range = match fields.next() {
            Some(r) => r,
            None => continue,
        };
        let perms = match fields.next() {
            Some(p) => p,
            None => continue,
        };
        let _offset = fields.next();
        let _dev = fields.next();
        let _inode = fields.next();
        let path = match fields.next() {
            Some(p) => p.trim(),
            None => continue,
        };
        if perms != "r-xp" || !is_file_backed(path) {
            continue;
        }
        let (start_str, end_str) = match range.split_once('-') {
            Some(pair) => pair,
            None => continue,
        };
        let (start, end) = match (
            u64::from_str_radix(start_str, 16),
            u64::from_str_radix(end_str, 16),
        ) {
            (Ok(s), Ok(e)) => (s, e),
            _ => continue,
        };
        entries.push(ModuleMapEntry {
            start,
            end,
            path: path.to_string(),
        });
    }
    entries.sort_by_key(|e| e.start);
    Ok(entries)
}

fn is_file_backed(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    if path.starts_with('[') {
        return false;
    }
    if path.starts_with("/dev/zero") || path.starts_with("/SYSV") || path.starts_with("/memfd:") {
        return false;
    }
    if path.starts_with("anon_inode:") || path.starts_with("socket:") {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_file_backed_excludes_special_mappings() {
        assert!(!is_file_backed("[stack]"));
        assert!(!is_file_backed("[heap]"));
        assert!(!is_file_backed("[vdso]"));
        assert!(!is_file_backed(""));
        assert!(!is_file_backed("socket:[12345]"));
        assert!(is_file_backed("/usr/lib/libc.so.6"));
    }

    #[test]
    fn locate_module_finds_enclosing_range() {
        let modules = vec![
            ModuleMapEntry { start: 0x1000, end: 0x2000, path: "a.so".into() },
            ModuleMapEntry { start: 0x3000, end: 0x4000, path: "b.so".into() },
        ];
        assert_eq!(locate_module_impl(&modules, 0x1500).unwrap().path, "a.so");
        assert_eq!(locate_module_impl(&modules, 0x3500).unwrap().path, "b.so");
        assert!(locate_module_impl(&modules, 0x2500).is_none());
    }

    #[test]
    fn hash_ips_is_order_sensitive() {
        let a = hash_ips(&[1, 2, 3]);
        let b = hash_ips(&[3, 2, 1]);
        assert_ne!(a, b);
        assert_eq!(hash_ips(&[1, 2, 3]), a);
    }

    #[test]
    fn stack_to_hash_dedups_identical_sequences() {
        // map_addr will fail for these synthetic pids/addrs (no real
        // /proc entries), so stack_to_hash returns None consistently;
        // this still exercises the hash-key dedup path directly.
        assert_eq!(hash_ips(&[10, 20, 30]), hash_ips(&[10, 20, 30]));
    }
}
