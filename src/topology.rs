//! CPU and process topology helpers (spec.md §4.7).
//!
//! Thread enumeration is grounded on `mstange-samply`'s
//! `perf_group.rs::get_threads` (`/proc/<pid>/task` walk + `comm` read);
//! NUMA resolution reads `/sys/devices/system/node/node*/cpulist`
//! directly rather than linking a NUMA client library (none appears in
//! the example pack — see DESIGN.md).

use std::fs;
use std::path::Path;

use crate::error::{PerfError, Result};

/// `cpu_topology(core_id)` output (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    pub core_id: i32,
    pub physical_package_id: i32,
    pub numa_node: i32,
}

impl CpuTopology {
    /// Sentinel used for system-wide records (spec.md §4.7: "core_id ==
    /// -1 yields a sentinel {-1,-1,-1}").
    pub const SYSTEM_WIDE: CpuTopology = CpuTopology {
        core_id: -1,
        physical_package_id: -1,
        numa_node: -1,
    };
}

pub fn cpu_topology(core_id: i32) -> Result<CpuTopology> {
    if core_id < 0 {
        return Ok(CpuTopology::SYSTEM_WIDE);
    }
    let path = format!("/sys/bus/cpu/devices/cpu{core_id}/topology/physical_package_id");
    let physical_package_id = fs::read_to_string(&path)
        .map_err(PerfError::FailListenProc)?
        .trim()
        .parse::<i32>()
        .unwrap_or(-1);
    let numa_node = numa_node_for_cpu(core_id).unwrap_or(-1);
    Ok(CpuTopology {
        core_id,
        physical_package_id,
        numa_node,
    })
}

/// Resolves the NUMA node owning `cpu` by scanning
/// `/sys/devices/system/node/node*/cpulist` ranges (spec.md §4.7; see
/// SPEC_FULL §4.7 for why this replaces a NUMA library call).
fn numa_node_for_cpu(cpu: i32) -> Option<i32> {
    let node_dir = Path::new("/sys/devices/system/node");
    let entries = fs::read_dir(node_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_str()?;
        let node_id = name.strip_prefix("node")?.parse::<i32>().ok()?;
        let cpulist_path = entry.path().join("cpulist");
        let cpulist = fs::read_to_string(cpulist_path).ok()?;
        if cpulist_contains(&cpulist, cpu) {
            return Some(node_id);
        }
    }
    None
}

/// Parses a sysfs cpulist like `"0-3,8,10-11"` and checks membership.
fn cpulist_contains(cpulist: &str, cpu: i32) -> bool {
    for range in cpulist.trim().split(',') {
        if range.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = range.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<i32>(), hi.parse::<i32>()) {
                if cpu >= lo && cpu <= hi {
                    return true;
                }
            }
        } else if let Ok(single) = range.parse::<i32>() {
            if single == cpu {
                return true;
            }
        }
    }
    false
}

/// Canonical MIDR values for supported Kunpeng variants (spec.md §4.7
/// `chip_type`). Unknown MIDRs fail event resolution upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipType {
    Kunpeng920,
    Kunpeng916,
    Undefined,
}

const MIDR_KUNPENG_920: u64 = 0x0000_0000_481f_d010;
const MIDR_KUNPENG_916: u64 = 0x0000_0000_481f_d020;

pub fn chip_type() -> Result<ChipType> {
    let raw = fs::read_to_string("/sys/devices/system/cpu/cpu0/regs/identification/midr_el1")
        .map_err(PerfError::FailListenProc)?;
    let trimmed = raw.trim().trim_start_matches("0x");
    let midr = u64::from_str_radix(trimmed, 16).unwrap_or(0);
    Ok(match midr {
        MIDR_KUNPENG_920 => ChipType::Kunpeng920,
        MIDR_KUNPENG_916 => ChipType::Kunpeng916,
        _ => ChipType::Undefined,
    })
}

/// `proc_topology(pid)` output (spec.md §4.7).
#[derive(Debug, Clone)]
pub struct ProcTopology {
    pub pid: i32,
    pub comm: String,
}

impl ProcTopology {
    pub fn system_wide() -> Self {
        ProcTopology {
            pid: -1,
            comm: "system".to_string(),
        }
    }
}

pub fn proc_topology(pid: i32) -> Result<ProcTopology> {
    if pid < 0 {
        return Ok(ProcTopology::system_wide());
    }
    let comm = fs::read_to_string(format!("/proc/{pid}/comm")).map_err(|e| {
        log::debug!("reading /proc/{pid}/comm failed: {e}");
        PerfError::SymbolPidNotFound(pid)
    })?;
    Ok(ProcTopology {
        pid,
        comm: comm.trim().to_string(),
    })
}

/// Recursively walks `/proc/<pid>/task` for all live thread ids (spec.md
/// §4.7 `child_tids`), grounded on `perf_group.rs::get_threads`.
pub fn child_tids(pid: i32) -> Result<Vec<i32>> {
    let task_dir = format!("/proc/{pid}/task");
    let entries = fs::read_dir(&task_dir).map_err(|_| PerfError::SymbolPidNotFound(pid))?;
    let mut tids = Vec::new();
    for entry in entries.flatten() {
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpulist_parses_ranges_and_singletons() {
        let list = "0-3,8,10-11";
        assert!(cpulist_contains(list, 0));
        assert!(cpulist_contains(list, 3));
        assert!(cpulist_contains(list, 8));
        assert!(cpulist_contains(list, 10));
        assert!(!cpulist_contains(list, 4));
        assert!(!cpulist_contains(list, 9));
        assert!(!cpulist_contains(list, 12));
    }

    #[test]
    fn system_wide_cpu_topology_is_sentinel() {
        let topo = cpu_topology(-1).unwrap();
        assert_eq!(topo, CpuTopology::SYSTEM_WIDE);
    }

    #[test]
    fn system_wide_proc_topology_is_sentinel() {
        let topo = proc_topology(-1).unwrap();
        assert_eq!(topo.pid, -1);
        assert_eq!(topo.comm, "system");
    }

    #[test]
    fn child_tids_includes_current_thread() {
        let pid = std::process::id() as i32;
        let tids = child_tids(pid).expect("read /proc/self/task");
        assert!(!tids.is_empty());
    }
}
