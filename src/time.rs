//! Monotonic clock helper and ring-buffer TSC→wall-time conversion
//! (spec.md §3 PmuRecord timestamp, §4.4 Phase C).

use std::sync::atomic::{fence, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::raw::perf_event_mmap_page;

/// Monotonic nanosecond timestamp used to fill in PmuRecord timestamps
/// that the kernel doesn't stamp itself (spec.md §3 "timestamp (ns,
/// monotonic clock used for filling)").
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall-clock nanoseconds since the epoch, used only for diagnostics (the
/// kernel's own TSC conversion parameters are what stamps client-visible
/// SPE timestamps).
pub fn now_wall_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Snapshot of the mmap control page's TSC-conversion parameters, read
/// under its sequence lock (spec.md §4.4 Phase C: "locked read via a
/// sequence counter; wait up to 10 000 spins for `lock` to stabilize").
#[derive(Debug, Clone, Copy)]
pub struct TimeConv {
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_zero: u64,
}

const MAX_SEQLOCK_SPINS: u32 = 10_000;

/// Reads the TSC conversion parameters from the control page, retrying
/// while the kernel holds the write seqlock (`lock` has its low bit set,
/// or changes between the start and end read).
///
/// # Safety
/// `page` must point at a live, currently-mapped `perf_event_mmap_page`.
pub unsafe fn read_time_conv(page: *const perf_event_mmap_page) -> Option<TimeConv> {
    for _ in 0..MAX_SEQLOCK_SPINS {
        let lock_before = std::ptr::read_volatile(&(*page).lock);
        if lock_before & 1 != 0 {
            continue;
        }
        fence(Ordering::Acquire);
        let time_shift = std::ptr::read_volatile(&(*page).time_shift);
        let time_mult = std::ptr::read_volatile(&(*page).time_mult);
        let time_zero = std::ptr::read_volatile(&(*page).time_zero);
        fence(Ordering::Acquire);
        let lock_after = std::ptr::read_volatile(&(*page).lock);
        if lock_before == lock_after {
            return Some(TimeConv {
                time_shift,
                time_mult,
                time_zero,
            });
        }
    }
    None
}

impl TimeConv {
    /// Converts a raw cycle-domain timestamp (as found in an SPE
    /// TIMESTAMP packet) to wall-clock nanoseconds, per the kernel's
    /// `perf_event_mmap_page` documented conversion:
    /// `ns = ((cycles * time_mult) >> time_shift) + time_zero`.
    pub fn to_wall_ns(&self, cycles: u64) -> u64 {
        let scaled = (cycles as u128 * self.time_mult as u128) >> self.time_shift;
        self.time_zero.wrapping_add(scaled as u64)
    }
}

/// Guards against the kernel-bug timestamps spec.md §4.4 calls out:
/// "Discard record whose time exceeds 1e18 (kernel bug guard)."
pub const MAX_PLAUSIBLE_TIME_NS: u64 = 1_000_000_000_000_000_000;

pub fn is_plausible_time(ns: u64) -> bool {
    ns <= MAX_PLAUSIBLE_TIME_NS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_conv_identity_when_mult_is_one_shift_zero() {
        let conv = TimeConv {
            time_shift: 0,
            time_mult: 1,
            time_zero: 1_000,
        };
        assert_eq!(conv.to_wall_ns(500), 1_500);
    }

    #[test]
    fn time_conv_applies_shift() {
        let conv = TimeConv {
            time_shift: 1,
            time_mult: 2,
            time_zero: 0,
        };
        // (100 * 2) >> 1 == 100
        assert_eq!(conv.to_wall_ns(100), 100);
    }

    #[test]
    fn implausible_time_rejected() {
        assert!(!is_plausible_time(MAX_PLAUSIBLE_TIME_NS + 1));
        assert!(is_plausible_time(1));
    }

    #[test]
    fn now_ns_is_monotonic_ish() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
