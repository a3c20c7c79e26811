//! Hand-written mirrors of the kernel's `perf_event.h` ABI.
//!
//! The teacher crate generated these with `bindgen` against system headers;
//! we write them out directly instead (as `samply` does in
//! `src/perf_event_raw.rs`) so the crate doesn't need kernel headers present
//! at build time.
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(dead_code)]

use std::mem;

/// `perf_event_attr`, ABI-stable prefix through the fields this crate sets.
///
/// Fields after `sig_data` exist in newer kernels; we zero the whole
/// struct and only set what we use, so trailing fields being absent on an
/// older kernel is harmless (the kernel only reads `size` bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// `sample_period` or `sample_freq`, selected by `ATTR_FLAG_BIT_FREQ`.
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    /// `wakeup_events` or `wakeup_watermark`, selected by `ATTR_FLAG_BIT_WATERMARK`.
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    /// `bp_addr` / `config1`.
    pub config1: u64,
    /// `bp_len` / `config2`.
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
    pub sig_data: u64,
}

impl Default for perf_event_attr {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

impl perf_event_attr {
    pub fn new() -> Self {
        let mut attr = Self::default();
        attr.size = mem::size_of::<Self>() as u32;
        attr
    }
}

/// `perf_event_mmap_page`, the control page at the start of every ring
/// buffer (data ring and, when applicable, aux ring).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u64; 116],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

pub const PERF_EVENT_MMAP_PAGE_SIZE: usize = mem::size_of::<perf_event_mmap_page>();

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct perf_event_header {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

// perf_type_id
pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;
pub const PERF_TYPE_BREAKPOINT: u32 = 5;

// perf_event_attr.flags bits
pub const ATTR_FLAG_BIT_DISABLED: u64 = 1 << 0;
pub const ATTR_FLAG_BIT_INHERIT: u64 = 1 << 1;
pub const ATTR_FLAG_BIT_PINNED: u64 = 1 << 2;
pub const ATTR_FLAG_BIT_EXCLUSIVE: u64 = 1 << 3;
pub const ATTR_FLAG_BIT_EXCLUDE_USER: u64 = 1 << 4;
pub const ATTR_FLAG_BIT_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_FLAG_BIT_EXCLUDE_HV: u64 = 1 << 6;
pub const ATTR_FLAG_BIT_EXCLUDE_IDLE: u64 = 1 << 7;
pub const ATTR_FLAG_BIT_MMAP: u64 = 1 << 8;
pub const ATTR_FLAG_BIT_COMM: u64 = 1 << 9;
pub const ATTR_FLAG_BIT_FREQ: u64 = 1 << 10;
pub const ATTR_FLAG_BIT_INHERIT_STAT: u64 = 1 << 11;
pub const ATTR_FLAG_BIT_ENABLE_ON_EXEC: u64 = 1 << 12;
pub const ATTR_FLAG_BIT_TASK: u64 = 1 << 13;
pub const ATTR_FLAG_BIT_WATERMARK: u64 = 1 << 14;
pub const ATTR_FLAG_BIT_MMAP_DATA: u64 = 1 << 17;
pub const ATTR_FLAG_BIT_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const ATTR_FLAG_BIT_EXCLUDE_HOST: u64 = 1 << 19;
pub const ATTR_FLAG_BIT_EXCLUDE_GUEST: u64 = 1 << 20;
pub const ATTR_FLAG_BIT_MMAP2: u64 = 1 << 23;
pub const ATTR_FLAG_BIT_CONTEXT_SWITCH: u64 = 1 << 26;

// perf_event_sample_format
pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

// perf_event_read_format
pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_ID: u64 = 1 << 2;

// PERF_RECORD_* types
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_READ: u32 = 8;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_AUX: u32 = 11;
pub const PERF_RECORD_ITRACE_START: u32 = 12;
pub const PERF_RECORD_LOST_SAMPLES: u32 = 13;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;

pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;

// ioctl request numbers (arch-independent encoding used by the kernel's
// perf_event char device; these match the values the `perf` tool and
// `samply` both hardcode for the arm64/x86_64 ioctl encoding).
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;

pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

/// `perf_event_open`'s `pid` argument meaning "all processes" / "this task".
pub const PID_ALL_PROCESSES: i32 = -1;
/// `perf_event_open`'s `cpu` argument meaning "any cpu".
pub const CPU_ANY: i32 = -1;

pub fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        4096
    } else {
        ps as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_size_matches_struct() {
        let attr = perf_event_attr::new();
        assert_eq!(attr.size as usize, mem::size_of::<perf_event_attr>());
    }

    #[test]
    fn mmap_page_is_kernel_sized() {
        // the kernel has kept this struct at a stable 1088 bytes since
        // data_offset/data_size were added; a drift here means a field
        // was added/removed above.
        assert_eq!(PERF_EVENT_MMAP_PAGE_SIZE, 1088);
    }
}
