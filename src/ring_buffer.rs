//! Lock-free consumer of the kernel's mmap ring buffer (spec.md §4.3).
//!
//! Grounded on `mstange-samply`'s `samply/src/linux/perf_event.rs`
//! (`read_head`/`write_tail`'s acquire/release fences, `SliceLocation`
//! wraparound handling) and `anp-perf_events::sample::ring_buffer`
//! (`RingBuffer` mmap lifecycle) — the teacher's own `read_chunk()` was an
//! `unimplemented!()` stub this module replaces with real parsing.

use std::ffi::c_void;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use log::trace;

use crate::error::{PerfError, Result};
use crate::raw::{self, perf_event_header, perf_event_mmap_page};

/// One decoded ring-buffer record (spec.md §4.3 dispatch table).
#[derive(Debug, Clone)]
pub enum Record {
    Sample(SampleRecord),
    Mmap { pid: i32, tid: i32, addr: u64, len: u64, filename: String },
    Fork { pid: i32, ppid: i32, tid: i32, ptid: i32, time: u64 },
    /// COMM/EXIT (ignored per spec.md: "comm comes from /proc") and any
    /// other unrecognized type, skipped by `size`.
    Skipped { type_: u32 },
}

#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub identifier: u64,
    pub ip: u64,
    pub pid: i32,
    pub tid: i32,
    pub time: u64,
    pub id: u64,
    pub cpu: u32,
    pub period: u64,
    pub ips: Vec<u64>,
}

/// mmap'd control page + data ring for one (cpu, thread) Sampler cell.
pub struct RingBuffer {
    base: *mut u8,
    map_len: usize,
    data: *mut u8,
    mask: u64,
    prev_tail: u64,
    scratch: Vec<u8>,
}

// The mapping is exclusively owned by one EventObject cell; `Registry`
// only ever touches it from the thread driving that descriptor's collect
// loop, one at a time, same as the teacher's `PerfFile` wrapping a `File`.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Maps `(pages + 1) * PAGE_SIZE` bytes on `fd`: one control page
    /// followed by the data ring (spec.md §4.3 "Layout"). `pages` must be
    /// a power of two.
    pub fn new(fd: &impl AsRawFd, pages: usize) -> Result<Self> {
        assert!(pages.is_power_of_two(), "ring buffer page count must be a power of two");
        let page_size = raw::page_size();
        let map_len = (pages + 1) * page_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(PerfError::FailMmap(std::io::Error::last_os_error()));
        }
        let base = base as *mut u8;
        let data = unsafe { base.add(page_size) };
        Ok(RingBuffer {
            base,
            map_len,
            data,
            mask: (pages * page_size) as u64 - 1,
            prev_tail: 0,
            scratch: vec![0u8; 8 * 1024],
        })
    }

    fn metadata(&self) -> *mut perf_event_mmap_page {
        self.base as *mut perf_event_mmap_page
    }

    pub fn metadata_ptr(&self) -> *const perf_event_mmap_page {
        self.metadata() as *const _
    }

    /// Acquire-load of `data_head` (spec.md §4.3 "ldar-equivalent").
    fn head(&self) -> u64 {
        unsafe {
            let head = ptr::read_volatile(&(*self.metadata()).data_head);
            fence(Ordering::Acquire);
            head
        }
    }

    /// Release-store of `data_tail` (spec.md §4.3 "stlr-equivalent").
    fn set_tail(&self, tail: u64) {
        unsafe {
            fence(Ordering::Release);
            ptr::write_volatile(&mut (*self.metadata()).data_tail, tail);
        }
    }

    fn copy_from_ring(&self, start: u64, len: usize, out: &mut [u8]) {
        let ring_len = (self.mask + 1) as usize;
        let pos = (start & self.mask) as usize;
        unsafe {
            if pos + len <= ring_len {
                ptr::copy_nonoverlapping(self.data.add(pos), out.as_mut_ptr(), len);
            } else {
                let first = ring_len - pos;
                ptr::copy_nonoverlapping(self.data.add(pos), out.as_mut_ptr(), first);
                ptr::copy_nonoverlapping(self.data, out.as_mut_ptr().add(first), len - first);
            }
        }
    }

    /// Drains everything published since the last read, dispatching each
    /// record per spec.md §4.3. Partial/truncated trailing records stop
    /// the loop without advancing past them; the next read cycle retries.
    pub fn read_records(&mut self) -> Vec<Record> {
        self.read_raw()
            .into_iter()
            .map(|(header, body)| self.decode(header.type_, &body))
            .collect()
    }

    /// Drains raw `(header, body)` pairs without any type-specific
    /// dispatch, for consumers (the SPE dummy ring) that decode a
    /// different record-type set than a Sampler's data ring.
    pub fn read_raw(&mut self) -> Vec<(perf_event_header, Vec<u8>)> {
        let head = self.head();
        let mut tail = self.prev_tail;
        let mut out = Vec::new();
        const HEADER_SIZE: u64 = 8;

        loop {
            let diff = head.wrapping_sub(tail);
            if diff < HEADER_SIZE {
                break;
            }
            let mut header_bytes = [0u8; 8];
            self.copy_from_ring(tail, 8, &mut header_bytes);
            let header = perf_event_header {
                type_: u32::from_ne_bytes(header_bytes[0..4].try_into().unwrap()),
                misc: u16::from_ne_bytes(header_bytes[4..6].try_into().unwrap()),
                size: u16::from_ne_bytes(header_bytes[6..8].try_into().unwrap()),
            };
            let size = header.size as u64;
            if size < HEADER_SIZE || size > diff {
                // end-of-window: either a malformed record or one the
                // kernel hasn't finished publishing yet.
                break;
            }

            let record_len = size as usize;
            if record_len > self.scratch.len() {
                self.scratch.resize(record_len, 0);
            }
            self.copy_from_ring(tail, record_len, &mut self.scratch[..record_len]);
            let body = self.scratch[8..record_len].to_vec();
            out.push((header, body));

            tail = tail.wrapping_add(size);
            self.set_tail(tail);
        }

        self.prev_tail = head;
        self.set_tail(head);
        out
    }

    fn decode(&self, type_: u32, body: &[u8]) -> Record {
        match type_ {
            t if t == raw::PERF_RECORD_SAMPLE => Record::Sample(decode_sample(body)),
            t if t == raw::PERF_RECORD_MMAP => decode_mmap(body),
            t if t == raw::PERF_RECORD_MMAP2 => decode_mmap2(body),
            t if t == raw::PERF_RECORD_FORK => decode_fork(body),
            other => {
                trace!("skipping ring buffer record type {other}");
                Record::Skipped { type_: other }
            }
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.map_len);
        }
    }
}

fn read_u64(buf: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_ne_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}

fn read_u32(buf: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_ne_bytes(buf[*off..*off + 4].try_into().unwrap());
    *off += 4;
    v
}

/// Decodes `{sample_id, ip, pid, tid, time, id, cpu, period, nr, ips[nr]}`
/// per spec.md §4.3, matching the sample_type bits set in
/// `attr::build_sampler_attr`.
fn decode_sample(buf: &[u8]) -> SampleRecord {
    let mut off = 0;
    let identifier = read_u64(buf, &mut off);
    let ip = read_u64(buf, &mut off);
    let pid = read_u32(buf, &mut off) as i32;
    let tid = read_u32(buf, &mut off) as i32;
    let time = read_u64(buf, &mut off);
    let id = read_u64(buf, &mut off);
    let cpu = read_u32(buf, &mut off);
    let _res = read_u32(buf, &mut off);
    let period = read_u64(buf, &mut off);
    let nr = read_u64(buf, &mut off) as usize;
    let mut ips = Vec::with_capacity(nr);
    for _ in 0..nr {
        if off + 8 > buf.len() {
            break;
        }
        ips.push(read_u64(buf, &mut off));
    }
    SampleRecord {
        identifier,
        ip,
        pid,
        tid,
        time,
        id,
        cpu,
        period,
        ips,
    }
}

/// Decodes a `PERF_RECORD_MMAP` body: `pid, tid, addr, len, pgoff,
/// filename` (spec.md §4.3 "notify resolver thread <tid> loaded module
/// <filename> at <addr>").
pub(crate) fn decode_mmap(buf: &[u8]) -> Record {
    let mut off = 0;
    if buf.len() < 24 {
        return Record::Skipped { type_: raw::PERF_RECORD_MMAP };
    }
    let pid = read_u32(buf, &mut off) as i32;
    let tid = read_u32(buf, &mut off) as i32;
    let addr = read_u64(buf, &mut off);
    let len = read_u64(buf, &mut off);
    let _pgoff = read_u64(buf, &mut off);
    let filename = read_cstr(&buf[off..]);
    Record::Mmap { pid, tid, addr, len, filename }
}

/// `PERF_RECORD_MMAP2` carries extra identity fields (maj/min/ino/...)
/// before the filename; we only need `addr`/`len`/`filename` for the
/// resolver hook.
pub(crate) fn decode_mmap2(buf: &[u8]) -> Record {
    let mut off = 0;
    if buf.len() < 72 {
        return Record::Skipped { type_: raw::PERF_RECORD_MMAP2 };
    }
    let pid = read_u32(buf, &mut off) as i32;
    let tid = read_u32(buf, &mut off) as i32;
    let addr = read_u64(buf, &mut off);
    let len = read_u64(buf, &mut off);
    let _pgoff = read_u64(buf, &mut off);
    // maj(4) min(4) ino(8) ino_generation(8) prot(4) flags(4)
    off += 4 + 4 + 8 + 8 + 4 + 4;
    let filename = read_cstr(&buf[off..]);
    Record::Mmap { pid, tid, addr, len, filename }
}

/// Decodes `PERF_RECORD_FORK`: `pid, ppid, tid, ptid, time` (spec.md §4.3
/// "record (ppid, tid) -> topology entry").
pub(crate) fn decode_fork(buf: &[u8]) -> Record {
    let mut off = 0;
    if buf.len() < 24 {
        return Record::Skipped { type_: raw::PERF_RECORD_FORK };
    }
    let pid = read_u32(buf, &mut off) as i32;
    let ppid = read_u32(buf, &mut off) as i32;
    let tid = read_u32(buf, &mut off) as i32;
    let ptid = read_u32(buf, &mut off) as i32;
    let time = read_u64(buf, &mut off);
    Record::Fork { pid, ppid, tid, ptid, time }
}

fn read_cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_sample(identifier: u64, ip: u64, pid: i32, tid: i32, time: u64, ips: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&identifier.to_ne_bytes());
        buf.extend_from_slice(&ip.to_ne_bytes());
        buf.extend_from_slice(&(pid as u32).to_ne_bytes());
        buf.extend_from_slice(&(tid as u32).to_ne_bytes());
        buf.extend_from_slice(&time.to_ne_bytes());
        buf.extend_from_slice(&7u64.to_ne_bytes()); // id
        buf.extend_from_slice(&0u32.to_ne_bytes()); // cpu
        buf.extend_from_slice(&0u32.to_ne_bytes()); // res
        buf.extend_from_slice(&1000u64.to_ne_bytes()); // period
        buf.extend_from_slice(&(ips.len() as u64).to_ne_bytes());
        for ip in ips {
            buf.extend_from_slice(&ip.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn decode_sample_roundtrips_fields() {
        let body = encode_sample(42, 0xdead_beef, 100, 101, 99999, &[1, 2, 3]);
        let sample = decode_sample(&body);
        assert_eq!(sample.identifier, 42);
        assert_eq!(sample.ip, 0xdead_beef);
        assert_eq!(sample.pid, 100);
        assert_eq!(sample.tid, 101);
        assert_eq!(sample.time, 99999);
        assert_eq!(sample.id, 7);
        assert_eq!(sample.period, 1000);
        assert_eq!(sample.ips, vec![1, 2, 3]);
    }

    #[test]
    fn wraparound_copy_matches_contiguous_source() {
        // Ring of 4096 bytes; write a 48-byte record spanning offset
        // 4080..4128 (wraps at 4096), matching spec.md §8 scenario 5.
        const RING_LEN: usize = 4096;
        let mut ring = vec![0u8; RING_LEN];
        let pattern: Vec<u8> = (0u8..48).collect();
        // bytes landing before the wrap
        let before = RING_LEN - 4080;
        ring[4080..4096].copy_from_slice(&pattern[..before]);
        ring[0..48 - before].copy_from_slice(&pattern[before..]);

        // recreate RingBuffer::copy_from_ring's logic directly against
        // our test ring, since constructing a real RingBuffer needs an
        // actual mmap'd fd.
        let mask = RING_LEN as u64 - 1;
        let pos = (4080u64 & mask) as usize;
        let mut out = vec![0u8; 48];
        if pos + 48 <= RING_LEN {
            out.copy_from_slice(&ring[pos..pos + 48]);
        } else {
            let first = RING_LEN - pos;
            out[..first].copy_from_slice(&ring[pos..]);
            out[first..].copy_from_slice(&ring[..48 - first]);
        }
        assert_eq!(out, pattern);
    }

    #[test]
    fn mmap_filename_reads_nul_terminated_string() {
        assert_eq!(read_cstr(b"libc.so.6\0garbage"), "libc.so.6");
    }
}
