//! `EventObject` hierarchy (spec.md §3, §4.2): one enum over
//! `{Counter, Sampler, SpeSampler}` implementing a shared capability set,
//! per spec.md §9's "Polymorphic EventObject" redesign guidance.
//!
//! Grounded on `anp-perf_events::counter` (`Counter::read`'s raw-value
//! kernel read), `count.rs`/`sample::config.rs` (attr building, folded
//! into `crate::attr`), and `sampler.rs` (enable via ioctl).

use std::fs::File;
use std::io::Read as _;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::attr::{build_counter_attr, build_sampler_attr, EventAttr, LowEventDesc};
use crate::error::{PerfError, Result};
use crate::raw;
use crate::ring_buffer::{Record, RingBuffer};
use crate::spe::{SpeReadOutcome, SpeSampler};
use crate::sys;

/// One decoded sample plus its raw ip chain, pending stack resolution
/// (spec.md §4.3: "Append one PmuRecord... and one parallel vector of raw
/// ips for deferred stack resolution").
#[derive(Debug, Clone)]
pub struct RawSample {
    pub cpu: i32,
    pub pid: i32,
    pub tid: i32,
    pub ips: Vec<u64>,
}

/// A ring-buffer side-effect that isn't itself a sample (spec.md §4.3:
/// MMAP/MMAP2 notify the resolver, FORK records topology inheritance).
#[derive(Debug, Clone)]
pub enum SideEffect {
    ModuleLoad { pid: i32, addr: u64, len: u64, path: String },
    Fork { pid: i32, ppid: i32, tid: i32, ptid: i32 },
}

pub struct CounterEvent {
    file: File,
    pub event_name: Arc<str>,
    pub cpu: i32,
    pub tid: i32,
}

impl CounterEvent {
    /// `init` (spec.md §4.2 "Counter"): builds the attr, opens the fd,
    /// maps open errno into the taxonomy.
    pub fn open(low: &LowEventDesc, event_name: Arc<str>, pid: i32, cpu: i32) -> Result<Self> {
        let attr = build_counter_attr(low);
        let file = sys::open_event(&attr, pid, cpu, -1)?;
        Ok(CounterEvent {
            file,
            event_name,
            cpu,
            tid: pid,
        })
    }

    /// One kernel read of the fixed-size `{value, time_enabled,
    /// time_running, id}` struct (spec.md §4.2 "Counter.read").
    pub fn read_count(&mut self) -> Result<u64> {
        let mut buf = [0u8; 32];
        self.file.read_exact(&mut buf).map_err(PerfError::Read)?;
        Ok(u64::from_ne_bytes(buf[0..8].try_into().unwrap()))
    }
}

pub struct SamplerEvent {
    file: File,
    ring: RingBuffer,
    pub event_name: Arc<str>,
}

impl SamplerEvent {
    /// `init` (spec.md §4.2 "Sampler"): builds the attr, opens the fd,
    /// mmaps `(pages+1)*PAGE_SIZE`.
    pub fn open(
        low: &LowEventDesc,
        event_name: Arc<str>,
        attr_in: &EventAttr,
        pid: i32,
        cpu: i32,
        ring_pages: usize,
    ) -> Result<Self> {
        let attr = build_sampler_attr(low, attr_in);
        let file = sys::open_event(&attr, pid, cpu, -1)?;
        let ring = RingBuffer::new(&file, ring_pages)?;
        Ok(SamplerEvent {
            file,
            ring,
            event_name,
        })
    }

    /// Drains the ring buffer, splitting SAMPLE records (pending stack
    /// resolution) from MMAP/MMAP2/FORK side effects (spec.md §4.3).
    pub fn read(&mut self) -> (Vec<RawSample>, Vec<SideEffect>) {
        let mut samples = Vec::new();
        let mut effects = Vec::new();
        for record in self.ring.read_records() {
            match record {
                Record::Sample(s) => samples.push(RawSample {
                    cpu: s.cpu as i32,
                    pid: s.pid,
                    tid: s.tid,
                    ips: s.ips,
                }),
                Record::Mmap { pid, addr, len, filename, .. } => {
                    effects.push(SideEffect::ModuleLoad { pid, addr, len, path: filename })
                }
                Record::Fork { pid, ppid, tid, ptid, .. } => {
                    effects.push(SideEffect::Fork { pid, ppid, tid, ptid })
                }
                Record::Skipped { .. } => {}
            }
        }
        (samples, effects)
    }
}

fn fd_of(file: &File) -> RawFd {
    file.as_raw_fd()
}

/// Tagged union over the three collection modes, per spec.md §9's
/// redesign guidance: the descriptor registry holds heterogeneous cells
/// by discriminated union rather than class inheritance.
pub enum EventObject {
    Counter(CounterEvent),
    Sampler(SamplerEvent),
    Spe(SpeSampler),
}

/// What draining one `EventObject` cell yields, dispatched by variant.
pub enum Drained {
    Count { value: u64 },
    Samples(Vec<RawSample>, Vec<SideEffect>),
    Spe(SpeReadOutcome),
}

impl EventObject {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            EventObject::Counter(c) => fd_of(&c.file),
            EventObject::Sampler(s) => fd_of(&s.file),
            EventObject::Spe(s) => s.spe_raw_fd(),
        }
    }

    pub fn enable(&self) -> Result<()> {
        match self {
            EventObject::Counter(c) => sys::enable(fd_of(&c.file)),
            EventObject::Sampler(s) => sys::enable(fd_of(&s.file)),
            EventObject::Spe(s) => s.enable(),
        }
    }

    pub fn disable(&self) -> Result<()> {
        match self {
            EventObject::Counter(c) => sys::disable(fd_of(&c.file)),
            EventObject::Sampler(s) => sys::disable(fd_of(&s.file)),
            EventObject::Spe(s) => s.disable(),
        }
    }

    pub fn reset(&self) -> Result<()> {
        match self {
            EventObject::Counter(c) => sys::reset(fd_of(&c.file)),
            EventObject::Sampler(s) => sys::reset(fd_of(&s.file)),
            EventObject::Spe(_) => Ok(()),
        }
    }

    pub fn drain(&mut self) -> Result<Drained> {
        match self {
            EventObject::Counter(c) => Ok(Drained::Count { value: c.read_count()? }),
            EventObject::Sampler(s) => {
                let (samples, effects) = s.read();
                Ok(Drained::Samples(samples, effects))
            }
            EventObject::Spe(s) => Ok(Drained::Spe(s.read()?)),
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            EventObject::Counter(c) => Some(&c.event_name),
            EventObject::Sampler(s) => Some(&s.event_name),
            EventObject::Spe(_) => None,
        }
    }
}

impl SpeSampler {
    fn spe_raw_fd(&self) -> RawFd {
        // used only for epoll/poll readiness registration; the dummy fd
        // tracks process exit just as well and is cheaper to poll.
        self.dummy_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_effects_separated_from_samples() {
        // exercised indirectly via ring_buffer's own tests; this just
        // checks the enum shapes compile and match on construction.
        let effect = SideEffect::ModuleLoad {
            pid: 1,
            addr: 0x1000,
            len: 0x2000,
            path: "/lib/libc.so".into(),
        };
        match effect {
            SideEffect::ModuleLoad { pid, .. } => assert_eq!(pid, 1),
            SideEffect::Fork { .. } => panic!("wrong variant"),
        }
    }
}
