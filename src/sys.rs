//! Thin syscall layer: `perf_event_open`, ioctls, rlimit raising, epoll.
//!
//! Grounded on `anp-perf_events::fd`/`sys` (the `perf_event_open` wrapper
//! and ioctl definitions) and `mstange-samply`'s
//! `samply/src/linux/perf_event.rs` (`sys_perf_event_open`, the
//! `PERF_EVENT_IOC_ENABLE` call site, and its `poll`-based readiness loop).

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::error::{PerfError, Result};
use crate::raw::{self, perf_event_attr};

/// Safe(r) wrapper around the raw `perf_event_open(2)` syscall. There is no
/// libc wrapper for this syscall, same as in the teacher.
///
/// # Safety
/// `attr` must be a validly initialized `perf_event_attr` with `size` set.
pub unsafe fn perf_event_open(
    attr: &perf_event_attr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
    flags: u64,
) -> std::result::Result<File, Errno> {
    let ret = libc::syscall(
        libc::SYS_perf_event_open,
        attr as *const perf_event_attr,
        pid,
        cpu,
        group_fd,
        flags,
    );
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(File::from_raw_fd(ret as RawFd))
    }
}

/// Opens one perf event fd, mapping open-time errno into the taxonomy from
/// spec.md §4.2.
pub fn open_event(attr: &perf_event_attr, pid: i32, cpu: i32, group_fd: i32) -> Result<File> {
    debug!(
        "perf_event_open(type={}, config={:#x}, pid={}, cpu={}, group_fd={})",
        attr.type_, attr.config, pid, cpu, group_fd
    );
    unsafe { perf_event_open(attr, pid, cpu, group_fd, raw::PERF_FLAG_FD_CLOEXEC) }
        .map_err(|errno| PerfError::from_open_errno(errno, pid))
}

fn ioctl_no_arg(fd: RawFd, request: u64) -> Result<()> {
    let ret = unsafe { libc::ioctl(fd, request as libc::c_ulong, 0) };
    if ret < 0 {
        Err(PerfError::Ioctl(Errno::last()))
    } else {
        Ok(())
    }
}

pub fn enable(fd: RawFd) -> Result<()> {
    ioctl_no_arg(fd, raw::PERF_EVENT_IOC_ENABLE)
}

pub fn disable(fd: RawFd) -> Result<()> {
    ioctl_no_arg(fd, raw::PERF_EVENT_IOC_DISABLE)
}

pub fn reset(fd: RawFd) -> Result<()> {
    ioctl_no_arg(fd, raw::PERF_EVENT_IOC_RESET)
}

/// Raises the soft `RLIMIT_NOFILE` up to the hard limit, as spec.md §4.1
/// requires before opening a large (event × cpu × thread) fd matrix.
/// Returns the new soft limit.
pub fn raise_nofile_limit() -> Result<u64> {
    let (soft, hard) =
        nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
            .map_err(PerfError::RaiseFdFailed)?;
    if soft >= hard {
        return Ok(soft);
    }
    nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE, hard, hard)
        .map_err(PerfError::RaiseFdFailed)?;
    debug!("raised RLIMIT_NOFILE {soft} -> {hard}");
    Ok(hard)
}

/// Fails with `TooManyFd` if `required` descriptors won't fit under the
/// (possibly just-raised) limit.
pub fn ensure_fd_budget(required: u64) -> Result<()> {
    let limit = raise_nofile_limit()?;
    if required > limit {
        warn!("required fd count {required} exceeds RLIMIT_NOFILE {limit}");
        return Err(PerfError::TooManyFd);
    }
    Ok(())
}

/// One epoll instance per descriptor (spec.md §5 "Shared resources"),
/// registering every event fd with `EPOLLIN | EPOLLRDHUP`.
pub struct Readiness {
    epoll: Epoll,
}

impl Readiness {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|e| PerfError::FailMmap(std::io::Error::from(e)))?;
        Ok(Readiness { epoll })
    }

    pub fn register(&self, fd: &impl AsRawFd, token: u64) -> Result<()> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, token);
        self.epoll
            .add(fd, event)
            .map_err(|e| PerfError::FailMmap(std::io::Error::from(e)))
    }

    pub fn deregister(&self, fd: &impl AsRawFd) -> Result<()> {
        self.epoll
            .delete(fd)
            .map_err(|e| PerfError::FailMmap(std::io::Error::from(e)))
    }

    /// Polls with the given timeout (ms); returns the tokens that became
    /// ready. An empty result with `timeout_ms >= 0` simply means nothing
    /// was ready within the slice.
    pub fn poll(&self, timeout_ms: i32) -> Result<Vec<(u64, EpollFlags)>> {
        let mut events = [EpollEvent::empty(); 64];
        let timeout = nix::sys::epoll::EpollTimeout::try_from(timeout_ms)
            .unwrap_or(nix::sys::epoll::EpollTimeout::NONE);
        let n = self
            .epoll
            .wait(&mut events, timeout)
            .map_err(|e| PerfError::FailMmap(std::io::Error::from(e)))?;
        Ok(events[..n].iter().map(|e| (e.data(), e.events())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_register_and_poll_empty() {
        let readiness = Readiness::new().expect("epoll create");
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        let file = unsafe { File::from_raw_fd(r.as_raw_fd()) };
        std::mem::forget(r);
        readiness.register(&file, 7).expect("register");
        let ready = readiness.poll(0).expect("poll");
        assert!(ready.is_empty());
        readiness.deregister(&file).expect("deregister");
    }
}
