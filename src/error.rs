//! Error taxonomy and the thread-local "last error" channel (§4.8, §7).
//!
//! The teacher (`anp-perf_events::error`) built this on the now-unmaintained
//! `failure` crate; `thiserror` covers the same ground and is what the rest
//! of the retrieved pack (`linux-perf-event-reader`, `samply-symbols`) uses.

use std::cell::RefCell;
use std::fmt;

use nix::errno::Errno;

pub type Result<T> = ::std::result::Result<T, PerfError>;

/// Stable numeric code, part of the public ABI surface returned by
/// `errno_like()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    // argument errors
    InvalidCpuList = 1,
    InvalidPidList = 2,
    InvalidEventList = 3,
    InvalidTaskType = 4,
    InvalidTime = 5,
    // resource errors
    NoAvailableDescriptor = 10,
    NoPermission = 11,
    DeviceBusy = 12,
    DeviceInvalid = 13,
    TooManyFd = 14,
    RaiseFdFailed = 15,
    NoProc = 16,
    // device errors
    SpeUnavailable = 20,
    ChipTypeInvalid = 21,
    FailMmap = 22,
    FailListenProc = 23,
    KernelNotSupported = 24,
    // symbol errors
    SymbolOpenFailed = 30,
    SymbolNotRegularFile = 31,
    SymbolElfFormat = 32,
    SymbolDwarfFormat = 33,
    SymbolKallsymsInvalid = 34,
    SymbolMapAddrFailed = 35,
    SymbolPidNotFound = 36,
    SymbolSnprintfFailed = 37,
    // generic
    OutOfMemory = 90,
    Unknown = 99,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PerfError {
    #[error("invalid cpu list: {0}")]
    InvalidCpuList(String),
    #[error("invalid pid list: {0}")]
    InvalidPidList(String),
    #[error("invalid event list: {0}")]
    InvalidEventList(String),
    #[error("invalid task type: {0}")]
    InvalidTaskType(String),
    #[error("invalid collection time: {0}")]
    InvalidTime(String),

    #[error("no available descriptor")]
    NoAvailableDescriptor,
    #[error("permission denied opening perf event: {0}")]
    NoPermission(#[source] Errno),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("device does not support requested attr: {0}")]
    DeviceInvalid(#[source] Errno),
    #[error("too many open files")]
    TooManyFd,
    #[error("failed to raise RLIMIT_NOFILE: {0}")]
    RaiseFdFailed(#[source] Errno),
    #[error("no such process: {0}")]
    NoProc(i32),

    #[error("SPE unavailable on this system")]
    SpeUnavailable,
    #[error("unrecognized chip type (midr {0:#x})")]
    ChipTypeInvalid(u64),
    #[error("mmap failed: {0}")]
    FailMmap(#[source] std::io::Error),
    #[error("failed reading /proc: {0}")]
    FailListenProc(std::io::Error),
    #[error("kernel does not support this feature")]
    KernelNotSupported,

    #[error("failed to open symbol source {0}: {1}")]
    SymbolOpenFailed(String, std::io::Error),
    #[error("not a regular file: {0}")]
    SymbolNotRegularFile(String),
    #[error("elf parse error in {0}: {1}")]
    SymbolElfFormat(String, String),
    #[error("dwarf parse error in {0}: {1}")]
    SymbolDwarfFormat(String, String),
    #[error("invalid /proc/kallsyms entry")]
    SymbolKallsymsInvalid,
    #[error("map_addr failed for pid {0} addr {1:#x}")]
    SymbolMapAddrFailed(i32, u64),
    #[error("pid not found: {0}")]
    SymbolPidNotFound(i32),
    #[error("formatting symbol path failed")]
    SymbolSnprintfFailed,

    #[error("out of memory")]
    OutOfMemory,
    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("ioctl failed: {0}")]
    Ioctl(#[source] Errno),
}

impl PerfError {
    pub fn code(&self) -> ErrorCode {
        use PerfError::*;
        match self {
            InvalidCpuList(_) => ErrorCode::InvalidCpuList,
            InvalidPidList(_) => ErrorCode::InvalidPidList,
            InvalidEventList(_) => ErrorCode::InvalidEventList,
            InvalidTaskType(_) => ErrorCode::InvalidTaskType,
            InvalidTime(_) => ErrorCode::InvalidTime,
            NoAvailableDescriptor => ErrorCode::NoAvailableDescriptor,
            NoPermission(_) => ErrorCode::NoPermission,
            DeviceBusy(_) => ErrorCode::DeviceBusy,
            DeviceInvalid(_) => ErrorCode::DeviceInvalid,
            TooManyFd => ErrorCode::TooManyFd,
            RaiseFdFailed(_) => ErrorCode::RaiseFdFailed,
            NoProc(_) => ErrorCode::NoProc,
            SpeUnavailable => ErrorCode::SpeUnavailable,
            ChipTypeInvalid(_) => ErrorCode::ChipTypeInvalid,
            FailMmap(_) => ErrorCode::FailMmap,
            FailListenProc(_) => ErrorCode::FailListenProc,
            KernelNotSupported => ErrorCode::KernelNotSupported,
            SymbolOpenFailed(..) => ErrorCode::SymbolOpenFailed,
            SymbolNotRegularFile(_) => ErrorCode::SymbolNotRegularFile,
            SymbolElfFormat(..) => ErrorCode::SymbolElfFormat,
            SymbolDwarfFormat(..) => ErrorCode::SymbolDwarfFormat,
            SymbolKallsymsInvalid => ErrorCode::SymbolKallsymsInvalid,
            SymbolMapAddrFailed(..) => ErrorCode::SymbolMapAddrFailed,
            SymbolPidNotFound(_) => ErrorCode::SymbolPidNotFound,
            SymbolSnprintfFailed => ErrorCode::SymbolSnprintfFailed,
            OutOfMemory => ErrorCode::OutOfMemory,
            Unknown(_) => ErrorCode::Unknown,
            Read(_) => ErrorCode::Unknown,
            Ioctl(_) => ErrorCode::DeviceInvalid,
        }
    }

    /// Maps a `perf_event_open`/ioctl errno into the taxonomy, per spec's
    /// §4.2 Counter.init mapping (EPERM/EACCES → no_permission, EBUSY →
    /// device_busy, EINVAL → device_inval, ESRCH → no_proc, EMFILE →
    /// too_many_fd).
    pub fn from_open_errno(errno: Errno, pid: i32) -> Self {
        match errno {
            Errno::EPERM | Errno::EACCES => PerfError::NoPermission(errno),
            Errno::EBUSY => PerfError::DeviceBusy(format!("errno {errno}")),
            Errno::EINVAL => PerfError::DeviceInvalid(errno),
            Errno::ESRCH => PerfError::NoProc(pid),
            Errno::EMFILE | Errno::ENFILE => PerfError::TooManyFd,
            other => PerfError::Unknown(format!("perf_event_open: {other}")),
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<(ErrorCode, String)> = RefCell::new((ErrorCode::Success, String::new()));
}

/// Records `err` as this thread's last error. Called by every public
/// operation's wrapper before it returns a sentinel to the caller.
pub fn set_last_error(err: &PerfError) {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = (err.code(), err.to_string());
    });
}

pub fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = (ErrorCode::Success, String::new());
    });
}

/// `errno_like()` from spec.md §6.
pub fn errno_like() -> i32 {
    LAST_ERROR.with(|cell| cell.borrow().0 as i32)
}

/// `error_string()` from spec.md §6.
pub fn error_string() -> String {
    LAST_ERROR.with(|cell| cell.borrow().1.clone())
}

/// Runs `f`, stashing any error in the thread-local channel and clearing it
/// on success, mirroring spec.md §4.8's "every public operation sets it
/// before returning".
pub fn with_error_channel<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match f() {
        Ok(v) => {
            clear_last_error();
            Ok(v)
        }
        Err(e) => {
            set_last_error(&e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips() {
        clear_last_error();
        assert_eq!(errno_like(), ErrorCode::Success as i32);
        let _: Result<()> = with_error_channel(|| Err(PerfError::TooManyFd));
        assert_eq!(errno_like(), ErrorCode::TooManyFd as i32);
        assert_eq!(error_string(), "too many open files");
    }

    #[test]
    fn success_clears_previous_error() {
        clear_last_error();
        let _: Result<()> = with_error_channel(|| Err(PerfError::NoAvailableDescriptor));
        assert_eq!(errno_like(), ErrorCode::NoAvailableDescriptor as i32);
        let _: Result<()> = with_error_channel(|| Ok(()));
        assert_eq!(errno_like(), ErrorCode::Success as i32);
    }

    #[test]
    fn open_errno_mapping() {
        assert_eq!(
            PerfError::from_open_errno(Errno::EPERM, 0).code(),
            ErrorCode::NoPermission
        );
        assert_eq!(
            PerfError::from_open_errno(Errno::EBUSY, 0).code(),
            ErrorCode::DeviceBusy
        );
        assert_eq!(
            PerfError::from_open_errno(Errno::ESRCH, 42).code(),
            ErrorCode::NoProc
        );
    }
}
