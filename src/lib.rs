//! `kunpeng-perf`: ARMv8/Kunpeng perf_event_open counting, sampling, and
//! SPE-trace collection with deferred symbol resolution (spec.md §1–§2).
//!
//! The crate exposes an idiomatic `Registry`/`Result` surface internally
//! (see [`registry::Registry`]); the free functions at the crate root are
//! thin wrappers over a process-wide default registry, each stashing its
//! error in the thread-local channel before returning, for callers that
//! want the spec's C-shaped external interface (spec.md §6, §4.8) without
//! holding a `Registry` themselves.

pub mod attr;
pub mod config;
pub mod error;
pub mod event;
pub mod matrix;
pub mod raw;
pub mod record;
pub mod registry;
pub mod ring_buffer;
pub mod spe;
pub mod symbol;
pub mod sys;
pub mod time;
pub mod topology;

use std::sync::OnceLock;

pub use attr::{EventAttr, EventResolver, LowEventDesc, PmuKind, RawEventResolver, Rate, TaskType};
pub use config::Config;
pub use error::{errno_like, error_string, ErrorCode, PerfError, Result};
pub use record::{Payload, PmuRecord, Stack, Symbol};
pub use registry::{BufferHandle, Descriptor, Registry};

/// The process-wide default registry backing the free functions below
/// (spec.md §4.1's "global state becomes an explicit context object, with
/// a default instance for C-ABI-style callers" — see DESIGN.md).
static DEFAULT_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Returns the process-wide default `Registry`, built with
/// `Config::default()` on first use.
pub fn default_registry() -> &'static Registry {
    DEFAULT_REGISTRY.get_or_init(|| Registry::new(Config::default()))
}

/// `open(task_type, attr) → descriptor` (spec.md §4.1, §6). Resolves event
/// names with [`RawEventResolver`]; callers needing a symbolic/uncore/
/// tracepoint catalogue should hold their own `Registry` and call
/// [`Registry::open`] with a custom [`EventResolver`] instead.
pub fn open(task_type: TaskType, attr: EventAttr) -> Result<Descriptor> {
    error::with_error_channel(|| default_registry().open(task_type, attr, &RawEventResolver))
}

/// `collect(descriptor, ms) → status` (spec.md §4.1, §6).
pub fn collect(descriptor: Descriptor, ms: i64) -> Result<()> {
    error::with_error_channel(|| default_registry().collect(descriptor, ms))
}

/// `collect_v(descriptors[], ms) → status` (spec.md §4.1, §6).
pub fn collect_v(descriptors: &[Descriptor], ms: i64) -> Result<()> {
    error::with_error_channel(|| default_registry().collect_v(descriptors, ms))
}

/// `stop(descriptor)` (spec.md §4.1, §6).
pub fn stop(descriptor: Descriptor) -> Result<()> {
    error::with_error_channel(|| default_registry().stop(descriptor))
}

/// `read(descriptor) → (records[], len)` (spec.md §4.1, §6). Returns an
/// opaque handle; fetch the records with [`records`] and release them with
/// [`free_records`].
pub fn read(descriptor: Descriptor) -> Result<BufferHandle> {
    error::with_error_channel(|| default_registry().read(descriptor))
}

/// Fetches the records staged behind a handle returned by [`read`].
pub fn records(handle: BufferHandle) -> Vec<PmuRecord> {
    default_registry().records(handle)
}

/// `close(descriptor)` (spec.md §4.1, §6). Idempotent.
pub fn close(descriptor: Descriptor) -> Result<()> {
    error::with_error_channel(|| default_registry().close(descriptor))
}

/// `free_records(records_ptr)` (spec.md §4.1, §6). Idempotent.
pub fn free_records(handle: BufferHandle) {
    default_registry().free_records(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_empty_event_list_for_counting() {
        let attr = EventAttr {
            task_type: TaskType::Counting,
            ..EventAttr::default()
        };
        let err = open(TaskType::Counting, attr).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidEventList);
        assert_eq!(errno_like(), ErrorCode::InvalidEventList as i32);
    }

    #[test]
    fn open_rejects_negative_pid() {
        let attr = EventAttr {
            task_type: TaskType::Counting,
            event_names: vec!["r1b".to_string()],
            pid_list: vec![-5],
            ..EventAttr::default()
        };
        let err = open(TaskType::Counting, attr).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPidList);
    }

    #[test]
    fn unknown_descriptor_operations_fail_cleanly() {
        assert!(collect(999_999, 0).is_err());
        assert!(stop(999_999).is_err());
        assert!(read(999_999).is_err());
        assert!(close(999_999).is_ok());
    }
}
