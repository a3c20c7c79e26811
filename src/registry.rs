//! The descriptor registry: task orchestration, the collect loop, and the
//! client-facing read/close/free_records lifecycle (spec.md §4.1).
//!
//! Grounded on `mstange-samply::perf_group` (`PerfGroup::open_process`'s
//! thread enumeration and poll-based readiness loop, generalized here from
//! "one process" to the full cpu×thread×event matrix), combined with
//! `anp-perf_events`'s `count.rs`/`sample/mod.rs` enable/sleep/disable/drain
//! cadence.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::attr::{self, EventAttr, EventResolver, PmuKind, TaskType};
use crate::config::Config;
use crate::error::{PerfError, Result};
use crate::event::{CounterEvent, Drained, EventObject, SamplerEvent, SideEffect};
use crate::matrix::EventMatrix;
use crate::record::{aggregate_counts, Payload, PmuRecord, SpeExt};
use crate::spe::SpeSampler;
use crate::sys::{self, Readiness};
use crate::symbol::resolver::{RecordMode, SymbolResolver};
use crate::time;
use crate::topology;

/// Opaque per-collection handle (spec.md §3 "descriptor").
pub type Descriptor = u64;

/// Opaque handle over a read's staged buffer, freed by `free_records`.
pub type BufferHandle = u64;

/// Sentinel placeholder recorded against an spe-claimed cpu while its
/// descriptor id is still being allocated, so a concurrent `open` sees the
/// cpu as busy before the real id is known.
const RESERVED: Descriptor = Descriptor::MAX;

/// Staged, not-yet-resolved payload (spec.md §4.1 `read`: "triggering
/// symbol resolution on stack traces lazily"). Kept separate from
/// `PmuRecord` so stack resolution stays deferred until `read()`.
enum StagedPayload {
    Counting { count: u64 },
    Sampling { ips: Vec<u64> },
    Spe { ext: SpeExt, pc: u64 },
}

struct StagedRecord {
    event_name: Arc<str>,
    timestamp_ns: u64,
    cpu: i32,
    pid: i32,
    tid: i32,
    comm: Arc<str>,
    payload: StagedPayload,
}

struct DescriptorState {
    task_type: TaskType,
    matrices: Vec<EventMatrix>,
    /// Cpus this descriptor owns exclusively (non-empty only for
    /// `SpeSampling`), released on close (spec.md §4.4 "per-descriptor
    /// accounting").
    spe_cpus: Vec<i32>,
    readiness: Readiness,
    total_fds: usize,
    stop: Arc<AtomicBool>,
    staged: Vec<StagedRecord>,
    comm_cache: HashMap<i32, Arc<str>>,
}

impl DescriptorState {
    fn comm_for(&mut self, pid: i32) -> Arc<str> {
        if let Some(c) = self.comm_cache.get(&pid) {
            return Arc::clone(c);
        }
        let comm = topology::proc_topology(pid)
            .map(|p| p.comm)
            .unwrap_or_else(|_| "?".to_string());
        let arc: Arc<str> = Arc::from(comm.as_str());
        self.comm_cache.insert(pid, Arc::clone(&arc));
        arc
    }
}

/// The descriptor registry and task orchestrator (spec.md §4.1). Holds no
/// global state: multiple `Registry`s can coexist, each with independent
/// descriptor numbering and symbol caches.
pub struct Registry {
    config: Config,
    resolver: SymbolResolver,
    descriptors: Mutex<HashMap<Descriptor, Arc<Mutex<DescriptorState>>>>,
    spe_owned_cpus: Mutex<HashMap<i32, Descriptor>>,
    buffers: Mutex<HashMap<BufferHandle, Vec<PmuRecord>>>,
    next_buffer_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(Config::default())
    }
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Registry {
            config,
            resolver: SymbolResolver::new(),
            descriptors: Mutex::new(HashMap::new()),
            spe_owned_cpus: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            next_buffer_id: AtomicU64::new(0),
        }
    }

    /// `open(attr, resolver)` (spec.md §4.1): validates, expands, resolves,
    /// opens the fd matrix, and allocates the lowest available descriptor.
    /// Any failure mid-way drops everything opened so far (the `Drop` impls
    /// on `File`/`RingBuffer`/`AuxRegion` close fds and unmap memory).
    pub fn open(
        &self,
        task_type: TaskType,
        attr: EventAttr,
        resolver: &dyn EventResolver,
    ) -> Result<Descriptor> {
        let cpus = validate_and_expand_cpus(&attr.cpu_list)?;
        validate_pids(&attr.pid_list)?;
        let tids = expand_tids(&attr.pid_list);

        match task_type {
            TaskType::Counting | TaskType::Sampling => {
                let (matrices, readiness, total_fds) =
                    self.open_matrices(task_type, &attr, resolver, &cpus, &tids)?;
                let state = DescriptorState {
                    task_type,
                    matrices,
                    spe_cpus: Vec::new(),
                    readiness,
                    total_fds,
                    stop: Arc::new(AtomicBool::new(false)),
                    staged: Vec::new(),
                    comm_cache: HashMap::new(),
                };
                let mut descriptors = self.descriptors.lock();
                let id = lowest_available(&descriptors);
                descriptors.insert(id, Arc::new(Mutex::new(state)));
                Ok(id)
            }
            TaskType::SpeSampling => {
                self.claim_spe_cpus(&cpus)?;
                match self.open_spe_matrix(&attr, &cpus) {
                    Ok((matrix, readiness, total_fds)) => {
                        let mut descriptors = self.descriptors.lock();
                        let id = lowest_available(&descriptors);
                        self.finalize_spe_cpus(&cpus, id);
                        let state = DescriptorState {
                            task_type,
                            matrices: vec![matrix],
                            spe_cpus: cpus,
                            readiness,
                            total_fds,
                            stop: Arc::new(AtomicBool::new(false)),
                            staged: Vec::new(),
                            comm_cache: HashMap::new(),
                        };
                        descriptors.insert(id, Arc::new(Mutex::new(state)));
                        Ok(id)
                    }
                    Err(e) => {
                        self.release_spe_cpus(&cpus);
                        Err(e)
                    }
                }
            }
        }
    }

    fn open_matrices(
        &self,
        task_type: TaskType,
        attr: &EventAttr,
        resolver: &dyn EventResolver,
        cpus: &[i32],
        tids: &[i32],
    ) -> Result<(Vec<EventMatrix>, Readiness, usize)> {
        if attr.event_names.is_empty() {
            return Err(PerfError::InvalidEventList(
                "counting/sampling requires a non-empty event list".to_string(),
            ));
        }
        let low_descs = attr
            .event_names
            .iter()
            .map(|name| resolver.resolve(name))
            .collect::<Result<Vec<_>>>()?;

        let required = (low_descs.len() * cpus.len() * tids.len()) as u64;
        sys::ensure_fd_budget(required)?;

        let readiness = Readiness::new()?;
        let mut matrices = Vec::with_capacity(low_descs.len());
        let mut token = 0u64;
        for low in &low_descs {
            let mut matrix = EventMatrix::new(low.display_name.clone());
            let event_name: Arc<str> = Arc::from(low.display_name.as_str());
            for &cpu in cpus {
                if let (PmuKind::Uncore, Some(mask)) = (low.pmu_kind, &low.cpumask) {
                    if !mask.contains(&cpu) {
                        continue;
                    }
                }
                for &tid in tids {
                    let object = match task_type {
                        TaskType::Counting => EventObject::Counter(CounterEvent::open(
                            low,
                            Arc::clone(&event_name),
                            tid,
                            cpu,
                        )?),
                        TaskType::Sampling => EventObject::Sampler(SamplerEvent::open(
                            low,
                            Arc::clone(&event_name),
                            attr,
                            tid,
                            cpu,
                            self.config.sampler_ring_pages,
                        )?),
                        TaskType::SpeSampling => unreachable!("spe built via open_spe_matrix"),
                    };
                    let borrowed = unsafe { BorrowedFd::borrow_raw(object.raw_fd()) };
                    readiness.register(&borrowed, token)?;
                    token += 1;
                    matrix.insert(cpu, tid, object);
                }
            }
            matrices.push(matrix);
        }
        Ok((matrices, readiness, token as usize))
    }

    fn open_spe_matrix(
        &self,
        attr: &EventAttr,
        cpus: &[i32],
    ) -> Result<(EventMatrix, Readiness, usize)> {
        let spe_type = attr::spe_pmu_type()?;
        sys::ensure_fd_budget((cpus.len() * 2) as u64)?;

        let readiness = Readiness::new()?;
        let mut matrix = EventMatrix::new("spe");
        let mut token = 0u64;
        for &cpu in cpus {
            let sampler = SpeSampler::open(
                cpu,
                spe_type,
                attr,
                self.config.spe_ring_buf_size,
                self.config.spe_aux_buf_size,
                self.config.spe_record_cap,
            )?;
            let object = EventObject::Spe(sampler);
            let borrowed = unsafe { BorrowedFd::borrow_raw(object.raw_fd()) };
            readiness.register(&borrowed, token)?;
            token += 1;
            matrix.insert(cpu, -1, object);
        }
        Ok((matrix, readiness, token as usize))
    }

    fn claim_spe_cpus(&self, cpus: &[i32]) -> Result<()> {
        let mut owned = self.spe_owned_cpus.lock();
        if let Some(&busy) = cpus.iter().find(|c| owned.contains_key(*c)) {
            return Err(PerfError::DeviceBusy(format!(
                "cpu {busy} already has an open SPE descriptor"
            )));
        }
        for &cpu in cpus {
            owned.insert(cpu, RESERVED);
        }
        Ok(())
    }

    fn finalize_spe_cpus(&self, cpus: &[i32], descriptor: Descriptor) {
        let mut owned = self.spe_owned_cpus.lock();
        for &cpu in cpus {
            owned.insert(cpu, descriptor);
        }
    }

    fn release_spe_cpus(&self, cpus: &[i32]) {
        let mut owned = self.spe_owned_cpus.lock();
        for cpu in cpus {
            owned.remove(cpu);
        }
    }

    fn state(&self, descriptor: Descriptor) -> Result<Arc<Mutex<DescriptorState>>> {
        self.descriptors
            .lock()
            .get(&descriptor)
            .cloned()
            .ok_or(PerfError::NoAvailableDescriptor)
    }

    /// `collect(descriptor, ms)` (spec.md §4.1 cadence table). `ms < 0`
    /// means "run until stopped or every monitored target exits"; `ms ==
    /// 0` drains once without sleeping. The descriptor's lock is only held
    /// for the brief enable/disable/drain/poll steps, never across the
    /// slice sleep, so a concurrent `stop()` from another thread (as
    /// `collect_v` uses) can always take effect at the next slice boundary.
    pub fn collect(&self, descriptor: Descriptor, ms: i64) -> Result<()> {
        let state_arc = self.state(descriptor)?;
        let (task_type, stop) = {
            let state = state_arc.lock();
            (state.task_type, Arc::clone(&state.stop))
        };
        stop.store(false, Ordering::SeqCst);
        let slice_ms = self.config.slice_ms as i64;

        match task_type {
            TaskType::Counting => {
                enable_all(&state_arc.lock().matrices)?;
                let mut elapsed = 0i64;
                loop {
                    if ms >= 0 && elapsed >= ms {
                        break;
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if all_monitored_hup(&state_arc)? {
                        break;
                    }
                    let this_slice = next_slice(ms, elapsed, slice_ms);
                    std::thread::sleep(Duration::from_millis(this_slice.max(0) as u64));
                    elapsed += this_slice;
                }
                let mut state = state_arc.lock();
                disable_all(&state.matrices)?;
                drain_all(&mut state, &self.resolver);
            }
            TaskType::Sampling | TaskType::SpeSampling => {
                let mut elapsed = 0i64;
                loop {
                    if ms >= 0 && elapsed >= ms {
                        break;
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if all_monitored_hup(&state_arc)? {
                        break;
                    }
                    enable_all(&state_arc.lock().matrices)?;
                    let this_slice = next_slice(ms, elapsed, slice_ms);
                    std::thread::sleep(Duration::from_millis(this_slice.max(0) as u64));
                    let mut state = state_arc.lock();
                    disable_all(&state.matrices)?;
                    drain_all(&mut state, &self.resolver);
                    drop(state);
                    elapsed += this_slice;
                }
            }
        }
        Ok(())
    }

    /// `collect_v(descriptors, ms)` (spec.md §4.1): runs every descriptor's
    /// collect loop on its own thread via `std::thread::scope`, sharing the
    /// same `collect`/stop-flag path `collect` itself uses (spec's open
    /// question about a "running" flag bug does not arise here: there is
    /// only ever one check path).
    pub fn collect_v(&self, descriptors: &[Descriptor], ms: i64) -> Result<()> {
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = descriptors
                .iter()
                .map(|&d| scope.spawn(move || self.collect(d, ms)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(PerfError::Unknown("collect thread panicked".into())))
                })
                .collect()
        });
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }

    /// `stop(descriptor)` (spec.md §4.1): sets the cooperative flag an
    /// in-flight `collect`/`collect_v` call observes at its next slice
    /// boundary.
    pub fn stop(&self, descriptor: Descriptor) -> Result<()> {
        let state = self.state(descriptor)?;
        state.lock().stop.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// `read(descriptor)` (spec.md §4.1): hands staged records to the
    /// client, resolving stacks lazily and aggregating counting-mode
    /// records by `(event_name, tid, cpu)`. Returns an opaque handle;
    /// records stay addressable until `free_records` releases them.
    pub fn read(&self, descriptor: Descriptor) -> Result<BufferHandle> {
        let state_arc = self.state(descriptor)?;
        let (staged, task_type) = {
            let mut state = state_arc.lock();
            (std::mem::take(&mut state.staged), state.task_type)
        };

        let mut records: Vec<PmuRecord> = staged
            .into_iter()
            .map(|s| self.resolve_staged(s))
            .collect();
        if task_type == TaskType::Counting {
            records = aggregate_counts(records);
        }

        let handle = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().insert(handle, records);
        Ok(handle)
    }

    fn resolve_staged(&self, staged: StagedRecord) -> PmuRecord {
        let payload = match staged.payload {
            StagedPayload::Counting { count } => Payload::Counting { count },
            StagedPayload::Sampling { ips } => {
                let _ = self.resolver.record_module(staged.pid, RecordMode::NoDwarf);
                Payload::Sampling {
                    stack: self.resolver.stack_to_hash(staged.pid, &ips),
                }
            }
            StagedPayload::Spe { ext, pc } => {
                let _ = self.resolver.record_module(staged.pid, RecordMode::All);
                Payload::Spe {
                    ext,
                    pc: self.resolver.stack_to_hash(staged.pid, &[pc]),
                }
            }
        };
        PmuRecord {
            event_name: staged.event_name,
            timestamp_ns: staged.timestamp_ns,
            cpu: staged.cpu,
            pid: staged.pid,
            tid: staged.tid,
            comm: staged.comm,
            payload,
        }
    }

    /// Returns a clone of the records staged behind `handle`, or an empty
    /// vector if the handle is unknown or already freed.
    pub fn records(&self, handle: BufferHandle) -> Vec<PmuRecord> {
        self.buffers.lock().get(&handle).cloned().unwrap_or_default()
    }

    /// `free_records(pointer)` (spec.md §4.1): releases the buffer keyed by
    /// `handle`. Idempotent.
    pub fn free_records(&self, handle: BufferHandle) {
        self.buffers.lock().remove(&handle);
    }

    /// `close(descriptor)` (spec.md §4.1): idempotent teardown. Dropping
    /// the descriptor's `Arc<Mutex<DescriptorState>>` unmaps every ring and
    /// closes every fd once the last reference (this one, under normal use)
    /// goes away. Closing while a `collect` is in-flight is unsupported
    /// (spec.md §8): the caller must `stop` first.
    pub fn close(&self, descriptor: Descriptor) -> Result<()> {
        let removed = self.descriptors.lock().remove(&descriptor);
        if let Some(state_arc) = removed {
            let spe_cpus = state_arc.lock().spe_cpus.clone();
            if !spe_cpus.is_empty() {
                self.release_spe_cpus(&spe_cpus);
            }
        }
        Ok(())
    }
}

fn next_slice(ms: i64, elapsed: i64, slice_ms: i64) -> i64 {
    if ms < 0 {
        slice_ms
    } else {
        slice_ms.min((ms - elapsed).max(0))
    }
}

fn enable_all(matrices: &[EventMatrix]) -> Result<()> {
    for matrix in matrices {
        for (_, object) in matrix.iter() {
            object.enable()?;
        }
    }
    Ok(())
}

fn disable_all(matrices: &[EventMatrix]) -> Result<()> {
    for matrix in matrices {
        for (_, object) in matrix.iter() {
            object.disable()?;
        }
    }
    Ok(())
}

/// One drained cell, not yet carrying a resolved `comm` (spec.md §4.1
/// drain step). Kept separate from `StagedRecord` so the matrices' mutable
/// borrow can end before `state.comm_for` (which needs `&mut state` as a
/// whole) runs.
enum DrainedCell {
    Count { event_name: Arc<str>, cpu: i32, tid: i32, value: u64 },
    Sample { event_name: Arc<str>, cpu: i32, pid: i32, tid: i32, ips: Vec<u64> },
    Spe { event_name: Arc<str>, cpu: i32, pid: i32, tid: i32, ts: u64, ext: SpeExt, pc: u64 },
}

fn drain_all(state: &mut DescriptorState, resolver: &SymbolResolver) {
    let mut drained = Vec::new();
    for matrix in state.matrices.iter_mut() {
        let event_name: Arc<str> = Arc::from(matrix.event_name.as_str());
        for (pos, object) in matrix.iter_mut() {
            let (cpu, tid) = *pos;
            match object.drain() {
                Ok(Drained::Count { value }) => drained.push(DrainedCell::Count {
                    event_name: Arc::clone(&event_name),
                    cpu,
                    tid,
                    value,
                }),
                Ok(Drained::Samples(samples, effects)) => {
                    for effect in effects {
                        if let SideEffect::ModuleLoad { pid, addr, len, path } = effect {
                            let _ = resolver.update_module_mmap(pid, &path, addr, len);
                        }
                    }
                    for sample in samples {
                        drained.push(DrainedCell::Sample {
                            event_name: Arc::clone(&event_name),
                            cpu: sample.cpu,
                            pid: sample.pid,
                            tid: sample.tid,
                            ips: sample.ips,
                        });
                    }
                }
                Ok(Drained::Spe(outcome)) => {
                    if outcome.truncated {
                        log::warn!("spe aux ring on cpu {cpu} truncated this slice");
                    }
                    for (record, switch) in outcome.records {
                        drained.push(DrainedCell::Spe {
                            event_name: Arc::clone(&event_name),
                            cpu,
                            pid: switch.next_prev_pid,
                            tid: switch.next_prev_tid,
                            ts: record.timestamp.unwrap_or(0),
                            ext: SpeExt {
                                event_bits: record.event,
                                va: record.va.unwrap_or(0),
                                pa: record.pa.unwrap_or(0),
                            },
                            pc: record.pc.unwrap_or(0),
                        });
                    }
                }
                Err(e) => {
                    log::warn!("drain failed for event '{}' on cpu {cpu} tid {tid}: {e}", matrix.event_name);
                }
            }
        }
    }

    for cell in drained {
        let staged = match cell {
            DrainedCell::Count { event_name, cpu, tid, value } => {
                let comm = state.comm_for(tid);
                StagedRecord {
                    event_name,
                    timestamp_ns: time::now_ns(),
                    cpu,
                    pid: tid,
                    tid,
                    comm,
                    payload: StagedPayload::Counting { count: value },
                }
            }
            DrainedCell::Sample { event_name, cpu, pid, tid, ips } => {
                let comm = state.comm_for(pid);
                StagedRecord {
                    event_name,
                    timestamp_ns: time::now_ns(),
                    cpu,
                    pid,
                    tid,
                    comm,
                    payload: StagedPayload::Sampling { ips },
                }
            }
            DrainedCell::Spe { event_name, cpu, pid, tid, ts, ext, pc } => {
                let comm = state.comm_for(pid);
                StagedRecord {
                    event_name,
                    timestamp_ns: ts,
                    cpu,
                    pid,
                    tid,
                    comm,
                    payload: StagedPayload::Spe { ext, pc },
                }
            }
        };
        state.staged.push(staged);
    }
}

/// Polls every registered fd once; returns true only if all of them are
/// currently reporting hangup (spec.md §4.1 "all monitored processes have
/// exited" early-exit condition). System-wide monitoring (`tid == -1`)
/// never hangs up, so this naturally never fires early for it.
fn all_monitored_hup(state_arc: &Arc<Mutex<DescriptorState>>) -> Result<bool> {
    let state = state_arc.lock();
    if state.total_fds == 0 {
        return Ok(true);
    }
    let ready = state.readiness.poll(0)?;
    let hup = ready
        .iter()
        .filter(|(_, flags)| {
            flags.intersects(nix::sys::epoll::EpollFlags::EPOLLHUP | nix::sys::epoll::EpollFlags::EPOLLRDHUP)
        })
        .count();
    Ok(hup >= state.total_fds)
}

fn lowest_available(map: &HashMap<Descriptor, Arc<Mutex<DescriptorState>>>) -> Descriptor {
    let mut id = 0u64;
    while map.contains_key(&id) {
        id += 1;
    }
    id
}

/// Cpu list validation + expansion (spec.md §4.1: "cpu ids each in
/// `[0, max_online_cpu)`; empty means all online cpus").
fn validate_and_expand_cpus(cpu_list: &[i32]) -> Result<Vec<i32>> {
    let max_cpu = num_cpus::get() as i32;
    if cpu_list.is_empty() {
        return Ok((0..max_cpu).collect());
    }
    for &cpu in cpu_list {
        if cpu < 0 || cpu >= max_cpu {
            return Err(PerfError::InvalidCpuList(format!(
                "cpu {cpu} out of range [0, {max_cpu})"
            )));
        }
    }
    let mut cpus = cpu_list.to_vec();
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Pid list validation (spec.md §4.1: "pid ids each non-negative").
fn validate_pids(pid_list: &[i32]) -> Result<()> {
    for &pid in pid_list {
        if pid < 0 {
            return Err(PerfError::InvalidPidList(format!("negative pid {pid}")));
        }
    }
    Ok(())
}

/// Expands each top-level pid into its live thread ids (spec.md §4.1,
/// §4.7 `child_tids`). An empty pid list means system-wide monitoring
/// (sentinel tid -1). A pid that vanishes between validation and
/// expansion is skipped rather than failing the whole `open` (spec.md §8:
/// "pid_list with a vanished pid: open succeeds on live child tids").
fn expand_tids(pid_list: &[i32]) -> Vec<i32> {
    if pid_list.is_empty() {
        return vec![-1];
    }
    let mut tids = Vec::new();
    for &pid in pid_list {
        match topology::child_tids(pid) {
            Ok(list) => tids.extend(list),
            Err(_) => log::warn!("pid {pid} vanished before open; skipping its threads"),
        }
    }
    tids.sort_unstable();
    tids.dedup();
    tids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_available_fills_gaps() {
        let mut map: HashMap<Descriptor, Arc<Mutex<DescriptorState>>> = HashMap::new();
        assert_eq!(lowest_available(&map), 0);
        map.insert(0, dummy_state());
        map.insert(1, dummy_state());
        assert_eq!(lowest_available(&map), 2);
        map.remove(&0);
        assert_eq!(lowest_available(&map), 0);
    }

    fn dummy_state() -> Arc<Mutex<DescriptorState>> {
        Arc::new(Mutex::new(DescriptorState {
            task_type: TaskType::Counting,
            matrices: Vec::new(),
            spe_cpus: Vec::new(),
            readiness: Readiness::new().unwrap(),
            total_fds: 0,
            stop: Arc::new(AtomicBool::new(false)),
            staged: Vec::new(),
            comm_cache: HashMap::new(),
        }))
    }

    #[test]
    fn validate_pids_rejects_negative() {
        assert!(validate_pids(&[-1]).is_err());
        assert!(validate_pids(&[0, 1, 2]).is_ok());
    }

    #[test]
    fn validate_and_expand_cpus_rejects_out_of_range() {
        let max_cpu = num_cpus::get() as i32;
        assert!(validate_and_expand_cpus(&[max_cpu]).is_err());
        assert!(validate_and_expand_cpus(&[0]).is_ok());
    }

    #[test]
    fn expand_tids_empty_pid_list_is_system_wide_sentinel() {
        assert_eq!(expand_tids(&[]), vec![-1]);
    }

    #[test]
    fn next_slice_caps_to_remaining_time() {
        assert_eq!(next_slice(250, 200, 100), 50);
        assert_eq!(next_slice(250, 0, 100), 100);
        assert_eq!(next_slice(-1, 12345, 100), 100);
    }
}
