//! Client-supplied attributes, resolver output, and the `perf_event_attr`
//! builder (§3, §4.1, §4.2).
//!
//! Grounded on `anp-perf_events::sample::config` (`SamplingConfig`,
//! `PerfEventAttrThingy::apply`) and `count.rs` (`CountConfig`), generalized
//! across all three task types instead of one config struct per mode.

use crate::error::{PerfError, Result};
use crate::raw::{self, perf_event_attr};

/// `EventAttr::task_type` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Counting,
    Sampling,
    SpeSampling,
}

/// Client-supplied attributes (spec.md §3 `EventAttr`).
#[derive(Debug, Clone)]
pub struct EventAttr {
    pub task_type: TaskType,
    pub event_names: Vec<String>,
    pub pid_list: Vec<i32>,
    pub cpu_list: Vec<i32>,
    pub period: Option<u64>,
    pub frequency: Option<u64>,
    pub use_frequency: bool,
    pub data_filter: u64,
    pub event_filter: u64,
    pub min_latency: u64,
}

impl Default for EventAttr {
    fn default() -> Self {
        EventAttr {
            task_type: TaskType::Counting,
            event_names: Vec::new(),
            pid_list: Vec::new(),
            cpu_list: Vec::new(),
            period: None,
            frequency: None,
            use_frequency: false,
            data_filter: 0,
            event_filter: 0,
            min_latency: 0,
        }
    }
}

impl EventAttr {
    /// Resolves the period/frequency open question (spec.md §9: "no guard
    /// against simultaneously-set period AND frequency... recommended:
    /// use_frequency wins").
    pub fn rate(&self) -> Rate {
        if self.use_frequency {
            if let Some(freq) = self.frequency {
                return Rate::Frequency(freq);
            }
        }
        if let Some(period) = self.period {
            return Rate::Period(period);
        }
        if let Some(freq) = self.frequency {
            return Rate::Frequency(freq);
        }
        Rate::Period(1)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Rate {
    Period(u64),
    Frequency(u64),
}

/// `LowEventDesc::pmu_kind` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuKind {
    Core,
    Uncore,
    Trace,
    Spe,
}

/// Resolver output (spec.md §3 `LowEventDesc`).
#[derive(Debug, Clone)]
pub struct LowEventDesc {
    pub type_: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
    pub pmu_kind: PmuKind,
    /// Restricts fd-opening to one cpu for uncore PMUs.
    pub cpumask: Option<Vec<i32>>,
    pub period: Option<u64>,
    pub frequency: Option<u64>,
    pub display_name: String,
}

impl LowEventDesc {
    pub fn raw(name: &str, config: u64) -> Self {
        LowEventDesc {
            type_: raw::PERF_TYPE_RAW,
            config,
            config1: 0,
            config2: 0,
            pmu_kind: PmuKind::Core,
            cpumask: None,
            period: None,
            frequency: None,
            display_name: name.to_string(),
        }
    }
}

/// Name→`LowEventDesc` resolution is kept an external collaborator (spec.md
/// §1: "per-event-name catalogue tables... external collaborator"). The
/// registry only needs *something* implementing this hook; hosts that carry
/// the full core/uncore/tracepoint catalogue plug it in here.
pub trait EventResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<LowEventDesc>;
}

/// Minimal resolver shipped in the core: understands `r<hex>` raw events
/// (spec.md §6 "Event name formats") and nothing else. A catalogue-backed
/// resolver supersedes this for symbolic/uncore/tracepoint names.
#[derive(Debug, Default)]
pub struct RawEventResolver;

impl EventResolver for RawEventResolver {
    fn resolve(&self, name: &str) -> Result<LowEventDesc> {
        if let Some(hex) = name.strip_prefix('r') {
            let config = u64::from_str_radix(hex, 16)
                .map_err(|_| PerfError::InvalidEventList(name.to_string()))?;
            return Ok(LowEventDesc::raw(name, config));
        }
        Err(PerfError::InvalidEventList(format!(
            "unrecognized event name '{name}' (no catalogue resolver installed)"
        )))
    }
}

/// Builds the `perf_event_attr` for a Counter (spec.md §4.2 "Counter.init").
pub fn build_counter_attr(low: &LowEventDesc) -> perf_event_attr {
    let mut attr = perf_event_attr::new();
    attr.type_ = low.type_;
    attr.config = low.config;
    attr.config1 = low.config1;
    attr.config2 = low.config2;
    attr.read_format = raw::PERF_FORMAT_TOTAL_TIME_ENABLED
        | raw::PERF_FORMAT_TOTAL_TIME_RUNNING
        | raw::PERF_FORMAT_ID;
    attr.flags = raw::ATTR_FLAG_BIT_DISABLED | raw::ATTR_FLAG_BIT_INHERIT;
    attr
}

/// Builds the `perf_event_attr` for a Sampler (spec.md §4.2 "Sampler.init").
pub fn build_sampler_attr(low: &LowEventDesc, attr_in: &EventAttr) -> perf_event_attr {
    let mut attr = perf_event_attr::new();
    attr.type_ = low.type_;
    attr.config = low.config;
    attr.config1 = low.config1;
    attr.config2 = low.config2;
    attr.sample_type = raw::PERF_SAMPLE_IP
        | raw::PERF_SAMPLE_TID
        | raw::PERF_SAMPLE_TIME
        | raw::PERF_SAMPLE_CALLCHAIN
        | raw::PERF_SAMPLE_ID
        | raw::PERF_SAMPLE_CPU
        | raw::PERF_SAMPLE_PERIOD
        | raw::PERF_SAMPLE_IDENTIFIER;
    attr.flags = raw::ATTR_FLAG_BIT_MMAP
        | raw::ATTR_FLAG_BIT_MMAP2
        | raw::ATTR_FLAG_BIT_COMM
        | raw::ATTR_FLAG_BIT_TASK
        | raw::ATTR_FLAG_BIT_SAMPLE_ID_ALL
        | raw::ATTR_FLAG_BIT_EXCLUDE_GUEST
        | raw::ATTR_FLAG_BIT_PINNED
        | raw::ATTR_FLAG_BIT_DISABLED
        | raw::ATTR_FLAG_BIT_INHERIT;
    match attr_in.rate() {
        Rate::Frequency(f) => {
            attr.flags |= raw::ATTR_FLAG_BIT_FREQ;
            attr.sample_period_or_freq = f;
        }
        Rate::Period(p) => {
            attr.sample_period_or_freq = p;
        }
    }
    attr
}

/// Builds the `perf_event_attr` for the SPE hardware event (spec.md §4.4
/// step 1).
pub fn build_spe_attr(spe_type: u32, attr_in: &EventAttr) -> perf_event_attr {
    let mut attr = perf_event_attr::new();
    attr.type_ = spe_type;
    attr.config = attr_in.data_filter;
    attr.config1 = attr_in.event_filter;
    attr.config2 = attr_in.min_latency;
    attr.sample_type = raw::PERF_SAMPLE_TID;
    attr.flags = raw::ATTR_FLAG_BIT_SAMPLE_ID_ALL | raw::ATTR_FLAG_BIT_DISABLED;
    attr
}

/// Builds the `perf_event_attr` for the paired dummy software event
/// (spec.md §4.4 step 4).
pub fn build_dummy_attr() -> perf_event_attr {
    let mut attr = perf_event_attr::new();
    attr.type_ = raw::PERF_TYPE_SOFTWARE;
    attr.config = SW_DUMMY;
    attr.sample_period_or_freq = 1;
    attr.sample_type = raw::PERF_SAMPLE_TIME;
    attr.flags = raw::ATTR_FLAG_BIT_CONTEXT_SWITCH
        | raw::ATTR_FLAG_BIT_MMAP
        | raw::ATTR_FLAG_BIT_TASK
        | raw::ATTR_FLAG_BIT_INHERIT
        | raw::ATTR_FLAG_BIT_EXCLUDE_KERNEL;
    attr
}

/// `PERF_COUNT_SW_DUMMY`, the kernel's "no-op" software event used purely
/// to ride along on context-switch/mmap notifications.
pub const SW_DUMMY: u64 = 9;

/// Reads the dynamic PMU type id for the SPE device (spec.md §4.4 step 1:
/// `type = /sys/devices/arm_spe_0/type`).
pub fn spe_pmu_type() -> Result<u32> {
    let text = std::fs::read_to_string("/sys/devices/arm_spe_0/type")
        .map_err(|_| PerfError::SpeUnavailable)?;
    text.trim().parse::<u32>().map_err(|_| PerfError::SpeUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_resolver_parses_hex() {
        let resolver = RawEventResolver;
        let desc = resolver.resolve("r1b").unwrap();
        assert_eq!(desc.config, 0x1b);
        assert_eq!(desc.type_, raw::PERF_TYPE_RAW);
    }

    #[test]
    fn raw_resolver_rejects_symbolic_names() {
        let resolver = RawEventResolver;
        assert!(resolver.resolve("cycles").is_err());
    }

    #[test]
    fn use_frequency_wins_when_both_set() {
        let attr = EventAttr {
            period: Some(1000),
            frequency: Some(99),
            use_frequency: true,
            ..EventAttr::default()
        };
        match attr.rate() {
            Rate::Frequency(f) => assert_eq!(f, 99),
            Rate::Period(_) => panic!("expected frequency to win"),
        }
    }

    #[test]
    fn period_used_when_use_frequency_false() {
        let attr = EventAttr {
            period: Some(1000),
            frequency: Some(99),
            use_frequency: false,
            ..EventAttr::default()
        };
        match attr.rate() {
            Rate::Period(p) => assert_eq!(p, 1000),
            Rate::Frequency(_) => panic!("expected period to win"),
        }
    }

    #[test]
    fn sampler_attr_sets_freq_bit_only_when_requested() {
        let low = LowEventDesc::raw("r0", 0);
        let attr_in = EventAttr {
            period: Some(2000),
            ..EventAttr::default()
        };
        let attr = build_sampler_attr(&low, &attr_in);
        assert_eq!(attr.flags & raw::ATTR_FLAG_BIT_FREQ, 0);
        assert_eq!(attr.sample_period_or_freq, 2000);
    }
}
