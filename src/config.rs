//! Process-wide tunables (SPEC_FULL §3 `Config`).
//!
//! The original source hard-codes these as `#define`s; grounded on
//! `anp-perf_events`'s builder-style configs (`SamplingConfig`,
//! `CountConfig`) this is exposed as an overridable struct instead.

/// Tunables controlling ring buffer sizing, collect cadence, and SPE
/// buffer limits. `Config::default()` matches the original's hard-coded
/// constants.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Pages (of `PAGE_SIZE` each) mapped for a Sampler's ring buffer,
    /// excluding the control page. Must be a power of two (spec.md §4.2).
    pub sampler_ring_pages: usize,
    /// Bytes mapped for the SPE aux buffer (spec.md §4.4 step 3,
    /// `AUX_BUF_SIZE`).
    pub spe_aux_buf_size: usize,
    /// Bytes mapped for the SPE/dummy control rings (spec.md §4.4 steps
    /// 2/5, `RING_BUF_SIZE`).
    pub spe_ring_buf_size: usize,
    /// Collect slice length in milliseconds (spec.md §4.1 cadence table).
    pub slice_ms: u64,
    /// Max SPE records staged per read (spec.md §4.4 Phase B, "bounded at
    /// 100 000 records").
    pub spe_record_cap: usize,
    /// Scratch buffer size for a ring record that wraps the buffer
    /// boundary (spec.md §4.3 "copy it into a scratch buffer up to 8 KiB").
    pub wrap_scratch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sampler_ring_pages: 128,
            spe_aux_buf_size: 256 * 1024,
            spe_ring_buf_size: 64 * 1024,
            slice_ms: 100,
            spe_record_cap: 100_000,
            wrap_scratch_size: 8 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_original_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.sampler_ring_pages, 128);
        assert_eq!(cfg.spe_aux_buf_size, 256 * 1024);
        assert_eq!(cfg.spe_record_cap, 100_000);
        assert!(cfg.sampler_ring_pages.is_power_of_two());
    }
}
