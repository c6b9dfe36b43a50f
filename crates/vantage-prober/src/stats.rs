//! # Round Statistics
//!
//! Counters accumulated over one probing round. Probe counters reset at
//! round start; the per-state block counts are maintained incrementally as
//! blocks settle and survive across rounds.

use vantage_core::belief::BeliefState;
use vantage_core::probe::ProbeType;

#[derive(Debug, Clone, Default)]
pub struct RoundStats {
    /// Wall-clock time the round started at (unix ms).
    pub start_time: u64,
    /// Probes sent this round, by probe type.
    pub probe_cnt: [u32; ProbeType::COUNT],
    /// Responses received this round, by probe type.
    pub probe_complete_cnt: [u32; ProbeType::COUNT],
    /// Responsive responses this round, by probe type.
    pub responsive_cnt: [u32; ProbeType::COUNT],
    /// Number of /24s currently in each belief state.
    pub slash24_state_cnts: [u32; BeliefState::COUNT],
    /// Number of /24s being probed.
    pub slash24_cnt: u32,
}

impl RoundStats {
    pub fn new() -> RoundStats {
        RoundStats::default()
    }

    /// Reset the per-round probe counters for a new round starting at
    /// `start_time`. State counts carry over.
    pub fn reset_round(&mut self, start_time: u64) {
        self.start_time = start_time;
        self.probe_cnt = [0; ProbeType::COUNT];
        self.probe_complete_cnt = [0; ProbeType::COUNT];
        self.responsive_cnt = [0; ProbeType::COUNT];
    }

    /// Fraction of this round's periodic probes that were responsive.
    pub fn periodic_response_rate(&self) -> f64 {
        let sent = self.probe_cnt[ProbeType::Periodic.index()];
        if sent == 0 {
            0.0
        } else {
            self.responsive_cnt[ProbeType::Periodic.index()] as f64 / sent as f64
        }
    }
}
