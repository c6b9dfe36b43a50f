//! # Metric Registration
//!
//! All time-series keys the prober publishes, under the shared root
//! `active.ping-slash24`:
//!
//! - prober metadata and per-round counters:
//!   `<root>.probers.<name>.meta.*`, `...probing.<type>.*`, `...states.*`
//! - per-tag aggregate state counts:
//!   `<root>.<tag>.probers.<name>.<state>_slash24_cnt`
//! - per-block belief/state (leaf tags only):
//!   `<root>.<tag>.probers.<name>.blocks.__PFX_<a-b-c-0>_24.{belief,state}`
//!
//! Path components that may contain dots or globs (prober name, block
//! address, tags) are sanitized with [`graphite_safe`] first.

use vantage_core::belief::BeliefState;
use vantage_core::probe::ProbeType;
use vantage_core::probelist::{MetricTag, Slash24Metrics};
use vantage_timeseries::{KeyId, KeyPackage};

/// Root of every metric path the prober emits.
pub const METRIC_PREFIX: &str = "active.ping-slash24";

/// Replace characters that would split or glob a metric path.
pub fn graphite_safe(s: &str) -> String {
    s.replace(['.', '*'], "-")
}

/// Handles for the aggregate (non-/24) metrics of one probelist generation.
#[derive(Debug, Clone)]
pub struct AggrMetrics {
    pub round_id: KeyId,
    pub round_duration: KeyId,
    /// Indexed by probe type; the `unprobed` slot is never registered.
    pub probe_cnt: [KeyId; ProbeType::COUNT],
    pub completed_probe_cnt: [KeyId; ProbeType::COUNT],
    pub responsive_probe_cnt: [KeyId; ProbeType::COUNT],
    pub slash24_state_cnts: [KeyId; BeliefState::COUNT],
    pub slash24_cnt: KeyId,
}

/// Register the aggregate metric keys for a prober named `name_ts`.
pub fn register_aggr(kp: &mut KeyPackage, name_ts: &str) -> AggrMetrics {
    let round_id = kp.register_key(format!("{METRIC_PREFIX}.probers.{name_ts}.meta.round_id"));
    let round_duration =
        kp.register_key(format!("{METRIC_PREFIX}.probers.{name_ts}.meta.round_duration"));

    // the unprobed slot stays on this sentinel and is never flushed
    let mut probe_cnt = [KeyId::MAX; ProbeType::COUNT];
    let mut completed_probe_cnt = [KeyId::MAX; ProbeType::COUNT];
    let mut responsive_probe_cnt = [KeyId::MAX; ProbeType::COUNT];
    for probe_type in ProbeType::PROBED {
        let type_str = probe_type.as_str();
        probe_cnt[probe_type.index()] = kp.register_key(format!(
            "{METRIC_PREFIX}.probers.{name_ts}.probing.{type_str}.probe_cnt"
        ));
        completed_probe_cnt[probe_type.index()] = kp.register_key(format!(
            "{METRIC_PREFIX}.probers.{name_ts}.probing.{type_str}.completed_probe_cnt"
        ));
        responsive_probe_cnt[probe_type.index()] = kp.register_key(format!(
            "{METRIC_PREFIX}.probers.{name_ts}.probing.{type_str}.responsive_probe_cnt"
        ));
    }

    let mut slash24_state_cnts = [KeyId::MAX; BeliefState::COUNT];
    for state in BeliefState::ALL {
        slash24_state_cnts[state.index()] = kp.register_key(format!(
            "{METRIC_PREFIX}.probers.{name_ts}.states.{}_slash24_cnt",
            state.as_str()
        ));
    }

    let slash24_cnt = kp.register_key(format!("{METRIC_PREFIX}.probers.{name_ts}.slash24_cnt"));

    AggrMetrics {
        round_id,
        round_duration,
        probe_cnt,
        completed_probe_cnt,
        responsive_probe_cnt,
        slash24_state_cnts,
        slash24_cnt,
    }
}

/// Register the keys for one metric tag of one /24.
///
/// Per-block belief/state keys go into the per-/24 package and only exist
/// for leaf tags (blocks are not tracked at, say, continent granularity).
/// The per-tag aggregate state counts live in the aggregate package and are
/// shared by every block carrying the tag.
pub fn register_slash24(
    kp_slash24: &mut KeyPackage,
    kp_aggr: &mut KeyPackage,
    name_ts: &str,
    slash24_safe: &str,
    tag: &MetricTag,
) -> Slash24Metrics {
    let tag_safe = graphite_safe(&tag.name);

    let (belief, state) = if tag.leaf {
        let belief = kp_slash24.register_key(format!(
            "{METRIC_PREFIX}.{tag_safe}.probers.{name_ts}.blocks.__PFX_{slash24_safe}_24.belief"
        ));
        let state = kp_slash24.register_key(format!(
            "{METRIC_PREFIX}.{tag_safe}.probers.{name_ts}.blocks.__PFX_{slash24_safe}_24.state"
        ));
        (Some(belief), Some(state))
    } else {
        (None, None)
    };

    let mut overall = [KeyId::MAX; BeliefState::COUNT];
    for belief_state in BeliefState::ALL {
        overall[belief_state.index()] = kp_aggr.register_key(format!(
            "{METRIC_PREFIX}.{tag_safe}.probers.{name_ts}.{}_slash24_cnt",
            belief_state.as_str()
        ));
    }

    Slash24Metrics {
        belief,
        state,
        overall,
    }
}
