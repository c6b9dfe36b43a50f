//! # Probelist Generations
//!
//! A [`ProbelistState`] bundles everything that lives and dies with one
//! probelist generation: the probelist itself, the two key packages its
//! metrics are registered in, the aggregate metric handles and the round
//! statistics. Reloads build a whole new generation (on the loader thread)
//! and the scheduler swaps it in at a round boundary.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use tracing::{info, warn};

use vantage_core::belief::BeliefState;
use vantage_core::probelist::{Probelist, Slash24State};
use vantage_timeseries::{KeyPackage, Sink};

use crate::metrics::{self, AggrMetrics};
use crate::stats::RoundStats;

/// How long to wait between key-resolution attempts.
const RESOLVE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// One probelist generation with its metrics and statistics.
pub struct ProbelistState {
    // Debug impl is manual (below) since `KeyPackage` holds a `dyn Sink`.
    pub pl: Probelist,
    /// Per-/24 belief/state keys.
    pub kp_slash24: KeyPackage,
    /// Aggregate and per-tag keys.
    pub kp_aggr: KeyPackage,
    pub metrics: AggrMetrics,
    pub stats: RoundStats,
}

impl std::fmt::Debug for ProbelistState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbelistState")
            .field("metrics", &self.metrics)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ProbelistState {
    /// Load a probelist file and build the full generation: parse, register
    /// every metric key, create per-/24 state (initially believed UP), and
    /// resolve all keys with the backends (retrying forever, ten seconds
    /// apart, unless `shutdown` is raised).
    pub fn build(
        path: &Path,
        name_ts: &str,
        ts_slash24: Arc<dyn Sink>,
        ts_aggr: Arc<dyn Sink>,
        shutdown: &AtomicBool,
    ) -> anyhow::Result<ProbelistState> {
        let mut pl = Probelist::from_path(path)
            .with_context(|| format!("could not load probelist {}", path.display()))?;
        ensure!(!pl.is_empty(), "probelist contains no /24s");

        let mut kp_slash24 = KeyPackage::new(ts_slash24);
        let mut kp_aggr = KeyPackage::new(ts_aggr);
        let metrics = metrics::register_aggr(&mut kp_aggr, name_ts);
        let mut stats = RoundStats::new();

        let nets: Vec<u32> = pl.nets().collect();
        for net in nets {
            let (aeb, handles) = {
                let s24 = pl
                    .slash24(net)
                    .with_context(|| format!("missing /24 {}", Ipv4Addr::from(net)))?;
                let slash24_safe = metrics::graphite_safe(&Ipv4Addr::from(net).to_string());
                let handles: Vec<_> = s24
                    .tags
                    .iter()
                    .map(|tag| {
                        metrics::register_slash24(
                            &mut kp_slash24,
                            &mut kp_aggr,
                            name_ts,
                            &slash24_safe,
                            tag,
                        )
                    })
                    .collect();
                (s24.aeb, handles)
            };

            // every block starts out believed UP
            for handle in &handles {
                let key = handle.overall[BeliefState::Up.index()];
                let current = kp_aggr.get(key);
                kp_aggr.set(key, current + 1);
            }
            stats.slash24_state_cnts[BeliefState::Up.index()] += 1;
            stats.slash24_cnt += 1;

            pl.set_state(net, Slash24State::new(aeb, handles));
        }

        resolve_retrying(&kp_slash24, "per-/24", shutdown)?;
        resolve_retrying(&kp_aggr, "aggregate", shutdown)?;

        info!(
            slash24_cnt = pl.len(),
            version = pl.version(),
            "probelist ready"
        );

        Ok(ProbelistState {
            pl,
            kp_slash24,
            kp_aggr,
            metrics,
            stats,
        })
    }
}

fn resolve_retrying(
    kp: &KeyPackage,
    kind: &str,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    info!(keys = kp.len(), kind, "resolving timeseries keys");
    loop {
        match kp.resolve_all() {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(error = %e, kind, "could not resolve timeseries keys, retrying");
            }
        }
        let deadline = Instant::now() + RESOLVE_RETRY_DELAY;
        while Instant::now() < deadline {
            ensure!(
                !shutdown.load(Ordering::Relaxed),
                "interrupted while resolving timeseries keys"
            );
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}
