//! # Prober
//!
//! The scheduler thread owns everything: the active probelist generation,
//! the drivers, and a single reactor loop multiplexing the slice timer with
//! every driver's response channel. Each slice tick queues one periodic
//! probe for the next `slice_size` blocks; each response updates the
//! block's belief and may trigger an adaptive or recovery follow-up within
//! the per-slice budgets. Aggregates are flushed at round boundaries,
//! aligned to the round duration on the wall clock.
//!
//! Drivers, the reload loader and the signal handlers run on other threads,
//! but all of them talk to the scheduler through channels or atomic flags;
//! probelist state is never shared across threads.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, ensure, Context};
use crossbeam_channel::{tick, Receiver, Select};
use tracing::{debug, info, warn};

use vantage_core::belief::{self, BeliefState, ProbeAction};
use vantage_core::driver::{Driver, QueueOutcome, DRIVER_MAX_CNT};
use vantage_core::probe::{ProbeReq, ProbeResp, ProbeType, Verdict, SLASH24_NETMASK};
use vantage_core::wire;
use vantage_timeseries::Sink;

use crate::metrics::graphite_safe;
use crate::reload::ReloadController;
use crate::state::ProbelistState;

/// Driver started when none is configured.
pub const DEFAULT_DRIVER: (&str, &str) = ("test", "");

/// Skip a slice when more than this many slices' worth of probes are still
/// outstanding with the drivers.
const OUTSTANDING_SLICE_FACTOR: u64 = 5;

/// Slice intervals below this suggest a misconfigured round.
const MIN_SLICE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct ProberParams {
    /// Duration of one probing round in milliseconds.
    pub round_duration_ms: u64,
    /// Number of slices the round is divided into.
    pub slice_count: u32,
    /// Stop after this many rounds (`None` = run forever).
    pub round_limit: Option<u32>,
    /// Per-probe wait timeout handed to drivers, in seconds.
    pub probe_timeout_s: u8,
    /// Sleep at startup so rounds align with the round duration.
    pub sleep_align_start: bool,
}

impl Default for ProberParams {
    fn default() -> ProberParams {
        ProberParams {
            round_duration_ms: 600_000,
            slice_count: 60,
            round_limit: None,
            probe_timeout_s: 3,
            sleep_align_start: true,
        }
    }
}

enum Tick {
    Continue,
    Shutdown,
}

enum Event {
    Tick,
    Resp(ProbeResp),
    DriverGone(usize),
    Idle,
}

pub struct Prober {
    name_ts: String,
    params: ProberParams,
    active: ProbelistState,
    reload: ReloadController,
    drivers: Vec<Driver>,
    /// Round-robin cursor over `drivers`.
    drivers_next: usize,
    outstanding_probe_cnt: u64,
    slice_size: usize,
    current_slice: u64,
    probing_started: bool,
    shutdown: Arc<AtomicBool>,
    reload_request: Arc<AtomicBool>,
}

impl Prober {
    pub fn new(
        name: &str,
        probelist_path: impl Into<PathBuf>,
        ts_slash24: Arc<dyn Sink>,
        ts_aggr: Arc<dyn Sink>,
        params: ProberParams,
    ) -> anyhow::Result<Prober> {
        ensure!(params.slice_count > 0, "slice count must be nonzero");
        ensure!(
            params.round_duration_ms >= params.slice_count as u64,
            "round duration too short for {} slices",
            params.slice_count
        );

        let name_ts = graphite_safe(name);
        let probelist_path = probelist_path.into();
        let shutdown = Arc::new(AtomicBool::new(false));

        let active = ProbelistState::build(
            &probelist_path,
            &name_ts,
            Arc::clone(&ts_slash24),
            Arc::clone(&ts_aggr),
            &shutdown,
        )?;

        let reload = ReloadController::new(
            probelist_path,
            name_ts.clone(),
            ts_slash24,
            ts_aggr,
            Arc::clone(&shutdown),
        );

        let slice_size = slice_size(active.pl.len(), params.slice_count);
        info!(slice_size, "periodic probing slice size");

        Ok(Prober {
            name_ts,
            params,
            active,
            reload,
            drivers: Vec::new(),
            drivers_next: 0,
            outstanding_probe_cnt: 0,
            slice_size,
            current_slice: 0,
            probing_started: false,
            shutdown,
            reload_request: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Prober name as it appears in metric paths.
    pub fn name(&self) -> &str {
        &self.name_ts
    }

    /// Flag that stops the reactor at its next event boundary.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Flag that schedules a probelist reload (raised from SIGHUP).
    pub fn reload_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reload_request)
    }

    /// Start a driver and add it to the probing pool.
    pub fn add_driver(&mut self, name: &str, config: &str) -> anyhow::Result<()> {
        ensure!(
            self.drivers.len() < DRIVER_MAX_CNT,
            "too many drivers (max {DRIVER_MAX_CNT})"
        );
        let driver = Driver::create(name, config)
            .with_context(|| format!("could not start driver '{name}'"))?;
        self.drivers.push(driver);
        info!(driver = name, driver_cnt = self.drivers.len(), "driver started");
        Ok(())
    }

    /// Current belief and state of a /24, if it is in the active probelist.
    pub fn slash24_belief(&self, network_ip: u32) -> Option<(f64, BeliefState)> {
        self.active
            .pl
            .state(network_ip)
            .map(|s| (s.current_belief, s.current_state))
    }

    /// Number of /24s in the active probelist.
    pub fn slash24_cnt(&self) -> usize {
        self.active.pl.len()
    }

    /// Run the prober until shutdown or the round limit.
    pub fn run(&mut self) -> anyhow::Result<()> {
        if self.drivers.is_empty() {
            let (name, config) = DEFAULT_DRIVER;
            self.add_driver(name, config)?;
        }

        let slice_interval = self.params.round_duration_ms / self.params.slice_count as u64;
        if slice_interval < MIN_SLICE_INTERVAL_MS {
            warn!(slice_interval_ms = slice_interval, "slice timer fires very frequently");
        }

        if self.params.sleep_align_start {
            self.sleep_align_start();
        }
        if self.shutdown.load(Ordering::Relaxed) {
            info!("interrupted during startup alignment, shutting down");
            self.stop_drivers();
            return Ok(());
        }

        info!("prober up and running");
        let ticker = tick(Duration::from_millis(slice_interval));

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("interrupted, shutting down");
                break;
            }
            if self.reload_request.swap(false, Ordering::Relaxed) {
                self.reload.schedule();
            }
            if let Some(dead) = self.drivers.iter().find(|d| d.is_dead()) {
                bail!("driver '{}' died unexpectedly", dead.name());
            }

            match self.next_event(&ticker) {
                Event::Idle => continue,
                Event::Tick => {
                    if let Tick::Shutdown = self.handle_slice_timer()? {
                        break;
                    }
                }
                Event::Resp(resp) => self.handle_probe_resp(resp)?,
                Event::DriverGone(idx) => {
                    bail!("driver '{}' closed its response channel", self.drivers[idx].name());
                }
            }
        }

        self.stop_drivers();
        if self.outstanding_probe_cnt > 0 {
            warn!(
                outstanding = self.outstanding_probe_cnt,
                "outstanding probes at shutdown"
            );
        }
        Ok(())
    }

    // ─── Reactor ────────────────────────────────────────────────────────

    fn next_event(&self, ticker: &Receiver<std::time::Instant>) -> Event {
        let mut sel = Select::new();
        let tick_idx = sel.recv(ticker);
        for driver in &self.drivers {
            sel.recv(driver.poll_handle());
        }

        // bounded wait so shutdown and reload flags stay responsive
        let op = match sel.select_timeout(Duration::from_millis(100)) {
            Ok(op) => op,
            Err(_) => return Event::Idle,
        };

        let idx = op.index();
        if idx == tick_idx {
            match op.recv(ticker) {
                Ok(_) => Event::Tick,
                Err(_) => Event::Idle,
            }
        } else {
            let driver_idx = idx - 1;
            match op.recv(self.drivers[driver_idx].poll_handle()) {
                Ok(frame) => match wire::decode_resp(&frame) {
                    Ok(resp) => Event::Resp(resp),
                    Err(e) => {
                        warn!(error = %e, "discarding invalid response frame");
                        Event::Idle
                    }
                },
                Err(_) => Event::DriverGone(driver_idx),
            }
        }
    }

    fn sleep_align_start(&self) {
        let duration = self.params.round_duration_ms;
        let target = (epoch_ms() / duration) * duration + duration;
        info!(
            seconds = (target.saturating_sub(epoch_ms())) / 1000,
            "sleeping to align with round duration"
        );
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = epoch_ms();
            if now >= target {
                break;
            }
            thread::sleep(Duration::from_millis((target - now).min(200)));
        }
    }

    fn stop_drivers(&mut self) {
        for driver in &mut self.drivers {
            driver.destroy();
        }
        self.drivers.clear();
    }

    // ─── Slice timer ────────────────────────────────────────────────────

    /// Queue the next slice of periodic probes, handling round boundaries,
    /// probelist swaps and the round limit on the way.
    fn handle_slice_timer(&mut self) -> anyhow::Result<Tick> {
        let slices = self.params.slice_count as u64;
        let probing_round = self.current_slice / slices;
        let now = epoch_ms();

        self.reload.spawn_if_scheduled();

        if !self.probing_started || !self.active.pl.has_more() {
            // mid-round exhaustion happens when the probelist is smaller
            // than the slice count; idle until the round boundary
            if self.current_slice % slices != 0 {
                debug!(round = probing_round, "no /24s left to probe in round");
                self.current_slice += 1;
                return Ok(Tick::Continue);
            }

            if probing_round > 0 {
                info!(round = probing_round - 1, "ending round");
                if let Err(e) = self.end_of_round(probing_round - 1) {
                    warn!(error = %e, "could not flush end-of-round stats");
                }
                if let Some(next) = self.reload.try_take_done() {
                    self.install_probelist(*next);
                }
            }

            if let Some(limit) = self.params.round_limit {
                if probing_round >= limit as u64 {
                    info!(limit, "round limit reached, shutting down");
                    return Ok(Tick::Shutdown);
                }
            }

            info!(round = probing_round, "starting round");
            self.active.pl.reset_iter();
            self.active.stats.reset_round(now);
            self.probing_started = true;
        }

        // several slices' worth of unanswered probes means the driver is not
        // keeping up; skip the whole slice rather than pile on
        if self.outstanding_probe_cnt > self.slice_size as u64 * OUTSTANDING_SLICE_FACTOR {
            warn!(
                outstanding = self.outstanding_probe_cnt,
                slice_size = self.slice_size,
                "outstanding requests exceed slice budget, skipping slice"
            );
            self.current_slice += 1;
            return Ok(Tick::Continue);
        }

        let mut queued_cnt = 0;
        for _ in 0..self.slice_size {
            let Some(net) = self.active.pl.next_slash24() else {
                break;
            };
            let Some(aeb) = self.active.pl.slash24(net).map(|s| s.aeb) else {
                continue;
            };
            let Some(state) = self.active.pl.state_mut(net) else {
                continue;
            };

            // an unanswered probe from last round is abandoned here; its
            // response, if it ever comes, will be dropped as stale
            if state.last_probe_type != ProbeType::Unprobed {
                debug!(
                    net = %Ipv4Addr::from(net),
                    last_probe_type = state.last_probe_type.as_str(),
                    "re-probing /24 with a probe still outstanding"
                );
                state.last_probe_type = ProbeType::Unprobed;
            }

            state.adaptive_budget = belief::ADAPTIVE_PROBE_BUDGET;
            state.recovery_budget = belief::recovery_probe_budget(aeb);
            if belief::classify(state.current_belief) == BeliefState::Up {
                state.rounds_since_up = 0;
            } else if state.rounds_since_up < u8::MAX {
                state.rounds_since_up += 1;
            } else {
                state.rounds_since_up = belief::RECOVERY_BACKOFF_MAX;
            }

            if self.queue_slash24_probe(net, ProbeType::Periodic)? == QueueOutcome::Queued {
                queued_cnt += 1;
            }
        }

        debug!(
            queued = queued_cnt,
            slice = self.current_slice,
            round = probing_round,
            outstanding = self.outstanding_probe_cnt,
            "queued periodic probes"
        );
        self.current_slice += 1;
        Ok(Tick::Continue)
    }

    // ─── Probe dispatch ─────────────────────────────────────────────────

    /// Queue one probe for the /24's current host via the next driver in
    /// the round-robin. Budgets and counters are only touched when the
    /// driver actually accepts the request; on a full driver queue the
    /// block is reset so next round retries it.
    fn queue_slash24_probe(
        &mut self,
        net: u32,
        probe_type: ProbeType,
    ) -> anyhow::Result<QueueOutcome> {
        ensure!(!self.drivers.is_empty(), "no probe drivers configured");
        let host_ip = self
            .active
            .pl
            .next_host(net)
            .with_context(|| format!("no probeable host in {}", Ipv4Addr::from(net)))?;

        let req = ProbeReq {
            target_ip: host_ip,
            wait: self.params.probe_timeout_s,
        };
        let driver_idx = self.drivers_next;
        let outcome = self.drivers[driver_idx].queue_req(&req)?;
        self.drivers_next = (self.drivers_next + 1) % self.drivers.len();

        let state = self
            .active
            .pl
            .state_mut(net)
            .with_context(|| format!("missing state for {}", Ipv4Addr::from(net)))?;

        match outcome {
            QueueOutcome::Dropped => {
                warn!(
                    target = %Ipv4Addr::from(host_ip),
                    driver = self.drivers[driver_idx].name(),
                    "driver queue full, skipping probe"
                );
                state.last_probe_type = ProbeType::Unprobed;
            }
            QueueOutcome::Queued => {
                state.last_probe_type = probe_type;
                match probe_type {
                    ProbeType::Adaptive => {
                        state.adaptive_budget = state.adaptive_budget.saturating_sub(1);
                    }
                    ProbeType::Recovery => {
                        state.recovery_budget = state.recovery_budget.saturating_sub(1);
                    }
                    ProbeType::Periodic | ProbeType::Unprobed => {}
                }
                self.active.stats.probe_cnt[probe_type.index()] += 1;
                self.outstanding_probe_cnt += 1;
            }
        }
        Ok(outcome)
    }

    // ─── Response handling ──────────────────────────────────────────────

    /// Absorb one driver response: update belief, decide on a follow-up
    /// probe, and publish the block's settled belief/state once no probe
    /// remains outstanding for it.
    pub(crate) fn handle_probe_resp(&mut self, resp: ProbeResp) -> anyhow::Result<()> {
        let net = resp.target_ip & SLASH24_NETMASK;

        // can legitimately happen right after a probelist swap
        let Some(aeb) = self.active.pl.slash24(net).map(|s| s.aeb) else {
            warn!(target = %resp.target(), "response for unknown /24, ignoring");
            return Ok(());
        };
        self.outstanding_probe_cnt = self.outstanding_probe_cnt.saturating_sub(1);

        let Some(state) = self.active.pl.state_mut(net) else {
            warn!(target = %resp.target(), "response for /24 without state, ignoring");
            return Ok(());
        };

        // stale: the block was re-probed in a newer slice, or this is a
        // duplicate delivery
        if state.last_probe_type == ProbeType::Unprobed {
            return Ok(());
        }

        let last_probe_type = state.last_probe_type;
        let responsive = resp.verdict == Verdict::Responsive;
        let prev_belief = state.current_belief;
        let new_belief = belief::update_belief(aeb, prev_belief, responsive);
        let decision = belief::next_probe_action(
            prev_belief,
            new_belief,
            state.adaptive_budget,
            state.recovery_budget,
            state.rounds_since_up,
        );

        self.active.stats.probe_complete_cnt[last_probe_type.index()] += 1;
        if responsive {
            self.active.stats.responsive_cnt[last_probe_type.index()] += 1;
        }

        match decision.action {
            ProbeAction::Adaptive => {
                self.queue_slash24_probe(net, ProbeType::Adaptive)?;
            }
            ProbeAction::Recovery => {
                self.queue_slash24_probe(net, ProbeType::Recovery)?;
            }
            ProbeAction::Settle => {
                if let Some(state) = self.active.pl.state_mut(net) {
                    state.last_probe_type = ProbeType::Unprobed;
                }
            }
        }

        // publish only once probing for the block has settled, so a block
        // mid-convergence never leaks a transient state
        let active = &mut self.active;
        let Some(state) = active.pl.state_mut(net) else {
            return Ok(());
        };
        if state.last_probe_type == ProbeType::Unprobed {
            let old_state = state.current_state;
            let new_state = belief::classify(decision.belief);

            active.stats.slash24_state_cnts[old_state.index()] =
                active.stats.slash24_state_cnts[old_state.index()].saturating_sub(1);
            active.stats.slash24_state_cnts[new_state.index()] += 1;

            for handles in &state.metrics {
                if let Some(key) = handles.belief {
                    active.kp_slash24.set(key, (decision.belief * 100.0) as u64);
                }
                if let Some(key) = handles.state {
                    active.kp_slash24.set(key, new_state.index() as u64);
                }
                let old_key = handles.overall[old_state.index()];
                let value = active.kp_aggr.get(old_key);
                active.kp_aggr.set(old_key, value.saturating_sub(1));
                let new_key = handles.overall[new_state.index()];
                let value = active.kp_aggr.get(new_key);
                active.kp_aggr.set(new_key, value + 1);
            }

            state.current_state = new_state;
        }
        state.current_belief = decision.belief;
        Ok(())
    }

    // ─── Round boundary ─────────────────────────────────────────────────

    fn end_of_round(&mut self, round_id: u64) -> anyhow::Result<()> {
        let now = epoch_ms();
        let duration = self.params.round_duration_ms;
        let aligned_start = (self.active.stats.start_time / duration) * duration;
        let active = &mut self.active;

        active.kp_aggr.set(active.metrics.round_id, round_id);
        active.kp_aggr.set(
            active.metrics.round_duration,
            now.saturating_sub(active.stats.start_time),
        );
        for probe_type in ProbeType::PROBED {
            let idx = probe_type.index();
            active
                .kp_aggr
                .set(active.metrics.probe_cnt[idx], active.stats.probe_cnt[idx] as u64);
            active.kp_aggr.set(
                active.metrics.completed_probe_cnt[idx],
                active.stats.probe_complete_cnt[idx] as u64,
            );
            active.kp_aggr.set(
                active.metrics.responsive_probe_cnt[idx],
                active.stats.responsive_cnt[idx] as u64,
            );
        }
        for state in BeliefState::ALL {
            active.kp_aggr.set(
                active.metrics.slash24_state_cnts[state.index()],
                active.stats.slash24_state_cnts[state.index()] as u64,
            );
        }
        active
            .kp_aggr
            .set(active.metrics.slash24_cnt, active.stats.slash24_cnt as u64);

        info!(
            round = round_id,
            took_ms = now.saturating_sub(active.stats.start_time),
            ideal_ms = duration,
            "round completed"
        );
        let sent = active.stats.probe_cnt[ProbeType::Periodic.index()];
        if sent > 0 {
            info!(
                responsive = active.stats.responsive_cnt[ProbeType::Periodic.index()],
                sent,
                rate_pct = (active.stats.periodic_response_rate() * 100.0).round(),
                "round periodic response rate"
            );
        }

        active.kp_aggr.flush(aligned_start / 1000)?;
        active.kp_slash24.flush(aligned_start / 1000)?;
        Ok(())
    }

    fn install_probelist(&mut self, next: ProbelistState) {
        self.active = next;
        self.slice_size = slice_size(self.active.pl.len(), self.params.slice_count);
        info!(
            slash24_cnt = self.active.pl.len(),
            version = self.active.pl.version(),
            slice_size = self.slice_size,
            "probelist updated"
        );
    }
}

/// Blocks probed per slice, rounded up so a full round covers the list.
fn slice_size(slash24_cnt: usize, slice_count: u32) -> usize {
    slash24_cnt.div_ceil(slice_count as usize)
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
