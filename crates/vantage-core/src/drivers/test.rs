//! # Synthetic Test Driver
//!
//! Simulates a probing transport without touching the network. Every request
//! is answered exactly once: responsive with probability
//! `(1 - unresp_targets) * (1 - unresp_probes)`, after an RTT drawn
//! uniformly from `[0, max_rtt)` and capped at the request's wait budget;
//! unresponsive requests time out and answer after the full wait. A cadence
//! timer drains all due responses in scheduled-time order, FIFO on ties.
//!
//! Config options (whitespace-separated `key=value`):
//!
//! | option | default | meaning |
//! |---|---|---|
//! | `max-rtt` | 3000 | maximum simulated RTT in ms |
//! | `unresp-probes` | 0 | % of probes that go unanswered |
//! | `unresp-targets` | 0 | % of targets that never answer |
//! | `timer-interval` | 500 | response-drain cadence in ms |
//! | `seed` | entropy | RNG seed, for reproducible runs |

use std::collections::BTreeMap;
use std::time::Duration;

use quanta::Instant;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::driver::{parse_config, DriverError, DriverWorker, ResponseYield};
use crate::probe::{ProbeReq, ProbeResp, Verdict};

const DEFAULT_MAX_RTT_MS: u64 = 3000;
const DEFAULT_TIMER_INTERVAL_MS: u64 = 500;

pub struct TestDriver {
    max_rtt: Duration,
    /// Percent of probes that go unanswered even against a live target.
    unresp_probes: u8,
    /// Percent of targets that never answer at all.
    unresp_targets: u8,
    cadence: Duration,
    rng: StdRng,
    /// Insertion counter; breaks scheduled-time ties FIFO.
    next_token: u64,
    /// Pending responses ordered by (due time, insertion order).
    pending: BTreeMap<(Instant, u64), ProbeResp>,
}

impl TestDriver {
    pub(crate) const NAME: &'static str = "test";

    pub(crate) fn from_config(config: &str) -> Result<TestDriver, DriverError> {
        let mut max_rtt_ms = DEFAULT_MAX_RTT_MS;
        let mut unresp_probes = 0u8;
        let mut unresp_targets = 0u8;
        let mut cadence_ms = DEFAULT_TIMER_INTERVAL_MS;
        let mut seed = None;

        for (key, value) in parse_config(config)? {
            match key.as_str() {
                "max-rtt" => max_rtt_ms = parse_num(&key, &value)?,
                "unresp-probes" => unresp_probes = parse_percent(&key, &value)?,
                "unresp-targets" => unresp_targets = parse_percent(&key, &value)?,
                "timer-interval" => cadence_ms = parse_num(&key, &value)?,
                "seed" => seed = Some(parse_num(&key, &value)?),
                other => {
                    return Err(DriverError::Config(format!("unknown option '{other}'")));
                }
            }
        }
        if cadence_ms == 0 {
            return Err(DriverError::Config("timer-interval must be nonzero".into()));
        }

        Ok(TestDriver {
            max_rtt: Duration::from_millis(max_rtt_ms),
            unresp_probes,
            unresp_targets,
            cadence: Duration::from_millis(cadence_ms),
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
            next_token: 0,
            pending: BTreeMap::new(),
        })
    }

    fn schedule(&mut self, req: ProbeReq, now: Instant) {
        let responsive_target = self.rng.random_range(0..100u32) >= self.unresp_targets as u32;
        let responsive_probe = self.rng.random_range(0..100u32) >= self.unresp_probes as u32;
        let wait = Duration::from_secs(req.wait as u64);

        let (delay, verdict) = if responsive_target && responsive_probe {
            let rtt_ms = if self.max_rtt.as_millis() == 0 {
                0
            } else {
                self.rng.random_range(0..self.max_rtt.as_millis() as u64)
            };
            (Duration::from_millis(rtt_ms).min(wait), Verdict::Responsive)
        } else {
            (wait, Verdict::Unresponsive)
        };

        let token = self.next_token;
        self.next_token += 1;
        self.pending.insert(
            (now + delay, token),
            ProbeResp {
                target_ip: req.target_ip,
                verdict,
            },
        );
    }

    fn drain_due(&mut self, now: Instant, out: &ResponseYield) -> Result<(), DriverError> {
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let resp = entry.remove();
            out.yield_resp(&resp)?;
        }
        Ok(())
    }
}

impl DriverWorker for TestDriver {
    fn init_thread(&mut self) -> Result<Option<Duration>, DriverError> {
        Ok(Some(self.cadence))
    }

    fn handle_req(&mut self, req: ProbeReq, _out: &ResponseYield) -> Result<(), DriverError> {
        let now = Instant::now();
        self.schedule(req, now);
        Ok(())
    }

    fn on_timer(&mut self, out: &ResponseYield) -> Result<(), DriverError> {
        self.drain_due(Instant::now(), out)
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64, DriverError> {
    value
        .parse()
        .map_err(|_| DriverError::Config(format!("option '{key}' expects a number, got '{value}'")))
}

fn parse_percent(key: &str, value: &str) -> Result<u8, DriverError> {
    let pct: u8 = value.parse().map_err(|_| {
        DriverError::Config(format!("option '{key}' expects 0-100, got '{value}'"))
    })?;
    if pct > 100 {
        return Err(DriverError::Config(format!(
            "option '{key}' expects 0-100, got '{value}'"
        )));
    }
    Ok(pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn yielder() -> (ResponseYield, crossbeam_channel::Receiver<crate::wire::Frame>) {
        let (tx, rx) = unbounded();
        (ResponseYield::from_sender(tx), rx)
    }

    fn drain(drv: &mut TestDriver, at: Instant) -> Vec<ProbeResp> {
        let (out, rx) = yielder();
        drv.drain_due(at, &out).unwrap();
        rx.try_iter()
            .map(|frame| crate::wire::decode_resp(&frame).unwrap())
            .collect()
    }

    fn req(ip: u32, wait: u8) -> ProbeReq {
        ProbeReq {
            target_ip: ip,
            wait,
        }
    }

    #[test]
    fn defaults_apply_with_empty_config() {
        let drv = TestDriver::from_config("").unwrap();
        assert_eq!(drv.max_rtt, Duration::from_millis(DEFAULT_MAX_RTT_MS));
        assert_eq!(drv.cadence, Duration::from_millis(DEFAULT_TIMER_INTERVAL_MS));
        assert_eq!(drv.unresp_probes, 0);
        assert_eq!(drv.unresp_targets, 0);
    }

    #[test]
    fn config_rejects_out_of_range_percent() {
        assert!(matches!(
            TestDriver::from_config("unresp-probes=101"),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn config_rejects_unknown_option() {
        assert!(matches!(
            TestDriver::from_config("bogus=1"),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn fully_unresponsive_targets_never_answer_positively() {
        let mut drv = TestDriver::from_config("unresp-targets=100 seed=1").unwrap();
        let now = Instant::now();
        for i in 0..20 {
            drv.schedule(req(i, 0), now);
        }
        let resps = drain(&mut drv, now + Duration::from_secs(10));
        assert_eq!(resps.len(), 20);
        assert!(resps.iter().all(|r| r.verdict == Verdict::Unresponsive));
    }

    #[test]
    fn fully_responsive_targets_always_answer() {
        let mut drv = TestDriver::from_config("max-rtt=5 seed=1").unwrap();
        let now = Instant::now();
        for i in 0..20 {
            drv.schedule(req(i, 1), now);
        }
        let resps = drain(&mut drv, now + Duration::from_secs(10));
        assert_eq!(resps.len(), 20);
        assert!(resps.iter().all(|r| r.verdict == Verdict::Responsive));
    }

    #[test]
    fn responses_come_out_in_scheduled_time_order() {
        let mut drv = TestDriver::from_config("unresp-targets=100 seed=7").unwrap();
        let now = Instant::now();
        // Later-scheduled but shorter-wait probes must overtake.
        drv.schedule(req(1, 3), now);
        drv.schedule(req(2, 1), now);
        drv.schedule(req(3, 2), now);
        let resps = drain(&mut drv, now + Duration::from_secs(10));
        let order: Vec<u32> = resps.iter().map(|r| r.target_ip).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn ties_break_in_fifo_order() {
        let mut drv = TestDriver::from_config("unresp-targets=100 seed=7").unwrap();
        let now = Instant::now();
        for i in 0..10 {
            drv.schedule(req(i, 1), now);
        }
        let resps = drain(&mut drv, now + Duration::from_secs(10));
        let order: Vec<u32> = resps.iter().map(|r| r.target_ip).collect();
        assert_eq!(order, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn undue_responses_stay_queued() {
        let mut drv = TestDriver::from_config("unresp-targets=100 seed=7").unwrap();
        let now = Instant::now();
        drv.schedule(req(1, 200), now);
        assert!(drain(&mut drv, now + Duration::from_secs(1)).is_empty());
        assert_eq!(drv.pending.len(), 1);
    }

    #[test]
    fn rtt_is_capped_at_wait() {
        // max-rtt far above the wait budget: every responsive answer must
        // still be due within `wait` of scheduling.
        let mut drv = TestDriver::from_config("max-rtt=60000 seed=3").unwrap();
        let now = Instant::now();
        for i in 0..20 {
            drv.schedule(req(i, 1), now);
        }
        let resps = drain(&mut drv, now + Duration::from_secs(1));
        assert_eq!(resps.len(), 20, "all responses should be due within wait");
    }
}
