//! # Belief Engine
//!
//! Pure logic — no I/O. Maintains the Bayesian "is this /24 up" belief for a
//! block given probe outcomes and the block's average expected response rate
//! `A(E(b))`, classifies belief into up/down/uncertain, and decides whether a
//! probe outcome warrants a follow-up probe (adaptive or recovery) under the
//! per-slice budgets.
//!
//! Beliefs are `f64` clamped to `[0.01, 0.99]` after every update so a block
//! can always be argued back out of either extreme.

use once_cell::sync::Lazy;

/// How often we expect background packet loss.
pub const PACKET_LOSS_FREQUENCY: f64 = 0.01;

/// Lower clamp applied to belief after every update.
pub const BELIEF_MIN: f64 = 0.01;

/// Upper clamp applied to belief after every update.
pub const BELIEF_MAX: f64 = 0.99;

/// A block with belief above this is classified UP.
pub const BELIEF_UP_FRAC: f64 = 0.9;

/// A block with belief below this is classified DOWN.
pub const BELIEF_DOWN_FRAC: f64 = 0.1;

/// Belief assigned to a freshly loaded /24.
pub const INITIAL_BELIEF: f64 = 0.99;

/// Adaptive probes allowed per /24 per slice.
pub const ADAPTIVE_PROBE_BUDGET: u8 = 14;

/// `rounds_since_up` wraps back to this once it saturates, so recovery
/// probing keeps firing every 16th round indefinitely.
pub const RECOVERY_BACKOFF_MAX: u8 = 16;

/// Discretized belief state of a /24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeliefState {
    Uncertain = 0,
    Down = 1,
    Up = 2,
}

impl BeliefState {
    /// Number of belief states (for counter arrays).
    pub const COUNT: usize = 3;

    /// All states, in index order.
    pub const ALL: [BeliefState; 3] =
        [BeliefState::Uncertain, BeliefState::Down, BeliefState::Up];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BeliefState::Uncertain => "uncertain",
            BeliefState::Down => "down",
            BeliefState::Up => "up",
        }
    }
}

/// Classify a belief value by the 0.9 / 0.1 thresholds.
pub fn classify(belief: f64) -> BeliefState {
    if belief < BELIEF_DOWN_FRAC {
        BeliefState::Down
    } else if belief > BELIEF_UP_FRAC {
        BeliefState::Up
    } else {
        BeliefState::Uncertain
    }
}

/// Update the belief that a block is up given one probe outcome.
///
/// `aeb` is the block's average expected response rate: the probability of a
/// positive response from a sampled host given the block is actually up. A
/// positive response while the block is down can still happen at the
/// background loss-adjusted rate of one host in 256.
pub fn update_belief(aeb: f64, belief_up: f64, responsive: bool) -> f64 {
    let bu = belief_up;
    let bd = 1.0 - bu;

    // P(p|~U): positive response from a down block
    let p_pos_down = (1.0 - PACKET_LOSS_FREQUENCY) / crate::probe::SLASH24_HOST_CNT as f64;
    // P(p|U)
    let p_pos_up = aeb;
    // P(n|U), P(n|~U)
    let p_neg_up = 1.0 - p_pos_up;
    let p_neg_down = 1.0 - p_pos_down;

    let new_belief_down = if responsive {
        (p_pos_down * bd) / ((p_pos_down * bd) + (p_pos_up * bu))
    } else {
        (p_neg_down * bd) / ((p_neg_down * bd) + (p_neg_up * bu))
    };

    1.0 - new_belief_down.clamp(BELIEF_MIN, BELIEF_MAX)
}

/// Did this update move the block toward uncertainty?
///
/// True when the new belief classifies UNCERTAIN outright, or when an UP
/// block lost belief, or a DOWN block gained belief.
pub fn becoming_uncertain(old: f64, new: f64) -> bool {
    classify(new) == BeliefState::Uncertain
        || (classify(old) == BeliefState::Up && old > new)
        || (classify(old) == BeliefState::Down && new > old)
}

/// Is a DOWN block eligible for recovery probing this round?
///
/// Recovery probing backs off exponentially: every round for the first four
/// rounds down, once at round eight, then every sixteenth round.
pub fn recovery_eligible(rounds_since_up: u8) -> bool {
    rounds_since_up <= 4 || rounds_since_up == 8 || rounds_since_up % 16 == 0
}

/// Recovery probes allowed per round, by `floor(aeb * 100)`.
///
/// Entry `k` is the smallest probe count reaching an 80% chance of at least
/// one response from an up block with `aeb = k/100`. Blocks with aeb below
/// 0.10 are too unresponsive for recovery probing to be worthwhile (`-1`).
static RECOVERY_PROBE_CNT: Lazy<[i8; 100]> = Lazy::new(|| {
    let mut table = [-1i8; 100];
    for (k, entry) in table.iter_mut().enumerate().skip(10) {
        let aeb = k as f64 / 100.0;
        *entry = (0.2f64.ln() / (1.0 - aeb).ln()).ceil() as i8;
    }
    table
});

/// Per-round recovery probe budget for a block with the given `aeb`.
///
/// Zero means recovery probing is disabled for the block.
pub fn recovery_probe_budget(aeb: f64) -> u8 {
    let idx = ((aeb * 100.0) as usize).min(99);
    RECOVERY_PROBE_CNT[idx].max(0) as u8
}

/// Follow-up decided for a handled probe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Queue an adaptive probe (belief is moving toward uncertainty).
    Adaptive,
    /// Queue a recovery probe (block is down and due for a recovery attempt).
    Recovery,
    /// Stop probing this block until the next round.
    Settle,
}

/// Outcome of the probe policy: what to do next, and the belief to persist
/// (forced to 0.5 when adaptive probing was wanted but the budget ran out
/// and the belief would not otherwise classify UNCERTAIN).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyDecision {
    pub action: ProbeAction,
    pub belief: f64,
}

/// Decide what follows a belief update.
pub fn next_probe_action(
    prev_belief: f64,
    new_belief: f64,
    adaptive_budget: u8,
    recovery_budget: u8,
    rounds_since_up: u8,
) -> PolicyDecision {
    if becoming_uncertain(prev_belief, new_belief) {
        if adaptive_budget > 0 {
            return PolicyDecision {
                action: ProbeAction::Adaptive,
                belief: new_belief,
            };
        }
        // Out of adaptive probes: give up on converging this slice. If the
        // belief would still claim a definite state, refuse to commit to it.
        let belief = if classify(new_belief) != BeliefState::Uncertain {
            0.5
        } else {
            new_belief
        };
        return PolicyDecision {
            action: ProbeAction::Settle,
            belief,
        };
    }

    if classify(prev_belief) == BeliefState::Down
        && classify(new_belief) == BeliefState::Down
        && recovery_eligible(rounds_since_up)
        && recovery_budget > 0
    {
        return PolicyDecision {
            action: ProbeAction::Recovery,
            belief: new_belief,
        };
    }

    PolicyDecision {
        action: ProbeAction::Settle,
        belief: new_belief,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Classification ─────────────────────────────────────────────────

    #[test]
    fn classify_thresholds() {
        assert_eq!(classify(0.95), BeliefState::Up);
        assert_eq!(classify(0.9), BeliefState::Uncertain);
        assert_eq!(classify(0.5), BeliefState::Uncertain);
        assert_eq!(classify(0.1), BeliefState::Uncertain);
        assert_eq!(classify(0.05), BeliefState::Down);
    }

    #[test]
    fn initial_belief_classifies_up() {
        assert_eq!(classify(INITIAL_BELIEF), BeliefState::Up);
    }

    // ─── Belief update ──────────────────────────────────────────────────

    #[test]
    fn belief_stays_clamped_under_repeated_updates() {
        for &aeb in &[0.05, 0.3, 0.5, 0.9, 1.0] {
            let mut belief = INITIAL_BELIEF;
            for i in 0..1000 {
                belief = update_belief(aeb, belief, i % 3 == 0);
                assert!(
                    (BELIEF_MIN..=BELIEF_MAX).contains(&belief),
                    "belief {belief} escaped clamp for aeb {aeb}"
                );
            }
        }
    }

    #[test]
    fn negative_responses_drive_belief_down() {
        let mut belief = INITIAL_BELIEF;
        for _ in 0..10 {
            belief = update_belief(0.5, belief, false);
        }
        assert_eq!(classify(belief), BeliefState::Down);
        assert!(belief >= BELIEF_MIN);
    }

    #[test]
    fn positive_responses_drive_belief_up() {
        let mut belief = 0.05;
        for _ in 0..5 {
            belief = update_belief(0.5, belief, true);
        }
        assert_eq!(classify(belief), BeliefState::Up);
        assert!(belief <= BELIEF_MAX);
    }

    #[test]
    fn positive_response_at_ceiling_is_stable() {
        let belief = update_belief(0.5, BELIEF_MAX, true);
        assert!((belief - BELIEF_MAX).abs() < 1e-12);
    }

    #[test]
    fn two_step_update_matches_closed_form() {
        // One negative then one positive response from the initial belief,
        // against the closed-form composition of the two Bayes steps.
        let aeb = 0.5;
        let p_pos_down = (1.0 - PACKET_LOSS_FREQUENCY) / 256.0;
        let p_neg_down = 1.0 - p_pos_down;
        let p_neg_up = 1.0 - aeb;

        let bd0: f64 = 1.0 - INITIAL_BELIEF;
        let bu0: f64 = INITIAL_BELIEF;
        let bd1 = (p_neg_down * bd0) / ((p_neg_down * bd0) + (p_neg_up * bu0));
        let bd1 = bd1.clamp(BELIEF_MIN, BELIEF_MAX);
        let bu1 = 1.0 - bd1;
        let bd2 = (p_pos_down * bd1) / ((p_pos_down * bd1) + (aeb * bu1));
        let expected = 1.0 - bd2.clamp(BELIEF_MIN, BELIEF_MAX);

        let stepped = update_belief(aeb, update_belief(aeb, INITIAL_BELIEF, false), true);
        assert!(
            (stepped - expected).abs() < 1e-6,
            "stepped {stepped} vs closed form {expected}"
        );
    }

    // ─── Becoming uncertain ─────────────────────────────────────────────

    #[test]
    fn up_block_losing_belief_is_becoming_uncertain() {
        assert!(becoming_uncertain(0.99, 0.97));
    }

    #[test]
    fn down_block_gaining_belief_is_becoming_uncertain() {
        assert!(becoming_uncertain(0.02, 0.05));
    }

    #[test]
    fn steady_up_block_is_not_becoming_uncertain() {
        assert!(!becoming_uncertain(0.99, 0.99));
        assert!(!becoming_uncertain(0.95, 0.99));
    }

    #[test]
    fn steady_down_block_is_not_becoming_uncertain() {
        assert!(!becoming_uncertain(0.05, 0.02));
    }

    #[test]
    fn landing_in_uncertain_band_is_becoming_uncertain() {
        assert!(becoming_uncertain(0.05, 0.5));
        assert!(becoming_uncertain(0.99, 0.5));
    }

    // ─── Recovery schedule & budget ─────────────────────────────────────

    #[test]
    fn recovery_eligibility_backs_off() {
        for r in 0..=4u8 {
            assert!(recovery_eligible(r), "round {r} should be eligible");
        }
        assert!(!recovery_eligible(5));
        assert!(!recovery_eligible(7));
        assert!(recovery_eligible(8));
        assert!(!recovery_eligible(9));
        assert!(recovery_eligible(16));
        assert!(!recovery_eligible(17));
        assert!(recovery_eligible(32));
    }

    #[test]
    fn recovery_budget_disabled_below_ten_percent() {
        assert_eq!(recovery_probe_budget(0.0), 0);
        assert_eq!(recovery_probe_budget(0.05), 0);
        assert_eq!(recovery_probe_budget(0.099), 0);
    }

    #[test]
    fn recovery_budget_spot_values() {
        // ceil(ln 0.2 / ln(1 - aeb))
        assert_eq!(recovery_probe_budget(0.10), 16);
        assert_eq!(recovery_probe_budget(0.25), 6);
        assert_eq!(recovery_probe_budget(0.50), 3);
        assert_eq!(recovery_probe_budget(0.99), 1);
        assert_eq!(recovery_probe_budget(1.0), 1);
    }

    #[test]
    fn recovery_budget_reaches_eighty_percent_confidence() {
        // Mid-bucket lookups avoid floating-point wobble at bucket edges.
        for k in 10..100 {
            let bucket = k as f64 / 100.0;
            let n = recovery_probe_budget(bucket + 0.005) as i32;
            assert!(
                (1.0 - bucket).powi(n) <= 0.2 + 1e-9,
                "bucket {bucket}: {n} probes miss the 80% target"
            );
            assert!(
                n == 1 || (1.0 - bucket).powi(n - 1) > 0.2,
                "bucket {bucket}: {n} probes is not minimal"
            );
        }
    }

    // ─── Probe policy ───────────────────────────────────────────────────

    #[test]
    fn policy_prefers_adaptive_while_budget_remains() {
        let d = next_probe_action(0.99, 0.97, 5, 3, 0);
        assert_eq!(d.action, ProbeAction::Adaptive);
        assert!((d.belief - 0.97).abs() < 1e-12);
    }

    #[test]
    fn policy_forces_uncertain_when_adaptive_budget_exhausted() {
        // UP block dropped straight into DOWN territory with nothing left to
        // double-check: refuse the definite answer.
        let d = next_probe_action(0.95, 0.05, 0, 3, 0);
        assert_eq!(d.action, ProbeAction::Settle);
        assert!((d.belief - 0.5).abs() < 1e-12);
        assert_eq!(classify(d.belief), BeliefState::Uncertain);
    }

    #[test]
    fn policy_keeps_uncertain_belief_unforced() {
        let d = next_probe_action(0.95, 0.5, 0, 3, 0);
        assert_eq!(d.action, ProbeAction::Settle);
        assert!((d.belief - 0.5).abs() < 1e-12);
    }

    #[test]
    fn policy_recovers_down_blocks_on_schedule() {
        let d = next_probe_action(0.02, 0.015, 5, 3, 2);
        assert_eq!(d.action, ProbeAction::Recovery);
    }

    #[test]
    fn policy_skips_recovery_when_backoff_says_wait() {
        let d = next_probe_action(0.02, 0.015, 5, 3, 6);
        assert_eq!(d.action, ProbeAction::Settle);
    }

    #[test]
    fn policy_skips_recovery_without_budget() {
        let d = next_probe_action(0.02, 0.015, 5, 0, 2);
        assert_eq!(d.action, ProbeAction::Settle);
    }

    #[test]
    fn policy_settles_steady_up_block() {
        let d = next_probe_action(0.99, 0.99, 14, 3, 0);
        assert_eq!(d.action, ProbeAction::Settle);
        assert!((d.belief - 0.99).abs() < 1e-12);
    }
}
