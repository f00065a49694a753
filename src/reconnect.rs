use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use rand::Rng as _;

use crate::config::ReconnectConfig;
use crate::scheduler::CancelToken;

/// Where the reconnection scheduler currently is.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No connection and nothing scheduled
    Idle,
    /// Waiting out a backoff delay
    Scheduled,
    /// A connect attempt has been issued and not yet resolved
    Attempting,
    /// The transport is connected
    Connected,
}

/// The reconnect sequence in progress after an unexpected disconnect or a failed attempt.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPlan {
    /// Failed attempts so far in this plan
    pub attempt: u32,
    /// Jitter-free upper bound of the current delay
    pub ceiling: Duration,
    /// Delay actually waited before the next attempt, drawn from `[0, ceiling]`
    pub next_delay: Duration,
    /// Failed attempts tolerated before giving up, `None` for unlimited
    pub max_attempts: Option<u32>,
}

/// Outcome of [`Reconnector::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retry {
    /// Run the attempt tagged `generation` after `delay`
    After { delay: Duration, generation: u64 },
    /// `max_attempts` reached, the plan was dropped
    Exhausted,
}

/// Full jitter: a uniformly random delay in `[0, ceiling]`, at millisecond resolution.
pub(crate) fn full_jitter(ceiling: Duration) -> Duration {
    let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

/// Reconnection state machine: `Idle -> Scheduled -> Attempting -> (Connected | Scheduled |
/// Idle)`.
///
/// Every issued attempt is tagged with a generation. Anything that supersedes an attempt
/// (teardown, auth halt, a newer attempt) bumps the generation, so a late task can recognise
/// itself as stale.
pub(crate) struct Reconnector {
    phase: Phase,
    plan: Option<ReconnectPlan>,
    ceilings: ExponentialBackoff,
    max_backoff: Duration,
    max_attempts: Option<u32>,
    generation: u64,
    pending: Option<CancelToken>,
    auth_halted: bool,
}

impl Reconnector {
    pub(crate) fn new(config: &ReconnectConfig) -> Self {
        Self {
            phase: Phase::Idle,
            plan: None,
            ceilings: config.clone().into(),
            max_backoff: config.max_backoff,
            max_attempts: config.max_attempts,
            generation: 0,
            pending: None,
            auth_halted: false,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn plan(&self) -> Option<&ReconnectPlan> {
        self.plan.as_ref()
    }

    pub(crate) fn is_auth_halted(&self) -> bool {
        self.auth_halted
    }

    /// True while a reconnect plan is being worked through.
    pub(crate) fn is_reconnecting(&self) -> bool {
        self.plan.is_some() && matches!(self.phase, Phase::Scheduled | Phase::Attempting)
    }

    /// True once an attempt has entered `Attempting` and its connect has not resolved yet.
    pub(crate) fn is_connecting(&self) -> bool {
        self.phase == Phase::Attempting && self.pending.is_none()
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.plan.as_ref().map_or(0, |plan| plan.attempt)
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Issues an attempt right away, superseding any scheduled one. The plan, and with it the
    /// backoff growth, survives: only a successful connect resets it.
    pub(crate) fn attempt_now(&mut self) -> u64 {
        self.supersede();
        self.auth_halted = false;
        self.phase = Phase::Attempting;
        self.generation
    }

    /// Plans the next attempt after an unexpected disconnect (`failed == false`) or a failed
    /// attempt (`failed == true`).
    pub(crate) fn retry(&mut self, failed: bool) -> Retry {
        self.supersede();

        let max_attempts = self.max_attempts;
        let plan = self.plan.get_or_insert_with(|| ReconnectPlan {
            attempt: 0,
            ceiling: Duration::ZERO,
            next_delay: Duration::ZERO,
            max_attempts,
        });
        if failed {
            plan.attempt = plan.attempt.saturating_add(1);
        }

        if let Some(max) = max_attempts
            && plan.attempt >= max
        {
            self.plan = None;
            self.ceilings.reset();
            self.phase = Phase::Idle;
            return Retry::Exhausted;
        }

        let ceiling = self.ceilings.next_backoff().unwrap_or(self.max_backoff);
        let delay = full_jitter(ceiling);
        plan.ceiling = ceiling;
        plan.next_delay = delay;
        self.phase = Phase::Scheduled;

        Retry::After {
            delay,
            generation: self.generation,
        }
    }

    /// Remembers the token of the task issued for the current generation.
    pub(crate) fn set_pending(&mut self, token: CancelToken) {
        self.pending = Some(token);
    }

    /// Moves a scheduled attempt into `Attempting`. Returns `false` for stale tasks.
    pub(crate) fn enter(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        match self.phase {
            Phase::Scheduled | Phase::Attempting => {
                self.phase = Phase::Attempting;
                self.pending = None;
                true
            }
            Phase::Idle | Phase::Connected => false,
        }
    }

    pub(crate) fn connected(&mut self) {
        self.cancel_pending();
        self.phase = Phase::Connected;
        self.plan = None;
        self.ceilings.reset();
        self.auth_halted = false;
    }

    /// Credential rejected: stop until an explicit subscribe or reconnect.
    pub(crate) fn halt_auth(&mut self) {
        self.reset();
        self.auth_halted = true;
    }

    /// Shutdown, or the last subscriber left.
    pub(crate) fn stop(&mut self) {
        self.reset();
        self.auth_halted = false;
    }

    fn reset(&mut self) {
        self.supersede();
        self.phase = Phase::Idle;
        self.plan = None;
        self.ceilings.reset();
    }

    fn supersede(&mut self) {
        self.cancel_pending();
        self.generation = self.generation.wrapping_add(1);
    }

    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}
