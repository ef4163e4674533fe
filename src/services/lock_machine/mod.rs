//! Lock session state machine
//!
//! The machine owns the `LockSession` and is its only mutator. It is driven
//! from a single evaluator task:
//! - `tick` compares the aggregator's last activity against the lock delay
//! - `submit_attempt` / `abort_challenge` report the outcome of a gesture
//!   challenge while AUTHENTICATING
//!
//! Which transitions exist is decided by `table::TRANSITIONS`; this module
//! only derives triggers from timing and executes effects.

mod table;

pub use table::{lookup, Effect, Rule, Trigger, TRANSITIONS};

use crate::domain::types::{LockState, LogCategory, Pattern, PlatformSetting, Timestamp};
use crate::infra::config::{Config, LockoutMode};
use crate::infra::logging::SharedSink;
use crate::infra::metrics::Metrics;
use crate::services::aggregator::ActivityAggregator;
use crate::services::credential::Credential;
use crate::services::dispatcher::{LockOutcome, SessionLocker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Settings the machine reads on every evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub lock_delay: Duration,
    pub platform: PlatformSetting,
    pub max_attempts: u32,
    pub lockout: LockoutMode,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub constant_time_compare: bool,
}

impl MachineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_delay: config.lock_delay(),
            platform: config.platform_lock(),
            max_attempts: config.max_attempts(),
            lockout: config.lockout_policy(),
            cooldown: config.lockout_cooldown(),
            max_cooldown: config.lockout_max_cooldown(),
            constant_time_compare: config.constant_time_compare(),
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            lock_delay: Duration::from_secs(10),
            platform: PlatformSetting::Auto,
            max_attempts: 3,
            lockout: LockoutMode::Rearm,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
            constant_time_compare: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSession {
    pub state: LockState,
    pub entered_at: Timestamp,
    pub attempt_count: u32,
    /// Lockouts since the last successful unlock
    pub consecutive_lockouts: u32,
    /// Input before this instant does not re-arm the challenge
    pub cooldown_until: Option<Timestamp>,
}

impl LockSession {
    fn new(now: Timestamp) -> Self {
        Self {
            state: LockState::Active,
            entered_at: now,
            attempt_count: 0,
            consecutive_lockouts: 0,
            cooldown_until: None,
        }
    }
}

/// One executed table rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LockState,
    pub to: LockState,
    pub trigger: Trigger,
    pub at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    Rejected { attempts_left: u32 },
    LockedOut { cooldown: Duration },
    /// No challenge is open
    NotChallenged,
}

pub struct LockMachine {
    config: MachineConfig,
    session: LockSession,
    aggregator: Arc<ActivityAggregator>,
    locker: Arc<dyn SessionLocker>,
    credential: Credential,
    sink: SharedSink,
    metrics: Arc<Metrics>,
    last_tick: Option<Timestamp>,
    last_outcome: Option<LockOutcome>,
}

impl LockMachine {
    pub fn new(
        config: MachineConfig,
        aggregator: Arc<ActivityAggregator>,
        locker: Arc<dyn SessionLocker>,
        credential: Credential,
        sink: SharedSink,
        metrics: Arc<Metrics>,
        now: Timestamp,
    ) -> Self {
        Self {
            config,
            session: LockSession::new(now),
            aggregator,
            locker,
            credential,
            sink,
            metrics,
            last_tick: None,
            last_outcome: None,
        }
    }

    pub fn session(&self) -> &LockSession {
        &self.session
    }

    pub fn state(&self) -> LockState {
        self.session.state
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Outcome of the most recent lock dispatch
    pub fn last_outcome(&self) -> Option<&LockOutcome> {
        self.last_outcome.as_ref()
    }

    /// Evaluate timing once; returns every transition taken
    pub async fn tick(&mut self, now: Timestamp) -> Vec<Transition> {
        let last = self.aggregator.last_activity();
        let inactivity = now.saturating_since(last);
        let previous_tick = self.last_tick.replace(now).unwrap_or(self.session.entered_at);
        let mut fired = Vec::new();

        match self.session.state {
            LockState::Active => {
                let idle = last <= previous_tick;
                if idle || inactivity >= self.config.lock_delay {
                    fired.extend(self.fire(Trigger::IdleObserved, now).await);
                    if inactivity >= self.config.lock_delay {
                        fired.extend(self.fire(Trigger::LockDelayElapsed, now).await);
                    }
                }
            }
            LockState::Grace => {
                if last >= self.session.entered_at {
                    fired.extend(self.fire(Trigger::ActivityObserved, now).await);
                } else if inactivity >= self.config.lock_delay {
                    fired.extend(self.fire(Trigger::LockDelayElapsed, now).await);
                }
            }
            LockState::Locked => {
                let armed_after = match self.session.cooldown_until {
                    Some(until) => until.max(self.session.entered_at),
                    None => self.session.entered_at,
                };
                if last > armed_after {
                    fired.extend(self.fire(Trigger::InputWhileLocked, now).await);
                }
            }
            // Capture owns the session until it reports back
            LockState::Authenticating => {}
        }

        fired
    }

    /// Verify a captured pattern against the enrolled credential
    pub async fn submit_attempt(&mut self, pattern: &Pattern, now: Timestamp) -> AttemptOutcome {
        if self.session.state != LockState::Authenticating {
            return AttemptOutcome::NotChallenged;
        }

        if self.credential.matches(pattern, self.config.constant_time_compare) {
            self.fire(Trigger::PatternAccepted, now).await;
            // A successful unlock is user presence
            self.aggregator.record_activity("unlock", now);
            self.metrics.record_unlock();
            return AttemptOutcome::Accepted;
        }

        self.metrics.record_attempt_rejected();
        self.fire(Trigger::PatternRejected, now).await;

        if self.session.attempt_count >= self.config.max_attempts {
            self.fire(Trigger::AttemptsExhausted, now).await;
            self.metrics.record_lockout();
            return AttemptOutcome::LockedOut { cooldown: self.lockout_cooldown() };
        }

        AttemptOutcome::Rejected {
            attempts_left: self.config.max_attempts - self.session.attempt_count,
        }
    }

    /// The user cancelled or the surface went away; no attempt is counted
    pub async fn abort_challenge(&mut self, now: Timestamp) -> Option<Transition> {
        self.fire(Trigger::ChallengeAborted, now).await
    }

    /// Cool-down applied by the most recent lockout
    pub fn lockout_cooldown(&self) -> Duration {
        match self.config.lockout {
            LockoutMode::Rearm => self.config.cooldown,
            LockoutMode::Escalate => {
                let doublings = self.session.consecutive_lockouts.saturating_sub(1).min(31);
                self.config
                    .cooldown
                    .saturating_mul(1u32 << doublings)
                    .min(self.config.max_cooldown)
            }
        }
    }

    async fn fire(&mut self, trigger: Trigger, now: Timestamp) -> Option<Transition> {
        let from = self.session.state;
        let Some(rule) = lookup(from, trigger) else {
            debug!(state = %from, trigger = %trigger, "lock_trigger_ignored");
            return None;
        };

        if rule.to != from {
            self.session.state = rule.to;
            self.session.entered_at = now;
        }
        self.apply_counters(rule.effect, now);
        if rule.to == LockState::Active {
            self.session.attempt_count = 0;
        }

        let transition = Transition { from, to: rule.to, trigger, at: now };
        info!(
            from = %from,
            to = %rule.to,
            trigger = %trigger,
            attempts = %self.session.attempt_count,
            "lock_transition"
        );
        self.report(&transition, now);

        match rule.effect {
            Effect::DispatchLock => self.dispatch_lock().await,
            Effect::ApplyLockout if self.config.lockout == LockoutMode::Escalate => {
                self.dispatch_lock().await
            }
            _ => {}
        }

        Some(transition)
    }

    fn apply_counters(&mut self, effect: Effect, now: Timestamp) {
        match effect {
            Effect::None | Effect::DispatchLock => {}
            Effect::ResetAttempts => {
                self.session.attempt_count = 0;
                self.session.consecutive_lockouts = 0;
                self.session.cooldown_until = None;
            }
            Effect::PresentChallenge => {
                // Fresh challenge after a lockout; a cancelled one keeps its count
                if self.session.attempt_count >= self.config.max_attempts {
                    self.session.attempt_count = 0;
                }
            }
            Effect::CountAttempt => {
                self.session.attempt_count = self.session.attempt_count.saturating_add(1);
            }
            Effect::ApplyLockout => {
                self.session.consecutive_lockouts = self.session.consecutive_lockouts.saturating_add(1);
                self.session.cooldown_until = Some(now.saturating_add(self.lockout_cooldown()));
            }
        }
    }

    async fn dispatch_lock(&mut self) {
        let outcome = self.locker.lock(self.config.platform).await;
        self.metrics.record_lock_dispatch(outcome.is_locked(), outcome.is_ambiguous());

        match &outcome {
            LockOutcome::Success { command } => {
                self.sink.record(LogCategory::Lock, &format!("Session locked with: {}", command));
            }
            LockOutcome::AmbiguousTimeout { command } => {
                self.sink.record(
                    LogCategory::Lock,
                    &format!("Lock command still running at timeout, assuming locked: {}", command),
                );
            }
            LockOutcome::NotFound => {
                self.sink.record(
                    LogCategory::Error,
                    &format!(
                        "No lock command available for platform {}; session locked logically only",
                        self.config.platform
                    ),
                );
            }
            LockOutcome::AllFailed { attempted } if attempted.is_empty() => {
                self.sink.record(
                    LogCategory::Error,
                    "No lock command installed; session locked logically only",
                );
            }
            LockOutcome::AllFailed { attempted } => {
                self.sink.record(
                    LogCategory::Error,
                    &format!(
                        "All lock commands failed ({}); session locked logically only",
                        attempted.join(", ")
                    ),
                );
            }
        }

        self.last_outcome = Some(outcome);
    }

    fn report(&self, transition: &Transition, now: Timestamp) {
        let inactivity = self.aggregator.inactivity_duration(now);
        let (category, message) = match (transition.from, transition.to) {
            (LockState::Active, LockState::Grace) => {
                let remaining = self.config.lock_delay.saturating_sub(inactivity);
                (
                    LogCategory::Absence,
                    format!("No activity, locking in {}s", remaining.as_secs_f64().ceil() as u64),
                )
            }
            (LockState::Grace, LockState::Active) => {
                (LogCategory::Presence, "Activity resumed".to_string())
            }
            (LockState::Grace, LockState::Locked) => (
                LogCategory::Lock,
                format!("Locking after {}s of inactivity", inactivity.as_secs()),
            ),
            (LockState::Locked, LockState::Authenticating) => (
                LogCategory::System,
                "Input while locked, unlock pattern required".to_string(),
            ),
            (LockState::Authenticating, LockState::Active) => {
                (LogCategory::System, "Session unlocked".to_string())
            }
            (LockState::Authenticating, LockState::Authenticating) => (
                LogCategory::Lock,
                format!(
                    "Wrong pattern (attempt {}/{})",
                    self.session.attempt_count, self.config.max_attempts
                ),
            ),
            (LockState::Authenticating, LockState::Locked)
                if transition.trigger == Trigger::AttemptsExhausted =>
            {
                (
                    LogCategory::Lock,
                    format!(
                        "Too many failed attempts, input ignored for {}s",
                        self.lockout_cooldown().as_secs()
                    ),
                )
            }
            (LockState::Authenticating, LockState::Locked) => {
                (LogCategory::System, "Unlock cancelled".to_string())
            }
            (from, to) => (LogCategory::System, format!("{} -> {}", from, to)),
        };
        self.sink.record(category, &message);
    }
}
