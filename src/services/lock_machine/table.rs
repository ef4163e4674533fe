//! Transition table: (state, trigger) -> (next state, effect)
//!
//! Pure data. Anything not listed here is ignored by the machine.

use crate::domain::types::LockState;
use std::fmt;

/// Events the evaluator derives from timing or from a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    IdleObserved,
    ActivityObserved,
    LockDelayElapsed,
    InputWhileLocked,
    PatternAccepted,
    PatternRejected,
    AttemptsExhausted,
    ChallengeAborted,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::IdleObserved => "idle_observed",
            Trigger::ActivityObserved => "activity_observed",
            Trigger::LockDelayElapsed => "lock_delay_elapsed",
            Trigger::InputWhileLocked => "input_while_locked",
            Trigger::PatternAccepted => "pattern_accepted",
            Trigger::PatternRejected => "pattern_rejected",
            Trigger::AttemptsExhausted => "attempts_exhausted",
            Trigger::ChallengeAborted => "challenge_aborted",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect executed while taking a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    DispatchLock,
    PresentChallenge,
    ResetAttempts,
    CountAttempt,
    ApplyLockout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub from: LockState,
    pub trigger: Trigger,
    pub to: LockState,
    pub effect: Effect,
}

const fn rule(from: LockState, trigger: Trigger, to: LockState, effect: Effect) -> Rule {
    Rule { from, trigger, to, effect }
}

pub const TRANSITIONS: &[Rule] = &[
    rule(LockState::Active, Trigger::IdleObserved, LockState::Grace, Effect::None),
    rule(LockState::Grace, Trigger::ActivityObserved, LockState::Active, Effect::ResetAttempts),
    rule(LockState::Grace, Trigger::LockDelayElapsed, LockState::Locked, Effect::DispatchLock),
    rule(LockState::Locked, Trigger::InputWhileLocked, LockState::Authenticating, Effect::PresentChallenge),
    rule(LockState::Authenticating, Trigger::PatternAccepted, LockState::Active, Effect::ResetAttempts),
    rule(LockState::Authenticating, Trigger::PatternRejected, LockState::Authenticating, Effect::CountAttempt),
    rule(LockState::Authenticating, Trigger::AttemptsExhausted, LockState::Locked, Effect::ApplyLockout),
    rule(LockState::Authenticating, Trigger::ChallengeAborted, LockState::Locked, Effect::None),
];

pub fn lookup(from: LockState, trigger: Trigger) -> Option<&'static Rule> {
    TRANSITIONS.iter().find(|r| r.from == from && r.trigger == trigger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_no_duplicate_keys() {
        for (i, a) in TRANSITIONS.iter().enumerate() {
            for b in &TRANSITIONS[i + 1..] {
                assert!(
                    !(a.from == b.from && a.trigger == b.trigger),
                    "duplicate rule for {:?} + {}",
                    a.from,
                    a.trigger
                );
            }
        }
    }

    #[test]
    fn test_every_entry_into_active_resets_attempts() {
        for r in TRANSITIONS.iter().filter(|r| r.to == LockState::Active) {
            assert_eq!(r.effect, Effect::ResetAttempts, "{:?} + {}", r.from, r.trigger);
        }
    }

    #[test]
    fn test_lookup() {
        let r = lookup(LockState::Grace, Trigger::LockDelayElapsed).unwrap();
        assert_eq!(r.to, LockState::Locked);
        assert_eq!(r.effect, Effect::DispatchLock);
        assert!(lookup(LockState::Active, Trigger::PatternAccepted).is_none());
        assert!(lookup(LockState::Locked, Trigger::LockDelayElapsed).is_none());
    }
}
