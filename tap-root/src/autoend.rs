// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deciding when an implicitly-ended run is over.
//!
//! An idle notification from the aggregate on its own is weak evidence that the run is done:
//! idleness is observed while more subtests may be about to be queued by work that has not had a
//! chance to run yet. So the debouncer asks for two consecutive confirmations, each one scheduling
//! turn apart, with nothing happening in between. Any idle or activity notification in the
//! meantime restarts the chain.
//!
//! The debouncer itself is a pure state machine. The timer it asks for is owned by the driver,
//! which keeps at most one of them alive at a time.

/// The state of the auto-end debouncer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AutoEndState {
    /// No confirmation is pending.
    #[default]
    Idle,

    /// Waiting for the first confirmation turn.
    PendingFirstConfirm,

    /// The first confirmation succeeded, waiting for the second.
    PendingSecondConfirm,
}

/// What the owner of the debouncer's timer should do after a transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum DebounceAction {
    /// Leave the timer alone.
    None,

    /// Drop any pending timer.
    Cancel,

    /// Drop any pending timer and start a new one for a single turn.
    Schedule,

    /// Drop any pending timer and end the aggregate implicitly. Auto-end must be disarmed
    /// afterwards.
    Finalize,
}

/// The auto-end state machine.
#[derive(Clone, Debug, Default)]
pub struct AutoEndDebouncer {
    state: AutoEndState,
}

impl AutoEndDebouncer {
    /// Creates a new debouncer in the [`AutoEndState::Idle`] state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn state(&self) -> AutoEndState {
        self.state
    }

    /// Handles an idle or activity notification.
    ///
    /// `armed` is whether auto-end is armed, and `idle` is whether the aggregate is idle right
    /// now. Whatever stage the chain was in, it starts over.
    pub fn on_idle(&mut self, armed: bool, idle: bool) -> DebounceAction {
        if armed && idle {
            self.state = AutoEndState::PendingFirstConfirm;
            DebounceAction::Schedule
        } else {
            self.state = AutoEndState::Idle;
            DebounceAction::Cancel
        }
    }

    /// Handles the firing of the timer requested by the last [`DebounceAction::Schedule`].
    pub fn on_timer(&mut self, armed: bool, idle: bool) -> DebounceAction {
        let confirmed = armed && idle;
        match (self.state, confirmed) {
            (AutoEndState::Idle, _) => DebounceAction::None,
            (AutoEndState::PendingFirstConfirm, true) => {
                self.state = AutoEndState::PendingSecondConfirm;
                DebounceAction::Schedule
            }
            (AutoEndState::PendingSecondConfirm, true) => {
                self.state = AutoEndState::Idle;
                DebounceAction::Finalize
            }
            (AutoEndState::PendingFirstConfirm | AutoEndState::PendingSecondConfirm, false) => {
                self.state = AutoEndState::Idle;
                DebounceAction::Cancel
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_strategy::{Arbitrary, proptest};

    #[test]
    fn finalizes_after_two_turns() {
        let mut debouncer = AutoEndDebouncer::new();
        assert_eq!(debouncer.on_idle(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.state(), AutoEndState::PendingFirstConfirm);

        assert_eq!(debouncer.on_timer(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.state(), AutoEndState::PendingSecondConfirm);

        assert_eq!(debouncer.on_timer(true, true), DebounceAction::Finalize);
        assert_eq!(
            debouncer.state(),
            AutoEndState::Idle,
            "finalizing returns the debouncer to idle for the next run"
        );

        // A stale timer after finalizing does nothing.
        assert_eq!(debouncer.on_timer(true, true), DebounceAction::None);
    }

    #[test]
    fn not_armed_cancels() {
        let mut debouncer = AutoEndDebouncer::new();
        assert_eq!(debouncer.on_idle(false, true), DebounceAction::Cancel);
        assert_eq!(debouncer.state(), AutoEndState::Idle);
    }

    #[test]
    fn not_idle_cancels() {
        let mut debouncer = AutoEndDebouncer::new();
        assert_eq!(debouncer.on_idle(true, false), DebounceAction::Cancel);
        assert_eq!(debouncer.state(), AutoEndState::Idle);
    }

    #[test]
    fn activity_between_confirmations_resets() {
        let mut debouncer = AutoEndDebouncer::new();
        assert_eq!(debouncer.on_idle(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.on_timer(true, true), DebounceAction::Schedule);

        // A subtest was queued before the second confirmation.
        assert_eq!(debouncer.on_idle(true, false), DebounceAction::Cancel);
        assert_eq!(debouncer.state(), AutoEndState::Idle);
        assert_eq!(debouncer.on_timer(true, true), DebounceAction::None);
    }

    #[test]
    fn busy_at_confirmation_drops_chain() {
        let mut debouncer = AutoEndDebouncer::new();
        assert_eq!(debouncer.on_idle(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.on_timer(true, false), DebounceAction::Cancel);
        assert_eq!(debouncer.state(), AutoEndState::Idle);

        assert_eq!(debouncer.on_idle(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.on_timer(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.on_timer(false, true), DebounceAction::Cancel);
        assert_eq!(debouncer.state(), AutoEndState::Idle);
    }

    #[test]
    fn new_idle_restarts_chain() {
        let mut debouncer = AutoEndDebouncer::new();
        assert_eq!(debouncer.on_idle(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.on_timer(true, true), DebounceAction::Schedule);
        assert_eq!(debouncer.on_idle(true, true), DebounceAction::Schedule);
        assert_eq!(
            debouncer.state(),
            AutoEndState::PendingFirstConfirm,
            "a new idle notification starts over from the first confirmation"
        );
    }

    #[derive(Arbitrary, Clone, Copy, Debug)]
    enum Input {
        Idle { idle: bool },
        Timer { idle: bool },
    }

    #[proptest]
    fn never_finalizes_when_not_armed(inputs: Vec<Input>) {
        let mut debouncer = AutoEndDebouncer::new();
        for input in inputs {
            let action = match input {
                Input::Idle { idle } => debouncer.on_idle(false, idle),
                Input::Timer { idle } => debouncer.on_timer(false, idle),
            };
            proptest::prop_assert_ne!(action, DebounceAction::Finalize);
        }
    }

    #[proptest]
    fn finalize_needs_two_timers_since_last_idle(inputs: Vec<Input>) {
        let mut debouncer = AutoEndDebouncer::new();
        // Timer firings observed since the last notification.
        let mut timers_since_idle = None;
        for input in inputs {
            let action = match input {
                Input::Idle { idle } => {
                    timers_since_idle = Some(0);
                    debouncer.on_idle(true, idle)
                }
                Input::Timer { idle } => {
                    if let Some(n) = timers_since_idle.as_mut() {
                        *n += 1;
                    }
                    debouncer.on_timer(true, idle)
                }
            };
            if action == DebounceAction::Finalize {
                proptest::prop_assert_eq!(timers_since_idle, Some(2));
                timers_since_idle = None;
            }
        }
    }
}
