//! Session control-plane state machine.
//!
//! One immutable transition table shared by every session; each session
//! owns only its current state. A transition rule is an
//! `(event, allowed-from states, target state)` triple. Firing an event
//! whose current state is not in the allowed set is rejected and leaves
//! the state untouched — the FSM never auto-corrects; callers check
//! state before performing protocol side effects.
//!
//! ```text
//! IDLE ──REGISTER──▶ REGISTER ──OPTIONS──▶ OPTIONS ──DESCRIBE──▶ DESCRIBE
//!   ▲                   ▲                                            │
//!   └──IDLE──┐          └────────────TEARDOWN_OK──┐            DESCRIBE_OK
//!            │                                    │                  ▼
//!         REGISTER ◀──*_FAIL── ...              STOP ◀─TEARDOWN─ SDP_READY
//!                                                 ▲                  │
//!                                                 │                SETUP
//!                                        PLAY ◀─PLAY── SETUP ◀──────┘
//!                                         │ ▲
//!                                     PAUSE PLAY
//!                                         ▼ │
//!                                        PAUSE
//! ```

use crate::error::CastError;

/// Control-plane state of a session. `Idle` is initial; there is no
/// terminal state (`Stop` is a transient node on the teardown path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Register,
    Options,
    Describe,
    SdpReady,
    Setup,
    Play,
    Pause,
    Stop,
}

/// Events fired by the RTSP router and the registration handshake.
///
/// `*Fail` events move a session back to a usable state after a failed
/// protocol action; `DescribeOk`/`TeardownOk` confirm the two-step
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Register,
    Options,
    OptionsFail,
    Describe,
    DescribeFail,
    DescribeOk,
    Setup,
    SetupFail,
    Play,
    PlayFail,
    Pause,
    PauseFail,
    Teardown,
    TeardownFail,
    TeardownOk,
    Idle,
}

/// One row of the transition table.
struct Rule {
    event: SessionEvent,
    from: &'static [SessionState],
    to: SessionState,
}

use SessionEvent as E;
use SessionState as S;

/// The complete transition table. Checked at compile time, never
/// mutated, shared by all sessions.
const RULES: &[Rule] = &[
    Rule { event: E::Register, from: &[S::Idle], to: S::Register },
    Rule { event: E::Options, from: &[S::Register, S::Play, S::Pause], to: S::Options },
    Rule { event: E::OptionsFail, from: &[S::Options], to: S::Register },
    Rule { event: E::Describe, from: &[S::Options], to: S::Describe },
    Rule { event: E::DescribeFail, from: &[S::Describe, S::SdpReady], to: S::Register },
    Rule { event: E::DescribeOk, from: &[S::Describe], to: S::SdpReady },
    Rule { event: E::Setup, from: &[S::SdpReady, S::Options], to: S::Setup },
    Rule { event: E::SetupFail, from: &[S::Setup], to: S::Register },
    Rule { event: E::Play, from: &[S::Setup, S::Pause], to: S::Play },
    Rule { event: E::PlayFail, from: &[S::Play], to: S::Register },
    Rule { event: E::Pause, from: &[S::Play], to: S::Pause },
    Rule { event: E::PauseFail, from: &[S::Pause], to: S::Play },
    Rule { event: E::Teardown, from: &[S::SdpReady, S::Play, S::Pause], to: S::Stop },
    Rule { event: E::TeardownFail, from: &[S::Stop], to: S::Play },
    Rule { event: E::TeardownOk, from: &[S::Stop], to: S::Register },
    Rule { event: E::Idle, from: &[S::Register], to: S::Idle },
];

/// Handle to the shared transition table.
///
/// Constructed once by the composition root and passed by reference
/// (`Arc`) to the session registry — no global state.
#[derive(Debug, Default)]
pub struct Fsm;

impl Fsm {
    pub fn new() -> Self {
        Fsm
    }

    fn rule(&self, event: SessionEvent) -> &'static Rule {
        // Every event has exactly one rule; the table is closed.
        RULES
            .iter()
            .find(|r| r.event == event)
            .expect("transition table covers every event")
    }

    /// Whether `event` may fire from `state`.
    pub fn permits(&self, state: SessionState, event: SessionEvent) -> bool {
        self.rule(event).from.contains(&state)
    }

    /// Evaluate a transition. Returns the target state, or
    /// [`CastError::Transition`] without any side effect when `state`
    /// is not in the event's allowed set.
    pub fn fire(&self, state: SessionState, event: SessionEvent) -> Result<SessionState, CastError> {
        let rule = self.rule(event);
        if rule.from.contains(&state) {
            Ok(rule.to)
        } else {
            Err(CastError::Transition { event, state })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: &[SessionState] = &[
        S::Idle,
        S::Register,
        S::Options,
        S::Describe,
        S::SdpReady,
        S::Setup,
        S::Play,
        S::Pause,
        S::Stop,
    ];

    const ALL_EVENTS: &[SessionEvent] = &[
        E::Register,
        E::Options,
        E::OptionsFail,
        E::Describe,
        E::DescribeFail,
        E::DescribeOk,
        E::Setup,
        E::SetupFail,
        E::Play,
        E::PlayFail,
        E::Pause,
        E::PauseFail,
        E::Teardown,
        E::TeardownFail,
        E::TeardownOk,
        E::Idle,
    ];

    /// A transition succeeds iff the current state is in the event's
    /// allowed-from set; otherwise the evaluation is rejected.
    #[test]
    fn fire_succeeds_iff_state_allowed() {
        let fsm = Fsm::new();
        for &state in ALL_STATES {
            for &event in ALL_EVENTS {
                let allowed = RULES
                    .iter()
                    .find(|r| r.event == event)
                    .unwrap()
                    .from
                    .contains(&state);
                assert_eq!(
                    fsm.fire(state, event).is_ok(),
                    allowed,
                    "{:?} from {:?}",
                    event,
                    state
                );
                assert_eq!(fsm.permits(state, event), allowed);
            }
        }
    }

    #[test]
    fn happy_path_to_play() {
        let fsm = Fsm::new();
        let mut state = S::Idle;
        for event in [E::Register, E::Options, E::Describe, E::DescribeOk, E::Setup, E::Play] {
            state = fsm.fire(state, event).unwrap();
        }
        assert_eq!(state, S::Play);
    }

    #[test]
    fn teardown_returns_to_register() {
        let fsm = Fsm::new();
        let state = fsm.fire(S::Play, E::Teardown).unwrap();
        assert_eq!(state, S::Stop);
        assert_eq!(fsm.fire(state, E::TeardownOk).unwrap(), S::Register);
    }

    #[test]
    fn teardown_failure_falls_back_to_play() {
        let fsm = Fsm::new();
        assert_eq!(fsm.fire(S::Stop, E::TeardownFail).unwrap(), S::Play);
    }

    #[test]
    fn rejected_event_reports_state() {
        let fsm = Fsm::new();
        match fsm.fire(S::Register, E::Describe) {
            Err(CastError::Transition { event, state }) => {
                assert_eq!(event, E::Describe);
                assert_eq!(state, S::Register);
            }
            other => panic!("expected Transition error, got {:?}", other),
        }
    }

    #[test]
    fn pause_cycle() {
        let fsm = Fsm::new();
        let state = fsm.fire(S::Play, E::Pause).unwrap();
        assert_eq!(state, S::Pause);
        assert_eq!(fsm.fire(state, E::Play).unwrap(), S::Play);
    }
}
