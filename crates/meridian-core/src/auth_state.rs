//! # Auth State Machine
//!
//! The session lifecycle as a constrained transition table.
//!
//! ## Transition Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Auth State Transitions                           │
//! │                                                                         │
//! │                      ┌──────────────┐                                   │
//! │         ┌───────────►│ INITIALIZING │◄──────────────┐                   │
//! │         │            └──────┬───────┘               │                   │
//! │         │        ┌──────────┼───────────┐           │                   │
//! │         │        ▼          ▼           ▼           │                   │
//! │  ┌──────┴─────────┐  ┌─────────────┐  ┌──────┐      │                   │
//! │  │UNAUTHENTICATED │─►│AUTHENTICATED│─►│ERROR │──────┘                   │
//! │  └────────────────┘  └──┬───────┬──┘  └──┬───┘                          │
//! │         ▲               │       ▼        │                              │
//! │         │               │  ┌──────────┐  │                              │
//! │         │               │  │REFRESHING│──┘ (also → AUTHENTICATED)      │
//! │         │               ▼  └────┬─────┘                                 │
//! │         │        ┌────────────┐ │                                       │
//! │         └────────│LOGGING_OUT │◄┘                                       │
//! │                  └────────────┘                                         │
//! │                                                                         │
//! │  Same-state requests are IGNORED (idempotent duplicate triggers).      │
//! │  Requests outside the table are REJECTED (state unchanged).            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Auth State
// =============================================================================

/// Lifecycle state of the user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Initializing,
    Authenticated,
    Unauthenticated,
    LoggingOut,
    Error,
    Refreshing,
}

impl AuthState {
    /// All states, in declaration order.
    pub const ALL: [AuthState; 6] = [
        AuthState::Initializing,
        AuthState::Authenticated,
        AuthState::Unauthenticated,
        AuthState::LoggingOut,
        AuthState::Error,
        AuthState::Refreshing,
    ];

    /// Targets reachable from this state in one step.
    pub fn allowed_targets(&self) -> &'static [AuthState] {
        use AuthState::*;
        match self {
            Initializing => &[Authenticated, Unauthenticated, Error],
            Authenticated => &[LoggingOut, Refreshing, Error, Initializing],
            Unauthenticated => &[Initializing, Authenticated],
            LoggingOut => &[Unauthenticated],
            Refreshing => &[Authenticated, LoggingOut, Error],
            Error => &[Unauthenticated, Initializing],
        }
    }

    /// Returns true if `target` is in this state's allowed set.
    pub fn can_transition_to(&self, target: AuthState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::Initializing => write!(f, "initializing"),
            AuthState::Authenticated => write!(f, "authenticated"),
            AuthState::Unauthenticated => write!(f, "unauthenticated"),
            AuthState::LoggingOut => write!(f, "logging_out"),
            AuthState::Error => write!(f, "error"),
            AuthState::Refreshing => write!(f, "refreshing"),
        }
    }
}

// =============================================================================
// Transition Result
// =============================================================================

/// Outcome of a transition request.
///
/// Callers must not assume the requested state was applied; match on this
/// or read back [`AuthStateMachine::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed.
    Applied { from: AuthState, to: AuthState },
    /// Requested the current state; nothing changed.
    Ignored(AuthState),
    /// The table forbids this move; nothing changed.
    Rejected { from: AuthState, requested: AuthState },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    /// The state after the request was processed.
    pub fn resulting_state(&self) -> AuthState {
        match *self {
            Transition::Applied { to, .. } => to,
            Transition::Ignored(state) => state,
            Transition::Rejected { from, .. } => from,
        }
    }

    /// Converts a rejection into [`CoreError::TransitionRejected`].
    pub fn into_result(self) -> CoreResult<AuthState> {
        match self {
            Transition::Rejected { from, requested } => {
                Err(CoreError::TransitionRejected { from, to: requested })
            }
            other => Ok(other.resulting_state()),
        }
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Holds the current [`AuthState`] and enforces the transition table.
#[derive(Debug, Clone)]
pub struct AuthStateMachine {
    state: AuthState,
}

impl Default for AuthStateMachine {
    fn default() -> Self {
        AuthStateMachine {
            state: AuthState::Initializing,
        }
    }
}

impl AuthStateMachine {
    /// Creates a machine in `INITIALIZING`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Requests a move to `target`.
    pub fn transition(&mut self, target: AuthState) -> Transition {
        let from = self.state;

        if from == target {
            debug!(state = %from, "Ignoring same-state transition");
            return Transition::Ignored(from);
        }

        if !from.can_transition_to(target) {
            warn!(from = %from, to = %target, "Rejected auth state transition");
            return Transition::Rejected {
                from,
                requested: target,
            };
        }

        debug!(from = %from, to = %target, "Auth state transition");
        self.state = target;
        Transition::Applied { from, to: target }
    }
}

// =============================================================================
// Forced Logout Reasons
// =============================================================================

/// Why a session was torn down without the user asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceLogoutReason {
    SessionExpired,
    TokenInvalid,
    UserBlocked,
    Other(String),
}

impl ForceLogoutReason {
    /// Parses a wire reason tag; unknown tags are kept verbatim.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "session_expired" => ForceLogoutReason::SessionExpired,
            "token_invalid" => ForceLogoutReason::TokenInvalid,
            "user_blocked" => ForceLogoutReason::UserBlocked,
            other => ForceLogoutReason::Other(other.to_string()),
        }
    }

    /// Message shown to the user after the forced logout.
    pub fn user_message(&self) -> &'static str {
        match self {
            ForceLogoutReason::SessionExpired => "Your session has expired. Please sign in again.",
            ForceLogoutReason::TokenInvalid => "Your session is no longer valid. Please sign in again.",
            ForceLogoutReason::UserBlocked => "Your account has been blocked. Contact an administrator.",
            ForceLogoutReason::Other(_) => "You have been signed out.",
        }
    }
}

impl std::fmt::Display for ForceLogoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForceLogoutReason::SessionExpired => write!(f, "session_expired"),
            ForceLogoutReason::TokenInvalid => write!(f, "token_invalid"),
            ForceLogoutReason::UserBlocked => write!(f, "user_blocked"),
            ForceLogoutReason::Other(tag) => write!(f, "{}", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state: AuthState) -> AuthStateMachine {
        AuthStateMachine { state }
    }

    #[test]
    fn test_starts_initializing() {
        assert_eq!(AuthStateMachine::new().state(), AuthState::Initializing);
    }

    #[test]
    fn test_same_state_is_ignored_for_every_state() {
        for state in AuthState::ALL {
            let mut machine = machine_in(state);
            assert_eq!(machine.transition(state), Transition::Ignored(state));
            assert_eq!(machine.state(), state);
        }
    }

    #[test]
    fn test_disallowed_transitions_are_rejected() {
        for from in AuthState::ALL {
            for to in AuthState::ALL {
                if from == to || from.can_transition_to(to) {
                    continue;
                }
                let mut machine = machine_in(from);
                let outcome = machine.transition(to);
                assert_eq!(outcome, Transition::Rejected { from, requested: to });
                assert_eq!(machine.state(), from, "{from} -> {to} must not apply");
            }
        }
    }

    #[test]
    fn test_allowed_transitions_apply() {
        for from in AuthState::ALL {
            for &to in from.allowed_targets() {
                let mut machine = machine_in(from);
                assert!(machine.transition(to).is_applied());
                assert_eq!(machine.state(), to);
            }
        }
    }

    #[test]
    fn test_logout_path() {
        let mut machine = machine_in(AuthState::Authenticated);
        machine.transition(AuthState::LoggingOut);
        // Only UNAUTHENTICATED leaves LOGGING_OUT
        assert!(!machine.transition(AuthState::Authenticated).is_applied());
        assert!(machine.transition(AuthState::Unauthenticated).is_applied());
    }

    #[test]
    fn test_into_result() {
        let mut machine = machine_in(AuthState::LoggingOut);
        let err = machine.transition(AuthState::Refreshing).into_result();
        assert!(matches!(err, Err(CoreError::TransitionRejected { .. })));

        let ok = machine.transition(AuthState::LoggingOut).into_result().unwrap();
        assert_eq!(ok, AuthState::LoggingOut);
    }

    #[test]
    fn test_force_logout_reason_tags() {
        assert_eq!(
            ForceLogoutReason::from_tag("session_expired"),
            ForceLogoutReason::SessionExpired
        );
        assert_eq!(
            ForceLogoutReason::from_tag("user_blocked").to_string(),
            "user_blocked"
        );
        let other = ForceLogoutReason::from_tag("auth_failed");
        assert_eq!(other, ForceLogoutReason::Other("auth_failed".into()));
        assert_eq!(other.user_message(), "You have been signed out.");
    }
}
