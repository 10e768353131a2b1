//! # Error Types
//!
//! Domain-specific error types for meridian-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  meridian-core errors (this file)                                      │
//! │  ├── CoreError        - Session / state machine failures               │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  meridian-sync errors (separate crate)                                 │
//! │  └── SyncError        - Socket, HTTP, storage and config failures      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → LoginOutcome/Notice   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::auth_state::AuthState;

// =============================================================================
// Core Error
// =============================================================================

/// Core session logic errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A state change was requested that the transition table forbids.
    ///
    /// ## When This Occurs
    /// - `LOGGING_OUT → AUTHENTICATED` (logout must finish first)
    /// - `INITIALIZING → REFRESHING` (no session to refresh yet)
    #[error("Transition {from} -> {to} is not allowed")]
    TransitionRejected { from: AuthState, to: AuthState },

    /// Unknown role name on a user profile.
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Used for early validation before any network round-trip.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., email without `@`).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::TransitionRejected {
            from: AuthState::LoggingOut,
            to: AuthState::Authenticated,
        };
        assert_eq!(
            err.to_string(),
            "Transition logging_out -> authenticated is not allowed"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "email".to_string(),
        };
        assert_eq!(err.to_string(), "email is required");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "password".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
