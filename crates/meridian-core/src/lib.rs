//! # meridian-core: Pure Session Logic for Meridian
//!
//! The no-I/O half of the realtime client: the auth state transition table,
//! the static role → permission table, the typed event emitter and the data
//! types shared with `meridian-sync`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Meridian Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    apps/meridian-client                         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   meridian-sync: AuthSession, SyncClient, SyncOrchestrator      │   │
//! │  │   (sockets, HTTP, timers)                                       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ meridian-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌────────────┐  │   │
//! │  │   │auth_state │  │permissions │  │  events  │  │   types    │  │   │
//! │  │   │ table     │  │ role table │  │ emitter  │  │ User, etc. │  │   │
//! │  │   └───────────┘  └────────────┘  └──────────┘  └────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`auth_state`] - Session states and the allowed transitions
//! - [`permissions`] - Role → permission table and route gates
//! - [`events`] - Typed listener registry
//! - [`types`] - User, AuthSnapshot, cached channel entries
//! - [`validation`] - Login form checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use meridian_core::{AuthState, AuthStateMachine, Transition};
//!
//! let mut machine = AuthStateMachine::new();
//! machine.transition(AuthState::Unauthenticated);
//!
//! // LOGGING_OUT is not reachable from UNAUTHENTICATED
//! let outcome = machine.transition(AuthState::LoggingOut);
//! assert!(matches!(outcome, Transition::Rejected { .. }));
//! assert_eq!(machine.state(), AuthState::Unauthenticated);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth_state;
pub mod error;
pub mod events;
pub mod permissions;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use auth_state::{AuthState, AuthStateMachine, ForceLogoutReason, Transition};
pub use error::{CoreError, CoreResult, ValidationError};
pub use events::{EventEmitter, EventKey, Listener};
pub use types::*;
