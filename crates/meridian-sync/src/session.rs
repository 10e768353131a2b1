//! # Auth Session
//!
//! Owns the user session lifecycle and publishes it as an [`AuthSnapshot`]
//! on a watch channel. Every I/O failure ends in `Unauthenticated`; nothing
//! here returns a half-signed-in session.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          AuthSession                                    │
//! │                                                                         │
//! │   initialize()                                                          │
//! │   ┌───────────────┐  no stored token   ┌─────────────────┐              │
//! │   │ INITIALIZING  │ ─────────────────► │ UNAUTHENTICATED │ ◄──┐         │
//! │   └───────┬───────┘  /me rejected      └────────┬────────┘    │         │
//! │           │ /me ok                              │ login ok    │         │
//! │           ▼                                     ▼             │         │
//! │   ┌───────────────┐ ◄────────────────────────────┘            │         │
//! │   │ AUTHENTICATED │ ── logout / force logout ─► LOGGING_OUT ──┘         │
//! │   └───────┬───────┘                                                     │
//! │           │ refresh_profile()                                           │
//! │           ▼                                                             │
//! │      REFRESHING ── ok ──► AUTHENTICATED                                 │
//! │                                                                         │
//! │  • initialize(): concurrent callers await one shared run               │
//! │  • login(): one at a time; a logout mid-login discards its result     │
//! │  • logout()/handle_force_logout(): one at a time                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use meridian_core::events::{EventEmitter, EventKey, Listener};
use meridian_core::permissions;
use meridian_core::validation::validate_credentials;
use meridian_core::{
    AuthSnapshot, AuthState, AuthStateMachine, ForceLogoutReason, Role, Transition, User,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::AuthBackend;
use crate::credentials::{CredentialStore, StoredCredentials};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SessionControl;

// =============================================================================
// Events & Outcomes
// =============================================================================

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    /// A user is signed in; services may start.
    SessionStarted(User),
    /// The session is gone; services must stop.
    SessionEnded,
    /// Human-readable message for the user.
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthEventKind {
    SessionStarted,
    SessionEnded,
    Notice,
}

impl EventKey for AuthEvent {
    type Kind = AuthEventKind;

    fn kind(&self) -> AuthEventKind {
        match self {
            AuthEvent::SessionStarted(_) => AuthEventKind::SessionStarted,
            AuthEvent::SessionEnded => AuthEventKind::SessionEnded,
            AuthEvent::Notice(_) => AuthEventKind::Notice,
        }
    }
}

/// Result of [`AuthSession::login`]. Never an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub user: Option<User>,
}

impl LoginOutcome {
    fn success(user: User) -> Self {
        LoginOutcome {
            success: true,
            error: None,
            user: Some(user),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        LoginOutcome {
            success: false,
            error: Some(message.into()),
            user: None,
        }
    }
}

// =============================================================================
// Single-Flight Guard
// =============================================================================

/// Holds a busy flag until dropped.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// =============================================================================
// Auth Session
// =============================================================================

type InitFuture = Shared<BoxFuture<'static, ()>>;

struct Inner {
    backend: Arc<dyn AuthBackend>,
    store: Arc<dyn CredentialStore>,
    machine: Mutex<AuthStateMachine>,
    snapshot: watch::Sender<AuthSnapshot>,
    events: EventEmitter<AuthEvent>,
    init: Mutex<Option<InitFuture>>,
    logging_in: AtomicBool,
    logging_out: AtomicBool,
    /// Bumped by every logout; a login that started earlier is stale.
    logout_epoch: AtomicU64,
}

/// The one session of a running client. Cheap to clone.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<Inner>,
}

impl AuthSession {
    pub fn new(backend: Arc<dyn AuthBackend>, store: Arc<dyn CredentialStore>) -> Self {
        let (snapshot, _) = watch::channel(AuthSnapshot::default());
        AuthSession {
            inner: Arc::new(Inner {
                backend,
                store,
                machine: Mutex::new(AuthStateMachine::new()),
                snapshot,
                events: EventEmitter::new(),
                init: Mutex::new(None),
                logging_in: AtomicBool::new(false),
                logging_out: AtomicBool::new(false),
                logout_epoch: AtomicU64::new(0),
            }),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Receiver for every published snapshot.
    pub fn watch(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn state(&self) -> AuthState {
        self.inner.snapshot.borrow().state
    }

    pub fn user(&self) -> Option<User> {
        self.inner.snapshot.borrow().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.snapshot.borrow().is_authenticated()
    }

    pub fn is_initializing(&self) -> bool {
        self.inner.snapshot.borrow().is_initializing
    }

    pub fn on(&self, kind: AuthEventKind, listener: Listener<AuthEvent>) -> bool {
        self.inner.events.on(kind, listener)
    }

    pub fn off(&self, kind: AuthEventKind, listener: &Listener<AuthEvent>) {
        self.inner.events.off(kind, listener)
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Restores the stored session, if any. Concurrent callers share one run.
    pub async fn initialize(&self) {
        let run = {
            let mut slot = self.inner.init.lock();
            match slot.as_ref() {
                Some(run) => run.clone(),
                None => {
                    let inner = self.inner.clone();
                    let run = async move {
                        inner.run_initialize().await;
                        *inner.init.lock() = None;
                    }
                    .boxed()
                    .shared();
                    *slot = Some(run.clone());
                    run
                }
            }
        };
        run.await;
    }

    /// Signs in. Failures come back as `success == false` with a message.
    pub async fn login(&self, email: &str, password: &str, remember_me: bool) -> LoginOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.inner.logging_in) else {
            debug!("Login ignored, another sign-in is running");
            return LoginOutcome::failure("Another sign-in is in progress");
        };
        let epoch = self.inner.logout_epoch.load(Ordering::Acquire);

        if let Err(e) = validate_credentials(email, password) {
            return LoginOutcome::failure(e.to_string());
        }

        info!(email, "Signing in");
        let response = self.inner.backend.login(email, password, remember_me).await;
        if self.inner.logout_epoch.load(Ordering::Acquire) != epoch {
            info!("Sign-in discarded, signed out while it was running");
            return LoginOutcome::failure("Signed out while signing in");
        }
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Login request failed");
                let message = "Unable to reach the server. Please try again.";
                self.inner.clean_logout(Some(message.to_string()));
                return LoginOutcome::failure(message);
            }
        };

        if !response.success {
            let message = response.error_message();
            self.inner.clean_logout(Some(message.clone()));
            return LoginOutcome::failure(message);
        }

        let (Some(user), Some(token)) = (response.user, response.access_token) else {
            let message = "The server returned an incomplete session";
            warn!(message);
            self.inner.clean_logout(Some(message.to_string()));
            return LoginOutcome::failure(message);
        };

        let user = permissions::with_role_permissions(user).with_token(token.clone());
        let credentials = StoredCredentials {
            access_token: Some(token),
            current_user: Some(user.clone()),
            refresh_token: response.refresh_token,
        };
        if let Err(e) = self.inner.store.save(&credentials) {
            warn!(error = %e, "Failed to persist credentials");
        }

        self.inner.start_session(user.clone());
        LoginOutcome::success(user)
    }

    /// Signs out. Cleanup is unconditional; a concurrent logout is a no-op.
    /// A sign-in still waiting on the server is discarded.
    pub fn logout(&self) {
        let Some(_guard) = self.inner.begin_logout() else {
            debug!("Logout already in progress");
            return;
        };
        info!("Signing out");
        self.inner.clean_logout(None);
    }

    /// Tears the session down because the server rejected it.
    pub fn handle_force_logout(&self, reason: ForceLogoutReason) {
        let Some(_guard) = self.inner.begin_logout() else {
            debug!(%reason, "Forced logout ignored, logout already in progress");
            return;
        };
        warn!(%reason, "Forced logout");
        self.inner.clean_logout(Some(reason.user_message().to_string()));
    }

    /// Re-reads the profile from the backend.
    ///
    /// A rejected token ends the session; other failures restore
    /// `Authenticated` and return the error.
    pub async fn refresh_profile(&self) -> SyncResult<User> {
        let Some(token) = self.snapshot().token().map(str::to_string) else {
            return Err(SyncError::InvalidArgument("no active session".into()));
        };
        self.inner
            .set_state(AuthState::Refreshing)
            .into_result()
            .map_err(|e| SyncError::InvalidArgument(e.to_string()))?;

        match self.inner.backend.who_am_i(&token).await {
            Ok(profile) => {
                let user = permissions::with_role_permissions(profile).with_token(token.clone());
                let mut stored = self.inner.store.load().unwrap_or_default();
                stored.access_token = Some(token);
                stored.current_user = Some(user.clone());
                if let Err(e) = self.inner.store.save(&stored) {
                    warn!(error = %e, "Failed to persist refreshed profile");
                }
                self.inner.set_session(AuthState::Authenticated, Some(user.clone()));
                Ok(user)
            }
            Err(e) if e.is_auth_error() => {
                self.inner.clean_logout(Some(
                    ForceLogoutReason::SessionExpired.user_message().to_string(),
                ));
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Profile refresh failed");
                self.inner.set_state(AuthState::Authenticated);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Permission Queries
    // =========================================================================

    pub fn has_permission(&self, permission: &str) -> bool {
        permissions::has_permission(self.inner.snapshot.borrow().user.as_ref(), permission)
    }

    pub fn has_role(&self, role: Role) -> bool {
        permissions::has_role(self.inner.snapshot.borrow().user.as_ref(), role)
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        permissions::has_any_role(self.inner.snapshot.borrow().user.as_ref(), roles)
    }

    /// Route gate. Only an authenticated session can pass.
    pub fn can_access_route(&self, roles: &[Role], required: &[&str]) -> bool {
        let snapshot = self.inner.snapshot.borrow();
        snapshot.is_authenticated()
            && permissions::can_access_route(snapshot.user.as_ref(), roles, required)
    }
}

#[async_trait]
impl SessionControl for AuthSession {
    async fn force_logout(&self, reason: ForceLogoutReason) {
        self.handle_force_logout(reason);
    }
}

impl Inner {
    fn begin_logout(&self) -> Option<FlightGuard<'_>> {
        let guard = FlightGuard::acquire(&self.logging_out)?;
        self.logout_epoch.fetch_add(1, Ordering::AcqRel);
        Some(guard)
    }

    async fn run_initialize(&self) {
        self.snapshot.send_modify(|s| s.is_initializing = true);
        self.set_state(AuthState::Initializing);

        let stored = self.store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unreadable credentials");
            StoredCredentials::default()
        });

        match stored.session() {
            None => {
                debug!("No stored session");
                self.clean_logout(None);
            }
            Some((token, _)) => {
                let token = token.to_string();
                match self.backend.who_am_i(&token).await {
                    Ok(profile) => {
                        let user = permissions::with_role_permissions(profile).with_token(token);
                        self.start_session(user);
                    }
                    Err(e) => {
                        warn!(error = %e, "Stored session rejected");
                        self.clean_logout(None);
                    }
                }
            }
        }

        self.snapshot.send_modify(|s| s.is_initializing = false);
        info!(state = %self.machine.lock().state(), "Auth initialized");
    }

    /// Applies a transition and publishes the resulting state.
    fn set_state(&self, target: AuthState) -> Transition {
        let (transition, state) = {
            let mut machine = self.machine.lock();
            (machine.transition(target), machine.state())
        };
        self.snapshot.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
        transition
    }

    /// Transitions and replaces the user in one published update.
    fn set_session(&self, target: AuthState, user: Option<User>) {
        let state = {
            let mut machine = self.machine.lock();
            machine.transition(target);
            machine.state()
        };
        self.snapshot.send_modify(|s| {
            s.state = state;
            if state == target {
                s.user = user;
            }
        });
    }

    fn start_session(&self, user: User) {
        info!(user_id = %user.id, role = %user.role, "Session started");
        self.set_session(AuthState::Authenticated, Some(user.clone()));
        self.events.emit(&AuthEvent::SessionStarted(user));
    }

    /// Best-effort teardown to `Unauthenticated`.
    fn clean_logout(&self, notice: Option<String>) {
        let had_user = self.snapshot.borrow().user.is_some();

        if matches!(
            self.machine.lock().state(),
            AuthState::Authenticated | AuthState::Refreshing
        ) {
            self.set_state(AuthState::LoggingOut);
        }
        if had_user {
            self.events.emit(&AuthEvent::SessionEnded);
        }
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }

        let state = {
            let mut machine = self.machine.lock();
            machine.transition(AuthState::Unauthenticated);
            machine.state()
        };
        self.snapshot.send_modify(|s| {
            s.state = state;
            s.user = None;
        });

        if let Some(message) = notice {
            self.events.emit(&AuthEvent::Notice(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoginResponse;
    use crate::client::{SyncClient, SyncClientConfig};
    use crate::credentials::MemoryCredentialStore;
    use crate::orchestrator::{OrchestratorConfig, OrchestratorHandle, SyncOrchestrator};
    use crate::protocol::{Packet, SocketPacket};
    use crate::transport::memory::{MemoryConnector, MemoryServer};
    use crate::transport::websocket_endpoint;
    use meridian_core::permissions::{permissions_for, MANAGE_USERS, VIEW_ORDERS};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FakeBackend {
        profile: Mutex<SyncResult<User>>,
        login: Mutex<SyncResult<LoginResponse>>,
        who_am_i_calls: AtomicUsize,
        login_calls: AtomicUsize,
        latency: Duration,
    }

    impl FakeBackend {
        fn new() -> Self {
            FakeBackend {
                profile: Mutex::new(Ok(profile("manager"))),
                login: Mutex::new(Err(SyncError::Http("unset".into()))),
                who_am_i_calls: AtomicUsize::new(0),
                login_calls: AtomicUsize::new(0),
                latency: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl AuthBackend for FakeBackend {
        async fn who_am_i(&self, _token: &str) -> SyncResult<User> {
            self.who_am_i_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.profile.lock().clone()
        }

        async fn login(&self, _: &str, _: &str, _: bool) -> SyncResult<LoginResponse> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.login.lock().clone()
        }
    }

    fn profile(role: &str) -> User {
        serde_json::from_value(json!({
            "id": 11,
            "email": "lee@example.com",
            "name": "Lee",
            "role": role
        }))
        .unwrap()
    }

    fn stored_session() -> StoredCredentials {
        StoredCredentials {
            access_token: Some("stored-token".into()),
            current_user: Some(profile("manager")),
            refresh_token: None,
        }
    }

    fn session_with(
        backend: FakeBackend,
        stored: StoredCredentials,
    ) -> (AuthSession, Arc<FakeBackend>, Arc<MemoryCredentialStore>) {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryCredentialStore::new(stored));
        let session = AuthSession::new(backend.clone(), store.clone());
        (session, backend, store)
    }

    fn record(session: &AuthSession) -> Arc<Mutex<Vec<AuthEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            AuthEventKind::SessionStarted,
            AuthEventKind::SessionEnded,
            AuthEventKind::Notice,
        ] {
            let log = log.clone();
            session.on(kind, Arc::new(move |e: &AuthEvent| log.lock().push(e.clone())));
        }
        log
    }

    #[tokio::test]
    async fn test_initialize_without_stored_session() {
        let (session, backend, _) = session_with(FakeBackend::new(), StoredCredentials::default());
        session.initialize().await;

        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(session.user().is_none());
        assert!(!session.is_initializing());
        assert!(!session.is_authenticated());
        assert_eq!(backend.who_am_i_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialize_restores_valid_session() {
        let (session, _, _) = session_with(FakeBackend::new(), stored_session());
        let log = record(&session);
        session.initialize().await;

        assert_eq!(session.state(), AuthState::Authenticated);
        assert!(session.is_authenticated());
        let user = session.user().unwrap();
        assert_eq!(user.token.as_deref(), Some("stored-token"));
        let expected: Vec<String> = permissions_for(Role::Manager)
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(user.permissions, expected);
        assert!(matches!(log.lock().as_slice(), [AuthEvent::SessionStarted(_)]));
    }

    #[tokio::test]
    async fn test_initialize_with_rejected_token_logs_out() {
        let backend = FakeBackend::new();
        *backend.profile.lock() = Err(SyncError::Api {
            status: 401,
            message: "expired".into(),
        });
        let (session, _, store) = session_with(backend, stored_session());
        session.initialize().await;

        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(!session.is_initializing());
        assert_eq!(store.load().unwrap(), StoredCredentials::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_initialize_runs_once() {
        let mut backend = FakeBackend::new();
        backend.latency = Duration::from_millis(200);
        let (session, backend, _) = session_with(backend, stored_session());

        tokio::join!(session.initialize(), session.initialize(), session.initialize());
        assert_eq!(backend.who_am_i_calls.load(Ordering::SeqCst), 1);
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_rejection() {
        let backend = FakeBackend::new();
        *backend.login.lock() = Ok(LoginResponse {
            success: false,
            error: Some(json!("Invalid credentials")),
            ..Default::default()
        });
        let (session, _, store) = session_with(backend, StoredCredentials::default());
        session.initialize().await;

        let outcome = session.login("a@b.com", "secret", false).await;
        assert_eq!(
            outcome,
            LoginOutcome {
                success: false,
                error: Some("Invalid credentials".into()),
                user: None
            }
        );
        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(store.load().unwrap().access_token.is_none());
    }

    #[tokio::test]
    async fn test_login_success_persists_session() {
        let backend = FakeBackend::new();
        *backend.login.lock() = Ok(LoginResponse {
            success: true,
            user: Some(profile("client")),
            access_token: Some("fresh".into()),
            refresh_token: Some("refresh".into()),
            ..Default::default()
        });
        let (session, _, store) = session_with(backend, StoredCredentials::default());
        session.initialize().await;
        let log = record(&session);

        let outcome = session.login("lee@example.com", "secret", true).await;
        assert!(outcome.success);
        assert!(session.is_authenticated());
        assert!(session.has_permission(VIEW_ORDERS));
        assert!(!session.has_permission(MANAGE_USERS));

        let stored = store.load().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh"));
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(stored.current_user.unwrap().role, Role::Client);
        assert!(matches!(log.lock().as_slice(), [AuthEvent::SessionStarted(_)]));
    }

    #[tokio::test]
    async fn test_login_validates_before_network() {
        let (session, backend, _) = session_with(FakeBackend::new(), StoredCredentials::default());
        let outcome = session.login("", "secret", false).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("email is required"));
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_login_rejected_while_in_flight() {
        let mut backend = FakeBackend::new();
        backend.latency = Duration::from_millis(500);
        *backend.login.lock() = Ok(LoginResponse {
            success: true,
            user: Some(profile("employee")),
            access_token: Some("t".into()),
            ..Default::default()
        });
        let (session, backend, _) = session_with(backend, StoredCredentials::default());
        session.initialize().await;

        let (first, second) = tokio::join!(
            session.login("lee@example.com", "secret", false),
            session.login("lee@example.com", "secret", false)
        );
        assert!(first.success);
        assert!(!second.success);
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_login_discards_the_login() {
        let mut backend = FakeBackend::new();
        backend.latency = Duration::from_millis(500);
        *backend.login.lock() = Ok(LoginResponse {
            success: true,
            user: Some(profile("employee")),
            access_token: Some("late".into()),
            ..Default::default()
        });
        let (session, backend, store) = session_with(backend, StoredCredentials::default());
        session.initialize().await;
        let log = record(&session);

        let (outcome, _) = tokio::join!(
            session.login("lee@example.com", "secret", false),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.logout();
            }
        );

        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
        assert!(!outcome.success);
        assert!(outcome.user.is_none());
        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(session.user().is_none());
        assert_eq!(store.load().unwrap(), StoredCredentials::default());
        assert!(log.lock().is_empty());

        // The next sign-in is not affected
        let outcome = session.login("lee@example.com", "secret", false).await;
        assert!(outcome.success);
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let (session, _, store) = session_with(FakeBackend::new(), stored_session());
        session.initialize().await;
        let log = record(&session);

        session.logout();

        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(session.user().is_none());
        assert_eq!(store.load().unwrap(), StoredCredentials::default());
        assert_eq!(log.lock().as_slice(), &[AuthEvent::SessionEnded]);
    }

    #[tokio::test]
    async fn test_force_logout_notice() {
        let (session, _, _) = session_with(FakeBackend::new(), stored_session());
        session.initialize().await;
        let log = record(&session);

        SessionControl::force_logout(&session, ForceLogoutReason::UserBlocked).await;
        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert_eq!(
            log.lock().as_slice(),
            &[
                AuthEvent::SessionEnded,
                AuthEvent::Notice(ForceLogoutReason::UserBlocked.user_message().into())
            ]
        );
    }

    #[tokio::test]
    async fn test_refresh_profile_round_trip() {
        let (session, backend, _) = session_with(FakeBackend::new(), stored_session());
        session.initialize().await;

        *backend.profile.lock() = Ok(profile("admin"));
        let user = session.refresh_profile().await.unwrap();
        assert_eq!(user.role, Role::Admin);
        assert_eq!(session.state(), AuthState::Authenticated);
        assert!(session.has_permission(MANAGE_USERS));

        *backend.profile.lock() = Err(SyncError::Http("offline".into()));
        assert!(session.refresh_profile().await.is_err());
        assert_eq!(session.state(), AuthState::Authenticated);

        *backend.profile.lock() = Err(SyncError::AuthRejected("revoked".into()));
        assert!(session.refresh_profile().await.is_err());
        assert_eq!(session.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_route_gates() {
        let (session, _, _) = session_with(FakeBackend::new(), stored_session());
        assert!(!session.can_access_route(&[], &[]));

        session.initialize().await;
        assert!(session.can_access_route(&[], &[]));
        assert!(session.has_role(Role::Manager));
        assert!(session.has_any_role(&[Role::Admin, Role::Manager]));
        assert!(!session.can_access_route(&[Role::Admin], &[]));
        assert!(session.can_access_route(&[Role::Manager], &[VIEW_ORDERS]));
    }

    // =========================================================================
    // Session → Orchestrator
    // =========================================================================

    fn spawn_sync(
        session: &AuthSession,
    ) -> (
        OrchestratorHandle,
        Arc<MemoryConnector>,
        mpsc::UnboundedReceiver<MemoryServer>,
    ) {
        let (connector, servers) = MemoryConnector::new();
        let config = SyncClientConfig {
            endpoint: websocket_endpoint("http://localhost:3001", "/socket.io/").unwrap(),
            connect_timeout: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(1),
            users_sync_timeout: Duration::from_secs(2),
            action_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(25),
        };
        let client = SyncClient::new(config, connector.clone());
        let handle = SyncOrchestrator::spawn(
            client,
            session.watch(),
            Arc::new(session.clone()),
            OrchestratorConfig::default(),
        );
        (handle, connector, servers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_without_token_never_connects() {
        let (session, _, _) = session_with(FakeBackend::new(), StoredCredentials::default());
        let (_handle, connector, _servers) = spawn_sync(&session);

        session.initialize().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.opens(), 0);
        assert!(session.user().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_with_valid_token_connects_once() {
        let mut backend = FakeBackend::new();
        backend.latency = Duration::from_millis(300);
        let (session, _, _) = session_with(backend, stored_session());
        let (handle, connector, mut servers) = spawn_sync(&session);

        session.initialize().await;
        let mut server = servers.recv().await.unwrap();
        let auth = server.handshake().await;
        assert_eq!(auth["token"], "stored-token");

        let mut state = handle.watch_state();
        state.wait_for(|s| s.is_connected).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_kick_ends_session() {
        let (session, _, store) = session_with(FakeBackend::new(), stored_session());
        let (handle, _connector, mut servers) = spawn_sync(&session);

        session.initialize().await;
        let mut server = servers.recv().await.unwrap();
        server.handshake().await;
        handle.watch_state().wait_for(|s| s.is_connected).await.unwrap();

        server.send(Packet::Message(SocketPacket::Disconnect));
        let mut auth = session.watch();
        auth.wait_for(|s| s.state == AuthState::Unauthenticated)
            .await
            .unwrap();
        assert_eq!(store.load().unwrap(), StoredCredentials::default());
    }
}
