//! # Meridian Client
//!
//! Headless realtime client: restores or starts a session, keeps the socket
//! connected while signed in and logs what the feeds receive.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info)                                   │
//! │  2. MeridianConfig::load (defaults → client.toml → MERIDIAN_* env)     │
//! │  3. AuthSession (HTTP backend + credentials file)                      │
//! │  4. SyncOrchestrator::spawn (watches the session, not yet connected)   │
//! │  5. session.initialize()  ──► orchestrator connects if authenticated   │
//! │  6. optional login from --email/--password                             │
//! │  7. wait for Ctrl+C / SIGTERM ──► shutdown                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use meridian_sync::{
    notifications_feed, orders_feed, stats_feed, users_feed, AuthEvent, AuthEventKind,
    AuthSession, FileCredentialStore, HttpAuthBackend, MeridianConfig, OrchestratorHandle,
    RealtimeFeed, SyncClient, SyncOrchestrator,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "meridian-client", version, about = "Meridian realtime client")]
struct Args {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sign in with this email when no stored session is valid
    #[arg(long, env = "MERIDIAN_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "MERIDIAN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Keep the session across restarts
    #[arg(long)]
    remember_me: bool,

    /// Sign out, clear stored credentials and exit
    #[arg(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = MeridianConfig::load(args.config.clone()).context("loading client config")?;
    info!(
        api = %config.server.api_url,
        socket = %config.server.socket_url,
        "Configuration loaded"
    );

    let credentials = config
        .credentials_path()
        .context("no data directory for stored credentials")?;
    let backend = Arc::new(HttpAuthBackend::new(config.api_base()?)?);
    let store = Arc::new(FileCredentialStore::new(credentials));
    let session = AuthSession::new(backend, store);
    log_auth_events(&session);

    let client = SyncClient::with_websocket(config.client_config()?);
    let sync = SyncOrchestrator::spawn(
        client,
        session.watch(),
        Arc::new(session.clone()),
        config.orchestrator_config(),
    );
    spawn_connection_logger(&sync);

    session.initialize().await;

    if args.logout {
        session.logout();
        sync.shutdown().await;
        info!("Signed out");
        return Ok(());
    }

    if !session.is_authenticated() {
        let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref())
        else {
            bail!("no stored session; pass --email and --password to sign in");
        };
        let outcome = session.login(email, password, args.remember_me).await;
        if !outcome.success {
            bail!(
                "sign-in failed: {}",
                outcome.error.unwrap_or_else(|| "unknown error".into())
            );
        }
    }

    if let Some(user) = session.user() {
        info!(user_id = %user.id, role = %user.role, "Signed in");
    }

    let users = users_feed(&sync);
    let feeds = [
        orders_feed(&sync),
        notifications_feed(&sync),
        stats_feed(&sync),
    ];
    spawn_feed_logger(&users);
    for feed in &feeds {
        spawn_feed_logger(feed);
    }

    shutdown_signal().await;

    for feed in &feeds {
        feed.stop();
    }
    users.stop();
    sync.shutdown().await;
    info!("Client stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn log_auth_events(session: &AuthSession) {
    let listener = Arc::new(|event: &AuthEvent| match event {
        AuthEvent::SessionStarted(user) => info!(email = %user.email, "Session started"),
        AuthEvent::SessionEnded => info!("Session ended"),
        AuthEvent::Notice(message) => warn!(%message, "Auth notice"),
    });
    for kind in [
        AuthEventKind::SessionStarted,
        AuthEventKind::SessionEnded,
        AuthEventKind::Notice,
    ] {
        session.on(kind, listener.clone());
    }
}

fn spawn_connection_logger(sync: &OrchestratorHandle) {
    let mut state = sync.watch_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            match &current.connection_error {
                Some(err) => error!(
                    attempts = current.reconnect_attempts,
                    error = %err,
                    "Realtime connection error"
                ),
                None => info!(
                    connected = current.is_connected,
                    connecting = current.is_connecting,
                    last_sync = ?current.last_sync_time,
                    "Realtime connection state"
                ),
            }
        }
    });
}

fn spawn_feed_logger(feed: &RealtimeFeed) {
    let channel = feed.channel();
    let mut state = feed.watch();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            if let Some(err) = &current.error {
                warn!(channel, error = %err, "Feed error");
            } else if let Some(data) = &current.data {
                info!(channel, items = item_count(data), "Feed updated");
            }
        }
    });
}

fn item_count(data: &Value) -> usize {
    match data {
        Value::Array(items) => items.len(),
        Value::Object(fields) => fields.len(),
        Value::Null => 0,
        _ => 1,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
