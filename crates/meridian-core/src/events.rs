//! # Event Emitter
//!
//! Minimal typed publish/subscribe used to decouple socket callbacks from
//! their consumers.
//!
//! ```text
//!   on(kind, listener) ──► ┌────────────────────────────────┐
//!   off(kind, &listener) ─►│ HashMap<Kind, Vec<Listener>>   │
//!                          └──────────────┬─────────────────┘
//!   emit(&event) ── snapshot listeners ───┘
//!        │          (lock released)
//!        ▼
//!   call each listener under catch_unwind
//!   a panicking listener is logged, the rest still run
//! ```
//!
//! Registering the same `Arc` twice for a kind is a no-op: identity is the
//! pointer, which gives set semantics without requiring `Eq` on closures.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// An event that can be routed by a discriminant.
pub trait EventKey {
    /// Discriminant listeners register against.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// A registered callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Typed listener registry.
pub struct EventEmitter<E: EventKey> {
    listeners: Mutex<HashMap<E::Kind, Vec<Listener<E>>>>,
}

impl<E: EventKey> Default for EventEmitter<E> {
    fn default() -> Self {
        EventEmitter {
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl<E: EventKey> EventEmitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `kind`. Returns false if it was already registered.
    pub fn on(&self, kind: E::Kind, listener: Listener<E>) -> bool {
        let mut map = self.listeners.lock();
        let set = map.entry(kind).or_default();
        if set.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        set.push(listener);
        true
    }

    /// Removes `listener` from `kind`. Unknown kinds or listeners are ignored.
    pub fn off(&self, kind: E::Kind, listener: &Listener<E>) {
        let mut map = self.listeners.lock();
        if let Some(set) = map.get_mut(&kind) {
            set.retain(|l| !Arc::ptr_eq(l, listener));
            if set.is_empty() {
                map.remove(&kind);
            }
        }
    }

    /// Invokes every listener of the event's kind.
    pub fn emit(&self, event: &E) {
        let kind = event.kind();
        // Listeners may call on/off re-entrantly
        let snapshot: Vec<Listener<E>> = match self.listeners.lock().get(&kind) {
            Some(set) => set.clone(),
            None => return,
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(?kind, "Event listener panicked");
            }
        }
    }

    /// Clears one kind, or every kind when `kind` is `None`.
    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        let mut map = self.listeners.lock();
        match kind {
            Some(kind) => {
                map.remove(&kind);
            }
            None => map.clear(),
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    enum Ping {
        A(u32),
        B,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum PingKind {
        A,
        B,
    }

    impl EventKey for Ping {
        type Kind = PingKind;
        fn kind(&self) -> PingKind {
            match self {
                Ping::A(_) => PingKind::A,
                Ping::B => PingKind::B,
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Listener<Ping>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let listener: Listener<Ping> = Arc::new(move |_: &Ping| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (hits, listener)
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let emitter = EventEmitter::<Ping>::new();
        let (hits, listener) = counter();

        assert!(emitter.on(PingKind::A, listener.clone()));
        assert!(!emitter.on(PingKind::A, listener.clone()));
        emitter.emit(&Ping::A(1));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(PingKind::A), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let emitter = EventEmitter::<Ping>::new();
        let (hits, listener) = counter();

        emitter.on(PingKind::A, Arc::new(|_: &Ping| panic!("boom")));
        emitter.on(PingKind::A, listener);
        emitter.emit(&Ping::A(7));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_unknown_is_noop() {
        let emitter = EventEmitter::<Ping>::new();
        let (_, listener) = counter();
        emitter.off(PingKind::B, &listener);

        let (hits, registered) = counter();
        emitter.on(PingKind::A, registered);
        emitter.off(PingKind::A, &listener);
        emitter.emit(&Ping::A(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all_listeners() {
        let emitter = EventEmitter::<Ping>::new();
        let (hits_a, a) = counter();
        let (hits_b, b) = counter();
        emitter.on(PingKind::A, a);
        emitter.on(PingKind::B, b);

        emitter.remove_all_listeners(Some(PingKind::A));
        emitter.emit(&Ping::A(0));
        emitter.emit(&Ping::B);
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);

        emitter.remove_all_listeners(None);
        emitter.emit(&Ping::B);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_reenter() {
        let emitter = Arc::new(EventEmitter::<Ping>::new());
        let inner = emitter.clone();
        emitter.on(
            PingKind::B,
            Arc::new(move |_: &Ping| {
                inner.remove_all_listeners(Some(PingKind::B));
            }),
        );
        emitter.emit(&Ping::B);
        assert_eq!(emitter.listener_count(PingKind::B), 0);
    }
}
