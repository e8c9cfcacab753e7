//! Session lifecycle hooks.
//!
//! A transport reports two lifecycle events back to whoever created it:
//!
//! - `initialized(key)` once the handshake assigns or confirms the key
//! - `closed(key)` when the session is over
//!
//! [`SessionHooks`] is the handle a transport receives at construction. It
//! enforces the delivery contract (each event at most once, `closed` only
//! after `initialized`) and forwards to a [`LifecycleObserver`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::identifiers::SessionKey;

// ============================================================================
// LifecycleObserver
// ============================================================================

/// Receiver of transport lifecycle events.
///
/// Implementations must not block; they run on the transport's task.
pub trait LifecycleObserver: Send + Sync + 'static {
    /// The handshake settled on `key`.
    fn on_initialized(&self, key: &SessionKey);

    /// The session for `key` is over.
    fn on_closed(&self, key: &SessionKey);
}

/// Observer that ignores every event.
struct Detached;

impl LifecycleObserver for Detached {
    fn on_initialized(&self, _key: &SessionKey) {}

    fn on_closed(&self, _key: &SessionKey) {}
}

// ============================================================================
// SessionHooks
// ============================================================================

#[derive(Default)]
struct HookState {
    initialized: Option<SessionKey>,
    closed: bool,
}

/// Lifecycle callback handle given to a transport at construction.
///
/// Cheap to clone; clones share delivery state.
#[derive(Clone)]
pub struct SessionHooks {
    observer: Arc<dyn LifecycleObserver>,
    state: Arc<Mutex<HookState>>,
}

impl SessionHooks {
    /// Creates hooks forwarding to `observer`.
    #[must_use]
    pub fn new(observer: Arc<dyn LifecycleObserver>) -> Self {
        Self {
            observer,
            state: Arc::new(Mutex::new(HookState::default())),
        }
    }

    /// Creates hooks not attached to any registry.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(Arc::new(Detached))
    }

    /// Reports the handshake key.
    ///
    /// Returns `false` if an earlier call already delivered the event.
    pub fn initialized(&self, key: &SessionKey) -> bool {
        {
            let mut state = self.state.lock();
            if let Some(previous) = &state.initialized {
                warn!(key = %key, previous = %previous, "Duplicate initialized event ignored");
                return false;
            }
            state.initialized = Some(key.clone());
        }

        debug!(key = %key, "Session initialized");
        self.observer.on_initialized(key);
        true
    }

    /// Reports the end of the session.
    ///
    /// Returns `false` if the event was already delivered or arrives before
    /// `initialized`.
    pub fn closed(&self, key: &SessionKey) -> bool {
        {
            let mut state = self.state.lock();
            if state.initialized.is_none() {
                debug!(key = %key, "Closed before initialized, ignored");
                return false;
            }
            if state.closed {
                return false;
            }
            state.closed = true;
        }

        debug!(key = %key, "Session closed");
        self.observer.on_closed(key);
        true
    }

    /// Key delivered through `initialized`, if any.
    #[must_use]
    pub fn initialized_key(&self) -> Option<SessionKey> {
        self.state.lock().initialized.clone()
    }

    /// Returns `true` once `closed` was delivered.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionHooks")
            .field("initialized", &state.initialized)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
