//! Session registry.
//!
//! Maps session keys to transports, creating at most one transport per key
//! no matter how many requests for that key arrive at once.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             SessionRegistry              │
//! │  ┌────────────────────────────────────┐  │
//! │  │ "s1" → Ready(transport A)          │  │
//! │  │ "s2" → Pending(shared creation)    │◄─┼── waiters await the same future
//! │  │ "s3" → Ready(transport A)  (alias) │  │
//! │  └────────────────────────────────────┘  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The check-and-insert of a Pending entry happens under the state lock with
//! no await in between. The creation itself runs in its own task, so the
//! waiters that started it may go away without stalling the others.
//!
//! # Capacity
//!
//! A session occupies one slot however many keys point at it. Pending
//! creations and anonymous creations in flight hold a slot too, reserved
//! under the same lock that checks the cap.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{CreationId, SessionKey};
use crate::request::{InboundRequest, context};
use crate::transport::{LifecycleObserver, SessionHooks, Transport};

use super::builder::RegistryBuilder;
use super::entry::{CreationOutcome, Entry, PendingCreation, SharedCreation};
use super::factory::{TransportFactory, create_session};
use super::options::RegistryOptions;

// ============================================================================
// Types
// ============================================================================

type TransportOf<F> = <F as TransportFactory>::Transport;

type ResponseOf<F> = <TransportOf<F> as Transport>::Response;

type EntryMap<T> = FxHashMap<SessionKey, Entry<T>>;

// ============================================================================
// RegistryState
// ============================================================================

/// Everything guarded by the registry lock.
struct RegistryState<T> {
    /// Entries by session key.
    entries: EntryMap<T>,
    /// Pending creations removed before they finished.
    detached: FxHashSet<CreationId>,
    /// Anonymous creations in flight.
    anonymous: usize,
}

impl<T> RegistryState<T> {
    fn new() -> Self {
        Self {
            entries: EntryMap::default(),
            detached: FxHashSet::default(),
            anonymous: 0,
        }
    }

    /// Slots in use: distinct ready transports, pending creations and
    /// anonymous creations in flight.
    fn occupied(&self) -> usize {
        let mut transports = FxHashSet::default();
        let mut pending = 0;

        for entry in self.entries.values() {
            match entry {
                Entry::Pending(_) => pending += 1,
                Entry::Ready(transport) => {
                    transports.insert(Arc::as_ptr(transport) as usize);
                }
            }
        }

        transports.len() + pending + self.anonymous
    }

    /// Removes every entry holding `transport`, whatever its key.
    fn purge(&mut self, transport: &Arc<T>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.holds(transport));
        before - self.entries.len()
    }
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Hands out one long-lived transport per session key.
///
/// Cheap to clone; clones share the same map. Owned by the server's
/// composition root and passed to the HTTP adapter.
///
/// # Example
///
/// ```ignore
/// let registry = SessionRegistry::builder().build(factory)?;
///
/// let key = request.session_key()?;
/// let response = registry.dispatch(key, request).await?;
/// ```
pub struct SessionRegistry<F: TransportFactory> {
    inner: Arc<RegistryInner<F>>,
}

/// Shared state behind every registry clone.
struct RegistryInner<F: TransportFactory> {
    /// Builds transports.
    factory: F,
    /// Creation and capacity policies.
    options: RegistryOptions,
    /// Entries and slot bookkeeping.
    state: Mutex<RegistryState<TransportOf<F>>>,
    /// Set once by `shutdown`.
    shutdown: AtomicBool,
}

impl<F: TransportFactory> Clone for SessionRegistry<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: TransportFactory> fmt::Debug for SessionRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("options", &self.inner.options)
            .field("entries", &self.len())
            .field("pending", &self.pending_count())
            .field("shutdown", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SessionRegistry - Constructor
// ============================================================================

impl<F: TransportFactory> SessionRegistry<F> {
    /// Creates a configuration builder for the registry.
    ///
    /// The factory type is inferred from the argument to
    /// [`RegistryBuilder::build`].
    #[inline]
    #[must_use]
    pub fn builder() -> RegistryBuilder<F> {
        RegistryBuilder::new()
    }

    /// Creates a registry around `factory` with already validated options.
    pub(crate) fn new(factory: F, options: RegistryOptions) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                options,
                state: Mutex::new(RegistryState::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}

// ============================================================================
// SessionRegistry - Public API
// ============================================================================

impl<F: TransportFactory> SessionRegistry<F> {
    /// Returns the transport for `key`, creating it if needed.
    ///
    /// - Ready entry: returned immediately.
    /// - Pending entry: awaits the creation already in flight.
    /// - No entry: starts the one creation every concurrent caller shares.
    /// - `None`: always creates a new transport; it becomes reachable under
    ///   the key its handshake settles on.
    ///
    /// # Errors
    ///
    /// - [`Error::CreationFailed`] if the factory or handshake failed, for
    ///   every caller waiting on that creation
    /// - [`Error::CapacityExceeded`] if a new session would exceed the cap
    /// - [`Error::RegistryShutdown`] after [`shutdown`](Self::shutdown)
    pub async fn acquire(&self, key: Option<SessionKey>) -> Result<Arc<TransportOf<F>>> {
        self.ensure_open()?;

        let Some(key) = key else {
            return self.create_anonymous().await;
        };

        let creation = {
            let mut state = self.inner.state.lock();
            match state.entries.get(&key) {
                Some(Entry::Ready(transport)) => {
                    trace!(key = %key, "Reusing ready transport");
                    return Ok(Arc::clone(transport));
                }
                Some(Entry::Pending(pending)) => {
                    debug!(key = %key, creation = %pending.id, "Joining creation in flight");
                    pending.future.clone()
                }
                None => {
                    self.check_capacity(&state)?;

                    let id = CreationId::next();
                    let future = self.spawn_creation(id, key.clone());
                    state.entries.insert(
                        key.clone(),
                        Entry::Pending(PendingCreation {
                            id,
                            future: future.clone(),
                        }),
                    );

                    debug!(key = %key, creation = %id, "Creation started");
                    future
                }
            }
        };

        creation
            .await
            .map_err(|source| Error::creation_failed(Some(key), source))
    }

    /// Acquires the transport for `key` and forwards `request` into it.
    ///
    /// The request is the current request (see [`context`]) for the whole
    /// call.
    ///
    /// # Errors
    ///
    /// Everything [`acquire`](Self::acquire) and the transport's `handle` return.
    pub async fn dispatch(
        &self,
        key: Option<SessionKey>,
        request: impl Into<Arc<InboundRequest>>,
    ) -> Result<ResponseOf<F>> {
        let transport = self.acquire(key).await?;
        let request = request.into();
        context::scope(Arc::clone(&request), transport.handle(request)).await
    }

    /// Returns the ready transport for `key` without creating one.
    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<TransportOf<F>>> {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .and_then(Entry::ready)
            .cloned()
    }

    /// Returns `true` if `key` has a pending or ready entry.
    #[must_use]
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    /// Returns the number of entries, pending and ready.
    ///
    /// Aliases count once per key; see [`session_count`](Self::session_count)
    /// for distinct sessions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Returns `true` if the registry holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }

    /// Returns the number of capacity slots in use.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().occupied()
    }

    /// Returns the number of keyed creations in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Pending(_)))
            .count()
    }

    /// Returns every key with an entry.
    #[must_use]
    pub fn keys(&self) -> Vec<SessionKey> {
        self.inner.state.lock().entries.keys().cloned().collect()
    }

    /// Returns the registry options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Returns the transport factory.
    #[inline]
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

// ============================================================================
// SessionRegistry - Lifecycle
// ============================================================================

impl<F: TransportFactory> SessionRegistry<F> {
    /// Removes `key` and closes its transport.
    ///
    /// Other keys pointing at the same transport are removed too. A pending
    /// entry is detached: the creation runs to its end, its transport is
    /// closed instead of installed, and its waiters get
    /// [`Error::TransportClosed`].
    ///
    /// Returns `false` if `key` had no entry.
    ///
    /// # Errors
    ///
    /// Returns the transport's `close` error.
    pub async fn remove(&self, key: &SessionKey) -> Result<bool> {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.entries.remove(key);
            match &removed {
                Some(Entry::Ready(transport)) => {
                    state.purge(transport);
                }
                Some(Entry::Pending(pending)) => {
                    state.detached.insert(pending.id);
                }
                None => {}
            }
            removed
        };

        match removed {
            Some(Entry::Ready(transport)) => {
                debug!(key = %key, "Session removed from registry");
                transport.close().await?;
                Ok(true)
            }
            Some(Entry::Pending(pending)) => {
                debug!(key = %key, creation = %pending.id, "Pending session detached from registry");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refuses new sessions and closes every ready transport.
    ///
    /// Creations still in flight close their transport when they finish.
    pub async fn shutdown(&self) {
        info!("SessionRegistry shutting down");

        self.inner.shutdown.store(true, Ordering::SeqCst);

        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.entries.drain().collect()
        };

        let mut transports: Vec<Arc<TransportOf<F>>> = Vec::new();
        for (_, entry) in drained {
            if let Entry::Ready(transport) = entry
                && !transports.iter().any(|seen| Arc::ptr_eq(seen, &transport))
            {
                transports.push(transport);
            }
        }

        for transport in transports {
            if let Err(e) = transport.close().await {
                warn!(key = ?transport.session_key(), error = %e, "Transport close failed during shutdown");
            }
        }

        info!("SessionRegistry shutdown complete");
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) was called.
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SessionRegistry - Creation
// ============================================================================

impl<F: TransportFactory> SessionRegistry<F> {
    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::RegistryShutdown);
        }
        Ok(())
    }

    /// Fails if no slot is free. Called with the state lock held.
    fn check_capacity(&self, state: &RegistryState<TransportOf<F>>) -> Result<()> {
        if let Some(max) = self.inner.options.max_sessions {
            let occupied = state.occupied();
            if occupied >= max {
                warn!(occupied, max, "Session capacity reached");
                return Err(Error::capacity_exceeded(max));
            }
        }
        Ok(())
    }

    /// Creates a transport nobody else can join.
    async fn create_anonymous(&self) -> Result<Arc<TransportOf<F>>> {
        let _slot = {
            let mut state = self.inner.state.lock();
            self.check_capacity(&state)?;
            state.anonymous += 1;
            AnonymousSlot { inner: &self.inner }
        };

        self.run_creation(None, None)
            .await
            .map_err(|source| Error::creation_failed(None, source))
    }

    /// Starts the creation for `key` on its own task.
    ///
    /// Called with the state lock held; must not block.
    fn spawn_creation(&self, id: CreationId, key: SessionKey) -> SharedCreation<TransportOf<F>> {
        let registry = self.clone();
        let task_key = key.clone();
        let handle =
            tokio::spawn(async move { registry.run_creation(Some(id), Some(task_key)).await });

        let inner = Arc::downgrade(&self.inner);
        handle
            .map(move |joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(key = %key, error = %e, "Creation task failed");
                    if let Some(inner) = inner.upgrade() {
                        inner.remove_pending(&key, id);
                        inner.forget_detached(id);
                    }
                    Err(Arc::new(Error::join(e.to_string())))
                }
            })
            .boxed()
            .shared()
    }

    /// Runs one creation and settles the registry for it.
    ///
    /// `id` and `key` are both set for keyed creations and both `None` for
    /// anonymous ones.
    async fn run_creation(
        &self,
        id: Option<CreationId>,
        key: Option<SessionKey>,
    ) -> CreationOutcome<TransportOf<F>> {
        let observer = Arc::new(CreationObserver::<F>::new(Arc::downgrade(&self.inner), id));
        let hooks = SessionHooks::new(Arc::clone(&observer) as Arc<dyn LifecycleObserver>);

        let created = create_session(
            &self.inner.factory,
            key.as_ref(),
            hooks,
            self.inner.options.creation_timeout,
            |transport| observer.bind(transport),
        )
        .await;

        let partial = match created {
            Ok(session) => {
                let transport = session.transport;

                let refusal = if self.is_shut_down() {
                    Some(Error::RegistryShutdown)
                } else if id.is_some_and(|id| self.inner.is_detached(id)) {
                    Some(Error::TransportClosed)
                } else {
                    None
                };

                if let Some(refusal) = refusal {
                    self.discard(&observer, id, &transport).await;
                    debug!(key = ?key, error = %refusal, "Created session discarded");
                    return Err(Arc::new(refusal));
                }

                if let (Some(id), Some(key)) = (id, key.as_ref()) {
                    if observer.is_closed() {
                        self.inner.remove_pending(key, id);
                    } else {
                        self.inner.promote(key, id, &transport);
                    }
                }

                info!(key = ?key, settled = ?transport.session_key(), "Session created");
                return Ok(transport);
            }
            Err(partial) => *partial,
        };

        observer.abandon();
        if let (Some(id), Some(key)) = (id, key.as_ref()) {
            self.inner.remove_pending(key, id);
        }
        if let Some(id) = id {
            self.inner.forget_detached(id);
        }
        if let Some(transport) = &partial.transport {
            let purged = self.inner.state.lock().purge(transport);
            if purged > 0 {
                debug!(key = ?key, purged, "Purged entries of failed transport");
            }
        }

        let error = partial.cleanup().await;
        warn!(key = ?key, error = %error, "Session creation failed");
        Err(Arc::new(error))
    }

    /// Keeps a finished transport out of the registry and closes it.
    async fn discard(
        &self,
        observer: &CreationObserver<F>,
        id: Option<CreationId>,
        transport: &Arc<TransportOf<F>>,
    ) {
        observer.abandon();
        {
            let mut state = self.inner.state.lock();
            if let Some(id) = id {
                state.detached.remove(&id);
            }
            state.purge(transport);
        }

        if let Err(e) = transport.close().await {
            warn!(key = ?transport.session_key(), error = %e, "Transport close failed while discarding");
        }
    }
}

// ============================================================================
// AnonymousSlot
// ============================================================================

/// Capacity slot held by one anonymous creation; released on drop.
struct AnonymousSlot<'a, F: TransportFactory> {
    inner: &'a RegistryInner<F>,
}

impl<F: TransportFactory> Drop for AnonymousSlot<'_, F> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.anonymous = state.anonymous.saturating_sub(1);
    }
}

// ============================================================================
// RegistryInner - Mutations
// ============================================================================

impl<F: TransportFactory> RegistryInner<F> {
    /// Replaces creation `id`'s pending entry with its transport.
    fn promote(&self, key: &SessionKey, id: CreationId, transport: &Arc<TransportOf<F>>) {
        let mut state = self.state.lock();
        let (owned, installed) = match state.entries.get(key) {
            Some(entry) => (entry.is_pending(id), entry.holds(transport)),
            None => (false, false),
        };

        if owned {
            state
                .entries
                .insert(key.clone(), Entry::Ready(Arc::clone(transport)));
        } else if !installed {
            debug!(key = %key, creation = %id, "Entry changed during creation, not promoting");
        }
    }

    /// Removes creation `id`'s pending entry, leaving any newer entry alone.
    fn remove_pending(&self, key: &SessionKey, id: CreationId) -> bool {
        let mut state = self.state.lock();
        let owned = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_pending(id));
        if owned {
            state.entries.remove(key);
        }
        owned
    }

    fn is_detached(&self, id: CreationId) -> bool {
        self.state.lock().detached.contains(&id)
    }

    fn forget_detached(&self, id: CreationId) {
        self.state.lock().detached.remove(&id);
    }

    /// Installs `transport` under a key reported by its handshake.
    fn install(
        &self,
        key: &SessionKey,
        transport: &Arc<TransportOf<F>>,
        creation: Option<CreationId>,
    ) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock();
        if let Some(id) = creation
            && state.detached.contains(&id)
        {
            debug!(key = %key, creation = %id, "Creation detached, not installing");
            return;
        }

        match state.entries.get(key) {
            Some(entry) if entry.holds(transport) => return,
            Some(Entry::Pending(pending)) if Some(pending.id) != creation => {
                warn!(key = %key, creation = %pending.id, "Handshake key is being created elsewhere, not installing");
                return;
            }
            Some(Entry::Ready(_)) => {
                warn!(key = %key, "Handshake key already in use, replacing transport");
            }
            _ => {}
        }

        state
            .entries
            .insert(key.clone(), Entry::Ready(Arc::clone(transport)));
        debug!(key = %key, "Transport installed");
    }

    /// Drops the entry of a closed session and every alias of its transport.
    ///
    /// A pending entry under `key` belongs to a newer creation and is kept.
    fn remove_closed(&self, key: &SessionKey, transport: Option<&Arc<TransportOf<F>>>) {
        let mut state = self.state.lock();
        if !matches!(state.entries.get(key), Some(Entry::Pending(_))) {
            state.entries.remove(key);
        }
        if let Some(transport) = transport {
            state.purge(transport);
        }
    }
}

// ============================================================================
// CreationObserver
// ============================================================================

struct ObserverState<T> {
    transport: Option<Weak<T>>,
    initialized: Option<SessionKey>,
    abandoned: bool,
    closed: bool,
}

/// Lifecycle observer for one creation.
///
/// The handshake may report its key before or after the registry learns
/// about the transport; whichever comes second installs the entry.
struct CreationObserver<F: TransportFactory> {
    registry: Weak<RegistryInner<F>>,
    creation: Option<CreationId>,
    state: Mutex<ObserverState<TransportOf<F>>>,
}

impl<F: TransportFactory> CreationObserver<F> {
    fn new(registry: Weak<RegistryInner<F>>, creation: Option<CreationId>) -> Self {
        Self {
            registry,
            creation,
            state: Mutex::new(ObserverState {
                transport: None,
                initialized: None,
                abandoned: false,
                closed: false,
            }),
        }
    }

    /// Records the constructed transport.
    fn bind(&self, transport: &Arc<TransportOf<F>>) {
        let key = {
            let mut state = self.state.lock();
            state.transport = Some(Arc::downgrade(transport));
            if state.abandoned {
                None
            } else {
                state.initialized.clone()
            }
        };

        if let Some(key) = key {
            self.install(&key, transport);
        }
    }

    /// Stops installing entries; the creation failed.
    fn abandon(&self) {
        self.state.lock().abandoned = true;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn install(&self, key: &SessionKey, transport: &Arc<TransportOf<F>>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.install(key, transport, self.creation);
        }
    }
}

impl<F: TransportFactory> LifecycleObserver for CreationObserver<F> {
    fn on_initialized(&self, key: &SessionKey) {
        let transport = {
            let mut state = self.state.lock();
            state.initialized = Some(key.clone());
            if state.abandoned {
                None
            } else {
                state.transport.as_ref().and_then(Weak::upgrade)
            }
        };

        if let Some(transport) = transport {
            self.install(key, &transport);
        }
    }

    fn on_closed(&self, key: &SessionKey) {
        let transport = {
            let mut state = self.state.lock();
            state.closed = true;
            state.transport.as_ref().and_then(Weak::upgrade)
        };

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_closed(key, transport.as_ref());
            info!(key = %key, "Session closed, entry removed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::future::join_all;
    use serde_json::Value;

    use crate::transport::HandlerSet;

    // ------------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------------

    #[derive(Debug)]
    struct MockTransport {
        number: usize,
        hooks: SessionHooks,
        key: Mutex<Option<SessionKey>>,
        close_calls: AtomicUsize,
        /// Closes across every transport of the factory.
        closes: Arc<AtomicUsize>,
    }

    impl MockTransport {
        /// Simulates the remote end ending the session.
        fn remote_close(&self) {
            if let Some(key) = self.key.lock().clone() {
                self.hooks.closed(&key);
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Response = (usize, Option<String>, bool);

        async fn handle(&self, request: Arc<InboundRequest>) -> Result<Self::Response> {
            let current = context::current();
            let path = current.as_ref().map(|r| r.url.path().to_string());
            let shared = current.is_some_and(|r| Arc::ptr_eq(&r, &request));
            Ok((self.number, path, shared))
        }

        async fn close(&self) -> Result<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.remote_close();
            Ok(())
        }

        fn session_key(&self) -> Option<SessionKey> {
            self.key.lock().clone()
        }
    }

    struct MockTools {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HandlerSet for MockTools {
        async fn call(&self, _request: Arc<InboundRequest>) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        created: AtomicUsize,
        delay: Duration,
        hang: bool,
        fail_key: Option<&'static str>,
        assign_key: Option<&'static str>,
        fail_after_init: bool,
        /// Delay between `initialized` and the end of the handshake.
        linger: Duration,
        transport_closes: Arc<AtomicUsize>,
        handler_closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        type Transport = MockTransport;
        type Handlers = MockTools;

        fn handlers(&self) -> Result<MockTools> {
            Ok(MockTools {
                closes: Arc::clone(&self.handler_closes),
            })
        }

        fn transport(&self, desired: Option<&SessionKey>, hooks: SessionHooks) -> Result<MockTransport> {
            let number = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MockTransport {
                number,
                hooks,
                key: Mutex::new(desired.cloned()),
                close_calls: AtomicUsize::new(0),
                closes: Arc::clone(&self.transport_closes),
            })
        }

        async fn connect(&self, transport: &Arc<MockTransport>, _handlers: &Arc<MockTools>) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            if self.hang {
                std::future::pending::<()>().await;
            }

            let desired = transport.key.lock().clone();
            let key = match (self.assign_key, desired) {
                (Some(assigned), _) => SessionKey::new(assigned)?,
                (None, Some(key)) => key,
                (None, None) => SessionKey::generate(),
            };
            *transport.key.lock() = Some(key.clone());

            if self.fail_after_init {
                transport.hooks.initialized(&key);
                return Err(Error::handshake("failed after initialized"));
            }
            if self.fail_key == Some(key.as_str()) {
                return Err(Error::handshake("refused"));
            }

            transport.hooks.initialized(&key);
            tokio::time::sleep(self.linger).await;
            Ok(())
        }
    }

    fn key(value: &str) -> SessionKey {
        SessionKey::new(value).unwrap()
    }

    fn registry(factory: MockFactory) -> SessionRegistry<MockFactory> {
        SessionRegistry::builder().build(factory).unwrap()
    }

    fn slow() -> MockFactory {
        MockFactory {
            delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn created(registry: &SessionRegistry<MockFactory>) -> usize {
        registry.factory().created.load(Ordering::SeqCst)
    }

    fn transport_closes(registry: &SessionRegistry<MockFactory>) -> usize {
        registry.factory().transport_closes.load(Ordering::SeqCst)
    }

    fn handler_closes(registry: &SessionRegistry<MockFactory>) -> usize {
        registry.factory().handler_closes.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Singleflight
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_back_to_back_acquire_shares_instance() {
        let registry = registry(slow());

        let first = registry.acquire(Some(key("s1")));
        let second = registry.acquire(Some(key("s1")));
        let (first, second) = tokio::join!(first, second);

        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(created(&registry), 1);
    }

    #[tokio::test]
    async fn test_many_concurrent_callers_share_instance() {
        let registry = registry(slow());

        let results = join_all((0..16).map(|_| registry.acquire(Some(key("s1"))))).await;
        let transports: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

        assert!(transports.iter().all(|t| Arc::ptr_eq(t, &transports[0])));
        assert_eq!(created(&registry), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_across_threads_share_instance() {
        let registry = registry(slow());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.acquire(Some(key("shared"))).await })
            })
            .collect();

        let mut transports = Vec::new();
        for handle in handles {
            transports.push(handle.await.unwrap().unwrap());
        }

        assert!(transports.iter().all(|t| Arc::ptr_eq(t, &transports[0])));
        assert_eq!(created(&registry), 1);
    }

    #[tokio::test]
    async fn test_pending_entry_visible_during_creation() {
        let registry = registry(slow());

        let acquire = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(Some(key("s1"))).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(registry.contains(&key("s1")));
        assert_eq!(registry.pending_count(), 1);
        assert!(registry.get(&key("s1")).is_none());

        let transport = acquire.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&registry.get(&key("s1")).unwrap(), &transport));
    }

    #[tokio::test]
    async fn test_ready_entry_reused_without_new_creation() {
        let registry = registry(MockFactory::default());

        let first = registry.acquire(Some(key("s1"))).await.unwrap();
        let second = registry.acquire(Some(key("s1"))).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created(&registry), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_instances() {
        let registry = registry(slow());

        let (a, b) = tokio::join!(
            registry.acquire(Some(key("k1"))),
            registry.acquire(Some(key("k2")))
        );

        assert!(!Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(created(&registry), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_stall_creation() {
        let registry = registry(MockFactory {
            delay: Duration::from_millis(50),
            ..Default::default()
        });

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), registry.acquire(Some(key("s1")))).await;
        assert!(abandoned.is_err());

        let transport = registry.acquire(Some(key("s1"))).await.unwrap();
        assert_eq!(transport.number, 1);
        assert_eq!(created(&registry), 1);
    }

    // ------------------------------------------------------------------------
    // Close handling
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_closed_session_gets_fresh_instance() {
        let registry = registry(MockFactory::default());

        let first = registry.acquire(Some(key("s1"))).await.unwrap();
        first.remote_close();
        assert!(!registry.contains(&key("s1")));

        let second = registry.acquire(Some(key("s1"))).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(created(&registry), 2);
    }

    #[tokio::test]
    async fn test_handshake_key_is_alias_and_close_removes_both() {
        let registry = SessionRegistry::builder()
            .build(MockFactory {
                assign_key: Some("assigned"),
                ..Default::default()
            })
            .unwrap();

        let transport = registry.acquire(Some(key("desired"))).await.unwrap();
        let by_desired = registry.get(&key("desired")).unwrap();
        let by_assigned = registry.get(&key("assigned")).unwrap();
        assert!(Arc::ptr_eq(&transport, &by_desired));
        assert!(Arc::ptr_eq(&transport, &by_assigned));
        assert_eq!(registry.keys().len(), 2);

        transport.remote_close();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_closes_transport() {
        let registry = registry(MockFactory::default());
        let transport = registry.acquire(Some(key("s1"))).await.unwrap();

        assert!(registry.remove(&key("s1")).await.unwrap());
        assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(&key("s1")));
        assert!(!registry.remove(&key("s1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_pending_keeps_result_out() {
        let registry = registry(slow());

        let acquire = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(Some(key("s1"))).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(registry.remove(&key("s1")).await.unwrap());

        let err = acquire.await.unwrap().unwrap_err();
        assert!(matches!(err.root_cause(), Error::TransportClosed));
        assert!(!registry.contains(&key("s1")));
        assert!(registry.is_empty());
        assert_eq!(transport_closes(&registry), 1);

        // A later acquire starts over.
        let fresh = registry.acquire(Some(key("s1"))).await.unwrap();
        assert_eq!(fresh.number, 2);
    }

    #[tokio::test]
    async fn test_remove_pending_after_initialized_closes_alias() {
        let registry = SessionRegistry::builder()
            .build(MockFactory {
                assign_key: Some("assigned"),
                linger: Duration::from_millis(30),
                ..Default::default()
            })
            .unwrap();

        let acquire = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(Some(key("desired"))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Handshake key installed, requested key still pending.
        assert!(registry.get(&key("assigned")).is_some());
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.remove(&key("desired")).await.unwrap());

        assert!(acquire.await.unwrap().is_err());
        assert!(registry.is_empty());
        assert_eq!(transport_closes(&registry), 1);
    }

    // ------------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let registry = registry(MockFactory {
            fail_key: Some("bad"),
            ..Default::default()
        });

        let err = registry.acquire(Some(key("bad"))).await.unwrap_err();
        assert!(matches!(err, Error::CreationFailed { .. }));
        assert!(matches!(err.root_cause(), Error::Handshake { .. }));
        assert!(!registry.contains(&key("bad")));

        let err = registry.acquire(Some(key("bad"))).await.unwrap_err();
        assert!(err.is_creation_error());
        assert_eq!(created(&registry), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let registry = registry(MockFactory {
            delay: Duration::from_millis(20),
            fail_key: Some("bad"),
            ..Default::default()
        });

        let results = join_all((0..4).map(|_| registry.acquire(Some(key("bad"))))).await;
        assert!(results.iter().all(|r| matches!(r, Err(Error::CreationFailed { .. }))));
        assert_eq!(created(&registry), 1);
    }

    #[tokio::test]
    async fn test_failure_after_initialized_leaves_no_trace() {
        let registry = SessionRegistry::builder()
            .build(MockFactory {
                assign_key: Some("elsewhere"),
                fail_after_init: true,
                ..Default::default()
            })
            .unwrap();

        let err = registry.acquire(Some(key("bad"))).await.unwrap_err();
        assert!(matches!(err.root_cause(), Error::Handshake { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_transport_is_closed() {
        let registry = SessionRegistry::builder()
            .build(MockFactory {
                fail_after_init: true,
                ..Default::default()
            })
            .unwrap();

        assert!(registry.acquire(Some(key("bad"))).await.is_err());
        assert!(registry.is_empty());
        assert_eq!(transport_closes(&registry), 1);
        assert_eq!(handler_closes(&registry), 1);
    }

    #[tokio::test]
    async fn test_creation_timeout_behaves_like_failure() {
        let registry = SessionRegistry::builder()
            .creation_timeout(Duration::from_millis(20))
            .build(MockFactory {
                hang: true,
                ..Default::default()
            })
            .unwrap();

        let (a, b) = tokio::join!(
            registry.acquire(Some(key("stuck"))),
            registry.acquire(Some(key("stuck")))
        );
        assert!(a.unwrap_err().is_timeout());
        assert!(b.unwrap_err().is_timeout());
        assert!(registry.is_empty());
        assert_eq!(created(&registry), 1);
        assert_eq!(transport_closes(&registry), 1);
        assert_eq!(handler_closes(&registry), 1);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = SessionRegistry::builder()
            .max_sessions(1)
            .build(MockFactory::default())
            .unwrap();

        registry.acquire(Some(key("a"))).await.unwrap();
        let err = registry.acquire(Some(key("b"))).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 1 }));
        assert_eq!(created(&registry), 1);

        // Existing sessions stay reachable at capacity.
        assert!(registry.acquire(Some(key("a"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_counts_aliases_once() {
        let registry = SessionRegistry::builder()
            .max_sessions(1)
            .build(MockFactory {
                assign_key: Some("assigned"),
                ..Default::default()
            })
            .unwrap();

        registry.acquire(Some(key("desired"))).await.unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.session_count(), 1);

        let err = registry.acquire(Some(key("other"))).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 1 }));
        assert_eq!(created(&registry), 1);
    }

    #[tokio::test]
    async fn test_capacity_reserved_for_concurrent_anonymous() {
        let registry = SessionRegistry::builder()
            .max_sessions(1)
            .build(slow())
            .unwrap();

        let results = join_all((0..4).map(|_| registry.acquire(None))).await;

        let created_ok = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(Error::CapacityExceeded { max: 1 })))
            .count();
        assert_eq!(created_ok, 1);
        assert_eq!(refused, 3);
        assert_eq!(created(&registry), 1);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_anonymous_creation_releases_slot() {
        let registry = SessionRegistry::builder()
            .max_sessions(1)
            .build(MockFactory {
                delay: Duration::from_millis(50),
                ..Default::default()
            })
            .unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(5), registry.acquire(None)).await;
        assert!(abandoned.is_err());
        assert_eq!(registry.session_count(), 0);

        assert!(registry.acquire(Some(key("s1"))).await.is_ok());
    }

    // ------------------------------------------------------------------------
    // Anonymous sessions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_anonymous_never_shared() {
        let registry = registry(slow());

        let sequential_a = registry.acquire(None).await.unwrap();
        let sequential_b = registry.acquire(None).await.unwrap();
        let concurrent = join_all((0..4).map(|_| registry.acquire(None))).await;

        let mut all = vec![sequential_a, sequential_b];
        all.extend(concurrent.into_iter().map(|r| r.unwrap()));

        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert!(!Arc::ptr_eq(a, b));
            }
        }
    }

    #[tokio::test]
    async fn test_anonymous_registered_under_generated_key() {
        let registry = registry(MockFactory::default());

        let transport = registry.acquire(None).await.unwrap();
        let generated = transport.session_key().unwrap();

        let again = registry.acquire(Some(generated)).await.unwrap();
        assert!(Arc::ptr_eq(&transport, &again));
        assert_eq!(created(&registry), 1);
    }

    // ------------------------------------------------------------------------
    // Dispatch and lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_dispatch_scopes_request() {
        let registry = registry(MockFactory::default());
        let request = InboundRequest::new("POST", "https://example.com/mcp").unwrap();

        let (number, path, shared) = registry.dispatch(Some(key("s1")), request).await.unwrap();
        assert_eq!(number, 1);
        assert_eq!(path.as_deref(), Some("/mcp"));
        // The scoped request and the handled request are one allocation.
        assert!(shared);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_refuses() {
        let registry = registry(MockFactory::default());
        let a = registry.acquire(Some(key("a"))).await.unwrap();
        let b = registry.acquire(Some(key("b"))).await.unwrap();

        registry.shutdown().await;

        assert!(registry.is_empty());
        assert!(registry.is_shut_down());
        assert_eq!(a.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.close_calls.load(Ordering::SeqCst), 1);

        let err = registry.acquire(Some(key("a"))).await.unwrap_err();
        assert!(matches!(err, Error::RegistryShutdown));
    }
}
