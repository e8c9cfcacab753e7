//! In-process channel transport and its event loop.
//!
//! [`ChannelTransport`] drives a [`HandlerSet`] from a tokio task. Requests
//! travel over an mpsc channel; each is answered through a oneshot sender
//! kept in a correlation map until its handler call completes.
//!
//! # Event Loop
//!
//! The loop spawned by [`ChannelTransport::connect`] handles:
//!
//! - Incoming requests from [`Transport::handle`]
//! - Handler calls, run concurrently inside the request's context scope
//! - Removal of timed-out correlation entries
//! - Shutdown, after which pending requests fail and `closed` fires

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SessionKey;
use crate::request::{InboundRequest, context};

use super::hooks::SessionHooks;
use super::traits::{HandlerSet, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for one handler call.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on requests in flight per transport.
const DEFAULT_MAX_PENDING: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Map of request numbers to response channels.
type CorrelationMap = FxHashMap<u64, oneshot::Sender<Result<Value>>>;

// ============================================================================
// ChannelOptions
// ============================================================================

/// Limits applied by a [`ChannelTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Maximum time to wait for one handler call.
    pub request_timeout: Duration,

    /// Maximum requests in flight before new ones are rejected.
    pub max_pending: usize,
}

impl ChannelOptions {
    /// Creates options with default limits.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Sets the per-request timeout.
    #[inline]
    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Sets the in-flight request cap.
    #[inline]
    #[must_use]
    pub const fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Checks that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::config("request timeout must be non-zero"));
        }
        if self.max_pending == 0 {
            return Err(Error::config("max pending requests must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ChannelCommand
// ============================================================================

/// Internal commands for the event loop.
enum ChannelCommand {
    /// Run a request through the handler set.
    Handle {
        number: u64,
        request: Arc<InboundRequest>,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    /// Remove a timed-out correlation entry.
    RemoveCorrelation(u64),
    /// Shutdown the loop.
    Shutdown,
}

// ============================================================================
// ChannelTransport
// ============================================================================

/// Handle on a running event loop.
struct LoopHandle {
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    done_rx: watch::Receiver<bool>,
    key: SessionKey,
}

/// Transport that runs a [`HandlerSet`] on an in-process event loop.
///
/// Constructed unconnected; [`connect`](Self::connect) performs the
/// handshake that binds the handler set, settles the session key and fires
/// `initialized`. When the loop stops, for any reason, pending requests
/// fail with [`Error::TransportClosed`] and `closed` fires.
pub struct ChannelTransport {
    /// Key requested by the caller, if any.
    desired: Option<SessionKey>,
    /// Lifecycle hooks.
    hooks: SessionHooks,
    /// Limits.
    options: ChannelOptions,
    /// Set once by `connect`.
    running: OnceLock<LoopHandle>,
    /// Correlation map (shared with event loop).
    correlation: Arc<Mutex<CorrelationMap>>,
    /// Request numbering.
    next_number: AtomicU64,
}

impl ChannelTransport {
    /// Creates an unconnected transport.
    #[must_use]
    pub fn new(desired: Option<&SessionKey>, hooks: SessionHooks, options: ChannelOptions) -> Self {
        Self {
            desired: desired.cloned(),
            hooks,
            options,
            running: OnceLock::new(),
            correlation: Arc::new(Mutex::new(CorrelationMap::default())),
            next_number: AtomicU64::new(1),
        }
    }

    /// Binds `handlers` and starts the event loop.
    ///
    /// Uses the desired key, or generates one when none was given, and
    /// reports it through `initialized`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the transport is already connected.
    pub fn connect<H: HandlerSet>(&self, handlers: Arc<H>) -> Result<SessionKey> {
        let key = self.desired.clone().unwrap_or_else(SessionKey::generate);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        self.running
            .set(LoopHandle {
                command_tx,
                done_rx,
                key: key.clone(),
            })
            .map_err(|_| Error::handshake("transport already connected"))?;

        tokio::spawn(Self::run_event_loop(
            command_rx,
            Arc::clone(&self.correlation),
            handlers,
            self.hooks.clone(),
            key.clone(),
            done_tx,
        ));

        self.hooks.initialized(&key);
        Ok(key)
    }

    /// Returns `true` once `connect` succeeded and the loop has not stopped.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.running
            .get()
            .is_some_and(|running| !*running.done_rx.borrow())
    }

    /// Returns the number of requests in flight.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().len()
    }

    /// Sends a request and waits for the handler's result.
    async fn send(&self, request: Arc<InboundRequest>) -> Result<Value> {
        let running = self.running.get().ok_or(Error::NotConnected)?;

        // Check pending request limit
        {
            let correlation = self.correlation.lock();
            if correlation.len() >= self.options.max_pending {
                warn!(
                    pending = correlation.len(),
                    max = self.options.max_pending,
                    "Too many pending requests"
                );
                return Err(Error::too_many_pending(
                    correlation.len(),
                    self.options.max_pending,
                ));
            }
        }

        let number = self.next_number.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();

        running
            .command_tx
            .send(ChannelCommand::Handle {
                number,
                request,
                response_tx,
            })
            .map_err(|_| Error::TransportClosed)?;

        match timeout(self.options.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                let _ = running
                    .command_tx
                    .send(ChannelCommand::RemoveCorrelation(number));

                Err(Error::request_timeout(
                    self.options.request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Event loop that runs handler calls.
    async fn run_event_loop<H: HandlerSet>(
        mut command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        handlers: Arc<H>,
        hooks: SessionHooks,
        key: SessionKey,
        done_tx: watch::Sender<bool>,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(ChannelCommand::Handle { number, request, response_tx }) => {
                            correlation.lock().insert(number, response_tx);

                            let correlation = Arc::clone(&correlation);
                            let handlers = Arc::clone(&handlers);
                            in_flight.spawn(async move {
                                let result = context::scope(
                                    Arc::clone(&request),
                                    handlers.call(request),
                                )
                                .await;

                                if let Some(tx) = correlation.lock().remove(&number) {
                                    let _ = tx.send(result);
                                }
                            });

                            trace!(key = %key, number, "Request dispatched");
                        }

                        Some(ChannelCommand::RemoveCorrelation(number)) => {
                            correlation.lock().remove(&number);
                            debug!(key = %key, number, "Removed timed-out correlation");
                        }

                        Some(ChannelCommand::Shutdown) => {
                            debug!(key = %key, "Shutdown command received");
                            break;
                        }

                        None => {
                            debug!(key = %key, "Command channel closed");
                            break;
                        }
                    }
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(key = %key, error = %e, "Handler task failed");
                    }
                }
            }
        }

        in_flight.abort_all();
        Self::fail_pending_requests(&correlation);

        if let Err(e) = handlers.close().await {
            warn!(key = %key, error = %e, "Handler set close failed");
        }

        hooks.closed(&key);
        let _ = done_tx.send(true);

        debug!(key = %key, "Event loop terminated");
    }

    /// Fails all pending requests with TransportClosed error.
    fn fail_pending_requests(correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::TransportClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    type Response = Value;

    async fn handle(&self, request: Arc<InboundRequest>) -> Result<Value> {
        self.send(request).await
    }

    /// Stops the loop and waits until `closed` has fired.
    async fn close(&self) -> Result<()> {
        let Some(running) = self.running.get() else {
            return Ok(());
        };

        let _ = running.command_tx.send(ChannelCommand::Shutdown);

        let mut done_rx = running.done_rx.clone();
        // The sender is dropped only after the loop reports done.
        let _ = done_rx.wait_for(|done| *done).await;
        Ok(())
    }

    fn session_key(&self) -> Option<SessionKey> {
        self.running.get().map(|running| running.key.clone())
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("key", &self.session_key())
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
