//! Transport factory.
//!
//! Builds one matched pair of transport and handler set, wires the
//! lifecycle hooks, and runs the handshake binding them together.
//!
//! [`create_session`] drives a [`TransportFactory`] through its three steps.
//! A failure at any step comes back as a [`PartialSession`] holding whatever
//! was already constructed, so the caller can always close it.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::SessionKey;
use crate::transport::{ChannelOptions, ChannelTransport, HandlerSet, SessionHooks, Transport};

// ============================================================================
// TransportFactory
// ============================================================================

/// Produces transports and the handler sets they are bound to.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Transport type handed out by the registry.
    type Transport: Transport;

    /// Handler set bound to each transport.
    type Handlers: HandlerSet;

    /// Builds a fresh handler set.
    fn handlers(&self) -> Result<Self::Handlers>;

    /// Builds an unconnected transport.
    ///
    /// `desired` is `None` for anonymous sessions; the transport then picks
    /// its own key during the handshake. `hooks` must be kept by the
    /// transport and fired as its lifecycle progresses.
    fn transport(
        &self,
        desired: Option<&SessionKey>,
        hooks: SessionHooks,
    ) -> Result<Self::Transport>;

    /// Handshake binding `transport` to `handlers`.
    async fn connect(
        &self,
        transport: &Arc<Self::Transport>,
        handlers: &Arc<Self::Handlers>,
    ) -> Result<()>;
}

// ============================================================================
// Session
// ============================================================================

/// A connected transport and its handler set.
pub struct Session<T, H> {
    /// The transport.
    pub transport: Arc<T>,
    /// The handler set bound to it.
    pub handlers: Arc<H>,
}

impl<T, H> fmt::Debug for Session<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

// ============================================================================
// PartialSession
// ============================================================================

/// Outcome of a failed creation: the error plus whatever was constructed.
pub struct PartialSession<T, H> {
    /// The failure that stopped creation.
    pub error: Error,
    /// Transport, if it was constructed.
    pub transport: Option<Arc<T>>,
    /// Handler set, if it was constructed.
    pub handlers: Option<Arc<H>>,
}

impl<T: Transport, H: HandlerSet> PartialSession<T, H> {
    /// Closes the constructed parts best-effort and returns the original error.
    ///
    /// Failures while closing are logged and dropped.
    pub async fn cleanup(self) -> Error {
        if let Some(transport) = &self.transport
            && let Err(e) = transport.close().await
        {
            warn!(error = %e, "Failed to close transport after creation failure");
        }

        if let Some(handlers) = &self.handlers
            && let Err(e) = handlers.close().await
        {
            warn!(error = %e, "Failed to close handler set after creation failure");
        }

        self.error
    }
}

impl<T, H> fmt::Debug for PartialSession<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialSession")
            .field("error", &self.error)
            .field("transport", &self.transport.is_some())
            .field("handlers", &self.handlers.is_some())
            .finish()
    }
}

// ============================================================================
// create_session
// ============================================================================

/// Runs `factory` to produce a connected session.
///
/// `on_transport` sees the transport as soon as it exists, before the
/// handshake starts. The handshake is bounded by `handshake_timeout`;
/// expiry counts as a failure with [`Error::CreationTimeout`].
///
/// # Errors
///
/// Returns a [`PartialSession`] if any step fails.
pub async fn create_session<F, B>(
    factory: &F,
    desired: Option<&SessionKey>,
    hooks: SessionHooks,
    handshake_timeout: Duration,
    on_transport: B,
) -> std::result::Result<Session<F::Transport, F::Handlers>, Box<PartialSession<F::Transport, F::Handlers>>>
where
    F: TransportFactory + ?Sized,
    B: FnOnce(&Arc<F::Transport>),
{
    let handlers = match factory.handlers() {
        Ok(handlers) => Arc::new(handlers),
        Err(error) => {
            return Err(Box::new(PartialSession {
                error,
                transport: None,
                handlers: None,
            }));
        }
    };

    let transport = match factory.transport(desired, hooks) {
        Ok(transport) => Arc::new(transport),
        Err(error) => {
            return Err(Box::new(PartialSession {
                error,
                transport: None,
                handlers: Some(handlers),
            }));
        }
    };

    on_transport(&transport);

    let outcome = match timeout(handshake_timeout, factory.connect(&transport, &handlers)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::creation_timeout(handshake_timeout.as_millis() as u64)),
    };

    match outcome {
        Ok(()) => {
            debug!(key = ?transport.session_key(), "Session handshake completed");
            Ok(Session {
                transport,
                handlers,
            })
        }
        Err(error) => Err(Box::new(PartialSession {
            error,
            transport: Some(transport),
            handlers: Some(handlers),
        })),
    }
}

// ============================================================================
// ChannelFactory
// ============================================================================

/// Factory producing [`ChannelTransport`]s over handler sets built by a closure.
///
/// # Example
///
/// ```ignore
/// let factory = ChannelFactory::new(|| Ok(MyTools::new(db.clone())));
/// let registry = SessionRegistry::builder().build(factory)?;
/// ```
pub struct ChannelFactory<H, B> {
    build: B,
    options: ChannelOptions,
    _handlers: PhantomData<fn() -> H>,
}

impl<H, B> ChannelFactory<H, B>
where
    H: HandlerSet,
    B: Fn() -> Result<H> + Send + Sync + 'static,
{
    /// Creates a factory with default channel options.
    #[must_use]
    pub fn new(build: B) -> Self {
        Self {
            build,
            options: ChannelOptions::new(),
            _handlers: PhantomData,
        }
    }

    /// Sets the options for every transport this factory builds.
    #[must_use]
    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the channel options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }
}

#[async_trait]
impl<H, B> TransportFactory for ChannelFactory<H, B>
where
    H: HandlerSet,
    B: Fn() -> Result<H> + Send + Sync + 'static,
{
    type Transport = ChannelTransport;
    type Handlers = H;

    fn handlers(&self) -> Result<H> {
        (self.build)()
    }

    fn transport(&self, desired: Option<&SessionKey>, hooks: SessionHooks) -> Result<ChannelTransport> {
        self.options.validate()?;
        Ok(ChannelTransport::new(desired, hooks, self.options))
    }

    async fn connect(&self, transport: &Arc<ChannelTransport>, handlers: &Arc<H>) -> Result<()> {
        transport.connect(Arc::clone(handlers)).map(|_| ())
    }
}

// ============================================================================
// Tests
// ============================================================================
