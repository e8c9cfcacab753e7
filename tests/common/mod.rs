//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use session_registry::{
    ChannelFactory, ChannelOptions, ChannelTransport, Error, HandlerSet, InboundRequest, Result,
    SessionKey, SessionRegistry, TransportFactory, context,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Logging
// ============================================================================

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("session_registry=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Handler sets
// ============================================================================

/// Tool handlers that echo what they see of the current request.
pub struct EchoTools {
    /// Sequence number of this handler set.
    pub number: usize,
    /// Delay before every answer.
    pub delay: Duration,
    /// Closes observed across all handler sets.
    pub closes: Arc<AtomicUsize>,
}

#[async_trait]
impl HandlerSet for EchoTools {
    async fn call(&self, request: Arc<InboundRequest>) -> Result<Value> {
        tokio::time::sleep(self.delay).await;

        let current = context::require()?;
        Ok(json!({
            "handlers": self.number,
            "path": current.url.path(),
            "subject": current.credential.as_ref().map(|c| c.subject.clone()),
            "same_request": Arc::ptr_eq(&current, &request),
            "body": request.body,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Registry fixture
// ============================================================================

/// Counters shared with the factory closure.
#[derive(Default, Clone)]
pub struct Counters {
    pub built: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl Counters {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Options for [`echo_registry`].
#[derive(Clone, Copy)]
pub struct Fixture {
    pub handler_delay: Duration,
    pub channel: ChannelOptions,
    /// Handler set numbers (1-based) whose construction fails.
    pub fail_build: Option<usize>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            handler_delay: Duration::ZERO,
            channel: ChannelOptions::new(),
            fail_build: None,
        }
    }
}

/// Builds a registry over [`EchoTools`] and returns its counters.
pub fn echo_registry(
    fixture: Fixture,
) -> (
    SessionRegistry<impl TransportFactory<Transport = ChannelTransport, Handlers = EchoTools>>,
    Counters,
) {
    let counters = Counters::default();
    let shared = counters.clone();

    let factory = ChannelFactory::new(move || {
        let number = shared.built.fetch_add(1, Ordering::SeqCst) + 1;
        if fixture.fail_build == Some(number) {
            return Err(Error::handler("tool registry unavailable"));
        }
        Ok(EchoTools {
            number,
            delay: fixture.handler_delay,
            closes: Arc::clone(&shared.closes),
        })
    })
    .with_options(fixture.channel);

    let registry = SessionRegistry::builder()
        .build(factory)
        .unwrap_or_else(|e| panic!("registry build failed: {e}"));

    (registry, counters)
}

// ============================================================================
// Requests
// ============================================================================

pub fn key(value: &str) -> SessionKey {
    SessionKey::new(value).unwrap()
}

pub fn request(session: Option<&str>, body: Value) -> InboundRequest {
    let request = InboundRequest::new("POST", "https://mcp.example.com/mcp")
        .unwrap()
        .with_body(body);

    match session {
        Some(session) => request.with_header("Mcp-Session-Id", session),
        None => request,
    }
}
