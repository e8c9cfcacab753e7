//! Transport and handler set contracts.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::SessionKey;
use crate::request::InboundRequest;

// ============================================================================
// Transport
// ============================================================================

/// I/O boundary of one established protocol session.
///
/// Bound 1:1 to a [`HandlerSet`] by its factory. Shared by the registry and
/// every caller that acquired it; its useful life ends at [`close`](Self::close).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// What [`handle`](Self::handle) produces for the HTTP adapter.
    type Response: Send + 'static;

    /// Forwards one inbound request into the session.
    ///
    /// Called inside the request's context scope; work the transport moves
    /// onto other tasks must carry the request along itself.
    async fn handle(&self, request: Arc<InboundRequest>) -> Result<Self::Response>;

    /// Ends the session. Must be safe to call more than once.
    async fn close(&self) -> Result<()>;

    /// Key the handshake settled on, once known.
    fn session_key(&self) -> Option<SessionKey>;
}

// ============================================================================
// HandlerSet
// ============================================================================

/// Dispatcher of protocol tool calls bound to one transport.
///
/// Tool handlers read the originating request through
/// [`context::current`](crate::request::context::current).
#[async_trait]
pub trait HandlerSet: Send + Sync + 'static {
    /// Handles one tool-call request.
    async fn call(&self, request: Arc<InboundRequest>) -> Result<Value>;

    /// Releases resources held by the handlers.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
