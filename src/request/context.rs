//! Task-scoped request context.
//!
//! Makes the inbound request visible to everything running inside
//! [`scope`] without threading it through every call. Tool handlers read it
//! at the leaves with [`current`] or [`require`].
//!
//! Backed by a tokio task-local: concurrent scopes interleaved on the same
//! runtime, or the same worker thread, each see only their own request.
//! Work handed to [`tokio::spawn`] leaves the scope; use [`spawn`] to carry
//! the request along.
//!
//! ```ignore
//! let request = InboundRequest::new("POST", "https://example.com/mcp")?;
//! context::scope(request, async {
//!     let req = context::require()?;
//!     println!("{}", req.origin());
//!     Ok::<_, Error>(())
//! })
//! .await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;

use crate::error::{Error, Result};

use super::InboundRequest;

// ============================================================================
// Storage
// ============================================================================

tokio::task_local! {
    static CURRENT_REQUEST: Arc<InboundRequest>;
}

// ============================================================================
// Scoping
// ============================================================================

/// Runs `future` with `request` as the current request.
///
/// Scopes nest: an inner scope shadows the outer one until it completes.
pub async fn scope<F>(request: impl Into<Arc<InboundRequest>>, future: F) -> F::Output
where
    F: Future,
{
    CURRENT_REQUEST.scope(request.into(), future).await
}

/// Runs `f` synchronously with `request` as the current request.
pub fn sync_scope<R>(request: impl Into<Arc<InboundRequest>>, f: impl FnOnce() -> R) -> R {
    CURRENT_REQUEST.sync_scope(request.into(), f)
}

/// Spawns a task that inherits the current request, if any.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(request) => tokio::spawn(CURRENT_REQUEST.scope(request, future)),
        None => tokio::spawn(future),
    }
}

// ============================================================================
// Lookup
// ============================================================================

/// Returns the request of the enclosing scope, or `None` outside any scope.
#[inline]
#[must_use]
pub fn current() -> Option<Arc<InboundRequest>> {
    CURRENT_REQUEST.try_with(Arc::clone).ok()
}

/// Returns the request of the enclosing scope.
///
/// # Errors
///
/// Returns [`Error::NoRequestContext`] outside any scope. Callers should
/// treat this as a bug and fail the request.
pub fn require() -> Result<Arc<InboundRequest>> {
    current().ok_or_else(|| {
        error!("Request context accessed outside of a request scope");
        Error::NoRequestContext
    })
}

// ============================================================================
// Tests
// ============================================================================
