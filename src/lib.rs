//! Session registry - one long-lived protocol session per client key.
//!
//! This library sits behind a stateless HTTP front door and keeps a
//! stateful protocol session (a transport bound to its own handler set) per
//! client session key.
//!
//! # Architecture
//!
//! ```text
//! HTTP request ──► session_key() ──► SessionRegistry::acquire(key)
//!                                        │
//!                       ┌────────────────┼─────────────────┐
//!                       ▼                ▼                 ▼
//!                     Ready           Pending            Absent
//!                    (reuse)     (await in-flight)   (create once)
//!                                                          │
//!                                          TransportFactory + SessionHooks
//! ```
//!
//! Key design principles:
//!
//! - At most one creation per key at any moment, however many callers race
//! - Failed creations are never cached; the next request retries
//! - Transports report `initialized` / `closed` back to the registry
//! - Handlers read the current request from a task-local context
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use session_registry::{ChannelFactory, HandlerSet, InboundRequest, Result, SessionRegistry};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl HandlerSet for Echo {
//!     async fn call(&self, request: Arc<InboundRequest>) -> Result<Value> {
//!         Ok(json!({ "echo": request.body }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = SessionRegistry::builder().build(ChannelFactory::new(|| Ok(Echo)))?;
//!
//!     let request = InboundRequest::new("POST", "https://example.com/mcp")?
//!         .with_header("mcp-session-id", "abc123")
//!         .with_body(json!({ "method": "ping" }));
//!
//!     let key = request.session_key()?;
//!     let response = registry.dispatch(key, request).await?;
//!     println!("{response}");
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Session key and creation id |
//! | [`request`] | Inbound requests and the request context |
//! | [`session`] | Registry, factory, options |
//! | [`transport`] | Transport contracts, hooks, channel transport |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Inbound requests and the task-scoped request context.
pub mod request;

/// Session registry and transport factory.
///
/// Use [`SessionRegistry::builder()`] to create a registry.
pub mod session;

/// Transport contracts and lifecycle hooks.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CreationId, SessionKey};

// Request types
pub use request::{Credential, InboundRequest, SESSION_KEY_HEADER, context};

// Session types
pub use session::{
    ChannelFactory, PartialSession, RegistryBuilder, RegistryOptions, Session, SessionRegistry,
    TransportFactory, create_session,
};

// Transport types
pub use transport::{
    ChannelOptions, ChannelTransport, HandlerSet, LifecycleObserver, SessionHooks, Transport,
};
