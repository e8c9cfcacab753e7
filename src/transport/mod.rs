//! Transport layer.
//!
//! A transport is the I/O boundary of one protocol session, bound 1:1 to a
//! handler set. The registry hands transports out; this module defines what
//! they are and how they report their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  handle(request)   ┌─────────────────┐
//! │  HTTP adapter    │───────────────────►│  Transport      │
//! └──────────────────┘                    │                 │
//!                                         │  event loop ────┼──► HandlerSet
//! ┌──────────────────┐  initialized(key)  │                 │
//! │  SessionRegistry │◄───────────────────│  SessionHooks   │
//! │                  │  closed(key)       │                 │
//! └──────────────────┘                    └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | In-process transport with an mpsc event loop |
//! | `hooks` | Lifecycle callbacks |
//! | `traits` | `Transport` and `HandlerSet` contracts |

// ============================================================================
// Submodules
// ============================================================================

/// In-process channel transport.
pub mod channel;

/// Lifecycle callbacks from transport to registry.
pub mod hooks;

/// Transport and handler set contracts.
pub mod traits;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{ChannelOptions, ChannelTransport};
pub use hooks::{LifecycleObserver, SessionHooks};
pub use traits::{HandlerSet, Transport};
