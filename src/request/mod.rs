//! Inbound requests and the task-scoped request context.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `context` | Task-local "current request" store |
//! | `inbound` | Request value and credential |

// ============================================================================
// Submodules
// ============================================================================

/// Task-scoped request context.
pub mod context;

/// Inbound request model.
pub mod inbound;

// ============================================================================
// Re-exports
// ============================================================================

pub use inbound::{Credential, InboundRequest, SESSION_KEY_HEADER};
