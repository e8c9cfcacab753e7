//! Error types for the session registry.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use session_registry::{Result, SessionKey};
//!
//! async fn example(registry: &SessionRegistry<MyFactory>) -> Result<()> {
//!     let transport = registry.acquire(Some(SessionKey::new("s1")?)).await?;
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidSessionKey`] |
//! | Creation | [`Error::CreationFailed`], [`Error::CreationTimeout`], [`Error::CapacityExceeded`], [`Error::Handshake`] |
//! | Transport | [`Error::NotConnected`], [`Error::TransportClosed`], [`Error::RequestTimeout`], [`Error::TooManyPending`] |
//! | Handler | [`Error::Handler`] |
//! | Context | [`Error::NoRequestContext`] |
//! | Lifecycle | [`Error::RegistryShutdown`], [`Error::Join`] |
//! | External | [`Error::Json`], [`Error::Url`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

use crate::identifiers::SessionKey;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when registry or transport options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Session key rejected.
    #[error("Invalid session key: {message}")]
    InvalidSessionKey {
        /// Why the key was rejected.
        message: String,
    },

    // ========================================================================
    // Creation Errors
    // ========================================================================
    /// Transport creation failed.
    ///
    /// Every caller waiting on the same creation receives this variant,
    /// sharing the original failure through `source`.
    #[error("Session creation failed for {}: {source}", key_label(.key))]
    CreationFailed {
        /// Key the creation was registered under, `None` for anonymous sessions.
        key: Option<SessionKey>,
        /// The original failure.
        source: Arc<Error>,
    },

    /// Transport creation did not finish in time.
    #[error("Session handshake timed out after {timeout_ms}ms")]
    CreationTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Registry is full.
    #[error("Session capacity exceeded: {max} sessions")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// Handshake between transport and handler set failed.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport used before its handshake bound a handler set.
    #[error("Transport not connected")]
    NotConnected,

    /// Transport closed while in use.
    #[error("Transport closed")]
    TransportClosed,

    /// Request got no response in time.
    #[error("Request timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Too many requests in flight on one transport.
    #[error("Too many pending requests: {pending}/{max}")]
    TooManyPending {
        /// Requests currently in flight.
        pending: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========================================================================
    // Handler Errors
    // ========================================================================
    /// A tool handler failed.
    #[error("Handler error: {message}")]
    Handler {
        /// Description of the handler failure.
        message: String,
    },

    // ========================================================================
    // Context Errors
    // ========================================================================
    /// Request context looked up outside of a request scope.
    ///
    /// This is a programming error, not a recoverable condition.
    #[error("No request in scope: request context accessed outside of a request")]
    NoRequestContext,

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Registry no longer accepts sessions.
    #[error("Session registry is shut down")]
    RegistryShutdown,

    /// Background creation task panicked or was cancelled.
    #[error("Creation task failed: {message}")]
    Join {
        /// Description of the join failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

/// Display label for an optional session key.
fn key_label(key: &Option<SessionKey>) -> &str {
    key.as_ref().map_or("<anonymous>", SessionKey::as_str)
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid session key error.
    #[inline]
    pub fn invalid_session_key(message: impl Into<String>) -> Self {
        Self::InvalidSessionKey {
            message: message.into(),
        }
    }

    /// Creates a creation failed error wrapping a shared source.
    #[inline]
    pub fn creation_failed(key: Option<SessionKey>, source: Arc<Error>) -> Self {
        Self::CreationFailed { key, source }
    }

    /// Creates a creation timeout error.
    #[inline]
    pub fn creation_timeout(timeout_ms: u64) -> Self {
        Self::CreationTimeout { timeout_ms }
    }

    /// Creates a capacity exceeded error.
    #[inline]
    pub fn capacity_exceeded(max: usize) -> Self {
        Self::CapacityExceeded { max }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(timeout_ms: u64) -> Self {
        Self::RequestTimeout { timeout_ms }
    }

    /// Creates a too many pending requests error.
    #[inline]
    pub fn too_many_pending(pending: usize, max: usize) -> Self {
        Self::TooManyPending { pending, max }
    }

    /// Creates a handler error.
    #[inline]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Creates a join error.
    #[inline]
    pub fn join(message: impl Into<String>) -> Self {
        Self::Join {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns the innermost error behind any [`Error::CreationFailed`] wrapping.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::CreationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::CreationTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this error came out of session creation.
    #[inline]
    #[must_use]
    pub fn is_creation_error(&self) -> bool {
        matches!(
            self,
            Self::CreationFailed { .. }
                | Self::CreationTimeout { .. }
                | Self::CapacityExceeded { .. }
                | Self::Handshake { .. }
        )
    }

    /// Returns `true` if this is a transport error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::NotConnected
                | Self::TransportClosed
                | Self::RequestTimeout { .. }
                | Self::TooManyPending { .. }
                | Self::ChannelClosed(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry. Failed creations are never
    /// cached, so retrying a creation error starts a fresh attempt.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::CreationTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::TooManyPending { .. }
                | Self::CapacityExceeded { .. }
                | Self::TransportClosed
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
