//! Registry policies.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use session_registry::RegistryOptions;
//!
//! let options = RegistryOptions::new()
//!     .with_creation_timeout(Duration::from_secs(10))
//!     .with_max_sessions(1024);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on one creation's handshake.
const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// RegistryOptions
// ============================================================================

/// Creation and capacity policies of a [`SessionRegistry`](super::SessionRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Upper bound on a creation's handshake. Expiry fails the creation.
    pub creation_timeout: Duration,

    /// Maximum number of entries (pending and ready). `None` is unbounded.
    pub max_sessions: Option<usize>,
}

impl RegistryOptions {
    /// Creates options with default policies.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            max_sessions: None,
        }
    }

    /// Sets the creation timeout.
    #[inline]
    #[must_use]
    pub const fn with_creation_timeout(mut self, creation_timeout: Duration) -> Self {
        self.creation_timeout = creation_timeout;
        self
    }

    /// Caps the number of sessions.
    #[inline]
    #[must_use]
    pub const fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = Some(max_sessions);
        self
    }

    /// Checks that every policy is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero timeout or a zero session cap.
    pub fn validate(&self) -> Result<()> {
        if self.creation_timeout.is_zero() {
            return Err(Error::config("creation timeout must be non-zero"));
        }
        if self.max_sessions == Some(0) {
            return Err(Error::config("max sessions must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
