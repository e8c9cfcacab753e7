//! Builder pattern for registry configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use session_registry::{ChannelFactory, SessionRegistry};
//!
//! let registry = SessionRegistry::builder()
//!     .creation_timeout(Duration::from_secs(10))
//!     .max_sessions(1024)
//!     .build(ChannelFactory::new(|| Ok(MyTools::default())))?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::error::Result;

use super::factory::TransportFactory;
use super::options::RegistryOptions;
use super::registry::SessionRegistry;

// ============================================================================
// RegistryBuilder
// ============================================================================

/// Builder for configuring a [`SessionRegistry`].
///
/// Use [`SessionRegistry::builder()`] to create a new builder. The factory
/// type is fixed by [`build`](Self::build).
pub struct RegistryBuilder<F> {
    options: RegistryOptions,
    _factory: PhantomData<fn() -> F>,
}

impl<F: TransportFactory> RegistryBuilder<F> {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: RegistryOptions::new(),
            _factory: PhantomData,
        }
    }

    /// Sets the handshake timeout for each creation.
    #[inline]
    #[must_use]
    pub fn creation_timeout(mut self, timeout: Duration) -> Self {
        self.options.creation_timeout = timeout;
        self
    }

    /// Caps the number of sessions held at once.
    #[inline]
    #[must_use]
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.options.max_sessions = Some(max);
        self
    }

    /// Replaces all options at once.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the registry around `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the options are invalid.
    pub fn build(self, factory: F) -> Result<SessionRegistry<F>> {
        self.options.validate()?;
        Ok(SessionRegistry::new(factory, self.options))
    }
}

impl<F: TransportFactory> Default for RegistryBuilder<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Clone for RegistryBuilder<F> {
    fn clone(&self) -> Self {
        Self {
            options: self.options,
            _factory: PhantomData,
        }
    }
}

impl<F> fmt::Debug for RegistryBuilder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
