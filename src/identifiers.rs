//! Type-safe identifiers for sessions and creations.
//!
//! Newtype wrappers keep session keys and internal creation tags from being
//! mixed up with arbitrary strings or counters.
//!
//! | Type | Backing | Source |
//! |------|---------|--------|
//! | [`SessionKey`] | `Arc<str>` | client header or [`SessionKey::generate`] |
//! | [`CreationId`] | `u64` | process-wide counter |

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// SessionKey
// ============================================================================

/// Opaque identifier correlating repeated requests with one protocol session.
///
/// Keys are compared by exact value; no structure is implied. Cloning is
/// cheap (reference-counted).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    /// Creates a key from any non-empty string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSessionKey`] if `value` is empty.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref();
        if value.is_empty() {
            return Err(Error::invalid_session_key("session key must not be empty"));
        }
        Ok(Self(Arc::from(value)))
    }

    /// Parses a key received from a client header.
    ///
    /// Header-borne keys must be non-empty and consist of visible ASCII
    /// characters only (`0x21..=0x7E`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSessionKey`] on empty or non-visible input.
    pub fn parse(value: &str) -> Result<Self> {
        if let Some(bad) = value.chars().find(|c| !matches!(c, '\x21'..='\x7e')) {
            return Err(Error::invalid_session_key(format!(
                "invalid character {bad:?} in session key"
            )));
        }
        Self::new(value)
    }

    /// Generates a fresh random key (UUID v4).
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Returns the key as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for SessionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// CreationId
// ============================================================================

/// Global counter for creation IDs.
static NEXT_CREATION_ID: AtomicU64 = AtomicU64::new(1);

/// Tag for one in-flight transport creation.
///
/// Lets the registry tell its own pending entry apart from a newer one
/// installed under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CreationId(u64);

impl CreationId {
    /// Returns the next unique creation ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CREATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CreationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
