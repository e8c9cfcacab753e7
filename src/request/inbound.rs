//! Inbound request model.
//!
//! The value the HTTP adapter hands to the registry and that tool handlers
//! read back through the request context.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::Result;
use crate::identifiers::SessionKey;

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the protocol session key.
pub const SESSION_KEY_HEADER: &str = "mcp-session-id";

// ============================================================================
// Credential
// ============================================================================

/// Opaque identity produced by authentication before the request arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Authenticated subject (user ID, client ID).
    pub subject: String,

    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credential {
    /// Creates a credential with no scopes.
    #[inline]
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            scopes: Vec::new(),
        }
    }

    /// Adds a scope.
    #[inline]
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Returns `true` if `scope` was granted.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

// ============================================================================
// InboundRequest
// ============================================================================

/// An authenticated request addressed to the tool-serving endpoint.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP method, upper-case.
    pub method: String,

    /// Absolute request URL.
    pub url: Url,

    /// Headers keyed by lower-case name.
    headers: FxHashMap<String, String>,

    /// Identity attached by authentication.
    pub credential: Option<Credential>,

    /// JSON body.
    pub body: Value,
}

impl InboundRequest {
    /// Creates a request with no headers, credential or body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`](crate::Error::Url) if `url` is not absolute.
    pub fn new(method: impl AsRef<str>, url: &str) -> Result<Self> {
        Ok(Self {
            method: method.as_ref().to_ascii_uppercase(),
            url: Url::parse(url)?,
            headers: FxHashMap::default(),
            credential: None,
            body: Value::Null,
        })
    }

    /// Adds a header. Names are case-insensitive.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Attaches a credential.
    #[inline]
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Sets the JSON body.
    #[inline]
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Returns a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the session key header, if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSessionKey`](crate::Error::InvalidSessionKey)
    /// if the header is present but malformed.
    pub fn session_key(&self) -> Result<Option<SessionKey>> {
        self.header(SESSION_KEY_HEADER)
            .map(SessionKey::parse)
            .transpose()
    }

    /// Returns `scheme://host[:port]` of the request URL.
    #[must_use]
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Resolves `path` against the request URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`](crate::Error::Url) if `path` cannot be joined.
    pub fn absolute_url(&self, path: &str) -> Result<Url> {
        Ok(self.url.join(path)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
