//! Registry entries.
//!
//! An entry is either a creation still in flight or a ready transport:
//!
//! ```text
//! Absent ──acquire──► Pending ──success──► Ready ──closed──► Absent
//!                        │
//!                        └──failure──► Absent
//! ```
//!
//! A Ready entry never goes back to Pending; a new acquire after removal
//! starts a fresh creation.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};

use crate::error::Error;
use crate::identifiers::CreationId;

// ============================================================================
// Types
// ============================================================================

/// Outcome of one creation, cloneable so every waiter gets a copy.
pub(crate) type CreationOutcome<T> = Result<Arc<T>, Arc<Error>>;

/// Future every waiter on a key awaits.
pub(crate) type SharedCreation<T> = Shared<BoxFuture<'static, CreationOutcome<T>>>;

// ============================================================================
// Entry
// ============================================================================

/// Value stored under a session key.
pub(crate) enum Entry<T> {
    /// Creation in flight.
    Pending(PendingCreation<T>),
    /// Transport ready for reuse.
    Ready(Arc<T>),
}

/// A creation in flight, tagged so its owner can recognise it later.
pub(crate) struct PendingCreation<T> {
    pub id: CreationId,
    pub future: SharedCreation<T>,
}

impl<T> Entry<T> {
    /// Returns `true` if this is the pending entry of creation `id`.
    #[inline]
    pub fn is_pending(&self, id: CreationId) -> bool {
        matches!(self, Self::Pending(pending) if pending.id == id)
    }

    /// Returns `true` if this entry holds exactly `transport`.
    #[inline]
    pub fn holds(&self, transport: &Arc<T>) -> bool {
        matches!(self, Self::Ready(ready) if Arc::ptr_eq(ready, transport))
    }

    /// Returns the ready transport, if any.
    #[inline]
    pub fn ready(&self) -> Option<&Arc<T>> {
        match self {
            Self::Ready(transport) => Some(transport),
            Self::Pending(_) => None,
        }
    }
}

impl<T> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(pending) => write!(f, "Pending({})", pending.id),
            Self::Ready(transport) => write!(f, "Ready({:p})", Arc::as_ptr(transport)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::FutureExt;

    fn pending(id: CreationId) -> Entry<u8> {
        let future = async { Ok::<_, Arc<Error>>(Arc::new(1u8)) }.boxed().shared();
        Entry::Pending(PendingCreation { id, future })
    }

    #[test]
    fn test_is_pending_matches_id() {
        let id = CreationId::next();
        let entry = pending(id);
        assert!(entry.is_pending(id));
        assert!(!entry.is_pending(CreationId::next()));
        assert!(entry.ready().is_none());
    }

    #[test]
    fn test_holds_compares_by_pointer() {
        let a = Arc::new(7u8);
        let b = Arc::new(7u8);
        let entry = Entry::Ready(Arc::clone(&a));
        assert!(entry.holds(&a));
        assert!(!entry.holds(&b));
        assert!(!entry.is_pending(CreationId::next()));
    }

    #[tokio::test]
    async fn test_shared_future_yields_same_instance() {
        let future: SharedCreation<u8> = async { Ok::<_, Arc<Error>>(Arc::new(3u8)) }.boxed().shared();
        let (a, b) = tokio::join!(future.clone(), future);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }
}
