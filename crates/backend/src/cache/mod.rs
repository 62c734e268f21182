//! Arc caches
//!
//! Two providers share the [`CacheArcProvider`] contract:
//!
//! - [`ProcessorCache`]: bounded store of processor output arcs, evicted by
//!   cost and idle time, revalidated against the resource on every hit
//! - [`FilteredAddressCache`]: rule-driven redirect/block decisions per address
//!
//! [`ArcStore`] optionally persists content arcs to disk so a restarted
//! pipeline can warm its processor cache.

mod filtered;
mod processor;
mod store;

pub use filtered::{FILTER_PROCESSOR, FilteredAddressCache, FilteredAddressError};
pub use processor::{CacheStats, ProcessorCache};
pub use store::{ArcStore, CacheStoreError};

use crate::arc::{ArcKey, SharedArc};

/// Errors a provider may raise while answering a lookup.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
  #[error(transparent)]
  Filter(#[from] FilteredAddressError),
}

/// A source of installed arcs.
///
/// Implementations are shared across threads; every method may be called
/// concurrently with any other, including from inside a processor's
/// completion path.
pub trait CacheArcProvider: Send + Sync {
  /// Short provider name for logs.
  fn name(&self) -> &'static str;

  /// Return a satisfying arc for `key`, or `None` when the caller must
  /// compute one. Never returns an arc that has been removed.
  fn lookup(&self, key: &ArcKey) -> Result<Option<SharedArc>, ProviderError>;

  /// Remove exactly this arc. Returns `false` when it is no longer installed,
  /// including when another arc has since taken its key.
  fn remove_arc(&self, arc: &SharedArc) -> bool;
}

/// Result of offering a freshly built arc to a cache.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
  /// The offered arc is now the installed arc for its key.
  Inserted(SharedArc),
  /// Another arc already held the key; callers should adopt `winner`.
  Rejected { winner: SharedArc },
}

impl InsertOutcome {
  pub fn is_inserted(&self) -> bool {
    matches!(self, Self::Inserted(_))
  }

  /// The arc that is installed for the key after the insert.
  pub fn arc(&self) -> &SharedArc {
    match self {
      Self::Inserted(arc) | Self::Rejected { winner: arc } => arc,
    }
  }

  pub fn into_arc(self) -> SharedArc {
    match self {
      Self::Inserted(arc) | Self::Rejected { winner: arc } => arc,
    }
  }
}
