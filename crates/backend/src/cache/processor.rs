//! Bounded cache of processor output arcs.

use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, SystemTime},
};

use arcflow_core::{Address, config::CacheConfig};
use moka::{
  notification::RemovalCause,
  ops::compute::{CompResult, Op},
  policy::EvictionPolicy,
  sync::Cache,
};
use tracing::{debug, trace};

use super::{CacheArcProvider, InsertOutcome, ProviderError};
use crate::arc::{ArcKey, Freshness, Probe, SharedArc, ValidatorProbe};

/// LRU cache of arcs keyed by `(address, processor, conditions)`.
///
/// Capacity is measured in arc cost (content bytes, minimum 1 per arc).
/// Arcs idle past the configured timeout are evicted.
///
/// Concurrent inserts for one key are resolved first-wins: the arc that
/// reaches the cache first stays installed and later offers are rejected
/// with the winner, so every caller ends up sharing one arc.
pub struct ProcessorCache {
  arcs: Cache<ArcKey, SharedArc>,
  probe: Option<Arc<dyn ValidatorProbe>>,
  counters: Counters,
}

#[derive(Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  stale_evictions: AtomicU64,
  rejected_inserts: AtomicU64,
  removals: AtomicU64,
}

impl ProcessorCache {
  /// Create a cache sized and timed from configuration.
  pub fn new(config: &CacheConfig) -> Self {
    Self::build(config.capacity, config.idle_timeout_secs.map(Duration::from_secs))
  }

  /// Create a cache with a custom capacity and no idle timeout.
  pub fn with_capacity(capacity: u64) -> Self {
    Self::build(capacity, None)
  }

  fn build(capacity: u64, idle_timeout: Option<Duration>) -> Self {
    let mut builder = Cache::builder()
      .max_capacity(capacity)
      .weigher(|_key: &ArcKey, arc: &SharedArc| arc.cost())
      .eviction_policy(EvictionPolicy::lru())
      .eviction_listener(|key: Arc<ArcKey>, arc: SharedArc, cause: RemovalCause| {
        if cause.was_evicted() {
          trace!(arc = %arc.id(), key = %key, ?cause, "Arc evicted");
        }
      });
    if let Some(idle) = idle_timeout {
      builder = builder.time_to_idle(idle);
    }

    Self {
      arcs: builder.build(),
      probe: None,
      counters: Counters::default(),
    }
  }

  /// Revalidate hits against the resource through `probe`.
  pub fn with_probe(mut self, probe: Arc<dyn ValidatorProbe>) -> Self {
    self.probe = Some(probe);
    self
  }

  /// Return the installed arc for `key` if it is still fresh.
  ///
  /// A stale hit is removed (by identity, so a newer arc installed meanwhile
  /// survives) and reported as a miss. The probe runs without any cache lock
  /// held.
  pub fn lookup(&self, key: &ArcKey) -> Option<SharedArc> {
    let Some(arc) = self.arcs.get(key) else {
      self.counters.misses.fetch_add(1, Ordering::Relaxed);
      trace!(key = %key, "Arc cache miss");
      return None;
    };

    let current = match &self.probe {
      Some(probe) => probe.probe(key.address()),
      None => Probe::Unknown,
    };

    match arc.freshness(&current, SystemTime::now()) {
      Freshness::Fresh => {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        trace!(arc = %arc.id(), key = %key, "Arc cache hit");
        Some(arc)
      }
      Freshness::Stale(reason) => {
        debug!(arc = %arc.id(), key = %key, ?reason, "Evicting stale arc");
        if self.remove_arc(&arc) {
          self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  /// Offer an arc for installation.
  ///
  /// An existing arc keeps its key unless its validators have expired, in
  /// which case the offer replaces it.
  pub fn insert(&self, arc: SharedArc) -> InsertOutcome {
    let now = SystemTime::now();
    let offered = arc.clone();
    let result = self
      .arcs
      .entry(arc.key().clone())
      .and_compute_with(|existing| match existing {
        Some(entry) if !entry.value().validators().is_expired(now) => Op::Nop,
        _ => Op::Put(offered),
      });

    match result {
      CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => {
        debug!(arc = %arc.id(), key = %arc.key(), cost = arc.cost(), "Arc installed");
        InsertOutcome::Inserted(entry.into_value())
      }
      CompResult::Unchanged(entry) => {
        self.counters.rejected_inserts.fetch_add(1, Ordering::Relaxed);
        let winner = entry.into_value();
        debug!(
          offered = %arc.id(),
          winner = %winner.id(),
          key = %arc.key(),
          "Arc insert rejected; key already installed"
        );
        InsertOutcome::Rejected { winner }
      }
      // The closure never removes and always puts when the slot is empty.
      CompResult::Removed(_) | CompResult::StillNone(_) => InsertOutcome::Inserted(arc),
    }
  }

  /// Remove exactly `arc`. Idempotent; a different arc under the same key
  /// is left alone.
  pub fn remove_arc(&self, arc: &SharedArc) -> bool {
    let result = self
      .arcs
      .entry(arc.key().clone())
      .and_compute_with(|existing| match existing {
        Some(entry) if Arc::ptr_eq(entry.value(), arc) => Op::Remove,
        _ => Op::Nop,
      });

    let removed = matches!(result, CompResult::Removed(_));
    if removed {
      self.counters.removals.fetch_add(1, Ordering::Relaxed);
      debug!(arc = %arc.id(), key = %arc.key(), "Arc removed");
    }
    removed
  }

  /// Remove every arc built from `address`, whatever its processor,
  /// conditions or negotiation. Returns the number of arcs removed.
  pub fn invalidate_address(&self, address: &Address) -> usize {
    // moka has no secondary index, so scan
    let doomed: Vec<SharedArc> = self
      .arcs
      .iter()
      .filter(|(key, _)| key.address().same_resource(address))
      .map(|(_, arc)| arc)
      .collect();

    let removed = doomed.iter().filter(|arc| self.remove_arc(arc)).count();
    if removed > 0 {
      debug!(address = %address, removed, "Invalidated arcs for address");
    }
    removed
  }

  pub fn clear(&self) {
    self.arcs.invalidate_all();
  }

  /// Snapshot of the installed arcs.
  pub fn arcs(&self) -> Vec<SharedArc> {
    self.arcs.iter().map(|(_, arc)| arc).collect()
  }

  pub fn len(&self) -> usize {
    self.arcs.iter().count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Get cache statistics.
  pub fn stats(&self) -> CacheStats {
    self.arcs.run_pending_tasks();
    CacheStats {
      entry_count: self.arcs.entry_count(),
      weighted_size: self.arcs.weighted_size(),
      hits: self.counters.hits.load(Ordering::Relaxed),
      misses: self.counters.misses.load(Ordering::Relaxed),
      stale_evictions: self.counters.stale_evictions.load(Ordering::Relaxed),
      rejected_inserts: self.counters.rejected_inserts.load(Ordering::Relaxed),
      removals: self.counters.removals.load(Ordering::Relaxed),
    }
  }
}

impl CacheArcProvider for ProcessorCache {
  fn name(&self) -> &'static str {
    "processor"
  }

  fn lookup(&self, key: &ArcKey) -> Result<Option<SharedArc>, ProviderError> {
    Ok(ProcessorCache::lookup(self, key))
  }

  fn remove_arc(&self, arc: &SharedArc) -> bool {
    ProcessorCache::remove_arc(self, arc)
  }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entry_count: u64,
  pub weighted_size: u64,
  pub hits: u64,
  pub misses: u64,
  pub stale_evictions: u64,
  pub rejected_inserts: u64,
  pub removals: u64,
}
