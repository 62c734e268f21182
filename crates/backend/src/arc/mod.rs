//! Cache arcs
//!
//! An arc is the materialized result of running one processor over one
//! address under one set of request conditions: an edge of the content
//! dependency graph. Arcs are immutable once built and shared as
//! [`SharedArc`]; caches compare them by identity, never by value.

mod validators;

use std::{
  collections::BTreeMap,
  fmt,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::SystemTime,
};

use arcflow_core::{Address, ErrorReport, Headers};
use serde::{Deserialize, Serialize};
pub use validators::{Freshness, Probe, StaleReason, ValidatorProbe, ValidatorSet};

/// Shared handle to an installed arc.
pub type SharedArc = Arc<CacheArc>;

// ============================================================================
// Key components
// ============================================================================

/// Stable identity of a processor variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId(String);

impl ProcessorId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ProcessorId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Request conditions an arc was computed under (e.g. `accept-language`).
///
/// Names are lowercased and kept sorted so equal condition sets hash equally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConditionSet(BTreeMap<String, String>);

impl ConditionSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
    self.0.insert(name.trim().to_ascii_lowercase(), value.into());
    self
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(&name.trim().to_ascii_lowercase()).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// Composite cache key: at most one live arc exists per key in a cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArcKey {
  address: Address,
  processor: ProcessorId,
  conditions: ConditionSet,
}

impl ArcKey {
  pub fn new(address: Address, processor: ProcessorId, conditions: ConditionSet) -> Self {
    Self {
      address,
      processor,
      conditions,
    }
  }

  pub fn address(&self) -> &Address {
    &self.address
  }

  pub fn processor(&self) -> &ProcessorId {
    &self.processor
  }

  pub fn conditions(&self) -> &ConditionSet {
    &self.conditions
  }

  /// Canonical text form, stable across processes.
  pub fn canonical(&self) -> String {
    let negotiation = self.address.negotiation();
    let mut out = format!("{}\n{}\n", self.address, self.processor);
    for t in negotiation.accepted_types() {
      out.push_str("accept:");
      out.push_str(t);
      out.push('\n');
    }
    for e in negotiation.accepted_encodings() {
      out.push_str("accept-encoding:");
      out.push_str(e);
      out.push('\n');
    }
    for (name, value) in self.conditions.iter() {
      out.push_str(name);
      out.push('=');
      out.push_str(value);
      out.push('\n');
    }
    out
  }
}

impl fmt::Display for ArcKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} via {}", self.address, self.processor)?;
    if !self.conditions.is_empty() {
      write!(f, " [{} conditions]", self.conditions.len())?;
    }
    Ok(())
  }
}

// ============================================================================
// Arc payload
// ============================================================================

/// Processor output: headers plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
  headers: Headers,
  body: Arc<[u8]>,
  /// Full-precision modification time of the source, when the processor
  /// read it from somewhere more exact than a `Last-Modified` header.
  source_modified: Option<SystemTime>,
}

impl Content {
  pub fn new(headers: Headers, body: impl Into<Vec<u8>>) -> Self {
    Self {
      headers,
      body: Arc::from(body.into()),
      source_modified: None,
    }
  }

  pub fn with_source_modified(mut self, at: SystemTime) -> Self {
    self.source_modified = Some(at);
    self
  }

  pub fn source_modified(&self) -> Option<SystemTime> {
    self.source_modified
  }

  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  pub fn len(&self) -> usize {
    self.body.len()
  }

  pub fn is_empty(&self) -> bool {
    self.body.is_empty()
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.content_type()
  }
}

/// What an arc resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArcResult {
  /// Processor produced content.
  Content(Content),
  /// Address filter rewrote the address.
  Redirect(Address),
  /// Address filter blocked the address.
  Blocked { rule: String },
  /// Cached processor failure (negative arc).
  Failed(ErrorReport),
}

// ============================================================================
// CacheArc
// ============================================================================

static NEXT_ARC_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique arc identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArcId(u64);

impl ArcId {
  fn next() -> Self {
    Self(NEXT_ARC_ID.fetch_add(1, Ordering::Relaxed))
  }

  pub fn get(self) -> u64 {
    self.0
  }
}

impl fmt::Display for ArcId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "arc-{}", self.0)
  }
}

/// The cached unit: `(address, processor, conditions) -> result`.
#[derive(Debug)]
pub struct CacheArc {
  id: ArcId,
  key: ArcKey,
  result: ArcResult,
  validators: ValidatorSet,
  cost: u32,
  created_at: SystemTime,
}

impl CacheArc {
  /// Build an arc. Cost defaults to the content byte length (minimum 1).
  pub fn new(key: ArcKey, result: ArcResult, validators: ValidatorSet) -> Self {
    let cost = match &result {
      ArcResult::Content(content) => u32::try_from(content.len()).unwrap_or(u32::MAX).max(1),
      _ => 1,
    };
    Self {
      id: ArcId::next(),
      key,
      result,
      validators,
      cost,
      created_at: SystemTime::now(),
    }
  }

  pub fn with_cost(mut self, cost: u32) -> Self {
    self.cost = cost.max(1);
    self
  }

  pub fn into_shared(self) -> SharedArc {
    Arc::new(self)
  }

  pub fn id(&self) -> ArcId {
    self.id
  }

  pub fn key(&self) -> &ArcKey {
    &self.key
  }

  pub fn address(&self) -> &Address {
    self.key.address()
  }

  pub fn result(&self) -> &ArcResult {
    &self.result
  }

  pub fn content(&self) -> Option<&Content> {
    match &self.result {
      ArcResult::Content(content) => Some(content),
      _ => None,
    }
  }

  pub fn validators(&self) -> &ValidatorSet {
    &self.validators
  }

  pub fn cost(&self) -> u32 {
    self.cost
  }

  pub fn created_at(&self) -> SystemTime {
    self.created_at
  }

  /// A negative arc caches a failure rather than content.
  pub fn is_negative(&self) -> bool {
    matches!(self.result, ArcResult::Failed(_))
  }

  /// Decide whether this arc may still be served, given the current state of
  /// its resource.
  pub fn freshness(&self, current: &Probe, now: SystemTime) -> Freshness {
    if self.validators.is_expired(now) {
      return Freshness::Stale(StaleReason::Expired);
    }
    if self.is_negative() && matches!(current, Probe::Current(_)) {
      return Freshness::Stale(StaleReason::ResourceAppeared);
    }
    self.validators.freshness(current)
  }
}
