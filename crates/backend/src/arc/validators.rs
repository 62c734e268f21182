//! Arc validators and freshness decisions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arcflow_core::{Address, Headers};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Content;

/// Metadata recorded when an arc is built, compared against the resource's
/// current state when the arc is revisited.
///
/// `last_modified` is compared at full precision. Processors that probe a
/// resource must record the same precision in the content they produce
/// (see [`Content::with_source_modified`]); a `Last-Modified` header only
/// carries whole seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
  pub last_modified: Option<SystemTime>,
  pub content_length: Option<u64>,
  /// SHA-256 of the body, hex encoded
  pub content_hash: Option<String>,
  pub expires_at: Option<SystemTime>,
}

impl ValidatorSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build validators from processor output.
  pub fn from_content(content: &Content) -> Self {
    let headers = content.headers();
    Self {
      last_modified: content.source_modified().or_else(|| parse_http_date(headers)),
      content_length: headers.content_length().or(Some(content.len() as u64)),
      content_hash: Some(hash_body(content.body())),
      expires_at: None,
    }
  }

  pub fn with_last_modified(mut self, at: SystemTime) -> Self {
    self.last_modified = Some(at);
    self
  }

  pub fn with_content_length(mut self, len: u64) -> Self {
    self.content_length = Some(len);
    self
  }

  pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
    self.content_hash = Some(hash.into());
    self
  }

  pub fn expiring_at(mut self, at: SystemTime) -> Self {
    self.expires_at = Some(at);
    self
  }

  pub fn expiring_after(self, ttl: Duration) -> Self {
    self.expiring_at(SystemTime::now() + ttl)
  }

  pub fn is_expired(&self, now: SystemTime) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }

  /// Compare against the resource's current validators.
  ///
  /// Only fields present on both sides are compared. Expiry is not checked
  /// here; see [`super::CacheArc::freshness`].
  pub fn freshness(&self, current: &Probe) -> Freshness {
    match current {
      Probe::Unknown => Freshness::Fresh,
      Probe::Missing => {
        if self.tracks_resource() {
          Freshness::Stale(StaleReason::ResourceMissing)
        } else {
          Freshness::Fresh
        }
      }
      Probe::Current(now) => {
        if let (Some(a), Some(b)) = (self.last_modified, now.last_modified)
          && a != b
        {
          return Freshness::Stale(StaleReason::Modified);
        }
        if let (Some(a), Some(b)) = (self.content_length, now.content_length)
          && a != b
        {
          return Freshness::Stale(StaleReason::LengthChanged);
        }
        if let (Some(a), Some(b)) = (&self.content_hash, &now.content_hash)
          && a != b
        {
          return Freshness::Stale(StaleReason::ContentChanged);
        }
        Freshness::Fresh
      }
    }
  }

  fn tracks_resource(&self) -> bool {
    self.last_modified.is_some() || self.content_length.is_some() || self.content_hash.is_some()
  }
}

/// Current state of a resource as reported by a [`ValidatorProbe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
  /// No processor can report on this address; arcs are trusted until expiry.
  Unknown,
  /// The resource no longer exists.
  Missing,
  Current(ValidatorSet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
  Expired,
  ResourceMissing,
  ResourceAppeared,
  Modified,
  LengthChanged,
  ContentChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  Fresh,
  Stale(StaleReason),
}

impl Freshness {
  pub fn is_fresh(self) -> bool {
    matches!(self, Self::Fresh)
  }
}

/// Reports the current validators of the resource behind an address.
///
/// Called by caches outside of their locks; implementations may touch the
/// filesystem.
pub trait ValidatorProbe: Send + Sync {
  fn probe(&self, address: &Address) -> Probe;
}

pub(crate) fn hash_body(body: &[u8]) -> String {
  hex::encode(Sha256::digest(body))
}

fn parse_http_date(headers: &Headers) -> Option<SystemTime> {
  let raw = headers.last_modified()?;
  let parsed = DateTime::parse_from_rfc2822(raw.trim()).ok()?;
  let secs = u64::try_from(parsed.timestamp()).ok()?;
  Some(UNIX_EPOCH + Duration::from_secs(secs))
}
