//! Case-insensitive, multi-value header dictionary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header set produced by processors and consumed when building arc
/// validators.
///
/// Names are stored lowercased; values keep insertion order per name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
  entries: BTreeMap<String, Vec<String>>,
}

impl Headers {
  pub const CONTENT_TYPE: &'static str = "content-type";
  pub const CONTENT_LENGTH: &'static str = "content-length";
  pub const LAST_MODIFIED: &'static str = "last-modified";
  pub const CONTENT_ENCODING: &'static str = "content-encoding";
  pub const LOCATION: &'static str = "location";

  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style [`Headers::add`].
  pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
    self.add(name, value);
    self
  }

  /// Append a value, keeping any existing values for the name.
  pub fn add(&mut self, name: &str, value: impl Into<String>) {
    self
      .entries
      .entry(name.trim().to_ascii_lowercase())
      .or_default()
      .push(value.into());
  }

  /// Replace all values for the name with a single value.
  pub fn set(&mut self, name: &str, value: impl Into<String>) {
    self
      .entries
      .insert(name.trim().to_ascii_lowercase(), vec![value.into()]);
  }

  pub fn remove(&mut self, name: &str) -> Vec<String> {
    self
      .entries
      .remove(&name.trim().to_ascii_lowercase())
      .unwrap_or_default()
  }

  pub fn first(&self, name: &str) -> Option<&str> {
    self.get_all(name).first().map(String::as_str)
  }

  pub fn get_all(&self, name: &str) -> &[String] {
    self
      .entries
      .get(&name.trim().to_ascii_lowercase())
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  pub fn contains(&self, name: &str) -> bool {
    !self.get_all(name).is_empty()
  }

  /// Number of distinct header names.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Iterate `(name, value)` pairs, names in sorted order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .entries
      .iter()
      .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
  }

  pub fn content_type(&self) -> Option<&str> {
    self.first(Self::CONTENT_TYPE)
  }

  pub fn content_length(&self) -> Option<u64> {
    self.first(Self::CONTENT_LENGTH)?.trim().parse().ok()
  }

  pub fn last_modified(&self) -> Option<&str> {
    self.first(Self::LAST_MODIFIED)
  }
}
