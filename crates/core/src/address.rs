//! Normalized resource addresses.
//!
//! An [`Address`] names a content resource. Parsing normalizes the textual
//! form so that trivially different spellings of the same resource compare
//! equal: scheme and host are lowercased, default ports are dropped, an empty
//! hierarchical path becomes `/`, and the fragment is discarded. The query is
//! kept verbatim.
//!
//! Two addresses are equal iff their normalized keys and their
//! [`Negotiation`] parameters are equal.

use std::{
  collections::BTreeSet,
  fmt,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Errors produced while parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
  #[error("Address is empty")]
  Empty,
  #[error("Address '{0}' has no scheme")]
  MissingScheme(String),
  #[error("Invalid scheme '{0}'")]
  InvalidScheme(String),
}

// ============================================================================
// Negotiation
// ============================================================================

/// Content-negotiation parameters attached to an address.
///
/// Stored as sorted, lowercased sets so that the order in which a caller
/// listed accepted types never affects equality or hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Negotiation {
  accept_types: BTreeSet<String>,
  accept_encodings: BTreeSet<String>,
}

impl Negotiation {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an accepted content type (e.g. `text/html`).
  pub fn accept_type(mut self, content_type: impl AsRef<str>) -> Self {
    let value = content_type.as_ref().trim().to_ascii_lowercase();
    if !value.is_empty() {
      self.accept_types.insert(value);
    }
    self
  }

  /// Add an accepted content encoding (e.g. `gzip`).
  pub fn accept_encoding(mut self, encoding: impl AsRef<str>) -> Self {
    let value = encoding.as_ref().trim().to_ascii_lowercase();
    if !value.is_empty() {
      self.accept_encodings.insert(value);
    }
    self
  }

  pub fn accepted_types(&self) -> impl Iterator<Item = &str> {
    self.accept_types.iter().map(String::as_str)
  }

  pub fn accepted_encodings(&self) -> impl Iterator<Item = &str> {
    self.accept_encodings.iter().map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.accept_types.is_empty() && self.accept_encodings.is_empty()
  }
}

// ============================================================================
// Address
// ============================================================================

/// Immutable, normalized identifier for a content resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
  scheme: String,
  /// `None` for opaque addresses such as `data:` or `mailto:`.
  authority: Option<String>,
  path: String,
  query: Option<String>,
  negotiation: Negotiation,
}

impl Address {
  /// Parse and normalize an address string.
  pub fn parse(input: &str) -> Result<Self, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
      return Err(AddressError::Empty);
    }

    // Fragments never identify a different resource
    let without_fragment = match trimmed.find('#') {
      Some(idx) => &trimmed[..idx],
      None => trimmed,
    };

    let colon = without_fragment
      .find(':')
      .ok_or_else(|| AddressError::MissingScheme(trimmed.to_string()))?;
    let raw_scheme = &without_fragment[..colon];
    if !is_valid_scheme(raw_scheme) {
      return Err(AddressError::InvalidScheme(raw_scheme.to_string()));
    }
    let scheme = raw_scheme.to_ascii_lowercase();
    let rest = &without_fragment[colon + 1..];

    let (authority, rest) = match rest.strip_prefix("//") {
      Some(hier) => {
        let end = hier.find(['/', '?']).unwrap_or(hier.len());
        (
          Some(normalize_authority(&scheme, &hier[..end])),
          &hier[end..],
        )
      }
      None => (None, rest),
    };

    let (path, query) = match rest.find('?') {
      Some(idx) => (&rest[..idx], Some(rest[idx + 1..].to_string())),
      None => (rest, None),
    };

    let path = if authority.is_some() && path.is_empty() {
      "/".to_string()
    } else {
      path.to_string()
    };

    Ok(Self {
      scheme,
      authority,
      path,
      query,
      negotiation: Negotiation::default(),
    })
  }

  /// Address for a local file.
  ///
  /// Characters that would change how the address text parses (`%`, `?`,
  /// `#`, whitespace and controls) are percent-encoded, so
  /// [`to_file_path`](Self::to_file_path) returns `path` unchanged.
  pub fn file(path: &Path) -> Self {
    let mut text = path.to_string_lossy().replace('\\', "/");
    if !text.starts_with('/') {
      text.insert(0, '/');
    }
    Self {
      scheme: "file".to_string(),
      authority: Some(String::new()),
      path: percent_encode_path(&text),
      query: None,
      negotiation: Negotiation::default(),
    }
  }

  /// Replace the negotiation parameters.
  pub fn with_negotiation(mut self, negotiation: Negotiation) -> Self {
    self.negotiation = negotiation;
    self
  }

  pub fn scheme(&self) -> &str {
    &self.scheme
  }

  pub fn authority(&self) -> Option<&str> {
    self.authority.as_deref()
  }

  /// Host component of the authority, without userinfo or port.
  pub fn host(&self) -> Option<&str> {
    let authority = self.authority.as_deref()?;
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    if host_port.starts_with('[') {
      // IPv6 literal
      let end = host_port.find(']').map(|i| i + 1).unwrap_or(host_port.len());
      return Some(&host_port[..end]);
    }
    Some(host_port.split(':').next().unwrap_or(host_port))
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn query(&self) -> Option<&str> {
    self.query.as_deref()
  }

  pub fn negotiation(&self) -> &Negotiation {
    &self.negotiation
  }

  /// The normalized key without negotiation metadata.
  pub fn key(&self) -> String {
    self.to_string()
  }

  /// True when both addresses name the same resource, ignoring negotiation.
  pub fn same_resource(&self, other: &Address) -> bool {
    self.scheme == other.scheme
      && self.authority == other.authority
      && self.path == other.path
      && self.query == other.query
  }

  /// Local filesystem path for `file:` addresses, percent-decoded.
  pub fn to_file_path(&self) -> Option<PathBuf> {
    if self.scheme != "file" {
      return None;
    }
    Some(PathBuf::from(percent_decode(&self.path)))
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:", self.scheme)?;
    if let Some(authority) = &self.authority {
      write!(f, "//{}", authority)?;
    }
    f.write_str(&self.path)?;
    if let Some(query) = &self.query {
      write!(f, "?{}", query)?;
    }
    Ok(())
  }
}

impl std::str::FromStr for Address {
  type Err = AddressError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

fn is_valid_scheme(scheme: &str) -> bool {
  let mut chars = scheme.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() => {}
    _ => return false,
  }
  chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn default_port(scheme: &str) -> Option<&'static str> {
  match scheme {
    "http" => Some("80"),
    "https" => Some("443"),
    "ftp" => Some("21"),
    _ => None,
  }
}

fn normalize_authority(scheme: &str, authority: &str) -> String {
  let (userinfo, host_port) = match authority.rfind('@') {
    Some(idx) => (Some(&authority[..idx]), &authority[idx + 1..]),
    None => (None, authority),
  };

  // Split off a port, leaving IPv6 literals intact
  let (host, port) = match host_port.rfind(':') {
    Some(idx) if !host_port[idx..].contains(']') => (&host_port[..idx], Some(&host_port[idx + 1..])),
    _ => (host_port, None),
  };

  let mut host = host.to_ascii_lowercase();
  if scheme == "file" && host == "localhost" {
    host.clear();
  }

  let port = port.filter(|p| !p.is_empty() && Some(*p) != default_port(scheme));

  let mut normalized = String::with_capacity(authority.len());
  if let Some(userinfo) = userinfo {
    normalized.push_str(userinfo);
    normalized.push('@');
  }
  normalized.push_str(&host);
  if let Some(port) = port {
    normalized.push(':');
    normalized.push_str(port);
  }
  normalized
}

/// Decode `%XX` escapes; invalid escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
  let bytes = input.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%'
      && i + 2 < bytes.len()
      && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
    {
      out.push((hi << 4) | lo);
      i += 3;
      continue;
    }
    out.push(bytes[i]);
    i += 1;
  }
  String::from_utf8_lossy(&out).into_owned()
}

/// Escape the characters a path segment cannot carry literally.
pub fn percent_encode_path(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  for c in input.chars() {
    match c {
      '%' | '?' | '#' => push_escaped(&mut out, c as u8),
      c if c.is_ascii_whitespace() || c.is_ascii_control() => push_escaped(&mut out, c as u8),
      c => out.push(c),
    }
  }
  out
}

fn push_escaped(out: &mut String, byte: u8) {
  const HEX: &[u8; 16] = b"0123456789ABCDEF";
  out.push('%');
  out.push(HEX[usize::from(byte >> 4)] as char);
  out.push(HEX[usize::from(byte & 0x0f)] as char);
}

fn hex_value(byte: u8) -> Option<u8> {
  match byte {
    b'0'..=b'9' => Some(byte - b'0'),
    b'a'..=b'f' => Some(byte - b'a' + 10),
    b'A'..=b'F' => Some(byte - b'A' + 10),
    _ => None,
  }
}
