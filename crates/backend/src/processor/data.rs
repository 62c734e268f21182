//! `data:` processor for inline content.

use arcflow_core::{Address, Headers, address::percent_decode};
use base64::{Engine as _, engine::general_purpose::STANDARD};

use super::{Processor, ProcessorError};
use crate::arc::{Content, ProcessorId};

const DEFAULT_MEDIA_TYPE: &str = "text/plain;charset=US-ASCII";

/// Decodes `data:[<mediatype>][;base64],<payload>` addresses.
///
/// The payload is the address itself, so arcs never go stale and
/// [`Processor::current_validators`] keeps its `Unknown` default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataProcessor;

impl DataProcessor {
  pub const ID: &'static str = "data";

  pub fn new() -> Self {
    Self
  }

  fn decode(address: &Address) -> Result<Content, ProcessorError> {
    let malformed = |reason: &str| ProcessorError::Malformed {
      address: address.to_string(),
      reason: reason.to_string(),
    };

    // Address parsing splits off a query; it belongs to the payload here
    let mut raw = address.path().to_string();
    if let Some(query) = address.query() {
      raw.push('?');
      raw.push_str(query);
    }

    let (meta, payload) = raw.split_once(',').ok_or_else(|| malformed("missing ','"))?;
    let (media_type, is_base64) = match meta.strip_suffix(";base64") {
      Some(media_type) => (media_type, true),
      None => (meta, false),
    };

    let body = if is_base64 {
      let cleaned: String = percent_decode(payload).split_whitespace().collect();
      STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| malformed(&e.to_string()))?
    } else {
      percent_decode(payload).into_bytes()
    };

    let content_type = if media_type.is_empty() {
      DEFAULT_MEDIA_TYPE.to_string()
    } else if media_type.starts_with(';') {
      // Parameters without a type, e.g. `data:;charset=utf-8,...`
      format!("text/plain{}", media_type)
    } else {
      media_type.to_ascii_lowercase()
    };

    let headers = Headers::new()
      .with(Headers::CONTENT_TYPE, content_type)
      .with(Headers::CONTENT_LENGTH, body.len().to_string());
    Ok(Content::new(headers, body))
  }
}

impl Processor for DataProcessor {
  fn id(&self) -> ProcessorId {
    ProcessorId::new(Self::ID)
  }

  fn schemes(&self) -> &[&'static str] {
    &["data"]
  }

  fn transform(&self, address: &Address, _input: Option<&Content>) -> Result<Content, ProcessorError> {
    if address.scheme() != "data" {
      return Err(ProcessorError::Unsupported(address.to_string()));
    }
    Self::decode(address)
  }
}
