//! Content processors and their registry.
//!
//! A processor turns an address (and optionally the content of an upstream
//! arc) into [`Content`]. Processors are synchronous; the pipeline runs them
//! on queue workers, off the async executor.

mod data;
mod file;
mod fs;

use std::{collections::HashMap, io, sync::Arc};

use arcflow_core::{Address, DomainError, ErrorDomain};
pub use data::DataProcessor;
pub use file::{FileProcessor, content_type_for_path, headers_for_filename};
pub use fs::{FileMetadata, FileSystem, LocalFileSystem};
use tracing::debug;

use crate::arc::{Content, Probe, ProcessorId, ValidatorProbe};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
  #[error("Resource not found: {0}")]
  NotFound(String),
  #[error("Unable to read {path}: {source}")]
  Unreadable {
    path: String,
    #[source]
    source: io::Error,
  },
  #[error("Address {0} is not supported by this processor")]
  Unsupported(String),
  #[error("Malformed input for {address}: {reason}")]
  Malformed { address: String, reason: String },
  #[error("Processor did not complete: {0}")]
  Crashed(String),
}

impl ProcessorError {
  /// Transient failures worth retrying with backoff.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Unreadable { source, .. } => matches!(
        source.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
      ),
      _ => false,
    }
  }
}

impl DomainError for ProcessorError {
  fn domain(&self) -> ErrorDomain {
    ErrorDomain::Processor
  }

  fn code(&self) -> u32 {
    match self {
      Self::NotFound(_) => 1,
      Self::Unreadable { .. } => 2,
      Self::Unsupported(_) => 3,
      Self::Malformed { .. } => 4,
      Self::Crashed(_) => 5,
    }
  }
}

/// A content transformer.
pub trait Processor: Send + Sync {
  /// Stable identity; part of every arc key this processor produces.
  fn id(&self) -> ProcessorId;

  /// Address schemes this processor can load from.
  fn schemes(&self) -> &[&'static str] {
    &[]
  }

  /// Content types this processor accepts as upstream input.
  fn content_types(&self) -> &[&'static str] {
    &[]
  }

  /// Produce content for `address`. `input` is the upstream content when the
  /// processor runs as a transform stage.
  fn transform(&self, address: &Address, input: Option<&Content>) -> Result<Content, ProcessorError>;

  /// Current validators of the resource behind `address`.
  fn current_validators(&self, _address: &Address) -> Probe {
    Probe::Unknown
  }
}

/// Maps schemes, content types and ids to processors. Built once at startup
/// and immutable afterwards.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
  by_id: HashMap<ProcessorId, Arc<dyn Processor>>,
  by_scheme: HashMap<String, Arc<dyn Processor>>,
  by_content_type: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in `file:` and `data:` processors.
  pub fn with_defaults() -> Self {
    Self::new()
      .register(Arc::new(FileProcessor::new()))
      .register(Arc::new(DataProcessor::new()))
  }

  /// Add a processor under its id, schemes and content types. A later
  /// registration replaces an earlier one for the same name.
  pub fn register(mut self, processor: Arc<dyn Processor>) -> Self {
    let id = processor.id();
    for scheme in processor.schemes() {
      self.by_scheme.insert(scheme.to_ascii_lowercase(), processor.clone());
    }
    for content_type in processor.content_types() {
      self
        .by_content_type
        .insert(content_type.to_ascii_lowercase(), processor.clone());
    }
    debug!(processor = %id, schemes = ?processor.schemes(), "Processor registered");
    self.by_id.insert(id, processor);
    self
  }

  pub fn get(&self, id: &ProcessorId) -> Option<Arc<dyn Processor>> {
    self.by_id.get(id).cloned()
  }

  pub fn for_address(&self, address: &Address) -> Option<Arc<dyn Processor>> {
    self.by_scheme.get(address.scheme()).cloned()
  }

  /// Processor accepting `content_type` as input. Parameters such as
  /// `; charset=utf-8` are ignored.
  pub fn for_content_type(&self, content_type: &str) -> Option<Arc<dyn Processor>> {
    let essence = content_type.split(';').next().unwrap_or(content_type).trim();
    self.by_content_type.get(&essence.to_ascii_lowercase()).cloned()
  }

  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }
}

impl ValidatorProbe for ProcessorRegistry {
  /// The resource behind an address is owned by its scheme's processor, so
  /// arcs from transform stages revalidate against the same source.
  fn probe(&self, address: &Address) -> Probe {
    match self.for_address(address) {
      Some(processor) => processor.current_validators(address),
      None => Probe::Unknown,
    }
  }
}
