//! Error domains and structured error reports.
//!
//! Every error type in the pipeline belongs to an [`ErrorDomain`] and carries
//! a machine-readable code. Collaborators that only need to surface an error
//! (to a log, a status view, another process) use [`DomainError::report`] and
//! never match on the concrete error enum.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the error domain used for address-filter failures.
pub const FILTERED_ADDRESS_ERROR_NAME: &str = "FilteredAddress";

/// Top-level grouping of error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorDomain {
  /// Cache storage: persistence files and lock files.
  Cache,
  /// Address filter rule evaluation.
  FilteredAddress,
  /// Content processors.
  Processor,
  /// Message queue, queue processors, run loops and the scheduler.
  Scheduling,
  /// Pipeline driver and context lifecycle.
  Pipeline,
  /// Configuration loading.
  Config,
}

impl ErrorDomain {
  pub const fn name(self) -> &'static str {
    match self {
      Self::Cache => "Cache",
      Self::FilteredAddress => FILTERED_ADDRESS_ERROR_NAME,
      Self::Processor => "Processor",
      Self::Scheduling => "Scheduling",
      Self::Pipeline => "Pipeline",
      Self::Config => "Config",
    }
  }
}

impl fmt::Display for ErrorDomain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Cache-layer error codes.
///
/// Numeric values are stable; gaps belong to codes owned by other layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CacheErrorCode {
  CacheFileUnableToWrite = 1,
  UnableToCreatePath = 3,
  UnableToSerializeLockFile = 4,
  UnableToCreateLockFile = 5,
  LockInvalidated = 31,
  LockUnavailable = 32,
  CannotCreateLock = 33,
}

impl CacheErrorCode {
  pub const fn code(self) -> u32 {
    self as u32
  }

  pub const fn description(self) -> &'static str {
    match self {
      Self::CacheFileUnableToWrite => "Unable to write cache file",
      Self::UnableToCreatePath => "Unable to create cache directory",
      Self::UnableToSerializeLockFile => "Unable to serialize lock file contents",
      Self::UnableToCreateLockFile => "Unable to create lock file",
      Self::LockInvalidated => "Cache lock was invalidated",
      Self::LockUnavailable => "Cache lock is held by another process",
      Self::CannotCreateLock => "Cannot create cache lock",
    }
  }

  pub const fn suggestion(self) -> &'static str {
    match self {
      Self::CacheFileUnableToWrite | Self::UnableToCreatePath => {
        "Check that the cache directory exists, is writable, and that the disk is not full."
      }
      Self::UnableToSerializeLockFile | Self::UnableToCreateLockFile | Self::CannotCreateLock => {
        "Check permissions on the cache directory."
      }
      Self::LockInvalidated | Self::LockUnavailable => {
        "Another process may be using the same cache directory. Quit it or configure a different directory."
      }
    }
  }
}

/// An error that belongs to a domain and carries a stable code.
pub trait DomainError: std::error::Error {
  fn domain(&self) -> ErrorDomain;

  fn code(&self) -> u32;

  /// Human-readable recovery suggestion, if there is one.
  fn suggestion(&self) -> Option<String> {
    None
  }

  fn report(&self) -> ErrorReport {
    ErrorReport {
      domain: self.domain().name().to_string(),
      code: self.code(),
      description: self.to_string(),
      suggestion: self.suggestion(),
    }
  }
}

/// Structured, in-process error shape: machine-readable code plus a
/// description/suggestion pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
  pub domain: String,
  pub code: u32,
  pub description: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub suggestion: Option<String>,
}

impl fmt::Display for ErrorReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}:{}] {}", self.domain, self.code, self.description)?;
    if let Some(suggestion) = &self.suggestion {
      write!(f, " ({})", suggestion)?;
    }
    Ok(())
  }
}
