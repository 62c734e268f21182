//! Test helpers for pipeline integration tests.
//!
//! Provides `PipelineTestContext`, which owns a temporary directory of source
//! files and builds `PipelineContext`s over it with fast test settings.

use std::{
  io,
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use filetime::FileTime;
use tempfile::TempDir;

use crate::{
  Address, Config, Headers,
  arc::{Content, ProcessorId},
  config::FilterRuleConfig,
  pipeline::PipelineContext,
  processor::{Processor, ProcessorError, ProcessorRegistry},
};

/// Fixed modification time used by tests (Tue, 15 Nov 1994 08:12:31 GMT).
pub const T: i64 = 784_887_151;

/// Test context for pipeline integration tests.
pub struct PipelineTestContext {
  /// Source files served through `file:` addresses
  pub files: TempDir,
  /// Configuration used by `start`
  pub config: Config,
}

impl PipelineTestContext {
  pub fn new() -> Self {
    let files = TempDir::new().expect("create files temp dir");

    let mut config = Config::default();
    config.queue.workers = 2;
    config.cache.idle_timeout_secs = None;
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 50;
    config.retry.jitter = false;

    Self { files, config }
  }

  pub fn with_rules(mut self, rules: Vec<FilterRuleConfig>) -> Self {
    self.config.filter.rules = rules;
    self
  }

  /// Start a pipeline with the default processors plus `extra`.
  pub fn start(&self, extra: Vec<Arc<dyn Processor>>) -> PipelineContext {
    let registry = extra
      .into_iter()
      .fold(ProcessorRegistry::with_defaults(), |registry, p| registry.register(p));
    PipelineContext::start(self.config.clone(), registry).expect("start pipeline")
  }

  pub fn path(&self, name: &str) -> PathBuf {
    self.files.path().join(name)
  }

  pub fn address(&self, name: &str) -> Address {
    Address::file(&self.path(name))
  }

  /// Write a file and pin its modification time.
  pub fn write_file(&self, name: &str, content: &str, mtime_secs: i64) {
    self.write_file_at(name, content, mtime_secs, 0);
  }

  /// Write a file and pin its modification time to the nanosecond.
  pub fn write_file_at(&self, name: &str, content: &str, mtime_secs: i64, mtime_nanos: u32) {
    let path = self.path(name);
    std::fs::write(&path, content).expect("write file");
    filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, mtime_nanos)).expect("set mtime");
  }

  pub fn delete_file(&self, name: &str) {
    let _ = std::fs::remove_file(self.path(name));
  }
}

/// Uppercases `text/plain` input.
pub struct UpperProcessor;

impl Processor for UpperProcessor {
  fn id(&self) -> ProcessorId {
    ProcessorId::new("upper")
  }

  fn content_types(&self) -> &[&'static str] {
    &["text/plain"]
  }

  fn transform(&self, address: &Address, input: Option<&Content>) -> Result<Content, ProcessorError> {
    let input = input.ok_or_else(|| ProcessorError::Unsupported(address.to_string()))?;
    let upper = String::from_utf8_lossy(input.body()).to_uppercase();
    Ok(Content::new(input.headers().clone(), upper.into_bytes()))
  }
}

/// Serves `count:` addresses, counting runs and failing the first
/// `failures` runs with `failure_kind`.
pub struct CountingProcessor {
  pub calls: AtomicUsize,
  failures: usize,
  failure_kind: io::ErrorKind,
  delay: Duration,
}

impl CountingProcessor {
  pub fn new() -> Self {
    Self {
      calls: AtomicUsize::new(0),
      failures: 0,
      failure_kind: io::ErrorKind::Interrupted,
      delay: Duration::ZERO,
    }
  }

  pub fn failing(mut self, failures: usize, kind: io::ErrorKind) -> Self {
    self.failures = failures;
    self.failure_kind = kind;
    self
  }

  pub fn slow(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Processor for CountingProcessor {
  fn id(&self) -> ProcessorId {
    ProcessorId::new("count")
  }

  fn schemes(&self) -> &[&'static str] {
    &["count"]
  }

  fn transform(&self, address: &Address, _input: Option<&Content>) -> Result<Content, ProcessorError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      std::thread::sleep(self.delay);
    }
    if call < self.failures {
      return Err(ProcessorError::Unreadable {
        path: address.to_string(),
        source: io::Error::from(self.failure_kind),
      });
    }
    let body = format!("{} #{}", address.path(), call);
    Ok(Content::new(Headers::new().with(Headers::CONTENT_TYPE, "text/plain"), body.into_bytes()))
  }
}

pub fn count_address(path: &str) -> Address {
  Address::parse(&format!("count:{}", path)).expect("valid count address")
}

/// Wait for a condition to become true, with timeout.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
  F: FnMut() -> bool,
{
  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    if condition() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  condition()
}
