//! The pipeline context: one explicitly constructed owner for the queue,
//! workers, main run loop, scheduler, caches, store and processor registry.
//!
//! Nothing here is global. Hosts build a [`PipelineContext`] at startup,
//! share it (typically behind an `Arc`), and call
//! [`shutdown`](PipelineContext::shutdown) once at exit.

mod driver;
mod retry;

#[cfg(test)]
mod __tests__;

use std::{
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
};

use arcflow_core::{Config, DomainError, ErrorDomain, ErrorReport};
pub use driver::{Request, Transform};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  arc::ValidatorProbe,
  cache::{ArcStore, FilteredAddressCache, ProcessorCache},
  processor::{ProcessorError, ProcessorRegistry},
  scheduling::{
    Invocation, InvocationHandle, MessageQueue, QueueError, QueueProcessor, RunLoop, RunLoopError,
    RunLoopQueueProcessor, Scheduler, SchedulerError,
  },
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  #[error("Address {address} is blocked by filter rule '{rule}'")]
  Blocked { address: String, rule: String },
  #[error("Too many redirects resolving {address} (limit {limit})")]
  TooManyRedirects { address: String, limit: u32 },
  #[error("No processor available for {0}")]
  NoProcessor(String),
  #[error("Processor '{processor}' failed for {address}: {source}")]
  Processor {
    processor: String,
    address: String,
    #[source]
    source: ProcessorError,
  },
  #[error("Cached failure for {address}: {report}")]
  CachedFailure { address: String, report: ErrorReport },
  #[error(transparent)]
  Queue(#[from] QueueError),
  #[error(transparent)]
  Scheduler(#[from] SchedulerError),
  #[error(transparent)]
  RunLoop(#[from] RunLoopError),
  #[error("Cache task failed: {0}")]
  CacheTask(String),
  #[error("Pipeline context has shut down")]
  ShutDown,
}

impl DomainError for PipelineError {
  fn domain(&self) -> ErrorDomain {
    match self {
      Self::Processor { source, .. } => source.domain(),
      Self::Queue(_) | Self::Scheduler(_) | Self::RunLoop(_) => ErrorDomain::Scheduling,
      _ => ErrorDomain::Pipeline,
    }
  }

  fn code(&self) -> u32 {
    match self {
      Self::Blocked { .. } => 1,
      Self::TooManyRedirects { .. } => 2,
      Self::NoProcessor(_) => 3,
      Self::Processor { source, .. } => source.code(),
      Self::CachedFailure { report, .. } => report.code,
      Self::Queue(_) => 10,
      Self::Scheduler(_) => 11,
      Self::RunLoop(_) => 12,
      Self::CacheTask(_) => 13,
      Self::ShutDown => 4,
    }
  }

  fn suggestion(&self) -> Option<String> {
    match self {
      Self::Blocked { .. } => Some("Adjust the [filter] rules if this address should load".to_string()),
      Self::TooManyRedirects { .. } => Some("Check the [filter] redirect rules for a cycle".to_string()),
      Self::CachedFailure { report, .. } => report.suggestion.clone(),
      _ => None,
    }
  }
}

struct ShutdownHook {
  name: String,
  hook: Box<dyn FnOnce() + Send>,
}

/// Owns every long-lived pipeline component.
pub struct PipelineContext {
  config: Config,
  registry: Arc<ProcessorRegistry>,
  processor_cache: Arc<ProcessorCache>,
  filter_cache: Arc<FilteredAddressCache>,
  store: Option<Arc<ArcStore>>,
  queue: Arc<MessageQueue>,
  workers: Mutex<Vec<QueueProcessor>>,
  main_queue: Arc<MessageQueue>,
  main_loop: RunLoop,
  main_processor: RunLoopQueueProcessor,
  scheduler: Scheduler,
  hooks: Mutex<Vec<ShutdownHook>>,
  cancel: CancellationToken,
  shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipelineContext {
  /// Build and start every component. Must be called from within a tokio
  /// runtime.
  ///
  /// An unusable persistence directory is logged and skipped; the pipeline
  /// then caches in memory only.
  pub fn start(config: Config, registry: ProcessorRegistry) -> Result<Self, PipelineError> {
    let registry = Arc::new(registry);
    let probe: Arc<dyn ValidatorProbe> = registry.clone();
    let processor_cache = Arc::new(ProcessorCache::new(&config.cache).with_probe(probe));
    let filter_cache = Arc::new(FilteredAddressCache::from_config(&config));

    let store = match &config.cache.persist_dir {
      Some(dir) => match ArcStore::open(dir) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
          let report = e.report();
          warn!(
            dir = %dir.display(),
            code = report.code,
            err = %e,
            suggestion = report.suggestion.as_deref().unwrap_or(""),
            "Arc store unavailable; caching in memory only"
          );
          None
        }
      },
      None => None,
    };

    let cancel = CancellationToken::new();

    let queue = Arc::new(MessageQueue::new("pipeline"));
    let worker_count = config.queue.workers.max(1);
    let workers = (0..worker_count)
      .map(|i| QueueProcessor::spawn(format!("pipeline-worker-{}", i), queue.clone(), cancel.child_token()))
      .collect();

    let main_queue = Arc::new(MessageQueue::new("main"));
    let main_loop = RunLoop::spawn("arcflow-main")?;
    let main_processor = RunLoopQueueProcessor::attach(&main_loop, main_queue.clone(), cancel.child_token())?;

    let scheduler = Scheduler::start(queue.clone());

    info!(
      workers = worker_count,
      capacity = config.cache.capacity,
      filter_rules = config.filter.rules.len(),
      processors = registry.len(),
      persistent = store.is_some(),
      "Pipeline context started"
    );

    Ok(Self {
      config,
      registry,
      processor_cache,
      filter_cache,
      store,
      queue,
      workers: Mutex::new(workers),
      main_queue,
      main_loop,
      main_processor,
      scheduler,
      hooks: Mutex::new(Vec::new()),
      cancel,
      shut_down: AtomicBool::new(false),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn registry(&self) -> &Arc<ProcessorRegistry> {
    &self.registry
  }

  pub fn processor_cache(&self) -> &Arc<ProcessorCache> {
    &self.processor_cache
  }

  pub fn filter_cache(&self) -> &Arc<FilteredAddressCache> {
    &self.filter_cache
  }

  pub fn store(&self) -> Option<&Arc<ArcStore>> {
    self.store.as_ref()
  }

  /// The shared work queue drained by the worker pool.
  pub fn queue(&self) -> &Arc<MessageQueue> {
    &self.queue
  }

  /// The queue drained on the main run loop thread.
  pub fn main_queue(&self) -> &Arc<MessageQueue> {
    &self.main_queue
  }

  pub fn main_loop(&self) -> &RunLoop {
    &self.main_loop
  }

  pub fn main_processor(&self) -> &RunLoopQueueProcessor {
    &self.main_processor
  }

  pub fn scheduler(&self) -> &Scheduler {
    &self.scheduler
  }

  pub fn is_shut_down(&self) -> bool {
    self.shut_down.load(Ordering::Acquire)
  }

  /// Enqueue work for the worker pool.
  pub fn submit(&self, invocation: Invocation) -> Result<InvocationHandle, PipelineError> {
    if self.is_shut_down() {
      return Err(PipelineError::ShutDown);
    }
    Ok(self.queue.enqueue(invocation)?)
  }

  /// Enqueue work for the main run loop thread.
  pub fn submit_main(&self, invocation: Invocation) -> Result<InvocationHandle, PipelineError> {
    if self.is_shut_down() {
      return Err(PipelineError::ShutDown);
    }
    Ok(self.main_queue.enqueue(invocation)?)
  }

  /// Register cleanup to run once during shutdown. Hooks run in reverse
  /// registration order.
  pub fn on_shutdown(&self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) -> Result<(), PipelineError> {
    if self.is_shut_down() {
      return Err(PipelineError::ShutDown);
    }
    lock(&self.hooks).push(ShutdownHook {
      name: name.into(),
      hook: Box::new(hook),
    });
    Ok(())
  }

  /// Tear down in dependency order:
  ///
  /// 1. scheduler (termination events fire here)
  /// 2. queues close and drain; workers and the main processor finish
  /// 3. shutdown hooks, newest first
  /// 4. the main run loop thread
  ///
  /// Only the first call does anything.
  pub async fn shutdown(&self) {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      return;
    }
    info!("Pipeline context shutting down");

    let fired = self.scheduler.shutdown().await;
    debug!(fired, "Scheduler settled");

    self.queue.close();
    self.main_queue.close();

    let workers = std::mem::take(&mut *lock(&self.workers));
    for worker in workers {
      worker.join().await;
    }
    self.main_processor.finished().await;

    self.run_hooks();
    self.main_loop.shutdown().await;

    info!("Pipeline context stopped");
  }

  fn run_hooks(&self) {
    let hooks = std::mem::take(&mut *lock(&self.hooks));
    for ShutdownHook { name, hook } in hooks.into_iter().rev() {
      debug!(hook = %name, "Running shutdown hook");
      if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!(hook = %name, "Shutdown hook panicked");
      }
    }
  }
}

impl Drop for PipelineContext {
  fn drop(&mut self) {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      return;
    }
    // Not shut down cleanly: stop workers where they are, but still honour
    // the once-only cleanup contract.
    warn!("Pipeline context dropped without shutdown");
    self.cancel.cancel();
    self.queue.close();
    self.main_queue.close();
    self.run_hooks();
  }
}
