//! Request resolution: filter, cache, store, compute, install.

use std::{
  sync::{Arc, Mutex, PoisonError},
  time::Duration,
};

use arcflow_core::{Address, DomainError};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use super::{PipelineContext, PipelineError, retry::Backoff};
use crate::{
  arc::{ArcKey, ArcResult, CacheArc, ConditionSet, Content, ProcessorId, SharedArc, ValidatorSet},
  cache::{ArcStore, InsertOutcome, ProcessorCache},
  processor::{Processor, ProcessorError},
  scheduling::{Invocation, InvocationError, Priority},
};

/// How to post-process the content loaded for an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
  /// Run a specific registered processor over the loaded content.
  Processor(ProcessorId),
  /// Run whichever processor is registered for the loaded content's type.
  ByContentType,
}

/// A request for the content behind an address.
#[derive(Debug, Clone)]
pub struct Request {
  address: Address,
  conditions: ConditionSet,
  transform: Option<Transform>,
}

impl Request {
  pub fn new(address: Address) -> Self {
    Self {
      address,
      conditions: ConditionSet::new(),
      transform: None,
    }
  }

  pub fn with_conditions(mut self, conditions: ConditionSet) -> Self {
    self.conditions = conditions;
    self
  }

  /// Pass the loaded content through `processor`.
  pub fn through(mut self, processor: ProcessorId) -> Self {
    self.transform = Some(Transform::Processor(processor));
    self
  }

  /// Pass the loaded content through the processor registered for its type.
  pub fn through_content_type(mut self) -> Self {
    self.transform = Some(Transform::ByContentType);
    self
  }

  pub fn address(&self) -> &Address {
    &self.address
  }

  pub fn conditions(&self) -> &ConditionSet {
    &self.conditions
  }

  pub fn transform(&self) -> Option<&Transform> {
    self.transform.as_ref()
  }
}

/// Where a stage's validators come from.
enum Validation<'a> {
  /// Derived from the stage's own output headers and body.
  FromOutput,
  /// Inherited from the upstream arc, so the stage goes stale with its source.
  Inherit(&'a ValidatorSet),
}

impl PipelineContext {
  /// Resolve `request` to an installed arc.
  ///
  /// Concurrent fetches for the same key may each compute, but all of them
  /// return the one arc that won installation.
  pub async fn fetch(&self, request: &Request) -> Result<SharedArc, PipelineError> {
    if self.is_shut_down() {
      return Err(PipelineError::ShutDown);
    }

    let address = self.resolve_filters(request.address())?;
    let loader = self
      .registry
      .for_address(&address)
      .ok_or_else(|| PipelineError::NoProcessor(address.to_string()))?;
    let source = self
      .fetch_stage(&address, loader, None, request.conditions(), Validation::FromOutput)
      .await?;

    let Some(transform) = request.transform() else {
      return Ok(source);
    };
    let Some(content) = source.content().cloned() else {
      return Ok(source);
    };

    let processor = match transform {
      Transform::Processor(id) => self.registry.get(id),
      Transform::ByContentType => content
        .content_type()
        .and_then(|content_type| self.registry.for_content_type(content_type)),
    }
    .ok_or_else(|| PipelineError::NoProcessor(format!("{} ({:?})", address, transform)))?;

    self
      .fetch_stage(
        &address,
        processor,
        Some(content),
        request.conditions(),
        Validation::Inherit(source.validators()),
      )
      .await
  }

  /// Drop every cached arc and filter decision for `address`.
  pub fn invalidate(&self, address: &Address) -> usize {
    let arcs = self.processor_cache.invalidate_address(address);
    let decisions = self.filter_cache.invalidate_address(address);
    debug!(address = %address, arcs, decisions, "Address invalidated");
    arcs + decisions
  }

  /// Follow filter redirects to the address that should be loaded.
  ///
  /// A filter that fails to evaluate is logged and treated as passing the
  /// address through unchanged.
  fn resolve_filters(&self, address: &Address) -> Result<Address, PipelineError> {
    let limit = self.config.pipeline.max_redirects;
    let mut current = address.clone();

    for _ in 0..=limit {
      let decision = match self.filter_cache.lookup_address(&current) {
        Ok(decision) => decision,
        Err(e) => {
          let report = e.report();
          warn!(address = %current, domain = %report.domain, code = report.code, err = %e, "Address filter failed; continuing unfiltered");
          return Ok(current);
        }
      };

      match decision.as_ref().map(|arc| arc.result()) {
        Some(ArcResult::Redirect(target)) => {
          debug!(from = %current, to = %target, "Following filter redirect");
          current = target.clone();
        }
        Some(ArcResult::Blocked { rule }) => {
          return Err(PipelineError::Blocked {
            address: current.to_string(),
            rule: rule.clone(),
          });
        }
        _ => return Ok(current),
      }
    }

    Err(PipelineError::TooManyRedirects {
      address: address.to_string(),
      limit,
    })
  }

  async fn fetch_stage(
    &self,
    address: &Address,
    processor: Arc<dyn Processor>,
    input: Option<Content>,
    conditions: &ConditionSet,
    validation: Validation<'_>,
  ) -> Result<SharedArc, PipelineError> {
    let key = ArcKey::new(address.clone(), processor.id(), conditions.clone());

    let slots = self.slots();
    let lookup_key = key.clone();
    if let Some(arc) = off_thread(move || slots.cached(&lookup_key)).await? {
      return settle(arc);
    }

    match self.compute(&processor, address, input).await {
      Ok(content) => {
        let validators = match validation {
          Validation::FromOutput => ValidatorSet::from_content(&content),
          Validation::Inherit(upstream) => upstream.clone(),
        };
        let arc = CacheArc::new(key.clone(), ArcResult::Content(content), validators).into_shared();
        let slots = self.slots();
        settle(off_thread(move || slots.install(&key, arc)).await?)
      }
      Err(source) => {
        if let Some(ttl) = self.config.negative_ttl() {
          let report = source.report();
          let negative =
            CacheArc::new(key, ArcResult::Failed(report), ValidatorSet::new().expiring_after(ttl)).into_shared();
          trace!(arc = %negative.id(), ttl_secs = ttl.as_secs(), "Caching failure");
          self.processor_cache.insert(negative);
        }
        Err(PipelineError::Processor {
          processor: processor.id().to_string(),
          address: address.to_string(),
          source,
        })
      }
    }
  }

  fn slots(&self) -> ArcSlots {
    ArcSlots {
      cache: self.processor_cache.clone(),
      store: self.store.clone(),
    }
  }

  /// Run the processor on the worker pool, retrying transient failures after
  /// a scheduled backoff.
  async fn compute(
    &self,
    processor: &Arc<dyn Processor>,
    address: &Address,
    input: Option<Content>,
  ) -> Result<Content, ProcessorError> {
    let backoff = Backoff::new(&self.config.retry);
    let mut attempt = 0;

    loop {
      match self.run_on_worker(processor, address, input.clone()).await {
        Ok(content) => {
          if attempt > 0 {
            info!(attempt, processor = %processor.id(), address = %address, "Processor succeeded after retry");
          }
          return Ok(content);
        }
        Err(e) if e.is_retryable() && attempt < backoff.max_retries() => {
          let delay = backoff.delay_for_attempt(attempt);
          attempt += 1;
          warn!(
            attempt,
            max_retries = backoff.max_retries(),
            backoff_ms = delay.as_millis(),
            err = %e,
            "Retryable processor error, will retry"
          );
          if self.wait_scheduled(delay).await.is_err() {
            return Err(e);
          }
        }
        Err(e) => return Err(e),
      }
    }
  }

  async fn run_on_worker(
    &self,
    processor: &Arc<dyn Processor>,
    address: &Address,
    input: Option<Content>,
  ) -> Result<Content, ProcessorError> {
    let (tx, rx) = oneshot::channel();
    let reply = Mutex::new(Some(tx));
    let label = format!("{} {}", processor.id(), address);
    let processor = processor.clone();
    let address = address.clone();

    let invocation = Invocation::new(label, move || {
      let outcome = processor.transform(&address, input.as_ref());
      let failure = outcome.as_ref().err().map(InvocationError::failed);
      if let Some(tx) = reply.lock().unwrap_or_else(PoisonError::into_inner).take() {
        let _ = tx.send(outcome);
      }
      match failure {
        Some(e) => Err(e),
        None => Ok(()),
      }
    });

    self
      .queue
      .enqueue(invocation)
      .map_err(|e| ProcessorError::Crashed(e.to_string()))?;

    match rx.await {
      Ok(outcome) => outcome,
      Err(_) => Err(ProcessorError::Crashed("processor run ended without a result".to_string())),
    }
  }

  /// Resolve after `delay`, measured by the scheduler.
  async fn wait_scheduled(&self, delay: Duration) -> Result<(), PipelineError> {
    let (tx, rx) = oneshot::channel::<()>();
    let wake = Mutex::new(Some(tx));
    let invocation = Invocation::new("retry backoff", move || {
      if let Some(tx) = wake.lock().unwrap_or_else(PoisonError::into_inner).take() {
        let _ = tx.send(());
      }
      Ok(())
    })
    .with_priority(Priority::High);

    self.scheduler.schedule_after(invocation, delay, false)?;
    rx.await.map_err(|_| PipelineError::ShutDown)
  }
}

/// Cache and store access for one fetch. Validator checks and store files
/// touch the filesystem, so these run on the blocking pool.
struct ArcSlots {
  cache: Arc<ProcessorCache>,
  store: Option<Arc<ArcStore>>,
}

impl ArcSlots {
  /// Fresh arc from memory, else from the store.
  fn cached(&self, key: &ArcKey) -> Option<SharedArc> {
    self.cache.lookup(key).or_else(|| self.load_persisted(key))
  }

  /// Offer a freshly computed arc. A concurrently installed winner is only
  /// adopted if it still validates; a stale winner is evicted by the lookup
  /// and ours is offered again.
  fn install(&self, key: &ArcKey, arc: SharedArc) -> SharedArc {
    let winner = match self.cache.insert(arc.clone()) {
      InsertOutcome::Inserted(arc) => {
        self.persist(&arc);
        return arc;
      }
      InsertOutcome::Rejected { winner } => winner,
    };

    if let Some(current) = self.cache.lookup(key) {
      debug!(winner = %current.id(), key = %key, "Adopting concurrently installed arc");
      return current;
    }

    debug!(stale = %winner.id(), key = %key, "Concurrently installed arc was stale; offering ours");
    match self.cache.insert(arc) {
      InsertOutcome::Inserted(arc) => {
        self.persist(&arc);
        arc
      }
      // Installed after our lookup, so no older than ours
      InsertOutcome::Rejected { winner } => winner,
    }
  }

  /// Reinstall a persisted arc if it is still valid.
  fn load_persisted(&self, key: &ArcKey) -> Option<SharedArc> {
    let store = self.store.as_ref().filter(|store| store.is_enabled())?;
    let arc = store.load(key)?.into_shared();
    self.cache.insert(arc);
    // Revalidate through the cache so a stale file is evicted, not served
    let fresh = self.cache.lookup(key);
    if fresh.is_some() {
      debug!(key = %key, "Warmed arc from store");
    } else {
      store.remove(key);
    }
    fresh
  }

  fn persist(&self, arc: &SharedArc) {
    let Some(store) = &self.store else {
      return;
    };
    if let Err(e) = store.save(arc) {
      let report = e.report();
      warn!(
        key = %arc.key(),
        code = report.code,
        err = %e,
        suggestion = report.suggestion.as_deref().unwrap_or(""),
        "Arc store write failed"
      );
      store.disable();
    }
  }
}

async fn off_thread<T, F>(work: F) -> Result<T, PipelineError>
where
  T: Send + 'static,
  F: FnOnce() -> T + Send + 'static,
{
  tokio::task::spawn_blocking(work)
    .await
    .map_err(|e| PipelineError::CacheTask(e.to_string()))
}

/// Turn an installed arc into the caller's result.
fn settle(arc: SharedArc) -> Result<SharedArc, PipelineError> {
  match arc.result() {
    ArcResult::Failed(report) => Err(PipelineError::CachedFailure {
      address: arc.address().to_string(),
      report: report.clone(),
    }),
    _ => Ok(arc),
  }
}
