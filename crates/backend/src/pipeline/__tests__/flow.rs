//! End-to-end fetch tests: caching, revalidation, filters, retries,
//! transform stages and persistence.

#[cfg(test)]
mod tests {
  use std::{
    io,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
  };

  use pretty_assertions::assert_eq;

  use crate::{
    Address, ArcKey, ArcResult, CacheArc, ConditionSet, Content, Headers, PipelineContext, PipelineError,
    ProcessorCache, Request,
    arc::{Probe, ProcessorId, ValidatorSet},
    cache::ArcStore,
    config::FilterRuleConfig,
    pipeline::__tests__::helpers::{CountingProcessor, PipelineTestContext, T, UpperProcessor, count_address},
    processor::{Processor, ProcessorError},
  };

  fn body(arc: &crate::SharedArc) -> String {
    String::from_utf8_lossy(arc.content().expect("content arc").body()).to_string()
  }

  /// Serves `race:` addresses. While computing it changes the resource and
  /// installs an arc built from the previous version, as a concurrent fetch
  /// that read the resource earlier would.
  struct RacingProcessor {
    cache: OnceLock<Arc<ProcessorCache>>,
    current: Mutex<&'static str>,
  }

  impl RacingProcessor {
    fn new() -> Self {
      Self {
        cache: OnceLock::new(),
        current: Mutex::new("old"),
      }
    }

    fn content(body: &str) -> Content {
      Content::new(Headers::new(), body.as_bytes().to_vec())
    }
  }

  impl Processor for RacingProcessor {
    fn id(&self) -> ProcessorId {
      ProcessorId::new("race")
    }

    fn schemes(&self) -> &[&'static str] {
      &["race"]
    }

    fn transform(&self, address: &Address, _input: Option<&Content>) -> Result<Content, ProcessorError> {
      let previous = std::mem::replace(&mut *self.current.lock().unwrap(), "newer");
      let stale = Self::content(previous);
      let key = ArcKey::new(address.clone(), self.id(), ConditionSet::new());
      let validators = ValidatorSet::from_content(&stale);
      let cache = self.cache.get().expect("cache wired before fetch");
      assert!(cache.insert(CacheArc::new(key, ArcResult::Content(stale), validators).into_shared()).is_inserted());
      Ok(Self::content("newer"))
    }

    fn current_validators(&self, _address: &Address) -> Probe {
      let body = *self.current.lock().unwrap();
      Probe::Current(ValidatorSet::new().with_content_length(body.len() as u64))
    }
  }

  /// Records which threads validator checks run on.
  struct ThreadRecordingProcessor {
    checked_on: Mutex<Vec<std::thread::ThreadId>>,
  }

  impl Processor for ThreadRecordingProcessor {
    fn id(&self) -> ProcessorId {
      ProcessorId::new("threads")
    }

    fn schemes(&self) -> &[&'static str] {
      &["threads"]
    }

    fn transform(&self, _address: &Address, _input: Option<&Content>) -> Result<Content, ProcessorError> {
      Ok(Content::new(Headers::new(), b"steady".to_vec()))
    }

    fn current_validators(&self, _address: &Address) -> Probe {
      self.checked_on.lock().unwrap().push(std::thread::current().id());
      Probe::Current(ValidatorSet::new().with_content_length(6))
    }
  }

  // ==========================================================================
  // Caching and revalidation
  // ==========================================================================

  #[tokio::test]
  async fn test_revalidation_runs_off_the_runtime_thread() {
    let ctx = PipelineTestContext::new();
    let recorder = Arc::new(ThreadRecordingProcessor {
      checked_on: Mutex::new(Vec::new()),
    });
    let pipeline = ctx.start(vec![recorder.clone()]);
    let request = Request::new(Address::parse("threads:/doc").unwrap());

    let first = pipeline.fetch(&request).await.unwrap();
    let second = pipeline.fetch(&request).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let runtime_thread = std::thread::current().id();
    let checked_on = recorder.checked_on.lock().unwrap().clone();
    assert!(!checked_on.is_empty());
    assert!(checked_on.iter().all(|id| *id != runtime_thread));

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_stale_concurrent_winner_is_not_adopted() {
    let ctx = PipelineTestContext::new();
    let racing = Arc::new(RacingProcessor::new());
    let pipeline = ctx.start(vec![racing.clone()]);
    racing
      .cache
      .set(pipeline.processor_cache().clone())
      .unwrap_or_else(|_| panic!("cache already wired"));
    let request = Request::new(Address::parse("race:/doc").unwrap());

    let arc = pipeline.fetch(&request).await.unwrap();
    assert_eq!(body(&arc), "newer");
    assert_eq!(pipeline.processor_cache().stats().stale_evictions, 1);

    let again = pipeline.fetch(&request).await.unwrap();
    assert!(Arc::ptr_eq(&arc, &again));

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_fetch_file_is_cached() {
    let ctx = PipelineTestContext::new();
    ctx.write_file("notes.txt", "hello notes", T);
    let pipeline = ctx.start(vec![]);
    let request = Request::new(ctx.address("notes.txt"));

    let first = pipeline.fetch(&request).await.expect("fetch should succeed");
    assert_eq!(body(&first), "hello notes");
    let headers = first.content().unwrap().headers();
    assert_eq!(headers.content_type(), Some("text/plain"));
    assert_eq!(headers.content_length(), Some(11));
    assert_eq!(headers.first(Headers::LAST_MODIFIED), Some("Tue, 15 Nov 1994 08:12:31 GMT"));

    let second = pipeline.fetch(&request).await.expect("cached fetch");
    assert!(Arc::ptr_eq(&first, &second), "second fetch should reuse the arc");
    assert_eq!(pipeline.processor_cache().stats().hits, 1);

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_modified_file_is_recomputed() {
    let ctx = PipelineTestContext::new();
    ctx.write_file("notes.txt", "v1", T);
    let pipeline = ctx.start(vec![]);
    let request = Request::new(ctx.address("notes.txt"));

    let old = pipeline.fetch(&request).await.unwrap();
    ctx.write_file("notes.txt", "version two", T + 10);
    let new = pipeline.fetch(&request).await.unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(body(&new), "version two");
    assert_eq!(pipeline.processor_cache().stats().stale_evictions, 1);
    assert_eq!(pipeline.processor_cache().len(), 1);

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_same_second_rewrite_is_recomputed() {
    let ctx = PipelineTestContext::new();
    ctx.write_file_at("quick.txt", "aaa", T, 100_000_000);
    let pipeline = ctx.start(vec![]);
    let request = Request::new(ctx.address("quick.txt"));

    let first = pipeline.fetch(&request).await.unwrap();
    assert_eq!(body(&first), "aaa");

    ctx.write_file_at("quick.txt", "bbb", T, 700_000_000);
    let second = pipeline.fetch(&request).await.unwrap();
    assert_eq!(body(&second), "bbb");
    assert_eq!(pipeline.processor_cache().stats().stale_evictions, 1);

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_file_names_with_reserved_characters() {
    let ctx = PipelineTestContext::new();
    ctx.write_file("100%41.txt", "percent", T);
    ctx.write_file("what?#.txt", "punctuation", T);
    let pipeline = ctx.start(vec![]);

    let arc = pipeline.fetch(&Request::new(ctx.address("100%41.txt"))).await.unwrap();
    assert_eq!(body(&arc), "percent");
    let arc = pipeline.fetch(&Request::new(ctx.address("what?#.txt"))).await.unwrap();
    assert_eq!(body(&arc), "punctuation");

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_deleted_file_is_not_served() {
    let ctx = PipelineTestContext::new();
    ctx.write_file("gone.txt", "soon gone", T);
    let pipeline = ctx.start(vec![]);
    let request = Request::new(ctx.address("gone.txt"));

    pipeline.fetch(&request).await.unwrap();
    ctx.delete_file("gone.txt");

    let err = pipeline.fetch(&request).await.unwrap_err();
    assert!(matches!(
      err,
      PipelineError::Processor {
        source: ProcessorError::NotFound(_),
        ..
      }
    ));
    assert!(pipeline.processor_cache().is_empty());

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_invalidate_drops_arcs() {
    let ctx = PipelineTestContext::new();
    let counter = Arc::new(CountingProcessor::new());
    let pipeline = ctx.start(vec![counter.clone()]);
    let request = Request::new(count_address("/x"));

    pipeline.fetch(&request).await.unwrap();
    assert_eq!(pipeline.invalidate(request.address()), 1);
    pipeline.fetch(&request).await.unwrap();
    assert_eq!(counter.calls(), 2);

    pipeline.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_fetches_share_one_arc() {
    let ctx = PipelineTestContext::new();
    let counter = Arc::new(CountingProcessor::new().slow(Duration::from_millis(20)));
    let pipeline = Arc::new(ctx.start(vec![counter.clone()]));

    let mut tasks = Vec::new();
    for _ in 0..8 {
      let pipeline = pipeline.clone();
      tasks.push(tokio::spawn(async move {
        pipeline.fetch(&Request::new(count_address("/shared"))).await
      }));
    }

    let mut arcs = Vec::new();
    for task in tasks {
      arcs.push(task.await.unwrap().expect("fetch should succeed"));
    }
    assert!(arcs.iter().all(|arc| Arc::ptr_eq(arc, &arcs[0])));
    assert_eq!(pipeline.processor_cache().len(), 1);
    assert!(counter.calls() >= 1);

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_data_addresses() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let address = crate::Address::parse("data:text/plain;base64,aGk=").unwrap();

    let arc = pipeline.fetch(&Request::new(address)).await.unwrap();
    assert_eq!(body(&arc), "hi");

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_unknown_scheme_has_no_processor() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let address = crate::Address::parse("gopher://example.com/").unwrap();

    let err = pipeline.fetch(&Request::new(address)).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoProcessor(_)));

    pipeline.shutdown().await;
  }

  // ==========================================================================
  // Filters
  // ==========================================================================

  #[tokio::test]
  async fn test_filter_block_and_redirect() {
    let base = PipelineTestContext::new();
    let new_path = base.path("new.txt");
    let ctx = base.with_rules(vec![
      FilterRuleConfig::Block {
        pattern: r"secret\.txt$".to_string(),
      },
      FilterRuleConfig::Redirect {
        pattern: r"old\.txt$".to_string(),
        to: format!("file://{}", new_path.display()),
      },
    ]);
    ctx.write_file("secret.txt", "classified", T);
    ctx.write_file("new.txt", "the new one", T);
    let pipeline = ctx.start(vec![]);

    let err = pipeline
      .fetch(&Request::new(ctx.address("secret.txt")))
      .await
      .unwrap_err();
    assert!(matches!(err, PipelineError::Blocked { ref rule, .. } if rule == r"secret\.txt$"));

    let arc = pipeline.fetch(&Request::new(ctx.address("old.txt"))).await.unwrap();
    assert_eq!(body(&arc), "the new one");
    assert!(arc.address().same_resource(&ctx.address("new.txt")));

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_redirect_cycle_is_limited() {
    let base = PipelineTestContext::new();
    let a = base.path("a.txt");
    let b = base.path("b.txt");
    let mut ctx = base.with_rules(vec![
      FilterRuleConfig::Redirect {
        pattern: r"/a\.txt$".to_string(),
        to: format!("file://{}", b.display()),
      },
      FilterRuleConfig::Redirect {
        pattern: r"/b\.txt$".to_string(),
        to: format!("file://{}", a.display()),
      },
    ]);
    ctx.config.pipeline.max_redirects = 3;
    let pipeline = ctx.start(vec![]);

    let err = pipeline.fetch(&Request::new(ctx.address("a.txt"))).await.unwrap_err();
    assert!(matches!(err, PipelineError::TooManyRedirects { limit: 3, .. }));

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_malformed_filter_is_bypassed() {
    let ctx = PipelineTestContext::new().with_rules(vec![FilterRuleConfig::Block {
      pattern: "([".to_string(),
    }]);
    ctx.write_file("notes.txt", "still served", T);
    let pipeline = ctx.start(vec![]);

    let arc = pipeline.fetch(&Request::new(ctx.address("notes.txt"))).await.unwrap();
    assert_eq!(body(&arc), "still served");

    pipeline.shutdown().await;
  }

  // ==========================================================================
  // Failures and retries
  // ==========================================================================

  #[tokio::test]
  async fn test_failures_not_cached_by_default() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let request = Request::new(ctx.address("missing.txt"));

    assert!(pipeline.fetch(&request).await.is_err());
    assert!(pipeline.processor_cache().is_empty());

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_negative_arcs_until_resource_appears() {
    let mut ctx = PipelineTestContext::new();
    ctx.config.cache.negative_ttl_secs = Some(60);
    let pipeline = ctx.start(vec![]);
    let request = Request::new(ctx.address("later.txt"));

    let first = pipeline.fetch(&request).await.unwrap_err();
    assert!(matches!(first, PipelineError::Processor { .. }));

    let cached = pipeline.fetch(&request).await.unwrap_err();
    match cached {
      PipelineError::CachedFailure { report, .. } => {
        assert_eq!(report.domain, "Processor");
        assert_eq!(report.code, 1);
      }
      other => panic!("expected cached failure, got {:?}", other),
    }

    ctx.write_file("later.txt", "arrived", T);
    let arc = pipeline.fetch(&request).await.expect("resource appeared");
    assert_eq!(body(&arc), "arrived");

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_transient_failures_are_retried() {
    let ctx = PipelineTestContext::new();
    let counter = Arc::new(CountingProcessor::new().failing(2, io::ErrorKind::Interrupted));
    let pipeline = ctx.start(vec![counter.clone()]);

    let arc = pipeline
      .fetch(&Request::new(count_address("/flaky")))
      .await
      .expect("third attempt should succeed");
    assert_eq!(body(&arc), "/flaky #2");
    assert_eq!(counter.calls(), 3);

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_retries_are_bounded() {
    let mut ctx = PipelineTestContext::new();
    ctx.config.retry.max_retries = 1;
    let counter = Arc::new(CountingProcessor::new().failing(10, io::ErrorKind::TimedOut));
    let pipeline = ctx.start(vec![counter.clone()]);

    assert!(pipeline.fetch(&Request::new(count_address("/down"))).await.is_err());
    assert_eq!(counter.calls(), 2);

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_permanent_failures_are_not_retried() {
    let ctx = PipelineTestContext::new();
    let counter = Arc::new(CountingProcessor::new().failing(10, io::ErrorKind::PermissionDenied));
    let pipeline = ctx.start(vec![counter.clone()]);

    assert!(pipeline.fetch(&Request::new(count_address("/denied"))).await.is_err());
    assert_eq!(counter.calls(), 1);

    pipeline.shutdown().await;
  }

  // ==========================================================================
  // Transform stages
  // ==========================================================================

  #[tokio::test]
  async fn test_transform_by_content_type_follows_source() {
    let ctx = PipelineTestContext::new();
    ctx.write_file("notes.txt", "quiet", T);
    let pipeline = ctx.start(vec![Arc::new(UpperProcessor)]);
    let request = Request::new(ctx.address("notes.txt")).through_content_type();

    let loud = pipeline.fetch(&request).await.unwrap();
    assert_eq!(body(&loud), "QUIET");
    assert_eq!(loud.key().processor().as_str(), "upper");
    assert!(Arc::ptr_eq(&loud, &pipeline.fetch(&request).await.unwrap()));
    assert_eq!(pipeline.processor_cache().len(), 2);

    ctx.write_file("notes.txt", "changed!", T + 5);
    let louder = pipeline.fetch(&request).await.unwrap();
    assert_eq!(body(&louder), "CHANGED!");

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_transform_by_id() {
    let ctx = PipelineTestContext::new();
    ctx.write_file("notes.txt", "abc", T);
    let pipeline = ctx.start(vec![Arc::new(UpperProcessor)]);

    let arc = pipeline
      .fetch(&Request::new(ctx.address("notes.txt")).through(ProcessorId::new("upper")))
      .await
      .unwrap();
    assert_eq!(body(&arc), "ABC");

    let err = pipeline
      .fetch(&Request::new(ctx.address("notes.txt")).through(ProcessorId::new("nope")))
      .await
      .unwrap_err();
    assert!(matches!(err, PipelineError::NoProcessor(_)));

    pipeline.shutdown().await;
  }

  // ==========================================================================
  // Persistence
  // ==========================================================================

  #[tokio::test]
  async fn test_store_warms_a_new_context() {
    let store_dir = tempfile::TempDir::new().unwrap();
    let mut ctx = PipelineTestContext::new();
    ctx.config.cache.persist_dir = Some(store_dir.path().to_path_buf());
    let request = Request::new(count_address("/persisted"));

    {
      let first_counter = Arc::new(CountingProcessor::new());
      let pipeline = ctx.start(vec![first_counter.clone()]);
      let arc = pipeline.fetch(&request).await.unwrap();
      assert_eq!(body(&arc), "/persisted #0");
      assert_eq!(first_counter.calls(), 1);
      pipeline.shutdown().await;
    }

    let second_counter = Arc::new(CountingProcessor::new());
    let pipeline: PipelineContext = ctx.start(vec![second_counter.clone()]);
    let arc = pipeline.fetch(&request).await.unwrap();
    assert_eq!(body(&arc), "/persisted #0");
    assert!(matches!(arc.result(), ArcResult::Content(_)));
    assert_eq!(second_counter.calls(), 0, "arc should come from the store");

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_locked_store_degrades_to_memory() {
    let store_dir = tempfile::TempDir::new().unwrap();
    let _holder = ArcStore::open(store_dir.path()).unwrap();

    let mut ctx = PipelineTestContext::new();
    ctx.config.cache.persist_dir = Some(store_dir.path().to_path_buf());
    ctx.write_file("notes.txt", "memory only", T);
    let pipeline = ctx.start(vec![]);

    assert!(pipeline.store().is_none());
    let arc = pipeline.fetch(&Request::new(ctx.address("notes.txt"))).await.unwrap();
    assert_eq!(body(&arc), "memory only");

    pipeline.shutdown().await;
  }
}
