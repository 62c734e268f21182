//! Startup and teardown ordering tests.

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Arc, Mutex,
      atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
  };

  use pretty_assertions::assert_eq;

  use crate::{
    PipelineError, Request,
    pipeline::__tests__::helpers::{PipelineTestContext, wait_for},
    scheduling::{Invocation, InvocationState},
  };

  #[tokio::test]
  async fn test_hooks_run_once_newest_first() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["store", "cache", "index"] {
      let order = order.clone();
      pipeline
        .on_shutdown(name, move || order.lock().unwrap().push(name))
        .expect("register hook");
    }

    pipeline.shutdown().await;
    pipeline.shutdown().await;

    assert_eq!(*order.lock().unwrap(), vec!["index", "cache", "store"]);
    assert!(matches!(
      pipeline.on_shutdown("late", || {}),
      Err(PipelineError::ShutDown)
    ));
  }

  #[tokio::test]
  async fn test_panicking_hook_does_not_stop_the_rest() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    pipeline
      .on_shutdown("first", move || {
        counter.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap();
    pipeline.on_shutdown("broken", || panic!("hook exploded")).unwrap();

    pipeline.shutdown().await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_submit_main_runs_on_main_thread() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let seen = Arc::new(Mutex::new(None));

    let slot = seen.clone();
    let mut handle = pipeline
      .submit_main(Invocation::new("whoami", move || {
        *slot.lock().unwrap() = std::thread::current().name().map(str::to_string);
        Ok(())
      }))
      .expect("submit to main");

    assert_eq!(handle.wait().await, InvocationState::Completed);
    assert_eq!(seen.lock().unwrap().as_deref(), Some("arcflow-main"));

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_submit_runs_on_workers() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    let mut handle = pipeline
      .submit(Invocation::new("count", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }))
      .unwrap();

    assert_eq!(handle.wait().await, InvocationState::Completed);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    pipeline.shutdown().await;
  }

  #[tokio::test]
  async fn test_shutdown_fires_termination_events_once() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let fired = Arc::new(AtomicUsize::new(0));
    let skipped = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    pipeline
      .scheduler()
      .schedule_after(
        Invocation::new("flush", move || {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }),
        Duration::from_secs(5),
        true,
      )
      .unwrap();
    let counter = skipped.clone();
    pipeline
      .scheduler()
      .schedule_after(
        Invocation::new("poll", move || {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }),
        Duration::from_secs(5),
        false,
      )
      .unwrap();

    pipeline.shutdown().await;
    pipeline.shutdown().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(skipped.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.scheduler().pending_count(), 0);
  }

  #[tokio::test]
  async fn test_scheduled_event_fires_through_workers() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    pipeline
      .scheduler()
      .schedule_after(
        Invocation::new("tick", move || {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }),
        Duration::from_millis(20),
        false,
      )
      .unwrap();

    assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    pipeline.shutdown().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_shutdown_drains_queued_work() {
    let ctx = PipelineTestContext::new();
    let pipeline = ctx.start(vec![]);
    let ran = Arc::new(AtomicUsize::new(0));

    for i in 0..20 {
      let counter = ran.clone();
      pipeline
        .submit(Invocation::new(format!("job {}", i), move || {
          std::thread::sleep(Duration::from_millis(1));
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }))
        .unwrap();
    }

    pipeline.shutdown().await;
    assert_eq!(ran.load(Ordering::SeqCst), 20);
  }

  #[tokio::test]
  async fn test_operations_after_shutdown_fail() {
    let ctx = PipelineTestContext::new();
    ctx.write_file("notes.txt", "x", crate::pipeline::__tests__::helpers::T);
    let pipeline = ctx.start(vec![]);
    pipeline.shutdown().await;

    assert!(pipeline.is_shut_down());
    let err = pipeline
      .fetch(&Request::new(ctx.address("notes.txt")))
      .await
      .unwrap_err();
    assert!(matches!(err, PipelineError::ShutDown));
    assert!(matches!(
      pipeline.submit(Invocation::new("late", || Ok(()))),
      Err(PipelineError::ShutDown)
    ));
  }

  #[tokio::test]
  async fn test_drop_without_shutdown_runs_hooks() {
    let ctx = PipelineTestContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    {
      let pipeline = ctx.start(vec![]);
      let counter = ran.clone();
      pipeline
        .on_shutdown("cleanup", move || {
          counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert_eq!(ran.load(Ordering::SeqCst), 1);
  }
}
