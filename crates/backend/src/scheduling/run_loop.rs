//! A designated thread that runs posted work, and a queue processor bound to it.

use std::{
  future::Future,
  io,
  pin::Pin,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  thread::{self, JoinHandle, ThreadId},
};

use tokio::{
  sync::{mpsc, oneshot, watch},
  task::LocalSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::MessageQueue;

#[derive(Debug, thiserror::Error)]
pub enum RunLoopError {
  #[error("Failed to start run loop thread '{name}': {source}")]
  Spawn {
    name: String,
    #[source]
    source: io::Error,
  },
  #[error("Failed to build runtime for run loop '{name}': {source}")]
  Runtime {
    name: String,
    #[source]
    source: io::Error,
  },
  #[error("Run loop '{0}' has stopped")]
  Stopped(String),
}

type Job = Box<dyn FnOnce() + Send>;
type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;
type LocalJob = Box<dyn FnOnce() -> LocalFuture + Send>;

enum Message {
  Run(Job),
  Spawn(LocalJob),
  Stop,
}

/// An OS thread running a current-thread tokio runtime and a `LocalSet`.
///
/// Work posted from any thread runs on this one thread, in posting order.
/// Futures spawned with [`post_async`](Self::post_async) need not be `Send`.
pub struct RunLoop {
  name: String,
  tx: mpsc::UnboundedSender<Message>,
  thread_id: ThreadId,
  thread: Mutex<Option<JoinHandle<()>>>,
  exited: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RunLoop {
  pub fn spawn(name: impl Into<String>) -> Result<Self, RunLoopError> {
    let name = name.into();
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (exit_tx, exit_rx) = oneshot::channel();

    let thread_name = name.clone();
    let thread = thread::Builder::new()
      .name(name.clone())
      .spawn(move || Self::run(thread_name, rx, ready_tx, exit_tx))
      .map_err(|source| RunLoopError::Spawn {
        name: name.clone(),
        source,
      })?;
    let thread_id = thread.thread().id();

    match ready_rx.recv() {
      Ok(Ok(())) => {}
      Ok(Err(source)) => return Err(RunLoopError::Runtime { name, source }),
      Err(_) => return Err(RunLoopError::Stopped(name)),
    }

    info!(run_loop = %name, "Run loop started");
    Ok(Self {
      name,
      tx,
      thread_id,
      thread: Mutex::new(Some(thread)),
      exited: Mutex::new(Some(exit_rx)),
    })
  }

  fn run(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Message>,
    ready: std::sync::mpsc::Sender<io::Result<()>>,
    exited: oneshot::Sender<()>,
  ) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
      Ok(runtime) => runtime,
      Err(e) => {
        let _ = ready.send(Err(e));
        return;
      }
    };
    let _ = ready.send(Ok(()));

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
      while let Some(message) = rx.recv().await {
        match message {
          Message::Run(job) => {
            job();
            // Let spawned local tasks make progress between jobs
            tokio::task::yield_now().await;
          }
          Message::Spawn(factory) => {
            tokio::task::spawn_local(factory());
          }
          Message::Stop => break,
        }
      }
    });
    // Dropping the LocalSet cancels any local task still pending
    drop(local);
    drop(runtime);

    debug!(run_loop = %name, "Run loop exited");
    let _ = exited.send(());
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// True when called from the run loop's own thread.
  pub fn is_current(&self) -> bool {
    thread::current().id() == self.thread_id
  }

  /// Run `job` on the run loop thread.
  pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<(), RunLoopError> {
    self
      .tx
      .send(Message::Run(Box::new(job)))
      .map_err(|_| RunLoopError::Stopped(self.name.clone()))
  }

  /// Spawn the future built by `factory` as a local task on the run loop.
  pub fn post_async<F, Fut>(&self, factory: F) -> Result<(), RunLoopError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
  {
    let job: LocalJob = Box::new(move || Box::pin(factory()));
    self
      .tx
      .send(Message::Spawn(job))
      .map_err(|_| RunLoopError::Stopped(self.name.clone()))
  }

  /// Stop the loop after the work already posted and wait for the thread to
  /// exit. Idempotent.
  pub async fn shutdown(&self) {
    let _ = self.tx.send(Message::Stop);

    let exited = self.exited.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(exited) = exited {
      let _ = exited.await;
    }

    let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(thread) = thread
      && !self.is_current()
      && thread.join().is_err()
    {
      warn!(run_loop = %self.name, "Run loop thread panicked");
    }
    info!(run_loop = %self.name, "Run loop stopped");
  }
}

impl Drop for RunLoop {
  fn drop(&mut self) {
    let _ = self.tx.send(Message::Stop);
  }
}

/// Processes a [`MessageQueue`] on a [`RunLoop`] thread.
///
/// Invocations run inline on the run loop, one at a time. Processing can be
/// suspended with nested [`disable`](Self::disable) / [`enable`](Self::enable)
/// calls; it resumes when every `disable` has been matched.
pub struct RunLoopQueueProcessor {
  queue: Arc<MessageQueue>,
  disabled: watch::Sender<usize>,
  processed: Arc<AtomicU64>,
  finished: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RunLoopQueueProcessor {
  pub fn attach(run_loop: &RunLoop, queue: Arc<MessageQueue>, cancel: CancellationToken) -> Result<Self, RunLoopError> {
    let (disabled, disabled_rx) = watch::channel(0usize);
    let (done_tx, done_rx) = oneshot::channel();
    let processed = Arc::new(AtomicU64::new(0));

    let task_queue = queue.clone();
    let task_processed = processed.clone();
    let run_loop_name = run_loop.name().to_string();
    run_loop.post_async(move || async move {
      Self::run(run_loop_name, task_queue, disabled_rx, cancel, task_processed).await;
      let _ = done_tx.send(());
    })?;

    Ok(Self {
      queue,
      disabled,
      processed,
      finished: Mutex::new(Some(done_rx)),
    })
  }

  async fn run(
    run_loop: String,
    queue: Arc<MessageQueue>,
    mut disabled: watch::Receiver<usize>,
    cancel: CancellationToken,
    processed: Arc<AtomicU64>,
  ) {
    info!(run_loop = %run_loop, queue = queue.name(), "Run loop queue processor started");

    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        enabled = disabled.wait_for(|count| *count == 0) => {
          if enabled.is_err() {
            break;
          }
        }
      }

      let dispatch = tokio::select! {
        biased;

        _ = cancel.cancelled() => break,

        paused = disabled.wait_for(|count| *count > 0) => {
          if paused.is_err() {
            break;
          }
          debug!(run_loop = %run_loop, "Run loop queue processor disabled");
          continue;
        }

        next = queue.next() => match next {
          Some(dispatch) => dispatch,
          None => break,
        },
      };

      let _ = dispatch.run();
      processed.fetch_add(1, Ordering::Relaxed);
      tokio::task::yield_now().await;
    }

    info!(run_loop = %run_loop, processed = processed.load(Ordering::Relaxed), "Run loop queue processor stopped");
  }

  pub fn queue(&self) -> &Arc<MessageQueue> {
    &self.queue
  }

  /// Suspend processing. Nests: each call needs a matching `enable`.
  pub fn disable(&self) {
    self.disabled.send_modify(|count| *count += 1);
  }

  /// Undo one `disable`. Extra calls are ignored.
  pub fn enable(&self) {
    self.disabled.send_modify(|count| *count = count.saturating_sub(1));
  }

  pub fn is_enabled(&self) -> bool {
    *self.disabled.borrow() == 0
  }

  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }

  /// Wait for the processing loop to end (queue closed and drained, or
  /// cancelled). Returns immediately on later calls.
  pub async fn finished(&self) {
    let done = self.finished.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(done) = done {
      let _ = done.await;
    }
  }
}
