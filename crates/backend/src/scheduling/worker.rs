use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  invocation::InvocationError,
  queue::{Dispatch, MessageQueue},
};

/// Drains a [`MessageQueue`] on the tokio runtime.
///
/// Each invocation runs on the blocking pool so slow processors never stall
/// the executor. A failing or panicking invocation is recorded on its handle
/// and the loop moves on. The loop ends when the queue is closed and empty,
/// or immediately on cancellation (queued work is then left in the queue).
pub struct QueueProcessor {
  name: String,
  cancel: CancellationToken,
  processed: Arc<AtomicU64>,
  handle: JoinHandle<()>,
}

impl QueueProcessor {
  /// Start processing. Must be called from within a tokio runtime.
  pub fn spawn(name: impl Into<String>, queue: Arc<MessageQueue>, cancel: CancellationToken) -> Self {
    let name = name.into();
    let processed = Arc::new(AtomicU64::new(0));
    let handle = tokio::spawn(Self::run(name.clone(), queue, cancel.clone(), processed.clone()));
    Self {
      name,
      cancel,
      processed,
      handle,
    }
  }

  async fn run(name: String, queue: Arc<MessageQueue>, cancel: CancellationToken, processed: Arc<AtomicU64>) {
    info!(processor = %name, queue = queue.name(), "Queue processor started");

    loop {
      let dispatch = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          debug!(processor = %name, "Queue processor cancelled");
          break;
        }

        next = queue.next() => match next {
          Some(dispatch) => dispatch,
          None => break,
        },
      };

      Self::execute(dispatch).await;
      processed.fetch_add(1, Ordering::Relaxed);
    }

    info!(processor = %name, processed = processed.load(Ordering::Relaxed), "Queue processor stopped");
  }

  async fn execute(dispatch: Dispatch) {
    let invocation = dispatch.invocation().clone();
    let result = match tokio::task::spawn_blocking(move || invocation.invoke()).await {
      Ok(result) => result,
      Err(e) => Err(InvocationError::Panicked(e.to_string())),
    };
    dispatch.finish(&result);
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }

  /// Stop after the current invocation, leaving queued work in place.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }

  /// Wait for the processing loop to end.
  pub async fn join(self) {
    if let Err(e) = self.handle.await {
      warn!(processor = %self.name, err = %e, "Queue processor task failed");
    }
  }
}
