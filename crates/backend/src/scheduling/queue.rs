//! Priority queue of pending invocations.

use std::{
  cmp::Ordering as CmpOrdering,
  collections::BinaryHeap,
  pin::pin,
  sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{Notify, watch};
use tracing::{debug, trace, warn};

use super::invocation::{Invocation, InvocationError, InvocationId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
  #[error("Message queue '{0}' is closed")]
  Closed(String),
}

/// Lifecycle of an enqueued invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
  Queued,
  Dispatched,
  Completed,
  Failed,
  /// Removed before dispatch.
  Withdrawn,
}

impl InvocationState {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Withdrawn)
  }
}

/// Observer for one enqueued invocation.
#[derive(Debug, Clone)]
pub struct InvocationHandle {
  id: InvocationId,
  state: watch::Receiver<InvocationState>,
}

impl InvocationHandle {
  pub fn id(&self) -> InvocationId {
    self.id
  }

  pub fn state(&self) -> InvocationState {
    *self.state.borrow()
  }

  /// Wait for a terminal state. If the queue is dropped first, returns the
  /// last state observed.
  pub async fn wait(&mut self) -> InvocationState {
    if let Ok(state) = self.state.wait_for(|s| s.is_terminal()).await {
      return *state;
    }
    *self.state.borrow()
  }
}

/// A dequeued invocation. Whoever holds it must run it or report an outcome.
pub struct Dispatch {
  invocation: Invocation,
  state: watch::Sender<InvocationState>,
}

impl Dispatch {
  pub fn invocation(&self) -> &Invocation {
    &self.invocation
  }

  /// Run the invocation on the current thread and record the outcome.
  pub fn run(self) -> Result<(), InvocationError> {
    let result = self.invocation.invoke();
    self.finish(&result);
    result
  }

  /// Record the outcome of running the invocation elsewhere.
  pub fn finish(self, result: &Result<(), InvocationError>) {
    match result {
      Ok(()) => {
        trace!(invocation = %self.invocation.id(), label = self.invocation.label(), "Invocation completed");
        self.state.send_replace(InvocationState::Completed);
      }
      Err(e) => {
        warn!(invocation = %self.invocation.id(), label = self.invocation.label(), err = %e, "Invocation failed");
        self.state.send_replace(InvocationState::Failed);
      }
    }
  }
}

struct Queued {
  invocation: Invocation,
  seq: u64,
  state: watch::Sender<InvocationState>,
}

// Max-heap: higher priority first, then lower sequence (FIFO within a level)
impl Ord for Queued {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self
      .invocation
      .priority()
      .cmp(&other.invocation.priority())
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for Queued {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for Queued {
  fn eq(&self, other: &Self) -> bool {
    self.seq == other.seq
  }
}

impl Eq for Queued {}

#[derive(Default)]
struct QueueState {
  heap: BinaryHeap<Queued>,
  next_seq: u64,
  closed: bool,
}

/// Thread-safe priority queue of invocations.
///
/// Ordering is by priority, then by enqueue order. Any number of producers
/// and consumers may use it at once; each invocation is dispatched at most
/// once. After [`close`](Self::close) no new work is accepted but queued
/// work still drains.
pub struct MessageQueue {
  name: String,
  state: Mutex<QueueState>,
  available: Notify,
}

impl MessageQueue {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      state: Mutex::new(QueueState::default()),
      available: Notify::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn enqueue(&self, invocation: Invocation) -> Result<InvocationHandle, QueueError> {
    let (tx, rx) = watch::channel(InvocationState::Queued);
    let id = invocation.id();
    {
      let mut state = self.lock();
      if state.closed {
        return Err(QueueError::Closed(self.name.clone()));
      }
      let seq = state.next_seq;
      state.next_seq += 1;
      trace!(queue = %self.name, invocation = %id, label = invocation.label(), priority = ?invocation.priority(), "Enqueued");
      state.heap.push(Queued {
        invocation,
        seq,
        state: tx,
      });
    }
    self.available.notify_one();
    Ok(InvocationHandle { id, state: rx })
  }

  /// Remove a queued invocation before it is dispatched.
  pub fn withdraw(&self, id: InvocationId) -> bool {
    let withdrawn = {
      let mut state = self.lock();
      let mut items = std::mem::take(&mut state.heap).into_vec();
      let found = items
        .iter()
        .position(|q| q.invocation.id() == id)
        .map(|pos| items.swap_remove(pos));
      state.heap = BinaryHeap::from(items);
      found
    };

    match withdrawn {
      Some(queued) => {
        debug!(queue = %self.name, invocation = %id, "Invocation withdrawn");
        queued.state.send_replace(InvocationState::Withdrawn);
        true
      }
      None => false,
    }
  }

  /// Dequeue the highest-priority invocation without waiting.
  pub fn try_next(&self) -> Option<Dispatch> {
    let (queued, more) = {
      let mut state = self.lock();
      let queued = state.heap.pop()?;
      (queued, !state.heap.is_empty())
    };
    if more {
      // Keep other waiting consumers moving
      self.available.notify_one();
    }
    queued.state.send_replace(InvocationState::Dispatched);
    Some(Dispatch {
      invocation: queued.invocation,
      state: queued.state,
    })
  }

  /// Wait for the next invocation. Returns `None` once the queue is closed
  /// and empty. Cancel-safe: dropping the future never loses an invocation.
  pub async fn next(&self) -> Option<Dispatch> {
    loop {
      let mut notified = pin!(self.available.notified());
      notified.as_mut().enable();

      if let Some(dispatch) = self.try_next() {
        return Some(dispatch);
      }
      if self.is_closed() {
        return None;
      }
      notified.await;
    }
  }

  /// Stop accepting invocations and wake every waiting consumer.
  pub fn close(&self) {
    self.lock().closed = true;
    self.available.notify_waiters();
    debug!(queue = %self.name, "Queue closed");
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }

  /// Withdraw everything still queued. Returns how many were dropped.
  pub fn clear(&self) -> usize {
    let drained = std::mem::take(&mut self.lock().heap);
    let count = drained.len();
    for queued in drained {
      queued.state.send_replace(InvocationState::Withdrawn);
    }
    count
  }

  pub fn len(&self) -> usize {
    self.lock().heap.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
