//! Time-triggered invocations.

use std::{
  cmp::Ordering as CmpOrdering,
  collections::{BTreeMap, HashMap},
  fmt,
  hash::{Hash, Hasher},
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use tokio::{
  sync::Notify,
  task::JoinHandle,
  time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
  invocation::{Invocation, InvocationError},
  queue::MessageQueue,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
  #[error("Scheduler has shut down")]
  ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl fmt::Display for EventId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "event-{}", self.0)
  }
}

/// An invocation due at a point in time.
///
/// Events order by fire time; equal fire times keep scheduling order.
/// Equality and hashing follow the same `(fire_at, id)` identity.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
  id: EventId,
  fire_at: Instant,
  invocation: Invocation,
  fire_on_termination: bool,
}

impl ScheduledEvent {
  pub fn id(&self) -> EventId {
    self.id
  }

  pub fn fire_at(&self) -> Instant {
    self.fire_at
  }

  pub fn invocation(&self) -> &Invocation {
    &self.invocation
  }

  /// Whether the event still fires if its scheduler shuts down first.
  pub fn fire_on_termination(&self) -> bool {
    self.fire_on_termination
  }

  /// Run the event's invocation on the current thread.
  pub fn invoke(&self) -> Result<(), InvocationError> {
    self.invocation.invoke()
  }

  fn slot(&self) -> (Instant, EventId) {
    (self.fire_at, self.id)
  }
}

impl PartialEq for ScheduledEvent {
  fn eq(&self, other: &Self) -> bool {
    self.slot() == other.slot()
  }
}

impl Eq for ScheduledEvent {}

impl Ord for ScheduledEvent {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.slot().cmp(&other.slot())
  }
}

impl PartialOrd for ScheduledEvent {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl Hash for ScheduledEvent {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.slot().hash(state);
  }
}

#[derive(Default)]
struct Timeline {
  events: BTreeMap<(Instant, EventId), ScheduledEvent>,
  fire_times: HashMap<EventId, Instant>,
  shut_down: bool,
}

struct Shared {
  timeline: Mutex<Timeline>,
  wake: Notify,
  dispatch: Arc<MessageQueue>,
  next_id: AtomicU64,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, Timeline> {
    self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn next_fire_time(&self) -> Option<Instant> {
    self.lock().events.keys().next().map(|(at, _)| *at)
  }

  fn take_due(&self, now: Instant) -> Vec<ScheduledEvent> {
    let mut timeline = self.lock();
    let mut due = Vec::new();
    while let Some(entry) = timeline.events.first_entry() {
      if entry.key().0 > now {
        break;
      }
      let event = entry.remove();
      timeline.fire_times.remove(&event.id);
      due.push(event);
    }
    due
  }

  /// Mark the timeline shut down and hand back everything still pending.
  fn take_all(&self) -> Vec<ScheduledEvent> {
    let mut timeline = self.lock();
    timeline.shut_down = true;
    timeline.fire_times.clear();
    std::mem::take(&mut timeline.events).into_values().collect()
  }
}

/// Fires invocations at requested times by enqueueing them on a
/// [`MessageQueue`].
///
/// Each event fires at most once: when due, or at shutdown if it was
/// scheduled with `fire_on_termination`. Cancelled events never fire.
pub struct Scheduler {
  shared: Arc<Shared>,
  cancel: CancellationToken,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
  /// Start the timer loop. Must be called from within a tokio runtime.
  pub fn start(dispatch: Arc<MessageQueue>) -> Self {
    let shared = Arc::new(Shared {
      timeline: Mutex::new(Timeline::default()),
      wake: Notify::new(),
      dispatch,
      next_id: AtomicU64::new(1),
    });
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Self::run(shared.clone(), cancel.clone()));

    Self {
      shared,
      cancel,
      task: Mutex::new(Some(task)),
    }
  }

  async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    info!(queue = shared.dispatch.name(), "Scheduler started");

    loop {
      let next = shared.next_fire_time();

      tokio::select! {
        biased;

        _ = cancel.cancelled() => break,

        _ = shared.wake.notified() => continue,

        _ = sleep_until_next(next) => {
          for event in shared.take_due(Instant::now()) {
            Self::dispatch(&shared, event);
          }
        }
      }
    }

    info!("Scheduler stopped");
  }

  fn dispatch(shared: &Shared, event: ScheduledEvent) {
    let late_ms = Instant::now().saturating_duration_since(event.fire_at).as_millis();
    trace!(event = %event.id, label = event.invocation.label(), late_ms, "Event due");
    if let Err(e) = shared.dispatch.enqueue(event.invocation) {
      warn!(event = %event.id, err = %e, "Dropping due event; dispatch queue unavailable");
    }
  }

  /// Schedule `invocation` to fire at `at`.
  pub fn schedule_at(
    &self,
    invocation: Invocation,
    at: Instant,
    fire_on_termination: bool,
  ) -> Result<EventId, SchedulerError> {
    let id = EventId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
    {
      let mut timeline = self.shared.lock();
      if timeline.shut_down {
        return Err(SchedulerError::ShutDown);
      }
      debug!(event = %id, label = invocation.label(), fire_on_termination, "Event scheduled");
      timeline.fire_times.insert(id, at);
      timeline.events.insert(
        (at, id),
        ScheduledEvent {
          id,
          fire_at: at,
          invocation,
          fire_on_termination,
        },
      );
    }
    self.shared.wake.notify_one();
    Ok(id)
  }

  /// Schedule `invocation` to fire after `delay`.
  pub fn schedule_after(
    &self,
    invocation: Invocation,
    delay: Duration,
    fire_on_termination: bool,
  ) -> Result<EventId, SchedulerError> {
    self.schedule_at(invocation, Instant::now() + delay, fire_on_termination)
  }

  /// Cancel a pending event. Returns `false` if it already fired, was
  /// cancelled, or never existed.
  pub fn cancel(&self, id: EventId) -> bool {
    let removed = {
      let mut timeline = self.shared.lock();
      match timeline.fire_times.remove(&id) {
        Some(at) => timeline.events.remove(&(at, id)).is_some(),
        None => false,
      }
    };
    if removed {
      debug!(event = %id, "Event cancelled");
      self.shared.wake.notify_one();
    }
    removed
  }

  /// Pending events in firing order.
  pub fn pending(&self) -> Vec<ScheduledEvent> {
    self.shared.lock().events.values().cloned().collect()
  }

  pub fn pending_count(&self) -> usize {
    self.shared.lock().events.len()
  }

  /// Stop the timer loop and settle pending events: those scheduled with
  /// `fire_on_termination` run synchronously on the calling thread, the rest
  /// are discarded. Returns how many fired. Later calls do nothing.
  pub async fn shutdown(&self) -> usize {
    self.cancel.cancel();
    let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(task) = task
      && let Err(e) = task.await
    {
      warn!(err = %e, "Scheduler task failed");
    }
    self.fire_terminal_events()
  }

  fn fire_terminal_events(&self) -> usize {
    let pending = self.shared.take_all();
    let mut fired = 0;
    let mut dropped = 0;
    for event in pending {
      if !event.fire_on_termination {
        dropped += 1;
        continue;
      }
      fired += 1;
      if let Err(e) = event.invoke() {
        warn!(event = %event.id, label = event.invocation.label(), err = %e, "Termination event failed");
      }
    }
    if fired > 0 || dropped > 0 {
      debug!(fired, dropped, "Scheduler settled pending events");
    }
    fired
  }
}

impl Drop for Scheduler {
  fn drop(&mut self) {
    self.cancel.cancel();
    self.fire_terminal_events();
  }
}

async fn sleep_until_next(at: Option<Instant>) {
  match at {
    Some(at) => sleep_until(at).await,
    None => std::future::pending().await,
  }
}
