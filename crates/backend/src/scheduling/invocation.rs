//! Deferred calls.

use std::{
  any::Any,
  fmt,
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use arcflow_core::{DomainError, ErrorDomain};

/// Dispatch priority. Higher priorities leave a queue first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
  Critical,
}

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId(u64);

impl InvocationId {
  fn next() -> Self {
    Self(NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for InvocationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "inv-{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
  #[error("Invocation target has been dropped")]
  TargetGone,
  #[error("{0}")]
  Failed(String),
  #[error("Invocation panicked: {0}")]
  Panicked(String),
}

impl InvocationError {
  pub fn failed(reason: impl fmt::Display) -> Self {
    Self::Failed(reason.to_string())
  }
}

impl DomainError for InvocationError {
  fn domain(&self) -> ErrorDomain {
    ErrorDomain::Scheduling
  }

  fn code(&self) -> u32 {
    match self {
      Self::TargetGone => 1,
      Self::Failed(_) => 2,
      Self::Panicked(_) => 3,
    }
  }
}

type Action = dyn Fn() -> Result<(), InvocationError> + Send + Sync;

/// An immutable, replayable call: a target plus an operation.
///
/// Cloning shares the action. Invocations built with
/// [`Invocation::for_target`] do not keep their target alive.
#[derive(Clone)]
pub struct Invocation {
  id: InvocationId,
  label: Arc<str>,
  priority: Priority,
  action: Arc<Action>,
}

impl Invocation {
  pub fn new<F>(label: impl Into<String>, action: F) -> Self
  where
    F: Fn() -> Result<(), InvocationError> + Send + Sync + 'static,
  {
    Self {
      id: InvocationId::next(),
      label: Arc::from(label.into()),
      priority: Priority::default(),
      action: Arc::new(action),
    }
  }

  /// Invoke `action` on `target` if it is still alive when the invocation
  /// runs; otherwise the invocation fails with [`InvocationError::TargetGone`].
  pub fn for_target<T, F>(target: &Arc<T>, label: impl Into<String>, action: F) -> Self
  where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<(), InvocationError> + Send + Sync + 'static,
  {
    let target = Arc::downgrade(target);
    Self::new(label, move || {
      let target = target.upgrade().ok_or(InvocationError::TargetGone)?;
      action(&target)
    })
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn id(&self) -> InvocationId {
    self.id
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn priority(&self) -> Priority {
    self.priority
  }

  /// Run the call on the current thread. Panics are caught and reported.
  pub fn invoke(&self) -> Result<(), InvocationError> {
    match panic::catch_unwind(AssertUnwindSafe(|| (self.action)())) {
      Ok(result) => result,
      Err(payload) => Err(InvocationError::Panicked(panic_message(payload.as_ref()))),
    }
  }
}

impl fmt::Debug for Invocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Invocation")
      .field("id", &self.id)
      .field("label", &self.label)
      .field("priority", &self.priority)
      .finish_non_exhaustive()
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
