//! Work dispatch: invocations, queues, queue processors, run loops and the
//! timed scheduler.
//!
//! Producers enqueue [`Invocation`]s on a [`MessageQueue`]; consumers are
//! either [`QueueProcessor`]s on the tokio runtime (parallel, blocking pool)
//! or a [`RunLoopQueueProcessor`] pinned to a designated [`RunLoop`] thread.
//! The [`Scheduler`] turns time into enqueued invocations.

mod invocation;
mod queue;
mod run_loop;
mod scheduler;
mod worker;

pub use invocation::{Invocation, InvocationError, InvocationId, Priority};
pub use queue::{Dispatch, InvocationHandle, InvocationState, MessageQueue, QueueError};
pub use run_loop::{RunLoop, RunLoopError, RunLoopQueueProcessor};
pub use scheduler::{EventId, ScheduledEvent, Scheduler, SchedulerError};
pub use worker::QueueProcessor;
