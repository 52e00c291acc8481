//! Continuation scheduling: where queued work resumes.
//!
//! An [`Executor`] accepts a [`Task`] and runs it at some point, exactly once.
//! Two executors ship with the crate:
//!
//! - [`InlineExecutor`] runs the task on the thread that submits it. Nested
//!   submissions are trampolined through a thread-local queue so a long chain
//!   of continuations never grows the call stack.
//! - [`ThreadPool`] runs tasks on a fixed set of worker threads pulling from a
//!   lock-free injector queue. Workers also drive registered [`Poller`]s,
//!   between tasks while busy and before parking while idle, which is how
//!   externally completed events and reply deadlines make progress without a
//!   dedicated thread.
//!
//! Ordering guarantees for continuations attached to one future are provided
//! by the future cell, not by the executor: the cell only dispatches the next
//! continuation once the previous one has returned.

mod inline;
pub mod pool;

use std::fmt;
use std::sync::{Arc, OnceLock};

pub use inline::InlineExecutor;
pub use pool::{is_worker_thread, PollerId, PoolHandle, ThreadPool, ThreadPoolOptions};

/// A unit of work submitted to an executor.
pub struct Task {
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    /// Wraps a closure as a task.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { work: Box::new(f) }
    }

    /// Runs the task to completion on the current thread.
    pub fn run(self) {
        (self.work)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// Something that runs tasks.
pub trait Executor: Send + Sync {
    /// Schedules `task` to run exactly once.
    fn execute(&self, task: Task);
}

/// Shared, type-erased executor handle.
pub type SharedExecutor = Arc<dyn Executor>;

/// Returns a shared handle to the inline executor.
#[must_use]
pub fn inline() -> SharedExecutor {
    static INLINE: OnceLock<SharedExecutor> = OnceLock::new();
    Arc::clone(INLINE.get_or_init(|| Arc::new(InlineExecutor)))
}

/// Background work driven by pool workers between tasks.
///
/// `poll` must not block: it is called repeatedly from worker threads that
/// would otherwise park.
pub trait Poller: Send + Sync {
    /// Runs one non-blocking pass and returns how many items made progress.
    fn poll(&self) -> usize;
}

/// Runs a task, logging instead of unwinding if it panics.
pub(crate) fn run_isolated(task: Task) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run())) {
        crate::tracing_compat::error!(
            panic = %crate::error::panic_message(payload.as_ref()),
            "executor task panicked"
        );
    }
}
