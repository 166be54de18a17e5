//! Executors decouple what to run from where and when it runs.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::CancelToken;
use crate::Error;
use crate::Future;
use crate::promise;
use crate::util::panic_message;

mod compute;
mod pool;

pub use compute::ComputePoolExecutor;
pub use pool::{ConfigError, PoolConfig, ThreadPoolExecutor};

type Job = Box<dyn FnOnce(Option<Error>) + Send + 'static>;

/// A unit of work handed to an [`Executor`].
///
/// An executor either [runs](Task::run) a task or [abandons](Task::abandon) it
/// with a reason; either way the task's future settles.
pub struct Task {
    token: CancelToken,
    job: Job,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("token", &self.token)
            .field("job", &"<job>")
            .finish()
    }
}

impl Task {
    /// Create a task. `job` receives `None` when run, or the reason the task
    /// was abandoned.
    pub fn new(token: CancelToken, job: impl FnOnce(Option<Error>) + Send + 'static) -> Self {
        Self {
            token,
            job: Box::new(job),
        }
    }

    /// The cancellation token of the work this task performs.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Run the task on the current thread.
    pub fn run(self) {
        (self.job)(None);
    }

    /// Give up on the task without running it.
    pub fn abandon(self, reason: Error) {
        (self.job)(Some(reason));
    }
}

/// Runs [`Task`]s somewhere: inline, on a dedicated thread, or on a pool.
pub trait Executor: Send + Sync {
    /// Take ownership of `task` and run it, or abandon it.
    ///
    /// May block the caller (e.g. when a bounded queue is full).
    fn execute(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }
}

/// Turns synchronous work into [`Future`]s on any [`Executor`].
pub trait ExecutorExt: Executor {
    /// Run `work` on this executor and return a future for its outcome.
    ///
    /// `work` receives the future's [`CancelToken`] and may stop early. A
    /// panic inside `work` rejects the future with [`Error::Panicked`]. Work
    /// whose future was cancelled before it started is skipped.
    fn submit<T, F>(&self, work: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, Error> + Send + 'static,
    {
        let (promise, future) = promise();
        let token = promise.cancel_token();
        let id = future.id();
        self.execute(Task::new(token.clone(), move |abandoned| {
            if let Some(reason) = abandoned {
                tracing::debug!(future = %id, %reason, "task abandoned");
                if reason.is_cancelled() {
                    promise.future().cancel();
                } else {
                    _ = promise.reject(reason);
                }
                return;
            }
            if token.is_cancelled() {
                tracing::trace!(future = %id, "skipping cancelled task");
                _ = promise.reject(Error::Cancelled);
                return;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| work(&token)))
                .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(&*payload))));
            if let Err(err) = &outcome {
                tracing::debug!(future = %id, %err, "task failed");
            }
            _ = promise.settle(outcome);
        }));
        future
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}

/// Runs every task synchronously inside [`Executor::execute`].
///
/// Useful for deterministic tests and for wrapping collaborators that are
/// already synchronous.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task.run();
    }
}

/// Runs every task on a freshly spawned, named OS thread.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    name: String,
    stack_size: Option<usize>,
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("promise-thread")
    }
}

impl ThreadExecutor {
    /// Create an executor whose threads carry `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_size: None,
        }
    }

    /// Spawn threads with a stack of `bytes` instead of the platform default.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) {
        let slot = Arc::new(Mutex::new(Some(task)));
        let claimed = Arc::clone(&slot);
        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        let spawned = builder.spawn(move || {
            let task = claimed.lock().take();
            if let Some(task) = task {
                task.run();
            }
        });
        if let Err(err) = spawned {
            tracing::error!(thread = %self.name, %err, "failed to spawn task thread");
            let task = slot.lock().take();
            if let Some(task) = task {
                task.abandon(Error::msg(format!(
                    "failed to spawn thread `{}`: {err}",
                    self.name
                )));
            }
        }
    }
}
