use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Condvar;
use parking_lot::Mutex;

use super::Executor;
use super::Task;
use crate::CancelToken;
use crate::Error;
use crate::util::panic_message;

/// Sizing of a [`ThreadPoolExecutor`].
///
/// Download pools are usually given more workers than compile pools: one is
/// I/O bound, the other CPU bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Prefix for worker thread names.
    pub name: String,
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum number of outstanding (queued or running) tasks. Submitting
    /// beyond this blocks the submitter.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism().map_or(4, usize::from);
        Self {
            name: "promise-pool".to_owned(),
            workers,
            queue_capacity: workers * 16,
        }
    }
}

impl PoolConfig {
    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the bound on outstanding tasks.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Check the configuration describes a usable pool.
    ///
    /// # Errors
    /// Will return `Err` if there are no workers or no queue capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers(self.name.clone()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NoCapacity(self.name.clone()));
        }
        Ok(())
    }
}

/// Errors building a [`ThreadPoolExecutor`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The pool has no workers.
    #[error("pool `{0}` needs at least one worker")]
    NoWorkers(String),
    /// The pool has no queue capacity.
    #[error("pool `{0}` needs a queue capacity of at least one")]
    NoCapacity(String),
    /// A worker thread could not be spawned.
    #[error("failed to spawn a worker for pool `{name}`: {message}")]
    Spawn {
        /// The pool name.
        name: String,
        /// The OS error.
        message: String,
    },
}

struct Queue {
    tasks: VecDeque<Task>,
    outstanding: usize,
    accepting: bool,
    running: Vec<Option<CancelToken>>,
}

struct PoolShared {
    name: String,
    capacity: usize,
    queue: Mutex<Queue>,
    task_ready: Condvar,
    slot_free: Condvar,
}

/// A fixed set of worker threads fed from a bounded FIFO queue.
///
/// When the queue is full, [`Executor::execute`] blocks the submitter until a
/// slot frees. A panic escaping a task is logged and never takes a worker
/// down. Dropping the pool stops intake without blocking: the workers are
/// detached and exit once the queue is drained. Call
/// [`shutdown`](Self::shutdown) to wait for them.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("queued", &queue.tasks.len())
            .field("outstanding", &queue.outstanding)
            .field("accepting", &queue.accepting)
            .finish()
    }
}

impl ThreadPoolExecutor {
    /// Spawn the workers of a new pool.
    ///
    /// # Errors
    /// Will return `Err` if the configuration is invalid or a worker thread
    /// cannot be spawned.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.queue_capacity < config.workers {
            tracing::warn!(
                pool = %config.name,
                workers = config.workers,
                capacity = config.queue_capacity,
                "queue capacity below worker count, some workers will stay idle"
            );
        }
        let shared = Arc::new(PoolShared {
            name: config.name.clone(),
            capacity: config.queue_capacity,
            queue: Mutex::new(Queue {
                tasks: VecDeque::with_capacity(config.queue_capacity),
                outstanding: 0,
                accepting: true,
                running: vec![None; config.workers],
            }),
            task_ready: Condvar::new(),
            slot_free: Condvar::new(),
        });
        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(config.workers)),
        };
        for index in 0..config.workers {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || work(&shared, index));
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                // Dropping `pool` stops the workers spawned so far.
                Err(err) => {
                    return Err(ConfigError::Spawn {
                        name: config.name,
                        message: err.to_string(),
                    });
                }
            }
        }
        tracing::debug!(pool = %config.name, workers = config.workers, capacity = config.queue_capacity, "thread pool started");
        Ok(pool)
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of tasks accepted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.shared.queue.lock().outstanding
    }

    /// Returns whether the pool stopped accepting work.
    pub fn is_shutdown(&self) -> bool {
        !self.shared.queue.lock().accepting
    }

    /// Stop accepting work, let queued tasks drain, then join the workers.
    /// Blocked and later submissions are abandoned with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.stop_accepting();
        self.join();
    }

    /// Stop accepting work, cancel every queued task, signal running tasks
    /// through their cancellation tokens, then join the workers.
    pub fn shutdown_now(&self) {
        let (abandoned, running) = {
            let mut queue = self.shared.queue.lock();
            queue.accepting = false;
            let abandoned: Vec<Task> = queue.tasks.drain(..).collect();
            queue.outstanding -= abandoned.len();
            let running: Vec<CancelToken> = queue.running.iter().flatten().cloned().collect();
            (abandoned, running)
        };
        self.shared.task_ready.notify_all();
        self.shared.slot_free.notify_all();
        tracing::debug!(
            pool = %self.shared.name,
            abandoned = abandoned.len(),
            running = running.len(),
            "urgent shutdown"
        );
        for task in abandoned {
            task.abandon(Error::Cancelled);
        }
        for token in running {
            token.cancel();
        }
        self.join();
    }

    fn stop_accepting(&self) {
        self.shared.queue.lock().accepting = false;
        self.shared.task_ready.notify_all();
        self.shared.slot_free.notify_all();
    }

    fn join(&self) {
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.thread().id() == current {
                // Shut down from one of our own workers; it exits on its own.
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(pool = %self.shared.name, "worker thread panicked");
            }
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        let mut queue = self.shared.queue.lock();
        while queue.accepting && queue.outstanding >= self.shared.capacity {
            tracing::trace!(pool = %self.shared.name, "queue full, blocking submitter");
            self.shared.slot_free.wait(&mut queue);
        }
        if !queue.accepting {
            drop(queue);
            tracing::debug!(pool = %self.shared.name, "rejecting task after shutdown");
            task.abandon(Error::Shutdown);
            return;
        }
        queue.outstanding += 1;
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.task_ready.notify_one();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.stop_accepting();
        let detached = std::mem::take(&mut *self.workers.lock()).len();
        if detached > 0 {
            tracing::debug!(pool = %self.shared.name, workers = detached, "pool dropped, detaching workers");
        }
    }
}

fn work(shared: &PoolShared, index: usize) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    queue.running[index] = Some(task.token().clone());
                    break task;
                }
                if !queue.accepting {
                    tracing::trace!(pool = %shared.name, worker = index, "worker exiting");
                    return;
                }
                shared.task_ready.wait(&mut queue);
            }
        };

        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            tracing::error!(
                pool = %shared.name,
                worker = index,
                "task panicked outside its promise: {}",
                panic_message(&*payload)
            );
        }

        let mut queue = shared.queue.lock();
        queue.running[index] = None;
        queue.outstanding -= 1;
        drop(queue);
        shared.slot_free.notify_one();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    use web_time::Duration;

    use super::*;
    use crate::ExecutorExt;
    use crate::FutureState;

    fn pool(workers: usize, queue_capacity: usize) -> ThreadPoolExecutor {
        ThreadPoolExecutor::new(
            PoolConfig::default()
                .with_name("test-pool")
                .with_workers(workers)
                .with_queue_capacity(queue_capacity),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let config = PoolConfig::default().with_name("empty").with_workers(0);
        assert_eq!(
            Some(ConfigError::NoWorkers("empty".to_owned())),
            ThreadPoolExecutor::new(config).err()
        );
        let config = PoolConfig::default().with_queue_capacity(0);
        assert!(matches!(
            ThreadPoolExecutor::new(config),
            Err(ConfigError::NoCapacity(_))
        ));
    }

    #[test]
    fn test_runs_submitted_work() {
        let pool = pool(4, 8);
        let futures: Vec<_> = (0..32_u32).map(|i| pool.submit(move |_| Ok(i * i))).collect();
        for (i, future) in (0..32_u32).zip(futures) {
            assert_eq!(i * i, future.get(Some(Duration::from_secs(5))).unwrap());
        }
    }

    #[test]
    fn test_backpressure_blocks_submitter() {
        let pool = Arc::new(pool(1, 2));
        let (release_first, first_gate) = mpsc::channel::<()>();
        let (release_second, second_gate) = mpsc::channel::<()>();
        let first = pool.submit(move |_| {
            first_gate.recv().ok();
            Ok(1)
        });
        let second = pool.submit(move |_| {
            second_gate.recv().ok();
            Ok(2)
        });

        let returned = Arc::new(AtomicBool::new(false));
        let submitter = {
            let pool = Arc::clone(&pool);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                let third = pool.submit(|_| Ok(3));
                returned.store(true, Ordering::SeqCst);
                third
            })
        };

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!returned.load(Ordering::SeqCst), "third submit must block");
        assert_eq!(2, pool.outstanding());

        release_first.send(()).unwrap();
        assert_eq!(1, first.get(Some(Duration::from_secs(5))).unwrap());
        let third = submitter.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));

        release_second.send(()).unwrap();
        assert_eq!(2, second.get(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(3, third.get(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn test_worker_survives_panics() {
        let pool = pool(1, 4);
        let bad = pool.submit(|_| -> Result<u8, Error> { panic!("shader exploded") });
        let good = pool.submit(|_| Ok(7_u8));
        assert!(matches!(
            bad.get(Some(Duration::from_secs(5))),
            Err(Error::Panicked(_))
        ));
        assert_eq!(7, good.get(Some(Duration::from_secs(5))).unwrap());

        // A raw task panicking outside any promise.
        pool.execute(Task::new(CancelToken::new(), |_| panic!("raw task")));
        let after = pool.submit(|_| Ok(8_u8));
        assert_eq!(8, after.get(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = pool(1, 16);
        let ran = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..8)
            .map(|_| {
                let ran = Arc::clone(&ran);
                pool.submit(move |_| {
                    thread::sleep(std::time::Duration::from_millis(2));
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        pool.shutdown();

        assert_eq!(8, ran.load(Ordering::SeqCst));
        assert!(futures.iter().all(|f| f.state() == FutureState::Fulfilled));
        assert!(pool.is_shutdown());

        let late = pool.submit(|_| Ok(()));
        assert!(matches!(late.get(None), Err(Error::Shutdown)));
    }

    #[test]
    fn test_shutdown_now_cancels() {
        let pool = pool(1, 16);
        let (started_tx, started_rx) = mpsc::channel();
        let running = pool.submit(move |token| {
            started_tx.send(()).unwrap();
            while !token.is_cancelled() {
                thread::sleep(std::time::Duration::from_millis(1));
            }
            token.check().map(|()| 0_u8)
        });
        let queued: Vec<_> = (0..4).map(|i| pool.submit(move |_| Ok(i))).collect();

        started_rx.recv().unwrap();
        pool.shutdown_now();

        assert!(matches!(running.get(None), Err(Error::Cancelled)));
        for future in queued {
            assert_eq!(FutureState::Cancelled, future.state());
        }
        assert_eq!(0, pool.outstanding());
    }

    #[test]
    fn test_cancelled_before_start_is_skipped() {
        let pool = pool(1, 4);
        let (release, gate) = mpsc::channel::<()>();
        let blocker = pool.submit(move |_| {
            gate.recv().ok();
            Ok(())
        });
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let skipped = pool.submit(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(skipped.cancel());
        release.send(()).unwrap();
        blocker.get(Some(Duration::from_secs(5))).unwrap();
        pool.shutdown();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_on_own_worker_does_not_deadlock() {
        let pool = Arc::new(pool(2, 4));
        let inner = Arc::clone(&pool);
        let future = pool.submit(move |_| {
            drop(inner);
            Ok(())
        });
        drop(pool);
        future.get(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn test_drop_does_not_wait_for_running_work() {
        let pool = pool(1, 4);
        let (release, gate) = mpsc::channel::<()>();
        let blocked = pool.submit(move |_| {
            gate.recv().ok();
            Ok(1_u8)
        });
        let queued = pool.submit(|_| Ok(2_u8));

        let (dropped_tx, dropped_rx) = mpsc::channel();
        thread::spawn(move || {
            drop(pool);
            dropped_tx.send(()).unwrap();
        });
        dropped_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("drop blocked on a running task");

        // Detached workers still drain what was accepted.
        release.send(()).unwrap();
        assert_eq!(1, blocked.get(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(2, queued.get(Some(Duration::from_secs(5))).unwrap());
    }
}
