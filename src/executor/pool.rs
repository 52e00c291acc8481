//! Worker thread pool for handlers and continuations.
//!
//! The pool owns a fixed set of OS threads that pull [`Task`]s from a
//! lock-free injector queue. It supports:
//!
//! - **Parking**: idle workers park on a condvar and are woken per submission
//! - **Polling**: registered [`Poller`]s run on idle workers before they
//!   park, and on busy workers every [`TASKS_PER_POLL_PASS`] tasks or once
//!   `poll_interval` has passed since their last pass; while any poller is
//!   registered the park is bounded by `poll_interval`
//! - **Helping**: a thread that blocks on a future while running inside the
//!   pool can run queued tasks, or give the pollers a pass, instead of
//!   sleeping (see `help_current_pool`)
//! - **Shutdown**: graceful shutdown with a bounded drain timeout
//!
//! Work submitted after shutdown runs inline on the submitting thread, so a
//! continuation is never silently dropped.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{run_isolated, Executor, InlineExecutor, Poller, SharedExecutor, Task};
use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, trace, warn};

thread_local! {
    static CURRENT_POOL: RefCell<Option<Weak<PoolInner>>> = const { RefCell::new(None) };
}

/// Returns true if the current thread is a worker of some [`ThreadPool`].
#[must_use]
pub fn is_worker_thread() -> bool {
    CURRENT_POOL.with(|slot| slot.borrow().is_some())
}

/// Runs one queued task of the pool owning the current thread.
///
/// With an empty queue the pool's pollers get a pass instead. Returns
/// `false` when the thread is not a worker or nothing made progress.
pub(crate) fn help_current_pool() -> bool {
    let inner = CURRENT_POOL.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade));
    inner.is_some_and(|inner| inner.run_one() || inner.run_pollers() > 0)
}

/// Tasks a busy worker runs between two poller passes.
pub const TASKS_PER_POLL_PASS: u32 = 64;

/// Registration key of a [`Poller`] on a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerId(u64);

/// Configuration options for the thread pool.
#[derive(Clone)]
pub struct ThreadPoolOptions {
    /// Number of worker threads.
    pub worker_threads: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
    /// Stack size per worker thread.
    pub thread_stack_size: usize,
    /// Park timeout while pollers are registered.
    pub poll_interval: Duration,
    /// Callback when a thread starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback when a thread stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ThreadPoolOptions {
    /// Derives pool options from a runtime configuration.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            worker_threads: config.worker_threads,
            thread_name_prefix: config.thread_name_prefix.clone(),
            thread_stack_size: config.thread_stack_size,
            poll_interval: config.poll_interval,
            on_thread_start: config.on_thread_start.clone(),
            on_thread_stop: config.on_thread_stop.clone(),
        }
    }
}

impl Default for ThreadPoolOptions {
    fn default() -> Self {
        let mut config = RuntimeConfig::default();
        config.normalize();
        Self::from_config(&config)
    }
}

impl fmt::Debug for ThreadPoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolOptions")
            .field("worker_threads", &self.worker_threads)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("poll_interval", &self.poll_interval)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

struct PoolInner {
    /// Number of threads that have not yet exited the worker loop.
    active_threads: AtomicUsize,
    /// Number of threads currently executing work.
    busy_threads: AtomicUsize,
    /// Number of pending tasks in queue.
    pending_count: AtomicUsize,
    /// Number of tasks run to completion.
    completed: AtomicU64,
    /// Work queue.
    queue: SegQueue<Task>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Condition variable for thread parking.
    condvar: Condvar,
    /// Mutex for condition variable.
    mutex: Mutex<()>,
    /// Registered pollers.
    pollers: RwLock<Vec<(PollerId, Arc<dyn Poller>)>>,
    /// Set while one worker is running the pollers.
    polling: AtomicBool,
    next_poller_id: AtomicU64,
    poll_interval: Duration,
    thread_name_prefix: String,
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolInner {
    fn submit(&self, task: Task) {
        if self.shutdown.load(Ordering::Acquire) {
            trace!("pool shut down, running task inline");
            InlineExecutor.execute(task);
            return;
        }
        self.queue.push(task);
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        {
            let _guard = self.mutex.lock();
            self.condvar.notify_one();
        }
        // Raced with shutdown after every worker exited.
        if self.shutdown.load(Ordering::Acquire) && self.active_threads.load(Ordering::Acquire) == 0
        {
            while self.run_one() {}
        }
    }

    fn run_one(&self) -> bool {
        let Some(task) = self.queue.pop() else {
            return false;
        };
        self.pending_count.fetch_sub(1, Ordering::Relaxed);
        self.busy_threads.fetch_add(1, Ordering::Relaxed);
        run_isolated(task);
        self.busy_threads.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Runs every registered poller once. Returns the total progress made.
    fn run_pollers(&self) -> usize {
        if self.pollers.read().is_empty() {
            return 0;
        }
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let pollers: Vec<Arc<dyn Poller>> = self
            .pollers
            .read()
            .iter()
            .map(|(_, poller)| Arc::clone(poller))
            .collect();
        let mut progress = 0;
        for poller in pollers {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| poller.poll())) {
                Ok(n) => progress += n,
                Err(payload) => warn!(
                    panic = %crate::error::panic_message(payload.as_ref()),
                    "poller panicked"
                ),
            }
        }
        self.polling.store(false, Ordering::Release);
        progress
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// The worker loop for pool threads.
fn worker_loop(inner: &PoolInner) {
    let mut since_poll = 0u32;
    let mut last_poll = Instant::now();
    loop {
        if inner.run_one() {
            since_poll += 1;
            if since_poll >= TASKS_PER_POLL_PASS || last_poll.elapsed() >= inner.poll_interval {
                inner.run_pollers();
                since_poll = 0;
                last_poll = Instant::now();
            }
            continue;
        }
        since_poll = 0;
        last_poll = Instant::now();
        if inner.run_pollers() > 0 {
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let has_pollers = !inner.pollers.read().is_empty();
        let mut guard = inner.mutex.lock();
        if !inner.queue.is_empty() || inner.shutdown.load(Ordering::Acquire) {
            continue;
        }
        if has_pollers {
            let _ = inner.condvar.wait_for(&mut guard, inner.poll_interval);
        } else {
            inner.condvar.wait(&mut guard);
        }
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, index: usize, stack_size: usize) -> Result<()> {
    let worker_inner = Arc::clone(inner);
    let name = format!("{}-{}", inner.thread_name_prefix, index);
    inner.active_threads.fetch_add(1, Ordering::AcqRel);

    let spawned = thread::Builder::new()
        .name(name.clone())
        .stack_size(stack_size)
        .spawn(move || {
            CURRENT_POOL.with(|slot| *slot.borrow_mut() = Some(Arc::downgrade(&worker_inner)));
            if let Some(ref callback) = worker_inner.on_thread_start {
                callback();
            }

            worker_loop(&worker_inner);

            if let Some(ref callback) = worker_inner.on_thread_stop {
                callback();
            }
            CURRENT_POOL.with(|slot| *slot.borrow_mut() = None);
            worker_inner.active_threads.fetch_sub(1, Ordering::AcqRel);
        });

    match spawned {
        Ok(handle) => {
            inner.thread_handles.lock().push(handle);
            Ok(())
        }
        Err(e) => {
            inner.active_threads.fetch_sub(1, Ordering::AcqRel);
            Err(Error::new(ErrorKind::Internal)
                .with_message(format!("failed to spawn worker thread {name}"))
                .with_source(e))
        }
    }
}

/// The worker pool that runs handlers and pool-bound continuations.
///
/// Dropping the pool shuts it down and waits (bounded) for its threads.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Creates a pool and starts its worker threads.
    pub fn new(options: ThreadPoolOptions) -> Result<Self> {
        let workers = options.worker_threads.max(1);
        let inner = Arc::new(PoolInner {
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            pollers: RwLock::new(Vec::new()),
            polling: AtomicBool::new(false),
            next_poller_id: AtomicU64::new(1),
            poll_interval: options.poll_interval,
            thread_name_prefix: options.thread_name_prefix,
            on_thread_start: options.on_thread_start,
            on_thread_stop: options.on_thread_stop,
            thread_handles: Mutex::new(Vec::with_capacity(workers)),
        });

        let pool = Self { inner };
        for index in 0..workers {
            spawn_worker(&pool.inner, index, options.thread_stack_size)?;
        }
        debug!(workers, "thread pool started");
        Ok(pool)
    }

    /// Creates a pool with `workers` threads and default options otherwise.
    pub fn with_threads(workers: usize) -> Result<Self> {
        Self::new(ThreadPoolOptions {
            worker_threads: workers,
            ..ThreadPoolOptions::default()
        })
    }

    /// Returns a cloneable handle to this pool.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns the number of pending tasks in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Acquire)
    }

    /// Returns the number of threads currently executing work.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Initiates shutdown of the pool.
    ///
    /// Queued tasks still run; tasks submitted afterwards run inline.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify_all();
    }

    /// Shuts down and waits for all threads to exit.
    ///
    /// Returns `true` if all threads exited cleanly, `false` if the timeout
    /// elapsed first.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        if is_worker_thread() {
            // A worker cannot wait for itself to exit.
            return false;
        }

        let deadline = Instant::now() + timeout;
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("thread pool shutdown timed out");
                return false;
            }
            self.inner.notify_all();
            thread::sleep(Duration::from_millis(5).min(remaining));
        }

        // Leftovers queued between a worker's last check and its exit.
        while self.inner.run_one() {}

        let handles: Vec<_> = self.inner.thread_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("thread pool stopped");
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.is_shutdown() || self.active_threads() > 0 {
            let _ = self.shutdown_and_wait(Duration::from_secs(5));
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("active_threads", &self.active_threads())
            .field("pending_tasks", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// A handle to the pool that can be cloned and shared.
///
/// Handles do not keep the worker threads alive; only [`ThreadPool`] does.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

impl PoolHandle {
    /// Returns this handle as a shared executor.
    #[must_use]
    pub fn executor(&self) -> SharedExecutor {
        Arc::new(self.clone())
    }

    /// Submits a closure to the pool.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(Task::new(f));
    }

    /// Registers an idle-time poller.
    pub fn register_poller(&self, poller: Arc<dyn Poller>) -> PollerId {
        let id = PollerId(self.inner.next_poller_id.fetch_add(1, Ordering::Relaxed));
        self.inner.pollers.write().push((id, poller));
        // Wake a parked worker so it switches to bounded parking.
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_one();
        id
    }

    /// Removes a poller. Returns `false` if it was not registered.
    pub fn unregister_poller(&self, id: PollerId) -> bool {
        let mut pollers = self.inner.pollers.write();
        let before = pollers.len();
        pollers.retain(|(registered, _)| *registered != id);
        pollers.len() != before
    }

    /// Returns the number of registered pollers.
    #[must_use]
    pub fn poller_count(&self) -> usize {
        self.inner.pollers.read().len()
    }

    /// Returns the number of pending tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of tasks that have run to completion.
    #[must_use]
    pub fn completed_tasks(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Executor for PoolHandle {
    fn execute(&self, task: Task) {
        self.inner.submit(task);
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field("pending_tasks", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, wait_until};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicI32;

    fn pool(workers: usize) -> ThreadPool {
        init_test_logging();
        ThreadPool::with_threads(workers).expect("pool")
    }

    #[test]
    fn runs_many_tasks() {
        let pool = pool(4);
        let handle = pool.handle();
        let counter = Arc::new(AtomicI32::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            handle.spawn(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(wait_until(|| counter.load(Ordering::Relaxed) == 100));
        assert!(wait_until(|| handle.completed_tasks() == 100));
    }

    #[test]
    fn threads_are_named_and_marked_as_workers() {
        let pool = ThreadPool::new(ThreadPoolOptions {
            worker_threads: 2,
            thread_name_prefix: "unit-pool".to_string(),
            ..ThreadPoolOptions::default()
        })
        .expect("pool");
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let marked = Arc::new(AtomicI32::new(0));
        for _ in 0..20 {
            let seen = Arc::clone(&seen);
            let marked = Arc::clone(&marked);
            pool.handle().spawn(move || {
                if is_worker_thread() {
                    marked.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(name) = thread::current().name() {
                    seen.lock().insert(name.to_string());
                }
            });
        }
        assert!(wait_until(|| marked.load(Ordering::Relaxed) == 20));
        assert!(seen.lock().iter().all(|name| name.starts_with("unit-pool-")));
        assert!(!is_worker_thread());
    }

    #[test]
    fn thread_hooks_run() {
        let started = Arc::new(AtomicI32::new(0));
        let stopped = Arc::new(AtomicI32::new(0));
        let (s, t) = (Arc::clone(&started), Arc::clone(&stopped));
        let pool = ThreadPool::new(ThreadPoolOptions {
            worker_threads: 3,
            on_thread_start: Some(Arc::new(move || {
                s.fetch_add(1, Ordering::Relaxed);
            })),
            on_thread_stop: Some(Arc::new(move || {
                t.fetch_add(1, Ordering::Relaxed);
            })),
            ..ThreadPoolOptions::default()
        })
        .expect("pool");
        assert!(wait_until(|| started.load(Ordering::Relaxed) == 3));
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(stopped.load(Ordering::Relaxed), 3);
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn tasks_after_shutdown_run_inline() {
        let pool = pool(1);
        let handle = pool.handle();
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        let ran_on = Arc::new(Mutex::new(None));
        let r = Arc::clone(&ran_on);
        handle.spawn(move || *r.lock() = Some(thread::current().id()));
        assert_eq!(*ran_on.lock(), Some(thread::current().id()));
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let pool = pool(1);
        pool.handle().spawn(|| panic!("bad task"));
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        pool.handle().spawn(move || d.store(true, Ordering::Release));
        assert!(wait_until(|| done.load(Ordering::Acquire)));
        assert_eq!(pool.active_threads(), 1);
    }

    struct CountingPoller(AtomicUsize);

    impl Poller for CountingPoller {
        fn poll(&self) -> usize {
            self.0.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    #[test]
    fn idle_workers_drive_pollers() {
        let pool = pool(2);
        let handle = pool.handle();
        let poller = Arc::new(CountingPoller(AtomicUsize::new(0)));
        let id = handle.register_poller(poller.clone());
        assert_eq!(handle.poller_count(), 1);
        assert!(wait_until(|| poller.0.load(Ordering::Relaxed) >= 5));

        assert!(handle.unregister_poller(id));
        assert!(!handle.unregister_poller(id));
        assert_eq!(handle.poller_count(), 0);
    }

    /// Resubmits itself until `stop` is set, so the queue never drains.
    fn keep_busy(handle: PoolHandle, stop: Arc<AtomicBool>) {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let next = handle.clone();
        handle.spawn(move || keep_busy(next, stop));
    }

    #[test]
    fn busy_workers_still_drive_pollers() {
        let pool = pool(1);
        let handle = pool.handle();
        let stop = Arc::new(AtomicBool::new(false));
        keep_busy(handle.clone(), Arc::clone(&stop));

        let poller = Arc::new(CountingPoller(AtomicUsize::new(0)));
        handle.register_poller(poller.clone());
        let polled = wait_until(|| poller.0.load(Ordering::Relaxed) >= 3);
        stop.store(true, Ordering::Release);

        assert!(polled);
        assert!(handle.completed_tasks() > 0);
    }

    #[test]
    fn help_runs_queued_work_from_a_worker() {
        let pool = pool(1);
        let handle = pool.handle();
        let helped = Arc::new(AtomicBool::new(false));
        let flag = Arc::new(AtomicBool::new(false));
        let (h, f) = (Arc::clone(&helped), Arc::clone(&flag));
        let inner_handle = handle.clone();
        handle.spawn(move || {
            // The only worker is busy here, so the queued task only runs if
            // this thread helps.
            let f2 = Arc::clone(&f);
            inner_handle.spawn(move || f2.store(true, Ordering::Release));
            let deadline = Instant::now() + Duration::from_secs(5);
            while !f.load(Ordering::Acquire) && Instant::now() < deadline {
                help_current_pool();
            }
            h.store(f.load(Ordering::Acquire), Ordering::Release);
        });
        assert!(wait_until(|| helped.load(Ordering::Acquire)));
        assert!(!help_current_pool());
    }
}
