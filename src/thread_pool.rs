//! Bounded worker pool.
//!
//! Pool lifecycle state and the live worker count are packed into a single
//! atomic word so one CAS can check and change both together: the top three
//! bits hold the run state, the low 29 bits the worker count. Run states
//! are ordered and only ever increase:
//!
//! | state | meaning |
//! |---|---|
//! | `RUNNING` | accept new tasks, process queued tasks |
//! | `SHUTDOWN` | no new tasks; queued tasks still run |
//! | `STOP` | no new tasks; queued tasks dropped; running tasks interrupted |
//! | `TIDYING` | all workers gone; the `terminated` hook is running |
//! | `TERMINATED` | the hook has completed |
//!
//! Each worker owns a tri-state lock (−1 before start, 0 idle, 1 running a
//! task). The lock is *not* held while the worker waits on the task queue,
//! which keeps idle workers interruptible, and *is* held around task
//! execution, which keeps a graceful shutdown from interrupting a task in
//! flight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::interrupt::{self, ThreadHandle};
use crate::queue::{task_token, BlockingQueue, Task, TaskQueue};

const COUNT_BITS: u32 = 29;
const CAPACITY: u32 = (1 << COUNT_BITS) - 1;

const RUNNING: u32 = 0 << COUNT_BITS;
const SHUTDOWN: u32 = 1 << COUNT_BITS;
const STOP: u32 = 2 << COUNT_BITS;
const TIDYING: u32 = 3 << COUNT_BITS;
const TERMINATED: u32 = 4 << COUNT_BITS;

fn run_state_of(c: u32) -> u32 {
    c & !CAPACITY
}

fn worker_count_of(c: u32) -> u32 {
    c & CAPACITY
}

fn ctl_of(rs: u32, wc: u32) -> u32 {
    rs | wc
}

fn is_running(c: u32) -> bool {
    c < SHUTDOWN
}

fn run_state_at_least(c: u32, s: u32) -> bool {
    c >= s
}

/// Non-reentrant tri-state worker lock: −1 before the worker thread starts
/// servicing tasks, 0 idle, 1 executing. Contenders only ever `try_lock`,
/// so the owner's acquire loop never parks.
struct WorkerLock(AtomicI32);

impl WorkerLock {
    fn new() -> WorkerLock {
        WorkerLock(AtomicI32::new(-1))
    }

    fn lock(&self) {
        while self
            .0
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            thread::yield_now();
        }
    }

    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn unlock(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 1
    }

    /// False only before the worker thread has released the pre-start
    /// state; such workers must not be interrupted yet.
    fn started(&self) -> bool {
        self.0.load(Ordering::SeqCst) >= 0
    }
}

struct Worker {
    lock: WorkerLock,
    handle: ThreadHandle,
    first_task: Mutex<Option<Task>>,
    completed: AtomicU64,
}

struct PoolState {
    workers: Vec<Arc<Worker>>,
    largest_pool_size: usize,
    /// Completed counts folded in from exited workers.
    completed_tasks: u64,
}

struct PoolInner {
    ctl: AtomicU32,
    queue: Arc<dyn TaskQueue>,
    main: Mutex<PoolState>,
    termination: Condvar,
    cfg: PoolConfig,
    next_worker_id: AtomicUsize,
}

impl PoolInner {
    fn decrement_worker_count(&self) {
        self.ctl.fetch_sub(1, Ordering::SeqCst);
    }

    /// Bump the run state to at least `target`, preserving the count.
    fn advance_run_state(&self, target: u32) {
        loop {
            let c = self.ctl.load(Ordering::SeqCst);
            if run_state_at_least(c, target) {
                return;
            }
            if self
                .ctl
                .compare_exchange(
                    c,
                    ctl_of(target, worker_count_of(c)),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Reserve a worker slot via CAS, then create and start the thread. On
    /// any failure the reservation is rolled back and the first task is
    /// handed back to the caller.
    fn add_worker(
        self: &Arc<Self>,
        mut first_task: Option<Task>,
        core: bool,
    ) -> std::result::Result<(), Option<Task>> {
        'retry: loop {
            let c = self.ctl.load(Ordering::SeqCst);
            let rs = run_state_of(c);
            // Past SHUTDOWN, new workers are allowed only to drain a
            // nonempty queue.
            if rs >= SHUTDOWN && !(rs == SHUTDOWN && first_task.is_none() && !self.queue.is_empty())
            {
                return Err(first_task);
            }
            let mut c = c;
            loop {
                let wc = worker_count_of(c);
                let limit = if core {
                    self.cfg.core_size
                } else {
                    self.cfg.max_size
                };
                if wc >= CAPACITY || wc as usize >= limit {
                    return Err(first_task);
                }
                if self
                    .ctl
                    .compare_exchange(c, c + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break 'retry;
                }
                c = self.ctl.load(Ordering::SeqCst);
                if run_state_of(c) != rs {
                    continue 'retry;
                }
            }
        }

        let worker = Arc::new(Worker {
            lock: WorkerLock::new(),
            handle: ThreadHandle::new(),
            first_task: Mutex::new(first_task.take()),
            completed: AtomicU64::new(0),
        });

        let worker_added = {
            let mut main = self.main.lock().unwrap();
            let c = self.ctl.load(Ordering::SeqCst);
            let rs = run_state_of(c);
            if rs < SHUTDOWN
                || (rs == SHUTDOWN && worker.first_task.lock().unwrap().is_none())
            {
                main.workers.push(worker.clone());
                if main.workers.len() > main.largest_pool_size {
                    main.largest_pool_size = main.workers.len();
                }
                true
            } else {
                false
            }
        };

        if !worker_added {
            let task = worker.first_task.lock().unwrap().take();
            self.add_worker_failed(None);
            return Err(task);
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{}", self.cfg.name_prefix, id);
        let pool = self.clone();
        let w = worker.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            interrupt::adopt(w.handle.clone());
            pool.run_worker(&w);
        });
        match spawned {
            Ok(_join) => Ok(()),
            Err(_) => {
                // Thread creation failed; roll back as if never added.
                let task = worker.first_task.lock().unwrap().take();
                self.add_worker_failed(Some(&worker));
                Err(task)
            }
        }
    }

    fn add_worker_failed(self: &Arc<Self>, worker: Option<&Arc<Worker>>) {
        if let Some(w) = worker {
            let mut main = self.main.lock().unwrap();
            main.workers.retain(|x| !Arc::ptr_eq(x, w));
        }
        self.decrement_worker_count();
        self.try_terminate();
    }

    /// Main worker loop: run the first task, then drain the queue until
    /// `get_task` says to exit.
    fn run_worker(self: &Arc<Self>, w: &Arc<Worker>) {
        let mut task = w.first_task.lock().unwrap().take();
        // Leave the pre-start state; from here on the worker is
        // interruptible while idle.
        w.lock.unlock();
        let mut completed_abruptly = true;
        loop {
            let current = match task.take() {
                Some(t) => t,
                None => match self.get_task() {
                    Some(t) => t,
                    None => {
                        completed_abruptly = false;
                        break;
                    }
                },
            };
            w.lock.lock();
            // While stopping, the worker must carry its interrupt into the
            // task; otherwise a stale interrupt from a previous cycle is
            // cleared. The double check closes the race with shutdown_now.
            let stopping = run_state_at_least(self.ctl.load(Ordering::SeqCst), STOP)
                || (w.handle.take_interrupted()
                    && run_state_at_least(self.ctl.load(Ordering::SeqCst), STOP));
            if stopping && !w.handle.is_interrupted() {
                w.handle.interrupt();
            }
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.cfg.hooks.before_execute();
                current();
            }));
            self.cfg.hooks.after_execute(result.is_err());
            w.completed.fetch_add(1, Ordering::SeqCst);
            w.lock.unlock();
            if result.is_err() {
                break;
            }
        }
        self.process_worker_exit(w, completed_abruptly);
    }

    /// Fetch the next task, or `None` to make the calling worker exit.
    fn get_task(&self) -> Option<Task> {
        let mut timed_out = false;
        loop {
            let c = self.ctl.load(Ordering::SeqCst);
            let rs = run_state_of(c);
            if rs >= SHUTDOWN && (rs >= STOP || self.queue.is_empty()) {
                self.decrement_worker_count();
                return None;
            }

            let wc = worker_count_of(c);
            let timed = self.cfg.allow_core_timeout || wc as usize > self.cfg.core_size;

            if (wc as usize > self.cfg.max_size || (timed && timed_out))
                && (wc > 1 || self.queue.is_empty())
            {
                if self
                    .ctl
                    .compare_exchange(c, c - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return None;
                }
                continue;
            }

            let fetched = if timed {
                self.queue.poll(self.cfg.keep_alive)
            } else {
                self.queue.take().map(Some)
            };
            match fetched {
                Ok(Some(task)) => return Some(task),
                Ok(None) => timed_out = true,
                // Interrupted while waiting; re-check the pool state.
                Err(_) => timed_out = false,
            }
        }
    }

    fn process_worker_exit(self: &Arc<Self>, w: &Arc<Worker>, completed_abruptly: bool) {
        if completed_abruptly {
            // An orderly exit already adjusted the count in get_task.
            self.decrement_worker_count();
        }
        {
            let mut main = self.main.lock().unwrap();
            main.completed_tasks += w.completed.load(Ordering::SeqCst);
            main.workers.retain(|x| !Arc::ptr_eq(x, w));
        }
        self.try_terminate();
        let c = self.ctl.load(Ordering::SeqCst);
        if run_state_of(c) < STOP {
            if !completed_abruptly {
                let mut min = if self.cfg.allow_core_timeout {
                    0
                } else {
                    self.cfg.core_size
                };
                if min == 0 && !self.queue.is_empty() {
                    min = 1;
                }
                if worker_count_of(c) as usize >= min {
                    return;
                }
            }
            let _ = self.add_worker(None, false);
        }
    }

    /// Move to TIDYING then TERMINATED when shutdown is complete: past
    /// SHUTDOWN with an empty queue (or at STOP) and no workers left. If
    /// workers remain, nudge one idle worker so the exit signal propagates.
    fn try_terminate(self: &Arc<Self>) {
        loop {
            let c = self.ctl.load(Ordering::SeqCst);
            if is_running(c)
                || run_state_at_least(c, TIDYING)
                || (run_state_of(c) == SHUTDOWN && !self.queue.is_empty())
            {
                return;
            }
            if worker_count_of(c) != 0 {
                self.interrupt_idle_workers(true);
                return;
            }

            let main = self.main.lock().unwrap();
            if self
                .ctl
                .compare_exchange(c, ctl_of(TIDYING, 0), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.cfg.hooks.terminated();
                self.ctl.store(ctl_of(TERMINATED, 0), Ordering::SeqCst);
                self.termination.notify_all();
                return;
            }
            drop(main);
        }
    }

    /// Interrupt workers that are not running a task (their lock can be
    /// taken). Started-but-idle only; a worker holding its lock is left to
    /// finish its task.
    fn interrupt_idle_workers(&self, only_one: bool) {
        let main = self.main.lock().unwrap();
        self.interrupt_idle(&main, only_one);
    }

    fn interrupt_idle(&self, main: &PoolState, only_one: bool) {
        for w in &main.workers {
            if !w.handle.is_interrupted() && w.lock.try_lock() {
                w.handle.interrupt();
                w.lock.unlock();
            }
            if only_one {
                break;
            }
        }
    }
}

/// Worker pool executing submitted tasks on a bounded set of threads.
///
/// Submissions prefer starting a core worker, then queueing, then starting
/// a worker beyond the core up to the maximum; when all three fail the
/// configured rejection policy decides the task's fate. Dropping the pool
/// performs a graceful [`shutdown`](ThreadPool::shutdown); queued tasks
/// still run.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig, queue: Arc<dyn TaskQueue>) -> ThreadPool {
        assert!(config.max_size > 0, "max_size must be positive");
        assert!(
            config.max_size >= config.core_size,
            "max_size must not be below core_size"
        );
        ThreadPool {
            inner: Arc::new(PoolInner {
                ctl: AtomicU32::new(ctl_of(RUNNING, 0)),
                queue,
                main: Mutex::new(PoolState {
                    workers: Vec::new(),
                    largest_pool_size: 0,
                    completed_tasks: 0,
                }),
                termination: Condvar::new(),
                cfg: config,
                next_worker_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Fixed-size pool over an unbounded queue.
    pub fn fixed(capacity: usize) -> ThreadPool {
        let config = PoolConfig::builder()
            .core_size(capacity)
            .max_size(capacity)
            .build();
        ThreadPool::new(config, Arc::new(BlockingQueue::unbounded()))
    }

    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_task(Box::new(task))
    }

    /// Start idle core workers ahead of demand; returns how many were
    /// started.
    pub fn prestart_core_threads(&self) -> usize {
        let mut started = 0;
        while self.inner.add_worker(None, true).is_ok() {
            started += 1;
        }
        started
    }

    /// Submit an already-boxed task.
    pub fn execute_task(&self, task: Task) -> Result<()> {
        let inner = &self.inner;
        let mut task = task;
        let token = task_token(&task);

        let c = inner.ctl.load(Ordering::SeqCst);
        if (worker_count_of(c) as usize) < inner.cfg.core_size {
            match inner.add_worker(Some(task), true) {
                Ok(()) => return Ok(()),
                Err(Some(t)) => task = t,
                Err(None) => return Ok(()),
            }
        }

        let c = inner.ctl.load(Ordering::SeqCst);
        if is_running(c) {
            match inner.queue.offer(task) {
                Ok(()) => {
                    let recheck = inner.ctl.load(Ordering::SeqCst);
                    if !is_running(recheck) {
                        if let Some(removed) = inner.queue.remove(token) {
                            return self.reject(removed);
                        }
                    }
                    if worker_count_of(recheck) == 0 {
                        let _ = inner.add_worker(None, false);
                    }
                    Ok(())
                }
                Err(task) => match inner.add_worker(Some(task), false) {
                    Ok(()) => Ok(()),
                    Err(Some(t)) => self.reject(t),
                    Err(None) => Ok(()),
                },
            }
        } else {
            match inner.add_worker(Some(task), false) {
                Ok(()) => Ok(()),
                Err(Some(t)) => self.reject(t),
                Err(None) => Ok(()),
            }
        }
    }

    fn reject(&self, task: Task) -> Result<()> {
        let policy = self.inner.cfg.policy.clone();
        policy.rejected(task, self)
    }

    /// Stop accepting tasks; queued and running tasks complete. Idle
    /// workers are interrupted so they observe the state change.
    pub fn shutdown(&self) {
        {
            let main = self.inner.main.lock().unwrap();
            self.inner.advance_run_state(SHUTDOWN);
            self.inner.interrupt_idle(&main, false);
        }
        self.inner.try_terminate();
    }

    /// Stop accepting and processing tasks: every started worker is
    /// interrupted, running tasks included, and the unexecuted queue
    /// contents are returned.
    pub fn shutdown_now(&self) -> Vec<Task> {
        let tasks;
        {
            let main = self.inner.main.lock().unwrap();
            self.inner.advance_run_state(STOP);
            for w in &main.workers {
                if w.lock.started() {
                    w.handle.interrupt();
                }
            }
            tasks = self.inner.queue.drain();
        }
        self.inner.try_terminate();
        tasks
    }

    pub fn is_shutdown(&self) -> bool {
        !is_running(self.inner.ctl.load(Ordering::SeqCst))
    }

    pub fn is_terminating(&self) -> bool {
        let c = self.inner.ctl.load(Ordering::SeqCst);
        !is_running(c) && !run_state_at_least(c, TERMINATED)
    }

    pub fn is_terminated(&self) -> bool {
        run_state_at_least(self.inner.ctl.load(Ordering::SeqCst), TERMINATED)
    }

    /// Block until the pool is terminated or `timeout` elapses. Returns
    /// true iff termination was reached.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut main = self.inner.main.lock().unwrap();
        loop {
            if self.is_terminated() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .termination
                .wait_timeout(main, deadline - now)
                .unwrap();
            main = guard;
        }
    }

    /// Current number of live workers.
    pub fn pool_size(&self) -> usize {
        worker_count_of(self.inner.ctl.load(Ordering::SeqCst)) as usize
    }

    /// Workers currently executing a task.
    pub fn active_count(&self) -> usize {
        let main = self.inner.main.lock().unwrap();
        main.workers.iter().filter(|w| w.lock.is_locked()).count()
    }

    pub fn largest_pool_size(&self) -> usize {
        self.inner.main.lock().unwrap().largest_pool_size
    }

    /// Tasks completed across live and exited workers.
    pub fn completed_task_count(&self) -> u64 {
        let main = self.inner.main.lock().unwrap();
        let live: u64 = main
            .workers
            .iter()
            .map(|w| w.completed.load(Ordering::SeqCst))
            .sum();
        main.completed_tasks + live
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        self.inner.queue.clone()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbortPolicy, CallerRunsPolicy, DiscardOldestPolicy, DiscardPolicy};
    use crate::error::MuxError;
    use std::sync::atomic::AtomicUsize;

    /// Gate that parks tasks until released. Tasks parked here ignore
    /// interrupts; release the gate before shutting the pool down.
    struct Gate {
        open: Mutex<bool>,
        cond: Condvar,
    }

    impl Gate {
        fn new() -> Arc<Gate> {
            Arc::new(Gate {
                open: Mutex::new(false),
                cond: Condvar::new(),
            })
        }

        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }
    }

    fn pool(core: usize, max: usize, queue: Arc<dyn TaskQueue>) -> ThreadPool {
        let config = PoolConfig::builder()
            .core_size(core)
            .max_size(max)
            .keep_alive(Duration::from_millis(100))
            .policy(Arc::new(AbortPolicy))
            .build();
        ThreadPool::new(config, queue)
    }

    #[test]
    fn test_tasks_run_and_complete() {
        let p = ThreadPool::fixed(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            p.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(p.completed_task_count(), 10);
    }

    #[test]
    fn test_saturated_pool_rejects() {
        // core 2, max 4, queue 2: submissions 1-6 are accepted (2 running,
        // 2 queued, 2 extra workers), the seventh is rejected.
        let gate = Gate::new();
        let p = pool(2, 4, Arc::new(BlockingQueue::bounded(2)));

        for i in 0..7 {
            let g = gate.clone();
            let result = p.execute(move || g.wait());
            if i < 6 {
                assert!(result.is_ok(), "submission {} should be accepted", i + 1);
            } else {
                assert!(
                    matches!(result, Err(MuxError::Rejected(_))),
                    "submission 7 should be rejected"
                );
            }
        }
        assert_eq!(p.pool_size(), 4);

        gate.release();
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
        assert_eq!(p.completed_task_count(), 6);
    }

    #[test]
    fn test_submit_after_shutdown_rejects() {
        let p = ThreadPool::fixed(1);
        p.shutdown();
        let result = p.execute(|| {});
        assert!(matches!(result, Err(MuxError::Rejected(_))));
    }

    #[test]
    fn test_shutdown_finishes_queued_tasks() {
        let p = ThreadPool::fixed(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            p.execute(move || {
                thread::sleep(Duration::from_millis(100));
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        p.shutdown();
        assert!(p.is_shutdown());
        assert!(p.await_termination(Duration::from_secs(10)));
        assert!(p.is_terminated());
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_shutdown_now_returns_queued_and_interrupts_running() {
        let p = ThreadPool::fixed(4);
        let started = Arc::new(AtomicUsize::new(0));
        let interrupted = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let started = started.clone();
            let interrupted = interrupted.clone();
            p.execute(move || {
                started.fetch_add(1, Ordering::SeqCst);
                let begun = Instant::now();
                while begun.elapsed() < Duration::from_secs(2) {
                    if interrupt::current().is_interrupted() {
                        interrupted.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();
        }

        thread::sleep(Duration::from_millis(50));
        assert_eq!(started.load(Ordering::SeqCst), 4);
        let leftover = p.shutdown_now();
        assert_eq!(leftover.len(), 6);
        assert!(p.await_termination(Duration::from_secs(5)));
        assert_eq!(interrupted.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_excess_workers_retire_after_keep_alive() {
        let gate = Gate::new();
        let p = pool(1, 3, Arc::new(BlockingQueue::bounded(1)));
        for _ in 0..4 {
            let g = gate.clone();
            p.execute(move || g.wait()).unwrap();
        }
        assert_eq!(p.pool_size(), 3);
        gate.release();

        let deadline = Instant::now() + Duration::from_secs(5);
        while p.pool_size() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        // Non-core workers idled past keep_alive and exited.
        assert_eq!(p.pool_size(), 1);
    }

    #[test]
    fn test_caller_runs_policy_executes_inline() {
        let gate = Gate::new();
        let config = PoolConfig::builder()
            .core_size(1)
            .max_size(1)
            .policy(Arc::new(CallerRunsPolicy))
            .build();
        let p = ThreadPool::new(config, Arc::new(BlockingQueue::bounded(1)));

        let g = gate.clone();
        p.execute(move || g.wait()).unwrap();
        p.execute(|| {}).unwrap();

        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = ran_on.clone();
        p.execute(move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        })
        .unwrap();
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));

        gate.release();
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_discard_policy_drops_silently() {
        let gate = Gate::new();
        let config = PoolConfig::builder()
            .core_size(1)
            .max_size(1)
            .policy(Arc::new(DiscardPolicy))
            .build();
        let p = ThreadPool::new(config, Arc::new(BlockingQueue::bounded(1)));

        let g = gate.clone();
        p.execute(move || g.wait()).unwrap();
        p.execute(|| {}).unwrap();

        let dropped = Arc::new(AtomicUsize::new(0));
        let d = dropped.clone();
        p.execute(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        gate.release();
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_discard_oldest_policy_replaces_head() {
        let gate = Gate::new();
        let config = PoolConfig::builder()
            .core_size(1)
            .max_size(1)
            .policy(Arc::new(DiscardOldestPolicy))
            .build();
        let p = ThreadPool::new(config, Arc::new(BlockingQueue::bounded(1)));

        let g = gate.clone();
        p.execute(move || g.wait()).unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        p.execute(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let s = second.clone();
        p.execute(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        gate.release();
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_is_replaced() {
        let p = ThreadPool::fixed(1);
        p.execute(|| panic!("task failure")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        p.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prestart_core_threads() {
        let p = ThreadPool::fixed(3);
        assert_eq!(p.pool_size(), 0);
        assert_eq!(p.prestart_core_threads(), 3);
        assert_eq!(p.pool_size(), 3);
        // Already at core size; nothing more to start.
        assert_eq!(p.prestart_core_threads(), 0);
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_await_termination_times_out_while_running() {
        let p = ThreadPool::fixed(1);
        p.execute(|| {}).unwrap();
        assert!(!p.await_termination(Duration::from_millis(50)));
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_terminated_only_after_shutdown() {
        let p = ThreadPool::fixed(1);
        assert!(!p.is_shutdown());
        assert!(!p.is_terminated());
        p.shutdown();
        assert!(p.is_shutdown());
        assert!(p.await_termination(Duration::from_secs(5)));
        assert!(p.is_terminated());
        assert!(!p.is_terminating());
    }

    #[test]
    fn test_terminated_hook_runs_once() {
        use crate::config::LifecycleHooks;

        struct CountingHooks {
            terminations: AtomicUsize,
        }
        impl LifecycleHooks for CountingHooks {
            fn terminated(&self) {
                self.terminations.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hooks = Arc::new(CountingHooks {
            terminations: AtomicUsize::new(0),
        });
        let config = PoolConfig::builder()
            .core_size(2)
            .max_size(2)
            .hooks(hooks.clone())
            .build();
        let p = ThreadPool::new(config, Arc::new(BlockingQueue::unbounded()));
        p.execute(|| {}).unwrap();
        p.shutdown();
        assert!(p.await_termination(Duration::from_secs(5)));
        assert_eq!(hooks.terminations.load(Ordering::SeqCst), 1);
    }
}
