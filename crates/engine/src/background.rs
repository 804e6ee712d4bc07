//! Background work scheduler for bucket flushes and index merges.
//!
//! A fixed pool of worker threads pops tasks from a priority queue.
//! Tasks are deduplicated by key: while a task with a given key is queued or
//! running, further submissions with that key are skipped. The flush ticker
//! relies on this to submit "flush en:it" on every tick without piling up
//! copies behind a slow flush.

use dashmap::DashSet;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tmstore_core::{Error, Result};
use tracing::{debug, error};

/// Priority levels for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Segment merges
    Low = 0,
    /// Threshold-driven bucket flushes
    Normal = 1,
}

/// Outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Task queued
    Queued,
    /// A task with the same key is already queued or running
    AlreadyPending,
}

/// Scheduler metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Number of tasks waiting in the queue.
    pub queue_depth: usize,
    /// Number of tasks currently being executed by workers.
    pub active_tasks: usize,
    /// Total number of tasks completed since scheduler creation.
    pub tasks_completed: u64,
    /// Number of worker threads.
    pub worker_count: usize,
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    key: String,
    work: Box<dyn FnOnce() + Send>,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then lower sequence (older) first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<TaskEnvelope>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    pending_keys: DashSet<String>,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

/// Priority task scheduler with a fixed worker pool.
///
/// Higher-priority tasks run first; within the same priority, tasks are
/// executed in FIFO order.
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl BackgroundScheduler {
    /// Create a scheduler with `num_threads` workers named `tmstore-bg-N`.
    pub fn new(num_threads: usize, max_queue_depth: usize) -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            pending_keys: DashSet::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let spawned = std::thread::Builder::new()
                .name(format!("tmstore-bg-{}", i))
                .spawn(move || worker_loop(&inner_clone));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Stop the workers already started
                    inner.shutdown.store(true, AtomicOrdering::Release);
                    {
                        let _queue = inner.queue.lock();
                        inner.work_ready.notify_all();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        })
    }

    /// Submit a task unless one with the same `key` is queued or running.
    ///
    /// Returns `Error::Backpressure` if the queue is full and
    /// `Error::Closed` after shutdown.
    pub fn submit(
        &self,
        priority: TaskPriority,
        key: impl Into<String>,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<Submitted> {
        // Workers are joined after shutdown; the task would never run
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(Error::Closed);
        }
        if self.inner.queue_depth.load(AtomicOrdering::Acquire) >= self.inner.max_queue_depth {
            return Err(Error::Backpressure);
        }
        let key = key.into();
        if !self.inner.pending_keys.insert(key.clone()) {
            return Ok(Submitted::AlreadyPending);
        }

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let envelope = TaskEnvelope {
            priority,
            sequence,
            key,
            work: Box::new(work),
        };

        {
            let mut queue = self.inner.queue.lock();
            queue.push(envelope);
            self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }

        self.inner.work_ready.notify_one();
        Ok(Submitted::Queued)
    }

    /// Block until all queued and in-flight tasks have completed.
    ///
    /// Workers keep running; this does not shut the scheduler down.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Signal workers to exit and join them.
    ///
    /// Workers finish the remaining queue before exiting. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);

        // Notify under the queue lock so a worker between its shutdown check
        // and its wait cannot miss the wakeup
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!(workers = self.num_threads, "Background scheduler stopped");
    }

    /// True once `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Return a snapshot of scheduler metrics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Releases a task's bookkeeping on drop, including when the task panics.
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
    key: String,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        self.inner.pending_keys.remove(&self.key);
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner
            .tasks_completed
            .fetch_add(1, AtomicOrdering::Relaxed);

        // drain() checks its condition under the queue lock
        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let TaskEnvelope { key, work, .. } = task;
        let _guard = ActiveTaskGuard { inner, key };

        // A panicking task must not take the worker down
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)) {
            error!(
                "background task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    /// Occupy the single worker until the returned barrier is released
    fn block_worker(scheduler: &BackgroundScheduler) -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Low, "block", move || {
                b.wait();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        barrier
    }

    /// Queue `n` tasks with distinct keys, each bumping `counter`
    fn submit_counting(scheduler: &BackgroundScheduler, counter: &Arc<AtomicUsize>, n: usize) {
        for i in 0..n {
            let c = Arc::clone(counter);
            scheduler
                .submit(TaskPriority::Normal, format!("count-{}", i), move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
    }

    #[test]
    fn test_submit_and_drain() {
        let scheduler = BackgroundScheduler::new(2, 4096).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        submit_counting(&scheduler, &counter, 10);

        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
        scheduler.shutdown();
    }

    #[test]
    fn test_priority_ordering() {
        let scheduler = BackgroundScheduler::new(1, 4096).unwrap();
        let barrier = block_worker(&scheduler);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, name) in [
            (TaskPriority::Low, "optimize"),
            (TaskPriority::Normal, "flush:en:it"),
            (TaskPriority::Low, "optimize-again"),
            (TaskPriority::Normal, "flush:en:de"),
        ] {
            let o = Arc::clone(&order);
            scheduler
                .submit(priority, name, move || {
                    o.lock().push(name);
                })
                .unwrap();
        }

        barrier.wait();
        scheduler.drain();
        assert_eq!(
            *order.lock(),
            vec!["flush:en:it", "flush:en:de", "optimize", "optimize-again"]
        );
        scheduler.shutdown();
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let scheduler = BackgroundScheduler::new(1, 4096).unwrap();
        let barrier = block_worker(&scheduler);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let o = Arc::clone(&order);
            scheduler
                .submit(TaskPriority::Normal, format!("task-{}", i), move || {
                    o.lock().push(i);
                })
                .unwrap();
        }

        barrier.wait();
        scheduler.drain();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        scheduler.shutdown();
    }

    #[test]
    fn test_same_key_is_deduplicated() {
        let scheduler = BackgroundScheduler::new(1, 4096).unwrap();
        let barrier = block_worker(&scheduler);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let c = Arc::clone(&counter);
            outcomes.push(
                scheduler
                    .submit(TaskPriority::Normal, "flush:en:it", move || {
                        c.fetch_add(1, AtomicOrdering::Relaxed);
                    })
                    .unwrap(),
            );
        }
        assert_eq!(
            outcomes,
            vec![Submitted::Queued, Submitted::AlreadyPending, Submitted::AlreadyPending]
        );

        barrier.wait();
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);

        // Key is released once the task has run
        let c = Arc::clone(&counter);
        let outcome = scheduler
            .submit(TaskPriority::Normal, "flush:en:it", move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();
        assert_eq!(outcome, Submitted::Queued);
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 2);
        scheduler.shutdown();
    }

    #[test]
    fn test_backpressure() {
        let scheduler = BackgroundScheduler::new(1, 2).unwrap();
        let barrier = block_worker(&scheduler);

        let counter = Arc::new(AtomicUsize::new(0));
        submit_counting(&scheduler, &counter, 2);

        let result = scheduler.submit(TaskPriority::Normal, "overflow", || {});
        assert!(matches!(result, Err(Error::Backpressure)));

        barrier.wait();
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 2);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_drains_remaining() {
        let scheduler = BackgroundScheduler::new(1, 4096).unwrap();
        let barrier = block_worker(&scheduler);

        let counter = Arc::new(AtomicUsize::new(0));
        submit_counting(&scheduler, &counter, 5);

        barrier.wait();
        scheduler.shutdown();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
    }

    #[test]
    fn test_stats() {
        let scheduler = BackgroundScheduler::new(2, 4096).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        submit_counting(&scheduler, &counter, 5);
        scheduler.drain();

        let stats = scheduler.stats();
        assert_eq!(stats.tasks_completed, 5);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.worker_count, 2);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let scheduler = BackgroundScheduler::new(2, 4096).unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert!(matches!(
            scheduler.submit(TaskPriority::Normal, "late", || {}),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_task_panic_does_not_hang_drain() {
        let scheduler = BackgroundScheduler::new(2, 4096).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .submit(TaskPriority::Normal, "boom", || {
                panic!("intentional test panic");
            })
            .unwrap();
        submit_counting(&scheduler, &counter, 5);

        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
        // The panicked task released its key
        assert_eq!(
            scheduler.submit(TaskPriority::Normal, "boom", || {}).unwrap(),
            Submitted::Queued
        );
        scheduler.shutdown();
    }
}
