//! Bounded, elastic pool of connection tasks.
//!
//! The pool pre-allocates a first chunk of tasks and grows lazily in
//! fixed steps until `max_connections` is reached. `pop` and `push` are
//! thread-safe; a mutex-guarded free list is sufficient here because the
//! accept rate is orders of magnitude below the per-reactor event rate.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::task::Task;

/// Pool counters, for diagnostics and capacity planning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks materialized so far.
    pub allocated: usize,
    /// Tasks currently out of the pool (in a reactor or in a handoff pipe).
    pub in_use: usize,
    /// Hard capacity, equal to `max_connections`.
    pub max: usize,
}

/// Growth step: one chunk of tasks allocated at a time. Scaled down as the
/// per-task buffer size goes up so that a single growth never allocates
/// more than roughly 64 MiB of buffer memory.
pub(crate) fn alloc_step(min_buf: usize) -> usize {
    let m = (min_buf / (64 * 1024)).clamp(1, 16);
    1024 / m
}

pub struct TaskPool {
    free: Mutex<Vec<Box<Task>>>,
    allocated: AtomicUsize,
    in_use: AtomicUsize,
    max: usize,
    step: usize,
    min_buf: usize,
    max_buf: usize,
}

impl TaskPool {
    /// Create a pool capped at `max_connections` tasks with the given
    /// buffer bounds. The first chunk is allocated eagerly.
    pub fn new(max_connections: usize, min_buf: usize, max_buf: usize) -> Self {
        let step = alloc_step(min_buf);
        let pool = Self {
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            max: max_connections,
            step,
            min_buf,
            max_buf,
        };
        {
            let mut free = pool.lock_free();
            pool.grow(&mut free);
        }
        pool
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<Box<Task>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grow(&self, free: &mut Vec<Box<Task>>) {
        let allocated = self.allocated.load(Ordering::Relaxed);
        if allocated >= self.max {
            return;
        }
        let count = self.step.min(self.max - allocated);
        free.reserve(count);
        for _ in 0..count {
            free.push(Box::new(Task::new(self.min_buf, self.max_buf)));
        }
        self.allocated.fetch_add(count, Ordering::Relaxed);
    }

    /// Take a free task, growing the pool if needed. Returns `None` only
    /// when all `max` tasks are in use.
    pub fn pop(&self) -> Option<Box<Task>> {
        let mut free = self.lock_free();
        if free.is_empty() {
            self.grow(&mut free);
        }
        let task = free.pop()?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    /// Release a task back to the free list. The caller must have closed
    /// the socket and detached the task.
    pub fn push(&self, task: Box<Task>) {
        debug_assert_eq!(task.fd(), -1, "task pushed with live socket");
        self.lock_free().push(task);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            max: self.max,
        }
    }
}
