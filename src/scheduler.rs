//! Cooperative task scheduling for the main loop.
//!
//! Work is queued as [`Task`]s and executed one per loop iteration, to
//! completion. Producers may be the receive interrupt or other tasks. Work
//! that has to wait is queued with a deadline and moves to the ready FIFO once
//! the deadline passes, instead of spinning on the ready queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::{AppError, Result};
use crate::queue::Queue;

/// Milliseconds on a wrapping counter.
pub type Tick = u32;

/// True once `now` has reached `deadline`, valid across counter wrap as long
/// as the two are less than half the counter range apart.
pub fn is_due(deadline: Tick, now: Tick) -> bool {
    now.wrapping_sub(deadline) < (1 << 31)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        self.start.elapsed().as_millis() as Tick
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Default)]
pub struct ManualClock {
    ticks: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn starting_at(now: Tick) -> Self {
        Self {
            ticks: Arc::new(AtomicU32::new(now)),
        }
    }

    pub fn advance(&self, delta: Tick) {
        let now = self.ticks.load(Ordering::SeqCst);
        self.ticks.store(now.wrapping_add(delta), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// A unit of deferred work run against the context `C`.
pub trait Task<C>: Send {
    fn run(self: Box<Self>, context: &mut C);
}

impl<C, F> Task<C> for F
where
    F: FnOnce(&mut C) + Send,
{
    fn run(self: Box<Self>, context: &mut C) {
        (*self)(context)
    }
}

type BoxedTask<C> = Box<dyn Task<C>>;

struct Deferred<C> {
    deadline: Tick,
    task: BoxedTask<C>,
}

struct Pending<C> {
    ready: Queue<BoxedTask<C>>,
    deferred: Vec<Deferred<C>>,
    deferred_capacity: usize,
}

impl<C> Pending<C> {
    /// Moves due deferred tasks to the ready queue, most overdue first.
    fn promote(&mut self, now: Tick) {
        while !self.ready.is_full() {
            let mut next: Option<(usize, Tick)> = None;
            for (index, entry) in self.deferred.iter().enumerate() {
                if !is_due(entry.deadline, now) {
                    continue;
                }
                let overdue = now.wrapping_sub(entry.deadline);
                if next.map_or(true, |(_, best)| overdue > best) {
                    next = Some((index, overdue));
                }
            }
            let Some((index, _)) = next else {
                return;
            };
            let entry = self.deferred.remove(index);
            if let Err(task) = self.ready.add(entry.task) {
                // cannot happen, the ready queue has room
                self.deferred.insert(index, Deferred {
                    deadline: entry.deadline,
                    task,
                });
                return;
            }
        }
    }
}

pub struct TaskScheduler<C> {
    pending: Mutex<Pending<C>>,
}

impl<C> TaskScheduler<C> {
    pub fn new(capacity: usize, deferred_capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Pending {
                ready: Queue::new(capacity),
                deferred: Vec::with_capacity(deferred_capacity),
                deferred_capacity,
            }),
        }
    }

    fn critical_section(&self) -> MutexGuard<'_, Pending<C>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a task for the next free loop iteration.
    ///
    /// A full queue drops the task, releasing whatever it owns, and reports
    /// the overflow. Producers in interrupt context simply ignore the error.
    pub fn schedule<T: Task<C> + 'static>(&self, task: T) -> Result<()> {
        let rejected = self.critical_section().ready.add(Box::new(task)).err();
        match rejected {
            None => Ok(()),
            Some(task) => {
                drop(task);
                Err(AppError::overflow("task queue"))
            }
        }
    }

    /// Queues a task that becomes ready once the clock reaches `deadline`.
    pub fn schedule_at<T: Task<C> + 'static>(&self, deadline: Tick, task: T) -> Result<()> {
        let rejected = {
            let mut pending = self.critical_section();
            if pending.deferred.len() < pending.deferred_capacity {
                pending.deferred.push(Deferred {
                    deadline,
                    task: Box::new(task),
                });
                None
            } else {
                Some(task)
            }
        };
        match rejected {
            None => Ok(()),
            Some(task) => {
                drop(task);
                Err(AppError::overflow("deferred task queue"))
            }
        }
    }

    /// Runs the oldest ready task, if any. Returns whether a task ran.
    pub fn run_one(&self, context: &mut C, now: Tick) -> bool {
        let task = {
            let mut pending = self.critical_section();
            pending.promote(now);
            pending.ready.remove()
        };
        match task {
            Some(task) => {
                task.run(context);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.critical_section().ready.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.critical_section().deferred.len()
    }

    pub fn is_idle(&self) -> bool {
        let pending = self.critical_section();
        pending.ready.is_empty() && pending.deferred.is_empty()
    }
}
