//! Host Scheduler
//!
//! The engine never sleeps or spawns. It hands deferred work to a
//! [`Scheduler`] and the host hands ready work back through
//! [`Observer::run_pending`](crate::Observer::run_pending).
//!
//! Deferral strategies:
//! - synchronous: run inline by the engine, never scheduled
//! - [`Deferral::Immediate`]: microtask, before any timer
//! - [`Deferral::Delayed`]: timer task after a delay
//! - [`Deferral::Idle`]: idle callback, forced once its timeout elapses

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::registry::SubscriptionId;

/// How a job is deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    Immediate,
    Delayed { ms: u64 },
    Idle { timeout_ms: u64 },
}

/// Handle to a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

/// Opaque unit of engine work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job(pub(crate) JobKind);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobKind {
    /// Drain the dispatch queue
    Drain,
    /// Run a deferred priority lane
    Lane(u64),
    /// Re-invoke one failed callback
    Retry(u64),
    /// Debounce window of a subscription closed
    Debounce(SubscriptionId),
    /// Periodic catalogue re-scan
    Rescan,
    /// Fallback polling scan
    Poll,
    /// Reconnect attempt in recovery mode
    Recover,
}

/// Capability supplied by the host
pub trait Scheduler {
    /// Monotonic milliseconds
    fn now_ms(&self) -> u64;

    fn schedule(&mut self, deferral: Deferral, job: Job) -> TaskHandle;

    /// Returns `false` when the job already ran or was cancelled
    fn cancel(&mut self, handle: TaskHandle) -> bool;

    /// Next job that may run now
    fn next_ready(&mut self) -> Option<(TaskHandle, Job)>;

    /// Earliest time something becomes ready
    fn next_deadline_ms(&self) -> Option<u64>;

    /// Jobs scheduled and not yet run or cancelled
    fn pending(&self) -> usize;
}

#[derive(Debug)]
struct IdleEntry {
    handle: TaskHandle,
    deadline: u64,
    job: Job,
}

/// Ready-ordering shared by the shipped schedulers: microtasks, then due
/// timers by `(due, sequence)`, then idle callbacks.
#[derive(Debug, Default)]
struct TaskQueue {
    next_handle: u64,
    immediate: VecDeque<(TaskHandle, Job)>,
    timers: BTreeMap<(u64, u64), (TaskHandle, Job)>,
    idle: VecDeque<IdleEntry>,
}

impl TaskQueue {
    fn schedule(&mut self, now: u64, deferral: Deferral, job: Job) -> TaskHandle {
        self.next_handle += 1;
        let handle = TaskHandle(self.next_handle);
        match deferral {
            Deferral::Immediate => self.immediate.push_back((handle, job)),
            Deferral::Delayed { ms } => {
                self.timers.insert((now + ms, handle.0), (handle, job));
            }
            Deferral::Idle { timeout_ms } => self.idle.push_back(IdleEntry {
                handle,
                deadline: now + timeout_ms,
                job,
            }),
        }
        handle
    }

    fn cancel(&mut self, handle: TaskHandle) -> bool {
        if let Some(pos) = self.immediate.iter().position(|(h, _)| *h == handle) {
            self.immediate.remove(pos);
            return true;
        }
        let timer = self
            .timers
            .iter()
            .find(|(_, (h, _))| *h == handle)
            .map(|(key, _)| *key);
        if let Some(key) = timer {
            self.timers.remove(&key);
            return true;
        }
        if let Some(pos) = self.idle.iter().position(|e| e.handle == handle) {
            self.idle.remove(pos);
            return true;
        }
        false
    }

    fn next_ready(&mut self, now: u64) -> Option<(TaskHandle, Job)> {
        if let Some(entry) = self.immediate.pop_front() {
            return Some(entry);
        }
        let first = self.timers.keys().next().copied();
        if let Some(key) = first.filter(|&(due, _)| due <= now) {
            return self.timers.remove(&key);
        }
        // Timed-out idle callbacks first, otherwise the host is idle right now
        let pos = self
            .idle
            .iter()
            .position(|e| e.deadline <= now)
            .unwrap_or(0);
        self.idle.remove(pos).map(|e| (e.handle, e.job))
    }

    fn next_deadline(&self, now: u64) -> Option<u64> {
        if !self.immediate.is_empty() || !self.idle.is_empty() {
            return Some(now);
        }
        self.timers.keys().next().map(|&(due, _)| due)
    }

    fn pending(&self) -> usize {
        self.immediate.len() + self.timers.len() + self.idle.len()
    }
}

/// Shared handle to a virtual clock
#[derive(Debug, Clone, Default)]
pub struct VirtualClock(Rc<Cell<u64>>);

impl VirtualClock {
    pub fn now(&self) -> u64 {
        self.0.get()
    }

    pub fn set(&self, ms: u64) {
        self.0.set(ms.max(self.0.get()));
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

/// Deterministic scheduler with a manually advanced clock
#[derive(Debug, Default)]
pub struct VirtualScheduler {
    clock: VirtualClock,
    queue: TaskQueue,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock handle; callbacks may hold one to simulate slow work
    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    pub fn advance(&mut self, ms: u64) {
        self.clock.advance(ms);
    }
}

impl Scheduler for VirtualScheduler {
    fn now_ms(&self) -> u64 {
        self.clock.now()
    }

    fn schedule(&mut self, deferral: Deferral, job: Job) -> TaskHandle {
        self.queue.schedule(self.clock.now(), deferral, job)
    }

    fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.queue.cancel(handle)
    }

    fn next_ready(&mut self) -> Option<(TaskHandle, Job)> {
        self.queue.next_ready(self.clock.now())
    }

    fn next_deadline_ms(&self) -> Option<u64> {
        self.queue.next_deadline(self.clock.now())
    }

    fn pending(&self) -> usize {
        self.queue.pending()
    }
}

/// Scheduler on the process monotonic clock
#[derive(Debug)]
pub struct WallClockScheduler {
    start: Instant,
    queue: TaskQueue,
}

impl Default for WallClockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClockScheduler {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            queue: TaskQueue::default(),
        }
    }

    /// Earliest instant something becomes ready
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_deadline_ms()
            .map(|ms| self.start + Duration::from_millis(ms))
    }
}

impl Scheduler for WallClockScheduler {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn schedule(&mut self, deferral: Deferral, job: Job) -> TaskHandle {
        let now = self.now_ms();
        self.queue.schedule(now, deferral, job)
    }

    fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.queue.cancel(handle)
    }

    fn next_ready(&mut self) -> Option<(TaskHandle, Job)> {
        let now = self.now_ms();
        self.queue.next_ready(now)
    }

    fn next_deadline_ms(&self) -> Option<u64> {
        self.queue.next_deadline(self.now_ms())
    }

    fn pending(&self) -> usize {
        self.queue.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(n: u64) -> Job {
        Job(JobKind::Lane(n))
    }

    fn drain(s: &mut VirtualScheduler) -> Vec<Job> {
        std::iter::from_fn(|| s.next_ready().map(|(_, j)| j)).collect()
    }

    #[test]
    fn test_ready_order() {
        let mut s = VirtualScheduler::new();
        s.schedule(Deferral::Idle { timeout_ms: 500 }, job(4));
        s.schedule(Deferral::Delayed { ms: 10 }, job(3));
        s.schedule(Deferral::Delayed { ms: 0 }, job(2));
        s.schedule(Deferral::Immediate, job(1));

        assert_eq!(drain(&mut s), vec![job(1), job(2), job(4)]);
        assert_eq!(s.pending(), 1);
        assert_eq!(s.next_deadline_ms(), Some(10));

        s.advance(10);
        assert_eq!(drain(&mut s), vec![job(3)]);
        assert_eq!(s.next_deadline_ms(), None);
    }

    #[test]
    fn test_timers_fire_in_due_then_sequence_order() {
        let mut s = VirtualScheduler::new();
        s.schedule(Deferral::Delayed { ms: 20 }, job(1));
        s.schedule(Deferral::Delayed { ms: 5 }, job(2));
        s.schedule(Deferral::Delayed { ms: 20 }, job(3));
        s.advance(25);
        assert_eq!(drain(&mut s), vec![job(2), job(1), job(3)]);
    }

    #[test]
    fn test_timed_out_idle_jumps_the_idle_line() {
        let mut s = VirtualScheduler::new();
        s.schedule(Deferral::Idle { timeout_ms: 1000 }, job(1));
        s.schedule(Deferral::Idle { timeout_ms: 10 }, job(2));
        s.advance(10);
        assert_eq!(s.next_ready().map(|(_, j)| j), Some(job(2)));
    }

    #[test]
    fn test_cancel() {
        let mut s = VirtualScheduler::new();
        let a = s.schedule(Deferral::Delayed { ms: 5 }, job(1));
        let b = s.schedule(Deferral::Immediate, job(2));
        let c = s.schedule(Deferral::Idle { timeout_ms: 5 }, job(3));
        assert!(s.cancel(a));
        assert!(s.cancel(b));
        assert!(s.cancel(c));
        assert!(!s.cancel(a));
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn test_clock_handle_is_shared() {
        let s = VirtualScheduler::new();
        let clock = s.clock();
        clock.advance(42);
        assert_eq!(s.now_ms(), 42);
    }
}
