//! The scheduler facade.
//!
//! [`Scheduler`] owns the worker pool, the slots, and the schedule timeline,
//! and exposes the submission API.  Submissions land on a lock-free queue and
//! are safe from any thread; [`Scheduler::tick`] -- typically called once per
//! frame by one driving thread -- drains that queue, promotes tasks whose
//! readiness predicate passes into the timeline, and runs one selection
//! cycle.
//!
//! # Task shapes
//!
//! Plain functions run once ([`Scheduler::submit`], with delayed and
//! deferred variants); `Loop`, `For` and `Chain` bodies are resumable and
//! checkpoint between user-function invocations; the await variants gate a
//! one-shot function on the readiness of other futures.  In every case the
//! returned [`Future`] resolves to the task's terminal state.
//!
//! # Shutdown
//!
//! Dropping the last scheduler handle (or calling
//! [`Scheduler::shutdown`]) force-cancels all live tasks, ticks the timeline
//! until it drains, and joins the workers.  In-flight work observes the
//! cancellation at its next checkpoint and surfaces as `ForceCanceled`; this
//! is documented behavior, not an error.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use std::time::Instant;
//! # use lumen_sched::Scheduler;
//! # use lumen_task::TaskPriority;
//! let scheduler = Scheduler::new(2).expect("worker pool");
//!
//! let doubled = scheduler
//!     .submit("double", TaskPriority::Normal, || 21 * 2)
//!     .expect("submit");
//!
//! while !doubled.is_done() {
//!     scheduler.tick(Instant::now());
//! }
//! assert_eq!(doubled.value().unwrap(), 42);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use lumen_task::{
    AnyFuture, Chain, ChainState, For, Future, FutureStatus, Loop, LoopState, Promise,
    RequestKind, RequestSource, RequestState, ServiceToken, TaskControl, TaskId, TaskPriority,
};

use crate::error::{Result, SchedError};
use crate::slot::{self, TaskFn, ThreadSlot, lock_unpoisoned};
use crate::timeline::ScheduleTimeline;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Metadata snapshot of a submitted task.  The status is read live from the
/// task's shared state at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub priority: TaskPriority,
    pub status: FutureStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// When a submission becomes eligible for the timeline.
enum Readiness {
    /// On the next tick.
    Immediate,
    /// Once `delay` has elapsed since submission.
    After(Duration),
    /// Once the predicate returns true (polled each tick).
    When(Box<dyn FnMut() -> bool + Send>),
}

struct Submission {
    work: TaskFn,
    id: TaskId,
    name: String,
    priority: TaskPriority,
    control: TaskControl,
    readiness: Readiness,
    submitted_at: Instant,
}

struct TaskRecord {
    name: String,
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    control: TaskControl,
}

struct TickState {
    timeline: ScheduleTimeline,
    /// Submissions whose readiness predicate has not passed yet.
    waiting: Vec<Submission>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Priority- and starvation-aware cooperative task scheduler.
///
/// The scheduler is cheaply cloneable (`Arc`-backed) and safe to share
/// across threads.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    /// Cross-thread submission queue, drained by `tick`.
    submissions: SegQueue<Submission>,

    /// Timeline and waiting set; only ever held for short critical sections
    /// by whichever thread drives `tick`.
    state: Mutex<TickState>,

    slots: Vec<Arc<ThreadSlot>>,
    worker_futures: Vec<Future<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Authoritative task metadata, shared with status queries.
    tasks: DashMap<TaskId, TaskRecord>,

    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler with `num_workers` worker threads (at least one).
    pub fn new(num_workers: usize) -> Result<Self> {
        let num_workers = num_workers.max(1);

        let mut slots = Vec::with_capacity(num_workers);
        let mut worker_futures = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let promise = Promise::new();
            worker_futures.push(promise.future());
            let slot = Arc::new(ThreadSlot::new(promise));

            let spawned = thread::Builder::new()
                .name(format!("lumen-worker-{index}"))
                .spawn({
                    let slot = Arc::clone(&slot);
                    move || slot::run_worker(&slot)
                });

            match spawned {
                Ok(handle) => {
                    slots.push(slot);
                    workers.push(handle);
                }
                Err(source) => {
                    // tear down whatever part of the pool already exists
                    for (future, slot) in worker_futures.iter().zip(&slots) {
                        future.request_cancel();
                        slot.wake();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(SchedError::WorkerSpawn { source });
                }
            }
        }

        tracing::info!(workers = num_workers, "scheduler started");

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                submissions: SegQueue::new(),
                state: Mutex::new(TickState {
                    timeline: ScheduleTimeline::new(),
                    waiting: Vec::new(),
                }),
                slots,
                worker_futures,
                workers: Mutex::new(workers),
                tasks: DashMap::new(),
                next_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    // -- Submission ----------------------------------------------------------

    /// Submit a one-shot function.
    pub fn submit<T, F>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_gated(name.into(), priority, Readiness::Immediate, f)
    }

    /// Submit a one-shot function that becomes ready after `delay`.
    ///
    /// No timer thread is involved: readiness is re-evaluated against the
    /// tick clock, so resolution is bounded by the tick interval.
    pub fn submit_after<T, F>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        delay: Duration,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_gated(name.into(), priority, Readiness::After(delay), f)
    }

    /// Submit a one-shot function deferred until `ready` returns true.
    pub fn submit_when<T, F, P>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        ready: P,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        P: FnMut() -> bool + Send + 'static,
    {
        self.submit_gated(name.into(), priority, Readiness::When(Box::new(ready)), f)
    }

    /// Submit a function gated on *all* of `deps` reaching a done state.
    ///
    /// The callback typically captures clones of the typed futures behind
    /// `deps` and reads their values; it runs exactly once.  Canceling the
    /// returned future does not cancel the dependencies.  With no
    /// dependencies the task is immediately ready.
    pub fn await_all<T, F>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        deps: Vec<AnyFuture>,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let ready = move || deps.iter().all(AnyFuture::is_done);
        self.submit_gated(name.into(), priority, Readiness::When(Box::new(ready)), f)
    }

    /// Submit a function gated on *any* of `deps` reaching a done state.
    ///
    /// With no dependencies the task never becomes ready.
    pub fn await_any<T, F>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        deps: Vec<AnyFuture>,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let ready = move || deps.iter().any(AnyFuture::is_done);
        self.submit_gated(name.into(), priority, Readiness::When(Box::new(ready)), f)
    }

    /// Submit a loop.  It runs until canceled; the future resolves to the
    /// cancellation outcome.
    pub fn submit_loop<F>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        f: F,
    ) -> Result<Future<()>>
    where
        F: FnMut() + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let control = promise.control();

        let mut body = Loop::new(f);
        let mut state = LoopState::default();
        let work: TaskFn = Arc::new(Mutex::new(move || {
            if acknowledge_pre_run_cancel(&promise) {
                return;
            }
            promise.notify_executing();
            let proxy = promise.request_proxy();
            body.resume(&mut state, &proxy);
            drop(proxy);

            match state.service_token.take() {
                Some(token) => finalize_service(&promise, token),
                // a loop only leaves `resume` through a serviced request
                None => promise.notify_completed(()),
            }
        }));

        self.enqueue(name.into(), priority, control, work, Readiness::Immediate)?;
        Ok(future)
    }

    /// Submit a bounded for-loop over `[begin, end)`.
    pub fn submit_for<F>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        begin: i64,
        end: i64,
        f: F,
    ) -> Result<Future<()>>
    where
        F: FnMut(i64) + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let control = promise.control();

        let mut body = For::new(begin, end, f);
        let mut state = body.start_state();
        let work: TaskFn = Arc::new(Mutex::new(move || {
            if acknowledge_pre_run_cancel(&promise) {
                return;
            }
            promise.notify_executing();
            let proxy = promise.request_proxy();
            body.resume(&mut state, &proxy);
            drop(proxy);

            if body.is_complete(&state) {
                promise.notify_completed(());
            } else if let Some(token) = state.service_token.take() {
                finalize_service(&promise, token);
            }
        }));

        self.enqueue(name.into(), priority, control, work, Readiness::Immediate)?;
        Ok(future)
    }

    /// Submit a chain of stages.  The future resolves to the final stage's
    /// result.
    pub fn submit_chain<T>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        mut chain: Chain<T>,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let control = promise.control();

        let mut state = ChainState::new();
        let work: TaskFn = Arc::new(Mutex::new(move || {
            if acknowledge_pre_run_cancel(&promise) {
                return;
            }
            promise.notify_executing();
            let proxy = promise.request_proxy();
            chain.resume(&mut state, &proxy);
            drop(proxy);

            if chain.is_complete(&state) {
                promise.notify_completed(chain.take_result(&mut state));
            } else if let Some(token) = state.service_token.take() {
                finalize_service(&promise, token);
            }
        }));

        self.enqueue(name.into(), priority, control, work, Readiness::Immediate)?;
        Ok(future)
    }

    // -- Driving -------------------------------------------------------------

    /// Advance the scheduler by one cycle at monotonic time `now`.
    ///
    /// Non-blocking apart from a short critical section; call it as often as
    /// desired (typically once per frame) from one driving thread.
    pub fn tick(&self, now: Instant) {
        self.inner.tick(now);
    }

    /// `true` when no task is live: the timeline is empty and nothing is
    /// waiting on readiness.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = lock_unpoisoned(&self.inner.state);
        state.timeline.is_empty() && state.waiting.is_empty()
    }

    // -- Introspection -------------------------------------------------------

    /// Snapshot one task's metadata, with its status read live.
    #[must_use]
    pub fn status(&self, id: TaskId) -> Option<TaskInfo> {
        self.inner.tasks.get(&id).map(|record| TaskInfo {
            id,
            name: record.name.clone(),
            priority: record.priority,
            status: record.control.fetch_status(),
            created_at: record.created_at,
        })
    }

    /// Snapshot every task submitted to this scheduler.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .tasks
            .iter()
            .map(|entry| TaskInfo {
                id: *entry.key(),
                name: entry.value().name.clone(),
                priority: entry.value().priority,
                status: entry.value().control.fetch_status(),
                created_at: entry.value().created_at,
            })
            .collect()
    }

    /// Force-cancel all live work, drain the timeline and join the workers.
    ///
    /// Also runs when the last scheduler handle is dropped.  Idempotent.
    /// Must not be called from inside a task body: joining the pool from a
    /// worker thread would wait on itself.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    // -- Private helpers -----------------------------------------------------

    /// Package a one-shot body and enqueue it behind `readiness`.
    fn submit_gated<T, F>(
        &self,
        name: String,
        priority: TaskPriority,
        readiness: Readiness,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let control = promise.control();

        let mut f = Some(f);
        let work: TaskFn = Arc::new(Mutex::new(move || {
            if acknowledge_pre_run_cancel(&promise) {
                return;
            }
            promise.notify_executing();
            if let Some(f) = f.take() {
                promise.notify_completed(f());
            }
        }));

        self.enqueue(name, priority, control, work, readiness)?;
        Ok(future)
    }

    fn enqueue(
        &self,
        name: String,
        priority: TaskPriority,
        control: TaskControl,
        work: TaskFn,
        readiness: Readiness,
    ) -> Result<TaskId> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SchedError::Shutdown);
        }

        let id = TaskId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.tasks.insert(
            id,
            TaskRecord {
                name: name.clone(),
                priority,
                created_at: Utc::now(),
                control: control.clone(),
            },
        );

        tracing::debug!(task_id = %id, task_name = %name, ?priority, "task submitted");

        self.inner.submissions.push(Submission {
            work,
            id,
            name,
            priority,
            control,
            readiness,
            submitted_at: Instant::now(),
        });

        Ok(id)
    }
}

impl SchedulerInner {
    fn tick(&self, now: Instant) {
        let mut state = lock_unpoisoned(&self.state);

        while let Some(submission) = self.submissions.pop() {
            state.waiting.push(submission);
        }

        // promote ready submissions into the timeline; drop the ones that
        // were canceled before ever becoming ready
        let waiting = std::mem::take(&mut state.waiting);
        for mut submission in waiting {
            let cancel = submission.control.fetch_cancel_request();
            if cancel.state == RequestState::Requested {
                match cancel.source {
                    RequestSource::Executor => submission.control.notify_force_canceled(),
                    RequestSource::User => submission.control.notify_user_canceled(),
                }
                tracing::debug!(task_id = %submission.id, "task canceled before becoming ready");
                continue;
            }

            let ready = match &mut submission.readiness {
                Readiness::Immediate => true,
                Readiness::After(delay) => {
                    now.saturating_duration_since(submission.submitted_at) >= *delay
                }
                Readiness::When(predicate) => predicate(),
            };

            if ready {
                state.timeline.add_task(
                    submission.work,
                    submission.id,
                    submission.name,
                    submission.priority,
                    submission.control,
                    now,
                );
            } else {
                state.waiting.push(submission);
            }
        }

        state.timeline.tick(&self.slots, now);
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("scheduler shutdown requested");

        // Drain: force-cancel everything live, tick so the timeline observes
        // acknowledgments, repeat.  Bodies yield at their next checkpoint;
        // tasks that never became ready are finalized without running.
        loop {
            {
                let mut state = lock_unpoisoned(&self.state);
                while let Some(submission) = self.submissions.pop() {
                    state.waiting.push(submission);
                }
                for submission in &state.waiting {
                    submission.control.request_force_cancel();
                }
                state.timeline.request_force_cancel_all();
            }

            self.tick(Instant::now());

            let drained = {
                let state = lock_unpoisoned(&self.state);
                state.timeline.is_empty() && state.waiting.is_empty()
            };
            if drained && self.submissions.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        // stop the workers and wait for them
        for future in &self.worker_futures {
            future.request_cancel();
        }
        for slot in &self.slots {
            slot.wake();
        }
        let mut workers = lock_unpoisoned(&self.workers);
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked before join");
            }
        }

        tracing::info!("scheduler stopped");
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Packaging glue
// ---------------------------------------------------------------------------

/// Workers may pick a task up well after a cancel request was raised; check
/// before doing any work and finalize straight away.
fn acknowledge_pre_run_cancel<T>(promise: &Promise<T>) -> bool {
    let cancel = promise.fetch_cancel_request();
    if cancel.state == RequestState::Requested {
        match cancel.source {
            RequestSource::Executor => promise.notify_force_canceled(),
            RequestSource::User => promise.notify_user_canceled(),
        }
        return true;
    }
    false
}

/// Map a serviced request onto the matching terminal or suspended state.
fn finalize_service<T>(promise: &Promise<T>, token: ServiceToken) {
    match (token.source, token.kind) {
        (RequestSource::Executor, RequestKind::Cancel) => promise.notify_force_canceled(),
        (RequestSource::Executor, RequestKind::Suspend) => promise.notify_force_suspended(),
        (RequestSource::User, RequestKind::Cancel) => promise.notify_user_canceled(),
        (RequestSource::User, RequestKind::Suspend) => promise.notify_user_suspended(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(scheduler: &Scheduler, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            scheduler.tick(Instant::now());
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn submit_and_complete() {
        let scheduler = Scheduler::new(1).expect("scheduler should start");

        let future = scheduler
            .submit("forty-two", TaskPriority::Normal, || 42)
            .expect("submit should succeed");

        assert!(drive(&scheduler, Duration::from_secs(5), || future.is_done()));
        assert_eq!(future.fetch_status(), FutureStatus::Completed);
        assert_eq!(future.value().unwrap(), 42);

        scheduler.shutdown();
    }

    #[test]
    fn submission_is_visible_before_any_tick() {
        let scheduler = Scheduler::new(1).expect("scheduler");

        let future = scheduler
            .submit("pending", TaskPriority::Interactive, || ())
            .expect("submit");
        assert_eq!(future.fetch_status(), FutureStatus::Scheduled);

        let tasks = scheduler.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "pending");
        assert_eq!(tasks[0].priority, TaskPriority::Interactive);
        assert_eq!(tasks[0].status, FutureStatus::Scheduled);
        assert_eq!(scheduler.status(tasks[0].id).unwrap().name, "pending");

        scheduler.shutdown();
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let scheduler = Scheduler::new(1).expect("scheduler");
        scheduler.shutdown();

        let result = scheduler.submit("late", TaskPriority::Normal, || ());
        assert!(matches!(result, Err(SchedError::Shutdown)));
    }

    #[test]
    fn worker_count_is_clamped_to_one() {
        let scheduler = Scheduler::new(0).expect("scheduler");
        let future = scheduler
            .submit("still-runs", TaskPriority::Normal, || 1)
            .expect("submit");
        assert!(drive(&scheduler, Duration::from_secs(5), || future.is_done()));
        scheduler.shutdown();
    }
}
