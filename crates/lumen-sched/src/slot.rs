//! Thread slots and the worker drain loop.
//!
//! A [`ThreadSlot`] is a single-capacity mailbox owned by one worker thread.
//! The timeline is the only producer (`push_task`), the worker the only
//! consumer (`pop_pending` / `finish_executing`); a mutex plus condition
//! variable keeps the three observable fields -- pending, executing,
//! `can_push` -- consistent for both sides.
//!
//! Workers park on the condition variable while their slot is empty.  Each
//! worker's lifecycle is modeled with the same future/promise primitive as
//! every task: the scheduler cancels the worker's promise and wakes the slot
//! to shut it down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use lumen_task::{Promise, RequestSource, RequestState, TaskControl, TaskId};

/// A packaged resumable task body.
///
/// The same callable is held by the timeline record and by whichever slot the
/// task currently occupies; a task runs on at most one worker at a time, and
/// the mutex makes the sharing sound.
pub type TaskFn = Arc<Mutex<dyn FnMut() + Send>>;

/// Recover a guard from a poisoned mutex.  Task bodies run outside the slot
/// lock and behind `catch_unwind`, so a poisoned lock only ever means a
/// panicking writer left coherent data behind.
pub(crate) fn lock_unpoisoned<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A task as it travels into a slot.
pub struct SlotTask {
    work: TaskFn,
    id: TaskId,
    control: TaskControl,
}

impl SlotTask {
    #[must_use]
    pub fn new(work: TaskFn, id: TaskId, control: TaskControl) -> Self {
        Self { work, id, control }
    }
}

/// Atomic snapshot of a slot's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotQuery {
    pub pending_task: Option<TaskId>,
    pub executing_task: Option<TaskId>,
    /// `true` when both pending and executing are empty.
    pub can_push: bool,
}

// ---------------------------------------------------------------------------
// ThreadSlot
// ---------------------------------------------------------------------------

struct SlotState {
    pending: Option<SlotTask>,
    executing: Option<TaskId>,
}

/// Single-producer / single-consumer coordination point between the timeline
/// and one worker thread.
pub struct ThreadSlot {
    state: Mutex<SlotState>,
    signal: Condvar,
    worker: Promise<()>,
}

impl ThreadSlot {
    #[must_use]
    pub fn new(worker: Promise<()>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                executing: None,
            }),
            signal: Condvar::new(),
            worker,
        }
    }

    /// Snapshot the slot for the timeline's capture vector.
    #[must_use]
    pub fn query(&self) -> SlotQuery {
        let state = lock_unpoisoned(&self.state);
        SlotQuery {
            pending_task: state.pending.as_ref().map(|task| task.id),
            executing_task: state.executing,
            can_push: state.pending.is_none() && state.executing.is_none(),
        }
    }

    /// Timeline-only: hand a task to this slot's worker.  Refused (and
    /// warn-logged -- the timeline checks `can_push` first, so a refusal
    /// indicates a scheduler bug) when the slot is occupied.
    pub fn push_task(&self, task: SlotTask) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if state.pending.is_some() || state.executing.is_some() {
            tracing::warn!(task_id = %task.id, "slot refused a push while occupied");
            return false;
        }
        state.pending = Some(task);
        drop(state);
        self.signal.notify_one();
        true
    }

    /// Worker-only: atomically move the pending task into `executing`.
    pub fn pop_pending(&self) -> Option<SlotTask> {
        let mut state = lock_unpoisoned(&self.state);
        let task = state.pending.take()?;
        state.executing = Some(task.id);
        Some(task)
    }

    /// Worker-only: clear `executing` after a body invocation returns.  A
    /// mismatched id is logged and ignored.
    pub fn finish_executing(&self, id: TaskId) {
        let mut state = lock_unpoisoned(&self.state);
        if state.executing == Some(id) {
            state.executing = None;
        } else {
            tracing::warn!(task_id = %id, "slot asked to finish a task it is not executing");
        }
    }

    /// Wake the worker so it re-checks its shutdown channel.
    pub fn wake(&self) {
        self.signal.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Drain loop run by each worker thread: park while the slot is empty,
/// execute pending bodies, exit when the worker's promise is canceled.
///
/// A panicking body is contained here: it is logged at error level and its
/// task force-canceled, and the worker keeps serving its slot.
pub fn run_worker(slot: &ThreadSlot) {
    slot.worker.notify_executing();
    tracing::info!("worker started");

    loop {
        let cancel = slot.worker.fetch_cancel_request();
        if cancel.state == RequestState::Requested {
            match cancel.source {
                RequestSource::User => slot.worker.notify_user_canceled(),
                RequestSource::Executor => slot.worker.notify_force_canceled(),
            }
            tracing::info!("worker stopped");
            return;
        }

        if let Some(task) = slot.pop_pending() {
            tracing::trace!(task_id = %task.id, "task resumed on worker");
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut work = lock_unpoisoned(&task.work);
                (*work)();
            }));
            if outcome.is_err() {
                tracing::error!(task_id = %task.id, "task body panicked; forcing cancellation");
                task.control.notify_force_canceled();
            }
            slot.finish_executing(task.id);
            continue;
        }

        // park until a push or a shutdown wake; re-check both conditions
        // after every wakeup
        let state = lock_unpoisoned(&slot.state);
        if state.pending.is_none()
            && slot.worker.fetch_cancel_request().state == RequestState::None
        {
            drop(
                slot.signal
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use lumen_task::FutureStatus;

    fn noop_task(id: u64) -> (Promise<()>, SlotTask) {
        let promise = Promise::new();
        let control = promise.control();
        let work: TaskFn = Arc::new(Mutex::new(|| {}));
        (promise, SlotTask::new(work, TaskId::new(id), control))
    }

    fn spin_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::yield_now();
        }
        false
    }

    #[test]
    fn query_tracks_the_pending_to_executing_transition() {
        let slot = ThreadSlot::new(Promise::new());
        assert!(slot.query().can_push);

        let (_promise, task) = noop_task(1);
        assert!(slot.push_task(task));

        let query = slot.query();
        assert_eq!(query.pending_task, Some(TaskId::new(1)));
        assert_eq!(query.executing_task, None);
        assert!(!query.can_push);

        let popped = slot.pop_pending().unwrap();
        let query = slot.query();
        assert_eq!(query.pending_task, None);
        assert_eq!(query.executing_task, Some(TaskId::new(1)));
        assert!(!query.can_push);

        slot.finish_executing(popped.id);
        assert!(slot.query().can_push);
    }

    #[test]
    fn occupied_slot_refuses_pushes() {
        let slot = ThreadSlot::new(Promise::new());
        let (_p1, first) = noop_task(1);
        let (_p2, second) = noop_task(2);

        assert!(slot.push_task(first));
        assert!(!slot.push_task(second));
        assert_eq!(slot.query().pending_task, Some(TaskId::new(1)));
    }

    #[test]
    fn mismatched_finish_is_ignored() {
        let slot = ThreadSlot::new(Promise::new());
        let (_promise, task) = noop_task(1);
        slot.push_task(task);
        slot.pop_pending();

        slot.finish_executing(TaskId::new(99));
        assert_eq!(slot.query().executing_task, Some(TaskId::new(1)));
    }

    #[test]
    fn worker_drains_pushed_tasks_and_shuts_down() {
        let worker_promise = Promise::new();
        let worker_future = worker_promise.future();
        let slot = Arc::new(ThreadSlot::new(worker_promise));

        let handle = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || run_worker(&slot))
        };

        let counter = Arc::new(AtomicU32::new(0));
        for id in 0..3u64 {
            let promise = Promise::new();
            let control = promise.control();
            let c = Arc::clone(&counter);
            let work: TaskFn = Arc::new(Mutex::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                promise.notify_executing();
                promise.notify_completed(());
            }));
            assert!(spin_until(Duration::from_secs(5), || slot.query().can_push));
            assert!(slot.push_task(SlotTask::new(work, TaskId::new(id), control)));
        }

        assert!(spin_until(Duration::from_secs(5), || {
            counter.load(Ordering::SeqCst) == 3 && slot.query().can_push
        }));

        worker_future.request_cancel();
        slot.wake();
        handle.join().unwrap();
        assert_eq!(worker_future.fetch_status(), FutureStatus::UserCanceled);
    }

    #[test]
    fn panicking_body_is_contained_and_force_canceled() {
        let worker_promise = Promise::new();
        let worker_future = worker_promise.future();
        let slot = Arc::new(ThreadSlot::new(worker_promise));

        let handle = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || run_worker(&slot))
        };

        let task_promise = Promise::<()>::new();
        let task_future = task_promise.future();
        let control = task_promise.control();
        let work: TaskFn = Arc::new(Mutex::new(|| panic!("boom")));
        assert!(slot.push_task(SlotTask::new(work, TaskId::new(7), control)));

        assert!(spin_until(Duration::from_secs(5), || task_future.is_done()));
        assert_eq!(task_future.fetch_status(), FutureStatus::ForceCanceled);

        // the worker survived and still serves its slot
        assert!(spin_until(Duration::from_secs(5), || slot.query().can_push));

        worker_future.request_cancel();
        slot.wake();
        handle.join().unwrap();
    }
}
