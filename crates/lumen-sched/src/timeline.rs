//! The schedule timeline.
//!
//! The timeline owns every live task record and is driven by
//! [`ScheduleTimeline::tick`].  One tick:
//!
//! 1. Snapshots each slot's occupancy into a capture vector.
//! 2. Updates records: finalizes requested cancellations, re-stamps the
//!    preemption timepoint of entries observed transitioning into
//!    `ForceSuspended`, and drops entries that reached a done state.
//! 3. Sorts the ready entries by starvation (oldest preemption timepoint
//!    first) and selects a *starvation window*: the span of timepoints,
//!    in `STARVATION_PERIOD` increments, just wide enough to cover the
//!    available slots.  Priority then acts only *inside* the window, so the
//!    most-starved tasks are always eligible while high-priority work still
//!    wins whenever it shares the window.
//! 4. Issues force-suspend requests to the evicted and pushes the selected
//!    onto free slots, clearing any standing force-suspension first.
//!
//! Evicted tasks suspend at their next checkpoint; the lag between request
//! and acknowledgment is expected, and the next tick observes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lumen_task::{FutureStatus, RequestSource, RequestState, TaskControl, TaskId, TaskPriority};

use crate::slot::{SlotQuery, SlotTask, TaskFn, ThreadSlot};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

struct Entry {
    work: TaskFn,
    id: TaskId,
    name: String,
    priority: TaskPriority,
    control: TaskControl,
    /// The moment this entry last became ready-to-run after a forced
    /// suspension, or the moment it entered the timeline.
    last_preempt_at: Instant,
    last_status: FutureStatus,
    last_cancel: RequestState,
    /// Computed per tick: user-suspended entries stay out of selection
    /// until the user withdraws the suspend request.
    ready: bool,
}

impl Entry {
    fn compute_ready(&self) -> bool {
        self.last_status != FutureStatus::UserSuspended
            || !self.control.suspend_requested_by_user()
    }
}

// ---------------------------------------------------------------------------
// ScheduleTimeline
// ---------------------------------------------------------------------------

/// Starvation-aware task selection over a fixed set of slots.
pub struct ScheduleTimeline {
    entries: Vec<Entry>,
    slot_capture: Vec<SlotQuery>,
}

impl ScheduleTimeline {
    /// Nominal period between scheduler interrupts (ticks).
    pub const INTERRUPT_PERIOD: Duration = Duration::from_millis(16);
    /// How many interrupt periods make one starvation window span.
    pub const STARVATION_FACTOR: u32 = 4;
    /// Base width of the starvation window.
    pub const STARVATION_PERIOD: Duration =
        Duration::from_millis(16 * Self::STARVATION_FACTOR as u64);

    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            slot_capture: Vec::new(),
        }
    }

    /// Add a ready task.  `now` becomes its initial preemption timepoint.
    pub fn add_task(
        &mut self,
        work: TaskFn,
        id: TaskId,
        name: String,
        priority: TaskPriority,
        control: TaskControl,
        now: Instant,
    ) {
        tracing::debug!(task_id = %id, task_name = %name, ?priority, "task entered the timeline");
        self.entries.push(Entry {
            work,
            id,
            name,
            priority,
            control,
            last_preempt_at: now,
            last_status: FutureStatus::Scheduled,
            last_cancel: RequestState::None,
            ready: true,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of slot queries captured by the last tick.
    #[must_use]
    pub fn captured_slots(&self) -> usize {
        self.slot_capture.len()
    }

    /// Shutdown sweep: ask every live task to cancel.
    pub fn request_force_cancel_all(&self) {
        for entry in &self.entries {
            entry.control.request_force_cancel();
        }
    }

    /// One scheduling cycle against `slots` at monotonic time `now`.
    pub fn tick(&mut self, slots: &[Arc<ThreadSlot>], now: Instant) {
        let num_slots = slots.len();
        self.slot_capture.clear();
        self.slot_capture.extend(slots.iter().map(|slot| slot.query()));

        self.update_records(now);

        if self.entries.is_empty() {
            return;
        }

        let num_selected = self.select_for_slots(num_slots);
        let ready_end = self.entries.partition_point(|entry| entry.ready);

        // Evicted ready tasks get a force-suspend request, skipped when the
        // last observed status already shows the suspension landed.  No
        // acknowledgment wait: the task yields at its next checkpoint and
        // the next tick sees it.
        for entry in &self.entries[num_selected..ready_end] {
            if entry.last_status != FutureStatus::ForceSuspended {
                tracing::trace!(task_id = %entry.id, "force-suspend requested");
                entry.control.request_force_suspend();
            }
        }

        // Push the selected tasks onto free slots, lowest index first.  A
        // task already pending or executing on some slot keeps it.  The
        // capture bounds the pushes: tasks that find no free slot this tick
        // wait for the next.
        let mut next_slot = 0usize;
        for entry in &self.entries[..num_selected] {
            let has_slot = self.slot_capture.iter().any(|query| {
                query.pending_task == Some(entry.id) || query.executing_task == Some(entry.id)
            });
            if has_slot {
                continue;
            }

            while next_slot < num_slots {
                if self.slot_capture[next_slot].can_push {
                    entry.control.clear_force_suspension_request();
                    slots[next_slot].push_task(SlotTask::new(
                        entry.work.clone(),
                        entry.id,
                        entry.control.clone(),
                    ));
                    tracing::trace!(task_id = %entry.id, slot = next_slot, "task assigned to slot");
                    next_slot += 1;
                    break;
                }
                next_slot += 1;
            }
        }
    }

    /// Step 1: refresh every record from its promise and drop finished tasks.
    fn update_records(&mut self, now: Instant) {
        for entry in &mut self.entries {
            let cancel = entry.control.fetch_cancel_request();
            let newly_requested = cancel.state == RequestState::Requested
                && entry.last_cancel != RequestState::Requested;
            entry.last_cancel = cancel.state;
            if newly_requested {
                // The task may well still be running; finalizing here only
                // removes it from future scheduling.  Whichever side writes
                // the terminal state first wins, the other write is dropped.
                match cancel.source {
                    RequestSource::Executor => entry.control.notify_force_canceled(),
                    RequestSource::User => entry.control.notify_user_canceled(),
                }
            }

            let status = entry.control.fetch_status();
            if entry.last_status != FutureStatus::ForceSuspended
                && status == FutureStatus::ForceSuspended
            {
                // observed transition into ForceSuspended: the entry becomes
                // ready-to-run again as of now
                entry.last_preempt_at = now;
            }
            entry.last_status = status;
            entry.ready = entry.compute_ready();
        }

        self.entries.retain(|entry| {
            let done = entry.last_status.is_done();
            if done {
                tracing::debug!(
                    task_id = %entry.id,
                    task_name = %entry.name,
                    status = ?entry.last_status,
                    "task left the timeline"
                );
            }
            !done
        });
    }

    /// Steps 2-4: sort, pick the starvation window, order it by priority.
    /// Returns how many leading entries are selected.
    fn select_for_slots(&mut self, num_slots: usize) -> usize {
        // ready entries first, most starved first; every sort here is stable
        // so equal timepoints keep submission order across ticks
        self.entries
            .sort_by_key(|entry| (!entry.ready, entry.last_preempt_at));
        let ready_count = self.entries.partition_point(|entry| entry.ready);
        if ready_count == 0 {
            return 0;
        }

        let target = num_slots.min(ready_count);
        let anchor = self.entries[0].last_preempt_at;
        let mut span = Self::STARVATION_PERIOD;
        let mut window = 0usize;

        for index in 0..ready_count {
            let starved_gap = self.entries[index]
                .last_preempt_at
                .saturating_duration_since(anchor);
            if starved_gap <= span {
                window = index + 1;
            } else if window < target {
                // not enough tasks inside the window to cover the slots;
                // widen it until this entry fits
                while starved_gap > span {
                    span += Self::STARVATION_PERIOD;
                }
                window = index + 1;
            } else {
                break;
            }
        }

        // highest priority first inside the window; stable, so starvation
        // order breaks priority ties
        self.entries[..window].sort_by(|a, b| b.priority.cmp(&a.priority));

        num_slots.min(window)
    }
}

impl Default for ScheduleTimeline {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
