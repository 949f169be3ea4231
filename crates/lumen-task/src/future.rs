//! Shared future/promise state.
//!
//! Every scheduled task is backed by one heap-allocated cell holding three
//! independently atomic pieces: the task's [`FutureStatus`], a cancel request
//! channel, and a suspend request channel.  Each request channel has two
//! sources -- the *user* (writing through [`Future`]) and the *executor*
//! (writing through the promise or its [`TaskControl`]).  The cell is shared
//! by cheap `Arc` handles:
//!
//! - [`Promise`] -- the unique producer side.  It publishes terminal states
//!   and observes user requests; at most one promise exists per cell.
//! - [`Future`] -- the cloneable consumer side.  It reads status, borrows or
//!   clones the completed value, and raises user requests.
//! - [`TaskControl`] -- a type-erased scheduler-side handle derived from the
//!   promise; the timeline holds these so it can finalize, force-suspend and
//!   force-cancel tasks without knowing their result types.
//! - [`AnyFuture`] -- a type-erased readiness view used by await combinators.
//! - [`RequestProxy`] -- a borrow handed to resumable task bodies, exposing
//!   only the combined request snapshots.
//!
//! Status stores use release/acquire ordering, so a `Completed` observed on
//! one thread guarantees the value written on another is visible.  Terminal
//! states are sticky; a redundant or racing notification is silently dropped.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, TaskError};
use crate::status::{
    CancelRequest, FutureStatus, RequestKind, RequestSource, RequestState, ServiceToken,
    SuspendRequest,
};

// ---------------------------------------------------------------------------
// Shared cell
// ---------------------------------------------------------------------------

/// The request/status half of the cell; independent of the value type, which
/// is what makes the type-erased handles possible.
struct Channels {
    status: AtomicU8,
    user_cancel: AtomicBool,
    exec_cancel: AtomicBool,
    user_suspend: AtomicBool,
    exec_suspend: AtomicBool,
}

impl Channels {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(FutureStatus::Scheduled as u8),
            user_cancel: AtomicBool::new(false),
            exec_cancel: AtomicBool::new(false),
            user_suspend: AtomicBool::new(false),
            exec_suspend: AtomicBool::new(false),
        }
    }

    fn fetch_status(&self) -> FutureStatus {
        FutureStatus::from_bits(self.status.load(Ordering::Acquire))
    }

    /// Attempt a status transition.  Returns whether the store happened;
    /// illegal transitions (most importantly, anything out of a done state)
    /// are dropped without effect.
    fn transition(&self, to: FutureStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let from = FutureStatus::from_bits(current);
            if !from.can_transition_to(to) {
                tracing::trace!(?from, ?to, "status transition dropped");
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!(?from, ?to, "status transition");
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn fetch_cancel_request(&self) -> CancelRequest {
        if self.exec_cancel.load(Ordering::Acquire) {
            CancelRequest {
                state: RequestState::Requested,
                source: RequestSource::Executor,
            }
        } else if self.user_cancel.load(Ordering::Acquire) {
            CancelRequest {
                state: RequestState::Requested,
                source: RequestSource::User,
            }
        } else {
            CancelRequest {
                state: RequestState::None,
                source: RequestSource::User,
            }
        }
    }

    fn fetch_suspend_request(&self) -> SuspendRequest {
        if self.exec_suspend.load(Ordering::Acquire) {
            SuspendRequest {
                state: RequestState::Requested,
                source: RequestSource::Executor,
            }
        } else if self.user_suspend.load(Ordering::Acquire) {
            SuspendRequest {
                state: RequestState::Requested,
                source: RequestSource::User,
            }
        } else {
            SuspendRequest {
                state: RequestState::None,
                source: RequestSource::User,
            }
        }
    }
}

/// Full cell: channels plus the once-written completion value.
struct SharedState<T> {
    channels: Channels,
    value: Mutex<Option<T>>,
}

/// Type-erased access to the channel half of a cell.
trait SharedChannels: Send + Sync {
    fn channels(&self) -> &Channels;
}

impl<T: Send + 'static> SharedChannels for SharedState<T> {
    fn channels(&self) -> &Channels {
        &self.channels
    }
}

/// A poisoned value mutex only means a reader panicked mid-clone; the cell
/// itself is still coherent, so recover the guard.
fn lock_value<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

/// Producer side of a task's shared state.
///
/// The promise has the exclusive right to publish terminal states and to
/// write the executor-side request channels.  It is deliberately not
/// `Clone`; scheduler components that need shared write access take a
/// [`TaskControl`] instead.
pub struct Promise<T> {
    shared: Arc<SharedState<T>>,
}

impl<T> Promise<T> {
    /// Create a fresh cell in the `Scheduled` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedState {
                channels: Channels::new(),
                value: Mutex::new(None),
            }),
        }
    }

    /// Another consumer handle over the same cell.
    #[must_use]
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Borrow the request channels for a resumable body.
    #[must_use]
    pub fn request_proxy(&self) -> RequestProxy<'_> {
        RequestProxy {
            channels: &self.shared.channels,
        }
    }

    // -- Status notifications ------------------------------------------------

    pub fn notify_scheduled(&self) {
        self.shared.channels.transition(FutureStatus::Scheduled);
    }

    pub fn notify_executing(&self) {
        self.shared.channels.transition(FutureStatus::Executing);
    }

    /// Store the value and mark the task `Completed`.  If the task already
    /// reached a terminal state (for instance a cancel raced in), the value
    /// is discarded and nothing changes.
    pub fn notify_completed(&self, value: T) {
        let mut slot = lock_value(&self.shared.value);
        *slot = Some(value);
        if !self.shared.channels.transition(FutureStatus::Completed) {
            // lost the race to a terminal state; the value must never
            // become observable
            *slot = None;
        }
    }

    pub fn notify_user_canceled(&self) {
        self.shared.channels.transition(FutureStatus::UserCanceled);
    }

    pub fn notify_force_canceled(&self) {
        self.shared.channels.transition(FutureStatus::ForceCanceled);
    }

    pub fn notify_user_suspended(&self) {
        self.shared.channels.transition(FutureStatus::UserSuspended);
    }

    pub fn notify_force_suspended(&self) {
        self.shared.channels.transition(FutureStatus::ForceSuspended);
    }

    // -- Executor request channels -------------------------------------------

    pub fn request_force_suspend(&self) {
        self.shared.channels.exec_suspend.store(true, Ordering::Release);
    }

    /// Only the executor clears its own suspend requests; the user channel
    /// is untouched.
    pub fn clear_force_suspension_request(&self) {
        self.shared.channels.exec_suspend.store(false, Ordering::Release);
    }

    pub fn request_force_cancel(&self) {
        self.shared.channels.exec_cancel.store(true, Ordering::Release);
    }

    // -- Reads ---------------------------------------------------------------

    #[must_use]
    pub fn fetch_status(&self) -> FutureStatus {
        self.shared.channels.fetch_status()
    }

    #[must_use]
    pub fn fetch_cancel_request(&self) -> CancelRequest {
        self.shared.channels.fetch_cancel_request()
    }

    #[must_use]
    pub fn fetch_suspend_request(&self) -> SuspendRequest {
        self.shared.channels.fetch_suspend_request()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Type-erased scheduler-side handle over this promise's cell.
    #[must_use]
    pub fn control(&self) -> TaskControl {
        let shared: Arc<dyn SharedChannels> = self.shared.clone();
        TaskControl { shared }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Future
// ---------------------------------------------------------------------------

/// Consumer side of a task's shared state.
///
/// Futures are cheap to clone (one atomic refcount bump) and safe to poll
/// from any thread.  The user-origin request channels are written here and
/// nowhere else.
pub struct Future<T> {
    shared: Arc<SharedState<T>>,
}

impl<T> Future<T> {
    #[must_use]
    pub fn fetch_status(&self) -> FutureStatus {
        self.shared.channels.fetch_status()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.fetch_status().is_done()
    }

    /// Run `f` over a borrow of the completed value.
    ///
    /// Fails with [`TaskError::NotReady`] unless the task has reached
    /// `Completed`.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        if self.fetch_status() != FutureStatus::Completed {
            return Err(TaskError::NotReady);
        }
        let slot = lock_value(&self.shared.value);
        match slot.as_ref() {
            Some(value) => Ok(f(value)),
            None => Err(TaskError::NotReady),
        }
    }

    /// Ask the task to cancel.  The request is observed at the body's next
    /// checkpoint; it cannot interrupt running code.
    pub fn request_cancel(&self) {
        self.shared.channels.user_cancel.store(true, Ordering::Release);
    }

    /// Ask the task to suspend at its next checkpoint.
    pub fn request_suspend(&self) {
        self.shared.channels.user_suspend.store(true, Ordering::Release);
    }

    /// Withdraw a previous [`request_suspend`](Self::request_suspend),
    /// making the task eligible for selection again.
    pub fn request_resume(&self) {
        self.shared.channels.user_suspend.store(false, Ordering::Release);
    }
}

impl<T: Clone> Future<T> {
    /// Clone the completed value out of the cell.
    pub fn value(&self) -> Result<T> {
        self.with_value(T::clone)
    }
}

impl<T: Send + 'static> Future<T> {
    /// Type-erased readiness view, for await combinators.
    #[must_use]
    pub fn as_any(&self) -> AnyFuture {
        let shared: Arc<dyn SharedChannels> = self.shared.clone();
        AnyFuture { shared }
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// ---------------------------------------------------------------------------
// Type-erased handles
// ---------------------------------------------------------------------------

/// A future with its value type erased: status reads and user cancellation
/// only.  Await combinators hold these to express readiness over
/// heterogeneous dependency sets.
#[derive(Clone)]
pub struct AnyFuture {
    shared: Arc<dyn SharedChannels>,
}

impl AnyFuture {
    #[must_use]
    pub fn fetch_status(&self) -> FutureStatus {
        self.shared.channels().fetch_status()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.fetch_status().is_done()
    }

    pub fn request_cancel(&self) {
        self.shared.channels().user_cancel.store(true, Ordering::Release);
    }
}

/// The scheduler's share of a promise: everything the timeline needs to
/// finalize, evict and resurrect a task, minus the ability to complete it
/// with a value.  Deriving it from the promise keeps the one-promise-per-cell
/// invariant intact.
#[derive(Clone)]
pub struct TaskControl {
    shared: Arc<dyn SharedChannels>,
}

impl TaskControl {
    #[must_use]
    pub fn fetch_status(&self) -> FutureStatus {
        self.shared.channels().fetch_status()
    }

    #[must_use]
    pub fn fetch_cancel_request(&self) -> CancelRequest {
        self.shared.channels().fetch_cancel_request()
    }

    #[must_use]
    pub fn fetch_suspend_request(&self) -> SuspendRequest {
        self.shared.channels().fetch_suspend_request()
    }

    /// Whether the user channel (specifically, not the executor's) is asking
    /// for suspension.  The timeline uses this to keep user-suspended tasks
    /// out of selection until the user resumes them.
    #[must_use]
    pub fn suspend_requested_by_user(&self) -> bool {
        self.shared.channels().user_suspend.load(Ordering::Acquire)
    }

    pub fn notify_user_canceled(&self) {
        self.shared.channels().transition(FutureStatus::UserCanceled);
    }

    pub fn notify_force_canceled(&self) {
        self.shared.channels().transition(FutureStatus::ForceCanceled);
    }

    pub fn request_force_suspend(&self) {
        self.shared.channels().exec_suspend.store(true, Ordering::Release);
    }

    pub fn clear_force_suspension_request(&self) {
        self.shared.channels().exec_suspend.store(false, Ordering::Release);
    }

    pub fn request_force_cancel(&self) {
        self.shared.channels().exec_cancel.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Request proxy
// ---------------------------------------------------------------------------

/// Read-only view of the request channels, handed to resumable task bodies.
///
/// The snapshots combine both sources; the body does not care who asked,
/// only that someone did.  Honoring a request means returning control to the
/// combinator driver with a [`ServiceToken`] recorded.
pub struct RequestProxy<'p> {
    channels: &'p Channels,
}

impl RequestProxy<'_> {
    #[must_use]
    pub fn fetch_cancel_request(&self) -> CancelRequest {
        self.channels.fetch_cancel_request()
    }

    #[must_use]
    pub fn fetch_suspend_request(&self) -> SuspendRequest {
        self.channels.fetch_suspend_request()
    }

    /// Checkpoint poll: cancel outranks suspend, matching the combinators'
    /// shared servicing order.
    #[must_use]
    pub fn poll_service(&self) -> Option<ServiceToken> {
        let cancel = self.fetch_cancel_request();
        if cancel.state == RequestState::Requested {
            return Some(ServiceToken {
                source: cancel.source,
                kind: RequestKind::Cancel,
            });
        }
        let suspend = self.fetch_suspend_request();
        if suspend.state == RequestState::Requested {
            return Some(ServiceToken {
                source: suspend.source,
                kind: RequestKind::Suspend,
            });
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
