//! Task lifecycle states and request channels.
//!
//! A task's observable life is a small DAG:
//!
//! ```text
//! Scheduled --> Executing --> Completed
//!                        \--> UserCanceled / ForceCanceled
//!                        \--> UserSuspended / ForceSuspended --> Executing
//! ```
//!
//! `Completed` and the two canceled states are sticky; the suspended states
//! cycle back to `Executing` when the task is resumed.  Alongside the status,
//! every task carries two *request* channels -- cancel and suspend -- each of
//! which can be raised by the user (through the future) or by the executor
//! (through the scheduler).  Requests are advisory: the task body observes
//! them at its checkpoints and yields; nothing interrupts running code.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Terminal-state machine of a scheduled task, as observed through its
/// future or promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FutureStatus {
    /// Submitted, not yet picked up by a worker.
    Scheduled = 0,
    /// Currently executing (or resumed and runnable) on a worker.
    Executing = 1,
    /// Finished successfully; the value is available.
    Completed = 2,
    /// Canceled on the user's request.
    UserCanceled = 3,
    /// Canceled by the executor (shutdown).
    ForceCanceled = 4,
    /// Suspended on the user's request; only the user can resume it.
    UserSuspended = 5,
    /// Suspended by the scheduler to free its slot; resumed by selection.
    ForceSuspended = 6,
}

impl FutureStatus {
    /// `true` once the task has reached a sticky terminal state.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(
            self,
            FutureStatus::Completed | FutureStatus::UserCanceled | FutureStatus::ForceCanceled
        )
    }

    /// `true` while the task is parked in either suspended state.
    #[must_use]
    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            FutureStatus::UserSuspended | FutureStatus::ForceSuspended
        )
    }

    pub(crate) fn from_bits(bits: u8) -> FutureStatus {
        match bits {
            0 => FutureStatus::Scheduled,
            1 => FutureStatus::Executing,
            2 => FutureStatus::Completed,
            3 => FutureStatus::UserCanceled,
            4 => FutureStatus::ForceCanceled,
            5 => FutureStatus::UserSuspended,
            _ => FutureStatus::ForceSuspended,
        }
    }

    /// Legality table for status stores.  Illegal transitions are dropped
    /// silently by the shared cell, which is what makes redundant terminal
    /// notifications harmless under concurrent writers.
    pub(crate) fn can_transition_to(self, to: FutureStatus) -> bool {
        match to {
            FutureStatus::Scheduled => matches!(self, FutureStatus::Scheduled),
            FutureStatus::Executing => matches!(
                self,
                FutureStatus::Scheduled
                    | FutureStatus::Executing
                    | FutureStatus::UserSuspended
                    | FutureStatus::ForceSuspended
            ),
            FutureStatus::Completed
            | FutureStatus::UserCanceled
            | FutureStatus::ForceCanceled => !self.is_done(),
            FutureStatus::UserSuspended | FutureStatus::ForceSuspended => {
                matches!(self, FutureStatus::Executing)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Whether a request channel has been raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// No one has asked for anything.
    None,
    /// The request is standing and will be observed at the next checkpoint.
    Requested,
}

/// Who raised a request.
///
/// The task body reacts to either source the same way; the side that raised
/// the request determines which terminal state the promise is moved to
/// (`User*` vs `Force*`), which is how shutdown-initiated cancellation stays
/// distinguishable from a user's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestSource {
    User,
    Executor,
}

/// What was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Cancel,
    Suspend,
}

/// Snapshot of the cancel channels.  When both sources have asked, the
/// executor wins: shutdown outranks a user request for the same outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub state: RequestState,
    pub source: RequestSource,
}

/// Snapshot of the suspend channels, same shape and precedence as
/// [`CancelRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendRequest {
    pub state: RequestState,
    pub source: RequestSource,
}

/// The record a resumable body stores when it returns early: which side
/// asked, and for what.  The scheduling glue maps it onto the matching
/// `notify_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceToken {
    pub source: RequestSource,
    pub kind: RequestKind,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
