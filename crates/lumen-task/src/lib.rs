//! Lumen task primitives.
//!
//! The building blocks the Lumen scheduler core rests on:
//!
//! - **[`future`]** -- shared future/promise cell with independent
//!   cancellation and suspension request channels for the user and the
//!   executor, plus the type-erased handles the scheduler and the await
//!   combinators consume.
//! - **[`loops`]** / **[`chain`]** -- resumable task bodies (`Loop`, `For`,
//!   `Chain`) that checkpoint between user-function invocations and yield
//!   with a recorded [`ServiceToken`] when a request is observed.
//! - **[`status`]** -- the task lifecycle DAG and request snapshot types.
//! - **[`task`]** -- task identity and priority.
//! - **[`error`]** -- task-side error types via [`thiserror`].
//!
//! All handles are `Send + Sync` and safe to poll from any thread; state
//! progress in the bodies is explicit, so no coroutine runtime is involved.

pub mod chain;
pub mod error;
pub mod future;
pub mod loops;
pub mod status;
pub mod task;

// Re-export the most commonly used types at the crate root for convenience.
pub use chain::{Chain, ChainState};
pub use error::{Result, TaskError};
pub use future::{AnyFuture, Future, Promise, RequestProxy, TaskControl};
pub use loops::{For, ForState, Loop, LoopState};
pub use status::{
    CancelRequest, FutureStatus, RequestKind, RequestSource, RequestState, ServiceToken,
    SuspendRequest,
};
pub use task::{TaskId, TaskPriority};
