//! Task-side error types.
//!
//! The task primitives surface errors through [`TaskError`], the single error
//! type returned by every fallible public API in this crate.  Scheduler-side
//! failures (submission, worker spawning) live in the scheduler crate.

/// Unified error type for the Lumen task primitives.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The future's value was read before the task reached `Completed`.
    ///
    /// This is an ordinary control-flow outcome, not a bug: callers poll a
    /// future's status and may race its completion.
    #[error("future value is not ready")]
    NotReady,
}

/// Convenience alias used throughout the task crate.
pub type Result<T> = std::result::Result<T, TaskError>;
