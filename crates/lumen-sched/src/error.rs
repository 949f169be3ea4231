//! Scheduler error types.
//!
//! All scheduler subsystems surface errors through [`SchedError`].  The only
//! user-visible failure points are submission (after shutdown) and scheduler
//! construction (worker spawning); nothing in the tick path returns errors or
//! panics under normal use.

/// Unified error type for the Lumen scheduler core.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The scheduler has been shut down and will not accept new work.
    #[error("scheduler is shut down")]
    Shutdown,

    /// The worker-thread factory failed while building the pool.
    #[error("failed to spawn worker thread: {source}")]
    WorkerSpawn { source: std::io::Error },
}

/// Convenience alias used throughout the scheduler crate.
pub type Result<T> = std::result::Result<T, SchedError>;
