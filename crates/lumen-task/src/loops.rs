//! Looping resumable bodies.
//!
//! [`Loop`] and [`For`] own a user function plus a small resumable-state
//! record and expose a single `resume(state, proxy)` call.  Between
//! iterations they consult the [`RequestProxy`]; on an observed request they
//! record a [`ServiceToken`] into the state and return, leaving the state at
//! the exact point execution should continue from.  Suspension is therefore
//! cooperative and granular at the iteration boundary -- nothing here
//! requires a coroutine runtime.

use crate::future::RequestProxy;
use crate::status::ServiceToken;

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Resumable state of a [`Loop`].
#[derive(Debug, Default)]
pub struct LoopState {
    /// Set when the loop last yielded; names the request that was honored.
    pub service_token: Option<ServiceToken>,
}

/// Invokes its function forever.  A loop never completes; only a cancel
/// request terminates it, and a suspend request parks it until reselected.
pub struct Loop<F> {
    f: F,
}

impl<F: FnMut()> Loop<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Run until a cancel or suspend request is observed.
    pub fn resume(&mut self, state: &mut LoopState, proxy: &RequestProxy<'_>) {
        loop {
            (self.f)();

            if let Some(token) = proxy.poll_service() {
                state.service_token = Some(token);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// For
// ---------------------------------------------------------------------------

/// Resumable state of a [`For`].
#[derive(Debug, Default)]
pub struct ForState {
    /// First index that has not been executed yet.
    pub next: i64,
    /// Set when the loop last yielded; names the request that was honored.
    pub service_token: Option<ServiceToken>,
}

impl ForState {
    #[must_use]
    pub fn starting_at(begin: i64) -> Self {
        Self {
            next: begin,
            service_token: None,
        }
    }
}

/// Invokes its function for every index in `[begin, end)`, checkpointing
/// after each iteration.  Completes once `state.next` reaches `end`; an
/// empty range completes without ever calling the function.
pub struct For<F> {
    begin: i64,
    end: i64,
    f: F,
}

impl<F: FnMut(i64)> For<F> {
    pub fn new(begin: i64, end: i64, f: F) -> Self {
        Self { begin, end, f }
    }

    /// State positioned at this loop's first index.
    #[must_use]
    pub fn start_state(&self) -> ForState {
        ForState::starting_at(self.begin)
    }

    #[must_use]
    pub fn is_complete(&self, state: &ForState) -> bool {
        state.next >= self.end
    }

    /// Run from `state.next` until completion or an observed request.  On a
    /// request, `state.next` is left at the first unexecuted index.
    pub fn resume(&mut self, state: &mut ForState, proxy: &RequestProxy<'_>) {
        while state.next < self.end {
            (self.f)(state.next);
            state.next += 1;

            if let Some(token) = proxy.poll_service() {
                state.service_token = Some(token);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
