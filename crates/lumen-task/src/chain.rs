//! Chained resumable bodies.
//!
//! A [`Chain`] is a pipeline of stages where each stage consumes the result
//! of the previous one.  The intermediate value travels through a type-erased
//! slot in the [`ChainState`], so a single chain can thread heterogeneous
//! types without allocating per-stage storage.  Between stages the chain
//! consults the request proxy exactly like the looping bodies do.

use std::any::Any;
use std::marker::PhantomData;

use crate::future::RequestProxy;
use crate::status::ServiceToken;

type BoxedValue = Box<dyn Any + Send>;
type Stage = Box<dyn FnMut(BoxedValue) -> BoxedValue + Send>;

/// Resumable state of a [`Chain`]: the next phase to run, the intermediate
/// value produced by the last finished phase, and the service token recorded
/// on an early return.
pub struct ChainState {
    next_phase: usize,
    stack: Option<BoxedValue>,
    pub service_token: Option<ServiceToken>,
}

impl ChainState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_phase: 0,
            stack: Some(Box::new(())),
            service_token: None,
        }
    }

    /// Index of the first phase that has not run yet.
    #[must_use]
    pub fn next_phase(&self) -> usize {
        self.next_phase
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}

/// A resumable pipeline producing a `T`.
///
/// Build one with [`Chain::new`] and extend it with [`Chain::then`]; the
/// builder's types guarantee every stage is fed the value the previous stage
/// produced.  A `ChainState` must only ever be driven through the chain it
/// was created for -- feeding it to a different chain is a programming error
/// and will panic on the internal downcast.
pub struct Chain<T> {
    stages: Vec<Stage>,
    _result: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Chain<T> {
    /// Single-stage chain; equivalent to the plain function.
    pub fn new<F>(mut f: F) -> Chain<T>
    where
        F: FnMut() -> T + Send + 'static,
    {
        Chain {
            stages: vec![Box::new(move |_| Box::new(f()))],
            _result: PhantomData,
        }
    }

    /// Append a stage consuming this chain's current result type.
    pub fn then<U, F>(mut self, mut f: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.stages.push(Box::new(move |input| {
            let input = input
                .downcast::<T>()
                .expect("chain stage was fed a value of the wrong type");
            Box::new(f(*input))
        }));
        Chain {
            stages: self.stages,
            _result: PhantomData,
        }
    }

    #[must_use]
    pub fn num_phases(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_complete(&self, state: &ChainState) -> bool {
        state.next_phase >= self.stages.len()
    }

    /// Run phases until completion or an observed request.
    pub fn resume(&mut self, state: &mut ChainState, proxy: &RequestProxy<'_>) {
        while state.next_phase < self.stages.len() {
            let input = state
                .stack
                .take()
                .expect("chain state is missing its intermediate value");
            state.stack = Some((self.stages[state.next_phase])(input));
            state.next_phase += 1;

            if let Some(token) = proxy.poll_service() {
                state.service_token = Some(token);
                return;
            }
        }
    }

    /// Move the final value out of a completed chain's state.
    pub fn take_result(&self, state: &mut ChainState) -> T {
        debug_assert!(self.is_complete(state));
        let value = state
            .stack
            .take()
            .expect("completed chain state is missing its result");
        *value
            .downcast::<T>()
            .expect("chain result was of the wrong type")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Promise;
    use crate::status::RequestKind;

    #[test]
    fn single_stage_chain_is_the_plain_function() {
        let promise = Promise::<()>::new();
        let mut chain = Chain::new(|| 7);
        let mut state = ChainState::new();

        chain.resume(&mut state, &promise.request_proxy());

        assert!(chain.is_complete(&state));
        assert_eq!(chain.take_result(&mut state), 7);
    }

    #[test]
    fn stages_thread_heterogeneous_values() {
        let promise = Promise::<()>::new();
        let mut chain = Chain::new(|| 2)
            .then(|x: i32| x + 1)
            .then(|x: i32| x as f32 * 2.5)
            .then(|x: f32| format!("{x}"));
        let mut state = ChainState::new();

        chain.resume(&mut state, &promise.request_proxy());

        assert!(chain.is_complete(&state));
        assert_eq!(chain.take_result(&mut state), "7.5");
    }

    #[test]
    fn suspend_checkpoints_between_phases() {
        let promise = Promise::<()>::new();
        let future = promise.future();
        future.request_suspend();

        let mut chain = Chain::new(|| 1).then(|x: i32| x + 1).then(|x: i32| x + 1);
        let mut state = ChainState::new();

        // one phase per resume while the request is standing
        chain.resume(&mut state, &promise.request_proxy());
        assert_eq!(state.next_phase(), 1);
        assert_eq!(state.service_token.take().unwrap().kind, RequestKind::Suspend);

        chain.resume(&mut state, &promise.request_proxy());
        assert_eq!(state.next_phase(), 2);

        future.request_resume();
        chain.resume(&mut state, &promise.request_proxy());
        assert!(chain.is_complete(&state));
        assert_eq!(chain.take_result(&mut state), 3);
    }
}
