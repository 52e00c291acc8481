//! Combinators over groups of futures.
//!
//! - [`when_all`] / [`wait_all`]: every input terminal, values in input order
//! - [`when_any`] / [`wait_any`]: first terminal input, by index
//! - [`when_all2`]: heterogeneous pair
//!
//! None of these cancel anything. `when_any` resolves as soon as one input is
//! terminal and leaves the others running; the resolved [`WhenAnyResult`]
//! hands the inputs back so the caller can keep observing them.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{make_error_future, make_ready_future, Promise, SharedFuture};
use crate::error::{Error, Result};

struct AllState<T: Send + Sync + 'static> {
    slots: Vec<Option<Result<T>>>,
    remaining: usize,
    promise: Option<Promise<Vec<T>>>,
}

/// Resolves once every input is terminal.
///
/// Values are aggregated positionally. If any input failed, the result fails
/// with the failure of the lowest-indexed failed input; that is decided only
/// after all inputs are terminal, never on the first failure to arrive.
pub fn when_all<T, I>(futures: I) -> SharedFuture<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = SharedFuture<T>>,
{
    let futures: Vec<_> = futures.into_iter().collect();
    if futures.is_empty() {
        return make_ready_future(Vec::new());
    }

    let promise = Promise::new();
    let output = promise.future();
    let state = Arc::new(Mutex::new(AllState {
        slots: (0..futures.len()).map(|_| None).collect(),
        remaining: futures.len(),
        promise: Some(promise),
    }));

    for (index, future) in futures.iter().enumerate() {
        let state = Arc::clone(&state);
        future.on_complete(move |outcome| {
            let finished = {
                let mut state = state.lock();
                state.slots[index] = Some(outcome.clone());
                state.remaining -= 1;
                if state.remaining == 0 {
                    let slots = std::mem::take(&mut state.slots);
                    state.promise.take().map(|promise| (promise, slots))
                } else {
                    None
                }
            };
            if let Some((promise, slots)) = finished {
                let aggregated = slots
                    .into_iter()
                    .map(|slot| slot.unwrap_or_else(|| Err(Error::internal("missing slot"))))
                    .collect::<Result<Vec<T>>>();
                let _ = promise.set_result(aggregated);
            }
        });
    }
    output
}

/// Blocks until every input is terminal.
pub fn wait_all<T: Send + Sync + 'static>(futures: &[SharedFuture<T>]) {
    for future in futures {
        future.wait();
    }
}

/// Result of [`when_any`]: the index of the first terminal input plus all
/// inputs, untouched.
#[derive(Debug)]
pub struct WhenAnyResult<T: Send + Sync + 'static> {
    /// Position of the first input observed terminal.
    pub index: usize,
    /// The inputs, in their original order.
    pub futures: Vec<SharedFuture<T>>,
}

// Cloning only clones handles, so `T: Clone` is not needed.
impl<T: Send + Sync + 'static> Clone for WhenAnyResult<T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            futures: self.futures.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> WhenAnyResult<T> {
    /// Reads the outcome of the input that resolved first.
    #[must_use]
    pub fn winner(&self) -> Option<Result<T>> {
        self.futures.get(self.index).and_then(SharedFuture::try_get)
    }
}

struct AnyState<T: Send + Sync + 'static> {
    promise: Option<Promise<WhenAnyResult<T>>>,
    futures: Vec<SharedFuture<T>>,
}

/// Resolves on the first terminal input with its index.
///
/// An empty input fails with [`ErrorKind::InvalidArgument`](crate::error::ErrorKind::InvalidArgument).
pub fn when_any<T, I>(futures: I) -> SharedFuture<WhenAnyResult<T>>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = SharedFuture<T>>,
{
    let futures: Vec<_> = futures.into_iter().collect();
    if futures.is_empty() {
        return make_error_future(Error::invalid_argument("when_any over no futures"));
    }

    let promise = Promise::new();
    let output = promise.future();
    let state = Arc::new(Mutex::new(AnyState {
        promise: Some(promise),
        futures: futures.clone(),
    }));

    for (index, future) in futures.iter().enumerate() {
        let state = Arc::clone(&state);
        future.on_complete(move |_| {
            let won = {
                let mut state = state.lock();
                state
                    .promise
                    .take()
                    .map(|promise| (promise, std::mem::take(&mut state.futures)))
            };
            if let Some((promise, futures)) = won {
                let _ = promise.set_value(WhenAnyResult { index, futures });
            }
        });
    }
    output
}

/// Blocks until one input is terminal and returns its index.
pub fn wait_any<T: Send + Sync + 'static>(futures: &[SharedFuture<T>]) -> Result<usize> {
    when_any(futures.iter().cloned())
        .get()
        .map(|result| result.index)
}

struct PairState<A: Send + Sync + 'static, B: Send + Sync + 'static> {
    first: Option<Result<A>>,
    second: Option<Result<B>>,
    promise: Option<Promise<(A, B)>>,
}

impl<A, B> PairState<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn take_if_complete(&mut self) -> Option<(Promise<(A, B)>, Result<(A, B)>)> {
        if self.first.is_none() || self.second.is_none() {
            return None;
        }
        let promise = self.promise.take()?;
        let first = self.first.take()?;
        let second = self.second.take()?;
        Some((promise, first.and_then(|a| second.map(|b| (a, b)))))
    }
}

/// Resolves once both inputs are terminal; the first input's failure wins.
pub fn when_all2<A, B>(first: &SharedFuture<A>, second: &SharedFuture<B>) -> SharedFuture<(A, B)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    let promise = Promise::new();
    let output = promise.future();
    let state = Arc::new(Mutex::new(PairState {
        first: None,
        second: None,
        promise: Some(promise),
    }));

    let first_state = Arc::clone(&state);
    first.on_complete(move |outcome| {
        let done = {
            let mut state = first_state.lock();
            state.first = Some(outcome.clone());
            state.take_if_complete()
        };
        if let Some((promise, result)) = done {
            let _ = promise.set_result(result);
        }
    });
    second.on_complete(move |outcome| {
        let done = {
            let mut state = state.lock();
            state.second = Some(outcome.clone());
            state.take_if_complete()
        };
        if let Some((promise, result)) = done {
            let _ = promise.set_result(result);
        }
    });
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::future::promise;
    use crate::test_utils::init_test_logging;

    #[test]
    fn when_all_waits_for_every_input() {
        init_test_logging();
        let (p0, f0) = promise::<u32>();
        let (p1, f1) = promise::<u32>();
        let (p2, f2) = promise::<u32>();
        let all = when_all(vec![f0, f1, f2]);

        p1.set_error(Error::user("second failed")).expect("fail");
        assert!(!all.is_ready(), "must not resolve on the first failure");
        p2.set_value(2).expect("complete");
        assert!(!all.is_ready());
        p0.set_error(Error::new(ErrorKind::ReplyTimeout)).expect("fail");

        let err = all.get().expect_err("aggregated failure");
        assert_eq!(err.kind(), ErrorKind::ReplyTimeout, "lowest index wins");
    }

    #[test]
    fn when_all_aggregates_in_input_order() {
        init_test_logging();
        let (pa, fa) = promise::<&'static str>();
        let (pb, fb) = promise::<&'static str>();
        let all = when_all([fa, fb]);
        pb.set_value("b").expect("complete");
        pa.set_value("a").expect("complete");
        assert_eq!(all.get().expect("values"), vec!["a", "b"]);

        let empty = when_all(Vec::<SharedFuture<u8>>::new());
        assert!(empty.get().expect("empty").is_empty());
    }

    #[test]
    fn when_any_reports_first_index_without_cancelling() {
        init_test_logging();
        let (p0, f0) = promise::<u32>();
        let (p1, f1) = promise::<u32>();
        let any = when_any(vec![f0.clone(), f1.clone()]);
        p1.set_value(11).expect("complete");

        let result = any.get().expect("any");
        assert_eq!(result.index, 1);
        assert_eq!(result.winner().expect("winner").expect("value"), 11);
        assert!(!f0.is_ready());

        p0.set_value(10).expect("still completable");
        assert_eq!(result.futures[0].get().expect("value"), 10);
    }

    #[test]
    fn when_any_over_nothing_is_invalid() {
        init_test_logging();
        let err = when_any(Vec::<SharedFuture<u8>>::new())
            .get()
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            wait_any::<u8>(&[]).expect_err("invalid").kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn wait_all_and_wait_any_block() {
        init_test_logging();
        let (p0, f0) = promise::<u32>();
        let (p1, f1) = promise::<u32>();
        let futures = vec![f0, f1];
        let producer = std::thread::spawn(move || {
            p1.set_value(1).expect("complete");
            p0.set_value(0).expect("complete");
        });
        wait_all(&futures);
        assert!(futures.iter().all(SharedFuture::is_ready));
        let index = wait_any(&futures).expect("index");
        assert!(index < 2);
        producer.join().expect("producer");
    }

    #[test]
    fn when_all2_pairs_heterogeneous_values() {
        init_test_logging();
        let (pa, fa) = promise::<u32>();
        let (pb, fb) = promise::<String>();
        let both = when_all2(&fa, &fb);
        pb.set_value("x".into()).expect("complete");
        assert!(!both.is_ready());
        pa.set_value(3).expect("complete");
        assert_eq!(both.get().expect("pair"), (3, "x".to_string()));

        let failed = when_all2(
            &make_error_future::<u32>(Error::user("left")),
            &make_error_future::<u32>(Error::new(ErrorKind::Remote)),
        );
        assert_eq!(failed.get().expect_err("left wins").kind(), ErrorKind::User);
    }
}
