//! Aggregation over collections of futures.
//!
//! Cancelling an aggregate cancels every child still pending. Cancelling a
//! single child does not touch its siblings.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::Error;
use crate::Future;
use crate::Promise;
use crate::promise;

/// Wait for every future to fulfill.
///
/// Values keep the input order regardless of completion order. The first
/// rejection to settle rejects the aggregate; the remaining children still
/// run to completion, but their outcomes are discarded. An empty input
/// fulfills right away with an empty list.
pub fn all<T, I>(futures: I) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let children: Vec<Future<T>> = futures.into_iter().collect();
    let (promise, aggregate) = promise();
    if children.is_empty() {
        _ = promise.fulfill(Vec::new());
        return aggregate;
    }

    cancel_children_with(&aggregate, &children);
    let state = Arc::new(AllState {
        slots: Mutex::new(vec![None; children.len()]),
        remaining: AtomicUsize::new(children.len()),
        failed: AtomicBool::new(false),
        promise,
    });
    for (index, child) in children.iter().enumerate() {
        let state = Arc::clone(&state);
        child.subscribe(move |outcome| state.record(index, outcome));
    }
    aggregate
}

struct AllState<T: Clone + Send + 'static> {
    slots: Mutex<Vec<Option<T>>>,
    remaining: AtomicUsize,
    failed: AtomicBool,
    promise: Promise<Vec<T>>,
}

impl<T: Clone + Send + 'static> AllState<T> {
    fn record(&self, index: usize, outcome: &Result<T, Error>) {
        match outcome {
            Ok(value) => {
                self.slots.lock()[index] = Some(value.clone());
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values: Option<Vec<T>> =
                        self.slots.lock().iter_mut().map(Option::take).collect();
                    if let Some(values) = values {
                        _ = self.promise.fulfill(values);
                    }
                }
            }
            Err(err) => {
                if !self.failed.swap(true, Ordering::AcqRel) {
                    tracing::debug!(child = index, %err, "aggregate rejected by child");
                    _ = self.promise.reject(err.clone());
                }
            }
        }
    }
}

/// Settle with the first child to fulfill.
///
/// If every child rejects, rejects with [`Error::AllFailed`] holding the
/// causes in input order. An empty input rejects right away with
/// [`Error::EmptyAggregate`].
pub fn any<T, I>(futures: I) -> Future<T>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let children: Vec<Future<T>> = futures.into_iter().collect();
    if children.is_empty() {
        return Future::failed(Error::EmptyAggregate);
    }

    let (promise, aggregate) = promise();
    cancel_children_with(&aggregate, &children);
    let state = Arc::new(AnyState {
        errors: Mutex::new(vec![None; children.len()]),
        remaining: AtomicUsize::new(children.len()),
        won: AtomicBool::new(false),
        promise,
    });
    for (index, child) in children.iter().enumerate() {
        let state = Arc::clone(&state);
        child.subscribe(move |outcome| state.record(index, outcome));
    }
    aggregate
}

struct AnyState<T: Clone + Send + 'static> {
    errors: Mutex<Vec<Option<Error>>>,
    remaining: AtomicUsize,
    won: AtomicBool,
    promise: Promise<T>,
}

impl<T: Clone + Send + 'static> AnyState<T> {
    fn record(&self, index: usize, outcome: &Result<T, Error>) {
        match outcome {
            Ok(value) => {
                if !self.won.swap(true, Ordering::AcqRel) {
                    _ = self.promise.fulfill(value.clone());
                }
            }
            Err(err) => {
                self.errors.lock()[index] = Some(err.clone());
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
                    && !self.won.swap(true, Ordering::AcqRel)
                {
                    let causes = self.errors.lock().iter_mut().filter_map(Option::take).collect();
                    _ = self.promise.reject(Error::AllFailed(causes));
                }
            }
        }
    }
}

fn cancel_children_with<T, U>(aggregate: &Future<U>, children: &[Future<T>])
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    let children = children.to_vec();
    aggregate.on_cancel(move || {
        for child in &children {
            child.cancel();
        }
    });
}
