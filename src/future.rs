use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use parking_lot::Mutex;
use web_time::Duration;

use crate::CancelToken;
use crate::Error;
use crate::Executor;
use crate::Task;
use crate::fault::{self, Fault, FaultKind};
use crate::util::panic_message;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a settlement cell, shared by a [`Promise`]
/// and all of its [`Future`] handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(u64);

impl FutureId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The state of a [`Future`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with an error.
    Rejected,
    /// Cancelled while pending.
    Cancelled,
}

enum Slot<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
    Cancelled,
}

impl<T: Clone> Slot<T> {
    fn state(&self) -> FutureState {
        match self {
            Self::Pending => FutureState::Pending,
            Self::Fulfilled(_) => FutureState::Fulfilled,
            Self::Rejected(_) => FutureState::Rejected,
            Self::Cancelled => FutureState::Cancelled,
        }
    }

    fn outcome(&self) -> Option<Result<T, Error>> {
        match self {
            Self::Pending => None,
            Self::Fulfilled(value) => Some(Ok(value.clone())),
            Self::Rejected(err) => Some(Err(err.clone())),
            Self::Cancelled => Some(Err(Error::Cancelled)),
        }
    }
}

type Callback<T> = Box<dyn FnOnce(&Result<T, Error>) + Send + 'static>;

struct Inner<T> {
    slot: Slot<T>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<(u64, Waker)>,
    next_waiter: u64,
}

struct Shared<T> {
    id: FutureId,
    inner: Mutex<Inner<T>>,
    token: CancelToken,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn new() -> Self {
        Self {
            id: FutureId::next(),
            inner: Mutex::new(Inner {
                slot: Slot::Pending,
                callbacks: Vec::new(),
                wakers: Vec::new(),
                next_waiter: 0,
            }),
            token: CancelToken::new(),
        }
    }

    fn state(&self) -> FutureState {
        self.inner.lock().slot.state()
    }

    /// Move out of `Pending`. Only the first transition takes effect; later
    /// attempts get the terminal state back. Observers are notified after the
    /// lock is released, in registration order.
    fn transition(&self, next: Slot<T>) -> Result<(), FutureState> {
        let cancelled = matches!(next, Slot::Cancelled);
        let (callbacks, wakers, outcome) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.slot, Slot::Pending) {
                return Err(inner.slot.state());
            }
            inner.slot = next;
            let callbacks = std::mem::take(&mut inner.callbacks);
            let outcome = if callbacks.is_empty() {
                None
            } else {
                inner.slot.outcome()
            };
            (callbacks, std::mem::take(&mut inner.wakers), outcome)
        };
        tracing::trace!(future = %self.id, cancelled, observers = callbacks.len(), "settled");

        for (_, waker) in wakers {
            waker.wake();
        }
        if let Some(outcome) = outcome {
            for callback in callbacks {
                callback(&outcome);
            }
        }
        if cancelled {
            self.token.cancel();
        } else {
            self.token.disarm();
        }
        Ok(())
    }
}

/// Create a settlement cell and return its write and read handles. No work is
/// started.
pub fn promise<T>() -> (Promise<T>, Future<T>)
where
    T: Clone + Send + 'static,
{
    let shared = Arc::new(Shared::new());
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Future {
            shared,
            waiter: None,
        },
    )
}

/// The exclusive write handle of a [`Future`].
///
/// The first [`fulfill`](Promise::fulfill) or [`reject`](Promise::reject) wins.
/// Dropping a promise that never settled rejects its future with
/// [`Error::BrokenPromise`], so nobody waits forever on a lost producer.
pub struct Promise<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Settle the future with a value.
    ///
    /// # Errors
    /// Will return `Err(Error::DoubleSettlement)` if the promise was already
    /// settled (the fault is also reported to the [fault channel](crate::fault)),
    /// or `Err(Error::Cancelled)` if an observer cancelled the future first.
    pub fn fulfill(&self, value: T) -> Result<(), Error> {
        self.settle_as(Slot::Fulfilled(value), "fulfill")
    }

    /// Settle the future with an error.
    ///
    /// # Errors
    /// Same as [`Promise::fulfill`].
    pub fn reject(&self, err: Error) -> Result<(), Error> {
        self.settle_as(Slot::Rejected(err), "reject")
    }

    /// Fulfill or reject depending on `outcome`.
    ///
    /// # Errors
    /// Same as [`Promise::fulfill`].
    pub fn settle(&self, outcome: Result<T, Error>) -> Result<(), Error> {
        match outcome {
            Ok(value) => self.fulfill(value),
            Err(err) => self.reject(err),
        }
    }

    /// Returns whether an observer asked for the work to stop.
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// The token observers use to request cancellation. Hand it to the work
    /// producing the value.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.token.clone()
    }

    /// Returns whether the future has left `Pending`.
    pub fn is_settled(&self) -> bool {
        self.shared.state() != FutureState::Pending
    }

    /// Another read handle to this promise's future.
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
            waiter: None,
        }
    }

    fn settle_as(&self, slot: Slot<T>, attempted: &'static str) -> Result<(), Error> {
        match self.shared.transition(slot) {
            Ok(()) => Ok(()),
            Err(FutureState::Cancelled) => {
                tracing::trace!(future = %self.shared.id, "discarding {attempted} of cancelled future");
                Err(Error::Cancelled)
            }
            Err(_) => {
                fault::report(Fault {
                    future: self.shared.id,
                    kind: FaultKind::DoubleSettlement { attempted },
                });
                Err(Error::DoubleSettlement)
            }
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if self
            .shared
            .transition(Slot::Rejected(Error::BrokenPromise))
            .is_ok()
        {
            tracing::debug!(future = %self.shared.id, "promise dropped before settlement");
        }
    }
}

/// A shared read handle to a value that becomes available at most once.
///
/// Handles are cheap to clone; every clone observes the same settlement.
/// Results are consumed either by chaining ([`then`](Future::then),
/// [`except`](Future::except)), by polling ([`try_get`](Future::try_get)),
/// by blocking ([`get`](Future::get)), or by `.await`.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
    // Key of this handle's waker in the cell, once it has been polled.
    waiter: Option<u64>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            waiter: None,
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        if let Some(key) = self.waiter.take() {
            self.shared.inner.lock().wakers.retain(|(waiter, _)| *waiter != key);
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// A future that is already fulfilled.
    pub fn ready(value: T) -> Self {
        let (promise, future) = promise();
        _ = promise.fulfill(value);
        future
    }

    /// A future that is already rejected.
    pub fn failed(err: Error) -> Self {
        let (promise, future) = promise();
        _ = promise.reject(err);
        future
    }

    /// The identifier of the underlying settlement cell.
    pub fn id(&self) -> FutureId {
        self.shared.id
    }

    /// The current state.
    pub fn state(&self) -> FutureState {
        self.shared.state()
    }

    /// Returns whether the future is still pending.
    pub fn is_pending(&self) -> bool {
        self.state() == FutureState::Pending
    }

    /// Returns whether the future has left `Pending`.
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// Peek at the outcome without blocking. Returns `None` while pending.
    pub fn try_get(&self) -> Option<Result<T, Error>> {
        self.shared.inner.lock().slot.outcome()
    }

    /// Block the current thread until the future settles, or until `timeout`
    /// elapses. Meant for bridging into synchronous call sites; never call it
    /// on a latency-sensitive thread.
    ///
    /// An expired wait cancels the future.
    ///
    /// # Errors
    /// Will return the future's rejection, or `Err(Error::Timeout)` if the
    /// deadline elapses first.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T, Error> {
        let Some(dur) = timeout else {
            return futures::executor::block_on(self.clone());
        };
        match futures::executor::block_on(crate::timeout(dur, self.clone())) {
            Ok(outcome) => outcome,
            Err(elapsed) => {
                if self.cancel() {
                    tracing::debug!(future = %self.shared.id, "wait timed out after {dur:?}");
                    Err(elapsed.into())
                } else {
                    // Settled between the deadline and the cancel.
                    self.try_get().unwrap_or(Err(Error::Timeout))
                }
            }
        }
    }

    /// Cancel the future if it is still pending, and ask its producer to stop.
    /// Returns whether this call cancelled it.
    ///
    /// Settlements arriving afterwards are discarded.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.transition(Slot::Cancelled).is_ok();
        if cancelled {
            tracing::debug!(future = %self.shared.id, "cancelled");
        }
        cancelled
    }

    /// Run `hook` when cancellation of this future is requested.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.token.on_cancel(hook);
    }

    /// Chain `f` onto the fulfilled value. A rejection skips `f` and
    /// propagates to the returned future.
    ///
    /// `f` may return a `Result` or another [`Future`]; the latter is
    /// flattened. Handlers attached before settlement run on the settling
    /// thread, in registration order; handlers attached after settlement are
    /// dispatched through `executor`.
    ///
    /// A late handler runs wherever `executor` puts it. With
    /// [`InlineExecutor`](crate::InlineExecutor) that is the registering
    /// thread; pass a thread-backed executor to keep it off the caller.
    pub fn then<E, F, R>(&self, executor: &E, f: F) -> Future<R::Value>
    where
        E: Executor + ?Sized,
        F: FnOnce(T) -> R + Send + 'static,
        R: Resolve,
    {
        let (promise, future) = promise();
        self.attach(executor, promise, move |outcome, promise| match outcome {
            Ok(value) => match std::panic::catch_unwind(AssertUnwindSafe(move || f(value))) {
                Ok(next) => next.resolve(promise),
                Err(payload) => {
                    _ = promise.reject(Error::Panicked(panic_message(&*payload)));
                }
            },
            Err(err) => {
                _ = promise.reject(err);
            }
        });
        future
    }

    /// Chain `f` onto a rejection, mapping it back to a value or re-raising.
    /// A fulfilled value skips `f`.
    ///
    /// Dispatch follows the same rules as [`Future::then`].
    pub fn except<E, F, R>(&self, executor: &E, f: F) -> Self
    where
        E: Executor + ?Sized,
        F: FnOnce(Error) -> R + Send + 'static,
        R: Resolve<Value = T>,
    {
        let (promise, future) = promise();
        self.attach(executor, promise, move |outcome, promise| match outcome {
            Ok(value) => {
                _ = promise.fulfill(value);
            }
            Err(err) => match std::panic::catch_unwind(AssertUnwindSafe(move || f(err))) {
                Ok(next) => next.resolve(promise),
                Err(payload) => {
                    _ = promise.reject(Error::Panicked(panic_message(&*payload)));
                }
            },
        });
        future
    }

    fn attach<E, U, H>(&self, executor: &E, promise: Promise<U>, handler: H)
    where
        E: Executor + ?Sized,
        U: Clone + Send + 'static,
        H: FnOnce(Result<T, Error>, Promise<U>) + Send + 'static,
    {
        let outcome = {
            let mut inner = self.shared.inner.lock();
            match inner.slot.outcome() {
                Some(outcome) => outcome,
                None => {
                    inner
                        .callbacks
                        .push(Box::new(move |outcome: &Result<T, Error>| {
                            handler(outcome.clone(), promise);
                        }));
                    return;
                }
            }
        };
        executor.execute(Task::new(CancelToken::new(), move |abandoned| {
            match abandoned {
                None => handler(outcome, promise),
                Some(reason) => {
                    _ = promise.reject(reason);
                }
            }
        }));
    }

    /// Run `callback` once settled. Fires right away, on the calling thread,
    /// if the future already settled.
    pub(crate) fn subscribe(&self, callback: impl FnOnce(&Result<T, Error>) + Send + 'static) {
        let outcome = {
            let mut inner = self.shared.inner.lock();
            match inner.slot.outcome() {
                Some(outcome) => outcome,
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Settle `promise` with this future's outcome. Cancelling the promise's
    /// future cancels this one.
    fn forward(&self, promise: Promise<T>) {
        let upstream = self.clone();
        promise.shared.token.on_cancel(move || {
            upstream.cancel();
        });
        self.subscribe(move |outcome| {
            _ = promise.settle(outcome.clone());
        });
    }
}

impl<T: Clone + Send + 'static> std::future::Future for Future<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.shared.inner.lock();
        if let Some(outcome) = inner.slot.outcome() {
            return Poll::Ready(outcome);
        }
        // One waker per handle; it is removed when the handle is dropped.
        let registered = this
            .waiter
            .and_then(|key| inner.wakers.iter_mut().find(|(waiter, _)| *waiter == key));
        match registered {
            Some((_, waker)) => {
                if !waker.will_wake(cx.waker()) {
                    waker.clone_from(cx.waker());
                }
            }
            None => {
                let key = inner.next_waiter;
                inner.next_waiter += 1;
                inner.wakers.push((key, cx.waker().clone()));
                this.waiter = Some(key);
            }
        }
        Poll::Pending
    }
}

/// What a continuation may hand back: a finished `Result`, or a [`Future`]
/// to follow.
pub trait Resolve: Send + 'static {
    /// The value the continuation eventually produces.
    type Value: Clone + Send + 'static;

    /// Settle `promise` with this outcome, now or once it is known.
    fn resolve(self, promise: Promise<Self::Value>);
}

impl<T: Clone + Send + 'static> Resolve for Result<T, Error> {
    type Value = T;

    fn resolve(self, promise: Promise<T>) {
        _ = promise.settle(self);
    }
}

impl<T: Clone + Send + 'static> Resolve for Future<T> {
    type Value = T;

    fn resolve(self, promise: Promise<T>) {
        self.forward(promise);
    }
}
