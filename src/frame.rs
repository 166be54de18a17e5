//! Consuming futures from a frame loop without blocking it.
//!
//! Two styles are supported. [`FuturePoller`] checks one future once per
//! tick. [`Inbox`] collects outcomes pushed by continuations and hands them
//! over at tick boundaries.

use std::fmt;
use std::task::Poll;

use bevy_ecs::prelude::Resource;
use futures::channel::mpsc;
use parking_lot::Mutex;

use crate::Error;
use crate::Future;

/// Polls a single [`Future`] once per tick. Use it as a Bevy
/// [`Local`](bevy_ecs::system::Local) system parameter, or hold it anywhere a
/// frame loop keeps state.
#[derive(Debug)]
pub struct FuturePoller<T: Clone + Send + 'static>(Option<Future<T>>);

impl<T: Clone + Send + 'static> Default for FuturePoller<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T> FuturePoller<T>
where
    T: Clone + Send + 'static,
{
    /// Returns whether no future is being polled.
    pub fn is_idle(&self) -> bool {
        self.0.is_none()
    }

    /// Returns whether the future is pending (running, but not finished).
    pub fn is_pending(&self) -> bool {
        self.0.as_ref().is_some_and(Future::is_pending)
    }

    /// Returns whether the future is finished.
    pub fn is_finished(&self) -> bool {
        self.0.as_ref().is_some_and(Future::is_settled)
    }

    /// Start polling `future`. If another future is being polled, it is
    /// replaced; it keeps running.
    pub fn start(&mut self, future: Future<T>) {
        self.0.replace(future);
    }

    /// Forget the future being polled. This does not cancel it.
    pub fn forget(&mut self) -> Option<Future<T>> {
        self.0.take()
    }

    /// Poll for the outcome. Returns `Ready` exactly once per started future,
    /// after which the poller is idle again.
    pub fn poll(&mut self) -> Poll<Result<T, Error>> {
        match self.0.as_ref().and_then(Future::try_get) {
            Some(outcome) => {
                self.0.take();
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }
}

/// A frame-safe mailbox of future outcomes.
///
/// Continuations registered with [`Inbox::watch`] run on whichever thread
/// settles the future and only enqueue; the frame loop calls
/// [`Inbox::drain`] at a tick boundary to consume everything that arrived.
#[derive(Resource)]
pub struct Inbox<T: Send + Sync + 'static> {
    sender: mpsc::UnboundedSender<Result<T, Error>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Result<T, Error>>>,
}

impl<T: Send + Sync + 'static> fmt::Debug for Inbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("receiver", &"<receiver>")
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Default for Inbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Inbox<T> {
    /// Create an empty inbox.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Deliver the outcome of `future` to this inbox once it settles.
    pub fn watch(&self, future: &Future<T>)
    where
        T: Clone,
    {
        let sender = self.sender.clone();
        future.subscribe(move |outcome| {
            // The inbox may be gone by now, which is fine.
            _ = sender.unbounded_send(outcome.clone());
        });
    }

    /// Take every outcome that arrived since the last drain, in arrival order.
    pub fn drain(&self) -> Vec<Result<T, Error>> {
        let mut receiver = self.receiver.lock();
        let mut outcomes = Vec::new();
        // `Err` means nothing is queued right now.
        while let Ok(Some(outcome)) = receiver.try_next() {
            outcomes.push(outcome);
        }
        outcomes
    }
}
