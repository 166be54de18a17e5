use std::sync::Arc;

/// Errors a [`Future`](crate::Future) may be rejected with.
///
/// Every error surfaces as the rejection of some future, so the type is
/// cheaply cloneable: each observer of a shared future gets its own copy.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A deadline elapsed before the future settled.
    #[error("timed out waiting for settlement")]
    Timeout,
    /// The future was cancelled, or its producer honored a cancellation request.
    #[error("cancelled")]
    Cancelled,
    /// The promise was dropped while its future was still pending.
    #[error("promise dropped before settlement")]
    BrokenPromise,
    /// A promise was settled more than once.
    #[error("promise already settled")]
    DoubleSettlement,
    /// `any` was asked to race an empty set of futures.
    #[error("aggregate over an empty set of futures")]
    EmptyAggregate,
    /// Every child of an `any` rejected. Causes are kept in input order.
    #[error("all {} futures failed", .0.len())]
    AllFailed(Vec<Error>),
    /// Work submitted to an executor panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The executor no longer accepts work.
    #[error("executor is shut down")]
    Shutdown,
    /// An error raised by an external collaborator, carried opaquely.
    #[error(transparent)]
    Collaborator(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap a collaborator error (network failure, compile failure, ...).
    pub fn collaborator<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self::Collaborator(Arc::from(err.into()))
    }

    /// Build a collaborator error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::collaborator(message.into())
    }

    /// Returns whether this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// The deadline of a [`timeout`](crate::timeout) elapsed first.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("deadline elapsed")]
pub struct TimeoutError;

impl From<TimeoutError> for Error {
    fn from(_: TimeoutError) -> Self {
        Self::Timeout
    }
}
