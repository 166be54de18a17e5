use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::Error;

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// An advisory cancellation flag shared between a future and the work
/// producing it.
///
/// Cancellation is cooperative: producers may poll [`CancelToken::is_cancelled`]
/// (or use [`CancelToken::check`] with `?`) and stop early, but nothing is
/// interrupted forcibly.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Error::Cancelled)` once cancellation has been requested.
    ///
    /// # Errors
    /// Will return `Err` if the token is cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Request cancellation. Hooks run once, on the first call, on the
    /// calling thread. Returns whether this call made the request.
    pub fn cancel(&self) -> bool {
        let hooks = {
            let mut hooks = self.inner.hooks.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
        true
    }

    /// Run `hook` when cancellation is requested, or right away if it
    /// already was.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.inner.hooks.lock();
            if !self.inner.cancelled.load(Ordering::Acquire) {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Drop pending hooks without running them. Used once the owner settled
    /// and cancellation can no longer matter.
    pub(crate) fn disarm(&self) {
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        drop(hooks);
    }
}
