//! The fault channel: reports producer bugs, as opposed to runtime failures.
//!
//! A double settlement is never silently dropped. It is returned to the
//! caller of [`Promise::fulfill`](crate::Promise::fulfill) or
//! [`Promise::reject`](crate::Promise::reject), logged at `error` level, and
//! forwarded to the process-wide handler if one is installed.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::FutureId;

type Handler = Arc<dyn Fn(&Fault) + Send + Sync + 'static>;

static HANDLER: RwLock<Option<Handler>> = parking_lot::const_rwlock(None);

/// A violated settlement invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// The future whose promise misbehaved.
    pub future: FutureId,
    /// What went wrong.
    pub kind: FaultKind,
}

/// Kinds of [`Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FaultKind {
    /// A settled promise was settled again.
    DoubleSettlement {
        /// The rejected attempt, `"fulfill"` or `"reject"`.
        attempted: &'static str,
    },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::DoubleSettlement { attempted } => {
                write!(f, "{attempted} on already settled future {}", self.future)
            }
        }
    }
}

/// Install the process-wide fault handler, replacing any previous one.
pub fn set_fault_handler(handler: impl Fn(&Fault) + Send + Sync + 'static) {
    *HANDLER.write() = Some(Arc::new(handler));
}

/// Remove the process-wide fault handler.
pub fn clear_fault_handler() {
    HANDLER.write().take();
}

pub(crate) fn report(fault: Fault) {
    tracing::error!(future = %fault.future, "settlement fault: {fault}");
    let handler = HANDLER.read().clone();
    if let Some(handler) = handler {
        handler(&fault);
    }
}
