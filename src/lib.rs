#![deny(missing_docs)]
//! Promises, futures and executors for assembling game state off the frame
//! thread.
//!
//! A [`Promise`] is the write side of a single-assignment cell; its
//! [`Future`] is the read side. Futures chain with [`Future::then`] and
//! [`Future::except`], aggregate with [`all`] and [`any`], and are consumed
//! from a frame loop with a [`FuturePoller`] or an [`Inbox`] without ever
//! blocking it. Work is scheduled on an [`Executor`]: inline, a thread per
//! task, a bounded [`ThreadPoolExecutor`], or Bevy's compute pool.

mod cancel;
mod combinator;
mod error;
mod executor;
pub mod fault;
mod frame;
mod future;
pub mod pipeline;
mod timeout;
mod util;

pub use cancel::CancelToken;
pub use combinator::{all, any};
pub use error::{Error, TimeoutError};
pub use executor::{
    ComputePoolExecutor, ConfigError, Executor, ExecutorExt, InlineExecutor, PoolConfig, Task,
    ThreadExecutor, ThreadPoolExecutor,
};
pub use frame::{FuturePoller, Inbox};
pub use future::{Future, FutureId, FutureState, Promise, Resolve, promise};
pub use timeout::timeout;
pub use web_time::Duration;
