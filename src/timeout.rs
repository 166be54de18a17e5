use futures::future::Either;
use futures_timer::Delay;
use web_time::Duration;

use crate::TimeoutError;

/// Race `f` against a timer of `dur`. This is the deadline behind
/// [`Future::get`](crate::Future::get), usable on any executor.
///
/// # Errors
/// Will return `Err(TimeoutError)` if `dur` elapses before `f` completes; `f`
/// is dropped unfinished.
pub async fn timeout<F, T>(dur: Duration, f: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let f = std::pin::pin!(f);
    match futures::future::select(f, Delay::new(dur)).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(((), _)) => Err(TimeoutError),
    }
}
