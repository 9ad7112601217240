//! Deadline race between one unit of work and a timer.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TaskError;
use crate::supervisor::{guard, Supervisor};

/// Result of [`run_bounded`]. Exactly one variant is produced per race.
#[derive(Debug, PartialEq, Eq)]
pub enum Bounded<T> {
    /// The work finished before the deadline, normally or by a caught panic.
    Completed(Result<T, TaskError>),
    /// The deadline fired first.
    TimedOut,
}

impl<T> Bounded<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Bounded::TimedOut)
    }
}

/// Runs `work` as a supervised task and races it against `deadline`.
///
/// When the deadline wins, `on_timeout` runs on the calling task and the race
/// resolves to [`Bounded::TimedOut`]. The work task is **not** cancelled: it
/// keeps running in the background, its side effects still happen, and its
/// eventual result is dropped.
///
/// The work reports through a `oneshot` channel, so a result is delivered at
/// most once and read by at most one consumer.
pub async fn run_bounded<Fut, T, H>(
    supervisor: &Supervisor,
    work: Fut,
    deadline: Duration,
    on_timeout: H,
) -> Bounded<T>
where
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
    H: FnOnce(),
{
    let (tx, rx) = oneshot::channel();
    supervisor.spawn(move |_| async move {
        let result = guard(work).await;
        if tx.send(result).is_err() {
            debug!("bounded work finished after its deadline, result discarded");
        }
    });

    tokio::select! {
        delivered = rx => match delivered {
            Ok(result) => Bounded::Completed(result),
            Err(_) => Bounded::Completed(Err(TaskError::Dropped)),
        },
        _ = tokio::time::sleep(deadline) => {
            on_timeout();
            Bounded::TimedOut
        }
    }
}
