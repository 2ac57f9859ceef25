//! Parallel dispatch of independent per-item requests.
//!
//! Every item gets its own task. Results are collected as they complete; the
//! first failure, an early stop, or the deadline aborts whatever is still
//! outstanding.

use std::future::Future;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{MasterError, Result};
use crate::types::Deadline;

/// Outcome of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutSummary<R> {
    /// Results of completed tasks in completion order.
    pub results: Vec<R>,
    /// Tasks dispatched.
    pub dispatched: usize,
    /// Tasks aborted before completing.
    pub aborted: usize,
}

/// Runs `f` on every item in parallel and returns once all succeed, or as
/// soon as `stop` accepts a result.
pub async fn fan_out_until<T, R, F, Fut, S>(
    items: Vec<T>,
    deadline: Deadline,
    f: F,
    stop: S,
) -> Result<FanoutSummary<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Send + 'static,
    S: Fn(&R) -> bool,
{
    let dispatched = items.len();
    let mut set = JoinSet::new();
    for item in items {
        set.spawn(f(item));
    }

    let mut results = Vec::with_capacity(dispatched);
    loop {
        let next = match tokio::time::timeout_at(deadline.instant(), set.join_next()).await {
            Ok(next) => next,
            Err(_) => {
                let outstanding = set.len();
                set.abort_all();
                debug!(outstanding, "fan-out deadline expired");
                return Err(MasterError::TimedOut(format!(
                    "{outstanding} of {dispatched} tasks still outstanding"
                )));
            }
        };
        match next {
            None => break,
            Some(Ok(Ok(result))) => {
                let done = stop(&result);
                results.push(result);
                if done {
                    let aborted = set.len();
                    set.abort_all();
                    return Ok(FanoutSummary {
                        results,
                        dispatched,
                        aborted,
                    });
                }
            }
            Some(Ok(Err(e))) => {
                set.abort_all();
                return Err(e);
            }
            Some(Err(join_err)) => {
                set.abort_all();
                return Err(MasterError::Internal(format!(
                    "fan-out task failed: {join_err}"
                )));
            }
        }
    }

    Ok(FanoutSummary {
        results,
        dispatched,
        aborted: 0,
    })
}

/// Runs `f` on every item in parallel and waits for all of them.
pub async fn fan_out<T, R, F, Fut>(items: Vec<T>, deadline: Deadline, f: F) -> Result<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Send + 'static,
{
    fan_out_until(items, deadline, f, |_| false)
        .await
        .map(|summary| summary.results)
}
