//! Concurrency primitives over whole operations: a bounded parallel pool
//! and a first-success race.
//!
//! Operations are supplied as re-invocable thunks (the same restartable
//! shape producers have), so a shared retry budget can re-run failures.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{Result, StreamError};

/// A boxed, pinned, Send future.
pub type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A re-invocable operation.
pub type Op<T> = Box<dyn Fn() -> BoxFut<Result<T>> + Send + Sync>;

/// Box a closure into an [`Op`].
pub fn op<T, F, Fut>(f: F) -> Op<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Options for [`parallel`].
#[derive(Debug, Clone, Copy)]
pub struct ParallelOptions {
    /// Pool width; clamped to at least 1. Default: 4.
    pub concurrency: usize,
    /// Stop scheduling and cancel in-flight work on the first failure.
    pub fail_fast: bool,
    /// Shared retry budget: failed ops with a retryable classification are
    /// re-invoked while the pooled budget lasts.
    pub shared_retry: Option<u32>,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fail_fast: false,
            shared_retry: None,
        }
    }
}

/// Aggregate result of a [`parallel`] run.
#[derive(Debug)]
pub struct ParallelOutcome<T> {
    /// Per-op results, in op order. Ops cancelled by `fail_fast` hold
    /// `Err(Cancelled)`.
    pub results: Vec<Result<T>>,
    pub success_count: usize,
    pub failure_count: usize,
    pub all_succeeded: bool,
}

/// Run ops under a bounded pool.
///
/// With `fail_fast`, the first failure drops every in-flight future
/// (cancelling it) and marks unfinished ops as cancelled.
pub async fn parallel<T: Send + 'static>(
    ops: Vec<Op<T>>,
    options: ParallelOptions,
) -> ParallelOutcome<T> {
    let total = ops.len();
    let concurrency = options.concurrency.max(1);
    let budget = Arc::new(AtomicU32::new(options.shared_retry.unwrap_or(0)));

    let mut slots: Vec<Option<Result<T>>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);

    {
        let mut pending = ops.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        let spawn = |index: usize, op: Op<T>, budget: Arc<AtomicU32>| async move {
            let mut result = op().await;
            while let Err(e) = &result {
                if e.retry_reason().is_none() {
                    break;
                }
                // Take one token from the shared budget, if any remain.
                if budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                    .is_err()
                {
                    break;
                }
                tracing::debug!(op = index, "re-running failed op on shared retry budget");
                result = op().await;
            }
            (index, result)
        };

        for (index, op) in pending.by_ref().take(concurrency) {
            in_flight.push(spawn(index, op, budget.clone()));
        }

        while let Some((index, result)) = in_flight.next().await {
            let failed = result.is_err();
            slots[index] = Some(result);
            if failed && options.fail_fast {
                break;
            }
            if let Some((index, op)) = pending.next() {
                in_flight.push(spawn(index, op, budget.clone()));
            }
        }
        // Dropping `in_flight` cancels anything still running.
    }

    let results: Vec<Result<T>> = slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Err(StreamError::Cancelled)))
        .collect();
    let success_count = results.iter().filter(|r| r.is_ok()).count();
    let failure_count = results.len() - success_count;

    ParallelOutcome {
        success_count,
        failure_count,
        all_succeeded: failure_count == 0,
        results,
    }
}

/// Return the first successful completion, abandoning the rest.
///
/// Fails only when every op fails, with the last error observed.
pub async fn race<T: Send + 'static>(ops: Vec<Op<T>>) -> Result<T> {
    if ops.is_empty() {
        return Err(StreamError::Other("race requires at least one op".into()));
    }

    let mut in_flight: FuturesUnordered<BoxFut<Result<T>>> =
        ops.iter().map(|op| op()).collect();

    let mut last_error = None;
    while let Some(result) = in_flight.next().await {
        match result {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| StreamError::Other("race produced no results".into())))
}
