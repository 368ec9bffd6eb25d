//! Bounded task pool.
//!
//! Runs an async worker over a list of items with at most `limit` workers in
//! flight. Items are admitted strictly in submission order: a single feeder
//! task acquires a semaphore permit, then spawns the worker for the next item,
//! so with `limit == 1` completion order equals submission order.
//!
//! A cancellation signal (a `watch` channel flipped to `true`) stops
//! admission. Workers that are already running are never aborted; they run to
//! completion and still report through [`BoundedRun::next`].
//!
//! A worker's slot is freed when its [`Completion`] is dropped, not when the
//! worker returns, so a consumer can react to a result (and cancel) before
//! anything else is admitted.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

/// Why a pool slot produced no worker output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// A finished worker, tagged with the submission index of its item
///
/// Holds the worker's concurrency slot: the next item is only admitted once
/// the consumer has dropped this completion.
#[derive(Debug)]
pub struct Completion<O> {
    pub index: usize,
    pub output: Result<O, PoolError>,
    _permit: OwnedSemaphorePermit,
}

/// Handle to a running pool
///
/// Yields completions in the order workers finish. Dropping it stops
/// admission of further items; in-flight workers keep running.
pub struct BoundedRun<O> {
    rx: mpsc::UnboundedReceiver<Completion<O>>,
    feeder: JoinHandle<()>,
    total: usize,
}

impl<O> BoundedRun<O> {
    /// Number of submitted items (admitted or not)
    pub fn total(&self) -> usize {
        self.total
    }

    /// Next finished worker, or `None` once every admitted worker has reported
    /// and no more items will be admitted.
    pub async fn next(&mut self) -> Option<Completion<O>> {
        self.rx.recv().await
    }

    /// Wait for everything and return outputs in submission order.
    ///
    /// Items that were never admitted because of cancellation are `None`.
    pub async fn collect_ordered(mut self) -> Vec<Option<Result<O, PoolError>>> {
        let mut ordered: Vec<Option<Result<O, PoolError>>> =
            std::iter::repeat_with(|| None).take(self.total).collect();

        while let Some(completion) = self.next().await {
            ordered[completion.index] = Some(completion.output);
        }

        ordered
    }
}

impl<O> Drop for BoundedRun<O> {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

/// Resolve once `cancel` reads `true`. Never resolves if the sender is gone.
pub async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|&is_cancelled| is_cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Start running `worker` over `items` with at most `limit` concurrent workers.
///
/// Must be called from within a tokio runtime.
pub fn spawn_bounded<I, O, F, Fut>(
    items: Vec<I>,
    limit: usize,
    cancel: watch::Receiver<bool>,
    worker: F,
) -> BoundedRun<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let total = items.len();
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Arc::new(worker);
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));

    let feeder = tokio::spawn(async move {
        for (index, item) in items.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancelled(cancel.clone()) => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if *cancel.borrow() {
                break;
            }

            let tx = tx.clone();
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let output = AssertUnwindSafe(worker(item))
                    .catch_unwind()
                    .await
                    .map_err(|payload| PoolError::Panicked(panic_message(payload)));
                let _ = tx.send(Completion {
                    index,
                    output,
                    _permit: permit,
                });
            });
        }
    });

    BoundedRun { rx, feeder, total }
}

/// Run `worker` over `items` without cancellation and return the outputs in
/// submission order.
pub async fn run_bounded<I, O, F, Fut>(
    items: Vec<I>,
    limit: usize,
    worker: F,
) -> Vec<Result<O, PoolError>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    spawn_bounded(items, limit, cancel_rx, worker)
        .collect_ordered()
        .await
        .into_iter()
        .flatten()
        .collect()
}
