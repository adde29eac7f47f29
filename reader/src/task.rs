//! This module provides required task pooling features.

use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, Future, FutureExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::Instrument;

use crate::download::{self, Fetch};
use crate::error::{Error, FetchError};
use crate::outcome::{Outcome, ResultStore};

/// A unit of work binding an identifier to the slot its outcome goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    index: usize,
    identifier: String,
}

impl Task {
    #[inline]
    pub fn new(index: usize, identifier: impl Into<String>) -> Self {
        Self {
            index,
            identifier: identifier.into(),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Fetch this task's identifier and store the outcome in its slot.
    async fn execute<F: Fetch>(self, fetcher: &F, store: &ResultStore) {
        let outcome = Outcome::from(fetch(fetcher, &self.identifier).await);

        store.complete(self.index, outcome);
    }
}

/// Fetch `identifier` with `fetcher`, reporting a panicking fetch as [`download::Error::Panicked`].
pub(crate) async fn fetch<F: Fetch>(fetcher: &F, identifier: &str) -> Result<Bytes, FetchError> {
    AssertUnwindSafe(fetcher.fetch(identifier))
        .catch_unwind()
        .await
        .unwrap_or(Err(download::Error::Panicked))
        .map_err(|cause| FetchError::new(identifier, cause))
}

/// A bounded pool of workers fetching a fixed batch of tasks.
///
/// Workers all pull from the same channel, so a worker stuck on a slow resource does not hold back the others.
/// A pool runs once: it is consumed by [`Pool::run()`].
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use std::sync::Arc;
/// # use reader::bytes::Bytes;
/// # use reader::download::{Error, Fetch};
/// # use reader::task::{Pool, Task};
/// # use reader::ResultStore;
/// struct Echo;
///
/// impl Fetch for Echo {
///     async fn fetch(&self, identifier: &str) -> Result<Bytes, Error> {
///         Ok(Bytes::copy_from_slice(identifier.as_bytes()))
///     }
/// }
///
/// let tasks: Vec<_> = ["a", "b", "c"].into_iter().enumerate().map(|(i, id)| Task::new(i, id)).collect();
/// let store = Arc::new(ResultStore::new(tasks.len()));
///
/// Pool::new(2.try_into().unwrap(), Arc::clone(&store), tasks)?.run(Arc::new(Echo)).await;
///
/// let outcomes = store.take().unwrap();
/// assert_eq!(&outcomes[2].data().unwrap()[..], b"c");
/// # Ok::<_, reader::Error>(())
/// # }).unwrap()
/// ```
#[derive(Debug)]
pub struct Pool {
    /// The number of workers to start.
    concurrency: NonZeroUsize,
    /// Tasks yet to be sent to the workers, in slot order.
    tasks: Vec<Task>,
    /// The store every worker writes its outcomes to.
    store: Arc<ResultStore>,
    /// The pool of workers.
    workers: Vec<Worker>,
}

impl Pool {
    /// Create a pool of `concurrency` workers running `tasks` into `store`.
    ///
    /// # Errors
    /// Fails with [`Error::TaskMismatch`] unless `store` has no outcome yet and `tasks` hold each of its slot indexes exactly
    /// once, since [`Pool::run()`] could never complete otherwise.
    pub fn new(concurrency: NonZeroUsize, store: Arc<ResultStore>, tasks: Vec<Task>) -> Result<Self, Error> {
        let slots = store.len();

        let mut covered = vec![false; slots];
        let exact_cover = store.pending() == slots
            && tasks.len() == slots
            && tasks
                .iter()
                .all(|task| covered.get_mut(task.index).is_some_and(|seen| !std::mem::replace(seen, true)));

        if !exact_cover {
            return Err(Error::TaskMismatch { slots });
        }

        Ok(Self {
            concurrency,
            tasks,
            store,
            workers: Vec::new(),
        })
    }

    /// Run every task with `fetcher` and return once they all produced an outcome.
    ///
    /// All workers are stopped before returning, so the store is no longer written to afterwards.
    pub async fn run<F: Fetch>(mut self, fetcher: Arc<F>) {
        let tasks = std::mem::take(&mut self.tasks);

        // sized to hold every task, so that sending never waits for a worker
        let (sender, receiver) = mpsc::channel(tasks.len().max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        tracing::debug!("Running {} tasks on {} workers", tasks.len(), self.concurrency);

        self.workers = (0..self.concurrency.get())
            .map(|id| Worker::new(id, Arc::clone(&receiver), Arc::clone(&fetcher), Arc::clone(&self.store)))
            .collect();

        for task in tasks {
            // the receiving end is kept alive by `receiver`, so sending cannot fail
            let _ = sender.send(task).await;
        }

        self.store.completed().await;

        tracing::debug!("All tasks completed, stopping pool");

        self.stop().await;
    }

    /// Stop current pool of workers, waiting for them to exit.
    ///
    /// A worker busy with a task finishes it first. Stopping an already stopped pool does nothing.
    async fn stop(&mut self) {
        let workers = std::mem::take(&mut self.workers);

        let results = future::join_all(workers.into_iter().map(|mut worker| {
            tracing::debug!("Stopping worker {}...", worker.id);

            worker.stop();
            worker
        }))
        .await;

        for error in results.into_iter().filter_map(Result::err) {
            tracing::warn!("Worker did not exit cleanly: {error}");
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new<F: Fetch>(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Task>>>, fetcher: Arc<F>, store: Arc<ResultStore>) -> Worker {
        tracing::debug!("Starting worker {id}...");

        let (stop, mut stopped) = oneshot::channel();

        Worker {
            id,
            stop: Some(stop),
            handle: tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        _ = &mut stopped => {
                            tracing::debug!("Stop signal received, shutting down worker {id}.");
                            break;
                        }
                        message = async { receiver.lock().await.recv().await } => message,
                    };

                    match message {
                        Some(task) => {
                            tracing::trace!("Executing task #{} on worker {id}...", task.index);

                            task.execute(fetcher.as_ref(), &store).await;
                        }
                        None => {
                            tracing::debug!("All tasks exhausted, shutting down worker {id}.");
                            break;
                        }
                    }
                }
            }
            .in_current_span()),
        }
    }

    /// Signal the worker to exit its loop.
    #[inline]
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(()); // the worker may already be gone
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Echoes identifiers back after a delay depending on their length, counting calls per identifier.
    #[derive(Debug, Default)]
    struct SlowEcho {
        calls: std::sync::Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Fetch for SlowEcho {
        async fn fetch(&self, identifier: &str) -> Result<Bytes, download::Error> {
            *self.calls.lock().unwrap().entry(identifier.to_owned()).or_default() += 1;

            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(5 * (identifier.len() as u64 % 4))).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match identifier {
                "" => Err(download::Error::Other("empty identifier".into())),
                "panic" => panic!("fetcher blew up"),
                _ => Ok(Bytes::copy_from_slice(identifier.as_bytes())),
            }
        }
    }

    fn tasks(identifiers: &[&str]) -> Vec<Task> {
        identifiers.iter().enumerate().map(|(i, id)| Task::new(i, *id)).collect()
    }

    async fn run(concurrency: usize, identifiers: &[&str], fetcher: Arc<SlowEcho>) -> Vec<Outcome> {
        let store = Arc::new(ResultStore::new(identifiers.len()));

        Pool::new(concurrency.try_into().unwrap(), Arc::clone(&store), tasks(identifiers))
            .unwrap()
            .run(fetcher)
            .await;

        store.take().expect("every slot is filled")
    }

    #[test]
    fn test_task_accessors() {
        let task = Task::new(3, "http://example.com/");

        assert_eq!(task.index(), 3);
        assert_eq!(task.identifier(), "http://example.com/");
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn test_outcomes_follow_task_order() {
        let identifiers = ["dddd", "c", "bb", "aaa", "e", "ffffff"];

        let outcomes = run(3, &identifiers, Default::default()).await;

        assert_eq!(outcomes.len(), identifiers.len());
        for (outcome, identifier) in outcomes.iter().zip(identifiers) {
            assert_eq!(&outcome.data().unwrap()[..], identifier.as_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_each_task_is_fetched_once() {
        let identifiers: Vec<_> = (0..50).map(|i| format!("resource-{i}")).collect();
        let identifiers: Vec<_> = identifiers.iter().map(String::as_str).collect();
        let fetcher = Arc::new(SlowEcho::default());

        let outcomes = run(8, &identifiers, Arc::clone(&fetcher)).await;

        assert!(outcomes.iter().all(Outcome::is_success));

        let calls = fetcher.calls.lock().unwrap();
        assert_eq!(calls.len(), identifiers.len());
        assert!(calls.values().all(|&count| count == 1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrency_is_bounded() {
        let identifiers = ["aaa"; 20];
        let fetcher = Arc::new(SlowEcho::default());

        run(4, &identifiers, Arc::clone(&fetcher)).await;

        let max_in_flight = fetcher.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=4).contains(&max_in_flight), "{max_in_flight} fetches ran at once");
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn test_failures_stay_in_their_slot() {
        let outcomes = run(2, &["a", "", "panic", "b"], Default::default()).await;

        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1].failure().unwrap().identifier(), "");
        assert!(matches!(outcomes[2].failure().unwrap().cause(), download::Error::Panicked));
        assert!(outcomes[3].is_success());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_more_workers_than_tasks() {
        let outcomes = run(16, &["a", "b"], Default::default()).await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(Outcome::is_success));
    }

    #[tokio::test]
    async fn test_no_task() {
        let outcomes = run(2, &[], Default::default()).await;

        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_stop_is_idempotent() {
        let store = Arc::new(ResultStore::new(0));
        let mut pool = Pool::new(NonZeroUsize::MIN, store, vec![]).unwrap();

        let (_sender, receiver) = mpsc::channel(1);
        pool.workers
            .push(Worker::new(0, Arc::new(Mutex::new(receiver)), Arc::new(SlowEcho::default()), Arc::clone(&pool.store)));

        pool.stop().await;
        pool.stop().await;

        assert!(pool.workers.is_empty());
        assert!(logs_contain("Stop signal received, shutting down worker 0."));
    }

    #[test]
    fn test_tasks_must_cover_each_slot_once() {
        let pool = |store: ResultStore, tasks: Vec<Task>| Pool::new(NonZeroUsize::MIN, Arc::new(store), tasks);

        let duplicated = pool(ResultStore::new(2), vec![Task::new(0, "a"), Task::new(0, "b")]);
        assert!(matches!(duplicated, Err(Error::TaskMismatch { slots: 2 })));

        let out_of_range = pool(ResultStore::new(2), vec![Task::new(0, "a"), Task::new(2, "b")]);
        assert!(matches!(out_of_range, Err(Error::TaskMismatch { slots: 2 })));

        let missing = pool(ResultStore::new(3), tasks(&["a", "b"]));
        assert!(matches!(missing, Err(Error::TaskMismatch { slots: 3 })));

        let filled = ResultStore::new(2);
        filled.complete(0, Outcome::Success(Bytes::new()));
        assert!(matches!(pool(filled, tasks(&["a", "b"])), Err(Error::TaskMismatch { slots: 2 })));

        assert!(pool(ResultStore::new(2), vec![Task::new(1, "b"), Task::new(0, "a")]).is_ok());
    }

    #[tokio::test]
    async fn test_fetch_reports_panic() {
        let error = fetch(&SlowEcho::default(), "panic").await.unwrap_err();

        assert_eq!(error.identifier(), "panic");
        assert!(matches!(error.cause(), download::Error::Panicked));
    }
}
