//! Batched aggregator over concurrent per-item fetches.
//!
//! One fetch runs per item and all of them are in flight at once. Results
//! are republished to observers only in batches: a full snapshot every
//! `batch_size` completions, or fewer when fewer remain. Replacing the item
//! collection with a structurally different one starts a new generation.
//! Fetches for items that survive the replacement keep running and report
//! into the new generation. Fetches for items that left are aborted.
//!
//! All task state lives in a single driver task that reacts to completion
//! events, so nothing here needs a lock except the shared [`QueryCache`].

use crate::batch::cache::QueryCache;
use crate::batch::input::ItemSource;
use crate::batch::retry::RetryPolicy;
use crate::batch::state::{BatchState, DEFAULT_BATCH_SIZE};
use crate::error::{AggregatorError, FetchError};
use crate::models::{ItemKey, QueryKey, Snapshot, TaskKind};
use crate::session::SessionNotifier;
use async_trait::async_trait;
use futures::future::{abortable, AbortHandle, Aborted, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fetches the derived value for one item.
#[async_trait]
pub trait ItemFetcher<T: Send + Sync>: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    /// Tag that keeps this fetcher's cache entries apart from other kinds.
    fn kind(&self) -> TaskKind;

    /// Identity of an item.
    fn key(&self, item: &T) -> ItemKey;

    async fn fetch(&self, item: &T) -> Result<Self::Value, FetchError>;
}

/// Side-effect hook invoked once for every failed task.
pub type ErrorHook = Arc<dyn Fn(&QueryKey, &FetchError) + Send + Sync>;

/// Builder for an aggregator. Call [`BatchedAggregator::spawn`] to start it.
pub struct BatchedAggregator<T, F>
where
    T: Send + Sync,
    F: ItemFetcher<T>,
{
    fetcher: Arc<F>,
    cache: Arc<QueryCache<F::Value>>,
    retry: RetryPolicy,
    batch_size: usize,
    session: Option<SessionNotifier>,
    on_error: Option<ErrorHook>,
    _items: std::marker::PhantomData<fn(T)>,
}

impl<T, F> BatchedAggregator<T, F>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: ItemFetcher<T>,
{
    pub fn new(fetcher: F, cache: Arc<QueryCache<F::Value>>) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            cache,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            session: None,
            on_error: None,
            _items: std::marker::PhantomData,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Where to signal authorization failures.
    pub fn with_session(mut self, session: SessionNotifier) -> Self {
        self.session = Some(session);
        self
    }

    pub fn on_error(
        mut self,
        hook: impl Fn(&QueryKey, &FetchError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Derive tasks for `initial` and start the driver on the current
    /// tokio runtime.
    pub fn spawn(self, initial: impl Into<ItemSource<T>>) -> AggregatorHandle<T, F::Value> {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::empty(0, 0)));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut driver = Driver {
            fetcher: self.fetcher,
            cache: self.cache,
            retry: self.retry,
            session: self.session,
            on_error: self.on_error,
            state: BatchState::new(self.batch_size),
            items: None,
            pending: HashMap::new(),
            in_flight: FuturesUnordered::new(),
            snapshot_tx,
        };
        driver.replace(initial.into().normalize());

        let task = tokio::spawn(driver.run(command_rx));

        AggregatorHandle {
            command_tx,
            snapshots: snapshot_rx,
            task,
        }
    }
}

struct Completion<V> {
    query: QueryKey,
    outcome: Result<V, FetchError>,
}

type InFlight<V> = BoxFuture<'static, Result<Completion<V>, Aborted>>;

struct SetItems<T> {
    items: Vec<T>,
    reply: oneshot::Sender<bool>,
}

enum Event<T, V> {
    Command(Option<SetItems<T>>),
    Done(Result<Completion<V>, Aborted>),
}

struct Driver<T, F: ItemFetcher<T>>
where
    T: Send + Sync,
{
    fetcher: Arc<F>,
    cache: Arc<QueryCache<F::Value>>,
    retry: RetryPolicy,
    session: Option<SessionNotifier>,
    on_error: Option<ErrorHook>,
    state: BatchState<F::Value>,
    /// Normalized items of the current generation.
    items: Option<Vec<T>>,
    /// One running fetch per query, across generations.
    pending: HashMap<QueryKey, AbortHandle>,
    in_flight: FuturesUnordered<InFlight<F::Value>>,
    snapshot_tx: watch::Sender<Arc<Snapshot<F::Value>>>,
}

impl<T, F> Driver<T, F>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: ItemFetcher<T>,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SetItems<T>>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                Some(done) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    Event::Done(done)
                }
            };

            match event {
                Event::Command(Some(SetItems { items, reply })) => {
                    let reset = self.replace(items);
                    let _ = reply.send(reset);
                }
                Event::Command(None) => break,
                Event::Done(Ok(done)) => self.complete(done),
                Event::Done(Err(Aborted)) => {}
            }
        }
        debug!("Aggregator for {} stopped", self.fetcher.kind());
    }

    /// Start a new generation unless `items` equals the current collection.
    fn replace(&mut self, items: Vec<T>) -> bool {
        if self.items.as_ref() == Some(&items) {
            debug!("Item collection unchanged, keeping generation {}", self.state.generation());
            return false;
        }

        let kind = self.fetcher.kind();
        let queries: Vec<QueryKey> = items
            .iter()
            .map(|item| QueryKey::new(kind, self.fetcher.key(item)))
            .collect();
        let generation = self.state.reset(queries.clone());
        self.snapshot_tx
            .send_replace(Arc::new(Snapshot::empty(generation, items.len())));

        let aborted = self.abort_departed(&queries);
        info!(
            "Fetching {} for {} items (generation {})",
            kind,
            items.len(),
            generation
        );
        if aborted > 0 {
            debug!("Aborted {} fetches for items no longer listed", aborted);
        }

        let mut cached = Vec::new();
        let mut joined = 0;
        for (index, (item, query)) in items.iter().zip(queries).enumerate() {
            if self.pending.contains_key(&query) {
                self.state.start(generation, index);
                joined += 1;
                continue;
            }
            if let Some(value) = self.cache.get_fresh(&query) {
                cached.push((index, value));
                continue;
            }

            self.state.start(generation, index);
            self.start_fetch(query, item.clone());
        }

        if joined > 0 {
            debug!("{} of {} joined a running fetch", joined, items.len());
        }
        if !cached.is_empty() {
            debug!("{} of {} served from cache", cached.len(), items.len());
        }
        for (index, value) in cached {
            if let Some(snapshot) = self.state.settle(generation, index, Ok(value)) {
                self.publish(snapshot);
            }
        }

        self.items = Some(items);
        true
    }

    /// Abort running fetches whose query is not in `queries`.
    fn abort_departed(&mut self, queries: &[QueryKey]) -> usize {
        let listed: HashSet<&QueryKey> = queries.iter().collect();
        let before = self.pending.len();
        self.pending.retain(|query, handle| {
            if listed.contains(query) {
                return true;
            }
            handle.abort();
            false
        });
        before - self.pending.len()
    }

    fn start_fetch(&mut self, query: QueryKey, item: T) {
        let fetcher = Arc::clone(&self.fetcher);
        let retry = self.retry;
        let tag = query.clone();
        let (fetch, handle) = abortable(async move {
            let outcome = retry.run(|| fetcher.fetch(&item)).await;
            Completion { query: tag, outcome }
        });
        self.in_flight.push(fetch.boxed());
        self.pending.insert(query, handle);
    }

    fn complete(&mut self, done: Completion<F::Value>) {
        let Completion { query, outcome } = done;
        self.pending.remove(&query);

        if let Ok(value) = &outcome {
            self.cache.insert(query.clone(), value.clone());
        }

        let generation = self.state.generation();
        let waiting = self.state.indices_of(&query);
        if waiting.is_empty() {
            debug!("No task waiting for {} in generation {}", query, generation);
            return;
        }

        for index in waiting {
            if let Err(err) = &outcome {
                if err.is_auth() {
                    if let Some(session) = &self.session {
                        session.session_invalid();
                    }
                }
                match &self.on_error {
                    Some(hook) => hook(&query, err),
                    None => warn!("Fetching {} failed: {}", query, err),
                }
            }

            if let Some(snapshot) = self.state.settle(generation, index, outcome.clone()) {
                self.publish(snapshot);
            }
        }
    }

    fn publish(&self, snapshot: Snapshot<F::Value>) {
        debug!(
            "Publishing {}/{} results (generation {})",
            snapshot.completed,
            snapshot.len(),
            snapshot.generation
        );
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

/// Handle to a running aggregator.
///
/// Dropping the handle stops the driver and cancels outstanding fetches.
pub struct AggregatorHandle<T, V> {
    command_tx: mpsc::UnboundedSender<SetItems<T>>,
    snapshots: watch::Receiver<Arc<Snapshot<V>>>,
    task: JoinHandle<()>,
}

impl<T, V> AggregatorHandle<T, V> {
    /// Replace the item collection.
    ///
    /// Returns `true` if the collection differed structurally from the
    /// current one and a new generation was started.
    pub async fn set_items(&self, source: impl Into<ItemSource<T>>) -> Result<bool, AggregatorError> {
        let (reply, reset) = oneshot::channel();
        self.command_tx
            .send(SetItems {
                items: source.into().normalize(),
                reply,
            })
            .map_err(|_| AggregatorError::Closed)?;
        reset.await.map_err(|_| AggregatorError::Closed)
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Arc<Snapshot<V>> {
        self.snapshots.borrow().clone()
    }

    /// A receiver notified on every publish and reset.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot<V>>> {
        self.snapshots.clone()
    }

    /// Wait for the first snapshot in which every task is terminal.
    pub async fn wait_complete(&self) -> Result<Arc<Snapshot<V>>, AggregatorError> {
        let mut rx = self.snapshots.clone();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if snapshot.is_complete() {
                    return Ok(snapshot.clone());
                }
            }
            rx.changed().await.map_err(|_| AggregatorError::Closed)?;
        }
    }

    /// Stop the driver and wait for it to exit.
    pub async fn shutdown(self) {
        let AggregatorHandle { command_tx, task, .. } = self;
        drop(command_tx);
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Behaviour = fn(i64, usize) -> (Duration, Result<u64, FetchError>);

    #[derive(Clone)]
    struct TestFetcher {
        calls: Arc<Mutex<Vec<i64>>>,
        behaviour: Behaviour,
    }

    impl TestFetcher {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                behaviour,
            }
        }

        fn calls_for(&self, id: i64) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == id).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ItemFetcher<i64> for TestFetcher {
        type Value = u64;

        fn kind(&self) -> TaskKind {
            TaskKind::InvestigationSize
        }

        fn key(&self, item: &i64) -> ItemKey {
            ItemKey::Number(*item)
        }

        async fn fetch(&self, item: &i64) -> Result<u64, FetchError> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(*item);
                calls.iter().filter(|c| **c == *item).count()
            };
            let (delay, outcome) = (self.behaviour)(*item, attempt);
            tokio::time::sleep(delay).await;
            outcome
        }
    }

    fn staggered(id: i64, _attempt: usize) -> (Duration, Result<u64, FetchError>) {
        (Duration::from_millis(10 * id as u64), Ok(id as u64 * 100))
    }

    fn cache() -> Arc<QueryCache<u64>> {
        Arc::new(QueryCache::default())
    }

    fn aggregator(
        fetcher: TestFetcher,
        cache: Arc<QueryCache<u64>>,
    ) -> BatchedAggregator<i64, TestFetcher> {
        BatchedAggregator::new(fetcher, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_after_fifth_tenth_and_twelfth() {
        let handle = aggregator(TestFetcher::new(staggered), cache())
            .spawn((1..=12).collect::<Vec<i64>>());
        let mut rx = handle.subscribe();

        let mut points = Vec::new();
        loop {
            rx.changed().await.unwrap();
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.is_empty() {
                continue;
            }
            assert_eq!(snapshot.len(), 12);
            points.push(snapshot.completed);
            if snapshot.is_complete() {
                break;
            }
        }

        assert_eq!(points, vec![5, 10, 12]);
        assert_eq!(handle.latest().value_for(&ItemKey::from(12)), Some(&1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_items_publish_once_complete() {
        let handle = aggregator(TestFetcher::new(staggered), cache())
            .spawn(vec![1i64, 2, 3]);
        let mut rx = handle.subscribe();

        let mut published = Vec::new();
        loop {
            rx.changed().await.unwrap();
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.is_empty() {
                continue;
            }
            published.push(Arc::clone(&snapshot));
            if snapshot.is_complete() {
                break;
            }
        }

        assert_eq!(published.len(), 1);
        assert_eq!(published[0].completed, 3);
    }

    #[tokio::test]
    async fn test_absent_input_is_empty_and_complete() {
        let fetcher = TestFetcher::new(staggered);
        let handle = aggregator(fetcher.clone(), cache()).spawn(ItemSource::Absent);
        let snapshot = handle.wait_complete().await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structurally_equal_input_does_not_reset() {
        let fetcher = TestFetcher::new(staggered);
        let handle =
            aggregator(fetcher.clone(), cache()).spawn(vec![1i64, 2, 3]);
        let before = handle.wait_complete().await.unwrap();

        let reset = handle
            .set_items(ItemSource::Pages(vec![vec![1i64, 2], vec![3]]))
            .await
            .unwrap();
        assert!(!reset);
        let after = handle.latest();
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.tasks, before.tasks);
        assert_eq!(fetcher.total_calls(), 3);

        let reset = handle.set_items(vec![1i64, 2, 4]).await.unwrap();
        assert!(reset);
        let latest = handle.latest();
        assert_eq!(latest.generation, before.generation + 1);
        assert!(latest.is_empty());

        let done = handle.wait_complete().await.unwrap();
        assert_eq!(done.len(), 3);
        assert_eq!(done.value_for(&ItemKey::from(4)), Some(&400));
        // 1 and 2 came from the cache
        assert_eq!(fetcher.total_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_never_leaks() {
        fn slow_first(id: i64, _attempt: usize) -> (Duration, Result<u64, FetchError>) {
            if id == 1 {
                (Duration::from_secs(3600), Ok(1))
            } else {
                (Duration::from_millis(10), Ok(id as u64))
            }
        }

        let handle =
            aggregator(TestFetcher::new(slow_first), cache()).spawn(vec![1i64]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(handle.set_items(vec![2i64]).await.unwrap());

        let done = handle.wait_complete().await.unwrap();
        assert_eq!(done.generation, 2);
        assert_eq!(done.len(), 1);
        assert_eq!(done.value_for(&ItemKey::from(2)), Some(&2));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        let later = handle.latest();
        assert_eq!(later.generation, 2);
        assert_eq!(later.value_for(&ItemKey::from(1)), None);
    }

    fn slow(id: i64, _attempt: usize) -> (Duration, Result<u64, FetchError>) {
        (Duration::from_secs(1), Ok(id as u64))
    }

    #[tokio::test(start_paused = true)]
    async fn test_growing_mid_flight_keeps_running_fetches() {
        let fetcher = TestFetcher::new(slow);
        let handle = aggregator(fetcher.clone(), cache()).spawn(vec![1i64, 2, 3]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let grown = ItemSource::Pages(vec![vec![1i64, 2, 3], vec![4]]);
        assert!(handle.set_items(grown).await.unwrap());

        let done = handle.wait_complete().await.unwrap();
        assert_eq!(done.generation, 2);
        assert_eq!(done.len(), 4);
        for id in 1..=4 {
            assert_eq!(done.value_for(&ItemKey::from(id)), Some(&(id as u64)));
            assert_eq!(fetcher.calls_for(id), 1);
        }
        assert_eq!(fetcher.total_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_items_are_aborted() {
        let fetcher = TestFetcher::new(slow);
        let shared = cache();
        let handle = aggregator(fetcher.clone(), Arc::clone(&shared)).spawn(vec![1i64, 2]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.set_items(vec![2i64]).await.unwrap());

        let done = handle.wait_complete().await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done.value_for(&ItemKey::from(2)), Some(&2));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            shared.get_fresh(&QueryKey::new(TaskKind::InvestigationSize, 1)),
            None
        );
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_items_share_one_fetch() {
        let fetcher = TestFetcher::new(slow);
        let handle = aggregator(fetcher.clone(), cache()).spawn(vec![5i64, 6, 5]);

        let done = handle.wait_complete().await.unwrap();
        assert_eq!(done.len(), 3);
        assert_eq!(done.tasks[0].value(), Some(&5));
        assert_eq!(done.tasks[2].value(), Some(&5));
        assert_eq!(fetcher.calls_for(5), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_signals_once_and_is_not_retried() {
        fn forbidden_two(id: i64, _attempt: usize) -> (Duration, Result<u64, FetchError>) {
            if id == 2 {
                (
                    Duration::from_millis(5),
                    Err(FetchError::from_status(403, "http://download/user/getSize", "")),
                )
            } else {
                (Duration::from_millis(5), Ok(id as u64))
            }
        }

        let fetcher = TestFetcher::new(forbidden_two);
        let session = SessionNotifier::new();
        let mut signals = session.subscribe();
        let failures = Arc::new(AtomicUsize::new(0));
        let hook_failures = Arc::clone(&failures);

        let handle = aggregator(fetcher.clone(), cache())
            .with_session(session)
            .on_error(move |_, _| {
                hook_failures.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(vec![1i64, 2, 3]);

        let done = handle.wait_complete().await.unwrap();
        assert_eq!(done.failed(), 1);
        assert!(done.tasks[1].error().unwrap().is_auth());
        assert_eq!(done.value_for(&ItemKey::from(3)), Some(&3));

        assert_eq!(fetcher.calls_for(2), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(signals.try_recv().unwrap(), PluginMessage::SignOut);
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_then_recorded() {
        fn flaky(id: i64, attempt: usize) -> (Duration, Result<u64, FetchError>) {
            let err = FetchError::Transport("connection reset".to_string());
            match id {
                1 if attempt < 3 => (Duration::from_millis(5), Err(err)),
                1 => (Duration::from_millis(5), Ok(10)),
                _ => (Duration::from_millis(5), Err(err)),
            }
        }

        let fetcher = TestFetcher::new(flaky);
        let handle = aggregator(fetcher.clone(), cache()).spawn(vec![1i64, 2]);

        let done = handle.wait_complete().await.unwrap();
        assert_eq!(done.value_for(&ItemKey::from(1)), Some(&10));
        assert_eq!(fetcher.calls_for(1), 3);
        assert_eq!(fetcher.calls_for(2), 4);
        assert!(done.tasks[1].error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_cache_serves_second_aggregator() {
        let shared = cache();
        let fetcher = TestFetcher::new(staggered);

        let first = aggregator(fetcher.clone(), Arc::clone(&shared))
            .spawn(vec![1i64, 2, 3]);
        first.wait_complete().await.unwrap();
        first.shutdown().await;
        assert_eq!(fetcher.total_calls(), 3);

        let second = aggregator(fetcher.clone(), shared).spawn(vec![3i64, 2, 1]);
        let snapshot = second.latest();
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.value_for(&ItemKey::from(3)), Some(&300));
        assert_eq!(fetcher.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_wait_complete_is_pending_until_results_arrive() {
        fn never(_: i64, _: usize) -> (Duration, Result<u64, FetchError>) {
            (Duration::from_secs(3600), Ok(0))
        }

        let handle = aggregator(TestFetcher::new(never), cache()).spawn(vec![1i64]);
        let mut wait = tokio_test::task::spawn(handle.wait_complete());
        tokio_test::assert_pending!(wait.poll());
    }
}
