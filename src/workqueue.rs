//! Rate limited, deduplicating work queue of resource keys.
//!
//! A key is either pending (queued), in flight (handed to a worker), or both: adding a key
//! that is in flight marks it dirty and it is queued again once the current run is done.
//! So two workers never process the same key at the same time, while distinct keys are
//! processed in parallel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: &'static str,
    max_retries: u32,
    backoff: Backoff,
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: &'static str, max_retries: u32) -> Self {
        Self::with_backoff(name, max_retries, Backoff::default())
    }

    pub fn with_backoff(name: &'static str, max_retries: u32, backoff: Backoff) -> Self {
        WorkQueue {
            name,
            max_retries,
            backoff,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` for processing. A no-op if the key is already pending or the queue is shut down.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            debug!(queue = self.name, key, "Key is in flight, deferring until it is done");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: String, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Waits for the next pending key and marks it in flight. Returns `None` once shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let mut notified = Box::pin(self.notify.notified());
            notified.as_mut().enable();

            let next = {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                state.queue.pop_front().map(|key| {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    (key, !state.queue.is_empty())
                })
            };

            if let Some((key, more)) = next {
                drop(notified);
                if more {
                    self.notify.notify_one();
                }
                return Some(key);
            }

            notified.await;
        }
    }

    /// Marks a key handed out by [`WorkQueue::get`] as no longer in flight.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears the failure count of `key`.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out keys and wakes all idle workers. Delayed re-adds are discarded.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Records the outcome of one handler run, scheduling a retry on failure until
    /// `max_retries` attempts have been made.
    fn handle_result<E: Display>(self: &Arc<Self>, key: &str, result: Result<(), E>) {
        let error = match result {
            Ok(()) => {
                self.forget(key);
                return;
            }
            Err(error) => error,
        };

        let attempts = {
            let mut state = self.state();
            let failures = state.failures.entry(key.to_owned()).or_insert(0);
            *failures += 1;
            *failures
        };

        if attempts < self.max_retries {
            let delay = self.backoff.delay(attempts - 1);
            warn!(queue = self.name, key, attempts, ?delay, "Processing failed, retrying: {error}");
            self.add_after(key.to_owned(), delay);
        } else {
            error!(queue = self.name, key, attempts, "Processing failed, dropping key: {error}");
            self.forget(key);
        }
    }

    async fn worker<F, Fut, E>(self: Arc<Self>, handler: Arc<F>)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        while let Some(key) = self.get().await {
            // A panicking handler counts as a failed attempt.
            match tokio::spawn((*handler)(key.clone())).await {
                Ok(result) => self.handle_result(&key, result),
                Err(panicked) => self.handle_result(&key, Err::<(), _>(panicked)),
            }
            self.done(&key);
        }
    }

    /// Runs `workers` worker loops calling `handler` for each key until `stop` completes,
    /// then shuts the queue down and waits for in-flight handlers to finish.
    pub async fn run<F, Fut, E>(self: Arc<Self>, workers: usize, handler: F, stop: impl Future<Output = ()>)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        info!(queue = self.name, workers, "Starting workers");
        let handler = Arc::new(handler);
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(Arc::clone(&self).worker(Arc::clone(&handler)));
        }

        stop.await;
        info!(queue = self.name, "Shutting down workers");
        self.shutdown();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(queue = self.name, "Worker terminated abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;
    use tokio::time::sleep;

    use super::*;

    fn stop_signal() -> (oneshot::Sender<()>, impl Future<Output = ()>) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(4), Duration::from_millis(80));
        assert_eq!(backoff.delay(30), Duration::from_secs(1000));
        assert_eq!(backoff.delay(64), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn pending_key_is_deduplicated() {
        let queue = WorkQueue::new("test", 3);
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_in_flight_is_requeued_after_done() {
        let queue = WorkQueue::new("test", 3);
        queue.add("ns/a");
        let key = queue.get().await.unwrap();

        queue.add("ns/a");
        queue.add("ns/a");
        assert!(queue.is_empty(), "in-flight key must not be handed out twice");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn get_returns_none_after_shutdown() {
        let queue = Arc::new(WorkQueue::new("test", 3));
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("ns/a");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_handler_in_flight_per_key() {
        let queue = Arc::new(WorkQueue::new("test", 3));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let handler = {
            let (in_flight, max_in_flight, calls) = (in_flight.clone(), max_in_flight.clone(), calls.clone());
            move |_key: String| {
                let (in_flight, max_in_flight, calls) = (in_flight.clone(), max_in_flight.clone(), calls.clone());
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, crate::Error>(())
                }
            }
        };

        queue.add("ns/a");
        let (stop, stopped) = stop_signal();
        let running = tokio::spawn(Arc::clone(&queue).run(4, handler, stopped));

        sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            queue.add("ns/a");
        }
        sleep(Duration::from_secs(1)).await;

        stop.send(()).unwrap();
        running.await.unwrap();

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_in_parallel() {
        let queue = Arc::new(WorkQueue::new("test", 3));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let handler = {
            let (in_flight, max_in_flight) = (in_flight.clone(), max_in_flight.clone());
            move |_key: String| {
                let (in_flight, max_in_flight) = (in_flight.clone(), max_in_flight.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, crate::Error>(())
                }
            }
        };

        queue.add("ns/a");
        queue.add("ns/b");
        let (stop, stopped) = stop_signal();
        let running = tokio::spawn(Arc::clone(&queue).run(2, handler, stopped));
        sleep(Duration::from_secs(1)).await;
        stop.send(()).unwrap();
        running.await.unwrap();

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_key_is_attempted_max_retries_times_then_dropped() {
        let queue = Arc::new(WorkQueue::new("test", 4));
        let calls = Arc::new(AtomicUsize::new(0));

        let handler = {
            let calls = calls.clone();
            move |key: String| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(crate::Error::InvalidKey(key))
                }
            }
        };

        queue.add("broken");
        let (stop, stopped) = stop_signal();
        let running = tokio::spawn(Arc::clone(&queue).run(2, handler, stopped));

        sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(queue.failures("broken"), 0);
        assert!(queue.is_empty());

        stop.send(()).unwrap();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failure_resets_failure_count() {
        let queue = Arc::new(WorkQueue::new("test", 5));
        let calls = Arc::new(AtomicUsize::new(0));

        let handler = {
            let calls = calls.clone();
            move |key: String| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(crate::Error::InvalidKey(key))
                    } else {
                        Ok(())
                    }
                }
            }
        };

        queue.add("ns/flaky");
        let (stop, stopped) = stop_signal();
        let running = tokio::spawn(Arc::clone(&queue).run(1, handler, stopped));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.failures("ns/flaky"), 0);

        stop.send(()).unwrap();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_is_retried() {
        let queue = Arc::new(WorkQueue::new("test", 3));
        let calls = Arc::new(AtomicUsize::new(0));

        let handler = {
            let calls = calls.clone();
            move |_key: String| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("handler blew up");
                    }
                    Ok::<_, crate::Error>(())
                }
            }
        };

        queue.add("ns/a");
        let (stop, stopped) = stop_signal();
        let running = tokio::spawn(Arc::clone(&queue).run(1, handler, stopped));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.failures("ns/a"), 0);

        queue.add("ns/a");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        stop.send(()).unwrap();
        running.await.unwrap();
    }
}
