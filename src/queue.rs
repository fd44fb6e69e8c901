//! Request coalescing for expensive refresh operations.
//!
//! A [`Queue`] guarantees that concurrent requests for the same key result in
//! exactly one invocation of the worker, with the single outcome fanned out
//! to every caller that asked while the invocation was in flight. Completed
//! invocations leave a cooldown window behind; a new invocation for the same
//! key does not start until the window has elapsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default cooldown between two invocations for the same key.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Default deadline for a single worker invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors delivered to requesters.
///
/// Every waiter of a coalesced invocation receives the same outcome, so the
/// worker error type `E` must be `Clone`.
#[derive(Error, Debug, Clone)]
pub enum Error<E> {
    /// The key was an empty string. All keys must be non-empty.
    #[error("key may not be an empty string")]
    EmptyKey,
    /// The invocation went away before delivering a result. This should not
    /// occur through the public [`Queue::request`] contract.
    #[error("invocation abandoned before a result was delivered")]
    Abandoned,
    /// The worker did not finish within the configured deadline.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),
    /// The worker itself failed; its error is passed on verbatim.
    #[error(transparent)]
    Worker(E),
}

/// A long-running task invoked at most once concurrently per key.
///
/// The worker may be invoked concurrently with *different* keys. On timeout
/// the invocation future is dropped, so the worker should be cancel-safe at
/// its await points.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The failure type reported to waiters.
    type Error: std::error::Error + Clone + Send + Sync + 'static;

    /// Perform the task for `key`.
    async fn work(&self, key: &str) -> Result<(), Self::Error>;
}

/// Configuration shared by all per-key units of a [`Queue`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Minimum interval between two invocations for the same key.
    pub cooldown: Duration,
    /// Deadline for a single invocation.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

type Respondent<E> = oneshot::Sender<Result<(), Error<E>>>;

/// Per-key mutable state: whether an invocation is running, the waiters
/// accumulated since it started, and the cooldown gate for the next one.
struct State<E> {
    invoked: bool,
    cooldown_until: Option<Instant>,
    respondents: Vec<Respondent<E>>,
}

impl<E> Default for State<E> {
    fn default() -> Self {
        Self {
            invoked: false,
            cooldown_until: None,
            respondents: Vec::new(),
        }
    }
}

struct Line<E> {
    key: String,
    state: Mutex<State<E>>,
}

impl<E> Line<E> {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            state: Mutex::new(State::default()),
        }
    }
}

/// Manages coalesced invocations of a [`Worker`].
///
/// Units are created lazily on first use and live for the life of the queue;
/// key cardinality is expected to be small (one per configured repository).
pub struct Queue<W: Worker> {
    config: Config,
    worker: Arc<W>,
    lines: Mutex<HashMap<String, Arc<Line<W::Error>>>>,
}

impl<W: Worker> Queue<W> {
    /// Returns a new queue invoking `worker`.
    pub fn new(config: Config, worker: W) -> Self {
        Self {
            config,
            worker: Arc::new(worker),
            lines: Mutex::new(HashMap::new()),
        }
    }

    /// Requests that the worker is invoked with `key`, and waits for the
    /// outcome.
    ///
    /// If an invocation for `key` is already in flight, no new invocation is
    /// started; the caller receives the outcome of the in-flight one.
    /// Dropping the returned future detaches this caller only; other waiters
    /// and the invocation itself are unaffected.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyKey`] for an empty key, [`Error::Timeout`] when the
    /// invocation exceeds the configured deadline, and [`Error::Worker`] with
    /// the worker's own failure.
    pub async fn request(&self, key: &str) -> Result<(), Error<W::Error>> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(key, tx);

        rx.await.unwrap_or(Err(Error::Abandoned))
    }

    /// Registers `respondent` as a waiter for `key`, starting an invocation
    /// if none is in flight.
    fn enqueue(&self, key: &str, respondent: Respondent<W::Error>) {
        let line = {
            let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
            let line = lines
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Line::new(key)));
            Arc::clone(line)
        };

        let start = {
            let mut state = line.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.respondents.push(respondent);
            if state.invoked {
                false
            } else {
                state.invoked = true;
                true
            }
        };

        if start {
            self.spawn_invocation(line);
        }
    }

    fn spawn_invocation(&self, line: Arc<Line<W::Error>>) {
        let worker = Arc::clone(&self.worker);
        let config = self.config;

        tokio::spawn(async move {
            // Wait out any cooldown left behind by the previous invocation.
            // Only one invocation per line runs at a time, so this read does
            // not race with a concurrent writer.
            let cooldown_until = line
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cooldown_until;
            if let Some(until) = cooldown_until {
                tokio::time::sleep_until(until).await;
            }

            tracing::debug!(key = %line.key, "invoking worker");

            let outcome = match tokio::time::timeout(config.timeout, worker.work(&line.key)).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(Error::Worker(err)),
                Err(_) => Err(Error::Timeout(config.timeout)),
            };

            let respondents = {
                let mut state = line.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.invoked = false;
                state.cooldown_until = Some(Instant::now() + config.cooldown);
                std::mem::take(&mut state.respondents)
            };

            // Sends are non-blocking, so a slow consumer cannot hold up the
            // others or the next cycle. A send fails only when the waiter
            // went away, which is its business alone.
            for respondent in respondents {
                drop(respondent.send(outcome.clone()));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("worker failed: {0}")]
    struct TestError(String);

    struct TestWorker {
        delay: Duration,
        count: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
        completed: AtomicBool,
        fail: Option<TestError>,
    }

    impl TestWorker {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                count: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
                completed: AtomicBool::new(false),
                fail: None,
            }
        }

        fn failing(delay: Duration, message: &str) -> Self {
            Self {
                fail: Some(TestError(message.to_string())),
                ..Self::new(delay)
            }
        }
    }

    #[async_trait]
    impl Worker for Arc<TestWorker> {
        type Error = TestError;

        async fn work(&self, _key: &str) -> Result<(), TestError> {
            self.starts.lock().unwrap().push(Instant::now());
            tokio::time::sleep(self.delay).await;
            self.count.fetch_add(1, Ordering::SeqCst);
            self.completed.store(true, Ordering::SeqCst);
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn quick_config() -> Config {
        Config {
            cooldown: Duration::from_millis(1),
            timeout: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn single_request_invokes_worker_once() {
        let worker = Arc::new(TestWorker::new(Duration::from_millis(5)));
        let queue = Queue::new(quick_config(), Arc::clone(&worker));

        queue.request("foo").await.unwrap();

        assert_eq!(worker.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_into_one_invocation() {
        let worker = Arc::new(TestWorker::new(Duration::from_millis(100)));
        let queue = Arc::new(Queue::new(quick_config(), Arc::clone(&worker)));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { queue.request("foo").await }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(worker.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_waiters_receive_the_same_failure() {
        let worker = Arc::new(TestWorker::failing(Duration::from_millis(100), "NOTOK"));
        let queue = Arc::new(Queue::new(quick_config(), Arc::clone(&worker)));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { queue.request("foo").await }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Worker(TestError(m)) if m == "NOTOK"));
        }

        assert_eq!(worker.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_invocations_respect_cooldown() {
        let cooldown = Duration::from_millis(200);
        let worker = Arc::new(TestWorker::new(Duration::from_millis(1)));
        let queue = Queue::new(
            Config {
                cooldown,
                timeout: Duration::from_secs(15),
            },
            Arc::clone(&worker),
        );

        queue.request("foo").await.unwrap();
        queue.request("foo").await.unwrap();

        let starts = worker.starts.lock().unwrap();
        assert_eq!(starts.len(), 2);
        assert!(starts[1] - starts[0] >= cooldown);
    }

    #[tokio::test]
    async fn over_deadline_worker_times_out() {
        let worker = Arc::new(TestWorker::new(Duration::from_secs(10)));
        let queue = Queue::new(
            Config {
                cooldown: Duration::from_millis(1),
                timeout: Duration::from_millis(50),
            },
            Arc::clone(&worker),
        );

        let err = queue.request("foo").await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        // The invocation was dropped at its sleep; its completion side
        // effect must never be observed.
        assert!(!worker.completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn empty_key_is_rejected_without_invoking_worker() {
        let worker = Arc::new(TestWorker::new(Duration::from_millis(1)));
        let queue = Queue::new(quick_config(), Arc::clone(&worker));

        let err = queue.request("").await.unwrap_err();

        assert!(matches!(err, Error::EmptyKey));
        assert_eq!(worker.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_affect_others() {
        let worker = Arc::new(TestWorker::new(Duration::from_millis(100)));
        let queue = Arc::new(Queue::new(quick_config(), Arc::clone(&worker)));

        let cancelled = {
            let queue = Arc::clone(&queue);
            tokio::time::timeout(Duration::from_millis(10), async move {
                queue.request("foo").await
            })
        };
        let patient = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.request("foo").await })
        };

        assert!(cancelled.await.is_err());
        patient.await.unwrap().unwrap();
        assert_eq!(worker.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_invoke_independently() {
        let worker = Arc::new(TestWorker::new(Duration::from_millis(20)));
        let queue = Arc::new(Queue::new(quick_config(), Arc::clone(&worker)));

        let foo = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.request("foo").await })
        };
        let bar = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.request("bar").await })
        };

        foo.await.unwrap().unwrap();
        bar.await.unwrap().unwrap();
        assert_eq!(worker.count.load(Ordering::SeqCst), 2);
    }
}
