//! Change-token coordination for WAF Regional mutations.
//!
//! Every mutating WAF Regional call must carry a change token fetched
//! immediately before the call, and the service only honors the most recently
//! issued token per region. Concurrent fetch/use races come back as
//! `WAFStaleDataException`, so all token-consuming work for a region is
//! funneled through one lock and retried on staleness.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use lazy_static::lazy_static;
use thiserror::Error;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

const DEFAULT_BUDGET: Duration = Duration::from_secs(15 * 60);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

lazy_static! {
    /// Process-wide lock table shared by every provider instance, so the
    /// one-token-in-flight-per-region invariant holds across the whole process.
    pub static ref REGION_LOCKS: Arc<RegionLocks> = Arc::new(RegionLocks::new());
}

/// Named mutual-exclusion locks keyed by region, created lazily on first use.
#[derive(Default)]
pub struct RegionLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RegionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, region: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(region.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Blocks the task until the region's lock is held. The guard releases the
    /// lock when dropped, on every exit path.
    pub async fn lock(&self, region: &str) -> OwnedMutexGuard<()> {
        self.entry(region).lock_owned().await
    }
}

/// How an operation error relates to the change-token protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The token was superseded by another caller before use; retryable.
    StaleToken,
    /// Any other failure; terminal.
    Other,
}

pub trait ChangeTokenSource {
    fn change_token(&self) -> impl Future<Output = Result<String, anyhow::Error>> + Send;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("failed to acquire change token: {0}")]
    TokenAcquisition(#[source] anyhow::Error),
    #[error("cancelled while coordinating change token")]
    Cancelled,
    #[error(transparent)]
    Operation(E),
}

/// Runs a mutating operation under the region's exclusive lock, handing it a
/// fresh change token per attempt and retrying staleness within a bounded
/// window.
pub struct ChangeTokenRetryer<S> {
    source: S,
    region: String,
    locks: Arc<RegionLocks>,
    budget: Duration,
    retry_delay: Duration,
}

impl<S: ChangeTokenSource> ChangeTokenRetryer<S> {
    pub fn new(source: S, region: impl ToString, locks: Arc<RegionLocks>) -> Self {
        Self {
            source,
            region: region.to_string(),
            locks,
            budget: DEFAULT_BUDGET,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Fetch-token-then-mutate with staleness retries.
    ///
    /// Token-fetch failures abort immediately without invoking `op`. Errors
    /// that `classify` maps to [`ErrorClass::StaleToken`] are retried with a
    /// fresh token until the budget elapses; all other operation errors are
    /// returned unchanged. Once the budget is exhausted one final unconditional
    /// attempt is made and its outcome returned as-is, so an operation that is
    /// still making progress under slow eventual consistency gets a last
    /// chance rather than a hard failure.
    pub async fn retry_with_token<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        classify: impl Fn(&E) -> ErrorClass,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _guard = self.locks.lock(&self.region).await;
        let deadline = Instant::now() + self.budget;
        loop {
            match self.attempt(cancel, &mut op).await? {
                Ok(out) => return Ok(out),
                Err(err) if classify(&err) == ErrorClass::StaleToken => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(err) => return Err(RetryError::Operation(err)),
            }
        }
        // Budget spent on staleness alone: one more try, returned as-is even
        // if it fails stale again.
        self.attempt(cancel, &mut op)
            .await?
            .map_err(RetryError::Operation)
    }

    async fn attempt<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &mut F,
    ) -> Result<Result<T, E>, RetryError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // Biased so a cancelled token always wins over a ready fetch; the
        // operation must never run once cancellation has been requested.
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            fetched = self.source.change_token() => {
                fetched.map_err(RetryError::TokenAcquisition)?
            }
        };
        Ok(op(token).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTokens {
        issued: AtomicUsize,
        fail_with: Option<String>,
    }

    impl FakeTokens {
        fn new() -> Self {
            Self {
                issued: AtomicUsize::new(0),
                fail_with: None,
            }
        }
        fn failing(message: &str) -> Self {
            Self {
                issued: AtomicUsize::new(0),
                fail_with: Some(message.to_owned()),
            }
        }
        fn issued(&self) -> usize {
            self.issued.load(Ordering::SeqCst)
        }
    }

    impl ChangeTokenSource for &FakeTokens {
        async fn change_token(&self) -> Result<String, anyhow::Error> {
            if let Some(message) = &self.fail_with {
                return Err(anyhow!("{message}"));
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{n}"))
        }
    }

    fn classify(err: &String) -> ErrorClass {
        if err == "stale" {
            ErrorClass::StaleToken
        } else {
            ErrorClass::Other
        }
    }

    fn retryer<'a>(
        source: &'a FakeTokens,
        region: &str,
        locks: Arc<RegionLocks>,
    ) -> ChangeTokenRetryer<&'a FakeTokens> {
        ChangeTokenRetryer::new(source, region, locks)
            .with_budget(Duration::from_millis(100))
            .with_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn stale_twice_then_success() {
        let tokens = FakeTokens::new();
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let out = retryer(&tokens, "us-east-1", locks)
            .retry_with_token(&cancel, classify, |token| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(token, format!("token-{n}"));
                    if n < 2 {
                        Err("stale".to_owned())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(tokens.issued(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_stale_error_is_terminal() {
        let tokens = FakeTokens::new();
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let out: Result<(), _> = retryer(&tokens, "us-east-1", locks)
            .retry_with_token(&cancel, classify, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("access denied".to_owned()) }
            })
            .await;
        match out {
            Err(RetryError::Operation(err)) => assert_eq!(err, "access denied"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_fetch_failure_skips_operation_and_releases_lock() {
        let tokens = FakeTokens::failing("throttled");
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        let out: Result<(), _> = retryer(&tokens, "us-west-2", locks.clone())
            .retry_with_token(&cancel, classify, |_token| async {
                panic!("operation must not run without a token")
            })
            .await;
        match out {
            Err(RetryError::TokenAcquisition(err)) => {
                assert!(err.to_string().contains("throttled"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The lock must have been released despite the failure.
        let healthy = FakeTokens::new();
        let out = retryer(&healthy, "us-west-2", locks)
            .retry_with_token(&cancel, classify, |_token| async { Ok::<_, String>(1) })
            .await;
        assert_eq!(out.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_makes_one_final_attempt() {
        let tokens = FakeTokens::new();
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let out: Result<(), _> = retryer(&tokens, "us-east-1", locks)
            .retry_with_token(&cancel, classify, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("stale".to_owned()) }
            })
            .await;
        // Final error surfaces as-is even though it is the same staleness.
        match out {
            Err(RetryError::Operation(err)) => assert_eq!(err, "stale"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // 100ms budget, 10ms delay: the loop runs ~11 attempts, then exactly
        // one more outside it.
        let calls = calls.load(Ordering::SeqCst);
        assert!(calls >= 3, "expected repeated retries, got {calls}");
        assert_eq!(tokens.issued(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn final_attempt_may_still_succeed() {
        let tokens = FakeTokens::new();
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        let budget_attempts = 11; // 100ms budget / 10ms delay
        let calls = AtomicUsize::new(0);
        let out = retryer(&tokens, "us-east-1", locks)
            .retry_with_token(&cancel, classify, |_token| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < budget_attempts {
                        Err("stale".to_owned())
                    } else {
                        Ok("late")
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_retry_loop() {
        let tokens = FakeTokens::new();
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let out: Result<(), RetryError<String>> = retryer(&tokens, "us-east-1", locks)
            .retry_with_token(&cancel, classify, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("stale".to_owned()) }
            })
            .await;
        assert!(matches!(out, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_never_reaches_the_operation() {
        let tokens = FakeTokens::new();
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        // Repeated runs would surface any race between the cancel branch and
        // a ready token fetch.
        for _ in 0..64 {
            let out: Result<(), RetryError<String>> =
                retryer(&tokens, "us-east-1", locks.clone())
                    .retry_with_token(&cancel, classify, |_token| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .await;
            assert!(matches!(out, Err(RetryError::Cancelled)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tokens.issued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let tokens = FakeTokens::new();
        let locks = Arc::new(RegionLocks::new());
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let out: Result<(), RetryError<String>> = retryer(&tokens, "us-east-1", locks)
            .retry_with_token(&cancel, classify, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                async { Err("stale".to_owned()) }
            })
            .await;
        assert!(matches!(out, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_region_calls_are_mutually_exclusive() {
        let locks = Arc::new(RegionLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            joins.push(tokio::spawn(async move {
                let tokens = FakeTokens::new();
                let cancel = CancellationToken::new();
                let retryer = ChangeTokenRetryer::new(&tokens, "us-east-1", locks)
                    .with_budget(Duration::from_millis(100))
                    .with_retry_delay(Duration::from_millis(10));
                retryer
                    .retry_with_token(&cancel, classify, |_token| {
                        let in_flight = in_flight.clone();
                        async move {
                            let concurrent = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            assert_eq!(concurrent, 1, "locked section entered concurrently");
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, String>(())
                        }
                    })
                    .await
                    .unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_regions_do_not_serialize() {
        let locks = Arc::new(RegionLocks::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let east = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let tokens = FakeTokens::new();
                let cancel = CancellationToken::new();
                let mut release_rx = Some(release_rx);
                ChangeTokenRetryer::new(&tokens, "us-east-1", locks)
                    .retry_with_token(&cancel, classify, move |_token| {
                        let release_rx = release_rx.take().unwrap();
                        async move {
                            // Held until the other region's call completes; a
                            // cross-region lock would deadlock here.
                            release_rx.await.unwrap();
                            Ok::<_, String>(())
                        }
                    })
                    .await
                    .unwrap();
            })
        };
        let west = tokio::spawn(async move {
            let tokens = FakeTokens::new();
            let cancel = CancellationToken::new();
            let mut release_tx = Some(release_tx);
            ChangeTokenRetryer::new(&tokens, "eu-west-1", locks)
                .retry_with_token(&cancel, classify, move |_token| {
                    let release_tx = release_tx.take().unwrap();
                    async move {
                        release_tx.send(()).unwrap();
                        Ok::<_, String>(())
                    }
                })
                .await
                .unwrap();
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            west.await.unwrap();
            east.await.unwrap();
        })
        .await
        .expect("regions must not block each other");
    }
}
