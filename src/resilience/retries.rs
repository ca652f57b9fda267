//! Retry logic.
//!
//! # Responsibilities
//! - Re-execute a fallible unit of work with capped exponential backoff
//! - Decide retryability by message substring or by error kind
//! - Report every non-final failure through the retry callback
//! - Fan a batch of independent operations out concurrently
//!
//! # Design Decisions
//! - The loop suspends on `tokio::time::sleep`, so a paused test clock
//!   drives it without real waits
//! - The final error is returned unchanged; nothing is swallowed
//! - Non-retryable errors abort immediately without consuming attempts
//! - Jitter is opt-in per call (`with_retry_jitter`)

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observability::metrics;
use crate::resilience::backoff::{apply_jitter, calculate_backoff};

/// Details of a failed attempt that is about to be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    /// Delay before the next attempt.
    pub delay: Duration,
    /// Display form of the failure.
    pub error: String,
}

/// Callback fired once per retried failure.
pub type OnRetry = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Retry configuration.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,

    /// Growth factor applied per further attempt, used as given; values
    /// below 1.0 shrink delays and are rejected only by config validation.
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Message substrings marking an error retryable. `None` retries every
    /// error; an empty list retries none.
    pub retryable_errors: Option<Vec<String>>,

    /// Jitter as a fraction of the computed delay (used by `with_retry_jitter`).
    pub jitter_ratio: f64,

    #[serde(skip)]
    pub on_retry: Option<OnRetry>,
}

impl RetryOptions {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.initial_delay_ms = initial.as_millis() as u64;
        self.backoff_multiplier = multiplier;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_retryable_errors<I, S>(mut self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = Some(substrings.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_on_retry(mut self, callback: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay preceding attempt `attempt + 1`, before jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.initial_delay(), self.backoff_multiplier, self.max_delay())
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            retryable_errors: None,
            jitter_ratio: 0.1,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay_ms", &self.initial_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("retryable_errors", &self.retryable_errors)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Errors that expose a discrete kind, for kind-based retry classification.
pub trait Classified {
    type Kind: PartialEq;

    fn kind(&self) -> Self::Kind;
}

/// Outcome of [`retry_batch`].
#[derive(Debug)]
pub struct BatchOutcome<T, E> {
    /// Results of operations that eventually succeeded, in input order.
    pub successes: Vec<T>,
    /// Final errors of operations that exhausted their attempts, in input order.
    pub failures: Vec<E>,
}

/// How a failure is judged retryable.
enum RetryOn<'a, E> {
    Any,
    MessageContains(&'a [String]),
    Predicate(&'a (dyn Fn(&E) -> bool + Sync)),
}

impl<E: fmt::Display> RetryOn<'_, E> {
    fn should_retry(&self, err: &E) -> bool {
        match self {
            Self::Any => true,
            Self::MessageContains(needles) => {
                let message = err.to_string();
                needles.iter().any(|n| message.contains(n.as_str()))
            }
            Self::Predicate(p) => p(err),
        }
    }
}

impl<'a, E> RetryOn<'a, E> {
    fn from_options(options: &'a RetryOptions) -> Self {
        match &options.retryable_errors {
            Some(needles) => Self::MessageContains(needles),
            None => Self::Any,
        }
    }
}

/// Attempt `f` up to `options.max_attempts` times with capped exponential backoff.
pub async fn with_retry<F, Fut, T, E>(f: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    run(f, options, RetryOn::from_options(options), false).await
}

/// Same contract as [`with_retry`], with a random component added to each delay.
pub async fn with_retry_jitter<F, Fut, T, E>(f: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    run(f, options, RetryOn::from_options(options), true).await
}

/// Retry only errors whose kind is in `kinds`; any other error aborts at once.
/// `options.retryable_errors` is ignored.
pub async fn retry_on_specific_errors<F, Fut, T, E>(f: F, kinds: &[E::Kind], options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classified + fmt::Display,
    E::Kind: Sync,
{
    let matches_kind = |e: &E| kinds.contains(&e.kind());
    run(f, options, RetryOn::Predicate(&matches_kind), false).await
}

/// Retry only errors for which `predicate` returns true.
pub async fn with_retry_if<F, Fut, T, E, P>(f: F, options: &RetryOptions, predicate: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool + Sync,
{
    run(f, options, RetryOn::Predicate(&predicate), false).await
}

/// Run [`with_retry`] over every operation concurrently.
pub async fn retry_batch<F, Fut, T, E>(operations: Vec<F>, options: &RetryOptions) -> BatchOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let results = futures_util::future::join_all(
        operations.into_iter().map(|op| with_retry(op, options)),
    )
    .await;

    let mut outcome = BatchOutcome {
        successes: Vec::new(),
        failures: Vec::new(),
    };
    for result in results {
        match result {
            Ok(value) => outcome.successes.push(value),
            Err(e) => outcome.failures.push(e),
        }
    }
    tracing::debug!(
        succeeded = outcome.successes.len(),
        failed = outcome.failures.len(),
        "Retry batch finished"
    );
    outcome
}

async fn run<F, Fut, T, E>(mut f: F, options: &RetryOptions, retry_on: RetryOn<'_, E>, jitter: bool) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !retry_on.should_retry(&err) {
                    tracing::debug!(attempt, error = %err, "Non-retryable error");
                    return Err(err);
                }
                if attempt >= max_attempts {
                    tracing::warn!(attempts = attempt, error = %err, "All retry attempts exhausted");
                    return Err(err);
                }

                let mut delay = options.delay_after(attempt);
                if jitter {
                    delay = apply_jitter(delay, options.jitter_ratio);
                }
                let info = RetryAttempt {
                    attempt,
                    delay,
                    error: err.to_string(),
                };

                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %info.error,
                    "Retrying after failure"
                );
                metrics::record_retry();
                if let Some(on_retry) = &options.on_retry {
                    on_retry(&info);
                }

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast(max_attempts: u32) -> RetryOptions {
        RetryOptions::new(max_attempts).with_delays(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1000),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let options = fast(3).with_on_retry(move |a| recorder.lock().unwrap().push((a.attempt, a.delay)));

        let res: Result<(), String> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("connection reset".to_string())
            },
            &options,
        )
        .await;

        assert_eq!(res.unwrap_err(), "connection reset");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, Duration::from_millis(100)), (2, Duration::from_millis(200))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let res = with_retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("503 unavailable")
                } else {
                    Ok("minted")
                }
            },
            &fast(5),
        )
        .await;
        assert_eq!(res, Ok("minted"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_substring_is_not_retried() {
        let calls = AtomicU32::new(0);
        let retried = Arc::new(AtomicU32::new(0));
        let r = retried.clone();
        let options = fast(3)
            .with_retryable_errors(["timeout"])
            .with_on_retry(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            });

        let res: Result<(), &str> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("card declined")
            },
            &options,
        )
        .await;

        assert_eq!(res, Err("card declined"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retried.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_retryable_list_retries_nothing() {
        let calls = AtomicU32::new(0);
        let options = fast(4).with_retryable_errors(Vec::<String>::new());
        let _: Result<(), &str> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("timeout")
            },
            &options,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_keeps_delay_within_bounds() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let d = delays.clone();
        let options = fast(3).with_on_retry(move |a| d.lock().unwrap().push(a.delay));

        let _: Result<(), &str> = with_retry_jitter(|| async { Err("timeout") }, &options).await;

        let delays = delays.lock().unwrap();
        assert_eq!(delays.len(), 2);
        assert!(delays[0] >= Duration::from_millis(100) && delays[0] < Duration::from_millis(110));
        assert!(delays[1] >= Duration::from_millis(200) && delays[1] < Duration::from_millis(220));
    }

    #[derive(Debug, PartialEq)]
    enum GatewayError {
        Timeout,
        Declined,
    }

    impl fmt::Display for GatewayError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Classified for GatewayError {
        type Kind = &'static str;

        fn kind(&self) -> Self::Kind {
            match self {
                Self::Timeout => "timeout",
                Self::Declined => "declined",
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_kind_based_classification() {
        let calls = AtomicU32::new(0);
        let res: Result<(), GatewayError> = retry_on_specific_errors(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GatewayError::Timeout)
                } else {
                    Err(GatewayError::Declined)
                }
            },
            &["timeout"],
            &fast(5),
        )
        .await;

        assert_eq!(res, Err(GatewayError::Declined));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn op(outcome: Result<u32, String>) -> impl FnMut() -> std::future::Ready<Result<u32, String>> {
        move || std::future::ready(outcome.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_partitions_results() {
        let ops = vec![op(Ok(1)), op(Err("always fails".to_string())), op(Ok(3))];

        let outcome = retry_batch(ops, &fast(1)).await;
        assert_eq!(outcome.successes, vec![1, 3]);
        assert_eq!(outcome.failures, vec!["always fails".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_runs_concurrently() {
        let start = tokio::time::Instant::now();
        let ops: Vec<_> = (0..4)
            .map(|_| || async { Err::<(), _>("rpc timeout") })
            .collect();

        let outcome = retry_batch(ops, &fast(3)).await;
        assert_eq!(outcome.failures.len(), 4);
        // 100ms + 200ms for one operation, not four times that
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let ops: Vec<fn() -> std::future::Ready<Result<(), String>>> = Vec::new();
        let outcome = retry_batch(ops, &RetryOptions::default()).await;
        assert!(outcome.successes.is_empty());
        assert!(outcome.failures.is_empty());
    }
}
