//! Error classification and the retry loop
//!
//! Every upstream failure is classified into one of three classes before
//! any control-flow decision is made:
//!
//! - `RateLimited`: the provider is pushing back. The active credential is
//!   put on cooldown and the pool rotates; a successful rotation retries
//!   immediately with the backoff reset, otherwise the loop waits out the
//!   provider-suggested (or default) cooldown without touching the backoff.
//! - `Transient`: server-side or network trouble. Sleep the current
//!   backoff, then double it up to the cap.
//! - `Fatal`: nothing a retry can fix. Surfaced to the caller at once.
//!
//! Classification reads structure first (HTTP status) and falls back to
//! message markers, so transports that only have text still classify.
//! Backoff sleeps are interruptible through a shutdown watch channel.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::credentials::{Credential, CredentialPool};
use crate::error::{CallError, Error, Result};
use crate::metrics;

/// Message markers that indicate provider pushback.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "quota exceeded",
    "rate limit",
    "too many requests",
    "generaterequestsperminuteperprojectpermodel",
    "quota_metric",
];

/// Message markers for failures worth retrying on the same credential.
const TRANSIENT_MARKERS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "timeout",
    "connection",
    "temporarily unavailable",
];

static RETRY_DELAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"retry_delay[^}]*seconds: (\d+)").expect("static pattern compiles"));
static WAIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)wait (\d+) seconds?").expect("static pattern compiles"));

/// How an upstream failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    Fatal,
}

impl ErrorClass {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Classify an upstream failure.
pub fn classify(error: &CallError) -> ErrorClass {
    match error {
        CallError::Timeout(_) | CallError::Connection(_) => ErrorClass::Transient,
        CallError::Status { status, message } => classify_status(*status, message),
    }
}

/// Classify by HTTP status, deferring to message markers when the status
/// alone does not decide.
pub fn classify_status(status: u16, message: &str) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        408 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
        _ => classify_message(message),
    }
}

/// Marker-based classification for failures without a decisive status.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::RateLimited
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Extract a provider-suggested wait from an error message.
///
/// Understands the structured `retry_delay { seconds: N }` form and the
/// prose `wait N seconds` form.
pub fn parse_retry_delay(message: &str) -> Option<Duration> {
    let captures = RETRY_DELAY_RE
        .captures(message)
        .or_else(|| WAIT_RE.captures(message))?;
    let secs = captures.get(1)?.as_str().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Retry tuning knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the first transient retry.
    pub base_delay: Duration,
    /// Ceiling for the doubled backoff.
    pub max_delay: Duration,
    /// Cooldown applied when the provider rate-limits without suggesting
    /// a wait of its own.
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Drives an upstream operation through classification, credential
/// rotation, and bounded backoff.
pub struct Retrier {
    policy: RetryPolicy,
    pool: Arc<CredentialPool>,
    shutdown: watch::Receiver<bool>,
    _keepalive: Option<watch::Sender<bool>>,
}

impl Retrier {
    /// Retrier without external shutdown wiring.
    pub fn new(policy: RetryPolicy, pool: Arc<CredentialPool>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            policy,
            pool,
            shutdown: rx,
            _keepalive: Some(tx),
        }
    }

    /// Retrier whose backoff sleeps abort when the watch fires (or its
    /// sender goes away).
    pub fn with_shutdown(
        policy: RetryPolicy,
        pool: Arc<CredentialPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policy,
            pool,
            shutdown,
            _keepalive: None,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, a fatal failure surfaces, the attempt
    /// budget runs out, or shutdown interrupts a backoff wait.
    ///
    /// `op` receives the currently active credential on every attempt, so
    /// a rotation between attempts is picked up automatically.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let mut delay = self.policy.base_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let credential = self.pool.current().await;
            let err = match op(credential).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = classify(&err);
            metrics::record_retry_attempt(class.label());
            warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                class = class.label(),
                error = %err,
                "upstream call failed"
            );

            match class {
                ErrorClass::Fatal => return Err(Error::Fatal(err)),
                _ if attempt >= self.policy.max_attempts => {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                ErrorClass::RateLimited => {
                    let suggested = parse_retry_delay(err.message());
                    let cooldown = suggested.unwrap_or(self.policy.rate_limit_cooldown);
                    self.pool.mark_cooldown(cooldown).await;

                    if self.pool.rotate().await {
                        info!("rotated to another credential, retrying immediately");
                        delay = self.policy.base_delay;
                        continue;
                    }

                    info!(
                        wait_secs = cooldown.as_secs(),
                        suggested = suggested.is_some(),
                        "no spare credential, waiting out the rate limit"
                    );
                    self.interruptible_sleep(cooldown).await?;
                }
                ErrorClass::Transient => {
                    info!(delay_secs = delay.as_secs(), "transient failure, backing off");
                    self.interruptible_sleep(delay).await?;
                    delay = (delay * 2).min(self.policy.max_delay);
                }
            }
        }
    }

    async fn interruptible_sleep(&self, duration: Duration) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = shutdown.changed() => Err(Error::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ApiKey;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn status(code: u16, message: &str) -> CallError {
        CallError::Status {
            status: code,
            message: message.into(),
        }
    }

    fn pool(n: usize) -> Arc<CredentialPool> {
        let keys = (0..n).map(|i| ApiKey::new(format!("key-{i}"))).collect();
        Arc::new(CredentialPool::new(keys).unwrap())
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }

    #[test]
    fn classify_429_is_rate_limited() {
        assert_eq!(classify(&status(429, "Too Many Requests")), ErrorClass::RateLimited);
    }

    #[test]
    fn classify_server_errors_are_transient() {
        for code in [408, 500, 502, 503, 504] {
            assert_eq!(classify(&status(code, "boom")), ErrorClass::Transient, "status {code}");
        }
    }

    #[test]
    fn classify_transport_failures_are_transient() {
        assert_eq!(
            classify(&CallError::Timeout("deadline 30s".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&CallError::Connection("refused".into())),
            ErrorClass::Transient
        );
    }

    #[test]
    fn classify_auth_failures_are_fatal() {
        assert_eq!(classify(&status(401, "Unauthorized")), ErrorClass::Fatal);
        assert_eq!(classify(&status(403, "Forbidden")), ErrorClass::Fatal);
        assert_eq!(classify(&status(404, "Not Found")), ErrorClass::Fatal);
        assert_eq!(classify(&status(400, "Bad Request")), ErrorClass::Fatal);
    }

    #[test]
    fn classify_message_markers() {
        assert_eq!(classify_message("Quota exceeded for model"), ErrorClass::RateLimited);
        assert_eq!(classify_message("You hit a RATE LIMIT"), ErrorClass::RateLimited);
        assert_eq!(
            classify_message("violation: GenerateRequestsPerMinutePerProjectPerModel"),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify_message("quota_metric: generate_requests"),
            ErrorClass::RateLimited
        );
        assert_eq!(classify_message("connection reset by peer"), ErrorClass::Transient);
        assert_eq!(
            classify_message("service temporarily unavailable"),
            ErrorClass::Transient
        );
        assert_eq!(classify_message("invalid request payload"), ErrorClass::Fatal);
    }

    #[test]
    fn rate_limit_markers_win_over_transient_markers() {
        // "rate limit" and "timeout" both present: provider pushback wins.
        assert_eq!(
            classify_message("rate limit while waiting, timeout"),
            ErrorClass::RateLimited
        );
    }

    #[test]
    fn parse_structured_retry_delay() {
        // The structured form spreads over lines.
        let message = r#"429 ResourceExhausted: retry_delay {
  seconds: 30
}"#;
        assert_eq!(parse_retry_delay(message), Some(Duration::from_secs(30)));
    }

    #[test]
    fn parse_prose_retry_delay() {
        assert_eq!(
            parse_retry_delay("Please wait 45 seconds before retrying"),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            parse_retry_delay("Wait 7 second"),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn parse_retry_delay_absent() {
        assert_eq!(parse_retry_delay("Too Many Requests"), None);
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let retrier = Retrier::new(policy(), pool(1));
        let calls = AtomicU32::new(0);

        let out = retrier
            .run(|cred| {
                calls.fetch_add(1, Ordering::SeqCst);
                let key = cred.key.expose().to_string();
                async move { Ok::<_, CallError>(key) }
            })
            .await
            .unwrap();

        assert_eq!(out, "key-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_error_surfaces_without_retry() {
        let retrier = Retrier::new(policy(), pool(1));
        let calls = AtomicU32::new(0);

        let err = retrier
            .run(|_cred| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(status(401, "Unauthorized")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Fatal(_)), "got: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_until_success() {
        let retrier = Retrier::new(policy(), pool(1));
        let calls = AtomicU32::new(0);

        let out = retrier
            .run(|_cred| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(status(503, "service unavailable"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        // base 1s, cap 4s, 5 attempts: sleeps of 1 + 2 + 4 + 4 = 11s.
        let retrier = Retrier::new(policy(), pool(1));
        let start = tokio::time::Instant::now();

        let err = retrier
            .run(|_cred| async { Err::<(), _>(status(503, "service unavailable")) })
            .await
            .unwrap_err();

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(11) && elapsed < Duration::from_secs(12),
            "expected ~11s of backoff, got {elapsed:?}"
        );
        assert!(
            matches!(err, Error::RetriesExhausted { attempts: 5, .. }),
            "got: {err:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rotates_and_retries_immediately() {
        let p = pool(2);
        let retrier = Retrier::new(policy(), Arc::clone(&p));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let out = retrier
            .run(|cred| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err(status(429, "Too Many Requests"))
                    } else {
                        Ok(cred.index)
                    }
                }
            })
            .await
            .unwrap();

        // Second attempt runs on the rotated credential with no sleep in
        // between.
        assert_eq!(out, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(p.current().await.index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_spare_key_waits_suggested_delay() {
        let retrier = Retrier::new(policy(), pool(1));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let out = retrier
            .run(|_cred| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err(status(429, "quota exceeded, retry_delay { seconds: 30 }"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 2);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31),
            "expected the suggested 30s wait, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_suggestion_waits_default_cooldown() {
        let retrier = Retrier::new(policy(), pool(1));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        retrier
            .run(|_cred| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err(status(429, "Too Many Requests"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61),
            "expected the 60s default cooldown, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_returns_last_error() {
        let mut p = policy();
        p.max_attempts = 3;
        let retrier = Retrier::new(p, pool(1));
        let calls = AtomicU32::new(0);

        let err = retrier
            .run(|_cred| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(status(502, "bad gateway")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.status(), Some(502));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let p = pool(1);
        let (tx, rx) = watch::channel(false);
        let retrier = Retrier::with_shutdown(policy(), p, rx);
        let calls = AtomicU32::new(0);

        tx.send(true).unwrap();
        let err = retrier
            .run(|_cred| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(status(503, "service unavailable")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Shutdown), "got: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no further attempts after shutdown");
    }
}
