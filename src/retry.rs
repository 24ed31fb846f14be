//! Retry logic with exponential backoff
//!
//! Used for manifest retrieval, where transient HTTP failures (timeouts,
//! refused connections, 5xx answers) are worth another attempt.
//!
//! ```no_run
//! use newsweave::config::RetryConfig;
//! use newsweave::retry::fetch_with_retry;
//!
//! # async fn example() -> newsweave::Result<()> {
//! let body = fetch_with_retry(&RetryConfig::default(), || async {
//!     let response = reqwest::get("https://indexer.example.com/show.nzb").await?;
//!     Ok::<_, newsweave::Error>(response.error_for_status()?.bytes().await?)
//! })
//! .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Classifies an error as transient (worth another attempt) or permanent
pub trait IsRetryable {
    /// `true` when the failure may go away on its own
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|status| status.is_server_error())
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Transport(_) | Error::Timeout(_) => true,
            // 400 is "service temporarily unavailable", 5xx are server faults
            Error::Protocol { code, .. } => *code == 400 || *code >= 500,
            Error::SegmentFetch { .. } => true,
            Error::Parse(_)
            | Error::RepairExhausted(_)
            | Error::Cancelled
            | Error::Config { .. }
            | Error::InvalidNzb(_)
            | Error::NotSupported(_)
            | Error::Other(_) => false,
            Error::ExternalTool(msg) => {
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
        }
    }
}

/// Delay schedule for one retry sequence
///
/// Starts at `initial_delay`, grows by `backoff_multiplier` and is capped at
/// `max_delay`. With `jitter` each delay is stretched by up to 100%.
#[derive(Debug)]
struct Backoff<'a> {
    config: &'a RetryConfig,
    next: Duration,
    attempts: u32,
}

impl<'a> Backoff<'a> {
    fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            next: config.initial_delay,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, `None` once attempts are used up
    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = self.next;
        self.next = delay.mul_f64(self.config.backoff_multiplier).min(self.config.max_delay);
        Some(if self.config.jitter { add_jitter(delay) } else { delay })
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts
///
/// `max_attempts` counts retries, so the operation runs at most
/// `max_attempts + 1` times.
pub async fn fetch_with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(config);

    loop {
        let error = match operation().await {
            Ok(value) => {
                if backoff.attempts > 0 {
                    tracing::info!(attempts = backoff.attempts + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::error!(error = %error, "Permanent failure, not retrying");
            return Err(error);
        }

        let Some(delay) = backoff.next_delay() else {
            tracing::error!(error = %error, attempts = backoff.attempts + 1, "Retries exhausted");
            return Err(error);
        };

        tracing::warn!(
            error = %error,
            attempt = backoff.attempts,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Stretch `delay` by a random factor in `[1, 2]`
fn add_jitter(delay: Duration) -> Duration {
    delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=1.0))
}
