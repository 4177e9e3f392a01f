// ABOUTME: Exponential backoff retry for conflict (HTTP 409) responses from the container runtime
// ABOUTME: Any other failure, or running out of attempts, returns the original error untouched

use sandcastle_config::RetrySettings;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Ceiling for a single backoff, whatever the multiplier and attempt count
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Errors that can tell whether they represent a resource conflict
pub trait ConflictStatus {
    fn is_conflict(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ConflictRetrier {
    settings: RetrySettings,
}

impl ConflictRetrier {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    /// Backoff before re-invoking after the 1-based `attempt` failed, capped at `MAX_RETRY_DELAY`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.settings.delay.as_secs_f64() * self.settings.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .map(|delay| delay.min(MAX_RETRY_DELAY))
            .unwrap_or(MAX_RETRY_DELAY)
    }

    pub async fn retry<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ConflictStatus + Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_conflict() && attempt < self.settings.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} hit a conflict (attempt {}/{}), retrying in {:?}: {}",
                        operation_name, attempt, self.settings.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("{} failed after {} attempt(s)", operation_name, attempt);
                    return Err(e);
                }
            }
        }
    }
}
