// ABOUTME: Process-wide circuit breaker guarding calls to the container runtime
// ABOUTME: Opens after consecutive failures and closes itself after a cancellable cooldown

use crate::error::{Result, SandboxError};
use sandcastle_config::BreakerSettings;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Counter, state and pending timer live under one lock so that a timer firing,
/// `cleanup()` and `record_failure()` can never interleave half-way.
#[derive(Debug, Default)]
struct BreakerInner {
    failures: u32,
    open: bool,
    // Bumped whenever a reset timer is scheduled or cancelled; a timer only
    // acts if the generation it was spawned with is still current.
    generation: u64,
    reset_timer: Option<JoinHandle<()>>,
}

impl BreakerInner {
    fn cancel_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Arc::new(Mutex::new(BreakerInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail fast with [`SandboxError::CircuitOpen`] while the circuit is open
    pub fn check(&self) -> Result<()> {
        if self.lock().open {
            return Err(SandboxError::CircuitOpen);
        }
        Ok(())
    }

    pub fn state(&self) -> CircuitState {
        if self.lock().open {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Count a failure; at the threshold the circuit opens and an auto-reset is scheduled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        debug!(
            failures = inner.failures,
            threshold = self.settings.threshold,
            "Recorded runtime failure"
        );

        if inner.open || inner.failures < self.settings.threshold {
            return;
        }

        inner.open = true;
        inner.cancel_timer();
        let generation = inner.generation;
        warn!(
            "Circuit breaker opened after {} consecutive failures, resetting in {:?}",
            inner.failures, self.settings.reset_after
        );

        let shared = Arc::clone(&self.inner);
        let reset_after = self.settings.reset_after;
        inner.reset_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(reset_after).await;
            let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.generation != generation {
                return;
            }
            inner.open = false;
            inner.failures = 0;
            inner.reset_timer = None;
            info!("Circuit breaker closed after cooldown");
        }));
    }

    /// Close the circuit, reset the counter and cancel any pending auto-reset
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.open {
            info!("Circuit breaker closed after successful runtime call");
        }
        inner.failures = 0;
        inner.open = false;
        inner.cancel_timer();
    }

    /// Cancel the pending auto-reset timer without changing the state
    pub fn cleanup(&self) {
        self.lock().cancel_timer();
    }
}
