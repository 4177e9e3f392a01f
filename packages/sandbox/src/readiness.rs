// ABOUTME: HTTP readiness polling for services started inside session containers
// ABOUTME: Any HTTP response counts as ready; attempts are bounded and cancellable

use crate::error::{Result, SandboxError};
use sandcastle_config::ReadinessSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    client: reqwest::Client,
    settings: ReadinessSettings,
}

impl ReadinessPoller {
    pub fn new(settings: ReadinessSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    /// Poll `http://127.0.0.1:<port>/` with HEAD requests until something answers.
    ///
    /// Returns the number of attempts used. A 4xx or 5xx answer still means the
    /// server is accepting connections, so it counts as ready.
    pub async fn wait_for_port(&self, port: u16, cancel: &CancellationToken) -> Result<u32> {
        let url = format!("http://127.0.0.1:{}/", port);
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }

            let request = self
                .client
                .head(&url)
                .timeout(self.settings.request_timeout)
                .send();

            let outcome = tokio::select! {
                res = request => res,
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            };

            match outcome {
                Ok(response) => {
                    info!(
                        port = port,
                        status = response.status().as_u16(),
                        attempts = attempt,
                        "Service is ready"
                    );
                    return Ok(attempt);
                }
                Err(e) if attempt == 1 => {
                    warn!(port = port, "Readiness probe failed (first attempt): {}", e);
                }
                Err(e) if attempt == max_attempts => {
                    warn!(
                        port = port,
                        "Readiness probe failed (attempt {}/{}), giving up: {}",
                        attempt,
                        max_attempts,
                        e
                    );
                }
                Err(_) => {}
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.delay) => {}
                    _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                }
            }
        }

        debug!(port = port, "Readiness attempts exhausted");
        Err(SandboxError::ReadinessTimeout {
            port,
            attempts: max_attempts,
        })
    }
}
