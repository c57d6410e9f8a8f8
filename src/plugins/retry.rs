// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use super::web_client::InvokeError;
use crate::config::HttpClientSettings;
use crate::core::GatewayError;
use crate::{debug_fmt, warn_fmt};

/// Backoff between attempts: `base * factor^n`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(20),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &HttpClientSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.backoff_base_ms),
            max: Duration::from_millis(settings.backoff_max_ms.max(settings.backoff_base_ms)),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero based).
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = self.factor.max(1).saturating_pow(retry);
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

/// Run `attempt` until it succeeds, fails with anything other than a
/// connect timeout, or `max_retries` retries are spent.  The closure gets
/// the zero-based attempt number.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    max_retries: u32,
    mut attempt: F,
) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, InvokeError>>,
{
    let mut attempts = 0;
    loop {
        let current = attempts;
        attempts += 1;
        match attempt(current).await {
            Ok(value) => return Ok(value),
            Err(InvokeError::ConnectTimeout(message)) if current < max_retries => {
                let delay = policy.delay(current);
                debug_fmt!(
                    "Retry",
                    "connect timeout on attempt {} ({}), retrying in {:?}",
                    attempts,
                    message,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(InvokeError::ConnectTimeout(message)) => {
                warn_fmt!("Retry", "giving up after {} attempt(s): {}", attempts, message);
                return Err(GatewayError::TransientIo { attempts, message });
            }
            Err(InvokeError::Timeout(elapsed)) => return Err(GatewayError::Timeout(elapsed)),
            Err(InvokeError::Client(e)) => return Err(GatewayError::ClientError(e)),
            Err(InvokeError::Other(message)) => return Err(GatewayError::Other(message)),
        }
    }
}
