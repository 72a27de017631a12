use anyhow::Result;
use serde::{Deserialize, Serialize};
use socorro_fanout::FanoutConfig;
use std::time::Duration;

/// Bounded exponential backoff for transient record store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Validates attempt count and backoff bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }
        if self.initial_backoff.is_zero() {
            anyhow::bail!("initial_backoff must be greater than 0");
        }
        if self.max_backoff < self.initial_backoff {
            anyhow::bail!("max_backoff must be >= initial_backoff");
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt number `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.max_backoff {
                return self.max_backoff;
            }
        }
        std::cmp::min(delay, self.max_backoff)
    }
}

/// Settings for [`crate::CoordinationService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub retry: RetryPolicy,
    pub fanout: FanoutConfig,
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.fanout.validate()?;
        Ok(())
    }
}
