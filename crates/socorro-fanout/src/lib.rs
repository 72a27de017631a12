//! Subscription registry and realtime notification fan-out.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

mod fanout;
mod registry;
mod subscription;

pub use fanout::{FanoutMetrics, NotificationFanout, ResumeOutcome};
pub use registry::SubscriptionRegistry;
pub use socorro_types::{Envelope, Notification, SubscriptionScope};
pub use subscription::{ConnectionId, SubscriptionHandle, SubscriptionId, SubscriptionItem};

/// Errors returned by the fan-out layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("invalid fan-out config: {0}")]
    InvalidConfig(String),
}

/// Queue and replay sizing for [`NotificationFanout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Envelopes buffered per subscriber before it is flagged lagged.
    pub subscriber_queue_capacity: usize,
    /// Most recent envelopes kept for `resume`; zero disables replay.
    pub replay_window: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
            replay_window: 1024,
        }
    }
}

impl FanoutConfig {
    pub fn validate(&self) -> Result<(), FanoutError> {
        if self.subscriber_queue_capacity == 0 {
            return Err(FanoutError::InvalidConfig(
                "subscriber_queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Locks `mutex`, taking the data back from a poisoned lock.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
