//! Emergency request lifecycle, transcript log and coordination facade.

mod config;
mod engine;
mod error;
mod message_log;
mod publish_gate;
mod retry;
mod service;

pub use config::{CoordinationConfig, RetryPolicy};
pub use engine::{AssignRequest, LifecycleEngine, ReviewOutcome};
pub use error::{LifecycleError, LifecycleResult};
pub use message_log::MessageLog;
pub use publish_gate::{PublishGate, PublishGuard};
pub use service::{CoordinationService, InboxWatch, TranscriptSession};
