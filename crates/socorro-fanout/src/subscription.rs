use crate::registry::SubscriptionRegistry;
use serde::{Deserialize, Serialize};
use socorro_types::{Envelope, Notification, SubscriptionScope};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Handle for one client connection; owns every subscription it opens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Item yielded by [`SubscriptionHandle::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionItem {
    Envelope(Envelope),
    /// Deliveries were dropped; re-read state with a point read or history.
    ResyncRequired {
        /// Last envelope this handle yielded before the gap, if any.
        last_notification_id: Option<u64>,
    },
}

/// Receiving side of one registered subscription.
///
/// Dropping the handle detaches it from the registry.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    scope: SubscriptionScope,
    connection: ConnectionId,
    receiver: mpsc::Receiver<Envelope>,
    lagged: Arc<AtomicBool>,
    registry: Arc<SubscriptionRegistry>,
    message_cutover: Option<u64>,
    last_notification_id: Option<u64>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: SubscriptionId,
        scope: SubscriptionScope,
        connection: ConnectionId,
        receiver: mpsc::Receiver<Envelope>,
        lagged: Arc<AtomicBool>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            id,
            scope,
            connection,
            receiver,
            lagged,
            registry,
            message_cutover: None,
            last_notification_id: None,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn scope(&self) -> &SubscriptionScope {
        &self.scope
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn last_notification_id(&self) -> Option<u64> {
        self.last_notification_id
    }

    /// Skips message notifications with `sequence <= cutover`.
    ///
    /// Set after reading history so the live tail starts where history ended.
    pub fn set_message_cutover(&mut self, cutover: u64) {
        self.message_cutover = Some(cutover);
    }

    /// Waits for the next item; returns `None` once the subscription is detached.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        loop {
            if let Some(item) = self.take_resync() {
                return Some(item);
            }
            let envelope = self.receiver.recv().await?;
            if let Some(item) = self.accept(envelope) {
                return Some(item);
            }
        }
    }

    /// Returns the next queued item without waiting.
    pub fn try_recv(&mut self) -> Option<SubscriptionItem> {
        loop {
            if let Some(item) = self.take_resync() {
                return Some(item);
            }
            let envelope = self.receiver.try_recv().ok()?;
            if let Some(item) = self.accept(envelope) {
                return Some(item);
            }
        }
    }

    /// Detaches the subscription; queued envelopes are discarded.
    pub fn unsubscribe(self) {}

    fn take_resync(&mut self) -> Option<SubscriptionItem> {
        if !self.lagged.swap(false, Ordering::AcqRel) {
            return None;
        }
        while self.receiver.try_recv().is_ok() {}
        Some(SubscriptionItem::ResyncRequired {
            last_notification_id: self.last_notification_id,
        })
    }

    fn accept(&mut self, envelope: Envelope) -> Option<SubscriptionItem> {
        if self.lagged.load(Ordering::Acquire) {
            return None;
        }
        if let (Some(cutover), Notification::Message(message)) =
            (self.message_cutover, &envelope.payload)
        {
            if message.sequence <= cutover {
                return None;
            }
        }
        self.last_notification_id = Some(envelope.notification_id);
        Some(SubscriptionItem::Envelope(envelope))
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.registry.detach(self.id);
    }
}
