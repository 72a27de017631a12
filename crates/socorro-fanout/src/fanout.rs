use crate::registry::{SubscriberEntry, SubscriptionRegistry};
use crate::subscription::{ConnectionId, SubscriptionHandle, SubscriptionId};
use crate::{lock_or_recover, FanoutConfig, FanoutError};
use chrono::Utc;
use socorro_types::{Envelope, Notification, SubscriptionScope};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Point-in-time delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutMetrics {
    pub published: u64,
    pub delivered: u64,
    pub dropped_full: u64,
    pub dropped_closed: u64,
    pub replayed: u64,
}

#[derive(Debug, Default)]
struct FanoutMetricsInner {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    dropped_closed: AtomicU64,
    replayed: AtomicU64,
}

impl FanoutMetricsInner {
    fn snapshot(&self) -> FanoutMetrics {
        FanoutMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }
}

/// Result of re-attaching a subscription from a notification cursor.
#[derive(Debug)]
pub enum ResumeOutcome {
    /// Missed envelopes for the scope were queued ahead of live delivery.
    Replayed {
        handle: SubscriptionHandle,
        replayed: usize,
    },
    /// The replay window no longer covers the cursor; the handle is live but
    /// the caller must re-read state first.
    ResyncRequired { handle: SubscriptionHandle },
}

#[derive(Debug)]
struct PublishState {
    next_notification_id: u64,
    replay: VecDeque<Envelope>,
}

/// Routes notifications to matching subscriptions without awaiting any subscriber.
#[derive(Debug)]
pub struct NotificationFanout {
    config: FanoutConfig,
    registry: Arc<SubscriptionRegistry>,
    state: Mutex<PublishState>,
    next_subscription_id: AtomicU64,
    metrics: FanoutMetricsInner,
}

impl NotificationFanout {
    pub fn new(config: FanoutConfig) -> Result<Self, FanoutError> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(SubscriptionRegistry::new()),
            state: Mutex::new(PublishState {
                next_notification_id: 1,
                replay: VecDeque::with_capacity(config.replay_window),
            }),
            next_subscription_id: AtomicU64::new(1),
            metrics: FanoutMetricsInner::default(),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> FanoutMetrics {
        self.metrics.snapshot()
    }

    /// Wraps `notification` in an envelope and hands it to every matching subscriber.
    ///
    /// Envelope ids are assigned and delivered under one lock, so every
    /// subscriber observes ids in increasing order.
    pub fn publish(&self, notification: Notification) -> Envelope {
        let mut state = lock_or_recover(&self.state);
        let envelope = Envelope {
            notification_id: state.next_notification_id,
            request_id: notification.request_id().to_string(),
            published_at: Utc::now(),
            payload: notification,
        };
        state.next_notification_id += 1;
        if self.config.replay_window > 0 {
            state.replay.push_back(envelope.clone());
            while state.replay.len() > self.config.replay_window {
                state.replay.pop_front();
            }
        }
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        let targets = self.registry.matching(&envelope.payload);
        for entry in &targets {
            self.deliver(entry, &envelope);
        }
        tracing::debug!(
            notification_id = envelope.notification_id,
            request_id = %envelope.request_id,
            subscribers = targets.len(),
            "published notification"
        );
        envelope
    }

    /// Registers interest in `scope` for `connection`.
    pub fn subscribe(
        &self,
        scope: SubscriptionScope,
        connection: ConnectionId,
    ) -> SubscriptionHandle {
        let (handle, entry) = self.open(scope, connection);
        self.registry.attach(entry);
        handle
    }

    /// Re-attaches `scope` and replays retained envelopes newer than `after_notification_id`.
    pub fn resume(
        &self,
        scope: SubscriptionScope,
        connection: ConnectionId,
        after_notification_id: u64,
    ) -> ResumeOutcome {
        let state = lock_or_recover(&self.state);
        let (handle, entry) = self.open(scope.clone(), connection);

        let oldest_retained = state
            .replay
            .front()
            .map_or(state.next_notification_id, |envelope| envelope.notification_id);
        let covered = after_notification_id < state.next_notification_id
            && after_notification_id.saturating_add(1) >= oldest_retained;
        let missed: Vec<&Envelope> = if covered {
            state
                .replay
                .iter()
                .filter(|envelope| envelope.notification_id > after_notification_id)
                .filter(|envelope| envelope.payload.matches_scope(&scope))
                .collect()
        } else {
            Vec::new()
        };

        if !covered || missed.len() > self.config.subscriber_queue_capacity {
            self.registry.attach(entry);
            tracing::warn!(
                scope = %scope,
                after_notification_id,
                oldest_retained,
                "resume cursor outside replay window"
            );
            return ResumeOutcome::ResyncRequired { handle };
        }

        let replayed = missed
            .into_iter()
            .filter(|envelope| entry.sender.try_send((*envelope).clone()).is_ok())
            .count();
        self.metrics
            .replayed
            .fetch_add(replayed as u64, Ordering::Relaxed);
        self.registry.attach(entry);
        drop(state);

        tracing::debug!(scope = %scope, after_notification_id, replayed, "resumed subscription");
        ResumeOutcome::Replayed { handle, replayed }
    }

    fn open(
        &self,
        scope: SubscriptionScope,
        connection: ConnectionId,
    ) -> (SubscriptionHandle, SubscriberEntry) {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.config.subscriber_queue_capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        let entry = SubscriberEntry {
            id,
            scope: scope.clone(),
            connection: connection.clone(),
            sender,
            lagged: Arc::clone(&lagged),
        };
        let handle = SubscriptionHandle::new(
            id,
            scope,
            connection,
            receiver,
            lagged,
            Arc::clone(&self.registry),
        );
        (handle, entry)
    }

    fn deliver(&self, entry: &SubscriberEntry, envelope: &Envelope) {
        match entry.sender.try_send(envelope.clone()) {
            Ok(()) => {
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.dropped_full.fetch_add(1, Ordering::Relaxed);
                if !entry.lagged.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        subscription_id = %entry.id,
                        scope = %entry.scope,
                        connection = %entry.connection,
                        notification_id = envelope.notification_id,
                        "subscriber queue full; flagged for resync"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.dropped_closed.fetch_add(1, Ordering::Relaxed);
                self.registry.detach(entry.id);
                tracing::debug!(
                    subscription_id = %entry.id,
                    "pruned closed subscriber queue"
                );
            }
        }
    }
}
