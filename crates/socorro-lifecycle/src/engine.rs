//! Emergency request state machine.
//!
//! Every transition is a compare-and-swap on the prior status followed by one
//! published domain event. The commit and the publish run under the request's
//! publish gate; the read that picks the expected status does not.

use crate::config::RetryPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::publish_gate::PublishGate;
use crate::retry::with_store_retry;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use socorro_fanout::NotificationFanout;
use socorro_store::{ConditionalUpdate, RecordStore};
use socorro_types::{
    non_blank, Actor, DomainEvent, EmergencyRequest, Message, MessageDraft, NewEmergencyRequest,
    Notification, Priority, RequestQuery, RequestStatus, ResponderSummary,
};
use std::sync::Arc;

/// Revision-only conflicts tolerated before a transition reports `Conflict`.
const MAX_REVISION_ATTEMPTS: u32 = 8;

/// Input for the assign transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignRequest {
    pub responder_id: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Replaces `follow_up_notes` when present; blank clears them.
    #[serde(default)]
    pub notes: Option<String>,
}

impl AssignRequest {
    pub fn new(responder_id: impl Into<String>) -> Self {
        Self {
            responder_id: responder_id.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Result of `begin_review`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub request: EmergencyRequest,
    /// False when the request was already in review and nothing changed.
    pub started: bool,
    /// System notice written with the transition.
    pub notice: Option<Message>,
}

/// Owns request transitions and publishes one event per accepted move.
pub struct LifecycleEngine {
    store: Arc<dyn RecordStore>,
    fanout: Arc<NotificationFanout>,
    gate: Arc<PublishGate>,
    retry: RetryPolicy,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        fanout: Arc<NotificationFanout>,
        gate: Arc<PublishGate>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            fanout,
            gate,
            retry,
        }
    }

    #[tracing::instrument(
        name = "socorro_lifecycle.create",
        skip(self, actor, input),
        fields(actor_id = %actor.actor_id, category = input.category.as_str())
    )]
    pub async fn create(
        &self,
        actor: &Actor,
        input: NewEmergencyRequest,
    ) -> LifecycleResult<EmergencyRequest> {
        let request = EmergencyRequest::pending(input, Utc::now());
        if request.requester_id.is_empty() {
            return Err(LifecycleError::validation("requester_id must be non-empty"));
        }
        if request.description.is_empty() {
            return Err(LifecycleError::validation("description must be non-empty"));
        }

        let _guard = self.gate.enter(&request.id).await;
        let store = self.store.as_ref();
        let pending = &request;
        let stored = with_store_retry(&self.retry, "insert_request", move || {
            store.insert_request(pending.clone())
        })
        .await?;
        self.publish_transition(&stored, None, actor);
        tracing::debug!(
            request_id = %stored.id,
            preselected_responder = ?stored.responder_id,
            "created emergency request"
        );
        Ok(stored)
    }

    #[tracing::instrument(
        name = "socorro_lifecycle.assign",
        skip(self, actor, input),
        fields(actor_id = %actor.actor_id, responder_id = %input.responder_id)
    )]
    pub async fn assign(
        &self,
        actor: &Actor,
        request_id: &str,
        input: AssignRequest,
    ) -> LifecycleResult<EmergencyRequest> {
        let responder_id = non_blank(Some(input.responder_id))
            .ok_or_else(|| LifecycleError::validation("responder_id must be non-empty"))?;
        let current = self.get_request(request_id).await?;
        let now = Utc::now();
        let (request, _) = self
            .apply(
                actor,
                current,
                "assign",
                RequestStatus::Assigned,
                None,
                |request| {
                    request.responder_id = Some(responder_id.clone());
                    request.assigned_at = Some(now);
                    if let Some(priority) = input.priority {
                        request.priority = priority;
                    }
                    if input.notes.is_some() {
                        request.follow_up_notes = non_blank(input.notes.clone());
                    }
                },
            )
            .await?;
        Ok(request)
    }

    /// Moves a pending or assigned request into review.
    ///
    /// Already in review, including after losing a race to another reviewer,
    /// is a no-op that publishes nothing.
    #[tracing::instrument(
        name = "socorro_lifecycle.begin_review",
        skip(self, actor),
        fields(actor_id = %actor.actor_id)
    )]
    pub async fn begin_review(
        &self,
        actor: &Actor,
        request_id: &str,
    ) -> LifecycleResult<ReviewOutcome> {
        let reviewer = non_blank(Some(actor.actor_id.clone()))
            .ok_or_else(|| LifecycleError::validation("reviewer actor_id must be non-empty"))?;
        let current = self.get_request(request_id).await?;
        if current.status == RequestStatus::InReview {
            return Ok(ReviewOutcome {
                request: current,
                started: false,
                notice: None,
            });
        }

        let notice = MessageDraft::system_notice(
            current.id.clone(),
            format!("Responder {reviewer} started reviewing this request"),
        );
        let applied = self
            .apply(
                actor,
                current,
                "begin_review",
                RequestStatus::InReview,
                Some(notice),
                |request| {
                    if request.responder_id.is_none() {
                        request.responder_id = Some(reviewer.clone());
                    }
                },
            )
            .await;

        match applied {
            Ok((request, notice)) => Ok(ReviewOutcome {
                request,
                started: true,
                notice,
            }),
            Err(LifecycleError::Conflict {
                request_id,
                actual: RequestStatus::InReview,
                ..
            }) => {
                tracing::debug!(%request_id, "review already started concurrently");
                Ok(ReviewOutcome {
                    request: self.get_request(&request_id).await?,
                    started: false,
                    notice: None,
                })
            }
            Err(error) => Err(error),
        }
    }

    #[tracing::instrument(
        name = "socorro_lifecycle.resolve",
        skip(self, actor),
        fields(actor_id = %actor.actor_id)
    )]
    pub async fn resolve(
        &self,
        actor: &Actor,
        request_id: &str,
    ) -> LifecycleResult<EmergencyRequest> {
        let current = self.get_request(request_id).await?;
        let now = Utc::now();
        let (request, _) = self
            .apply(
                actor,
                current,
                "resolve",
                RequestStatus::Resolved,
                None,
                |request| request.resolved_at = Some(now),
            )
            .await?;
        Ok(request)
    }

    #[tracing::instrument(
        name = "socorro_lifecycle.cancel",
        skip(self, actor),
        fields(actor_id = %actor.actor_id)
    )]
    pub async fn cancel(
        &self,
        actor: &Actor,
        request_id: &str,
    ) -> LifecycleResult<EmergencyRequest> {
        let current = self.get_request(request_id).await?;
        let now = Utc::now();
        let (request, _) = self
            .apply(
                actor,
                current,
                "cancel",
                RequestStatus::Cancelled,
                None,
                |request| request.cancelled_at = Some(now),
            )
            .await?;
        Ok(request)
    }

    /// Replaces follow-up notes without touching status or publishing an event.
    #[tracing::instrument(
        name = "socorro_lifecycle.update_follow_up",
        skip(self, actor, notes),
        fields(actor_id = %actor.actor_id)
    )]
    pub async fn update_follow_up(
        &self,
        actor: &Actor,
        request_id: &str,
        notes: Option<String>,
    ) -> LifecycleResult<EmergencyRequest> {
        let notes = non_blank(notes);
        let store = self.store.as_ref();
        let notes_ref = &notes;
        with_store_retry(&self.retry, "update_follow_up_notes", move || {
            store.update_follow_up_notes(request_id, notes_ref.clone())
        })
        .await?
        .ok_or_else(|| LifecycleError::NotFound(request_id.to_string()))
    }

    pub async fn get_request(&self, request_id: &str) -> LifecycleResult<EmergencyRequest> {
        let store = self.store.as_ref();
        with_store_retry(&self.retry, "get_request", move || store.get_request(request_id))
            .await?
            .ok_or_else(|| LifecycleError::NotFound(request_id.to_string()))
    }

    pub async fn list_requests(
        &self,
        query: RequestQuery,
    ) -> LifecycleResult<Vec<EmergencyRequest>> {
        let store = self.store.as_ref();
        let query_ref = &query;
        with_store_retry(&self.retry, "query_requests", move || {
            store.query_requests(query_ref.clone())
        })
        .await
    }

    /// Counts the responder's requests that are still open, by status.
    pub async fn responder_summary(&self, responder_id: &str) -> LifecycleResult<ResponderSummary> {
        let open = self
            .list_requests(RequestQuery {
                responder_id: Some(responder_id.to_string()),
                statuses: Some(vec![
                    RequestStatus::Pending,
                    RequestStatus::Assigned,
                    RequestStatus::InReview,
                ]),
                ..RequestQuery::default()
            })
            .await?;

        let mut summary = ResponderSummary {
            responder_id: responder_id.to_string(),
            ..ResponderSummary::default()
        };
        for request in &open {
            match request.status {
                RequestStatus::Pending => summary.pending += 1,
                RequestStatus::Assigned => summary.assigned += 1,
                RequestStatus::InReview => summary.in_review += 1,
                RequestStatus::Resolved | RequestStatus::Cancelled => {}
            }
        }
        Ok(summary)
    }

    /// Validates and commits `current -> target`, then publishes the event and any notice.
    ///
    /// The write is keyed on status and revision. When only the revision moved,
    /// for example after a follow-up notes update, `mutate` is replayed on the
    /// fresh record so the concurrent field change survives.
    async fn apply(
        &self,
        actor: &Actor,
        current: EmergencyRequest,
        operation: &'static str,
        target: RequestStatus,
        notice: Option<MessageDraft>,
        mutate: impl Fn(&mut EmergencyRequest),
    ) -> LifecycleResult<(EmergencyRequest, Option<Message>)> {
        let expected = current.status;
        if !expected.can_transition_to(target) {
            return Err(LifecycleError::InvalidTransition {
                request_id: current.id,
                status: expected,
                operation,
            });
        }

        let _guard = self.gate.enter(&current.id).await;
        let store = self.store.as_ref();
        let notice_ref = &notice;
        let mut snapshot = current;
        let mut attempt = 1;
        loop {
            let mut updated = snapshot.clone();
            updated.status = target;
            mutate(&mut updated);

            let updated_ref = &updated;
            let outcome = with_store_retry(&self.retry, operation, move || {
                store.update_request_if_status(expected, updated_ref.clone(), notice_ref.clone())
            })
            .await?;

            match outcome {
                ConditionalUpdate::Applied { request, notice } => {
                    self.publish_transition(&request, Some(expected), actor);
                    if let Some(message) = &notice {
                        self.fanout.publish(Notification::Message(message.clone()));
                    }
                    tracing::debug!(
                        request_id = %request.id,
                        from = %expected,
                        to = %request.status,
                        revision = request.revision,
                        "applied request transition"
                    );
                    return Ok((request, notice));
                }
                ConditionalUpdate::RevisionMismatch { current }
                    if attempt < MAX_REVISION_ATTEMPTS =>
                {
                    tracing::debug!(
                        request_id = %current.id,
                        expected_revision = snapshot.revision,
                        actual_revision = current.revision,
                        attempt,
                        "request changed under transition; reapplying"
                    );
                    snapshot = current;
                    attempt += 1;
                }
                ConditionalUpdate::StatusMismatch { current }
                | ConditionalUpdate::RevisionMismatch { current } => {
                    return Err(LifecycleError::Conflict {
                        request_id: current.id,
                        expected,
                        actual: current.status,
                    });
                }
                ConditionalUpdate::NotFound => return Err(LifecycleError::NotFound(updated.id)),
            }
        }
    }

    fn publish_transition(
        &self,
        request: &EmergencyRequest,
        from: Option<RequestStatus>,
        actor: &Actor,
    ) {
        self.fanout
            .publish(Notification::Transition(DomainEvent::for_transition(
                request,
                from,
                actor.clone(),
            )));
    }
}

#[cfg(test)]
mod tests {
    use super::{AssignRequest, LifecycleEngine};
    use crate::config::RetryPolicy;
    use crate::error::LifecycleError;
    use crate::publish_gate::PublishGate;
    use async_trait::async_trait;
    use socorro_fanout::{
        ConnectionId, FanoutConfig, NotificationFanout, SubscriptionItem, SubscriptionScope,
    };
    use socorro_store::{
        AppendedMessage, ConditionalUpdate, InMemoryRecordStore, RecordStore, SqliteRecordStore,
        StoreError, StoreResult,
    };
    use socorro_types::{
        Actor, Category, EmergencyRequest, Message, MessageDraft, NewEmergencyRequest,
        Notification, Priority, RequestQuery, RequestStatus, TransitionKind,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Holds the first two point reads until both have completed.
    struct RendezvousStore {
        inner: InMemoryRecordStore,
        reads: AtomicUsize,
        barrier: Barrier,
    }

    /// Writes `notes` as follow-up notes just before the first conditional update.
    struct InterleavedNotesStore {
        inner: Arc<dyn RecordStore>,
        notes: String,
        pending: AtomicUsize,
    }

    /// Fails the first `failures` conditional updates with a transient error.
    struct FlakyStore {
        inner: InMemoryRecordStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for RendezvousStore {
        async fn insert_request(&self, request: EmergencyRequest) -> StoreResult<EmergencyRequest> {
            self.inner.insert_request(request).await
        }
        async fn get_request(&self, request_id: &str) -> StoreResult<Option<EmergencyRequest>> {
            let request = self.inner.get_request(request_id).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) < 2 {
                self.barrier.wait().await;
            }
            Ok(request)
        }
        async fn query_requests(&self, query: RequestQuery) -> StoreResult<Vec<EmergencyRequest>> {
            self.inner.query_requests(query).await
        }
        async fn update_request_if_status(
            &self,
            expected: RequestStatus,
            updated: EmergencyRequest,
            notice: Option<MessageDraft>,
        ) -> StoreResult<ConditionalUpdate> {
            self.inner
                .update_request_if_status(expected, updated, notice)
                .await
        }
        async fn update_follow_up_notes(
            &self,
            request_id: &str,
            notes: Option<String>,
        ) -> StoreResult<Option<EmergencyRequest>> {
            self.inner.update_follow_up_notes(request_id, notes).await
        }
        async fn append_message(&self, draft: MessageDraft) -> StoreResult<AppendedMessage> {
            self.inner.append_message(draft).await
        }
        async fn list_messages(
            &self,
            request_id: &str,
            after_sequence: Option<u64>,
        ) -> StoreResult<Vec<Message>> {
            self.inner.list_messages(request_id, after_sequence).await
        }
    }

    #[async_trait]
    impl RecordStore for InterleavedNotesStore {
        async fn insert_request(&self, request: EmergencyRequest) -> StoreResult<EmergencyRequest> {
            self.inner.insert_request(request).await
        }
        async fn get_request(&self, request_id: &str) -> StoreResult<Option<EmergencyRequest>> {
            self.inner.get_request(request_id).await
        }
        async fn query_requests(&self, query: RequestQuery) -> StoreResult<Vec<EmergencyRequest>> {
            self.inner.query_requests(query).await
        }
        async fn update_request_if_status(
            &self,
            expected: RequestStatus,
            updated: EmergencyRequest,
            notice: Option<MessageDraft>,
        ) -> StoreResult<ConditionalUpdate> {
            if self.pending.swap(0, Ordering::SeqCst) > 0 {
                self.inner
                    .update_follow_up_notes(&updated.id, Some(self.notes.clone()))
                    .await?;
            }
            self.inner
                .update_request_if_status(expected, updated, notice)
                .await
        }
        async fn update_follow_up_notes(
            &self,
            request_id: &str,
            notes: Option<String>,
        ) -> StoreResult<Option<EmergencyRequest>> {
            self.inner.update_follow_up_notes(request_id, notes).await
        }
        async fn append_message(&self, draft: MessageDraft) -> StoreResult<AppendedMessage> {
            self.inner.append_message(draft).await
        }
        async fn list_messages(
            &self,
            request_id: &str,
            after_sequence: Option<u64>,
        ) -> StoreResult<Vec<Message>> {
            self.inner.list_messages(request_id, after_sequence).await
        }
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn insert_request(&self, request: EmergencyRequest) -> StoreResult<EmergencyRequest> {
            self.inner.insert_request(request).await
        }
        async fn get_request(&self, request_id: &str) -> StoreResult<Option<EmergencyRequest>> {
            self.inner.get_request(request_id).await
        }
        async fn query_requests(&self, query: RequestQuery) -> StoreResult<Vec<EmergencyRequest>> {
            self.inner.query_requests(query).await
        }
        async fn update_request_if_status(
            &self,
            expected: RequestStatus,
            updated: EmergencyRequest,
            notice: Option<MessageDraft>,
        ) -> StoreResult<ConditionalUpdate> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("database is locked".to_string()));
            }
            self.inner
                .update_request_if_status(expected, updated, notice)
                .await
        }
        async fn update_follow_up_notes(
            &self,
            request_id: &str,
            notes: Option<String>,
        ) -> StoreResult<Option<EmergencyRequest>> {
            self.inner.update_follow_up_notes(request_id, notes).await
        }
        async fn append_message(&self, draft: MessageDraft) -> StoreResult<AppendedMessage> {
            self.inner.append_message(draft).await
        }
        async fn list_messages(
            &self,
            request_id: &str,
            after_sequence: Option<u64>,
        ) -> StoreResult<Vec<Message>> {
            self.inner.list_messages(request_id, after_sequence).await
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn engine_with(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> LifecycleEngine {
        let fanout =
            Arc::new(NotificationFanout::new(FanoutConfig::default()).expect("fan-out config"));
        LifecycleEngine::new(store, fanout, Arc::new(PublishGate::new()), retry)
    }

    fn engine() -> (LifecycleEngine, Arc<NotificationFanout>) {
        let fanout =
            Arc::new(NotificationFanout::new(FanoutConfig::default()).expect("fan-out config"));
        let engine = LifecycleEngine::new(
            Arc::new(InMemoryRecordStore::new()),
            Arc::clone(&fanout),
            Arc::new(PublishGate::new()),
            RetryPolicy::no_retry(),
        );
        (engine, fanout)
    }

    fn chest_pain() -> NewEmergencyRequest {
        NewEmergencyRequest::new("u-1", Category::Health, "chest pain")
    }

    fn transition_kinds(items: Vec<SubscriptionItem>) -> Vec<TransitionKind> {
        items
            .into_iter()
            .filter_map(|item| match item {
                SubscriptionItem::Envelope(envelope) => match envelope.payload {
                    Notification::Transition(event) => Some(event.kind),
                    Notification::Message(_) => None,
                },
                SubscriptionItem::ResyncRequired { .. } => None,
            })
            .collect()
    }

    fn drain(handle: &mut socorro_fanout::SubscriptionHandle) -> Vec<SubscriptionItem> {
        std::iter::from_fn(|| handle.try_recv()).collect()
    }

    #[tokio::test]
    async fn create_validates_input_and_starts_pending() {
        let (engine, _) = engine();
        let requester = Actor::requester("u-1");

        let blank = engine
            .create(
                &requester,
                NewEmergencyRequest::new("u-1", Category::Health, "   "),
            )
            .await;
        assert!(matches!(blank, Err(LifecycleError::Validation(_))));

        let request = engine
            .create(&requester, chest_pain().with_responder("R123"))
            .await
            .expect("create");
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.responder_id.as_deref(), Some("R123"));
        assert!(request.assigned_at.is_none());
        assert_eq!(request.revision, 1);
    }

    #[tokio::test]
    async fn full_lifecycle_publishes_one_event_per_transition() {
        let (engine, fanout) = engine();
        let coordinator = Actor::coordinator("c-1");
        let responder = Actor::responder("R123");
        let request = engine
            .create(&Actor::requester("u-1"), chest_pain())
            .await
            .expect("create");
        let mut watcher = fanout.subscribe(
            SubscriptionScope::ByRequest(request.id.clone()),
            ConnectionId::new(),
        );

        let assigned = engine
            .assign(
                &coordinator,
                &request.id,
                AssignRequest::new("R123")
                    .with_priority(Priority::Urgent)
                    .with_notes("call first"),
            )
            .await
            .expect("assign");
        assert_eq!(assigned.status, RequestStatus::Assigned);
        assert_eq!(assigned.priority, Priority::Urgent);
        assert_eq!(assigned.follow_up_notes.as_deref(), Some("call first"));
        assert!(assigned.assigned_at.is_some());

        let review = engine
            .begin_review(&responder, &request.id)
            .await
            .expect("begin review");
        assert!(review.started);
        assert!(review.notice.is_some());

        let resolved = engine.resolve(&responder, &request.id).await.expect("resolve");
        assert_eq!(resolved.status, RequestStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.revision, 4);

        assert_eq!(
            transition_kinds(drain(&mut watcher)),
            vec![
                TransitionKind::Assigned,
                TransitionKind::ReviewStarted,
                TransitionKind::Resolved
            ]
        );
    }

    #[tokio::test]
    async fn invalid_transitions_fail_and_leave_state_unchanged() {
        let (engine, _) = engine();
        let actor = Actor::coordinator("c-1");
        let request = engine
            .create(&Actor::requester("u-1"), chest_pain())
            .await
            .expect("create");

        let error = engine
            .resolve(&actor, &request.id)
            .await
            .expect_err("resolve from pending");
        assert!(matches!(
            error,
            LifecycleError::InvalidTransition {
                status: RequestStatus::Pending,
                operation: "resolve",
                ..
            }
        ));
        let unchanged = engine.get_request(&request.id).await.expect("read");
        assert_eq!(unchanged, request);

        engine.cancel(&actor, &request.id).await.expect("cancel");
        for result in [
            engine.cancel(&actor, &request.id).await,
            engine
                .assign(&actor, &request.id, AssignRequest::new("R1"))
                .await,
        ] {
            assert!(matches!(
                result,
                Err(LifecycleError::InvalidTransition {
                    status: RequestStatus::Cancelled,
                    ..
                })
            ));
        }

        let missing = engine.resolve(&actor, "req-missing").await;
        assert!(matches!(missing, Err(LifecycleError::NotFound(_))));
        let blank = engine
            .assign(&actor, &request.id, AssignRequest::new("  "))
            .await;
        assert!(matches!(blank, Err(LifecycleError::Validation(_))));
    }

    #[tokio::test]
    async fn begin_review_twice_yields_one_event_and_one_notice() {
        let (engine, fanout) = engine();
        let responder = Actor::responder("R123");
        let request = engine
            .create(&Actor::requester("u-1"), chest_pain())
            .await
            .expect("create");
        let mut watcher = fanout.subscribe(
            SubscriptionScope::ByRequest(request.id.clone()),
            ConnectionId::new(),
        );

        let first = engine
            .begin_review(&responder, &request.id)
            .await
            .expect("first review");
        let second = engine
            .begin_review(&responder, &request.id)
            .await
            .expect("second review");
        assert!(first.started);
        assert!(!second.started);
        assert_eq!(second.request.revision, first.request.revision);
        assert_eq!(first.request.responder_id.as_deref(), Some("R123"));

        let items = drain(&mut watcher);
        assert_eq!(items.len(), 2);
        assert_eq!(
            transition_kinds(items),
            vec![TransitionKind::ReviewStarted]
        );
    }

    #[tokio::test]
    async fn concurrent_assigns_yield_one_success_and_one_conflict() {
        let store = Arc::new(RendezvousStore {
            inner: InMemoryRecordStore::new(),
            reads: AtomicUsize::new(0),
            barrier: Barrier::new(2),
        });
        let seeded = store
            .inner
            .insert_request(EmergencyRequest::pending(chest_pain(), chrono::Utc::now()))
            .await
            .expect("seed request");
        let engine = engine_with(store, RetryPolicy::no_retry());
        let coordinator = Actor::coordinator("c-1");

        let (left, right) = tokio::join!(
            engine.assign(&coordinator, &seeded.id, AssignRequest::new("R1")),
            engine.assign(&coordinator, &seeded.id, AssignRequest::new("R2")),
        );
        let outcomes = [left, right];
        let successes = outcomes.iter().filter(|result| result.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|result| {
                matches!(
                    result,
                    Err(LifecycleError::Conflict {
                        expected: RequestStatus::Pending,
                        actual: RequestStatus::Assigned,
                        ..
                    })
                )
            })
            .count();
        assert_eq!((successes, conflicts), (1, 1));
    }

    #[tokio::test]
    async fn concurrent_begin_review_loser_is_a_no_op() {
        let store = Arc::new(RendezvousStore {
            inner: InMemoryRecordStore::new(),
            reads: AtomicUsize::new(0),
            barrier: Barrier::new(2),
        });
        let seeded = store
            .inner
            .insert_request(EmergencyRequest::pending(chest_pain(), chrono::Utc::now()))
            .await
            .expect("seed request");
        let engine = engine_with(store.clone(), RetryPolicy::no_retry());
        let responder = Actor::responder("R123");

        let (left, right) = tokio::join!(
            engine.begin_review(&responder, &seeded.id),
            engine.begin_review(&responder, &seeded.id),
        );
        let left = left.expect("left review");
        let right = right.expect("right review");
        assert_eq!(
            [left.started, right.started]
                .iter()
                .filter(|started| **started)
                .count(),
            1
        );

        let history = store
            .inner
            .list_messages(&seeded.id, None)
            .await
            .expect("history");
        assert_eq!(history.len(), 1);
        assert!(history[0].is_system_notice);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried_within_policy() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryRecordStore::new(),
            failures: AtomicUsize::new(2),
        });
        let engine = engine_with(store.clone(), fast_retry(3));
        let request = engine
            .create(&Actor::requester("u-1"), chest_pain())
            .await
            .expect("create");

        let cancelled = engine
            .cancel(&Actor::coordinator("c-1"), &request.id)
            .await
            .expect("cancel after retries");
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        store.failures.store(5, Ordering::SeqCst);
        let second = engine
            .create(&Actor::requester("u-1"), chest_pain())
            .await
            .expect("create second");
        let error = engine
            .cancel(&Actor::coordinator("c-1"), &second.id)
            .await
            .expect_err("retries exhausted");
        assert!(matches!(
            error,
            LifecycleError::Unavailable { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn follow_up_and_summary_do_not_transition() {
        let (engine, fanout) = engine();
        let requester = Actor::requester("u-1");
        let responder = Actor::responder("R123");
        let first = engine
            .create(&requester, chest_pain().with_responder("R123"))
            .await
            .expect("create first");
        let second = engine
            .create(&requester, chest_pain())
            .await
            .expect("create second");
        engine
            .assign(&Actor::coordinator("c-1"), &second.id, AssignRequest::new("R123"))
            .await
            .expect("assign second");
        let published = fanout.metrics().published;

        let noted = engine
            .update_follow_up(&responder, &first.id, Some("  call back tomorrow ".into()))
            .await
            .expect("follow up");
        assert_eq!(noted.follow_up_notes.as_deref(), Some("call back tomorrow"));
        assert_eq!(noted.status, RequestStatus::Pending);
        assert_eq!(fanout.metrics().published, published);

        let cleared = engine
            .update_follow_up(&responder, &first.id, Some(" ".into()))
            .await
            .expect("clear follow up");
        assert_eq!(cleared.follow_up_notes, None);

        let summary = engine
            .responder_summary("R123")
            .await
            .expect("summary");
        assert_eq!((summary.pending, summary.assigned, summary.in_review), (1, 1, 0));
        assert_eq!(summary.open_total(), 2);

        let missing = engine.update_follow_up(&responder, "req-missing", None).await;
        assert!(matches!(missing, Err(LifecycleError::NotFound(_))));
    }

    async fn assert_transition_keeps_interleaved_notes(inner: Arc<dyn RecordStore>) {
        let seeded = inner
            .insert_request(EmergencyRequest::pending(chest_pain(), chrono::Utc::now()))
            .await
            .expect("seed request");
        let store = Arc::new(InterleavedNotesStore {
            inner,
            notes: "patient allergic to penicillin".to_string(),
            pending: AtomicUsize::new(1),
        });
        let engine = engine_with(store.clone(), RetryPolicy::no_retry());

        let review = engine
            .begin_review(&Actor::responder("R123"), &seeded.id)
            .await
            .expect("begin review");
        assert!(review.started);
        assert_eq!(review.request.status, RequestStatus::InReview);
        assert_eq!(review.request.revision, 3);
        assert_eq!(
            review.request.follow_up_notes.as_deref(),
            Some("patient allergic to penicillin")
        );

        let stored = engine.get_request(&seeded.id).await.expect("read back");
        assert_eq!(stored, review.request);
        let history = store
            .list_messages(&seeded.id, None)
            .await
            .expect("history");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn follow_up_written_during_transition_survives_in_memory() {
        assert_transition_keeps_interleaved_notes(Arc::new(InMemoryRecordStore::new())).await;
    }

    #[tokio::test]
    async fn follow_up_written_during_transition_survives_on_sqlite() {
        let temp = tempfile::tempdir().expect("create tempdir");
        let store =
            SqliteRecordStore::new(temp.path().join("socorro.sqlite")).expect("create store");
        assert_transition_keeps_interleaved_notes(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn assign_notes_still_replace_notes_after_a_revision_retry() {
        let inner: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let seeded = inner
            .insert_request(EmergencyRequest::pending(chest_pain(), chrono::Utc::now()))
            .await
            .expect("seed request");
        let engine = engine_with(
            Arc::new(InterleavedNotesStore {
                inner,
                notes: "gate code 1234".to_string(),
                pending: AtomicUsize::new(1),
            }),
            RetryPolicy::no_retry(),
        );

        let assigned = engine
            .assign(
                &Actor::coordinator("c-1"),
                &seeded.id,
                AssignRequest::new("R1").with_notes("bring oxygen"),
            )
            .await
            .expect("assign");
        assert_eq!(assigned.status, RequestStatus::Assigned);
        assert_eq!(assigned.responder_id.as_deref(), Some("R1"));
        assert_eq!(assigned.follow_up_notes.as_deref(), Some("bring oxygen"));
        assert_eq!(assigned.revision, 3);
    }
}
