use crate::config::CoordinationConfig;
use crate::engine::{AssignRequest, LifecycleEngine, ReviewOutcome};
use crate::error::{LifecycleError, LifecycleResult};
use crate::message_log::MessageLog;
use crate::publish_gate::PublishGate;
use anyhow::Result;
use socorro_fanout::{
    ConnectionId, FanoutMetrics, NotificationFanout, ResumeOutcome, SubscriptionHandle,
    SubscriptionScope,
};
use socorro_store::RecordStore;
use socorro_types::{
    Actor, ActorRole, EmergencyRequest, Message, MessageDraft, NewEmergencyRequest,
    RequestQuery, RequestStatus, ResponderSummary, SenderRole,
};
use std::sync::Arc;

/// Snapshot plus live tail returned when a transcript is opened.
#[derive(Debug)]
pub struct TranscriptSession {
    pub request: EmergencyRequest,
    pub history: Vec<Message>,
    /// Yields only messages after `history`, plus every later transition.
    pub subscription: SubscriptionHandle,
    pub review_started: bool,
}

/// Live inbox subscription plus the responder's open requests at attach time.
#[derive(Debug)]
pub struct InboxWatch {
    pub subscription: SubscriptionHandle,
    pub open_requests: Vec<EmergencyRequest>,
}

/// Single entry point for transports: lifecycle, transcript and subscriptions.
pub struct CoordinationService {
    engine: LifecycleEngine,
    messages: MessageLog,
    fanout: Arc<NotificationFanout>,
    config: CoordinationConfig,
}

impl CoordinationService {
    pub fn new(store: Arc<dyn RecordStore>, config: CoordinationConfig) -> Result<Self> {
        config.validate()?;
        let fanout = Arc::new(NotificationFanout::new(config.fanout)?);
        let gate = Arc::new(PublishGate::new());
        Ok(Self {
            engine: LifecycleEngine::new(
                Arc::clone(&store),
                Arc::clone(&fanout),
                Arc::clone(&gate),
                config.retry,
            ),
            messages: MessageLog::new(store, Arc::clone(&fanout), gate, config.retry),
            fanout,
            config,
        })
    }

    pub fn config(&self) -> CoordinationConfig {
        self.config
    }

    pub fn fanout(&self) -> &Arc<NotificationFanout> {
        &self.fanout
    }

    pub fn fanout_metrics(&self) -> FanoutMetrics {
        self.fanout.metrics()
    }

    pub async fn create_request(
        &self,
        actor: &Actor,
        input: NewEmergencyRequest,
    ) -> LifecycleResult<EmergencyRequest> {
        self.engine.create(actor, input).await
    }

    pub async fn assign(
        &self,
        actor: &Actor,
        request_id: &str,
        input: AssignRequest,
    ) -> LifecycleResult<EmergencyRequest> {
        self.engine.assign(actor, request_id, input).await
    }

    pub async fn begin_review(
        &self,
        actor: &Actor,
        request_id: &str,
    ) -> LifecycleResult<ReviewOutcome> {
        self.engine.begin_review(actor, request_id).await
    }

    pub async fn resolve(
        &self,
        actor: &Actor,
        request_id: &str,
    ) -> LifecycleResult<EmergencyRequest> {
        self.engine.resolve(actor, request_id).await
    }

    pub async fn cancel(
        &self,
        actor: &Actor,
        request_id: &str,
    ) -> LifecycleResult<EmergencyRequest> {
        self.engine.cancel(actor, request_id).await
    }

    pub async fn update_follow_up(
        &self,
        actor: &Actor,
        request_id: &str,
        notes: Option<String>,
    ) -> LifecycleResult<EmergencyRequest> {
        self.engine.update_follow_up(actor, request_id, notes).await
    }

    pub async fn get_request(&self, request_id: &str) -> LifecycleResult<EmergencyRequest> {
        self.engine.get_request(request_id).await
    }

    pub async fn list_requests(
        &self,
        query: RequestQuery,
    ) -> LifecycleResult<Vec<EmergencyRequest>> {
        self.engine.list_requests(query).await
    }

    pub async fn responder_summary(&self, responder_id: &str) -> LifecycleResult<ResponderSummary> {
        self.engine.responder_summary(responder_id).await
    }

    /// Posts a chat message as `actor`; the sender role follows the actor role.
    pub async fn send_message(
        &self,
        actor: &Actor,
        request_id: &str,
        body: impl Into<String>,
        client_message_id: Option<String>,
    ) -> LifecycleResult<Message> {
        let sender_role = match actor.role {
            ActorRole::Requester => SenderRole::Requester,
            ActorRole::Responder => SenderRole::Responder,
            ActorRole::Coordinator => {
                return Err(LifecycleError::validation(
                    "coordinators cannot post to a request transcript",
                ));
            }
        };
        let mut draft = MessageDraft::human(request_id, sender_role, actor.actor_id.clone(), body);
        if let Some(client_message_id) = client_message_id {
            draft = draft.with_client_message_id(client_message_id);
        }
        self.messages.append(draft).await
    }

    pub async fn history(&self, request_id: &str) -> LifecycleResult<Vec<Message>> {
        self.messages.history(request_id).await
    }

    pub async fn history_after(
        &self,
        request_id: &str,
        after_sequence: u64,
    ) -> LifecycleResult<Vec<Message>> {
        self.messages
            .history_after(request_id, Some(after_sequence))
            .await
    }

    pub fn subscribe(
        &self,
        scope: SubscriptionScope,
        connection: ConnectionId,
    ) -> SubscriptionHandle {
        self.fanout.subscribe(scope, connection)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        handle.unsubscribe();
    }

    pub fn resume(
        &self,
        scope: SubscriptionScope,
        connection: ConnectionId,
        after_notification_id: u64,
    ) -> ResumeOutcome {
        self.fanout.resume(scope, connection, after_notification_id)
    }

    /// Tears down every subscription owned by `connection`.
    pub fn disconnect(&self, connection: &ConnectionId) -> usize {
        let removed = self.fanout.registry().disconnect_connection(connection);
        tracing::debug!(%connection, removed, "disconnected subscriptions");
        removed
    }

    /// Subscribes to the request, starts review for responders, then reads history.
    ///
    /// Subscribing first and cutting live messages over at the last history
    /// sequence means nothing is missed or seen twice across the boundary.
    #[tracing::instrument(
        name = "socorro_lifecycle.open_transcript",
        skip(self, actor, connection),
        fields(actor_id = %actor.actor_id, role = actor.role.as_str())
    )]
    pub async fn open_transcript(
        &self,
        actor: &Actor,
        request_id: &str,
        connection: ConnectionId,
    ) -> LifecycleResult<TranscriptSession> {
        let mut subscription =
            self.subscribe(SubscriptionScope::ByRequest(request_id.to_string()), connection);

        let mut request = self.engine.get_request(request_id).await?;
        let mut review_started = false;
        if actor.role == ActorRole::Responder
            && matches!(
                request.status,
                RequestStatus::Pending | RequestStatus::Assigned
            )
        {
            let outcome = self.engine.begin_review(actor, request_id).await?;
            review_started = outcome.started;
            request = outcome.request;
        }

        let history = self.messages.history(request_id).await?;
        subscription.set_message_cutover(history.last().map_or(0, |message| message.sequence));
        Ok(TranscriptSession {
            request,
            history,
            subscription,
            review_started,
        })
    }

    /// Subscribes to a responder's inbox, then lists its open requests for resync.
    #[tracing::instrument(
        name = "socorro_lifecycle.watch_inbox",
        skip(self, connection)
    )]
    pub async fn watch_inbox(
        &self,
        responder_id: &str,
        connection: ConnectionId,
    ) -> LifecycleResult<InboxWatch> {
        let responder_id = responder_id.trim();
        if responder_id.is_empty() {
            return Err(LifecycleError::validation("responder_id must be non-empty"));
        }
        let subscription = self.subscribe(
            SubscriptionScope::ByResponderInbox(responder_id.to_string()),
            connection,
        );
        let open_requests = self
            .engine
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
        Ok(InboxWatch {
            subscription,
            open_requests,
        })
    }
}
