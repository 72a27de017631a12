use crate::config::RetryPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::publish_gate::PublishGate;
use crate::retry::with_store_retry;
use socorro_fanout::NotificationFanout;
use socorro_store::RecordStore;
use socorro_types::{non_blank, EmergencyRequest, Message, MessageDraft, Notification, SenderRole};
use std::sync::Arc;
use uuid::Uuid;

/// Append-only per-request transcript backed by the record store.
pub struct MessageLog {
    store: Arc<dyn RecordStore>,
    fanout: Arc<NotificationFanout>,
    gate: Arc<PublishGate>,
    retry: RetryPolicy,
}

impl MessageLog {
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

    /// Stores `draft` and publishes it to the request's subscribers.
    ///
    /// A draft without `client_message_id` gets a generated one so store
    /// retries cannot duplicate it. Re-sending a known id returns the stored
    /// message and publishes it again; subscribers dedupe by message id.
    #[tracing::instrument(
        name = "socorro_lifecycle.append_message",
        skip(self, draft),
        fields(request_id = %draft.request_id, sender_role = draft.sender_role.as_str())
    )]
    pub async fn append(&self, draft: MessageDraft) -> LifecycleResult<Message> {
        let mut draft = validate_draft(draft)?;
        if draft.client_message_id.is_none() {
            draft.client_message_id = Some(format!("auto-{}", Uuid::new_v4()));
        }

        let _guard = self.gate.enter(&draft.request_id).await;
        let request = self.load_request(&draft.request_id).await?;
        if !request.is_open() && draft.sender_role != SenderRole::System {
            return Err(LifecycleError::InvalidTransition {
                request_id: request.id,
                status: request.status,
                operation: "send_message",
            });
        }

        let store = self.store.as_ref();
        let draft_ref = &draft;
        let appended = with_store_retry(&self.retry, "append_message", move || {
            store.append_message(draft_ref.clone())
        })
        .await?;
        self.fanout
            .publish(Notification::Message(appended.message.clone()));
        tracing::debug!(
            message_id = %appended.message.id,
            sequence = appended.message.sequence,
            duplicate = appended.duplicate,
            "appended transcript message"
        );
        Ok(appended.message)
    }

    /// Full transcript ordered by sequence.
    pub async fn history(&self, request_id: &str) -> LifecycleResult<Vec<Message>> {
        self.history_after(request_id, None).await
    }

    /// Transcript entries with `sequence > after_sequence`.
    pub async fn history_after(
        &self,
        request_id: &str,
        after_sequence: Option<u64>,
    ) -> LifecycleResult<Vec<Message>> {
        self.load_request(request_id).await?;
        let store = self.store.as_ref();
        with_store_retry(&self.retry, "list_messages", move || {
            store.list_messages(request_id, after_sequence)
        })
        .await
    }

    async fn load_request(&self, request_id: &str) -> LifecycleResult<EmergencyRequest> {
        let store = self.store.as_ref();
        with_store_retry(&self.retry, "get_request", move || store.get_request(request_id))
            .await?
            .ok_or_else(|| LifecycleError::NotFound(request_id.to_string()))
    }
}

fn validate_draft(mut draft: MessageDraft) -> LifecycleResult<MessageDraft> {
    draft.body = draft.body.trim().to_string();
    draft.sender_id = non_blank(draft.sender_id);
    draft.client_message_id = non_blank(draft.client_message_id);

    if draft.sender_role == SenderRole::System {
        if !draft.is_system_notice {
            return Err(LifecycleError::validation(
                "system messages must be marked as system notices",
            ));
        }
        return Ok(draft);
    }
    if draft.is_system_notice {
        return Err(LifecycleError::validation(
            "only the system sender may post system notices",
        ));
    }
    if draft.sender_id.is_none() {
        return Err(LifecycleError::validation(
            "sender_id is required for requester and responder messages",
        ));
    }
    if draft.body.is_empty() {
        return Err(LifecycleError::validation("message body must be non-empty"));
    }
    Ok(draft)
}
