//! Record store abstractions and in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use socorro_types::{
    EmergencyRequest, Message, MessageDraft, RequestQuery, RequestStatus, StatusTransitionError,
};
pub use sqlite::SqliteRecordStore;

/// Result type for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("emergency request '{0}' already exists")]
    RequestAlreadyExists(String),
    #[error("emergency request '{0}' not found")]
    RequestNotFound(String),
    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns true when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Outcome of a compare-and-swap on a request's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalUpdate {
    /// The write committed; `notice` is set when a system notice was stored with it.
    Applied {
        request: EmergencyRequest,
        notice: Option<Message>,
    },
    /// The stored status no longer matched the expected prior status.
    StatusMismatch { current: EmergencyRequest },
    /// The status matched but another write landed after `updated` was read.
    RevisionMismatch { current: EmergencyRequest },
    NotFound,
}

/// Result of appending a transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedMessage {
    pub message: Message,
    /// True when an earlier append with the same `client_message_id` was returned.
    pub duplicate: bool,
}

/// Async store contract used by the lifecycle engine and message log.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new request and returns it with its first revision.
    async fn insert_request(&self, request: EmergencyRequest) -> StoreResult<EmergencyRequest>;
    async fn get_request(&self, request_id: &str) -> StoreResult<Option<EmergencyRequest>>;
    /// Lists matching requests, newest first.
    async fn query_requests(&self, query: RequestQuery) -> StoreResult<Vec<EmergencyRequest>>;

    /// Replaces the request when its stored status still equals `expected`
    /// and its stored revision still equals `updated.revision`.
    ///
    /// `notice` is appended to the request's transcript in the same write.
    async fn update_request_if_status(
        &self,
        expected: RequestStatus,
        updated: EmergencyRequest,
        notice: Option<MessageDraft>,
    ) -> StoreResult<ConditionalUpdate>;
    async fn update_follow_up_notes(
        &self,
        request_id: &str,
        notes: Option<String>,
    ) -> StoreResult<Option<EmergencyRequest>>;

    async fn append_message(&self, draft: MessageDraft) -> StoreResult<AppendedMessage>;
    /// Lists messages ordered by sequence, optionally only those after `after_sequence`.
    async fn list_messages(
        &self,
        request_id: &str,
        after_sequence: Option<u64>,
    ) -> StoreResult<Vec<Message>>;
}

/// Checks that a conditional write describes a legal move out of `expected`.
fn ensure_conditional_write(
    expected: RequestStatus,
    updated: &EmergencyRequest,
) -> StoreResult<()> {
    if updated.status != expected {
        expected.ensure_transition(updated.status)?;
    }
    Ok(())
}

/// Keeps `created_at` non-decreasing within a transcript when the clock steps back.
fn monotonic_timestamp(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match last {
        Some(last) if last > now => last,
        _ => now,
    }
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    requests: HashMap<String, EmergencyRequest>,
    messages: HashMap<String, Vec<Message>>,
}

impl StoreInner {
    fn push_message(&mut self, draft: MessageDraft) -> Message {
        let transcript = self.messages.entry(draft.request_id.clone()).or_default();
        let sequence = transcript.len() as u64 + 1;
        let created_at =
            monotonic_timestamp(transcript.last().map(|item| item.created_at), Utc::now());
        let message = draft.into_message(sequence, created_at);
        transcript.push(message.clone());
        message
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_request(
        &self,
        mut request: EmergencyRequest,
    ) -> StoreResult<EmergencyRequest> {
        let mut inner = self.inner.write().await;
        if inner.requests.contains_key(&request.id) {
            return Err(StoreError::RequestAlreadyExists(request.id));
        }
        request.revision = 1;
        inner.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn get_request(&self, request_id: &str) -> StoreResult<Option<EmergencyRequest>> {
        let inner = self.inner.read().await;
        Ok(inner.requests.get(request_id).cloned())
    }

    async fn query_requests(&self, query: RequestQuery) -> StoreResult<Vec<EmergencyRequest>> {
        let inner = self.inner.read().await;
        let mut requests: Vec<EmergencyRequest> = inner
            .requests
            .values()
            .filter(|request| query.matches(request))
            .cloned()
            .collect();
        sort_newest_first(&mut requests);

        let start = query.offset.min(requests.len());
        let mut sliced = requests.split_off(start);
        if let Some(limit) = query.limit {
            sliced.truncate(limit);
        }
        Ok(sliced)
    }

    async fn update_request_if_status(
        &self,
        expected: RequestStatus,
        mut updated: EmergencyRequest,
        notice: Option<MessageDraft>,
    ) -> StoreResult<ConditionalUpdate> {
        let mut inner = self.inner.write().await;
        let Some(current) = inner.requests.get(&updated.id) else {
            return Ok(ConditionalUpdate::NotFound);
        };
        if current.status != expected {
            return Ok(ConditionalUpdate::StatusMismatch {
                current: current.clone(),
            });
        }
        if current.revision != updated.revision {
            return Ok(ConditionalUpdate::RevisionMismatch {
                current: current.clone(),
            });
        }
        ensure_conditional_write(expected, &updated)?;

        updated.revision = current.revision + 1;
        inner.requests.insert(updated.id.clone(), updated.clone());
        let notice = notice.map(|draft| inner.push_message(draft));
        Ok(ConditionalUpdate::Applied {
            request: updated,
            notice,
        })
    }

    async fn update_follow_up_notes(
        &self,
        request_id: &str,
        notes: Option<String>,
    ) -> StoreResult<Option<EmergencyRequest>> {
        let mut inner = self.inner.write().await;
        let Some(request) = inner.requests.get_mut(request_id) else {
            return Ok(None);
        };
        request.follow_up_notes = notes;
        request.revision += 1;
        Ok(Some(request.clone()))
    }

    async fn append_message(&self, draft: MessageDraft) -> StoreResult<AppendedMessage> {
        let mut inner = self.inner.write().await;
        if !inner.requests.contains_key(&draft.request_id) {
            return Err(StoreError::RequestNotFound(draft.request_id));
        }

        if let Some(client_message_id) = draft.client_message_id.as_deref() {
            let existing = inner.messages.get(&draft.request_id).and_then(|transcript| {
                transcript
                    .iter()
                    .find(|item| item.client_message_id.as_deref() == Some(client_message_id))
            });
            if let Some(existing) = existing {
                return Ok(AppendedMessage {
                    message: existing.clone(),
                    duplicate: true,
                });
            }
        }

        let message = inner.push_message(draft);
        Ok(AppendedMessage {
            message,
            duplicate: false,
        })
    }

    async fn list_messages(
        &self,
        request_id: &str,
        after_sequence: Option<u64>,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let after = after_sequence.unwrap_or(0);
        Ok(inner
            .messages
            .get(request_id)
            .map(|transcript| {
                transcript
                    .iter()
                    .filter(|item| item.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn sort_newest_first(requests: &mut [EmergencyRequest]) {
    requests.sort_by(|left, right| {
        right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| left.id.cmp(&right.id))
    });
}

#[cfg(test)]
mod tests {
    use super::{ConditionalUpdate, InMemoryRecordStore, RecordStore, StoreError};
    use chrono::Utc;
    use socorro_types::{
        Category, EmergencyRequest, MessageDraft, NewEmergencyRequest, RequestQuery,
        RequestStatus, SenderRole,
    };

    fn pending(requester_id: &str, description: &str) -> EmergencyRequest {
        EmergencyRequest::pending(
            NewEmergencyRequest::new(requester_id, Category::Health, description),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn inserts_and_reads_requests() {
        let store = InMemoryRecordStore::new();
        let stored = store
            .insert_request(pending("u-1", "chest pain"))
            .await
            .expect("insert");
        assert_eq!(stored.revision, 1);

        let loaded = store
            .get_request(&stored.id)
            .await
            .expect("get")
            .expect("request exists");
        assert_eq!(loaded, stored);

        let duplicate = store.insert_request(stored.clone()).await;
        assert!(matches!(duplicate, Err(StoreError::RequestAlreadyExists(_))));
    }

    #[tokio::test]
    async fn conditional_update_applies_only_on_expected_status() {
        let store = InMemoryRecordStore::new();
        let stored = store
            .insert_request(pending("u-1", "chest pain"))
            .await
            .expect("insert");

        let mut assigned = stored.clone();
        assigned.status = RequestStatus::Assigned;
        assigned.responder_id = Some("R1".to_string());
        let outcome = store
            .update_request_if_status(RequestStatus::Pending, assigned.clone(), None)
            .await
            .expect("first update");
        let ConditionalUpdate::Applied { request, notice } = outcome else {
            panic!("expected applied update");
        };
        assert_eq!(request.revision, 2);
        assert!(notice.is_none());

        let stale = store
            .update_request_if_status(RequestStatus::Pending, assigned, None)
            .await
            .expect("second update");
        let ConditionalUpdate::StatusMismatch { current } = stale else {
            panic!("expected status mismatch");
        };
        assert_eq!(current.status, RequestStatus::Assigned);
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_revision_without_writing() {
        let store = InMemoryRecordStore::new();
        let stored = store
            .insert_request(pending("u-1", "chest pain"))
            .await
            .expect("insert");
        store
            .update_follow_up_notes(&stored.id, Some("allergic to penicillin".to_string()))
            .await
            .expect("notes")
            .expect("request exists");

        let mut assigned = stored.clone();
        assigned.status = RequestStatus::Assigned;
        let stale = store
            .update_request_if_status(RequestStatus::Pending, assigned, None)
            .await
            .expect("stale update");
        let ConditionalUpdate::RevisionMismatch { current } = stale else {
            panic!("expected revision mismatch");
        };
        assert_eq!(current.status, RequestStatus::Pending);
        assert_eq!(current.revision, 2);
        assert_eq!(
            current.follow_up_notes.as_deref(),
            Some("allergic to penicillin")
        );
    }

    #[tokio::test]
    async fn conditional_update_rejects_illegal_moves_and_unknown_ids() {
        let store = InMemoryRecordStore::new();
        let stored = store
            .insert_request(pending("u-1", "eviction notice"))
            .await
            .expect("insert");

        let mut resolved = stored.clone();
        resolved.status = RequestStatus::Resolved;
        let illegal = store
            .update_request_if_status(RequestStatus::Pending, resolved, None)
            .await;
        assert!(matches!(illegal, Err(StoreError::InvalidTransition(_))));

        let unknown = store
            .update_request_if_status(RequestStatus::Pending, pending("u-2", "ghost"), None)
            .await
            .expect("unknown update");
        assert_eq!(unknown, ConditionalUpdate::NotFound);
    }

    #[tokio::test]
    async fn transition_notice_is_written_with_the_update() {
        let store = InMemoryRecordStore::new();
        let stored = store
            .insert_request(pending("u-1", "chest pain"))
            .await
            .expect("insert");
        let mut review = stored.clone();
        review.status = RequestStatus::InReview;

        let outcome = store
            .update_request_if_status(
                RequestStatus::Pending,
                review,
                Some(MessageDraft::system_notice(stored.id.clone(), "started")),
            )
            .await
            .expect("update");
        let ConditionalUpdate::Applied { notice, .. } = outcome else {
            panic!("expected applied update");
        };
        let notice = notice.expect("notice stored");
        assert_eq!(notice.sequence, 1);

        let history = store
            .list_messages(&stored.id, None)
            .await
            .expect("history");
        assert_eq!(history, vec![notice]);
    }

    #[tokio::test]
    async fn appends_in_sequence_and_dedupes_by_client_id() {
        let store = InMemoryRecordStore::new();
        let stored = store
            .insert_request(pending("u-1", "chest pain"))
            .await
            .expect("insert");

        let first = store
            .append_message(
                MessageDraft::human(&stored.id, SenderRole::Requester, "u-1", "hola")
                    .with_client_message_id("c-1"),
            )
            .await
            .expect("first append");
        let second = store
            .append_message(MessageDraft::human(
                &stored.id,
                SenderRole::Responder,
                "R1",
                "on our way",
            ))
            .await
            .expect("second append");
        let replayed = store
            .append_message(
                MessageDraft::human(&stored.id, SenderRole::Requester, "u-1", "hola")
                    .with_client_message_id("c-1"),
            )
            .await
            .expect("replayed append");

        assert_eq!(first.message.sequence, 1);
        assert_eq!(second.message.sequence, 2);
        assert!(replayed.duplicate);
        assert_eq!(replayed.message, first.message);

        let tail = store
            .list_messages(&stored.id, Some(1))
            .await
            .expect("tail");
        assert_eq!(tail, vec![second.message]);

        let missing = store
            .append_message(MessageDraft::system_notice("req-missing", "x"))
            .await;
        assert!(matches!(missing, Err(StoreError::RequestNotFound(_))));
    }

    #[tokio::test]
    async fn queries_filter_and_page_newest_first() {
        let store = InMemoryRecordStore::new();
        for index in 0..3 {
            let mut request = pending("u-1", &format!("need {index}"));
            request.created_at = Utc::now() + chrono::Duration::seconds(index);
            store.insert_request(request).await.expect("insert");
        }
        store
            .insert_request(pending("u-2", "other requester"))
            .await
            .expect("insert other");

        let rows = store
            .query_requests(RequestQuery {
                requester_id: Some("u-1".to_string()),
                limit: Some(2),
                ..RequestQuery::default()
            })
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].description, "need 2");
        assert_eq!(rows[1].description, "need 1");

        let follow_up = store
            .update_follow_up_notes(&rows[0].id, Some("called back".to_string()))
            .await
            .expect("notes")
            .expect("request exists");
        assert_eq!(follow_up.follow_up_notes.as_deref(), Some("called back"));
        assert_eq!(follow_up.status, RequestStatus::Pending);
        assert_eq!(follow_up.revision, 2);
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(StoreError::Unavailable("down".to_string()).is_transient());
        assert!(!StoreError::RequestNotFound("req-1".to_string()).is_transient());
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::from(busy).is_transient());
    }
}
