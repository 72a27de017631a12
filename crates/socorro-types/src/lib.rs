//! Shared data types for Socorro emergency-request coordination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid request status transition: {from} -> {to}")]
    Invalid {
        from: RequestStatus,
        to: RequestStatus,
    },
}

/// Error returned when a persisted or wire tag does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownTagError {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle state for an emergency request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    #[default]
    Pending,
    Assigned,
    InReview,
    Resolved,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 5] = [
        Self::Pending,
        Self::Assigned,
        Self::InReview,
        Self::Resolved,
        Self::Cancelled,
    ];

    /// Returns true when this status can move forward to `next`.
    ///
    /// Staying in the same status is not a transition and returns false.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Assigned)
                | (Self::Pending, Self::InReview)
                | (Self::Pending, Self::Cancelled)
                | (Self::Assigned, Self::InReview)
                | (Self::Assigned, Self::Cancelled)
                | (Self::InReview, Self::Resolved)
                | (Self::InReview, Self::Cancelled)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StatusTransitionError::Invalid {
            from: self,
            to: next,
        })
    }

    /// Returns true when no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Assigned => "ASSIGNED",
            Self::InReview => "IN_REVIEW",
            Self::Resolved => "RESOLVED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownTagError {
                kind: "request_status",
                value: value.to_string(),
            })
    }
}

/// Kind of help an emergency request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Health,
    Legal,
    Housing,
    Food,
    Employment,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Self::Health,
        Self::Legal,
        Self::Housing,
        Self::Food,
        Self::Employment,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Health => "HEALTH",
            Self::Legal => "LEGAL",
            Self::Housing => "HOUSING",
            Self::Food => "FOOD",
            Self::Employment => "EMPLOYMENT",
            Self::Other => "OTHER",
        }
    }
}

impl FromStr for Category {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownTagError {
                kind: "category",
                value: value.to_string(),
            })
    }
}

/// Urgency of an emergency request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Low, Self::Normal, Self::High, Self::Urgent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|priority| priority.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownTagError {
                kind: "priority",
                value: value.to_string(),
            })
    }
}

/// Role of the party driving a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRole {
    Requester,
    Responder,
    Coordinator,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "REQUESTER",
            Self::Responder => "RESPONDER",
            Self::Coordinator => "COORDINATOR",
        }
    }
}

impl FromStr for ActorRole {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Self::Requester, Self::Responder, Self::Coordinator]
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownTagError {
                kind: "actor_role",
                value: value.to_string(),
            })
    }
}

/// Identity supplied by the upstream identity provider for every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(actor_id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            actor_id: actor_id.into(),
            role,
        }
    }

    pub fn requester(actor_id: impl Into<String>) -> Self {
        Self::new(actor_id, ActorRole::Requester)
    }

    pub fn responder(actor_id: impl Into<String>) -> Self {
        Self::new(actor_id, ActorRole::Responder)
    }

    pub fn coordinator(actor_id: impl Into<String>) -> Self {
        Self::new(actor_id, ActorRole::Coordinator)
    }
}

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderRole {
    Requester,
    Responder,
    System,
}

impl SenderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "REQUESTER",
            Self::Responder => "RESPONDER",
            Self::System => "SYSTEM",
        }
    }
}

impl FromStr for SenderRole {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Self::Requester, Self::Responder, Self::System]
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownTagError {
                kind: "sender_role",
                value: value.to_string(),
            })
    }
}

/// Input accepted by the create operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEmergencyRequest {
    pub requester_id: String,
    pub category: Category,
    pub description: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Responder pre-selected by the requester; does not assign the request.
    #[serde(default)]
    pub responder_id: Option<String>,
}

impl NewEmergencyRequest {
    pub fn new(
        requester_id: impl Into<String>,
        category: Category,
        description: impl Into<String>,
    ) -> Self {
        Self {
            requester_id: requester_id.into(),
            category,
            description: description.into(),
            address: None,
            priority: Priority::default(),
            responder_id: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_responder(mut self, responder_id: impl Into<String>) -> Self {
        self.responder_id = Some(responder_id.into());
        self
    }
}

/// Unit of work tracked by the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyRequest {
    pub id: String,
    pub requester_id: String,
    pub responder_id: Option<String>,
    pub category: Category,
    pub description: String,
    pub address: Option<String>,
    pub priority: Priority,
    pub status: RequestStatus,
    pub follow_up_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Incremented by the store on every persisted write.
    pub revision: u64,
}

impl EmergencyRequest {
    /// Builds a pending request from creation input with a fresh identifier.
    pub fn pending(input: NewEmergencyRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: new_request_id(),
            requester_id: input.requester_id.trim().to_string(),
            responder_id: non_blank(input.responder_id),
            category: input.category,
            description: input.description.trim().to_string(),
            address: non_blank(input.address),
            priority: input.priority,
            status: RequestStatus::Pending,
            follow_up_notes: None,
            created_at: now,
            assigned_at: None,
            resolved_at: None,
            cancelled_at: None,
            revision: 0,
        }
    }

    /// Returns true while the request still accepts transitions and chat.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Generates an opaque request identifier.
pub fn new_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// Generates an opaque domain event identifier.
pub fn new_event_id() -> String {
    format!("evt-{}", Uuid::new_v4())
}

/// Builds the message id for `sequence` within `request_id`.
pub fn message_id(request_id: &str, sequence: u64) -> String {
    format!("{request_id}:msg-{sequence}")
}

/// Trims `value` and maps blank strings to `None`.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

/// Immutable transcript entry attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub request_id: String,
    /// Per-request insertion sequence, starting at 1.
    pub sequence: u64,
    pub sender_role: SenderRole,
    pub sender_id: Option<String>,
    pub body: String,
    pub is_system_notice: bool,
    pub created_at: DateTime<Utc>,
    pub client_message_id: Option<String>,
}

/// Message content before the store assigns id, sequence and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub request_id: String,
    pub sender_role: SenderRole,
    pub sender_id: Option<String>,
    pub body: String,
    pub is_system_notice: bool,
    /// Idempotency key; appends sharing a key on one request store once.
    pub client_message_id: Option<String>,
}

impl MessageDraft {
    pub fn human(
        request_id: impl Into<String>,
        sender_role: SenderRole,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            sender_role,
            sender_id: Some(sender_id.into()),
            body: body.into(),
            is_system_notice: false,
            client_message_id: None,
        }
    }

    pub fn system_notice(request_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            sender_role: SenderRole::System,
            sender_id: None,
            body: body.into(),
            is_system_notice: true,
            client_message_id: None,
        }
    }

    pub fn with_client_message_id(mut self, client_message_id: impl Into<String>) -> Self {
        self.client_message_id = Some(client_message_id.into());
        self
    }

    /// Materializes the draft once the store has allocated `sequence`.
    pub fn into_message(self, sequence: u64, created_at: DateTime<Utc>) -> Message {
        Message {
            id: message_id(&self.request_id, sequence),
            request_id: self.request_id,
            sequence,
            sender_role: self.sender_role,
            sender_id: self.sender_id,
            body: self.body,
            is_system_notice: self.is_system_notice,
            created_at,
            client_message_id: self.client_message_id,
        }
    }
}

/// Name of an accepted lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Created,
    Assigned,
    ReviewStarted,
    Resolved,
    Cancelled,
}

impl TransitionKind {
    /// Returns the kind recorded when a request enters `status`.
    pub fn for_target(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Pending => Self::Created,
            RequestStatus::Assigned => Self::Assigned,
            RequestStatus::InReview => Self::ReviewStarted,
            RequestStatus::Resolved => Self::Resolved,
            RequestStatus::Cancelled => Self::Cancelled,
        }
    }

    /// Returns true when the event also goes to the responder's inbox.
    pub fn routes_to_inbox(self) -> bool {
        matches!(self, Self::Created | Self::Assigned)
    }
}

/// Emitted once per accepted transition, after the write commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub request_id: String,
    pub kind: TransitionKind,
    /// `None` for the creation event.
    pub from: Option<RequestStatus>,
    pub to: RequestStatus,
    pub actor: Actor,
    pub responder_id: Option<String>,
    pub revision: u64,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Builds the event describing `request` after a transition out of `from`.
    pub fn for_transition(
        request: &EmergencyRequest,
        from: Option<RequestStatus>,
        actor: Actor,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            request_id: request.id.clone(),
            kind: TransitionKind::for_target(request.status),
            from,
            to: request.status,
            actor,
            responder_id: request.responder_id.clone(),
            revision: request.revision,
            occurred_at: Utc::now(),
        }
    }
}

/// Interest scope a subscription registers for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum SubscriptionScope {
    ByRequest(String),
    ByResponderInbox(String),
}

impl fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByRequest(request_id) => write!(f, "request:{request_id}"),
            Self::ByResponderInbox(responder_id) => write!(f, "inbox:{responder_id}"),
        }
    }
}

/// Payload routed by the fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Transition(DomainEvent),
    Message(Message),
}

impl Notification {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Transition(event) => &event.request_id,
            Self::Message(message) => &message.request_id,
        }
    }

    /// Responder inbox that must also observe this notification, if any.
    pub fn inbox_responder(&self) -> Option<&str> {
        match self {
            Self::Transition(event) if event.kind.routes_to_inbox() => {
                event.responder_id.as_deref()
            }
            _ => None,
        }
    }

    /// Returns true when a subscription with `scope` should receive this.
    pub fn matches_scope(&self, scope: &SubscriptionScope) -> bool {
        match scope {
            SubscriptionScope::ByRequest(request_id) => self.request_id() == request_id,
            SubscriptionScope::ByResponderInbox(responder_id) => {
                self.inbox_responder() == Some(responder_id.as_str())
            }
        }
    }
}

/// Fan-out wrapper carrying the delivery identifier used for dedupe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Strictly increasing across every published notification.
    pub notification_id: u64,
    pub request_id: String,
    pub published_at: DateTime<Utc>,
    pub payload: Notification,
}

/// Filter used when listing requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestQuery {
    #[serde(default)]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub responder_id: Option<String>,
    #[serde(default)]
    pub statuses: Option<Vec<RequestStatus>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl RequestQuery {
    /// Returns true when `request` satisfies every populated filter.
    pub fn matches(&self, request: &EmergencyRequest) -> bool {
        let requester_match = self
            .requester_id
            .as_deref()
            .is_none_or(|requester_id| request.requester_id == requester_id);
        let responder_match = self
            .responder_id
            .as_deref()
            .is_none_or(|responder_id| request.responder_id.as_deref() == Some(responder_id));
        let status_match = self
            .statuses
            .as_ref()
            .is_none_or(|statuses| statuses.contains(&request.status));
        requester_match && responder_match && status_match
    }
}

/// Open-request counts shown on a responder's dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderSummary {
    pub responder_id: String,
    pub pending: usize,
    pub assigned: usize,
    pub in_review: usize,
}

impl ResponderSummary {
    pub fn open_total(&self) -> usize {
        self.pending + self.assigned + self.in_review
    }
}
