use std::sync::Arc;

use socorro_fanout::{ConnectionId, SubscriptionHandle, SubscriptionItem, SubscriptionScope};
use socorro_lifecycle::{AssignRequest, CoordinationConfig, CoordinationService, LifecycleError};
use socorro_store::{InMemoryRecordStore, RecordStore, SqliteRecordStore};
use socorro_types::{
    Actor, Category, Envelope, NewEmergencyRequest, Notification, RequestStatus, SenderRole,
    TransitionKind,
};

fn drain(handle: &mut SubscriptionHandle) -> Vec<Envelope> {
    std::iter::from_fn(|| handle.try_recv())
        .map(|item| match item {
            SubscriptionItem::Envelope(envelope) => envelope,
            SubscriptionItem::ResyncRequired { .. } => panic!("unexpected resync"),
        })
        .collect()
}

fn transition_kinds(envelopes: &[Envelope]) -> Vec<TransitionKind> {
    envelopes
        .iter()
        .filter_map(|envelope| match &envelope.payload {
            Notification::Transition(event) => Some(event.kind),
            Notification::Message(_) => None,
        })
        .collect()
}

fn message_bodies(envelopes: &[Envelope]) -> Vec<String> {
    envelopes
        .iter()
        .filter_map(|envelope| match &envelope.payload {
            Notification::Message(message) => Some(message.body.clone()),
            Notification::Transition(_) => None,
        })
        .collect()
}

async fn run_chest_pain_scenario(store: Arc<dyn RecordStore>) {
    let service =
        CoordinationService::new(store, CoordinationConfig::default()).expect("service");
    let requester = Actor::requester("u-1");
    let coordinator = Actor::coordinator("c-1");
    let responder = Actor::responder("R123");

    let mut inbox = service
        .watch_inbox("R123", ConnectionId::new())
        .await
        .expect("watch inbox");

    let request = service
        .create_request(
            &requester,
            NewEmergencyRequest::new("u-1", Category::Health, "chest pain"),
        )
        .await
        .expect("create request");
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.responder_id, None);

    let mut requester_view = service.subscribe(
        SubscriptionScope::ByRequest(request.id.clone()),
        ConnectionId::new(),
    );

    let assigned = service
        .assign(&coordinator, &request.id, AssignRequest::new("R123"))
        .await
        .expect("assign");
    assert_eq!(assigned.status, RequestStatus::Assigned);
    assert!(assigned.assigned_at.is_some());
    let inbox_events = drain(&mut inbox.subscription);
    assert_eq!(transition_kinds(&inbox_events), vec![TransitionKind::Assigned]);
    assert_eq!(inbox_events[0].request_id, request.id);

    let mut session = service
        .open_transcript(&responder, &request.id, ConnectionId::new())
        .await
        .expect("open transcript");
    assert!(session.review_started);
    assert_eq!(session.request.status, RequestStatus::InReview);
    assert_eq!(session.history.len(), 1);
    let notice = session.history[0].clone();
    assert!(notice.is_system_notice);
    assert_eq!(notice.sender_role, SenderRole::System);

    let reply = service
        .send_message(&responder, &request.id, "on our way", None)
        .await
        .expect("send reply");
    assert!(reply.sequence > notice.sequence);

    let resolved = service
        .resolve(&responder, &request.id)
        .await
        .expect("resolve");
    assert_eq!(resolved.status, RequestStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    let requester_seen = drain(&mut requester_view);
    assert_eq!(
        transition_kinds(&requester_seen),
        vec![
            TransitionKind::Assigned,
            TransitionKind::ReviewStarted,
            TransitionKind::Resolved
        ]
    );
    assert_eq!(
        message_bodies(&requester_seen),
        vec![notice.body.clone(), "on our way".to_string()]
    );

    let responder_seen = drain(&mut session.subscription);
    assert_eq!(message_bodies(&responder_seen), vec!["on our way".to_string()]);

    let history = service.history(&request.id).await.expect("history");
    let bodies: Vec<_> = history.iter().map(|message| message.body.as_str()).collect();
    assert_eq!(bodies, vec![notice.body.as_str(), "on our way"]);
}

#[tokio::test]
async fn chest_pain_scenario_runs_end_to_end_in_memory() {
    run_chest_pain_scenario(Arc::new(InMemoryRecordStore::new())).await;
}

#[tokio::test]
async fn chest_pain_scenario_runs_end_to_end_on_sqlite() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = SqliteRecordStore::new(temp.path().join("socorro.sqlite")).expect("sqlite store");
    run_chest_pain_scenario(Arc::new(store)).await;
}

#[tokio::test]
async fn resolve_on_pending_request_leaves_it_untouched() {
    let service = CoordinationService::new(
        Arc::new(InMemoryRecordStore::new()),
        CoordinationConfig::default(),
    )
    .expect("service");
    let request = service
        .create_request(
            &Actor::requester("u-1"),
            NewEmergencyRequest::new("u-1", Category::Health, "chest pain"),
        )
        .await
        .expect("create request");

    let result = service.resolve(&Actor::responder("R123"), &request.id).await;
    assert!(matches!(
        result,
        Err(LifecycleError::InvalidTransition {
            status: RequestStatus::Pending,
            ..
        })
    ));
    let stored = service.get_request(&request.id).await.expect("get request");
    assert_eq!(stored, request);
    assert!(service.history(&request.id).await.expect("history").is_empty());
}
