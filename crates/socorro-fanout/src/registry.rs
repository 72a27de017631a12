use crate::lock_or_recover;
use crate::subscription::{ConnectionId, SubscriptionId};
use socorro_types::{Envelope, Notification, SubscriptionScope};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Sending side of one subscription, owned by the registry.
#[derive(Debug, Clone)]
pub(crate) struct SubscriberEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) scope: SubscriptionScope,
    pub(crate) connection: ConnectionId,
    pub(crate) sender: mpsc::Sender<Envelope>,
    pub(crate) lagged: Arc<AtomicBool>,
}

/// Live subscriptions indexed by id, scope and owning connection.
///
/// Dropping an entry drops its sender, which ends the matching handle's stream.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    subscriptions: HashMap<SubscriptionId, SubscriberEntry>,
    by_scope: HashMap<SubscriptionScope, BTreeSet<SubscriptionId>>,
    by_connection: HashMap<ConnectionId, BTreeSet<SubscriptionId>>,
}

impl RegistryInner {
    fn remove(&mut self, id: SubscriptionId) -> Option<SubscriberEntry> {
        let entry = self.subscriptions.remove(&id)?;
        remove_index(&mut self.by_scope, &entry.scope, id);
        remove_index(&mut self.by_connection, &entry.connection, id);
        Some(entry)
    }
}

fn remove_index<K>(index: &mut HashMap<K, BTreeSet<SubscriptionId>>, key: &K, id: SubscriptionId)
where
    K: std::hash::Hash + Eq,
{
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, entry: SubscriberEntry) {
        let mut inner = lock_or_recover(&self.inner);
        inner
            .by_scope
            .entry(entry.scope.clone())
            .or_default()
            .insert(entry.id);
        inner
            .by_connection
            .entry(entry.connection.clone())
            .or_default()
            .insert(entry.id);
        inner.subscriptions.insert(entry.id, entry);
    }

    /// Removes one subscription. Returns false when it was already gone.
    pub fn detach(&self, id: SubscriptionId) -> bool {
        lock_or_recover(&self.inner).remove(id).is_some()
    }

    /// Tears down every subscription owned by `connection` and returns how many were removed.
    pub fn disconnect_connection(&self, connection: &ConnectionId) -> usize {
        let mut inner = lock_or_recover(&self.inner);
        let ids = inner
            .by_connection
            .get(connection)
            .cloned()
            .unwrap_or_default();
        ids.into_iter()
            .filter(|id| inner.remove(*id).is_some())
            .count()
    }

    pub fn subscriber_count(&self, scope: &SubscriptionScope) -> usize {
        lock_or_recover(&self.inner)
            .by_scope
            .get(scope)
            .map_or(0, BTreeSet::len)
    }

    pub fn active_subscriptions(&self) -> usize {
        lock_or_recover(&self.inner).subscriptions.len()
    }

    pub fn connection_subscriptions(&self, connection: &ConnectionId) -> Vec<SubscriptionId> {
        lock_or_recover(&self.inner)
            .by_connection
            .get(connection)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true when `id` is live and owned by `connection`.
    pub fn is_owned_by(&self, id: SubscriptionId, connection: &ConnectionId) -> bool {
        lock_or_recover(&self.inner)
            .subscriptions
            .get(&id)
            .is_some_and(|entry| &entry.connection == connection)
    }

    /// Collects the entries whose scope matches `notification`, in subscription order.
    pub(crate) fn matching(&self, notification: &Notification) -> Vec<SubscriberEntry> {
        let inner = lock_or_recover(&self.inner);
        let mut scopes = vec![SubscriptionScope::ByRequest(
            notification.request_id().to_string(),
        )];
        if let Some(responder_id) = notification.inbox_responder() {
            scopes.push(SubscriptionScope::ByResponderInbox(responder_id.to_string()));
        }

        scopes
            .iter()
            .filter_map(|scope| inner.by_scope.get(scope))
            .flat_map(|ids| ids.iter())
            .filter_map(|id| inner.subscriptions.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{SubscriberEntry, SubscriptionRegistry};
    use crate::subscription::{ConnectionId, SubscriptionId};
    use socorro_types::SubscriptionScope;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn entry(id: u64, scope: SubscriptionScope, connection: &ConnectionId) -> SubscriberEntry {
        let (sender, _receiver) = mpsc::channel(4);
        SubscriberEntry {
            id: SubscriptionId(id),
            scope,
            connection: connection.clone(),
            sender,
            lagged: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn indexes_by_scope_and_connection() {
        let registry = SubscriptionRegistry::new();
        let first = ConnectionId::from("conn-a");
        let second = ConnectionId::from("conn-b");
        let request = SubscriptionScope::ByRequest("req-1".to_string());
        let inbox = SubscriptionScope::ByResponderInbox("R1".to_string());

        registry.attach(entry(1, request.clone(), &first));
        registry.attach(entry(2, inbox.clone(), &first));
        registry.attach(entry(3, request.clone(), &second));

        assert_eq!(registry.active_subscriptions(), 3);
        assert_eq!(registry.subscriber_count(&request), 2);
        assert_eq!(registry.subscriber_count(&inbox), 1);
        assert!(registry.is_owned_by(SubscriptionId(2), &first));
        assert!(!registry.is_owned_by(SubscriptionId(2), &second));
        assert_eq!(
            registry.connection_subscriptions(&first),
            vec![SubscriptionId(1), SubscriptionId(2)]
        );
    }

    #[test]
    fn detach_and_disconnect_clean_every_index() {
        let registry = SubscriptionRegistry::new();
        let first = ConnectionId::from("conn-a");
        let second = ConnectionId::from("conn-b");
        let request = SubscriptionScope::ByRequest("req-1".to_string());

        registry.attach(entry(1, request.clone(), &first));
        registry.attach(entry(2, request.clone(), &first));
        registry.attach(entry(3, request.clone(), &second));

        assert!(registry.detach(SubscriptionId(3)));
        assert!(!registry.detach(SubscriptionId(3)));
        assert_eq!(registry.disconnect_connection(&first), 2);
        assert_eq!(registry.disconnect_connection(&first), 0);
        assert_eq!(registry.subscriber_count(&request), 0);
        assert_eq!(registry.active_subscriptions(), 0);
        assert!(registry.connection_subscriptions(&second).is_empty());
    }
}
