use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-request async mutex held across a commit and its publish.
///
/// Keeps publish order equal to commit order for one request while writes to
/// different requests proceed independently. Idle entries are removed when the
/// last guard drops.
#[derive(Debug, Default)]
pub struct PublishGate {
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a request's write and publish are in flight.
#[derive(Debug)]
pub struct PublishGuard<'a> {
    owner: &'a PublishGate,
    request_id: String,
    gate: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PublishGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self, request_id: &str) -> PublishGuard<'_> {
        let gate = {
            let mut gates = lock_or_recover(&self.gates);
            Arc::clone(gates.entry(request_id.to_string()).or_default())
        };
        let guard = Arc::clone(&gate).lock_owned().await;
        PublishGuard {
            owner: self,
            request_id: request_id.to_string(),
            gate,
            guard: Some(guard),
        }
    }

    /// Number of requests with a write currently holding or awaiting the gate.
    pub fn active_requests(&self) -> usize {
        lock_or_recover(&self.gates).len()
    }
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut gates = lock_or_recover(&self.owner.gates);
        // Map entry plus this guard's clone; anything more is a waiter.
        if Arc::strong_count(&self.gate) == 2 {
            gates.remove(&self.request_id);
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
