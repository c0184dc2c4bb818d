use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tboard_core::types::RunId;
use tokio::sync::broadcast;

use super::ledger::LedgerSnapshot;

/// Notification group that sees the deletion ledger of `owner`'s runs.
pub fn group_for_owner(owner: &str) -> String {
    format!("tboard.delete.{owner}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerUpdate {
    pub group: String,
    /// Run whose transition triggered this update.
    pub run_id: RunId,
    pub snapshot: LedgerSnapshot,
}

/// Per-group broadcast channels, created on first use.
#[derive(Debug)]
pub struct NotificationHub {
    capacity: usize,
    groups: Mutex<HashMap<String, broadcast::Sender<Arc<LedgerUpdate>>>>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, group: &str) -> broadcast::Sender<Arc<LedgerUpdate>> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<Arc<LedgerUpdate>> {
        self.sender(group).subscribe()
    }

    /// Returns the number of subscribers reached. No subscribers is not an
    /// error; late joiners fetch the current snapshot themselves.
    pub fn publish(&self, update: LedgerUpdate) -> usize {
        let group = update.group.clone();
        match self.sender(&group).send(Arc::new(update)) {
            Ok(n) => n,
            Err(_) => {
                tracing::debug!(group = %group, "ledger update with no subscribers");
                0
            }
        }
    }
}
