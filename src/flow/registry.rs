// ============================================================================
// Transaction registry
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;
use uuid::Uuid;

use crate::datastore::DataStoreTransaction;

type Running = HashMap<Uuid, Arc<dyn DataStoreTransaction>>;

/// In-flight transactions by request id, kept for external cancellation.
///
/// Clones share the same table. Removal is synchronous so a request guard
/// can deregister from `Drop`.
#[derive(Default, Clone)]
pub struct TransactionRegistry {
    running: Arc<RwLock<Running>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_running_transaction(&self, request_id: Uuid, transaction: Arc<dyn DataStoreTransaction>) {
        self.running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, transaction);
    }

    pub async fn remove_running_transaction(&self, request_id: Uuid) -> bool {
        self.deregister(request_id)
    }

    /// Synchronous removal. Returns whether the request was registered.
    pub fn deregister(&self, request_id: Uuid) -> bool {
        self.running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id)
            .is_some()
    }

    pub async fn running_transactions(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub async fn get(&self, request_id: Uuid) -> Option<Arc<dyn DataStoreTransaction>> {
        self.running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request_id)
            .cloned()
    }

    /// Best-effort abort. Returns whether the request was running.
    pub async fn cancel(&self, request_id: Uuid) -> bool {
        match self.get(request_id).await {
            Some(transaction) => {
                debug!(request_id = %request_id, "cancelling transaction");
                transaction.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{DataStore, InMemoryDataStore};
    use crate::dictionary::EntityDictionary;

    #[tokio::test]
    async fn test_register_cancel_remove() {
        let store = InMemoryDataStore::new(Arc::new(EntityDictionary::new()));
        let registry = TransactionRegistry::new();
        let request_id = Uuid::new_v4();

        let tx = store.begin_transaction().await.unwrap();
        registry.add_running_transaction(request_id, Arc::clone(&tx)).await;
        assert_eq!(registry.running_transactions().await, vec![request_id]);

        assert!(registry.cancel(request_id).await);
        assert!(tx.flush().await.is_err());

        let shared = registry.clone();
        assert!(shared.deregister(request_id));
        assert!(!registry.remove_running_transaction(request_id).await);
        assert!(!registry.cancel(request_id).await);
        assert!(registry.running_transactions().await.is_empty());
    }
}
