use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use uuid::Uuid;

/// Mutex-guarded map from correlation identifier to a live socket handle.
///
/// Each endpoint role owns one instance: the relay keys public-socket write
/// halves, the client keys upstream write halves. Lookups hand out cloned
/// `Arc`s; iteration is deliberately not exposed.
pub struct Registry<T> {
    inner: Mutex<HashMap<Uuid, Arc<T>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, id: Uuid, value: Arc<T>) {
        self.inner.lock().await.insert(id, value);
    }

    pub async fn lookup(&self, id: &Uuid) -> Option<Arc<T>> {
        self.inner.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<T>> {
        self.inner.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
