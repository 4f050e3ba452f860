//! Per-subgraph document storage.
//!
//! Each subgraph owns exactly one store per record type and nothing else
//! reads it. Documents are keyed by an opaque UUID string.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document {0} already exists")]
    Duplicate(String),
}

pub trait Document: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// RFC 3339 in UTC, so timestamps sort as strings.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub type Predicate<'a, T> = &'a (dyn Fn(&T) -> bool + Send + Sync);

#[async_trait]
pub trait DocumentStore<T: Document>: Send + Sync {
    async fn create(&self, document: T) -> Result<T, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError>;

    /// Documents matching `predicate`, in insertion order.
    async fn find(&self, predicate: Predicate<'_, T>) -> Result<Vec<T>, StoreError>;

    async fn find_one(&self, predicate: Predicate<'_, T>) -> Result<Option<T>, StoreError> {
        Ok(self.find(predicate).await?.into_iter().next())
    }

    /// Applies `apply` to the stored document and returns the new version.
    async fn update(
        &self,
        id: &str,
        apply: Box<dyn for<'a> FnOnce(&'a mut T) + Send>,
    ) -> Result<Option<T>, StoreError>;

    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Successful mutations so far.
    fn writes(&self) -> u64;
}

pub struct InMemoryStore<T> {
    documents: RwLock<Vec<T>>,
    writes: AtomicU64,
}

impl<T> InMemoryStore<T> {
    pub fn new() -> Self {
        InMemoryStore {
            documents: RwLock::new(Vec::new()),
            writes: AtomicU64::new(0),
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Document> DocumentStore<T> for InMemoryStore<T> {
    async fn create(&self, document: T) -> Result<T, StoreError> {
        let mut documents = self.documents.write().await;
        if documents.iter().any(|d| d.id() == document.id()) {
            return Err(StoreError::Duplicate(document.id().to_string()));
        }
        documents.push(document.clone());
        self.record_write();
        Ok(document)
    }

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents.iter().find(|d| d.id() == id).cloned())
    }

    async fn find(&self, predicate: Predicate<'_, T>) -> Result<Vec<T>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents.iter().filter(|d| predicate(d)).cloned().collect())
    }

    async fn update(
        &self,
        id: &str,
        apply: Box<dyn for<'a> FnOnce(&'a mut T) + Send>,
    ) -> Result<Option<T>, StoreError> {
        let mut documents = self.documents.write().await;
        let Some(document) = documents.iter_mut().find(|d| d.id() == id) else {
            return Ok(None);
        };
        apply(document);
        self.record_write();
        Ok(Some(document.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|d| d.id() != id);
        let removed = documents.len() != before;
        if removed {
            self.record_write();
        }
        Ok(removed)
    }

    fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Note {
        id: String,
        body: String,
    }

    impl Document for Note {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn note(body: &str) -> Note {
        Note {
            id: new_id(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_crud_and_write_counter() {
        let store = InMemoryStore::new();
        let first = store.create(note("a")).await.unwrap();
        store.create(note("b")).await.unwrap();
        assert_eq!(store.writes(), 2);

        assert_eq!(store.get(&first.id).await.unwrap(), Some(first.clone()));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let bodies: Vec<String> = store
            .find(&|_| true)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.body)
            .collect();
        assert_eq!(bodies, vec!["a", "b"]);
        // Reads never count.
        assert_eq!(store.writes(), 2);

        let updated = store
            .update(&first.id, Box::new(|n: &mut Note| n.body = "c".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.body, "c");
        assert_eq!(store.update("missing", Box::new(|_: &mut Note| {})).await.unwrap(), None);

        assert!(store.delete(&first.id).await.unwrap());
        assert!(!store.delete(&first.id).await.unwrap());
        assert_eq!(store.writes(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let store = InMemoryStore::new();
        let first = store.create(note("a")).await.unwrap();
        assert_eq!(
            store.create(first.clone()).await,
            Err(StoreError::Duplicate(first.id.clone()))
        );
        assert_eq!(store.writes(), 1);
    }
}
