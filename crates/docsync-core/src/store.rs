//! Document persistence, keyed by document id.
//!
//! The client core never persists anything itself. The relay server loads
//! and saves through `DocumentStore`; `InMemoryStore` backs tests and
//! `FileStore` (docsync-daemon) writes JSON files.

use crate::delta::Delta;
use crate::document::DEFAULT_TITLE;
use crate::ids::DocId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub title: String,
    /// Insert-only delta.
    pub content: Delta,
}

impl Default for StoredDocument {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            content: Delta::new(),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document. `Ok(None)` if it was never saved.
    async fn load(&self, id: &DocId) -> Result<Option<StoredDocument>, StoreError>;

    async fn save(&self, id: &DocId, doc: &StoredDocument) -> Result<(), StoreError>;

    /// Ids of every saved document.
    async fn list(&self) -> Result<Vec<DocId>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<DocId, StoredDocument>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn load(&self, id: &DocId) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn save(&self, id: &DocId, doc: &StoredDocument) -> Result<(), StoreError> {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), doc.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DocId>, StoreError> {
        let mut ids: Vec<DocId> = self
            .docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        let id: DocId = "doc1".parse().unwrap();

        assert_eq!(store.load(&id).await.unwrap(), None);

        let doc = StoredDocument {
            title: "Report".into(),
            content: Delta::new().insert("Hello"),
        };
        store.save(&id, &doc).await.unwrap();

        assert_eq!(store.load(&id).await.unwrap(), Some(doc));
        assert_eq!(store.list().await.unwrap(), vec![id]);
    }

    #[test]
    fn test_stored_document_json() {
        let doc = StoredDocument::default();
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"title": "Untitled Document", "content": {"ops": []}})
        );
    }
}
