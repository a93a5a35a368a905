//! RemoteStore trait abstraction for the hosted document service.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - `GistStore` (in bookmarks) - GitHub Gist over HTTPS
//!
//! Every write is conditioned on an opaque version token: an update whose
//! expected version is not the current one fails with `StoreError::Conflict`
//! and leaves the stored content untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Opaque version token assigned by the store on every write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a remote document at a given version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub id: String,
    pub version: Version,
}

/// Content of a remote document and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDocument {
    pub content: String,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: Version,
        actual: Version,
    },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Versioned remote document storage.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a new document, returning its id and first version.
    async fn create(&self, description: &str, content: &str) -> Result<RemoteInfo>;

    /// Read a document's content and current version.
    async fn read(&self, id: &str) -> Result<RemoteDocument>;

    /// Replace a document's content if its current version is `expected`.
    ///
    /// Returns the new version.
    async fn update(&self, id: &str, content: &str, expected: &Version) -> Result<Version>;

    /// Check whether a document exists.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Current version of a document.
    async fn current_version(&self, id: &str) -> Result<Version> {
        Ok(self.read(id).await?.version)
    }
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn create(&self, description: &str, content: &str) -> Result<RemoteInfo> {
        (**self).create(description, content).await
    }

    async fn read(&self, id: &str) -> Result<RemoteDocument> {
        (**self).read(id).await
    }

    async fn update(&self, id: &str, content: &str, expected: &Version) -> Result<Version> {
        (**self).update(id, content, expected).await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        (**self).exists(id).await
    }

    async fn current_version(&self, id: &str) -> Result<Version> {
        (**self).current_version(id).await
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    description: String,
    content: String,
    version: Version,
}

/// In-memory store for testing
#[derive(Default)]
pub struct InMemoryStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
    /// Requests left to fail with a network error
    failures: AtomicUsize,
    /// Requests served, failed ones included
    requests: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` requests fail with `StoreError::Network`.
    pub fn fail_next_requests(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of requests made so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Raw content of a document, bypassing request accounting.
    pub fn content(&self, id: &str) -> Option<String> {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|d| d.content.clone())
    }

    /// Description a document was created with.
    pub fn description(&self, id: &str) -> Option<String> {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|d| d.description.clone())
    }

    fn next_version() -> Version {
        Version(Uuid::new_v4().simple().to_string())
    }

    fn begin_request(&self) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Network("simulated network failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn create(&self, description: &str, content: &str) -> Result<RemoteInfo> {
        self.begin_request()?;
        let id = Uuid::new_v4().simple().to_string();
        let version = Self::next_version();
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.clone(),
                StoredDocument {
                    description: description.to_string(),
                    content: content.to_string(),
                    version: version.clone(),
                },
            );
        Ok(RemoteInfo { id, version })
    }

    async fn read(&self, id: &str) -> Result<RemoteDocument> {
        self.begin_request()?;
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        let doc = documents
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(RemoteDocument {
            content: doc.content.clone(),
            version: doc.version.clone(),
        })
    }

    async fn update(&self, id: &str, content: &str, expected: &Version) -> Result<Version> {
        self.begin_request()?;
        // Check and write under one lock so concurrent writers serialize
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if &doc.version != expected {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected.clone(),
                actual: doc.version.clone(),
            });
        }
        doc.content = content.to_string();
        doc.version = Self::next_version();
        Ok(doc.version.clone())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        self.begin_request()?;
        Ok(self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_read() {
        let store = InMemoryStore::new();
        let info = store.create("Bookmarks", "# Dev").await.unwrap();
        let doc = store.read(&info.id).await.unwrap();
        assert_eq!(doc.content, "# Dev");
        assert_eq!(doc.version, info.version);
        assert_eq!(store.description(&info.id).as_deref(), Some("Bookmarks"));
        assert!(store.exists(&info.id).await.unwrap());
        assert!(!store.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_requires_current_version() {
        let store = InMemoryStore::new();
        let info = store.create("Bookmarks", "v1").await.unwrap();

        let v2 = store.update(&info.id, "v2", &info.version).await.unwrap();
        assert_ne!(v2, info.version);
        assert_eq!(store.current_version(&info.id).await.unwrap(), v2);

        let err = store
            .update(&info.id, "stale", &info.version)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            err,
            StoreError::Conflict {
                id: info.id.clone(),
                expected: info.version.clone(),
                actual: v2,
            }
        );
        assert_eq!(store.content(&info.id).as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_missing_document() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.read("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update("nope", "x", &Version::new("v")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_failures_are_counted_down() {
        let store = InMemoryStore::new();
        let info = store.create("Bookmarks", "x").await.unwrap();
        store.fail_next_requests(2);
        assert!(matches!(
            store.read(&info.id).await,
            Err(StoreError::Network(_))
        ));
        assert!(matches!(
            store.exists(&info.id).await,
            Err(StoreError::Network(_))
        ));
        assert!(store.read(&info.id).await.is_ok());
        assert_eq!(store.request_count(), 4);
    }

    #[tokio::test]
    async fn test_shared_through_arc() {
        let store = Arc::new(InMemoryStore::new());
        let shared: Arc<dyn RemoteStore> = store.clone();
        let info = shared.create("Bookmarks", "x").await.unwrap();
        assert_eq!(store.content(&info.id).as_deref(), Some("x"));
    }

    #[test]
    fn test_version_serializes_as_plain_string() {
        let info = RemoteInfo {
            id: "abc".into(),
            version: Version::new("v1"),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"id":"abc","version":"v1"}"#);
    }
}
