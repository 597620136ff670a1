//! Durable identity mapping between logical order entities and tracker
//! issues.
//!
//! The identity map is the dedup authority: at most one issue key per
//! (project, order id, instance) tuple, registration is first-write-wins
//! and a differing second write is an integrity violation, never a
//! silent overwrite.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Logical identity of one tracker entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct IdentityKey {
    /// Logical project key.
    pub project: String,
    /// Order id from the source batch.
    pub order_id: String,
    /// Instance index for stories; `None` for the epic.
    pub instance: Option<u32>,
}

impl IdentityKey {
    /// Key for an order's epic.
    #[must_use]
    pub fn epic(project: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            order_id: order_id.into(),
            instance: None,
        }
    }

    /// Key for one story instance under an order.
    #[must_use]
    pub fn story(
        project: impl Into<String>,
        order_id: impl Into<String>,
        instance: u32,
    ) -> Self {
        Self {
            project: project.into(),
            order_id: order_id.into(),
            instance: Some(instance),
        }
    }

    /// Whether this key names an epic.
    #[must_use]
    pub fn is_epic(&self) -> bool {
        self.instance.is_none()
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instance {
            Some(instance) => write!(f, "{}/{}#{}", self.project, self.order_id, instance),
            None => write!(f, "{}/{}", self.project, self.order_id),
        }
    }
}

/// Contract for the identity map backing store.
///
/// Any durable keyed store with read-your-writes consistency qualifies.
/// Registration of an identical (key, issue key) pair is a no-op;
/// registration of a differing issue key for an existing key must fail
/// with [`SyncError::IdentityConflict`].
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up the epic issue key for an order.
    async fn resolve_epic(&self, project: &str, order_id: &str) -> SyncResult<Option<String>>;

    /// Register the epic issue key for an order.
    async fn register_epic(
        &self,
        project: &str,
        order_id: &str,
        issue_key: &str,
    ) -> SyncResult<()>;

    /// Look up the story issue key for an order instance.
    async fn resolve_story(
        &self,
        project: &str,
        order_id: &str,
        instance: u32,
    ) -> SyncResult<Option<String>>;

    /// Register the story issue key for an order instance.
    async fn register_story(
        &self,
        project: &str,
        order_id: &str,
        instance: u32,
        issue_key: &str,
    ) -> SyncResult<()>;

    /// Last applied payload fingerprint for an identity, if recorded.
    async fn last_fingerprint(&self, key: &IdentityKey) -> SyncResult<Option<String>>;

    /// Record the payload fingerprint applied to an identity.
    async fn record_fingerprint(&self, key: &IdentityKey, fingerprint: &str) -> SyncResult<()>;
}

#[derive(Debug, Default, Clone)]
struct Entry {
    issue_key: Option<String>,
    fingerprint: Option<String>,
}

/// In-memory identity store.
///
/// Used in tests and single-process runs; the production deployment
/// plugs a durable keyed store into the same trait.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    entries: RwLock<HashMap<IdentityKey, Entry>>,
}

impl MemoryIdentityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve(&self, key: &IdentityKey) -> Option<String> {
        self.entries
            .read()
            .await
            .get(key)
            .and_then(|e| e.issue_key.clone())
    }

    async fn register(&self, key: IdentityKey, issue_key: &str) -> SyncResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        match &entry.issue_key {
            Some(existing) if existing == issue_key => Ok(()),
            Some(existing) => Err(SyncError::IdentityConflict {
                key: key.to_string(),
                existing: existing.clone(),
                attempted: issue_key.to_string(),
            }),
            None => {
                debug!(key = %key, issue_key, "registered identity");
                entry.issue_key = Some(issue_key.to_string());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn resolve_epic(&self, project: &str, order_id: &str) -> SyncResult<Option<String>> {
        Ok(self.resolve(&IdentityKey::epic(project, order_id)).await)
    }

    async fn register_epic(
        &self,
        project: &str,
        order_id: &str,
        issue_key: &str,
    ) -> SyncResult<()> {
        self.register(IdentityKey::epic(project, order_id), issue_key)
            .await
    }

    async fn resolve_story(
        &self,
        project: &str,
        order_id: &str,
        instance: u32,
    ) -> SyncResult<Option<String>> {
        Ok(self
            .resolve(&IdentityKey::story(project, order_id, instance))
            .await)
    }

    async fn register_story(
        &self,
        project: &str,
        order_id: &str,
        instance: u32,
        issue_key: &str,
    ) -> SyncResult<()> {
        self.register(IdentityKey::story(project, order_id, instance), issue_key)
            .await
    }

    async fn last_fingerprint(&self, key: &IdentityKey) -> SyncResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .and_then(|e| e.fingerprint.clone()))
    }

    async fn record_fingerprint(&self, key: &IdentityKey, fingerprint: &str) -> SyncResult<()> {
        let mut entries = self.entries.write().await;
        entries.entry(key.clone()).or_default().fingerprint = Some(fingerprint.to_string());
        Ok(())
    }
}

/// Per-identity-key mutual exclusion.
///
/// Work on the same key must hold its lock across
/// resolve → create → register so racing workers cannot create
/// duplicate issues for one logical entity. Distinct keys proceed
/// independently.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<IdentityKey, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a key, waiting if another worker holds it.
    pub async fn lock(&self, key: &IdentityKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// SHA-256 fingerprint of a wire payload, as lowercase hex.
///
/// Identical planned payloads produce identical fingerprints, which the
/// orchestrator uses to skip no-op updates.
#[must_use]
pub fn payload_fingerprint(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn register_then_resolve() {
        let store = MemoryIdentityStore::new();
        store.register_epic("NET", "WPO1", "101").await.unwrap();
        store.register_story("NET", "WPO1", 1, "102").await.unwrap();

        assert_eq!(
            store.resolve_epic("NET", "WPO1").await.unwrap(),
            Some("101".to_string())
        );
        assert_eq!(
            store.resolve_story("NET", "WPO1", 1).await.unwrap(),
            Some("102".to_string())
        );
        assert_eq!(store.resolve_story("NET", "WPO1", 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reregistering_same_key_is_noop() {
        let store = MemoryIdentityStore::new();
        store.register_epic("NET", "WPO1", "101").await.unwrap();
        store.register_epic("NET", "WPO1", "101").await.unwrap();
        assert_eq!(
            store.resolve_epic("NET", "WPO1").await.unwrap(),
            Some("101".to_string())
        );
    }

    #[tokio::test]
    async fn differing_registration_is_a_conflict() {
        let store = MemoryIdentityStore::new();
        store.register_epic("NET", "WPO1", "101").await.unwrap();
        let err = store.register_epic("NET", "WPO1", "999").await.unwrap_err();
        match err {
            SyncError::IdentityConflict {
                existing,
                attempted,
                ..
            } => {
                assert_eq!(existing, "101");
                assert_eq!(attempted, "999");
            }
            other => panic!("expected IdentityConflict, got {other:?}"),
        }
        // First write wins.
        assert_eq!(
            store.resolve_epic("NET", "WPO1").await.unwrap(),
            Some("101".to_string())
        );
    }

    #[tokio::test]
    async fn epic_and_story_keys_are_distinct() {
        let store = MemoryIdentityStore::new();
        store.register_epic("NET", "WPO1", "101").await.unwrap();
        store.register_story("NET", "WPO1", 0, "102").await.unwrap();
        assert_eq!(
            store.resolve_epic("NET", "WPO1").await.unwrap(),
            Some("101".to_string())
        );
    }

    #[tokio::test]
    async fn fingerprint_roundtrip() {
        let store = MemoryIdentityStore::new();
        let key = IdentityKey::epic("NET", "WPO1");
        assert_eq!(store.last_fingerprint(&key).await.unwrap(), None);
        store.record_fingerprint(&key, "abc123").await.unwrap();
        assert_eq!(
            store.last_fingerprint(&key).await.unwrap(),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn payload_fingerprint_is_stable() {
        let a = payload_fingerprint(&json!({"subject": "x", "dueDate": "2025-01-01"}));
        let b = payload_fingerprint(&json!({"subject": "x", "dueDate": "2025-01-01"}));
        let c = payload_fingerprint(&json!({"subject": "y"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let in_section = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let key = IdentityKey::epic("NET", "WPO1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
