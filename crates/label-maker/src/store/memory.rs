//! In-memory [`ObjectStore`] with API-server style resource versions.
//!
//! Every successful write bumps a store-wide version counter, and `replace`
//! rejects objects whose `metadata.resourceVersion` does not match the stored
//! one. Faults can be queued to exercise conflict and failure paths
//! deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use super::{ObjectStore, StoreError};

type ForeignWrite<K> = Box<dyn FnOnce(&mut K) + Send>;

/// Fault applied to the next `replace` call
enum WriteFault<K> {
    /// Another writer bumps the stored version first
    Conflict,
    /// Another writer applies this change first
    Foreign(ForeignWrite<K>),
    /// The object is deleted first
    Delete,
    /// The backend fails outright
    Backend(String),
}

struct State<K> {
    objects: BTreeMap<String, K>,
    version: u64,
    write_faults: VecDeque<WriteFault<K>>,
    get_faults: VecDeque<String>,
    stall_gets: bool,
    gets: usize,
    writes: usize,
}

/// In-memory versioned store
pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                write_faults: VecDeque::new(),
                get_faults: VecDeque::new(),
                stall_gets: false,
                gets: 0,
                writes: 0,
            }),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kind() -> String {
        K::kind(&K::DynamicType::default()).into_owned()
    }

    /// Insert or overwrite an object unconditionally, assigning a fresh version
    pub fn insert(&self, mut object: K) {
        let mut state = self.lock();
        state.version += 1;
        object.meta_mut().resource_version = Some(state.version.to_string());
        state.objects.insert(object.name_any(), object);
    }

    /// Remove an object, as if it had been deleted from the cluster
    pub fn remove(&self, name: &str) -> Option<K> {
        self.lock().objects.remove(name)
    }

    /// Current stored copy of an object
    #[must_use]
    pub fn object(&self, name: &str) -> Option<K> {
        self.lock().objects.get(name).cloned()
    }

    /// Make the next `count` writes lose a race against another writer
    pub fn conflict_next_writes(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.write_faults.push_back(WriteFault::Conflict);
        }
    }

    /// Apply `change` as a competing write right before the next `replace`
    pub fn foreign_write_before_next_write<F>(&self, change: F)
    where
        F: FnOnce(&mut K) + Send + 'static,
    {
        self.lock()
            .write_faults
            .push_back(WriteFault::Foreign(Box::new(change)));
    }

    /// Delete the object right before the next `replace`
    pub fn delete_before_next_write(&self) {
        self.lock().write_faults.push_back(WriteFault::Delete);
    }

    /// Fail the next write with a backend error
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.lock()
            .write_faults
            .push_back(WriteFault::Backend(message.into()));
    }

    /// Fail the next read with a backend error
    pub fn fail_next_get(&self, message: impl Into<String>) {
        self.lock().get_faults.push_back(message.into());
    }

    /// Make every subsequent read hang until the caller gives up
    pub fn stall_gets(&self) {
        self.lock().stall_gets = true;
    }

    /// Number of `get` calls served so far
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.lock().gets
    }

    /// Number of successful `replace` calls so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn bump(state: &mut State<K>, name: &str, change: Option<ForeignWrite<K>>) {
        state.version += 1;
        let version = state.version.to_string();
        if let Some(stored) = state.objects.get_mut(name) {
            if let Some(change) = change {
                change(stored);
            }
            stored.meta_mut().resource_version = Some(version);
        }
    }

    fn try_replace(&self, name: &str, object: &K) -> Result<K, StoreError> {
        let mut state = self.lock();

        match state.write_faults.pop_front() {
            Some(WriteFault::Backend(message)) => return Err(StoreError::Backend(message)),
            Some(WriteFault::Conflict) => Self::bump(&mut state, name, None),
            Some(WriteFault::Foreign(change)) => Self::bump(&mut state, name, Some(change)),
            Some(WriteFault::Delete) => {
                state.objects.remove(name);
            }
            None => {}
        }

        let Some(stored) = state.objects.get(name) else {
            return Err(StoreError::NotFound {
                kind: Self::kind(),
                name: name.to_string(),
            });
        };

        if stored.meta().resource_version != object.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: Self::kind(),
                name: name.to_string(),
            });
        }

        state.version += 1;
        let mut updated = object.clone();
        updated.meta_mut().resource_version = Some(state.version.to_string());
        state.objects.insert(name.to_string(), updated.clone());
        state.writes += 1;
        Ok(updated)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        let stalled = {
            let mut state = self.lock();
            state.gets += 1;
            if let Some(message) = state.get_faults.pop_front() {
                return Err(StoreError::Backend(message));
            }
            state.stall_gets
        };

        if stalled {
            futures::future::pending::<()>().await;
        }

        self.object(name).ok_or_else(|| StoreError::NotFound {
            kind: Self::kind(),
            name: name.to_string(),
        })
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, StoreError> {
        // Let other tasks run between a read and the write that follows it
        tokio::task::yield_now().await;
        self.try_replace(name, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_version() {
        let store = MemoryStore::new();
        store.insert(node("a"));
        let fetched: Node = store.get("a").await.unwrap();
        assert_eq!(fetched.metadata.resource_version.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store: MemoryStore<Node> = MemoryStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Node missing not found");

        store.insert(node("a"));
        assert!(store.remove("a").is_some());
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let store = MemoryStore::new();
        store.insert(node("a"));

        let first: Node = store.get("a").await.unwrap();
        let second: Node = store.get("a").await.unwrap();

        let written = store.replace("a", &first).await.unwrap();
        assert_eq!(written.metadata.resource_version.as_deref(), Some("2"));

        let err = store.replace("a", &second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_conflict_advances_version() {
        let store = MemoryStore::new();
        store.insert(node("a"));
        store.conflict_next_writes(1);

        let fetched: Node = store.get("a").await.unwrap();
        assert!(store.replace("a", &fetched).await.unwrap_err().is_conflict());

        let refreshed: Node = store.get("a").await.unwrap();
        assert_ne!(
            refreshed.metadata.resource_version,
            fetched.metadata.resource_version
        );
        assert!(store.replace("a", &refreshed).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_write_is_applied() {
        let store = MemoryStore::new();
        store.insert(node("a"));
        store.foreign_write_before_next_write(|n: &mut Node| {
            n.labels_mut().insert("other".to_string(), "x".to_string());
        });

        let fetched: Node = store.get("a").await.unwrap();
        assert!(store.replace("a", &fetched).await.unwrap_err().is_conflict());

        let stored = store.object("a").unwrap();
        assert_eq!(stored.labels().get("other").map(String::as_str), Some("x"));
    }

    #[tokio::test]
    async fn test_backend_faults() {
        let store = MemoryStore::new();
        store.insert(node("a"));
        store.fail_next_get("etcd unavailable");
        store.fail_next_write("etcd unavailable");

        assert!(matches!(
            store.get("a").await,
            Err(StoreError::Backend(ref m)) if m == "etcd unavailable"
        ));
        let fetched: Node = store.get("a").await.unwrap();
        assert!(matches!(
            store.replace("a", &fetched).await,
            Err(StoreError::Backend(_))
        ));
        assert_eq!(store.get_count(), 2);
        assert_eq!(store.write_count(), 0);
    }
}
