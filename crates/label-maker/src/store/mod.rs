//! # Versioned Object Store
//!
//! The reconciler never talks to `kube::Api` directly. It reads and writes
//! through [`ObjectStore`], which exposes exactly the two calls an
//! optimistic-concurrency update needs: fetch the latest version, and
//! replace an object carrying the version it was read at.
//!
//! - [`KubeStore`] backs the trait with the Kubernetes API server.
//! - [`MemoryStore`] is an in-process store with the same conflict semantics
//!   and injectable faults, used by tests.

pub mod memory;

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Error as KubeError, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors reported by an [`ObjectStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("conflict writing {kind} {name}: object has been modified since it was read")]
    Conflict { kind: String, name: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] KubeError),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Read/replace access to versioned objects of type `K`.
///
/// `replace` must fail with [`StoreError::Conflict`] when the version carried
/// by `object` is older than the stored one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore<K: Send + Sync + 'static>: Send + Sync {
    /// Fetch the latest version of the named object
    async fn get(&self, name: &str) -> Result<K, StoreError>;

    /// Persist `object`, conditional on its resource version
    async fn replace(&self, name: &str, object: &K) -> Result<K, StoreError>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
///
/// `replace` is a PUT that carries `metadata.resourceVersion`, so the API
/// server answers 409 when another writer got there first.
pub struct KubeStore<K> {
    api: Api<K>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    #[must_use]
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            _kind: PhantomData,
        }
    }
}

impl<K: Clone> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self::new(self.api.clone())
    }
}

fn kind_of<K>() -> String
where
    K: Resource,
    K::DynamicType: Default,
{
    K::kind(&K::DynamicType::default()).into_owned()
}

fn classify<K>(name: &str, err: KubeError) -> StoreError
where
    K: Resource,
    K::DynamicType: Default,
{
    match err {
        KubeError::Api(ref response) if response.code == 404 => StoreError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        KubeError::Api(ref response) if response.code == 409 => StoreError::Conflict {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.api.get(name).await.map_err(|e| classify::<K>(name, e))
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, StoreError> {
        self.api
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| classify::<K>(name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> KubeError {
        KubeError::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} for test"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_store_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<KubeStore<Node>>();
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify::<Node>("worker-1", api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Node worker-1 not found");
    }

    #[test]
    fn test_classify_conflict() {
        let err = classify::<Node>("worker-1", api_error(409, "Conflict"));
        assert!(err.is_conflict());
        assert!(err.to_string().contains("Node worker-1"));
    }

    #[test]
    fn test_classify_other_api_error_is_passed_through() {
        let err = classify::<Node>("worker-1", api_error(403, "Forbidden"));
        assert!(matches!(err, StoreError::Kube(KubeError::Api(ref r)) if r.code == 403));
        assert!(!err.is_not_found());
        assert!(!err.is_conflict());
    }
}
