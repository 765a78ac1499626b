use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;

use crate::store::{ObjectStore, StoreError};
use crate::tasks::config::LabelerConfig;
use crate::tasks::update::UpdateError;

/// Shared state handed to every reconcile call
#[derive(Clone)]
pub struct Context {
    /// Versioned access to Node objects
    pub store: Arc<dyn ObjectStore<Node>>,
    pub config: Arc<LabelerConfig>,
    /// Cancelled when the process is shutting down
    pub shutdown: CancellationToken,
}

impl Context {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore<Node>>, config: LabelerConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to get node {name}: {source}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("reconciliation of node {name} cancelled")]
    Cancelled { name: String },

    #[error("reconciliation of node {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Cancellation is shutdown, not a failure worth backing off on
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled { .. } | Error::Update(UpdateError::Cancelled { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
