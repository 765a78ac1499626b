//! Labeler Configuration
//!
//! The only runtime knob is the role-indicator label key, taken from the
//! `ROLE_LABEL` environment variable. Retry and timeout settings are code
//! defaults that library callers may override.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tasks::node::labels::{validate_label_key, DEFAULT_ROLE_LABEL, ROLE_LABEL_ENV};
use crate::tasks::types::{Error, Result};
use crate::tasks::update::{duration_millis, RetryPolicy};

/// Main labeler configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelerConfig {
    /// Label whose value names the node's intended role
    pub role_label: String,

    /// Whether `role_label` came from the environment rather than the default
    #[serde(default)]
    pub role_label_explicit: bool,

    /// Conflict retry policy for node updates
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Deadline for a single reconciliation pass
    #[serde(default = "default_reconcile_timeout", with = "duration_millis")]
    pub reconcile_timeout: Duration,

    /// Requeue delay after a failed reconciliation
    #[serde(default = "default_error_requeue", with = "duration_millis")]
    pub error_requeue: Duration,
}

fn default_reconcile_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_error_requeue() -> Duration {
    Duration::from_secs(15)
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            role_label: DEFAULT_ROLE_LABEL.to_string(),
            role_label_explicit: false,
            retry: RetryPolicy::default(),
            reconcile_timeout: default_reconcile_timeout(),
            error_requeue: default_error_requeue(),
        }
    }
}

impl LabelerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(label) = lookup(ROLE_LABEL_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            config.role_label = label;
            config.role_label_explicit = true;
        }

        config.validate()?;

        if config.role_label_explicit {
            info!(label = %config.role_label, "using explicitly set role label");
        } else {
            info!(label = %config.role_label, "using default role label");
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_role_label(mut self, label: impl Into<String>) -> Self {
        self.role_label = label.into();
        self.role_label_explicit = true;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        validate_label_key(&self.role_label).map_err(|e| {
            Error::ConfigError(format!("invalid {ROLE_LABEL_ENV} {:?}: {e}", self.role_label))
        })?;

        self.retry.validate().map_err(Error::ConfigError)?;

        if self.reconcile_timeout.is_zero() {
            return Err(Error::ConfigError(
                "reconcile timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
