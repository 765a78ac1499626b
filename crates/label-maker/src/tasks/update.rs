//! # Conflict-Safe Updates
//!
//! Read-modify-write against an [`ObjectStore`], retried when the store
//! reports that the object changed underneath us:
//!
//! 1. fetch the latest version
//! 2. apply the caller's mutation to the fetched copy; if it reports no
//!    change, return the fetched copy without writing
//! 3. write it back, conditional on the version it was read at
//! 4. on a version conflict, back off and start over, up to
//!    [`RetryPolicy::max_attempts`]
//!
//! Any other store error aborts immediately. Every await races against a
//! [`CancellationToken`] so a shutting-down controller does not keep retrying.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::store::{ObjectStore, StoreError};

/// Largest accepted [`RetryPolicy::max_backoff`]
pub const MAX_BACKOFF_LIMIT: Duration = Duration::from_secs(300);

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total write attempts, including the first
    pub max_attempts: u32,

    /// Delay after the first conflict
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,

    /// Growth factor between consecutive delays
    pub factor: f64,

    /// Upper bound for a single delay, before jitter
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Extra random fraction (0.0..=1.0) added on top of each delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            factor: 2.0,
            max_backoff: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = (self.initial_backoff.as_secs_f64() * self.factor.powi(exponent))
            .min(self.max_backoff.as_secs_f64())
            .max(0.0);

        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };

        Duration::try_from_secs_f64(base * (1.0 + spread)).unwrap_or(self.max_backoff)
    }

    /// Check the policy is usable
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max_attempts must be at least 1".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!(
                "retry factor must be a finite value >= 1.0, got {}",
                self.factor
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!(
                "retry jitter must be within 0.0..=1.0, got {}",
                self.jitter
            ));
        }
        if self.max_backoff > MAX_BACKOFF_LIMIT {
            return Err(format!(
                "retry max_backoff ({:?}) exceeds {:?}",
                self.max_backoff, MAX_BACKOFF_LIMIT
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "retry initial_backoff ({:?}) exceeds max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            ));
        }
        Ok(())
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Errors from [`update_with_retry`]
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to update object {name}: still conflicting after {attempts} attempts")]
    RetriesExhausted { name: String, attempts: u32 },

    #[error("failed to update object {name}: {source}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to update object {name}: cancelled")]
    Cancelled { name: String },
}

impl UpdateError {
    /// True when the object disappeared while the update was in flight
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpdateError::Store { source, .. } if source.is_not_found())
    }
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

/// Apply `mutate` to the latest version of `name` and persist it, retrying on
/// version conflicts according to `policy`.
///
/// `mutate` returns whether it changed the object. When it did not, nothing
/// is written and the fetched object is returned as is. Otherwise returns the
/// object as written by the store.
#[instrument(skip_all, fields(object.name = %name))]
pub async fn update_with_retry<K, S, F>(
    store: &S,
    name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut mutate: F,
) -> Result<K, UpdateError>
where
    S: ObjectStore<K> + ?Sized,
    K: Send + Sync + 'static,
    F: FnMut(&mut K) -> bool + Send,
{
    let cancelled = || UpdateError::Cancelled {
        name: name.to_string(),
    };
    let store_error = |source: StoreError| UpdateError::Store {
        name: name.to_string(),
        source,
    };
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        // get latest version of object
        let mut object = until_cancelled(cancel, store.get(name))
            .await
            .ok_or_else(cancelled)?
            .map_err(store_error)?;

        if !mutate(&mut object) {
            debug!("mutation left object unchanged, skipping write");
            return Ok(object);
        }

        match until_cancelled(cancel, store.replace(name, &object))
            .await
            .ok_or_else(cancelled)?
        {
            Ok(written) => {
                if attempt > 1 {
                    info!(attempt, "update succeeded after conflict retries");
                } else {
                    debug!("update succeeded");
                }
                return Ok(written);
            }
            Err(StoreError::Conflict { .. }) if attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "version conflict, retrying"
                );
                until_cancelled(cancel, sleep(delay))
                    .await
                    .ok_or_else(cancelled)?;
            }
            Err(StoreError::Conflict { .. }) => break,
            Err(e) => return Err(store_error(e)),
        }
    }

    warn!(attempts = max_attempts, "giving up after repeated conflicts");
    Err(UpdateError::RetriesExhausted {
        name: name.to_string(),
        attempts: max_attempts,
    })
}
