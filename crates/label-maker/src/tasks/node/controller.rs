//! Node role reconciliation.
//!
//! A node is designated at most once: if any `node-role.kubernetes.io/` label
//! is already present, whatever its role, the node is left alone. Otherwise
//! `node-role.kubernetes.io/<role>=""` is added and nothing else changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::labels::{designation_key, existing_designation, validate_label_key};
use crate::tasks::types::{Context, Error, Result};
use crate::tasks::update::{until_cancelled, update_with_retry};

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The node no longer exists
    NodeGone,
    /// The role-indicator label is absent
    NoRoleLabel,
    /// A designation label is already present
    AlreadyDesignated { existing: String },
    /// The role value cannot form a valid label key
    InvalidRole { role: String, reason: String },
    /// The designation label was added
    Updated { key: String },
}

impl ReconcileOutcome {
    #[must_use]
    pub fn is_update(&self) -> bool {
        matches!(self, ReconcileOutcome::Updated { .. })
    }
}

/// What to do with a node's label set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(ReconcileOutcome),
    Assign { role: String, key: String },
}

/// Decide whether `labels` need a designation label
#[must_use]
pub fn decide(labels: &BTreeMap<String, String>, role_label: &str) -> Decision {
    let Some(role) = labels.get(role_label) else {
        return Decision::Skip(ReconcileOutcome::NoRoleLabel);
    };

    if let Some(existing) = existing_designation(labels) {
        return Decision::Skip(ReconcileOutcome::AlreadyDesignated {
            existing: existing.to_string(),
        });
    }

    let key = designation_key(role);
    if let Err(e) = validate_label_key(&key) {
        return Decision::Skip(ReconcileOutcome::InvalidRole {
            role: role.clone(),
            reason: e.to_string(),
        });
    }

    Decision::Assign {
        role: role.clone(),
        key,
    }
}

/// Reconcile the node called `name`: fetch it, decide, and add the
/// designation label if needed.
#[instrument(skip_all, fields(node.name = %name))]
pub async fn reconcile_node(ctx: &Context, name: &str) -> Result<ReconcileOutcome> {
    debug!("reconciling");

    let fetched = until_cancelled(&ctx.shutdown, ctx.store.get(name))
        .await
        .ok_or_else(|| Error::Cancelled {
            name: name.to_string(),
        })?;

    let node = match fetched {
        Ok(node) => node,
        Err(e) if e.is_not_found() => {
            info!("node resource not found, ignoring");
            return Ok(ReconcileOutcome::NodeGone);
        }
        Err(e) => {
            error!(error = %e, "failed to get node");
            return Err(Error::Store {
                name: name.to_string(),
                source: e,
            });
        }
    };

    let (role, key) = match decide(node.labels(), &ctx.config.role_label) {
        Decision::Assign { role, key } => (role, key),
        Decision::Skip(outcome) => {
            match &outcome {
                ReconcileOutcome::NoRoleLabel => debug!("no role label present"),
                ReconcileOutcome::AlreadyDesignated { existing } => {
                    debug!(existing = %existing, "node-role already set");
                }
                ReconcileOutcome::InvalidRole { role, reason } => {
                    warn!(role = %role, reason = %reason, "role value is not usable as a label key, skipping");
                }
                ReconcileOutcome::NodeGone | ReconcileOutcome::Updated { .. } => {}
            }
            return Ok(outcome);
        }
    };

    info!(role = %role, label = %key, "setting node-role");

    // A designation may have been written between our read and the updater's
    let mut raced: Option<String> = None;
    let result = update_with_retry(
        &*ctx.store,
        name,
        &ctx.config.retry,
        &ctx.shutdown,
        |node: &mut Node| {
            let labels = node.labels_mut();
            raced = existing_designation(labels).map(str::to_string);
            if raced.is_some() {
                return false;
            }
            labels.insert(key.clone(), String::new());
            true
        },
    )
    .await;

    match result {
        Ok(_) => match raced {
            Some(existing) => {
                debug!(existing = %existing, "node-role set concurrently, leaving it");
                Ok(ReconcileOutcome::AlreadyDesignated { existing })
            }
            None => Ok(ReconcileOutcome::Updated { key }),
        },
        Err(e) if e.is_not_found() => {
            info!("node deleted during update, ignoring");
            Ok(ReconcileOutcome::NodeGone)
        }
        Err(e) => {
            error!(error = %e, "failed to update labels");
            Err(e.into())
        }
    }
}

/// Controller entry point: reconcile the node behind a watch event under the
/// configured deadline.
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action> {
    let name = node.name_any();
    let timeout = ctx.config.reconcile_timeout;

    match tokio::time::timeout(timeout, reconcile_node(&ctx, &name)).await {
        Ok(outcome) => {
            outcome?;
            Ok(Action::await_change())
        }
        Err(_elapsed) => {
            warn!(node.name = %name, ?timeout, "reconciliation timed out");
            Err(Error::Timeout { name, timeout })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE_LABEL: &str = "node.kubernetes.io/role";

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_decide_without_role_label() {
        let set = labels(&[("kubernetes.io/hostname", "n1")]);
        assert_eq!(
            decide(&set, ROLE_LABEL),
            Decision::Skip(ReconcileOutcome::NoRoleLabel)
        );
    }

    #[test]
    fn test_decide_assigns_role() {
        let set = labels(&[(ROLE_LABEL, "master")]);
        assert_eq!(
            decide(&set, ROLE_LABEL),
            Decision::Assign {
                role: "master".to_string(),
                key: "node-role.kubernetes.io/master".to_string(),
            }
        );
    }

    #[test]
    fn test_decide_never_overrides_existing_designation() {
        let set = labels(&[
            (ROLE_LABEL, "worker"),
            ("node-role.kubernetes.io/master", ""),
        ]);
        assert_eq!(
            decide(&set, ROLE_LABEL),
            Decision::Skip(ReconcileOutcome::AlreadyDesignated {
                existing: "node-role.kubernetes.io/master".to_string()
            })
        );
    }

    #[test]
    fn test_decide_matching_designation_is_also_left_alone() {
        let set = labels(&[
            (ROLE_LABEL, "worker"),
            ("node-role.kubernetes.io/worker", "true"),
        ]);
        assert!(matches!(
            decide(&set, ROLE_LABEL),
            Decision::Skip(ReconcileOutcome::AlreadyDesignated { .. })
        ));
    }

    #[test]
    fn test_decide_rejects_unusable_role_values() {
        for role in ["", "gpu/worker", "-edge", "has space"] {
            let set = labels(&[(ROLE_LABEL, role)]);
            assert!(
                matches!(
                    decide(&set, ROLE_LABEL),
                    Decision::Skip(ReconcileOutcome::InvalidRole { .. })
                ),
                "{role:?}"
            );
        }
    }

    #[test]
    fn test_decide_uses_configured_role_label() {
        let set = labels(&[(ROLE_LABEL, "master"), ("example.com/kind", "edge")]);
        assert_eq!(
            decide(&set, "example.com/kind"),
            Decision::Assign {
                role: "edge".to_string(),
                key: "node-role.kubernetes.io/edge".to_string(),
            }
        );
    }

    #[test]
    fn test_outcome_is_update() {
        assert!(ReconcileOutcome::Updated {
            key: "node-role.kubernetes.io/a".to_string()
        }
        .is_update());
        assert!(!ReconcileOutcome::NoRoleLabel.is_update());
        assert!(!ReconcileOutcome::NodeGone.is_update());
    }
}
