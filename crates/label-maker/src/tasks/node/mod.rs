//! # Node Role Designation
//!
//! Copies the value of the role-indicator label onto a
//! `node-role.kubernetes.io/<role>` label so that tooling which only reads
//! that namespace can see the node's role.
//!
//! - **`labels`**: well-known keys, prefix scan, label-key validation
//! - **`controller`**: decision procedure and the reconcile entry point

pub mod controller;
pub mod labels;

pub use controller::{decide, reconcile, reconcile_node, Decision, ReconcileOutcome};
pub use labels::{designation_key, existing_designation, DEFAULT_ROLE_LABEL, NODE_ROLE_PREFIX};
