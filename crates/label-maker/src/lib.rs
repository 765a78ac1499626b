/*
 * label-maker - Kubernetes Node Role Labeler
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Node role labeler library
//!
//! Watches cluster Nodes and copies the value of a role-indicator label
//! (default `node.kubernetes.io/role`) into a `node-role.kubernetes.io/<role>`
//! label, which is what `kubectl` and most tooling use to display node roles.
//!
//! Writes go through [`tasks::update::update_with_retry`], an optimistic
//! concurrency loop keyed on the object's resource version.

pub mod store;
pub mod tasks;

// Re-export commonly used types
pub use store::{KubeStore, MemoryStore, ObjectStore, StoreError};
pub use tasks::config::LabelerConfig;
pub use tasks::node::{reconcile, reconcile_node, ReconcileOutcome};
pub use tasks::types::{Context, Error, Result};
pub use tasks::update::{update_with_retry, RetryPolicy, UpdateError};
