//! Node role label keys and helpers.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Role-indicator label read when `ROLE_LABEL` is not set
pub const DEFAULT_ROLE_LABEL: &str = "node.kubernetes.io/role";

/// Environment variable selecting the role-indicator label
pub const ROLE_LABEL_ENV: &str = "ROLE_LABEL";

/// Namespace of the labels `kubectl` shows in the ROLES column
pub const NODE_ROLE_PREFIX: &str = "node-role.kubernetes.io/";

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

lazy_static! {
    static ref NAME_RE: Regex =
        Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("valid regex");
    static ref DNS_LABEL_RE: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex");
}

/// Why a string is not a valid label key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidLabelKey {
    #[error("label key is empty")]
    Empty,

    #[error("label key {0:?} has more than one '/'")]
    TooManySlashes(String),

    #[error("prefix of label key {key:?} is not a DNS subdomain of at most 253 characters")]
    BadPrefix { key: String },

    #[error("name part of label key {key:?} is empty")]
    EmptyName { key: String },

    #[error("name part of label key {key:?} exceeds 63 characters")]
    NameTooLong { key: String },

    #[error("name part of label key {key:?} must be alphanumeric, '-', '_' or '.', starting and ending with an alphanumeric character")]
    BadName { key: String },
}

/// Designation label key for `role`
#[must_use]
pub fn designation_key(role: &str) -> String {
    format!("{NODE_ROLE_PREFIX}{role}")
}

/// First label key already in the `node-role.kubernetes.io/` namespace, if any
#[must_use]
pub fn existing_designation(labels: &BTreeMap<String, String>) -> Option<&str> {
    labels
        .keys()
        .find(|key| key.starts_with(NODE_ROLE_PREFIX))
        .map(String::as_str)
}

/// Check `key` against the Kubernetes qualified-name rules for label keys:
/// an optional DNS-subdomain prefix and `/`, then a name of at most 63
/// characters.
pub fn validate_label_key(key: &str) -> Result<(), InvalidLabelKey> {
    if key.is_empty() {
        return Err(InvalidLabelKey::Empty);
    }

    let mut parts = key.splitn(3, '/');
    let (prefix, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => (None, name),
        (Some(prefix), Some(name), None) => (Some(prefix), name),
        _ => return Err(InvalidLabelKey::TooManySlashes(key.to_string())),
    };

    if let Some(prefix) = prefix {
        let valid = !prefix.is_empty()
            && prefix.len() <= MAX_PREFIX_LEN
            && prefix.split('.').all(|label| DNS_LABEL_RE.is_match(label));
        if !valid {
            return Err(InvalidLabelKey::BadPrefix {
                key: key.to_string(),
            });
        }
    }

    if name.is_empty() {
        return Err(InvalidLabelKey::EmptyName {
            key: key.to_string(),
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(InvalidLabelKey::NameTooLong {
            key: key.to_string(),
        });
    }
    if !NAME_RE.is_match(name) {
        return Err(InvalidLabelKey::BadName {
            key: key.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_designation_key() {
        assert_eq!(designation_key("master"), "node-role.kubernetes.io/master");
        assert_eq!(designation_key("worker"), "node-role.kubernetes.io/worker");
    }

    #[test]
    fn test_existing_designation_matches_any_role() {
        let set = labels(&[
            ("kubernetes.io/hostname", "n1"),
            ("node-role.kubernetes.io/master", ""),
        ]);
        assert_eq!(
            existing_designation(&set),
            Some("node-role.kubernetes.io/master")
        );
    }

    #[test]
    fn test_existing_designation_requires_exact_prefix() {
        let set = labels(&[
            ("node-role.kubernetes.io", "worker"),
            ("x.node-role.kubernetes.io/worker", ""),
            ("node.kubernetes.io/role", "worker"),
        ]);
        assert_eq!(existing_designation(&set), None);
    }

    #[test]
    fn test_valid_label_keys() {
        for key in [
            "node-role.kubernetes.io/master",
            "node-role.kubernetes.io/control-plane",
            "node-role.kubernetes.io/gpu_worker.v2",
            "role",
            "example.com/A1",
        ] {
            assert_eq!(validate_label_key(key), Ok(()), "{key}");
        }
    }

    #[test]
    fn test_invalid_label_keys() {
        assert_eq!(validate_label_key(""), Err(InvalidLabelKey::Empty));
        assert!(matches!(
            validate_label_key("node-role.kubernetes.io/"),
            Err(InvalidLabelKey::EmptyName { .. })
        ));
        assert!(matches!(
            validate_label_key("node-role.kubernetes.io/a/b"),
            Err(InvalidLabelKey::TooManySlashes(_))
        ));
        assert!(matches!(
            validate_label_key("node-role.kubernetes.io/-worker"),
            Err(InvalidLabelKey::BadName { .. })
        ));
        assert!(matches!(
            validate_label_key("node-role.kubernetes.io/has space"),
            Err(InvalidLabelKey::BadName { .. })
        ));
        assert!(matches!(
            validate_label_key("Bad_Prefix/worker"),
            Err(InvalidLabelKey::BadPrefix { .. })
        ));
        assert!(matches!(
            validate_label_key("/worker"),
            Err(InvalidLabelKey::BadPrefix { .. })
        ));
        let long = designation_key(&"a".repeat(64));
        assert!(matches!(
            validate_label_key(&long),
            Err(InvalidLabelKey::NameTooLong { .. })
        ));
    }
}
