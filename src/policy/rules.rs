//! Policy document types: [`PermissionRule`] and [`Permissions`].
//!
//! Grounded on the declarative-config shapes in `config/schema.rs` of the
//! grounding repo (`#[serde(default)]` structs that deserialize cleanly
//! from a partially-filled document).

use serde::{Deserialize, Serialize};

use crate::model::Decision;

/// One glob-matched rule. `pattern` uses shell-wildcard semantics (`*`,
/// `?`, `[set]`) matched against a tool signature (see
/// `policy::signature`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub action: Decision,
    #[serde(default)]
    pub description: String,
}

/// The policy document: an ordered list of `defaults` (first-match wins)
/// and an ordered list of `rules` (scanned once per action, deny first).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub defaults: Vec<PermissionRule>,
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
}
