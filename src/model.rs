//! Core data model shared across the policy engine, store, and orchestrator.
//!
//! Grounded on the `AuditEntry`/`ValidationResult` shapes in
//! `security/policy.rs` of the grounding repo, generalized from a single
//! in-process audit vector to the full request/result/record lifecycle the
//! gateway needs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies the agent a request belongs to. v1 is single-agent, but the
/// field is still typed and defaulted rather than a bare string literal
/// sprinkled through call sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl Default for AgentId {
    fn default() -> Self {
        AgentId("default".to_string())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of the permission engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Ask => "ask",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from the agent to invoke a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Correlation id, chosen by the agent.
    pub request_id: String,
    pub tool: String,
    /// Ordered by key so the fallback signature builder's lexicographic
    /// sort (§4.C) and the validator's deterministic scan come for free.
    pub args: BTreeMap<String, Value>,
    /// Filled in by the permission engine; absent until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Executed,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Append-only audit record. `resolution`/`resolved_by`/`resolved_at`/
/// `execution_result` are populated at resolution time; for the immediate
/// allow/deny paths that's the same instant the entry is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub args: Value,
    pub signature: String,
    pub decision: Decision,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub execution_result: Option<Value>,
    pub agent_id: AgentId,
}

impl AuditEntry {
    /// Construct the entry for a synchronously resolved (allow/deny)
    /// request: `resolution`/`resolved_at` are filled in immediately.
    pub fn new(
        request: &ToolRequest,
        signature: &str,
        decision: Decision,
        resolution: &str,
        resolved_by: &str,
        execution_result: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: request.request_id.clone(),
            timestamp: now,
            tool_name: request.tool.clone(),
            args: args_to_json(&request.args),
            signature: signature.to_string(),
            decision,
            resolution: Some(resolution.to_string()),
            resolved_by: Some(resolved_by.to_string()),
            resolved_at: Some(now),
            execution_result,
            agent_id: AgentId::default(),
        }
    }
}

pub fn args_to_json(args: &BTreeMap<String, Value>) -> Value {
    Value::Object(args.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}
