//! JSON-RPC 2.0 envelope (§6.1). Grounded on the shape of the teacher's
//! `gateway::ws::WsCommand` — a tagged, serde-derived wire type decoded
//! off the same `axum::ws::Message::Text` frames — but replacing the
//! teacher's bespoke `{type, ...}` tagging with a standards-compliant
//! JSON-RPC request/response pair so any JSON-RPC client library can
//! speak to this gateway without a bespoke codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent for notifications; this gateway does not accept
    /// notifications, so `session.rs` treats a missing `id` as a
    /// protocol error rather than silently dropping the request.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION, result: Some(result), error: None, id }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION, result: None, error: Some(RpcError { code, message: message.into() }), id }
    }
}

/// Validate that a decoded request actually claims JSON-RPC 2.0 and
/// carries a non-null `id` — both checked here so every call site in
/// `session.rs` gets the same protocol-error behavior for free.
pub fn validate_envelope(request: &RpcRequest) -> Result<Value, String> {
    match request.jsonrpc.as_deref() {
        Some("2.0") => {}
        Some(other) => return Err(format!("unsupported jsonrpc version: {other}")),
        None => return Err("missing jsonrpc field".to_string()),
    }
    match &request.id {
        Some(id) if !id.is_null() => Ok(id.clone()),
        _ => Err("missing request id".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_well_formed_request() {
        let raw = r#"{"jsonrpc":"2.0","method":"tool_request","params":{"tool":"ha_get_state"},"id":1}"#;
        let request: RpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.method, "tool_request");
        assert_eq!(validate_envelope(&request).unwrap(), json!(1));
    }

    #[test]
    fn rejects_missing_jsonrpc_field() {
        let raw = r#"{"method":"tool_request","params":{},"id":1}"#;
        let request: RpcRequest = serde_json::from_str(raw).unwrap();
        assert!(validate_envelope(&request).is_err());
    }

    #[test]
    fn rejects_missing_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"tool_request","params":{}}"#;
        let request: RpcRequest = serde_json::from_str(raw).unwrap();
        assert!(validate_envelope(&request).is_err());
    }

    #[test]
    fn ok_response_omits_error_field() {
        let response = RpcResponse::ok(json!(1), json!({"status": "executed"}));
        let text = serde_json::to_string(&response).unwrap();
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn err_response_omits_result_field() {
        let response = RpcResponse::err(json!(1), -32003, "policy denied");
        let text = serde_json::to_string(&response).unwrap();
        assert!(!text.contains("\"result\""));
    }
}
