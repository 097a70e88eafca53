//! Connection-level session state machine (§4.J): `Unauthed → Authed →
//! Closed`, a 10-second deadline on the first `auth` call, JSON-RPC
//! method dispatch (`auth`, `tool_request`, `get_pending_results`), and
//! the single-connection slot (§5, invariant 7): only one session may be
//! `Authed` at a time, enforced by a flag shared across every connection
//! to the same gateway.
//!
//! Grounded on the teacher's `gateway::ws::handle_client_command` — a
//! per-message dispatch function called from the `tokio::select!` loop
//! in `server.rs` — generalized from a tagged-enum command set to
//! JSON-RPC methods, and with an explicit auth gate the teacher's
//! middleware-based scheme doesn't need (a WebSocket upgrade happens
//! once per connection, but this gateway's `auth` is itself the first
//! message on that already-upgraded socket).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::model::ToolRequest;

use super::auth::tokens_match;
use super::orchestrator::Orchestrator;
use super::protocol::{RpcRequest, RpcResponse, validate_envelope};

pub const AUTH_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unauthed,
    Authed,
    Closed,
}

pub struct Session {
    state: Mutex<SessionState>,
    expected_token: String,
    created_at: Instant,
    /// Shared across every connection this gateway process accepts:
    /// `true` while some session holds the single-agent slot.
    connection_slot: Arc<AtomicBool>,
    /// Whether *this* session is the one holding `connection_slot`, so
    /// `Drop` releases it only when that's actually the case.
    holds_slot: AtomicBool,
}

impl Session {
    pub fn new(expected_token: String, connection_slot: Arc<AtomicBool>) -> Self {
        Self {
            state: Mutex::new(SessionState::Unauthed),
            expected_token,
            created_at: Instant::now(),
            connection_slot,
            holds_slot: AtomicBool::new(false),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock poisoned") = state;
    }

    /// Whether the auth deadline has elapsed while still `Unauthed`. The
    /// caller (`server.rs`) polls this from a watchdog tied to the
    /// connection's lifetime rather than this struct owning a timer.
    pub fn auth_expired(&self) -> bool {
        self.state() == SessionState::Unauthed && self.created_at.elapsed() >= AUTH_DEADLINE
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn close(&self) {
        self.set_state(SessionState::Closed);
    }

    /// Decode, validate, and dispatch one JSON-RPC request. Every error
    /// path returns an `RpcResponse` to send back rather than propagating
    /// `Err` — the only thing the caller needs to act on beyond sending
    /// the response is whether the session should now be torn down,
    /// which `is_closed()` reports after this call returns. `conn` is
    /// this connection's outbound channel, handed down to the
    /// orchestrator so a suspended `ask` can notice the connection dying.
    pub async fn handle_raw(&self, orchestrator: &Orchestrator, raw: &str, conn: &mpsc::UnboundedSender<String>) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => return RpcResponse::err(Value::Null, crate::error::rpc_code::PARSE_ERROR, format!("parse error: {e}")),
        };

        let id = match validate_envelope(&request) {
            Ok(id) => id,
            Err(msg) => return RpcResponse::err(Value::Null, crate::error::rpc_code::INVALID_REQUEST, msg),
        };

        if self.auth_expired() {
            self.close();
            return RpcResponse::err(id, crate::error::rpc_code::NOT_AUTHENTICATED, "authentication deadline elapsed");
        }

        self.dispatch(orchestrator, &request.method, request.params, id, conn).await
    }

    async fn dispatch(&self, orchestrator: &Orchestrator, method: &str, params: Value, id: Value, conn: &mpsc::UnboundedSender<String>) -> RpcResponse {
        match method {
            "auth" => self.handle_auth(params, id),
            "tool_request" if self.state() == SessionState::Authed => self.handle_tool_request(orchestrator, params, id, conn).await,
            "get_pending_results" if self.state() == SessionState::Authed => self.handle_get_pending_results(orchestrator, id),
            "tool_request" | "get_pending_results" => {
                RpcResponse::err(id, crate::error::rpc_code::NOT_AUTHENTICATED, "not authenticated")
            }
            other => RpcResponse::err(id, crate::error::rpc_code::METHOD_NOT_FOUND, format!("unknown method: {other}")),
        }
    }

    fn handle_auth(&self, params: Value, id: Value) -> RpcResponse {
        if self.state() != SessionState::Unauthed {
            return RpcResponse::err(id, crate::error::rpc_code::INVALID_REQUEST, "already authenticated");
        }
        let provided = params.get("token").and_then(Value::as_str).unwrap_or("");
        if !tokens_match(provided, &self.expected_token) {
            self.close();
            return RpcResponse::err(id, crate::error::rpc_code::NOT_AUTHENTICATED, "invalid token");
        }

        // Only one connection may be Authed at a time (v1 single-agent).
        // Acquire the shared slot before transitioning; a concurrent
        // connection that loses this race is rejected here, never
        // reaching Authed.
        if self.connection_slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            self.close();
            return RpcResponse::err(id, crate::error::rpc_code::NOT_AUTHENTICATED, "another agent connection is already authenticated");
        }
        self.holds_slot.store(true, Ordering::Release);

        self.set_state(SessionState::Authed);
        RpcResponse::ok(id, json!({ "authenticated": true }))
    }

    async fn handle_tool_request(&self, orchestrator: &Orchestrator, params: Value, id: Value, conn: &mpsc::UnboundedSender<String>) -> RpcResponse {
        let request: ToolRequest = match serde_json::from_value(params) {
            Ok(r) => r,
            Err(e) => return RpcResponse::err(id, crate::error::rpc_code::INVALID_REQUEST, format!("malformed tool_request: {e}")),
        };
        match orchestrator.handle_tool_request(request, conn.clone()).await {
            Ok(result) => RpcResponse::ok(id, serde_json::to_value(result).unwrap_or(Value::Null)),
            Err(e) => response_for_error(id, e),
        }
    }

    fn handle_get_pending_results(&self, orchestrator: &Orchestrator, id: Value) -> RpcResponse {
        match orchestrator.drain_offline_results() {
            Ok(results) => {
                let queued: Vec<Value> = results
                    .into_iter()
                    .map(|(request_id, result)| {
                        let mut entry = serde_json::Map::new();
                        entry.insert("request_id".to_string(), Value::String(request_id));
                        if let Value::Object(fields) = result {
                            entry.extend(fields);
                        }
                        Value::Object(entry)
                    })
                    .collect();
                RpcResponse::ok(id, json!({ "queued": queued }))
            }
            Err(e) => response_for_error(id, e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Release the single-connection slot on any form of teardown —
        // clean close, protocol error, or the socket just going away —
        // so the next connection attempt can acquire it.
        if self.holds_slot.load(Ordering::Acquire) {
            self.connection_slot.store(false, Ordering::Release);
        }
    }
}

fn response_for_error(id: Value, error: GatewayError) -> RpcResponse {
    let code = error.rpc_code().unwrap_or(crate::error::rpc_code::EXECUTION_FAILED);
    RpcResponse::err(id, code, error.rpc_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ServiceHandler};
    use crate::messenger::{CallbackFn, MessengerAdapter};
    use crate::policy::rules::{PermissionRule, Permissions};
    use crate::policy::PermissionEngine;
    use crate::ratelimit::RateLimiter;
    use crate::store::Store;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct NoopService;

    #[async_trait]
    impl ServiceHandler for NoopService {
        async fn execute(&self, _tool: &str, _args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
            Ok(json!({}))
        }
        async fn health_check(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    struct NoopMessenger;

    #[async_trait]
    impl MessengerAdapter for NoopMessenger {
        fn name(&self) -> &str {
            "noop"
        }
        async fn send_approval(&self, request_id: &str, _signature: &str) -> Result<String, GatewayError> {
            Ok(request_id.to_string())
        }
        async fn update_approval(&self, _message_id: &str, _outcome: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        fn set_callback(&self, _callback: CallbackFn) {}
        async fn start(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn health_check(&self) -> bool {
            true
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: crate::model::Decision::Allow, description: String::new() }], rules: vec![] };
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = Arc::new(PermissionEngine::compile(&policy).unwrap());
        let mut executor = Executor::new();
        executor.register("svc", &["do_thing"], Arc::new(NoopService));
        Orchestrator::new(store, engine, Arc::new(executor), Arc::new(NoopMessenger), Arc::new(RateLimiter::defaults()), Duration::from_secs(1))
    }

    fn new_session() -> Session {
        Session::new("secret".to_string(), Arc::new(AtomicBool::new(false)))
    }

    /// A sender whose receiver is intentionally leaked — these tests
    /// don't exercise disconnect detection.
    fn open_conn() -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        tx
    }

    #[tokio::test]
    async fn rejects_requests_before_auth() {
        let session = new_session();
        let orchestrator = orchestrator();
        let raw = r#"{"jsonrpc":"2.0","method":"tool_request","params":{"request_id":"r1","tool":"do_thing","args":{}},"id":1}"#;
        let response = session.handle_raw(&orchestrator, raw, &open_conn()).await;
        assert_eq!(response.error.unwrap().code, crate::error::rpc_code::NOT_AUTHENTICATED);
    }

    #[tokio::test]
    async fn correct_token_authenticates_then_allows_tool_request() {
        let session = new_session();
        let orchestrator = orchestrator();
        let conn = open_conn();

        let auth_raw = r#"{"jsonrpc":"2.0","method":"auth","params":{"token":"secret"},"id":1}"#;
        let auth_response = session.handle_raw(&orchestrator, auth_raw, &conn).await;
        assert!(auth_response.error.is_none());

        let raw = r#"{"jsonrpc":"2.0","method":"tool_request","params":{"request_id":"r1","tool":"do_thing","args":{}},"id":2}"#;
        let response = session.handle_raw(&orchestrator, raw, &conn).await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn wrong_token_closes_the_session() {
        let session = new_session();
        let orchestrator = orchestrator();
        let raw = r#"{"jsonrpc":"2.0","method":"auth","params":{"token":"nope"},"id":1}"#;
        let response = session.handle_raw(&orchestrator, raw, &open_conn()).await;
        assert_eq!(response.error.unwrap().code, crate::error::rpc_code::NOT_AUTHENTICATED);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let session = new_session();
        let orchestrator = orchestrator();
        session.set_state(SessionState::Authed);
        let raw = r#"{"jsonrpc":"2.0","method":"bogus","params":{},"id":1}"#;
        let response = session.handle_raw(&orchestrator, raw, &open_conn()).await;
        assert_eq!(response.error.unwrap().code, crate::error::rpc_code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let session = new_session();
        let orchestrator = orchestrator();
        let response = session.handle_raw(&orchestrator, "{not json", &open_conn()).await;
        assert_eq!(response.error.unwrap().code, crate::error::rpc_code::PARSE_ERROR);
    }

    #[tokio::test]
    async fn second_concurrent_connection_is_rejected_before_reaching_authed() {
        let slot = Arc::new(AtomicBool::new(false));
        let first = Session::new("secret".to_string(), slot.clone());
        let second = Session::new("secret".to_string(), slot.clone());
        let orchestrator = orchestrator();
        let auth_raw = r#"{"jsonrpc":"2.0","method":"auth","params":{"token":"secret"},"id":1}"#;

        let first_response = first.handle_raw(&orchestrator, auth_raw, &open_conn()).await;
        assert!(first_response.error.is_none());

        let second_response = second.handle_raw(&orchestrator, auth_raw, &open_conn()).await;
        assert_eq!(second_response.error.unwrap().code, crate::error::rpc_code::NOT_AUTHENTICATED);
        assert!(second.is_closed());

        // Releasing the first session's slot (simulating disconnect) lets
        // a fresh connection acquire it.
        drop(first);
        let third = Session::new("secret".to_string(), slot);
        let third_response = third.handle_raw(&orchestrator, auth_raw, &open_conn()).await;
        assert!(third_response.error.is_none());
    }

    #[tokio::test]
    async fn policy_denial_surfaces_as_a_jsonrpc_error() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: crate::model::Decision::Deny, description: String::new() }], rules: vec![] };
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = Arc::new(PermissionEngine::compile(&policy).unwrap());
        let mut executor = Executor::new();
        executor.register("svc", &["do_thing"], Arc::new(NoopService));
        let orchestrator = Orchestrator::new(store, engine, Arc::new(executor), Arc::new(NoopMessenger), Arc::new(RateLimiter::defaults()), Duration::from_secs(1));

        let session = new_session();
        let conn = open_conn();
        session.handle_raw(&orchestrator, r#"{"jsonrpc":"2.0","method":"auth","params":{"token":"secret"},"id":1}"#, &conn).await;

        let raw = r#"{"jsonrpc":"2.0","method":"tool_request","params":{"request_id":"r1","tool":"do_thing","args":{}},"id":2}"#;
        let response = session.handle_raw(&orchestrator, raw, &conn).await;
        assert_eq!(response.error.unwrap().code, crate::error::rpc_code::POLICY_DENIED);
    }
}
