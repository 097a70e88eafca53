//! Orchestrator (§4.J): the component that actually carries out a
//! `tool_request` — evaluate policy, execute or go to a human, and
//! guarantee each pending approval is settled exactly once no matter
//! which of (messenger callback, timeout, shutdown sweep) gets there
//! first.
//!
//! Grounded on the `other_examples` `Approvals` registry: a
//! `DashMap<String, PendingApproval>` whose `remove()` is the sole
//! serialization point. Atomic-remove-as-mutex avoids a separate per-id
//! lock: whichever caller's `remove()` call actually returns `Some` is
//! the one and only caller allowed to settle that approval.
//!
//! All settlement work (execute-if-approved, audit, messenger update,
//! durable persistence) happens inside `resolve`, regardless of which of
//! the three origins triggered it. This matters for disconnects: the
//! task that called `handle_ask` may still be suspended in `resolve`'s
//! `oneshot` long after its agent has gone away, so `resolve` itself
//! decides — based on whether that `oneshot` still has a live receiver —
//! whether to hand the result back directly or leave it in the durable
//! store for `drain_offline_results` to pick up on reconnect.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::executor::Executor;
use crate::messenger::{ApprovalCallback, CallbackAction, MessengerAdapter};
use crate::model::{AuditEntry, Decision, ResultStatus, ToolRequest, ToolResult};
use crate::policy::PermissionEngine;
use crate::ratelimit::RateLimiter;
use crate::store::Store;

/// How a pending approval was ultimately settled.
#[derive(Debug, Clone)]
pub enum Outcome {
    Approved { actor: String },
    Denied { actor: String },
    TimedOut,
    /// The gateway is shutting down with this approval still outstanding.
    Shutdown,
}

struct PendingApproval {
    request: ToolRequest,
    signature: String,
    response_tx: oneshot::Sender<Result<ToolResult, GatewayError>>,
    timeout_handle: JoinHandle<()>,
}

pub struct Orchestrator {
    pending: Arc<DashMap<String, PendingApproval>>,
    store: Arc<Store>,
    engine: Arc<PermissionEngine>,
    executor: Arc<Executor>,
    messenger: Arc<dyn MessengerAdapter>,
    rate_limiter: Arc<RateLimiter>,
    approval_timeout: Duration,
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<PermissionEngine>,
        executor: Arc<Executor>,
        messenger: Arc<dyn MessengerAdapter>,
        rate_limiter: Arc<RateLimiter>,
        approval_timeout: Duration,
    ) -> Arc<Self> {
        let orchestrator = Arc::new_cyclic(|weak| Self {
            pending: Arc::new(DashMap::new()),
            store,
            engine,
            executor,
            messenger,
            rate_limiter,
            approval_timeout,
            self_ref: weak.clone(),
        });

        let callback_target = orchestrator.self_ref.clone();
        orchestrator.messenger.set_callback(Arc::new(move |callback: ApprovalCallback| {
            let Some(orchestrator) = callback_target.upgrade() else { return };
            let outcome = match callback.action {
                CallbackAction::Approve => Outcome::Approved { actor: callback.actor },
                CallbackAction::Deny => Outcome::Denied { actor: callback.actor },
            };
            let request_id = callback.request_id;
            tokio::spawn(async move {
                orchestrator.resolve(&request_id, outcome).await;
            });
        }));

        orchestrator
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The full `tool_request` happy path: validate, decide, execute or
    /// escalate. `Err` covers every outcome the agent must see as a
    /// JSON-RPC error rather than a result payload — rate limiting,
    /// malformed arguments, policy denial, user denial, and timeout all
    /// map to a specific `GatewayError` with its own RPC error code.
    /// `conn` is this request's connection's outbound channel; an `ask`
    /// decision uses it to notice the agent going away while the request
    /// is still suspended waiting on a human.
    pub async fn handle_tool_request(&self, request: ToolRequest, conn: mpsc::UnboundedSender<String>) -> Result<ToolResult, GatewayError> {
        if !self.rate_limiter.try_record_request() {
            return Err(GatewayError::RateLimit);
        }

        let evaluation = self.engine.evaluate(&request.tool, &request.args)?;

        match evaluation.decision {
            Decision::Deny => {
                self.audit(&request, &evaluation.signature, Decision::Deny, "denied_by_policy", "policy", None);
                Err(GatewayError::PolicyDenial)
            }
            Decision::Allow => match self.executor.execute(&request.tool, &request.args).await {
                Ok(data) => {
                    self.audit(&request, &evaluation.signature, Decision::Allow, "executed", "policy", Some(data.clone()));
                    Ok(ToolResult { request_id: request.request_id, status: ResultStatus::Executed, data: Some(data) })
                }
                Err(e) => {
                    // Still resolution=executed: the approval led to an
                    // execution attempt, it just failed. The failure
                    // itself surfaces to the agent as -32004, with the
                    // error captured in the audit row's execution_result.
                    let error_payload = json!({ "error": e.to_string() });
                    self.audit(&request, &evaluation.signature, Decision::Allow, "executed", "policy", Some(error_payload));
                    Err(e)
                }
            },
            Decision::Ask => self.handle_ask(request, evaluation.signature, conn).await,
        }
    }

    async fn handle_ask(&self, request: ToolRequest, signature: String, conn: mpsc::UnboundedSender<String>) -> Result<ToolResult, GatewayError> {
        if !self.rate_limiter.can_admit_pending(self.pending.len()) {
            return Err(GatewayError::RateLimit);
        }

        let request_id = request.request_id.clone();
        let (tx, mut rx) = oneshot::channel();
        let timeout_handle = self.spawn_timeout_watcher(request_id.clone(), self.approval_timeout);

        // Reserve the slot synchronously, before the first suspension
        // point below, so a second pipelined `ask` racing this one can't
        // observe the pre-reservation pending count and double-admit
        // past the cap.
        self.pending.insert(
            request_id.clone(),
            PendingApproval { request: request.clone(), signature: signature.clone(), response_tx: tx, timeout_handle },
        );

        if let Err(e) = self.register_ask(&request, &signature).await {
            // Registration never reached a state where some other caller
            // (messenger callback, timeout) could plausibly resolve this
            // id, so it's safe to drop the reservation outright.
            if let Some((_, reserved)) = self.pending.remove(&request_id) {
                reserved.timeout_handle.abort();
            }
            return Err(e);
        }

        tokio::select! {
            result = &mut rx => result.unwrap_or(Err(GatewayError::Timeout)),
            _ = conn.closed() => {
                // The connection died while still waiting on a human.
                // Dropping `rx` means the eventual `resolve()` call finds
                // no live receiver and persists the real outcome for
                // `drain_offline_results` instead of trying to deliver it
                // over this dead connection.
                drop(rx);
                Err(GatewayError::Timeout)
            }
        }
    }

    async fn register_ask(&self, request: &ToolRequest, signature: &str) -> Result<(), GatewayError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(self.approval_timeout).unwrap_or(chrono::Duration::seconds(900));

        self.store.insert_pending(&request.request_id, &request.tool, &crate::model::args_to_json(&request.args), signature, now, expires_at)?;

        let message_id = self.messenger.send_approval(&request.request_id, signature).await?;
        self.store.pending_set_message_id(&request.request_id, &message_id, None)?;
        Ok(())
    }

    /// Carry out the actual work a resolved approval implies — executing
    /// the tool if approved, auditing exactly once, and best-effort
    /// updating the messenger — and report both the live-delivery result
    /// and the payload an offline drain would see for the same outcome.
    async fn settle_ask(&self, request: &ToolRequest, signature: &str, outcome: Outcome) -> (Result<ToolResult, GatewayError>, Value) {
        match outcome {
            Outcome::Approved { actor } => match self.executor.execute(&request.tool, &request.args).await {
                Ok(data) => {
                    self.audit(request, signature, Decision::Ask, "executed", &actor, Some(data.clone()));
                    let _ = self.messenger.update_approval(&request.request_id, "approved").await;
                    let result = ToolResult { request_id: request.request_id.clone(), status: ResultStatus::Executed, data: Some(data.clone()) };
                    (Ok(result), queued_payload("executed", Some(data)))
                }
                Err(e) => {
                    let error_payload = json!({ "error": e.to_string() });
                    self.audit(request, signature, Decision::Ask, "executed", &actor, Some(error_payload.clone()));
                    let _ = self.messenger.update_approval(&request.request_id, "execution failed").await;
                    (Err(e), queued_payload("execution_failed", Some(error_payload)))
                }
            },
            Outcome::Denied { actor } => {
                self.audit(request, signature, Decision::Ask, "denied_by_user", &actor, None);
                let _ = self.messenger.update_approval(&request.request_id, "denied").await;
                (Err(GatewayError::UserDenial), queued_payload("denied", None))
            }
            Outcome::TimedOut => {
                self.audit(request, signature, Decision::Ask, "timeout", "system", None);
                let _ = self.messenger.update_approval(&request.request_id, "timed out").await;
                (Err(GatewayError::Timeout), queued_payload("timeout", None))
            }
            Outcome::Shutdown => {
                self.audit(request, signature, Decision::Ask, "gateway_shutdown", "system", None);
                (Err(GatewayError::Timeout), queued_payload("timeout", None))
            }
        }
    }

    /// Called by the agent session to drain any approvals that resolved
    /// (or timed out) while it was disconnected. Results were persisted
    /// by `resolve` because no live `oneshot` receiver existed to
    /// consume them at the time.
    pub fn drain_offline_results(&self) -> Result<Vec<(String, Value)>, GatewayError> {
        self.store.drain_results_for_agent()
    }

    /// Settle `request_id` exactly once. Whichever caller's `remove()`
    /// observes `Some` is the caller whose outcome wins; every other
    /// caller (a second messenger callback, a race with the timeout
    /// task) sees `None` and does nothing.
    pub async fn resolve(&self, request_id: &str, outcome: Outcome) {
        let Some((_, pending)) = self.pending.remove(request_id) else {
            return;
        };
        pending.timeout_handle.abort();
        let PendingApproval { request, signature, response_tx, .. } = pending;

        let (result, queued) = self.settle_ask(&request, &signature, outcome).await;

        match response_tx.send(result) {
            Ok(()) => {
                let _ = self.store.pending_delete(&request.request_id);
            }
            Err(_) => {
                // The original `handle_ask` caller is gone (agent
                // disconnected mid-wait) — persist the real outcome so
                // `drain_offline_results` can hand it back on reconnect.
                tracing::debug!(request_id = %request.request_id, "resolved approval with no live receiver, queuing for offline drain");
                let _ = self.store.pending_set_result(&request.request_id, &queued);
            }
        }
    }

    fn spawn_timeout_watcher(&self, request_id: String, timeout: Duration) -> JoinHandle<()> {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.resolve(&request_id, Outcome::TimedOut).await;
            }
        })
    }

    /// Sweep every outstanding approval with [`Outcome::Shutdown`] —
    /// called once, from `lifecycle`, on graceful shutdown.
    pub async fn shutdown_pending(&self) {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.resolve(&id, Outcome::Shutdown).await;
        }
    }

    fn audit(&self, request: &ToolRequest, signature: &str, decision: Decision, resolution: &str, resolved_by: &str, execution_result: Option<Value>) {
        let entry = AuditEntry::new(request, signature, decision, resolution, resolved_by, execution_result);
        if let Err(e) = self.store.audit_log(&entry) {
            tracing::error!(error = %e, "failed to write audit log entry");
        }
    }
}

/// Build the JSON object persisted for (and later drained as) a queued
/// offline result: `{"status": ..., "data"?: ...}`.
fn queued_payload(status: &str, data: Option<Value>) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("status".to_string(), Value::String(status.to_string()));
    if let Some(data) = data {
        obj.insert("data".to_string(), data);
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ServiceHandler;
    use crate::messenger::CallbackFn;
    use crate::policy::rules::{PermissionRule, Permissions};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct AlwaysOk;

    #[async_trait]
    impl ServiceHandler for AlwaysOk {
        async fn execute(&self, _tool: &str, _args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
            Ok(json!({"ok": true}))
        }
        async fn health_check(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    struct FakeMessenger {
        callback: StdMutex<Option<CallbackFn>>,
    }

    impl FakeMessenger {
        fn new() -> Arc<Self> {
            Arc::new(Self { callback: StdMutex::new(None) })
        }

        fn trigger(&self, request_id: &str, action: CallbackAction) {
            let callback = self.callback.lock().unwrap().clone();
            if let Some(cb) = callback {
                cb(ApprovalCallback { request_id: request_id.to_string(), action, actor: "tester".to_string() });
            }
        }
    }

    #[async_trait]
    impl MessengerAdapter for FakeMessenger {
        fn name(&self) -> &str {
            "fake"
        }
        async fn send_approval(&self, request_id: &str, _signature: &str) -> Result<String, GatewayError> {
            Ok(request_id.to_string())
        }
        async fn update_approval(&self, _message_id: &str, _outcome: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        fn set_callback(&self, callback: CallbackFn) {
            *self.callback.lock().unwrap() = Some(callback);
        }
        async fn start(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn health_check(&self) -> bool {
            true
        }
    }

    fn request(id: &str, tool: &str) -> ToolRequest {
        ToolRequest { request_id: id.to_string(), tool: tool.to_string(), args: BTreeMap::new(), signature: None }
    }

    fn build(policy: Permissions, messenger: Arc<FakeMessenger>) -> Arc<Orchestrator> {
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = Arc::new(PermissionEngine::compile(&policy).unwrap());
        let mut executor = Executor::new();
        executor.register("svc", &["do_thing", "ha_get_states"], Arc::new(AlwaysOk));
        Orchestrator::new(store, engine, Arc::new(executor), messenger, Arc::new(RateLimiter::defaults()), Duration::from_millis(200))
    }

    /// A sender whose receiver is intentionally leaked: these tests don't
    /// exercise connection-liveness detection, so `ask` should behave as
    /// though the connection never disconnects.
    fn open_conn() -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        tx
    }

    #[tokio::test]
    async fn allow_executes_immediately() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: Decision::Allow, description: String::new() }], rules: vec![] };
        let orchestrator = build(policy, FakeMessenger::new());
        let result = orchestrator.handle_tool_request(request("r1", "do_thing"), open_conn()).await.unwrap();
        assert_eq!(result.status, ResultStatus::Executed);
    }

    #[tokio::test]
    async fn deny_short_circuits_without_executing() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: Decision::Deny, description: String::new() }], rules: vec![] };
        let orchestrator = build(policy, FakeMessenger::new());
        let result = orchestrator.handle_tool_request(request("r1", "do_thing"), open_conn()).await;
        assert!(matches!(result, Err(GatewayError::PolicyDenial)));
    }

    #[tokio::test]
    async fn ask_resolved_by_approval_executes() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: Decision::Ask, description: String::new() }], rules: vec![] };
        let messenger = FakeMessenger::new();
        let orchestrator = build(policy, messenger.clone());

        let handle = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.handle_tool_request(request("r1", "do_thing"), open_conn()).await }
        });

        // give handle_ask a moment to register before the callback fires
        tokio::time::sleep(Duration::from_millis(20)).await;
        messenger.trigger("r1", CallbackAction::Approve);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Executed);
    }

    #[tokio::test]
    async fn ask_resolved_by_denial_is_denied() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: Decision::Ask, description: String::new() }], rules: vec![] };
        let messenger = FakeMessenger::new();
        let orchestrator = build(policy, messenger.clone());

        let handle = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.handle_tool_request(request("r1", "do_thing"), open_conn()).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        messenger.trigger("r1", CallbackAction::Deny);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(GatewayError::UserDenial)));
    }

    #[tokio::test]
    async fn ask_times_out_when_unresolved() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: Decision::Ask, description: String::new() }], rules: vec![] };
        let orchestrator = build(policy, FakeMessenger::new());
        let result = orchestrator.handle_tool_request(request("r1", "do_thing"), open_conn()).await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
    }

    #[tokio::test]
    async fn second_resolution_attempt_is_a_no_op() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: Decision::Ask, description: String::new() }], rules: vec![] };
        let messenger = FakeMessenger::new();
        let orchestrator = build(policy, messenger.clone());

        let handle = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.handle_tool_request(request("r1", "do_thing"), open_conn()).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        messenger.trigger("r1", CallbackAction::Approve);
        // A second, racing "deny" must lose — the pending entry is
        // already gone by the time this fires.
        messenger.trigger("r1", CallbackAction::Deny);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Executed);
    }

    #[tokio::test]
    async fn disconnect_while_waiting_on_approval_is_recoverable_offline() {
        let policy = Permissions { defaults: vec![PermissionRule { pattern: "*".into(), action: Decision::Ask, description: String::new() }], rules: vec![] };
        let messenger = FakeMessenger::new();
        let orchestrator = build(policy, messenger.clone());

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.handle_tool_request(request("r1", "do_thing"), out_tx).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Simulate the socket closing: drop the receiver half, which is
        // exactly what happens to a connection's channel when its
        // `handle_socket` loop exits.
        drop(out_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let disconnected_result = handle.await.unwrap();
        assert!(matches!(disconnected_result, Err(GatewayError::Timeout)));

        // The approval resolves after the agent is long gone.
        messenger.trigger("r1", CallbackAction::Approve);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let drained = orchestrator.drain_offline_results().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "r1");
        assert_eq!(drained[0].1["status"], "executed");
    }
}
