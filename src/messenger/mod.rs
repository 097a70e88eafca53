//! Messenger adapters (§4.I): the channel through which a human reviews
//! and resolves `ask` decisions. Grounded on the teacher's `Channel`
//! trait — a named, health-checkable transport abstraction — narrowed
//! from general inbound/outbound messaging to the specific approve/deny
//! exchange this gateway needs.

pub mod console;

#[cfg(feature = "messenger-telegram")]
pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::GatewayError;

/// What a human reviewer decided, as reported back through a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Approve,
    Deny,
}

/// An inbound resolution for a previously-sent approval prompt.
#[derive(Debug, Clone)]
pub struct ApprovalCallback {
    pub request_id: String,
    pub action: CallbackAction,
    /// Identity of the human who resolved it, as reported by the
    /// messenger (username, chat member id, etc.).
    pub actor: String,
}

/// Invoked by a messenger implementation whenever it receives a
/// resolution from its transport. Registered once via `set_callback`
/// before `start` is called.
pub type CallbackFn = Arc<dyn Fn(ApprovalCallback) + Send + Sync>;

/// A channel capable of presenting an approval prompt to a human and
/// reporting back their decision. `send_approval` and `update_approval`
/// are the outbound half; `set_callback` plus `start`/`stop` are the
/// inbound half (polling loop or webhook listener, depending on the
/// transport).
#[async_trait]
pub trait MessengerAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Present a new approval prompt. Returns an opaque message
    /// identifier the adapter can later use to edit that same message
    /// (e.g. to show the final decision) via `update_approval`.
    async fn send_approval(
        &self,
        request_id: &str,
        signature: &str,
    ) -> Result<String, GatewayError>;

    /// Edit a previously sent prompt to reflect its outcome — approved,
    /// denied, timed out, or the gateway is shutting down.
    async fn update_approval(&self, message_id: &str, outcome: &str) -> Result<(), GatewayError>;

    /// Register the callback invoked for inbound resolutions. Must be
    /// called before `start`.
    fn set_callback(&self, callback: CallbackFn);

    /// Begin listening for inbound resolutions. Returns once listening
    /// has started (the listen loop itself runs on a spawned task).
    async fn start(&self) -> Result<(), GatewayError>;

    /// Stop listening and release any held resources.
    async fn stop(&self);

    async fn health_check(&self) -> bool;
}
