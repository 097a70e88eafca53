//! Error taxonomy for the gateway.
//!
//! Every variant here is one of the semantic error kinds from the design
//! (`ConfigError`, `InvalidArgument`, `PolicyDenial`, `UserDenial`,
//! `Timeout`, `ExecutionError`, `AuthError`, `RateLimitError`,
//! `ProtocolError`). [`GatewayError::rpc_code`] maps each to the JSON-RPC
//! error code the orchestrator must return.

use thiserror::Error;

/// JSON-RPC error codes used on the wire. See `gateway::protocol`.
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const APPROVAL_DENIED: i64 = -32001;
    pub const APPROVAL_TIMEOUT: i64 = -32002;
    pub const POLICY_DENIED: i64 = -32003;
    pub const EXECUTION_FAILED: i64 = -32004;
    pub const NOT_AUTHENTICATED: i64 = -32005;
    pub const RATE_LIMIT: i64 = -32006;
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Fatal at startup; the process must exit non-zero without starting
    /// any partial services.
    #[error("configuration error: {0}")]
    Config(String),

    /// Argument failed validation (forbidden characters, or malformed
    /// identifier for a reserved namespace key). Never carries the raw
    /// argument value in its message.
    #[error("invalid argument")]
    InvalidArgument,

    /// A `deny` rule (or default) matched the signature.
    #[error("policy denied")]
    PolicyDenial,

    /// A human approver rejected the request.
    #[error("denied by user")]
    UserDenial,

    /// No human response arrived before the approval window elapsed.
    #[error("approval timed out")]
    Timeout,

    /// The downstream service/executor raised while executing an allowed
    /// or approved action.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Bearer token mismatch, or the auth deadline elapsed before `auth`.
    #[error("not authenticated")]
    Auth,

    /// Request-rate or pending-approval-cap exceeded.
    #[error("rate limit exceeded")]
    RateLimit,

    /// Non-JSON frame, missing/invalid `jsonrpc` field, or unknown method.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The JSON-RPC error code this error maps to, per §6.1 of the design.
    /// `None` for kinds that never escape to the wire (e.g. `Config`,
    /// `Storage`, `Io`, which are startup- or persistence-layer failures).
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            GatewayError::InvalidArgument | GatewayError::Protocol(_) => {
                Some(rpc_code::INVALID_REQUEST)
            }
            GatewayError::PolicyDenial => Some(rpc_code::POLICY_DENIED),
            GatewayError::UserDenial => Some(rpc_code::APPROVAL_DENIED),
            GatewayError::Timeout => Some(rpc_code::APPROVAL_TIMEOUT),
            GatewayError::Execution(_) => Some(rpc_code::EXECUTION_FAILED),
            GatewayError::Auth => Some(rpc_code::NOT_AUTHENTICATED),
            GatewayError::RateLimit => Some(rpc_code::RATE_LIMIT),
            GatewayError::Config(_) | GatewayError::Storage(_) | GatewayError::Io(_) => None,
        }
    }

    /// A short, user-safe message. Never echoes raw argument values or the
    /// bearer token.
    pub fn rpc_message(&self) -> String {
        match self {
            GatewayError::InvalidArgument => "invalid argument".to_string(),
            other => other.to_string(),
        }
    }
}
