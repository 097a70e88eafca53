//! Executor registry (§4.H): dispatches an allowed tool call to the
//! concrete service that actually performs it. Grounded on the
//! teacher's `ChannelManager` (a name → `Arc<dyn Trait>` registry with a
//! uniform dispatch method) generalized from channels to services.

pub mod homeassistant;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;

/// A backing service capable of carrying out tool calls once the policy
/// engine has allowed them. Implementors own their own transport (HTTP
/// client, socket, subprocess) and must not perform any policy checks —
/// by the time `execute` is called the decision has already been made.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Execute `tool` with `args`, returning whatever JSON payload the
    /// caller should hand back to the agent as `ToolResult::data`.
    async fn execute(&self, tool: &str, args: &BTreeMap<String, Value>) -> Result<Value, GatewayError>;

    /// Lightweight reachability probe, used by `lifecycle` at startup and
    /// optionally by an operator-facing health endpoint.
    async fn health_check(&self) -> bool;

    /// Release any held resources (connections, tasks) on shutdown.
    async fn close(&self);
}

/// Maps tool names to the service that implements them, then routes
/// `execute` calls to the right [`ServiceHandler`]. The map from tool
/// prefix to service key is static and built at registry construction —
/// the spec does not call for dynamic registration at runtime.
pub struct Executor {
    tool_to_service: HashMap<String, String>,
    services: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl Executor {
    pub fn new() -> Self {
        Self { tool_to_service: HashMap::new(), services: HashMap::new() }
    }

    /// Register a service under `service_key`, and declare it as the
    /// handler for every tool name in `tools`.
    pub fn register(&mut self, service_key: &str, tools: &[&str], handler: Arc<dyn ServiceHandler>) {
        self.services.insert(service_key.to_string(), handler);
        for tool in tools {
            self.tool_to_service.insert(tool.to_string(), service_key.to_string());
        }
    }

    pub async fn execute(&self, tool: &str, args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
        let service_key = self
            .tool_to_service
            .get(tool)
            .ok_or_else(|| GatewayError::Execution(format!("unknown tool: {tool}")))?;
        let handler = self
            .services
            .get(service_key)
            .ok_or_else(|| GatewayError::Execution(format!("service not configured: {service_key}")))?;
        handler.execute(tool, args).await
    }

    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut report = HashMap::new();
        for (key, handler) in &self.services {
            report.insert(key.clone(), handler.health_check().await);
        }
        report
    }

    pub async fn close_all(&self) {
        for handler in self.services.values() {
            handler.close().await;
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ServiceHandler for Echo {
        async fn execute(&self, tool: &str, args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
            Ok(serde_json::json!({ "tool": tool, "args": args }))
        }
        async fn health_check(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_service() {
        let mut executor = Executor::new();
        executor.register("echo", &["ping"], Arc::new(Echo));
        let result = executor.execute("ping", &BTreeMap::new()).await.unwrap();
        assert_eq!(result["tool"], "ping");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_execution_error() {
        let executor = Executor::new();
        let result = executor.execute("nonexistent", &BTreeMap::new()).await;
        assert!(matches!(result, Err(GatewayError::Execution(_))));
    }

    #[tokio::test]
    async fn unconfigured_service_is_an_execution_error() {
        // tool_to_service has an entry but services does not — simulates a
        // misconfigured registry (registered tools for a service that
        // failed to initialize).
        let mut executor = Executor::new();
        executor.tool_to_service.insert("orphan".to_string(), "missing".to_string());
        let result = executor.execute("orphan", &BTreeMap::new()).await;
        assert!(matches!(result, Err(GatewayError::Execution(_))));
    }
}
