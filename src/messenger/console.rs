//! Console messenger: prompts on stderr and reads `allow <id>` / `deny
//! <id>` lines from stdin. Used in development and by the integration
//! tests in place of a real chat transport — always compiled, unlike
//! `telegram`, since the gateway must be usable with zero external
//! dependencies configured.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

use crate::error::GatewayError;

use super::{CallbackAction, ApprovalCallback, CallbackFn, MessengerAdapter};

pub struct ConsoleMessenger {
    callback: Mutex<Option<CallbackFn>>,
    stop: Notify,
}

impl ConsoleMessenger {
    pub fn new() -> Self {
        Self { callback: Mutex::new(None), stop: Notify::new() }
    }

    fn callback(&self) -> Option<CallbackFn> {
        self.callback.lock().expect("console messenger callback lock poisoned").clone()
    }
}

impl Default for ConsoleMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessengerAdapter for ConsoleMessenger {
    fn name(&self) -> &str {
        "console"
    }

    async fn send_approval(&self, request_id: &str, signature: &str) -> Result<String, GatewayError> {
        eprintln!("[approval requested] {request_id}: {signature}");
        eprintln!("  -> respond with: allow {request_id}   OR   deny {request_id}");
        Ok(request_id.to_string())
    }

    async fn update_approval(&self, message_id: &str, outcome: &str) -> Result<(), GatewayError> {
        eprintln!("[approval resolved] {message_id}: {outcome}");
        Ok(())
    }

    fn set_callback(&self, callback: CallbackFn) {
        *self.callback.lock().expect("console messenger callback lock poisoned") = Some(callback);
    }

    async fn start(&self) -> Result<(), GatewayError> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let callback = self.callback();

        tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(parsed) = parse_line(&line) {
                            if let Some(ref cb) = callback {
                                cb(parsed);
                            }
                        }
                    }
                    _ => break,
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn parse_line(line: &str) -> Option<ApprovalCallback> {
    let mut parts = line.trim().splitn(2, char::is_whitespace);
    let verb = parts.next()?;
    let request_id = parts.next()?.trim();
    if request_id.is_empty() {
        return None;
    }
    let action = match verb {
        "allow" => CallbackAction::Approve,
        "deny" => CallbackAction::Deny,
        _ => return None,
    };
    Some(ApprovalCallback { request_id: request_id.to_string(), action, actor: "console".to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_allow_line() {
        let parsed = parse_line("allow req-1").unwrap();
        assert_eq!(parsed.request_id, "req-1");
        assert_eq!(parsed.action, CallbackAction::Approve);
    }

    #[test]
    fn parses_deny_line_with_extra_whitespace() {
        let parsed = parse_line("  deny   req-2  ").unwrap();
        assert_eq!(parsed.request_id, "req-2");
        assert_eq!(parsed.action, CallbackAction::Deny);
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(parse_line("maybe req-3").is_none());
    }

    #[test]
    fn rejects_missing_request_id() {
        assert!(parse_line("allow").is_none());
    }
}
