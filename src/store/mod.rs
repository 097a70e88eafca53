//! The durable persistence boundary: pending-approval records (§4.E) and
//! the append-only audit log (§4.F) share one SQLite file and one
//! connection, guarded by a `Mutex` — grounded on the
//! `Arc<Mutex<rusqlite::Connection>>` shape of `memory/sqlite_store.rs` in
//! the grounding repo, generalized from a single FTS5 table to the two
//! tables this gateway persists.
//!
//! Timestamps are ISO-8601 text on disk; every in-memory representation
//! is a `chrono::DateTime<Utc>`. Conversion is confined to `pending.rs`
//! and `audit.rs`.

pub mod audit;
pub mod pending;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

pub use audit::SCHEMA_SQL as AUDIT_SCHEMA_SQL;
pub use pending::{PendingRecord, SCHEMA_SQL as PENDING_SCHEMA_SQL};

use crate::error::GatewayError;
use crate::model::AuditEntry;

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`, creating both tables and
    /// their indexes if absent. File mode is restricted to `0600` on
    /// create where the platform supports it.
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        let existed = path.exists();
        let conn = Connection::open(path)?;
        conn.execute_batch(pending::SCHEMA_SQL)?;
        conn.execute_batch(audit::SCHEMA_SQL)?;

        if !existed {
            restrict_permissions(path);
        }

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory database — used by tests.
    pub fn in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(pending::SCHEMA_SQL)?;
        conn.execute_batch(audit::SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }

    // ── Pending ────────────────────────────────────────────────────────

    pub fn insert_pending(
        &self,
        request_id: &str,
        tool_name: &str,
        args: &Value,
        signature: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        pending::insert(&self.lock(), request_id, tool_name, args, signature, created_at, expires_at)
    }

    pub fn pending_set_message_id(
        &self,
        request_id: &str,
        message_id: &str,
        chat_id: Option<i64>,
    ) -> Result<(), GatewayError> {
        pending::set_message_id(&self.lock(), request_id, message_id, chat_id)
    }

    pub fn pending_get(&self, request_id: &str) -> Result<Option<PendingRecord>, GatewayError> {
        pending::get(&self.lock(), request_id)
    }

    pub fn pending_set_result(&self, request_id: &str, result: &Value) -> Result<(), GatewayError> {
        pending::set_result(&self.lock(), request_id, result)
    }

    pub fn drain_results_for_agent(&self) -> Result<Vec<(String, Value)>, GatewayError> {
        pending::drain_results_for_agent(&self.lock())
    }

    pub fn pending_delete(&self, request_id: &str) -> Result<(), GatewayError> {
        pending::delete(&self.lock(), request_id)
    }

    pub fn cleanup_stale(&self, now: DateTime<Utc>) -> Result<Vec<PendingRecord>, GatewayError> {
        pending::cleanup_stale(&self.lock(), now)
    }

    // ── Audit ──────────────────────────────────────────────────────────

    pub fn audit_log(&self, entry: &AuditEntry) -> Result<(), GatewayError> {
        audit::log(&self.lock(), entry)
    }

    pub fn audit_query(&self, limit: usize) -> Result<Vec<AuditEntry>, GatewayError> {
        audit::query(&self.lock(), limit)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentId, Decision, ToolRequest};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn req(id: &str) -> ToolRequest {
        ToolRequest {
            request_id: id.to_string(),
            tool: "ha_get_state".to_string(),
            args: BTreeMap::new(),
            signature: None,
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_pending("r1", "ha_get_state", &json!({"entity_id": "sensor.temp"}), "ha_get_state(sensor.temp)", now, now + chrono::Duration::seconds(900))
            .unwrap();
        let record = store.pending_get("r1").unwrap().unwrap();
        assert_eq!(record.request_id, "r1");
        assert_eq!(record.tool_name, "ha_get_state");
        assert!(record.message_id.is_none());
        assert!(record.result.is_none());
    }

    #[test]
    fn set_result_then_drain_then_drain_again_is_empty() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_pending("r1", "t", &json!({}), "t", now, now + chrono::Duration::seconds(60))
            .unwrap();
        store.pending_set_result("r1", &json!({"status": "executed"})).unwrap();

        let drained = store.drain_results_for_agent().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "r1");

        // Idempotent — a second drain sees nothing.
        let drained_again = store.drain_results_for_agent().unwrap();
        assert!(drained_again.is_empty());

        // Record was deleted along with the drained result.
        assert!(store.pending_get("r1").unwrap().is_none());
    }

    #[test]
    fn cleanup_stale_deletes_expired_rows_and_is_idempotent() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_pending("expired", "t", &json!({}), "t", now - chrono::Duration::seconds(10), now - chrono::Duration::seconds(1))
            .unwrap();
        store
            .insert_pending("fresh", "t", &json!({}), "t", now, now + chrono::Duration::seconds(900))
            .unwrap();

        let stale = store.cleanup_stale(now).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].request_id, "expired");
        assert!(store.pending_get("fresh").unwrap().is_some());

        // Idempotent.
        let stale_again = store.cleanup_stale(now).unwrap();
        assert!(stale_again.is_empty());
    }

    #[test]
    fn audit_log_query_is_newest_first() {
        let store = Store::in_memory().unwrap();
        let request = req("r1");
        let entry1 = AuditEntry::new(&request, "ha_get_state", Decision::Allow, "executed", "policy", Some(json!({"ok": true})));
        store.audit_log(&entry1).unwrap();

        let mut request2 = req("r2");
        request2.tool = "ha_call_service".to_string();
        let entry2 = AuditEntry::new(&request2, "ha_call_service(light.turn_on)", Decision::Deny, "denied_by_policy", "policy", None);
        store.audit_log(&entry2).unwrap();

        let entries = store.audit_query(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].request_id, "r2", "newest entry should come first");
        assert_eq!(entries[0].agent_id, AgentId::default());
    }
}
