//! Append-only audit log (§4.F). Row shape and DDL for the `audit_log`
//! table described in §6.2. `float → ISO-8601` conversion is confined to
//! this boundary, per §3.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::{AgentId, AuditEntry};

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp         TEXT NOT NULL,
    request_id        TEXT NOT NULL,
    tool_name         TEXT NOT NULL,
    args              TEXT NOT NULL,
    signature         TEXT NOT NULL,
    decision          TEXT NOT NULL,
    resolution        TEXT,
    resolved_by       TEXT,
    resolved_at       TEXT,
    execution_result  TEXT,
    agent_id          TEXT NOT NULL DEFAULT 'default'
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log (timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_tool_name ON audit_log (tool_name);
"#;

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_decision(s: &str) -> crate::model::Decision {
    match s {
        "allow" => crate::model::Decision::Allow,
        "deny" => crate::model::Decision::Deny,
        _ => crate::model::Decision::Ask,
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let args_text: String = row.get("args")?;
    let execution_result_text: Option<String> = row.get("execution_result")?;
    let timestamp: String = row.get("timestamp")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;
    let decision: String = row.get("decision")?;

    Ok(AuditEntry {
        request_id: row.get("request_id")?,
        timestamp: parse_ts(&timestamp),
        tool_name: row.get("tool_name")?,
        args: serde_json::from_str(&args_text).unwrap_or(Value::Null),
        signature: row.get("signature")?,
        decision: parse_decision(&decision),
        resolution: row.get("resolution")?,
        resolved_by: row.get("resolved_by")?,
        resolved_at: resolved_at.map(|s| parse_ts(&s)),
        execution_result: execution_result_text.and_then(|t| serde_json::from_str(&t).ok()),
        agent_id: AgentId(row.get("agent_id")?),
    })
}

pub fn log(conn: &Connection, entry: &AuditEntry) -> Result<(), GatewayError> {
    conn.execute(
        "INSERT INTO audit_log
            (timestamp, request_id, tool_name, args, signature, decision,
             resolution, resolved_by, resolved_at, execution_result, agent_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.timestamp.to_rfc3339(),
            entry.request_id,
            entry.tool_name,
            entry.args.to_string(),
            entry.signature,
            entry.decision.as_str(),
            entry.resolution,
            entry.resolved_by,
            entry.resolved_at.map(|t| t.to_rfc3339()),
            entry.execution_result.as_ref().map(|v| v.to_string()),
            entry.agent_id.0,
        ],
    )?;
    Ok(())
}

/// Newest-first, capped at `limit`.
pub fn query(conn: &Connection, limit: usize) -> Result<Vec<AuditEntry>, GatewayError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM audit_log ORDER BY id DESC LIMIT ?1",
    )?;
    let entries = stmt
        .query_map(params![limit as i64], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}
