//! Durable pending-request records (§4.E). Row shape and DDL for the
//! `pending_requests` table described in §6.2.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use crate::error::GatewayError;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pending_requests (
    request_id  TEXT PRIMARY KEY NOT NULL,
    tool_name   TEXT NOT NULL,
    args        TEXT NOT NULL,
    signature   TEXT NOT NULL,
    message_id  TEXT,
    chat_id     INTEGER,
    result      TEXT,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_expires_at ON pending_requests (expires_at);
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub request_id: String,
    pub tool_name: String,
    pub args: Value,
    pub signature: String,
    pub message_id: Option<String>,
    pub chat_id: Option<i64>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Parse a stored ISO-8601 timestamp. Malformed rows (which should never
/// occur — this boundary is the only writer) fall back to now rather than
/// poisoning a whole query.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PendingRecord> {
    let args_text: String = row.get("args")?;
    let result_text: Option<String> = row.get("result")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: String = row.get("expires_at")?;

    Ok(PendingRecord {
        request_id: row.get("request_id")?,
        tool_name: row.get("tool_name")?,
        args: serde_json::from_str(&args_text).unwrap_or(Value::Null),
        signature: row.get("signature")?,
        message_id: row.get("message_id")?,
        chat_id: row.get("chat_id")?,
        result: result_text.and_then(|t| serde_json::from_str(&t).ok()),
        created_at: parse_ts(&created_at),
        expires_at: parse_ts(&expires_at),
    })
}

pub fn insert(
    conn: &Connection,
    request_id: &str,
    tool_name: &str,
    args: &Value,
    signature: &str,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<(), GatewayError> {
    conn.execute(
        "INSERT INTO pending_requests
            (request_id, tool_name, args, signature, message_id, chat_id, result, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, ?5, ?6)",
        params![
            request_id,
            tool_name,
            args.to_string(),
            signature,
            created_at.to_rfc3339(),
            expires_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn set_message_id(
    conn: &Connection,
    request_id: &str,
    message_id: &str,
    chat_id: Option<i64>,
) -> Result<(), GatewayError> {
    conn.execute(
        "UPDATE pending_requests SET message_id = ?1, chat_id = ?2 WHERE request_id = ?3",
        params![message_id, chat_id, request_id],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, request_id: &str) -> Result<Option<PendingRecord>, GatewayError> {
    conn.query_row(
        "SELECT * FROM pending_requests WHERE request_id = ?1",
        params![request_id],
        row_to_record,
    )
    .optional()
    .map_err(GatewayError::from)
}

/// Enqueue a result on an existing record — used when an `ask` is resolved
/// while the agent is offline.
pub fn set_result(conn: &Connection, request_id: &str, result: &Value) -> Result<(), GatewayError> {
    conn.execute(
        "UPDATE pending_requests SET result = ?1 WHERE request_id = ?2",
        params![result.to_string(), request_id],
    )?;
    Ok(())
}

/// Return and delete every record with a non-null `result` column.
pub fn drain_results_for_agent(conn: &Connection) -> Result<Vec<(String, Value)>, GatewayError> {
    let mut stmt = conn.prepare(
        "SELECT request_id, result FROM pending_requests WHERE result IS NOT NULL",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut drained = Vec::with_capacity(rows.len());
    for (request_id, result_text) in rows {
        conn.execute(
            "DELETE FROM pending_requests WHERE request_id = ?1",
            params![request_id],
        )?;
        let value = serde_json::from_str(&result_text).unwrap_or(Value::Null);
        drained.push((request_id, value));
    }
    Ok(drained)
}

pub fn delete(conn: &Connection, request_id: &str) -> Result<(), GatewayError> {
    conn.execute("DELETE FROM pending_requests WHERE request_id = ?1", params![request_id])?;
    Ok(())
}

/// Delete and return every record whose `expires_at` is in the past.
pub fn cleanup_stale(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<PendingRecord>, GatewayError> {
    let mut stmt = conn.prepare("SELECT * FROM pending_requests WHERE expires_at < ?1")?;
    let stale: Vec<PendingRecord> = stmt
        .query_map(params![now.to_rfc3339()], row_to_record)?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    for record in &stale {
        conn.execute(
            "DELETE FROM pending_requests WHERE request_id = ?1",
            params![record.request_id],
        )?;
    }
    Ok(stale)
}
