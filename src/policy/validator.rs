//! Argument validator (§4.B). Pure function, no side effects: rejects
//! signature-injection characters and enforces identifier shape for
//! reserved-namespace keys, strictly before a signature is ever built.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::GatewayError;

/// Characters that would let a string argument forge glob metacharacters
/// or a tool-boundary delimiter in the signature it ends up embedded in,
/// plus raw control characters.
fn has_forbidden_char(s: &str) -> bool {
    s.chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '(' | ')' | ',') || (c as u32) < 0x20)
}

/// Namespace prefixes whose identifier-shaped keys are validated against
/// [`is_valid_identifier`]. Keyed by (tool-name prefix, key names).
const RESERVED_NAMESPACES: &[(&str, &[&str])] =
    &[("ha_", &["entity_id", "domain", "service", "event_type"])];

/// `^[a-z_][a-z0-9_]*(\.[a-z0-9_]+)?$`
fn is_valid_identifier(s: &str) -> bool {
    let (head, tail) = match s.split_once('.') {
        Some((h, t)) => (h, Some(t)),
        None => (s, None),
    };

    let head_ok = {
        let mut chars = head.chars();
        match chars.next() {
            Some(c) if c == '_' || c.is_ascii_lowercase() => {
                chars.all(|c| c == '_' || c.is_ascii_lowercase() || c.is_ascii_digit())
            }
            _ => false,
        }
    };
    if !head_ok {
        return false;
    }

    match tail {
        None => true,
        Some(t) if !t.is_empty() => {
            t.chars().all(|c| c == '_' || c.is_ascii_lowercase() || c.is_ascii_digit())
        }
        Some(_) => false,
    }
}

/// Validate every string-valued argument for `tool`. Non-string values
/// (numbers, bools, nested structures) pass through untouched.
pub fn validate_args(tool: &str, args: &BTreeMap<String, Value>) -> Result<(), GatewayError> {
    let reserved = RESERVED_NAMESPACES
        .iter()
        .find(|(prefix, _)| tool.starts_with(prefix));

    for (key, value) in args {
        let Value::String(s) = value else { continue };

        if has_forbidden_char(s) {
            return Err(GatewayError::InvalidArgument);
        }

        if let Some((_, identifier_keys)) = reserved {
            if identifier_keys.contains(&key.as_str()) && !is_valid_identifier(s) {
                return Err(GatewayError::InvalidArgument);
            }
        }
    }

    Ok(())
}
