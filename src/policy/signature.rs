//! Signature builder (§4.C). Deterministic, human-readable canonical
//! string for a `(tool, args)` pair — the permission-matching key and the
//! human-facing description shown in approval prompts.

use std::collections::BTreeMap;

use serde_json::Value;

/// Render a JSON scalar/structure the way it would appear in a signature.
/// Strings are unquoted (the validator has already ruled out anything that
/// would make that ambiguous); everything else uses its JSON text form.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn builder_parts(tool: &str, args: &BTreeMap<String, Value>) -> Vec<String> {
    match tool {
        "ha_call_service" => {
            let domain = args.get("domain").map(render).unwrap_or_default();
            let service = args.get("service").map(render).unwrap_or_default();
            let mut parts = vec![format!("{domain}.{service}")];
            if let Some(entity_id) = args.get("entity_id") {
                parts.push(render(entity_id));
            }
            parts
        }
        "ha_get_state" => args
            .get("entity_id")
            .map(|v| vec![render(v)])
            .unwrap_or_default(),
        "ha_get_states" => Vec::new(),
        "ha_fire_event" => args
            .get("event_type")
            .map(|v| vec![render(v)])
            .unwrap_or_default(),
        _ => {
            // Fallback: sort keys lexicographically — `args` is already a
            // `BTreeMap`, so iteration order is the sort order.
            args.values().map(render).collect()
        }
    }
}

/// Build the canonical `"tool(part, part, ...)"` signature, or bare
/// `"tool"` when there are no parts.
pub fn build_signature(tool: &str, args: &BTreeMap<String, Value>) -> String {
    let parts = builder_parts(tool, args);
    if parts.is_empty() {
        tool.to_string()
    } else {
        format!("{tool}({})", parts.join(", "))
    }
}
