//! Permission engine (§4.D): three-pass rule scan (deny → allow → ask),
//! then defaults (first match), then fallback to `Ask`. Deny always wins,
//! irrespective of specificity or declaration order relative to other
//! actions — that precedence is the entire security posture of the
//! system, so it is structural here (three separate passes) rather than
//! something a single combined scan could get subtly wrong.
//!
//! Never performs network or disk I/O (invariant 6, §8): it is a pure
//! function of a compiled policy and a `(tool, args)` pair.

use std::collections::BTreeMap;

use glob::Pattern;
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::Decision;

use super::rules::Permissions;
use super::signature::build_signature;
use super::validator::validate_args;

struct CompiledRule {
    pattern: Pattern,
    action: Decision,
}

/// A [`Permissions`] document with every glob pre-compiled, so evaluation
/// is O(rules) per pass with no per-match parsing cost.
pub struct PermissionEngine {
    defaults: Vec<CompiledRule>,
    rules: Vec<CompiledRule>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: Decision,
    pub signature: String,
}

impl PermissionEngine {
    pub fn compile(policy: &Permissions) -> Result<Self, GatewayError> {
        let compile_all = |rules: &[super::rules::PermissionRule]| -> Result<Vec<CompiledRule>, GatewayError> {
            rules
                .iter()
                .map(|r| {
                    Pattern::new(&r.pattern)
                        .map(|pattern| CompiledRule { pattern, action: r.action })
                        .map_err(|e| {
                            GatewayError::Config(format!(
                                "invalid policy pattern {:?}: {e}",
                                r.pattern
                            ))
                        })
                })
                .collect()
        };

        Ok(Self {
            defaults: compile_all(&policy.defaults)?,
            rules: compile_all(&policy.rules)?,
        })
    }

    /// Evaluate a request: validate arguments, build the signature, then
    /// decide. Propagates `InvalidArgument` rather than swallowing it —
    /// the caller (orchestrator) must still audit and reply, but no
    /// signature is ever constructed from unvalidated input.
    pub fn evaluate(
        &self,
        tool: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Evaluation, GatewayError> {
        validate_args(tool, args)?;
        let signature = build_signature(tool, args);
        let decision = self.decide(&signature);
        Ok(Evaluation { decision, signature })
    }

    fn decide(&self, signature: &str) -> Decision {
        if self.rules.iter().any(|r| r.action == Decision::Deny && r.pattern.matches(signature)) {
            return Decision::Deny;
        }
        if self.rules.iter().any(|r| r.action == Decision::Allow && r.pattern.matches(signature)) {
            return Decision::Allow;
        }
        if self.rules.iter().any(|r| r.action == Decision::Ask && r.pattern.matches(signature)) {
            return Decision::Ask;
        }
        if let Some(rule) = self.defaults.iter().find(|r| r.pattern.matches(signature)) {
            return rule.action;
        }
        Decision::Ask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::PermissionRule;
    use serde_json::json;

    fn rule(pattern: &str, action: Decision) -> PermissionRule {
        PermissionRule { pattern: pattern.to_string(), action, description: String::new() }
    }

    fn args(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn deny_wins_over_more_specific_allow() {
        let policy = Permissions {
            defaults: vec![],
            rules: vec![
                rule("ha_call_service(lock.*)", Decision::Deny),
                rule("ha_call_service(lock.front_door)", Decision::Allow),
            ],
        };
        let engine = PermissionEngine::compile(&policy).unwrap();
        let a = args(&[
            ("domain", json!("lock")),
            ("service", json!("unlock")),
            ("entity_id", json!("lock.front_door")),
        ]);
        let eval = engine.evaluate("ha_call_service", &a).unwrap();
        assert_eq!(eval.decision, Decision::Deny);
    }

    #[test]
    fn auto_allow_via_defaults() {
        let policy = Permissions {
            defaults: vec![rule("ha_get_*", Decision::Allow)],
            rules: vec![],
        };
        let engine = PermissionEngine::compile(&policy).unwrap();
        let a = args(&[("entity_id", json!("sensor.temp"))]);
        let eval = engine.evaluate("ha_get_state", &a).unwrap();
        assert_eq!(eval.decision, Decision::Allow);
    }

    #[test]
    fn unmatched_falls_back_to_ask() {
        let engine = PermissionEngine::compile(&Permissions::default()).unwrap();
        let eval = engine.evaluate("ha_get_states", &BTreeMap::new()).unwrap();
        assert_eq!(eval.decision, Decision::Ask);
    }

    #[test]
    fn invalid_argument_is_propagated_before_signature_construction() {
        let engine = PermissionEngine::compile(&Permissions::default()).unwrap();
        let a = args(&[("entity_id", json!("light.*"))]);
        let result = engine.evaluate("ha_get_state", &a);
        assert!(matches!(result, Err(GatewayError::InvalidArgument)));
    }

    #[test]
    fn policy_deny_rule() {
        let policy = Permissions {
            defaults: vec![],
            rules: vec![rule("ha_call_service(lock.*)", Decision::Deny)],
        };
        let engine = PermissionEngine::compile(&policy).unwrap();
        let a = args(&[
            ("domain", json!("lock")),
            ("service", json!("unlock")),
            ("entity_id", json!("lock.front_door")),
        ]);
        assert_eq!(engine.evaluate("ha_call_service", &a).unwrap().decision, Decision::Deny);
    }

    #[test]
    fn defaults_are_first_match_not_deny_priority() {
        // Defaults are a single first-match pass, unlike `rules` — a
        // `deny` default later in the list must NOT override an earlier
        // `allow` default.
        let policy = Permissions {
            defaults: vec![
                rule("ha_get_*", Decision::Allow),
                rule("*", Decision::Deny),
            ],
            rules: vec![],
        };
        let engine = PermissionEngine::compile(&policy).unwrap();
        let eval = engine.evaluate("ha_get_states", &BTreeMap::new()).unwrap();
        assert_eq!(eval.decision, Decision::Allow);
    }

    #[test]
    fn invalid_pattern_fails_compilation() {
        let policy = Permissions {
            defaults: vec![],
            rules: vec![rule("ha_call_service([", Decision::Deny)],
        };
        assert!(PermissionEngine::compile(&policy).is_err());
    }
}
