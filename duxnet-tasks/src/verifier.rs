//! C12 — Result Verifier.
//!
//! Pure, side-effect-free checks run against a completed [`TaskResult`]
//! before the orchestrator (C13) decides whether to release or refund
//! the backing escrow. Never touches the chain, the registry, or
//! escrow state directly.

use crate::task::TaskResult;
use duxnet_core::{sorted_json_hash, TaskId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Array,
    Object,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// Per-task custom rule, keyed by `task_id` in the [`ResultVerifier`]'s
/// rule registry (§4.9).
#[derive(Debug, Clone)]
pub enum VerificationRule {
    /// Expected-hash equality against a rule-supplied hash rather than
    /// the result's own `result_hash` field (e.g. a precomputed golden
    /// output).
    Hash { expected_hash: String },
    /// Required fields, each with a declared primitive type.
    Format { required_fields: Vec<(String, FieldType)> },
    /// Numeric bounds (inclusive) on a named field.
    Range { field: String, min: f64, max: f64 },
    /// Dispatches to a rule registered under `name` via
    /// [`ResultVerifier::register_custom_rule`].
    Custom { name: String },
}

/// A pluggable `custom` rule implementation.
pub trait CustomRule: Send + Sync {
    fn check(&self, output: &serde_json::Map<String, Value>) -> Result<(), String>;
}

/// A service-specific hook, dispatched by `service_name`, run after the
/// hash check and before any per-task custom rules.
pub trait ServiceHook: Send + Sync {
    fn check(&self, output: &serde_json::Map<String, Value>) -> Result<(), String>;
}

/// The stage a verification failed at, plus the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationFailure {
    pub stage: &'static str,
    pub reason: String,
}

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.reason)
    }
}

/// Running verification counters, mirroring the operational snapshot the
/// original `ResultVerifier` exposed via `get_verification_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationStats {
    pub total_verifications: u64,
    pub successful_verifications: u64,
    pub failed_verifications: u64,
}

impl VerificationStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_verifications == 0 {
            0.0
        } else {
            self.successful_verifications as f64 / self.total_verifications as f64
        }
    }
}

#[derive(Default)]
pub struct ResultVerifier {
    service_hooks: HashMap<String, Arc<dyn ServiceHook>>,
    custom_rules: HashMap<String, Arc<dyn CustomRule>>,
    task_rules: RwLock<HashMap<TaskId, Vec<VerificationRule>>>,
    stats: Mutex<VerificationStats>,
}

impl ResultVerifier {
    pub fn new() -> Self {
        Self {
            service_hooks: HashMap::new(),
            custom_rules: HashMap::new(),
            task_rules: RwLock::new(HashMap::new()),
            stats: Mutex::new(VerificationStats::default()),
        }
    }

    pub fn stats(&self) -> VerificationStats {
        *self.stats.lock()
    }

    pub fn register_service_hook(&mut self, service_name: impl Into<String>, hook: Arc<dyn ServiceHook>) {
        self.service_hooks.insert(service_name.into(), hook);
    }

    pub fn register_custom_rule(&mut self, name: impl Into<String>, rule: Arc<dyn CustomRule>) {
        self.custom_rules.insert(name.into(), rule);
    }

    pub fn set_task_rules(&self, task_id: TaskId, rules: Vec<VerificationRule>) {
        self.task_rules.write().insert(task_id, rules);
    }

    pub fn clear_task_rules(&self, task_id: TaskId) {
        self.task_rules.write().remove(&task_id);
    }

    /// Runs the ordered checks from §4.9 and returns the first failure
    /// encountered, if any.
    pub fn verify(&self, service_name: &str, result: &TaskResult) -> Result<(), VerificationFailure> {
        let outcome = self.verify_inner(service_name, result);
        let mut stats = self.stats.lock();
        stats.total_verifications += 1;
        if outcome.is_ok() {
            stats.successful_verifications += 1;
        } else {
            stats.failed_verifications += 1;
        }
        outcome
    }

    fn verify_inner(&self, service_name: &str, result: &TaskResult) -> Result<(), VerificationFailure> {
        if result.output_data.is_empty() {
            return Err(VerificationFailure {
                stage: "presence",
                reason: "output_data is empty".into(),
            });
        }
        if result.execution_time_seconds < 0.0 {
            return Err(VerificationFailure {
                stage: "presence",
                reason: "execution_time_seconds is negative".into(),
            });
        }

        let recomputed = sorted_json_hash(&Value::Object(result.output_data.clone()));
        if recomputed != result.result_hash {
            return Err(VerificationFailure {
                stage: "hash",
                reason: format!("recomputed hash {recomputed} does not match stored result_hash {}", result.result_hash),
            });
        }

        if let Some(hook) = self.service_hooks.get(service_name) {
            hook.check(&result.output_data).map_err(|reason| VerificationFailure { stage: "service_hook", reason })?;
        }

        let rules = self.task_rules.read().get(&result.task_id).cloned().unwrap_or_default();
        for rule in &rules {
            self.apply_rule(rule, &result.output_data)?;
        }

        Ok(())
    }

    fn apply_rule(&self, rule: &VerificationRule, output: &serde_json::Map<String, Value>) -> Result<(), VerificationFailure> {
        match rule {
            VerificationRule::Hash { expected_hash } => {
                let h = sorted_json_hash(&Value::Object(output.clone()));
                if &h != expected_hash {
                    return Err(VerificationFailure {
                        stage: "rule:hash",
                        reason: format!("hash {h} does not match expected {expected_hash}"),
                    });
                }
                Ok(())
            }
            VerificationRule::Format { required_fields } => {
                for (field, field_type) in required_fields {
                    let value = output.get(field).ok_or_else(|| VerificationFailure {
                        stage: "rule:format",
                        reason: format!("missing required field `{field}`"),
                    })?;
                    if !field_type.matches(value) {
                        return Err(VerificationFailure {
                            stage: "rule:format",
                            reason: format!("field `{field}` is not a {field_type:?}"),
                        });
                    }
                }
                Ok(())
            }
            VerificationRule::Range { field, min, max } => {
                let value = output
                    .get(field)
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| VerificationFailure {
                        stage: "rule:range",
                        reason: format!("field `{field}` is missing or not numeric"),
                    })?;
                if value < *min || value > *max {
                    return Err(VerificationFailure {
                        stage: "rule:range",
                        reason: format!("field `{field}` = {value} is outside [{min}, {max}]"),
                    });
                }
                Ok(())
            }
            VerificationRule::Custom { name } => {
                let rule = self.custom_rules.get(name).ok_or_else(|| VerificationFailure {
                    stage: "rule:custom",
                    reason: format!("no custom rule registered under `{name}`"),
                })?;
                rule.check(output).map_err(|reason| VerificationFailure { stage: "rule:custom", reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use duxnet_core::now;
    use uuid::Uuid;

    fn result_for(output: serde_json::Map<String, Value>) -> TaskResult {
        let hash = sorted_json_hash(&Value::Object(output.clone()));
        TaskResult {
            task_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            status: TaskStatus::Completed,
            output_data: output,
            error_message: None,
            execution_time_seconds: 1.5,
            memory_used_mb: 64,
            cpu_usage_percent: 12.0,
            result_hash: hash,
            signature: None,
            verified: false,
            created_at: now(),
        }
    }

    #[test]
    fn rejects_empty_output() {
        let verifier = ResultVerifier::new();
        let result = result_for(serde_json::Map::new());
        let err = verifier.verify("svc", &result).unwrap_err();
        assert_eq!(err.stage, "presence");
    }

    #[test]
    fn rejects_hash_mismatch() {
        let verifier = ResultVerifier::new();
        let mut output = serde_json::Map::new();
        output.insert("x".into(), serde_json::json!(1));
        let mut result = result_for(output);
        result.result_hash = "0".repeat(64);
        let err = verifier.verify("svc", &result).unwrap_err();
        assert_eq!(err.stage, "hash");
    }

    #[test]
    fn accepts_matching_hash_with_no_rules() {
        let verifier = ResultVerifier::new();
        let mut output = serde_json::Map::new();
        output.insert("x".into(), serde_json::json!(1));
        let result = result_for(output);
        assert!(verifier.verify("svc", &result).is_ok());
    }

    struct RejectAll;
    impl ServiceHook for RejectAll {
        fn check(&self, _output: &serde_json::Map<String, Value>) -> Result<(), String> {
            Err("service hook always rejects".into())
        }
    }

    #[test]
    fn service_hook_can_reject() {
        let mut verifier = ResultVerifier::new();
        verifier.register_service_hook("svc", Arc::new(RejectAll));
        let mut output = serde_json::Map::new();
        output.insert("x".into(), serde_json::json!(1));
        let result = result_for(output);
        let err = verifier.verify("svc", &result).unwrap_err();
        assert_eq!(err.stage, "service_hook");
    }

    #[test]
    fn format_rule_checks_field_presence_and_type() {
        let verifier = ResultVerifier::new();
        let mut output = serde_json::Map::new();
        output.insert("score".into(), serde_json::json!("not a number"));
        let result = result_for(output);
        verifier.set_task_rules(
            result.task_id,
            vec![VerificationRule::Format {
                required_fields: vec![("score".into(), FieldType::Number)],
            }],
        );
        let err = verifier.verify("svc", &result).unwrap_err();
        assert_eq!(err.stage, "rule:format");
    }

    #[test]
    fn range_rule_enforces_bounds() {
        let verifier = ResultVerifier::new();
        let mut output = serde_json::Map::new();
        output.insert("score".into(), serde_json::json!(120));
        let result = result_for(output);
        verifier.set_task_rules(
            result.task_id,
            vec![VerificationRule::Range { field: "score".into(), min: 0.0, max: 100.0 }],
        );
        let err = verifier.verify("svc", &result).unwrap_err();
        assert_eq!(err.stage, "rule:range");
    }

    struct EvenOnly;
    impl CustomRule for EvenOnly {
        fn check(&self, output: &serde_json::Map<String, Value>) -> Result<(), String> {
            let n = output.get("n").and_then(|v| v.as_i64()).ok_or("missing n")?;
            if n % 2 == 0 {
                Ok(())
            } else {
                Err("n is not even".into())
            }
        }
    }

    #[test]
    fn stats_accumulate_across_verifications() {
        let verifier = ResultVerifier::new();
        let mut ok_output = serde_json::Map::new();
        ok_output.insert("x".into(), serde_json::json!(1));
        let ok_result = result_for(ok_output);
        assert!(verifier.verify("svc", &ok_result).is_ok());

        let bad_result = result_for(serde_json::Map::new());
        assert!(verifier.verify("svc", &bad_result).is_err());

        let stats = verifier.stats();
        assert_eq!(stats.total_verifications, 2);
        assert_eq!(stats.successful_verifications, 1);
        assert_eq!(stats.failed_verifications, 1);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn custom_rule_dispatches_by_name() {
        let mut verifier = ResultVerifier::new();
        verifier.register_custom_rule("even", Arc::new(EvenOnly));
        let mut output = serde_json::Map::new();
        output.insert("n".into(), serde_json::json!(3));
        let result = result_for(output);
        verifier.set_task_rules(result.task_id, vec![VerificationRule::Custom { name: "even".into() }]);
        let err = verifier.verify("svc", &result).unwrap_err();
        assert_eq!(err.stage, "rule:custom");
    }
}
