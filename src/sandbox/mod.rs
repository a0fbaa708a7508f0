//! Static validation of untrusted plans.
//!
//! The sandbox is pure — no I/O, no clocks — and its verdict fully
//! determines executability: a plan with violations never reaches the
//! engine. Three rule families apply:
//!
//! 1. **Forbidden skills**: identifiers on the deny-list are part of
//!    the security contract and matched exactly.
//! 2. **Injection detection**: every string input value is scanned
//!    against the marker table in [`patterns`]. Whole-string step
//!    references (`${step.path}`) are the workflow's own dataflow and
//!    are exempt; everything else containing template syntax is not.
//! 3. **Idempotency**: write-shaped steps (HTTP POST/PUT/DELETE,
//!    write-category DB/filesystem skills) must carry a non-empty
//!    idempotency key.

pub mod patterns;

use serde_json::Value;

use crate::reference::parse_reference;
use crate::spec::{StepDescriptor, WorkflowSpec};

use patterns::{InjectionMarker, builtin_markers};

/// Skill identifiers that never execute, checked by exact match.
pub const FORBIDDEN_SKILLS: &[&str] = &[
    "shell_exec",
    "os_command",
    "db_drop",
    "fs_delete",
    "net_raw",
    "code_eval",
    "syscall",
];

/// Skill-id prefixes that imply an external write.
const WRITE_SKILL_PREFIXES: &[&str] = &["db_write", "db_insert", "db_update", "fs_write", "fs_append"];

/// HTTP methods that imply an external write.
const WRITE_HTTP_METHODS: &[&str] = &["POST", "PUT", "DELETE"];

/// Result of validating a plan. `violations` block execution;
/// `warnings` are advisory.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

/// Static plan validator.
///
/// Construction compiles nothing today (markers are literal), but the
/// type exists so deployments can extend the deny-list without
/// touching call sites.
pub struct PlanSandbox {
    forbidden: Vec<String>,
    markers: &'static [InjectionMarker],
}

impl Default for PlanSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanSandbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            forbidden: FORBIDDEN_SKILLS.iter().map(|s| (*s).to_string()).collect(),
            markers: builtin_markers(),
        }
    }

    /// Extend the deny-list with deployment-specific identifiers.
    #[must_use]
    pub fn with_forbidden<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden.extend(extra.into_iter().map(Into::into));
        self
    }

    /// Validate a whole plan. Pure; order of violations follows step
    /// order, so reports are stable.
    #[must_use]
    pub fn validate(&self, spec: &WorkflowSpec) -> ValidationReport {
        let mut report = ValidationReport {
            valid: true,
            violations: Vec::new(),
            warnings: Vec::new(),
        };
        for step in &spec.steps {
            self.check_forbidden(step, &mut report);
            self.check_injection(step, &mut report);
            self.check_idempotency(step, &mut report);
        }
        report.valid = report.violations.is_empty();
        report
    }

    fn check_forbidden(&self, step: &StepDescriptor, report: &mut ValidationReport) {
        if self.forbidden.iter().any(|f| f == &step.skill_id) {
            report.violations.push(format!(
                "step `{}` references forbidden skill `{}`",
                step.step_id, step.skill_id
            ));
        }
    }

    fn check_injection(&self, step: &StepDescriptor, report: &mut ValidationReport) {
        for (input, value) in &step.inputs {
            scan_value(self.markers, &step.step_id, input, value, report);
        }
    }

    fn check_idempotency(&self, step: &StepDescriptor, report: &mut ValidationReport) {
        if !step_is_write_shaped(step) {
            return;
        }
        if step.effective_idempotency_key().is_none() {
            report.violations.push(format!(
                "step `{}` performs an external write via `{}` without a non-empty idempotency_key",
                step.step_id, step.skill_id
            ));
        }
    }
}

fn step_is_write_shaped(step: &StepDescriptor) -> bool {
    if WRITE_SKILL_PREFIXES
        .iter()
        .any(|p| step.skill_id.starts_with(p))
    {
        return true;
    }
    if step.skill_id.starts_with("http") {
        if let Some(Value::String(method)) = step.inputs.get("method") {
            return WRITE_HTTP_METHODS
                .iter()
                .any(|m| method.eq_ignore_ascii_case(m));
        }
    }
    false
}

fn scan_value(
    markers: &[InjectionMarker],
    step_id: &str,
    input: &str,
    value: &Value,
    report: &mut ValidationReport,
) {
    match value {
        Value::String(s) => {
            // A whole-string step reference is dataflow, not payload.
            if parse_reference(s).is_some() {
                return;
            }
            for marker in markers {
                if marker.matches(s) {
                    report.violations.push(format!(
                        "step `{step_id}` input `{input}` matches {} marker {} ({})",
                        marker.category, marker.id, marker.description
                    ));
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_value(markers, step_id, input, item, report);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                scan_value(markers, step_id, input, v, report);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forbidden_skill_is_named_in_violation() {
        let spec = WorkflowSpec::new("wf").with_step(StepDescriptor::new("a", "shell_exec"));
        let report = PlanSandbox::new().validate(&spec);
        assert!(!report.valid);
        assert!(report.violations[0].contains("shell_exec"));
    }

    #[test]
    fn shell_injection_in_inputs_is_a_violation() {
        let spec = WorkflowSpec::new("wf").with_step(
            StepDescriptor::new("a", "echo").with_input("cmd", json!("ls ; rm -rf /")),
        );
        let report = PlanSandbox::new().validate(&spec);
        assert!(!report.valid);
    }

    #[test]
    fn step_references_are_exempt_from_template_rule() {
        let spec = WorkflowSpec::new("wf")
            .with_step(StepDescriptor::new("a", "echo").with_input("v", json!(1)))
            .with_step(
                StepDescriptor::new("b", "echo")
                    .with_input("v", json!("${a.v}"))
                    .with_depends_on(["a"]),
            );
        let report = PlanSandbox::new().validate(&spec);
        assert!(report.valid, "violations: {:?}", report.violations);
    }

    #[test]
    fn embedded_template_syntax_is_flagged() {
        let spec = WorkflowSpec::new("wf").with_step(
            StepDescriptor::new("a", "echo").with_input("v", json!("hello ${oops}")),
        );
        let report = PlanSandbox::new().validate(&spec);
        assert!(!report.valid);
    }

    #[test]
    fn http_write_requires_idempotency_key() {
        let bare = WorkflowSpec::new("wf").with_step(
            StepDescriptor::new("a", "http_request")
                .with_input("method", json!("POST"))
                .with_input("url", json!("https://api.example.com/orders")),
        );
        assert!(!PlanSandbox::new().validate(&bare).valid);

        let keyed = WorkflowSpec::new("wf").with_step(
            StepDescriptor::new("a", "http_request")
                .with_input("method", json!("POST"))
                .with_input("url", json!("https://api.example.com/orders"))
                .with_idempotency_key("order-42"),
        );
        assert!(PlanSandbox::new().validate(&keyed).valid);
    }
}
