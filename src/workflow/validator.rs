//! Workflow Validation
//!
//! Turns raw workflow text into a typed [`WorkflowDefinition`] or a
//! structured list of violations. Checks run in a fixed order:
//!
//! 1. YAML syntax
//! 2. Schema conformance (required fields, enums, field types)
//! 3. Semantic rules the schema cannot express (unique step ids,
//!    complete in-range policies on agent steps, diff source references)
//!
//! Validation is deterministic and side-effect-free: it never touches
//! the filesystem and never returns a partially valid workflow.

use std::collections::HashSet;

use log::{debug, info};

use super::model::{
    Policy, StepDefinition, StepKind, WorkflowDefinition, SUPPORTED_SCHEMA_VERSION, TIMEOUT_RANGE,
};

/// A single validation failure, anchored to where it occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Where the problem is (a step id, or a line/column for syntax errors)
    pub location: String,
    /// What is wrong
    pub message: String,
}

impl Violation {
    fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Validates raw workflow text.
///
/// Returns the typed definition, or every violation found. Semantic
/// checks only run once the schema checks pass, so a violation list is
/// either purely syntactic/schematic or purely semantic.
pub fn validate(text: &str) -> Result<WorkflowDefinition, Vec<Violation>> {
    // Stage 1: syntax
    if let Err(e) = serde_yaml::from_str::<serde_yaml::Value>(text) {
        return Err(vec![syntax_violation(&e, "invalid YAML")]);
    }

    // Stage 2: schema conformance
    let workflow: WorkflowDefinition = match serde_yaml::from_str(text) {
        Ok(workflow) => workflow,
        Err(e) => return Err(vec![syntax_violation(&e, "schema violation")]),
    };

    // Stage 3: semantic rules
    let violations = semantic_violations(&workflow);
    if !violations.is_empty() {
        debug!("Validation found {} semantic violation(s)", violations.len());
        return Err(violations);
    }

    info!(
        "Workflow '{}' validated: {} steps",
        workflow.name,
        workflow.steps.len()
    );
    Ok(workflow)
}

/// Maps a serde_yaml error to a violation with a line/column location.
fn syntax_violation(error: &serde_yaml::Error, label: &str) -> Violation {
    let location = error
        .location()
        .map(|loc| format!("line {}, column {}", loc.line(), loc.column()))
        .unwrap_or_else(|| "document".to_string());
    Violation::new(location, format!("{}: {}", label, error))
}

/// Runs all semantic checks against a schema-valid definition.
fn semantic_violations(workflow: &WorkflowDefinition) -> Vec<Violation> {
    let mut violations = Vec::new();

    if workflow.schema_version != SUPPORTED_SCHEMA_VERSION {
        violations.push(Violation::new(
            "workflow",
            format!(
                "unsupported schema_version '{}' (supported: '{}')",
                workflow.schema_version, SUPPORTED_SCHEMA_VERSION
            ),
        ));
    }

    if workflow.name.trim().is_empty() {
        violations.push(Violation::new("workflow", "name must not be empty"));
    }

    if workflow.steps.is_empty() {
        violations.push(Violation::new("workflow", "workflow has no steps"));
        return violations;
    }

    // Unique, non-empty step ids
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        let id = step.id();
        if id.trim().is_empty() {
            violations.push(Violation::new("steps", "a step has an empty id"));
        } else if !seen_ids.insert(id) {
            violations.push(Violation::new(
                format!("step '{}'", id),
                "duplicate step id",
            ));
        }
    }

    for (index, step) in workflow.steps.iter().enumerate() {
        violations.extend(validate_step(workflow, index, step));
    }

    violations
}

/// Validates a single step's type-specific rules.
fn validate_step(
    workflow: &WorkflowDefinition,
    index: usize,
    step: &StepDefinition,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let location = format!("step '{}'", step.id());

    match step {
        StepDefinition::Prompt { prompt, .. } => {
            if prompt.trim().is_empty() {
                violations.push(Violation::new(location, "prompt must not be empty"));
            }
        }

        StepDefinition::Agent { prompt, policy, .. } => {
            if prompt.trim().is_empty() {
                violations.push(Violation::new(location.clone(), "prompt must not be empty"));
            }
            match policy {
                None => violations.push(Violation::new(
                    location,
                    "agent step is missing the mandatory policy",
                )),
                Some(policy) => violations.extend(validate_policy(&location, policy)),
            }
        }

        StepDefinition::Command {
            command,
            timeout_seconds,
            ..
        } => {
            if command.trim().is_empty() {
                violations.push(Violation::new(location.clone(), "command must not be empty"));
            }
            if let Some(timeout) = timeout_seconds {
                let (lo, hi) = TIMEOUT_RANGE;
                if *timeout < lo || *timeout > hi {
                    violations.push(Violation::new(
                        location,
                        format!(
                            "timeout_seconds must be within {}..={}, got {}",
                            lo, hi, timeout
                        ),
                    ));
                }
            }
        }

        StepDefinition::ApplyDiff { source_step, .. } => {
            match workflow.step_index(source_step) {
                None => violations.push(Violation::new(
                    location,
                    format!("source_step '{}' does not exist", source_step),
                )),
                Some(source_index) => {
                    let source = &workflow.steps[source_index];
                    if source.kind() != StepKind::Agent {
                        violations.push(Violation::new(
                            location,
                            format!(
                                "source_step '{}' is a {} step, not an agent step",
                                source_step,
                                source.kind()
                            ),
                        ));
                    } else if source_index >= index {
                        violations.push(Violation::new(
                            location,
                            format!(
                                "source_step '{}' must come before this step",
                                source_step
                            ),
                        ));
                    }
                }
            }
        }

        StepDefinition::Custom { handler, .. } => {
            if handler.trim().is_empty() {
                violations.push(Violation::new(location, "handler must not be empty"));
            }
        }
    }

    violations
}

/// Checks an agent step's policy for completeness and range.
///
/// Completeness is enforced here, as a semantic rule, so that authors
/// cannot silently omit security constraints: each missing subfield
/// produces a violation naming the step.
fn validate_policy(location: &str, policy: &Policy) -> Vec<Violation> {
    let mut violations = Vec::new();

    for field in policy.missing_fields() {
        violations.push(Violation::new(
            location.to_string(),
            format!("policy is missing required field '{}'", field),
        ));
    }

    for message in policy.range_violations() {
        violations.push(Violation::new(location.to_string(), format!("policy: {}", message)));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
schema_version: "1"
name: demo
model_identifier: test-model
steps:
  - id: gather
    type: command
    command: echo hello
  - id: fix
    type: agent
    prompt: Fix the bug.
    policy:
      timeout_seconds: 120
      max_files: 10
      max_edits: 3
      allowed_paths: ["src/**"]
      command_allowlist: ["cargo"]
  - id: apply
    type: apply_diff
    source_step: fix
    approve: true
"#;

    #[test]
    fn test_valid_workflow() {
        let workflow = validate(VALID).unwrap();
        assert_eq!(workflow.steps.len(), 3);
        assert_eq!(workflow.name, "demo");
    }

    #[test]
    fn test_invalid_yaml_syntax() {
        let violations = validate("steps: [[[").unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("invalid YAML"));
    }

    #[test]
    fn test_schema_missing_required_field() {
        // No model_identifier
        let text = r#"
schema_version: "1"
name: demo
steps:
  - id: one
    type: command
    command: echo hi
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations[0].message.contains("schema violation"));
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: one
    type: teleport
    command: echo hi
"#;
        assert!(validate(text).is_err());
    }

    #[test]
    fn test_empty_steps() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps: []
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations.iter().any(|v| v.message.contains("no steps")));
    }

    #[test]
    fn test_duplicate_step_ids() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: same
    type: command
    command: echo one
  - id: same
    type: command
    command: echo two
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.location == "step 'same'" && v.message.contains("duplicate")));
    }

    #[test]
    fn test_unsupported_schema_version() {
        let text = r#"
schema_version: "99"
name: demo
model_identifier: m
steps:
  - id: one
    type: command
    command: echo hi
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations[0].message.contains("unsupported schema_version"));
    }

    #[test]
    fn test_agent_step_without_policy() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: risky
    type: agent
    prompt: do things
"#;
        let violations = validate(text).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].location, "step 'risky'");
        assert!(violations[0].message.contains("missing the mandatory policy"));
    }

    #[test]
    fn test_agent_policy_missing_subfield_names_step() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: risky
    type: agent
    prompt: do things
    policy:
      timeout_seconds: 60
      max_files: 5
      max_edits: 2
      allowed_paths: ["src/**"]
"#;
        let violations = validate(text).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].location, "step 'risky'");
        assert!(violations[0].message.contains("command_allowlist"));
    }

    #[test]
    fn test_agent_policy_out_of_range() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: risky
    type: agent
    prompt: do things
    policy:
      timeout_seconds: 9999
      max_files: 5
      max_edits: 2
      allowed_paths: []
      command_allowlist: []
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.message.contains("timeout_seconds must be within")));
    }

    #[test]
    fn test_apply_diff_unknown_source() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: apply
    type: apply_diff
    source_step: ghost
    approve: true
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.message.contains("'ghost' does not exist")));
    }

    #[test]
    fn test_apply_diff_source_must_be_earlier_agent_step() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: apply
    type: apply_diff
    source_step: fix
    approve: true
  - id: fix
    type: agent
    prompt: fix it
    policy:
      timeout_seconds: 60
      max_files: 5
      max_edits: 2
      allowed_paths: ["src/**"]
      command_allowlist: []
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.message.contains("must come before")));
    }

    #[test]
    fn test_apply_diff_source_wrong_type() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: gather
    type: command
    command: echo hi
  - id: apply
    type: apply_diff
    source_step: gather
    approve: true
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.message.contains("not an agent step")));
    }

    #[test]
    fn test_command_timeout_range() {
        let text = r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: slow
    type: command
    command: sleep 1
    timeout_seconds: 0
"#;
        let violations = validate(text).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.message.contains("timeout_seconds must be within")));
    }

    #[test]
    fn test_validate_is_deterministic() {
        let first = validate(VALID).unwrap();
        let second = validate(VALID).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
