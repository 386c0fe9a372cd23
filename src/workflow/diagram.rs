//! Workflow Diagram Generation
//!
//! Pure, read-only rendering of a workflow's step graph as Mermaid
//! flowchart text. Nodes are steps annotated with their type; edges
//! follow the declared sequential order. Depends only on the
//! definition, never on run state.

use super::model::WorkflowDefinition;

/// Renders a workflow as a Mermaid flowchart.
///
/// ```text
/// flowchart TD
///     s0["gather (command)"]
///     s1["fix (agent)"]
///     s0 --> s1
/// ```
pub fn render(workflow: &WorkflowDefinition) -> String {
    let mut out = String::from("flowchart TD\n");

    for (index, step) in workflow.steps.iter().enumerate() {
        out.push_str(&format!(
            "    s{}[\"{} ({})\"]\n",
            index,
            sanitize(step.id()),
            step.kind()
        ));
    }

    for index in 1..workflow.steps.len() {
        out.push_str(&format!("    s{} --> s{}\n", index - 1, index));
    }

    out
}

/// Strips characters that would break a Mermaid node label.
fn sanitize(label: &str) -> String {
    label.replace(['"', '[', ']'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::validator::validate;

    fn three_step_workflow() -> WorkflowDefinition {
        validate(
            r#"
schema_version: "1"
name: demo
model_identifier: m
steps:
  - id: gather
    type: command
    command: echo hi
  - id: fix
    type: agent
    prompt: fix it
    policy:
      timeout_seconds: 60
      max_files: 5
      max_edits: 2
      allowed_paths: ["src/**"]
      command_allowlist: []
  - id: apply
    type: apply_diff
    source_step: fix
    approve: true
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_three_nodes_two_edges() {
        let diagram = render(&three_step_workflow());

        let nodes = diagram.lines().filter(|l| l.contains('[')).count();
        let edges = diagram.lines().filter(|l| l.contains("-->")).count();
        assert_eq!(nodes, 3);
        assert_eq!(edges, 2);
    }

    #[test]
    fn test_nodes_carry_type_annotation() {
        let diagram = render(&three_step_workflow());

        assert!(diagram.contains("gather (command)"));
        assert!(diagram.contains("fix (agent)"));
        assert!(diagram.contains("apply (apply_diff)"));
    }

    #[test]
    fn test_edges_follow_declared_order() {
        let diagram = render(&three_step_workflow());

        assert!(diagram.contains("s0 --> s1"));
        assert!(diagram.contains("s1 --> s2"));
    }

    #[test]
    fn test_sanitize_labels() {
        assert_eq!(sanitize(r#"we"ird[id]"#), "we_ird_id_");
    }
}
