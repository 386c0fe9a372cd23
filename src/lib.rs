//! AgentFlow - Workflow Execution Engine for Coding Agents
//!
//! Interprets declarative, versioned workflow definitions and drives a
//! bounded set of step types against an external coding-agent
//! subprocess, enforcing a least-privilege execution policy, producing
//! an auditable artifact trail, and supporting deterministic resume
//! after partial failure.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Definition model, YAML parsing, validation, diagrams
//! - [`execution`]: Serial execution engine, run state, step executors
//! - [`policy`]: Least-privilege enforcement for agent steps
//! - [`artifact`]: Run-scoped persistence and credential redaction
//!
//! # Example
//!
//! ```rust,no_run
//! use agentflow::execution::{RunOptions, WorkflowRunner};
//! use agentflow::workflow::load_definition;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load and validate a workflow from YAML
//!     let workflow = load_definition("workflow.yaml")?;
//!
//!     // Execute it
//!     let runner = WorkflowRunner::new();
//!     let outcome = runner.run(workflow, &RunOptions::default())?;
//!
//!     println!("run {} finished: {:?}", outcome.run_id, outcome.status);
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod execution;
pub mod policy;
pub mod workflow;

// Re-export commonly used types
pub use execution::runner::WorkflowRunner;
pub use execution::state::{RunState, StepResult};
pub use policy::enforcer::PolicyEnforcer;
pub use workflow::model::{Policy, StepDefinition, WorkflowDefinition};
pub use workflow::parser::load_definition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "AgentFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "AgentFlow");
    }

    #[test]
    fn test_module_exports_validate() {
        let result = workflow::validate("nonsense: [");
        assert!(result.is_err());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
