//! Workflow Data Model
//!
//! Core data structures representing a declarative workflow definition
//! and the execution policy attached to agent steps.
//!
//! # Example YAML Format
//!
//! ```yaml
//! schema_version: "1"
//! name: fix-lints
//! model_identifier: ${AGENTFLOW_MODEL}
//! guardrail_ids:
//!   - no-secrets
//! steps:
//!   - id: collect
//!     type: command
//!     command: cat lint-report.txt
//!
//!   - id: fix
//!     type: agent
//!     prompt: Fix every lint named in the report.
//!     policy:
//!       timeout_seconds: 600
//!       max_files: 50
//!       max_edits: 20
//!       allowed_paths: ["src/**"]
//!       command_allowlist: ["cargo"]
//!
//!   - id: apply
//!     type: apply_diff
//!     source_step: fix
//!     approve: true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version this engine understands.
pub const SUPPORTED_SCHEMA_VERSION: &str = "1";

/// Default root directory for run artifacts.
pub const DEFAULT_ARTIFACTS_ROOT: &str = ".agentflow/runs";

/// Allowed range for policy and command timeouts, in seconds.
pub const TIMEOUT_RANGE: (u64, u64) = (1, 3600);

/// Upper bound for `Policy.max_files`.
pub const MAX_FILES_LIMIT: u64 = 1000;

/// Upper bound for `Policy.max_edits`.
pub const MAX_EDITS_LIMIT: u64 = 100;

/// A complete, versioned workflow definition.
///
/// This is the unit the validator produces and the runner snapshots into
/// `RunState`. Field names match the YAML surface one-to-one.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowDefinition {
    /// Definition format version (must be [`SUPPORTED_SCHEMA_VERSION`])
    pub schema_version: String,

    /// Human-readable workflow name
    pub name: String,

    /// Model the agent subprocess should use; may contain `${VAR}` placeholders
    pub model_identifier: String,

    /// Guardrail configuration identifiers forwarded to the agent
    #[serde(default)]
    pub guardrail_ids: Vec<String>,

    /// Extra environment variables for spawned subprocesses
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Workflow-level runtime limits
    #[serde(default)]
    pub runtime_limits: RuntimeLimits,

    /// Ordered list of steps to execute
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Gets a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id() == id)
    }

    /// Gets the positional index of a step by id.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id() == id)
    }
}

/// Workflow-level runtime limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// Soft ceiling on total run time, checked between steps
    #[serde(default = "default_max_total_runtime_seconds")]
    pub max_total_runtime_seconds: u64,

    /// Directory template for run artifacts; may contain `{run_id}`
    #[serde(default = "default_artifacts_dir_template")]
    pub artifacts_dir_template: String,
}

fn default_max_total_runtime_seconds() -> u64 {
    3600
}

fn default_artifacts_dir_template() -> String {
    DEFAULT_ARTIFACTS_ROOT.to_string()
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_total_runtime_seconds: default_max_total_runtime_seconds(),
            artifacts_dir_template: default_artifacts_dir_template(),
        }
    }
}

/// Behavior when a command step exits non-zero.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Halt the run (default)
    #[default]
    Fail,
    /// Record the failure but keep executing later steps
    Continue,
}

/// One declared unit of workflow work, tagged by `type`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDefinition {
    /// Renders a prompt and forwards it to the agent read-only.
    Prompt {
        id: String,
        prompt: String,
        /// Files whose contents are appended to the rendered prompt
        #[serde(default)]
        input_files: Vec<String>,
    },

    /// Drives the external coding agent under a mandatory [`Policy`].
    Agent {
        id: String,
        prompt: String,
        /// Optional only so the validator can name the offending step;
        /// a definition with a missing or partial policy never validates.
        policy: Option<Policy>,
    },

    /// Runs a single allow-listed system command.
    Command {
        id: String,
        command: String,
        #[serde(default)]
        on_error: OnError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },

    /// Applies a diff emitted by a prior agent step's transcript.
    ApplyDiff {
        id: String,
        /// Id of the earlier agent step whose transcript carries the diff
        source_step: String,
        /// Explicit manual gate; `false` blocks execution pending approval
        approve: bool,
    },

    /// Embedder-defined step, dispatched through the executor registry.
    Custom {
        id: String,
        handler: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl StepDefinition {
    /// Returns the step's unique identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::Prompt { id, .. }
            | Self::Agent { id, .. }
            | Self::Command { id, .. }
            | Self::ApplyDiff { id, .. }
            | Self::Custom { id, .. } => id,
        }
    }

    /// Returns the step's type tag.
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Prompt { .. } => StepKind::Prompt,
            Self::Agent { .. } => StepKind::Agent,
            Self::Command { .. } => StepKind::Command,
            Self::ApplyDiff { .. } => StepKind::ApplyDiff,
            Self::Custom { .. } => StepKind::Custom,
        }
    }

    /// Returns the step's error tolerance (only command steps can continue).
    pub fn on_error(&self) -> OnError {
        match self {
            Self::Command { on_error, .. } => *on_error,
            _ => OnError::Fail,
        }
    }
}

/// Step type tag, used as the executor registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Prompt,
    Agent,
    Command,
    ApplyDiff,
    Custom,
}

impl StepKind {
    /// Returns the YAML type tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Agent => "agent",
            Self::Command => "command",
            Self::ApplyDiff => "apply_diff",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Least-privilege execution constraints for an agent step.
///
/// Every field is mandatory. They are modeled as `Option` so the
/// validator can report each omission as a semantic violation naming the
/// step, instead of dying inside the YAML decoder with no step context.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Wall-clock limit for the agent subprocess, in seconds (1..=3600)
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Maximum files the agent may read (0..=1000)
    #[serde(default)]
    pub max_files: Option<u64>,

    /// Maximum edits the agent may make (0..=100)
    #[serde(default)]
    pub max_edits: Option<u64>,

    /// Glob patterns for paths the agent may touch; empty denies all
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,

    /// Exact program names the agent may execute; empty denies all
    #[serde(default)]
    pub command_allowlist: Option<Vec<String>>,
}

impl Policy {
    /// Names of fields that were omitted in the definition.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.timeout_seconds.is_none() {
            missing.push("timeout_seconds");
        }
        if self.max_files.is_none() {
            missing.push("max_files");
        }
        if self.max_edits.is_none() {
            missing.push("max_edits");
        }
        if self.allowed_paths.is_none() {
            missing.push("allowed_paths");
        }
        if self.command_allowlist.is_none() {
            missing.push("command_allowlist");
        }
        missing
    }

    /// Out-of-range fields, as human-readable messages.
    pub fn range_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if let Some(timeout) = self.timeout_seconds {
            let (lo, hi) = TIMEOUT_RANGE;
            if timeout < lo || timeout > hi {
                violations.push(format!(
                    "timeout_seconds must be within {}..={}, got {}",
                    lo, hi, timeout
                ));
            }
        }
        if let Some(max_files) = self.max_files {
            if max_files > MAX_FILES_LIMIT {
                violations.push(format!(
                    "max_files must be at most {}, got {}",
                    MAX_FILES_LIMIT, max_files
                ));
            }
        }
        if let Some(max_edits) = self.max_edits {
            if max_edits > MAX_EDITS_LIMIT {
                violations.push(format!(
                    "max_edits must be at most {}, got {}",
                    MAX_EDITS_LIMIT, max_edits
                ));
            }
        }
        violations
    }

    /// True when all five fields are present.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}
