//! Run State
//!
//! The durable record of one workflow run: a snapshot of the
//! definition, the cursor into its steps, and every step result so
//! far. All mutation funnels through [`RunState::record`] so the
//! continue-vs-halt decision and the persisted record can never drift
//! apart. Persisted by the artifact store after every step, which is
//! what makes deterministic resume possible.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EngineError;
use crate::workflow::model::{OnError, StepDefinition, WorkflowDefinition};

/// Lifecycle of a run: `running → completed | failed`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Outcome of one executed step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Produced by the apply-diff approval gate; not an error, but the
    /// run cannot proceed past it.
    Skipped,
}

/// What the runner should do after recording a step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Continue,
    Halt,
}

/// Record of a single step execution.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Run-relative reference to the step's primary output artifact
    #[serde(default)]
    pub output_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Durable state of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    /// Snapshot of the definition this run executes; resume uses the
    /// snapshot, never the original file
    pub workflow: WorkflowDefinition,
    pub current_step_index: usize,
    pub status: RunStatus,
    pub step_results: Vec<StepResult>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl RunState {
    /// Creates fresh state for a new run with a unique run id.
    pub fn new(workflow: WorkflowDefinition) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            workflow,
            current_step_index: 0,
            status: RunStatus::Running,
            step_results: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// The step the cursor currently points at, if any remain.
    pub fn current_step(&self) -> Option<&StepDefinition> {
        self.workflow.steps.get(self.current_step_index)
    }

    /// Records a step result and decides continue-vs-halt.
    ///
    /// The single mutation funnel: a failed result halts the run unless
    /// the step declared `on_error: continue`; a skipped result (the
    /// approval gate) always halts; completing the final step completes
    /// the run. Callers persist the state immediately after.
    pub fn record(&mut self, result: StepResult) -> Advance {
        let tolerated = self
            .workflow
            .step(&result.step_id)
            .map(|s| s.on_error() == OnError::Continue)
            .unwrap_or(false);

        let halt = match result.status {
            StepStatus::Completed => false,
            StepStatus::Failed => !tolerated,
            StepStatus::Skipped => true,
        };

        self.step_results.push(result);

        if halt {
            self.status = RunStatus::Failed;
            self.end_time = Some(Utc::now());
            return Advance::Halt;
        }

        self.current_step_index += 1;
        if self.current_step_index >= self.workflow.steps.len() {
            self.status = RunStatus::Completed;
            self.end_time = Some(Utc::now());
        }
        Advance::Continue
    }

    /// Marks the run failed without a step result (workflow-level
    /// timeout between steps).
    pub fn mark_failed(&mut self) {
        self.status = RunStatus::Failed;
        self.end_time = Some(Utc::now());
    }

    /// Re-enters `running` at the named step for resume.
    ///
    /// Truncates `step_results` at that step's index so it and every
    /// later step re-execute exactly once; earlier results (and their
    /// artifacts) are untouched. Fails fast on a step id that does not
    /// exist in the snapshot or that the run never reached.
    pub fn resume_from(mut self, from_step_id: &str) -> Result<Self, EngineError> {
        let index = self.workflow.step_index(from_step_id).ok_or_else(|| {
            EngineError::UnknownResumeStep {
                run_id: self.run_id.clone(),
                step_id: from_step_id.to_string(),
            }
        })?;

        if index > self.step_results.len() {
            return Err(EngineError::ResumeBeyondProgress {
                run_id: self.run_id.clone(),
                step_id: from_step_id.to_string(),
            });
        }

        info!(
            "Resuming run {} at step '{}' (index {}); discarding {} later result(s)",
            self.run_id,
            from_step_id,
            index,
            self.step_results.len().saturating_sub(index)
        );

        self.step_results.truncate(index);
        self.current_step_index = index;
        self.status = RunStatus::Running;
        self.end_time = None;
        Ok(self)
    }

    /// Replaces the workflow snapshot, used when resume is given a
    /// revised definition (e.g. an approval flipped to true). The
    /// revised definition must still contain the resume step.
    pub fn refresh_workflow(&mut self, workflow: WorkflowDefinition) {
        self.workflow = workflow;
    }

    /// Id of the step a failed run should resume from.
    pub fn resume_step_id(&self) -> Option<&str> {
        match self.status {
            RunStatus::Failed => self.current_step().map(|s| s.id()),
            _ => None,
        }
    }

    /// True once the run reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }
}
