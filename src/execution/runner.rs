//! Workflow Runner
//!
//! The orchestrator: sequences step executors under the run state
//! machine, strictly serially, persisting state after every step. On
//! halt it reports the run id and failed step so callers can print the
//! exact resume invocation.
//!
//! Execution is single-threaded by design: one step at a time in
//! declared order, one subprocess per step, never a pool. The
//! workflow-level runtime ceiling is checked between steps only.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use super::agent;
use super::state::{Advance, RunState, RunStatus, StepStatus};
use super::step::{ExecutorRegistry, RunContext};
use super::timeline::{EventType, ExecutionTimeline};
use super::EngineError;
use crate::artifact::ArtifactStore;
use crate::workflow::model::{WorkflowDefinition, DEFAULT_ARTIFACTS_ROOT};

/// Caller-supplied knobs for a run.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Preview steps without executing or creating a run directory
    pub dry_run: bool,
    /// Overrides the workflow's artifacts directory root
    pub artifacts_root: Option<PathBuf>,
    /// Directory file operations and commands resolve against
    pub work_dir: Option<PathBuf>,
    /// Overrides the agent executable (defaults to the
    /// `AGENTFLOW_AGENT_BIN` environment resolution)
    pub agent_bin: Option<String>,
}

/// What a run (or resume) ended as.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Step to resume from when the run failed
    pub failed_step: Option<String>,
    pub run_dir: PathBuf,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use agentflow::execution::{RunOptions, WorkflowRunner};
/// use agentflow::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_definition("workflow.yaml")?;
///     let runner = WorkflowRunner::new();
///     let outcome = runner.run(workflow, &RunOptions::default())?;
///     println!("run {} finished: {:?}", outcome.run_id, outcome.status);
///     Ok(())
/// }
/// ```
pub struct WorkflowRunner {
    registry: ExecutorRegistry,
}

impl WorkflowRunner {
    /// Creates a runner with the built-in executors.
    pub fn new() -> Self {
        Self {
            registry: ExecutorRegistry::builtin(),
        }
    }

    /// Mutable access to the executor registry, for embedders that
    /// register `custom` step executors.
    pub fn registry_mut(&mut self) -> &mut ExecutorRegistry {
        &mut self.registry
    }

    /// Executes a workflow from the start.
    pub fn run(
        &self,
        workflow: WorkflowDefinition,
        options: &RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        if options.dry_run {
            return Ok(self.preview(&workflow));
        }

        let state = RunState::new(workflow);
        let run_dir = resolve_run_dir(
            &state.workflow.runtime_limits.artifacts_dir_template,
            options,
            &state.run_id,
        );
        let store = ArtifactStore::create(run_dir)?;
        self.drive(state, store, options)
    }

    /// Resumes a halted run at the named step.
    ///
    /// Loads the persisted state (failing fast on an unknown run or
    /// step id), optionally swaps in a revised definition (e.g. an
    /// approval flipped to true), truncates results at the resume
    /// point, and re-enters the execution loop there.
    pub fn resume(
        &self,
        run_id: &str,
        from_step_id: &str,
        refreshed: Option<WorkflowDefinition>,
        options: &RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let root = options
            .artifacts_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_ROOT));
        let run_dir = root.join(run_id);

        let mut state = ArtifactStore::load_state(&run_dir)?;
        if let Some(workflow) = refreshed {
            info!("Resume: using revised workflow definition");
            state.refresh_workflow(workflow);
        }
        let state = state.resume_from(from_step_id)?;
        let store = ArtifactStore::open(&run_dir)?;
        self.drive(state, store, options)
    }

    /// The main execution loop shared by run and resume.
    fn drive(
        &self,
        mut state: RunState,
        store: ArtifactStore,
        options: &RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let work_dir = match &options.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| EngineError::Step {
                step_id: "run".to_string(),
                message: format!("cannot resolve working directory: {}", e),
            })?,
        };
        let agent_bin = options
            .agent_bin
            .clone()
            .unwrap_or_else(agent::agent_program);
        let budget = Duration::from_secs(state.workflow.runtime_limits.max_total_runtime_seconds);
        let started = Instant::now();
        let mut timeline = ExecutionTimeline::new();

        // Durability point before the first step executes
        store.save_state(&state)?;
        info!(
            "Run {} started: {} step(s), agent '{}'",
            state.run_id,
            state.workflow.steps.len(),
            agent_bin
        );

        while !state.is_terminal() {
            // Soft ceiling, checked between steps, never preemptive
            if started.elapsed() >= budget {
                warn!(
                    "Run exceeded max_total_runtime_seconds ({}s); halting",
                    budget.as_secs()
                );
                state.mark_failed();
                store.save_state(&state)?;
                break;
            }

            let Some(step) = state.current_step().cloned() else {
                break;
            };
            info!("Starting step: {} ({})", step.id(), step.kind());
            timeline.add_event(step.id(), EventType::Started);

            let executor = self
                .registry
                .resolve(step.kind())
                .ok_or_else(|| EngineError::UnknownStepType(step.kind().to_string()))?;

            let result = {
                let ctx = RunContext {
                    run_id: state.run_id.clone(),
                    workflow: &state.workflow,
                    store: &store,
                    agent_bin: agent_bin.clone(),
                    work_dir: work_dir.clone(),
                };
                executor.execute(&step, &ctx)?
            };

            match result.status {
                StepStatus::Completed => {
                    timeline.add_event(step.id(), EventType::Completed);
                    info!("Step '{}' completed", step.id());
                }
                StepStatus::Failed => {
                    timeline.add_event(step.id(), EventType::Failed);
                    error!(
                        "Step '{}' failed: {}",
                        step.id(),
                        result.error_message.as_deref().unwrap_or("unknown error")
                    );
                }
                StepStatus::Skipped => {
                    timeline.add_event(step.id(), EventType::Skipped);
                    warn!(
                        "Step '{}' blocked: {}",
                        step.id(),
                        result.error_message.as_deref().unwrap_or("pending approval")
                    );
                }
            }

            let advance = state.record(result);
            store.save_state(&state)?;
            if advance == Advance::Halt {
                break;
            }
        }

        println!();
        println!("{}", timeline.summary());

        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            status: state.status,
            failed_step: state.resume_step_id().map(|s| s.to_string()),
            run_dir: store.run_dir().to_path_buf(),
        })
    }

    /// Prints the execution plan without running anything.
    fn preview(&self, workflow: &WorkflowDefinition) -> RunOutcome {
        info!("Mode: DRY RUN (steps will not execute)");
        for step in &workflow.steps {
            println!();
            println!("[DRY RUN] Step: {}", step.id());
            println!("  Type: {}", step.kind());
            match step {
                crate::workflow::model::StepDefinition::Agent { policy, .. } => {
                    if let Some(policy) = policy {
                        println!(
                            "  Policy: timeout {}s, max_files {}, max_edits {}",
                            policy.timeout_seconds.unwrap_or_default(),
                            policy.max_files.unwrap_or_default(),
                            policy.max_edits.unwrap_or_default()
                        );
                    }
                }
                crate::workflow::model::StepDefinition::Command { command, .. } => {
                    println!("  Command: {}", command);
                }
                _ => {}
            }
        }
        println!();

        RunOutcome {
            run_id: "dry-run".to_string(),
            status: RunStatus::Completed,
            failed_step: None,
            run_dir: PathBuf::new(),
        }
    }
}

impl Default for WorkflowRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the run directory from the workflow's template and options.
///
/// An explicit `--artifacts-dir` root wins; otherwise the template is
/// used, with `{run_id}` substituted or the run id appended.
pub fn resolve_run_dir(template: &str, options: &RunOptions, run_id: &str) -> PathBuf {
    if let Some(root) = &options.artifacts_root {
        return root.join(run_id);
    }
    if template.contains("{run_id}") {
        PathBuf::from(template.replace("{run_id}", run_id))
    } else {
        Path::new(template).join(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::workflow::validator::validate;
    use std::fs;
    use tempfile::tempdir;

    fn options(temp: &tempfile::TempDir) -> RunOptions {
        RunOptions {
            dry_run: false,
            artifacts_root: Some(temp.path().join("artifacts")),
            work_dir: Some(temp.path().to_path_buf()),
            agent_bin: None,
        }
    }

    fn commands_workflow(yaml_steps: &str) -> WorkflowDefinition {
        validate(&format!(
            r#"
schema_version: "1"
name: test-run
model_identifier: test-model
steps:
{}"#,
            yaml_steps
        ))
        .unwrap()
    }

    #[test]
    fn test_run_completes_and_persists_state() {
        let temp = tempdir().unwrap();
        let workflow = commands_workflow(
            r#"
  - id: one
    type: command
    command: echo first
  - id: two
    type: command
    command: echo second
"#,
        );

        let runner = WorkflowRunner::new();
        let outcome = runner.run(workflow, &options(&temp)).unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.failed_step.is_none());

        let state = ArtifactStore::load_state(&outcome.run_dir).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.step_results.len(), 2);
        assert!(outcome.run_dir.join("one/output.txt").is_file());
        assert!(outcome.run_dir.join("two/output.txt").is_file());
    }

    #[test]
    fn test_failure_halts_and_names_resume_step() {
        let temp = tempdir().unwrap();
        let workflow = commands_workflow(
            r#"
  - id: ok
    type: command
    command: echo fine
  - id: boom
    type: command
    command: exit 1
  - id: never
    type: command
    command: echo unreachable
"#,
        );

        let runner = WorkflowRunner::new();
        let outcome = runner.run(workflow, &options(&temp)).unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_step.as_deref(), Some("boom"));

        // The step after the failure never ran
        assert!(!outcome.run_dir.join("never").exists());

        let state = ArtifactStore::load_state(&outcome.run_dir).unwrap();
        assert_eq!(state.step_results.len(), 2);
        assert_eq!(state.step_results[1].status, StepStatus::Failed);
    }

    #[test]
    fn test_on_error_continue_reaches_completed() {
        let temp = tempdir().unwrap();
        let workflow = commands_workflow(
            r#"
  - id: flaky
    type: command
    command: exit 1
    on_error: continue
  - id: after
    type: command
    command: echo still here
"#,
        );

        let runner = WorkflowRunner::new();
        let outcome = runner.run(workflow, &options(&temp)).unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        let state = ArtifactStore::load_state(&outcome.run_dir).unwrap();
        assert_eq!(state.step_results[0].status, StepStatus::Failed);
        assert_eq!(state.step_results[1].status, StepStatus::Completed);
    }

    #[test]
    fn test_resume_reexecutes_only_from_resume_point() {
        let temp = tempdir().unwrap();
        let workflow = commands_workflow(
            r#"
  - id: first
    type: command
    command: echo once
  - id: needs_marker
    type: command
    command: cat marker.txt
"#,
        );
        let opts = options(&temp);

        let runner = WorkflowRunner::new();
        let outcome = runner.run(workflow, &opts).unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_step.as_deref(), Some("needs_marker"));

        // Stamp the first step's artifact so we can prove it is untouched
        let first_output = outcome.run_dir.join("first/output.txt");
        let before = fs::metadata(&first_output).unwrap().modified().unwrap();

        // Make the failing step succeed, then resume from it
        fs::write(temp.path().join("marker.txt"), "now present").unwrap();
        let resumed = runner
            .resume(&outcome.run_id, "needs_marker", None, &opts)
            .unwrap();

        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.run_id, outcome.run_id);

        let after = fs::metadata(&first_output).unwrap().modified().unwrap();
        assert_eq!(before, after, "earlier step artifacts must be untouched");

        let state = ArtifactStore::load_state(&resumed.run_dir).unwrap();
        assert_eq!(state.step_results.len(), 2);
        assert_eq!(state.step_results[1].status, StepStatus::Completed);
    }

    #[test]
    fn test_resume_unknown_run_fails_fast() {
        let temp = tempdir().unwrap();
        let runner = WorkflowRunner::new();

        let err = runner
            .resume("no-such-run", "step", None, &options(&temp))
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }

    #[test]
    fn test_resume_unknown_step_fails_fast() {
        let temp = tempdir().unwrap();
        let workflow = commands_workflow(
            r#"
  - id: boom
    type: command
    command: exit 1
"#,
        );
        let opts = options(&temp);

        let runner = WorkflowRunner::new();
        let outcome = runner.run(workflow, &opts).unwrap();

        let err = runner
            .resume(&outcome.run_id, "ghost", None, &opts)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownResumeStep { .. }));
    }

    #[test]
    fn test_two_runs_get_distinct_ids() {
        let temp = tempdir().unwrap();
        let opts = options(&temp);
        let runner = WorkflowRunner::new();

        let yaml = r#"
  - id: only
    type: command
    command: echo hi
"#;
        let first = runner.run(commands_workflow(yaml), &opts).unwrap();
        let second = runner.run(commands_workflow(yaml), &opts).unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert!(first.run_dir.exists());
        assert!(second.run_dir.exists());
    }

    #[test]
    fn test_dry_run_creates_nothing() {
        let temp = tempdir().unwrap();
        let workflow = commands_workflow(
            r#"
  - id: only
    type: command
    command: echo hi
"#,
        );
        let mut opts = options(&temp);
        opts.dry_run = true;

        let runner = WorkflowRunner::new();
        let outcome = runner.run(workflow, &opts).unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(!temp.path().join("artifacts").exists());
    }

    #[test]
    fn test_workflow_timeout_between_steps() {
        let temp = tempdir().unwrap();
        let workflow = validate(
            r#"
schema_version: "1"
name: overtime
model_identifier: m
runtime_limits:
  max_total_runtime_seconds: 1
steps:
  - id: slow
    type: command
    command: sleep 2
  - id: never
    type: command
    command: echo unreachable
"#,
        )
        .unwrap();

        let runner = WorkflowRunner::new();
        let outcome = runner.run(workflow, &options(&temp)).unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        // The first step itself succeeded; the ceiling halted before the next
        let state = ArtifactStore::load_state(&outcome.run_dir).unwrap();
        assert_eq!(state.step_results.len(), 1);
        assert_eq!(state.step_results[0].status, StepStatus::Completed);
        assert_eq!(outcome.failed_step.as_deref(), Some("never"));
    }

    #[test]
    fn test_custom_step_without_executor_errors() {
        let temp = tempdir().unwrap();
        let workflow = commands_workflow(
            r#"
  - id: special
    type: custom
    handler: my-handler
"#,
        );

        let runner = WorkflowRunner::new();
        let err = runner.run(workflow, &options(&temp)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownStepType(_)));
    }

    #[test]
    fn test_blocked_approval_then_resume_with_revised_definition() {
        let temp = tempdir().unwrap();
        let agent_bin = crate::execution::step::test_support::write_script(
            temp.path(),
            "diff-agent.sh",
            concat!(
                "#!/bin/sh\n",
                "echo \"--- a/notes.txt\"\n",
                "echo \"+++ b/notes.txt\"\n",
                "echo \"@@ -1,1 +1,1 @@\"\n",
                "echo \"-old\"\n",
                "echo \"+new\"\n",
            ),
        );
        fs::write(temp.path().join("notes.txt"), "old\n").unwrap();

        let definition = |approve: bool| {
            validate(&format!(
                r#"
schema_version: "1"
name: gated
model_identifier: m
steps:
  - id: fix
    type: agent
    prompt: rewrite notes
    policy:
      timeout_seconds: 30
      max_files: 5
      max_edits: 5
      allowed_paths: ["**"]
      command_allowlist: []
  - id: apply
    type: apply_diff
    source_step: fix
    approve: {}
"#,
                approve
            ))
            .unwrap()
        };

        let mut opts = options(&temp);
        opts.agent_bin = Some(agent_bin);
        let runner = WorkflowRunner::new();

        // The unapproved gate blocks the run; the file is untouched
        let outcome = runner.run(definition(false), &opts).unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_step.as_deref(), Some("apply"));
        assert_eq!(
            fs::read_to_string(temp.path().join("notes.txt")).unwrap(),
            "old\n"
        );

        // Resume at the gate with the approval flipped to true
        let resumed = runner
            .resume(&outcome.run_id, "apply", Some(definition(true)), &opts)
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(
            fs::read_to_string(temp.path().join("notes.txt")).unwrap(),
            "new\n"
        );
    }

    #[test]
    fn test_resolve_run_dir_template_substitution() {
        let opts = RunOptions::default();
        assert_eq!(
            resolve_run_dir("runs/{run_id}/data", &opts, "abc"),
            PathBuf::from("runs/abc/data")
        );
        assert_eq!(
            resolve_run_dir("runs", &opts, "abc"),
            PathBuf::from("runs/abc")
        );

        let with_root = RunOptions {
            artifacts_root: Some(PathBuf::from("/tmp/override")),
            ..Default::default()
        };
        assert_eq!(
            resolve_run_dir("runs/{run_id}", &with_root, "abc"),
            PathBuf::from("/tmp/override/abc")
        );
    }
}
