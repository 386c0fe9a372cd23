//! Step Execution
//!
//! The executor contract shared by every step type, the type-keyed
//! registry the orchestrator resolves against, and the two simple
//! built-in executors (prompt and command). The agent and apply-diff
//! executors live in their own modules.
//!
//! Ordinary step failure (non-zero exit, timeout, policy denial) is a
//! normal [`StepResult`], never an `Err`; only programmer and
//! environment errors propagate as [`EngineError`].

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, warn};

use super::agent;
use super::state::{StepResult, StepStatus};
use super::EngineError;
use crate::artifact::ArtifactStore;
use crate::workflow::model::{StepDefinition, StepKind, WorkflowDefinition};
use crate::workflow::parser::expand_placeholders;

/// Default timeout for command steps and read-only prompt invocations.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Programs a command step may invoke. Command steps carry no policy of
/// their own, so this fixed table is their allowlist; shell builtins are
/// included because commands run through a bash script.
pub const COMMAND_ALLOWLIST: &[&str] = &[
    "bash", "sh", "echo", "cat", "cp", "mv", "mkdir", "sleep", "touch", "ls", "grep", "sed",
    "awk", "head", "tail", "sort", "uniq", "wc", "cut", "tr", "tee", "gzip", "gunzip", "tar",
    "diff", "find", "xargs", "printf", "test", "true", "false", "exit", "env", "date", "git",
    "cargo", "make", "python3",
];

/// Everything an executor needs about the run it is part of.
pub struct RunContext<'a> {
    pub run_id: String,
    pub workflow: &'a WorkflowDefinition,
    pub store: &'a ArtifactStore,
    /// Resolved agent executable (env-overridable)
    pub agent_bin: String,
    /// Directory file operations and commands resolve against
    pub work_dir: PathBuf,
}

/// Common contract: turn a step definition into a step result.
pub trait StepExecutor {
    fn execute(
        &self,
        step: &StepDefinition,
        ctx: &RunContext<'_>,
    ) -> Result<StepResult, EngineError>;
}

/// Type-keyed executor registry.
///
/// Keeps the step set extensible without touching the orchestrator:
/// embedders can register an executor for `custom` steps (or replace a
/// built-in) before running.
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Box<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// Registry with the four built-in executors.
    pub fn builtin() -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
        };
        registry.register(StepKind::Prompt, Box::new(PromptExecutor));
        registry.register(StepKind::Agent, Box::new(agent::AgentExecutor));
        registry.register(StepKind::Command, Box::new(CommandExecutor));
        registry.register(
            StepKind::ApplyDiff,
            Box::new(super::apply_diff::ApplyDiffExecutor),
        );
        registry
    }

    /// Registers (or replaces) the executor for a step kind.
    pub fn register(&mut self, kind: StepKind, executor: Box<dyn StepExecutor>) {
        self.executors.insert(kind, executor);
    }

    /// Resolves the executor for a step kind.
    pub fn resolve(&self, kind: StepKind) -> Option<&dyn StepExecutor> {
        self.executors.get(&kind).map(|b| b.as_ref())
    }
}

/// Executor for `prompt` steps: renders the prompt (plus optional input
/// files) and forwards it to the agent read-only. Never consumes the
/// edit/command quotas and carries no policy.
pub struct PromptExecutor;

impl StepExecutor for PromptExecutor {
    fn execute(
        &self,
        step: &StepDefinition,
        ctx: &RunContext<'_>,
    ) -> Result<StepResult, EngineError> {
        let StepDefinition::Prompt {
            id,
            prompt,
            input_files,
        } = step
        else {
            return Err(wrong_type(step, "prompt"));
        };

        let start_time = Utc::now();

        let rendered = match render_prompt(prompt, input_files, &ctx.work_dir) {
            Ok(text) => text,
            Err(message) => {
                let output_ref = ctx.store.write_output(id, &message)?;
                return Ok(StepResult {
                    step_id: id.clone(),
                    status: StepStatus::Failed,
                    exit_code: None,
                    start_time,
                    end_time: Utc::now(),
                    output_ref,
                    error_message: Some(message),
                });
            }
        };

        let invocation = agent::invoke_readonly(id, &rendered, ctx)?;
        let output_ref = ctx.store.write_output(id, &invocation.stdout)?;

        let (status, error_message) = if invocation.timed_out {
            (
                StepStatus::Failed,
                Some(format!(
                    "read-only agent invocation timed out after {}s",
                    DEFAULT_STEP_TIMEOUT_SECS
                )),
            )
        } else if invocation.exit_code != Some(0) {
            (
                StepStatus::Failed,
                Some(format!(
                    "agent exited with code {}",
                    describe_exit(invocation.exit_code)
                )),
            )
        } else {
            (StepStatus::Completed, None)
        };

        Ok(StepResult {
            step_id: id.clone(),
            status,
            exit_code: invocation.exit_code,
            start_time,
            end_time: Utc::now(),
            output_ref,
            error_message,
        })
    }
}

/// Executor for `command` steps: one allow-listed command run through a
/// generated bash script with its own timeout.
pub struct CommandExecutor;

impl StepExecutor for CommandExecutor {
    fn execute(
        &self,
        step: &StepDefinition,
        ctx: &RunContext<'_>,
    ) -> Result<StepResult, EngineError> {
        let StepDefinition::Command {
            id,
            command,
            timeout_seconds,
            ..
        } = step
        else {
            return Err(wrong_type(step, "command"));
        };

        let start_time = Utc::now();

        let program = command.split_whitespace().next().unwrap_or("");
        if !COMMAND_ALLOWLIST.contains(&program) {
            let message = format!("policy violation: command '{}' is not allow-listed", program);
            let output_ref = ctx.store.write_output(id, &message)?;
            return Ok(StepResult {
                step_id: id.clone(),
                status: StepStatus::Failed,
                exit_code: None,
                start_time,
                end_time: Utc::now(),
                output_ref,
                error_message: Some(message),
            });
        }

        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS));
        let script_path = create_execution_script(id, command).map_err(|e| EngineError::Step {
            step_id: id.clone(),
            message: format!("failed to write execution script: {}", e),
        })?;

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path)
            .current_dir(&ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &ctx.workflow.env {
            cmd.env(key, expand_placeholders(value));
        }

        let child = cmd.spawn().map_err(|e| EngineError::Step {
            step_id: id.clone(),
            message: format!("failed to spawn bash: {}", e),
        })?;

        let collected = collect_with_deadline(child, timeout).map_err(|e| EngineError::Step {
            step_id: id.clone(),
            message: format!("failed waiting for command: {}", e),
        })?;

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }

        let mut output = collected.stdout;
        if !collected.stderr.trim().is_empty() {
            output.push_str("\n--- stderr ---\n");
            output.push_str(&collected.stderr);
        }
        let output_ref = ctx.store.write_output(id, &output)?;

        let (status, error_message) = if collected.timed_out {
            (
                StepStatus::Failed,
                Some(format!("timed out after {}s", timeout.as_secs())),
            )
        } else if collected.exit_code == Some(0) {
            (StepStatus::Completed, None)
        } else {
            (
                StepStatus::Failed,
                Some(format!(
                    "exited with code {}",
                    describe_exit(collected.exit_code)
                )),
            )
        };

        Ok(StepResult {
            step_id: id.clone(),
            status,
            exit_code: collected.exit_code,
            start_time,
            end_time: Utc::now(),
            output_ref,
            error_message,
        })
    }
}

/// Renders a prompt with optional input file contents appended.
fn render_prompt(
    prompt: &str,
    input_files: &[String],
    work_dir: &Path,
) -> Result<String, String> {
    let mut text = prompt.trim_end().to_string();
    for file in input_files {
        let path = work_dir.join(file);
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read input file '{}': {}", file, e))?;
        text.push_str(&format!("\n\n--- {} ---\n{}", file, content));
    }
    Ok(text)
}

pub(crate) fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<killed>".to_string(),
    }
}

fn wrong_type(step: &StepDefinition, expected: &str) -> EngineError {
    EngineError::Step {
        step_id: step.id().to_string(),
        message: format!(
            "executor for '{}' steps received a '{}' step",
            expected,
            step.kind()
        ),
    }
}

/// Creates a temporary bash script for step execution.
fn create_execution_script(step_id: &str, command_text: &str) -> std::io::Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("agentflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!("step_{}_{}.sh", std::process::id(), step_id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Captured output of a child process driven to exit or deadline.
pub(crate) struct CollectedOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Waits for a child with a wall-clock deadline, collecting both output
/// streams on reader threads. On deadline the child is killed and the
/// result is flagged timed-out rather than discarded.
pub(crate) fn collect_with_deadline(
    mut child: Child,
    timeout: Duration,
) -> std::io::Result<CollectedOutput> {
    let out_handle = child.stdout.take().map(|mut stream| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = stream.read_to_string(&mut buf);
            buf
        })
    });
    let err_handle = child.stderr.take().map(|mut stream| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = stream.read_to_string(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    loop {
        match child.try_wait()? {
            Some(_) => break,
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    debug!("Deadline reached, killing child process");
                    let _ = child.kill();
                    break;
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
    let status = child.wait()?;

    let stdout = out_handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let stderr = err_handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();

    Ok(CollectedOutput {
        exit_code: if timed_out { None } else { status.code() },
        stdout,
        stderr,
        timed_out,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::workflow::validator::validate;

    /// One-command workflow used as ambient context in executor tests.
    pub fn minimal_workflow() -> WorkflowDefinition {
        validate(
            r#"
schema_version: "1"
name: test
model_identifier: test-model
steps:
  - id: placeholder
    type: command
    command: echo hi
"#,
        )
        .unwrap()
    }

    /// Writes an executable fake-agent script and returns its path.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_str().unwrap().to_string()
    }
}
