//! Agent Step Execution
//!
//! Spawns the external coding agent as a policy-constrained subprocess,
//! streams its output into a redacted transcript, answers its policy
//! handshake, enforces the step's wall-clock deadline, and persists the
//! full artifact set (`policy.json`, `transcript.md`, `output.txt`,
//! `metrics.json`).
//!
//! # Wire contract
//!
//! The agent executable (env-overridable via `AGENTFLOW_AGENT_BIN`,
//! `claude` on PATH by default) receives the prompt after `--print`,
//! the expanded model identifier in `AGENTFLOW_MODEL`, and guardrail
//! ids in `AGENTFLOW_GUARDRAILS`. Operations the agent wants to perform
//! are requested as stdout lines:
//!
//! ```text
//! ::request read <path>
//! ::request edit <path>
//! ::request exec <command>
//! ```
//!
//! Each request is answered on the agent's stdin with `ok` or `deny`
//! after consulting the policy enforcer. Subprocess control is an
//! explicit phase sequence `{spawned, streaming, exited | timed_out}`
//! so the timeout-vs-exit race stays observable.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;

use super::state::{StepResult, StepStatus};
use super::step::{
    collect_with_deadline, describe_exit, RunContext, StepExecutor, DEFAULT_STEP_TIMEOUT_SECS,
};
use super::EngineError;
use crate::artifact::redact::redact;
use crate::policy::enforcer::PolicyEnforcer;
use crate::workflow::model::StepDefinition;
use crate::workflow::parser::expand_placeholders;

/// Environment variable overriding the agent executable.
pub const AGENT_BIN_ENV: &str = "AGENTFLOW_AGENT_BIN";

/// Default agent executable, assumed present on PATH.
pub const DEFAULT_AGENT_BIN: &str = "claude";

/// Model identifier variable passed to the agent subprocess.
pub const MODEL_ENV: &str = "AGENTFLOW_MODEL";

/// Guardrail ids variable passed to the agent subprocess.
pub const GUARDRAILS_ENV: &str = "AGENTFLOW_GUARDRAILS";

const REQUEST_PREFIX: &str = "::request ";
const REPLY_OK: &str = "ok";
const REPLY_DENY: &str = "deny";

/// Resolves the agent executable from the environment.
pub fn agent_program() -> String {
    std::env::var(AGENT_BIN_ENV).unwrap_or_else(|_| DEFAULT_AGENT_BIN.to_string())
}

/// Execution metrics persisted as `metrics.json` for agent steps.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StepMetrics {
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub files_read: u64,
    pub edits_made: u64,
    pub commands_run: u64,
    pub denied_operations: u64,
}

/// Subprocess lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Spawned,
    Streaming,
    Exited,
    TimedOut,
}

/// One line from the agent, tagged by stream.
enum StreamLine {
    Out(String),
    Err(String),
}

/// A parsed policy handshake request.
#[derive(Debug, PartialEq, Eq)]
enum AgentRequest<'a> {
    Read(&'a str),
    Edit(&'a str),
    Exec(&'a str),
}

fn parse_request(line: &str) -> Option<AgentRequest<'_>> {
    let rest = line.trim().strip_prefix(REQUEST_PREFIX)?;
    let (op, arg) = rest.split_once(' ')?;
    let arg = arg.trim();
    if arg.is_empty() {
        return None;
    }
    match op {
        "read" => Some(AgentRequest::Read(arg)),
        "edit" => Some(AgentRequest::Edit(arg)),
        "exec" => Some(AgentRequest::Exec(arg)),
        _ => None,
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    stream: Option<R>,
    tx: Sender<StreamLine>,
    wrap: fn(String) -> StreamLine,
) {
    let Some(stream) = stream else { return };
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

/// Executor for `agent` steps.
pub struct AgentExecutor;

impl StepExecutor for AgentExecutor {
    fn execute(
        &self,
        step: &StepDefinition,
        ctx: &RunContext<'_>,
    ) -> Result<StepResult, EngineError> {
        let StepDefinition::Agent { id, prompt, policy } = step else {
            return Err(EngineError::Step {
                step_id: step.id().to_string(),
                message: format!("agent executor received a '{}' step", step.kind()),
            });
        };
        let policy = policy.as_ref().ok_or_else(|| EngineError::Step {
            step_id: id.clone(),
            message: "agent step has no policy; the definition was not validated".to_string(),
        })?;
        let mut enforcer = PolicyEnforcer::new(policy).map_err(|e| EngineError::Step {
            step_id: id.clone(),
            message: e.to_string(),
        })?;

        let start_time = Utc::now();
        let clock = Instant::now();

        let mut cmd = Command::new(&ctx.agent_bin);
        cmd.arg("--print")
            .arg(prompt)
            .current_dir(&ctx.work_dir)
            .env(MODEL_ENV, expand_placeholders(&ctx.workflow.model_identifier))
            .env(GUARDRAILS_ENV, ctx.workflow.guardrail_ids.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &ctx.workflow.env {
            cmd.env(key, expand_placeholders(value));
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::Spawn {
            program: ctx.agent_bin.clone(),
            source: e,
        })?;
        let mut phase = Phase::Spawned;
        debug!("Step '{}': agent phase {:?}", id, phase);

        let (tx, rx) = mpsc::channel();
        spawn_line_reader(child.stdout.take(), tx.clone(), StreamLine::Out);
        spawn_line_reader(child.stderr.take(), tx.clone(), StreamLine::Err);
        drop(tx);
        let mut stdin = child.stdin.take();

        phase = Phase::Streaming;
        debug!("Step '{}': agent phase {:?}", id, phase);

        let deadline = clock + enforcer.timeout();
        let mut transcript = String::new();
        let mut output = String::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                phase = Phase::TimedOut;
                warn!(
                    "Step '{}': deadline of {}s reached, terminating agent",
                    id,
                    enforcer.timeout().as_secs()
                );
                let _ = child.kill();
                break;
            }
            let wait = (deadline - now).min(Duration::from_millis(100));
            match rx.recv_timeout(wait) {
                Ok(StreamLine::Out(line)) => {
                    if let Some(request) = parse_request(&line) {
                        let decision = match request {
                            AgentRequest::Read(path) => enforcer.check_read(path),
                            AgentRequest::Edit(path) => enforcer.check_edit(path),
                            AgentRequest::Exec(command) => enforcer.check_command(command),
                        };
                        let reply = if decision.is_allowed() {
                            REPLY_OK
                        } else {
                            REPLY_DENY
                        };
                        if let Some(pipe) = stdin.as_mut() {
                            if writeln!(pipe, "{}", reply).is_err() {
                                warn!("Step '{}': agent stopped reading policy replies", id);
                                stdin = None;
                            }
                        }
                        transcript.push_str(&redact(&format!("> {} -> {}\n", line.trim(), reply)));
                    } else {
                        transcript.push_str(&redact(&line));
                        transcript.push('\n');
                        output.push_str(&redact(&line));
                        output.push('\n');
                    }
                }
                Ok(StreamLine::Err(line)) => {
                    transcript.push_str("! ");
                    transcript.push_str(&redact(&line));
                    transcript.push('\n');
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    phase = Phase::Exited;
                    break;
                }
            }
        }

        // Drain whatever the readers managed to buffer before the kill
        while let Ok(line) = rx.try_recv() {
            let text = match line {
                StreamLine::Out(line) => line,
                StreamLine::Err(line) => format!("! {}", line),
            };
            transcript.push_str(&redact(&text));
            transcript.push('\n');
        }

        // The agent can close its streams and keep running; bound the
        // remaining wait by the same deadline
        let wait_err = |e: std::io::Error| EngineError::Step {
            step_id: id.clone(),
            message: format!("failed waiting for agent: {}", e),
        };
        let exit_status = loop {
            if phase == Phase::TimedOut {
                break child.wait().map_err(wait_err)?;
            }
            match child.try_wait().map_err(wait_err)? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        warn!(
                            "Step '{}': agent closed its streams but ran past the deadline",
                            id
                        );
                        phase = Phase::TimedOut;
                        let _ = child.kill();
                    } else {
                        thread::sleep(Duration::from_millis(25));
                    }
                }
            }
        };
        let timed_out = phase == Phase::TimedOut;
        let exit_code = if timed_out { None } else { exit_status.code() };
        debug!("Step '{}': agent phase {:?}", id, phase);

        let counters = enforcer.counters();
        ctx.store.write_policy(id, policy)?;
        ctx.store.write_transcript(id, &transcript)?;
        let output_ref = ctx.store.write_output(id, &output)?;
        let metrics = StepMetrics {
            duration_ms: clock.elapsed().as_millis() as u64,
            exit_code,
            timed_out,
            files_read: counters.files_read,
            edits_made: counters.edits_made,
            commands_run: counters.commands_run,
            denied_operations: counters.denied_operations,
        };
        ctx.store.write_metrics(id, &metrics)?;

        let (status, error_message) = if timed_out {
            (
                StepStatus::Failed,
                Some(format!(
                    "timed out after {}s",
                    enforcer.timeout().as_secs()
                )),
            )
        } else if enforcer.had_denials() {
            (
                StepStatus::Failed,
                Some(format!(
                    "policy violation: {} operation(s) denied",
                    counters.denied_operations
                )),
            )
        } else if exit_code != Some(0) {
            (
                StepStatus::Failed,
                Some(format!("agent exited with code {}", describe_exit(exit_code))),
            )
        } else {
            (StepStatus::Completed, None)
        };

        info!(
            "Step '{}': agent finished ({} read, {} edited, {} denied)",
            id, counters.files_read, counters.edits_made, counters.denied_operations
        );

        Ok(StepResult {
            step_id: id.clone(),
            status,
            exit_code,
            start_time,
            end_time: Utc::now(),
            output_ref,
            error_message,
        })
    }
}

/// Captured output of a read-only agent invocation.
pub(crate) struct ReadonlyInvocation {
    pub stdout: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Invokes the agent read-only for a prompt step.
///
/// No policy handshake: the invocation gets `--read-only`, a null
/// stdin, and the default timeout; it never consumes quotas.
pub(crate) fn invoke_readonly(
    step_id: &str,
    prompt: &str,
    ctx: &RunContext<'_>,
) -> Result<ReadonlyInvocation, EngineError> {
    let mut cmd = Command::new(&ctx.agent_bin);
    cmd.arg("--print")
        .arg("--read-only")
        .arg(prompt)
        .current_dir(&ctx.work_dir)
        .env(MODEL_ENV, expand_placeholders(&ctx.workflow.model_identifier))
        .env(GUARDRAILS_ENV, ctx.workflow.guardrail_ids.join(","))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &ctx.workflow.env {
        cmd.env(key, expand_placeholders(value));
    }

    let child = cmd.spawn().map_err(|e| EngineError::Spawn {
        program: ctx.agent_bin.clone(),
        source: e,
    })?;

    let collected = collect_with_deadline(child, Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS))
        .map_err(|e| EngineError::Step {
            step_id: step_id.to_string(),
            message: format!("failed waiting for agent: {}", e),
        })?;

    Ok(ReadonlyInvocation {
        stdout: collected.stdout,
        exit_code: collected.exit_code,
        timed_out: collected.timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::execution::step::test_support::{minimal_workflow, write_script};
    use crate::workflow::model::Policy;
    use tempfile::tempdir;

    fn agent_step(id: &str, policy: Policy) -> StepDefinition {
        StepDefinition::Agent {
            id: id.to_string(),
            prompt: "do the task".to_string(),
            policy: Some(policy),
        }
    }

    fn policy(timeout: u64, max_files: u64, max_edits: u64) -> Policy {
        Policy {
            timeout_seconds: Some(timeout),
            max_files: Some(max_files),
            max_edits: Some(max_edits),
            allowed_paths: Some(vec!["src/**".to_string()]),
            command_allowlist: Some(vec!["cargo".to_string()]),
        }
    }

    #[test]
    fn test_parse_request_variants() {
        assert_eq!(
            parse_request("::request read src/lib.rs"),
            Some(AgentRequest::Read("src/lib.rs"))
        );
        assert_eq!(
            parse_request("  ::request edit src/main.rs  "),
            Some(AgentRequest::Edit("src/main.rs"))
        );
        assert_eq!(
            parse_request("::request exec cargo test"),
            Some(AgentRequest::Exec("cargo test"))
        );
        assert_eq!(parse_request("::request fly moon"), None);
        assert_eq!(parse_request("::request read "), None);
        assert_eq!(parse_request("ordinary output"), None);
    }

    #[test]
    fn test_agent_success_writes_full_artifact_set() {
        let temp = tempdir().unwrap();
        let agent_bin = write_script(
            temp.path(),
            "agent.sh",
            "#!/bin/sh\necho \"working on it\"\necho \"all done\"\n",
        );
        let workflow = minimal_workflow();
        let store = ArtifactStore::create(temp.path().join("run")).unwrap();
        let ctx = RunContext {
            run_id: "r1".to_string(),
            workflow: &workflow,
            store: &store,
            agent_bin,
            work_dir: temp.path().to_path_buf(),
        };

        let step = agent_step("fix", policy(30, 5, 5));
        let result = AgentExecutor.execute(&step, &ctx).unwrap();

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output_ref, "fix/output.txt");

        let step_dir = store.run_dir().join("fix");
        assert!(step_dir.join("policy.json").is_file());
        assert!(step_dir.join("transcript.md").is_file());
        assert!(step_dir.join("output.txt").is_file());
        assert!(step_dir.join("metrics.json").is_file());

        let transcript = store.read_transcript("fix").unwrap();
        assert!(transcript.contains("working on it"));
    }

    #[test]
    fn test_agent_handshake_denies_edit_with_zero_quota() {
        let temp = tempdir().unwrap();
        let agent_bin = write_script(
            temp.path(),
            "agent.sh",
            concat!(
                "#!/bin/sh\n",
                "echo \"::request edit src/main.rs\"\n",
                "read edit_reply\n",
                "echo \"edit was $edit_reply\"\n",
                "echo \"::request read src/lib.rs\"\n",
                "read read_reply\n",
                "echo \"read was $read_reply\"\n",
            ),
        );
        let workflow = minimal_workflow();
        let store = ArtifactStore::create(temp.path().join("run")).unwrap();
        let ctx = RunContext {
            run_id: "r1".to_string(),
            workflow: &workflow,
            store: &store,
            agent_bin,
            work_dir: temp.path().to_path_buf(),
        };

        let step = agent_step("fix", policy(30, 5, 0));
        let result = AgentExecutor.execute(&step, &ctx).unwrap();

        // A denial marks the step failed even though the agent exited 0
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error_message.unwrap().contains("policy violation"));

        let metrics = store.read_metrics("fix").unwrap();
        assert_eq!(metrics["denied_operations"], 1);
        assert_eq!(metrics["edits_made"], 0);
        assert_eq!(metrics["files_read"], 1);
        assert_eq!(metrics["timed_out"], false);

        let transcript = store.read_transcript("fix").unwrap();
        assert!(transcript.contains("-> deny"));
        assert!(transcript.contains("-> ok"));

        let output = std::fs::read_to_string(store.run_dir().join("fix/output.txt")).unwrap();
        assert!(output.contains("edit was deny"));
        assert!(output.contains("read was ok"));
    }

    #[test]
    fn test_agent_timeout_recorded_not_dropped() {
        let temp = tempdir().unwrap();
        let agent_bin = write_script(
            temp.path(),
            "agent.sh",
            "#!/bin/sh\necho \"starting\"\nsleep 10\n",
        );
        let workflow = minimal_workflow();
        let store = ArtifactStore::create(temp.path().join("run")).unwrap();
        let ctx = RunContext {
            run_id: "r1".to_string(),
            workflow: &workflow,
            store: &store,
            agent_bin,
            work_dir: temp.path().to_path_buf(),
        };

        let step = agent_step("slow", policy(1, 5, 5));
        let started = Instant::now();
        let result = AgentExecutor.execute(&step, &ctx).unwrap();

        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.exit_code.is_none());
        assert!(result.error_message.unwrap().contains("timed out"));

        let metrics = store.read_metrics("slow").unwrap();
        assert_eq!(metrics["timed_out"], true);

        // The pre-timeout output still made it into the transcript
        let transcript = store.read_transcript("slow").unwrap();
        assert!(transcript.contains("starting"));
    }

    #[test]
    fn test_agent_transcript_redacts_streamed_secret() {
        let temp = tempdir().unwrap();
        let agent_bin = write_script(
            temp.path(),
            "agent.sh",
            "#!/bin/sh\necho \"auth: Bearer abc123def456ghi789\"\n",
        );
        let workflow = minimal_workflow();
        let store = ArtifactStore::create(temp.path().join("run")).unwrap();
        let ctx = RunContext {
            run_id: "r1".to_string(),
            workflow: &workflow,
            store: &store,
            agent_bin,
            work_dir: temp.path().to_path_buf(),
        };

        let step = agent_step("leaky", policy(30, 5, 5));
        AgentExecutor.execute(&step, &ctx).unwrap();

        let transcript = store.read_transcript("leaky").unwrap();
        assert!(!transcript.contains("abc123def456ghi789"));
        assert!(transcript.contains("[REDACTED]"));
    }

    #[test]
    fn test_agent_nonzero_exit_is_failure() {
        let temp = tempdir().unwrap();
        let agent_bin = write_script(temp.path(), "agent.sh", "#!/bin/sh\nexit 3\n");
        let workflow = minimal_workflow();
        let store = ArtifactStore::create(temp.path().join("run")).unwrap();
        let ctx = RunContext {
            run_id: "r1".to_string(),
            workflow: &workflow,
            store: &store,
            agent_bin,
            work_dir: temp.path().to_path_buf(),
        };

        let step = agent_step("broken", policy(30, 5, 5));
        let result = AgentExecutor.execute(&step, &ctx).unwrap();

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
    }

    #[test]
    fn test_agent_spawn_failure_is_engine_error() {
        let temp = tempdir().unwrap();
        let workflow = minimal_workflow();
        let store = ArtifactStore::create(temp.path().join("run")).unwrap();
        let ctx = RunContext {
            run_id: "r1".to_string(),
            workflow: &workflow,
            store: &store,
            agent_bin: "/nonexistent/agent-binary".to_string(),
            work_dir: temp.path().to_path_buf(),
        };

        let step = agent_step("fix", policy(30, 5, 5));
        let err = AgentExecutor.execute(&step, &ctx).unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[test]
    fn test_agent_program_default() {
        // Only meaningful when the override is unset in the test env
        if std::env::var(AGENT_BIN_ENV).is_err() {
            assert_eq!(agent_program(), DEFAULT_AGENT_BIN);
        }
    }
}
