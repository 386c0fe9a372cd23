//! Policy Enforcement
//!
//! Evaluates path, command, and quota decisions for an agent step's
//! [`Policy`]. Path checks glob-match against `allowed_paths` with
//! deny-by-default; command checks compare the program name exactly
//! against `command_allowlist`; running counters enforce the
//! `max_files`/`max_edits` quotas.
//!
//! This is an in-process soft limiter: executors must consult the
//! enforcer before every file access or edit, and the enforcer cannot
//! intercept operations it is not asked about.

use std::time::Duration;

use log::warn;
use serde::Serialize;
use thiserror::Error;

use crate::workflow::model::Policy;

/// A denied path, command, or quota decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy violation: {0}")]
pub struct PolicyViolation(pub String);

/// Outcome of a single enforcement check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    /// True if the operation may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Observed operation counts for one step, persisted into `metrics.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PolicyCounters {
    pub files_read: u64,
    pub edits_made: u64,
    pub commands_run: u64,
    pub denied_operations: u64,
}

/// Per-step policy enforcer with running quota counters.
#[derive(Debug)]
pub struct PolicyEnforcer {
    timeout: Duration,
    max_files: u64,
    max_edits: u64,
    allowed_paths: Vec<String>,
    command_allowlist: Vec<String>,
    counters: PolicyCounters,
}

impl PolicyEnforcer {
    /// Builds an enforcer from a complete policy.
    ///
    /// Fails if any field is absent; the validator guarantees this
    /// cannot happen for a workflow that passed validation.
    pub fn new(policy: &Policy) -> Result<Self, PolicyViolation> {
        let missing = policy.missing_fields();
        if !missing.is_empty() {
            return Err(PolicyViolation(format!(
                "policy is incomplete (missing: {})",
                missing.join(", ")
            )));
        }

        Ok(Self {
            timeout: Duration::from_secs(policy.timeout_seconds.unwrap_or_default()),
            max_files: policy.max_files.unwrap_or_default(),
            max_edits: policy.max_edits.unwrap_or_default(),
            allowed_paths: policy.allowed_paths.clone().unwrap_or_default(),
            command_allowlist: policy.command_allowlist.clone().unwrap_or_default(),
            counters: PolicyCounters::default(),
        })
    }

    /// The step's wall-clock deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Checks a prospective file read.
    pub fn check_read(&mut self, path: &str) -> Decision {
        if !self.path_allowed(path) {
            return self.deny(format!("path '{}' matches no allowed pattern", path));
        }
        if self.counters.files_read >= self.max_files {
            return self.deny(format!("file quota of {} reached", self.max_files));
        }
        self.counters.files_read += 1;
        Decision::Allowed
    }

    /// Checks a prospective file edit.
    pub fn check_edit(&mut self, path: &str) -> Decision {
        if !self.path_allowed(path) {
            return self.deny(format!("path '{}' matches no allowed pattern", path));
        }
        if self.counters.edits_made >= self.max_edits {
            return self.deny(format!("edit quota of {} reached", self.max_edits));
        }
        self.counters.edits_made += 1;
        Decision::Allowed
    }

    /// Checks a prospective command execution.
    ///
    /// The command's program (its first token) must exactly match an
    /// allowlist entry. An empty allowlist denies all commands.
    pub fn check_command(&mut self, command: &str) -> Decision {
        let program = match command.split_whitespace().next() {
            Some(program) => program,
            None => return self.deny("empty command".to_string()),
        };
        if !self.command_allowlist.iter().any(|c| c == program) {
            return self.deny(format!("command '{}' is not allow-listed", program));
        }
        self.counters.commands_run += 1;
        Decision::Allowed
    }

    /// Snapshot of the observed operation counts.
    pub fn counters(&self) -> PolicyCounters {
        self.counters
    }

    /// True if any operation was denied during this step.
    pub fn had_denials(&self) -> bool {
        self.counters.denied_operations > 0
    }

    fn path_allowed(&self, path: &str) -> bool {
        self.allowed_paths.iter().any(|p| glob_match(p, path))
    }

    fn deny(&mut self, reason: String) -> Decision {
        self.counters.denied_operations += 1;
        warn!("Denied: {}", reason);
        Decision::Denied(reason)
    }
}

/// Matches a path against a glob pattern.
///
/// Supported syntax: `*` matches within one path segment, `**` crosses
/// segment boundaries, `?` matches a single non-separator character.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    match_bytes(pattern.as_bytes(), path.as_bytes())
}

fn match_bytes(pattern: &[u8], path: &[u8]) -> bool {
    if pattern.is_empty() {
        return path.is_empty();
    }

    match pattern[0] {
        b'*' => {
            if pattern.len() >= 2 && pattern[1] == b'*' {
                // `**` may swallow a following separator so "src/**"
                // also matches files directly under src/
                let rest = if pattern.len() >= 3 && pattern[2] == b'/' {
                    &pattern[3..]
                } else {
                    &pattern[2..]
                };
                for start in 0..=path.len() {
                    if match_bytes(rest, &path[start..]) {
                        return true;
                    }
                }
                false
            } else {
                let rest = &pattern[1..];
                for start in 0..=path.len() {
                    if match_bytes(rest, &path[start..]) {
                        return true;
                    }
                    if start < path.len() && path[start] == b'/' {
                        break;
                    }
                }
                false
            }
        }
        b'?' => {
            !path.is_empty() && path[0] != b'/' && match_bytes(&pattern[1..], &path[1..])
        }
        literal => {
            !path.is_empty() && path[0] == literal && match_bytes(&pattern[1..], &path[1..])
        }
    }
}
