//! Apply-Diff Step Execution
//!
//! Parses unified-diff blocks out of a prior agent step's persisted
//! transcript and applies them to the working tree behind an explicit
//! approval gate.
//!
//! `approve: false` yields a "blocked pending approval" result (not an
//! error) and the run halts with a human-actionable message.
//! `approve: true` snapshots every file the diff touches into the
//! step's `backup/` directory before the first write; any failure
//! restores all touched files from those snapshots.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info, warn};

use super::state::{StepResult, StepStatus};
use super::step::{RunContext, StepExecutor};
use super::EngineError;
use crate::workflow::model::StepDefinition;

/// Executor for `apply_diff` steps.
pub struct ApplyDiffExecutor;

impl StepExecutor for ApplyDiffExecutor {
    fn execute(
        &self,
        step: &StepDefinition,
        ctx: &RunContext<'_>,
    ) -> Result<StepResult, EngineError> {
        let StepDefinition::ApplyDiff {
            id,
            source_step,
            approve,
        } = step
        else {
            return Err(EngineError::Step {
                step_id: step.id().to_string(),
                message: format!("apply-diff executor received a '{}' step", step.kind()),
            });
        };

        let start_time = Utc::now();

        if !*approve {
            let message = format!(
                "blocked pending approval: set `approve: true` on step '{}' and resume the run",
                id
            );
            warn!("Step '{}': {}", id, message);
            let output_ref = ctx.store.write_output(id, &message)?;
            return Ok(StepResult {
                step_id: id.clone(),
                status: StepStatus::Skipped,
                exit_code: None,
                start_time,
                end_time: Utc::now(),
                output_ref,
                error_message: Some(message),
            });
        }

        let transcript = match ctx.store.read_transcript(source_step) {
            Ok(transcript) => transcript,
            Err(e) => {
                let message = format!(
                    "no transcript available from step '{}': {}",
                    source_step, e
                );
                let output_ref = ctx.store.write_output(id, &message)?;
                return Ok(failed(id, start_time, output_ref, message));
            }
        };

        let patches = parse_unified_diff(&transcript);
        if patches.is_empty() {
            let message = format!(
                "transcript of step '{}' contains no unified diff",
                source_step
            );
            let output_ref = ctx.store.write_output(id, &message)?;
            return Ok(failed(id, start_time, output_ref, message));
        }

        // Snapshot every touched file before the first write
        let backup_dir = ctx.store.step_dir(id)?.join("backup");
        let mut touched: Vec<(PathBuf, Option<PathBuf>)> = Vec::new();
        for patch in &patches {
            let target = ctx.work_dir.join(&patch.path);
            if target.is_file() {
                let backup_path = backup_dir.join(&patch.path);
                if let Some(parent) = backup_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| backup_error(id, parent, e))?;
                }
                fs::copy(&target, &backup_path).map_err(|e| backup_error(id, &target, e))?;
                debug!("Backed up {} -> {}", target.display(), backup_path.display());
                touched.push((target, Some(backup_path)));
            } else {
                touched.push((target, None));
            }
        }

        for patch in &patches {
            if let Err(reason) = apply_patch(&ctx.work_dir, patch) {
                restore(&touched);
                let message = format!(
                    "failed to apply diff to '{}': {}; all touched files restored from backup",
                    patch.path, reason
                );
                let output_ref = ctx.store.write_output(id, &message)?;
                return Ok(failed(id, start_time, output_ref, message));
            }
        }

        let applied: Vec<&str> = patches.iter().map(|p| p.path.as_str()).collect();
        info!("Step '{}': applied diff to {} file(s)", id, applied.len());
        let summary = format!("applied {} file(s):\n{}\n", applied.len(), applied.join("\n"));
        let output_ref = ctx.store.write_output(id, &summary)?;

        Ok(StepResult {
            step_id: id.clone(),
            status: StepStatus::Completed,
            exit_code: None,
            start_time,
            end_time: Utc::now(),
            output_ref,
            error_message: None,
        })
    }
}

fn failed(
    id: &str,
    start_time: chrono::DateTime<Utc>,
    output_ref: String,
    message: String,
) -> StepResult {
    StepResult {
        step_id: id.to_string(),
        status: StepStatus::Failed,
        exit_code: None,
        start_time,
        end_time: Utc::now(),
        output_ref,
        error_message: Some(message),
    }
}

fn backup_error(id: &str, path: &Path, source: std::io::Error) -> EngineError {
    EngineError::Step {
        step_id: id.to_string(),
        message: format!("failed to back up {}: {}", path.display(), source),
    }
}

/// Restores every touched file: backed-up files are copied back,
/// freshly created files are removed.
fn restore(touched: &[(PathBuf, Option<PathBuf>)]) {
    for (target, backup) in touched {
        match backup {
            Some(backup) => {
                if let Err(e) = fs::copy(backup, target) {
                    warn!("Failed to restore {}: {}", target.display(), e);
                }
            }
            None => {
                let _ = fs::remove_file(target);
            }
        }
    }
}

/// One file's worth of diff.
#[derive(Debug)]
struct FilePatch {
    path: String,
    is_new: bool,
    hunks: Vec<Hunk>,
}

#[derive(Debug)]
struct Hunk {
    /// 1-based line the hunk starts at in the old file (0 for new files)
    old_start: usize,
    lines: Vec<HunkLine>,
}

#[derive(Debug)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// Extracts unified-diff file patches from free-form transcript text.
///
/// Lines outside `---`/`+++`/`@@` structure are ignored, so prose
/// around the diff does not confuse the parser. Deletions and paths
/// escaping the working tree are not applied.
fn parse_unified_diff(text: &str) -> Vec<FilePatch> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut pending_old: Option<String> = None;
    let mut have_current = false;
    let mut in_hunk = false;

    for raw in text.lines() {
        if let Some(rest) = raw.strip_prefix("--- ") {
            pending_old = Some(rest.trim().to_string());
            have_current = false;
            in_hunk = false;
            continue;
        }
        if let Some(rest) = raw.strip_prefix("+++ ") {
            if let Some(old) = pending_old.take() {
                if let Some(path) = normalize_diff_path(rest.trim()) {
                    patches.push(FilePatch {
                        path,
                        is_new: old == "/dev/null",
                        hunks: Vec::new(),
                    });
                    have_current = true;
                }
            }
            in_hunk = false;
            continue;
        }
        if raw.starts_with("@@") {
            in_hunk = false;
            if have_current {
                if let (Some(patch), Some(start)) = (patches.last_mut(), parse_hunk_header(raw)) {
                    patch.hunks.push(Hunk {
                        old_start: start,
                        lines: Vec::new(),
                    });
                    in_hunk = true;
                }
            }
            continue;
        }
        if in_hunk {
            let hunk = patches
                .last_mut()
                .and_then(|p| p.hunks.last_mut());
            let Some(hunk) = hunk else {
                in_hunk = false;
                continue;
            };
            if let Some(text) = raw.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(text.to_string()));
            } else if let Some(text) = raw.strip_prefix('-') {
                hunk.lines.push(HunkLine::Remove(text.to_string()));
            } else if let Some(text) = raw.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(text.to_string()));
            } else {
                // blank or prose line: the hunk is over
                in_hunk = false;
            }
        }
    }

    patches.retain(|p| !p.hunks.is_empty());
    patches
}

/// Strips `a/`/`b/` prefixes and rejects unusable targets: `/dev/null`,
/// absolute paths, and anything traversing out of the working tree.
fn normalize_diff_path(raw: &str) -> Option<String> {
    if raw == "/dev/null" {
        return None;
    }
    let path = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    if path.is_empty() || path.starts_with('/') {
        return None;
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return None;
    }
    Some(path.to_string())
}

/// Parses the old-file start line out of `@@ -l,c +l,c @@`.
fn parse_hunk_header(line: &str) -> Option<usize> {
    let rest = line.strip_prefix("@@ -")?;
    let end = rest.find(|c: char| c == ',' || c == ' ')?;
    rest[..end].parse().ok()
}

/// Applies one file's hunks, verifying context and removal lines.
fn apply_patch(work_dir: &Path, patch: &FilePatch) -> Result<(), String> {
    let target = work_dir.join(&patch.path);

    let original: Vec<String> = if target.is_file() {
        fs::read_to_string(&target)
            .map_err(|e| format!("cannot read target: {}", e))?
            .lines()
            .map(|l| l.to_string())
            .collect()
    } else if patch.is_new {
        Vec::new()
    } else {
        return Err("target file does not exist".to_string());
    };

    let mut result: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    for hunk in &patch.hunks {
        let hunk_start = hunk.old_start.saturating_sub(1);
        if hunk_start < cursor {
            return Err("overlapping hunks".to_string());
        }
        if hunk_start > original.len() {
            return Err(format!(
                "hunk starts at line {} but the file has {} lines",
                hunk.old_start,
                original.len()
            ));
        }
        result.extend(original[cursor..hunk_start].iter().cloned());
        cursor = hunk_start;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) => {
                    if original.get(cursor).map(String::as_str) != Some(text.as_str()) {
                        return Err(format!("context mismatch at line {}", cursor + 1));
                    }
                    result.push(text.clone());
                    cursor += 1;
                }
                HunkLine::Remove(text) => {
                    if original.get(cursor).map(String::as_str) != Some(text.as_str()) {
                        return Err(format!("removed line mismatch at line {}", cursor + 1));
                    }
                    cursor += 1;
                }
                HunkLine::Add(text) => {
                    result.push(text.clone());
                }
            }
        }
    }

    result.extend(original[cursor..].iter().cloned());

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("cannot create parent: {}", e))?;
    }
    let mut content = result.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(&target, content).map_err(|e| format!("cannot write target: {}", e))
}
