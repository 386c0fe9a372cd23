//! Artifact Store
//!
//! Owns the run-scoped directory and every write into it. The store is
//! the single durability point of the engine: the canonical
//! `run-state.json` and all per-step artifacts go through it, text
//! artifacts are redacted at this boundary, and every file is written
//! atomically (temp file + rename) so a crash never leaves a truncated
//! record.
//!
//! Layout:
//!
//! ```text
//! <run_dir>/
//!   run-state.json
//!   <step_id>/
//!     policy.json      (agent steps)
//!     transcript.md    (agent steps)
//!     output.txt
//!     metrics.json     (agent steps)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use super::redact::redact;
use crate::execution::state::RunState;
use crate::workflow::model::Policy;

/// File name of the canonical run state.
pub const RUN_STATE_FILE: &str = "run-state.json";

/// Errors from artifact persistence. Write failures are fatal to a run:
/// persistence is a durability requirement, not best-effort.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact write failed at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact read failed at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run state at {path} is not valid JSON: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no run directory at {0}")]
    MissingRun(String),
}

/// Exclusive owner of one run's artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_dir: PathBuf,
}

impl ArtifactStore {
    /// Creates the run directory (and parents) for a fresh run.
    pub fn create(run_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir).map_err(|e| StoreError::Write {
            path: run_dir.display().to_string(),
            source: e,
        })?;
        info!("Run directory: {}", run_dir.display());
        Ok(Self { run_dir })
    }

    /// Opens an existing run directory for resume.
    pub fn open(run_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let run_dir = run_dir.into();
        if !run_dir.is_dir() {
            return Err(StoreError::MissingRun(run_dir.display().to_string()));
        }
        Ok(Self { run_dir })
    }

    /// The run directory this store owns.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// The artifact directory for one step, created on demand.
    pub fn step_dir(&self, step_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.run_dir.join(step_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::Write {
            path: dir.display().to_string(),
            source: e,
        })?;
        Ok(dir)
    }

    /// Writes a step's `output.txt`, redacted. Returns the run-relative
    /// reference recorded in the step result.
    pub fn write_output(&self, step_id: &str, text: &str) -> Result<String, StoreError> {
        let path = self.step_dir(step_id)?.join("output.txt");
        write_atomic(&path, redact(text).as_bytes())?;
        Ok(format!("{}/output.txt", step_id))
    }

    /// Writes a step's `transcript.md`, redacted.
    pub fn write_transcript(&self, step_id: &str, text: &str) -> Result<(), StoreError> {
        let path = self.step_dir(step_id)?.join("transcript.md");
        write_atomic(&path, redact(text).as_bytes())
    }

    /// Reads a previously persisted transcript.
    pub fn read_transcript(&self, step_id: &str) -> Result<String, StoreError> {
        let path = self.run_dir.join(step_id).join("transcript.md");
        fs::read_to_string(&path).map_err(|e| StoreError::Read {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Writes the exact policy a step ran under.
    ///
    /// Not redacted: the policy is enforcement input, and the written
    /// record must match what the enforcer actually used, byte for byte.
    pub fn write_policy(&self, step_id: &str, policy: &Policy) -> Result<(), StoreError> {
        let path = self.step_dir(step_id)?.join("policy.json");
        let json = encode_json(&path, policy)?;
        write_atomic(&path, &json)
    }

    /// Writes a step's execution metrics.
    pub fn write_metrics<M: Serialize>(
        &self,
        step_id: &str,
        metrics: &M,
    ) -> Result<(), StoreError> {
        let path = self.step_dir(step_id)?.join("metrics.json");
        let json = encode_json(&path, metrics)?;
        write_atomic(&path, &json)
    }

    /// Reads a step's `metrics.json` back as untyped JSON.
    pub fn read_metrics(&self, step_id: &str) -> Result<serde_json::Value, StoreError> {
        let path = self.run_dir.join(step_id).join("metrics.json");
        let text = fs::read_to_string(&path).map_err(|e| StoreError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| StoreError::Decode {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Persists the canonical run state. This is the durability point
    /// that makes resume possible; it happens after every step.
    pub fn save_state(&self, state: &RunState) -> Result<(), StoreError> {
        let path = self.run_dir.join(RUN_STATE_FILE);
        let json = encode_json(&path, state)?;
        write_atomic(&path, &json)?;
        debug!("Saved run state to {}", path.display());
        Ok(())
    }

    /// Loads the canonical run state from a run directory.
    pub fn load_state(run_dir: &Path) -> Result<RunState, StoreError> {
        let path = run_dir.join(RUN_STATE_FILE);
        if !path.is_file() {
            return Err(StoreError::MissingRun(run_dir.display().to_string()));
        }
        let text = fs::read_to_string(&path).map_err(|e| StoreError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| StoreError::Decode {
            path: path.display().to_string(),
            source: e,
        })
    }
}

fn encode_json<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|e| StoreError::Write {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

/// Writes via a temp file and rename so readers never observe a
/// half-written artifact.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| StoreError::Write {
        path: tmp.display().to_string(),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| StoreError::Write {
        path: path.display().to_string(),
        source: e,
    })
}
