//! Workflow Parser
//!
//! Handles loading workflow definitions from YAML files and expanding
//! `${VAR}` environment placeholders at spawn time. Validation never
//! reads the environment; placeholders stay intact in the typed
//! definition until the runner resolves them for a subprocess.

use std::fs;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::model::WorkflowDefinition;
use super::validator::{validate, Violation};

/// `${VAR}` placeholder pattern.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder pattern"));

/// Errors from loading a workflow file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read workflow file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow validation failed with {} violation(s)", .0.len())]
    Invalid(Vec<Violation>),
}

/// Loads and validates a workflow definition from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use agentflow::workflow::parser::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_definition("workflow.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: &str) -> Result<WorkflowDefinition, LoadError> {
    info!("Loading workflow from: {}", path);

    let text = fs::read_to_string(path).map_err(|e| LoadError::Read {
        path: path.to_string(),
        source: e,
    })?;

    debug!("Workflow text loaded ({} bytes)", text.len());

    validate(&text).map_err(LoadError::Invalid)
}

/// Expands `${VAR}` placeholders from the process environment.
///
/// Unknown variables are left intact so a misconfigured environment
/// shows up verbatim in logs instead of silently becoming empty.
pub fn expand_placeholders(text: &str) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
