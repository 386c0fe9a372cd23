//! Policy Enforcement Module
//!
//! Implements the least-privilege execution policy attached to agent
//! steps: path globs, command allowlists, and file/edit quotas.

pub mod enforcer;

pub use enforcer::{glob_match, Decision, PolicyCounters, PolicyEnforcer, PolicyViolation};
