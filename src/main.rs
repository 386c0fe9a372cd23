//! AgentFlow CLI Entry Point
//!
//! Command-line interface for the workflow engine.
//!
//! # Usage
//!
//! ```bash
//! # Validate a workflow definition
//! agentflow validate workflow.yaml
//!
//! # Execute a workflow
//! agentflow run workflow.yaml
//!
//! # Preview without executing
//! agentflow run workflow.yaml --dry-run
//!
//! # Resume a halted run at its failed step
//! agentflow resume 7c0fcb7e-... --from apply_fix
//!
//! # Render the step graph
//! agentflow diagram workflow.yaml --output flow.mmd
//! ```

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use agentflow::execution::{RunOptions, RunOutcome, RunStatus, WorkflowRunner};
use agentflow::workflow::parser::{load_definition, LoadError};
use agentflow::workflow::{diagram, validate, WorkflowDefinition};
use agentflow::{APP_NAME, VERSION};

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "agentflow",
    version,
    about = "Policy-constrained workflow runner for coding agents",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct RootArgs {
    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
enum Command {
    Validate(ValidateArgs),
    Run(RunArgs),
    Resume(ResumeArgs),
    Diagram(DiagramArgs),
}

/// Validate a workflow definition without executing anything.
#[derive(Parser, Debug)]
#[command(about = "Validate a workflow definition")]
struct ValidateArgs {
    /// Path to the workflow YAML file
    file: String,
}

/// Execute a workflow from the start.
#[derive(Parser, Debug)]
#[command(about = "Execute a workflow")]
struct RunArgs {
    /// Path to the workflow YAML file
    file: String,

    /// Preview steps without executing or creating a run directory
    #[arg(long)]
    dry_run: bool,

    /// Override the artifacts directory root
    #[arg(long, value_name = "DIR")]
    artifacts_dir: Option<PathBuf>,

    /// Working directory for file operations and commands
    #[arg(long, value_name = "DIR")]
    working_dir: Option<PathBuf>,
}

/// Resume a previously halted run.
#[derive(Parser, Debug)]
#[command(about = "Resume a halted run at a step")]
struct ResumeArgs {
    /// Run id reported by the failed invocation
    run_id: String,

    /// Step id to resume from
    #[arg(long, value_name = "STEP")]
    from: String,

    /// Revised workflow file replacing the stored snapshot
    /// (e.g. after flipping an apply_diff approval to true)
    #[arg(long, value_name = "FILE")]
    file: Option<String>,

    /// Artifacts directory root the run was created under
    #[arg(long, value_name = "DIR")]
    artifacts_dir: Option<PathBuf>,

    /// Working directory for file operations and commands
    #[arg(long, value_name = "DIR")]
    working_dir: Option<PathBuf>,
}

/// Render a workflow's step graph.
#[derive(Parser, Debug)]
#[command(about = "Render a workflow's step graph as Mermaid text")]
struct DiagramArgs {
    /// Path to the workflow YAML file
    file: String,

    /// Write the diagram here instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Policy-constrained workflow runner");
    println!();
}

/// Loads a workflow file, printing violations on validation failure.
fn load_workflow(path: &str) -> Result<WorkflowDefinition, Box<dyn Error>> {
    match load_definition(path) {
        Ok(workflow) => Ok(workflow),
        Err(LoadError::Invalid(violations)) => {
            eprintln!("{} {} violation(s):", "invalid".red(), violations.len());
            for violation in &violations {
                eprintln!("  {}", violation);
            }
            Err(format!("workflow '{}' failed validation", path).into())
        }
        Err(e) => Err(e.to_string().into()),
    }
}

fn cmd_validate(args: ValidateArgs) -> Result<ExitCode, Box<dyn Error>> {
    let text = fs::read_to_string(&args.file)
        .map_err(|e| format!("could not read '{}': {}", args.file, e))?;

    match validate(&text) {
        Ok(workflow) => {
            println!(
                "{} workflow '{}' is valid: {} step(s)",
                "ok".green(),
                workflow.name,
                workflow.steps.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(violations) => {
            eprintln!("{} {} violation(s):", "invalid".red(), violations.len());
            for violation in &violations {
                eprintln!("  {}", violation);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn cmd_run(args: RunArgs) -> Result<ExitCode, Box<dyn Error>> {
    print_banner();
    let workflow = load_workflow(&args.file)?;

    let options = RunOptions {
        dry_run: args.dry_run,
        artifacts_root: args.artifacts_dir,
        work_dir: args.working_dir,
        ..Default::default()
    };
    let runner = WorkflowRunner::new();
    let outcome = runner.run(workflow, &options)?;

    Ok(report(&outcome))
}

fn cmd_resume(args: ResumeArgs) -> Result<ExitCode, Box<dyn Error>> {
    print_banner();
    let refreshed = match &args.file {
        Some(path) => Some(load_workflow(path)?),
        None => None,
    };

    let options = RunOptions {
        dry_run: false,
        artifacts_root: args.artifacts_dir,
        work_dir: args.working_dir,
        ..Default::default()
    };
    let runner = WorkflowRunner::new();
    let outcome = runner.resume(&args.run_id, &args.from, refreshed, &options)?;

    Ok(report(&outcome))
}

fn cmd_diagram(args: DiagramArgs) -> Result<ExitCode, Box<dyn Error>> {
    let workflow = load_workflow(&args.file)?;
    let text = diagram::render(&workflow);

    match &args.output {
        Some(path) => {
            fs::write(path, &text)
                .map_err(|e| format!("could not write '{}': {}", path.display(), e))?;
            println!("Diagram written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(ExitCode::SUCCESS)
}

/// Prints the outcome and, on failure, the exact resume invocation.
fn report(outcome: &RunOutcome) -> ExitCode {
    match outcome.status {
        RunStatus::Completed => {
            println!("Run {} {}", outcome.run_id, "completed".green());
            ExitCode::SUCCESS
        }
        _ => {
            println!("Run {} {}", outcome.run_id, "failed".red());
            if let Some(step) = &outcome.failed_step {
                println!("Failed at step: {}", step);
                println!(
                    "Resume with: agentflow resume {} --from {}",
                    outcome.run_id, step
                );
            }
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let args = RootArgs::parse();
    setup_logging(args.verbose);

    let result = match args.command {
        Command::Validate(args) => cmd_validate(args),
        Command::Run(args) => cmd_run(args),
        Command::Resume(args) => cmd_resume(args),
        Command::Diagram(args) => cmd_diagram(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
