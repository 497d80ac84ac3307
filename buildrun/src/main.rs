//! Governed phase-by-phase build runner.
//!
//! Reads the plan at `.buildrun/plan.toml` and drives each phase through
//! propose, apply and verify attempts until the plan completes or a phase
//! stops the run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use buildrun::exit_codes;
use buildrun::executor::ExecutorDeps;
use buildrun::io::cancel::CancelToken;
use buildrun::io::checkpoint::GitCheckpoint;
use buildrun::io::ci::{ShellCiRunner, ci_result_from_output};
use buildrun::io::clock::SystemClock;
use buildrun::io::diagnostics::FailureDigest;
use buildrun::io::init::{BuildrunPaths, InitOptions, init_workspace};
use buildrun::io::proposer::CommandProposer;
use buildrun::io::supervisor::{LocalSupervisor, Supervisor, SupervisorApiClient};
use buildrun::logging;
use buildrun::run::{RunOptions, RunStatus, load_run_config, request_cancel, reset_phase, run_plan};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "buildrun",
    version,
    about = "Governed phase-by-phase build runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.buildrun/` with a default config and an empty plan.
    Init {
        /// Overwrite existing config and plan.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute the plan until it completes or a phase stops the run.
    Run {
        /// Plan file (default: `.buildrun/plan.toml`).
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Config file (default: `.buildrun/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Reset a BLOCKED or FAILED phase so the next run retries it.
    ResetPhase {
        /// Phase id from the plan.
        id: String,
    },
    /// Ask a running `buildrun run` to stop.
    Cancel,
    /// Parse a CI log and print the extracted counts as JSON.
    ParseCi {
        /// Path to the captured CI output.
        log: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run { plan, config } => cmd_run(
            &root,
            &RunOptions {
                plan_path: plan,
                config_path: config,
            },
        ),
        Command::ResetPhase { id } => cmd_reset_phase(&root, &id),
        Command::Cancel => cmd_cancel(&root),
        Command::ParseCi { log } => cmd_parse_ci(&log),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.buildrun_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, options: &RunOptions) -> Result<i32> {
    let paths = BuildrunPaths::new(root);
    let config = load_run_config(root, options)?;

    let proposer = CommandProposer::new(root, config.proposer.clone())?;
    let ci = ShellCiRunner::new(root, config.ci.clone(), &paths.ci_dir);
    let client = SupervisorApiClient::from_config(&config.supervisor)?;
    let supervisor: Box<dyn Supervisor> = match client {
        Some(client) => Box::new(client),
        None => Box::new(LocalSupervisor),
    };
    let checkpoint = GitCheckpoint::open(root, &paths.state_dir)?;
    let diagnostics = FailureDigest::default();
    let clock = SystemClock;
    let deps = ExecutorDeps {
        proposer: &proposer,
        ci: &ci,
        supervisor: supervisor.as_ref(),
        checkpoint: &checkpoint,
        diagnostics: &diagnostics,
        clock: &clock,
    };

    let cancel = CancelToken::with_sentinel(&paths.cancel_path);
    let outcome = run_plan(root, options, deps, cancel, |phase| {
        println!("{} {}", phase.id, phase.state);
    })?;
    match &outcome.status {
        RunStatus::Complete => println!("run {} complete", outcome.run_id),
        RunStatus::Blocked { phase_id } => {
            eprintln!("run {} blocked at phase {phase_id}", outcome.run_id);
        }
        RunStatus::Failed { phase_id } => {
            eprintln!("run {} failed at phase {phase_id}", outcome.run_id);
        }
        RunStatus::Cancelled { phase_id } => {
            eprintln!("run {} cancelled during phase {phase_id}", outcome.run_id);
        }
    }
    Ok(outcome.status.exit_code())
}

fn cmd_reset_phase(root: &Path, id: &str) -> Result<i32> {
    let phase = reset_phase(root, id)?;
    println!("{} {} (revision {})", phase.id, phase.state, phase.revision_epoch);
    Ok(exit_codes::OK)
}

fn cmd_cancel(root: &Path) -> Result<i32> {
    let path = request_cancel(root)?;
    println!("cancel requested ({})", path.display());
    Ok(exit_codes::OK)
}

fn cmd_parse_ci(log: &Path) -> Result<i32> {
    let bytes = fs::read(log).with_context(|| format!("read {}", log.display()))?;
    let output = String::from_utf8_lossy(&bytes);
    let mut result = ci_result_from_output(&output, None, false);
    result.log_path = Some(log.to_path_buf());
    let mut payload = serde_json::to_string_pretty(&result).context("serialize ci result")?;
    payload.push('\n');
    print!("{payload}");
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["buildrun", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_run_overrides() {
        let cli = Cli::parse_from(["buildrun", "run", "--plan", "p.toml", "--config", "c.toml"]);
        match cli.command {
            Command::Run { plan, config } => {
                assert_eq!(plan, Some(PathBuf::from("p.toml")));
                assert_eq!(config, Some(PathBuf::from("c.toml")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_reset_phase() {
        let cli = Cli::parse_from(["buildrun", "reset-phase", "p2"]);
        assert!(matches!(cli.command, Command::ResetPhase { id } if id == "p2"));
    }

    #[test]
    fn parse_ci_requires_log() {
        assert!(Cli::try_parse_from(["buildrun", "parse-ci"]).is_err());
    }
}
