//! ops-health - kill-switch evaluation for operational state files
//!
//! Reads a subject state (JSON) and a policy (YAML + `OPS_HEALTH_*` env),
//! and prints the resulting signal or score breakdown as JSON.

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use tracing::info;

use ops_health_core::{
    OpsState,
    cli::{Cli, Command},
    config::Config,
    scorer::health_breakdown,
    setup_tracing, update_kill_switch,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.as_deref().or(config.logging.format.as_deref());
    if let Err(e) = setup_tracing(level, format) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Evaluate {
            state,
            now,
            write_back,
        } => run_evaluate(&config, &state, now, write_back),
        Command::Score { state, now } => run_score(&config, &state, now),
        Command::Policy => run_policy(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the kill switch and print the signal. Exits with 2 when actions are denied.
fn run_evaluate(
    config: &Config,
    path: &Path,
    now: Option<i64>,
    write_back: bool,
) -> anyhow::Result<ExitCode> {
    let mut state = read_state(path)?;
    let now_ms = now.map_or_else(system_now_ms, Ok)?;

    let signal = update_kill_switch(&mut state, &config.policy, now_ms);
    info!(
        state = %signal.state,
        score = signal.score,
        deny_actions = signal.deny_actions,
        "Evaluated kill switch"
    );

    if write_back {
        let json = serde_json::to_string_pretty(&state)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    println!("{}", serde_json::to_string_pretty(&signal)?);

    Ok(if signal.deny_actions {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

/// Print the score breakdown without touching the state file.
fn run_score(config: &Config, path: &Path, now: Option<i64>) -> anyhow::Result<ExitCode> {
    let state = read_state(path)?;
    let now_ms = now.map_or_else(system_now_ms, Ok)?;

    let breakdown = health_breakdown(&state, &config.policy, now_ms)
        .map_err(|e| anyhow::anyhow!("scoring failed ({})", e.category()))?;

    println!("{}", serde_json::to_string_pretty(&breakdown)?);
    Ok(ExitCode::SUCCESS)
}

/// Validate and print the effective policy.
fn run_policy(config: &Config) -> anyhow::Result<ExitCode> {
    config.policy.validate()?;
    print!("{}", serde_yaml::to_string(&config.policy)?);
    Ok(ExitCode::SUCCESS)
}

fn read_state(path: &Path) -> anyhow::Result<OpsState> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn system_now_ms() -> anyhow::Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the Unix epoch")?;
    i64::try_from(elapsed.as_millis()).context("system clock out of range")
}
