//! `lab` operator CLI for the SC2 bot test lab.
//!
//! The bot runner reports results through `lab matches complete`; the other
//! commands mirror what the dashboard does (launch a batch, render the batch
//! and map reports) so they can be scripted without the HTTP service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use sc2_test_lab_core::{
    map_breakdown_view, match_list_view, now_utc, parse_rfc3339_utc, MatchCompletion,
    MatchFilter, MatchResult,
};
use sc2_test_lab_runner::{
    load_config, JobLauncher, LabConfig, OsProcessSpawner, ProcessSpawner,
};
use sc2_test_lab_store_sqlite::SqliteMatchStore;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lab")]
#[command(about = "SC2 bot test lab CLI")]
pub struct Cli {
    #[arg(long, default_value = "./sc2_test_lab.sqlite3")]
    db: PathBuf,

    /// YAML lab configuration; `sc2_test_lab.yaml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Matches {
        #[command(subcommand)]
        command: MatchesCommand,
    },
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum MatchesCommand {
    List(ListArgs),
    Complete(CompleteArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    difficulty: Option<String>,
    /// Include matches outside any tracked batch (test group -1).
    #[arg(long)]
    include_untracked: bool,
}

#[derive(Debug, Args)]
pub struct CompleteArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    result: String,
    #[arg(long)]
    map_name: Option<String>,
    /// In-game seconds.
    #[arg(long)]
    duration: Option<f64>,
    #[arg(long)]
    ended_at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum BatchCommand {
    Launch(DifficultyArgs),
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Batches(DifficultyArgs),
    Maps(DifficultyArgs),
}

#[derive(Debug, Args)]
pub struct DifficultyArgs {
    #[arg(long)]
    difficulty: Option<String>,
}

/// Executes the parsed CLI and prints the JSON result to stdout.
///
/// # Errors
/// Returns an error when configuration loading, store access, or the command
/// itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let mut store = SqliteMatchStore::open(&cli.db)?;
    store.migrate()?;

    let output = run_command(cli.command, &mut store, &config, Arc::new(OsProcessSpawner))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes one command against an already migrated store.
///
/// # Errors
/// Returns an error when argument validation, persistence, or launching fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteMatchStore,
    config: &LabConfig,
    spawner: Arc<dyn ProcessSpawner>,
) -> Result<Value> {
    match command {
        Command::Migrate => Ok(json!({ "status": "migrated" })),
        Command::Matches { command } => run_matches(command, store),
        Command::Batch {
            command: BatchCommand::Launch(args),
        } => {
            let batch_id = store.next_test_group_id()?;
            let launcher = JobLauncher::new(config.launcher.clone(), spawner);
            let report = launcher
                .launch_batch(store, batch_id, args.difficulty.as_deref())
                .map_err(|err| anyhow!("{err}"))?;
            Ok(serde_json::to_value(report)?)
        }
        Command::Report { command } => run_report(command, store),
    }
}

fn run_matches(command: MatchesCommand, store: &SqliteMatchStore) -> Result<Value> {
    match command {
        MatchesCommand::List(args) => {
            let mut filter = MatchFilter::dashboard(args.difficulty.as_deref());
            if args.include_untracked {
                filter.exclude_test_group = None;
            }
            Ok(serde_json::to_value(store.list_matches(&filter)?)?)
        }
        MatchesCommand::Complete(args) => {
            let completion = MatchCompletion {
                result: MatchResult::parse(&args.result),
                map_name: args.map_name,
                end_timestamp: parse_optional_utc(args.ended_at.as_deref())?,
                duration_in_game_time: args.duration,
            };
            let updated = store.complete_match(args.id, &completion)?;
            info!(
                event = "match_completed",
                match_id = updated.id,
                result = %updated.result
            );
            Ok(serde_json::to_value(updated)?)
        }
    }
}

fn run_report(command: ReportCommand, store: &SqliteMatchStore) -> Result<Value> {
    match command {
        ReportCommand::Batches(args) => {
            let matches = store.list_matches(&MatchFilter::dashboard(args.difficulty.as_deref()))?;
            Ok(serde_json::to_value(match_list_view(&matches))?)
        }
        ReportCommand::Maps(args) => {
            let matches = store.list_matches(&MatchFilter::dashboard(args.difficulty.as_deref()))?;
            Ok(serde_json::to_value(map_breakdown_view(&matches))?)
        }
    }
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).context("invalid --ended-at"),
        None => Ok(now_utc()),
    }
}
