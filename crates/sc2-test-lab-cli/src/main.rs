use anyhow::Result;
use clap::Parser;
use sc2_test_lab_cli::{run_cli, Cli};
use sc2_test_lab_runner::init_tracing;

fn main() -> Result<()> {
    if let Err(err) = init_tracing("warn") {
        eprintln!("{err:#}");
    }
    run_cli(Cli::parse())
}
