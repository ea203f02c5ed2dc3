use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Installs the stderr `fmt` subscriber shared by the `lab` CLI and the
/// dashboard. `RUST_LOG` overrides `default_level`.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| anyhow!("tracing subscriber already installed: {err}"))
}
