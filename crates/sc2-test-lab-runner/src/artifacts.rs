use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use globset::Glob;
use tracing::{info, warn};

use crate::config::{ArtifactConfig, ViewerConfig};
use crate::launcher::{CommandSpec, ProcessSpawner};

const MATCH_ID_TOKEN: &str = "{match_id}";

/// Finds replay and log files for a match by filename convention.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    config: ArtifactConfig,
}

impl ArtifactLocator {
    #[must_use]
    pub fn new(config: ArtifactConfig) -> Self {
        Self { config }
    }

    /// # Errors
    /// Returns an error when the replay pattern is not a valid glob or the
    /// replay directory cannot be read.
    pub fn find_replay(&self, match_id: i64) -> Result<Option<PathBuf>> {
        find_artifact(
            "replay",
            self.config.replay_dir.as_deref(),
            &self.config.replay_pattern,
            match_id,
        )
    }

    /// # Errors
    /// Returns an error when the log pattern is not a valid glob or the log
    /// directory cannot be read.
    pub fn find_log(&self, match_id: i64) -> Result<Option<PathBuf>> {
        find_artifact(
            "log",
            self.config.log_dir.as_deref(),
            &self.config.log_pattern,
            match_id,
        )
    }
}

/// Lexicographically first file in `dir` whose name matches `pattern` with the
/// match id substituted in.
fn find_artifact(
    kind: &str,
    dir: Option<&Path>,
    pattern: &str,
    match_id: i64,
) -> Result<Option<PathBuf>> {
    let Some(dir) = dir else {
        warn!(event = "artifact_dir_unset", kind = kind, match_id = match_id);
        return Ok(None);
    };
    if !dir.is_dir() {
        warn!(event = "artifact_dir_missing", kind = kind, dir = %dir.display());
        return Ok(None);
    }

    let pattern = pattern.replace(MATCH_ID_TOKEN, &match_id.to_string());
    let matcher = Glob::new(&pattern)
        .with_context(|| format!("invalid {kind} pattern: {pattern}"))?
        .compile_matcher();

    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if matcher.is_match(entry.file_name()) {
            candidates.push(entry.path());
        }
    }

    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Hands a replay file to the configured local viewer.
#[derive(Clone)]
pub struct ReplayViewer {
    config: ViewerConfig,
    spawner: Arc<dyn ProcessSpawner>,
}

impl ReplayViewer {
    #[must_use]
    pub fn new(config: ViewerConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { config, spawner }
    }

    /// # Errors
    /// Returns an error when no viewer is configured or it fails to start.
    pub fn open(&self, replay: &Path) -> Result<u32> {
        let program = self
            .config
            .program
            .as_ref()
            .ok_or_else(|| anyhow!("replay viewer is not configured"))?;

        let mut args = self.config.args.clone();
        args.push(replay.display().to_string());
        let command = CommandSpec {
            program: program.display().to_string(),
            args,
            working_dir: None,
        };

        let pid = self.spawner.spawn(&command)?;
        info!(event = "replay_opened", replay = %replay.display(), pid = pid);
        Ok(pid)
    }
}
