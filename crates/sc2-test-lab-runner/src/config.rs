use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "sc2_test_lab.yaml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabConfig {
    pub launcher: LauncherConfig,
    pub artifacts: ArtifactConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// One `docker compose run` per opponent combination.
    #[default]
    Compose,
    /// A single script invocation that registers and plays its own matches.
    Script,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub mode: LaunchMode,
    pub docker_program: String,
    pub compose_file: Option<PathBuf>,
    pub compose_service: String,
    pub working_dir: Option<PathBuf>,
    pub script_interpreter: String,
    pub script_args: Vec<String>,
    pub script_path: Option<PathBuf>,
    pub default_difficulty: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Compose,
            docker_program: "docker".to_string(),
            compose_file: None,
            compose_service: "bot".to_string(),
            working_dir: None,
            script_interpreter: "powershell.exe".to_string(),
            script_args: vec![
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-File".to_string(),
            ],
            script_path: None,
            default_difficulty: "CheatInsane".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtifactConfig {
    pub replay_dir: Option<PathBuf>,
    pub replay_pattern: String,
    pub log_dir: Option<PathBuf>,
    pub log_pattern: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            replay_dir: None,
            replay_pattern: "{match_id}_*.SC2Replay".to_string(),
            log_dir: None,
            log_pattern: "{match_id}_*.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

/// Loads the YAML configuration. Without an explicit path the default file is
/// used when present, otherwise built-in defaults apply.
///
/// # Errors
/// Returns an error when the file cannot be read or is not valid YAML for
/// [`LabConfig`].
pub fn load_config(path: Option<&Path>) -> Result<LabConfig> {
    let path = match path {
        Some(explicit) => explicit.to_path_buf(),
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                return Ok(LabConfig::default());
            }
            fallback.to_path_buf()
        }
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config file {}", path.display()))
}

/// # Errors
/// Returns an error when the YAML does not describe a [`LabConfig`].
pub fn parse_config(yaml: &str) -> Result<LabConfig> {
    if yaml.trim().is_empty() {
        return Ok(LabConfig::default());
    }
    serde_yaml::from_str(yaml).context("invalid lab config YAML structure")
}
