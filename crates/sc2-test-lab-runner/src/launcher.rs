use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use sc2_test_lab_core::{MatchRegistry, NewMatch, BUILDS, RACES};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{LaunchMode, LauncherConfig};

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Starts a process and returns its pid without waiting for it to finish.
pub trait ProcessSpawner: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn spawn(&self, command: &CommandSpec) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessSpawner;

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(&self, command: &CommandSpec) -> Result<u32> {
        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &command.working_dir {
            process.current_dir(dir);
        }

        let mut child = process
            .spawn()
            .with_context(|| format!("failed to spawn `{command}`"))?;
        let pid = child.id();

        // Reap in the background so finished jobs do not linger as zombies.
        std::thread::spawn(move || match child.wait() {
            Ok(status) => debug!(event = "job_exited", pid = pid, status = %status),
            Err(err) => warn!(event = "job_wait_failed", pid = pid, error = %err),
        });

        Ok(pid)
    }
}

/// Records commands instead of running them.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingSpawner {
    commands: Arc<Mutex<Vec<CommandSpec>>>,
    fail_after: Option<usize>,
}

#[cfg(any(test, feature = "test-support"))]
impl RecordingSpawner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every spawn once `successes` commands have been recorded.
    #[must_use]
    pub fn failing_after(successes: usize) -> Self {
        Self {
            commands: Arc::default(),
            fail_after: Some(successes),
        }
    }

    #[must_use]
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl ProcessSpawner for RecordingSpawner {
    fn spawn(&self, command: &CommandSpec) -> Result<u32> {
        let mut commands = self
            .commands
            .lock()
            .map_err(|_| anyhow!("recording spawner lock poisoned"))?;
        if self.fail_after.is_some_and(|limit| commands.len() >= limit) {
            return Err(anyhow!("simulated spawn failure for `{command}`"));
        }
        commands.push(command.clone());
        Ok(u32::try_from(commands.len()).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Launch configuration is missing or points at nothing; nothing was started.
    #[error("{0}")]
    Precondition(String),
    #[error("failed to start test suite: {0:#}")]
    Failed(anyhow::Error),
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct LaunchedJob {
    pub match_id: Option<i64>,
    pub race: Option<String>,
    pub build: Option<String>,
    pub pid: u32,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct LaunchReport {
    pub batch_id: i64,
    /// Difficulty the jobs were started with. Empty when a script ran without
    /// an explicit difficulty and picked its own.
    pub difficulty: String,
    pub jobs: Vec<LaunchedJob>,
}

impl LaunchReport {
    #[must_use]
    pub fn launched(&self) -> usize {
        self.jobs.len()
    }
}

/// Fires off one batch of test matches. Jobs are not tracked after spawn.
#[derive(Clone)]
pub struct JobLauncher {
    config: LauncherConfig,
    spawner: Arc<dyn ProcessSpawner>,
}

impl JobLauncher {
    #[must_use]
    pub fn new(config: LauncherConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { config, spawner }
    }

    #[must_use]
    pub fn mode(&self) -> LaunchMode {
        self.config.mode
    }

    /// # Errors
    /// Returns [`LaunchError::Precondition`] when the configured compose file
    /// or script is unset or missing on disk.
    pub fn check_preconditions(&self) -> Result<(), LaunchError> {
        let (label, path) = match self.config.mode {
            LaunchMode::Compose => ("compose file", self.config.compose_file.as_ref()),
            LaunchMode::Script => ("test script", self.config.script_path.as_ref()),
        };

        let Some(path) = path else {
            return Err(LaunchError::Precondition(format!(
                "launch configuration missing: no {label} configured"
            )));
        };

        if !path.exists() {
            return Err(LaunchError::Precondition(format!(
                "{label} not found at: {}",
                path.display()
            )));
        }

        Ok(())
    }

    /// Registers and starts the batch. In compose mode one pending match is
    /// inserted through `registry` before each job is spawned; script mode
    /// starts a single process and registers nothing.
    ///
    /// # Errors
    /// Returns [`LaunchError::Precondition`] before anything is started, or
    /// [`LaunchError::Failed`] when registering or spawning fails part way;
    /// jobs already started keep running.
    pub fn launch_batch<R>(
        &self,
        registry: &mut R,
        batch_id: i64,
        difficulty: Option<&str>,
    ) -> Result<LaunchReport, LaunchError>
    where
        R: MatchRegistry,
        R::Error: Into<anyhow::Error>,
    {
        self.check_preconditions()?;

        let requested = difficulty.map(str::trim).filter(|value| !value.is_empty());
        let (difficulty, jobs) = match self.config.mode {
            LaunchMode::Compose => {
                let difficulty = requested.unwrap_or(&self.config.default_difficulty);
                let jobs = self.launch_compose_jobs(registry, batch_id, difficulty);
                (difficulty, jobs)
            }
            LaunchMode::Script => (requested.unwrap_or_default(), self.launch_script(requested)),
        };
        let jobs = jobs.map_err(LaunchError::Failed)?;

        let report = LaunchReport {
            batch_id,
            difficulty: difficulty.to_string(),
            jobs,
        };
        info!(
            event = "batch_launched",
            batch_id = batch_id,
            difficulty = %report.difficulty,
            launched = report.launched()
        );
        Ok(report)
    }

    fn launch_compose_jobs<R>(
        &self,
        registry: &mut R,
        batch_id: i64,
        difficulty: &str,
    ) -> Result<Vec<LaunchedJob>>
    where
        R: MatchRegistry,
        R::Error: Into<anyhow::Error>,
    {
        let mut jobs = Vec::with_capacity(RACES.len() * BUILDS.len());
        for race in RACES {
            for build in BUILDS {
                let new_match = NewMatch {
                    test_group_id: batch_id,
                    opponent_race: race.to_string(),
                    opponent_difficulty: difficulty.to_string(),
                    opponent_build: build.to_string(),
                };
                let match_id = registry.register_pending(&new_match).map_err(|err| {
                    let err: anyhow::Error = err.into();
                    err.context(format!("failed to register {race}-{difficulty}-{build}"))
                })?;

                let command = self.compose_command(match_id, race, build, difficulty);
                let pid = self.spawner.spawn(&command).inspect_err(|err| {
                    warn!(event = "job_spawn_failed", match_id = match_id, error = %err);
                })?;
                debug!(
                    event = "job_spawned",
                    match_id = match_id,
                    race = race,
                    build = build,
                    pid = pid
                );

                jobs.push(LaunchedJob {
                    match_id: Some(match_id),
                    race: Some(race.to_string()),
                    build: Some(build.to_string()),
                    pid,
                });
            }
        }
        Ok(jobs)
    }

    fn launch_script(&self, difficulty: Option<&str>) -> Result<Vec<LaunchedJob>> {
        let script = self
            .config
            .script_path
            .as_ref()
            .ok_or_else(|| anyhow!("no test script configured"))?;

        let mut args = self.config.script_args.clone();
        args.push(script.display().to_string());
        if let Some(difficulty) = difficulty {
            args.push("-Difficulty".to_string());
            args.push(difficulty.to_string());
        }

        let command = CommandSpec {
            program: self.config.script_interpreter.clone(),
            args,
            working_dir: self
                .config
                .working_dir
                .clone()
                .or_else(|| script.parent().map(PathBuf::from)),
        };
        let pid = self.spawner.spawn(&command)?;

        Ok(vec![LaunchedJob {
            match_id: None,
            race: None,
            build: None,
            pid,
        }])
    }

    fn compose_command(
        &self,
        match_id: i64,
        race: &str,
        build: &str,
        difficulty: &str,
    ) -> CommandSpec {
        let compose_file = self
            .config
            .compose_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();

        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            compose_file,
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
        ];
        for (name, value) in [
            ("MATCH_ID", match_id.to_string()),
            ("RACE", race.to_string()),
            ("BUILD", build.to_string()),
            ("DIFFICULTY", difficulty.to_string()),
        ] {
            args.push("-e".to_string());
            args.push(format!("{name}={value}"));
        }
        args.push(self.config.compose_service.clone());

        CommandSpec {
            program: self.config.docker_program.clone(),
            args,
            working_dir: self.config.working_dir.clone(),
        }
    }
}
