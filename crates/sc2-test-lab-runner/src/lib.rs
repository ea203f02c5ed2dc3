//! Process side of the test lab: configuration, batch launching, artifact
//! lookup and log setup.

pub mod artifacts;
pub mod config;
pub mod launcher;
pub mod logging;

pub use artifacts::{ArtifactLocator, ReplayViewer};
pub use config::{load_config, parse_config, LabConfig, LaunchMode};
pub use launcher::{
    CommandSpec, JobLauncher, LaunchError, LaunchReport, LaunchedJob, OsProcessSpawner,
    ProcessSpawner,
};
#[cfg(any(test, feature = "test-support"))]
pub use launcher::RecordingSpawner;
pub use logging::init_tracing;
