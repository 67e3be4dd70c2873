use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{load_deployment_config, ApplicationKind, DeploymentConfig};
use crate::error::ConfigError;

/// The application a pipeline deploys, as handed over by the pipeline engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub env: String,
    pub kind: ApplicationKind,
}

/// One stage of the running deployment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub status: StageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Running,
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageStatus::Running => "RUNNING",
            StageStatus::Success => "SUCCESS",
            StageStatus::Failure => "FAILURE",
            StageStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{label}")
    }
}

/// The externally delivered cancellation request and its intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopSignalKind {
    #[default]
    None,
    Terminate,
    Cancel,
}

/// Maps the received stop signal and the locally computed status into the
/// final stage status reported back to the pipeline engine.
pub fn determine_stage_status(
    signal: StopSignalKind,
    original: StageStatus,
    local: StageStatus,
) -> StageStatus {
    match signal {
        StopSignalKind::None => local,
        StopSignalKind::Terminate => original,
        StopSignalKind::Cancel => StageStatus::Cancelled,
    }
}

/// A prepared checkout of the currently running deployment revision.
#[derive(Debug, Clone)]
pub struct DeploySource {
    pub repo_dir: PathBuf,
    pub deployment_config: DeploymentConfig,
}

#[derive(Debug, Error)]
pub enum DeploySourceError {
    #[error("deploy source unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Supplies the repository snapshot the analysis stage reads its
/// configuration from.
#[async_trait]
pub trait DeploySourceProvider: Send + Sync {
    async fn get(&self) -> Result<DeploySource, DeploySourceError>;
}

/// Deploy source backed by an already checked-out local directory.
#[derive(Debug, Clone)]
pub struct LocalDeploySourceProvider {
    app_dir: PathBuf,
}

impl LocalDeploySourceProvider {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
        }
    }
}

#[async_trait]
impl DeploySourceProvider for LocalDeploySourceProvider {
    async fn get(&self) -> Result<DeploySource, DeploySourceError> {
        let deployment_config = load_deployment_config(&self.app_dir)?;
        Ok(DeploySource {
            repo_dir: self.app_dir.clone(),
            deployment_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determine_status_without_signal_keeps_local() {
        let status = determine_stage_status(
            StopSignalKind::None,
            StageStatus::Running,
            StageStatus::Success,
        );
        assert_eq!(status, StageStatus::Success);
    }

    #[test]
    fn determine_status_on_terminate_restores_original() {
        let status = determine_stage_status(
            StopSignalKind::Terminate,
            StageStatus::Running,
            StageStatus::Success,
        );
        assert_eq!(status, StageStatus::Running);
    }

    #[test]
    fn determine_status_on_cancel() {
        let status = determine_stage_status(
            StopSignalKind::Cancel,
            StageStatus::Running,
            StageStatus::Failure,
        );
        assert_eq!(status, StageStatus::Cancelled);
    }
}
