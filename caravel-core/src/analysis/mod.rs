//! Automated deployment analysis engine.
//!
//! The ANALYSIS pipeline stage decides, from live telemetry, whether a
//! freshly rolled-out workload is healthy enough for the deployment to
//! continue. The stage orchestrator spawns one analyzer per configured
//! check; each analyzer polls its provider on its own interval and applies
//! either a static threshold or a statistical comparison between
//! deployment variants. Any analyzer crossing its failure limit fails the
//! whole stage.

pub mod analyzer;
pub mod executor;
pub mod mann_whitney;
pub mod metrics;
pub mod template;

use thiserror::Error;

use crate::error::ConfigError;
use crate::pipeline::DeploySourceError;
use crate::providers::ProviderError;

pub use analyzer::{Analyzer, AnalyzerDriver};
pub use executor::{AnalysisExecutor, ExecutorInput, ELAPSED_TIME_KEY};
pub use mann_whitney::{
    ComparisonOutcome, Deviation, DeviationDirection, MannWhitneyResult,
    DEFAULT_SIGNIFICANCE_LEVEL,
};
pub use metrics::{
    DynamicMetricsDriver, HttpAnalyzerDriver, LogAnalyzerDriver, MetricsAnalyzerDriver,
};
pub use template::{
    render, resolve_http_check, resolve_log_check, resolve_metrics_check, TemplateArgs,
};

/// Errors raised while spawning or running the analysis stage.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("missing analysis configuration for the analysis stage")]
    MissingConfiguration,
    #[error("invalid analysis configuration: {0}")]
    InvalidConfiguration(String),
    #[error("analysis template {0} not found despite template specified")]
    TemplateNotFound(String),
    #[error("failed to render analysis template: {0}")]
    Render(String),
    #[error("unknown provider name {0}")]
    UnknownProvider(String),
    #[error("failed to prepare running deploy source: {0}")]
    DeploySource(#[from] DeploySourceError),
    #[error("[{id}] analysis by {provider} failed: {reason}")]
    AnalyzerFailed {
        id: String,
        provider: String,
        reason: String,
    },
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
