use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::analysis::mann_whitney::{Deviation, DEFAULT_SIGNIFICANCE_LEVEL};
use crate::error::{ConfigError, Result};

/// File name of the application deployment configuration inside an app directory.
pub const DEPLOYMENT_CONFIG_FILE: &str = "app.caravel.yaml";

/// File name of the optional analysis template document inside an app directory.
pub const ANALYSIS_TEMPLATE_FILE: &str = "analysis-template.yaml";

/// Agent-level configuration carrying the telemetry provider bindings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub providers: HashMap<String, AnalysisProviderConfig>,
}

impl AgentConfig {
    /// Look up a provider binding by the name referenced from analysis checks.
    pub fn analysis_provider(&self, name: &str) -> Option<&AnalysisProviderConfig> {
        self.providers.get(name)
    }
}

/// A single provider binding as declared in the agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Prometheus,
    Datadog,
    Stackdriver,
    Cloudwatch,
    Elasticsearch,
}

/// Kind of the deployed application, which decides the built-in template
/// variables available during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationKind {
    Kubernetes,
    Lambda,
}

/// Application-level deployment configuration loaded from the repository.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    pub kind: ApplicationKind,
    #[serde(default)]
    pub input: DeploymentInput,
    #[serde(default)]
    pub pipeline: PipelineSpec,
}

impl DeploymentConfig {
    /// Namespace the workload runs in, only meaningful for Kubernetes apps.
    pub fn namespace(&self) -> Option<String> {
        match self.kind {
            ApplicationKind::Kubernetes => Some(
                self.input
                    .namespace
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "default".to_string()),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentInput {
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One pipeline stage entry. Only ANALYSIS stages carry analysis options.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub analysis: Option<AnalysisStageOptions>,
}

/// Options of an ANALYSIS stage: total duration plus the configured checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStageOptions {
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub metrics: Vec<Templatable<AnalysisMetrics>>,
    #[serde(default)]
    pub logs: Vec<Templatable<AnalysisLog>>,
    #[serde(default)]
    pub https: Vec<Templatable<AnalysisHttp>>,
    #[serde(default)]
    pub dynamic: Option<AnalysisDynamic>,
}

impl AnalysisStageOptions {
    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(ConfigError::Invalid(
                "analysis duration must be greater than 0".to_string(),
            ));
        }
        let has_dynamic = self
            .dynamic
            .as_ref()
            .map(|d| !d.metrics.is_empty())
            .unwrap_or(false);
        if self.metrics.is_empty() && self.logs.is_empty() && self.https.is_empty() && !has_dynamic
        {
            return Err(ConfigError::Invalid(
                "at least one analysis check must be configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Either an inline check definition or a reference to a named template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Templatable<T> {
    Template { template: TemplateRef },
    Inline(T),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// A metrics check. Static checks require at least one expected bound;
/// the same shape doubles as a template entry for dynamic comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetrics {
    pub provider: String,
    pub query: String,
    #[serde(default)]
    pub expected: AnalysisExpected,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub failure_limit: u32,
    #[serde(default)]
    pub skip_on_no_data: bool,
    #[serde(default)]
    pub deviation: Deviation,
}

impl AnalysisMetrics {
    pub fn validate(&self) -> Result<()> {
        if self.provider.is_empty() {
            return Err(ConfigError::Invalid(
                "metrics check is missing the provider name".to_string(),
            ));
        }
        if self.query.is_empty() {
            return Err(ConfigError::Invalid(
                "metrics check is missing the query".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Validation for the static threshold mode, which additionally needs
    /// at least one expected bound to compare points against.
    pub fn validate_static(&self) -> Result<()> {
        self.validate()?;
        if self.expected.is_empty() {
            return Err(ConfigError::Invalid(
                "static metrics check requires at least one expected bound".to_string(),
            ));
        }
        Ok(())
    }
}

/// Inclusive value bounds a static metrics check asserts on every point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisExpected {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl AnalysisExpected {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn within(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Display for AnalysisExpected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => write!(f, "{min} <= value <= {max}"),
            (Some(min), None) => write!(f, "{min} <= value"),
            (None, Some(max)) => write!(f, "value <= {max}"),
            (None, None) => write!(f, "unbounded"),
        }
    }
}

/// A log check: the query matches offending log lines in the provider's window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisLog {
    pub provider: String,
    pub query: String,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub failure_limit: u32,
    #[serde(default)]
    pub skip_on_no_data: bool,
}

impl AnalysisLog {
    pub fn validate(&self) -> Result<()> {
        if self.provider.is_empty() {
            return Err(ConfigError::Invalid(
                "log check is missing the provider name".to_string(),
            ));
        }
        if self.query.is_empty() {
            return Err(ConfigError::Invalid(
                "log check is missing the query".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "log interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// An HTTP probe executed once per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisHttp {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<HttpHeader>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_expected_code")]
    pub expected_code: u16,
    #[serde(default)]
    pub expected_body: Option<String>,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde", default = "default_http_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub failure_limit: u32,
    #[serde(default)]
    pub skip_on_no_data: bool,
}

impl AnalysisHttp {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(ConfigError::Invalid(
                "http check is missing the url".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "http interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_expected_code() -> u16 {
    200
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Dynamic comparison block: a strategy plus template-backed metric entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDynamic {
    pub strategy: DynamicStrategy,
    #[serde(default)]
    pub metrics: Vec<DynamicMetricsEntry>,
    #[serde(default = "default_significance_level")]
    pub significance_level: f64,
}

fn default_significance_level() -> f64 {
    DEFAULT_SIGNIFICANCE_LEVEL
}

/// Which pair of deployment variants the comparison runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DynamicStrategy {
    CanaryWithBaseline,
    CanaryWithPrimary,
    Previous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicMetricsEntry {
    pub template: String,
    #[serde(default)]
    pub primary_args: HashMap<String, String>,
    #[serde(default)]
    pub canary_args: HashMap<String, String>,
    #[serde(default)]
    pub baseline_args: HashMap<String, String>,
}

/// The analysis template document: named, parameterized check definitions
/// partitioned by check kind. A missing file is equivalent to an empty
/// document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisTemplateSpec {
    #[serde(default)]
    pub metrics: HashMap<String, AnalysisMetrics>,
    #[serde(default)]
    pub logs: HashMap<String, AnalysisLog>,
    #[serde(default)]
    pub https: HashMap<String, AnalysisHttp>,
}

pub fn load_agent_config<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
    load_toml(path)
}

pub fn load_deployment_config<P: AsRef<Path>>(app_dir: P) -> Result<DeploymentConfig> {
    load_yaml(app_dir.as_ref().join(DEPLOYMENT_CONFIG_FILE))
}

/// Load the optional analysis template document from the app directory.
/// Returns `Ok(None)` when the file does not exist.
pub fn load_analysis_template<P: AsRef<Path>>(app_dir: P) -> Result<Option<AnalysisTemplateSpec>> {
    let path = app_dir.as_ref().join(ANALYSIS_TEMPLATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_yaml(path).map(Some)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

fn load_yaml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
        source,
        path: path.to_path_buf(),
    })
}

/// Serializes durations as human strings ("3m 42s") and parses them back,
/// also accepting the compact form ("3m42s").
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
