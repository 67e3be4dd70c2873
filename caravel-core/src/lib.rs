pub mod analysis;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod stores;

pub use analysis::{
    render, resolve_http_check, resolve_log_check, resolve_metrics_check, AnalysisError,
    AnalysisExecutor, Analyzer, AnalyzerDriver, ComparisonOutcome, Deviation, DeviationDirection,
    DynamicMetricsDriver, ExecutorInput, HttpAnalyzerDriver, LogAnalyzerDriver, MannWhitneyResult,
    MetricsAnalyzerDriver, TemplateArgs, ELAPSED_TIME_KEY,
};
pub use config::{
    load_agent_config, load_analysis_template, load_deployment_config, AgentConfig,
    AnalysisDynamic, AnalysisExpected, AnalysisHttp, AnalysisLog, AnalysisMetrics,
    AnalysisProviderConfig, AnalysisStageOptions, AnalysisTemplateSpec, ApplicationKind,
    DeploymentConfig, DynamicMetricsEntry, DynamicStrategy, ProviderKind, StageConfig,
    Templatable, TemplateRef,
};
pub use error::{ConfigError, Result};
pub use pipeline::{
    determine_stage_status, Application, DeploySource, DeploySourceError, DeploySourceProvider,
    LocalDeploySourceProvider, Stage, StageStatus, StopSignalKind,
};
pub use providers::{
    DataPoint, Evaluation, HttpProvider, LogProvider, MetricsProvider, ProviderError,
    ProviderFactory, ProviderResult, QueryRange,
};
pub use stores::{
    AnalysisResult, AnalysisResultStore, LogPersister, MetadataStore, SqliteStageStore,
    StoreError, StoreResult, TracingLogPersister,
};
