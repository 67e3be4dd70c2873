//! Per-kind analyzer drivers: static threshold checks for metrics, logs
//! and HTTP probes, plus the dynamic comparative analyzer that runs the
//! rank-sum test between two deployment variants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{
    AnalysisExpected, AnalysisHttp, AnalysisMetrics, AnalysisTemplateSpec, DynamicMetricsEntry,
    DynamicStrategy,
};
use crate::providers::{
    Evaluation, HttpProvider, LogProvider, MetricsProvider, ProviderError, ProviderResult,
    QueryRange,
};
use crate::stores::AnalysisResultStore;

use super::analyzer::AnalyzerDriver;
use super::mann_whitney::{self, ComparisonOutcome, Deviation};
use super::template::{self, TemplateArgs};
use super::AnalysisError;

/// Static threshold check: every tick queries `[now - interval, now]` and
/// requires all points inside the expected bounds.
pub struct MetricsAnalyzerDriver {
    provider: Arc<dyn MetricsProvider>,
    query: String,
    lookback: chrono::Duration,
    expected: AnalysisExpected,
}

impl MetricsAnalyzerDriver {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        query: String,
        interval: Duration,
        expected: AnalysisExpected,
    ) -> Result<Self, AnalysisError> {
        let lookback = chrono::Duration::from_std(interval)
            .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
        Ok(Self {
            provider,
            query,
            lookback,
            expected,
        })
    }
}

#[async_trait]
impl AnalyzerDriver for MetricsAnalyzerDriver {
    async fn evaluate(&self) -> ProviderResult<Evaluation> {
        let now = Utc::now();
        let range = QueryRange::new(now - self.lookback, now)?;
        self.provider.evaluate(&self.query, range, &self.expected).await
    }
}

/// Log check: the tick passes when no log lines matched the query.
pub struct LogAnalyzerDriver {
    provider: Arc<dyn LogProvider>,
    query: String,
}

impl LogAnalyzerDriver {
    pub fn new(provider: Arc<dyn LogProvider>, query: String) -> Self {
        Self { provider, query }
    }
}

#[async_trait]
impl AnalyzerDriver for LogAnalyzerDriver {
    async fn evaluate(&self) -> ProviderResult<Evaluation> {
        self.provider.evaluate(&self.query).await
    }
}

/// HTTP probe: one request per tick.
pub struct HttpAnalyzerDriver {
    provider: HttpProvider,
    config: AnalysisHttp,
}

impl HttpAnalyzerDriver {
    pub fn new(config: AnalysisHttp) -> Result<Self, AnalysisError> {
        let provider = HttpProvider::new(config.timeout)?;
        Ok(Self { provider, config })
    }

    pub fn provider_kind(&self) -> &'static str {
        self.provider.kind()
    }
}

#[async_trait]
impl AnalyzerDriver for HttpAnalyzerDriver {
    async fn evaluate(&self) -> ProviderResult<Evaluation> {
        self.provider.run(&self.config).await
    }
}

/// Dynamic comparative analyzer: per tick it renders the template query for
/// the two variants the strategy selects, collects both series concurrently
/// and applies the rank-sum test.
pub struct DynamicMetricsDriver {
    strategy: DynamicStrategy,
    template_name: String,
    templates: AnalysisTemplateSpec,
    base_args: TemplateArgs,
    primary_args: HashMap<String, String>,
    canary_args: HashMap<String, String>,
    baseline_args: HashMap<String, String>,
    provider: Arc<dyn MetricsProvider>,
    lookback: chrono::Duration,
    deviation: Deviation,
    significance_level: f64,
    stage_start: DateTime<Utc>,
    result_store: Arc<dyn AnalysisResultStore>,
}

impl DynamicMetricsDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: DynamicStrategy,
        entry: &DynamicMetricsEntry,
        cfg: &AnalysisMetrics,
        templates: AnalysisTemplateSpec,
        base_args: TemplateArgs,
        provider: Arc<dyn MetricsProvider>,
        significance_level: f64,
        stage_start: DateTime<Utc>,
        result_store: Arc<dyn AnalysisResultStore>,
    ) -> Result<Self, AnalysisError> {
        let lookback = chrono::Duration::from_std(cfg.interval)
            .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
        Ok(Self {
            strategy,
            template_name: entry.template.clone(),
            templates,
            base_args,
            primary_args: entry.primary_args.clone(),
            canary_args: entry.canary_args.clone(),
            baseline_args: entry.baseline_args.clone(),
            provider,
            lookback,
            deviation: cfg.deviation,
            significance_level,
            stage_start,
            result_store,
        })
    }

    /// The (experiment, control) arg sets the strategy compares.
    fn variant_args(&self) -> (&HashMap<String, String>, &HashMap<String, String>) {
        match self.strategy {
            DynamicStrategy::CanaryWithBaseline => (&self.canary_args, &self.baseline_args),
            DynamicStrategy::CanaryWithPrimary => (&self.canary_args, &self.primary_args),
            DynamicStrategy::Previous => (&self.primary_args, &self.primary_args),
        }
    }

    fn variant_labels(&self) -> (&'static str, &'static str) {
        match self.strategy {
            DynamicStrategy::CanaryWithBaseline => ("canary", "baseline"),
            DynamicStrategy::CanaryWithPrimary => ("canary", "primary"),
            DynamicStrategy::Previous => ("primary", "previous primary"),
        }
    }

    fn variant_query(&self, args: &HashMap<String, String>) -> ProviderResult<String> {
        let rendered = template::render(&self.templates, &self.base_args.with_args(args))
            .map_err(|err| ProviderError::Query(err.to_string()))?;
        let cfg = rendered
            .metrics
            .get(&self.template_name)
            .ok_or_else(|| ProviderError::Query(format!(
                "analysis template {} not found",
                self.template_name
            )))?;
        Ok(cfg.query.clone())
    }

    /// Time range the control series is queried over. For the Previous
    /// strategy this replays the window of the last successful analysis,
    /// shifted by how long this stage has been running.
    async fn control_range(
        &self,
        now: DateTime<Utc>,
        experiment_range: QueryRange,
    ) -> ProviderResult<QueryRange> {
        if self.strategy != DynamicStrategy::Previous {
            return Ok(experiment_range);
        }
        let previous = self
            .result_store
            .get_latest_analysis_result()
            .await
            .map_err(|err| ProviderError::Query(err.to_string()))?
            .ok_or(ProviderError::NoDataFound)?;
        let from = DateTime::from_timestamp(previous.start_time, 0)
            .ok_or_else(|| ProviderError::Query("stored analysis start time is invalid".to_string()))?;
        QueryRange::new(from, from + (now - self.stage_start))
    }
}

#[async_trait]
impl AnalyzerDriver for DynamicMetricsDriver {
    async fn evaluate(&self) -> ProviderResult<Evaluation> {
        let now = Utc::now();
        let experiment_range = QueryRange::new(now - self.lookback, now)?;
        let control_range = self.control_range(now, experiment_range).await?;

        let (experiment_args, control_args) = self.variant_args();
        let experiment_query = self.variant_query(experiment_args)?;
        let control_query = self.variant_query(control_args)?;

        let (experiment, control) = tokio::try_join!(
            self.provider.query_points(&experiment_query, experiment_range),
            self.provider.query_points(&control_query, control_range),
        )?;
        if experiment.is_empty() || control.is_empty() {
            return Err(ProviderError::NoDataFound);
        }

        let experiment_values: Vec<f64> = experiment.iter().map(|point| point.value).collect();
        let control_values: Vec<f64> = control.iter().map(|point| point.value).collect();

        let (experiment_label, control_label) = self.variant_labels();
        match mann_whitney::compare(
            &experiment_values,
            &control_values,
            self.significance_level,
        ) {
            ComparisonOutcome::InsufficientData => Err(ProviderError::NoDataFound),
            ComparisonOutcome::NoDeviation => Ok(Evaluation::pass(format!(
                "no significant deviation between {experiment_label} and {control_label}"
            ))),
            ComparisonOutcome::Deviation { direction, result } => {
                if self.deviation.disallows(direction) {
                    Ok(Evaluation::fail(format!(
                        "significant {direction} deviation of {experiment_label} against \
                         {control_label} (p-value {:.4} < {})",
                        result.p_value, self.significance_level
                    )))
                } else {
                    Ok(Evaluation::pass(format!(
                        "{experiment_label} deviates {direction} against {control_label}, \
                         which is not the disallowed direction"
                    )))
                }
            }
        }
    }
}
