//! Stage orchestrator: spawns one analyzer per configured check within the
//! remaining stage deadline, merges their verdicts and persists the
//! elapsed time so an interrupted stage resumes from the middle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::sync::watch;

use crate::config::{
    load_analysis_template, AnalysisHttp, AnalysisLog, AnalysisMetrics, AnalysisProviderConfig,
    AnalysisStageOptions, AnalysisTemplateSpec, DynamicMetricsEntry, DynamicStrategy, StageConfig,
    Templatable,
};
use crate::pipeline::{
    determine_stage_status, Application, DeploySource, DeploySourceProvider, Stage, StageStatus,
    StopSignalKind,
};
use crate::providers::{MetricsProvider, ProviderFactory};
use crate::stores::{AnalysisResult, AnalysisResultStore, LogPersister, MetadataStore};

use super::analyzer::Analyzer;
use super::metrics::{
    DynamicMetricsDriver, HttpAnalyzerDriver, LogAnalyzerDriver, MetricsAnalyzerDriver,
};
use super::template::{
    resolve_http_check, resolve_log_check, resolve_metrics_check, TemplateArgs,
};
use super::AnalysisError;

/// Stage metadata key carrying the accumulated analysis time across
/// restarts.
pub const ELAPSED_TIME_KEY: &str = "elapsedTime";

/// Everything the pipeline engine hands over when running the stage.
pub struct ExecutorInput {
    pub stage: Stage,
    pub application: Application,
    pub stage_config: StageConfig,
    pub providers: HashMap<String, AnalysisProviderConfig>,
    pub provider_factory: Arc<dyn ProviderFactory>,
    pub deploy_source: Arc<dyn DeploySourceProvider>,
    pub log_persister: Arc<dyn LogPersister>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub analysis_result_store: Arc<dyn AnalysisResultStore>,
}

pub struct AnalysisExecutor {
    input: ExecutorInput,
    stop: watch::Receiver<StopSignalKind>,
    start_time: DateTime<Utc>,
    previous_elapsed: Duration,
}

impl AnalysisExecutor {
    pub fn new(input: ExecutorInput, stop: watch::Receiver<StopSignalKind>) -> Self {
        Self {
            input,
            stop,
            start_time: Utc::now(),
            previous_elapsed: Duration::ZERO,
        }
    }

    /// Runs the ANALYSIS stage to completion and returns its final status.
    pub async fn execute(&mut self) -> StageStatus {
        self.start_time = Utc::now();

        let Some(options) = self.input.stage_config.analysis.clone() else {
            self.input
                .log_persister
                .error(&AnalysisError::MissingConfiguration.to_string());
            return StageStatus::Failure;
        };
        if let Err(err) = options.validate() {
            self.input.log_persister.error(&err.to_string());
            return StageStatus::Failure;
        }

        let source = match self.input.deploy_source.get().await {
            Ok(source) => source,
            Err(err) => {
                self.input
                    .log_persister
                    .error(&format!("failed to prepare running deploy source data: {err}"));
                return StageStatus::Failure;
            }
        };

        let templates = match load_analysis_template(&source.repo_dir) {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                tracing::info!(
                    target: "analysis",
                    "analysis template file not found, continuing with an empty document"
                );
                AnalysisTemplateSpec::default()
            }
            Err(err) => {
                self.input.log_persister.error(&err.to_string());
                return StageStatus::Failure;
            }
        };

        self.previous_elapsed = self.retrieve_previous_elapsed_time().await;
        let remaining = options.duration.saturating_sub(self.previous_elapsed);
        if !self.previous_elapsed.is_zero() {
            self.input.log_persister.info(&format!(
                "restarting analysis from the middle, {} remaining of {}",
                humantime::format_duration(remaining),
                humantime::format_duration(options.duration),
            ));
        }

        let local = self.run_analyzers(&options, &source, &templates, remaining).await;
        self.save_elapsed_time().await;

        let local_status = match local {
            Ok(()) => StageStatus::Success,
            Err(err) => {
                self.input
                    .log_persister
                    .error(&format!("analysis failed: {err}"));
                StageStatus::Failure
            }
        };

        let signal = *self.stop.borrow();
        let status =
            determine_stage_status(signal, self.input.stage.status, local_status);
        if status != StageStatus::Success {
            return status;
        }

        self.input
            .log_persister
            .success("all analyses were successful");
        let result = AnalysisResult {
            start_time: self.start_time.timestamp(),
        };
        if let Err(err) = self
            .input
            .analysis_result_store
            .put_latest_analysis_result(&result)
            .await
        {
            tracing::error!(
                target: "analysis",
                error = %err,
                "failed to store the analysis result"
            );
        }
        status
    }

    /// Spawns every configured analyzer and waits for the first failure,
    /// the stage deadline or an external stop. Reaching the deadline means
    /// the configured duration completed, which is a success.
    async fn run_analyzers(
        &self,
        options: &AnalysisStageOptions,
        source: &DeploySource,
        templates: &AnalysisTemplateSpec,
        remaining: Duration,
    ) -> Result<(), AnalysisError> {
        let base_args = TemplateArgs::new(&self.input.application, &source.deployment_config);

        let mut analyzers = Vec::new();
        for (index, check) in options.metrics.iter().enumerate() {
            analyzers.push(self.new_metrics_analyzer(index, check, templates, &base_args)?);
        }
        for (index, check) in options.logs.iter().enumerate() {
            analyzers.push(self.new_log_analyzer(index, check, templates, &base_args)?);
        }
        for (index, check) in options.https.iter().enumerate() {
            analyzers.push(self.new_http_analyzer(index, check, templates, &base_args)?);
        }
        if let Some(dynamic) = &options.dynamic {
            for (index, entry) in dynamic.metrics.iter().enumerate() {
                analyzers.push(self.new_dynamic_analyzer(
                    index,
                    entry,
                    dynamic.strategy,
                    dynamic.significance_level,
                    templates,
                    &base_args,
                )?);
            }
        }

        for analyzer in &analyzers {
            self.input.log_persister.info(&format!(
                "[{}] start analysis for {}",
                analyzer.id(),
                analyzer.provider_kind()
            ));
        }

        let mut stop = self.stop.clone();
        let run_all = async {
            try_join_all(analyzers.iter().map(|analyzer| analyzer.run()))
                .await
                .map(|_| ())
        };
        tokio::select! {
            result = tokio::time::timeout(remaining, run_all) => match result {
                Ok(inner) => inner,
                Err(_) => Ok(()),
            },
            _ = wait_for_stop(&mut stop) => {
                tracing::info!(target: "analysis", "analysis interrupted by a stop signal");
                Ok(())
            }
        }
    }

    fn new_metrics_analyzer(
        &self,
        index: usize,
        check: &Templatable<AnalysisMetrics>,
        templates: &AnalysisTemplateSpec,
        base_args: &TemplateArgs,
    ) -> Result<Analyzer, AnalysisError> {
        let cfg = resolve_metrics_check(check, templates, base_args).map_err(|err| {
            self.spawn_failure("metrics", index, &err);
            err
        })?;
        let provider = self.metrics_provider(&cfg.provider).map_err(|err| {
            self.spawn_failure("metrics", index, &err);
            err
        })?;
        let driver = MetricsAnalyzerDriver::new(
            Arc::clone(&provider),
            cfg.query.clone(),
            cfg.interval,
            cfg.expected.clone(),
        )?;
        Ok(Analyzer::new(
            format!("metrics-{index}"),
            provider.kind().to_string(),
            cfg.query,
            Box::new(driver),
            cfg.interval,
            cfg.failure_limit,
            cfg.skip_on_no_data,
            Arc::clone(&self.input.log_persister),
        ))
    }

    fn new_log_analyzer(
        &self,
        index: usize,
        check: &Templatable<AnalysisLog>,
        templates: &AnalysisTemplateSpec,
        base_args: &TemplateArgs,
    ) -> Result<Analyzer, AnalysisError> {
        let cfg = resolve_log_check(check, templates, base_args).map_err(|err| {
            self.spawn_failure("log", index, &err);
            err
        })?;
        let provider = self.log_provider(&cfg.provider).map_err(|err| {
            self.spawn_failure("log", index, &err);
            err
        })?;
        let driver = LogAnalyzerDriver::new(Arc::clone(&provider), cfg.query.clone());
        Ok(Analyzer::new(
            format!("log-{index}"),
            provider.kind().to_string(),
            cfg.query,
            Box::new(driver),
            cfg.interval,
            cfg.failure_limit,
            cfg.skip_on_no_data,
            Arc::clone(&self.input.log_persister),
        ))
    }

    fn new_http_analyzer(
        &self,
        index: usize,
        check: &Templatable<AnalysisHttp>,
        templates: &AnalysisTemplateSpec,
        base_args: &TemplateArgs,
    ) -> Result<Analyzer, AnalysisError> {
        let cfg = resolve_http_check(check, templates, base_args).map_err(|err| {
            self.spawn_failure("http", index, &err);
            err
        })?;
        let driver = HttpAnalyzerDriver::new(cfg.clone())?;
        let provider_kind = driver.provider_kind().to_string();
        Ok(Analyzer::new(
            format!("http-{index}"),
            provider_kind,
            cfg.url,
            Box::new(driver),
            cfg.interval,
            cfg.failure_limit,
            cfg.skip_on_no_data,
            Arc::clone(&self.input.log_persister),
        ))
    }

    fn new_dynamic_analyzer(
        &self,
        index: usize,
        entry: &DynamicMetricsEntry,
        strategy: DynamicStrategy,
        significance_level: f64,
        templates: &AnalysisTemplateSpec,
        base_args: &TemplateArgs,
    ) -> Result<Analyzer, AnalysisError> {
        let cfg = templates
            .metrics
            .get(&entry.template)
            .ok_or_else(|| AnalysisError::TemplateNotFound(entry.template.clone()))
            .map_err(|err| {
                self.spawn_failure("dynamic", index, &err);
                err
            })?
            .clone();
        cfg.validate()
            .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
        let provider = self.metrics_provider(&cfg.provider).map_err(|err| {
            self.spawn_failure("dynamic", index, &err);
            err
        })?;
        let driver = DynamicMetricsDriver::new(
            strategy,
            entry,
            &cfg,
            templates.clone(),
            base_args.clone(),
            Arc::clone(&provider),
            significance_level,
            self.start_time,
            Arc::clone(&self.input.analysis_result_store),
        )?;
        Ok(Analyzer::new(
            format!("dynamic-{index}"),
            provider.kind().to_string(),
            cfg.query,
            Box::new(driver),
            cfg.interval,
            cfg.failure_limit,
            cfg.skip_on_no_data,
            Arc::clone(&self.input.log_persister),
        ))
    }

    fn metrics_provider(
        &self,
        name: &str,
    ) -> Result<Arc<dyn MetricsProvider>, AnalysisError> {
        let cfg = self
            .input
            .providers
            .get(name)
            .ok_or_else(|| AnalysisError::UnknownProvider(name.to_string()))?;
        Ok(self.input.provider_factory.metrics_provider(name, cfg)?)
    }

    fn log_provider(
        &self,
        name: &str,
    ) -> Result<Arc<dyn crate::providers::LogProvider>, AnalysisError> {
        let cfg = self
            .input
            .providers
            .get(name)
            .ok_or_else(|| AnalysisError::UnknownProvider(name.to_string()))?;
        Ok(self.input.provider_factory.log_provider(name, cfg)?)
    }

    fn spawn_failure(&self, kind: &str, index: usize, err: &AnalysisError) {
        self.input
            .log_persister
            .error(&format!("failed to spawn analyzer for {kind}[{index}]: {err}"));
    }

    /// Reads the elapsed time persisted by a previous run of this stage.
    /// Absent or malformed metadata restarts the stage from scratch.
    async fn retrieve_previous_elapsed_time(&self) -> Duration {
        let metadata = match self
            .input
            .metadata_store
            .get_stage_metadata(&self.input.stage.id)
            .await
        {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return Duration::ZERO,
            Err(err) => {
                tracing::error!(
                    target: "analysis",
                    error = %err,
                    "failed to load stage metadata"
                );
                return Duration::ZERO;
            }
        };
        let Some(value) = metadata.get(ELAPSED_TIME_KEY) else {
            return Duration::ZERO;
        };
        match humantime::parse_duration(value) {
            Ok(elapsed) => elapsed,
            Err(err) => {
                tracing::error!(
                    target: "analysis",
                    stored_value = %value,
                    error = %err,
                    "unexpected elapsed time is stored"
                );
                Duration::ZERO
            }
        }
    }

    /// Stores the accumulated elapsed time so an interrupted stage can be
    /// restarted from the middle. Best effort.
    async fn save_elapsed_time(&self) {
        let wall = (Utc::now() - self.start_time).to_std().unwrap_or_default();
        let elapsed = truncate_to_millis(wall + self.previous_elapsed);
        let metadata = HashMap::from([(
            ELAPSED_TIME_KEY.to_string(),
            humantime::format_duration(elapsed).to_string(),
        )]);
        if let Err(err) = self
            .input
            .metadata_store
            .set_stage_metadata(&self.input.stage.id, metadata)
            .await
        {
            tracing::error!(
                target: "analysis",
                error = %err,
                "failed to store stage metadata"
            );
        }
    }
}

fn truncate_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

async fn wait_for_stop(stop: &mut watch::Receiver<StopSignalKind>) {
    loop {
        if *stop.borrow() != StopSignalKind::None {
            return;
        }
        if stop.changed().await.is_err() {
            // The sender is gone, no stop signal can arrive anymore.
            std::future::pending::<()>().await;
        }
    }
}
