use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, MissedTickBehavior};

use crate::providers::{Evaluation, ProviderResult};
use crate::stores::LogPersister;

use super::AnalysisError;

/// Kind-specific evaluation invoked on every tick of an [`Analyzer`].
#[async_trait]
pub trait AnalyzerDriver: Send + Sync {
    async fn evaluate(&self) -> ProviderResult<Evaluation>;
}

/// A periodic check against one provider. Runs until its consecutive
/// failure count crosses the failure limit, or until the stage deadline or
/// a stop signal drops the future.
pub struct Analyzer {
    id: String,
    provider_kind: String,
    query: String,
    driver: Box<dyn AnalyzerDriver>,
    interval: Duration,
    failure_limit: u32,
    skip_on_no_data: bool,
    log_persister: Arc<dyn LogPersister>,
}

impl Analyzer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        provider_kind: String,
        query: String,
        driver: Box<dyn AnalyzerDriver>,
        interval: Duration,
        failure_limit: u32,
        skip_on_no_data: bool,
        log_persister: Arc<dyn LogPersister>,
    ) -> Self {
        Self {
            id,
            provider_kind,
            query,
            driver,
            interval,
            failure_limit,
            skip_on_no_data,
            log_persister,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider_kind(&self) -> &str {
        &self.provider_kind
    }

    /// Ticks on the analyzer's interval until the failure limit is crossed.
    /// The first tick fires one interval after start. The failure limit is a
    /// tolerance: with `failure_limit = N` the analyzer fails on the
    /// `(N+1)`-th consecutive breach. Missed ticks are coalesced.
    pub async fn run(&self) -> Result<(), AnalysisError> {
        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut failure_count: u32 = 0;
        loop {
            ticker.tick().await;
            match self.driver.evaluate().await {
                Ok(evaluation) if evaluation.passed => {
                    failure_count = 0;
                    self.log_persister.success(&format!(
                        "[{}] The query result met the expected values: {}",
                        self.id, evaluation.reason
                    ));
                }
                Ok(evaluation) => {
                    failure_count += 1;
                    self.log_persister.error(&format!(
                        "[{}] The query result did not meet the expected values: {}",
                        self.id, evaluation.reason
                    ));
                    if failure_count > self.failure_limit {
                        return Err(self.failed(evaluation.reason));
                    }
                }
                Err(err) if err.is_no_data() && self.skip_on_no_data => {
                    failure_count = 0;
                    self.log_persister.info(&format!(
                        "[{}] The query returned no data, skipping because skipOnNoData is enabled",
                        self.id
                    ));
                }
                Err(err) => {
                    failure_count += 1;
                    self.log_persister
                        .error(&format!("[{}] Failed to run the query: {err}", self.id));
                    if failure_count > self.failure_limit {
                        return Err(self.failed(err.to_string()));
                    }
                }
            }
            tracing::debug!(
                target: "analysis",
                id = %self.id,
                provider = %self.provider_kind,
                query = %self.query,
                consecutive_failures = failure_count,
                "analyzer tick evaluated"
            );
        }
    }

    fn failed(&self, reason: String) -> AnalysisError {
        AnalysisError::AnalyzerFailed {
            id: self.id.clone(),
            provider: self.provider_kind.clone(),
            reason,
        }
    }
}
