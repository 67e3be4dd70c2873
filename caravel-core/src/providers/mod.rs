//! Capability contracts for the telemetry backends the analyzers poll.
//!
//! Concrete metrics and log clients live with the embedding agent; the
//! engine only fixes the query/evaluate surface and receives instances
//! through a [`ProviderFactory`]. The HTTP probe provider is concrete and
//! ships in [`http`].

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::{AnalysisExpected, AnalysisProviderConfig};

pub use http::HttpProvider;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no data points were returned")]
    NoDataFound,
    #[error("query failed: {0}")]
    Query(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid query range: {0}")]
    InvalidRange(String),
    #[error("provider does not support {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Whether this is the benign no-data sentinel rather than a real failure.
    pub fn is_no_data(&self) -> bool {
        matches!(self, ProviderError::NoDataFound)
    }
}

/// One sample returned by a metrics query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Half-open time window a query runs over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl QueryRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> ProviderResult<Self> {
        if from >= to {
            return Err(ProviderError::InvalidRange(format!(
                "time range from {from} must be earlier than {to}"
            )));
        }
        Ok(Self { from, to })
    }
}

/// Outcome of one evaluation tick: whether the check passed and why.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub passed: bool,
    pub reason: String,
}

impl Evaluation {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

/// A metrics backend the engine can query for raw points and evaluate
/// threshold checks against.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Short backend label used in log lines.
    fn kind(&self) -> &'static str;

    /// Raw points for the query over the range, ordered by ascending
    /// timestamp.
    async fn query_points(
        &self,
        query: &str,
        range: QueryRange,
    ) -> ProviderResult<Vec<DataPoint>>;

    /// Runs the query and checks every returned point against the expected
    /// bounds. An empty result set is reported as [`ProviderError::NoDataFound`].
    async fn evaluate(
        &self,
        query: &str,
        range: QueryRange,
        expected: &AnalysisExpected,
    ) -> ProviderResult<Evaluation> {
        let points = self.query_points(query, range).await?;
        if points.is_empty() {
            return Err(ProviderError::NoDataFound);
        }
        for point in &points {
            if !expected.within(point.value) {
                return Ok(Evaluation::fail(format!(
                    "value {} at {} is outside the expected range ({expected})",
                    point.value, point.timestamp,
                )));
            }
        }
        Ok(Evaluation::pass(format!(
            "all {} points are within the expected range ({expected})",
            points.len(),
        )))
    }
}

/// A log backend; a check passes when no log lines matched the query within
/// the provider's own evaluation window.
#[async_trait]
pub trait LogProvider: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn evaluate(&self, query: &str) -> ProviderResult<Evaluation>;
}

/// Builds concrete provider clients from agent-level bindings. Implemented
/// by the embedding agent, which knows how to talk to each backend.
pub trait ProviderFactory: Send + Sync {
    fn metrics_provider(
        &self,
        name: &str,
        config: &AnalysisProviderConfig,
    ) -> ProviderResult<Arc<dyn MetricsProvider>>;

    fn log_provider(
        &self,
        name: &str,
        config: &AnalysisProviderConfig,
    ) -> ProviderResult<Arc<dyn LogProvider>>;
}
