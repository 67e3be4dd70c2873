use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;

use caravel_core::{
    load_deployment_config, AnalysisProviderConfig, Application, ApplicationKind,
    AnalysisExecutor, DataPoint, Evaluation, ExecutorInput, LocalDeploySourceProvider,
    LogProvider, MetricsProvider, ProviderFactory, ProviderResult, QueryRange,
    SqliteStageStore, Stage, StageConfig, StageStatus, StopSignalKind, TracingLogPersister,
    ELAPSED_TIME_KEY,
};

/// Metrics provider returning a fixed series, recording every query.
struct FakeMetricsProvider {
    values: Vec<f64>,
    queries: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MetricsProvider for FakeMetricsProvider {
    fn kind(&self) -> &'static str {
        "fake-metrics"
    }

    async fn query_points(&self, query: &str, range: QueryRange) -> ProviderResult<Vec<DataPoint>> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self
            .values
            .iter()
            .map(|value| DataPoint {
                timestamp: range.to,
                value: *value,
            })
            .collect())
    }
}

struct FakeLogProvider;

#[async_trait]
impl LogProvider for FakeLogProvider {
    fn kind(&self) -> &'static str {
        "fake-logs"
    }

    async fn evaluate(&self, _query: &str) -> ProviderResult<Evaluation> {
        Ok(Evaluation::pass("no matching log events"))
    }
}

struct FakeFactory {
    values: Vec<f64>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl FakeFactory {
    fn new(values: Vec<f64>) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let queries = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                values,
                queries: Arc::clone(&queries),
            }),
            queries,
        )
    }
}

impl ProviderFactory for FakeFactory {
    fn metrics_provider(
        &self,
        _name: &str,
        _config: &AnalysisProviderConfig,
    ) -> ProviderResult<Arc<dyn MetricsProvider>> {
        Ok(Arc::new(FakeMetricsProvider {
            values: self.values.clone(),
            queries: Arc::clone(&self.queries),
        }))
    }

    fn log_provider(
        &self,
        _name: &str,
        _config: &AnalysisProviderConfig,
    ) -> ProviderResult<Arc<dyn LogProvider>> {
        Ok(Arc::new(FakeLogProvider))
    }
}

const DEPLOYMENT_CONFIG: &str = r#"
kind: kubernetes
input:
  namespace: web
pipeline:
  stages:
    - name: ANALYSIS
      analysis:
        duration: 500ms
        metrics:
          - provider: prometheus-dev
            query: error_rate
            expected:
              max: 1
            interval: 100ms
          - template:
              name: error_rate_by_app
"#;

const ANALYSIS_TEMPLATE: &str = r#"
metrics:
  error_rate_by_app:
    provider: prometheus-dev
    query: error_rate{app="{{ .App.Name }}",namespace="{{ .K8s.Namespace }}"}
    expected:
      max: 1
    interval: 100ms
"#;

fn write_app_dir(dir: &Path, deployment: &str, template: Option<&str>) {
    fs::write(dir.join("app.caravel.yaml"), deployment).unwrap();
    if let Some(template) = template {
        fs::write(dir.join("analysis-template.yaml"), template).unwrap();
    }
}

fn providers() -> HashMap<String, AnalysisProviderConfig> {
    let config: AnalysisProviderConfig = toml::from_str(
        "kind = \"prometheus\"\naddress = \"http://prometheus.dev:9090\"",
    )
    .unwrap();
    HashMap::from([("prometheus-dev".to_string(), config)])
}

fn stage_config(app_dir: &Path) -> StageConfig {
    let deployment = load_deployment_config(app_dir).unwrap();
    deployment.pipeline.stages.into_iter().next().unwrap()
}

struct Harness {
    executor: AnalysisExecutor,
    store: SqliteStageStore,
    queries: Arc<Mutex<Vec<String>>>,
    stop_tx: watch::Sender<StopSignalKind>,
    _dir: TempDir,
}

fn harness(deployment: &str, template: Option<&str>, values: Vec<f64>) -> Harness {
    let dir = TempDir::new().unwrap();
    write_app_dir(dir.path(), deployment, template);

    let store = SqliteStageStore::new(dir.path().join("stage.sqlite"), "helloworld");
    store.initialize().unwrap();

    let (factory, queries) = FakeFactory::new(values);
    let (stop_tx, stop_rx) = watch::channel(StopSignalKind::None);

    let input = ExecutorInput {
        stage: Stage {
            id: "stage-1".to_string(),
            name: "ANALYSIS".to_string(),
            status: StageStatus::Running,
        },
        application: Application {
            name: "helloworld".to_string(),
            env: "dev".to_string(),
            kind: ApplicationKind::Kubernetes,
        },
        stage_config: stage_config(dir.path()),
        providers: providers(),
        provider_factory: factory,
        deploy_source: Arc::new(LocalDeploySourceProvider::new(dir.path())),
        log_persister: Arc::new(TracingLogPersister),
        metadata_store: Arc::new(store.clone()),
        analysis_result_store: Arc::new(store.clone()),
    };

    Harness {
        executor: AnalysisExecutor::new(input, stop_rx),
        store,
        queries,
        stop_tx,
        _dir: dir,
    }
}

async fn stored_elapsed(store: &SqliteStageStore) -> Duration {
    use caravel_core::MetadataStore;
    let metadata = store
        .get_stage_metadata("stage-1")
        .await
        .unwrap()
        .expect("stage metadata should be written at exit");
    humantime::parse_duration(&metadata[ELAPSED_TIME_KEY]).unwrap()
}

#[tokio::test]
async fn healthy_analyzers_succeed_at_the_deadline() {
    use caravel_core::AnalysisResultStore;

    let mut harness = harness(DEPLOYMENT_CONFIG, Some(ANALYSIS_TEMPLATE), vec![0.9, 0.8]);
    let before = Utc::now().timestamp();
    let status = harness.executor.execute().await;
    assert_eq!(status, StageStatus::Success);

    // The template-backed analyzer queried with the rendered built-ins.
    let queries = harness.queries.lock().unwrap().clone();
    assert!(queries
        .iter()
        .any(|query| query.contains("app=\"helloworld\"") && query.contains("namespace=\"web\"")));

    let result = harness
        .store
        .get_latest_analysis_result()
        .await
        .unwrap()
        .expect("successful stage should persist a result");
    assert!(result.start_time >= before);

    let elapsed = stored_elapsed(&harness.store).await;
    assert!(elapsed >= Duration::from_millis(500));
}

#[tokio::test]
async fn breaching_analyzer_fails_the_stage() {
    use caravel_core::AnalysisResultStore;

    // Points above max=1 on every tick; failureLimit defaults to 0, so the
    // first breach fails the analyzer and thereby the stage.
    let mut harness = harness(DEPLOYMENT_CONFIG, Some(ANALYSIS_TEMPLATE), vec![0.9, 1.1]);
    let started = Instant::now();
    let status = harness.executor.execute().await;
    assert_eq!(status, StageStatus::Failure);
    assert!(started.elapsed() < Duration::from_millis(500));

    assert!(harness
        .store
        .get_latest_analysis_result()
        .await
        .unwrap()
        .is_none());

    // The elapsed time is still written on failure.
    let _ = stored_elapsed(&harness.store).await;
}

#[tokio::test]
async fn resume_subtracts_the_previously_elapsed_time() {
    use caravel_core::MetadataStore;

    let deployment = DEPLOYMENT_CONFIG.replace("duration: 500ms", "duration: 10s");
    let mut harness = harness(&deployment, Some(ANALYSIS_TEMPLATE), vec![0.9]);
    harness
        .store
        .set_stage_metadata(
            "stage-1",
            HashMap::from([(ELAPSED_TIME_KEY.to_string(), "9s 700ms".to_string())]),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let status = harness.executor.execute().await;
    assert_eq!(status, StageStatus::Success);
    // Only ~300ms of the 10s duration were left to run.
    assert!(started.elapsed() < Duration::from_secs(5));

    let elapsed = stored_elapsed(&harness.store).await;
    assert!(elapsed >= Duration::from_millis(9_900));
    assert!(elapsed < Duration::from_secs(15));
}

#[tokio::test]
async fn stop_signal_cancels_the_stage() {
    let deployment = DEPLOYMENT_CONFIG.replace("duration: 500ms", "duration: 30s");
    let mut harness = harness(&deployment, Some(ANALYSIS_TEMPLATE), vec![0.9]);

    let stop_tx = harness.stop_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = stop_tx.send(StopSignalKind::Cancel);
    });

    let started = Instant::now();
    let status = harness.executor.execute().await;
    assert_eq!(status, StageStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));

    // Elapsed time survives the cancellation for a later resume.
    let elapsed = stored_elapsed(&harness.store).await;
    assert!(elapsed >= Duration::from_millis(200));
}

#[tokio::test]
async fn missing_analysis_options_fail_the_stage() {
    let deployment = r#"
kind: kubernetes
pipeline:
  stages:
    - name: ANALYSIS
"#;
    let mut harness = harness(deployment, None, vec![0.9]);
    let status = harness.executor.execute().await;
    assert_eq!(status, StageStatus::Failure);
}

#[tokio::test]
async fn unknown_provider_fails_the_stage_at_spawn() {
    let deployment = DEPLOYMENT_CONFIG.replace("provider: prometheus-dev", "provider: nonexistent");
    let mut harness = harness(&deployment, Some(ANALYSIS_TEMPLATE), vec![0.9]);
    let started = Instant::now();
    let status = harness.executor.execute().await;
    assert_eq!(status, StageStatus::Failure);
    // Spawn failures abort immediately, before any analyzer tick.
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn terminate_signal_restores_the_original_status() {
    let deployment = DEPLOYMENT_CONFIG.replace("duration: 500ms", "duration: 30s");
    let mut harness = harness(&deployment, Some(ANALYSIS_TEMPLATE), vec![0.9]);

    let stop_tx = harness.stop_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = stop_tx.send(StopSignalKind::Terminate);
    });

    let status = harness.executor.execute().await;
    assert_eq!(status, StageStatus::Running);
}
