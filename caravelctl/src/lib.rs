use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use caravel_core::{
    load_agent_config, load_analysis_template, load_deployment_config, render,
    resolve_http_check, resolve_log_check, resolve_metrics_check, AgentConfig, AnalysisError,
    AnalysisStageOptions, AnalysisTemplateSpec, Application, DeploymentConfig, HttpProvider,
    ProviderError, TemplateArgs,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] caravel_core::ConfigError),
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("serialization error: {0}")]
    SerializeYaml(#[from] serde_yaml::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{failed} of {total} http probes failed")]
    ProbeFailure { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Caravel analysis configuration toolkit", long_about = None)]
pub struct Cli {
    /// Application directory containing app.caravel.yaml
    #[arg(long, default_value = ".")]
    pub app_dir: PathBuf,
    /// Agent configuration with the provider bindings; when given,
    /// provider names referenced by checks are verified against it
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Application name used for the App.Name template variable
    #[arg(long, default_value = "app")]
    pub app_name: String,
    /// Application environment used for the App.Env template variable
    #[arg(long, default_value = "")]
    pub app_env: String,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve every analysis check of the application and report it
    Validate,
    /// Render the analysis template with the given arguments and print it
    Render(RenderArgs),
    /// Execute the application's http checks once
    Probe,
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Template arguments as key=value pairs
    #[arg(short = 'a', long = "arg")]
    pub args: Vec<String>,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Validate => {
            let report = context.validate()?;
            render_output(&report, cli.format)?;
            if report.rows.iter().any(|row| !row.valid) {
                return Err(AppError::InvalidArgument(
                    "one or more analysis checks are invalid".to_string(),
                ));
            }
        }
        Commands::Render(args) => {
            let rendered = context.render_template(&args.args)?;
            println!("{}", serde_yaml::to_string(&rendered)?);
        }
        Commands::Probe => {
            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(context.probe())?;
            render_output(&report, cli.format)?;
            let failed = report.rows.iter().filter(|row| !row.passed).count();
            if failed > 0 {
                return Err(AppError::ProbeFailure {
                    failed,
                    total: report.rows.len(),
                });
            }
        }
    }
    Ok(())
}

fn render_output<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    deployment: DeploymentConfig,
    templates: AnalysisTemplateSpec,
    application: Application,
    agent: Option<AgentConfig>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let deployment = load_deployment_config(&cli.app_dir)?;
        let templates = load_analysis_template(&cli.app_dir)?.unwrap_or_default();
        let application = Application {
            name: cli.app_name.clone(),
            env: cli.app_env.clone(),
            kind: deployment.kind,
        };
        let agent = match &cli.config {
            Some(path) => Some(load_agent_config(path)?),
            None => None,
        };
        Ok(Self {
            deployment,
            templates,
            application,
            agent,
        })
    }

    /// Checks a referenced provider name against the agent bindings, when
    /// an agent configuration was given.
    fn check_provider(&self, name: &str) -> std::result::Result<(), String> {
        match &self.agent {
            Some(agent) if agent.analysis_provider(name).is_none() => {
                Err(format!("unknown provider name {name}"))
            }
            _ => Ok(()),
        }
    }

    fn base_args(&self) -> TemplateArgs {
        TemplateArgs::new(&self.application, &self.deployment)
    }

    fn analysis_stages(&self) -> impl Iterator<Item = (&str, &AnalysisStageOptions)> + '_ {
        self.deployment
            .pipeline
            .stages
            .iter()
            .filter_map(|stage| Some((stage.name.as_str(), stage.analysis.as_ref()?)))
    }

    fn validate(&self) -> Result<ValidationReport> {
        let args = self.base_args();
        let mut rows = Vec::new();
        for (stage_name, options) in self.analysis_stages() {
            if let Err(err) = options.validate() {
                rows.push(ValidationRow::invalid(stage_name, "options", err.to_string()));
                continue;
            }
            for (index, check) in options.metrics.iter().enumerate() {
                let id = format!("metrics-{index}");
                match resolve_metrics_check(check, &self.templates, &args) {
                    Ok(cfg) => match self.check_provider(&cfg.provider) {
                        Ok(()) => rows.push(ValidationRow::valid(
                            stage_name,
                            &id,
                            format!("provider={} query={}", cfg.provider, cfg.query),
                        )),
                        Err(reason) => rows.push(ValidationRow::invalid(stage_name, &id, reason)),
                    },
                    Err(err) => rows.push(ValidationRow::invalid(stage_name, &id, err.to_string())),
                }
            }
            for (index, check) in options.logs.iter().enumerate() {
                let id = format!("log-{index}");
                match resolve_log_check(check, &self.templates, &args) {
                    Ok(cfg) => match self.check_provider(&cfg.provider) {
                        Ok(()) => rows.push(ValidationRow::valid(
                            stage_name,
                            &id,
                            format!("provider={} query={}", cfg.provider, cfg.query),
                        )),
                        Err(reason) => rows.push(ValidationRow::invalid(stage_name, &id, reason)),
                    },
                    Err(err) => rows.push(ValidationRow::invalid(stage_name, &id, err.to_string())),
                }
            }
            for (index, check) in options.https.iter().enumerate() {
                let id = format!("http-{index}");
                match resolve_http_check(check, &self.templates, &args) {
                    Ok(cfg) => rows.push(ValidationRow::valid(
                        stage_name,
                        &id,
                        format!("{} {}", cfg.method, cfg.url),
                    )),
                    Err(err) => rows.push(ValidationRow::invalid(stage_name, &id, err.to_string())),
                }
            }
            if let Some(dynamic) = &options.dynamic {
                for (index, entry) in dynamic.metrics.iter().enumerate() {
                    let id = format!("dynamic-{index}");
                    match self.templates.metrics.get(&entry.template) {
                        Some(cfg) => rows.push(ValidationRow::valid(
                            stage_name,
                            &id,
                            format!(
                                "template={} provider={}",
                                entry.template, cfg.provider
                            ),
                        )),
                        None => rows.push(ValidationRow::invalid(
                            stage_name,
                            &id,
                            format!("analysis template {} not found", entry.template),
                        )),
                    }
                }
            }
        }
        Ok(ValidationReport { rows })
    }

    fn render_template(&self, pairs: &[String]) -> Result<AnalysisTemplateSpec> {
        let mut args = HashMap::new();
        for pair in pairs {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                AppError::InvalidArgument(format!("expected key=value, got {pair}"))
            })?;
            args.insert(key.to_string(), value.to_string());
        }
        Ok(render(&self.templates, &self.base_args().with_args(&args))?)
    }

    async fn probe(&self) -> Result<ProbeReport> {
        let args = self.base_args();
        let mut rows = Vec::new();
        for (stage_name, options) in self.analysis_stages() {
            for (index, check) in options.https.iter().enumerate() {
                let cfg = resolve_http_check(check, &self.templates, &args)?;
                let provider = HttpProvider::new(cfg.timeout)?;
                let evaluation = provider.run(&cfg).await?;
                rows.push(ProbeRow {
                    stage: stage_name.to_string(),
                    id: format!("http-{index}"),
                    url: cfg.url,
                    passed: evaluation.passed,
                    reason: evaluation.reason,
                });
            }
        }
        Ok(ProbeReport { rows })
    }
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub rows: Vec<ValidationRow>,
}

#[derive(Debug, Serialize)]
pub struct ValidationRow {
    pub stage: String,
    pub id: String,
    pub valid: bool,
    pub detail: String,
}

impl ValidationRow {
    fn valid(stage: &str, id: &str, detail: String) -> Self {
        Self {
            stage: stage.to_string(),
            id: id.to_string(),
            valid: true,
            detail,
        }
    }

    fn invalid(stage: &str, id: &str, detail: String) -> Self {
        Self {
            stage: stage.to_string(),
            id: id.to_string(),
            valid: false,
            detail,
        }
    }
}

impl DisplayFallback for ValidationReport {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no analysis checks configured".to_string();
        }
        self.rows
            .iter()
            .map(|row| {
                let status = if row.valid { "OK" } else { "INVALID" };
                format!("[{status}] {}/{} — {}", row.stage, row.id, row.detail)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub rows: Vec<ProbeRow>,
}

#[derive(Debug, Serialize)]
pub struct ProbeRow {
    pub stage: String,
    pub id: String,
    pub url: String,
    pub passed: bool,
    pub reason: String,
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no http checks configured".to_string();
        }
        self.rows
            .iter()
            .map(|row| {
                let status = if row.passed { "PASS" } else { "FAIL" };
                format!("[{status}] {}/{} {} — {}", row.stage, row.id, row.url, row.reason)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
