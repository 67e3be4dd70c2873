//! Two-tier check resolution: inline checks are validated and returned as
//! is, template references render the whole template document with the
//! deployment-specific arguments before selecting the named entry.
//!
//! Rendering is a pure text substitution over the serialized document:
//! `{{ .Args.key }}` placeholders plus the built-in variables `App.Name`,
//! `App.Env` and `K8s.Namespace`. The built-in names are provisional and
//! may move under a dedicated namespace in a later config revision.

use std::collections::HashMap;

use regex::Regex;

use crate::config::{
    AnalysisHttp, AnalysisLog, AnalysisMetrics, AnalysisTemplateSpec, DeploymentConfig,
    Templatable,
};
use crate::pipeline::Application;

use super::AnalysisError;

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*\.([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}";

/// Render context: the deployment's built-in fields plus user args.
#[derive(Debug, Clone, Default)]
pub struct TemplateArgs {
    pub app_name: String,
    pub app_env: String,
    pub k8s_namespace: Option<String>,
    pub args: HashMap<String, String>,
}

impl TemplateArgs {
    pub fn new(application: &Application, config: &DeploymentConfig) -> Self {
        Self {
            app_name: application.name.clone(),
            app_env: application.env.clone(),
            k8s_namespace: config.namespace(),
            args: HashMap::new(),
        }
    }

    /// Returns a copy with the given user args merged in, later keys winning.
    pub fn with_args(&self, args: &HashMap<String, String>) -> Self {
        let mut merged = self.clone();
        merged
            .args
            .extend(args.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    fn lookup(&self, path: &str) -> Option<String> {
        match path {
            "App.Name" => Some(self.app_name.clone()),
            "App.Env" => Some(self.app_env.clone()),
            "K8s.Namespace" => Some(self.k8s_namespace.clone().unwrap_or_default()),
            _ => path
                .strip_prefix("Args.")
                .and_then(|key| self.args.get(key).cloned()),
        }
    }
}

/// Renders the template document by substituting every placeholder in its
/// serialized form and re-parsing the result. A reference to an undefined
/// argument is a hard error.
pub fn render(
    spec: &AnalysisTemplateSpec,
    args: &TemplateArgs,
) -> Result<AnalysisTemplateSpec, AnalysisError> {
    let raw = serde_json::to_string(spec).map_err(|err| AnalysisError::Render(err.to_string()))?;
    let rendered = substitute(&raw, args)?;
    serde_json::from_str(&rendered).map_err(|err| AnalysisError::Render(err.to_string()))
}

fn substitute(text: &str, args: &TemplateArgs) -> Result<String, AnalysisError> {
    let placeholder =
        Regex::new(PLACEHOLDER_PATTERN).map_err(|err| AnalysisError::Render(err.to_string()))?;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for captures in placeholder.captures_iter(text) {
        let (Some(whole), Some(path)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = args.lookup(path.as_str()).ok_or_else(|| {
            AnalysisError::Render(format!("undefined template argument .{}", path.as_str()))
        })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&escape_json(&value));
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

// Substituted values land inside JSON string literals.
fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn resolve_metrics_check(
    check: &Templatable<AnalysisMetrics>,
    templates: &AnalysisTemplateSpec,
    args: &TemplateArgs,
) -> Result<AnalysisMetrics, AnalysisError> {
    match check {
        Templatable::Inline(cfg) => {
            cfg.validate_static()
                .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
            Ok(cfg.clone())
        }
        Templatable::Template { template } => {
            let rendered = render(templates, &args.with_args(&template.args))?;
            let cfg = rendered
                .metrics
                .get(&template.name)
                .ok_or_else(|| AnalysisError::TemplateNotFound(template.name.clone()))?;
            cfg.validate_static()
                .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
            Ok(cfg.clone())
        }
    }
}

pub fn resolve_log_check(
    check: &Templatable<AnalysisLog>,
    templates: &AnalysisTemplateSpec,
    args: &TemplateArgs,
) -> Result<AnalysisLog, AnalysisError> {
    match check {
        Templatable::Inline(cfg) => {
            cfg.validate()
                .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
            Ok(cfg.clone())
        }
        Templatable::Template { template } => {
            let rendered = render(templates, &args.with_args(&template.args))?;
            let cfg = rendered
                .logs
                .get(&template.name)
                .ok_or_else(|| AnalysisError::TemplateNotFound(template.name.clone()))?;
            cfg.validate()
                .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
            Ok(cfg.clone())
        }
    }
}

pub fn resolve_http_check(
    check: &Templatable<AnalysisHttp>,
    templates: &AnalysisTemplateSpec,
    args: &TemplateArgs,
) -> Result<AnalysisHttp, AnalysisError> {
    match check {
        Templatable::Inline(cfg) => {
            cfg.validate()
                .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
            Ok(cfg.clone())
        }
        Templatable::Template { template } => {
            let rendered = render(templates, &args.with_args(&template.args))?;
            let cfg = rendered
                .https
                .get(&template.name)
                .ok_or_else(|| AnalysisError::TemplateNotFound(template.name.clone()))?;
            cfg.validate()
                .map_err(|err| AnalysisError::InvalidConfiguration(err.to_string()))?;
            Ok(cfg.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisExpected, TemplateRef};
    use std::time::Duration;

    fn template_spec() -> AnalysisTemplateSpec {
        let mut spec = AnalysisTemplateSpec::default();
        spec.metrics.insert(
            "grpc_error_rate_percentage".to_string(),
            AnalysisMetrics {
                provider: "prometheus-dev".to_string(),
                query: concat!(
                    "sum(rate(grpc_error_count{namespace=\"{{ .K8s.Namespace }}\",",
                    "app=\"{{ .App.Name }}\",variant=\"{{ .Args.variant }}\"}[1m]))"
                )
                .to_string(),
                expected: AnalysisExpected {
                    min: None,
                    max: Some(0.1),
                },
                interval: Duration::from_secs(60),
                failure_limit: 1,
                skip_on_no_data: false,
                deviation: Default::default(),
            },
        );
        spec
    }

    fn base_args() -> TemplateArgs {
        TemplateArgs {
            app_name: "helloworld".to_string(),
            app_env: "dev".to_string(),
            k8s_namespace: Some("web".to_string()),
            args: HashMap::new(),
        }
    }

    #[test]
    fn render_substitutes_builtins_and_args() {
        let args = base_args().with_args(&HashMap::from([(
            "variant".to_string(),
            "canary".to_string(),
        )]));
        let rendered = render(&template_spec(), &args).unwrap();
        let query = &rendered.metrics["grpc_error_rate_percentage"].query;
        assert!(query.contains("namespace=\"web\""));
        assert!(query.contains("app=\"helloworld\""));
        assert!(query.contains("variant=\"canary\""));
    }

    #[test]
    fn render_is_idempotent_without_placeholders() {
        let mut spec = AnalysisTemplateSpec::default();
        spec.metrics.insert(
            "plain".to_string(),
            AnalysisMetrics {
                provider: "prometheus-dev".to_string(),
                query: "up".to_string(),
                expected: AnalysisExpected {
                    min: Some(1.0),
                    max: None,
                },
                interval: Duration::from_secs(60),
                failure_limit: 0,
                skip_on_no_data: false,
                deviation: Default::default(),
            },
        );
        let once = render(&spec, &base_args()).unwrap();
        let twice = render(&once, &base_args()).unwrap();
        assert_eq!(once.metrics["plain"].query, twice.metrics["plain"].query);
    }

    #[test]
    fn render_fails_on_undefined_argument() {
        let err = render(&template_spec(), &base_args()).unwrap_err();
        match err {
            AnalysisError::Render(reason) => assert!(reason.contains("Args.variant")),
            other => panic!("expected render error, got {other}"),
        }
    }

    #[test]
    fn resolve_returns_inline_check_untouched() {
        let inline = Templatable::Inline(AnalysisMetrics {
            provider: "prometheus-dev".to_string(),
            query: "error_rate".to_string(),
            expected: AnalysisExpected {
                min: None,
                max: Some(1.0),
            },
            interval: Duration::from_secs(60),
            failure_limit: 0,
            skip_on_no_data: false,
            deviation: Default::default(),
        });
        let cfg = resolve_metrics_check(&inline, &AnalysisTemplateSpec::default(), &base_args())
            .unwrap();
        assert_eq!(cfg.query, "error_rate");
    }

    #[test]
    fn resolve_rejects_static_check_without_bounds() {
        let inline = Templatable::Inline(AnalysisMetrics {
            provider: "prometheus-dev".to_string(),
            query: "error_rate".to_string(),
            expected: AnalysisExpected::default(),
            interval: Duration::from_secs(60),
            failure_limit: 0,
            skip_on_no_data: false,
            deviation: Default::default(),
        });
        let err = resolve_metrics_check(&inline, &AnalysisTemplateSpec::default(), &base_args())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidConfiguration(_)));
    }

    #[test]
    fn resolve_fails_on_missing_template_entry() {
        let check = Templatable::Template {
            template: TemplateRef {
                name: "does_not_exist".to_string(),
                args: HashMap::new(),
            },
        };
        let err =
            resolve_metrics_check(&check, &AnalysisTemplateSpec::default(), &base_args())
                .unwrap_err();
        assert!(matches!(err, AnalysisError::TemplateNotFound(_)));
    }

    #[test]
    fn resolve_renders_template_reference() {
        let check = Templatable::Template {
            template: TemplateRef {
                name: "grpc_error_rate_percentage".to_string(),
                args: HashMap::from([("variant".to_string(), "baseline".to_string())]),
            },
        };
        let cfg = resolve_metrics_check(&check, &template_spec(), &base_args()).unwrap();
        assert!(cfg.query.contains("variant=\"baseline\""));
        assert_eq!(cfg.failure_limit, 1);
    }
}
