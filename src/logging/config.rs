use crate::logging::layers::console::ConsoleOutput;
use crate::Result;
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing_subscriber::filter::Directive;
use url::Url;

const DEFAULT_LEVEL: &str = "info";
const DEFAULT_SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

/// Resolved logging configuration: defaults, then `.statewright/logging.toml`, then env.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
    pub default_level: String,
    pub enable_file: bool,
    pub console_output: Option<ConsoleOutput>,
    pub opentelemetry: OpenTelemetryConfig,
}

#[derive(Debug, Clone)]
pub struct OpenTelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            default_level: DEFAULT_LEVEL.to_string(),
            enable_file: true,
            console_output: None,
            opentelemetry: OpenTelemetryConfig::default(),
        }
    }
}

impl Default for OpenTelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn load(workspace_root: Option<&Path>) -> Result<Self> {
        let mut config = LoggingConfig::default();
        if let Some(workspace) = workspace_root {
            let path = workspace.join(".statewright").join("logging.toml");
            if let Some(section) = Self::load_from_file(&path)? {
                config.apply(section);
            }
        }
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Option<TomlLoggingSection>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read logging config {}", path.display()))?;
        let parsed: TomlLogging = toml::from_str(&content)
            .with_context(|| format!("failed to parse logging config {}", path.display()))?;
        Ok(parsed.logging)
    }

    fn apply(&mut self, logging: TomlLoggingSection) {
        if let Some(log_dir) = logging.log_dir {
            self.log_dir = Some(PathBuf::from(log_dir));
        }
        if let Some(default_level) = logging.default_level {
            self.default_level = default_level;
        }
        if let Some(enable_file) = logging.enable_file {
            self.enable_file = enable_file;
        }
        if logging.console_output.is_some() {
            self.console_output = logging.console_output;
        }
        if let Some(otel) = logging.opentelemetry {
            if let Some(enabled) = otel.enabled {
                self.opentelemetry.enabled = enabled;
            }
            if let Some(endpoint) = otel.endpoint {
                self.opentelemetry.endpoint = Some(endpoint);
            }
            if let Some(service_name) = otel.service_name {
                self.opentelemetry.service_name = service_name;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.opentelemetry.endpoint = Some(endpoint);
                self.opentelemetry.enabled = true;
            }
        }
        if let Ok(raw) = env::var("STATEWRIGHT_LOG_CONSOLE") {
            self.console_output = Some(ConsoleOutput::from_str(&raw).map_err(|e| anyhow!(e))?);
        }
        if let Ok(raw) = env::var("STATEWRIGHT_LOG_FILE") {
            self.enable_file = raw.trim() != "0" && !raw.trim().eq_ignore_ascii_case("false");
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        Directive::from_str(&self.default_level)
            .map_err(|_| anyhow!("logging.default_level must be a valid tracing directive"))?;

        if let Some(endpoint) = &self.opentelemetry.endpoint {
            Url::parse(endpoint)
                .map_err(|err| anyhow!("invalid logging.opentelemetry.endpoint: {}", err))?;
        }

        if self.opentelemetry.enabled && self.opentelemetry.endpoint.is_none() {
            return Err(anyhow!(
                "logging.opentelemetry.endpoint is required when opentelemetry is enabled"
            ));
        }

        if self.opentelemetry.enabled && self.opentelemetry.service_name.trim().is_empty() {
            return Err(anyhow!(
                "logging.opentelemetry.service_name must be set when opentelemetry is enabled"
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TomlLogging {
    logging: Option<TomlLoggingSection>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingSection {
    log_dir: Option<String>,
    default_level: Option<String>,
    enable_file: Option<bool>,
    #[serde(default)]
    console_output: Option<ConsoleOutput>,
    opentelemetry: Option<TomlOpentelemetry>,
}

#[derive(Debug, Deserialize)]
struct TomlOpentelemetry {
    enabled: Option<bool>,
    endpoint: Option<String>,
    service_name: Option<String>,
}
