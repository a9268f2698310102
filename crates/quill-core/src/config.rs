//! Configuration for Quill.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables prefixed with `QUILL__` (sections separated by a
//! double underscore, e.g. `QUILL__RETRY__MAX_RETRIES=5`).

use quill_orchestrator::{
    MIN_POLL_INTERVAL, Orchestrator, OrchestratorConfig, RetryPolicy, SchedulerConfig, TemplateCatalog,
    TemplateError, WorkflowTemplate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "QUILL";

/// Separator between the prefix, sections and keys of environment variables.
pub const ENV_SEPARATOR: &str = "__";

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A loaded value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A template file could not be read.
    #[error("Failed to read template file {path}: {source}")]
    TemplateIo {
        /// Template file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A template file is not a valid TOML template.
    #[error("Failed to parse template file {path}: {source}")]
    TemplateParse {
        /// Template file path.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A template failed validation.
    #[error("Invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),

    /// The effective configuration could not be rendered.
    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Scheduler section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Maximum number of capability invocations running at once.
    pub max_concurrent_tasks: usize,
    /// Timeout of a single capability invocation, in seconds.
    pub task_timeout_secs: u64,
    /// Idle re-check interval, in milliseconds (raised to 100).
    pub poll_interval_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { max_concurrent_tasks: 10, task_timeout_secs: 30, poll_interval_ms: 100 }
    }
}

/// Retry section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts a step gets before it is permanently failed.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Double the delay for every further retry.
    pub exponential_backoff: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 2000, exponential_backoff: true }
    }
}

/// Storage section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Root directory of the JSON document store.
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("data") }
    }
}

/// Logging section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

/// Extra workflow templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesSection {
    /// TOML files, one template each, added to the built-in catalog.
    pub files: Vec<PathBuf>,
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuillConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerSection,
    /// Retry policy.
    pub retry: RetrySection,
    /// Document storage.
    pub storage: StorageSection,
    /// Logging.
    pub logging: LoggingSection,
    /// Extra templates.
    pub templates: TemplatesSection,
}

impl QuillConfig {
    /// Loads configuration from defaults, an optional file, and the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed, or a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`QuillConfig::load`], reading environment variables from `env` when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder
                .add_source(config::File::from(path).format(config::FileFormat::Toml).required(true));
        }

        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(env.map(|vars| vars.into_iter().collect()));

        let loaded: Self = builder.add_source(environment).build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Checks value ranges the type system does not.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid("scheduler.max_concurrent_tasks must be at least 1".to_string()));
        }
        if self.scheduler.task_timeout_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.task_timeout_secs must be at least 1".to_string()));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid("retry.max_retries must be at least 1".to_string()));
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.data_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// Scheduler settings, with the poll interval raised to the minimum.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_tasks: self.scheduler.max_concurrent_tasks,
            task_timeout: Duration::from_secs(self.scheduler.task_timeout_secs),
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms).max(MIN_POLL_INTERVAL),
        }
        .normalized()
    }

    /// Retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_config(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.exponential_backoff,
        )
    }

    /// Orchestrator settings.
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig { scheduler: self.scheduler_config(), retry: self.retry_policy() }
    }

    /// Reads and validates the extra template files, in configuration order.
    pub fn load_templates(&self) -> Result<Vec<WorkflowTemplate>> {
        self.templates
            .files
            .iter()
            .map(|path| {
                let source = std::fs::read_to_string(path)
                    .map_err(|source| ConfigError::TemplateIo { path: path.clone(), source })?;
                let template: WorkflowTemplate = toml::from_str(&source)
                    .map_err(|source| ConfigError::TemplateParse { path: path.clone(), source })?;
                template.validate()?;
                Ok(template)
            })
            .collect()
    }

    /// Builds an orchestrator with the built-in and configured templates.
    ///
    /// The scheduler is not started.
    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let catalog = TemplateCatalog::with_builtin();
        for template in self.load_templates()? {
            catalog.register(template).await?;
        }
        Ok(Orchestrator::with_catalog(self.orchestrator_config(), catalog))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
