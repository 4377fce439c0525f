//! Configuration loading.
//!
//! Every section is optional; accessors fall back to the `DEFAULT_*`
//! constants. API keys never live in the file: each endpoint names the
//! environment variable that holds its key.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotation::EndpointConfig;
use crate::error::ConfigError;
use crate::prompts::PromptSet;
use crate::resolver::ResolverConfig;
use crate::retry::RetryPolicy;
use crate::scorer::ScoringPolicy;

/// Default image worker width.
pub const DEFAULT_WORKERS: usize = 4;
/// Default number of completed images between flushes.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 10;
/// Default share of detected components that get analysed.
pub const DEFAULT_NODE_SAMPLE_RATE: f64 = 1.0;
/// Default per-call timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_TEMPERATURE: f32 = 0.1;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    pub input: Option<InputConfig>,
    pub output: Option<OutputConfig>,
    pub sources: Option<SourcesConfig>,
    pub judge: Option<EndpointSection>,
    pub pipeline: Option<PipelineConfig>,
    pub retry: Option<RetryConfig>,
    pub resolver: Option<ResolverConfig>,
    pub scoring: Option<ScoringPolicy>,
    pub prompts: Option<PromptSet>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct InputConfig {
    pub image_root: Option<PathBuf>,
    /// Precomputed detector output, keyed by image id.
    pub detections: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct OutputConfig {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SourcesConfig {
    pub primary: Option<EndpointSection>,
    pub secondary: Option<EndpointSection>,
}

/// One `OpenAI`-compatible endpoint.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct EndpointSection {
    /// Source key in persisted records; defaults to the model name.
    pub label: Option<String>,
    pub api_base: Option<String>,
    pub model: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PipelineConfig {
    pub workers: Option<usize>,
    pub checkpoint_interval: Option<usize>,
    /// Global cap on concurrent external calls.
    pub max_inflight_calls: Option<usize>,
    pub node_sample_rate: Option<f64>,
    pub sample_seed: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub resume: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
}

/// Which endpoint to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Primary,
    Secondary,
    Judge,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "sources.primary"),
            Self::Secondary => write!(f, "sources.secondary"),
            Self::Judge => write!(f, "judge"),
        }
    }
}

impl Config {
    pub fn image_root(&self) -> Option<&Path> {
        self.input.as_ref().and_then(|i| i.image_root.as_deref())
    }

    pub fn detections_path(&self) -> Option<&Path> {
        self.input.as_ref().and_then(|i| i.detections.as_deref())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output
            .as_ref()
            .and_then(|o| o.dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }

    fn pipeline_value<T>(&self, pick: impl Fn(&PipelineConfig) -> Option<T>) -> Option<T> {
        self.pipeline.as_ref().and_then(pick)
    }

    /// Image worker width, at least 1.
    pub fn workers(&self) -> usize {
        self.pipeline_value(|p| p.workers)
            .unwrap_or(DEFAULT_WORKERS)
            .max(1)
    }

    /// Completed images between flushes, at least 1.
    pub fn checkpoint_interval(&self) -> usize {
        self.pipeline_value(|p| p.checkpoint_interval)
            .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL)
            .max(1)
    }

    pub fn max_inflight_calls(&self) -> Option<usize> {
        self.pipeline_value(|p| p.max_inflight_calls)
    }

    /// Sample rate clamped to (0, 1].
    pub fn node_sample_rate(&self) -> f64 {
        let rate = self
            .pipeline_value(|p| p.node_sample_rate)
            .unwrap_or(DEFAULT_NODE_SAMPLE_RATE);
        if rate.is_finite() && rate > 0.0 {
            rate.min(1.0)
        } else {
            DEFAULT_NODE_SAMPLE_RATE
        }
    }

    pub fn sample_seed(&self) -> Option<u64> {
        self.pipeline_value(|p| p.sample_seed)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.pipeline_value(|p| p.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn resume(&self) -> bool {
        self.pipeline_value(|p| p.resume).unwrap_or(true)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(retry) = &self.retry {
            if let Some(n) = retry.max_attempts {
                policy.max_attempts = n.max(1);
            }
            if let Some(ms) = retry.initial_delay_ms {
                policy.initial_delay = Duration::from_millis(ms);
            }
            if let Some(m) = retry.multiplier {
                policy.multiplier = m;
            }
        }
        policy
    }

    pub fn resolver(&self) -> ResolverConfig {
        self.resolver.unwrap_or_default()
    }

    pub fn scoring(&self) -> ScoringPolicy {
        self.scoring.unwrap_or_default()
    }

    pub fn prompts(&self) -> PromptSet {
        self.prompts.clone().unwrap_or_default()
    }

    fn section(&self, role: EndpointRole) -> Option<&EndpointSection> {
        match role {
            EndpointRole::Primary => self.sources.as_ref().and_then(|s| s.primary.as_ref()),
            EndpointRole::Secondary => self.sources.as_ref().and_then(|s| s.secondary.as_ref()),
            EndpointRole::Judge => self.judge.as_ref(),
        }
    }

    /// Build the connection settings for one endpoint, reading its API key
    /// from the environment.
    ///
    /// # Errors
    ///
    /// Fails if the section or its model is missing, or the key variable is
    /// unset.
    pub fn endpoint(&self, role: EndpointRole) -> Result<EndpointConfig, ConfigError> {
        let section = self
            .section(role)
            .ok_or_else(|| ConfigError::Invalid(format!("missing [{role}] section")))?;
        let model = section
            .model
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("[{role}] has no model")))?;
        let key_env = section
            .api_key_env
            .clone()
            .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
        let api_key = std::env::var(&key_env).map_err(|_| ConfigError::MissingEnv(key_env))?;

        let label = section.label.clone().unwrap_or_else(|| model.clone());
        let mut endpoint = EndpointConfig::new(
            label,
            section
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model,
        );
        endpoint.api_key = api_key;
        endpoint.temperature = section.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        endpoint.max_tokens = section.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        endpoint.timeout = self.request_timeout();
        endpoint.retry = self.retry_policy();
        Ok(endpoint)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let resolver = self.resolver();
        if resolver.iou_weight < 0.0 || resolver.name_weight < 0.0 {
            return Err(ConfigError::Invalid(
                "resolver weights must be non-negative".to_string(),
            ));
        }
        let scoring = self.scoring();
        if scoring.component_threshold > 100 {
            return Err(ConfigError::Invalid(
                "scoring.component_threshold must be at most 100".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&scoring.image_ratio_threshold) {
            return Err(ConfigError::Invalid(
                "scoring.image_ratio_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.max_inflight_calls() == Some(0) {
            return Err(ConfigError::Invalid(
                "pipeline.max_inflight_calls must be positive".to_string(),
            ));
        }
        let label = |role| {
            self.section(role)
                .and_then(|s: &EndpointSection| s.label.clone().or_else(|| s.model.clone()))
        };
        let primary = label(EndpointRole::Primary);
        let secondary = label(EndpointRole::Secondary);
        if primary.is_some() && primary == secondary {
            return Err(ConfigError::Invalid(
                "primary and secondary sources need distinct labels".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}
