use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use config as cfg;
use schemars::JsonSchema;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Largest accepted `pipeline.max_retries`.
pub const MAX_RETRIES: u32 = 10;

/// Connection to the external text-generation service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenerationSettings {
    /// Provider kind; only OpenAI-compatible chat completion endpoints ship.
    #[serde(default = "GenerationSettings::default_provider")]
    pub provider: String,
    #[serde(default = "GenerationSettings::default_base_url")]
    pub base_url: String,
    #[serde(default = "GenerationSettings::default_model")]
    pub model: String,
    #[serde(default, skip_serializing)]
    #[schemars(skip)]
    pub api_key: Option<SecretString>,
    #[serde(default = "GenerationSettings::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "GenerationSettings::default_max_tokens")]
    pub max_tokens: usize,
}

impl GenerationSettings {
    fn default_provider() -> String {
        "openai-compatible".to_string()
    }

    fn default_base_url() -> String {
        "http://localhost:11434/v1".to_string()
    }

    fn default_model() -> String {
        "llama3.1:8b".to_string()
    }

    fn default_timeout_secs() -> u64 {
        120
    }

    fn default_max_tokens() -> usize {
        2048
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            api_key: None,
            timeout_secs: Self::default_timeout_secs(),
            max_tokens: Self::default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineSettings {
    /// Retries per agent after the first attempt.
    #[serde(default = "PipelineSettings::default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    #[serde(default = "PipelineSettings::default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "PipelineSettings::default_deadline_secs")]
    pub default_deadline_secs: u64,
}

impl PipelineSettings {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_backoff_base_ms() -> u64 {
        500
    }

    fn default_deadline_secs() -> u64 {
        300
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            default_deadline_secs: Self::default_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VoterSettings {
    #[serde(default = "VoterSettings::default_samples")]
    pub samples: usize,
    #[serde(default = "VoterSettings::default_quorum")]
    pub quorum: usize,
    #[serde(default = "VoterSettings::default_max_concurrency")]
    pub max_concurrency: usize,
    /// Temperature added per sample index; sample 0 is the least random.
    #[serde(default = "VoterSettings::default_temperature_step")]
    pub temperature_step: f32,
    /// How long to keep waiting for in-flight samples once quorum is reached.
    #[serde(default = "VoterSettings::default_straggler_grace_ms")]
    pub straggler_grace_ms: u64,
}

impl VoterSettings {
    fn default_samples() -> usize {
        5
    }

    fn default_quorum() -> usize {
        3
    }

    fn default_max_concurrency() -> usize {
        3
    }

    fn default_temperature_step() -> f32 {
        0.1
    }

    fn default_straggler_grace_ms() -> u64 {
        2_000
    }
}

impl Default for VoterSettings {
    fn default() -> Self {
        Self {
            samples: Self::default_samples(),
            quorum: Self::default_quorum(),
            max_concurrency: Self::default_max_concurrency(),
            temperature_step: Self::default_temperature_step(),
            straggler_grace_ms: Self::default_straggler_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ComplianceSettings {
    /// Minimum score for a report to be considered compliant.
    #[serde(default = "ComplianceSettings::default_threshold")]
    pub threshold: f64,
    /// Floor applied to semantic rules that do not declare their own.
    #[serde(default = "ComplianceSettings::default_semantic_min_confidence")]
    pub semantic_min_confidence: f32,
}

impl ComplianceSettings {
    fn default_threshold() -> f64 {
        0.85
    }

    fn default_semantic_min_confidence() -> f32 {
        0.7
    }
}

impl Default for ComplianceSettings {
    fn default() -> Self {
        Self {
            threshold: Self::default_threshold(),
            semantic_min_confidence: Self::default_semantic_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LifecycleSettings {
    #[serde(default = "LifecycleSettings::default_approval_threshold")]
    pub approval_threshold: f64,
    /// Whether an approver may waive the CRITICAL-violation veto with a recorded justification.
    #[serde(default = "LifecycleSettings::default_allow_critical_override")]
    pub allow_critical_override: bool,
}

impl LifecycleSettings {
    fn default_approval_threshold() -> f64 {
        0.85
    }

    fn default_allow_critical_override() -> bool {
        true
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            approval_threshold: Self::default_approval_threshold(),
            allow_critical_override: Self::default_allow_critical_override(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    #[serde(default = "Settings::default_env")]
    pub env: String,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub voter: VoterSettings,
    #[serde(default)]
    pub compliance: ComplianceSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Self::default_env(),
            generation: GenerationSettings::default(),
            pipeline: PipelineSettings::default(),
            voter: VoterSettings::default(),
            compliance: ComplianceSettings::default(),
            lifecycle: LifecycleSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    fn default_env() -> String {
        env::var("AUDITGRAPH_ENV")
            .ok()
            .or_else(|| env::var("APP_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.generation.base_url.trim().is_empty(),
            "generation.base_url cannot be empty"
        );
        anyhow::ensure!(
            self.generation.max_tokens > 0,
            "generation.max_tokens must be > 0"
        );
        anyhow::ensure!(
            self.pipeline.max_retries <= MAX_RETRIES,
            "pipeline.max_retries must be <= {}",
            MAX_RETRIES
        );
        anyhow::ensure!(
            self.voter.samples > 0,
            "voter.samples must be > 0"
        );
        anyhow::ensure!(
            self.voter.quorum > 0 && self.voter.quorum <= self.voter.samples,
            "voter.quorum must be 1..=voter.samples"
        );
        anyhow::ensure!(
            self.voter.max_concurrency > 0,
            "voter.max_concurrency must be > 0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.compliance.threshold),
            "compliance.threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.lifecycle.approval_threshold),
            "lifecycle.approval_threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.compliance.semantic_min_confidence),
            "compliance.semantic_min_confidence must be within [0, 1]"
        );
        Ok(())
    }
}

pub struct ConfigManager;

impl ConfigManager {
    /// Loads and validates settings for the given environment (or `AUDITGRAPH_ENV`).
    pub fn load(config_dir: Option<PathBuf>, env_override: Option<String>) -> Result<Settings> {
        let env_name = env_override.unwrap_or_else(Settings::default_env);
        let dir = config_dir.unwrap_or_else(Self::default_config_dir);
        let settings = Self::load_from_sources(&dir, &env_name)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Priority order:
    /// 1. ~/.auditgraph/
    /// 2. ./config/
    /// 3. Current directory
    pub fn default_config_dir() -> PathBuf {
        if let Some(home_dir) = dirs::home_dir() {
            let user_dir = home_dir.join(".auditgraph");
            if user_dir.exists() {
                info!("Using config directory: {:?}", user_dir);
                return user_dir;
            }
        }

        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let project_config = cwd.join("config");
        if project_config.exists() {
            info!("Using config directory: {:?}", project_config);
            return project_config;
        }

        info!("Using config directory: {:?}", cwd);
        cwd
    }

    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Settings> {
        let settings: Settings = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.yaml")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.yaml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(cfg::Environment::with_prefix("AUDITGRAPH").separator("__"))
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.pipeline.max_retries, 3);
        assert_eq!(settings.voter.samples, 5);
        assert_eq!(settings.voter.quorum, 3);
    }

    #[test]
    fn quorum_larger_than_samples_is_rejected() {
        let mut settings = Settings::default();
        settings.voter.quorum = 6;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unbounded_retries_are_rejected() {
        let mut settings = Settings::default();
        settings.pipeline.max_retries = 40;
        assert!(settings.validate().is_err());
        settings.pipeline.max_retries = MAX_RETRIES;
        settings.validate().unwrap();
    }

    #[test]
    fn environment_file_overrides_default_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[voter]\nsamples = 7\nquorum = 4\n\n[compliance]\nthreshold = 0.9\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("staging.toml"),
            "[compliance]\nthreshold = 0.75\n",
        )
        .unwrap();

        let settings = ConfigManager::load_from_sources(dir.path(), "staging").unwrap();
        assert_eq!(settings.voter.samples, 7);
        assert_eq!(settings.voter.quorum, 4);
        assert_eq!(settings.compliance.threshold, 0.75);
        // untouched sections keep their defaults
        assert_eq!(settings.pipeline.backoff_base_ms, 500);
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut settings = Settings::default();
        settings.generation.api_key = Some(SecretString::from("sk-test".to_string()));
        let rendered = toml::to_string(&settings).unwrap();
        assert!(!rendered.contains("sk-test"));
    }
}
