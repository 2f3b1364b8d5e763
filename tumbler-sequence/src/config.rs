use crate::errors::SequenceError;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

pub const CONFIG_ENV_PREFIX: &str = "TUMBLER__";

/// Upper bound on sequences probed for missing events in one multi-query.
pub const MISSING_EVENTS_SEQUENCES_CHECK_BATCH_SIZE: usize = 1000;

/// Sequence window configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SequenceConfig {
    /// Hits requested per stage query; a shorter page means the stage is exhausted
    pub fetch_size: usize,

    /// Maximum time between the first and last event of a sequence; 0 disables
    pub max_span_ms: u64,

    /// Overall execution budget
    pub timeout_ms: u64,

    pub missing_check_batch_size: usize,

    pub key_cache_capacity: usize,

    /// In-flight sequences kept per key and stage before the oldest is evicted
    pub max_candidates_per_key: usize,

    /// Stop once this many sequences completed
    #[serde(default)]
    pub result_limit: Option<usize>,

    pub case_insensitive_keys: bool,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        SequenceConfig {
            fetch_size: 1000,
            max_span_ms: 0,
            timeout_ms: 30_000,
            missing_check_batch_size: MISSING_EVENTS_SEQUENCES_CHECK_BATCH_SIZE,
            key_cache_capacity: tumbler_types::key::DEFAULT_KEY_CACHE_CAPACITY,
            max_candidates_per_key: 1000,
            result_limit: None,
            case_insensitive_keys: false,
        }
    }
}

impl SequenceConfig {
    /// Loads configuration. Priority (from highest to lowest) is:
    ///   1. TUMBLER__* environment variables
    ///   2. the file at `path`
    ///   3. tumbler.toml in the current directory
    ///   4. ../default.toml
    pub fn load(path: Option<&Path>) -> Result<Self, SequenceError> {
        let mut figment = Figment::from(Toml::string(DEFAULT_CONFIG)).admerge(Toml::file("tumbler.toml"));

        if let Some(path) = path {
            if !path.exists() {
                return Err(SequenceError::InvalidConfig(format!(
                    "cannot load configuration from {}; file does not exist",
                    path.to_string_lossy()
                )));
            }
            figment = match path.extension().and_then(OsStr::to_str) {
                Some("yaml") | Some("yml") => figment.admerge(Yaml::file(path)),
                Some("json") => figment.admerge(Json::file(path)),
                _ => figment.admerge(Toml::file(path)),
            };
        }

        let figment = figment.admerge(
            Env::prefixed(CONFIG_ENV_PREFIX)
                .map(|p| p.as_str().replace("__", ".").replace('_', "-").into()),
        );

        Self::extract(figment)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, SequenceError> {
        Self::extract(Figment::from(Toml::string(DEFAULT_CONFIG)).admerge(Toml::string(s)))
    }

    fn extract(figment: Figment) -> Result<Self, SequenceError> {
        let config: SequenceConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.fetch_size == 0 {
            return Err(SequenceError::InvalidConfig("fetch-size must be positive".to_string()));
        }
        if self.missing_check_batch_size == 0 {
            return Err(SequenceError::InvalidConfig(
                "missing-check-batch-size must be positive".to_string(),
            ));
        }
        if self.max_candidates_per_key == 0 {
            return Err(SequenceError::InvalidConfig(
                "max-candidates-per-key must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_span(&self) -> Option<Duration> {
        (self.max_span_ms > 0).then(|| Duration::from_millis(self.max_span_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
