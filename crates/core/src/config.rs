//! TOML-based adapter configuration.
//!
//! Every section is optional; an empty file yields the defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::features::Feature;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Configuration for a [`WorkingCopyAdapter`](crate::adapter::WorkingCopyAdapter).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub adapter: AdapterSection,

    /// Defaults used by [`StaticCheckinData`](crate::checkin::StaticCheckinData).
    #[serde(default)]
    pub checkin: CheckinConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSection {
    /// Features to switch off even when the backend supports them.
    #[serde(default)]
    pub disabled_features: Vec<Feature>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinConfig {
    #[serde(default)]
    pub default_comment: Option<String>,

    #[serde(default)]
    pub ticket_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Upper bound on the revisions `list_revisions` returns.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize {
    1000
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AdapterConfig {
    /// Load an [`AdapterConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "history.max_entries".into(),
                detail: "history limit must be > 0".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".into(),
                detail: format!(
                    "'{}' is not one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }
        if let Some(comment) = &self.checkin.default_comment {
            if comment.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "checkin.default_comment".into(),
                    detail: "default comment must not be blank".into(),
                });
            }
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[adapter]
disabled_features = ["lock", "latest-revision-lookup"]

[checkin]
default_comment = "automated checkin"
ticket_ids = [12, 14]

[history]
max_entries = 50

[logging]
level = "debug"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config = AdapterConfig::from_toml(sample_toml()).expect("failed to parse toml");
        assert_eq!(
            config.adapter.disabled_features,
            vec![Feature::Lock, Feature::LatestRevision]
        );
        assert_eq!(config.checkin.default_comment.as_deref(), Some("automated checkin"));
        assert_eq!(config.checkin.ticket_ids, vec![12, 14]);
        assert_eq!(config.history.max_entries, 50);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::from_toml("").unwrap();
        assert!(config.adapter.disabled_features.is_empty());
        assert!(config.checkin.default_comment.is_none());
        assert_eq!(config.history.max_entries, 1000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config, AdapterConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmbridge.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AdapterConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.history.max_entries, 50);
    }

    #[test]
    fn test_file_not_found() {
        let result = AdapterConfig::load_from_file("/nonexistent/cmbridge.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_unknown_feature_is_parse_error() {
        let result = AdapterConfig::from_toml("[adapter]\ndisabled_features = [\"teleport\"]\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_history() {
        let mut config = AdapterConfig::default();
        config.history.max_entries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "history.max_entries"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_level() {
        let mut config = AdapterConfig::default();
        config.logging.level = "loud".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "logging.level"
        ));
    }
}
