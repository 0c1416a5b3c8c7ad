//! Configuration loading and config file resolution
//!
//! A missing config file is not an error: SafeTrack starts with compiled
//! defaults and logs a warning. A file that exists but does not parse is.

use crate::geolocation::PositionOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SAFETRACK_CONFIG";

/// Default freshness window for presence records
pub const DEFAULT_STALE_THRESHOLD_MS: u64 = 30_000;

/// Largest accepted freshness window (one day)
pub const MAX_STALE_THRESHOLD_MS: u64 = 86_400_000;

/// Default interval for re-filtering the last snapshot without new writes
pub const DEFAULT_REFILTER_INTERVAL_MS: u64 = 5_000;

/// Positioning options applied when a tracking session starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocationConfig {
    /// Prefer precision over availability (off by default)
    pub enable_high_accuracy: bool,
    /// Give up on a fix after this many milliseconds
    pub timeout_ms: u64,
    /// Accept a cached fix up to this age
    pub maximum_age_ms: u64,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enable_high_accuracy: false,
            timeout_ms: 15_000,
            maximum_age_ms: 10_000,
        }
    }
}

impl GeolocationConfig {
    pub fn position_options(&self) -> PositionOptions {
        PositionOptions {
            enable_high_accuracy: self.enable_high_accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            maximum_age: Duration::from_millis(self.maximum_age_ms),
        }
    }
}

/// Presence subsystem configuration (`config.toml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Records older than this are excluded from every delivered view
    pub stale_threshold_ms: u64,
    /// Local re-filter period for subscribers; 0 disables
    pub refilter_interval_ms: u64,
    /// tracing filter directive used when RUST_LOG is unset
    pub log_level: String,
    /// Listen address for the HTTP facade
    pub bind_address: String,
    pub geolocation: GeolocationConfig,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            refilter_interval_ms: DEFAULT_REFILTER_INTERVAL_MS,
            log_level: "info".to_string(),
            bind_address: "127.0.0.1:5780".to_string(),
            geolocation: GeolocationConfig::default(),
        }
    }
}

impl PresenceConfig {
    pub fn stale_threshold(&self) -> chrono::Duration {
        let millis = self.stale_threshold_ms.min(MAX_STALE_THRESHOLD_MS);
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    /// `None` when periodic re-filtering is disabled
    pub fn refilter_interval(&self) -> Option<Duration> {
        (self.refilter_interval_ms > 0).then(|| Duration::from_millis(self.refilter_interval_ms))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration following the resolution priority order:
    /// 1. Command-line argument (highest priority)
    /// 2. `SAFETRACK_CONFIG` environment variable
    /// 3. User config file (`~/.config/safetrack/config.toml`)
    /// 4. Compiled defaults (fallback)
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path) {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                info!("No config file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.stale_threshold_ms == 0 {
            return Err(Error::Config(
                "stale_threshold_ms must be greater than zero".to_string(),
            ));
        }
        if self.stale_threshold_ms > MAX_STALE_THRESHOLD_MS {
            return Err(Error::Config(format!(
                "stale_threshold_ms must be at most {}",
                MAX_STALE_THRESHOLD_MS
            )));
        }
        if self.geolocation.timeout_ms == 0 {
            return Err(Error::Config(
                "geolocation.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve which config file to read, if any
///
/// Explicit paths (CLI, env) are returned even when missing so the caller can
/// warn about them; the user config location is only returned when present.
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    dirs::config_dir()
        .map(|d| d.join("safetrack").join("config.toml"))
        .filter(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_behavior() {
        let config = PresenceConfig::default();
        assert_eq!(config.stale_threshold_ms, 30_000);
        assert_eq!(config.stale_threshold(), chrono::Duration::seconds(30));
        assert!(!config.geolocation.enable_high_accuracy);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PresenceConfig::from_toml_str(
            r#"
            refilter_interval_ms = 1000

            [geolocation]
            timeout_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.stale_threshold_ms, DEFAULT_STALE_THRESHOLD_MS);
        assert_eq!(config.refilter_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.geolocation.timeout_ms, 5000);
        assert_eq!(config.geolocation.maximum_age_ms, 10_000);
    }

    #[test]
    fn test_zero_refilter_disables_timer() {
        let config = PresenceConfig::from_toml_str("refilter_interval_ms = 0").unwrap();
        assert_eq!(config.refilter_interval(), None);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = PresenceConfig::from_toml_str("stale_threshold_ms = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_oversized_threshold_rejected() {
        let err = PresenceConfig::from_toml_str("stale_threshold_ms = 86400001").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let at_limit = PresenceConfig::from_toml_str("stale_threshold_ms = 86400000").unwrap();
        assert_eq!(at_limit.stale_threshold(), chrono::Duration::days(1));
    }

    #[test]
    fn test_unvalidated_threshold_is_clamped() {
        let config = PresenceConfig {
            stale_threshold_ms: u64::MAX,
            ..PresenceConfig::default()
        };
        assert_eq!(config.stale_threshold(), chrono::Duration::days(1));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = PresenceConfig::from_toml_str("stale_threshold_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_position_options_conversion() {
        let options = GeolocationConfig::default().position_options();
        assert_eq!(options.timeout, Duration::from_secs(15));
        assert_eq!(options.maximum_age, Duration::from_secs(10));
    }
}
