//! Routing core configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::MediaKind;

/// Top-level configuration for a routing core instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub dispatch: DispatchConfig,
    pub stats: StatsConfig,
    pub forwarding: ForwardingConfig,
    pub logging: LoggingConfig,
}

/// Transport dispatch table limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of source groups one transport may register (0 = unlimited)
    pub max_source_groups: usize,
}

/// Per-source statistics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Width of the sliding bitrate window
    pub bitrate_window_ms: u64,
    /// Period of the receiver-report interval boundary
    pub report_interval_ms: u64,
    /// Hard cap on samples kept in one bitrate window
    pub max_bitrate_samples: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            bitrate_window_ms: 1000,
            report_interval_ms: 1000,
            max_bitrate_samples: 1000,
        }
    }
}

/// Transponder forwarding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    pub audio_clock_rate: u32,
    pub video_clock_rate: u32,
    /// Ask the source for a keyframe whenever a video transponder starts a new timeline
    pub request_keyframe_on_switch: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            audio_clock_rate: 48_000,
            video_clock_rate: 90_000,
            request_keyframe_on_switch: true,
        }
    }
}

impl ForwardingConfig {
    #[must_use]
    pub const fn clock_rate(&self, kind: MediaKind) -> u32 {
        match kind {
            MediaKind::Audio => self.audio_clock_rate,
            MediaKind::Video => self.video_clock_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
    /// Emit per-packet `trace` events from the packet path
    pub packet_trace: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            packet_trace: false,
        }
    }
}

impl SfuConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MEDIARELAY_STATS__BITRATE_WINDOW_MS, MEDIARELAY_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("MEDIARELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check every setting, returning all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stats.bitrate_window_ms == 0 {
            errors.push("stats.bitrate_window_ms must be greater than 0".to_string());
        }
        if self.stats.report_interval_ms == 0 {
            errors.push("stats.report_interval_ms must be greater than 0".to_string());
        }
        if self.stats.max_bitrate_samples == 0 {
            errors.push("stats.max_bitrate_samples must be greater than 0".to_string());
        }
        if self.forwarding.audio_clock_rate == 0 {
            errors.push("forwarding.audio_clock_rate must be greater than 0".to_string());
        }
        if self.forwarding.video_clock_rate == 0 {
            errors.push("forwarding.video_clock_rate must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SfuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_source_groups, 0);
        assert_eq!(config.stats.bitrate_window_ms, 1000);
        assert_eq!(config.forwarding.clock_rate(MediaKind::Audio), 48_000);
        assert_eq!(config.forwarding.clock_rate(MediaKind::Video), 90_000);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = SfuConfig::default();
        config.stats.bitrate_window_ms = 0;
        config.forwarding.video_clock_rate = 0;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("bitrate_window_ms")));
        assert!(errors.iter().any(|e| e.contains("video_clock_rate")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediarelay.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[dispatch]\nmax_source_groups = 8\n\n[stats]\nbitrate_window_ms = 500\n"
        )
        .unwrap();

        let config = SfuConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.dispatch.max_source_groups, 8);
        assert_eq!(config.stats.bitrate_window_ms, 500);
        // Untouched sections keep their defaults
        assert_eq!(config.stats.report_interval_ms, 1000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = SfuConfig::load(Some("/nonexistent/mediarelay.toml")).unwrap();
        assert_eq!(config.forwarding.audio_clock_rate, 48_000);
    }
}
