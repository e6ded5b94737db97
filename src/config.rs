//! Configuration types, loading and validation.

// ============================================================================
// SECTION 2: CONFIGURATION
// ============================================================================

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::ticks::FrameRate;
use crate::{
    DEFAULT_FRAMES_PER_SECOND, DEFAULT_LAG_TIME, DEFAULT_LEAD_TIME, DEFAULT_MONITOR_INTERVAL,
    ENV_PREFIX,
};

// ----------------------------------------------------------------------------
// 2.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub concentrator: ConcentratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Defaults plus environment overrides only.
    pub fn from_env() -> ConfigResult<Self> {
        Self::extract(Figment::new())
    }

    fn extract(figment: Figment) -> ConfigResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
                source: None,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(ConfigError::parse_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.concentrator.validate()?;
        self.logging.validate()?;
        self.simulation.validate()?;
        Ok(())
    }

    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 2.2 Concentrator Configuration
// ----------------------------------------------------------------------------

/// Frame synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentratorConfig {
    /// Frames published per second (1-1000)
    #[serde(default = "default_frames_per_second")]
    pub frames_per_second: u32,

    /// Seconds a frame waits for late samples before it is published
    #[serde(default = "default_lag_time")]
    pub lag_time: f64,

    /// Seconds a sample may be ahead of real-time
    #[serde(default = "default_lead_time")]
    pub lead_time: f64,

    /// Sort samples with bad timestamps by their arrival time
    #[serde(default = "default_true")]
    pub allow_sorts_by_arrival: bool,

    #[serde(default)]
    pub use_local_clock_as_real_time: bool,

    /// Keep the latest value of every key in the immediate measurement table
    #[serde(default)]
    pub track_latest_measurements: bool,

    /// Treat bad timestamp quality as good
    #[serde(default)]
    pub ignore_bad_timestamps: bool,

    #[serde(default = "default_true")]
    pub perform_timestamp_reasonability_check: bool,

    /// Measurements that make a frame complete (0 = unknown)
    #[serde(default)]
    pub expected_measurements: usize,

    /// Publish complete frames before lag time expires
    #[serde(default = "default_true")]
    pub allow_preemptive_publishing: bool,

    /// Run a dedicated publication thread; when false the host calls
    /// `publish_ready_frames`
    #[serde(default = "default_true")]
    pub use_precision_timer: bool,

    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            frames_per_second: default_frames_per_second(),
            lag_time: default_lag_time(),
            lead_time: default_lead_time(),
            allow_sorts_by_arrival: true,
            use_local_clock_as_real_time: false,
            track_latest_measurements: false,
            ignore_bad_timestamps: false,
            perform_timestamp_reasonability_check: true,
            expected_measurements: 0,
            allow_preemptive_publishing: true,
            use_precision_timer: true,
            monitor_interval: default_monitor_interval(),
        }
    }
}

impl ConcentratorConfig {
    pub fn frame_rate(&self) -> ConfigResult<FrameRate> {
        FrameRate::new(self.frames_per_second)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.frame_rate()?;
        validate_tolerance("lag_time", self.lag_time)?;
        validate_tolerance("lead_time", self.lead_time)?;
        if self.monitor_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "monitor_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Lag and lead tolerances are positive, finite seconds.
pub(crate) fn validate_tolerance(field: &str, seconds: f64) -> ConfigResult<()> {
    if seconds.is_finite() && seconds > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(
            field,
            format!("must be a positive number of seconds, got {seconds}"),
        ))
    }
}

// ----------------------------------------------------------------------------
// 2.3 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        match self.format.as_str() {
            "json" | "pretty" | "compact" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("expected json, pretty or compact, got '{other}'"),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.4 Simulation Configuration
// ----------------------------------------------------------------------------

/// Synthetic feed used by `concentrator run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of simulated devices
    #[serde(default = "default_sources")]
    pub sources: u32,

    /// Measurements reported by each device per sample
    #[serde(default = "default_measurements_per_source")]
    pub measurements_per_source: u32,

    /// Samples per second produced by each device
    #[serde(default = "default_frames_per_second")]
    pub sample_rate: u32,

    /// Delay between sampling and delivery; each device adds its own skew
    #[serde(default = "default_delivery_delay", with = "humantime_serde")]
    pub delivery_delay: Duration,

    /// Every Nth batch is delivered with a stale timestamp (0 = never)
    #[serde(default)]
    pub stale_every: u32,

    /// Stop after this long; runs until Ctrl-C when unset
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub run_for: Option<Duration>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            measurements_per_source: default_measurements_per_source(),
            sample_rate: default_frames_per_second(),
            delivery_delay: default_delivery_delay(),
            stale_every: 0,
            run_for: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sources == 0 {
            return Err(ConfigError::invalid_value("simulation.sources", "must be at least 1"));
        }
        if self.measurements_per_source == 0 {
            return Err(ConfigError::invalid_value(
                "simulation.measurements_per_source",
                "must be at least 1",
            ));
        }
        FrameRate::new(self.sample_rate).map_err(|_| {
            ConfigError::invalid_value("simulation.sample_rate", "must be between 1 and 1000")
        })?;
        Ok(())
    }

    /// Measurements expected in one complete frame.
    pub fn measurements_per_frame(&self) -> usize {
        self.sources as usize * self.measurements_per_source as usize
    }
}

// ----------------------------------------------------------------------------
// 2.5 Default Value Functions
// ----------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_frames_per_second() -> u32 {
    DEFAULT_FRAMES_PER_SECOND
}

fn default_lag_time() -> f64 {
    DEFAULT_LAG_TIME
}

fn default_lead_time() -> f64 {
    DEFAULT_LEAD_TIME
}

fn default_monitor_interval() -> Duration {
    DEFAULT_MONITOR_INTERVAL
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_sources() -> u32 {
    4
}

fn default_measurements_per_source() -> u32 {
    8
}

fn default_delivery_delay() -> Duration {
    Duration::from_millis(20)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concentrator.frames_per_second, 30);
        assert_eq!(config.concentrator.lag_time, 3.0);
        assert_eq!(config.concentrator.lead_time, 1.0);
        assert!(config.concentrator.allow_sorts_by_arrival);
        assert!(config.concentrator.perform_timestamp_reasonability_check);
        assert_eq!(config.concentrator.monitor_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let config = EngineConfig::from_str(
            r#"
            [concentrator]
            frames_per_second = 60
            lag_time = 0.5
            monitor_interval = "250ms"

            [simulation]
            run_for = "10s"
            "#,
        )
        .unwrap();

        assert_eq!(config.concentrator.frames_per_second, 60);
        assert_eq!(config.concentrator.lag_time, 0.5);
        assert_eq!(config.concentrator.lead_time, DEFAULT_LEAD_TIME);
        assert_eq!(config.concentrator.monitor_interval, Duration::from_millis(250));
        assert_eq!(config.simulation.run_for, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = EngineConfig::from_str("[concentrator]\nframes_per_second = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "frames_per_second"));

        let err = EngineConfig::from_str("[concentrator]\nlag_time = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "lag_time"));

        let err = EngineConfig::from_str("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        assert!(matches!(
            EngineConfig::from_str("[concentrator\n"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let text = EngineConfig::generate_default_config();
        assert!(text.contains("[concentrator]"));
        let parsed = EngineConfig::from_str(&text).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[concentrator]\nframes_per_second = 10\nuse_precision_timer = false").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.concentrator.frames_per_second, 10);
        assert!(!config.concentrator.use_precision_timer);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
