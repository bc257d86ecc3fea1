//! # Run Parameters
//!
//! `parameter.json` is shared with the simulators, so unknown fields are
//! ignored and only the keys the hub needs are read:
//!
//! ```json
//! {
//!   "level_log": 1,
//!   "id_nest_region": [0, 1],
//!   "param_TR_tvb_to_nest": { "seed": 42, "rate_scale": 1.0 },
//!   "param_TR_nest_to_tvb": { "width": 20.0 },
//!   "interscale_hub": { "poll_interval_ms": 1000, "cleanup_timeout_ms": 60000 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use interscale_core::WaitOptions;
use serde::Deserialize;

use crate::error::ConfigError;

/// Logging verbosity as written in `level_log`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawLevel")]
pub enum LogLevel {
    /// 0
    Debug,
    /// 1
    #[default]
    Info,
    /// 2
    Warning,
    /// 3
    Error,
    /// 4
    Critical,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Number(i64),
    Name(String),
}

impl TryFrom<RawLevel> for LogLevel {
    type Error = String;

    fn try_from(raw: RawLevel) -> Result<Self, String> {
        match raw {
            RawLevel::Number(0) => Ok(Self::Debug),
            RawLevel::Number(1) => Ok(Self::Info),
            RawLevel::Number(2) => Ok(Self::Warning),
            RawLevel::Number(3) => Ok(Self::Error),
            RawLevel::Number(4) => Ok(Self::Critical),
            RawLevel::Number(n) => Err(format!("level_log {n} out of range 0..=4")),
            RawLevel::Name(name) => match name.to_ascii_lowercase().as_str() {
                "debug" => Ok(Self::Debug),
                "info" => Ok(Self::Info),
                "warn" | "warning" => Ok(Self::Warning),
                "error" => Ok(Self::Error),
                "critical" => Ok(Self::Critical),
                other => Err(format!("unknown level_log `{other}`")),
            },
        }
    }
}

impl LogLevel {
    /// Matching tracing level. `Critical` maps to `ERROR`.
    #[must_use]
    pub const fn tracing_level(self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error | Self::Critical => tracing::Level::ERROR,
        }
    }
}

/// Parameters of the rate to spike transformation.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TvbToNestParams {
    /// Base seed of the spike generators.
    pub seed: u64,
    /// Multiplier applied to every incoming rate.
    pub rate_scale: f64,
}

impl Default for TvbToNestParams {
    fn default() -> Self {
        Self {
            seed: 0,
            rate_scale: 1.0,
        }
    }
}

/// Parameters of the spike to rate transformation.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct NestToTvbParams {
    /// Histogram bin width in milliseconds.
    pub width: f64,
}

impl Default for NestToTvbParams {
    fn default() -> Self {
        Self { width: 20.0 }
    }
}

/// Hub runtime settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Pause between two polls of a handshake file.
    pub poll_interval_ms: u64,
    /// Upper bound on handshake waits. `None` waits forever.
    pub handshake_timeout_ms: Option<u64>,
    /// How long the marker owner waits for every reader's receipt.
    pub cleanup_timeout_ms: u64,
    /// Events preallocated per double buffer slot.
    pub buffer_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            handshake_timeout_ms: None,
            cleanup_timeout_ms: 60_000,
            buffer_capacity: 4096,
        }
    }
}

impl HubSettings {
    /// Wait policy for handshakes and links.
    #[must_use]
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_timeout(self.handshake_timeout_ms.map(Duration::from_millis))
    }

    /// Wait policy for the marker owner's receipt wait.
    #[must_use]
    pub fn cleanup_options(&self) -> WaitOptions {
        WaitOptions::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_timeout(Some(Duration::from_millis(self.cleanup_timeout_ms)))
    }
}

/// Contents of `parameter.json` used by the hub.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Parameters {
    /// Logging verbosity.
    #[serde(default)]
    pub level_log: LogLevel,
    /// Region ids; index is the transformer instance.
    pub id_nest_region: Vec<u64>,
    /// Rate to spike settings.
    #[serde(rename = "param_TR_tvb_to_nest", default)]
    pub tvb_to_nest: TvbToNestParams,
    /// Spike to rate settings.
    #[serde(rename = "param_TR_nest_to_tvb", default)]
    pub nest_to_tvb: NestToTvbParams,
    /// Hub runtime settings.
    #[serde(default)]
    pub interscale_hub: HubSettings,
}

impl Parameters {
    /// Parses and validates parameters from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for malformed JSON and
    /// [`ConfigError::Parameter`] for out of range values.
    pub fn from_json(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let parameters: Self = serde_json::from_str(text).map_err(|source| ConfigError::Invalid {
            path: origin.to_path_buf(),
            source,
        })?;
        parameters.validate()?;
        Ok(parameters)
    }

    /// Reads `parameter.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unreadable`] if the file cannot be read,
    /// otherwise see [`from_json`](Self::from_json).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id_nest_region.is_empty() {
            return Err(ConfigError::Parameter {
                name: "id_nest_region",
                reason: "must list at least one region".into(),
            });
        }
        if !(self.tvb_to_nest.rate_scale.is_finite() && self.tvb_to_nest.rate_scale >= 0.0) {
            return Err(ConfigError::Parameter {
                name: "param_TR_tvb_to_nest.rate_scale",
                reason: format!("{} is not a finite non-negative number", self.tvb_to_nest.rate_scale),
            });
        }
        if !(self.nest_to_tvb.width.is_finite() && self.nest_to_tvb.width > 0.0) {
            return Err(ConfigError::Parameter {
                name: "param_TR_nest_to_tvb.width",
                reason: format!("{} is not a positive number", self.nest_to_tvb.width),
            });
        }
        if self.interscale_hub.poll_interval_ms == 0 {
            return Err(ConfigError::Parameter {
                name: "interscale_hub.poll_interval_ms",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Parameters, ConfigError> {
        Parameters::from_json(text, Path::new("parameter.json"))
    }

    #[test]
    fn test_minimal_parameters() {
        let parameters = parse(r#"{"level_log": 1, "id_nest_region": [0, 1], "simulation_time": 1000}"#).unwrap();
        assert_eq!(parameters.level_log, LogLevel::Info);
        assert_eq!(parameters.id_nest_region, vec![0, 1]);
        assert_eq!(parameters.tvb_to_nest, TvbToNestParams::default());
        assert_eq!(parameters.interscale_hub.poll_interval_ms, 1000);
        assert!(parameters.interscale_hub.wait_options().timeout.is_none());
    }

    #[test]
    fn test_level_names_and_numbers() {
        assert_eq!(parse(r#"{"level_log": "warning", "id_nest_region": [0]}"#).unwrap().level_log, LogLevel::Warning);
        assert_eq!(parse(r#"{"level_log": 4, "id_nest_region": [0]}"#).unwrap().level_log, LogLevel::Critical);
        assert_eq!(parse(r#"{"level_log": 3, "id_nest_region": [0]}"#).unwrap().level_log, LogLevel::Error);
        assert_eq!(LogLevel::try_from(RawLevel::Name("ERROR".into())), Ok(LogLevel::Error));
        assert!(parse(r#"{"level_log": 9, "id_nest_region": [0]}"#).is_err());
        assert_eq!(LogLevel::Critical.tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_sections() {
        let parameters = parse(
            r#"{
                "id_nest_region": [3],
                "param_TR_tvb_to_nest": {"seed": 7},
                "param_TR_nest_to_tvb": {"width": 5.0},
                "interscale_hub": {"poll_interval_ms": 10, "handshake_timeout_ms": 500}
            }"#,
        )
        .unwrap();
        assert_eq!(parameters.tvb_to_nest.seed, 7);
        assert!((parameters.tvb_to_nest.rate_scale - 1.0).abs() < f64::EPSILON);
        assert!((parameters.nest_to_tvb.width - 5.0).abs() < f64::EPSILON);
        assert_eq!(
            parameters.interscale_hub.wait_options().timeout,
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(parse(r#"{"id_nest_region": []}"#), Err(ConfigError::Parameter { .. })));
        assert!(matches!(
            parse(r#"{"id_nest_region": [0], "param_TR_nest_to_tvb": {"width": 0}}"#),
            Err(ConfigError::Parameter { .. })
        ));
        assert!(matches!(parse(r#"{"level_log": 1}"#), Err(ConfigError::Invalid { .. })));
    }
}
