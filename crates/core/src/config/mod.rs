use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{DropError, Result};

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MIN_DISTANCE_SECONDS: f32 = 1.0;
pub const DEFAULT_HOP_SIZE: usize = 512;
pub const DEFAULT_FRAME_SIZE: usize = 2048;
pub const DEFAULT_TOP_DB: f32 = 80.0;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub analysis: AnalysisConfig,
    pub playback: PlaybackConfig,
    /// Folder scanned for candidate tracks.
    pub songs_folder: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            playback: PlaybackConfig::default(),
            songs_folder: "songs".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.playback.validate()
    }
}

/// Parameters of the drop-detection pipeline.
///
/// `threshold` is compared raw against onset strength, which is measured in
/// decibels of median per-bin energy rise (see [`crate::OnsetEnvelopeExtractor`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub threshold: f32,
    pub min_distance_seconds: f32,
    pub hop_size: usize,
    pub frame_size: usize,
    pub top_db: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_distance_seconds: DEFAULT_MIN_DISTANCE_SECONDS,
            hop_size: DEFAULT_HOP_SIZE,
            frame_size: DEFAULT_FRAME_SIZE,
            top_db: DEFAULT_TOP_DB,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.threshold)?;
        validate_min_distance(self.min_distance_seconds)?;
        if self.hop_size == 0 {
            return Err(DropError::invalid("hop size must be a positive number of samples"));
        }
        if self.frame_size < 2 || self.frame_size < self.hop_size {
            return Err(DropError::invalid(format!(
                "frame size {} must be at least 2 and no smaller than the hop size {}",
                self.frame_size, self.hop_size
            )));
        }
        if !self.top_db.is_finite() || self.top_db <= 0.0 {
            return Err(DropError::invalid("top_db must be a positive finite number"));
        }
        Ok(())
    }
}

/// Parameters of the real-time synchronisation loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub poll_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(DropError::invalid("poll interval must be at least one millisecond"));
        }
        Ok(())
    }
}

pub(crate) fn validate_threshold(threshold: f32) -> Result<()> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(DropError::invalid(format!(
            "threshold must be a non-negative finite number, got {threshold}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_min_distance(seconds: f32) -> Result<()> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(DropError::invalid(format!(
            "minimum drop distance must be a non-negative finite number of seconds, got {seconds}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.analysis.threshold, 0.5);
        assert_eq!(config.analysis.min_distance_seconds, 1.0);
        assert_eq!(config.analysis.hop_size, 512);
        assert_eq!(config.playback.poll_interval(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_negative_and_nan_parameters() {
        let mut config = AnalysisConfig::default();
        config.threshold = -0.1;
        assert!(matches!(config.validate(), Err(DropError::InvalidInput(_))));

        let mut config = AnalysisConfig::default();
        config.min_distance_seconds = f32::NAN;
        assert!(matches!(config.validate(), Err(DropError::InvalidInput(_))));

        let mut config = AnalysisConfig::default();
        config.hop_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_json_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "analysis": {{ "threshold": 1.5 }}, "songs_folder": "tracks" }}"#).unwrap();

        let config = AppConfig::from_path(file.path()).unwrap();
        assert_eq!(config.analysis.threshold, 1.5);
        assert_eq!(config.analysis.hop_size, DEFAULT_HOP_SIZE);
        assert_eq!(config.songs_folder, "tracks");
    }

    #[test]
    fn invalid_json_surfaces_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = AppConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, DropError::Config(_)));
    }
}
