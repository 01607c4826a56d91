use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub playback: PlaybackConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| SyncError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        self.playback.validate()
    }
}

/// Tunables of the beat trigger engine and the effects binder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    /// Maximum distance between the playback position and a beat for it to
    /// count as a hit.
    pub tolerance_seconds: f64,
    pub cooldown_seconds: f64,
    /// Pitch class of the local sample (0 = C).
    pub reference_key: i32,
    pub fade_in_margin_seconds: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            tolerance_seconds: 0.0075,
            cooldown_seconds: 8.0,
            reference_key: 7,
            fade_in_margin_seconds: 2.0,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if !self.tolerance_seconds.is_finite() {
            return Err(SyncError::Config("tolerance_seconds must be finite".into()));
        }
        if !self.cooldown_seconds.is_finite() || self.cooldown_seconds < 0.0 {
            return Err(SyncError::Config(
                "cooldown_seconds must be a non-negative number".into(),
            ));
        }
        if !self.fade_in_margin_seconds.is_finite() || self.fade_in_margin_seconds < 0.0 {
            return Err(SyncError::Config(
                "fade_in_margin_seconds must be a non-negative number".into(),
            ));
        }
        if !(0..=11).contains(&self.reference_key) {
            return Err(SyncError::Config(format!(
                "reference_key must be a pitch class in 0..=11, got {}",
                self.reference_key
            )));
        }
        Ok(())
    }
}

/// Settings for the simulated playback provider used by the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub update_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 10,
        }
    }
}

impl PlaybackConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_interval_ms == 0 {
            return Err(SyncError::Config(
                "update_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
