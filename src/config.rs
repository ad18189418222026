//! Session settings
//!
//! Loaded from TOML; every field has a default so a partial file (or none at
//! all) works. The confirmation delay is a constant, not a setting.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Grace period after a successful run before it becomes "last working".
/// Only absorbs message-ordering jitter; never user-visible.
pub const CONFIRMATION_DELAY_MS: u64 = 100;

/// Upper bound on `lookahead_cycles`; every highlighter frame walks each
/// cycle of its query window.
pub const MAX_LOOKAHEAD_CYCLES: f64 = 16.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Run code automatically after edits settle
    pub auto_execute: bool,
    /// Quiet period between the last edit and the scheduled run
    pub auto_execute_delay_ms: u64,
    /// How far past the current cycle the highlighter scans
    pub lookahead_cycles: f64,
    /// Analyser FFT size (power of two)
    pub fft_size: usize,
    /// Analyser temporal smoothing, 0.0..1.0
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub sample_rate: u32,
    pub bpm: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_execute: true,
            auto_execute_delay_ms: 500,
            lookahead_cycles: 0.5,
            fft_size: 2048,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            sample_rate: 44100,
            bpm: 120.0,
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fft_size.is_power_of_two() || !(32..=32768).contains(&self.fft_size) {
            return Err(invalid("fft_size", "must be a power of two in 32..=32768"));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(invalid("smoothing", "must be in 0.0..1.0"));
        }
        if !self.min_decibels.is_finite() {
            return Err(invalid("min_decibels", "must be a finite number"));
        }
        if !self.max_decibels.is_finite() {
            return Err(invalid("max_decibels", "must be a finite number"));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(invalid("min_decibels", "must be below max_decibels"));
        }
        if !(0.0..=MAX_LOOKAHEAD_CYCLES).contains(&self.lookahead_cycles) {
            return Err(invalid("lookahead_cycles", "must be in 0.0..=16.0"));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(invalid("bpm", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// What an execution controller needs to know about auto-execution.
pub trait SettingsSource: Send + Sync {
    fn auto_execute(&self) -> bool;
    fn auto_execute_delay_ms(&self) -> u64;
}

/// Settings shared between the session and its controllers. Changes apply
/// from the next edit on.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<Settings>>);

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub fn snapshot(&self) -> Settings {
        self.0.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut *self.0.write());
    }
}

impl SettingsSource for SharedSettings {
    fn auto_execute(&self) -> bool {
        self.0.read().auto_execute
    }

    fn auto_execute_delay_ms(&self) -> u64 {
        self.0.read().auto_execute_delay_ms
    }
}
