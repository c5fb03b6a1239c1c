use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use evoface_core::{DeviceMode, EvolutionConfig, GateConfig, MatcherConfig};
use evoface_models::{model_for, ModelRole};
use serde::Deserialize;
use thiserror::Error;

use crate::ledger::LedgerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Loaded from an optional TOML file, then overridden field by field from
/// `EVOFACE_*` environment variables (upper-cased field names).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of still images replayed as the camera feed, in file-name order.
    pub frame_dir: Option<PathBuf>,
    /// Pause between frames of the replayed feed.
    pub frame_interval_ms: u64,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where aligned face crops of accepted events are written. Disabled when unset.
    pub evidence_dir: Option<PathBuf>,
    pub device_mode: DeviceMode,

    pub detection_confidence: f32,
    pub recognition_confidence: f32,
    /// Cold-start evolution threshold on the fused score.
    pub evolution_confidence: f32,
    pub evolution_min_base: f32,
    pub evolution_min_dynamic: f32,
    pub warning_base_score: f32,
    pub ambiguity_gap: f32,
    pub texture_liveness_threshold: f32,
    pub required_pass_frames: u32,
    pub base_weight: f32,
    pub dynamic_weight: f32,
    pub debounce_minutes: u64,
    pub day_cutoff_hour: u32,

    /// Minimum face box area as a fraction of the frame area.
    pub min_face_ratio: f32,
    pub face_padding_ratio: f32,
    pub stability_enabled: bool,
    pub stability_min_displacement: f32,
    pub stability_window: usize,
    pub evolution_alpha: f32,
    pub evolution_safety_floor: f32,
    /// Quiet period after a completed cycle before the gate is re-armed.
    pub cooldown_ms: u64,
    /// Serve on the session bus instead of the system bus (development mode).
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let gate = GateConfig::default();
        let matcher = MatcherConfig::default();
        let evolution = EvolutionConfig::default();
        Self {
            frame_dir: None,
            frame_interval_ms: 100,
            model_dir: evoface_models::default_model_dir(),
            db_path: default_data_dir().join("attendance.db"),
            evidence_dir: None,
            device_mode: DeviceMode::Auto,
            detection_confidence: 0.5,
            recognition_confidence: matcher.recognition_threshold,
            evolution_confidence: matcher.evolution_cold_start,
            evolution_min_base: matcher.evolution_min_base,
            evolution_min_dynamic: matcher.evolution_min_dynamic,
            warning_base_score: matcher.warning_base_score,
            ambiguity_gap: matcher.ambiguity_gap,
            texture_liveness_threshold: gate.texture_threshold,
            required_pass_frames: gate.required_pass_frames,
            base_weight: matcher.base_weight,
            dynamic_weight: matcher.dynamic_weight,
            debounce_minutes: 5,
            day_cutoff_hour: 4,
            min_face_ratio: gate.min_face_ratio,
            face_padding_ratio: gate.padding_ratio,
            stability_enabled: gate.stability_enabled,
            stability_min_displacement: gate.stability_min_displacement,
            stability_window: gate.stability_window,
            evolution_alpha: evolution.alpha,
            evolution_safety_floor: evolution.safety_floor,
            cooldown_ms: 3000,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load from `EVOFACE_CONFIG` (or `$XDG_CONFIG_HOME/evoface/config.toml`)
    /// when present, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("EVOFACE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            tracing::info!(path = %path.display(), "configuration file loaded");
            config
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `lookup("EVOFACE_<FIELD>")`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |field: &str| lookup(&format!("EVOFACE_{}", field.to_ascii_uppercase()));

        if let Some(v) = var("frame_dir") {
            self.frame_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("model_dir") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("db_path") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("evidence_dir") {
            self.evidence_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("session_bus") {
            self.session_bus = v != "0";
        }
        if let Some(v) = var("stability_enabled") {
            self.stability_enabled = v != "0";
        }

        override_parsed(&var, "frame_interval_ms", &mut self.frame_interval_ms);
        override_parsed(&var, "device_mode", &mut self.device_mode);
        override_parsed(&var, "detection_confidence", &mut self.detection_confidence);
        override_parsed(&var, "recognition_confidence", &mut self.recognition_confidence);
        override_parsed(&var, "evolution_confidence", &mut self.evolution_confidence);
        override_parsed(&var, "evolution_min_base", &mut self.evolution_min_base);
        override_parsed(&var, "evolution_min_dynamic", &mut self.evolution_min_dynamic);
        override_parsed(&var, "warning_base_score", &mut self.warning_base_score);
        override_parsed(&var, "ambiguity_gap", &mut self.ambiguity_gap);
        override_parsed(&var, "texture_liveness_threshold", &mut self.texture_liveness_threshold);
        override_parsed(&var, "required_pass_frames", &mut self.required_pass_frames);
        override_parsed(&var, "base_weight", &mut self.base_weight);
        override_parsed(&var, "dynamic_weight", &mut self.dynamic_weight);
        override_parsed(&var, "debounce_minutes", &mut self.debounce_minutes);
        override_parsed(&var, "day_cutoff_hour", &mut self.day_cutoff_hour);
        override_parsed(&var, "min_face_ratio", &mut self.min_face_ratio);
        override_parsed(&var, "face_padding_ratio", &mut self.face_padding_ratio);
        override_parsed(&var, "stability_min_displacement", &mut self.stability_min_displacement);
        override_parsed(&var, "stability_window", &mut self.stability_window);
        override_parsed(&var, "evolution_alpha", &mut self.evolution_alpha);
        override_parsed(&var, "evolution_safety_floor", &mut self.evolution_safety_floor);
        override_parsed(&var, "cooldown_ms", &mut self.cooldown_ms);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.required_pass_frames == 0 {
            return Err(ConfigError::Invalid("required_pass_frames must be at least 1".into()));
        }
        if self.day_cutoff_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "day_cutoff_hour must be 0..=23, got {}",
                self.day_cutoff_hour
            )));
        }
        if self.base_weight < 0.0
            || self.dynamic_weight < 0.0
            || self.base_weight + self.dynamic_weight <= 0.0
        {
            return Err(ConfigError::Invalid(
                "base_weight and dynamic_weight must be non-negative and not both zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.evolution_alpha) {
            return Err(ConfigError::Invalid(format!(
                "evolution_alpha must be within [0, 1], got {}",
                self.evolution_alpha
            )));
        }
        Ok(())
    }

    pub fn model_path(&self, role: ModelRole) -> PathBuf {
        self.model_dir.join(model_for(role).name)
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            required_pass_frames: self.required_pass_frames,
            texture_threshold: self.texture_liveness_threshold,
            min_face_ratio: self.min_face_ratio,
            padding_ratio: self.face_padding_ratio,
            stability_enabled: self.stability_enabled,
            stability_min_displacement: self.stability_min_displacement,
            stability_window: self.stability_window,
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            recognition_threshold: self.recognition_confidence,
            ambiguity_gap: self.ambiguity_gap,
            warning_base_score: self.warning_base_score,
            evolution_cold_start: self.evolution_confidence,
            evolution_min_base: self.evolution_min_base,
            evolution_min_dynamic: self.evolution_min_dynamic,
            base_weight: self.base_weight,
            dynamic_weight: self.dynamic_weight,
        }
    }

    pub fn evolution_config(&self) -> EvolutionConfig {
        EvolutionConfig {
            alpha: self.evolution_alpha,
            safety_floor: self.evolution_safety_floor,
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            debounce: chrono::Duration::minutes(self.debounce_minutes as i64),
            day_cutoff_hour: self.day_cutoff_hour,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

fn override_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, field: &str, slot: &mut T) {
    let Some(raw) = var(field) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(field, value = %raw, "ignoring unparseable environment override"),
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("evoface")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("evoface/config.toml")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}
