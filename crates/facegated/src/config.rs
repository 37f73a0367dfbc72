use crate::engine::EngineSettings;
use facegate_core::admission::{
    AdmissionConfig, CaptureMode, DEFAULT_AUTO_INTERVAL, DEFAULT_MANUAL_COOLDOWN,
    DEFAULT_POLL_INTERVAL,
};
use facegate_core::geometry::{
    EvaluatorConfig, LandmarkIndices, DEFAULT_ALIGNMENT_TOLERANCE, DEFAULT_MAX_FACE_RATIO,
    DEFAULT_MIN_FACE_RATIO, DEFAULT_NOSE_TIP_INDEX,
};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_VAR: &str = "FACEGATE_CONFIG";
pub const DEFAULT_SUBMIT_DELAY_SECS: u32 = 0;
pub const DEFAULT_SUCCESS_RESET_SECS: u32 = 2;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Engine and kiosk configuration.
///
/// Built from defaults, then an optional TOML file named by `FACEGATE_CONFIG`,
/// then `FACEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of frames replayed as the video stream.
    pub frame_dir: Option<PathBuf>,
    /// Detector sources, tried in order.
    pub detection_sources: Vec<String>,
    pub poll_interval_ms: u64,
    pub min_face_ratio: f32,
    pub max_face_ratio: f32,
    pub alignment_tolerance: f32,
    /// Landmark index of the left eye's outer corner.
    pub left_eye_outer_index: usize,
    /// Landmark index of the right eye's outer corner; unset means the last
    /// right-eye point.
    pub right_eye_outer_index: Option<usize>,
    pub nose_tip_index: usize,
    #[serde(deserialize_with = "mode_from_str")]
    pub mode: CaptureMode,
    pub manual_cooldown_ms: u64,
    pub auto_interval_ms: u64,
    /// Countdown between capture and attendance submission.
    pub submit_delay_secs: u32,
    /// How long a success is shown before the kiosk resets.
    pub success_reset_secs: u32,
    /// Base URL of the recognition / registration service.
    pub api_url: Option<String>,
    /// Room or session sent with each attendance submission.
    pub room: Option<String>,
    /// Local user store file.
    pub store_path: Option<PathBuf>,
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_dir: None,
            detection_sources: Vec::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            min_face_ratio: DEFAULT_MIN_FACE_RATIO,
            max_face_ratio: DEFAULT_MAX_FACE_RATIO,
            alignment_tolerance: DEFAULT_ALIGNMENT_TOLERANCE,
            left_eye_outer_index: LandmarkIndices::default().left_eye_outer,
            right_eye_outer_index: None,
            nose_tip_index: DEFAULT_NOSE_TIP_INDEX,
            mode: CaptureMode::Manual,
            manual_cooldown_ms: DEFAULT_MANUAL_COOLDOWN.as_millis() as u64,
            auto_interval_ms: DEFAULT_AUTO_INTERVAL.as_millis() as u64,
            submit_delay_secs: DEFAULT_SUBMIT_DELAY_SECS,
            success_reset_secs: DEFAULT_SUCCESS_RESET_SECS,
            api_url: None,
            room: None,
            store_path: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Config {
    /// Load the config file (if `FACEGATE_CONFIG` is set) and apply
    /// `FACEGATE_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_FILE_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply overrides looked up by variable name. Unparsable values are
    /// logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        if let Some(dir) = env.string("FACEGATE_FRAME_DIR") {
            self.frame_dir = Some(PathBuf::from(dir));
        }
        if let Some(sources) = env.string("FACEGATE_DETECTION_SOURCES") {
            self.detection_sources = sources
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        env.parse_into("FACEGATE_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        env.parse_into("FACEGATE_MIN_FACE_RATIO", &mut self.min_face_ratio);
        env.parse_into("FACEGATE_MAX_FACE_RATIO", &mut self.max_face_ratio);
        env.parse_into("FACEGATE_ALIGNMENT_TOLERANCE", &mut self.alignment_tolerance);
        env.parse_into("FACEGATE_LEFT_EYE_OUTER_INDEX", &mut self.left_eye_outer_index);
        match env.string("FACEGATE_RIGHT_EYE_OUTER_INDEX").as_deref() {
            None => {}
            Some("last") => self.right_eye_outer_index = None,
            Some(raw) => match raw.parse() {
                Ok(index) => self.right_eye_outer_index = Some(index),
                Err(err) => tracing::warn!(
                    key = "FACEGATE_RIGHT_EYE_OUTER_INDEX",
                    value = %raw,
                    error = %err,
                    "ignoring invalid setting"
                ),
            },
        }
        env.parse_into("FACEGATE_NOSE_TIP_INDEX", &mut self.nose_tip_index);
        env.parse_into("FACEGATE_MODE", &mut self.mode);
        env.parse_into("FACEGATE_MANUAL_COOLDOWN_MS", &mut self.manual_cooldown_ms);
        env.parse_into("FACEGATE_AUTO_INTERVAL_MS", &mut self.auto_interval_ms);
        env.parse_into("FACEGATE_SUBMIT_DELAY_SECS", &mut self.submit_delay_secs);
        env.parse_into("FACEGATE_SUCCESS_RESET_SECS", &mut self.success_reset_secs);
        env.parse_into("FACEGATE_JPEG_QUALITY", &mut self.jpeg_quality);
        if let Some(url) = env.string("FACEGATE_API_URL") {
            self.api_url = Some(url);
        }
        if let Some(room) = env.string("FACEGATE_ROOM") {
            self.room = Some(room);
        }
        if let Some(path) = env.string("FACEGATE_STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            min_face_ratio: self.min_face_ratio,
            max_face_ratio: self.max_face_ratio,
            alignment_tolerance: self.alignment_tolerance,
            landmarks: LandmarkIndices {
                left_eye_outer: self.left_eye_outer_index,
                right_eye_outer: self.right_eye_outer_index,
                nose_tip: self.nose_tip_index,
            },
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            mode: self.mode,
            manual_cooldown: Duration::from_millis(self.manual_cooldown_ms),
            auto_interval: Duration::from_millis(self.auto_interval_ms),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            evaluator: self.evaluator_config(),
            admission: self.admission_config(),
            submit_delay_secs: self.submit_delay_secs,
            success_reset_secs: self.success_reset_secs,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse_into<T>(&self, key: &str, slot: &mut T)
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.string(key) else {
            return;
        };
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(err) => tracing::warn!(key, value = %raw, error = %err, "ignoring invalid setting"),
        }
    }
}

fn mode_from_str<'de, D>(deserializer: D) -> Result<CaptureMode, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}
