//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soundwatch_core::{EngineConfig, PipelineMode};
use tracing::warn;

pub const DEFAULT_WINDOW_LEN: usize = 16_000;
pub const WINDOW_LEN_RANGE: std::ops::RangeInclusive<usize> = 256..=480_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub preferred_input_device: Option<String>,
    pub sample_rate: u32,
    /// Window length in samples. Fixed-shape models must agree with it;
    /// models with a dynamic length and the threshold stub require it.
    pub window_len: Option<usize>,
    pub stub_threshold: f32,
    pub pipeline_mode: String,
    pub pipeline_depth: usize,
    /// RMS floor below which windows skip inference; 0 disables the gate.
    pub silence_floor_rms: f32,
    /// Seconds between repeated notifications for one label; 0 disables.
    pub notify_cooldown_secs: f32,
    /// Program plus arguments. `{title}`, `{message}`, `{label}` and
    /// `{score}` are substituted per detection.
    pub notify_command: Vec<String>,
    pub max_consecutive_failures: u32,
    pub read_timeout_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            labels_path: None,
            preferred_input_device: None,
            sample_rate: 16_000,
            window_len: None,
            stub_threshold: 100.0,
            pipeline_mode: "sequential".into(),
            pipeline_depth: 1,
            silence_floor_rms: 0.0,
            notify_cooldown_secs: 0.0,
            notify_command: Vec::new(),
            max_consecutive_failures: 3,
            read_timeout_ms: 2_000,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.model_path = normalize_path(self.model_path.take());
        self.labels_path = normalize_path(self.labels_path.take());
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.sample_rate = self.sample_rate.clamp(8_000, 48_000);
        self.window_len = self.window_len.filter(|len| {
            let valid = WINDOW_LEN_RANGE.contains(len);
            if !valid {
                warn!(
                    window_len = *len,
                    "ignoring window length outside {}..={} samples",
                    WINDOW_LEN_RANGE.start(),
                    WINDOW_LEN_RANGE.end()
                );
            }
            valid
        });
        if !self.stub_threshold.is_finite() {
            self.stub_threshold = AppSettings::default().stub_threshold;
        }
        self.pipeline_mode = normalize_pipeline_mode(&self.pipeline_mode);
        self.pipeline_depth = self.pipeline_depth.clamp(1, 2);
        self.silence_floor_rms = finite_or_zero(self.silence_floor_rms).clamp(0.0, 1.0);
        self.notify_cooldown_secs = finite_or_zero(self.notify_cooldown_secs).clamp(0.0, 600.0);
        self.notify_command = self
            .notify_command
            .iter()
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();
        self.max_consecutive_failures = self.max_consecutive_failures.clamp(1, 20);
        self.read_timeout_ms = self.read_timeout_ms.clamp(100, 10_000);
    }

    pub fn effective_window_len(&self) -> usize {
        self.window_len.unwrap_or(DEFAULT_WINDOW_LEN)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mode = match self.pipeline_mode.as_str() {
            "pipelined" => PipelineMode::Pipelined {
                depth: self.pipeline_depth,
            },
            _ => PipelineMode::Sequential,
        };
        EngineConfig {
            sample_rate: self.sample_rate,
            window_len: self.window_len,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_consecutive_failures: self.max_consecutive_failures,
            mode,
            silence_floor_rms: (self.silence_floor_rms > 0.0).then_some(self.silence_floor_rms),
            notify_cooldown: (self.notify_cooldown_secs > 0.0)
                .then(|| Duration::from_secs_f32(self.notify_cooldown_secs)),
            ..EngineConfig::default()
        }
    }

    /// Apply `SOUNDWATCH_*` overrides read through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(path) = non_empty("SOUNDWATCH_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty("SOUNDWATCH_LABELS_PATH") {
            self.labels_path = Some(PathBuf::from(path));
        }
        if let Some(device) = non_empty("SOUNDWATCH_INPUT_DEVICE") {
            self.preferred_input_device = Some(device);
        }
        self.normalize();
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }
}

pub fn normalize_pipeline_mode(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pipelined" | "pipeline" | "queued" => "pipelined".into(),
        _ => "sequential".into(),
    }
}

fn normalize_path(raw: Option<PathBuf>) -> Option<PathBuf> {
    raw.filter(|p| !p.as_os_str().is_empty())
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Soundwatch")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("soundwatch")
            .join("settings.json")
    }
}

/// Missing files yield defaults; unreadable or malformed ones are logged and
/// also yield defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring malformed settings file");
            AppSettings::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read settings file");
            AppSettings::default()
        }
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("absent.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn partial_file_is_filled_and_clamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "modelPath": "/models/siren.onnx",
                "windowLen": 10,
                "pipelineMode": " Pipeline ",
                "pipelineDepth": 9,
                "silenceFloorRms": -1.0,
                "maxConsecutiveFailures": 0,
                "preferredInputDevice": "   ",
                "notifyCommand": ["notify-send", " ", "{title}", "{message}"]
            }"#,
        )
        .expect("write");

        let settings = load_settings(&path);
        assert_eq!(settings.model_path, Some(PathBuf::from("/models/siren.onnx")));
        assert_eq!(settings.window_len, None);
        assert_eq!(settings.pipeline_mode, "pipelined");
        assert_eq!(settings.pipeline_depth, 2);
        assert_eq!(settings.silence_floor_rms, 0.0);
        assert_eq!(settings.max_consecutive_failures, 1);
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.notify_command, ["notify-send", "{title}", "{message}"]);
        assert_eq!(settings.read_timeout_ms, 2_000);
    }

    #[test]
    fn window_length_is_kept_or_dropped_never_rewritten() {
        for (configured, expected) in [
            (Some(131_072), Some(131_072)),
            (Some(256), Some(256)),
            (Some(255), None),
            (Some(480_001), None),
            (None, None),
        ] {
            let mut settings = AppSettings {
                window_len: configured,
                ..AppSettings::default()
            };
            settings.normalize();
            assert_eq!(settings.window_len, expected, "configured {configured:?}");
        }
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").expect("write");
        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = AppSettings {
            labels_path: Some(PathBuf::from("labels.json")),
            notify_cooldown_secs: 5.0,
            ..AppSettings::default()
        };
        settings.normalize();

        save_settings(&path, &settings).expect("save");
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SOUNDWATCH_MODEL_PATH", "/env/model.onnx"),
            ("SOUNDWATCH_LABELS_PATH", ""),
            ("SOUNDWATCH_INPUT_DEVICE", " USB Mic "),
        ]
        .into_iter()
        .collect();
        let mut settings = AppSettings {
            model_path: Some(PathBuf::from("/file/model.onnx")),
            labels_path: Some(PathBuf::from("/file/labels.json")),
            ..AppSettings::default()
        };

        settings.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(settings.model_path, Some(PathBuf::from("/env/model.onnx")));
        assert_eq!(settings.labels_path, Some(PathBuf::from("/file/labels.json")));
        assert_eq!(settings.preferred_input_device.as_deref(), Some("USB Mic"));
    }

    #[test]
    fn engine_config_maps_optional_knobs() {
        let config = AppSettings::default().engine_config();
        assert_eq!(config.mode, PipelineMode::Sequential);
        assert!(config.silence_floor_rms.is_none());
        assert!(config.notify_cooldown.is_none());

        let config = AppSettings {
            pipeline_mode: "pipelined".into(),
            pipeline_depth: 2,
            silence_floor_rms: 0.01,
            notify_cooldown_secs: 2.0,
            read_timeout_ms: 500,
            ..AppSettings::default()
        }
        .engine_config();
        assert_eq!(config.mode, PipelineMode::Pipelined { depth: 2 });
        assert_eq!(config.silence_floor_rms, Some(0.01));
        assert_eq!(config.notify_cooldown, Some(Duration::from_secs(2)));
        assert_eq!(config.read_timeout, Duration::from_millis(500));
    }
}
