use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Daemon configuration: an optional TOML file with `MIEN_*` env overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Requested capture resolution.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Base URL the three model weight sets are fetched from.
    pub model_base_url: String,
    /// Directory downloaded models are cached in.
    pub model_cache_dir: PathBuf,
    /// Path to the SQLite member-face database.
    pub db_path: PathBuf,
    /// Path to the descriptor encryption key file.
    pub key_path: PathBuf,
    /// Cosine similarity threshold for a positive check-in match.
    pub similarity_threshold: f32,
    /// Detection loop tick period in milliseconds.
    pub scan_interval_ms: u64,
    /// Stills captured per enrollment attempt.
    pub frames_per_enroll: usize,
    /// Frames captured per verify attempt.
    pub frames_per_verify: usize,
    /// Notification fan-out: sent → delivered delay, milliseconds.
    pub notify_delivery_ms: u64,
    /// Notification fan-out: pause between messages, milliseconds.
    pub notify_drain_gap_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_base_url: "https://raw.githubusercontent.com/mien-club/model-assets/main"
                .to_string(),
            model_cache_dir: cache_dir().join("models"),
            db_path: data_dir.join("members.db"),
            key_path: data_dir.join("store.key"),
            similarity_threshold: 0.40,
            scan_interval_ms: 300,
            frames_per_enroll: 5,
            frames_per_verify: 3,
            notify_delivery_ms: 1200,
            notify_drain_gap_ms: 400,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Reads the TOML file named by `MIEN_CONFIG` (default
    /// `/etc/mien/config.toml`) when it exists, then applies env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("MIEN_CONFIG")
            .unwrap_or_else(|_| "/etc/mien/config.toml".to_string());

        let mut config = if std::path::Path::new(&path).exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_toml_str(&text).map_err(|source| ConfigError::Parse { path, source })?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MIEN_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("MIEN_MODEL_BASE_URL") {
            self.model_base_url = v;
        }
        if let Ok(v) = std::env::var("MIEN_MODEL_CACHE_DIR") {
            self.model_cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MIEN_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MIEN_KEY_PATH") {
            self.key_path = PathBuf::from(v);
        }
        self.similarity_threshold = env_f32("MIEN_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.scan_interval_ms = env_u64("MIEN_SCAN_INTERVAL_MS", self.scan_interval_ms);
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn notify_delivery(&self) -> Duration {
        Duration::from_millis(self.notify_delivery_ms)
    }

    pub fn notify_drain_gap(&self) -> Duration {
        Duration::from_millis(self.notify_drain_gap_ms)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("mien")
}

fn cache_dir() -> PathBuf {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".cache")
        })
        .join("mien")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.frame_width, 640);
        assert_eq!(config.frame_height, 480);
        assert_eq!(config.scan_interval_ms, 300);
        assert_eq!(config.frames_per_enroll, 5);
        assert!(config.similarity_threshold > 0.0 && config.similarity_threshold < 1.0);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            camera_device = "/dev/video2"
            scan_interval_ms = 150
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.scan_interval_ms, 150);
        // Untouched fields fall back to defaults.
        assert_eq!(config.frame_width, 640);
        assert_eq!(config.frames_per_verify, 3);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(Config::from_toml_str("scan_interval_ms = \"soon\"").is_err());
    }

    #[test]
    fn durations_convert() {
        let config = Config::default();
        assert_eq!(config.scan_interval(), Duration::from_millis(300));
        assert_eq!(config.notify_delivery(), Duration::from_millis(1200));
        assert_eq!(config.notify_drain_gap(), Duration::from_millis(400));
    }
}
