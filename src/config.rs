use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub tasks: TasksConfig,
    pub scheduler: SchedulerConfig,
    pub merger: MergerConfig,
    pub translator: TranslatorConfig,
    pub transcriber: TranscriberConfig,
    pub events: EventsConfig,
    pub engines: EnginesConfig,
}

/// Task workspace configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TasksConfig {
    /// Root directory holding one subdirectory per task.
    pub root: PathBuf,
    /// Unix socket path for the operation server.
    pub socket: Option<PathBuf>,
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    pub per_segment_parallelism: usize,
}

/// Stage-8 merger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergerConfig {
    pub max_stretch: f64,
    pub accompaniment_gain_db: f64,
}

/// Stage-5 translation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranslatorConfig {
    pub batch_size: usize,
    pub max_retries: u32,
}

/// Stage-4 transcription configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriberConfig {
    pub silence_split_gap_s: f64,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub queue_capacity: usize,
}

/// External engine command templates.
///
/// Each template is run as a single process per invocation; placeholders
/// (`{input}`, `{output}`, ...) are substituted before spawning. A missing
/// template means the corresponding stage cannot run outside of tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EnginesConfig {
    /// Path to the external media tool (extraction, muxing, time scaling).
    pub ffmpeg: String,
    /// Vocal separation: `{input} {vocals} {accompaniment}`.
    pub separate_command: Option<String>,
    /// Speaker diarization: `{input} {output_dir}`.
    pub diarize_command: Option<String>,
    /// Speech recognition: `{input} {lang} {output}`.
    pub transcribe_command: Option<String>,
    /// Text translation: `{input} {source_lang} {target_lang} {output}`.
    pub translate_command: Option<String>,
    /// Voice cloning: `{reference} {text_file} {output}`.
    pub clone_command: Option<String>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/tasks"),
            socket: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: defaults::MAX_CONCURRENT_TASKS,
            per_segment_parallelism: defaults::PER_SEGMENT_PARALLELISM,
        }
    }
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            max_stretch: defaults::MAX_STRETCH,
            accompaniment_gain_db: defaults::ACCOMPANIMENT_GAIN_DB,
        }
    }
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::TRANSLATOR_BATCH_SIZE,
            max_retries: defaults::TRANSLATOR_MAX_RETRIES,
        }
    }
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            silence_split_gap_s: defaults::SILENCE_SPLIT_GAP_S,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::EVENT_QUEUE_CAPACITY,
        }
    }
}

impl EnginesConfig {
    pub fn ffmpeg_path(&self) -> &str {
        if self.ffmpeg.is_empty() {
            "ffmpeg"
        } else {
            &self.ffmpeg
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Self::default()
                } else {
                    panic!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - REDUB_TASKS_ROOT → tasks.root
    /// - REDUB_SOCKET → tasks.socket
    /// - REDUB_MAX_TASKS → scheduler.max_concurrent_tasks
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var("REDUB_TASKS_ROOT") {
            if !root.is_empty() {
                self.tasks.root = PathBuf::from(root);
            }
        }

        if let Ok(socket) = std::env::var("REDUB_SOCKET") {
            if !socket.is_empty() {
                self.tasks.socket = Some(PathBuf::from(socket));
            }
        }

        if let Ok(max) = std::env::var("REDUB_MAX_TASKS") {
            if let Ok(n) = max.parse::<usize>() {
                if n > 0 {
                    self.scheduler.max_concurrent_tasks = n;
                }
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduler.max_concurrent_tasks, 1);
        assert_eq!(config.scheduler.per_segment_parallelism, 2);
        assert_eq!(config.merger.max_stretch, 2.0);
        assert_eq!(config.merger.accompaniment_gain_db, -6.0);
        assert_eq!(config.translator.batch_size, 20);
        assert_eq!(config.translator.max_retries, 3);
        assert_eq!(config.transcriber.silence_split_gap_s, 1.5);
        assert_eq!(config.events.queue_capacity, 64);
        assert_eq!(config.engines.ffmpeg_path(), "ffmpeg");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [merger]
            max_stretch = 1.5
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.merger.max_stretch, 1.5);
        assert_eq!(config.merger.accompaniment_gain_db, -6.0);
        assert_eq!(config.translator.batch_size, 20);
    }

    #[test]
    fn test_engine_commands_from_toml() {
        let toml_str = r#"
            [engines]
            ffmpeg = "/usr/local/bin/ffmpeg"
            transcribe_command = "whisper-cli {input} --lang {lang} --out {output}"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engines.ffmpeg_path(), "/usr/local/bin/ffmpeg");
        assert!(config
            .engines
            .transcribe_command
            .as_deref()
            .unwrap()
            .contains("{input}"));
        assert!(config.engines.clone_command.is_none());
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let config = Config::load_or_default(Path::new("/nonexistent/redub.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let result = toml::from_str::<Config>("scheduler = 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }
}
