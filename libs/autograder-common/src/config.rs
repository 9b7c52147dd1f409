use crate::keys::SOURCES_DIRNAME;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
/// Defaults, then an optional `autograder.toml`, then `AUTOGRADER__*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub base_dir: PathBuf,
    /// Root of the course source trees, one subdirectory per course.
    /// Defaults to `<base_dir>/sources`, apart from the store's `courses/` data.
    #[serde(default)]
    pub sources_dir: Option<PathBuf>,
    pub docker: DockerConfig,
    pub locks: LockConfig,
    pub server: ServerConfig,
    pub tasks: TaskConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    /// When false, image builds are skipped and grading must use the local path.
    pub enabled: bool,
    pub max_output_bytes: usize,
    pub keep_build_dirs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    pub stale_secs: u64,
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub min_rest_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub json: bool,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("AUTOGRADER_CONFIG").unwrap_or_else(|_| "autograder".to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &str) -> Result<Self, ConfigError> {
        ConfigBuilder::builder()
            .set_default("base_dir", "_autograder")?
            .set_default("docker.enabled", true)?
            .set_default("docker.max_output_bytes", 4_i64 * 1024 * 1024)?
            .set_default("docker.keep_build_dirs", false)?
            .set_default("locks.stale_secs", 2_i64 * 60 * 60)?
            .set_default("locks.reap_interval_secs", 60_i64 * 60)?
            .set_default("server.port", 8080_i64)?
            .set_default("tasks.min_rest_secs", 60_i64)?
            .set_default("log.json", false)?
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix("AUTOGRADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Environment-only loader for tools that never read a config file.
    pub fn from_env() -> Self {
        Self::load_from("").unwrap_or_default()
    }

    /// A config rooted somewhere specific, used by tests and one-shot tools.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.sources_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join(SOURCES_DIRNAME))
    }

    pub fn stale_lock_duration(&self) -> Duration {
        Duration::from_secs(self.locks.stale_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.locks.reap_interval_secs)
    }

    pub fn min_task_rest(&self) -> Duration {
        Duration::from_secs(self.tasks.min_rest_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("_autograder"),
            sources_dir: None,
            docker: DockerConfig {
                enabled: true,
                max_output_bytes: 4 * 1024 * 1024,
                keep_build_dirs: false,
            },
            locks: LockConfig {
                stale_secs: 2 * 60 * 60,
                reap_interval_secs: 60 * 60,
            },
            server: ServerConfig { port: 8080 },
            tasks: TaskConfig { min_rest_secs: 60 },
            log: LogConfig { json: false },
        }
    }
}
