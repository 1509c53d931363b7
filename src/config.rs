use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use scip_ingest_core::handler::HandlerConfig;
use scip_ingest_core::reader::{BufferingConfig, DEFAULT_MAX_IN_MEMORY_BYTES};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub blobstore: BlobstoreConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobstoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    /// Directory holding one clone per repository, at `<repos_root>/<name>`.
    #[serde(default = "default_repos_root")]
    pub repos_root: PathBuf,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repos_root: default_repos_root(),
        }
    }
}

fn default_repos_root() -> PathBuf {
    PathBuf::from("./data/repos")
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Total compressed bytes in flight across workers. `0` disables the
    /// budget.
    #[serde(default)]
    pub budget_bytes: i64,
    #[serde(default = "default_max_in_memory_bytes")]
    pub max_in_memory_bytes: i64,
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,
    #[serde(default = "default_requeue_delay_secs")]
    pub requeue_delay_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            budget_bytes: 0,
            max_in_memory_bytes: default_max_in_memory_bytes(),
            spill_dir: None,
            requeue_delay_secs: default_requeue_delay_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_in_memory_bytes() -> i64 {
    DEFAULT_MAX_IN_MEMORY_BYTES
}
fn default_requeue_delay_secs() -> u64 {
    60
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            buffering: BufferingConfig {
                max_in_memory_bytes: self.max_in_memory_bytes,
                spill_dir: self.spill_dir.clone(),
            },
            requeue_delay: Duration::from_secs(self.requeue_delay_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate worker
    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be > 0");
    }
    if config.worker.poll_interval_ms == 0 {
        anyhow::bail!("worker.poll_interval_ms must be > 0");
    }
    if config.worker.max_in_memory_bytes <= 0 {
        anyhow::bail!("worker.max_in_memory_bytes must be > 0");
    }
    if config.worker.budget_bytes < 0 {
        anyhow::bail!("worker.budget_bytes must be >= 0 (0 disables the budget)");
    }

    // Validate log
    match config.log.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other if other.contains('=') => {}
        other => anyhow::bail!(
            "Unknown log level: '{}'. Must be trace, debug, info, warn, error, or a filter directive.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("scip-ingest.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "./data/scip-ingest.sqlite"

[blobstore]
root = "./data/blobs"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.budget_bytes, 0);
        assert_eq!(config.worker.requeue_delay_secs, 60);
        assert_eq!(config.log.level, "info");

        let handler = config.worker.handler_config();
        assert_eq!(handler.requeue_delay, Duration::from_secs(60));
        assert_eq!(
            handler.buffering.max_in_memory_bytes,
            DEFAULT_MAX_IN_MEMORY_BYTES
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "db.sqlite"

[blobstore]
root = "blobs"

[worker]
concurrency = 0
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("worker.concurrency"));

        let path = write(
            &dir,
            r#"
[db]
path = "db.sqlite"

[blobstore]
root = "blobs"

[log]
level = "loud"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown log level"));
    }

    #[test]
    fn test_missing_blobstore_fails_to_parse() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "[db]\npath = \"db.sqlite\"\n");
        assert!(load_config(&path).is_err());
    }
}
