//! Worker configuration from the environment
//!
//! Every worker pool serves exactly one language and one queue pair, so
//! the whole configuration is read once at startup. A missing required
//! variable or an unparsable number aborts the process before any queue
//! is touched.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::languages::Language;

/// Default per-test address-space ceiling: 100 MiB
const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 100 * 1024 * 1024;
/// Default per-test wall-clock ceiling
const DEFAULT_TIME_LIMIT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker URL, e.g. "redis://localhost:6379"
    pub redis_url: String,
    /// Submission queue this worker consumes
    pub target_queue: String,
    /// Verdict queue this worker publishes to
    pub output_queue: String,
    /// Language every job on the target queue is written in
    pub language: Language,
    pub memory_limit_bytes: u64,
    pub time_limit_secs: u64,
    /// Parent directory for per-submission workspaces
    pub scratch_dir: PathBuf,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let redis_url = required("REDIS_URL")?;
        let target_queue = required("TARGET_QUEUE")?;
        let output_queue = required("OUTPUT_QUEUE")?;
        let language = required("LANGUAGE")?.parse::<Language>()?;

        let memory_limit_bytes = optional_u64("MEMORY_LIMIT_BYTES", DEFAULT_MEMORY_LIMIT_BYTES)?;
        let time_limit_secs = optional_u64("TIME_LIMIT_SECS", DEFAULT_TIME_LIMIT_SECS)?;
        anyhow::ensure!(memory_limit_bytes > 0, "MEMORY_LIMIT_BYTES must be positive");
        anyhow::ensure!(time_limit_secs > 0, "TIME_LIMIT_SECS must be positive");

        let scratch_dir = std::env::var("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        Ok(Self {
            redis_url,
            target_queue,
            output_queue,
            language,
            memory_limit_bytes,
            time_limit_secs,
            scratch_dir,
        })
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("Missing required environment variable: {}", name))
}

fn optional_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("Invalid {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}
