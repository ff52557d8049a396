mod config;
mod executor;
mod languages;
mod redis_manager;
mod sandbox;
mod sink;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::redis_manager::RedisManager;
use crate::sandbox::SandboxLimits;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("executor=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    info!(
        "Starting Execution Worker: language={}, target_queue={}, output_queue={}",
        config.language, config.target_queue, config.output_queue
    );

    languages::init_runtimes()?;
    info!("Loaded runtime command table");

    let adapter = languages::adapter_for(config.language);
    let runner = sandbox::create_runner();
    info!("Sandbox isolation tier: {}", runner.tier());

    let limits = SandboxLimits {
        memory_bytes: config.memory_limit_bytes,
        wall_time_secs: config.time_limit_secs,
    };
    info!(
        "Per-test limits: memory_bytes={}, wall_time_secs={}",
        limits.memory_bytes, limits.wall_time_secs
    );

    let mut redis = RedisManager::connect(&config).await?;

    info!("Waiting for submissions on {}...", config.target_queue);

    // One persistent future for the whole loop: a SIGINT that lands while a
    // submission is mid-flight stays pending until the next pop.
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let job = tokio::select! {
            job = redis.pop_job() => job?,
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping worker");
                break;
            }
        };

        let submission_id = job.submission_id.clone();
        info!(
            "Received submission: submission_id={}, tests={}",
            submission_id,
            job.inputs.len()
        );

        let sink = redis.verdict_sink();
        match executor::process_submission(
            job,
            Arc::clone(&adapter),
            Arc::clone(&runner),
            sink,
            limits,
            &config.scratch_dir,
        )
        .await
        {
            Ok(summary) => info!(
                "Submission complete: submission_id={}, passed={}/{}, published={}",
                submission_id, summary.passed, summary.tests, summary.published
            ),
            Err(e) => error!(
                "Failed to process submission {}: {:#}",
                submission_id, e
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::sys::signal::{raise, Signal};
    use tokio_test::{assert_pending, task};

    // A SIGINT that arrives while the worker is busy (nothing polling the
    // shutdown future) must still break the loop at the next pop. A future
    // created fresh per iteration drops the signal; a persistent one keeps it.
    #[tokio::test]
    async fn test_shutdown_signal_between_polls_is_retained() {
        let mut shutdown = task::spawn(tokio::signal::ctrl_c());

        // First poll installs the handler and parks, like iteration one.
        assert_pending!(shutdown.poll());

        // Signal lands while the worker is processing a submission.
        raise(Signal::SIGINT).unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(2), shutdown).await;
        assert!(
            stopped.is_ok(),
            "signal raised between polls was dropped instead of retained"
        );
    }
}
