//! Redis Manager - Centralized Redis connection and queue operations
//!
//! This module handles all Redis-related operations including:
//! - Connecting to the broker with retry
//! - Blocking job pops from the submission queue (BLPOP)
//! - Handing out sinks bound to the verdict queue

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::executor::SubmissionJob;
use crate::sink::RedisSink;

/// Centralized Redis manager for the worker's queue operations
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
    target_queue: String,
    output_queue: String,
}

impl RedisManager {
    /// Connect to the broker named by the worker configuration.
    pub async fn connect(config: &WorkerConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", config.redis_url);

        Ok(Self {
            client,
            conn,
            target_queue: config.target_queue.clone(),
            output_queue: config.output_queue.clone(),
        })
    }

    /// Block and wait for the next well-formed job on the submission
    /// queue.
    ///
    /// This uses BLPOP to efficiently wait for jobs without polling.
    /// Malformed payloads are logged and skipped; connection failures
    /// trigger a reconnect and the wait resumes.
    pub async fn pop_job(&mut self) -> Result<SubmissionJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(&self.target_queue, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.reconnect().await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<SubmissionJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// Sink bound to the verdict queue, for one submission's results.
    pub fn verdict_sink(&self) -> RedisSink {
        RedisSink::new(
            self.client.clone(),
            self.conn.clone(),
            self.output_queue.clone(),
        )
    }

    /// Reconnect to Redis
    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

/// Get a Redis connection with retry logic
pub(crate) async fn get_connection_with_retry(
    client: &redis::Client,
) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
