//! Result sink - the verdict publish boundary
//!
//! The orchestrator hands finished verdicts to a sink; the Redis
//! implementation pushes them onto the output queue the submission
//! service consumes. Publishing runs on its own task so a slow or downed
//! consumer never stalls test execution. Failures are logged and skipped:
//! delivery is at-most-once, and a lost verdict is never worth re-running
//! a test for.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::executor::TestVerdict;

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver one verdict to the downstream consumer.
    async fn publish(&mut self, verdict: &TestVerdict) -> Result<()>;
}

/// Sink that RPUSHes verdicts onto a Redis list queue
pub struct RedisSink {
    client: redis::Client,
    conn: MultiplexedConnection,
    queue: String,
}

impl RedisSink {
    pub fn new(
        client: redis::Client,
        conn: MultiplexedConnection,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            client,
            conn,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl ResultSink for RedisSink {
    async fn publish(&mut self, verdict: &TestVerdict) -> Result<()> {
        let payload = serde_json::to_string(verdict).context("Failed to serialize verdict")?;

        // Push, reconnecting and retrying once on failure
        if let Err(e) = self.conn.rpush::<_, _, ()>(&self.queue, &payload).await {
            warn!("Failed to push verdict: {}. Reconnecting...", e);
            self.conn = crate::redis_manager::get_connection_with_retry(&self.client).await?;
            self.conn
                .rpush::<_, _, ()>(&self.queue, &payload)
                .await
                .with_context(|| format!("Failed to push verdict to {}", self.queue))?;
        }

        Ok(())
    }
}

/// Spawn the task that drains the verdict channel into the sink.
///
/// The handle resolves to the number of verdicts delivered once the
/// sending side closes the channel.
pub fn spawn_result_publisher<S>(
    mut sink: S,
    mut verdicts: UnboundedReceiver<TestVerdict>,
) -> JoinHandle<usize>
where
    S: ResultSink + 'static,
{
    tokio::spawn(async move {
        let mut published = 0usize;
        while let Some(verdict) = verdicts.recv().await {
            match sink.publish(&verdict).await {
                Ok(()) => published += 1,
                Err(e) => error!(
                    "Failed to publish verdict: submission_id={}, test_number={}: {:#}",
                    verdict.submission_id, verdict.test_number, e
                ),
            }
        }
        published
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio_test::{assert_pending, task};

    struct RecordingSink {
        fail_on: Option<usize>,
        delivered: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn publish(&mut self, verdict: &TestVerdict) -> Result<()> {
            if self.fail_on == Some(verdict.test_number) {
                anyhow::bail!("broker unavailable");
            }
            self.delivered.lock().unwrap().push(verdict.test_number);
            Ok(())
        }
    }

    fn verdict(test_number: usize) -> TestVerdict {
        TestVerdict {
            submission_id: "sub-1".to_string(),
            test_number,
            passed: true,
            inputs: vec![],
            expected: serde_json::Value::Null,
            output: None,
            stdout: String::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_publisher_drains_in_channel_order() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            fail_on: None,
            delivered: Arc::clone(&delivered),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = spawn_result_publisher(sink, rx);

        for test_number in [2, 0, 1] {
            tx.send(verdict(test_number)).unwrap();
        }
        drop(tx);

        assert_eq!(publisher.await.unwrap(), 3);
        assert_eq!(*delivered.lock().unwrap(), vec![2, 0, 1]);
    }

    // The handle resolves on channel close, not on an empty queue; an
    // orchestrator still holding the sender must keep the publisher alive.
    #[tokio::test]
    async fn test_publisher_pends_until_channel_closes() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            fail_on: None,
            delivered: Arc::clone(&delivered),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let mut publisher = task::spawn(spawn_result_publisher(sink, rx));

        tx.send(verdict(0)).unwrap();
        tokio::task::yield_now().await;
        assert_pending!(publisher.poll());
        assert_eq!(*delivered.lock().unwrap(), vec![0]);

        drop(tx);
        assert_eq!(publisher.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publisher_continues_past_failures() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            fail_on: Some(1),
            delivered: Arc::clone(&delivered),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = spawn_result_publisher(sink, rx);

        for test_number in 0..3 {
            tx.send(verdict(test_number)).unwrap();
        }
        drop(tx);

        assert_eq!(publisher.await.unwrap(), 2);
        assert_eq!(*delivered.lock().unwrap(), vec![0, 2]);
    }
}
