//! Execution orchestrator
//!
//! Drives one submission end to end: validate the job shape, build one
//! harness directory per test, run every test concurrently in the sandbox
//! and hand each verdict to the publisher the moment its process has been
//! interpreted. Verdicts therefore leave in completion order;
//! `test_number` is the only ordering key consumers may rely on.
//!
//! Every declared test yields exactly one verdict, including when the
//! harness cannot be built or a test task dies internally.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::languages::{HarnessError, LanguageAdapter};
use crate::sandbox::{SandboxLimits, SandboxRunner, SandboxSpec};
use crate::sink::{spawn_result_publisher, ResultSink};

/// Verdict stdout is truncated to this many characters.
const MAX_STDOUT_CHARS: usize = 4096;

/// Job received from the submission queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionJob {
    pub submission_id: String,
    #[serde(rename = "submission_code")]
    pub source_code: String,
    #[serde(rename = "function_name")]
    pub entry_point: String,
    /// Positional argument lists, one per test
    pub inputs: Vec<Vec<Value>>,
    /// Expected return values, one per test
    #[serde(rename = "outputs")]
    pub expected_outputs: Vec<Value>,
}

/// Distinguished failure markers, with free text for everything else
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestError {
    Timeout,
    MemoryLimitExceeded,
    Other(String),
}

impl TestError {
    pub fn as_str(&self) -> &str {
        match self {
            TestError::Timeout => "timeout",
            TestError::MemoryLimitExceeded => "memory_limit_exceeded",
            TestError::Other(message) => message,
        }
    }
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for TestError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TestError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "timeout" => TestError::Timeout,
            "memory_limit_exceeded" => TestError::MemoryLimitExceeded,
            _ => TestError::Other(raw),
        })
    }
}

/// Verdict for exactly one test case. `output` and `error` serialize as
/// explicit nulls; consumers match on field presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestVerdict {
    pub submission_id: String,
    pub test_number: usize,
    pub passed: bool,
    pub inputs: Vec<Value>,
    pub expected: Value,
    pub output: Option<Value>,
    pub stdout: String,
    pub error: Option<TestError>,
}

/// Per-submission accounting returned to the worker loop
#[derive(Debug)]
pub struct SubmissionSummary {
    pub tests: usize,
    pub passed: usize,
    pub published: usize,
}

struct TestContext {
    submission_id: String,
    test_number: usize,
    inputs: Vec<Value>,
    expected: Value,
    test_dir: PathBuf,
}

/// Process one submission: build, run concurrently, publish, tear down.
///
/// `Err` is reserved for structural failures that produce no verdicts at
/// all (mismatched test counts, no workspace). Everything downstream of a
/// well-formed job is reported through verdicts instead.
pub async fn process_submission<S>(
    job: SubmissionJob,
    adapter: Arc<dyn LanguageAdapter>,
    runner: Arc<dyn SandboxRunner>,
    sink: S,
    limits: SandboxLimits,
    scratch_root: &Path,
) -> Result<SubmissionSummary>
where
    S: ResultSink + 'static,
{
    if job.inputs.len() != job.expected_outputs.len() {
        anyhow::bail!(
            "Mismatched test counts for submission {}: {} inputs vs {} expected outputs",
            job.submission_id,
            job.inputs.len(),
            job.expected_outputs.len()
        );
    }
    let total = job.inputs.len();

    let workspace = tempfile::Builder::new()
        .prefix("exec-")
        .tempdir_in(scratch_root)
        .context("Failed to create execution workspace")?;
    info!(
        "Workspace created: submission_id={}, language={}, path={}, tests={}",
        job.submission_id,
        adapter.language(),
        workspace.path().display(),
        total
    );

    let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
    let publisher = spawn_result_publisher(sink, verdict_rx);

    // Build every harness before any process spawns. A submission that
    // cannot build fails identically for all of its tests and nothing
    // untrusted runs.
    let mut build_error: Option<HarnessError> = None;
    for test_number in 0..total {
        let test_dir = workspace.path().join(format!("test_{}", test_number));
        if let Err(e) = build_one(adapter.as_ref(), &job, test_number, &test_dir).await {
            build_error = Some(e);
            break;
        }
    }

    if let Some(e) = build_error {
        error!(
            "Harness build failed for submission {}: {}",
            job.submission_id, e
        );
        let message = format!("failed to build test harness: {}", e);
        for test_number in 0..total {
            let _ = verdict_tx.send(failure_verdict(&job, test_number, message.clone()));
        }
        drop(verdict_tx);
        teardown(workspace, &job.submission_id);
        info!(
            "Submission drained: submission_id={}, tests={}, passed=0 (build failure)",
            job.submission_id, total
        );
        let published = publisher.await.unwrap_or(0);
        return Ok(SubmissionSummary {
            tests: total,
            passed: 0,
            published,
        });
    }
    info!(
        "Harness files built: submission_id={}, tests={}",
        job.submission_id, total
    );

    // Launch every test concurrently. Each task owns its slice of the job
    // and produces exactly one verdict.
    let mut tasks: JoinSet<TestVerdict> = JoinSet::new();
    let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
    for test_number in 0..total {
        let ctx = TestContext {
            submission_id: job.submission_id.clone(),
            test_number,
            inputs: job.inputs[test_number].clone(),
            expected: job.expected_outputs[test_number].clone(),
            test_dir: workspace.path().join(format!("test_{}", test_number)),
        };
        let adapter = Arc::clone(&adapter);
        let runner = Arc::clone(&runner);
        let handle = tasks.spawn(async move { run_one_test(adapter, runner, limits, ctx).await });
        task_index.insert(handle.id(), test_number);
    }

    info!(
        "Running: submission_id={}, pending={}",
        job.submission_id, total
    );

    let mut delivered = vec![false; total];
    let mut passed = 0usize;
    while let Some(joined) = tasks.join_next_with_id().await {
        let verdict = match joined {
            Ok((_, verdict)) => verdict,
            Err(join_error) => {
                let test_number = task_index.get(&join_error.id()).copied().unwrap_or(0);
                warn!(
                    "Test task died for submission {}: {}",
                    job.submission_id, join_error
                );
                failure_verdict(
                    &job,
                    test_number,
                    format!("internal execution failure: {}", join_error),
                )
            }
        };

        if delivered[verdict.test_number] {
            warn!(
                "Duplicate verdict suppressed: submission_id={}, test_number={}",
                job.submission_id, verdict.test_number
            );
            continue;
        }
        delivered[verdict.test_number] = true;
        if verdict.passed {
            passed += 1;
        }
        let _ = verdict_tx.send(verdict);
    }

    // Exactly one verdict per declared test, even under internal faults.
    for test_number in 0..total {
        if !delivered[test_number] {
            warn!(
                "Synthesizing verdict for silent test: submission_id={}, test_number={}",
                job.submission_id, test_number
            );
            let _ = verdict_tx.send(failure_verdict(
                &job,
                test_number,
                "test produced no result".to_string(),
            ));
        }
    }

    drop(verdict_tx);
    teardown(workspace, &job.submission_id);
    info!(
        "Submission drained: submission_id={}, tests={}, passed={}",
        job.submission_id, total, passed
    );
    let published = publisher.await.unwrap_or(0);

    Ok(SubmissionSummary {
        tests: total,
        passed,
        published,
    })
}

async fn build_one(
    adapter: &dyn LanguageAdapter,
    job: &SubmissionJob,
    test_number: usize,
    test_dir: &Path,
) -> Result<(), HarnessError> {
    tokio::fs::create_dir(test_dir).await?;
    adapter.build_harness(job, test_number, test_dir).await
}

async fn run_one_test(
    adapter: Arc<dyn LanguageAdapter>,
    runner: Arc<dyn SandboxRunner>,
    limits: SandboxLimits,
    ctx: TestContext,
) -> TestVerdict {
    let argv = adapter.execution_command(ctx.test_number);
    let spec = SandboxSpec::new(argv, &ctx.test_dir).with_env(adapter.execution_env());

    let (interpretation, stdout) = match runner.run(&spec, &limits).await {
        Ok(outcome) => {
            let stdout: String = outcome.stdout.chars().take(MAX_STDOUT_CHARS).collect();
            (adapter.interpret(&outcome), stdout)
        }
        Err(e) => {
            warn!(
                "Sandbox failure: submission_id={}, test_number={}: {:#}",
                ctx.submission_id, ctx.test_number, e
            );
            (
                crate::languages::Interpretation::failed(TestError::Other(format!(
                    "sandbox failure: {:#}",
                    e
                ))),
                String::new(),
            )
        }
    };

    TestVerdict {
        submission_id: ctx.submission_id,
        test_number: ctx.test_number,
        passed: interpretation.passed,
        inputs: ctx.inputs,
        expected: ctx.expected,
        output: interpretation.output,
        stdout,
        error: interpretation.error,
    }
}

fn failure_verdict(job: &SubmissionJob, test_number: usize, message: String) -> TestVerdict {
    TestVerdict {
        submission_id: job.submission_id.clone(),
        test_number,
        passed: false,
        inputs: job.inputs.get(test_number).cloned().unwrap_or_default(),
        expected: job
            .expected_outputs
            .get(test_number)
            .cloned()
            .unwrap_or(Value::Null),
        output: None,
        stdout: String::new(),
        error: Some(TestError::Other(message)),
    }
}

fn teardown(workspace: tempfile::TempDir, submission_id: &str) {
    if let Err(e) = workspace.close() {
        warn!(
            "Failed to remove workspace for submission {}: {}",
            submission_id, e
        );
    }
}
