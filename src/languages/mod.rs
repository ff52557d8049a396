//! Language adapters - harness synthesis and outcome interpretation
//!
//! One adapter is selected at startup for the worker's configured
//! language. An adapter knows how to turn a submission plus one test case
//! into runnable files, how to launch them, and how to map the raw
//! process outcome back onto verdict fields. The orchestrator never
//! branches on the language itself.
//!
//! Generated harnesses follow one exit-code protocol:
//! - 0: the submission's value equaled the expected value
//! - `EXIT_MISMATCH` (232): ran and compared, values differed; the actual
//!   value is the last non-empty stderr line, JSON-encoded
//! - anything else: the run itself failed (interpreted per adapter)

pub mod java;
pub mod python;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::executor::{SubmissionJob, TestError};
use crate::sandbox::{RawOutcome, EXIT_KILLED, EXIT_TIMEOUT};

/// Exit code the generated harness uses to signal "ran, compared,
/// differed".
pub const EXIT_MISMATCH: i32 = 232;

/// Target language of this worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Java,
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            other => anyhow::bail!("Unsupported language: {}", other),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Java => write!(f, "java"),
        }
    }
}

/// Runtime commands for the Python adapter
#[derive(Debug, Clone, Deserialize)]
pub struct PythonRuntime {
    pub interpreter: String,
}

impl Default for PythonRuntime {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

/// Runtime commands for the Java adapter
#[derive(Debug, Clone, Deserialize)]
pub struct JavaRuntime {
    pub javac: String,
    pub java: String,
    /// Classpath entry holding the JSON codec the generated driver uses
    pub json_classpath: String,
}

impl Default for JavaRuntime {
    fn default() -> Self {
        Self {
            javac: "javac".to_string(),
            java: "java".to_string(),
            json_classpath: "/usr/share/java/gson.jar".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeTable {
    python: PythonRuntime,
    java: JavaRuntime,
}

static RUNTIMES: OnceLock<RuntimeTable> = OnceLock::new();

/// Load the runtime command table embedded at build time.
pub fn init_runtimes() -> Result<()> {
    let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/runtimes.toml"));
    let table: RuntimeTable =
        toml::from_str(content).context("Failed to parse runtimes.toml")?;
    RUNTIMES
        .set(table)
        .map_err(|_| anyhow::anyhow!("Runtime table already initialized"))?;
    Ok(())
}

pub(crate) fn python_runtime() -> PythonRuntime {
    match RUNTIMES.get() {
        Some(table) => table.python.clone(),
        None => {
            warn!("Runtime table not initialized, using defaults");
            PythonRuntime::default()
        }
    }
}

pub(crate) fn java_runtime() -> JavaRuntime {
    match RUNTIMES.get() {
        Some(table) => table.java.clone(),
        None => {
            warn!("Runtime table not initialized, using defaults");
            JavaRuntime::default()
        }
    }
}

/// Why a submission's harness could not be produced
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid entry point name: {0:?}")]
    InvalidEntryPoint(String),
    #[error("no class declaration found in submitted source")]
    MissingEntryClass,
    #[error("failed to write harness artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Verdict fields recovered from one raw process outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub passed: bool,
    /// Actual produced value, recovered on mismatch
    pub output: Option<Value>,
    pub error: Option<TestError>,
}

impl Interpretation {
    pub(crate) fn failed(error: TestError) -> Self {
        Self {
            passed: false,
            output: None,
            error: Some(error),
        }
    }
}

/// Language adapter seam between the orchestrator and the sandbox
#[async_trait]
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> Language;

    /// Write every artifact one test needs into its working directory.
    async fn build_harness(
        &self,
        job: &SubmissionJob,
        test_index: usize,
        dir: &Path,
    ) -> Result<(), HarnessError>;

    /// Argv that launches one test, relative to its working directory.
    fn execution_command(&self, test_index: usize) -> Vec<String>;

    /// Extra environment for the sandboxed process.
    fn execution_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Map a raw process outcome onto verdict fields.
    fn interpret(&self, outcome: &RawOutcome) -> Interpretation;
}

/// Adapter selection, once at startup.
pub fn adapter_for(language: Language) -> Arc<dyn LanguageAdapter> {
    match language {
        Language::Python => Arc::new(python::PythonAdapter::new()),
        Language::Java => Arc::new(java::JavaAdapter::new()),
    }
}

/// Entry points are interpolated into generated source, so anything that
/// is not a bare identifier is rejected before it can reach a file.
pub(crate) fn is_valid_entry_point(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn case_file_name(test_index: usize) -> String {
    format!("case_{}.json", test_index)
}

/// Write the case file the generated harness reads:
/// `{"input": [...], "expected": ...}`.
pub(crate) async fn write_case_file(
    dir: &Path,
    test_index: usize,
    inputs: &[Value],
    expected: &Value,
) -> Result<(), HarnessError> {
    let case = serde_json::json!({
        "input": inputs,
        "expected": expected,
    });
    let body = serde_json::to_vec(&case).map_err(std::io::Error::from)?;
    tokio::fs::write(dir.join(case_file_name(test_index)), body).await?;
    Ok(())
}

/// Shared exit-code protocol, checked in order. The kill code and the
/// allocation markers both mean the memory ceiling, whichever fires
/// first; wall-clock expiry always wins over both.
pub(crate) fn interpret_with_markers(outcome: &RawOutcome, oom_markers: &[&str]) -> Interpretation {
    if outcome.exit_code == EXIT_TIMEOUT {
        return Interpretation::failed(TestError::Timeout);
    }

    if outcome.exit_code == EXIT_KILLED
        || oom_markers.iter().any(|marker| outcome.stderr.contains(marker))
    {
        return Interpretation::failed(TestError::MemoryLimitExceeded);
    }

    if outcome.exit_code == EXIT_MISMATCH {
        let mut lines: Vec<&str> = outcome
            .stderr
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        let output = lines.pop().map(parse_actual_value);
        let diagnostic = lines.join("\n");
        return Interpretation {
            passed: false,
            output,
            error: if diagnostic.is_empty() {
                None
            } else {
                Some(TestError::Other(diagnostic))
            },
        };
    }

    if outcome.exit_code == 0 {
        return Interpretation {
            passed: true,
            output: None,
            error: None,
        };
    }

    let message = if outcome.stderr.trim().is_empty() {
        format!("process exited with code {}", outcome.exit_code)
    } else {
        outcome.stderr.trim_end().to_string()
    };
    Interpretation::failed(TestError::Other(message))
}

/// The harness emits the actual value as JSON; keep the raw line if it
/// does not parse.
fn parse_actual_value(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(exit_code: i32, stdout: &str, stderr: &str) -> RawOutcome {
        RawOutcome {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            wall_time_ms: 10,
        }
    }

    #[test]
    fn test_embedded_runtime_table_parses() {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/runtimes.toml"));
        let table: RuntimeTable = toml::from_str(content).unwrap();

        assert!(!table.python.interpreter.is_empty());
        assert!(!table.java.javac.is_empty());
        assert!(!table.java.json_classpath.is_empty());
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("python3".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("py".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("Java".parse::<Language>().unwrap(), Language::Java);
        assert!("ruby".parse::<Language>().is_err());

        assert_eq!(Language::Python.to_string(), "python");
        assert_eq!(Language::Java.to_string(), "java");
    }

    #[test]
    fn test_adapter_reports_its_language() {
        assert_eq!(adapter_for(Language::Python).language(), Language::Python);
        assert_eq!(adapter_for(Language::Java).language(), Language::Java);
    }

    #[test]
    fn test_entry_point_validation() {
        assert!(is_valid_entry_point("solution"));
        assert!(is_valid_entry_point("_private2"));
        assert!(is_valid_entry_point("twoSum"));

        assert!(!is_valid_entry_point(""));
        assert!(!is_valid_entry_point("2fast"));
        assert!(!is_valid_entry_point("has-dash"));
        assert!(!is_valid_entry_point("has space"));
        assert!(!is_valid_entry_point("os; import x"));
    }

    #[test]
    fn test_exit_zero_passes() {
        let interp = interpret_with_markers(&outcome(0, "debug print\n", ""), &[]);
        assert!(interp.passed);
        assert_eq!(interp.output, None);
        assert_eq!(interp.error, None);
    }

    #[test]
    fn test_timeout_code() {
        let interp = interpret_with_markers(&outcome(EXIT_TIMEOUT, "", ""), &[]);
        assert!(!interp.passed);
        assert_eq!(interp.error, Some(TestError::Timeout));
    }

    #[test]
    fn test_kill_code_is_memory() {
        let interp = interpret_with_markers(&outcome(EXIT_KILLED, "", ""), &[]);
        assert_eq!(interp.error, Some(TestError::MemoryLimitExceeded));
    }

    #[test]
    fn test_allocation_marker_is_memory() {
        let interp = interpret_with_markers(
            &outcome(1, "", "Traceback...\nMemoryError\n"),
            &["MemoryError"],
        );
        assert_eq!(interp.error, Some(TestError::MemoryLimitExceeded));
    }

    #[test]
    fn test_mismatch_recovers_json_output() {
        let interp = interpret_with_markers(&outcome(EXIT_MISMATCH, "", "70\n"), &[]);
        assert!(!interp.passed);
        assert_eq!(interp.output, Some(json!(70)));
        assert_eq!(interp.error, None);
    }

    #[test]
    fn test_mismatch_keeps_diagnostic_lines() {
        let stderr = "deprecation warning\n[1, 2]\n";
        let interp = interpret_with_markers(&outcome(EXIT_MISMATCH, "", stderr), &[]);
        assert_eq!(interp.output, Some(json!([1, 2])));
        assert_eq!(
            interp.error,
            Some(TestError::Other("deprecation warning".to_string()))
        );
    }

    #[test]
    fn test_mismatch_non_json_output_kept_as_string() {
        let interp = interpret_with_markers(&outcome(EXIT_MISMATCH, "", "not json\n"), &[]);
        assert_eq!(interp.output, Some(json!("not json")));
    }

    #[test]
    fn test_mismatch_with_empty_stderr() {
        let interp = interpret_with_markers(&outcome(EXIT_MISMATCH, "", ""), &[]);
        assert!(!interp.passed);
        assert_eq!(interp.output, None);
        assert_eq!(interp.error, None);
    }

    #[test]
    fn test_other_exit_surfaces_stderr() {
        let interp = interpret_with_markers(
            &outcome(1, "", "Traceback (most recent call last):\nZeroDivisionError\n"),
            &[],
        );
        assert!(!interp.passed);
        match interp.error {
            Some(TestError::Other(message)) => {
                assert!(message.contains("ZeroDivisionError"));
            }
            other => panic!("unexpected error field: {:?}", other),
        }
    }

    #[test]
    fn test_other_exit_without_stderr_names_code() {
        let interp = interpret_with_markers(&outcome(3, "", ""), &[]);
        assert_eq!(
            interp.error,
            Some(TestError::Other("process exited with code 3".to_string()))
        );
    }

    #[tokio::test]
    async fn test_case_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        write_case_file(dir.path(), 2, &[json!(5), json!("x")], &json!([1, 2]))
            .await
            .unwrap();

        let body = tokio::fs::read_to_string(dir.path().join("case_2.json"))
            .await
            .unwrap();
        let case: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(case["input"], json!([5, "x"]));
        assert_eq!(case["expected"], json!([1, 2]));
    }
}
