//! Python language adapter
//!
//! Writes the submission verbatim as `submission.py` plus one generated
//! driver per test. The driver imports the entry point by name, calls it
//! with the case file's arguments and compares the returned value against
//! the expected value under Python equality on JSON-decoded data.

use std::path::Path;

use async_trait::async_trait;
use tokio::fs;

use super::{
    case_file_name, interpret_with_markers, is_valid_entry_point, python_runtime,
    write_case_file, HarnessError, Interpretation, Language, LanguageAdapter, EXIT_MISMATCH,
};
use crate::executor::SubmissionJob;
use crate::sandbox::RawOutcome;

/// Stderr fragments that mean the interpreter hit the memory ceiling.
const OOM_MARKERS: &[&str] = &[
    "MemoryError",
    "Cannot allocate memory",
    "Resource temporarily unavailable",
];

const DRIVER_TEMPLATE: &str = r#"import json
import sys

from submission import __ENTRY_POINT__


def main():
    with open(sys.argv[1], "r") as fh:
        case = json.load(fh)

    actual = __ENTRY_POINT__(*case["input"])

    if actual == case["expected"]:
        sys.exit(0)

    print(json.dumps(actual), file=sys.stderr)
    sys.exit(__EXIT_MISMATCH__)


if __name__ == "__main__":
    main()
"#;

pub struct PythonAdapter;

impl PythonAdapter {
    pub fn new() -> Self {
        Self
    }

    fn driver_source(entry_point: &str) -> String {
        DRIVER_TEMPLATE
            .replace("__ENTRY_POINT__", entry_point)
            .replace("__EXIT_MISMATCH__", &EXIT_MISMATCH.to_string())
    }
}

impl Default for PythonAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    async fn build_harness(
        &self,
        job: &SubmissionJob,
        test_index: usize,
        dir: &Path,
    ) -> Result<(), HarnessError> {
        if !is_valid_entry_point(&job.entry_point) {
            return Err(HarnessError::InvalidEntryPoint(job.entry_point.clone()));
        }

        fs::write(dir.join("submission.py"), &job.source_code).await?;
        fs::write(
            dir.join(format!("test_{}.py", test_index)),
            Self::driver_source(&job.entry_point),
        )
        .await?;
        write_case_file(
            dir,
            test_index,
            &job.inputs[test_index],
            &job.expected_outputs[test_index],
        )
        .await?;
        Ok(())
    }

    fn execution_command(&self, test_index: usize) -> Vec<String> {
        let runtime = python_runtime();
        vec![
            runtime.interpreter,
            format!("test_{}.py", test_index),
            case_file_name(test_index),
        ]
    }

    fn execution_env(&self) -> Vec<(String, String)> {
        vec![
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ]
    }

    fn interpret(&self, outcome: &RawOutcome) -> Interpretation {
        interpret_with_markers(outcome, OOM_MARKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TestError;
    use serde_json::{json, Value};

    fn sample_job() -> SubmissionJob {
        SubmissionJob {
            submission_id: "sub-py".to_string(),
            source_code: "def solution(x):\n    return x * 5\n".to_string(),
            entry_point: "solution".to_string(),
            inputs: vec![vec![json!(5)]],
            expected_outputs: vec![json!(25)],
        }
    }

    #[tokio::test]
    async fn test_build_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = PythonAdapter::new();
        adapter.build_harness(&sample_job(), 0, dir.path()).await.unwrap();

        let submission = tokio::fs::read_to_string(dir.path().join("submission.py"))
            .await
            .unwrap();
        assert_eq!(submission, sample_job().source_code);

        let driver = tokio::fs::read_to_string(dir.path().join("test_0.py"))
            .await
            .unwrap();
        assert!(driver.contains("from submission import solution"));
        assert!(driver.contains("solution(*case[\"input\"])"));
        assert!(driver.contains(&format!("sys.exit({})", EXIT_MISMATCH)));
        assert!(!driver.contains("__ENTRY_POINT__"));

        let case: Value = serde_json::from_str(
            &tokio::fs::read_to_string(dir.path().join("case_0.json"))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(case["input"], json!([5]));
        assert_eq!(case["expected"], json!(25));
    }

    #[tokio::test]
    async fn test_rejects_injectable_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = sample_job();
        job.entry_point = "solution; import os".to_string();

        let err = PythonAdapter::new()
            .build_harness(&job, 0, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidEntryPoint(_)));
    }

    #[test]
    fn test_execution_command_shape() {
        let argv = PythonAdapter::new().execution_command(3);
        assert_eq!(argv, vec!["python3", "test_3.py", "case_3.json"]);
    }

    #[test]
    fn test_interpret_memory_marker() {
        let outcome = RawOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Traceback (most recent call last):\nMemoryError\n".to_string(),
            wall_time_ms: 40,
        };
        let interp = PythonAdapter::new().interpret(&outcome);
        assert_eq!(interp.error, Some(TestError::MemoryLimitExceeded));
    }
}
