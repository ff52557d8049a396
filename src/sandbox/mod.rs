//! Sandbox module - isolated execution of untrusted test processes
//!
//! Two isolation tiers are provided, the strongest available picked once
//! at startup:
//! - `NsjailRunner`: namespace jail via the external `nsjail` binary
//! - `RlimitRunner`: direct spawn with hard rlimits and a wall-clock kill
//!
//! The sandbox module does NOT:
//! - Interpret exit codes into verdicts
//! - Generate or read harness files
//! - Know which language is being executed

pub mod nsjail;
pub mod rlimit;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code reported when the wall-clock ceiling kills the process.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code observed when the process dies to SIGKILL (128 + 9).
pub const EXIT_KILLED: i32 = 137;

/// Captured stdout/stderr are bounded; anything beyond this is drained and
/// discarded so a flooding child still runs to its real exit.
pub const MAX_CAPTURE_BYTES: u64 = 1024 * 1024;
/// File descriptor ceiling inside the sandbox.
pub const MAX_OPEN_FILES: u64 = 256;
/// Largest file an untrusted process may write (10 MiB).
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Command to execute inside the sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Working directory (the per-test directory)
    pub work_dir: PathBuf,
    /// Extra environment variables (key, value)
    pub env: Vec<(String, String)>,
}

impl SandboxSpec {
    pub fn new(argv: Vec<String>, work_dir: impl AsRef<Path>) -> Self {
        Self {
            argv,
            work_dir: work_dir.as_ref().to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Resource ceilings for one test execution
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    /// Address-space ceiling in bytes
    pub memory_bytes: u64,
    /// Wall-clock ceiling in seconds
    pub wall_time_secs: u64,
}

/// Raw outcome of one sandboxed execution, uninterpreted
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub wall_time_ms: u64,
}

/// Isolation tier in effect for this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationTier {
    /// Namespace jail (nsjail): private namespaces, no network, read-only
    /// system paths, writable test directory only
    Namespace,
    /// Hard rlimits plus best-effort namespace detachment
    Rlimit,
}

impl fmt::Display for IsolationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationTier::Namespace => write!(f, "namespace (nsjail)"),
            IsolationTier::Rlimit => write!(f, "rlimit"),
        }
    }
}

/// Runner trait for executing one test process under resource ceilings
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    fn tier(&self) -> IsolationTier;

    /// Run one command to completion and return its raw outcome. `Err`
    /// means the process could not be supervised at all (spawn failure),
    /// not that the program failed.
    async fn run(&self, spec: &SandboxSpec, limits: &SandboxLimits) -> Result<RawOutcome>;
}

/// Pick the strongest isolation available on this host.
pub fn create_runner() -> Arc<dyn SandboxRunner> {
    if nsjail::NsjailRunner::available() {
        info!("Using nsjail namespace isolation");
        Arc::new(nsjail::NsjailRunner::new())
    } else {
        warn!("nsjail not found on PATH; falling back to rlimit isolation");
        Arc::new(rlimit::RlimitRunner::new())
    }
}

/// Spawn a fully configured command and supervise it against the wall
/// clock: capture bounded stdout/stderr while waiting, and on ceiling
/// breach kill the whole process group and report `EXIT_TIMEOUT`.
///
/// The command must have been configured with `setsid` in its pre-exec
/// hook so the group kill reaches grandchildren.
pub(crate) async fn supervise(mut cmd: Command, wall_time_secs: u64) -> Result<RawOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().context("Failed to spawn sandboxed process")?;
    let child_pid = child.id();

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let waited = tokio::time::timeout(Duration::from_secs(wall_time_secs), async {
        let (status, out, err) = tokio::join!(
            child.wait(),
            drain_capped(stdout_pipe, &mut stdout_buf),
            drain_capped(stderr_pipe, &mut stderr_buf),
        );
        out?;
        err?;
        status
    })
    .await;

    let wall_time_ms = start.elapsed().as_millis() as u64;

    match waited {
        Ok(status) => {
            let status = status.context("Failed to wait for sandboxed process")?;
            let exit_code = match status.code() {
                Some(code) => code,
                None => {
                    use std::os::unix::process::ExitStatusExt;
                    128 + status.signal().unwrap_or(0)
                }
            };
            Ok(RawOutcome {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                wall_time_ms,
            })
        }
        Err(_) => {
            kill_process_group(child_pid);
            let _ = child.kill().await;
            Ok(RawOutcome {
                exit_code: EXIT_TIMEOUT,
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                wall_time_ms,
            })
        }
    }
}

/// Read up to `MAX_CAPTURE_BYTES` into the buffer, then keep draining to
/// EOF so the child never blocks on a full pipe.
async fn drain_capped<R>(pipe: Option<R>, buf: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut pipe = match pipe {
        Some(pipe) => pipe,
        None => return Ok(()),
    };

    (&mut pipe).take(MAX_CAPTURE_BYTES).read_to_end(buf).await?;
    tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok(())
}

/// SIGKILL the child's process group. The child may already be gone.
fn kill_process_group(child_pid: Option<u32>) {
    let pid = match child_pid {
        Some(pid) => pid,
        None => return,
    };

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = SandboxSpec::new(vec!["python3".into(), "test_0.py".into()], "/tmp/ws")
            .with_env(vec![("PYTHONUNBUFFERED".into(), "1".into())]);

        assert_eq!(spec.argv[0], "python3");
        assert_eq!(spec.work_dir, PathBuf::from("/tmp/ws"));
        assert_eq!(spec.env.len(), 1);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(IsolationTier::Rlimit.to_string(), "rlimit");
        assert_eq!(IsolationTier::Namespace.to_string(), "namespace (nsjail)");
    }
}
