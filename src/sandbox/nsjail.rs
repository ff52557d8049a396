//! Preferred isolation tier - nsjail namespace sandbox
//!
//! Wraps each execution in a once-mode nsjail: private PID, mount, user
//! and network namespaces, the payload remapped to nobody:nogroup,
//! read-only binds for the system paths the runtimes live under, and the
//! test directory as the only writable bind.
//! The supervisor still owns the wall clock and reports 124 on expiry;
//! the in-jail ceilings sit one second above it as backstops so a jail
//! kill never shadows the timeout verdict.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

use super::{
    supervise, IsolationTier, RawOutcome, SandboxLimits, SandboxRunner, SandboxSpec,
    MAX_FILE_BYTES, MAX_OPEN_FILES,
};

/// System paths bound read-only into every jail.
const RO_BINDS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/etc/alternatives"];

pub struct NsjailRunner {
    nsjail_path: String,
}

impl NsjailRunner {
    pub fn new() -> Self {
        Self {
            nsjail_path: "nsjail".to_string(),
        }
    }

    /// Probe PATH for the jail binary.
    pub fn available() -> bool {
        std::process::Command::new("which")
            .arg("nsjail")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn build_argv(&self, spec: &SandboxSpec, limits: &SandboxLimits) -> Vec<String> {
        let work_dir = spec.work_dir.display().to_string();
        let backstop_secs = limits.wall_time_secs + 1;
        let memory_mb = (limits.memory_bytes / (1024 * 1024)).max(1);

        let mut argv = vec![
            self.nsjail_path.clone(),
            "--mode".into(),
            "o".into(),
            "--really_quiet".into(),
            "--user".into(),
            "nobody".into(),
            "--group".into(),
            "nogroup".into(),
            "--time_limit".into(),
            backstop_secs.to_string(),
            "--max_cpus".into(),
            "1".into(),
            "--rlimit_as".into(),
            memory_mb.to_string(),
            "--rlimit_cpu".into(),
            backstop_secs.to_string(),
            "--rlimit_fsize".into(),
            (MAX_FILE_BYTES / (1024 * 1024)).to_string(),
            "--rlimit_nofile".into(),
            MAX_OPEN_FILES.to_string(),
            "--disable_clone_newcgroup".into(),
        ];

        for path in RO_BINDS {
            if Path::new(path).exists() {
                argv.push("--bindmount_ro".into());
                argv.push((*path).into());
            }
        }

        argv.push("--bindmount".into());
        argv.push(work_dir.clone());
        argv.push("--cwd".into());
        argv.push(work_dir);
        argv.push("--tmpfsmount".into());
        argv.push("/tmp".into());

        argv.push("--env".into());
        argv.push("PATH=/usr/local/bin:/usr/bin:/bin".into());
        argv.push("--env".into());
        argv.push("LANG=C.UTF-8".into());
        for (key, value) in &spec.env {
            argv.push("--env".into());
            argv.push(format!("{}={}", key, value));
        }

        argv.push("--".into());
        argv.extend(spec.argv.iter().cloned());
        argv
    }
}

impl Default for NsjailRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRunner for NsjailRunner {
    fn tier(&self) -> IsolationTier {
        IsolationTier::Namespace
    }

    async fn run(&self, spec: &SandboxSpec, limits: &SandboxLimits) -> Result<RawOutcome> {
        anyhow::ensure!(!spec.argv.is_empty(), "Empty sandbox command");

        let argv = self.build_argv(spec, limits);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        unsafe {
            cmd.pre_exec(|| {
                // Own session for the jail itself; a group kill on timeout
                // takes the jail and its payload down together.
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        supervise(cmd, limits.wall_time_secs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
        argv.iter()
            .position(|arg| arg == flag)
            .and_then(|i| argv.get(i + 1))
            .map(|s| s.as_str())
    }

    fn spec_and_limits() -> (SandboxSpec, SandboxLimits) {
        let spec = SandboxSpec::new(
            vec!["python3".into(), "test_0.py".into(), "case_0.json".into()],
            "/scratch/exec-abc/test_0",
        );
        let limits = SandboxLimits {
            memory_bytes: 100 * 1024 * 1024,
            wall_time_secs: 5,
        };
        (spec, limits)
    }

    #[test]
    fn test_build_argv_limits() {
        let (spec, limits) = spec_and_limits();
        let argv = NsjailRunner::new().build_argv(&spec, &limits);

        assert_eq!(argv[0], "nsjail");
        assert_eq!(flag_value(&argv, "--rlimit_as"), Some("100"));
        // Jail ceilings sit above the supervisor's 5s wall clock.
        assert_eq!(flag_value(&argv, "--time_limit"), Some("6"));
        assert_eq!(flag_value(&argv, "--rlimit_cpu"), Some("6"));
        assert_eq!(flag_value(&argv, "--cwd"), Some("/scratch/exec-abc/test_0"));
    }

    #[test]
    fn test_build_argv_drops_privileges() {
        let (spec, limits) = spec_and_limits();
        let argv = NsjailRunner::new().build_argv(&spec, &limits);

        assert_eq!(flag_value(&argv, "--user"), Some("nobody"));
        assert_eq!(flag_value(&argv, "--group"), Some("nogroup"));
    }

    #[test]
    fn test_build_argv_payload_follows_separator() {
        let (spec, limits) = spec_and_limits();
        let argv = NsjailRunner::new().build_argv(&spec, &limits);

        let sep = argv.iter().position(|arg| arg == "--").unwrap();
        assert_eq!(&argv[sep + 1..], &spec.argv[..]);
    }

    #[test]
    fn test_build_argv_adapter_env() {
        let (spec, limits) = spec_and_limits();
        let spec = spec.with_env(vec![("PYTHONUNBUFFERED".into(), "1".into())]);
        let argv = NsjailRunner::new().build_argv(&spec, &limits);

        assert!(argv.iter().any(|arg| arg == "PYTHONUNBUFFERED=1"));
    }

    #[tokio::test]
    #[ignore = "requires nsjail on PATH"]
    async fn test_jailed_echo() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SandboxSpec::new(
            vec!["sh".into(), "-c".into(), "echo jailed".into()],
            dir.path(),
        );
        let limits = SandboxLimits {
            memory_bytes: 256 * 1024 * 1024,
            wall_time_secs: 5,
        };

        let outcome = NsjailRunner::new().run(&spec, &limits).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "jailed\n");
    }
}
