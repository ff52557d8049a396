//! Minimum isolation tier - hard rlimits plus a wall-clock kill
//!
//! Used when no jail binary is available on the host. The child is placed
//! in its own session, detached from the network where the kernel permits
//! an unprivileged user namespace, and constrained by RLIMIT_AS / CPU /
//! NOFILE / FSIZE. The wall-clock ceiling is enforced by the supervisor,
//! which kills the whole process group and reports exit code 124.

use anyhow::Result;
use async_trait::async_trait;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use tokio::process::Command;

use super::{
    supervise, IsolationTier, RawOutcome, SandboxLimits, SandboxRunner, SandboxSpec,
    MAX_FILE_BYTES, MAX_OPEN_FILES,
};

pub struct RlimitRunner;

impl RlimitRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RlimitRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRunner for RlimitRunner {
    fn tier(&self) -> IsolationTier {
        IsolationTier::Rlimit
    }

    async fn run(&self, spec: &SandboxSpec, limits: &SandboxLimits) -> Result<RawOutcome> {
        anyhow::ensure!(!spec.argv.is_empty(), "Empty sandbox command");

        let mut cmd = Command::new(&spec.argv[0]);
        cmd.args(&spec.argv[1..])
            .current_dir(&spec.work_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", &spec.work_dir)
            .env("LANG", "C.UTF-8")
            .envs(spec.env.iter().cloned());

        let memory_bytes = limits.memory_bytes;
        let cpu_secs = limits.wall_time_secs + 1;
        unsafe {
            cmd.pre_exec(move || {
                // Own session, so the supervisor's group kill reaches
                // grandchildren (compiler, VM) too.
                nix::unistd::setsid().map_err(io_err)?;
                // Network detachment requires an unprivileged user
                // namespace; degrade silently where the kernel refuses.
                let _ = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET);
                apply_rlimit(Resource::RLIMIT_AS, memory_bytes)?;
                // CPU ceiling is a backstop; the wall clock fires first.
                apply_rlimit(Resource::RLIMIT_CPU, cpu_secs)?;
                apply_rlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES)?;
                apply_rlimit(Resource::RLIMIT_FSIZE, MAX_FILE_BYTES)?;
                apply_rlimit(Resource::RLIMIT_CORE, 0)?;
                Ok(())
            });
        }

        supervise(cmd, limits.wall_time_secs).await
    }
}

fn apply_rlimit(resource: Resource, limit: u64) -> std::io::Result<()> {
    setrlimit(resource, limit, limit).map_err(io_err)
}

fn io_err(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}
