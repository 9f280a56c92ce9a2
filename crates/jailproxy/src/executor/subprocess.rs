//! Default executor: run a limited subprocess and capture its output.
//!
//! The child is moved into its own session before exec so a wall-clock overrun can
//! kill the whole process group, and resource limits are applied in the same hook.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use nix::sys::resource::{RLIM_INFINITY, Resource, rlim_t, setrlimit};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, setsid};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};

use super::params::{RlimitResource, RlimitSpec, SubprocessSpec};
use super::{Executor, ExecutorError};
use crate::bridge::protocol::{Request, Response};

/// Runs each request as a child process described by a [`SubprocessSpec`].
#[derive(Debug, Clone, Default)]
pub struct SubprocessExecutor;

impl SubprocessExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Spawn, feed stdin, collect output, enforce the realtime limit.
    pub async fn run(&self, spec: SubprocessSpec) -> Result<Response, ExecutorError> {
        let program = spec.program().to_string();

        let mut command = Command::new(&program);
        command
            .args(spec.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &spec.env {
            command.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
        }

        let limits: Vec<(Resource, rlim_t, rlim_t)> =
            spec.rlimits.iter().map(native_limit).collect();
        // Safety: the hook runs between fork and exec and only calls async-signal-safe
        // functions (setsid, setrlimit) over data prepared before the fork.
        unsafe {
            command.pre_exec(move || {
                setsid()?;
                for &(resource, soft, hard) in &limits {
                    setrlimit(resource, soft, hard)?;
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let started = Instant::now();
        let pid = child.id().unwrap_or_default();
        tracing::debug!(pid, %program, "Spawned subprocess");
        let mut guard = GroupKillGuard { pid, armed: true };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let input = spec.stdin.unwrap_or_default();

        let run = async {
            let (fed, out, err, status) = tokio::join!(
                feed_stdin(stdin, input),
                read_all(stdout),
                read_all(stderr),
                child.wait(),
            );
            fed?;
            Ok::<_, io::Error>((status?, out?, err?))
        };
        tokio::pin!(run);

        let finished = match spec.realtime {
            Some(limit) => match tokio::time::timeout(limit, &mut run).await {
                Ok(finished) => finished,
                Err(_) => {
                    kill_process_group(pid, started);
                    run.await
                }
            },
            None => run.await,
        };
        guard.disarm();
        let (status, stdout, stderr) = finished.map_err(|source| ExecutorError::Io {
            program: program.clone(),
            source,
        })?;

        let status = status_code(status);
        tracing::debug!(
            pid,
            status,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Subprocess finished"
        );

        Ok(Response {
            pid,
            status,
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl Executor for SubprocessExecutor {
    async fn execute(&self, request: Request) -> Result<Response, ExecutorError> {
        let spec = SubprocessSpec::from_request(&request)?;
        self.run(spec).await
    }
}

fn native_limit(limit: &RlimitSpec) -> (Resource, rlim_t, rlim_t) {
    let resource = match limit.resource {
        RlimitResource::AddressSpace => Resource::RLIMIT_AS,
        RlimitResource::Core => Resource::RLIMIT_CORE,
        RlimitResource::Cpu => Resource::RLIMIT_CPU,
        RlimitResource::Data => Resource::RLIMIT_DATA,
        RlimitResource::FileSize => Resource::RLIMIT_FSIZE,
        RlimitResource::OpenFiles => Resource::RLIMIT_NOFILE,
        RlimitResource::Processes => Resource::RLIMIT_NPROC,
        RlimitResource::Stack => Resource::RLIMIT_STACK,
    };
    let native = |value: Option<u64>| value.map_or(RLIM_INFINITY, |v| v as rlim_t);
    (resource, native(limit.soft), native(limit.hard))
}

async fn feed_stdin(stdin: Option<ChildStdin>, input: Vec<u8>) -> io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    if !input.is_empty() {
        match stdin.write_all(&input).await {
            // The child is free to exit without reading its input.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            other => other?,
        }
    }
    drop(stdin);
    Ok(())
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn kill_process_group(pid: u32, started: Instant) {
    tracing::warn!(
        pid,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Killing process group, ran too long"
    );
    signal_group(pid);
}

fn signal_group(pid: u32) {
    if pid == 0 {
        return;
    }
    // The child called setsid, so its pid is also its process group id.
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::error!(pid, error = %e, "Failed to kill process group");
    }
}

/// Kills the child's process group when a run is dropped before the child was reaped.
struct GroupKillGuard {
    pid: u32,
    armed: bool,
}

impl GroupKillGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(pid = self.pid, "Run abandoned, killing process group");
            signal_group(self.pid);
        }
    }
}

/// Exit code, or the negated signal number for a killed process.
fn status_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}
