//! Proxy client - owns the persistent server process and relays calls to it.
//!
//! Flow:
//! 1. First call spawns the server through the configured `ProxySpawner`
//! 2. Each call writes one request line and reads exactly one response line
//! 3. Any channel failure poisons the handle; later calls fail until `reset()`
//!
//! There is no automatic respawn. A dead server is noticed when the next write
//! or read on its pipes fails.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{self, DEFAULT_MAX_FRAME_LENGTH, DecodeError, EncodeError, FrameError, LineCodec};
use crate::bridge::protocol::{Kwargs, Request, Response, Value};
use crate::config::{
    ENV_CALL_TIMEOUT_SECS, ENV_MAX_FRAME_BYTES, ENV_SERVER_BIN, env_lookup, parse_number,
};

/// Name of the server binary built alongside this crate.
pub const SERVER_BIN_NAME: &str = "jailproxy-server";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to start proxy process: {0}")]
    Spawn(#[from] SpawnError),
    #[error("cannot encode request: {0}")]
    Encode(#[from] EncodeError),
    #[error("malformed response: {0}")]
    Decode(#[from] DecodeError),
    #[error("proxy channel broken: {0}")]
    BrokenChannel(String),
    #[error("proxy call timed out after {0:?}")]
    Timeout(Duration),
    #[error("proxy handle failed earlier and must be reset")]
    Poisoned,
}

impl From<FrameError> for ProxyError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Encode(e) => Self::Encode(e),
            FrameError::Decode(e) => Self::Decode(e),
            FrameError::Truncated => {
                Self::BrokenChannel("stream closed in the middle of a frame".to_string())
            }
            FrameError::Io(e) => Self::BrokenChannel(e.to_string()),
        }
    }
}

/// Settings a spawned server must share with its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpawnConfig {
    pub max_frame_length: usize,
}

/// Extension point for different ways of starting the server.
pub trait ProxySpawner: Send + Sync {
    fn spawn(&self, config: &ServerSpawnConfig) -> Result<ProxyHandle, SpawnError>;
}

/// Spawns the `jailproxy-server` binary with piped stdio.
#[derive(Debug, Clone, Default)]
pub struct ServerBinarySpawner {
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl ServerBinarySpawner {
    /// Spawner for the server binary next to the current executable.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Binary that will be executed.
    pub fn program(&self) -> Result<PathBuf, SpawnError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => locate_server_binary(),
        }
    }
}

/// Look for the server next to the running executable. Test binaries live in
/// `target/<profile>/deps`, one level below the binaries, so check the parent too.
fn locate_server_binary() -> Result<PathBuf, SpawnError> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| SpawnError::Other(format!("{} has no parent directory", exe.display())))?;

    let mut candidates = vec![dir.join(SERVER_BIN_NAME)];
    if dir.file_name().is_some_and(|name| name == "deps")
        && let Some(parent) = dir.parent()
    {
        candidates.push(parent.join(SERVER_BIN_NAME));
    }

    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            SpawnError::Other(format!(
                "cannot find {SERVER_BIN_NAME} next to {}; set {ENV_SERVER_BIN}",
                exe.display()
            ))
        })
}

impl ServerBinarySpawner {
    fn command(&self, config: &ServerSpawnConfig) -> Result<Command, SpawnError> {
        let program = self.program()?;
        tracing::debug!(
            program = %program.display(),
            max_frame_length = config.max_frame_length,
            "Spawning proxy server"
        );
        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .env(ENV_MAX_FRAME_BYTES, config.max_frame_length.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(command)
    }
}

impl ProxySpawner for ServerBinarySpawner {
    fn spawn(&self, config: &ServerSpawnConfig) -> Result<ProxyHandle, SpawnError> {
        let child = self.command(config)?.spawn()?;
        ProxyHandle::from_child(child)
    }
}

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Live connection to one server: its request and response streams, and the
/// child process when there is one.
pub struct ProxyHandle {
    writer: FramedWrite<BoxedWriter, LineCodec>,
    reader: FramedRead<BoxedReader, LineCodec>,
    child: Option<Child>,
    poisoned: bool,
}

impl ProxyHandle {
    /// Take ownership of a spawned server. Stdin and stdout must be piped; a piped
    /// stderr is drained into the log so the server never blocks on it.
    pub fn from_child(mut child: Child) -> Result<Self, SpawnError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, child.id()));
        }

        let mut handle = Self::from_streams(stdout, stdin);
        handle.child = Some(child);
        Ok(handle)
    }

    /// Handle over arbitrary streams, e.g. an in-process server.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let writer: BoxedWriter = Box::pin(writer);
        let reader: BoxedReader = Box::pin(reader);
        Self {
            writer: FramedWrite::new(writer, LineCodec::new()),
            reader: FramedRead::new(reader, LineCodec::new()),
            child: None,
            poisoned: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn set_max_frame_length(&mut self, max: usize) {
        *self.writer.encoder_mut() = LineCodec::with_max_length(max);
        *self.reader.decoder_mut() = LineCodec::with_max_length(max);
    }

    /// Write one line and wait for the one line that answers it.
    async fn exchange(&mut self, line: String) -> Result<String, ProxyError> {
        self.writer.send(line).await?;
        match self.reader.next().await {
            Some(line) => Ok(line?),
            None => Err(ProxyError::BrokenChannel(
                "proxy closed its output before responding".to_string(),
            )),
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        // A healthy server exits once its stdin closes; a poisoned one may be stuck.
        if self.poisoned
            && let Some(child) = self.child.take()
        {
            stop_server(child);
        }
    }
}

/// How long a stuck server gets to clean up after SIGTERM before it is killed.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Ask the server to stop so it can kill the subprocess it is running, then kill it
/// if it is still around after [`SERVER_STOP_GRACE`].
#[cfg(unix)]
fn stop_server(mut child: Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to signal proxy process");
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if tokio::time::timeout(SERVER_STOP_GRACE, child.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!(pid, "Proxy process ignored SIGTERM, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::debug!(pid, error = %e, "Failed to kill proxy process");
                    }
                }
            });
        }
        Err(_) => tracing::debug!(pid, "No runtime to reap proxy process"),
    }
}

#[cfg(not(unix))]
fn stop_server(mut child: Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill proxy process");
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "jailproxy::server", pid, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid, error = %e, "Stopped reading proxy stderr");
                break;
            }
        }
    }
}

#[derive(Clone)]
pub struct ProxyConfig {
    /// Bound on one roundtrip; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    pub max_frame_length: usize,
    pub spawner: Arc<dyn ProxySpawner>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self {
            call_timeout: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            spawner: Arc::new(ServerBinarySpawner::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(program) = lookup(ENV_SERVER_BIN).filter(|p| !p.is_empty()) {
            config.spawner = Arc::new(ServerBinarySpawner::new().with_program(program));
        }
        if let Some(secs) = lookup(ENV_CALL_TIMEOUT_SECS)
            .and_then(|v| parse_number::<u64>(ENV_CALL_TIMEOUT_SECS, &v))
        {
            // Zero disables the timeout.
            config.call_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(max) =
            lookup(ENV_MAX_FRAME_BYTES).and_then(|v| parse_number(ENV_MAX_FRAME_BYTES, &v))
        {
            config.max_frame_length = max;
        }
        config
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProxySpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// Client for one persistent proxy process.
///
/// Calls take `&mut self`: one request is in flight at a time. Share a client
/// between tasks by wrapping it in a mutex.
pub struct ProxyClient {
    config: ProxyConfig,
    handle: Option<ProxyHandle>,
    spawn_count: u64,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new(ProxyConfig::new())
    }
}

impl ProxyClient {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            handle: None,
            spawn_count: 0,
        }
    }

    pub fn from_env() -> Self {
        Self::new(ProxyConfig::from_env())
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Run `(args, kwargs)` on the proxy, spawning it on first use.
    pub async fn call(&mut self, args: Vec<Value>, kwargs: Kwargs) -> Result<Response, ProxyError> {
        self.send(Request::new(args, kwargs)).await
    }

    /// Like [`call`](Self::call) with an explicit bound on the roundtrip.
    pub async fn call_with_timeout(
        &mut self,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> Result<Response, ProxyError> {
        self.roundtrip(Request::new(args, kwargs), Some(timeout)).await
    }

    pub async fn send(&mut self, request: Request) -> Result<Response, ProxyError> {
        let timeout = self.config.call_timeout;
        self.roundtrip(request, timeout).await
    }

    pub async fn send_with_timeout(
        &mut self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ProxyError> {
        self.roundtrip(request, Some(timeout)).await
    }

    /// Drop the current process. The next call spawns a fresh one.
    pub fn reset(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(
                pid = ?handle.pid(),
                poisoned = handle.is_poisoned(),
                "Dropping proxy process"
            );
        }
    }

    /// Whether a process handle exists (possibly poisoned).
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_poisoned(&self) -> bool {
        self.handle.as_ref().is_some_and(ProxyHandle::is_poisoned)
    }

    /// Number of processes spawned over this client's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ProxyHandle::pid)
    }

    async fn roundtrip(
        &mut self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, ProxyError> {
        // Encoding problems are caught before anything touches the channel.
        let line = codec::encode(&request)?;
        let max = self.config.max_frame_length;
        if line.len() > max {
            return Err(EncodeError::TooLarge {
                len: line.len(),
                max,
            }
            .into());
        }

        let handle = self.ensure_handle()?;
        if handle.poisoned {
            return Err(ProxyError::Poisoned);
        }

        let exchanged = match timeout {
            Some(limit) => tokio::time::timeout(limit, handle.exchange(line))
                .await
                .unwrap_or(Err(ProxyError::Timeout(limit))),
            None => handle.exchange(line).await,
        };
        let result = exchanged.and_then(|reply| Ok(codec::decode::<Response>(&reply)?));

        match &result {
            Ok(response) => {
                tracing::trace!(pid = response.pid, status = response.status, "Proxy call completed");
            }
            Err(e) => {
                handle.poisoned = true;
                tracing::warn!(pid = ?handle.pid(), error = %e, "Proxy call failed, handle poisoned");
            }
        }
        result
    }

    fn ensure_handle(&mut self) -> Result<&mut ProxyHandle, ProxyError> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => {
                let spawn_config = ServerSpawnConfig {
                    max_frame_length: self.config.max_frame_length,
                };
                let mut handle = self.config.spawner.spawn(&spawn_config)?;
                handle.set_max_frame_length(spawn_config.max_frame_length);
                self.spawn_count += 1;
                tracing::info!(
                    pid = ?handle.pid(),
                    spawn_count = self.spawn_count,
                    "Proxy process started"
                );
                handle
            }
        };
        Ok(self.handle.insert(handle))
    }
}
