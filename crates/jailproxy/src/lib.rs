//! jailproxy: keep one sandboxed execution helper alive and relay calls to it.

pub mod bridge;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod executor;
pub mod logging;
pub mod server;
mod version;

pub use bridge::codec::{DecodeError, EncodeError, FrameError};
pub use bridge::protocol::{Kwargs, Request, Response, Value};
pub use client::{
    ProxyClient, ProxyConfig, ProxyError, ProxyHandle, ProxySpawner, ServerBinarySpawner,
    ServerSpawnConfig, SpawnError,
};
pub use config::{DiagnosticsConfig, ServerConfig};
pub use diagnostics::DiagnosticLog;
#[cfg(unix)]
pub use executor::SubprocessExecutor;
pub use executor::{Executor, ExecutorError};
pub use server::{ServerError, run_server, serve, serve_until};
pub use version::{JAILPROXY_VERSION, PROTOCOL_VERSION, VersionInfo};
