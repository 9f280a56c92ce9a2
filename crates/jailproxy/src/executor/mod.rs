//! Executors run one request and produce its `(pid, status, stdout, stderr)`.
//!
//! The server loop only depends on the [`Executor`] trait. [`SubprocessExecutor`]
//! is the default implementation used by the `jailproxy-server` binary.

mod params;
#[cfg(unix)]
mod subprocess;

use std::io;

use async_trait::async_trait;

use crate::bridge::protocol::{Request, Response};

pub use params::{RlimitResource, RlimitSpec, SubprocessSpec};
#[cfg(unix)]
pub use subprocess::SubprocessExecutor;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }
}

/// Trait for the execution backend - abstracts the sandboxing mechanism.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one request to completion.
    async fn execute(&self, request: Request) -> Result<Response, ExecutorError>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for std::sync::Arc<E> {
    async fn execute(&self, request: Request) -> Result<Response, ExecutorError> {
        (**self).execute(request).await
    }
}
