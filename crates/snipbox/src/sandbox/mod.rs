//! Container sandbox layer
//!
//! This module describes one sandbox instance ([`SandboxSpec`]), the runtime
//! operations the execution engine drives ([`SandboxRuntime`]) and the Docker
//! implementation of those operations ([`DockerRuntime`]).

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::time::Instant;

pub use crate::sandbox::docker::{DockerRuntime, to_create_body};
pub use crate::sandbox::guard::SandboxGuard;
pub use crate::sandbox::spec::{
    CODE_ENV, MANAGED_LABEL, SCRATCH_DIR, STDIN_ENV, SandboxSpec, SandboxSpecBuilder,
    for_execution, shell_quote,
};

mod docker;
mod guard;
mod spec;

/// Errors that occur while driving a sandbox through its lifecycle
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to connect to container runtime: {0}")]
    Connect(String),

    #[error("failed to create sandbox from image {image}: {message}")]
    CreateFailed { image: String, message: String },

    #[error("failed to start sandbox {id}: {message}")]
    StartFailed { id: String, message: String },

    #[error("log stream of sandbox {id} failed: {message}")]
    LogStream { id: String, message: String },

    #[error("failed waiting for sandbox {id}: {message}")]
    WaitFailed { id: String, message: String },

    #[error("sandbox {id} did not exit within {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("failed to remove sandbox {id}: {message}")]
    CleanupFailed { id: String, message: String },

    #[error("container runtime request failed: {0}")]
    Request(String),
}

/// A live sandbox instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    id: String,
    created_at: Instant,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Instant::now(),
        }
    }

    /// Runtime-assigned identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the runtime accepted the sandbox
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// Stream a chunk of output was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One demultiplexed chunk of sandbox output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub source: LogSource,
    pub bytes: Vec<u8>,
}

impl LogChunk {
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: LogSource::Stdout,
            bytes: bytes.into(),
        }
    }

    pub fn stderr(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: LogSource::Stderr,
            bytes: bytes.into(),
        }
    }
}

/// Control operations of a container runtime
///
/// Calls for different sandboxes are independent; implementations must not
/// assume they are serialized.
#[async_trait]
pub trait SandboxRuntime: Send + Sync + std::fmt::Debug {
    /// Create (but do not start) a sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    /// Start a created sandbox
    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Follow the sandbox's stdout and stderr until it exits
    fn logs<'a>(
        &'a self,
        handle: &'a SandboxHandle,
    ) -> BoxStream<'a, Result<LogChunk, SandboxError>>;

    /// Wait for the sandbox to reach a terminal state and return its exit code
    async fn wait(&self, handle: &SandboxHandle) -> Result<i32, SandboxError>;

    /// Force-remove the sandbox, killing it if still running
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// [`wait`](Self::wait), failing with [`SandboxError::Timeout`] once `timeout` elapses
    async fn wait_for_exit(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
    ) -> Result<i32, SandboxError> {
        match tokio::time::timeout(timeout, self.wait(handle)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout {
                id: handle.id().to_owned(),
                timeout,
            }),
        }
    }
}
