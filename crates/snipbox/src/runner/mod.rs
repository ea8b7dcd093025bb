//! Execution engine for Snipbox
//!
//! Turns an [`ExecutionRequest`] into a sandbox run and reports the result as
//! a stream of [`OutputFrame`]s. The non-streaming [`Engine::execute`] drives
//! the same path and folds the frames into an [`ExecutionResponse`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use crate::runner::execute::truncation_notice;
pub use crate::runner::frame::{FrameCollector, FrameSink, OutputFrame};

mod execute;
mod frame;

use crate::{
    config::Config,
    sandbox::{SandboxError, SandboxRuntime},
    types::{ExecutionRequest, ExecutionResponse},
};

/// Frames buffered between the engine and a collecting consumer
const FRAME_BUFFER: usize = 64;

/// Reasons an execution attempt did not produce a normal exit
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("unsupported language '{0}'")]
    Unsupported(String),

    #[error("sandbox runtime error: {0}")]
    Runtime(#[from] SandboxError),

    #[error("execution exceeded {0:?}")]
    TimedOut(Duration),
}

/// Runs requests in sandboxes created through a [`SandboxRuntime`]
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<Config>,
    runtime: Arc<dyn SandboxRuntime>,
}

impl Engine {
    pub fn new(config: impl Into<Arc<Config>>, runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            config: config.into(),
            runtime,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    /// Run a request, publishing frames as they are produced
    ///
    /// The frames end with exactly one exit frame, or with an error frame
    /// followed by an exit frame with code 1. An unsupported language yields a
    /// single error frame and nothing else. The sandbox is removed before this
    /// returns.
    pub async fn execute_streaming(&self, request: &ExecutionRequest, frames: &FrameSink) {
        execute::execute_streaming(&self.runtime, &self.config, request, frames).await;
    }

    /// Run a request to completion and aggregate its output
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResponse {
        let (sink, rx) = FrameSink::channel(FRAME_BUFFER);
        let produce = async move {
            self.execute_streaming(request, &sink).await;
        };
        let ((), response) = tokio::join!(produce, FrameCollector::collect(rx));
        response
    }
}
