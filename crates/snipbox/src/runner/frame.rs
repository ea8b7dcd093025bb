//! Output frame protocol
//!
//! Frames are produced by the engine and drained by whoever consumes one
//! execution: a transport publishing them to a session channel, or
//! [`FrameCollector`] folding them into an [`ExecutionResponse`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::ExecutionResponse;

/// One unit of the streamed result of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutputFrame {
    /// Text written to standard output
    Stdout { data: String },

    /// Text written to standard error
    Stderr { data: String },

    /// The program finished; always the last frame of an attempt
    #[serde(rename_all = "camelCase")]
    Exit { exit_code: i32, elapsed_ms: i64 },

    /// The attempt failed or was rejected
    Error { message: String },
}

impl OutputFrame {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout { data: data.into() }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr { data: data.into() }
    }

    pub fn exit(exit_code: i32, elapsed_ms: i64) -> Self {
        Self::Exit {
            exit_code,
            elapsed_ms,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Check if no further frames follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }
}

/// Sending half of a frame channel
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<OutputFrame>,
}

impl FrameSink {
    /// Create a bounded frame channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn new(tx: mpsc::Sender<OutputFrame>) -> Self {
        Self { tx }
    }

    /// Deliver a frame, waiting for room in the channel
    ///
    /// Returns `false` if the receiving side is gone. The frame is dropped in
    /// that case; producers keep going so the sandbox is still cleaned up.
    pub async fn emit(&self, frame: OutputFrame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Folds the frames of one execution into an [`ExecutionResponse`]
#[derive(Debug, Default)]
pub struct FrameCollector {
    stdout: String,
    stderr: String,
    exit: Option<(i32, i64)>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: OutputFrame) {
        match frame {
            OutputFrame::Stdout { data } => self.stdout.push_str(&data),
            OutputFrame::Stderr { data } => self.stderr.push_str(&data),
            OutputFrame::Error { message } => self.stderr.push_str(&message),
            OutputFrame::Exit {
                exit_code,
                elapsed_ms,
            } => self.exit = Some((exit_code, elapsed_ms)),
        }
    }

    /// Build the response; a stream without an exit frame counts as exit code 1
    pub fn finish(self) -> ExecutionResponse {
        let (exit_code, elapsed_ms) = self.exit.unwrap_or((1, 0));
        ExecutionResponse {
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code,
            elapsed_ms,
        }
    }

    /// Drain a frame channel until every sender is dropped
    pub async fn collect(mut rx: mpsc::Receiver<OutputFrame>) -> ExecutionResponse {
        let mut collector = Self::new();
        while let Some(frame) = rx.recv().await {
            collector.push(frame);
        }
        collector.finish()
    }
}
