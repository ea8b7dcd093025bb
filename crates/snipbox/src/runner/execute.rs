//! Drives one execution through the sandbox lifecycle
//!
//! Creates the sandbox, relays its bounded output as frames, waits for it to
//! exit within the configured timeout and removes it on every path.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::config::{Config, ConfigError};
use crate::runner::{ExecutionError, FrameSink, OutputFrame};
use crate::sandbox::{
    self, LogSource, SandboxError, SandboxGuard, SandboxHandle, SandboxRuntime,
};
use crate::types::{ExecutionRequest, SandboxLimits};

/// Run `request` and publish its frames to `frames`
///
/// Never fails: every error is reported through the frame protocol.
#[instrument(skip_all, fields(language = %request.language))]
pub async fn execute_streaming(
    runtime: &Arc<dyn SandboxRuntime>,
    config: &Config,
    request: &ExecutionRequest,
    frames: &FrameSink,
) {
    let language = match config.get_language(&request.language) {
        Ok(language) => language,
        Err(e) => {
            let id = match e {
                ConfigError::LanguageNotFound(id) => id,
                _ => request.language.clone(),
            };
            let err = ExecutionError::Unsupported(id);
            debug!(%err, "rejecting request");
            frames.emit(OutputFrame::error(err.client_message())).await;
            return;
        }
    };

    let spec = sandbox::for_execution(language, request, &config.limits);
    let mut budget = OutputBudget::new(config.limits.max_output_bytes);

    let started = Instant::now();
    let (outcome, guard) = match runtime.create(&spec).await {
        Ok(handle) => {
            debug!(id = handle.id(), "sandbox created");
            let guard = SandboxGuard::new(Arc::clone(runtime), handle);
            let outcome = drive(
                runtime.as_ref(),
                guard.handle(),
                &config.limits,
                &mut budget,
                frames,
            )
            .await;
            (outcome, Some(guard))
        }
        Err(e) => (Err(e.into()), None),
    };

    match outcome {
        Ok(exit_code) => {
            if budget.truncated() {
                frames
                    .emit(OutputFrame::stderr(truncation_notice(budget.ceiling())))
                    .await;
            }
            debug!(exit_code, relayed = budget.used(), "execution finished");
            frames
                .emit(OutputFrame::exit(exit_code, elapsed_ms(started)))
                .await;
        }
        Err(err) => {
            error!(error = %err, "execution failed");
            frames.emit(OutputFrame::error(err.client_message())).await;
            frames.emit(OutputFrame::exit(1, elapsed_ms(started))).await;
        }
    }

    if let Some(guard) = guard {
        let id = guard.handle().id().to_owned();
        if let Err(e) = guard.release().await {
            warn!(id, error = %e, "failed to remove sandbox");
        }
    }
}

/// Start the sandbox, relay its output and wait for it to exit
///
/// One deadline covers start, relay and the exit wait.
async fn drive(
    runtime: &dyn SandboxRuntime,
    handle: &SandboxHandle,
    limits: &SandboxLimits,
    budget: &mut OutputBudget,
    frames: &FrameSink,
) -> Result<i32, ExecutionError> {
    let timeout = limits.timeout();
    let deadline = Instant::now() + timeout;

    tokio::time::timeout_at(deadline, runtime.start(handle))
        .await
        .map_err(|_| ExecutionError::TimedOut(timeout))??;

    let relay = relay_output(runtime, handle, budget, frames);
    tokio::time::timeout_at(deadline, relay)
        .await
        .map_err(|_| ExecutionError::TimedOut(timeout))??;

    let remaining = deadline.saturating_duration_since(Instant::now());
    match runtime.wait_for_exit(handle, remaining).await {
        Ok(code) => Ok(code),
        Err(SandboxError::Timeout { .. }) => Err(ExecutionError::TimedOut(timeout)),
        Err(e) => Err(e.into()),
    }
}

/// Forward log chunks as frames until the stream ends
async fn relay_output(
    runtime: &dyn SandboxRuntime,
    handle: &SandboxHandle,
    budget: &mut OutputBudget,
    frames: &FrameSink,
) -> Result<(), SandboxError> {
    let mut stdout = Utf8Decoder::default();
    let mut stderr = Utf8Decoder::default();

    let mut logs = runtime.logs(handle);
    while let Some(chunk) = logs.next().await {
        let chunk = chunk?;
        let text = match chunk.source {
            LogSource::Stdout => stdout.push(&chunk.bytes),
            LogSource::Stderr => stderr.push(&chunk.bytes),
        };
        relay_text(chunk.source, text, budget, frames).await;
    }

    relay_text(LogSource::Stdout, stdout.finish(), budget, frames).await;
    relay_text(LogSource::Stderr, stderr.finish(), budget, frames).await;
    Ok(())
}

async fn relay_text(
    source: LogSource,
    text: String,
    budget: &mut OutputBudget,
    frames: &FrameSink,
) {
    let Some(text) = budget.admit(text) else {
        return;
    };
    let frame = match source {
        LogSource::Stdout => OutputFrame::stdout(text),
        LogSource::Stderr => OutputFrame::stderr(text),
    };
    frames.emit(frame).await;
}

/// Incremental UTF-8 decoding of one output stream
///
/// A multi-byte character split across chunks is held back until the rest of
/// it arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode `bytes` after whatever was held back, keeping an incomplete tail
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        let mut rest = self.pending.as_slice();
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        text
    }

    /// Flush a held-back tail once the stream has ended
    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Human-readable notice sent after output was cut off
pub fn truncation_notice(ceiling: usize) -> String {
    if ceiling % 1024 == 0 {
        format!("\n... output truncated ({}KB limit)", ceiling / 1024)
    } else {
        format!("\n... output truncated ({ceiling} byte limit)")
    }
}

/// Running total of relayed output bytes against a ceiling
///
/// Counts the UTF-8 length of the decoded text sent to the client, so an
/// invalid input byte costs the three bytes of its U+FFFD replacement.
#[derive(Debug)]
pub(crate) struct OutputBudget {
    ceiling: usize,
    used: usize,
    truncated: bool,
}

impl OutputBudget {
    pub(crate) fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            used: 0,
            truncated: false,
        }
    }

    /// Take as much of `text` as still fits, cut on a char boundary
    ///
    /// Once anything has been discarded every later chunk is dropped as well.
    pub(crate) fn admit(&mut self, text: String) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        if self.truncated {
            return None;
        }

        let remaining = self.ceiling - self.used;
        if text.len() <= remaining {
            self.used += text.len();
            return Some(text);
        }

        self.truncated = true;
        let mut cut = remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.used += cut;

        let mut text = text;
        text.truncate(cut);
        (!text.is_empty()).then_some(text)
    }

    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn ceiling(&self) -> usize {
        self.ceiling
    }
}

impl ExecutionError {
    /// Message shown to the client; details stay in the server log
    pub fn client_message(&self) -> String {
        match self {
            Self::Unsupported(language) => format!("Unsupported language: {language}"),
            Self::Runtime(_) => "Execution failed".to_owned(),
            Self::TimedOut(timeout) => format_timeout(*timeout),
        }
    }
}

fn format_timeout(timeout: Duration) -> String {
    format!("Execution timed out after {}s", timeout.as_secs_f64())
}
