use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the size of submitted code and stdin, in bytes
pub const MAX_PAYLOAD_BYTES: usize = 65_536;

/// Errors raised when a request fails upstream validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} exceeds {limit} bytes (got {actual})")]
    TooLarge {
        field: &'static str,
        limit: usize,
        actual: usize,
    },
}

/// A single run request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source code to run
    pub code: String,

    /// Language identifier (matched case-insensitively)
    pub language: String,

    /// Text fed to the program's standard input
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            stdin: None,
        }
    }

    /// Set the program's standard input
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Standard input, with an absent value treated as empty text
    pub fn stdin_or_empty(&self) -> &str {
        self.stdin.as_deref().unwrap_or_default()
    }

    /// Check the size and presence constraints every request must satisfy
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.language.trim().is_empty() {
            return Err(ValidationError::Empty { field: "language" });
        }
        check_size("code", &self.code)?;
        if let Some(ref stdin) = self.stdin {
            check_size("stdin", stdin)?;
        }
        Ok(())
    }
}

/// A run request arriving over a session channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// Client-side session the output frames are published to
    pub session_id: String,

    #[serde(flatten)]
    pub request: ExecutionRequest,
}

impl StreamRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.session_id.trim().is_empty() {
            return Err(ValidationError::Empty {
                field: "session_id",
            });
        }
        self.request.validate()
    }
}

fn check_size(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::TooLarge {
            field,
            limit: MAX_PAYLOAD_BYTES,
            actual: value.len(),
        });
    }
    Ok(())
}

/// Aggregated result of a non-streaming execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: i64,
}

impl ExecutionResponse {
    /// Check if the program exited with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Deployment-wide limits applied to every sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Wall clock bound on a single execution in seconds
    ///
    /// Covers sandbox start, output relay and the exit wait. Creating the
    /// sandbox is bounded separately by the Docker client's request timeout
    /// (120 s), so a run can overshoot this bound by at most that much.
    pub timeout_secs: f64,

    /// Memory ceiling in mebibytes
    pub memory_limit_mb: u64,

    /// CPU time granted per `cpu_period`, in microseconds
    pub cpu_quota: i64,

    /// CFS scheduling period in microseconds
    pub cpu_period: i64,

    /// Maximum number of processes/threads
    pub max_processes: i64,

    /// Size of the writable `/tmp` scratch mount in mebibytes
    pub scratch_size_mb: u64,

    /// Unprivileged user the program runs as
    pub run_as: String,

    /// Ceiling on relayed stdout + stderr bytes
    pub max_output_bytes: usize,
}

impl SandboxLimits {
    /// 1 mebibyte in bytes
    pub const MIB: i64 = 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution timeout in seconds
    pub fn with_timeout_secs(mut self, seconds: f64) -> Self {
        self.timeout_secs = seconds;
        self
    }

    /// Set the memory ceiling in mebibytes
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Set the output ceiling in bytes
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_limit_mb as i64 * Self::MIB
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            memory_limit_mb: 128,
            cpu_quota: 50_000, // half of one core
            cpu_period: 100_000,
            max_processes: 16,
            scratch_size_mb: 10,
            run_as: "nobody".to_owned(),
            max_output_bytes: 65_536,
        }
    }
}

/// Per-client admission throttle settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per client within one window
    pub max_requests: usize,

    /// Sliding window length in seconds
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

/// Streaming dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of executions allowed to run at once
    pub workers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}
