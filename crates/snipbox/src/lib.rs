//! A library for running untrusted code snippets in throwaway containers.
//!
//! Snipbox takes a (code, language, stdin) request, runs it in a hardened
//! Docker container and reports the output as a stream of frames or as one
//! aggregated response. Admission control in front of the engine bounds how
//! often a client may submit and how many executions run at once.
//!
//! # Features
//!
//! - **Hardened sandboxes**: no network, read-only root, dropped capabilities, process/memory/CPU ceilings.
//! - **Guaranteed cleanup**: every sandbox is force-removed, whatever the outcome.
//! - **Bounded output**: relayed output is capped and followed by a truncation notice.
//! - **Streaming frames**: stdout/stderr/exit/error frames over a channel.
//! - **Admission control**: per-client sliding-window rate limiting and per-session exclusivity.
//! - **TOML configuration**: language registry and limits, overridable from the environment.

pub use admission::{
    AdmissionError, RateLimiter, SessionGuard, SessionKey, SessionLease, client_identity,
};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use runner::{Engine, ExecutionError, FrameCollector, FrameSink, OutputFrame};
pub use sandbox::{DockerRuntime, SandboxError, SandboxRuntime, SandboxSpec};
pub use service::ExecutionService;
pub use types::{
    ExecutionRequest, ExecutionResponse, RateLimitConfig, SandboxLimits, SessionConfig,
    StreamRequest, ValidationError,
};

pub mod admission;
pub mod config;
pub mod runner;
pub mod sandbox;
pub mod service;
pub mod types;
