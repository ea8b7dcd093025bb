//! Sandbox description builder
//!
//! Builds the fully-resolved description of one sandbox. The hardening
//! settings (no network, read-only root, dropped capabilities, unprivileged
//! user, process ceiling) are applied by [`SandboxSpecBuilder::build`] and
//! cannot be switched off by callers.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::config::Language;
use crate::types::{ExecutionRequest, SandboxLimits};

/// Writable scratch mount the program's files are decoded into
pub const SCRATCH_DIR: &str = "/tmp";

/// Environment variable carrying the base64-encoded source code
pub const CODE_ENV: &str = "CODE_B64";

/// Environment variable carrying the base64-encoded stdin
pub const STDIN_ENV: &str = "STDIN_B64";

/// Label set on every sandbox this crate creates
pub const MANAGED_LABEL: &str = "snipbox.managed";

const STDIN_FILE: &str = "stdin.txt";
const NETWORK_NONE: &str = "none";
const CAP_ALL: &str = "ALL";

/// Fully-resolved description of one sandbox instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    image: String,
    env: Vec<String>,
    command: Vec<String>,
    labels: HashMap<String, String>,
    memory_bytes: i64,
    cpu_quota: i64,
    cpu_period: i64,
    max_processes: i64,
    scratch_size_mb: u64,
    user: String,
}

impl SandboxSpec {
    pub fn builder(image: impl Into<String>) -> SandboxSpecBuilder {
        SandboxSpecBuilder::new(image)
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Injected environment as `KEY=VALUE`
    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Entry command
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_bytes
    }

    pub fn cpu_quota(&self) -> i64 {
        self.cpu_quota
    }

    pub fn cpu_period(&self) -> i64 {
        self.cpu_period
    }

    pub fn max_processes(&self) -> i64 {
        self.max_processes
    }

    /// Run-as identity
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Network mode; always isolated
    pub fn network_mode(&self) -> &'static str {
        NETWORK_NONE
    }

    /// Whether the root filesystem is mounted read-only; always true
    pub fn read_only_root(&self) -> bool {
        true
    }

    /// Capabilities dropped from the sandbox; always all of them
    pub fn dropped_capabilities(&self) -> &'static [&'static str] {
        &[CAP_ALL]
    }

    /// Scratch mount point and its tmpfs options
    pub fn scratch_mount(&self) -> (&'static str, String) {
        (
            SCRATCH_DIR,
            format!("rw,noexec,nosuid,size={}m", self.scratch_size_mb),
        )
    }
}

/// Builder for [`SandboxSpec`]
#[derive(Debug)]
pub struct SandboxSpecBuilder {
    image: String,
    env: Vec<String>,
    command: Vec<String>,
    labels: HashMap<String, String>,
    limits: SandboxLimits,
}

impl SandboxSpecBuilder {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: Vec::new(),
            command: Vec::new(),
            labels: HashMap::new(),
            limits: SandboxLimits::default(),
        }
    }

    /// Set an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Add `KEY=VALUE` environment entries
    pub fn envs(mut self, vars: impl IntoIterator<Item = String>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Set the command to run
    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set resource limits
    pub fn limits(mut self, limits: &SandboxLimits) -> Self {
        self.limits = limits.clone();
        self
    }

    pub fn build(self) -> SandboxSpec {
        let mut labels = self.labels;
        labels.insert(MANAGED_LABEL.to_owned(), "true".to_owned());

        SandboxSpec {
            image: self.image,
            env: self.env,
            command: self.command,
            labels,
            memory_bytes: self.limits.memory_bytes(),
            cpu_quota: self.limits.cpu_quota,
            cpu_period: self.limits.cpu_period,
            max_processes: self.limits.max_processes,
            scratch_size_mb: self.limits.scratch_size_mb,
            user: self.limits.run_as,
        }
    }
}

/// Describe the sandbox that runs `request` with the given language profile
///
/// Code and stdin travel base64-encoded through the environment and are
/// decoded into the scratch area by the entry script, so neither is ever
/// interpreted by the shell.
pub fn for_execution(
    language: &Language,
    request: &ExecutionRequest,
    limits: &SandboxLimits,
) -> SandboxSpec {
    let source_path = format!("{SCRATCH_DIR}/{}", language.source_name());
    let stdin_path = format!("{SCRATCH_DIR}/{STDIN_FILE}");

    let interpreter = Language::expand_command(&language.run.command, &source_path)
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");

    let script = format!(
        "printf '%s' \"${CODE_ENV}\" | base64 -d > {source} \
         && printf '%s' \"${STDIN_ENV}\" | base64 -d > {stdin} \
         && exec {interpreter} < {stdin}",
        source = shell_quote(&source_path),
        stdin = shell_quote(&stdin_path),
    );

    SandboxSpec::builder(&language.image)
        .env(CODE_ENV, &STANDARD.encode(request.code.as_bytes()))
        .env(STDIN_ENV, &STANDARD.encode(request.stdin_or_empty().as_bytes()))
        .envs(language.run.env.iter().cloned())
        .command(["sh", "-c", script.as_str()])
        .limits(limits)
        .build()
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
