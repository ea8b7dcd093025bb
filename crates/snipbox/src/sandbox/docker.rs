//! Docker implementation of [`SandboxRuntime`]
//!
//! Thin typed wrapper over the Docker Engine API using bollard.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptions,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::stream::BoxStream;
use futures::{StreamExt, future};
use tracing::{debug, instrument, warn};

use crate::sandbox::{
    LogChunk, MANAGED_LABEL, SandboxError, SandboxHandle, SandboxRuntime, SandboxSpec,
};

/// Request timeout for the Docker client in seconds
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Sandbox runtime backed by a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon at `socket`, or the local defaults when `None`
    pub fn connect(socket: Option<&Path>) -> Result<Self, SandboxError> {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(
                &path.to_string_lossy(),
                DOCKER_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::Connect(e.to_string()))?;

        Ok(Self { docker })
    }

    /// Wrap an existing client
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Connect(e.to_string()))
    }

    /// IDs of all sandboxes created by this crate that still exist
    pub async fn list_managed(&self) -> Result<Vec<String>, SandboxError> {
        let filters = HashMap::from([(
            "label".to_owned(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| SandboxError::Request(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    /// Force-remove every leftover managed sandbox, returning how many were removed
    #[instrument(skip(self))]
    pub async fn prune(&self) -> Result<usize, SandboxError> {
        let mut removed = 0;
        for id in self.list_managed().await? {
            match self.remove(&SandboxHandle::new(id.clone())).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(id, error = %e, "failed to prune sandbox"),
            }
        }
        Ok(removed)
    }
}

/// Translate a sandbox description into a Docker create request
pub fn to_create_body(spec: &SandboxSpec) -> ContainerCreateBody {
    let (scratch_path, scratch_options) = spec.scratch_mount();

    ContainerCreateBody {
        image: Some(spec.image().to_owned()),
        env: Some(spec.env().to_vec()),
        cmd: Some(spec.command().to_vec()),
        user: Some(spec.user().to_owned()),
        labels: Some(spec.labels().clone()),
        tty: Some(false),
        attach_stdin: Some(false),
        open_stdin: Some(false),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            memory: Some(spec.memory_bytes()),
            // Equal to memory: no swap on top of the ceiling
            memory_swap: Some(spec.memory_bytes()),
            cpu_quota: Some(spec.cpu_quota()),
            cpu_period: Some(spec.cpu_period()),
            pids_limit: Some(spec.max_processes()),
            network_mode: Some(spec.network_mode().to_owned()),
            readonly_rootfs: Some(spec.read_only_root()),
            tmpfs: Some(HashMap::from([(
                scratch_path.to_owned(),
                scratch_options,
            )])),
            cap_drop: Some(
                spec.dropped_capabilities()
                    .iter()
                    .map(|cap| (*cap).to_owned())
                    .collect(),
            ),
            security_opt: Some(vec!["no-new-privileges".to_owned()]),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn exit_code(status: i64) -> i32 {
    i32::try_from(status).unwrap_or(i32::MAX)
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(image = spec.image()))]
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions>, to_create_body(spec))
            .await
            .map_err(|e| SandboxError::CreateFailed {
                image: spec.image().to_owned(),
                message: e.to_string(),
            })?;

        for warning in &response.warnings {
            warn!(id = %response.id, warning, "docker create warning");
        }
        debug!(id = %response.id, "container created");

        Ok(SandboxHandle::new(response.id))
    }

    #[instrument(skip(self), fields(id = handle.id()))]
    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container(handle.id(), None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::StartFailed {
                id: handle.id().to_owned(),
                message: e.to_string(),
            })
    }

    fn logs<'a>(
        &'a self,
        handle: &'a SandboxHandle,
    ) -> BoxStream<'a, Result<LogChunk, SandboxError>> {
        let options = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .build();

        self.docker
            .logs(handle.id(), Some(options))
            .filter_map(move |item| {
                future::ready(match item {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(LogChunk::stdout(message))),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk::stderr(message))),
                    Ok(_) => None,
                    Err(e) => Some(Err(SandboxError::LogStream {
                        id: handle.id().to_owned(),
                        message: e.to_string(),
                    })),
                })
            })
            .boxed()
    }

    #[instrument(skip(self), fields(id = handle.id()))]
    async fn wait(&self, handle: &SandboxHandle) -> Result<i32, SandboxError> {
        let mut responses = std::pin::pin!(
            self.docker
                .wait_container(handle.id(), None::<WaitContainerOptions>)
        );

        match responses.next().await {
            Some(Ok(response)) => Ok(exit_code(response.status_code)),
            // bollard reports a non-zero exit status as an error
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(exit_code(code)),
            Some(Err(e)) => Err(SandboxError::WaitFailed {
                id: handle.id().to_owned(),
                message: e.to_string(),
            }),
            None => Err(SandboxError::WaitFailed {
                id: handle.id().to_owned(),
                message: "wait stream ended without a status".to_owned(),
            }),
        }
    }

    #[instrument(skip(self), fields(id = handle.id()))]
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();

        match self
            .docker
            .remove_container(handle.id(), Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found_error(&e) => {
                debug!("container already gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::CleanupFailed {
                id: handle.id().to_owned(),
                message: e.to_string(),
            }),
        }
    }
}
