//! Scoped ownership of a live sandbox

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::sandbox::{SandboxError, SandboxHandle, SandboxRuntime};

/// Owns a created sandbox until it is removed
///
/// Call [`release()`](Self::release) on every path once the sandbox is no
/// longer needed. If the guard is dropped without being released (a panic or
/// a cancelled future), removal is spawned onto the current Tokio runtime as a
/// best-effort fallback.
#[derive(Debug)]
pub struct SandboxGuard {
    runtime: Arc<dyn SandboxRuntime>,
    handle: SandboxHandle,
    released: bool,
}

impl SandboxGuard {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, handle: SandboxHandle) -> Self {
        Self {
            runtime,
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Force-remove the sandbox
    #[must_use = "cleanup errors should be handled"]
    #[instrument(skip(self), fields(id = self.handle.id()))]
    pub async fn release(mut self) -> Result<(), SandboxError> {
        let result = self.runtime.remove(&self.handle).await;
        // A failed removal is not retried from Drop
        self.released = true;
        if result.is_ok() {
            debug!("sandbox removed");
        }
        result
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(
            id = self.handle.id(),
            "SandboxGuard dropped without release, scheduling forced removal"
        );

        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(
                id = self.handle.id(),
                "no async runtime available, sandbox may leak"
            );
            return;
        };

        let runtime = Arc::clone(&self.runtime);
        let handle = self.handle.clone();
        rt.spawn(async move {
            match runtime.remove(&handle).await {
                Ok(()) => debug!(id = handle.id(), "best-effort removal succeeded"),
                Err(e) => warn!(id = handle.id(), error = %e, "best-effort removal failed"),
            }
        });
    }
}
