//! Entry points for transport adapters
//!
//! [`ExecutionService`] wires the engine behind admission control: both paths
//! are validated and rate limited, and the streaming path is additionally
//! serialized per session and run on the worker pool.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::admission::{AdmissionError, RateLimiter, SessionGuard, SessionKey};
use crate::config::Config;
use crate::runner::{Engine, FrameSink, OutputFrame};
use crate::sandbox::SandboxRuntime;
use crate::types::{ExecutionRequest, ExecutionResponse, StreamRequest};

#[derive(Debug, Clone)]
pub struct ExecutionService {
    engine: Engine,
    limiter: Arc<RateLimiter>,
    sessions: SessionGuard,
}

impl ExecutionService {
    pub fn new(config: impl Into<Arc<Config>>, runtime: Arc<dyn SandboxRuntime>) -> Self {
        let config = config.into();
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let sessions = SessionGuard::new(config.sessions.workers);
        Self {
            engine: Engine::new(config, runtime),
            limiter,
            sessions,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn sessions(&self) -> &SessionGuard {
        &self.sessions
    }

    /// Run a request to completion on the caller's task
    #[instrument(skip(self, request), fields(language = %request.language))]
    pub async fn execute(
        &self,
        client: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, AdmissionError> {
        request.validate()?;
        self.limiter.check(client)?;
        Ok(self.engine.execute(request).await)
    }

    /// Dispatch a session request onto the worker pool
    ///
    /// Rejections are published to `frames` as a single error frame as well as
    /// returned. On success the returned handle completes once the execution
    /// has finished and its sandbox is gone.
    #[instrument(skip(self, request, frames), fields(session = %request.session_id))]
    pub async fn execute_streaming(
        &self,
        client: &str,
        connection_id: &str,
        request: StreamRequest,
        frames: FrameSink,
    ) -> Result<JoinHandle<()>, AdmissionError> {
        if let Err(err) = self.admit_stream(client, &request) {
            debug!(%err, "stream request rejected");
            frames.emit(OutputFrame::error(err.to_string())).await;
            return Err(err);
        }

        let key = SessionKey::new(connection_id, request.session_id);
        let engine = self.engine.clone();
        let request = request.request;
        self.sessions
            .dispatch(key, frames, move |sink| async move {
                engine.execute_streaming(&request, &sink).await;
            })
            .await
    }

    fn admit_stream(&self, client: &str, request: &StreamRequest) -> Result<(), AdmissionError> {
        request.validate()?;
        self.limiter.check(client)
    }
}
