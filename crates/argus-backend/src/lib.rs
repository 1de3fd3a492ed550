// Recognition backends for argus.
//
// Every backend answers the same two-phase contract: `infer` submits an
// encoded frame and returns a PendingResult; `wait` resolves it into a
// prediction record within a deadline. Errors at wait time are uniform
// across transports so the pipeline never sees backend-specific types.
//
// - cloud.rs: HTTP inference API, task submission + polling
// - rpc.rs: AMQP worker farm, protobuf commands + correlated responses
// - replay.rs: pre-recorded prediction file, resolved at submission time

pub mod cloud;
pub mod replay;
pub mod rpc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use argus_formats::native::PredictionRecord;

/// Submission-side failures. These abort the run.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("missing credentials: {0}")]
    Credentials(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error("backend transport failure: {0}")]
    Transport(String),
}

/// Wait-side failures. These drop the affected frame and the run continues.
#[derive(Debug, Error)]
pub enum InferError {
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference failed ({code}): {message}")]
    Failed { code: String, message: String },
}

/// One-shot future behind [`PendingResult`]. Implemented per backend.
#[async_trait]
pub trait PendingReply: Send {
    async fn wait(self: Box<Self>, timeout: Duration) -> Result<PredictionRecord, InferError>;
}

/// Handle returned by [`Backend::infer`], resolved exactly once.
pub struct PendingResult {
    inner: Box<dyn PendingReply>,
}

impl PendingResult {
    pub fn new(inner: impl PendingReply + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// A result that is already known at submission time.
    pub fn ready(outcome: Result<PredictionRecord, InferError>) -> Self {
        struct Ready(Result<PredictionRecord, InferError>);

        #[async_trait]
        impl PendingReply for Ready {
            async fn wait(
                self: Box<Self>,
                _timeout: Duration,
            ) -> Result<PredictionRecord, InferError> {
                self.0
            }
        }

        Self::new(Ready(outcome))
    }

    pub async fn wait(self, timeout: Duration) -> Result<PredictionRecord, InferError> {
        self.inner.wait(timeout).await
    }
}

/// The common backend contract. Implementations must be safe for concurrent
/// `infer` calls from the sender pool; `close` is called exactly once by the
/// supervisor at shutdown.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    async fn infer(&self, image: Bytes, frame_name: &str) -> Result<PendingResult, BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}

/// Backend-relevant run options, assembled by the CLI.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub recognition_id: Option<String>,
    pub amqp_url: Option<String>,
    pub routing_key: Option<String>,
    pub from_file: Option<PathBuf>,
    /// Noop mode runs the pipeline without any backend.
    pub noop: bool,
}

/// Instantiate the backend selected by the options; `None` in noop mode.
pub async fn select_backend(
    opts: &BackendOptions,
) -> Result<Option<Arc<dyn Backend>>, BackendError> {
    if let Some(path) = &opts.from_file {
        tracing::debug!(path = %path.display(), "using file-backed predictions");
        return Ok(Some(Arc::new(replay::ReplayBackend::load(path).await?)));
    }
    if let (Some(url), Some(key)) = (&opts.amqp_url, &opts.routing_key) {
        let recognition_id = opts.recognition_id.as_deref().ok_or_else(|| {
            BackendError::Config("RPC inference needs a recognition_id".into())
        })?;
        tracing::debug!(routing_key = %key, "using RPC inference workers");
        return Ok(Some(Arc::new(
            rpc::RpcBackend::connect(url, key, recognition_id).await?,
        )));
    }
    if let Some(recognition_id) = &opts.recognition_id {
        tracing::debug!(%recognition_id, "using cloud inference API");
        return Ok(Some(Arc::new(cloud::CloudBackend::from_env(
            recognition_id,
        )?)));
    }
    if opts.noop {
        return Ok(None);
    }
    Err(BackendError::Config(
        "no backend selected: pass a recognition_id, an AMQP url with a routing key, \
         or a prediction file"
            .into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_results_resolve_immediately() {
        let pending = PendingResult::ready(Ok(PredictionRecord::empty()));
        let record = pending.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(record.outputs.len(), 1);

        let pending = PendingResult::ready(Err(InferError::Failed {
            code: "gone".into(),
            message: "no entry".into(),
        }));
        assert!(pending.wait(Duration::from_millis(1)).await.is_err());
    }

    #[tokio::test]
    async fn noop_selects_no_backend() {
        let opts = BackendOptions {
            noop: true,
            ..Default::default()
        };
        assert!(select_backend(&opts).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_selection_is_a_config_error() {
        let err = select_backend(&BackendOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }

    #[tokio::test]
    async fn rpc_without_recognition_id_is_rejected() {
        let opts = BackendOptions {
            amqp_url: Some("amqp://localhost".into()),
            routing_key: Some("workers".into()),
            ..Default::default()
        };
        let err = select_backend(&opts).await.unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }
}
