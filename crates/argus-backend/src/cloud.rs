//! Cloud HTTP backend: submits frames as inference tasks and polls them.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;

use argus_formats::native::PredictionRecord;

use crate::{Backend, BackendError, InferError, PendingReply, PendingResult};

pub const APP_ID_VAR: &str = "ARGUS_APP_ID";
pub const API_KEY_VAR: &str = "ARGUS_API_KEY";
pub const API_URL_VAR: &str = "ARGUS_API_URL";
const DEFAULT_API_URL: &str = "https://api.argus.vision/v0.7";

/// Submission retry policy for transient failures (5xx, connection resets).
pub const API_MAX_RETRY: usize = 5;
pub const API_RETRY_SLEEP: Duration = Duration::from_millis(200);

/// Interval between task polls while waiting for a result.
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct CloudBackend {
    client: reqwest::Client,
    base_url: String,
    recognition_id: String,
    app_id: String,
    api_key: String,
}

#[derive(Deserialize)]
struct TaskCreated {
    task_id: serde_json::Value,
}

#[derive(Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<PredictionRecord>,
}

impl CloudBackend {
    /// Build a cloud backend from environment credentials. Their absence is
    /// fatal to the run.
    pub fn from_env(recognition_id: &str) -> Result<Self, BackendError> {
        let app_id = std::env::var(APP_ID_VAR).ok();
        let api_key = std::env::var(API_KEY_VAR).ok();
        let (app_id, api_key) = match (app_id, api_key) {
            (Some(a), Some(k)) => (a, k),
            _ => {
                return Err(BackendError::Credentials(format!(
                    "define the {APP_ID_VAR} and {API_KEY_VAR} environment variables \
                     to use cloud recognition models"
                )))
            }
        };

        let base_url =
            std::env::var(API_URL_VAR).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let client = reqwest::Client::builder()
            .user_agent(concat!("argus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            recognition_id: recognition_id.to_string(),
            app_id,
            api_key,
        })
    }

    fn inference_url(&self) -> String {
        format!(
            "{}/recognition/{}/inference",
            self.base_url, self.recognition_id
        )
    }

    fn task_url(&self, task_id: &str) -> String {
        format!("{}/tasks/{}", self.base_url, task_id)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("X-APP-ID", &self.app_id)
            .header("X-API-KEY", &self.api_key)
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

#[async_trait]
impl Backend for CloudBackend {
    async fn infer(&self, image: Bytes, _frame_name: &str) -> Result<PendingResult, BackendError> {
        let body = serde_json::json!({
            "inputs": [{
                "image": {
                    "binary": base64::engine::general_purpose::STANDARD.encode(&image),
                    "encoding": "binary",
                }
            }],
            "show_discarded": true,
            "wait_task": false,
        });

        let url = self.inference_url();
        for attempt in 1..=API_MAX_RETRY {
            let result = self
                .authed(self.client.post(&url))
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_server_error() => {
                    tracing::warn!(
                        status = %resp.status(),
                        attempt,
                        max = API_MAX_RETRY,
                        "inference API returned a server error"
                    );
                }
                Ok(resp) => {
                    let resp = resp.error_for_status().map_err(|e| {
                        BackendError::Transport(format!("inference request rejected: {e}"))
                    })?;
                    let created: TaskCreated = resp.json().await.map_err(|e| {
                        BackendError::Transport(format!("unreadable task response: {e}"))
                    })?;
                    let task_id = match &created.task_id {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    return Ok(PendingResult::new(CloudPending {
                        client: self.client.clone(),
                        url: self.task_url(&task_id),
                        app_id: self.app_id.clone(),
                        api_key: self.api_key.clone(),
                    }));
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(attempt, max = API_MAX_RETRY, "inference request failed: {e}");
                }
                Err(e) => return Err(BackendError::Transport(e.to_string())),
            }

            if attempt < API_MAX_RETRY {
                tokio::time::sleep(API_RETRY_SLEEP).await;
            }
        }
        Err(BackendError::Transport(format!(
            "inference request failed after {API_MAX_RETRY} attempts"
        )))
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

struct CloudPending {
    client: reqwest::Client,
    url: String,
    app_id: String,
    api_key: String,
}

#[async_trait]
impl PendingReply for CloudPending {
    async fn wait(self: Box<Self>, timeout: Duration) -> Result<PredictionRecord, InferError> {
        let deadline = Instant::now() + timeout;
        loop {
            let result = self
                .client
                .get(&self.url)
                .header("X-APP-ID", &self.app_id)
                .header("X-API-KEY", &self.api_key)
                .send()
                .await;

            match result {
                Ok(resp) => match resp.json::<TaskStatus>().await {
                    Ok(task) => match task.status.as_str() {
                        "success" => {
                            return task.data.ok_or_else(|| InferError::Failed {
                                code: "empty".into(),
                                message: "task succeeded without data".into(),
                            })
                        }
                        "error" => {
                            return Err(InferError::Failed {
                                code: "task_error".into(),
                                message: task.error.unwrap_or_else(|| "unknown".into()),
                            })
                        }
                        _ => {}
                    },
                    Err(e) => tracing::debug!("unreadable task status, retrying: {e}"),
                },
                Err(e) => tracing::debug!("task poll failed, retrying: {e}"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(InferError::Timeout(timeout));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests touching process environment serialize on this lock.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env<T>(f: impl FnOnce() -> T) -> T {
        std::env::set_var(APP_ID_VAR, "app");
        std::env::set_var(API_KEY_VAR, "key");
        let out = f();
        std::env::remove_var(APP_ID_VAR);
        std::env::remove_var(API_KEY_VAR);
        out
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(APP_ID_VAR);
        std::env::remove_var(API_KEY_VAR);
        let err = CloudBackend::from_env("123").unwrap_err();
        assert!(matches!(err, BackendError::Credentials(_)));
    }

    #[test]
    fn urls_are_derived_from_the_recognition_id() {
        let _guard = ENV_LOCK.lock().unwrap();
        let backend = with_env(|| CloudBackend::from_env("123").unwrap());
        assert!(backend.inference_url().ends_with("/recognition/123/inference"));
        assert!(backend.task_url("t9").ends_with("/tasks/t9"));
    }

    #[test]
    fn task_status_parses_both_outcomes() {
        let ok: TaskStatus = serde_json::from_str(
            r#"{"status": "success", "data": {"outputs": [{"labels": {"predicted": [], "discarded": []}}]}}"#,
        )
        .unwrap();
        assert_eq!(ok.status, "success");
        assert!(ok.data.is_some());

        let err: TaskStatus =
            serde_json::from_str(r#"{"status": "error", "error": "bad model"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("bad model"));
    }
}
