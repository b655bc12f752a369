//! Status events sent to the job-status tracker
//!
//! Delivery is best-effort: a [`StatusNotifier`] never returns an error, it
//! logs and moves on. Consumers treat repeated events as idempotent.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::http;

/// Coarse job state understood by the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Workload exists (also used for transfer progress)
    Running,
    /// Workload deleted
    Succeeded,
    /// Something went wrong
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        })
    }
}

/// One status message for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    /// Invocation id
    pub job_id: String,
    /// Coarse state
    pub state: JobState,
    /// Human-readable detail
    pub message: String,
}

impl StatusEvent {
    /// Build an event
    pub fn new(job_id: impl Into<String>, state: JobState, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            message: message.into(),
        }
    }
}

/// Sink for status events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    /// Deliver `event`; failures are logged, never returned
    async fn notify(&self, event: StatusEvent);
}

#[derive(Serialize)]
struct StatusBody<'a> {
    host: &'a str,
    state: JobState,
    message: &'a str,
}

/// Posts events to `<base>/<job-id>/status`.
#[derive(Clone)]
pub struct HttpStatusPublisher {
    base_url: String,
    host: String,
    client: reqwest::Client,
}

impl HttpStatusPublisher {
    /// Publisher reporting as `host`
    pub fn new(base_url: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            host: host.into(),
            client: http::client(),
        }
    }

    async fn send(&self, event: &StatusEvent) -> Result<(), crate::Error> {
        let url = http::endpoint(&self.base_url, &[&event.job_id, "status"])?;
        let response = self
            .client
            .post(url)
            .json(&StatusBody {
                host: &self.host,
                state: event.state,
                message: &event.message,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::Error::internal(format!(
                "status tracker rejected update: {}",
                http::error_message(response).await
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusNotifier for HttpStatusPublisher {
    async fn notify(&self, event: StatusEvent) {
        match self.send(&event).await {
            Ok(()) => debug!(
                external_id = %event.job_id,
                state = %event.state,
                message = %event.message,
                "Published status"
            ),
            Err(e) => warn!(
                external_id = %event.job_id,
                state = %event.state,
                error = %e,
                "Failed to publish status"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every event it receives
    #[derive(Clone, Default)]
    pub(crate) struct StatusCapture {
        events: Arc<Mutex<Vec<StatusEvent>>>,
    }

    impl StatusCapture {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn events(&self) -> Vec<StatusEvent> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn states(&self) -> Vec<JobState> {
            self.events().into_iter().map(|e| e.state).collect()
        }
    }

    #[async_trait]
    impl StatusNotifier for StatusCapture {
        async fn notify(&self, event: StatusEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::spawn;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    type Received = Arc<Mutex<Vec<(String, Value)>>>;

    #[tokio::test]
    async fn test_publisher_posts_host_state_and_message() {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/{job}/status",
                post(
                    |State(rx): State<Received>, Path(job): Path<String>, Json(body): Json<Value>| async move {
                        rx.lock().unwrap().push((job, body));
                        axum::http::StatusCode::OK
                    },
                ),
            )
            .with_state(received.clone());
        let publisher = HttpStatusPublisher::new(spawn(app).await, "vice-node-1");

        publisher
            .notify(StatusEvent::new("abc123", JobState::Running, "deployment abc123 created"))
            .await;

        let got = received.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "abc123");
        assert_eq!(got[0].1["host"], "vice-node-1");
        assert_eq!(got[0].1["state"], "running");
        assert_eq!(got[0].1["message"], "deployment abc123 created");
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        // Nothing listens on this port; notify must still return.
        let publisher = HttpStatusPublisher::new("http://127.0.0.1:9", "vice");
        publisher
            .notify(StatusEvent::new("abc123", JobState::Failed, "boom"))
            .await;
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_value(JobState::Succeeded).unwrap(), "succeeded");
        assert_eq!(JobState::Failed.to_string(), "failed");
    }
}
