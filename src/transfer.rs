//! Data staging coordination
//!
//! Each analysis in staging mode runs a sidecar that copies inputs down
//! from and outputs up to the remote store. A transfer is triggered on every
//! sidecar instance behind the job's services and each instance is polled
//! independently until it reaches a terminal state:
//!
//! ```text
//! requested -> downloading | uploading -> completed | failed
//! ```
//!
//! Progress is reported through the [`StatusNotifier`]: at most one
//! in-progress event per distinct status per instance, then one success or
//! failure event. In CSI mode there is nothing to stage and the coordinator
//! reports success immediately.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::assembler::STAGING_PORT_NAME;
use crate::backoff::{retry_with_backoff, BackoffPolicy};
use crate::cluster::{ClusterApi, ResourceKind};
use crate::http;
use crate::labels::ExternalId;
use crate::status::{JobState, StatusEvent, StatusNotifier};
use crate::Error;

/// Attempts for the initial trigger request; only connect failures are resent
pub const TRIGGER_ATTEMPTS: u32 = 3;

// =============================================================================
// Wire types
// =============================================================================

/// Direction of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    /// Remote store to analysis
    Download,
    /// Analysis to remote store
    Upload,
}

impl TransferKind {
    /// Path segment on the staging service
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::Download => "download",
            TransferKind::Upload => "upload",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by a staging instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Accepted, not started
    Requested,
    /// Download in progress
    Downloading,
    /// Upload in progress
    Uploading,
    /// Terminal failure
    Failed,
    /// Terminal success
    Completed,
}

impl TransferState {
    /// True for `failed` and `completed`
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Failed | TransferState::Completed)
    }
}

impl FromStr for TransferState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(TransferState::Requested),
            "downloading" => Ok(TransferState::Downloading),
            "uploading" => Ok(TransferState::Uploading),
            "failed" => Ok(TransferState::Failed),
            "completed" => Ok(TransferState::Completed),
            other => Err(Error::validation(format!(
                "unknown transfer status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferState::Requested => "requested",
            TransferState::Downloading => "downloading",
            TransferState::Uploading => "uploading",
            TransferState::Failed => "failed",
            TransferState::Completed => "completed",
        })
    }
}

/// Body returned by both the trigger and the status endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    /// Opaque transfer id
    pub uuid: String,
    /// Raw status string
    pub status: String,
    /// `download` or `upload`
    #[serde(default)]
    pub kind: String,
}

impl TransferStatus {
    /// Parsed status; unknown strings are an error
    pub fn state(&self) -> Result<TransferState, Error> {
        self.status.parse()
    }
}

// =============================================================================
// Staging client
// =============================================================================

/// Client for one staging sidecar API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StagingClient: Send + Sync {
    /// `POST <base>/<kind>`
    async fn start(&self, base_url: &str, kind: TransferKind) -> Result<TransferStatus, Error>;

    /// `GET <base>/<kind>/<uuid>`
    async fn status(
        &self,
        base_url: &str,
        kind: TransferKind,
        uuid: &str,
    ) -> Result<TransferStatus, Error>;
}

/// HTTP implementation of [`StagingClient`].
#[derive(Clone)]
pub struct HttpStagingClient {
    client: reqwest::Client,
}

impl Default for HttpStagingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpStagingClient {
    /// Client with the default request timeout
    pub fn new() -> Self {
        Self {
            client: http::client(),
        }
    }

    async fn read(base_url: &str, response: reqwest::Response) -> Result<TransferStatus, Error> {
        if !response.status().is_success() {
            return Err(Error::staging(base_url, http::error_message(response).await));
        }
        Ok(response.json::<TransferStatus>().await?)
    }
}

#[async_trait]
impl StagingClient for HttpStagingClient {
    async fn start(&self, base_url: &str, kind: TransferKind) -> Result<TransferStatus, Error> {
        let url = http::endpoint(base_url, &[kind.as_str()])?;
        let response = self.client.post(url).send().await?;
        Self::read(base_url, response).await
    }

    async fn status(
        &self,
        base_url: &str,
        kind: TransferKind,
        uuid: &str,
    ) -> Result<TransferStatus, Error> {
        let url = http::endpoint(base_url, &[kind.as_str(), uuid])?;
        let response = self.client.get(url).send().await?;
        Self::read(base_url, response).await
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Poll loop tuning.
#[derive(Clone, Debug)]
pub struct TransferSettings {
    /// Delay between status checks
    pub poll_interval: Duration,
    /// Status checks per instance before giving up (0 = unlimited)
    pub max_attempts: u32,
    /// Retry policy for the trigger request
    pub trigger_retry: BackoffPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 0,
            trigger_retry: BackoffPolicy::bounded(TRIGGER_ATTEMPTS),
        }
    }
}

/// How one instance finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum InstanceOutcome {
    /// Staging reported `completed`
    Completed,
    /// Staging reported `failed`
    Failed {
        /// Detail for the operator
        message: String,
    },
    /// Trigger or poll error, unknown status, or attempts exhausted
    Error {
        /// Detail for the operator
        message: String,
    },
    /// Cancelled before reaching a terminal state
    Cancelled,
}

/// Per-instance results of one transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Direction
    pub kind: TransferKind,
    /// `(instance base URL, outcome)`; empty in CSI mode
    pub instances: Vec<(String, InstanceOutcome)>,
}

impl TransferReport {
    /// True when every instance completed
    pub fn succeeded(&self) -> bool {
        self.instances
            .iter()
            .all(|(_, o)| *o == InstanceOutcome::Completed)
    }
}

/// Triggers and polls staging instances.
#[derive(Clone)]
pub struct TransferCoordinator {
    cluster: Arc<dyn ClusterApi>,
    staging: Arc<dyn StagingClient>,
    notifier: Arc<dyn StatusNotifier>,
    settings: TransferSettings,
    namespace: String,
    use_csi: bool,
}

impl TransferCoordinator {
    /// Create a coordinator for the given namespace and staging mode
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        staging: Arc<dyn StagingClient>,
        notifier: Arc<dyn StatusNotifier>,
        settings: TransferSettings,
        namespace: impl Into<String>,
        use_csi: bool,
    ) -> Self {
        Self {
            cluster,
            staging,
            notifier,
            settings,
            namespace: namespace.into(),
            use_csi,
        }
    }

    /// Base URLs of every staging instance behind the job's services.
    pub async fn instances(&self, id: &ExternalId) -> Result<Vec<String>, Error> {
        let services = self.cluster.list(ResourceKind::Service, &id.selector()).await?;

        let mut urls = Vec::new();
        for svc in &services {
            let port = svc
                .data
                .pointer("/spec/ports")
                .and_then(|p| p.as_array())
                .and_then(|ports| {
                    ports
                        .iter()
                        .find(|p| p.get("name").and_then(|n| n.as_str()) == Some(STAGING_PORT_NAME))
                })
                .and_then(|p| p.get("port"))
                .and_then(|p| p.as_i64());

            if let Some(port) = port {
                urls.push(format!("http://{}.{}:{}", svc.name_any(), self.namespace, port));
            }
        }
        Ok(urls)
    }

    /// Run a transfer on every instance and wait for all of them.
    ///
    /// Returns an error only when the instances cannot be determined;
    /// per-instance problems are in the report.
    #[instrument(skip(self, cancel), fields(external_id = %id))]
    pub async fn transfer(
        &self,
        id: &ExternalId,
        kind: TransferKind,
        cancel: CancellationToken,
    ) -> Result<TransferReport, Error> {
        if self.use_csi {
            self.notify(id, JobState::Running, success_message(kind)).await;
            return Ok(TransferReport {
                kind,
                instances: Vec::new(),
            });
        }

        let instances = self.instances(id).await?;
        if instances.is_empty() {
            let message = format!("no staging service found for analysis {}", id);
            self.notify(id, JobState::Failed, message.clone()).await;
            return Err(Error::not_found(message));
        }
        info!(kind = %kind, instances = instances.len(), "Starting transfer");

        let mut tasks = JoinSet::new();
        for (index, base_url) in instances.iter().enumerate() {
            let this = self.clone();
            let id = id.clone();
            let base_url = base_url.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = this.run_instance(&id, &base_url, kind, cancel).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<InstanceOutcome>> = vec![None; instances.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Transfer task aborted"),
            }
        }

        let report = TransferReport {
            kind,
            instances: instances
                .into_iter()
                .zip(outcomes)
                .map(|(url, outcome)| {
                    let outcome = outcome.unwrap_or_else(|| InstanceOutcome::Error {
                        message: "transfer task aborted".to_string(),
                    });
                    (url, outcome)
                })
                .collect(),
        };
        info!(kind = %kind, succeeded = report.succeeded(), "Transfer finished");
        Ok(report)
    }

    /// State machine for one instance.
    async fn run_instance(
        &self,
        id: &ExternalId,
        base_url: &str,
        kind: TransferKind,
        cancel: CancellationToken,
    ) -> InstanceOutcome {
        let staging = self.staging.clone();
        let started = retry_with_backoff(
            &self.settings.trigger_retry,
            "start transfer",
            Error::is_connect_failure,
            || {
                let staging = staging.clone();
                async move { staging.start(base_url, kind).await }
            },
        )
        .await;

        let mut current = match started {
            Ok(status) => status,
            Err(e) => return self.fail_instance(id, base_url, kind, e.to_string()).await,
        };

        let mut seen = HashSet::new();
        let mut first = true;
        let mut checks: u32 = 0;

        loop {
            let state = match current.state() {
                Ok(state) => state,
                Err(e) => return self.fail_instance(id, base_url, kind, e.to_string()).await,
            };
            debug!(instance = %base_url, uuid = %current.uuid, state = %state, "Transfer status");

            match state {
                TransferState::Failed => {
                    let message = format!("{} failed on {}", kind, base_url);
                    self.notify(id, JobState::Failed, message.clone()).await;
                    return InstanceOutcome::Failed { message };
                }
                TransferState::Completed => {
                    self.notify(id, JobState::Running, success_message(kind)).await;
                    return InstanceOutcome::Completed;
                }
                TransferState::Requested | TransferState::Downloading | TransferState::Uploading => {
                    if seen.insert(state) && !first {
                        self.notify(id, JobState::Running, progress_message(kind, state))
                            .await;
                    }
                }
            }
            first = false;

            checks += 1;
            if self.settings.max_attempts > 0 && checks > self.settings.max_attempts {
                let message = format!(
                    "gave up after {} status checks (last status {})",
                    self.settings.max_attempts, state
                );
                return self.fail_instance(id, base_url, kind, message).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(instance = %base_url, "Transfer polling cancelled");
                    return InstanceOutcome::Cancelled;
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            current = match self.staging.status(base_url, kind, &current.uuid).await {
                Ok(status) => status,
                Err(e) => return self.fail_instance(id, base_url, kind, e.to_string()).await,
            };
        }
    }

    async fn fail_instance(
        &self,
        id: &ExternalId,
        base_url: &str,
        kind: TransferKind,
        detail: String,
    ) -> InstanceOutcome {
        warn!(instance = %base_url, kind = %kind, error = %detail, "Transfer failed");
        let message = format!("{} error on {}: {}", kind, base_url, detail);
        self.notify(id, JobState::Failed, message.clone()).await;
        InstanceOutcome::Error { message }
    }

    async fn notify(&self, id: &ExternalId, state: JobState, message: String) {
        self.notifier
            .notify(StatusEvent::new(id.as_str(), state, message))
            .await;
    }
}

fn success_message(kind: TransferKind) -> String {
    match kind {
        TransferKind::Download => "input files downloaded".to_string(),
        TransferKind::Upload => "output files uploaded".to_string(),
    }
}

fn progress_message(kind: TransferKind, state: TransferState) -> String {
    format!("file {}: {}", kind, state)
}
