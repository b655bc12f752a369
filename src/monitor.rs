//! Deployment watch and status propagation
//!
//! Watches interactive deployments and turns cluster changes into status
//! events: creation and updates report `running`, deletion reports
//! `succeeded`. Updates on deployments that are already being deleted are
//! suppressed. After every relist the tracker reports deployments that
//! vanished while the watch was down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher::{self, Event};
use kube::{Api, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::labels::{ExternalId, Selector};
use crate::status::{JobState, StatusEvent, StatusNotifier};

/// Longest delay between watch restarts
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

// =============================================================================
// Tracker
// =============================================================================

/// Turns watch events into status events.
///
/// Keeps the set of deployments it has announced so a relist can detect
/// deletions that happened while the watch was down.
#[derive(Debug, Default)]
pub struct DeploymentTracker {
    /// deployment name -> job id
    known: HashMap<String, String>,
    /// names seen since the current relist started
    relisted: Option<HashSet<String>>,
}

impl DeploymentTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deployments currently tracked
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Process one watch event.
    pub fn handle(&mut self, event: Event<Deployment>) -> Vec<StatusEvent> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(deployment) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(deployment.name_any());
                }
                self.applied(&deployment).into_iter().collect()
            }
            Event::InitDone => {
                let Some(seen) = self.relisted.take() else {
                    return Vec::new();
                };
                let vanished: Vec<String> = self
                    .known
                    .keys()
                    .filter(|name| !seen.contains(*name))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|name| {
                        let job_id = self.known.remove(&name)?;
                        Some(deleted_event(job_id, &name))
                    })
                    .collect()
            }
            Event::Apply(deployment) => self.applied(&deployment).into_iter().collect(),
            Event::Delete(deployment) => {
                let name = deployment.name_any();
                self.known.remove(&name);
                vec![deleted_event(job_id(&deployment), &name)]
            }
        }
    }

    fn applied(&mut self, deployment: &Deployment) -> Option<StatusEvent> {
        let name = deployment.name_any();
        let job_id = job_id(deployment);

        if deployment.metadata.deletion_timestamp.is_some() {
            debug!(deployment = %name, "Suppressing update for deployment being deleted");
            return None;
        }

        let message = if self.known.insert(name.clone(), job_id.clone()).is_none() {
            format!("deployment {} created", name)
        } else {
            replica_message(&name, deployment)
        };
        Some(StatusEvent::new(job_id, JobState::Running, message))
    }
}

fn deleted_event(job_id: String, name: &str) -> StatusEvent {
    StatusEvent::new(
        job_id,
        JobState::Succeeded,
        format!("deployment {} deleted", name),
    )
}

fn job_id(deployment: &Deployment) -> String {
    ExternalId::from_labels(deployment.labels())
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| deployment.name_any())
}

fn replica_message(name: &str, deployment: &Deployment) -> String {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0);
    let status = deployment.status.clone().unwrap_or_default();
    format!(
        "deployment {} updated: desired {}, ready {}, available {}, unavailable {}",
        name,
        desired,
        status.ready_replicas.unwrap_or(0),
        status.available_replicas.unwrap_or(0),
        status.unavailable_replicas.unwrap_or(0),
    )
}

// =============================================================================
// Monitor
// =============================================================================

/// How a watch stream stopped.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// Shutdown was requested
    Shutdown,
    /// The stream ended or errored and should be restarted
    Restart,
}

/// Long-running deployment watch.
pub struct EventMonitor {
    api: Api<Deployment>,
    notifier: Arc<dyn StatusNotifier>,
    restart_delay: Duration,
}

impl EventMonitor {
    /// Watch deployments through `api` (scoped to the managed namespace)
    pub fn new(
        api: Api<Deployment>,
        notifier: Arc<dyn StatusNotifier>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            api,
            notifier,
            restart_delay,
        }
    }

    /// Run until `shutdown` fires, restarting the watch whenever it ends.
    pub async fn run(self, shutdown: CancellationToken) {
        let selector = Selector::interactive().to_string();
        let mut tracker = DeploymentTracker::new();
        let mut backoff = Backoff::new(BackoffPolicy {
            max_attempts: 0,
            initial_delay: self.restart_delay,
            max_delay: MAX_RESTART_DELAY,
            multiplier: 2.0,
        });

        info!(selector = %selector, "Deployment monitor started");
        loop {
            let stream = watcher::watcher(
                self.api.clone(),
                watcher::Config::default().labels(&selector),
            );

            let end = drive_events(
                self.notifier.as_ref(),
                &mut tracker,
                stream,
                &shutdown,
                &mut backoff,
            )
            .await;
            if end == StreamEnd::Shutdown {
                break;
            }

            let delay = backoff.next_delay().unwrap_or(self.restart_delay);
            warn!(delay_ms = delay.as_millis() as u64, "Deployment watch ended, restarting");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Deployment monitor stopped");
    }
}

/// Consume one watch stream, publishing status events as they arrive.
async fn drive_events<S>(
    notifier: &dyn StatusNotifier,
    tracker: &mut DeploymentTracker,
    stream: S,
    shutdown: &CancellationToken,
    backoff: &mut Backoff,
) -> StreamEnd
where
    S: Stream<Item = Result<Event<Deployment>, watcher::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return StreamEnd::Shutdown,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                backoff.reset();
                for status in tracker.handle(event) {
                    notifier.notify(status).await;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Deployment watch error");
                return StreamEnd::Restart;
            }
            None => return StreamEnd::Restart,
        }
    }
}
