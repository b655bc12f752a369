//! Per-user concurrency limit
//!
//! A user may have at most `limit` interactive analyses that are not yet
//! finished. Deployments are the source of truth for "exists"; the tracking
//! store decides "finished". Anything that cannot be classified counts
//! against the user.

use std::sync::Arc;

use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{labels_of, ClusterApi, ResourceKind};
use crate::labels::{username_label, ExternalId, Selector, LABEL_USERNAME};
use crate::lookup::AnalysisLookup;
use crate::Error;

/// Tracked statuses that no longer count toward the limit
pub const STOP_STATUSES: [&str; 3] = ["Completed", "Failed", "Canceled"];

/// Outcome of an admission check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    /// Slugified username the check ran for
    pub username: String,
    /// Analyses counted against the user
    pub running: usize,
    /// Effective limit
    pub limit: i64,
}

impl AdmissionDecision {
    /// True when another launch is allowed
    pub fn allowed(&self) -> bool {
        (self.running as i64) < self.limit
    }

    fn into_result(self) -> Result<Self, Error> {
        if self.allowed() {
            return Ok(self);
        }
        if self.limit <= 0 {
            return Err(Error::admission(format!(
                "launching interactive analyses is disabled for {}",
                self.username
            )));
        }
        Err(Error::admission(format!(
            "{} already has {} running interactive analyses (limit {})",
            self.username, self.running, self.limit
        )))
    }
}

/// Pre-launch gate.
pub struct AdmissionControl {
    cluster: Arc<dyn ClusterApi>,
    lookup: Arc<dyn AnalysisLookup>,
    default_limit: i64,
    user_suffix: String,
}

impl AdmissionControl {
    /// Create the gate; `default_limit` applies when the store has none
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        lookup: Arc<dyn AnalysisLookup>,
        default_limit: i64,
        user_suffix: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            lookup,
            default_limit,
            user_suffix: user_suffix.into(),
        }
    }

    /// Effective limit: user override, then store default, then config.
    async fn limit_for(&self, username: &str) -> Result<i64, Error> {
        if let Some(limit) = self.lookup.user_job_limit(username).await? {
            return Ok(limit);
        }
        Ok(self
            .lookup
            .default_job_limit()
            .await?
            .unwrap_or(self.default_limit))
    }

    /// Count the user's unfinished interactive deployments.
    async fn count_running(&self, user_label: &str) -> Result<usize, Error> {
        let selector = Selector::interactive().eq(LABEL_USERNAME, user_label);
        let deployments = self.cluster.list(ResourceKind::Deployment, &selector).await?;

        let mut running = 0;
        for deployment in &deployments {
            let Some(id) = ExternalId::from_labels(&labels_of(deployment)) else {
                warn!(
                    deployment = %deployment.name_any(),
                    "Deployment has no external-id label, counting it"
                );
                running += 1;
                continue;
            };

            match self.lookup.analysis_status(&id).await {
                Ok(status) if STOP_STATUSES.contains(&status.as_str()) => {
                    debug!(external_id = %id, status = %status, "Not counting finished analysis");
                }
                Ok(_) => running += 1,
                Err(e) => {
                    warn!(external_id = %id, error = %e, "Status lookup failed, counting analysis");
                    running += 1;
                }
            }
        }
        Ok(running)
    }

    /// Evaluate the limit without rejecting.
    pub async fn evaluate(&self, username: &str) -> Result<AdmissionDecision, Error> {
        let user_label = username_label(username, &self.user_suffix);
        let limit = self.limit_for(username).await?;
        let running = self.count_running(&user_label).await?;
        Ok(AdmissionDecision {
            username: user_label,
            running,
            limit,
        })
    }

    /// Reject with [`Error::Admission`] when the user is at their limit.
    #[instrument(skip(self))]
    pub async fn check(&self, username: &str) -> Result<AdmissionDecision, Error> {
        let decision = self.evaluate(username).await?.into_result();
        match &decision {
            Ok(d) => debug!(running = d.running, limit = d.limit, "Admission granted"),
            Err(e) => info!(error = %e, "Admission rejected"),
        }
        decision
    }
}
