//! Request-level orchestration
//!
//! [`AnalysisManager`] sequences the components for each user-facing
//! operation: launch goes through admission, assembly and apply; exit tears
//! down by external id; save-and-exit uploads outputs under the task
//! supervisor and then tears down whatever the upload outcome was.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::admission::{AdmissionControl, AdmissionDecision};
use crate::assembler::ResourceAssembler;
use crate::cluster::{ClusterApi, KubeClusterApi};
use crate::config::ViceConfig;
use crate::job::AnalysisJob;
use crate::labels::{ExternalId, JobLabels};
use crate::lifecycle::{LifecycleManager, ResourceListing, TeardownReport};
use crate::lookup::{AnalysisLookup, HttpAnalysisLookup, HttpPermissionChecker, PermissionChecker};
use crate::relabel::{RelabelReport, Relabeler};
use crate::status::{HttpStatusPublisher, StatusNotifier};
use crate::tasks::{TaskKind, TaskRecord, TaskSupervisor};
use crate::transfer::{
    HttpStagingClient, StagingClient, TransferCoordinator, TransferKind, TransferReport,
    TransferSettings,
};
use crate::Error;

/// The external seams the manager is built from.
#[derive(Clone)]
pub struct Collaborators {
    /// Cluster object store
    pub cluster: Arc<dyn ClusterApi>,
    /// Identity, analysis and limit lookups
    pub lookup: Arc<dyn AnalysisLookup>,
    /// Per-analysis permission checks
    pub permissions: Arc<dyn PermissionChecker>,
    /// Staging sidecar API
    pub staging: Arc<dyn StagingClient>,
    /// Status tracker
    pub notifier: Arc<dyn StatusNotifier>,
}

impl Collaborators {
    /// Production collaborators: the kube client plus the HTTP services
    /// named in `config`
    pub fn connect(config: &ViceConfig, client: kube::Client) -> Self {
        Self {
            cluster: Arc::new(KubeClusterApi::new(client, config.namespace.clone())),
            lookup: Arc::new(HttpAnalysisLookup::new(config.lookup_base_url.clone())),
            permissions: Arc::new(HttpPermissionChecker::new(
                config.permissions_base_url.clone(),
            )),
            staging: Arc::new(HttpStagingClient::new()),
            notifier: Arc::new(HttpStatusPublisher::new(
                config.status_base_url.clone(),
                config.hostname.clone(),
            )),
        }
    }
}

/// What a successful launch produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchOutcome {
    /// Correlation key of the new analysis
    pub external_id: String,
    /// Ingress subdomain token
    pub subdomain: String,
    /// URL the user opens
    pub url: String,
}

/// A transfer either ran to completion or was handed to the supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransferDispatch {
    /// The caller waited for every instance
    Completed {
        /// Per-instance outcomes
        report: TransferReport,
    },
    /// Running in the background
    Detached {
        /// Supervisor task id
        task_id: Uuid,
    },
}

/// Facade over every orchestration component.
pub struct AnalysisManager {
    config: ViceConfig,
    lookup: Arc<dyn AnalysisLookup>,
    permissions: Arc<dyn PermissionChecker>,
    assembler: ResourceAssembler,
    lifecycle: Arc<LifecycleManager>,
    admission: AdmissionControl,
    transfers: TransferCoordinator,
    relabeler: Arc<Relabeler>,
    supervisor: TaskSupervisor,
}

impl AnalysisManager {
    /// Wire the components over `collaborators`
    pub fn new(config: ViceConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            cluster,
            lookup,
            permissions,
            staging,
            notifier,
        } = collaborators;

        let settings = TransferSettings {
            poll_interval: config.transfer_poll_interval(),
            max_attempts: config.transfer_max_attempts,
            ..Default::default()
        };

        Self {
            assembler: ResourceAssembler::new(config.clone()),
            lifecycle: Arc::new(LifecycleManager::new(cluster.clone())),
            admission: AdmissionControl::new(
                cluster.clone(),
                lookup.clone(),
                config.default_job_limit,
                config.user_suffix.clone(),
            ),
            transfers: TransferCoordinator::new(
                cluster.clone(),
                staging,
                notifier,
                settings,
                config.namespace.clone(),
                config.use_csi_driver,
            ),
            relabeler: Arc::new(Relabeler::new(
                cluster,
                lookup.clone(),
                config.user_suffix.clone(),
            )),
            supervisor: TaskSupervisor::new(config.task_history),
            lookup,
            permissions,
            config,
        }
    }

    /// Static configuration
    pub fn config(&self) -> &ViceConfig {
        &self.config
    }

    /// Background task registry
    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    // =========================================================================
    // Launch and exit
    // =========================================================================

    /// Admit, assemble and apply a job.
    #[instrument(skip(self, job), fields(external_id = %job.invocation_id, user = %job.submitter))]
    pub async fn launch(&self, job: &AnalysisJob) -> Result<LaunchOutcome, Error> {
        job.validate()?;
        self.admission.check(&job.submitter).await?;

        let user_id = match &job.user_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.lookup.user_id(&job.submitter).await?,
        };
        let login_ip = match self.lookup.login_ip(&job.submitter).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "Login IP lookup failed, launching without it");
                None
            }
        };

        let labels = JobLabels::for_job(job, &user_id, login_ip.as_deref(), &self.config.user_suffix)?;
        let graph = self.assembler.assemble(job, labels)?;
        self.lifecycle.apply(&graph).await?;

        let subdomain = graph.labels.subdomain.clone();
        let outcome = LaunchOutcome {
            external_id: graph.external_id().to_string(),
            url: self.config.frontend_url(&subdomain),
            subdomain,
        };
        info!(url = %outcome.url, "Analysis launched");
        Ok(outcome)
    }

    /// Admission state for a user, without launching anything
    pub async fn admission(&self, username: &str) -> Result<AdmissionDecision, Error> {
        self.admission.evaluate(username).await
    }

    /// Check that `user` (when given) may act on the analysis.
    pub async fn authorize(&self, user: Option<&str>, id: &ExternalId) -> Result<(), Error> {
        let Some(user) = user else {
            return Ok(());
        };
        let analysis_id = self.lookup.analysis_id(id).await?;
        if self.permissions.is_allowed(user, &analysis_id).await? {
            Ok(())
        } else {
            Err(Error::permission_denied(format!(
                "{} may not act on analysis {}",
                user, id
            )))
        }
    }

    /// Delete every object of the analysis without saving outputs.
    #[instrument(skip(self), fields(external_id = %id))]
    pub async fn exit(&self, id: &ExternalId, user: Option<&str>) -> Result<TeardownReport, Error> {
        self.authorize(user, id).await?;
        Ok(self.lifecycle.teardown(id).await)
    }

    /// Upload outputs, then tear down. Runs under the supervisor.
    #[instrument(skip(self), fields(external_id = %id))]
    pub async fn save_and_exit(&self, id: &ExternalId, user: Option<&str>) -> Result<Uuid, Error> {
        self.authorize(user, id).await?;

        let transfers = self.transfers.clone();
        let lifecycle = self.lifecycle.clone();
        let job = id.clone();
        let task_id = self.supervisor.spawn(TaskKind::SaveAndExit, Some(id), |cancel| async move {
            let upload = transfers.transfer(&job, TransferKind::Upload, cancel).await;
            // Teardown happens whatever the upload did.
            let teardown = lifecycle.teardown(&job).await;
            save_and_exit_summary(upload, &teardown)
        });
        Ok(task_id)
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Stage inputs down into the analysis.
    pub async fn download_inputs(
        &self,
        id: &ExternalId,
        user: Option<&str>,
        detach: bool,
    ) -> Result<TransferDispatch, Error> {
        self.dispatch(id, user, TransferKind::Download, detach).await
    }

    /// Upload the analysis' outputs without stopping it.
    pub async fn save_outputs(
        &self,
        id: &ExternalId,
        user: Option<&str>,
        detach: bool,
    ) -> Result<TransferDispatch, Error> {
        self.dispatch(id, user, TransferKind::Upload, detach).await
    }

    #[instrument(skip(self), fields(external_id = %id))]
    async fn dispatch(
        &self,
        id: &ExternalId,
        user: Option<&str>,
        kind: TransferKind,
        detach: bool,
    ) -> Result<TransferDispatch, Error> {
        self.authorize(user, id).await?;

        if !detach {
            let cancel = self.supervisor.cancellation_token();
            let report = self.transfers.transfer(id, kind, cancel).await?;
            return Ok(TransferDispatch::Completed { report });
        }

        let transfers = self.transfers.clone();
        let job = id.clone();
        let task_kind = match kind {
            TransferKind::Download => TaskKind::Download,
            TransferKind::Upload => TaskKind::Upload,
        };
        let task_id = self.supervisor.spawn(task_kind, Some(id), move |cancel| async move {
            let report = transfers.transfer(&job, kind, cancel).await?;
            if report.succeeded() {
                Ok(format!("{} finished on {} instance(s)", kind, report.instances.len()))
            } else {
                Err(Error::internal(format!("{} did not complete on every instance", kind)))
            }
        });
        Ok(TransferDispatch::Detached { task_id })
    }

    // =========================================================================
    // Queries and maintenance
    // =========================================================================

    /// Names of every object of the analysis
    pub async fn list_resources(&self, id: &ExternalId) -> Result<ResourceListing, Error> {
        self.lifecycle.list_resources(id).await
    }

    /// Analysis serving `host`
    pub async fn external_id_for_host(&self, host: &str) -> Result<ExternalId, Error> {
        self.lifecycle.external_id_for_host(host).await
    }

    /// Run a relabel pass and wait for it.
    pub async fn relabel_now(&self) -> RelabelReport {
        self.relabeler.run().await
    }

    /// Start a relabel pass in the background.
    pub fn relabel(&self) -> Uuid {
        let relabeler = self.relabeler.clone();
        self.supervisor.spawn(TaskKind::Relabel, None, |_| async move {
            Ok(relabeler.run().await.summary())
        })
    }

    /// Every tracked background task, oldest first
    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.supervisor.list()
    }

    /// One background task
    pub fn task(&self, id: &Uuid) -> Option<TaskRecord> {
        self.supervisor.get(id)
    }

    /// Cancel one background task (transfer polling stops at its next check)
    pub fn cancel_task(&self, id: &Uuid) -> Result<(), Error> {
        if self.supervisor.cancel(id) {
            Ok(())
        } else {
            Err(Error::not_found(format!("running task {}", id)))
        }
    }

    /// Cancel background work (transfer polling stops at its next check)
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }
}

fn save_and_exit_summary(
    upload: Result<TransferReport, Error>,
    teardown: &TeardownReport,
) -> Result<String, Error> {
    let removed = format!("deleted {} object(s)", teardown.deleted.len());
    match upload {
        Ok(report) if report.succeeded() && teardown.is_clean() => {
            Ok(format!("outputs uploaded, {}", removed))
        }
        Ok(report) if report.succeeded() => Err(Error::internal(format!(
            "outputs uploaded, {}, {} deletion(s) failed",
            removed,
            teardown.failures.len()
        ))),
        Ok(_) => Err(Error::internal(format!(
            "output upload did not complete on every instance, {}",
            removed
        ))),
        Err(e) => Err(Error::internal(format!("output upload failed: {}, {}", e, removed))),
    }
}
