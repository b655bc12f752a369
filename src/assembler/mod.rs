//! Resource assembly
//!
//! Turns an [`AnalysisJob`] plus static configuration into the complete set
//! of cluster objects for one analysis. Assembly is pure: no cluster calls,
//! and the same inputs always produce the same graph.
//!
//! # Staging modes
//!
//! In staging mode an init container downloads inputs into a shared
//! `emptyDir` and a sidecar serves later download/upload triggers. In CSI
//! mode the remote store is mounted through persistent volumes instead and
//! neither staging container exists.

mod deployment;
mod network;
mod volumes;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::DynamicObject;
use serde::Serialize;
use tracing::debug;

pub use deployment::{
    affinity, resource_requirements, tolerations, DEFAULT_CPU_LIMIT, DEFAULT_CPU_REQUEST,
    DEFAULT_MEMORY_LIMIT, DEFAULT_MEMORY_REQUEST, DEFAULT_STORAGE_REQUEST, GPU_RESOURCE,
};
pub use volumes::{
    plan_csi_mounts, CsiMount, INPUT_PATH_LIST_HEADER, LABEL_VOLUME_NAME, TICKET_LIST_HEADER,
};

use crate::cluster::{to_dynamic, ResourceKind};
use crate::config::ViceConfig;
use crate::job::AnalysisJob;
use crate::labels::{ExternalId, JobLabels};
use crate::Error;

// =============================================================================
// Names and ports
// =============================================================================

/// Analysis container name
pub const ANALYSIS_CONTAINER: &str = "analysis";
/// Proxy container name
pub const PROXY_CONTAINER: &str = "vice-proxy";
/// Staging sidecar name
pub const STAGING_CONTAINER: &str = "input-files";
/// Staging init container name
pub const STAGING_INIT_CONTAINER: &str = "input-files-init";

/// Proxy container port
pub const PROXY_PORT: i32 = 60002;
/// Proxy port name
pub const PROXY_PORT_NAME: &str = "tcp-proxy";
/// Service port in front of the proxy
pub const SERVICE_PROXY_PORT: i32 = 60000;
/// Staging sidecar port
pub const STAGING_PORT: i32 = 60001;
/// Staging port name; transfer triggers look services up by it
pub const STAGING_PORT_NAME: &str = "tcp-input";

/// Working directory when the step declares none
pub const DEFAULT_WORKING_DIR: &str = "/de-app-work";
/// Run-as id for staging containers when the step declares none
pub const DEFAULT_RUN_AS: i64 = 1000;

/// Mount path of the exclusion list
pub const EXCLUDES_MOUNT: &str = "/excludes";
/// Mount path of the input path lists
pub const INPUT_PATHS_MOUNT: &str = "/input-paths";
/// Prefix of CSI mount paths inside the analysis container
pub const CSI_MOUNT_PREFIX: &str = "/data";

/// Key of the exclusion list
pub const EXCLUDES_KEY: &str = "excludes-file";
/// Key of the plain input path list
pub const INPUT_PATH_LIST_KEY: &str = "input-path-list";
/// Key of the ticketed input path list
pub const TICKET_LIST_KEY: &str = "ticket-input-path-list";

/// Service name for a job
pub fn service_name(id: &ExternalId) -> String {
    format!("vice-{}", id)
}

/// Exclusion-list config map name
pub fn excludes_config_name(id: &ExternalId) -> String {
    format!("excludes-file-{}", id)
}

/// Input-path-list config map name
pub fn input_paths_config_name(id: &ExternalId) -> String {
    format!("input-path-list-{}", id)
}

/// CSI volume name for mount `index`
pub fn csi_volume_name(id: &ExternalId, index: usize) -> String {
    format!("csi-data-volume-{}-{}", id, index)
}

/// CSI claim name for mount `index`
pub fn csi_claim_name(id: &ExternalId, index: usize) -> String {
    format!("csi-data-volume-claim-{}-{}", id, index)
}

// =============================================================================
// Resource graph
// =============================================================================

/// Every object of one analysis, not yet applied.
#[derive(Clone, Debug)]
pub struct ResourceGraph {
    /// Labels stamped on every object
    pub labels: JobLabels,
    /// Exclusion list
    pub excludes: ConfigMap,
    /// Input path lists
    pub input_paths: ConfigMap,
    /// The workload
    pub deployment: Deployment,
    /// CSI volumes (empty in staging mode)
    pub persistent_volumes: Vec<PersistentVolume>,
    /// CSI claims (empty in staging mode)
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
    /// Proxy/staging service
    pub service: Service,
    /// External route
    pub ingress: Ingress,
}

impl ResourceGraph {
    /// Correlation key shared by every object
    pub fn external_id(&self) -> &ExternalId {
        &self.labels.external_id
    }

    /// Objects in apply order, converted for the cluster seam.
    ///
    /// Config maps, deployment, volumes, claims, service, ingress.
    pub fn ordered(&self) -> Result<Vec<(ResourceKind, DynamicObject)>, Error> {
        let mut out = vec![
            (ResourceKind::ConfigMap, to_dynamic(&self.excludes)?),
            (ResourceKind::ConfigMap, to_dynamic(&self.input_paths)?),
            (ResourceKind::Deployment, to_dynamic(&self.deployment)?),
        ];
        for pv in &self.persistent_volumes {
            out.push((ResourceKind::PersistentVolume, to_dynamic(pv)?));
        }
        for pvc in &self.persistent_volume_claims {
            out.push((ResourceKind::PersistentVolumeClaim, to_dynamic(pvc)?));
        }
        out.push((ResourceKind::Service, to_dynamic(&self.service)?));
        out.push((ResourceKind::Ingress, to_dynamic(&self.ingress)?));
        Ok(out)
    }

    /// Multi-document YAML of the graph in apply order
    pub fn to_yaml(&self) -> Result<String, Error> {
        fn doc<T: Serialize>(obj: &T) -> Result<String, Error> {
            serde_yaml::to_string(obj).map_err(|e| Error::serialization(e.to_string()))
        }

        let mut docs = vec![
            doc(&self.excludes)?,
            doc(&self.input_paths)?,
            doc(&self.deployment)?,
        ];
        for pv in &self.persistent_volumes {
            docs.push(doc(pv)?);
        }
        for pvc in &self.persistent_volume_claims {
            docs.push(doc(pvc)?);
        }
        docs.push(doc(&self.service)?);
        docs.push(doc(&self.ingress)?);
        Ok(docs.join("---\n"))
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Builds resource graphs from jobs.
#[derive(Clone, Debug)]
pub struct ResourceAssembler {
    config: ViceConfig,
}

impl ResourceAssembler {
    /// Create an assembler using `config`
    pub fn new(config: ViceConfig) -> Self {
        Self { config }
    }

    /// Configuration the assembler was built with
    pub fn config(&self) -> &ViceConfig {
        &self.config
    }

    /// Assemble the full graph for `job` labeled with `labels`.
    ///
    /// Fails only on structural problems with the job (missing ports,
    /// malformed remote paths).
    pub fn assemble(&self, job: &AnalysisJob, labels: JobLabels) -> Result<ResourceGraph, Error> {
        job.validate()?;
        let config = &self.config;
        let ns = config.namespace.as_str();

        let csi_mounts = if config.use_csi_driver {
            Some(plan_csi_mounts(job)?)
        } else {
            None
        };

        let (persistent_volumes, persistent_volume_claims) = match &csi_mounts {
            Some(mounts) => (
                volumes::persistent_volumes(job, &labels, mounts, config),
                volumes::persistent_volume_claims(&labels, mounts, config),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let graph = ResourceGraph {
            excludes: volumes::excludes_config_map(job, &labels, ns),
            input_paths: volumes::input_path_list_config_map(job, &labels, ns),
            deployment: deployment::deployment(job, &labels, config, csi_mounts.as_deref())?,
            persistent_volumes,
            persistent_volume_claims,
            service: network::service(&labels, config, csi_mounts.is_none()),
            ingress: network::ingress(&labels, config),
            labels,
        };

        debug!(
            external_id = %graph.external_id(),
            csi = config.use_csi_driver,
            volumes = graph.persistent_volumes.len(),
            "Assembled resource graph"
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::sample_job;
    use kube::ResourceExt;

    fn assemble(csi: bool) -> ResourceGraph {
        let config = ViceConfig {
            use_csi_driver: csi,
            ..Default::default()
        };
        let job = sample_job("abc123", "alice");
        let labels = JobLabels::for_job(&job, "alice-id", None, "").unwrap();
        ResourceAssembler::new(config).assemble(&job, labels).unwrap()
    }

    #[test]
    fn test_staging_graph_order_and_names() {
        let graph = assemble(false);
        let order: Vec<(ResourceKind, String)> = graph
            .ordered()
            .unwrap()
            .into_iter()
            .map(|(k, o)| (k, o.name_any()))
            .collect();

        assert_eq!(
            order,
            vec![
                (ResourceKind::ConfigMap, "excludes-file-abc123".to_string()),
                (ResourceKind::ConfigMap, "input-path-list-abc123".to_string()),
                (ResourceKind::Deployment, "abc123".to_string()),
                (ResourceKind::Service, "vice-abc123".to_string()),
                (ResourceKind::Ingress, "ac02e0a46".to_string()),
            ]
        );
    }

    #[test]
    fn test_csi_graph_adds_volumes_before_service() {
        let graph = assemble(true);
        let kinds: Vec<ResourceKind> = graph.ordered().unwrap().into_iter().map(|(k, _)| k).collect();

        assert_eq!(
            kinds,
            vec![
                ResourceKind::ConfigMap,
                ResourceKind::ConfigMap,
                ResourceKind::Deployment,
                ResourceKind::PersistentVolume,
                ResourceKind::PersistentVolumeClaim,
                ResourceKind::Service,
                ResourceKind::Ingress,
            ]
        );
    }

    #[test]
    fn test_every_object_carries_the_correlation_key() {
        for csi in [false, true] {
            for (kind, obj) in assemble(csi).ordered().unwrap() {
                assert_eq!(
                    obj.labels().get("external-id").map(String::as_str),
                    Some("abc123"),
                    "{} {} is missing external-id",
                    kind,
                    obj.name_any()
                );
            }
        }
    }

    #[test]
    fn test_assembly_is_deterministic() {
        assert_eq!(assemble(false).to_yaml().unwrap(), assemble(false).to_yaml().unwrap());
    }

    #[test]
    fn test_missing_ports_fail_assembly() {
        let mut job = sample_job("abc123", "alice");
        job.steps[0].container.ports.clear();
        let labels = JobLabels::for_job(&job, "alice-id", None, "").unwrap();
        let result = ResourceAssembler::new(ViceConfig::default()).assemble(&job, labels);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_yaml_has_one_document_per_object() {
        let yaml = assemble(true).to_yaml().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 6);
        assert!(yaml.contains("kind: Deployment"));
    }
}
