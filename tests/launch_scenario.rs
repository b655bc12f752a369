//! End-to-end launch of a single analysis against in-process collaborators
//!
//! No cluster is needed: the cluster seam is a small recording store and the
//! lookup services answer with fixed values.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;

use vice::assembler::{input_paths_config_name, ResourceAssembler, INPUT_PATH_LIST_KEY};
use vice::cluster::{labels_of, ClusterApi, ResourceKind};
use vice::config::ViceConfig;
use vice::job::AnalysisJob;
use vice::labels::{ExternalId, JobLabels, Selector};
use vice::lookup::{AnalysisLookup, PermissionChecker};
use vice::manager::{AnalysisManager, Collaborators};
use vice::status::{StatusEvent, StatusNotifier};
use vice::transfer::{StagingClient, TransferKind, TransferStatus};
use vice::Error;

// =============================================================================
// In-process collaborators
// =============================================================================

#[derive(Default)]
struct RecordingCluster {
    objects: Mutex<BTreeMap<(ResourceKind, String), DynamicObject>>,
}

impl RecordingCluster {
    fn object(&self, kind: ResourceKind, name: &str) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind, name.to_string()))
            .cloned()
    }

    fn count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterApi for RecordingCluster {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.object(kind, name))
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error> {
        self.objects
            .lock()
            .unwrap()
            .insert((kind, obj.name_any()), obj.clone());
        Ok(())
    }

    async fn replace(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error> {
        self.create(kind, obj).await
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _), o)| *k == kind && selector.matches(&labels_of(o)))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), Error> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(kind, name.to_string()));
        Ok(())
    }

    async fn patch_labels(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        if let Some(obj) = self
            .objects
            .lock()
            .unwrap()
            .get_mut(&(kind, name.to_string()))
        {
            obj.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels.clone());
        }
        Ok(())
    }
}

struct FixedLookup;

#[async_trait]
impl AnalysisLookup for FixedLookup {
    async fn user_id(&self, _username: &str) -> Result<String, Error> {
        Ok("alice-id".to_string())
    }

    async fn login_ip(&self, _username: &str) -> Result<Option<String>, Error> {
        Ok(None)
    }

    async fn analysis_id(&self, external_id: &ExternalId) -> Result<String, Error> {
        Ok(format!("analysis-{}", external_id))
    }

    async fn analysis_status(&self, _external_id: &ExternalId) -> Result<String, Error> {
        Ok("Running".to_string())
    }

    async fn user_job_limit(&self, _username: &str) -> Result<Option<i64>, Error> {
        Ok(None)
    }

    async fn default_job_limit(&self) -> Result<Option<i64>, Error> {
        Ok(None)
    }
}

struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn is_allowed(&self, _user: &str, _analysis_id: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

struct NoStaging;

#[async_trait]
impl StagingClient for NoStaging {
    async fn start(&self, base_url: &str, _kind: TransferKind) -> Result<TransferStatus, Error> {
        Err(Error::staging(base_url, "not reachable in tests"))
    }

    async fn status(
        &self,
        base_url: &str,
        _kind: TransferKind,
        _uuid: &str,
    ) -> Result<TransferStatus, Error> {
        Err(Error::staging(base_url, "not reachable in tests"))
    }
}

struct Discard;

#[async_trait]
impl StatusNotifier for Discard {
    async fn notify(&self, _event: StatusEvent) {}
}

// =============================================================================
// Scenario
// =============================================================================

fn alice_job() -> AnalysisJob {
    serde_json::from_value(serde_json::json!({
        "invocation_id": "abc123",
        "name": "Notebook",
        "submitter": "alice",
        "app_id": "app-1",
        "app_name": "JupyterLab",
        "output_dir": "/zoneA/home/alice/analyses/abc123",
        "steps": [{
            "container": {
                "image": { "name": "jupyter/datascience", "tag": "latest" },
                "ports": [{ "container_port": 8888 }]
            },
            "inputs": [{ "path": "/zoneA/home/alice/in.txt" }]
        }]
    }))
    .unwrap()
}

fn config() -> ViceConfig {
    ViceConfig {
        use_csi_driver: false,
        user_suffix: String::new(),
        ..Default::default()
    }
}

#[test]
fn assembled_graph_carries_labels_and_input_list() {
    let job = alice_job();
    let labels = JobLabels::for_job(&job, "alice-id", None, "").unwrap();
    let graph = ResourceAssembler::new(config()).assemble(&job, labels).unwrap();

    let map = graph.labels.to_map();
    assert_eq!(map["external-id"], "abc123");
    assert_eq!(map["subdomain"], "ac02e0a46");
    assert_eq!(map["app-type"], "interactive");

    let paths = graph
        .input_paths
        .data
        .as_ref()
        .and_then(|d| d.get(INPUT_PATH_LIST_KEY))
        .unwrap();
    assert!(paths.lines().any(|l| l == "/zoneA/home/alice/in.txt"));

    let yaml = graph.to_yaml().unwrap();
    assert!(yaml.contains("kind: Deployment"));
    assert!(yaml.contains("kind: Ingress"));
}

#[tokio::test]
async fn launch_then_exit_round_trip() {
    let cluster = Arc::new(RecordingCluster::default());
    let manager = AnalysisManager::new(
        config(),
        Collaborators {
            cluster: cluster.clone(),
            lookup: Arc::new(FixedLookup),
            permissions: Arc::new(AllowAll),
            staging: Arc::new(NoStaging),
            notifier: Arc::new(Discard),
        },
    );

    let outcome = manager.launch(&alice_job()).await.unwrap();
    assert_eq!(outcome.subdomain, "ac02e0a46");

    let config_map = cluster
        .object(
            ResourceKind::ConfigMap,
            &input_paths_config_name(&ExternalId::new("abc123").unwrap()),
        )
        .unwrap();
    assert_eq!(labels_of(&config_map)["external-id"], "abc123");
    let deployment = cluster.object(ResourceKind::Deployment, "abc123").unwrap();
    assert_eq!(labels_of(&deployment)["subdomain"], "ac02e0a46");

    let report = manager
        .exit(&ExternalId::new("abc123").unwrap(), Some("alice"))
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(cluster.count(), 0);
}
