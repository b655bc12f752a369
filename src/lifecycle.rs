//! Applying and tearing down resource graphs
//!
//! Apply is an ordered sequence of per-object upserts: create when absent,
//! replace when present. Applying the same graph twice converges on the same
//! objects. Teardown lists everything carrying the job's `external-id` and
//! deletes it object by object, continuing past failures.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::assembler::ResourceGraph;
use crate::cluster::{labels_of, ClusterApi, ResourceKind};
use crate::labels::{ExternalId, Selector};
use crate::Error;

/// Result of a teardown: what went away and what did not.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// `Kind/name` of every deleted object
    pub deleted: Vec<String>,
    /// `Kind/name` (or `Kind` for list failures) and the error message
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    /// True when nothing failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, target: String, result: Result<(), Error>) {
        match result {
            Ok(()) => self.deleted.push(target),
            Err(e) => {
                warn!(target = %target, error = %e, "Delete failed");
                self.failures.push((target, e.to_string()));
            }
        }
    }
}

/// Names of every object belonging to one job, by kind.
pub type ResourceListing = BTreeMap<ResourceKind, Vec<String>>;

/// Reconciles resource graphs against the cluster.
pub struct LifecycleManager {
    cluster: Arc<dyn ClusterApi>,
}

impl LifecycleManager {
    /// Create a manager over `cluster`
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Create `obj` if absent, otherwise replace it with the fresh definition.
    ///
    /// The live object's resourceVersion is carried over, and for services
    /// the allocated clusterIP, so the replace is accepted.
    pub async fn upsert(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error> {
        let name = obj.name_any();
        match self.cluster.get(kind, &name).await? {
            None => {
                self.cluster.create(kind, obj).await?;
                debug!(kind = %kind, name = %name, "Created");
            }
            Some(live) => {
                let mut desired = obj.clone();
                desired.metadata.resource_version = live.metadata.resource_version.clone();
                if kind == ResourceKind::Service {
                    carry_cluster_ip(&live, &mut desired);
                }
                self.cluster.replace(kind, &desired).await?;
                debug!(kind = %kind, name = %name, "Updated");
            }
        }
        Ok(())
    }

    /// Apply every object of `graph` in order, stopping at the first error.
    ///
    /// Nothing is rolled back; re-applying the whole graph is safe.
    #[instrument(skip(self, graph), fields(external_id = %graph.external_id()))]
    pub async fn apply(&self, graph: &ResourceGraph) -> Result<(), Error> {
        let objects = graph.ordered()?;
        let count = objects.len();
        for (kind, obj) in &objects {
            self.upsert(*kind, obj).await?;
        }
        info!(objects = count, "Applied resource graph");
        Ok(())
    }

    /// Delete every object labeled with `id`, best-effort.
    ///
    /// Deleting a claim also deletes the volume it is bound to.
    #[instrument(skip(self), fields(external_id = %id))]
    pub async fn teardown(&self, id: &ExternalId) -> TeardownReport {
        let selector = id.selector();
        let mut report = TeardownReport::default();

        for kind in ResourceKind::ALL {
            let objects = match self.cluster.list(kind, &selector).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Listing for teardown failed");
                    report.failures.push((kind.to_string(), e.to_string()));
                    continue;
                }
            };

            for obj in objects {
                let name = obj.name_any();
                let result = self.cluster.delete(kind, &name).await;
                report.record(format!("{}/{}", kind, name), result);

                if kind == ResourceKind::PersistentVolumeClaim {
                    if let Some(volume) = bound_volume(&obj) {
                        let result = self
                            .cluster
                            .delete(ResourceKind::PersistentVolume, &volume)
                            .await;
                        report.record(format!("{}/{}", ResourceKind::PersistentVolume, volume), result);
                    }
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "Teardown finished"
        );
        report
    }

    /// Names of every object labeled with `id`.
    pub async fn list_resources(&self, id: &ExternalId) -> Result<ResourceListing, Error> {
        let selector = id.selector();
        let mut listing = ResourceListing::new();
        for kind in ResourceKind::ALL {
            let names: Vec<String> = self
                .cluster
                .list(kind, &selector)
                .await?
                .iter()
                .map(|o| o.name_any())
                .collect();
            listing.insert(kind, names);
        }
        Ok(listing)
    }

    /// Find the job serving `host` by scanning ingress rules.
    pub async fn external_id_for_host(&self, host: &str) -> Result<ExternalId, Error> {
        let ingresses = self
            .cluster
            .list(ResourceKind::Ingress, &Selector::interactive())
            .await?;

        for ingress in &ingresses {
            let serves_host = ingress
                .data
                .pointer("/spec/rules")
                .and_then(|r| r.as_array())
                .map(|rules| rules.iter().any(|r| r.get("host").and_then(|h| h.as_str()) == Some(host)))
                .unwrap_or(false);

            if serves_host {
                return ExternalId::from_labels(&labels_of(ingress)).ok_or_else(|| {
                    Error::not_found(format!(
                        "ingress {} for host {} has no external-id",
                        ingress.name_any(),
                        host
                    ))
                });
            }
        }
        Err(Error::not_found(format!("no analysis serves host {}", host)))
    }
}

fn carry_cluster_ip(live: &DynamicObject, desired: &mut DynamicObject) {
    let Some(ip) = live.data.pointer("/spec/clusterIP").cloned() else {
        return;
    };
    if let Some(spec) = desired.data.get_mut("spec").and_then(|s| s.as_object_mut()) {
        spec.insert("clusterIP".to_string(), ip);
    }
}

fn bound_volume(claim: &DynamicObject) -> Option<String> {
    claim
        .data
        .pointer("/spec/volumeName")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
