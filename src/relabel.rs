//! Label repair for analyses launched before the current label set
//!
//! Older objects may lack `subdomain`, `login-ip` or `analysis-id`. A pass
//! lists every interactive object of every kind, derives the missing values
//! from the labels already present plus lookups, and merge-patches them in.
//! Nothing is ever removed or overwritten.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{labels_of, ClusterApi, ResourceKind};
use crate::labels::{
    slugify, subdomain, ExternalId, Selector, LABEL_ANALYSIS_ID, LABEL_LOGIN_IP, LABEL_SUBDOMAIN,
    LABEL_USERNAME, LABEL_USER_ID,
};
use crate::lookup::AnalysisLookup;

/// Counts from one relabel pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelabelReport {
    /// Objects inspected
    pub scanned: usize,
    /// Objects that received new labels
    pub patched: usize,
    /// `"<Kind>/<name>"` (or just `"<Kind>"` when listing failed) and the
    /// reason it could not be patched
    pub failures: Vec<(String, String)>,
}

impl RelabelReport {
    /// One-line summary for task records
    pub fn summary(&self) -> String {
        format!(
            "scanned {}, patched {}, failed {}",
            self.scanned,
            self.patched,
            self.failures.len()
        )
    }
}

/// Fills in missing labels on interactive objects.
pub struct Relabeler {
    cluster: Arc<dyn ClusterApi>,
    lookup: Arc<dyn AnalysisLookup>,
    user_suffix: String,
}

/// Per-pass memo so objects of the same job share lookups.
#[derive(Default)]
struct LookupCache {
    login_ips: HashMap<String, Option<String>>,
    analysis_ids: HashMap<ExternalId, Option<String>>,
}

impl Relabeler {
    /// Create a relabeler; `user_suffix` is re-appended to username labels
    /// before lookups
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        lookup: Arc<dyn AnalysisLookup>,
        user_suffix: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            lookup,
            user_suffix: user_suffix.into(),
        }
    }

    /// Run one pass over every kind.
    ///
    /// Best-effort: a kind that cannot be listed and an object that cannot
    /// be patched are both recorded in the report and skipped.
    #[instrument(skip(self))]
    pub async fn run(&self) -> RelabelReport {
        let mut report = RelabelReport::default();
        let mut cache = LookupCache::default();

        for kind in ResourceKind::ALL {
            let objects = match self.cluster.list(kind, &Selector::interactive()).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Listing for relabel failed");
                    report.failures.push((kind.to_string(), e.to_string()));
                    continue;
                }
            };
            for obj in &objects {
                report.scanned += 1;
                let name = obj.name_any();
                let missing = self.missing_labels(&labels_of(obj), &mut cache).await;
                if missing.is_empty() {
                    continue;
                }

                match self.cluster.patch_labels(kind, &name, &missing).await {
                    Ok(()) => {
                        let added: Vec<&String> = missing.keys().collect();
                        debug!(kind = %kind, name = %name, labels = ?added, "Patched labels");
                        report.patched += 1;
                    }
                    Err(e) => {
                        warn!(kind = %kind, name = %name, error = %e, "Failed to patch labels");
                        report.failures.push((format!("{}/{}", kind, name), e.to_string()));
                    }
                }
            }
        }

        info!(
            scanned = report.scanned,
            patched = report.patched,
            failed = report.failures.len(),
            "Relabel pass finished"
        );
        report
    }

    /// Labels that are absent (or empty) and can be derived.
    async fn missing_labels(
        &self,
        labels: &BTreeMap<String, String>,
        cache: &mut LookupCache,
    ) -> BTreeMap<String, String> {
        let mut missing = BTreeMap::new();
        let id = ExternalId::from_labels(labels);

        if is_unset(labels, LABEL_SUBDOMAIN) {
            match (labels.get(LABEL_USER_ID), &id) {
                (Some(user_id), Some(id)) if !user_id.is_empty() => {
                    missing.insert(
                        LABEL_SUBDOMAIN.to_string(),
                        subdomain(user_id, id.as_str()),
                    );
                }
                _ => debug!("Cannot derive subdomain without user-id and external-id"),
            }
        }

        if is_unset(labels, LABEL_LOGIN_IP) {
            if let Some(user) = labels.get(LABEL_USERNAME).filter(|u| !u.is_empty()) {
                if let Some(ip) = self.login_ip(user, cache).await {
                    missing.insert(LABEL_LOGIN_IP.to_string(), slugify(&ip));
                }
            }
        }

        if is_unset(labels, LABEL_ANALYSIS_ID) {
            if let Some(id) = &id {
                if let Some(analysis_id) = self.analysis_id(id, cache).await {
                    missing.insert(LABEL_ANALYSIS_ID.to_string(), slugify(&analysis_id));
                }
            }
        }

        missing
    }

    async fn login_ip(&self, user: &str, cache: &mut LookupCache) -> Option<String> {
        if let Some(hit) = cache.login_ips.get(user) {
            return hit.clone();
        }
        let username = format!("{}{}", user, self.user_suffix);
        let ip = match self.lookup.login_ip(&username).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(username = %username, error = %e, "Login IP lookup failed");
                None
            }
        };
        cache.login_ips.insert(user.to_string(), ip.clone());
        ip
    }

    async fn analysis_id(&self, id: &ExternalId, cache: &mut LookupCache) -> Option<String> {
        if let Some(hit) = cache.analysis_ids.get(id) {
            return hit.clone();
        }
        let analysis_id = match self.lookup.analysis_id(id).await {
            Ok(analysis_id) => Some(analysis_id),
            Err(e) => {
                warn!(external_id = %id, error = %e, "Analysis id lookup failed");
                None
            }
        };
        cache.analysis_ids.insert(id.clone(), analysis_id.clone());
        analysis_id
    }
}

fn is_unset(labels: &BTreeMap<String, String>, key: &str) -> bool {
    labels.get(key).map(|v| v.is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::InMemoryCluster;
    use crate::cluster::{to_dynamic, MockClusterApi};
    use crate::lookup::MockAnalysisLookup;
    use crate::Error;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::{DynamicObject, ObjectMeta};

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn legacy_labels(id: &str) -> Vec<(&'static str, String)> {
        vec![
            ("app-type", "interactive".to_string()),
            ("external-id", id.to_string()),
            ("username", "alice".to_string()),
            ("user-id", "alice-id".to_string()),
        ]
    }

    fn deployment(name: &str, labels: &[(&str, &str)]) -> DynamicObject {
        to_dynamic(&Deployment {
            metadata: meta(name, labels),
            ..Default::default()
        })
        .unwrap()
    }

    fn service(name: &str, labels: &[(&str, &str)]) -> DynamicObject {
        to_dynamic(&Service {
            metadata: meta(name, labels),
            ..Default::default()
        })
        .unwrap()
    }

    fn as_refs<'a>(labels: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
        labels.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    // ==========================================================================
    // Story Tests: Repairing Legacy Analyses
    // ==========================================================================

    /// Story: a legacy analysis gains every missing label in one pass, and
    /// lookups are shared across its objects
    #[tokio::test]
    async fn story_legacy_analysis_is_fully_relabeled() {
        let cluster = Arc::new(InMemoryCluster::new());
        let labels = legacy_labels("abc123");
        cluster.insert(ResourceKind::Deployment, deployment("abc123", &as_refs(&labels)));
        cluster.insert(ResourceKind::Service, service("vice-abc123", &as_refs(&labels)));

        let mut lookup = MockAnalysisLookup::new();
        lookup
            .expect_login_ip()
            .withf(|u| u == "alice@iplantcollaborative.org")
            .times(1)
            .returning(|_| Ok(Some("10.0.0.7".to_string())));
        lookup
            .expect_analysis_id()
            .times(1)
            .returning(|_| Ok("a1b2c3".to_string()));

        let relabeler = Relabeler::new(cluster.clone(), Arc::new(lookup), "@iplantcollaborative.org");
        let report = relabeler.run().await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.patched, 2);
        assert!(report.failures.is_empty());

        let patched = labels_of(&cluster.object(ResourceKind::Deployment, "abc123").unwrap());
        assert_eq!(patched["subdomain"], "ac02e0a46");
        assert_eq!(patched["login-ip"], "10.0.0.7");
        assert_eq!(patched["analysis-id"], "a1b2c3");
        assert_eq!(patched["username"], "alice");
    }

    /// Story: fully labeled objects are left untouched
    #[tokio::test]
    async fn story_current_objects_are_not_patched() {
        let cluster = Arc::new(InMemoryCluster::new());
        let mut labels = legacy_labels("abc123");
        labels.push(("subdomain", "ac02e0a46".to_string()));
        labels.push(("login-ip", "10.0.0.7".to_string()));
        labels.push(("analysis-id", "a1b2c3".to_string()));
        cluster.insert(ResourceKind::Deployment, deployment("abc123", &as_refs(&labels)));

        let relabeler = Relabeler::new(cluster.clone(), Arc::new(MockAnalysisLookup::new()), "");
        let report = relabeler.run().await;

        assert_eq!(report.scanned, 1);
        assert_eq!(report.patched, 0);
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_lookups_still_patch_what_can_be_derived() {
        let cluster = Arc::new(InMemoryCluster::new());
        let labels = legacy_labels("abc123");
        cluster.insert(ResourceKind::Deployment, deployment("abc123", &as_refs(&labels)));

        let mut lookup = MockAnalysisLookup::new();
        lookup
            .expect_login_ip()
            .returning(|_| Err(Error::lookup("users service down")));
        lookup
            .expect_analysis_id()
            .returning(|id| Err(Error::not_found(id.to_string())));

        let report = Relabeler::new(cluster.clone(), Arc::new(lookup), "")
            .run()
            .await;

        assert_eq!(report.patched, 1);
        let patched = labels_of(&cluster.object(ResourceKind::Deployment, "abc123").unwrap());
        assert_eq!(patched["subdomain"], "ac02e0a46");
        assert!(!patched.contains_key("login-ip"));
        assert!(!patched.contains_key("analysis-id"));
    }

    /// Story: a kind the relabeler cannot list does not stop the others
    #[tokio::test]
    async fn story_list_failure_skips_only_that_kind() {
        let labels = legacy_labels("abc123");
        let legacy = deployment("abc123", &as_refs(&labels));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list()
            .returning(move |kind, _| match kind {
                ResourceKind::Ingress => Err(Error::internal("ingress list forbidden")),
                ResourceKind::Deployment => Ok(vec![legacy.clone()]),
                _ => Ok(Vec::new()),
            });
        cluster
            .expect_patch_labels()
            .withf(|kind, name, labels| {
                *kind == ResourceKind::Deployment
                    && name == "abc123"
                    && labels.get("subdomain").map(String::as_str) == Some("ac02e0a46")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut lookup = MockAnalysisLookup::new();
        lookup.expect_login_ip().returning(|_| Ok(None));
        lookup
            .expect_analysis_id()
            .returning(|_| Ok("a1b2c3".to_string()));

        let report = Relabeler::new(Arc::new(cluster), Arc::new(lookup), "")
            .run()
            .await;

        assert_eq!(report.scanned, 1);
        assert_eq!(report.patched, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "Ingress");
        assert!(report.failures[0].1.contains("ingress list forbidden"));
    }

    #[tokio::test]
    async fn test_non_interactive_objects_are_ignored() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(
            ResourceKind::Deployment,
            deployment("batch-job", &[("external-id", "abc123"), ("user-id", "alice-id")]),
        );

        let report = Relabeler::new(cluster.clone(), Arc::new(MockAnalysisLookup::new()), "")
            .run()
            .await;

        assert_eq!(report, RelabelReport::default());
    }

    #[test]
    fn test_summary() {
        let report = RelabelReport {
            scanned: 4,
            patched: 2,
            failures: vec![("Service/vice-x".to_string(), "conflict".to_string())],
        };
        assert_eq!(report.summary(), "scanned 4, patched 2, failed 1");
    }
}
