//! Cluster API seam
//!
//! All object traffic goes through [`ClusterApi`] as `DynamicObject`s, so the
//! lifecycle code handles every kind the same way and tests can substitute
//! a mock or the in-memory fake.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1 as core;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::labels::Selector;
use crate::Error;

/// Object kinds that make up an analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// Exclusion list and input path list
    ConfigMap,
    /// The analysis workload
    Deployment,
    /// CSI-backed volume (cluster-scoped)
    PersistentVolume,
    /// Claim bound to a CSI volume
    PersistentVolumeClaim,
    /// In-cluster address of the proxy and staging sidecar
    Service,
    /// External route to the proxy
    Ingress,
}

impl ResourceKind {
    /// Every kind, in teardown order
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Ingress,
        ResourceKind::Service,
        ResourceKind::Deployment,
        ResourceKind::ConfigMap,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::PersistentVolume,
    ];

    /// Dynamic API resource descriptor for this kind
    pub fn api_resource(self) -> ApiResource {
        match self {
            ResourceKind::ConfigMap => ApiResource::erase::<core::ConfigMap>(&()),
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::PersistentVolume => ApiResource::erase::<core::PersistentVolume>(&()),
            ResourceKind::PersistentVolumeClaim => {
                ApiResource::erase::<core::PersistentVolumeClaim>(&())
            }
            ResourceKind::Service => ApiResource::erase::<core::Service>(&()),
            ResourceKind::Ingress => ApiResource::erase::<Ingress>(&()),
        }
    }

    /// False for cluster-scoped kinds
    pub fn is_namespaced(self) -> bool {
        !matches!(self, ResourceKind::PersistentVolume)
    }

    /// Kind name as it appears in `kind:`
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::PersistentVolume => "PersistentVolume",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait abstracting the cluster object store
///
/// Namespaced kinds are scoped to the managed namespace; persistent volumes
/// are cluster-wide.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read an object by name, `None` if it does not exist
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<DynamicObject>, Error>;

    /// Create a new object
    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error>;

    /// Replace an existing object (the object must carry its resourceVersion)
    async fn replace(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error>;

    /// List objects matching an equality label selector
    async fn list(
        &self,
        kind: ResourceKind,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Delete an object by name; an already missing object is not an error
    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), Error>;

    /// Merge the given labels into an object's metadata
    async fn patch_labels(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Real implementation backed by a kube client
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
}

impl KubeClusterApi {
    /// Create a client scoped to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self, kind: ResourceKind) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        if kind.is_namespaced() {
            Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.api(kind).get_opt(name).await?)
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error> {
        self.api(kind).create(&PostParams::default(), obj).await?;
        debug!(kind = %kind, name = %obj.name_any(), "Created object");
        Ok(())
    }

    async fn replace(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error> {
        let name = obj.name_any();
        self.api(kind)
            .replace(&name, &PostParams::default(), obj)
            .await?;
        debug!(kind = %kind, name = %name, "Replaced object");
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, Error> {
        let params = ListParams::default().labels(&selector.to_string());
        Ok(self.api(kind).list(&params).await?.items)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), Error> {
        match self.api(kind).delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind = %kind, name = %name, "Deleted object");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(kind = %kind, name = %name, "Object already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_labels(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.api(kind)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Convert a typed object into the dynamic form used at the seam.
pub fn to_dynamic<T: Serialize>(obj: &T) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Labels of a dynamic object (empty when unset)
pub fn labels_of(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.labels.clone().unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory object store for stateful tests

    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use kube::core::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str, message: String) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        }))
    }

    #[derive(Default)]
    struct State {
        objects: BTreeMap<(ResourceKind, String), DynamicObject>,
        version: u64,
        failing_deletes: BTreeSet<(ResourceKind, String)>,
        calls: Vec<String>,
    }

    /// Fake cluster that enforces create/replace semantics and
    /// resourceVersion checks.
    #[derive(Default)]
    pub(crate) struct InMemoryCluster {
        state: Mutex<State>,
    }

    impl InMemoryCluster {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Seed an object directly, bypassing create
        pub(crate) fn insert(&self, kind: ResourceKind, mut obj: DynamicObject) {
            let mut state = self.state.lock().unwrap();
            state.version += 1;
            obj.metadata.resource_version = Some(state.version.to_string());
            state.objects.insert((kind, obj.name_any()), obj);
        }

        pub(crate) fn fail_delete(&self, kind: ResourceKind, name: &str) {
            self.state
                .lock()
                .unwrap()
                .failing_deletes
                .insert((kind, name.to_string()));
        }

        pub(crate) fn names(&self, kind: ResourceKind) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .objects
                .keys()
                .filter(|(k, _)| *k == kind)
                .map(|(_, n)| n.clone())
                .collect()
        }

        pub(crate) fn object(&self, kind: ResourceKind, name: &str) -> Option<DynamicObject> {
            self.state
                .lock()
                .unwrap()
                .objects
                .get(&(kind, name.to_string()))
                .cloned()
        }

        pub(crate) fn len(&self) -> usize {
            self.state.lock().unwrap().objects.len()
        }

        /// Mutating calls in order, as `"<verb> <Kind>/<name>"`
        pub(crate) fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }
    }

    #[async_trait]
    impl ClusterApi for InMemoryCluster {
        async fn get(
            &self,
            kind: ResourceKind,
            name: &str,
        ) -> Result<Option<DynamicObject>, Error> {
            Ok(self.object(kind, name))
        }

        async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            let key = (kind, obj.name_any());
            if state.objects.contains_key(&key) {
                return Err(api_error(
                    409,
                    "AlreadyExists",
                    format!("{} {} already exists", kind, key.1),
                ));
            }
            state.version += 1;
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(state.version.to_string());
            if kind == ResourceKind::Service {
                let ip = format!("10.96.0.{}", state.version);
                if let Some(spec) = stored.data.get_mut("spec").and_then(|s| s.as_object_mut()) {
                    spec.insert("clusterIP".to_string(), serde_json::Value::String(ip));
                }
            }
            state.calls.push(format!("create {}/{}", kind, key.1));
            state.objects.insert(key, stored);
            Ok(())
        }

        async fn replace(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            let key = (kind, obj.name_any());
            let current = state
                .objects
                .get(&key)
                .ok_or_else(|| api_error(404, "NotFound", format!("{} {}", kind, key.1)))?;
            if current.metadata.resource_version != obj.metadata.resource_version {
                return Err(api_error(409, "Conflict", "stale resourceVersion".to_string()));
            }
            if kind == ResourceKind::Service {
                let old_ip = current.data.pointer("/spec/clusterIP");
                let new_ip = obj.data.pointer("/spec/clusterIP");
                if old_ip != new_ip {
                    return Err(api_error(422, "Invalid", "clusterIP is immutable".to_string()));
                }
            }
            state.version += 1;
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(state.version.to_string());
            state.calls.push(format!("replace {}/{}", kind, key.1));
            state.objects.insert(key, stored);
            Ok(())
        }

        async fn list(
            &self,
            kind: ResourceKind,
            selector: &Selector,
        ) -> Result<Vec<DynamicObject>, Error> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .objects
                .iter()
                .filter(|((k, _), o)| *k == kind && selector.matches(&labels_of(o)))
                .map(|(_, o)| o.clone())
                .collect())
        }

        async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            let key = (kind, name.to_string());
            if state.failing_deletes.contains(&key) {
                return Err(api_error(500, "InternalError", "injected failure".to_string()));
            }
            if state.objects.remove(&key).is_some() {
                state.calls.push(format!("delete {}/{}", kind, name));
            }
            Ok(())
        }

        async fn patch_labels(
            &self,
            kind: ResourceKind,
            name: &str,
            labels: &BTreeMap<String, String>,
        ) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            let obj = state
                .objects
                .get_mut(&(kind, name.to_string()))
                .ok_or_else(|| api_error(404, "NotFound", format!("{} {}", kind, name)))?;
            obj.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels.clone());
            state.calls.push(format!("patch {}/{}", kind, name));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn test_api_resources_use_the_right_groups() {
        let deploy = ResourceKind::Deployment.api_resource();
        assert_eq!(deploy.api_version, "apps/v1");
        assert_eq!(deploy.plural, "deployments");

        let ingress = ResourceKind::Ingress.api_resource();
        assert_eq!(ingress.group, "networking.k8s.io");

        let pv = ResourceKind::PersistentVolume.api_resource();
        assert_eq!(pv.plural, "persistentvolumes");
        assert!(!ResourceKind::PersistentVolume.is_namespaced());
        assert!(ResourceKind::PersistentVolumeClaim.is_namespaced());
    }

    #[test]
    fn test_to_dynamic_keeps_type_and_labels() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("excludes-file-abc123".to_string()),
                labels: Some(BTreeMap::from([(
                    "external-id".to_string(),
                    "abc123".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "excludes-file".to_string(),
                "in.txt\n".to_string(),
            )])),
            ..Default::default()
        };

        let obj = to_dynamic(&cm).unwrap();
        assert_eq!(obj.name_any(), "excludes-file-abc123");
        assert_eq!(obj.types.as_ref().map(|t| t.kind.as_str()), Some("ConfigMap"));
        assert_eq!(labels_of(&obj)["external-id"], "abc123");
        assert_eq!(obj.data["data"]["excludes-file"], "in.txt\n");
    }

    #[test]
    fn test_teardown_order_covers_every_kind() {
        let mut kinds = ResourceKind::ALL.to_vec();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), 6);
    }
}
