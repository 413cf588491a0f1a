//! Walkthrough kubehub – `ResourceClient` over kube-rs dynamic objects

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::counter;
use tracing::{debug, info};
use walkthrough_core::{
    Op, Resource, ResourceClient, ResourceDescriptor, ResourceList, TransportError, User, WatchEvent, WatchStream,
};

/// Cluster client backed by a kube `Client`.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self { client })
    }

    fn api(&self, descriptor: &ResourceDescriptor) -> Api<DynamicObject> {
        let ar = api_resource(descriptor);
        match descriptor.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

/// Map a descriptor onto the kube `ApiResource` without a discovery round-trip.
pub fn api_resource(descriptor: &ResourceDescriptor) -> ApiResource {
    ApiResource {
        group: descriptor.api_group.clone(),
        version: descriptor.api_version.clone(),
        api_version: descriptor.api_version_string(),
        kind: descriptor.kind.clone(),
        plural: descriptor.resource_type.clone(),
    }
}

fn transport(op: Op, descriptor: &ResourceDescriptor, err: impl std::fmt::Display) -> TransportError {
    counter!("walkthrough_transport_errors_total", 1u64);
    TransportError::new(op, descriptor.to_string(), err)
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Serialize a dynamic object back into a raw snapshot.
fn to_resource(obj: &DynamicObject) -> serde_json::Result<Resource> {
    let mut raw = serde_json::to_value(obj)?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// Stamp `apiVersion`/`kind` from the descriptor when the object omits them.
fn to_dynamic(descriptor: &ResourceDescriptor, obj: &Resource) -> serde_json::Result<DynamicObject> {
    let mut raw = obj.clone();
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| serde_json::Value::String(descriptor.api_version_string()));
        map.entry("kind")
            .or_insert_with(|| serde_json::Value::String(descriptor.kind.clone()));
    }
    serde_json::from_value(raw)
}

fn object_name(op: Op, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<String, TransportError> {
    walkthrough_core::payload::name(obj)
        .map(str::to_string)
        .ok_or_else(|| TransportError::new(op, descriptor.to_string(), "object has no metadata.name"))
}

fn convert_event(
    descriptor: &ResourceDescriptor,
    ev: KubeWatchEvent<DynamicObject>,
) -> Option<Result<WatchEvent, TransportError>> {
    let wrap = |o: &DynamicObject| to_resource(o).map_err(|e| transport(Op::Watch, descriptor, e));
    match ev {
        KubeWatchEvent::Added(o) => Some(wrap(&o).map(WatchEvent::Added)),
        KubeWatchEvent::Modified(o) => Some(wrap(&o).map(WatchEvent::Modified)),
        KubeWatchEvent::Deleted(o) => Some(wrap(&o).map(WatchEvent::Deleted)),
        KubeWatchEvent::Bookmark(_) => None,
        KubeWatchEvent::Error(e) => Some(Err(transport(Op::Watch, descriptor, e))),
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn list(&self, descriptor: &ResourceDescriptor) -> Result<ResourceList, TransportError> {
        let list = self
            .api(descriptor)
            .list(&ListParams::default())
            .await
            .map_err(|e| transport(Op::List, descriptor, e))?;
        let items = list
            .items
            .iter()
            .map(to_resource)
            .collect::<serde_json::Result<Vec<_>>>()
            .map_err(|e| transport(Op::List, descriptor, e))?;
        debug!(resource = %descriptor, ns = ?descriptor.namespace, count = items.len(), "list ok");
        Ok(ResourceList { items })
    }

    async fn create(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError> {
        let data = to_dynamic(descriptor, obj).map_err(|e| transport(Op::Create, descriptor, e))?;
        let created = self
            .api(descriptor)
            .create(&PostParams::default(), &data)
            .await
            .map_err(|e| transport(Op::Create, descriptor, e))?;
        info!(resource = %descriptor, name = ?created.metadata.name, "created");
        to_resource(&created).map_err(|e| transport(Op::Create, descriptor, e))
    }

    async fn update(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError> {
        let name = object_name(Op::Update, descriptor, obj)?;
        let data = to_dynamic(descriptor, obj).map_err(|e| transport(Op::Update, descriptor, e))?;
        let replaced = self
            .api(descriptor)
            .replace(&name, &PostParams::default(), &data)
            .await
            .map_err(|e| transport(Op::Update, descriptor, e))?;
        info!(resource = %descriptor, name = %name, "updated");
        to_resource(&replaced).map_err(|e| transport(Op::Update, descriptor, e))
    }

    async fn remove(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<(), TransportError> {
        let name = object_name(Op::Remove, descriptor, obj)?;
        self.api(descriptor)
            .delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| transport(Op::Remove, descriptor, e))?;
        info!(resource = %descriptor, name = %name, "removed");
        Ok(())
    }

    async fn watch(&self, descriptor: &ResourceDescriptor) -> Result<WatchStream, TransportError> {
        // Version "0" makes the server replay current objects as ADDED first.
        let stream = self
            .api(descriptor)
            .watch(&WatchParams::default(), "0")
            .await
            .map_err(|e| transport(Op::Watch, descriptor, e))?;
        info!(resource = %descriptor, ns = ?descriptor.namespace, "watch opened");
        let d = descriptor.clone();
        let events = stream
            .map_err({
                let d = d.clone();
                move |e| transport(Op::Watch, &d, e)
            })
            .filter_map(move |item| {
                let out = match item {
                    Ok(ev) => convert_event(&d, ev),
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(out)
            });
        Ok(events.boxed())
    }

    async fn current_user(&self) -> Result<User, TransportError> {
        let ar = ApiResource {
            group: "user.openshift.io".into(),
            version: "v1".into(),
            api_version: "user.openshift.io/v1".into(),
            kind: "User".into(),
            plural: "users".into(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let me = api
            .get("~")
            .await
            .map_err(|e| TransportError::new(Op::CurrentUser, "user.openshift.io/v1/users", e))?;
        let username = me
            .metadata
            .name
            .ok_or_else(|| TransportError::new(Op::CurrentUser, "user.openshift.io/v1/users", "user has no name"))?;
        Ok(User { username })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn si_descriptor() -> ResourceDescriptor {
        ResourceDescriptor::cluster("serviceinstances", "servicecatalog.k8s.io", "v1beta1", "ServiceInstance")
            .in_namespace("u-walkthrough-projects")
    }

    #[test]
    fn api_resource_mirrors_descriptor() {
        let ar = api_resource(&si_descriptor());
        assert_eq!(ar.group, "servicecatalog.k8s.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.api_version, "servicecatalog.k8s.io/v1beta1");
        assert_eq!(ar.kind, "ServiceInstance");
        assert_eq!(ar.plural, "serviceinstances");
    }

    #[test]
    fn to_dynamic_stamps_type_meta_and_keeps_generate_name() {
        let obj = json!({
            "metadata": {"generateName": "fuse-", "namespace": "ns"},
            "spec": {"clusterServiceClassExternalName": "fuse"}
        });
        let d = to_dynamic(&si_descriptor(), &obj).expect("valid object");
        let types = d.types.clone().expect("type meta");
        assert_eq!(types.api_version, "servicecatalog.k8s.io/v1beta1");
        assert_eq!(types.kind, "ServiceInstance");
        assert_eq!(d.metadata.generate_name.as_deref(), Some("fuse-"));
        assert_eq!(d.data["spec"]["clusterServiceClassExternalName"], "fuse");
    }

    #[test]
    fn to_resource_strips_managed_fields() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "s", "managedFields": [{"manager": "kubectl"}]},
            "data": {"username": "dQ=="}
        }))
        .unwrap();
        let raw = to_resource(&obj).unwrap();
        assert!(raw["metadata"].get("managedFields").is_none());
        assert_eq!(raw["data"]["username"], "dQ==");
    }

    #[test]
    fn update_requires_a_name() {
        let err = object_name(Op::Update, &si_descriptor(), &json!({"metadata": {}})).unwrap_err();
        assert_eq!(err.op, Op::Update);
        assert!(err.message.contains("metadata.name"));
    }
}
