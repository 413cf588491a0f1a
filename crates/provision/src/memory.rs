//! In-process stand-in for the cluster API.
//!
//! Behaves like the server where the engine depends on it: assigns names for
//! `generateName`, stores `stringData` as base64 `data`, bumps
//! `resourceVersion` and rejects updates carrying a stale one, replays current
//! objects to new watchers and materializes a project for every project
//! request. Every call is recorded so tests can assert on remote traffic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::{Map, Value};
use walkthrough_core::{
    payload, Op, Resource, ResourceClient, ResourceDescriptor, ResourceList, TransportError, User, WatchEvent,
    WatchStream,
};

type EventTx = UnboundedSender<Result<WatchEvent, TransportError>>;

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub resource_type: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<Resource>>,
    watchers: HashMap<String, Vec<EventTx>>,
    failures: HashMap<Op, String>,
    calls: Vec<Call>,
    next_id: u64,
    next_rv: u64,
}

pub struct MemoryClient {
    user: User,
    inner: Mutex<Inner>,
}

impl MemoryClient {
    pub fn new(username: &str) -> Self {
        Self { user: User::new(username), inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge every later assertion.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace an object as if another actor wrote it. Not recorded as a call.
    pub fn seed(&self, descriptor: &ResourceDescriptor, obj: Resource) -> Resource {
        let mut inner = self.lock();
        let (stored, existed) = inner.store(descriptor, obj);
        let event = if existed { WatchEvent::Modified(stored.clone()) } else { WatchEvent::Added(stored.clone()) };
        inner.broadcast(descriptor, event);
        stored
    }

    /// Delete an object as if another actor removed it. Not recorded as a call.
    pub fn evict(&self, descriptor: &ResourceDescriptor, name: &str) -> Option<Resource> {
        let mut inner = self.lock();
        let removed = inner.take(descriptor, name)?;
        inner.broadcast(descriptor, WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    /// Make the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: Op, message: &str) {
        self.lock().failures.insert(op, message.to_string());
    }

    /// End every open watch stream on the collection, as a server timeout would.
    pub fn close_watches(&self, descriptor: &ResourceDescriptor) {
        self.lock().watchers.remove(&descriptor.collection_key());
    }

    pub fn watcher_count(&self, descriptor: &ResourceDescriptor) -> usize {
        self.lock()
            .watchers
            .get(&descriptor.collection_key())
            .map(|w| w.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn items(&self, descriptor: &ResourceDescriptor) -> Vec<Resource> {
        self.lock().collections.get(&descriptor.collection_key()).cloned().unwrap_or_default()
    }

    pub fn get(&self, descriptor: &ResourceDescriptor, name: &str) -> Option<Resource> {
        self.items(descriptor).into_iter().find(|r| payload::name(r) == Some(name))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn count_for(&self, op: Op, resource_type: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op && c.resource_type == resource_type).count()
    }

    /// Record the call and consume any injected failure for it.
    fn begin(&self, op: Op, descriptor: Option<&ResourceDescriptor>, obj: Option<&Resource>) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.calls.push(Call {
            op,
            resource_type: descriptor.map(|d| d.resource_type.clone()).unwrap_or_default(),
            namespace: descriptor.and_then(|d| d.namespace.clone()),
            name: obj.and_then(payload::name).map(str::to_string),
        });
        match inner.failures.remove(&op) {
            Some(message) => {
                let resource = descriptor.map(|d| d.to_string()).unwrap_or_default();
                Err(TransportError::new(op, resource, message))
            }
            None => Ok(()),
        }
    }
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    /// Normalize and store; returns the stored copy and whether it replaced one.
    fn store(&mut self, descriptor: &ResourceDescriptor, mut obj: Resource) -> (Resource, bool) {
        if payload::name(&obj).is_none() {
            let generated = obj
                .pointer("/metadata/generateName")
                .and_then(Value::as_str)
                .map(|prefix| {
                    self.next_id += 1;
                    format!("{}{:05x}", prefix, self.next_id)
                });
            if let Some(name) = generated {
                let _ = payload::set_metadata_str(&mut obj, "name", &name);
            }
        }
        if let Some(ns) = descriptor.namespace.as_deref() {
            let _ = payload::set_metadata_str(&mut obj, "namespace", ns);
        }
        let rv = self.bump_rv();
        let _ = payload::set_metadata_str(&mut obj, "resourceVersion", &rv);
        encode_string_data(&mut obj);

        let name = payload::name(&obj).map(str::to_string);
        let items = self.collections.entry(descriptor.collection_key()).or_default();
        let existing = items.iter().position(|r| name.is_some() && payload::name(r) == name.as_deref());
        match existing {
            Some(idx) => {
                items[idx] = obj.clone();
                (obj, true)
            }
            None => {
                items.push(obj.clone());
                (obj, false)
            }
        }
    }

    fn take(&mut self, descriptor: &ResourceDescriptor, name: &str) -> Option<Resource> {
        let items = self.collections.get_mut(&descriptor.collection_key())?;
        let idx = items.iter().position(|r| payload::name(r) == Some(name))?;
        Some(items.remove(idx))
    }

    fn find(&self, descriptor: &ResourceDescriptor, name: &str) -> Option<&Resource> {
        self.collections
            .get(&descriptor.collection_key())?
            .iter()
            .find(|r| payload::name(r) == Some(name))
    }

    fn contains(&self, descriptor: &ResourceDescriptor, name: &str) -> bool {
        self.find(descriptor, name).is_some()
    }

    fn broadcast(&mut self, descriptor: &ResourceDescriptor, event: WatchEvent) {
        if let Some(senders) = self.watchers.get_mut(&descriptor.collection_key()) {
            senders.retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
        }
    }
}

/// Mirror the API server: `stringData` is merged into base64 `data` on write.
fn encode_string_data(obj: &mut Resource) {
    let Some(map) = obj.as_object_mut() else { return };
    let Some(Value::Object(plain)) = map.remove("stringData") else { return };
    let data = map.entry("data").or_insert_with(|| Value::Object(Map::new()));
    if let Some(data) = data.as_object_mut() {
        for (k, v) in plain {
            let text = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
            data.insert(k, Value::String(BASE64_STANDARD.encode(text)));
        }
    }
}

fn project_from_request(name: &str) -> Resource {
    serde_json::json!({
        "apiVersion": "project.openshift.io/v1",
        "kind": "Project",
        "metadata": {"name": name},
        "status": {"phase": "Active"}
    })
}

#[async_trait::async_trait]
impl ResourceClient for MemoryClient {
    async fn list(&self, descriptor: &ResourceDescriptor) -> Result<ResourceList, TransportError> {
        self.begin(Op::List, Some(descriptor), None)?;
        Ok(ResourceList { items: self.items(descriptor) })
    }

    async fn create(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError> {
        self.begin(Op::Create, Some(descriptor), Some(obj))?;
        let mut inner = self.lock();
        if let Some(name) = payload::name(obj) {
            if inner.contains(descriptor, name) {
                return Err(TransportError::new(Op::Create, descriptor.to_string(), format!("{} already exists", name)));
            }
        }
        let (stored, _) = inner.store(descriptor, obj.clone());
        inner.broadcast(descriptor, WatchEvent::Added(stored.clone()));
        if descriptor.resource_type == "projectrequests" {
            if let Some(name) = payload::name(&stored).map(str::to_string) {
                let projects = crate::resources::projects();
                let (project, _) = inner.store(&projects, project_from_request(&name));
                inner.broadcast(&projects, WatchEvent::Added(project));
            }
        }
        Ok(stored)
    }

    async fn update(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError> {
        self.begin(Op::Update, Some(descriptor), Some(obj))?;
        let mut inner = self.lock();
        let name = payload::name(obj)
            .ok_or_else(|| TransportError::new(Op::Update, descriptor.to_string(), "object has no metadata.name"))?;
        let Some(current) = inner.find(descriptor, name) else {
            return Err(TransportError::new(Op::Update, descriptor.to_string(), format!("{} not found", name)));
        };
        // An update without a resourceVersion is unconditional, as on the server.
        if let Some(sent) = payload::resource_version(obj) {
            let stored_rv = payload::resource_version(current).unwrap_or_default();
            if sent != stored_rv {
                return Err(TransportError::new(
                    Op::Update,
                    descriptor.to_string(),
                    format!("conflict: {} has resourceVersion {}, update sent {}", name, stored_rv, sent),
                ));
            }
        }
        let (stored, _) = inner.store(descriptor, obj.clone());
        inner.broadcast(descriptor, WatchEvent::Modified(stored.clone()));
        Ok(stored)
    }

    async fn remove(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<(), TransportError> {
        self.begin(Op::Remove, Some(descriptor), Some(obj))?;
        let mut inner = self.lock();
        let name = payload::name(obj)
            .ok_or_else(|| TransportError::new(Op::Remove, descriptor.to_string(), "object has no metadata.name"))?;
        let removed = inner
            .take(descriptor, name)
            .ok_or_else(|| TransportError::new(Op::Remove, descriptor.to_string(), format!("{} not found", name)))?;
        inner.broadcast(descriptor, WatchEvent::Deleted(removed));
        Ok(())
    }

    async fn watch(&self, descriptor: &ResourceDescriptor) -> Result<WatchStream, TransportError> {
        self.begin(Op::Watch, Some(descriptor), None)?;
        let (tx, rx) = unbounded();
        let mut inner = self.lock();
        let current = inner.collections.get(&descriptor.collection_key()).cloned().unwrap_or_default();
        for obj in current {
            let _ = tx.unbounded_send(Ok(WatchEvent::Added(obj)));
        }
        inner.watchers.entry(descriptor.collection_key()).or_default().push(tx);
        Ok(rx.boxed())
    }

    async fn current_user(&self) -> Result<User, TransportError> {
        self.begin(Op::CurrentUser, None, None)?;
        Ok(self.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_generated_names_and_encodes_string_data() {
        let client = MemoryClient::new("dev");
        let si = client
            .create(&resources::service_instances("ns"), &json!({"metadata": {"generateName": "fuse-"}}))
            .await
            .unwrap();
        let name = payload::name(&si).unwrap();
        assert!(name.starts_with("fuse-") && name.len() > "fuse-".len());
        assert_eq!(payload::namespace(&si), Ok("ns"));

        let secret = client
            .create(&resources::secrets("ns"), &json!({"metadata": {"name": "s"}, "stringData": {"username": "admin"}}))
            .await
            .unwrap();
        assert_eq!(secret["data"]["username"], "YWRtaW4=");
        assert!(secret.get("stringData").is_none());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_like_the_server() {
        let client = MemoryClient::new("dev");
        let d = resources::secrets("ns");
        let obj = json!({"metadata": {"name": "s"}});
        client.create(&d, &obj).await.unwrap();
        let err = client.create(&d, &obj).await.unwrap_err();
        assert!(err.message.contains("already exists"));
    }

    #[tokio::test]
    async fn stale_resource_version_update_conflicts() {
        let client = MemoryClient::new("dev");
        let d = resources::secrets("ns");
        let mine = client.create(&d, &json!({"metadata": {"name": "s"}, "stringData": {"k": "v1"}})).await.unwrap();
        client.seed(&d, json!({"metadata": {"name": "s"}, "stringData": {"k": "v2"}}));

        let mut stale = mine.clone();
        stale["data"]["k"] = json!("djM=");
        let err = client.update(&d, &stale).await.unwrap_err();
        assert_eq!(err.op, Op::Update);
        assert!(err.message.starts_with("conflict"), "{}", err.message);
        assert_eq!(client.get(&d, "s").unwrap()["data"]["k"], "djI=");

        let fresh = client.get(&d, "s").unwrap();
        client.update(&d, &fresh).await.unwrap();
        client.update(&d, &json!({"metadata": {"name": "s"}})).await.unwrap();
    }

    #[tokio::test]
    async fn project_request_materializes_a_project() {
        let client = MemoryClient::new("dev");
        client
            .create(&resources::project_requests(), &json!({"metadata": {"name": "p"}}))
            .await
            .unwrap();
        assert!(client.get(&resources::projects(), "p").is_some());
    }

    #[tokio::test]
    async fn watch_replays_existing_then_streams_changes() {
        let client = MemoryClient::new("dev");
        let d = resources::routes("ns");
        client.seed(&d, json!({"metadata": {"name": "a"}}));
        let mut stream = client.watch(&d).await.unwrap();
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Added(_)))));

        client.seed(&d, json!({"metadata": {"name": "a"}, "spec": {"host": "h"}}));
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Modified(_)))));

        client.evict(&d, "a");
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Deleted(_)))));

        client.close_watches(&d);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_failure_hits_only_the_next_call() {
        let client = MemoryClient::new("dev");
        client.fail_next(Op::CurrentUser, "unauthorized");
        assert!(client.current_user().await.is_err());
        assert_eq!(client.current_user().await.unwrap().username, "dev");
    }
}
