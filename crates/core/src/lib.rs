//! Walkthrough core types: resource descriptors, watch events, state notifications
//! and the cluster API boundary consumed by the provisioning engine.

#![forbid(unsafe_code)]

use std::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

pub mod payload;

/// A remote resource snapshot as returned by the cluster API.
pub type Resource = serde_json::Value;

/// Authenticated user, as reported by the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct User {
    pub username: String,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into() }
    }
}

/// Identifies one collection of resources in the remote API.
///
/// `namespace` is `None` for cluster-scoped collections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    /// Plural resource name, e.g. `serviceinstances`.
    pub resource_type: String,
    pub api_group: String,
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
}

impl ResourceDescriptor {
    pub fn cluster(resource_type: &str, api_group: &str, api_version: &str, kind: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            api_group: api_group.to_string(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Value of the `apiVersion` field for objects in this collection.
    pub fn api_version_string(&self) -> String {
        if self.api_group.is_empty() {
            self.api_version.clone()
        } else {
            format!("{}/{}", self.api_group, self.api_version)
        }
    }

    /// Stable key for the collection (group/version/resource plus namespace).
    pub fn collection_key(&self) -> String {
        format!("{}@{}", self, self.namespace.as_deref().unwrap_or(""))
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.api_group.is_empty() {
            write!(f, "{}/{}", self.api_version, self.resource_type)
        } else {
            write!(f, "{}/{}/{}", self.api_group, self.api_version, self.resource_type)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceList {
    #[serde(default)]
    pub items: Vec<Resource>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Opened,
    Closed,
    Added,
    Modified,
    Deleted,
}

/// One notification from a watch subscription.
///
/// `Opened` and `Closed` mark the connection lifecycle and carry no payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WatchEvent {
    Opened,
    Closed,
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
}

impl WatchEvent {
    pub fn kind(&self) -> WatchEventKind {
        match self {
            WatchEvent::Opened => WatchEventKind::Opened,
            WatchEvent::Closed => WatchEventKind::Closed,
            WatchEvent::Added(_) => WatchEventKind::Added,
            WatchEvent::Modified(_) => WatchEventKind::Modified,
            WatchEvent::Deleted(_) => WatchEventKind::Deleted,
        }
    }

    pub fn payload(&self) -> Option<&Resource> {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => Some(r),
            WatchEvent::Opened | WatchEvent::Closed => None,
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        self.payload().is_none()
    }
}

/// Raw event stream for one collection. Ends when the server closes the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, TransportError>>;

/// Remote operation kinds, used to label transport failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Create,
    Update,
    Remove,
    Watch,
    CurrentUser,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::List => "list",
            Op::Create => "create",
            Op::Update => "update",
            Op::Remove => "remove",
            Op::Watch => "watch",
            Op::CurrentUser => "current-user",
        };
        f.write_str(s)
    }
}

/// A remote API call failed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{op} {resource}: {message}")]
pub struct TransportError {
    pub op: Op,
    pub resource: String,
    pub message: String,
}

impl TransportError {
    pub fn new(op: Op, resource: impl Into<String>, message: impl fmt::Display) -> Self {
        Self { op, resource: resource.into(), message: message.to_string() }
    }
}

/// An event payload lacks a field the handler needs.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("invalid field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Key under which broker credentials travel through the notification path.
pub const CREDENTIALS_KEY: &str = "amq-credentials";

/// Login of the user's AMQ broker, as mirrored into the credentials secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmqCredentials {
    pub username: String,
    pub password: String,
}

/// Notification delivered to the application-state collaborator.
///
/// For service instances `key` is the service class external name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Notification {
    Upserted { key: String, resource: Resource },
    Removed { key: String, resource: Resource },
    /// The broker credentials currently held in the secret.
    Credentials(AmqCredentials),
}

impl Notification {
    pub fn key(&self) -> &str {
        match self {
            Notification::Upserted { key, .. } | Notification::Removed { key, .. } => key,
            Notification::Credentials(_) => CREDENTIALS_KEY,
        }
    }

    pub fn resource(&self) -> Option<&Resource> {
        match self {
            Notification::Upserted { resource, .. } | Notification::Removed { resource, .. } => Some(resource),
            Notification::Credentials(_) => None,
        }
    }
}

/// Receiver side of state notifications.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

#[async_trait::async_trait]
impl NotificationSink for mpsc::Sender<Notification> {
    async fn notify(&self, notification: Notification) {
        let key = notification.key().to_string();
        if self.send(notification).await.is_err() {
            warn!(key = %key, "notification receiver dropped; discarding");
        }
    }
}

/// Cluster API boundary. Every call may fail with a [`TransportError`].
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self, descriptor: &ResourceDescriptor) -> Result<ResourceList, TransportError>;

    async fn create(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError>;

    /// Replace the object addressed by `obj.metadata.name`.
    async fn update(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError>;

    /// Delete the object addressed by `obj.metadata.name`.
    async fn remove(&self, descriptor: &ResourceDescriptor, obj: &Resource) -> Result<(), TransportError>;

    /// Open a watch on the collection. The stream yields only `Added`, `Modified`
    /// and `Deleted`; the subscription layer owns the lifecycle markers.
    async fn watch(&self, descriptor: &ResourceDescriptor) -> Result<WatchStream, TransportError>;

    async fn current_user(&self) -> Result<User, TransportError>;
}

pub mod prelude {
    pub use super::{
        AmqCredentials, Notification, NotificationSink, Op, PayloadError, Resource, ResourceClient, ResourceDescriptor,
        ResourceList, TransportError, User, WatchEvent, WatchEventKind, WatchStream,
    };
}
