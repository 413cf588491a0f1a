//! Watch event routing for the two per-user subscriptions.

use std::sync::Arc;

use metrics::counter;
use rustc_hash::FxHashSet;
use tracing::debug;
use walkthrough_core::{payload, Notification, NotificationSink, WatchEvent};

use crate::credentials::{CredentialOutcome, CredentialPropagator};
use crate::dashboard::{AnnotationOutcome, DashboardAnnotator};
use crate::error::ProvisionResult;
use crate::watch::EventHandler;

#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Ignored,
    Upserted { key: String, annotation: AnnotationOutcome },
    Removed { key: String },
}

/// Turns service-instance events for allow-listed classes into notifications
/// and keeps their dashboard annotation current.
pub struct ServiceInstanceRouter {
    allow_list: FxHashSet<String>,
    sink: Arc<dyn NotificationSink>,
    annotator: DashboardAnnotator,
}

impl ServiceInstanceRouter {
    pub fn new<I, S>(allow_list: I, sink: Arc<dyn NotificationSink>, annotator: DashboardAnnotator) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allow_list: allow_list.into_iter().map(Into::into).collect(), sink, annotator }
    }

    pub async fn route(&self, event: WatchEvent) -> ProvisionResult<Routed> {
        let (deleted, resource) = match event {
            WatchEvent::Opened | WatchEvent::Closed => return Ok(Routed::Ignored),
            WatchEvent::Added(r) | WatchEvent::Modified(r) => (false, r),
            WatchEvent::Deleted(r) => (true, r),
        };
        let key = match payload::class_name(&resource) {
            Ok(class) if self.allow_list.contains(class) => class.to_string(),
            Ok(class) => {
                debug!(class = %class, "service instance outside the walkthrough set");
                return Ok(Routed::Ignored);
            }
            Err(e) => {
                counter!("walkthrough_payload_skipped_total", 1u64);
                debug!(instance = ?payload::name(&resource), reason = %e, "service instance without class");
                return Ok(Routed::Ignored);
            }
        };

        counter!("walkthrough_notifications_total", 1u64);
        if deleted {
            self.sink.notify(Notification::Removed { key: key.clone(), resource }).await;
            return Ok(Routed::Removed { key });
        }
        self.sink.notify(Notification::Upserted { key: key.clone(), resource: resource.clone() }).await;
        let annotation = self.annotator.on_service_instance_upsert(&resource).await?;
        Ok(Routed::Upserted { key, annotation })
    }
}

#[async_trait::async_trait]
impl EventHandler for ServiceInstanceRouter {
    async fn handle(&self, event: WatchEvent) -> ProvisionResult<()> {
        self.route(event).await.map(|_| ())
    }
}

/// Feeds statefulset changes in one namespace to the credential propagator.
pub struct StatefulSetRouter {
    namespace: String,
    propagator: CredentialPropagator,
}

impl StatefulSetRouter {
    pub fn new(namespace: impl Into<String>, propagator: CredentialPropagator) -> Self {
        Self { namespace: namespace.into(), propagator }
    }

    /// `None` for events that carry nothing to propagate.
    pub async fn route(&self, event: WatchEvent) -> ProvisionResult<Option<CredentialOutcome>> {
        match event {
            WatchEvent::Added(sset) | WatchEvent::Modified(sset) => {
                Ok(Some(self.propagator.on_stateful_set_event(&self.namespace, &sset).await?))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for StatefulSetRouter {
    async fn handle(&self, event: WatchEvent) -> ProvisionResult<()> {
        self.route(event).await.map(|_| ())
    }
}
