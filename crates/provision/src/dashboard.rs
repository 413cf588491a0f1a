//! Dashboard links for service instances.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};
use walkthrough_core::{payload, PayloadError, Resource, ResourceClient};

use crate::config::DASHBOARD_URL_ANNOTATION;
use crate::error::ProvisionResult;
use crate::{reconcile, resources};

pub use walkthrough_core::payload::dashboard_url;

#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationOutcome {
    AlreadyAnnotated,
    /// No console route (or no host) yet; the next upsert tries again.
    RouteMissing,
    Annotated(String),
    Skipped(PayloadError),
}

pub struct DashboardAnnotator {
    client: Arc<dyn ResourceClient>,
    route_name: String,
}

impl DashboardAnnotator {
    pub fn new(client: Arc<dyn ResourceClient>, route_name: impl Into<String>) -> Self {
        Self { client, route_name: route_name.into() }
    }

    pub async fn on_service_instance_upsert(&self, instance: &Resource) -> ProvisionResult<AnnotationOutcome> {
        if payload::annotation(instance, DASHBOARD_URL_ANNOTATION).is_some() {
            return Ok(AnnotationOutcome::AlreadyAnnotated);
        }
        let ns = match payload::namespace(instance) {
            Ok(ns) => ns,
            Err(e) => {
                counter!("walkthrough_payload_skipped_total", 1u64);
                debug!(instance = ?payload::name(instance), reason = %e, "cannot annotate service instance");
                return Ok(AnnotationOutcome::Skipped(e));
            }
        };

        let route = reconcile::find(self.client.as_ref(), &resources::routes(ns), |r| {
            payload::name(r) == Some(self.route_name.as_str())
        })
        .await?;
        let Some(host) = route
            .as_ref()
            .and_then(|r| r.pointer("/spec/host"))
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
        else {
            debug!(ns = %ns, route = %self.route_name, "console route not ready");
            return Ok(AnnotationOutcome::RouteMissing);
        };

        let url = format!("http://{}", host);
        let mut next = instance.clone();
        payload::set_annotation(&mut next, DASHBOARD_URL_ANNOTATION, &url)?;
        self.client.update(&resources::service_instances(ns), &next).await?;
        counter!("walkthrough_annotations_total", 1u64);
        info!(ns = %ns, instance = ?payload::name(instance), url = %url, "dashboard url annotated");
        Ok(AnnotationOutcome::Annotated(url))
    }
}
