//! Mirrors the AMQ broker's login into a namespace secret and reports it to
//! the state collaborator.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};
use walkthrough_core::{payload, Notification, NotificationSink, PayloadError, Resource, ResourceClient};

pub use walkthrough_core::AmqCredentials;

use crate::error::ProvisionResult;
use crate::reconcile::{self, Replaced};
use crate::resources;

const ENV_FIELD: &str = "spec.template.spec.containers[0].env";
const USER_ENV: &str = "AMQ_USER";
const PASSWORD_ENV: &str = "AMQ_PASSWORD";

/// Conversions between broker credentials and the resources that carry them.
pub trait BrokerLogin: Sized {
    /// Read `AMQ_USER`/`AMQ_PASSWORD` from the first container's env.
    fn from_stateful_set(sset: &Resource) -> Result<Self, PayloadError>;

    /// True when the stored secret already holds these values.
    fn matches_secret(&self, secret: &Resource) -> bool;

    fn to_secret(&self, name: &str, namespace: &str) -> ProvisionResult<Resource>;
}

impl BrokerLogin for AmqCredentials {
    fn from_stateful_set(sset: &Resource) -> Result<Self, PayloadError> {
        let env = sset
            .pointer("/spec/template/spec/containers/0/env")
            .ok_or(PayloadError::Missing(ENV_FIELD))?
            .as_array()
            .ok_or_else(|| PayloadError::Invalid { field: ENV_FIELD, reason: "expected array".into() })?;
        Ok(Self { username: env_value(env, USER_ENV)?, password: env_value(env, PASSWORD_ENV)? })
    }

    fn matches_secret(&self, secret: &Resource) -> bool {
        let stored = |key: &str| secret.pointer(&format!("/data/{}", key)).and_then(Value::as_str).map(str::to_string);
        stored("username") == Some(BASE64_STANDARD.encode(&self.username))
            && stored("password") == Some(BASE64_STANDARD.encode(&self.password))
    }

    fn to_secret(&self, name: &str, namespace: &str) -> ProvisionResult<Resource> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([
                ("username".to_string(), self.username.clone()),
                ("password".to_string(), self.password.clone()),
            ])),
            ..Default::default()
        };
        Ok(serde_json::to_value(secret)?)
    }
}

fn env_value(env: &[Value], key: &'static str) -> Result<String, PayloadError> {
    env.iter()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(key))
        .and_then(|e| e.get("value"))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(PayloadError::Missing(key))
}

#[derive(Debug, Clone, PartialEq)]
pub enum CredentialOutcome {
    /// The statefulset carried no usable credentials; nothing was sent.
    Skipped(PayloadError),
    Created,
    Unchanged,
    Updated,
}

pub struct CredentialPropagator {
    client: Arc<dyn ResourceClient>,
    secret_name: String,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl CredentialPropagator {
    pub fn new(client: Arc<dyn ResourceClient>, secret_name: impl Into<String>) -> Self {
        Self { client, secret_name: secret_name.into(), sink: None }
    }

    /// Also send [`Notification::Credentials`] once the secret holds the login.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn on_stateful_set_event(&self, namespace: &str, sset: &Resource) -> ProvisionResult<CredentialOutcome> {
        let creds = match AmqCredentials::from_stateful_set(sset) {
            Ok(creds) => creds,
            Err(e) => {
                counter!("walkthrough_payload_skipped_total", 1u64);
                debug!(ns = %namespace, statefulset = ?payload::name(sset), reason = %e, "no broker credentials on statefulset");
                return Ok(CredentialOutcome::Skipped(e));
            }
        };
        let desired = creds.to_secret(&self.secret_name, namespace)?;
        let replaced = reconcile::replace_if(self.client.as_ref(), &resources::secrets(namespace), &desired, |current| {
            !creds.matches_secret(current)
        })
        .await?;
        let outcome = match replaced {
            Replaced::Created(_) => {
                counter!("walkthrough_secret_updates_total", 1u64);
                info!(ns = %namespace, secret = %self.secret_name, "broker credentials secret created");
                CredentialOutcome::Created
            }
            Replaced::Updated(_) => {
                counter!("walkthrough_secret_updates_total", 1u64);
                info!(ns = %namespace, secret = %self.secret_name, "broker credentials secret updated");
                CredentialOutcome::Updated
            }
            Replaced::Unchanged(_) => CredentialOutcome::Unchanged,
        };
        if let Some(sink) = &self.sink {
            sink.notify(Notification::Credentials(creds)).await;
        }
        Ok(outcome)
    }
}
