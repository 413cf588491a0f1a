//! Per-user namespace naming and the find-or-create of the walkthrough project.
//!
//! Namespace names derive from the username alone, so the same user always
//! lands in the same project across runs.

use std::sync::Arc;

use serde_json::json;
use tracing::info;
use walkthrough_core::{Resource, ResourceClient, User};

use crate::config::NAMESPACE_SUFFIX;
use crate::error::ProvisionResult;
use crate::{reconcile, resources};

/// Replace the characters usernames carry but namespace names reject.
pub fn sanitize_username(username: &str) -> String {
    username.replace(|c: char| c == '@' || c == '.', "-")
}

/// Namespace holding a user's walkthrough services.
pub fn namespace_name(username: &str) -> String {
    namespace_name_with_suffix(username, NAMESPACE_SUFFIX)
}

pub fn namespace_name_with_suffix(username: &str, suffix: &str) -> String {
    format!("{}{}", sanitize_username(username), suffix)
}

/// Ensures the per-user project exists.
///
/// Lookup runs against `projects`, creation against `projectrequests`: the
/// platform provisions the project asynchronously, so a freshly returned
/// request does not mean the namespace is usable yet.
pub struct NamespaceProvisioner {
    client: Arc<dyn ResourceClient>,
    suffix: String,
}

impl NamespaceProvisioner {
    pub fn new(client: Arc<dyn ResourceClient>, suffix: impl Into<String>) -> Self {
        Self { client, suffix: suffix.into() }
    }

    pub fn name_for(&self, user: &User) -> String {
        namespace_name_with_suffix(&user.username, &self.suffix)
    }

    /// Returns the existing project, or the project request just submitted.
    pub async fn ensure_namespace(&self, user: &User) -> ProvisionResult<Resource> {
        let name = self.name_for(user);
        let request = json!({
            "apiVersion": "project.openshift.io/v1",
            "kind": "ProjectRequest",
            "metadata": { "name": name },
        });
        if let Some(project) = reconcile::find(self.client.as_ref(), &resources::projects(), reconcile::by_name(&request)).await? {
            return Ok(project);
        }
        let created = self.client.create(&resources::project_requests(), &request).await?;
        metrics::counter!("walkthrough_creates_total", 1u64);
        info!(ns = %name, user = %user.username, "project requested");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClient;
    use walkthrough_core::Op;

    #[test]
    fn namespace_name_replaces_at_and_dots() {
        assert_eq!(namespace_name("foo.bar@example.com"), "foo-bar-example-com-walkthrough-projects");
        assert_eq!(namespace_name("plain"), "plain-walkthrough-projects");
    }

    #[test]
    fn namespace_name_is_stable() {
        let once = namespace_name("a.b@c");
        assert_eq!(once, namespace_name("a.b@c"));
        assert_ne!(namespace_name("ab@c"), namespace_name("ac@b"));
    }

    #[tokio::test]
    async fn second_call_only_looks_up() {
        let client = Arc::new(MemoryClient::new("dev"));
        let provisioner = NamespaceProvisioner::new(client.clone(), NAMESPACE_SUFFIX);
        let user = User::new("dev@example.com");

        let first = provisioner.ensure_namespace(&user).await.unwrap();
        assert_eq!(first["kind"], "ProjectRequest");
        assert_eq!(client.count_for(Op::Create, "projectrequests"), 1);

        let second = provisioner.ensure_namespace(&user).await.unwrap();
        assert_eq!(second["kind"], "Project");
        assert_eq!(second["metadata"]["name"], "dev-example-com-walkthrough-projects");
        assert_eq!(client.count(Op::Create), 1);
        assert_eq!(client.count_for(Op::List, "projects"), 2);
    }

    #[tokio::test]
    async fn lookup_failure_aborts_before_create() {
        let client = Arc::new(MemoryClient::new("dev"));
        client.fail_next(Op::List, "forbidden");
        let provisioner = NamespaceProvisioner::new(client.clone(), NAMESPACE_SUFFIX);
        assert!(provisioner.ensure_namespace(&User::new("dev")).await.is_err());
        assert_eq!(client.count(Op::Create), 0);
    }
}
