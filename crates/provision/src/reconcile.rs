//! Find-or-create and conditional replace over a `ResourceClient`.
//!
//! None of these are atomic: list and create are separate calls, so two
//! concurrent attempts for the same key may both create. The result is
//! at-least-one create per distinct attempt unless the server enforces
//! uniqueness on the comparison key (it does for `metadata.name`, not for
//! `generateName`d service instances).

use metrics::counter;
use tracing::{debug, info};
use walkthrough_core::{payload, Resource, ResourceClient, ResourceDescriptor, TransportError};

use crate::error::ProvisionResult;

/// Matches resources with the same `metadata.name` as `desired`.
pub fn by_name(desired: &Resource) -> impl Fn(&Resource) -> bool + '_ {
    move |candidate| match payload::name(desired) {
        Some(want) => payload::name(candidate) == Some(want),
        None => false,
    }
}

/// Matches resources with the same service class as `desired`.
pub fn by_class(desired: &Resource) -> impl Fn(&Resource) -> bool + '_ {
    move |candidate| match payload::class_name(desired) {
        Ok(want) => payload::class_name(candidate).ok() == Some(want),
        Err(_) => false,
    }
}

/// First resource in the collection satisfying `compare`.
pub async fn find<F>(
    client: &dyn ResourceClient,
    descriptor: &ResourceDescriptor,
    compare: F,
) -> Result<Option<Resource>, TransportError>
where
    F: Fn(&Resource) -> bool,
{
    let list = client.list(descriptor).await?;
    Ok(list.items.into_iter().find(|r| compare(r)))
}

/// Return the existing match for `compare`, creating `desired` if none exists.
pub async fn find_or_create<F>(
    client: &dyn ResourceClient,
    descriptor: &ResourceDescriptor,
    desired: &Resource,
    compare: F,
) -> Result<Resource, TransportError>
where
    F: Fn(&Resource) -> bool,
{
    if let Some(found) = find(client, descriptor, compare).await? {
        debug!(resource = %descriptor, name = ?payload::name(&found), "found existing");
        return Ok(found);
    }
    let created = client.create(descriptor, desired).await?;
    counter!("walkthrough_creates_total", 1u64);
    info!(resource = %descriptor, name = ?payload::name(&created), "created missing resource");
    Ok(created)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Replaced {
    Created(Resource),
    Unchanged(Resource),
    Updated(Resource),
}

/// Ensure `desired` exists by name; if it already existed and `should_replace`
/// holds for the stored copy, overwrite it with `desired`.
///
/// The update carries the stored `resourceVersion`; if another writer got in
/// between the list and the update the server rejects it with a conflict,
/// which surfaces as `ProvisionError::Transport`.
pub async fn replace_if<F>(
    client: &dyn ResourceClient,
    descriptor: &ResourceDescriptor,
    desired: &Resource,
    should_replace: F,
) -> ProvisionResult<Replaced>
where
    F: Fn(&Resource) -> bool,
{
    let Some(current) = find(client, descriptor, by_name(desired)).await? else {
        let created = client.create(descriptor, desired).await?;
        counter!("walkthrough_creates_total", 1u64);
        return Ok(Replaced::Created(created));
    };
    if !should_replace(&current) {
        return Ok(Replaced::Unchanged(current));
    }
    let mut next = desired.clone();
    if let Some(rv) = payload::resource_version(&current) {
        payload::set_metadata_str(&mut next, "resourceVersion", rv)?;
    }
    let updated = client.update(descriptor, &next).await?;
    Ok(Replaced::Updated(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use crate::memory::MemoryClient;
    use crate::resources;
    use serde_json::json;
    use walkthrough_core::{Op, ResourceList, User, WatchStream};

    /// Lets another writer touch the object right after every list.
    struct InterleavedWriter {
        inner: MemoryClient,
        rival: Resource,
    }

    #[async_trait::async_trait]
    impl ResourceClient for InterleavedWriter {
        async fn list(&self, d: &ResourceDescriptor) -> Result<ResourceList, TransportError> {
            let listed = self.inner.list(d).await?;
            self.inner.seed(d, self.rival.clone());
            Ok(listed)
        }
        async fn create(&self, d: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError> {
            self.inner.create(d, obj).await
        }
        async fn update(&self, d: &ResourceDescriptor, obj: &Resource) -> Result<Resource, TransportError> {
            self.inner.update(d, obj).await
        }
        async fn remove(&self, d: &ResourceDescriptor, obj: &Resource) -> Result<(), TransportError> {
            self.inner.remove(d, obj).await
        }
        async fn watch(&self, d: &ResourceDescriptor) -> Result<WatchStream, TransportError> {
            self.inner.watch(d).await
        }
        async fn current_user(&self) -> Result<User, TransportError> {
            self.inner.current_user().await
        }
    }

    #[tokio::test]
    async fn find_or_create_creates_once_then_finds() {
        let client = MemoryClient::new("dev");
        let d = resources::secrets("ns");
        let desired = json!({"metadata": {"name": "s"}, "stringData": {"k": "v"}});

        let first = find_or_create(&client, &d, &desired, by_name(&desired)).await.unwrap();
        let second = find_or_create(&client, &d, &desired, by_name(&desired)).await.unwrap();

        assert_eq!(client.count(Op::Create), 1);
        assert_eq!(payload::name(&first), Some("s"));
        assert_eq!(payload::name(&second), Some("s"));
    }

    #[tokio::test]
    async fn find_or_create_with_existing_match_never_creates() {
        let client = MemoryClient::new("dev");
        let d = resources::service_instances("ns");
        client.seed(&d, json!({"metadata": {"name": "fuse-abc"}, "spec": {"clusterServiceClassExternalName": "fuse"}}));
        let desired = json!({"metadata": {"generateName": "fuse-"}, "spec": {"clusterServiceClassExternalName": "fuse"}});

        for _ in 0..2 {
            let found = find_or_create(&client, &d, &desired, by_class(&desired)).await.unwrap();
            assert_eq!(payload::name(&found), Some("fuse-abc"));
        }
        assert_eq!(client.count(Op::Create), 0);
        assert_eq!(client.count(Op::List), 2);
    }

    #[tokio::test]
    async fn find_propagates_transport_errors() {
        let client = MemoryClient::new("dev");
        client.fail_next(Op::List, "connection reset");
        let err = find(&client, &resources::projects(), |_| true).await.unwrap_err();
        assert_eq!(err.op, Op::List);
        assert_eq!(client.count(Op::Create), 0);
    }

    #[tokio::test]
    async fn replace_if_updates_only_when_predicate_holds() {
        let client = MemoryClient::new("dev");
        let d = resources::secrets("ns");
        let desired = json!({"metadata": {"name": "s"}, "stringData": {"k": "v"}});

        let created = replace_if(&client, &d, &desired, |_| true).await.unwrap();
        assert!(matches!(created, Replaced::Created(_)));

        let same = replace_if(&client, &d, &desired, |_| false).await.unwrap();
        assert!(matches!(same, Replaced::Unchanged(_)));
        assert_eq!(client.count(Op::Update), 0);

        let updated = replace_if(&client, &d, &desired, |_| true).await.unwrap();
        assert!(matches!(updated, Replaced::Updated(_)));
        assert_eq!(client.count(Op::Update), 1);
        assert_eq!(client.count(Op::Create), 1);
    }

    #[tokio::test]
    async fn replace_if_loses_to_a_writer_between_list_and_update() {
        let d = resources::secrets("ns");
        let client = InterleavedWriter {
            inner: MemoryClient::new("dev"),
            rival: json!({"metadata": {"name": "s"}, "stringData": {"k": "theirs"}}),
        };
        client.inner.seed(&d, json!({"metadata": {"name": "s"}, "stringData": {"k": "old"}}));
        let desired = json!({"metadata": {"name": "s"}, "stringData": {"k": "ours"}});

        let err = replace_if(&client, &d, &desired, |_| true).await.unwrap_err();
        match err {
            ProvisionError::Transport(t) => {
                assert_eq!(t.op, Op::Update);
                assert!(t.message.contains("conflict"), "{}", t.message);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
        // dGhlaXJz is base64("theirs").
        assert_eq!(client.inner.get(&d, "s").unwrap()["data"]["k"], "dGhlaXJz");
    }
}
