//! Per-user provisioning: namespace, service instances, then watches.
//!
//! Stages run in order and stop at the first error. Nothing here retries;
//! calling [`Walkthrough::provision_user`] again is safe because every stage
//! looks before it creates.

use std::sync::Arc;

use tracing::info;
use walkthrough_core::{payload, NotificationSink, Resource, ResourceClient, User};

use crate::config::WalkthroughConfig;
use crate::credentials::CredentialPropagator;
use crate::dashboard::DashboardAnnotator;
use crate::error::ProvisionResult;
use crate::namespace::NamespaceProvisioner;
use crate::router::{ServiceInstanceRouter, StatefulSetRouter};
use crate::transform::{ServiceInstance, ServiceSpec, TransformChain};
use crate::watch::Subscription;
use crate::{reconcile, resources};

pub struct Walkthrough {
    client: Arc<dyn ResourceClient>,
    config: WalkthroughConfig,
    chain: TransformChain,
}

/// The two subscriptions attached to a provisioned namespace.
pub struct WalkthroughWatches {
    pub service_instances: Subscription,
    pub stateful_sets: Subscription,
}

impl WalkthroughWatches {
    pub fn cancel(&self) {
        self.service_instances.cancel();
        self.stateful_sets.cancel();
    }

    pub async fn join(self) {
        self.service_instances.join().await;
        self.stateful_sets.join().await;
    }
}

pub struct Provisioned {
    pub user: User,
    pub namespace: String,
    /// Service instances as found or created, in configured order.
    pub instances: Vec<Resource>,
    pub watches: WalkthroughWatches,
}

impl Walkthrough {
    pub fn new(client: Arc<dyn ResourceClient>, config: WalkthroughConfig) -> Self {
        Self { client, config, chain: TransformChain::default() }
    }

    pub fn with_chain(mut self, chain: TransformChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn config(&self) -> &WalkthroughConfig {
        &self.config
    }

    pub fn namespace_for(&self, user: &User) -> String {
        self.provisioner().name_for(user)
    }

    fn provisioner(&self) -> NamespaceProvisioner {
        NamespaceProvisioner::new(self.client.clone(), self.config.namespace_suffix.clone())
    }

    /// Desired instances for every configured service, without touching the cluster.
    pub fn desired_instances(&self, user: &User) -> Vec<ServiceInstance> {
        let namespace = self.namespace_for(user);
        self.config
            .services
            .iter()
            .map(|name| {
                self.chain.build(&ServiceSpec { name: name.clone(), namespace: namespace.clone(), user: user.clone() })
            })
            .collect()
    }

    /// Find-or-create each service instance by class, one at a time.
    pub async fn ensure_service_instances(&self, user: &User) -> ProvisionResult<Vec<Resource>> {
        let descriptor = resources::service_instances(&self.namespace_for(user));
        let mut out = Vec::with_capacity(self.config.services.len());
        for instance in self.desired_instances(user) {
            let desired = instance.to_resource()?;
            let found = reconcile::find_or_create(self.client.as_ref(), &descriptor, &desired, reconcile::by_class(&desired)).await?;
            out.push(found);
        }
        Ok(out)
    }

    /// Attach the service-instance and statefulset subscriptions for `namespace`.
    pub fn start_watches(&self, namespace: &str, sink: Arc<dyn NotificationSink>) -> WalkthroughWatches {
        let annotator = DashboardAnnotator::new(self.client.clone(), self.config.console_route.clone());
        let propagator =
            CredentialPropagator::new(self.client.clone(), self.config.secret_name.clone()).with_sink(sink.clone());
        let si_router = ServiceInstanceRouter::new(self.config.services.iter().cloned(), sink, annotator);
        let ss_router = StatefulSetRouter::new(namespace, propagator);

        WalkthroughWatches {
            service_instances: Subscription::spawn(
                self.client.clone(),
                resources::service_instances(namespace),
                self.config.reconnect.clone(),
                Arc::new(si_router),
            ),
            stateful_sets: Subscription::spawn(
                self.client.clone(),
                resources::stateful_sets(namespace),
                self.config.reconnect.clone(),
                Arc::new(ss_router),
            ),
        }
    }

    pub async fn provision_user(&self, user: &User, sink: Arc<dyn NotificationSink>) -> ProvisionResult<Provisioned> {
        let namespace = self.namespace_for(user);
        let project = self.provisioner().ensure_namespace(user).await?;
        info!(user = %user.username, ns = %namespace, kind = ?project.get("kind"), "namespace ensured");

        let instances = self.ensure_service_instances(user).await?;
        info!(
            user = %user.username,
            ns = %namespace,
            instances = ?instances.iter().filter_map(payload::name).collect::<Vec<_>>(),
            "service instances ensured"
        );

        let watches = self.start_watches(&namespace, sink);
        Ok(Provisioned { user: user.clone(), namespace, instances, watches })
    }

    /// Resolve the authenticated user, then provision them.
    pub async fn provision_current_user(&self, sink: Arc<dyn NotificationSink>) -> ProvisionResult<Provisioned> {
        let user = self.client.current_user().await?;
        self.provision_user(&user, sink).await
    }
}
