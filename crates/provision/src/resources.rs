//! Collections the walkthrough touches.

use walkthrough_core::ResourceDescriptor;

/// Projects visible to the user; lookup side of namespace provisioning.
pub fn projects() -> ResourceDescriptor {
    ResourceDescriptor::cluster("projects", "project.openshift.io", "v1", "Project")
}

/// Project requests; creating one asks the platform to provision a project.
pub fn project_requests() -> ResourceDescriptor {
    ResourceDescriptor::cluster("projectrequests", "project.openshift.io", "v1", "ProjectRequest")
}

pub fn service_instances(namespace: &str) -> ResourceDescriptor {
    ResourceDescriptor::cluster("serviceinstances", "servicecatalog.k8s.io", "v1beta1", "ServiceInstance")
        .in_namespace(namespace)
}

pub fn stateful_sets(namespace: &str) -> ResourceDescriptor {
    ResourceDescriptor::cluster("statefulsets", "apps", "v1", "StatefulSet").in_namespace(namespace)
}

pub fn secrets(namespace: &str) -> ResourceDescriptor {
    ResourceDescriptor::cluster("secrets", "", "v1", "Secret").in_namespace(namespace)
}

pub fn routes(namespace: &str) -> ResourceDescriptor {
    ResourceDescriptor::cluster("routes", "route.openshift.io", "v1", "Route").in_namespace(namespace)
}
