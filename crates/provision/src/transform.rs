//! Desired service-instance objects for a user's walkthrough services.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use walkthrough_core::{Resource, User};

use crate::config::{AMQ_CLASS, ENMASSE_CLASS};
use crate::error::{ProvisionError, ProvisionResult};

/// A service the user should have provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service class external name.
    pub name: String,
    pub namespace: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceInstanceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    pub cluster_service_class_external_name: String,
    pub cluster_service_plan_external_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl ServiceInstance {
    pub fn to_resource(&self) -> ProvisionResult<Resource> {
        Ok(serde_json::to_value(self)?)
    }
}

/// One entry of the chain: which services it claims and how it picks the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformRule {
    /// Fixed plan, plus a `name` parameter carrying the username.
    UserScopedPlan { class: String, plan: String },
    FixedPlan { class: String, plan: String },
    /// Matches every service; plan is `default-<class>`.
    Default,
}

impl TransformRule {
    pub fn matches(&self, spec: &ServiceSpec) -> bool {
        match self {
            TransformRule::UserScopedPlan { class, .. } | TransformRule::FixedPlan { class, .. } => *class == spec.name,
            TransformRule::Default => true,
        }
    }

    fn apply(&self, spec: &ServiceSpec) -> ServiceInstance {
        let (plan, parameters) = match self {
            TransformRule::UserScopedPlan { plan, .. } => {
                (plan.clone(), Some(serde_json::json!({ "name": spec.user.username })))
            }
            TransformRule::FixedPlan { plan, .. } => (plan.clone(), None),
            TransformRule::Default => (format!("default-{}", spec.name), None),
        };
        ServiceInstance {
            api_version: "servicecatalog.k8s.io/v1beta1".to_string(),
            kind: "ServiceInstance".to_string(),
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", spec.name)),
                namespace: Some(spec.namespace.clone()),
                ..Default::default()
            },
            spec: ServiceInstanceSpec {
                cluster_service_class_external_name: spec.name.clone(),
                cluster_service_plan_external_name: plan,
                parameters,
            },
        }
    }
}

/// Ordered rules, first match wins.
///
/// Invariant: the last rule is [`TransformRule::Default`] and it is the only
/// `Default`, so every service spec has a match. [`TransformChain::new`] rejects
/// any list that breaks this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformChain {
    rules: Vec<TransformRule>,
}

impl Default for TransformChain {
    fn default() -> Self {
        Self {
            rules: vec![
                TransformRule::UserScopedPlan { class: ENMASSE_CLASS.into(), plan: "unlimited-standard".into() },
                TransformRule::FixedPlan { class: AMQ_CLASS.into(), plan: "default".into() },
                TransformRule::Default,
            ],
        }
    }
}

impl TransformChain {
    pub fn new(rules: Vec<TransformRule>) -> ProvisionResult<Self> {
        let defaults = rules.iter().filter(|r| matches!(r, TransformRule::Default)).count();
        match rules.last() {
            Some(TransformRule::Default) if defaults == 1 => Ok(Self { rules }),
            Some(TransformRule::Default) => Err(ProvisionError::NoMatchingStrategy(
                "transform chain has more than one default rule".into(),
            )),
            _ => Err(ProvisionError::NoMatchingStrategy(
                "transform chain must end with the default rule".into(),
            )),
        }
    }

    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    pub fn build(&self, spec: &ServiceSpec) -> ServiceInstance {
        match self.rules.iter().find(|r| r.matches(spec)) {
            Some(rule) => rule.apply(spec),
            None => TransformRule::Default.apply(spec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec { name: name.into(), namespace: "u-walkthrough-projects".into(), user: User::new("u") }
    }

    #[test]
    fn enmasse_gets_unlimited_plan_and_username_parameter() {
        let si = TransformChain::default().build(&spec("enmasse-standard"));
        assert_eq!(si.spec.cluster_service_plan_external_name, "unlimited-standard");
        assert_eq!(si.spec.parameters, Some(serde_json::json!({"name": "u"})));
    }

    #[test]
    fn amq_gets_default_plan() {
        let si = TransformChain::default().build(&spec("amq-broker-71-persistence"));
        assert_eq!(si.spec.cluster_service_plan_external_name, "default");
        assert_eq!(si.spec.parameters, None);
    }

    #[test]
    fn other_services_get_prefixed_default_plan() {
        for name in ["fuse", "che", "launcher", "anything"] {
            let si = TransformChain::default().build(&spec(name));
            assert_eq!(si.spec.cluster_service_plan_external_name, format!("default-{}", name));
            assert_eq!(si.spec.cluster_service_class_external_name, name);
        }
    }

    #[test]
    fn output_uses_generate_name_and_namespace() {
        let raw = TransformChain::default().build(&spec("fuse")).to_resource().unwrap();
        assert_eq!(raw["metadata"]["generateName"], "fuse-");
        assert_eq!(raw["metadata"]["namespace"], "u-walkthrough-projects");
        assert!(raw["metadata"].get("name").is_none());
        assert_eq!(raw["spec"]["clusterServiceClassExternalName"], "fuse");
        assert!(raw["spec"].get("parameters").is_none());
    }

    #[test]
    fn first_match_wins() {
        let chain = TransformChain::new(vec![
            TransformRule::FixedPlan { class: "fuse".into(), plan: "first".into() },
            TransformRule::FixedPlan { class: "fuse".into(), plan: "second".into() },
            TransformRule::Default,
        ])
        .unwrap();
        assert_eq!(chain.build(&spec("fuse")).spec.cluster_service_plan_external_name, "first");
    }

    #[test]
    fn chains_without_terminal_default_are_rejected() {
        let missing = TransformChain::new(vec![TransformRule::FixedPlan { class: "a".into(), plan: "p".into() }]);
        assert!(matches!(missing, Err(ProvisionError::NoMatchingStrategy(_))));

        let shadowing = TransformChain::new(vec![
            TransformRule::Default,
            TransformRule::FixedPlan { class: "a".into(), plan: "p".into() },
        ]);
        assert!(matches!(shadowing, Err(ProvisionError::NoMatchingStrategy(_))));

        let twice = TransformChain::new(vec![TransformRule::Default, TransformRule::Default]);
        assert!(matches!(twice, Err(ProvisionError::NoMatchingStrategy(_))));

        assert!(matches!(TransformChain::new(vec![]), Err(ProvisionError::NoMatchingStrategy(_))));
    }
}
