//! Runtime configuration. Defaults match the standard walkthrough catalog;
//! each field can be overridden through a `WALKTHROUGH_*` environment variable.

use std::time::Duration;

use tracing::warn;

use crate::watch::ReconnectPolicy;

pub const FUSE_CLASS: &str = "fuse";
pub const CHE_CLASS: &str = "che";
pub const LAUNCHER_CLASS: &str = "launcher";
pub const ENMASSE_CLASS: &str = "enmasse-standard";
pub const AMQ_CLASS: &str = "amq-broker-71-persistence";

/// Services provisioned for every user; also the watch allow-list.
pub const DEFAULT_SERVICES: [&str; 5] = [FUSE_CLASS, CHE_CLASS, LAUNCHER_CLASS, ENMASSE_CLASS, AMQ_CLASS];

pub const NAMESPACE_SUFFIX: &str = "-walkthrough-projects";
pub const CONSOLE_ROUTE: &str = "console";
pub const AMQ_SECRET_NAME: &str = "amq-broker-credentials";
pub use walkthrough_core::payload::DASHBOARD_URL_ANNOTATION;

#[derive(Debug, Clone, PartialEq)]
pub struct WalkthroughConfig {
    pub services: Vec<String>,
    pub namespace_suffix: String,
    pub console_route: String,
    pub secret_name: String,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the notification channel handed to the state collaborator.
    pub queue_cap: usize,
}

impl Default for WalkthroughConfig {
    fn default() -> Self {
        Self {
            services: DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
            namespace_suffix: NAMESPACE_SUFFIX.to_string(),
            console_route: CONSOLE_ROUTE.to_string(),
            secret_name: AMQ_SECRET_NAME.to_string(),
            reconnect: ReconnectPolicy::default(),
            queue_cap: 1024,
        }
    }
}

impl WalkthroughConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (tests pass a closure over a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(list) = get("WALKTHROUGH_SERVICES") {
            let services: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if services.is_empty() {
                warn!("WALKTHROUGH_SERVICES is empty; keeping defaults");
            } else {
                cfg.services = services;
            }
        }
        if let Some(v) = get("WALKTHROUGH_NAMESPACE_SUFFIX") {
            cfg.namespace_suffix = v;
        }
        if let Some(v) = get("WALKTHROUGH_CONSOLE_ROUTE") {
            cfg.console_route = v;
        }
        if let Some(v) = get("WALKTHROUGH_SECRET_NAME") {
            cfg.secret_name = v;
        }
        if let Some(cap) = get("WALKTHROUGH_QUEUE_CAP").and_then(|s| s.parse::<usize>().ok()) {
            cfg.queue_cap = cap.max(1);
        }

        let max_secs = get("WALKTHROUGH_WATCH_BACKOFF_MAX_SECS").and_then(|s| s.parse::<u64>().ok());
        let max_attempts = get("WALKTHROUGH_WATCH_MAX_ATTEMPTS").and_then(|s| s.parse::<u32>().ok());
        match get("WALKTHROUGH_WATCH_RECONNECT").as_deref() {
            Some("never") => cfg.reconnect = ReconnectPolicy::Never,
            Some("backoff") | None => {
                if let ReconnectPolicy::Backoff { max, max_attempts: attempts, .. } = &mut cfg.reconnect {
                    if let Some(secs) = max_secs {
                        *max = Duration::from_secs(secs.max(1));
                    }
                    if max_attempts.is_some() {
                        *attempts = max_attempts;
                    }
                }
            }
            Some(other) => warn!(value = %other, "unknown WALKTHROUGH_WATCH_RECONNECT; expected never|backoff"),
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_list_the_five_walkthrough_services() {
        let cfg = WalkthroughConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, WalkthroughConfig::default());
        assert_eq!(cfg.services, vec!["fuse", "che", "launcher", "enmasse-standard", "amq-broker-71-persistence"]);
        assert_eq!(cfg.namespace_suffix, "-walkthrough-projects");
    }

    #[test]
    fn env_overrides_services_and_reconnect() {
        let cfg = WalkthroughConfig::from_lookup(lookup(&[
            ("WALKTHROUGH_SERVICES", " fuse, che ,,"),
            ("WALKTHROUGH_WATCH_BACKOFF_MAX_SECS", "5"),
            ("WALKTHROUGH_WATCH_MAX_ATTEMPTS", "3"),
            ("WALKTHROUGH_QUEUE_CAP", "0"),
        ]));
        assert_eq!(cfg.services, vec!["fuse", "che"]);
        assert_eq!(cfg.queue_cap, 1);
        match cfg.reconnect {
            ReconnectPolicy::Backoff { max, max_attempts, .. } => {
                assert_eq!(max, Duration::from_secs(5));
                assert_eq!(max_attempts, Some(3));
            }
            ReconnectPolicy::Never => panic!("expected backoff"),
        }
    }

    #[test]
    fn reconnect_can_be_disabled() {
        let cfg = WalkthroughConfig::from_lookup(lookup(&[("WALKTHROUGH_WATCH_RECONNECT", "never")]));
        assert_eq!(cfg.reconnect, ReconnectPolicy::Never);
    }
}
