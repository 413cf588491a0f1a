//! Walkthrough provisioning engine.
//!
//! Ensures a user's namespace and service instances exist, then attaches watch
//! subscriptions whose events drive state notifications, AMQ credential
//! mirroring and dashboard URL annotation.

#![forbid(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod dashboard;
pub mod error;
pub mod memory;
pub mod namespace;
pub mod pipeline;
pub mod reconcile;
pub mod resources;
pub mod router;
pub mod transform;
pub mod watch;

pub use config::WalkthroughConfig;
pub use error::{ProvisionError, ProvisionResult};
pub use memory::MemoryClient;
pub use pipeline::{Provisioned, Walkthrough, WalkthroughWatches};
pub use walkthrough_core::{Notification, NotificationSink, ResourceClient, User};
