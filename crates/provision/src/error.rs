use walkthrough_core::{PayloadError, TransportError};

/// Errors surfaced by the provisioning pipeline and event handlers.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// A remote call failed; passed through unmodified.
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no matching strategy: {0}")]
    NoMatchingStrategy(String),
    #[error("payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("encoding resource: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
