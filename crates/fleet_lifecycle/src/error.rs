use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    #[error("Invalid firmware object key: {0}")]
    InvalidFirmwareKey(String),

    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(#[from] anyhow::Error),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
