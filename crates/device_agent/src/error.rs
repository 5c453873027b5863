use std::time::Duration;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscription to '{topic}' rejected by broker")]
    SubscribeRejected { topic: String },

    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("No create keys and certificate response within {0:?}")]
    ProvisioningTimeout(Duration),

    #[error("No register thing response within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("{operation} rejected with code '{code}': {message}")]
    Rejected {
        operation: String,
        code: String,
        message: String,
    },

    /// Failure of a claim session run for identity rotation; the device
    /// session that started it is unaffected
    #[error("Identity bootstrap failed: {0}")]
    Bootstrap(#[source] Box<AgentError>),

    #[error("No custom certificate delivered within {0:?}")]
    CustomCertificateTimeout(Duration),

    #[error("Trust anchor update failed: {0}")]
    TrustAnchor(String),

    #[error("Firmware update failed: {0}")]
    Firmware(String),

    #[error("Invalid job document: {0}")]
    InvalidJobDocument(String),

    #[error("Identity store error: {0}")]
    Identity(String),

    #[error("Parameter store error: {0}")]
    Parameters(String),

    #[error("Invalid message on '{topic}': {reason}")]
    InvalidMessage { topic: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn rejected(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AgentError::Rejected {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bootstrap(source: AgentError) -> Self {
        AgentError::Bootstrap(Box::new(source))
    }

    /// Errors that leave the session unusable and must end in a disconnect.
    ///
    /// Task level failures inside a job (trust anchor, firmware, certificate
    /// exchange timeouts, failed claim sessions) are not session fatal.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Connection(_)
                | AgentError::SubscribeRejected { .. }
                | AgentError::Publish { .. }
                | AgentError::Rejected { .. }
        )
    }
}
