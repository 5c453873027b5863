use crate::identity::{CertificateBundle, IdentityStore};
use crate::parameters::ParameterStore;
use crate::provisioning::{IdentityProvisioner, ProvisioningMode, ProvisioningRequest};
use crate::transport::{publish_json, InboundMessage, MessageHandler, Transport};
use crate::{AgentError, AgentResult};
use async_trait::async_trait;
use common::messages::{CustomCertificateIssued, CustomCertificateRequest, RotationComplete};
use common::topics::DeviceTopics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use x509_parser::pem::parse_x509_pem;

const DEFAULT_CUSTOM_CERTIFICATE_TIMEOUT: Duration = Duration::from_secs(30);

/// The three job-triggered rotation sub-protocols
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CertificateRotation: Send + Sync {
    /// Replace the local trust anchor with the one served at `url`
    async fn update_root_ca(&self, url: &str) -> AgentResult<()>;

    /// Bootstrap a new identity against the rotation template; returns the
    /// new certificate id
    async fn rotate_identity(&self) -> AgentResult<String>;

    /// Request an organisation issued certificate and wait for it; returns
    /// the new certificate id
    async fn rotate_custom_certificate(&self) -> AgentResult<String>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TrustAnchorFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> AgentResult<Vec<u8>>;
}

pub struct HttpTrustAnchorFetcher {
    client: reqwest::Client,
}

impl HttpTrustAnchorFetcher {
    pub fn new(timeout: Duration) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::TrustAnchor(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TrustAnchorFetcher for HttpTrustAnchorFetcher {
    async fn fetch(&self, url: &str) -> AgentResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentError::TrustAnchor(format!("fetching {}: {}", url, e)))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| AgentError::TrustAnchor(format!("reading {}: {}", url, e)))?;
        Ok(body.to_vec())
    }
}

/// Check that `pem` holds a CA certificate; returns its subject
pub fn validate_trust_anchor(pem: &[u8]) -> AgentResult<String> {
    let (_, pem) = parse_x509_pem(pem)
        .map_err(|e| AgentError::TrustAnchor(format!("not a PEM document: {}", e)))?;
    if pem.label != "CERTIFICATE" {
        return Err(AgentError::TrustAnchor(format!(
            "expected a CERTIFICATE, found {}",
            pem.label
        )));
    }

    let certificate = pem
        .parse_x509()
        .map_err(|e| AgentError::TrustAnchor(format!("invalid X.509 certificate: {}", e)))?;
    if !certificate.is_ca() {
        return Err(AgentError::TrustAnchor(
            "certificate is not a certificate authority".to_string(),
        ));
    }
    Ok(certificate.subject().to_string())
}

type CustomWaiter = oneshot::Sender<Result<String, String>>;

/// Certificate rotation over the device session
pub struct CertificateRotator {
    topics: DeviceTopics,
    transport: Arc<dyn Transport>,
    identity: IdentityStore,
    parameters: Arc<ParameterStore>,
    provisioner: Arc<dyn IdentityProvisioner>,
    fetcher: Arc<dyn TrustAnchorFetcher>,
    custom_timeout: Duration,
    custom_waiter: Mutex<Option<CustomWaiter>>,
}

impl CertificateRotator {
    pub fn new(
        topics: DeviceTopics,
        transport: Arc<dyn Transport>,
        identity: IdentityStore,
        parameters: Arc<ParameterStore>,
        provisioner: Arc<dyn IdentityProvisioner>,
        fetcher: Arc<dyn TrustAnchorFetcher>,
    ) -> Self {
        Self {
            topics,
            transport,
            identity,
            parameters,
            provisioner,
            fetcher,
            custom_timeout: DEFAULT_CUSTOM_CERTIFICATE_TIMEOUT,
            custom_waiter: Mutex::new(None),
        }
    }

    pub fn with_custom_certificate_timeout(mut self, timeout: Duration) -> Self {
        self.custom_timeout = timeout;
        self
    }

    /// Persist a delivered organisation certificate and announce it. Wakes
    /// the rotation job waiting for it, if there is one.
    #[instrument(skip_all, fields(certificate_id = %issued.certificate_id))]
    pub async fn complete_custom_rotation(
        &self,
        issued: CustomCertificateIssued,
    ) -> AgentResult<String> {
        let waiter = self
            .custom_waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if waiter.is_none() {
            info!("custom certificate delivered without a waiting job");
        }

        let result = self.install_custom_certificate(issued).await;

        if let Some(waiter) = waiter {
            let outcome = match &result {
                Ok(certificate_id) => Ok(certificate_id.clone()),
                Err(e) => Err(e.to_string()),
            };
            if waiter.send(outcome).is_err() {
                debug!("rotation job stopped waiting");
            }
        }
        result
    }

    async fn install_custom_certificate(
        &self,
        issued: CustomCertificateIssued,
    ) -> AgentResult<String> {
        self.identity
            .persist(&CertificateBundle {
                certificate_pem: issued.certificate_pem,
                private_key: issued.private_key,
            })
            .await?;
        self.announce(&issued.certificate_id).await?;
        Ok(issued.certificate_id)
    }

    /// Tell the backend the device now holds `certificate_id`; it retires
    /// every other certificate attached to the thing
    async fn announce(&self, certificate_id: &str) -> AgentResult<()> {
        publish_json(
            self.transport.as_ref(),
            &self.topics.rotation_complete(),
            &RotationComplete {
                thing_name: self.topics.thing_name().to_string(),
                new_certificate_id: certificate_id.to_string(),
            },
        )
        .await?;
        info!(certificate_id = %certificate_id, "certificate rotation announced");
        Ok(())
    }
}

#[async_trait]
impl CertificateRotation for CertificateRotator {
    #[instrument(skip(self))]
    async fn update_root_ca(&self, url: &str) -> AgentResult<()> {
        info!("fetching new root CA");
        let pem = self.fetcher.fetch(url).await?;
        let subject = validate_trust_anchor(&pem)?;

        self.identity
            .replace_trust_anchor(&pem)
            .await
            .map_err(|e| AgentError::TrustAnchor(e.to_string()))?;
        info!(subject = %subject, "root CA rotation complete");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn rotate_identity(&self) -> AgentResult<String> {
        let template_name = self.parameters.load().await?.rotation_template_name;
        let provisioned = self
            .provisioner
            .provision(ProvisioningRequest {
                template_name,
                mode: ProvisioningMode::Rotation,
            })
            .await
            .map_err(AgentError::bootstrap)?;

        self.announce(&provisioned.certificate_id).await?;
        Ok(provisioned.certificate_id)
    }

    #[instrument(skip_all)]
    async fn rotate_custom_certificate(&self) -> AgentResult<String> {
        let (waiter, delivered) = oneshot::channel();
        {
            let mut slot = self.custom_waiter.lock().unwrap_or_else(|e| e.into_inner());
            if slot.replace(waiter).is_some() {
                warn!("replacing an earlier custom certificate request");
            }
        }

        info!("requesting new custom certificate");
        publish_json(
            self.transport.as_ref(),
            &self.topics.custom_certificate_initiate(),
            &CustomCertificateRequest {
                thing_name: self.topics.thing_name().to_string(),
            },
        )
        .await?;

        match tokio::time::timeout(self.custom_timeout, delivered).await {
            Ok(Ok(Ok(certificate_id))) => Ok(certificate_id),
            Ok(Ok(Err(reason))) => Err(AgentError::Identity(reason)),
            Ok(Err(_)) => Err(AgentError::Identity(
                "custom certificate request superseded".to_string(),
            )),
            Err(_) => {
                self.custom_waiter
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                Err(AgentError::CustomCertificateTimeout(self.custom_timeout))
            }
        }
    }
}

/// Handles `<thing>/customCa/certificate/create/complete`
pub struct CustomCertificateHandler {
    rotator: Arc<CertificateRotator>,
}

impl CustomCertificateHandler {
    pub fn new(rotator: Arc<CertificateRotator>) -> Self {
        Self { rotator }
    }
}

#[async_trait]
impl MessageHandler for CustomCertificateHandler {
    async fn handle(&self, message: InboundMessage) -> AgentResult<()> {
        let issued: CustomCertificateIssued = match message.parse_json() {
            Ok(issued) => issued,
            Err(e) => {
                warn!(error = %e, "ignoring malformed custom certificate");
                return Ok(());
            }
        };

        match self.rotator.complete_custom_rotation(issued).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "custom certificate could not be installed");
                Ok(())
            }
        }
    }
}
