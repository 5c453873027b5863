use crate::error::{LifecycleError, LifecycleResult};
use crate::registry::{CertificateRegistry, DevicePublisher};
use chrono::{Datelike, NaiveDate, Utc};
use common::messages::{CustomCertificateIssued, CustomCertificateRequest};
use common::topics::DeviceTopics;
use rcgen::{CertificateParams, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose};
use std::sync::Arc;
use tracing::{info, instrument};

/// Validity of organisation issued device certificates
pub const DEVICE_CERTIFICATE_VALIDITY_DAYS: i64 = 360;

/// A device certificate and its private key, both PEM encoded
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate_pem_len", &self.certificate_pem.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// The organisation's own CA, registered with the platform, that signs
/// device certificates outside the platform's issuance.
pub struct OrganizationCertificateAuthority {
    ca_certificate_pem: String,
    ca_key_pem: String,
    project_unit: String,
}

impl OrganizationCertificateAuthority {
    /// Load the CA from PEM; both halves are parsed up front
    pub fn from_pem(
        ca_certificate_pem: &str,
        ca_key_pem: &str,
        project_unit: impl Into<String>,
    ) -> LifecycleResult<Self> {
        let key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| LifecycleError::InvalidCertificate(format!("CA key: {}", e)))?;
        Issuer::from_ca_cert_pem(ca_certificate_pem, &key)
            .map_err(|e| LifecycleError::InvalidCertificate(format!("CA certificate: {}", e)))?;

        Ok(Self {
            ca_certificate_pem: ca_certificate_pem.to_string(),
            ca_key_pem: ca_key_pem.to_string(),
            project_unit: project_unit.into(),
        })
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_certificate_pem
    }

    /// Fresh key pair and a certificate with subject `OU=<project>, CN=<thing>`
    /// valid from `today` for 360 days
    pub fn issue(&self, thing_name: &str, today: NaiveDate) -> LifecycleResult<IssuedCertificate> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| LifecycleError::Issuance(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, self.project_unit.as_str());
        params.distinguished_name.push(DnType::CommonName, thing_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

        let expires = today + chrono::Duration::days(DEVICE_CERTIFICATE_VALIDITY_DAYS);
        params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

        let device_key = KeyPair::generate().map_err(|e| LifecycleError::Issuance(e.to_string()))?;
        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| LifecycleError::InvalidCertificate(format!("CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_certificate_pem, &ca_key)
            .map_err(|e| LifecycleError::InvalidCertificate(format!("CA certificate: {}", e)))?;
        let certificate = params
            .signed_by(&device_key, &issuer)
            .map_err(|e| LifecycleError::Issuance(e.to_string()))?;

        Ok(IssuedCertificate {
            certificate_pem: certificate.pem(),
            private_key: device_key.serialize_pem(),
        })
    }
}

/// Answers a device's custom certificate request: issue, register, attach,
/// deliver
pub struct CustomCertificateService {
    authority: Arc<OrganizationCertificateAuthority>,
    certificates: Arc<dyn CertificateRegistry>,
    publisher: Arc<dyn DevicePublisher>,
}

impl CustomCertificateService {
    pub fn new(
        authority: Arc<OrganizationCertificateAuthority>,
        certificates: Arc<dyn CertificateRegistry>,
        publisher: Arc<dyn DevicePublisher>,
    ) -> Self {
        Self {
            authority,
            certificates,
            publisher,
        }
    }

    #[instrument(skip_all, fields(thing_name = %request.thing_name))]
    pub async fn handle(
        &self,
        request: &CustomCertificateRequest,
    ) -> LifecycleResult<CustomCertificateIssued> {
        if request.thing_name.is_empty() {
            return Err(LifecycleError::InvalidEvent(
                "custom certificate request needs thingName".to_string(),
            ));
        }

        let issued = self
            .authority
            .issue(&request.thing_name, Utc::now().date_naive())?;
        let registered = self
            .certificates
            .register_certificate(&issued.certificate_pem, self.authority.ca_certificate_pem())
            .await?;
        self.certificates
            .attach_thing_principal(&request.thing_name, &registered.certificate_arn)
            .await?;
        info!(certificate_id = %registered.certificate_id, "custom certificate registered");

        let delivery = CustomCertificateIssued {
            certificate_id: registered.certificate_id,
            certificate_pem: issued.certificate_pem,
            private_key: issued.private_key,
        };
        let topic = DeviceTopics::new(request.thing_name.clone()).custom_certificate_complete();
        let payload = serde_json::to_vec(&delivery).map_err(|e| LifecycleError::Publish {
            topic: topic.clone(),
            reason: e.to_string(),
        })?;
        self.publisher.publish(&topic, payload).await?;

        info!(topic = %topic, "custom certificate delivered");
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::DEFAULT_PROJECT_UNIT;
    use crate::registry::{MockCertificateRegistry, MockDevicePublisher, RegisteredCertificate};
    use mockall::predicate::eq;
    use rcgen::BasicConstraints;
    use x509_parser::pem::parse_x509_pem;

    fn authority() -> OrganizationCertificateAuthority {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "Sprinkler Fleet CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&key).unwrap();
        OrganizationCertificateAuthority::from_pem(&ca.pem(), &key.serialize_pem(), DEFAULT_PROJECT_UNIT)
            .unwrap()
    }

    #[test]
    fn test_issued_certificate_subject_and_validity() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let issued = authority().issue("sprinkler-01", today).unwrap();

        let (_, pem) = parse_x509_pem(issued.certificate_pem.as_bytes()).unwrap();
        let certificate = pem.parse_x509().unwrap();
        let subject = certificate.subject();
        assert_eq!(
            subject.iter_common_name().next().unwrap().as_str().unwrap(),
            "sprinkler-01"
        );
        assert_eq!(
            subject
                .iter_organizational_unit()
                .next()
                .unwrap()
                .as_str()
                .unwrap(),
            DEFAULT_PROJECT_UNIT
        );
        assert_eq!(
            certificate.issuer().iter_common_name().next().unwrap().as_str().unwrap(),
            "Sprinkler Fleet CA"
        );
        assert!(!certificate.is_ca());

        let validity = certificate.validity();
        let days = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;
        assert_eq!(days, DEVICE_CERTIFICATE_VALIDITY_DAYS);
        assert!(issued.private_key.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_invalid_ca_key_is_rejected() {
        let result = OrganizationCertificateAuthority::from_pem("garbage", "garbage", "unit");
        assert!(matches!(result, Err(LifecycleError::InvalidCertificate(_))));
    }

    #[tokio::test]
    async fn test_request_is_issued_registered_attached_and_delivered() {
        let authority = Arc::new(authority());
        let ca_pem = authority.ca_certificate_pem().to_string();

        let mut certificates = MockCertificateRegistry::new();
        certificates
            .expect_register_certificate()
            .withf(move |certificate, ca| certificate.contains("BEGIN CERTIFICATE") && ca == ca_pem)
            .times(1)
            .returning(|_, _| {
                Ok(RegisteredCertificate {
                    certificate_id: "custom-1".to_string(),
                    certificate_arn: "arn:aws:iot:eu-west-1:1:cert/custom-1".to_string(),
                })
            });
        certificates
            .expect_attach_thing_principal()
            .with(eq("sprinkler-01"), eq("arn:aws:iot:eu-west-1:1:cert/custom-1"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut publisher = MockDevicePublisher::new();
        publisher
            .expect_publish()
            .withf(|topic, payload| {
                let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
                topic == "sprinkler-01/customCa/certificate/create/complete"
                    && body["certificateId"] == "custom-1"
                    && body["privateKey"].as_str().unwrap().contains("PRIVATE KEY")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let service =
            CustomCertificateService::new(authority, Arc::new(certificates), Arc::new(publisher));
        let delivered = service
            .handle(&CustomCertificateRequest {
                thing_name: "sprinkler-01".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(delivered.certificate_id, "custom-1");
    }

    #[tokio::test]
    async fn test_registration_failure_delivers_nothing() {
        let mut certificates = MockCertificateRegistry::new();
        certificates
            .expect_register_certificate()
            .returning(|_, _| Err(anyhow::anyhow!("CA not registered").into()));
        certificates.expect_attach_thing_principal().never();

        let mut publisher = MockDevicePublisher::new();
        publisher.expect_publish().never();

        let service = CustomCertificateService::new(
            Arc::new(authority()),
            Arc::new(certificates),
            Arc::new(publisher),
        );
        let result = service
            .handle(&CustomCertificateRequest {
                thing_name: "sprinkler-01".to_string(),
            })
            .await;
        assert!(matches!(result, Err(LifecycleError::Registry(_))));
    }
}
