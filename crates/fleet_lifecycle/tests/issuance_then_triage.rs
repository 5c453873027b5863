use async_trait::async_trait;
use common::messages::{CustomCertificateRequest, RotationComplete};
use fleet_lifecycle::registry::certificate_arn;
use fleet_lifecycle::{
    AuditNotification, AuditRegistry, CertificateDescription, CertificateRegistry,
    CustomCertificateService, DevicePublisher, ExpiringGroups, ExpiryTriageConfig,
    ExpiryTriageService, LifecycleResult, OrganizationCertificateAuthority, RegisteredCertificate,
    RotationCleanupConfig, RotationCleanupService, ThingRegistry, DEFAULT_PROJECT_UNIT,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

const REGION: &str = "eu-west-1";
const ACCOUNT: &str = "123456789012";

/// In-memory registry backing every trait the services need
#[derive(Default)]
struct Registry {
    certificates: Mutex<BTreeMap<String, String>>,
    attachments: Mutex<BTreeSet<(String, String)>>,
    groups: Mutex<BTreeSet<(String, String)>>,
    revoked: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl CertificateRegistry for Registry {
    async fn list_thing_principals(&self, thing_name: &str) -> LifecycleResult<Vec<String>> {
        Ok(self
            .attachments
            .lock()
            .unwrap()
            .iter()
            .filter(|(thing, _)| thing == thing_name)
            .map(|(_, principal)| principal.clone())
            .collect())
    }

    async fn detach_thing_principal(&self, thing_name: &str, principal: &str) -> LifecycleResult<()> {
        self.attachments
            .lock()
            .unwrap()
            .remove(&(thing_name.to_string(), principal.to_string()));
        Ok(())
    }

    async fn attach_thing_principal(&self, thing_name: &str, principal: &str) -> LifecycleResult<()> {
        self.attachments
            .lock()
            .unwrap()
            .insert((thing_name.to_string(), principal.to_string()));
        Ok(())
    }

    async fn revoke_certificate(&self, certificate_id: &str) -> LifecycleResult<()> {
        self.revoked.lock().unwrap().push(certificate_id.to_string());
        Ok(())
    }

    async fn delete_certificate(&self, certificate_id: &str) -> LifecycleResult<()> {
        self.certificates.lock().unwrap().remove(certificate_id);
        Ok(())
    }

    async fn describe_certificate(
        &self,
        certificate_id: &str,
    ) -> LifecycleResult<CertificateDescription> {
        let certificate_pem = self
            .certificates
            .lock()
            .unwrap()
            .get(certificate_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no certificate {}", certificate_id))?;
        Ok(CertificateDescription {
            certificate_id: certificate_id.to_string(),
            certificate_arn: certificate_arn(REGION, ACCOUNT, certificate_id),
            certificate_pem,
        })
    }

    async fn list_principal_things(&self, principal: &str) -> LifecycleResult<Vec<String>> {
        Ok(self
            .attachments
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p == principal)
            .map(|(thing, _)| thing.clone())
            .collect())
    }

    async fn register_certificate(
        &self,
        certificate_pem: &str,
        _ca_certificate_pem: &str,
    ) -> LifecycleResult<RegisteredCertificate> {
        let mut certificates = self.certificates.lock().unwrap();
        let certificate_id = format!("custom-{}", certificates.len() + 1);
        certificates.insert(certificate_id.clone(), certificate_pem.to_string());
        Ok(RegisteredCertificate {
            certificate_arn: certificate_arn(REGION, ACCOUNT, &certificate_id),
            certificate_id,
        })
    }
}

#[async_trait]
impl ThingRegistry for Registry {
    async fn add_thing_to_group(&self, group_name: &str, thing_name: &str) -> LifecycleResult<()> {
        self.groups
            .lock()
            .unwrap()
            .insert((group_name.to_string(), thing_name.to_string()));
        Ok(())
    }

    async fn remove_thing_from_group(&self, group_name: &str, thing_name: &str) -> LifecycleResult<()> {
        self.groups
            .lock()
            .unwrap()
            .remove(&(group_name.to_string(), thing_name.to_string()));
        Ok(())
    }

    async fn merge_thing_attributes(
        &self,
        _thing_name: &str,
        _attributes: BTreeMap<String, String>,
    ) -> LifecycleResult<()> {
        Ok(())
    }
}

#[async_trait]
impl AuditRegistry for Registry {
    async fn list_finding_certificate_ids(
        &self,
        _task_id: &str,
        _check_name: &str,
    ) -> LifecycleResult<Vec<String>> {
        Ok(self.certificates.lock().unwrap().keys().cloned().collect())
    }
}

#[async_trait]
impl DevicePublisher for Registry {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> LifecycleResult<()> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

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

fn groups() -> ExpiringGroups {
    ExpiringGroups {
        platform_issued: "expiring-iot-certs".to_string(),
        organization_issued: "expiring-custom-certs".to_string(),
    }
}

#[tokio::test]
async fn test_issued_certificate_expires_rotates_and_is_retired() {
    let registry = Arc::new(Registry::default());

    let issuance = CustomCertificateService::new(
        Arc::new(authority()),
        registry.clone(),
        registry.clone(),
    );
    let request = CustomCertificateRequest {
        thing_name: "sprinkler-01".to_string(),
    };
    let first = issuance.handle(&request).await.unwrap();
    assert_eq!(registry.published.lock().unwrap().len(), 1);

    // the audit flags the organisation issued certificate as expiring
    let triage = ExpiryTriageService::new(
        registry.clone(),
        registry.clone(),
        registry.clone(),
        ExpiryTriageConfig::new(groups()),
    );
    let notification: AuditNotification = serde_json::from_value(serde_json::json!({
        "taskId": "audit-1",
        "auditDetails": [{
            "checkName": "DEVICE_CERTIFICATE_EXPIRING_CHECK",
            "checkRunStatus": "COMPLETED_NON_COMPLIANT"
        }]
    }))
    .unwrap();
    let report = triage.handle(&notification).await.unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].group_name, "expiring-custom-certs");
    assert!(registry
        .groups
        .lock()
        .unwrap()
        .contains(&("expiring-custom-certs".to_string(), "sprinkler-01".to_string())));

    // the rotation job issues a second certificate, the device announces it
    let second = issuance.handle(&request).await.unwrap();
    let cleanup = RotationCleanupService::new(
        registry.clone(),
        registry.clone(),
        RotationCleanupConfig {
            region: REGION.to_string(),
            account_id: ACCOUNT.to_string(),
            expiring_groups: groups(),
        },
    );
    let cleaned = cleanup
        .handle(&RotationComplete {
            thing_name: "sprinkler-01".to_string(),
            new_certificate_id: second.certificate_id.clone(),
        })
        .await
        .unwrap();

    assert_eq!(
        cleaned.retired,
        vec![certificate_arn(REGION, ACCOUNT, &first.certificate_id)]
    );
    assert_eq!(*registry.revoked.lock().unwrap(), vec![first.certificate_id]);
    assert!(registry.groups.lock().unwrap().is_empty());
    let principals = registry.list_thing_principals("sprinkler-01").await.unwrap();
    assert_eq!(
        principals,
        vec![certificate_arn(REGION, ACCOUNT, &second.certificate_id)]
    );
}
