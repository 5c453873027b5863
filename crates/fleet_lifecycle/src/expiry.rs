use crate::error::{LifecycleError, LifecycleResult};
use crate::registry::{AuditRegistry, CertificateRegistry, ThingRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use x509_parser::pem::parse_x509_pem;

pub const EXPIRING_CHECK_NAME: &str = "DEVICE_CERTIFICATE_EXPIRING_CHECK";
pub const NON_COMPLIANT_STATUS: &str = "COMPLETED_NON_COMPLIANT";

pub const DEFAULT_PLATFORM_ISSUER_COMMON_NAME: &str = "AWS IoT Certificate";
pub const DEFAULT_PROJECT_UNIT: &str = "IoT Sprinkler Project";

/// Thing groups whose members get a certificate rotation job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringGroups {
    /// Things with a platform issued certificate close to expiry
    pub platform_issued: String,
    /// Things with an organisation issued certificate close to expiry
    pub organization_issued: String,
}

/// Device audit result as delivered by the audit notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditNotification {
    pub task_id: String,
    #[serde(default)]
    pub audit_details: Vec<AuditCheckDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditCheckDetail {
    pub check_name: String,
    pub check_run_status: String,
}

impl AuditCheckDetail {
    fn is_actionable(&self) -> bool {
        self.check_name == EXPIRING_CHECK_NAME && self.check_run_status == NON_COMPLIANT_STATUS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateOrigin {
    PlatformIssued,
    OrganizationIssued,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryTriageConfig {
    pub platform_issuer_common_name: String,
    pub project_unit: String,
    pub expiring_groups: ExpiringGroups,
}

impl ExpiryTriageConfig {
    pub fn new(expiring_groups: ExpiringGroups) -> Self {
        Self {
            platform_issuer_common_name: DEFAULT_PLATFORM_ISSUER_COMMON_NAME.to_string(),
            project_unit: DEFAULT_PROJECT_UNIT.to_string(),
            expiring_groups,
        }
    }

    /// Classify a certificate by its subject: the platform issuer's common
    /// name first, then the project's organisational unit
    pub fn classify(&self, certificate_pem: &str) -> LifecycleResult<CertificateOrigin> {
        let (_, pem) = parse_x509_pem(certificate_pem.as_bytes())
            .map_err(|e| LifecycleError::InvalidCertificate(e.to_string()))?;
        let certificate = pem
            .parse_x509()
            .map_err(|e| LifecycleError::InvalidCertificate(e.to_string()))?;
        let subject = certificate.subject();

        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        if common_name == Some(self.platform_issuer_common_name.as_str()) {
            return Ok(CertificateOrigin::PlatformIssued);
        }

        let in_project = subject
            .iter_organizational_unit()
            .filter_map(|ou| ou.as_str().ok())
            .any(|ou| ou == self.project_unit);
        if in_project {
            return Ok(CertificateOrigin::OrganizationIssued);
        }
        Ok(CertificateOrigin::Unknown)
    }

    fn group_for(&self, origin: CertificateOrigin) -> Option<&str> {
        match origin {
            CertificateOrigin::PlatformIssued => Some(&self.expiring_groups.platform_issued),
            CertificateOrigin::OrganizationIssued => {
                Some(&self.expiring_groups.organization_issued)
            }
            CertificateOrigin::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    pub group_name: String,
    pub thing_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriageReport {
    pub assigned: Vec<GroupAssignment>,
    /// Certificates of unknown origin
    pub skipped: Vec<String>,
}

/// Moves things whose certificate is about to expire into the matching
/// expiring group, from where rotation jobs are targeted
pub struct ExpiryTriageService {
    audits: Arc<dyn AuditRegistry>,
    certificates: Arc<dyn CertificateRegistry>,
    things: Arc<dyn ThingRegistry>,
    config: ExpiryTriageConfig,
}

impl ExpiryTriageService {
    pub fn new(
        audits: Arc<dyn AuditRegistry>,
        certificates: Arc<dyn CertificateRegistry>,
        things: Arc<dyn ThingRegistry>,
        config: ExpiryTriageConfig,
    ) -> Self {
        Self {
            audits,
            certificates,
            things,
            config,
        }
    }

    #[instrument(skip_all, fields(task_id = %notification.task_id))]
    pub async fn handle(&self, notification: &AuditNotification) -> LifecycleResult<TriageReport> {
        let mut report = TriageReport::default();

        for check in &notification.audit_details {
            if !check.is_actionable() {
                debug!(check = %check.check_name, status = %check.check_run_status, "ignoring audit check");
                continue;
            }

            let expiring = self
                .audits
                .list_finding_certificate_ids(&notification.task_id, &check.check_name)
                .await?;
            for certificate_id in expiring {
                self.triage(&certificate_id, &mut report).await?;
            }
        }

        info!(
            assigned = report.assigned.len(),
            skipped = report.skipped.len(),
            "expiring certificates triaged"
        );
        Ok(report)
    }

    async fn triage(&self, certificate_id: &str, report: &mut TriageReport) -> LifecycleResult<()> {
        let description = self.certificates.describe_certificate(certificate_id).await?;
        let origin = self.config.classify(&description.certificate_pem)?;
        let Some(group) = self.config.group_for(origin) else {
            warn!(certificate_id = %certificate_id, "unknown certificate, skipping");
            report.skipped.push(certificate_id.to_string());
            return Ok(());
        };

        let holders = self
            .certificates
            .list_principal_things(&description.certificate_arn)
            .await?;
        for thing_name in holders {
            self.things.add_thing_to_group(group, &thing_name).await?;
            info!(certificate_id = %certificate_id, thing_name = %thing_name, group = %group, "thing marked for rotation");
            report.assigned.push(GroupAssignment {
                group_name: group.to_string(),
                thing_name,
            });
        }
        Ok(())
    }
}
