use crate::error::{LifecycleError, LifecycleResult};
use crate::expiry::ExpiringGroups;
use crate::registry::{certificate_arn, resource_id_from_arn, CertificateRegistry, ThingRegistry};
use common::messages::RotationComplete;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationCleanupConfig {
    pub region: String,
    pub account_id: String,
    pub expiring_groups: ExpiringGroups,
}

/// Which step of retiring a certificate failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    Detach,
    Revoke,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub principal: String,
    pub step: CleanupStep,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Principals every step succeeded for
    pub retired: Vec<String>,
    pub failures: Vec<StepFailure>,
}

/// Retires every certificate of a thing except the one it just rotated to
pub struct RotationCleanupService {
    certificates: Arc<dyn CertificateRegistry>,
    things: Arc<dyn ThingRegistry>,
    config: RotationCleanupConfig,
}

impl RotationCleanupService {
    pub fn new(
        certificates: Arc<dyn CertificateRegistry>,
        things: Arc<dyn ThingRegistry>,
        config: RotationCleanupConfig,
    ) -> Self {
        Self {
            certificates,
            things,
            config,
        }
    }

    #[instrument(skip_all, fields(thing_name = %event.thing_name, certificate_id = %event.new_certificate_id))]
    pub async fn handle(&self, event: &RotationComplete) -> LifecycleResult<CleanupReport> {
        if event.thing_name.is_empty() || event.new_certificate_id.is_empty() {
            return Err(LifecycleError::InvalidEvent(
                "rotation complete needs thingName and newCertificateId".to_string(),
            ));
        }

        let keep = certificate_arn(
            &self.config.region,
            &self.config.account_id,
            &event.new_certificate_id,
        );
        let principals = self
            .certificates
            .list_thing_principals(&event.thing_name)
            .await?;

        let mut report = CleanupReport::default();
        for principal in principals.into_iter().filter(|p| *p != keep) {
            let failures_before = report.failures.len();
            self.retire(&event.thing_name, &principal, &mut report).await;
            if report.failures.len() == failures_before {
                report.retired.push(principal);
            }
        }

        for group in [
            &self.config.expiring_groups.platform_issued,
            &self.config.expiring_groups.organization_issued,
        ] {
            self.things
                .remove_thing_from_group(group, &event.thing_name)
                .await?;
        }

        info!(
            retired = report.retired.len(),
            failed_steps = report.failures.len(),
            "old certificates retired"
        );
        Ok(report)
    }

    /// Detach, revoke and delete one principal. Each step runs even when the
    /// one before it failed.
    async fn retire(&self, thing_name: &str, principal: &str, report: &mut CleanupReport) {
        let mut record = |step: CleanupStep, reason: String| {
            warn!(principal = %principal, ?step, reason = %reason, "certificate cleanup step failed");
            report.failures.push(StepFailure {
                principal: principal.to_string(),
                step,
                reason,
            });
        };

        match self
            .certificates
            .detach_thing_principal(thing_name, principal)
            .await
        {
            Ok(()) => info!(principal = %principal, "detached certificate"),
            Err(e) => record(CleanupStep::Detach, e.to_string()),
        }

        let Some(certificate_id) = resource_id_from_arn(principal) else {
            record(CleanupStep::Revoke, "principal is not a certificate ARN".to_string());
            return;
        };

        match self.certificates.revoke_certificate(certificate_id).await {
            Ok(()) => info!(principal = %principal, "revoked certificate"),
            Err(e) => record(CleanupStep::Revoke, e.to_string()),
        }
        match self.certificates.delete_certificate(certificate_id).await {
            Ok(()) => info!(principal = %principal, "deleted certificate"),
            Err(e) => record(CleanupStep::Delete, e.to_string()),
        }
    }
}
