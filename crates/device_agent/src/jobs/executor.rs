use super::{JobDocument, JobStatus, RotationTask};
use crate::firmware::FirmwareUpdater;
use crate::rotation::CertificateRotation;
use crate::AgentError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Which status a job reports when one of its tasks failed locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFailurePolicy {
    /// Task failures are logged only; the job always reports SUCCEEDED
    #[default]
    ReportSucceeded,
    ReportFailed,
}

/// Outcome of running one job document
#[derive(Debug, Default)]
pub struct JobReport {
    pub failures: Vec<AgentError>,
}

impl JobReport {
    pub fn record(&mut self, err: AgentError) {
        self.failures.push(err);
    }

    /// First failure that leaves the session unusable, if any
    pub fn session_failure(&self) -> Option<&AgentError> {
        self.failures.iter().find(|e| e.is_session_fatal())
    }

    pub fn final_status(&self, policy: TaskFailurePolicy) -> JobStatus {
        match policy {
            TaskFailurePolicy::ReportFailed if !self.failures.is_empty() => JobStatus::Failed,
            _ => JobStatus::Succeeded,
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job_id: &str, document: &JobDocument) -> JobReport;
}

/// Runs the rotation task and the firmware step of a job document
pub struct SprinklerJobExecutor {
    rotation: Arc<dyn CertificateRotation>,
    firmware: Arc<dyn FirmwareUpdater>,
}

impl SprinklerJobExecutor {
    pub fn new(rotation: Arc<dyn CertificateRotation>, firmware: Arc<dyn FirmwareUpdater>) -> Self {
        Self { rotation, firmware }
    }

    async fn run_rotation(&self, task: RotationTask) -> Result<(), AgentError> {
        match task {
            RotationTask::RootCa { url } => self.rotation.update_root_ca(&url).await,
            RotationTask::IdentityCertificates => {
                let certificate_id = self.rotation.rotate_identity().await?;
                info!(certificate_id = %certificate_id, "identity rotation complete");
                Ok(())
            }
            RotationTask::CustomCertificates => {
                let certificate_id = self.rotation.rotate_custom_certificate().await?;
                info!(certificate_id = %certificate_id, "custom certificate rotation complete");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl JobExecutor for SprinklerJobExecutor {
    #[instrument(name = "execute_job", skip_all, fields(job_id = %job_id))]
    async fn execute(&self, job_id: &str, document: &JobDocument) -> JobReport {
        let mut report = JobReport::default();
        info!("starting local work on job");

        match document.rotation_task() {
            Ok(Some(task)) => {
                if let Err(e) = self.run_rotation(task).await {
                    warn!(error = %e, "rotation task failed");
                    report.record(e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "unreadable rotation task");
                report.record(e);
            }
        }

        if let Some(url) = document.firmware_url() {
            match self.firmware.update(&url).await {
                Ok(path) => info!(path = %path.display(), "firmware update applied"),
                Err(e) => {
                    warn!(error = %e, "firmware update failed");
                    report.record(e);
                }
            }
        }

        info!(failures = report.failures.len(), "done working on job");
        report
    }
}
