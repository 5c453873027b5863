use crate::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const TASK_UPDATE_ROOT_CA: &str = "UPDATE_DEVICE_ROOTCA_CERTIFICATE";
pub const TASK_UPDATE_IOT_CERTIFICATES: &str = "UPDATE_DEVICE_IOT_CERTIFICATES";
pub const TASK_UPDATE_CUSTOM_CERTIFICATES: &str = "UPDATE_DEVICE_CUSTOM_CERTIFICATES";

/// Certificate rotation requested by a job document's `task` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationTask {
    RootCa { url: String },
    IdentityCertificates,
    CustomCertificates,
}

/// Free-form job document as scheduled by the fleet operator.
///
/// ```json
/// {"task": "UPDATE_DEVICE_ROOTCA_CERTIFICATE", "payload": {"url": "https://..."}}
/// {"afr_ota": {"files": [{"update_data_url": "https://..."}]}}
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDocument(pub Value);

impl JobDocument {
    pub fn task(&self) -> Option<&str> {
        self.0.get("task").and_then(Value::as_str)
    }

    pub fn rotation_task(&self) -> AgentResult<Option<RotationTask>> {
        let Some(task) = self.task() else {
            return Ok(None);
        };

        match task {
            TASK_UPDATE_ROOT_CA => {
                let url = self
                    .0
                    .pointer("/payload/url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AgentError::InvalidJobDocument(format!("{} without payload.url", task))
                    })?;
                Ok(Some(RotationTask::RootCa {
                    url: url.to_string(),
                }))
            }
            TASK_UPDATE_IOT_CERTIFICATES => Ok(Some(RotationTask::IdentityCertificates)),
            TASK_UPDATE_CUSTOM_CERTIFICATES => Ok(Some(RotationTask::CustomCertificates)),
            other => {
                warn!(task = %other, "ignoring unknown job task");
                Ok(None)
            }
        }
    }

    /// `afr_ota.files.update_data_url`, where `files` is an object or a list
    pub fn firmware_url(&self) -> Option<String> {
        let files = self.0.pointer("/afr_ota/files")?;
        let file = match files {
            Value::Array(entries) => entries.first()?,
            other => other,
        };
        file.get("update_data_url")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl From<Value> for JobDocument {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
