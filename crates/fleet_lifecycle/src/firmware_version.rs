use crate::error::{LifecycleError, LifecycleResult};
use crate::registry::{resource_id_from_arn, OtaUpdateRegistry, ThingRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

pub const FIRMWARE_VERSION_ATTRIBUTE: &str = "FirmwareVersion";

/// A finished OTA job execution on one thing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaJobCompleted {
    /// `AFR_OTA-<ota update id>`
    pub job_id: String,
    pub thing_arn: String,
}

/// Version encoded in an OTA object key: `.../<name>_v<version>.zip`
pub fn firmware_version_from_key(key: &str) -> LifecycleResult<String> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let stem = file_name.strip_suffix(".zip").unwrap_or(file_name);
    stem.split("_v")
        .nth(1)
        .filter(|version| !version.is_empty())
        .map(str::to_string)
        .ok_or_else(|| LifecycleError::InvalidFirmwareKey(key.to_string()))
}

/// OTA update id carried in the job id after the first `-`
pub fn ota_update_id_from_job_id(job_id: &str) -> Option<&str> {
    job_id.split('-').nth(1).filter(|id| !id.is_empty())
}

/// Records the firmware a device runs as a thing attribute once its OTA job
/// completes
pub struct FirmwareVersionService {
    ota_updates: Arc<dyn OtaUpdateRegistry>,
    things: Arc<dyn ThingRegistry>,
}

impl FirmwareVersionService {
    pub fn new(ota_updates: Arc<dyn OtaUpdateRegistry>, things: Arc<dyn ThingRegistry>) -> Self {
        Self {
            ota_updates,
            things,
        }
    }

    #[instrument(skip_all, fields(job_id = %event.job_id))]
    pub async fn handle(&self, event: &OtaJobCompleted) -> LifecycleResult<String> {
        let ota_update_id = ota_update_id_from_job_id(&event.job_id).ok_or_else(|| {
            LifecycleError::InvalidEvent(format!("job id '{}' names no OTA update", event.job_id))
        })?;
        let thing_name = resource_id_from_arn(&event.thing_arn).ok_or_else(|| {
            LifecycleError::InvalidEvent(format!("'{}' is not a thing ARN", event.thing_arn))
        })?;

        let keys = self.ota_updates.update_file_keys(ota_update_id).await?;
        let key = keys.first().ok_or_else(|| {
            LifecycleError::InvalidEvent(format!("OTA update '{}' ships no files", ota_update_id))
        })?;
        let version = firmware_version_from_key(key)?;

        let attributes = BTreeMap::from([(FIRMWARE_VERSION_ATTRIBUTE.to_string(), version.clone())]);
        self.things
            .merge_thing_attributes(thing_name, attributes)
            .await?;

        info!(thing_name = %thing_name, firmware_version = %version, "thing attribute updated");
        Ok(version)
    }
}
