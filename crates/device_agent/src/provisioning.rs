mod fleet_provisioner;
mod messages;

pub use fleet_provisioner::*;
pub use messages::*;

use crate::parameters::DeviceParameters;
use crate::AgentResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Firmware version registered for devices provisioned without one
pub const DEFAULT_FIRMWARE_VERSION: &str = "13.3.4";

/// Sensor metadata registered with the thing on first provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub sensor_type: Option<String>,
    pub plant_id: Option<String>,
    pub firmware_version: String,
}

impl From<&DeviceParameters> for DeviceMetadata {
    fn from(parameters: &DeviceParameters) -> Self {
        Self {
            sensor_type: parameters.sensor_type.clone(),
            plant_id: parameters.plant_id.clone(),
            firmware_version: DEFAULT_FIRMWARE_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// First identity of a device; registers sensor metadata
    Initial(DeviceMetadata),
    /// Replacement identity for an existing thing
    Rotation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub template_name: String,
    pub mode: ProvisioningMode,
}

/// Result of a completed bootstrap. The certificate and key are already
/// persisted in the identity store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedIdentity {
    pub certificate_id: String,
    pub thing_name: String,
}

/// Template parameters sent with the register thing request
pub fn template_parameters(
    device_name: &str,
    mode: &ProvisioningMode,
    created_on: NaiveDate,
) -> BTreeMap<String, String> {
    let mut parameters = BTreeMap::new();
    let created_on = created_on.format("%Y-%m-%d").to_string();

    match mode {
        ProvisioningMode::Initial(metadata) => {
            parameters.insert("SerialNumber".to_string(), device_name.to_string());
            parameters.insert("CertificateCreatedOn".to_string(), created_on);
            if let Some(sensor_type) = &metadata.sensor_type {
                parameters.insert("SensorType".to_string(), sensor_type.clone());
            }
            if let Some(plant_id) = &metadata.plant_id {
                parameters.insert("PlantId".to_string(), plant_id.clone());
            }
            parameters.insert(
                "FirmwareVersion".to_string(),
                metadata.firmware_version.clone(),
            );
        }
        ProvisioningMode::Rotation => {
            parameters.insert("ThingName".to_string(), device_name.to_string());
            parameters.insert("CertificateCreatedOn".to_string(), created_on);
        }
    }

    parameters
}

/// Exchanges the claim identity for a unique device identity
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait IdentityProvisioner: Send + Sync {
    async fn provision(&self, request: ProvisioningRequest) -> AgentResult<ProvisionedIdentity>;
}
