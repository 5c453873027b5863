use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const DEFAULT_SERIAL_PREFIX: &str = "AWS_";
const SERIAL_NUMBER_PARAMETER: &str = "SerialNumber";

/// What the provisioning service asks before registering a thing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreProvisioningRequest {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreProvisioningResponse {
    pub allow_provisioning: bool,
}

/// Admits only devices whose serial number carries the fleet prefix
pub struct PreProvisioningHook {
    serial_prefix: String,
}

impl Default for PreProvisioningHook {
    fn default() -> Self {
        Self::new(DEFAULT_SERIAL_PREFIX)
    }
}

impl PreProvisioningHook {
    pub fn new(serial_prefix: impl Into<String>) -> Self {
        Self {
            serial_prefix: serial_prefix.into(),
        }
    }

    pub fn evaluate(&self, request: &PreProvisioningRequest) -> PreProvisioningResponse {
        let serial = request.parameters.get(SERIAL_NUMBER_PARAMETER);
        let allow_provisioning = serial.is_some_and(|s| s.starts_with(&self.serial_prefix));

        if allow_provisioning {
            info!(serial_number = ?serial, "provisioning allowed");
        } else {
            warn!(serial_number = ?serial, prefix = %self.serial_prefix, "provisioning refused");
        }
        PreProvisioningResponse { allow_provisioning }
    }
}
