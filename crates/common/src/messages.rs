//! Payloads exchanged between devices and the fleet backend over the broker.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SOIL_MOISTURE_SENSOR_TYPE: &str = "SoilMoistureSensor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoistureState {
    Dry,
    Hydrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SprinklerState {
    On,
    Off,
}

impl fmt::Display for SprinklerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SprinklerState::On => write!(f, "on"),
            SprinklerState::Off => write!(f, "off"),
        }
    }
}

/// One soil moisture sample as published on `<thing>/sensordata/soil_moisture`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilMoistureTelemetry {
    #[serde(rename = "sensorType")]
    pub sensor_type: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "sensorReportedState")]
    pub reported_state: MoistureState,
    #[serde(rename = "sensorReportedMoisturePercentage")]
    pub moisture_percentage: i64,
}

impl SoilMoistureTelemetry {
    pub fn new(device_id: impl Into<String>, state: MoistureState, percentage: i64) -> Self {
        Self {
            sensor_type: SOIL_MOISTURE_SENSOR_TYPE.to_string(),
            device_id: device_id.into(),
            reported_state: state,
            moisture_percentage: percentage,
        }
    }
}

/// Announces that a device now holds a new certificate; the backend retires
/// every other principal attached to the thing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationComplete {
    pub thing_name: String,
    pub new_certificate_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCertificateRequest {
    pub thing_name: String,
}

/// Organisation issued certificate delivered to a single device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCertificateIssued {
    pub certificate_id: String,
    pub certificate_pem: String,
    pub private_key: String,
}

impl fmt::Debug for CustomCertificateIssued {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCertificateIssued")
            .field("certificate_id", &self.certificate_id)
            .field("certificate_pem_len", &self.certificate_pem.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// `{"state": {"reported": ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowUpdate<T> {
    pub state: ReportedState<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedState<T> {
    pub reported: T,
}

impl<T> ShadowUpdate<T> {
    pub fn reported(reported: T) -> Self {
        Self {
            state: ReportedState { reported },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprinklerReport {
    pub sprinkler_state: SprinklerState,
}

/// Sensor parameters reported once by a freshly provisioned device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_rate: Option<f64>,
    pub abs_hydrated_state_value: i64,
    pub abs_dry_state_value: i64,
    pub sprinkler_trigger_percentage: i64,
}

/// Message on `.../shadow/update/delta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowDelta {
    pub state: DeltaState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeltaState {
    #[serde(default)]
    pub sprinkler_state: Option<SprinklerState>,
}

/// Message on `.../shadow/get/accepted`. Only the calibration values are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowGetAccepted {
    #[serde(default)]
    pub state: ShadowDocumentState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowDocumentState {
    #[serde(default)]
    pub reported: Option<ReportedCalibration>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportedCalibration {
    #[serde(default)]
    pub abs_hydrated_state_value: Option<i64>,
    #[serde(default)]
    pub abs_dry_state_value: Option<i64>,
    #[serde(default)]
    pub sprinkler_trigger_percentage: Option<i64>,
}
