use crate::identity::write_atomic;
use crate::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(100);

/// Persisted per-device configuration (`parameters.json`).
///
/// Keys this agent does not know about are carried through rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceParameters {
    /// Seconds between telemetry samples
    pub message_interval: f64,
    pub abs_hydrated_state_value: i64,
    pub abs_dry_state_value: i64,
    pub sprinkler_trigger_percentage: i64,
    #[serde(default)]
    pub new_device: bool,
    #[serde(rename = "provisioningTemplateName")]
    pub provisioning_template_name: String,
    #[serde(rename = "rotationTemplateName")]
    pub rotation_template_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceParameters {
    pub fn message_interval(&self) -> Duration {
        if self.message_interval.is_finite() && self.message_interval > 0.0 {
            Duration::from_secs_f64(self.message_interval).max(MIN_MESSAGE_INTERVAL)
        } else {
            MIN_MESSAGE_INTERVAL
        }
    }
}

/// Serialised access to the parameters file
pub struct ParameterStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ParameterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> AgentResult<DeviceParameters> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            AgentError::Parameters(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            AgentError::Parameters(format!("invalid {}: {}", self.path.display(), e))
        })
    }

    pub async fn save(&self, parameters: &DeviceParameters) -> AgentResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(parameters).await
    }

    /// Read-modify-write under the store lock
    pub async fn update<F>(&self, mutate: F) -> AgentResult<DeviceParameters>
    where
        F: FnOnce(&mut DeviceParameters),
    {
        let _guard = self.write_lock.lock().await;
        let mut parameters = self.load().await?;
        mutate(&mut parameters);
        self.write(&parameters).await?;
        Ok(parameters)
    }

    async fn write(&self, parameters: &DeviceParameters) -> AgentResult<()> {
        let body = serde_json::to_vec_pretty(parameters)
            .map_err(|e| AgentError::Parameters(e.to_string()))?;
        write_atomic(&self.path, &body).await?;
        debug!(path = %self.path.display(), "wrote device parameters");
        Ok(())
    }
}
