use config::{Config, ConfigError, Environment};
use device_agent::jobs::TaskFailurePolicy;
use device_agent::provisioning::ProvisioningTimeouts;
use device_agent::AgentSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON log lines; plain text when false
    #[serde(default = "default_log_json")]
    pub log_json: bool,

    // Broker
    /// Broker host name
    pub endpoint: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Thing name; also the MQTT client id of the device session
    pub device_name: String,

    // Local state
    /// Base directory holding one sub directory per device
    #[serde(default = "default_devices_dir")]
    pub devices_dir: PathBuf,

    /// File name of the broker trust anchor inside `certificates/`
    #[serde(default = "default_trust_anchor_file")]
    pub trust_anchor_file: String,

    // Sessions
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_claim_keep_alive_secs")]
    pub claim_keep_alive_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bound on waiting for PUBACK / SUBACK
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    // Identity bootstrap and rotation
    #[serde(default = "default_create_keys_timeout_secs")]
    pub create_keys_timeout_secs: u64,

    #[serde(default = "default_register_thing_timeout_secs")]
    pub register_thing_timeout_secs: u64,

    #[serde(default = "default_custom_certificate_timeout_secs")]
    pub custom_certificate_timeout_secs: u64,

    /// Root CA and firmware downloads
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Report FAILED for jobs with a failed task instead of SUCCEEDED
    #[serde(default)]
    pub report_task_failures: bool,

    #[serde(default = "default_closer_timeout_secs")]
    pub closer_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

fn default_port() -> u16 {
    device_agent::DEFAULT_MQTT_PORT
}

fn default_devices_dir() -> PathBuf {
    PathBuf::from("devices")
}

fn default_trust_anchor_file() -> String {
    device_agent::identity::DEFAULT_TRUST_ANCHOR_FILE.to_string()
}

fn default_keep_alive_secs() -> u64 {
    6
}

fn default_claim_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_create_keys_timeout_secs() -> u64 {
    12
}

fn default_register_thing_timeout_secs() -> u64 {
    20
}

fn default_custom_certificate_timeout_secs() -> u64 {
    30
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_closer_timeout_secs() -> u64 {
    5
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("SPRINKLER"))
            .build()?
            .try_deserialize()
    }

    pub fn agent_settings(&self) -> AgentSettings {
        let mut settings = AgentSettings::new(self.endpoint.clone(), self.device_name.clone());
        settings.port = self.port;
        settings.devices_dir = self.devices_dir.clone();
        settings.trust_anchor_file = self.trust_anchor_file.clone();
        settings.keep_alive = Duration::from_secs(self.keep_alive_secs);
        settings.claim_keep_alive = Duration::from_secs(self.claim_keep_alive_secs);
        settings.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        settings.ack_timeout = Duration::from_secs(self.ack_timeout_secs);
        settings.provisioning_timeouts = ProvisioningTimeouts {
            create_keys: Duration::from_secs(self.create_keys_timeout_secs),
            register_thing: Duration::from_secs(self.register_thing_timeout_secs),
        };
        settings.custom_certificate_timeout =
            Duration::from_secs(self.custom_certificate_timeout_secs);
        settings.http_timeout = Duration::from_secs(self.http_timeout_secs);
        settings.task_failure_policy = if self.report_task_failures {
            TaskFailurePolicy::ReportFailed
        } else {
            TaskFailurePolicy::ReportSucceeded
        };
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env vars are process wide
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "SPRINKLER_ENDPOINT",
        "SPRINKLER_DEVICE_NAME",
        "SPRINKLER_LOG_LEVEL",
        "SPRINKLER_REPORT_TASK_FAILURES",
        "SPRINKLER_CREATE_KEYS_TIMEOUT_SECS",
    ];

    fn clear() {
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            for var in VARS {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_required_fields() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear();

        assert!(ServiceConfig::from_env().is_err());
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("SPRINKLER_ENDPOINT", "broker.example.com");
            std::env::set_var("SPRINKLER_DEVICE_NAME", "sprinkler-01");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.port, 8883);
        assert!(!config.report_task_failures);

        let settings = config.agent_settings();
        assert_eq!(settings.device_name, "sprinkler-01");
        assert_eq!(settings.keep_alive, Duration::from_secs(6));
        assert_eq!(
            settings.provisioning_timeouts,
            ProvisioningTimeouts::default()
        );
        assert_eq!(settings.task_failure_policy, TaskFailurePolicy::ReportSucceeded);

        clear();
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("SPRINKLER_ENDPOINT", "broker.example.com");
            std::env::set_var("SPRINKLER_DEVICE_NAME", "sprinkler-01");
            std::env::set_var("SPRINKLER_LOG_LEVEL", "debug");
            std::env::set_var("SPRINKLER_REPORT_TASK_FAILURES", "true");
            std::env::set_var("SPRINKLER_CREATE_KEYS_TIMEOUT_SECS", "3");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");

        let settings = config.agent_settings();
        assert_eq!(settings.task_failure_policy, TaskFailurePolicy::ReportFailed);
        assert_eq!(
            settings.provisioning_timeouts.create_keys,
            Duration::from_secs(3)
        );

        clear();
    }
}
