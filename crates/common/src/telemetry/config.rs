/// Configuration for tracing initialization
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sprinkler-device".to_string(),
            log_level: "info".to_string(),
            json: true,
        }
    }
}
