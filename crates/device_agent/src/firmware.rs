use crate::{AgentError, AgentResult};
use async_trait::async_trait;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

const FALLBACK_FILE_NAME: &str = "firmware.bin";

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait FirmwareUpdater: Send + Sync {
    /// Download the image at `url` and hand it to the apply step. Returns the
    /// local path of the image.
    async fn update(&self, url: &str) -> AgentResult<PathBuf>;
}

/// Local file name for an image URL: the last path segment, query dropped
pub fn firmware_file_name(url: &str) -> AgentResult<String> {
    let parsed = Url::parse(url)
        .map_err(|e| AgentError::Firmware(format!("invalid firmware URL '{}': {}", url, e)))?;

    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .unwrap_or(FALLBACK_FILE_NAME);
    Ok(name.to_string())
}

/// Downloads images over HTTPS into the device's firmware directory.
///
/// Applying the image is device specific and only logged here.
pub struct HttpFirmwareUpdater {
    client: reqwest::Client,
    firmware_dir: PathBuf,
}

impl HttpFirmwareUpdater {
    pub fn new(firmware_dir: impl Into<PathBuf>, timeout: Duration) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Firmware(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            firmware_dir: firmware_dir.into(),
        })
    }

    pub fn firmware_dir(&self) -> &Path {
        &self.firmware_dir
    }
}

#[async_trait]
impl FirmwareUpdater for HttpFirmwareUpdater {
    #[instrument(skip_all)]
    async fn update(&self, url: &str) -> AgentResult<PathBuf> {
        let file_name = firmware_file_name(url)?;
        info!(file_name = %file_name, "downloading firmware files");

        let image = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentError::Firmware(format!("download failed: {}", e)))?
            .bytes()
            .await
            .map_err(|e| AgentError::Firmware(format!("download interrupted: {}", e)))?;

        tokio::fs::create_dir_all(&self.firmware_dir).await?;
        let path = self.firmware_dir.join(&file_name);
        tokio::fs::write(&path, &image).await?;

        info!(path = %path.display(), bytes = image.len(), "executing OTA update");
        Ok(path)
    }
}
