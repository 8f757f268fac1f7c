//! Pipeline configuration loaded from TOML.
//!
//! ```toml
//! mode = "video"
//!
//! [primary]
//! index = 0
//! width = 1920
//! height = 1080
//! fourcc = "NV12"
//!
//! [secondary]
//! index = 1
//! width = 640
//! height = 480
//! fourcc = "NV12"
//!
//! [buffers]
//! count = 6
//! memory = "userptr"
//!
//! [exposure]
//! gain_lag_frames = 2
//! exposure_lag_frames = 5
//! ```
//!
//! Every field has a default, so an empty file is a valid single-device
//! preview configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::capture::DEFAULT_ACQUIRE_ATTEMPTS;
use crate::error::{CameraError, Result};
use crate::exposure::SyncConfig;
use crate::traits::{CaptureMode, Format, FourCC, MemoryMode};

/// Largest pool a configuration may request.
pub const MAX_BUFFERS: u32 = 32;

/// Longest single dequeue poll, bounded by what `poll(2)` accepts.
pub const MAX_TIMEOUT_MS: u64 = 0x7fff_ffff;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Operating mode applied to every device.
    pub mode: CaptureMode,
    /// Device every frame comes from.
    pub primary: DeviceConfig,
    /// Optional second device driven in lockstep with the primary.
    pub secondary: Option<DeviceConfig>,
    /// Buffer pool settings shared by both devices.
    pub buffers: BufferConfig,
    /// Acquisition timeout and retry bound.
    pub acquire: AcquireConfig,
    /// Sensor lag and exposure sync settings.
    pub exposure: SyncConfig,
}

/// One capture device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device node index (`/dev/videoN`).
    pub index: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Four-character pixel format code.
    pub fourcc: String,
    /// Capture raw sensor data.
    pub raw: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fourcc: "YUYV".to_owned(),
            raw: false,
        }
    }
}

impl DeviceConfig {
    /// Requested format.
    pub fn format(&self) -> Result<Format> {
        let fourcc: FourCC = self.fourcc.parse()?;
        Ok(Format::new(self.width, self.height, fourcc).with_raw(self.raw))
    }
}

/// Buffer pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Buffers to request per device.
    pub count: u32,
    /// Who owns the buffer memory.
    pub memory: MemoryMode,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            count: 4,
            memory: MemoryMode::Mmap,
        }
    }
}

/// Acquisition settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquireConfig {
    /// Single dequeue poll timeout in milliseconds.
    pub timeout_ms: u64,
    /// Dequeue polls per acquire before recovery.
    pub attempts: u32,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            attempts: DEFAULT_ACQUIRE_ATTEMPTS,
        }
    }
}

impl AcquireConfig {
    /// Poll timeout as a duration.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| CameraError::Configuration(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations no pipeline could run with.
    ///
    /// Sensor lags are not checked here; an inverted lag pair puts the
    /// exposure engine in bypass instead of refusing to capture.
    pub fn validate(&self) -> Result<()> {
        self.primary.format()?.validate()?;
        if let Some(secondary) = &self.secondary {
            secondary.format()?.validate()?;
            if secondary.index == self.primary.index {
                return Err(CameraError::Configuration(format!(
                    "primary and secondary both use device {}",
                    self.primary.index
                )));
            }
        }
        if self.buffers.count == 0 || self.buffers.count > MAX_BUFFERS {
            return Err(CameraError::Configuration(format!(
                "buffer count {} outside 1..={MAX_BUFFERS}",
                self.buffers.count
            )));
        }
        if self.acquire.timeout_ms == 0 || self.acquire.timeout_ms > MAX_TIMEOUT_MS {
            return Err(CameraError::Configuration(format!(
                "acquire timeout {} ms outside 1..={MAX_TIMEOUT_MS}",
                self.acquire.timeout_ms
            )));
        }
        if self.acquire.attempts == 0 {
            return Err(CameraError::Configuration(
                "acquire attempts must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PipelineConfig::from_toml_str("").expect("empty config should parse");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.mode, CaptureMode::Preview);
        assert!(config.secondary.is_none());
        assert_eq!(config.buffers.count, 4);
        assert_eq!(config.acquire.attempts, DEFAULT_ACQUIRE_ATTEMPTS);
        assert_eq!(config.exposure.fifo_depth, 4);
    }

    #[test]
    fn test_full_document() {
        let config = PipelineConfig::from_toml_str(
            r#"
            mode = "still"

            [primary]
            index = 2
            width = 2592
            height = 1944
            fourcc = "BA10"
            raw = true

            [secondary]
            index = 3
            width = 640
            height = 480
            fourcc = "NV12"

            [buffers]
            count = 6
            memory = "userptr"

            [acquire]
            timeout_ms = 250
            attempts = 5

            [exposure]
            gain_lag_frames = 2
            exposure_lag_frames = 5
            fifo_depth = 6
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.mode, CaptureMode::Still);
        let primary = config.primary.format().expect("primary format");
        assert_eq!(primary.fourcc, FourCC::SGRBG10);
        assert!(primary.raw);
        assert_eq!(config.secondary.map(|s| s.index), Some(3));
        assert_eq!(config.buffers.memory, MemoryMode::UserPtr);
        assert_eq!(config.acquire.timeout(), Duration::from_millis(250));
        assert_eq!(config.exposure.exposure_lag_frames, 5);
        assert!(config.exposure.synchronize_to_frames);
    }

    #[test]
    fn test_rejects_semantic_errors() {
        for text in [
            "[buffers]\ncount = 0",
            "[acquire]\nattempts = 0",
            "[acquire]\ntimeout_ms = 0",
            "[primary]\nfourcc = \"TOOLONG\"",
            "[primary]\nraw = true",
            "[secondary]\nindex = 0",
            "[primary]\nwidth = 70000\nheight = 70000",
            "[acquire]\ntimeout_ms = 3000000000",
        ] {
            assert!(
                matches!(
                    PipelineConfig::from_toml_str(text),
                    Err(CameraError::Configuration(_))
                ),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(PipelineConfig::from_toml_str("frames = 3").is_err());
    }
}
