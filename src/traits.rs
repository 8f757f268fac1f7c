//! Core types and the device-node protocol seam.
//!
//! `DeviceNode` mirrors the character-device buffer-exchange protocol one call
//! at a time. The state machine in [`crate::capture`] is written against this
//! trait so it can drive a real V4L2 node or the in-process mock identically.

use std::time::Duration;

use crate::buffer::ExternalMemory;
use crate::error::Result;

/// Pixel format representation (e.g., YUYV, NV12, BA10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// NV12 pixel format (4:2:0 semi-planar).
    pub const NV12: Self = Self::new(b"NV12");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// 10-bit GRBG Bayer, one sample per 16-bit word.
    pub const SGRBG10: Self = Self::new(b"BA10");
    /// 10-bit RGGB Bayer, one sample per 16-bit word.
    pub const SRGGB10: Self = Self::new(b"RG10");
    /// 8-bit GRBG Bayer.
    pub const SGRBG8: Self = Self::new(b"GRBG");

    /// Bits occupied by one pixel in memory.
    pub const fn bits_per_pixel(self) -> u32 {
        match &self.0 {
            b"NV12" => 12,
            b"RGB3" => 24,
            b"GREY" | b"GRBG" | b"RGGB" => 8,
            _ => 16,
        }
    }

    /// Whether this is an unprocessed sensor (Bayer) format.
    pub const fn is_bayer(self) -> bool {
        matches!(
            &self.0,
            b"BA10" | b"RG10" | b"GB10" | b"BG10" | b"GRBG" | b"RGGB"
        )
    }

    /// Whether the luma plane is stored separately from chroma.
    const fn is_planar(self) -> bool {
        matches!(&self.0, b"NV12")
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl std::str::FromStr for FourCC {
    type Err = crate::error::CameraError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 4] = s.as_bytes().try_into().map_err(|_| {
            crate::error::CameraError::Configuration(format!("fourcc must be 4 bytes: {s:?}"))
        })?;
        Ok(Self(bytes))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Negotiated capture geometry and pixel format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Raw sensor output rather than ISP-processed output.
    pub raw: bool,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a processed (non-raw) format with stride and size derived from the fourcc.
    ///
    /// Geometry whose frame size does not fit in `u32` saturates here and is
    /// rejected by [`Format::validate`].
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let bpp = fourcc.bits_per_pixel();
        let stride = if fourcc.is_planar() {
            width
        } else {
            width.saturating_mul(bpp) / 8
        };
        let size = width.saturating_mul(height).saturating_mul(bpp) / 8;
        Self {
            width,
            height,
            fourcc,
            raw: false,
            stride,
            size,
        }
    }

    /// Mark this format as raw sensor output.
    #[must_use]
    pub const fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Reject geometry no device could honor.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(crate::error::CameraError::Configuration(format!(
                "empty geometry {}x{}",
                self.width, self.height
            )));
        }
        let bits = self
            .width
            .checked_mul(self.height)
            .and_then(|pixels| pixels.checked_mul(self.fourcc.bits_per_pixel()));
        if bits.is_none() {
            return Err(crate::error::CameraError::Configuration(format!(
                "{}x{} {} frame size overflows",
                self.width, self.height, self.fourcc
            )));
        }
        if self.raw && !self.fourcc.is_bayer() {
            return Err(crate::error::CameraError::Configuration(format!(
                "raw capture requires a Bayer format, got {}",
                self.fourcc
            )));
        }
        Ok(())
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Operating mode a device (and its pipeline) is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Continuous low-latency viewfinder stream.
    #[default]
    Preview,
    /// Full-resolution still capture, typically paired with a postview.
    Still,
    /// Recording stream, typically paired with a live preview.
    Video,
}

/// Who owns the memory behind each buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// Kernel-owned memory mapped into the process.
    #[default]
    Mmap,
    /// Process-allocated memory registered with the device.
    UserPtr,
}

/// Per-frame status reported alongside a dequeued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    /// Ordinary exposure.
    #[default]
    Ordinary,
    /// Frame was exposed with the flash fired.
    FlashExposed,
    /// Flash was requested for this frame but did not fire.
    FlashFailed,
}

/// Result of the describe call for a driver-mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Buffer index within the device's allocation.
    pub index: u32,
    /// Offset to map the buffer from.
    pub offset: u32,
    /// Buffer length in bytes.
    pub length: usize,
}

/// A filled buffer handed back by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Index of the filled buffer.
    pub index: u32,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Bytes actually written.
    pub bytes_used: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Flash status for this frame.
    pub status: FrameStatus,
}

/// Asynchronous "new frame boundary" notification from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSyncEvent {
    /// Frame sequence the event refers to.
    pub sequence: u32,
    /// Time the frame boundary was observed.
    pub timestamp: Duration,
}

/// One capture device node speaking the buffer-exchange protocol.
///
/// Every method maps to exactly one protocol call; sequencing rules live in
/// [`crate::capture::CaptureDevice`], not here.
pub trait DeviceNode: Send + std::fmt::Debug {
    /// Capability query result, captured when the node was opened.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Select preview / still / video operation.
    fn set_mode(&mut self, mode: CaptureMode) -> Result<()>;

    /// Negotiate format. Returns what the driver actually applied.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Request `count` buffers. Returns the number actually granted.
    fn request_buffers(&mut self, count: u32, memory: MemoryMode) -> Result<u32>;

    /// Describe a driver-mapped buffer.
    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor>;

    /// Register caller-owned memory as the backing store for `index`.
    fn register_user_buffer(&mut self, index: u32, memory: &ExternalMemory) -> Result<()>;

    /// Submit one buffer to the device.
    fn queue(&mut self, index: u32) -> Result<()>;

    /// Wait up to `timeout` for a filled buffer. Expiry is `CameraError::Timeout`.
    fn dequeue(&mut self, timeout: Duration) -> Result<DequeuedBuffer>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming. Outstanding buffers are returned to the driver.
    fn stream_off(&mut self) -> Result<()>;

    /// Free every buffer granted by `request_buffers`.
    fn release_buffers(&mut self) -> Result<()>;

    /// Subscribe to frame-sync events. `Ok(false)` if the node has none.
    fn subscribe_frame_sync(&mut self) -> Result<bool>;

    /// Wait up to `timeout` for the next frame-sync event.
    fn dequeue_event(&mut self, timeout: Duration) -> Result<Option<FrameSyncEvent>>;

    /// Read access to a driver-mapped buffer, where the backend exposes it.
    fn mapped_data(&self, index: u32) -> Option<&[u8]>;
}

/// Opens device nodes by index.
pub trait NodeOpener {
    /// Node type produced by this opener.
    type Node: DeviceNode;

    /// Open the node with the given index (e.g. 0 for /dev/video0).
    fn open(&self, index: u32) -> Result<Self::Node>;
}
