//! V4L2 device node implementation using the v4l crate.
//!
//! Buffers are driver-mapped through `v4l`'s mmap arena, which owns the
//! mappings; externally supplied memory and frame-sync events are not
//! available through this backend.

use std::io;
use std::time::{Duration, Instant};

use tracing::debug;
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::video::Capture;
use v4l::Device;

use crate::buffer::ExternalMemory;
use crate::error::{CameraError, Result};
use crate::traits::{
    BufferDescriptor, CaptureMode, DequeuedBuffer, DeviceCapabilities, DeviceNode, Format,
    FourCC, FrameStatus, FrameSyncEvent, MemoryMode, NodeOpener,
};

const EBUSY: i32 = 16;

// `Stream::set_timeout` panics on poll timeouts beyond `i32::MAX` ms.
const MAX_POLL: Duration = Duration::from_millis(0x7fff_ffff);

/// Opens `/dev/videoN` nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4L2Opener;

impl NodeOpener for V4L2Opener {
    type Node = V4L2Node;

    fn open(&self, index: u32) -> Result<V4L2Node> {
        V4L2Node::open(index)
    }
}

/// V4L2 capture node wrapping the v4l crate.
pub struct V4L2Node {
    index: u32,
    device: Device,
    capabilities: DeviceCapabilities,
    format: Option<Format>,
    stream: Option<MmapStream<'static>>,
    buffer_count: u32,
    sequence: u32,
    opened_at: Instant,
}

impl std::fmt::Debug for V4L2Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4L2Node")
            .field("index", &self.index)
            .field("capabilities", &self.capabilities)
            .field("format", &self.format)
            .field("buffer_count", &self.buffer_count)
            .finish_non_exhaustive()
    }
}

impl V4L2Node {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open(index: u32) -> Result<Self> {
        let device = Device::new(index as usize).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(index),
            _ if err.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy(index),
            _ => CameraError::DeviceIo(format!("open /dev/video{index}: {err}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| protocol_error("VIDIOC_QUERYCAP", &err))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(CameraError::Unsupported(format!(
                "/dev/video{index} is not a streaming capture device"
            )));
        }

        Ok(Self {
            index,
            device,
            capabilities,
            format: None,
            stream: None,
            buffer_count: 0,
            sequence: 0,
            opened_at: Instant::now(),
        })
    }

    fn stream_mut(&mut self, call: &str) -> Result<&mut MmapStream<'static>> {
        self.stream
            .as_mut()
            .ok_or_else(|| CameraError::DeviceIo(format!("{call}: no buffers requested")))
    }
}

fn protocol_error(call: &str, err: &io::Error) -> CameraError {
    if err.kind() == io::ErrorKind::TimedOut {
        CameraError::Timeout
    } else {
        CameraError::DeviceIo(format!("{call}: {err}"))
    }
}

impl DeviceNode for V4L2Node {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_mode(&mut self, mode: CaptureMode) -> Result<()> {
        // Plain V4L2 capture nodes have no ISP run-mode selector.
        debug!(device = self.index, ?mode, "mode is implied by the node");
        Ok(())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| protocol_error("VIDIOC_G_FMT", &err))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::Configuration(format!("VIDIOC_S_FMT: {err}")))?;

        if FourCC::from(fmt.fourcc) != format.fourcc {
            return Err(CameraError::Configuration(format!(
                "driver substituted {} for {}",
                FourCC::from(fmt.fourcc),
                format.fourcc
            )));
        }

        let actual = Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            raw: format.raw,
            stride: fmt.stride,
            size: fmt.size,
        };
        self.format = Some(actual.clone());
        Ok(actual)
    }

    fn request_buffers(&mut self, count: u32, memory: MemoryMode) -> Result<u32> {
        if memory == MemoryMode::UserPtr {
            return Err(CameraError::Unsupported(
                "externally supplied memory on V4L2 nodes".to_owned(),
            ));
        }
        self.stream = None;
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, count)
            .map_err(|err| protocol_error("VIDIOC_REQBUFS", &err))?;
        self.stream = Some(stream);
        // v4l 0.14 keeps the driver's granted count inside the arena, so the
        // requested count is reported. A driver that grants fewer buffers
        // surfaces as a VIDIOC_QBUF error during activation.
        self.buffer_count = count;
        Ok(count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor> {
        if index >= self.buffer_count {
            return Err(CameraError::DeviceIo(format!(
                "VIDIOC_QUERYBUF: no buffer {index}"
            )));
        }
        let length = self.format.as_ref().map_or(0, |f| f.size as usize);
        // The v4l arena performs the mapping itself and does not expose offsets.
        Ok(BufferDescriptor {
            index,
            offset: 0,
            length,
        })
    }

    fn register_user_buffer(&mut self, _index: u32, _memory: &ExternalMemory) -> Result<()> {
        Err(CameraError::Unsupported(
            "externally supplied memory on V4L2 nodes".to_owned(),
        ))
    }

    fn queue(&mut self, index: u32) -> Result<()> {
        self.stream_mut("VIDIOC_QBUF")?
            .queue(index as usize)
            .map_err(|err| protocol_error("VIDIOC_QBUF", &err))
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<DequeuedBuffer> {
        let stream = self.stream_mut("VIDIOC_DQBUF")?;
        stream.set_timeout(timeout.min(MAX_POLL));
        let index = stream
            .dequeue()
            .map_err(|err| protocol_error("VIDIOC_DQBUF", &err))?;
        let index = u32::try_from(index)
            .map_err(|_| CameraError::DeviceIo(format!("VIDIOC_DQBUF: index {index}")))?;
        // The arena's per-buffer metadata is private in v4l 0.14, so the
        // driver sequence and timestamp are unavailable: sequence counts
        // dequeues on this node and the timestamp is taken at dequeue.
        self.sequence = self.sequence.wrapping_add(1);
        Ok(DequeuedBuffer {
            index,
            sequence: self.sequence,
            bytes_used: self.format.as_ref().map_or(0, |f| f.size),
            timestamp: self.opened_at.elapsed(),
            status: FrameStatus::Ordinary,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        self.stream_mut("VIDIOC_STREAMON")?
            .start()
            .map_err(|err| protocol_error("VIDIOC_STREAMON", &err))
    }

    fn stream_off(&mut self) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream
                .stop()
                .map_err(|err| protocol_error("VIDIOC_STREAMOFF", &err)),
            None => Ok(()),
        }
    }

    fn release_buffers(&mut self) -> Result<()> {
        // Dropping the stream unmaps the arena and frees the driver buffers.
        self.stream = None;
        self.buffer_count = 0;
        Ok(())
    }

    fn subscribe_frame_sync(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn dequeue_event(&mut self, _timeout: Duration) -> Result<Option<FrameSyncEvent>> {
        Ok(None)
    }

    fn mapped_data(&self, _index: u32) -> Option<&[u8]> {
        None
    }
}
