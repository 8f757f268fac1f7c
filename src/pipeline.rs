//! Capture pipeline: one device or a lockstep pair, plus timeout recovery.
//!
//! The pipeline owns its devices and pushes frame-boundary notifications to
//! registered [`FrameSyncListener`]s. Listeners never call back in.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::{CaptureDevice, DevicePair, DeviceState, PairedFrame};
use crate::config::PipelineConfig;
use crate::error::{CameraError, Result};
use crate::exposure::ExposureSyncEngine;
use crate::traits::{DequeuedBuffer, DeviceNode, Format, FrameSyncEvent, MemoryMode, NodeOpener};

/// Receiver of frame-cadence notifications from a running pipeline.
pub trait FrameSyncListener: Send + Sync {
    /// A new frame boundary was observed.
    fn on_frame_advanced(&self, timestamp: Duration);
    /// Streaming started or stopped.
    fn on_streaming_changed(&self, streaming: bool);
    /// The pipeline was torn down and restarted; frame cadence was broken.
    fn on_pipeline_reset(&self);
}

impl FrameSyncListener for ExposureSyncEngine {
    fn on_frame_advanced(&self, timestamp: Duration) {
        if let Err(err) = self.advance_frame(timestamp) {
            error!(%err, "applying exposure on frame boundary failed");
        }
    }

    fn on_streaming_changed(&self, streaming: bool) {
        if let Err(err) = self.set_streaming(streaming) {
            error!(%err, streaming, "switching exposure sync mode failed");
        }
    }

    fn on_pipeline_reset(&self) {
        self.flush_pending();
    }
}

/// The device(s) a pipeline drives.
#[derive(Debug)]
pub enum CaptureStreams<N: DeviceNode> {
    /// One device.
    Single(CaptureDevice<N>),
    /// Two devices whose buffers correspond by index.
    Paired(DevicePair<N>),
}

/// One completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Buffer from the primary device.
    pub primary: DequeuedBuffer,
    /// Matching buffer from the secondary device of a pair.
    pub secondary: Option<DequeuedBuffer>,
}

impl From<PairedFrame> for CapturedFrame {
    fn from(frame: PairedFrame) -> Self {
        Self {
            primary: frame.primary,
            secondary: Some(frame.secondary),
        }
    }
}

impl<N: DeviceNode> CaptureStreams<N> {
    /// Device every frame's primary buffer comes from.
    pub const fn primary(&self) -> &CaptureDevice<N> {
        match self {
            Self::Single(device) => device,
            Self::Paired(pair) => pair.primary(),
        }
    }

    fn ensure_pool(&mut self, count: u32, memory: MemoryMode) -> Result<()> {
        match self {
            Self::Single(device) => {
                if device.pool().is_none() {
                    device.create_pool(count, memory)?;
                }
            }
            Self::Paired(pair) => {
                if pair.primary().pool().is_none() || pair.secondary().pool().is_none() {
                    pair.create_pool(count, memory)?;
                }
            }
        }
        Ok(())
    }

    fn activate_and_start(&mut self) -> Result<()> {
        match self {
            Self::Single(device) => {
                device.activate()?;
                device.start()
            }
            Self::Paired(pair) => {
                pair.activate()?;
                pair.start()
            }
        }
    }

    fn acquire(&mut self, timeout: Duration) -> Result<CapturedFrame> {
        match self {
            Self::Single(device) => device.acquire(timeout).map(|primary| CapturedFrame {
                primary,
                secondary: None,
            }),
            Self::Paired(pair) => pair.acquire(timeout).map(CapturedFrame::from),
        }
    }

    fn release(&mut self, index: u32) -> Result<()> {
        match self {
            Self::Single(device) => device.release(index),
            Self::Paired(pair) => pair.release(index),
        }
    }

    fn restart(&mut self) -> Result<()> {
        match self {
            Self::Single(device) => device.restart(),
            Self::Paired(pair) => pair.restart(),
        }
    }

    const fn needs_resync(&self) -> bool {
        match self {
            Self::Single(_) => false,
            Self::Paired(pair) => pair.needs_resync(),
        }
    }

    fn poll_frame_sync(&mut self) -> Result<Option<FrameSyncEvent>> {
        match self {
            Self::Single(device) => device.poll_frame_sync(Duration::ZERO),
            Self::Paired(pair) => pair.poll_frame_sync(Duration::ZERO),
        }
    }

    fn stop(&mut self) {
        match self {
            Self::Single(device) => device.stop(),
            Self::Paired(pair) => pair.stop(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Single(device) => device.close(),
            Self::Paired(pair) => pair.close(),
        }
    }
}

/// Owns the capture device(s) and keeps them streaming.
pub struct CapturePipeline<N: DeviceNode> {
    streams: CaptureStreams<N>,
    listeners: Vec<Arc<dyn FrameSyncListener>>,
    timeout: Duration,
    buffer_count: u32,
    memory: MemoryMode,
    streaming: bool,
    needs_recovery: bool,
    recoveries: u64,
}

impl<N: DeviceNode> std::fmt::Debug for CapturePipeline<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("streams", &self.streams)
            .field("listeners", &self.listeners.len())
            .field("timeout", &self.timeout)
            .field("streaming", &self.streaming)
            .field("recoveries", &self.recoveries)
            .finish_non_exhaustive()
    }
}

impl<N: DeviceNode> CapturePipeline<N> {
    /// Wrap configured devices. Pools are created on `start` if missing.
    pub const fn new(
        streams: CaptureStreams<N>,
        timeout: Duration,
        buffer_count: u32,
        memory: MemoryMode,
    ) -> Self {
        Self {
            streams,
            listeners: Vec::new(),
            timeout,
            buffer_count,
            memory,
            streaming: false,
            needs_recovery: false,
            recoveries: 0,
        }
    }

    /// Open and configure the device(s) named in `config`.
    pub fn open<O>(opener: &O, config: &PipelineConfig) -> Result<Self>
    where
        O: NodeOpener<Node = N>,
    {
        config.validate()?;
        let primary_format = config.primary.format()?;
        let streams = match &config.secondary {
            None => {
                let mut device = CaptureDevice::open(opener, config.primary.index)?;
                device.set_acquire_attempts(config.acquire.attempts);
                if let Err(err) = device.configure(config.mode, &primary_format) {
                    device.close();
                    return Err(err);
                }
                CaptureStreams::Single(device)
            }
            Some(secondary) => {
                let secondary_format = secondary.format()?;
                let mut pair = DevicePair::open(opener, config.primary.index, secondary.index)?;
                pair.set_acquire_attempts(config.acquire.attempts);
                if let Err(err) = pair.configure(config.mode, &primary_format, &secondary_format) {
                    pair.close();
                    return Err(err);
                }
                CaptureStreams::Paired(pair)
            }
        };
        Ok(Self::new(
            streams,
            config.acquire.timeout(),
            config.buffers.count,
            config.buffers.memory,
        ))
    }

    /// Register a listener for frame-cadence notifications.
    pub fn add_listener(&mut self, listener: Arc<dyn FrameSyncListener>) {
        self.listeners.push(listener);
    }

    /// The device(s) being driven.
    pub const fn streams(&self) -> &CaptureStreams<N> {
        &self.streams
    }

    /// Format of the primary device.
    pub fn format(&self) -> Option<&Format> {
        self.streams.primary().format()
    }

    /// Whether `start` succeeded and `stop` has not been called since.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Completed timeout recoveries.
    pub const fn recoveries(&self) -> u64 {
        self.recoveries
    }

    /// Create pools if needed, queue every buffer, and start streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        let result = self
            .streams
            .ensure_pool(self.buffer_count, self.memory)
            .and_then(|()| self.streams.activate_and_start());
        if let Err(err) = result {
            self.streams.stop();
            return Err(err);
        }
        self.streaming = true;
        self.needs_recovery = false;
        info!(timeout = ?self.timeout, "capture pipeline started");
        for listener in &self.listeners {
            listener.on_streaming_changed(true);
        }
        Ok(())
    }

    /// Wait for the next frame.
    ///
    /// When the device(s) exhaust their retry bound the pipeline restarts
    /// them once and tries again; a second exhaustion is returned and the
    /// next call recovers again. Other errors are returned untouched.
    pub fn acquire(&mut self) -> Result<CapturedFrame> {
        if !self.streaming {
            return Err(CameraError::InvalidState {
                operation: "acquire from a stopped pipeline",
                state: self.streams.primary().state(),
            });
        }
        if self.needs_recovery || self.streams.needs_resync() {
            self.recover()?;
        }
        match self.acquire_once() {
            Err(CameraError::AcquisitionTimeout { attempts }) => {
                warn!(attempts, "acquisition exhausted its retries; recovering");
                self.recover()?;
                let result = self.acquire_once();
                if matches!(result, Err(CameraError::AcquisitionTimeout { .. })) {
                    self.needs_recovery = true;
                }
                result
            }
            other => other,
        }
    }

    fn acquire_once(&mut self) -> Result<CapturedFrame> {
        let frame = self.streams.acquire(self.timeout)?;
        if self.streams.primary().has_frame_sync() {
            loop {
                match self.streams.poll_frame_sync() {
                    Ok(Some(event)) => self.notify_frame(event.timestamp),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, buffer = frame.primary.index, "frame-sync event read failed");
                        if let Err(release) = self.streams.release(frame.primary.index) {
                            warn!(err = %release, "requeueing frame failed");
                        }
                        return Err(err);
                    }
                }
            }
        } else {
            self.notify_frame(frame.primary.timestamp);
        }
        Ok(frame)
    }

    fn notify_frame(&self, timestamp: Duration) {
        for listener in &self.listeners {
            listener.on_frame_advanced(timestamp);
        }
    }

    fn recover(&mut self) -> Result<()> {
        if let Err(err) = self.streams.restart() {
            error!(%err, "pipeline recovery failed");
            self.needs_recovery = true;
            return Err(err);
        }
        self.needs_recovery = false;
        self.recoveries += 1;
        info!(recoveries = self.recoveries, "pipeline recovered");
        for listener in &self.listeners {
            listener.on_pipeline_reset();
        }
        Ok(())
    }

    /// Hand a frame's buffer(s) back to the device(s).
    pub fn release(&mut self, frame: &CapturedFrame) -> Result<()> {
        self.streams.release(frame.primary.index)
    }

    /// Run `f` over the primary buffer of an acquired frame.
    pub fn with_frame_data<R, F>(&self, frame: &CapturedFrame, f: F) -> Option<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.streams
            .primary()
            .with_buffer_data(frame.primary.index, f)
    }

    /// Stop streaming and tear down pools. Idempotent.
    pub fn stop(&mut self) {
        self.streams.stop();
        if self.streaming {
            self.streaming = false;
            info!(recoveries = self.recoveries, "capture pipeline stopped");
            for listener in &self.listeners {
                listener.on_streaming_changed(false);
            }
        }
    }

    /// Stop and release every device. Idempotent.
    pub fn close(&mut self) {
        self.stop();
        self.streams.close();
        debug!(
            closed = self.streams.primary().state() == DeviceState::Closed,
            "capture pipeline closed"
        );
    }
}
