//! Capture device state machine.
//!
//! ```text
//! Closed -> Opened -> Configured -> Streaming
//!                        ^              |
//!                        |            Error   (acquire exhausted its retries)
//!                        +--- stop() ---+
//! ```
//!
//! A `Configured` device may own a buffer pool; `start` additionally requires
//! the pool to be activated (every buffer queued once).

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::buffer::{BufferMemory, BufferPool, BufferState, ExternalMemory};
use crate::error::{CameraError, Result};
use crate::traits::{
    CaptureMode, DequeuedBuffer, DeviceCapabilities, DeviceNode, Format, FrameSyncEvent,
    MemoryMode, NodeOpener,
};

/// Default number of dequeue polls inside one `acquire`.
pub const DEFAULT_ACQUIRE_ATTEMPTS: u32 = 3;

/// Lifecycle state of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No node held.
    Closed,
    /// Node open, no format applied yet.
    Opened,
    /// Format applied; pool may exist.
    Configured,
    /// Streaming; `acquire`/`release` are legal.
    Streaming,
    /// Acquisition failed repeatedly; only `stop` is legal.
    Error,
}

/// One device node plus its buffer pool.
pub struct CaptureDevice<N: DeviceNode> {
    index: u32,
    node: Option<N>,
    state: DeviceState,
    mode: CaptureMode,
    format: Option<Format>,
    pool: Option<BufferPool>,
    memory_mode: MemoryMode,
    requested_buffers: u32,
    retained_memory: Vec<ExternalMemory>,
    acquire_attempts: u32,
    frame_sync: bool,
    frame_count: u64,
}

impl<N: DeviceNode> std::fmt::Debug for CaptureDevice<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureDevice")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("format", &self.format)
            .field("frame_count", &self.frame_count)
            .finish_non_exhaustive()
    }
}

impl<N: DeviceNode> CaptureDevice<N> {
    /// Open the node with the given index.
    pub fn open<O>(opener: &O, index: u32) -> Result<Self>
    where
        O: NodeOpener<Node = N>,
    {
        let node = opener.open(index)?;
        info!(device = index, card = %node.capabilities().card, "device opened");
        Ok(Self {
            index,
            node: Some(node),
            state: DeviceState::Opened,
            mode: CaptureMode::default(),
            format: None,
            pool: None,
            memory_mode: MemoryMode::default(),
            requested_buffers: 0,
            retained_memory: Vec::new(),
            acquire_attempts: DEFAULT_ACQUIRE_ATTEMPTS,
            frame_sync: false,
            frame_count: 0,
        })
    }

    /// Device index this was opened with.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Operating mode set by the last `configure`.
    pub const fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Format the driver accepted in the last `configure`.
    pub const fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    /// Current buffer pool, if one exists.
    pub const fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Frames acquired since the device was opened.
    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Whether the node delivers frame-sync events while streaming.
    pub const fn has_frame_sync(&self) -> bool {
        self.frame_sync
    }

    /// Capability query result, `None` once closed.
    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.node.as_ref().map(|node| node.capabilities())
    }

    /// Bound on dequeue polls per `acquire`. Values below 1 are raised to 1.
    pub fn set_acquire_attempts(&mut self, attempts: u32) {
        self.acquire_attempts = attempts.max(1);
    }

    /// Seed caller-owned regions to back the next `MemoryMode::UserPtr` pool.
    pub fn supply_external_memory(&mut self, regions: Vec<ExternalMemory>) {
        self.retained_memory = regions;
    }

    /// Caller-owned regions not currently backing a pool.
    pub fn retained_memory(&self) -> &[ExternalMemory] {
        &self.retained_memory
    }

    /// Apply operating mode and geometry. Only legal while stopped.
    ///
    /// Any existing pool is torn down; caller-owned regions are kept.
    pub fn configure(&mut self, mode: CaptureMode, format: &Format) -> Result<Format> {
        self.require(
            "configure",
            &[DeviceState::Opened, DeviceState::Configured],
        )?;
        format.validate()?;
        self.teardown_pool();

        let node = self.node_mut()?;
        node.set_mode(mode)?;
        let actual = node.set_format(format)?;
        if actual.width != format.width || actual.height != format.height {
            debug!(
                device = self.index,
                requested = %format!("{}x{}", format.width, format.height),
                actual = %format!("{}x{}", actual.width, actual.height),
                "driver adjusted geometry"
            );
        }
        info!(
            device = self.index,
            ?mode,
            width = actual.width,
            height = actual.height,
            fourcc = %actual.fourcc,
            raw = actual.raw,
            "device configured"
        );
        self.mode = mode;
        self.format = Some(actual.clone());
        self.state = DeviceState::Configured;
        Ok(actual)
    }

    /// Request `count` buffers. Returns how many the device granted.
    pub fn create_pool(&mut self, count: u32, memory: MemoryMode) -> Result<u32> {
        self.require("create a pool", &[DeviceState::Configured])?;
        if count == 0 {
            return Err(CameraError::Configuration(
                "buffer count must be positive".to_owned(),
            ));
        }
        self.teardown_pool();
        let format = self
            .format
            .clone()
            .ok_or(CameraError::InvalidState {
                operation: "create a pool",
                state: self.state,
            })?;

        let index = self.index;
        let node = self.node.as_mut().ok_or(CameraError::InvalidState {
            operation: "create a pool",
            state: DeviceState::Closed,
        })?;

        let granted = node.request_buffers(count, memory)?;
        if granted == 0 {
            return Err(CameraError::DeviceIo(format!(
                "device {index} granted no buffers"
            )));
        }
        if granted < count {
            warn!(device = index, requested = count, granted, "device granted fewer buffers");
        }

        let frame_len = format.size as usize;
        let mut available = std::mem::take(&mut self.retained_memory);
        let mut regions = Vec::with_capacity(granted as usize);
        if let Err(err) =
            bind_memory(node, granted, memory, frame_len, &mut available, &mut regions)
        {
            if let Err(release) = node.release_buffers() {
                warn!(device = index, err = %release, "releasing buffers failed");
            }
            let mut kept: Vec<ExternalMemory> = regions
                .into_iter()
                .filter_map(|region| match region {
                    BufferMemory::External(memory) => Some(memory),
                    BufferMemory::Mapped { .. } => None,
                })
                .collect();
            kept.append(&mut available);
            self.retained_memory = kept;
            return Err(err);
        }
        self.retained_memory = available;

        self.pool = Some(BufferPool::new(format, regions)?);
        self.memory_mode = memory;
        self.requested_buffers = count;
        info!(device = index, granted, ?memory, "buffer pool created");
        Ok(granted)
    }

    /// Submit every pool buffer to the device.
    pub fn activate(&mut self) -> Result<()> {
        self.require("activate", &[DeviceState::Configured])?;
        let index = self.index;
        let node = self.node.as_mut().ok_or(CameraError::InvalidState {
            operation: "activate",
            state: DeviceState::Closed,
        })?;
        let pool = self.pool.as_mut().ok_or(CameraError::InvalidState {
            operation: "activate without a pool",
            state: DeviceState::Configured,
        })?;
        let free: Vec<u32> = pool
            .iter()
            .filter(|b| b.state() == BufferState::Free)
            .map(crate::buffer::FrameBuffer::index)
            .collect();
        for slot in free {
            node.queue(slot)?;
            pool.mark_queued(slot)?;
        }
        pool.set_activated();
        debug!(device = index, buffers = pool.capacity(), "pool activated");
        Ok(())
    }

    /// Begin streaming. Requires an activated pool.
    pub fn start(&mut self) -> Result<()> {
        self.require("start", &[DeviceState::Configured])?;
        if !self.pool.as_ref().is_some_and(BufferPool::is_activated) {
            return Err(CameraError::InvalidState {
                operation: "start before activate",
                state: self.state,
            });
        }
        let index = self.index;
        let node = self.node_mut()?;
        let frame_sync = node.subscribe_frame_sync()?;
        node.stream_on()?;
        self.frame_sync = frame_sync;
        self.state = DeviceState::Streaming;
        info!(device = index, frame_sync, "streaming started");
        Ok(())
    }

    /// Block until one buffer is filled, retrying single-poll timeouts.
    ///
    /// Exhausting the retry bound moves the device to `Error`.
    pub fn acquire(&mut self, timeout: Duration) -> Result<DequeuedBuffer> {
        self.require("acquire", &[DeviceState::Streaming])?;
        let index = self.index;
        let attempts = self.acquire_attempts;
        for attempt in 1..=attempts {
            let node = self.node_mut()?;
            match node.dequeue(timeout) {
                Ok(frame) => {
                    let pool = self.pool.as_mut().ok_or(CameraError::InvalidState {
                        operation: "acquire without a pool",
                        state: DeviceState::Streaming,
                    })?;
                    pool.mark_filled(&frame)?;
                    self.frame_count += 1;
                    return Ok(frame);
                }
                Err(err) if err.is_timeout() => {
                    warn!(device = index, attempt, attempts, "dequeue timed out");
                }
                Err(err) => return Err(err),
            }
        }
        self.state = DeviceState::Error;
        Err(CameraError::AcquisitionTimeout { attempts })
    }

    /// Requeue a filled buffer. Exactly once per successful `acquire`.
    pub fn release(&mut self, buffer: u32) -> Result<()> {
        self.require("release", &[DeviceState::Streaming])?;
        let filled = self
            .pool
            .as_ref()
            .and_then(|p| p.get(buffer))
            .is_some_and(|b| b.state() == BufferState::Filled);
        if !filled {
            return Err(CameraError::InvalidBuffer {
                index: buffer,
                reason: "not filled",
            });
        }
        self.node_mut()?.queue(buffer)?;
        if let Some(pool) = self.pool.as_mut() {
            pool.mark_queued(buffer)?;
        }
        Ok(())
    }

    /// Next frame-sync event, if the node has one ready within `timeout`.
    pub fn poll_frame_sync(&mut self, timeout: Duration) -> Result<Option<FrameSyncEvent>> {
        if !self.frame_sync || self.state != DeviceState::Streaming {
            return Ok(None);
        }
        self.node_mut()?.dequeue_event(timeout)
    }

    /// Run `f` over the bytes of a filled buffer.
    pub fn with_buffer_data<R, F>(&self, buffer: u32, f: F) -> Option<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let frame = self.pool.as_ref()?.get(buffer)?;
        if frame.state() != BufferState::Filled {
            return None;
        }
        let used = frame.bytes_used() as usize;
        match frame.memory() {
            BufferMemory::External(memory) => {
                let data = memory.read();
                Some(f(data.get(..used).unwrap_or(&data)))
            }
            BufferMemory::Mapped { .. } => {
                let data = self.node.as_ref()?.mapped_data(buffer)?;
                Some(f(data.get(..used).unwrap_or(data)))
            }
        }
    }

    /// Stop streaming and tear down the pool. Idempotent.
    pub fn stop(&mut self) {
        match self.state {
            DeviceState::Closed | DeviceState::Opened => return,
            DeviceState::Streaming | DeviceState::Error => {
                if let Some(node) = self.node.as_mut() {
                    if let Err(err) = node.stream_off() {
                        warn!(device = self.index, %err, "stream off failed");
                    }
                }
                info!(device = self.index, frames = self.frame_count, "streaming stopped");
            }
            DeviceState::Configured => {}
        }
        self.frame_sync = false;
        self.teardown_pool();
        self.state = DeviceState::Configured;
    }

    /// Stop, reconfigure with the last geometry, recreate and reactivate
    /// the pool, and restart streaming.
    pub fn restart(&mut self) -> Result<()> {
        let format = self.format.clone().ok_or(CameraError::InvalidState {
            operation: "restart before configure",
            state: self.state,
        })?;
        let count = self.requested_buffers;
        let memory = self.memory_mode;
        self.stop();
        self.configure(self.mode, &format)?;
        self.create_pool(count, memory)?;
        self.activate()?;
        self.start()
    }

    /// Release the node. Idempotent.
    pub fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }
        self.stop();
        self.node = None;
        self.format = None;
        self.state = DeviceState::Closed;
        info!(device = self.index, "device closed");
    }

    /// Force the `Error` state after a fatal protocol violation.
    pub(crate) fn fail(&mut self) {
        if self.state == DeviceState::Streaming {
            self.state = DeviceState::Error;
        }
    }

    fn teardown_pool(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        if let Some(node) = self.node.as_mut() {
            if let Err(err) = node.release_buffers() {
                warn!(device = self.index, %err, "releasing buffers failed");
            }
        }
        let mut kept = pool.into_external_memory();
        kept.append(&mut self.retained_memory);
        self.retained_memory = kept;
        debug!(device = self.index, "buffer pool torn down");
    }

    fn require(&self, operation: &'static str, allowed: &[DeviceState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CameraError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn node_mut(&mut self) -> Result<&mut N> {
        self.node.as_mut().ok_or(CameraError::InvalidState {
            operation: "use a closed device",
            state: DeviceState::Closed,
        })
    }
}

/// Back each granted slot with memory. Regions handed out are pushed to
/// `regions` before registration, so the caller can reclaim them on error.
fn bind_memory<N: DeviceNode>(
    node: &mut N,
    granted: u32,
    memory: MemoryMode,
    frame_len: usize,
    available: &mut Vec<ExternalMemory>,
    regions: &mut Vec<BufferMemory>,
) -> Result<()> {
    for slot in 0..granted {
        match memory {
            MemoryMode::Mmap => {
                let desc = node.query_buffer(slot)?;
                regions.push(BufferMemory::Mapped {
                    offset: desc.offset,
                    length: desc.length,
                });
            }
            MemoryMode::UserPtr => {
                let region = available
                    .iter()
                    .position(|m| m.len() >= frame_len)
                    .map_or_else(|| ExternalMemory::new(frame_len), |pos| available.remove(pos));
                regions.push(BufferMemory::External(region.clone()));
                node.register_user_buffer(slot, &region)?;
            }
        }
    }
    Ok(())
}

/// A frame acquired from both devices of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedFrame {
    /// Buffer from the primary device.
    pub primary: DequeuedBuffer,
    /// Buffer from the secondary device; same index as `primary`.
    pub secondary: DequeuedBuffer,
}

/// Two devices driven in lockstep whose buffers correspond by index.
#[derive(Debug)]
pub struct DevicePair<N: DeviceNode> {
    primary: CaptureDevice<N>,
    secondary: CaptureDevice<N>,
    resync: bool,
}

impl<N: DeviceNode> DevicePair<N> {
    /// Open both nodes. The primary is closed again if the secondary fails.
    pub fn open<O>(opener: &O, primary: u32, secondary: u32) -> Result<Self>
    where
        O: NodeOpener<Node = N>,
    {
        let mut first = CaptureDevice::open(opener, primary)?;
        match CaptureDevice::open(opener, secondary) {
            Ok(second) => Ok(Self {
                primary: first,
                secondary: second,
                resync: false,
            }),
            Err(err) => {
                first.close();
                Err(err)
            }
        }
    }

    /// Primary device.
    pub const fn primary(&self) -> &CaptureDevice<N> {
        &self.primary
    }

    /// Secondary device.
    pub const fn secondary(&self) -> &CaptureDevice<N> {
        &self.secondary
    }

    /// Whether a half-completed acquire left the devices out of step.
    ///
    /// The next `acquire` restarts both devices before dequeuing.
    pub const fn needs_resync(&self) -> bool {
        self.resync
    }

    /// Apply the retry bound to both devices.
    pub fn set_acquire_attempts(&mut self, attempts: u32) {
        self.primary.set_acquire_attempts(attempts);
        self.secondary.set_acquire_attempts(attempts);
    }

    /// Configure both devices in the same mode.
    pub fn configure(
        &mut self,
        mode: CaptureMode,
        primary: &Format,
        secondary: &Format,
    ) -> Result<(Format, Format)> {
        let first = self.primary.configure(mode, primary)?;
        let second = self.secondary.configure(mode, secondary)?;
        Ok((first, second))
    }

    /// Create both pools. Grants must agree so indices line up.
    pub fn create_pool(&mut self, count: u32, memory: MemoryMode) -> Result<u32> {
        let first = self.primary.create_pool(count, memory)?;
        let second = self.secondary.create_pool(count, memory)?;
        if first != second {
            return Err(CameraError::Configuration(format!(
                "paired devices granted {first} and {second} buffers"
            )));
        }
        Ok(first)
    }

    /// Activate both pools.
    pub fn activate(&mut self) -> Result<()> {
        self.primary.activate()?;
        self.secondary.activate()
    }

    /// Start both devices.
    pub fn start(&mut self) -> Result<()> {
        self.primary.start()?;
        self.secondary.start()
    }

    /// Acquire from both devices; the indices must match.
    ///
    /// If the secondary fails after the primary delivered, the primary buffer
    /// is requeued and the pair is flagged for a restart.
    pub fn acquire(&mut self, timeout: Duration) -> Result<PairedFrame> {
        if self.resync {
            info!(
                primary = self.primary.index(),
                secondary = self.secondary.index(),
                "restarting pair to realign buffers"
            );
            self.restart()?;
        }
        let primary = self.primary.acquire(timeout)?;
        let secondary = match self.secondary.acquire(timeout) {
            Ok(secondary) => secondary,
            Err(err) => {
                warn!(%err, primary = primary.index, "secondary acquire failed; pair out of step");
                if let Err(release) = self.primary.release(primary.index) {
                    warn!(err = %release, "requeueing primary buffer failed");
                }
                self.resync = true;
                return Err(err);
            }
        };
        if primary.index != secondary.index {
            error!(
                primary = primary.index,
                secondary = secondary.index,
                "paired buffer index mismatch"
            );
            self.primary.fail();
            self.secondary.fail();
            return Err(CameraError::PairMismatch {
                primary: primary.index,
                secondary: secondary.index,
            });
        }
        Ok(PairedFrame { primary, secondary })
    }

    /// Requeue the buffer with `index` on both devices.
    pub fn release(&mut self, index: u32) -> Result<()> {
        self.primary.release(index)?;
        self.secondary.release(index)
    }

    /// Restart both devices with their last configuration.
    pub fn restart(&mut self) -> Result<()> {
        self.primary.stop();
        self.secondary.stop();
        self.primary.restart()?;
        self.secondary.restart()?;
        self.resync = false;
        Ok(())
    }

    /// Next frame-sync event from the primary device.
    pub fn poll_frame_sync(&mut self, timeout: Duration) -> Result<Option<FrameSyncEvent>> {
        self.primary.poll_frame_sync(timeout)
    }

    /// Stop both devices.
    pub fn stop(&mut self) {
        self.primary.stop();
        self.secondary.stop();
        self.resync = false;
    }

    /// Close both devices.
    pub fn close(&mut self) {
        self.primary.close();
        self.secondary.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBus, MockCall, MockNode, Scripted};
    use crate::traits::FourCC;

    const TIMEOUT: Duration = Duration::from_millis(10);

    fn streaming(bus: &MockBus, memory: MemoryMode) -> CaptureDevice<MockNode> {
        let mut device = CaptureDevice::open(bus, 0).expect("open should succeed");
        device
            .configure(CaptureMode::Preview, &Format::new(64, 48, FourCC::YUYV))
            .expect("configure should succeed");
        device.create_pool(4, memory).expect("create_pool should succeed");
        device.activate().expect("activate should succeed");
        device.start().expect("start should succeed");
        device
    }

    #[test]
    fn test_lifecycle_states() {
        let bus = MockBus::new(1);
        let mut device = CaptureDevice::open(&bus, 0).expect("open should succeed");
        assert_eq!(device.state(), DeviceState::Opened);
        assert!(device.start().is_err());

        device
            .configure(CaptureMode::Still, &Format::new(64, 48, FourCC::NV12))
            .expect("configure should succeed");
        assert_eq!(device.state(), DeviceState::Configured);
        assert!(device.start().is_err(), "start needs an activated pool");

        device
            .create_pool(3, MemoryMode::Mmap)
            .expect("create_pool should succeed");
        assert!(device.start().is_err(), "start needs activation");
        device.activate().expect("activate should succeed");
        device.start().expect("start should succeed");
        assert_eq!(device.state(), DeviceState::Streaming);
        assert!(device
            .configure(CaptureMode::Still, &Format::new(64, 48, FourCC::NV12))
            .is_err());

        device.stop();
        assert_eq!(device.state(), DeviceState::Configured);
        assert!(device.pool().is_none());
        device.stop();
        device.close();
        device.close();
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_open_missing_and_busy() {
        let bus = MockBus::new(1);
        assert!(matches!(
            CaptureDevice::open(&bus, 5),
            Err(CameraError::DeviceNotFound(5))
        ));
        let _held = CaptureDevice::open(&bus, 0).expect("open should succeed");
        assert!(matches!(
            CaptureDevice::open(&bus, 0),
            Err(CameraError::DeviceBusy(0))
        ));
    }

    #[test]
    fn test_configure_rejects_bad_geometry() {
        let bus = MockBus::new(1);
        let mut device = CaptureDevice::open(&bus, 0).expect("open should succeed");
        let result = device.configure(CaptureMode::Preview, &Format::new(0, 48, FourCC::YUYV));
        assert!(matches!(result, Err(CameraError::Configuration(_))));
        let result = device.configure(
            CaptureMode::Preview,
            &Format::new(64, 48, FourCC::YUYV).with_raw(true),
        );
        assert!(matches!(result, Err(CameraError::Configuration(_))));
        assert_eq!(device.state(), DeviceState::Opened);
    }

    #[test]
    fn test_pool_invariant_through_cycle() {
        let bus = MockBus::new(1);
        let mut device = streaming(&bus, MemoryMode::Mmap);
        let capacity = device.pool().expect("pool exists").capacity();

        let mut held = Vec::new();
        for _ in 0..3 {
            let frame = device.acquire(TIMEOUT).expect("acquire should succeed");
            held.push(frame.index);
            let pool = device.pool().expect("pool exists");
            assert!(pool.invariant_holds());
            assert_eq!(
                pool.count(BufferState::Queued) + pool.count(BufferState::Filled),
                capacity
            );
        }
        for index in held {
            device.release(index).expect("release should succeed");
        }
        let pool = device.pool().expect("pool exists");
        assert_eq!(pool.count(BufferState::Queued), capacity);
        assert_eq!(device.frame_count(), 3);
    }

    #[test]
    fn test_release_requires_filled() {
        let bus = MockBus::new(1);
        let mut device = streaming(&bus, MemoryMode::Mmap);
        assert!(device.release(0).is_err());
        let frame = device.acquire(TIMEOUT).expect("acquire should succeed");
        device.release(frame.index).expect("release should succeed");
        assert!(device.release(frame.index).is_err(), "double release");
    }

    #[test]
    fn test_acquire_retries_then_errors() {
        let bus = MockBus::new(1);
        let handle = bus.handle(0).expect("mock exists");
        let mut device = streaming(&bus, MemoryMode::Mmap);

        handle.script([Scripted::Timeout, Scripted::Timeout]);
        let frame = device.acquire(TIMEOUT).expect("third attempt should succeed");
        assert_eq!(frame.index, 0);
        device.release(frame.index).expect("release should succeed");

        handle.script([Scripted::Timeout, Scripted::Timeout, Scripted::Timeout]);
        assert!(matches!(
            device.acquire(TIMEOUT),
            Err(CameraError::AcquisitionTimeout { attempts: 3 })
        ));
        assert_eq!(device.state(), DeviceState::Error);
        assert!(device.acquire(TIMEOUT).is_err());

        device.restart().expect("restart should succeed");
        assert_eq!(device.state(), DeviceState::Streaming);
        assert!(device.acquire(TIMEOUT).is_ok());
    }

    #[test]
    fn test_io_error_not_retried() {
        let bus = MockBus::new(1);
        let handle = bus.handle(0).expect("mock exists");
        let mut device = streaming(&bus, MemoryMode::Mmap);
        handle.script([Scripted::Io("device unplugged".to_owned())]);
        assert!(matches!(
            device.acquire(TIMEOUT),
            Err(CameraError::DeviceIo(_))
        ));
        assert_eq!(device.state(), DeviceState::Streaming);
        let dequeues = handle
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Dequeue))
            .count();
        assert_eq!(dequeues, 1);
    }

    #[test]
    fn test_userptr_memory_preserved_across_restart() {
        let bus = MockBus::new(1);
        let mut device = streaming(&bus, MemoryMode::UserPtr);
        let before: Vec<ExternalMemory> = device
            .pool()
            .expect("pool exists")
            .iter()
            .filter_map(|b| match b.memory() {
                BufferMemory::External(m) => Some(m.clone()),
                BufferMemory::Mapped { .. } => None,
            })
            .collect();
        assert_eq!(before.len(), 4);

        device.restart().expect("restart should succeed");
        let pool = device.pool().expect("pool exists");
        for (buffer, original) in pool.iter().zip(&before) {
            let BufferMemory::External(memory) = buffer.memory() else {
                unreachable!("userptr pool holds external memory");
            };
            assert!(memory.ptr_eq(original));
        }
    }

    #[test]
    fn test_buffer_data_visible_while_filled() {
        let bus = MockBus::new(1);
        let mut device = streaming(&bus, MemoryMode::UserPtr);
        let frame = device.acquire(TIMEOUT).expect("acquire should succeed");
        let first = device
            .with_buffer_data(frame.index, |bytes| bytes.first().copied())
            .flatten();
        assert_eq!(first, Some(frame.sequence.to_le_bytes()[0]));
        device.release(frame.index).expect("release should succeed");
        assert!(device.with_buffer_data(frame.index, <[u8]>::len).is_none());
    }

    #[test]
    fn test_fewer_buffers_granted() {
        let bus = MockBus::new(1);
        bus.handle(0).expect("mock exists").set_max_buffers(2);
        let mut device = CaptureDevice::open(&bus, 0).expect("open should succeed");
        device
            .configure(CaptureMode::Video, &Format::new(64, 48, FourCC::YUYV))
            .expect("configure should succeed");
        let granted = device
            .create_pool(6, MemoryMode::Mmap)
            .expect("create_pool should succeed");
        assert_eq!(granted, 2);
        assert_eq!(device.pool().expect("pool exists").capacity(), 2);
    }

    #[test]
    fn test_pair_lockstep_and_matching_indices() {
        let bus = MockBus::new(2);
        let mut pair = DevicePair::open(&bus, 0, 1).expect("open should succeed");
        let format = Format::new(64, 48, FourCC::YUYV);
        pair.configure(CaptureMode::Still, &format, &format)
            .expect("configure should succeed");
        pair.create_pool(3, MemoryMode::Mmap)
            .expect("create_pool should succeed");
        pair.activate().expect("activate should succeed");
        pair.start().expect("start should succeed");

        let frame = pair.acquire(TIMEOUT).expect("acquire should succeed");
        assert_eq!(frame.primary.index, frame.secondary.index);
        pair.release(frame.primary.index)
            .expect("release should succeed");
        pair.close();
        assert_eq!(pair.primary().state(), DeviceState::Closed);
        assert_eq!(pair.secondary().state(), DeviceState::Closed);
    }

    #[test]
    fn test_pair_mismatch_is_fatal() {
        let bus = MockBus::new(2);
        let mut pair = DevicePair::open(&bus, 0, 1).expect("open should succeed");
        let format = Format::new(64, 48, FourCC::YUYV);
        pair.configure(CaptureMode::Video, &format, &format)
            .expect("configure should succeed");
        pair.create_pool(4, MemoryMode::Mmap)
            .expect("create_pool should succeed");
        pair.activate().expect("activate should succeed");
        pair.start().expect("start should succeed");

        bus.handle(0).expect("mock exists").script([Scripted::Index(2)]);
        bus.handle(1).expect("mock exists").script([Scripted::Index(1)]);
        assert!(matches!(
            pair.acquire(TIMEOUT),
            Err(CameraError::PairMismatch {
                primary: 2,
                secondary: 1
            })
        ));
        assert_eq!(pair.primary().state(), DeviceState::Error);
        assert_eq!(pair.secondary().state(), DeviceState::Error);
    }

    #[test]
    fn test_failed_pool_keeps_supplied_memory() {
        let bus = MockBus::new(1);
        let handle = bus.handle(0).expect("mock exists");
        let mut device = CaptureDevice::open(&bus, 0).expect("open should succeed");
        let format = device
            .configure(CaptureMode::Preview, &Format::new(64, 48, FourCC::YUYV))
            .expect("configure should succeed");

        let small = ExternalMemory::new(16);
        let supplied: Vec<ExternalMemory> = (0..3)
            .map(|_| ExternalMemory::new(format.size as usize))
            .collect();
        let mut regions = vec![small.clone()];
        regions.extend(supplied.iter().cloned());
        device.supply_external_memory(regions);

        handle.set_max_buffers(0);
        assert!(matches!(
            device.create_pool(3, MemoryMode::UserPtr),
            Err(CameraError::DeviceIo(_))
        ));
        assert_eq!(device.retained_memory().len(), 4);

        handle.set_max_buffers(8);
        device
            .create_pool(3, MemoryMode::UserPtr)
            .expect("create_pool should succeed");
        let pool = device.pool().expect("pool exists");
        for (buffer, region) in pool.iter().zip(&supplied) {
            let BufferMemory::External(memory) = buffer.memory() else {
                unreachable!("userptr pool holds external memory");
            };
            assert!(memory.ptr_eq(region));
        }
        let retained = device.retained_memory();
        assert_eq!(retained.len(), 1, "undersized region is kept, not dropped");
        assert!(retained.iter().all(|m| m.ptr_eq(&small)));
    }

    #[test]
    fn test_pair_secondary_error_requeues_primary() {
        let bus = MockBus::new(2);
        let mut pair = DevicePair::open(&bus, 0, 1).expect("open should succeed");
        let format = Format::new(64, 48, FourCC::YUYV);
        pair.configure(CaptureMode::Video, &format, &format)
            .expect("configure should succeed");
        pair.create_pool(4, MemoryMode::Mmap)
            .expect("create_pool should succeed");
        pair.activate().expect("activate should succeed");
        pair.start().expect("start should succeed");

        bus.handle(1)
            .expect("mock exists")
            .script([Scripted::Io("transient".to_owned())]);
        assert!(matches!(
            pair.acquire(TIMEOUT),
            Err(CameraError::DeviceIo(_))
        ));
        let pool = pair.primary().pool().expect("pool exists");
        assert_eq!(pool.count(BufferState::Filled), 0, "primary buffer was requeued");
        assert!(pool.invariant_holds());
        assert!(pair.needs_resync());

        for _ in 0..3 {
            let frame = pair.acquire(TIMEOUT).expect("acquire should succeed");
            assert_eq!(frame.primary.index, frame.secondary.index);
            pair.release(frame.primary.index)
                .expect("release should succeed");
        }
        assert!(!pair.needs_resync());
        assert_eq!(pair.primary().state(), DeviceState::Streaming);
    }

    #[test]
    fn test_pair_open_failure_releases_primary() {
        let bus = MockBus::new(1);
        assert!(DevicePair::open(&bus, 0, 3).is_err());
        assert!(CaptureDevice::open(&bus, 0).is_ok(), "primary was released");
    }
}
