//! Mock device nodes for running the capture stack without hardware.
//!
//! A [`MockBus`] owns a set of virtual nodes. Each node has a shared
//! [`MockHandle`] that tests keep after the node itself has moved into a
//! `CaptureDevice`, to script dequeue outcomes and inspect the protocol calls
//! the state machine made. [`RecordingSensor`] stands in for sensor hardware
//! on the exposure side.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::aaa::{MeteringWindow, SensorControls, WhiteBalanceGains};
use crate::buffer::ExternalMemory;
use crate::error::{CameraError, Result};
use crate::exposure::{ExposureRequest, ExposureSink};
use crate::traits::{
    BufferDescriptor, CaptureMode, DequeuedBuffer, DeviceCapabilities, DeviceNode, Format,
    FourCC, FrameStatus, FrameSyncEvent, MemoryMode, NodeOpener,
};

const MAX_WIDTH: u32 = 4096;
const MAX_HEIGHT: u32 = 3072;
const DEFAULT_MAX_BUFFERS: u32 = 8;
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

const SUPPORTED_FORMATS: [FourCC; 8] = [
    FourCC::YUYV,
    FourCC::UYVY,
    FourCC::NV12,
    FourCC::RGB3,
    FourCC::GREY,
    FourCC::SGRBG10,
    FourCC::SRGGB10,
    FourCC::SGRBG8,
];

/// Scripted outcome for the next dequeue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// The poll expires.
    Timeout,
    /// The dequeue fails with a device error.
    Io(String),
    /// Return this specific queued buffer.
    Index(u32),
    /// Return the next buffer with the given flash status.
    Status(FrameStatus),
}

/// Protocol call recorded by a mock node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `set_mode`.
    SetMode(CaptureMode),
    /// `set_format`.
    SetFormat(u32, u32),
    /// `request_buffers` with the requested count.
    RequestBuffers(u32),
    /// `register_user_buffer`.
    RegisterUserBuffer(u32),
    /// `queue`.
    Queue(u32),
    /// `dequeue`.
    Dequeue,
    /// `stream_on`.
    StreamOn,
    /// `stream_off`.
    StreamOff,
    /// `release_buffers`.
    ReleaseBuffers,
    /// `subscribe_frame_sync`.
    SubscribeFrameSync,
}

#[derive(Debug)]
struct Shared {
    held: bool,
    max_buffers: u32,
    frame_sync: bool,
    userptr: bool,
    event_error: Option<String>,
    script: VecDeque<Scripted>,
    calls: Vec<MockCall>,
}

/// Test-side handle to one mock node.
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                held: false,
                max_buffers: DEFAULT_MAX_BUFFERS,
                frame_sync: false,
                userptr: true,
                event_error: None,
                script: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append dequeue outcomes, consumed one per dequeue call.
    pub fn script<I: IntoIterator<Item = Scripted>>(&self, outcomes: I) {
        self.lock().script.extend(outcomes);
    }

    /// Cap the number of buffers `request_buffers` grants.
    pub fn set_max_buffers(&self, max: u32) {
        self.lock().max_buffers = max;
    }

    /// Whether the node emits frame-sync events.
    pub fn set_frame_sync(&self, enabled: bool) {
        self.lock().frame_sync = enabled;
    }

    /// Whether the node accepts externally supplied memory.
    pub fn set_userptr(&self, enabled: bool) {
        self.lock().userptr = enabled;
    }

    /// Fail the next frame-sync event read with a device error.
    pub fn fail_next_event(&self, message: &str) {
        self.lock().event_error = Some(message.to_owned());
    }

    /// Protocol calls made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of recorded calls equal to `call`.
    pub fn count(&self, call: &MockCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }
}

/// A set of mock nodes addressable by index.
#[derive(Debug, Clone)]
pub struct MockBus {
    nodes: Vec<MockHandle>,
}

impl MockBus {
    /// Create a bus with `count` nodes, indices `0..count`.
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            nodes: (0..count).map(|_| MockHandle::new()).collect(),
        }
    }

    /// Handle for the node with the given index.
    pub fn handle(&self, index: u32) -> Option<MockHandle> {
        self.nodes.get(index as usize).cloned()
    }
}

impl NodeOpener for MockBus {
    type Node = MockNode;

    fn open(&self, index: u32) -> Result<MockNode> {
        let handle = self.handle(index).ok_or(CameraError::DeviceNotFound(index))?;
        {
            let mut shared = handle.lock();
            if shared.held {
                return Err(CameraError::DeviceBusy(index));
            }
            shared.held = true;
        }
        Ok(MockNode::new(index, handle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Queued,
    Done,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    mapped: Vec<u8>,
    user: Option<ExternalMemory>,
}

/// Mock device node.
#[derive(Debug)]
pub struct MockNode {
    index: u32,
    handle: MockHandle,
    capabilities: DeviceCapabilities,
    format: Format,
    memory: MemoryMode,
    slots: Vec<Slot>,
    fifo: VecDeque<u32>,
    streaming: bool,
    subscribed: bool,
    events: VecDeque<FrameSyncEvent>,
    sequence: u32,
}

impl MockNode {
    fn new(index: u32, handle: MockHandle) -> Self {
        Self {
            index,
            handle,
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: format!("Mock ISP {index}"),
                bus_info: format!("mock:{index}"),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            memory: MemoryMode::Mmap,
            slots: Vec::new(),
            fifo: VecDeque::new(),
            streaming: false,
            subscribed: false,
            events: VecDeque::new(),
            sequence: 0,
        }
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut Slot> {
        self.slots
            .get_mut(index as usize)
            .ok_or_else(|| CameraError::DeviceIo(format!("no buffer {index}")))
    }

    fn fill(&mut self, index: u32, status: FrameStatus) -> Result<DequeuedBuffer> {
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;
        let stamp = u8::try_from(sequence % 256).unwrap_or_default();
        let size = self.format.size as usize;
        let slot = self.slot_mut(index)?;
        slot.state = SlotState::Done;
        let written = match &slot.user {
            Some(memory) => {
                let mut data = memory.write();
                let len = size.min(data.len());
                data.iter_mut().take(len).for_each(|b| *b = stamp);
                len
            }
            None => {
                let len = size.min(slot.mapped.len());
                slot.mapped.iter_mut().take(len).for_each(|b| *b = stamp);
                len
            }
        };
        let timestamp = FRAME_INTERVAL * sequence;
        if self.subscribed {
            self.events.push_back(FrameSyncEvent {
                sequence,
                timestamp,
            });
        }
        Ok(DequeuedBuffer {
            index,
            sequence,
            bytes_used: u32::try_from(written).unwrap_or(u32::MAX),
            timestamp,
            status,
        })
    }

    fn take_queued(&mut self, index: Option<u32>) -> Result<u32> {
        let position = match index {
            Some(wanted) => self.fifo.iter().position(|&i| i == wanted).ok_or_else(|| {
                CameraError::DeviceIo(format!("buffer {wanted} is not queued"))
            })?,
            None => 0,
        };
        self.fifo.remove(position).ok_or(CameraError::Timeout)
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.handle.lock().held = false;
    }
}

impl DeviceNode for MockNode {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_mode(&mut self, mode: CaptureMode) -> Result<()> {
        self.handle.record(MockCall::SetMode(mode));
        Ok(())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        self.handle
            .record(MockCall::SetFormat(format.width, format.height));
        if !self.slots.is_empty() {
            return Err(CameraError::DeviceIo(
                "format change while buffers are allocated".to_owned(),
            ));
        }
        if !SUPPORTED_FORMATS.contains(&format.fourcc) {
            return Err(CameraError::Configuration(format!(
                "unsupported fourcc {}",
                format.fourcc
            )));
        }
        if format.width > MAX_WIDTH || format.height > MAX_HEIGHT {
            return Err(CameraError::Configuration(format!(
                "{}x{} exceeds sensor size",
                format.width, format.height
            )));
        }
        // The mock only supports even widths.
        let width = format.width & !1;
        self.format = Format::new(width, format.height, format.fourcc).with_raw(format.raw);
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32, memory: MemoryMode) -> Result<u32> {
        self.handle.record(MockCall::RequestBuffers(count));
        if self.streaming {
            return Err(CameraError::DeviceIo("busy: streaming".to_owned()));
        }
        let (max, userptr) = {
            let shared = self.handle.lock();
            (shared.max_buffers, shared.userptr)
        };
        if memory == MemoryMode::UserPtr && !userptr {
            return Err(CameraError::Unsupported(
                "externally supplied buffer memory".to_owned(),
            ));
        }
        let granted = count.min(max);
        let size = self.format.size as usize;
        self.memory = memory;
        self.fifo.clear();
        self.slots = (0..granted)
            .map(|_| Slot {
                state: SlotState::Idle,
                mapped: if memory == MemoryMode::Mmap {
                    vec![0; size]
                } else {
                    Vec::new()
                },
                user: None,
            })
            .collect();
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor> {
        if self.memory != MemoryMode::Mmap {
            return Err(CameraError::DeviceIo(
                "query of a non-mapped buffer".to_owned(),
            ));
        }
        let length = self.format.size as usize;
        self.slot_mut(index)?;
        Ok(BufferDescriptor {
            index,
            offset: index * self.format.size,
            length,
        })
    }

    fn register_user_buffer(&mut self, index: u32, memory: &ExternalMemory) -> Result<()> {
        self.handle.record(MockCall::RegisterUserBuffer(index));
        if memory.len() < self.format.size as usize {
            return Err(CameraError::DeviceIo(format!(
                "user buffer {index} too small"
            )));
        }
        self.slot_mut(index)?.user = Some(memory.clone());
        Ok(())
    }

    fn queue(&mut self, index: u32) -> Result<()> {
        self.handle.record(MockCall::Queue(index));
        let userptr = self.memory == MemoryMode::UserPtr;
        let slot = self.slot_mut(index)?;
        if slot.state == SlotState::Queued {
            return Err(CameraError::DeviceIo(format!("buffer {index} already queued")));
        }
        if userptr && slot.user.is_none() {
            return Err(CameraError::DeviceIo(format!(
                "buffer {index} has no registered memory"
            )));
        }
        slot.state = SlotState::Queued;
        self.fifo.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self, _timeout: Duration) -> Result<DequeuedBuffer> {
        self.handle.record(MockCall::Dequeue);
        if !self.streaming {
            return Err(CameraError::DeviceIo(format!(
                "device {} is not streaming",
                self.index
            )));
        }
        let next = self.handle.lock().script.pop_front();
        match next {
            Some(Scripted::Timeout) => Err(CameraError::Timeout),
            Some(Scripted::Io(message)) => Err(CameraError::DeviceIo(message)),
            Some(Scripted::Index(index)) => {
                let index = self.take_queued(Some(index))?;
                self.fill(index, FrameStatus::Ordinary)
            }
            Some(Scripted::Status(status)) => {
                let index = self.take_queued(None)?;
                self.fill(index, status)
            }
            None => {
                let index = self.take_queued(None)?;
                self.fill(index, FrameStatus::Ordinary)
            }
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        self.handle.record(MockCall::StreamOn);
        if self.slots.is_empty() {
            return Err(CameraError::DeviceIo("stream on without buffers".to_owned()));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.handle.record(MockCall::StreamOff);
        self.streaming = false;
        self.fifo.clear();
        self.events.clear();
        for slot in &mut self.slots {
            slot.state = SlotState::Idle;
        }
        Ok(())
    }

    fn release_buffers(&mut self) -> Result<()> {
        self.handle.record(MockCall::ReleaseBuffers);
        if self.streaming {
            return Err(CameraError::DeviceIo("busy: streaming".to_owned()));
        }
        self.slots.clear();
        self.fifo.clear();
        Ok(())
    }

    fn subscribe_frame_sync(&mut self) -> Result<bool> {
        self.handle.record(MockCall::SubscribeFrameSync);
        self.subscribed = self.handle.lock().frame_sync;
        Ok(self.subscribed)
    }

    fn dequeue_event(&mut self, _timeout: Duration) -> Result<Option<FrameSyncEvent>> {
        if let Some(message) = self.handle.lock().event_error.take() {
            return Err(CameraError::DeviceIo(message));
        }
        Ok(self.events.pop_front())
    }

    fn mapped_data(&self, index: u32) -> Option<&[u8]> {
        let slot = self.slots.get(index as usize)?;
        (self.memory == MemoryMode::Mmap && slot.state == SlotState::Done)
            .then_some(slot.mapped.as_slice())
    }
}

/// Sensor that records every setting written to it.
#[derive(Debug, Default)]
pub struct RecordingSensor {
    log: Mutex<SensorLog>,
}

#[derive(Debug, Default)]
struct SensorLog {
    exposures: Vec<ExposureRequest>,
    focus: Vec<i32>,
    white_balance: Vec<WhiteBalanceGains>,
    windows: Vec<MeteringWindow>,
}

impl RecordingSensor {
    fn lock(&self) -> MutexGuard<'_, SensorLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exposure writes in the order they reached the sensor.
    pub fn exposures(&self) -> Vec<ExposureRequest> {
        self.lock().exposures.clone()
    }

    /// Lens positions written.
    pub fn focus_positions(&self) -> Vec<i32> {
        self.lock().focus.clone()
    }

    /// White-balance gains written.
    pub fn white_balances(&self) -> Vec<WhiteBalanceGains> {
        self.lock().white_balance.clone()
    }

    /// Metering windows written.
    pub fn windows(&self) -> Vec<MeteringWindow> {
        self.lock().windows.clone()
    }
}

impl ExposureSink for RecordingSensor {
    fn apply_exposure(&self, request: &ExposureRequest) -> Result<()> {
        self.lock().exposures.push(request.clone());
        Ok(())
    }
}

impl SensorControls for RecordingSensor {
    fn apply_focus(&self, position: i32) -> Result<()> {
        self.lock().focus.push(position);
        Ok(())
    }

    fn apply_white_balance(&self, gains: WhiteBalanceGains) -> Result<()> {
        self.lock().white_balance.push(gains);
        Ok(())
    }

    fn apply_window(&self, window: MeteringWindow) -> Result<()> {
        self.lock().windows.push(window);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(bus: &MockBus) -> MockNode {
        let mut node = bus.open(0).expect("open should succeed");
        node.set_format(&Format::new(32, 16, FourCC::YUYV))
            .expect("set_format should succeed");
        node
    }

    #[test]
    fn test_mock_node_capabilities() {
        let bus = MockBus::new(1);
        let node = bus.open(0).expect("open should succeed");
        assert_eq!(node.capabilities().driver, "mock");
        assert!(node.capabilities().can_capture);
        assert!(node.capabilities().can_stream);
    }

    #[test]
    fn test_exclusive_open() {
        let bus = MockBus::new(1);
        let node = bus.open(0).expect("open should succeed");
        assert!(matches!(bus.open(0), Err(CameraError::DeviceBusy(0))));
        drop(node);
        assert!(bus.open(0).is_ok());
    }

    #[test]
    fn test_format_negotiation() {
        let bus = MockBus::new(1);
        let mut node = bus.open(0).expect("open should succeed");
        let actual = node
            .set_format(&Format::new(641, 480, FourCC::NV12))
            .expect("set_format should succeed");
        assert_eq!(actual.width, 640);
        assert!(node
            .set_format(&Format::new(64, 48, FourCC::new(b"H264")))
            .is_err());
        assert!(node
            .set_format(&Format::new(8192, 48, FourCC::YUYV))
            .is_err());
    }

    #[test]
    fn test_fifo_order_and_fill_stamp() {
        let bus = MockBus::new(1);
        let mut node = node(&bus);
        assert_eq!(
            node.request_buffers(2, MemoryMode::Mmap)
                .expect("request should succeed"),
            2
        );
        node.queue(1).expect("queue should succeed");
        node.queue(0).expect("queue should succeed");
        node.stream_on().expect("stream_on should succeed");

        let first = node.dequeue(FRAME_INTERVAL).expect("dequeue should succeed");
        assert_eq!(first.index, 1);
        assert_eq!(first.sequence, 1);
        assert_eq!(node.mapped_data(1).and_then(|d| d.first().copied()), Some(1));
        let second = node.dequeue(FRAME_INTERVAL).expect("dequeue should succeed");
        assert_eq!(second.index, 0);
        assert!(matches!(
            node.dequeue(FRAME_INTERVAL),
            Err(CameraError::Timeout)
        ));
    }

    #[test]
    fn test_double_queue_rejected() {
        let bus = MockBus::new(1);
        let mut node = node(&bus);
        node.request_buffers(2, MemoryMode::Mmap)
            .expect("request should succeed");
        node.queue(0).expect("queue should succeed");
        assert!(node.queue(0).is_err());
        assert!(node.queue(7).is_err());
    }

    #[test]
    fn test_userptr_requires_registration() {
        let bus = MockBus::new(1);
        let mut node = node(&bus);
        node.request_buffers(1, MemoryMode::UserPtr)
            .expect("request should succeed");
        assert!(node.queue(0).is_err());
        let memory = ExternalMemory::new(32 * 16 * 2);
        node.register_user_buffer(0, &memory)
            .expect("register should succeed");
        node.queue(0).expect("queue should succeed");
        node.stream_on().expect("stream_on should succeed");
        node.dequeue(FRAME_INTERVAL).expect("dequeue should succeed");
        assert!(memory.read().iter().all(|&b| b == 1));
    }

    #[test]
    fn test_userptr_can_be_disabled() {
        let bus = MockBus::new(1);
        bus.handle(0).expect("mock exists").set_userptr(false);
        let mut node = node(&bus);
        assert!(matches!(
            node.request_buffers(1, MemoryMode::UserPtr),
            Err(CameraError::Unsupported(_))
        ));
    }

    #[test]
    fn test_scripted_status_and_events() {
        let bus = MockBus::new(1);
        let handle = bus.handle(0).expect("mock exists");
        handle.set_frame_sync(true);
        handle.script([Scripted::Status(FrameStatus::FlashExposed)]);
        let mut node = node(&bus);
        node.request_buffers(1, MemoryMode::Mmap)
            .expect("request should succeed");
        node.queue(0).expect("queue should succeed");
        assert!(node.subscribe_frame_sync().expect("subscribe should succeed"));
        node.stream_on().expect("stream_on should succeed");

        let frame = node.dequeue(FRAME_INTERVAL).expect("dequeue should succeed");
        assert_eq!(frame.status, FrameStatus::FlashExposed);
        let event = node
            .dequeue_event(Duration::ZERO)
            .expect("event dequeue should succeed");
        assert_eq!(event.map(|e| e.sequence), Some(1));
        assert_eq!(handle.count(&MockCall::Dequeue), 1);
    }
}
