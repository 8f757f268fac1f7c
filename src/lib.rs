//! ISP-Capture: capture-device state machine and frame-synchronized exposure
//! control for Linux camera pipelines.
//!
//! Devices are driven through the [`DeviceNode`] protocol trait, implemented
//! for real V4L2 nodes ([`V4L2Node`]) and for in-process mock nodes
//! ([`mock::MockNode`]). A [`CapturePipeline`] owns one device or a lockstep
//! pair, recovers from stalled acquisition, and notifies the
//! [`ExposureSyncEngine`] of every frame boundary so exposure and gain land
//! on the frame they were meant for.

pub mod aaa;
pub mod bounded_queue;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod delay_line;
pub mod device;
pub mod error;
pub mod exposure;
pub mod mock;
pub mod pipeline;
pub mod statistics;
pub mod traits;
pub mod worker;

pub use aaa::{
    AaaAlgorithm, AaaController, AaaDecision, IspControl, IspController, MeanLumaExposure,
    MeteringWindow, SensorControls, WhiteBalanceGains,
};
pub use bounded_queue::BoundedQueue;
pub use buffer::{BufferMemory, BufferPool, BufferState, ExternalMemory, FrameBuffer};
pub use capture::{CaptureDevice, DevicePair, DeviceState, PairedFrame};
pub use config::PipelineConfig;
pub use delay_line::DelayLine;
pub use device::{V4L2Node, V4L2Opener};
pub use error::{CameraError, Result};
pub use exposure::{ExposureRequest, ExposureSink, ExposureSyncEngine, SyncConfig, SyncMode};
pub use pipeline::{CaptureStreams, CapturePipeline, CapturedFrame, FrameSyncListener};
pub use statistics::Statistics;
pub use traits::{
    CaptureMode, DequeuedBuffer, DeviceCapabilities, DeviceNode, Format, FourCC, FrameStatus,
    MemoryMode, NodeOpener,
};
pub use worker::{CaptureWorker, FrameHandler, WorkerState};
