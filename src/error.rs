//! Error type shared by the capture state machine and the exposure engine.

use thiserror::Error;

use crate::capture::DeviceState;

/// Error type for capture and exposure-synchronization operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device with given index was not found.
    #[error("device {0} not found")]
    DeviceNotFound(u32),
    /// Device node is already held exclusively by another owner.
    #[error("device {0} is busy")]
    DeviceBusy(u32),
    /// Invalid or unsupported geometry, format, or sensor-lag configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Any device protocol failure other than a timeout.
    #[error("device I/O error: {0}")]
    DeviceIo(String),
    /// A single dequeue poll expired without a filled buffer.
    #[error("dequeue timed out")]
    Timeout,
    /// Every dequeue attempt inside `acquire` timed out.
    #[error("acquisition timed out after {attempts} attempts")]
    AcquisitionTimeout {
        /// Number of dequeue attempts made.
        attempts: u32,
    },
    /// Paired devices returned different buffer indices for one frame.
    #[error("paired devices desynchronized: primary buffer {primary}, secondary buffer {secondary}")]
    PairMismatch {
        /// Index dequeued from the primary device.
        primary: u32,
        /// Index dequeued from the secondary device.
        secondary: u32,
    },
    /// An exposure request arrived while the pending queue was full.
    #[error("pending exposure queue full ({capacity} entries); sensor lag assumption is wrong")]
    QueueOverflow {
        /// Capacity of the queue that overflowed.
        capacity: usize,
    },
    /// Pop on an empty pending queue.
    #[error("pending exposure queue is empty")]
    QueueEmpty,
    /// Operation is not legal in the device's current state.
    #[error("cannot {operation} while device is {state:?}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the device was in.
        state: DeviceState,
    },
    /// Buffer index is out of range or in the wrong state for the operation.
    #[error("invalid buffer {index}: {reason}")]
    InvalidBuffer {
        /// Offending buffer index.
        index: u32,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// The backend does not implement the requested capability.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Whether this is a single-poll timeout that `acquire` may retry.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether a capture worker must stop streaming after this error.
    ///
    /// Exhausted acquisition is not fatal here: the pipeline recovers from it.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout | Self::AcquisitionTimeout { .. })
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
