//! Fixed-capacity buffer arena bound to one capture device.
//!
//! Each slot carries an explicit [`BufferState`], so the pool invariant
//! `queued + filled == capacity` (once activated) is checked on every
//! transition rather than inferred from pointer bookkeeping.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::{DequeuedBuffer, Format, FrameStatus};

/// Caller-owned frame memory registered with a device.
///
/// Clones share the same region, which is how downstream consumers read
/// frames without copying.
#[derive(Debug, Clone)]
pub struct ExternalMemory {
    data: Arc<RwLock<Vec<u8>>>,
}

impl ExternalMemory {
    /// Allocate a zeroed region of `length` bytes.
    #[must_use]
    pub fn new(length: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0; length])),
        }
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive write access, used by whoever fills the buffer.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles refer to the same region.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Ownership state of one buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated but not submitted to the device.
    Free,
    /// Owned by the device, waiting to be filled.
    Queued,
    /// Holding a captured frame; owned by the caller until requeued.
    Filled,
}

/// Backing memory of a buffer.
#[derive(Debug, Clone)]
pub enum BufferMemory {
    /// Region mapped from the device.
    Mapped {
        /// Map offset reported by the device.
        offset: u32,
        /// Region length in bytes.
        length: usize,
    },
    /// Region supplied by the process.
    External(ExternalMemory),
}

impl BufferMemory {
    /// Length of the backing region in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Mapped { length, .. } => *length,
            Self::External(memory) => memory.len(),
        }
    }

    /// Whether the backing region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One capture buffer.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    index: u32,
    memory: BufferMemory,
    format: Format,
    state: BufferState,
    sequence: u32,
    bytes_used: u32,
    timestamp: Duration,
    status: FrameStatus,
}

impl FrameBuffer {
    /// Stable identity within the pool.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Backing memory.
    pub const fn memory(&self) -> &BufferMemory {
        &self.memory
    }

    /// Byte length of the backing memory.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Whether the backing memory is empty.
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Geometry and pixel format.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Current ownership state.
    pub const fn state(&self) -> BufferState {
        self.state
    }

    /// Driver sequence of the last frame written into this buffer.
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Bytes used by the last frame written into this buffer.
    pub const fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    /// Capture timestamp of the last frame.
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Flash status of the last frame.
    pub const fn status(&self) -> FrameStatus {
        self.status
    }
}

/// Fixed-capacity collection of buffers sharing one geometry.
#[derive(Debug)]
pub struct BufferPool {
    format: Format,
    buffers: Vec<FrameBuffer>,
    activated: bool,
}

impl BufferPool {
    /// Build a pool with one slot per memory region; every slot starts `Free`.
    pub fn new(format: Format, memory: Vec<BufferMemory>) -> Result<Self> {
        if memory.is_empty() {
            return Err(CameraError::Configuration(
                "buffer pool needs at least one buffer".to_owned(),
            ));
        }
        let buffers = memory
            .into_iter()
            .enumerate()
            .map(|(index, memory)| {
                let index = u32::try_from(index).map_err(|_| {
                    CameraError::Configuration("buffer count exceeds u32".to_owned())
                })?;
                Ok(FrameBuffer {
                    index,
                    memory,
                    format: format.clone(),
                    state: BufferState::Free,
                    sequence: 0,
                    bytes_used: 0,
                    timestamp: Duration::ZERO,
                    status: FrameStatus::Ordinary,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            format,
            buffers,
            activated: false,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Geometry shared by all buffers.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Buffer with the given index.
    pub fn get(&self, index: u32) -> Option<&FrameBuffer> {
        self.buffers.get(index as usize)
    }

    /// All buffers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &FrameBuffer> {
        self.buffers.iter()
    }

    /// Number of buffers in `state`.
    pub fn count(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state == state).count()
    }

    /// Whether every buffer has been submitted at least once.
    pub const fn is_activated(&self) -> bool {
        self.activated
    }

    /// `queued + filled == capacity` once activated; trivially true before.
    pub fn invariant_holds(&self) -> bool {
        !self.activated
            || self.count(BufferState::Queued) + self.count(BufferState::Filled)
                == self.capacity()
    }

    /// Record that `index` was submitted to the device.
    ///
    /// Legal from `Free` (activation) or `Filled` (release).
    pub fn mark_queued(&mut self, index: u32) -> Result<()> {
        let buffer = self.slot_mut(index)?;
        if buffer.state == BufferState::Queued {
            return Err(CameraError::InvalidBuffer {
                index,
                reason: "already queued to device",
            });
        }
        buffer.state = BufferState::Queued;
        Ok(())
    }

    /// Record that the device handed `frame.index` back filled.
    pub fn mark_filled(&mut self, frame: &DequeuedBuffer) -> Result<()> {
        let buffer = self.slot_mut(frame.index)?;
        if buffer.state != BufferState::Queued {
            return Err(CameraError::InvalidBuffer {
                index: frame.index,
                reason: "dequeued a buffer that was not queued",
            });
        }
        buffer.state = BufferState::Filled;
        buffer.sequence = frame.sequence;
        buffer.bytes_used = frame.bytes_used;
        buffer.timestamp = frame.timestamp;
        buffer.status = frame.status;
        Ok(())
    }

    /// Set once every buffer has been queued.
    pub fn set_activated(&mut self) {
        self.activated = self.count(BufferState::Free) == 0;
    }

    /// Dismantle the pool, keeping caller-owned regions for reuse.
    pub fn into_external_memory(self) -> Vec<ExternalMemory> {
        self.buffers
            .into_iter()
            .filter_map(|b| match b.memory {
                BufferMemory::External(memory) => Some(memory),
                BufferMemory::Mapped { .. } => None,
            })
            .collect()
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut FrameBuffer> {
        self.buffers
            .get_mut(index as usize)
            .ok_or(CameraError::InvalidBuffer {
                index,
                reason: "out of range",
            })
    }
}
