//! Frame statistics consumed by the 3A layer.
//!
//! Only luma is examined. Packed 4:2:2 formats are sampled on their Y bytes,
//! planar formats on the leading Y plane, and everything else byte-wise.

use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::{DequeuedBuffer, Format, FourCC};

/// Number of luma histogram bins.
pub const HISTOGRAM_BINS: usize = 16;

/// Luma summary of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    /// Frame sequence the statistics were taken from.
    pub sequence: u32,
    /// Capture timestamp of that frame.
    pub timestamp: Duration,
    /// Mean luma, 0..=255.
    pub mean_luma: u8,
    /// Luma histogram, `HISTOGRAM_BINS` equal-width bins.
    pub histogram: [u32; HISTOGRAM_BINS],
    /// Number of samples that went into the histogram.
    pub samples: u32,
}

impl Statistics {
    /// Compute statistics over the bytes of a filled buffer.
    pub fn from_frame(frame: &DequeuedBuffer, format: &Format, data: &[u8]) -> Result<Self> {
        let (offset, step, len) = luma_layout(format, data.len());
        let mut histogram = [0u32; HISTOGRAM_BINS];
        let mut sum = 0u64;
        let mut samples = 0u32;

        for &luma in data.iter().take(len).skip(offset).step_by(step) {
            let bin = usize::from(luma) * HISTOGRAM_BINS / 256;
            if let Some(count) = histogram.get_mut(bin) {
                *count += 1;
            }
            sum += u64::from(luma);
            samples += 1;
        }

        if samples == 0 {
            return Err(CameraError::InvalidBuffer {
                index: frame.index,
                reason: "no luma samples",
            });
        }

        let mean = sum / u64::from(samples);
        Ok(Self {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            mean_luma: u8::try_from(mean).unwrap_or(u8::MAX),
            histogram,
            samples,
        })
    }

    /// Fraction of samples in the top histogram bin.
    #[allow(clippy::cast_precision_loss)]
    pub fn clipped_fraction(&self) -> f32 {
        let top = self.histogram.last().copied().unwrap_or(0);
        top as f32 / self.samples.max(1) as f32
    }
}

/// (first luma byte, distance between luma bytes, bytes to scan)
fn luma_layout(format: &Format, available: usize) -> (usize, usize, usize) {
    let frame = (format.size as usize).min(available);
    match format.fourcc {
        FourCC::YUYV => (0, 2, frame),
        FourCC::UYVY => (1, 2, frame),
        FourCC::NV12 => {
            let plane = (format.stride as usize * format.height as usize).min(frame);
            (0, 1, plane)
        }
        // Ten-bit Bayer in 16-bit words; the high byte carries the top bits.
        FourCC::SGRBG10 | FourCC::SRGGB10 => (1, 2, frame),
        _ => (0, 1, frame),
    }
}

/// Check that acquired frames carry consecutive sequence numbers.
pub fn check_sequence(frames: &[DequeuedBuffer]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::Configuration(
            "cannot check an empty frame sequence".to_owned(),
        ));
    }
    for (position, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.sequence.wrapping_add(1);
            if curr.sequence != expected {
                return Err(CameraError::DeviceIo(format!(
                    "frame sequence gap at {}: expected {expected}, got {}",
                    position + 1,
                    curr.sequence
                )));
            }
        }
    }
    Ok(())
}
