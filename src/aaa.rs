//! ISP control surface and the 3A (auto exposure / focus / white balance) loop.
//!
//! Dependencies point one way: [`AaaController`] drives anything that
//! implements [`IspControl`]; [`IspController`] implements it on top of the
//! [`ExposureSyncEngine`] and a [`SensorControls`] sink, and knows nothing
//! about 3A.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::error::Result;
use crate::exposure::{ExposureRequest, ExposureSink, ExposureSyncEngine};
use crate::statistics::Statistics;

/// Per-channel white-balance gains in 1/256 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhiteBalanceGains {
    /// Red channel gain.
    pub red: u32,
    /// Green channel gain.
    pub green: u32,
    /// Blue channel gain.
    pub blue: u32,
}

impl Default for WhiteBalanceGains {
    fn default() -> Self {
        Self {
            red: 256,
            green: 256,
            blue: 256,
        }
    }
}

/// Region the statistics and focus are evaluated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeteringWindow {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Hardware appliers for everything the ISP controls.
///
/// Exposure arrives through [`ExposureSink`] after delay compensation; the
/// other settings take effect immediately and default to no-ops for sensors
/// that lack them.
pub trait SensorControls: ExposureSink {
    /// Move the lens to `position`.
    fn apply_focus(&self, _position: i32) -> Result<()> {
        Ok(())
    }

    /// Program white-balance gains.
    fn apply_white_balance(&self, _gains: WhiteBalanceGains) -> Result<()> {
        Ok(())
    }

    /// Program the metering window.
    fn apply_window(&self, _window: MeteringWindow) -> Result<()> {
        Ok(())
    }
}

/// Settings surface the 3A layer is allowed to touch.
pub trait IspControl: Send + Sync {
    /// Request a new exposure; applied on the frame it is meant for.
    fn set_exposure(&self, request: ExposureRequest) -> Result<()>;
    /// Last exposure requested.
    fn exposure(&self) -> Option<ExposureRequest>;
    /// Request a lens position.
    fn set_focus(&self, position: i32) -> Result<()>;
    /// Last lens position requested.
    fn focus(&self) -> Option<i32>;
    /// Request white-balance gains.
    fn set_white_balance(&self, gains: WhiteBalanceGains) -> Result<()>;
    /// Current white-balance gains.
    fn white_balance(&self) -> WhiteBalanceGains;
    /// Request a metering window.
    fn set_window(&self, window: MeteringWindow) -> Result<()>;
    /// Current metering window, if one was set.
    fn window(&self) -> Option<MeteringWindow>;
}

#[derive(Debug, Default)]
struct IspSettings {
    exposure: Option<ExposureRequest>,
    focus: Option<i32>,
    white_balance: WhiteBalanceGains,
    window: Option<MeteringWindow>,
}

/// [`IspControl`] over a sensor and its exposure sync engine.
pub struct IspController {
    engine: Arc<ExposureSyncEngine>,
    sensor: Arc<dyn SensorControls>,
    settings: Mutex<IspSettings>,
}

impl std::fmt::Debug for IspController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IspController")
            .field("engine", &self.engine)
            .field("settings", &self.lock())
            .finish_non_exhaustive()
    }
}

impl IspController {
    /// Route exposure through `engine` and everything else to `sensor`.
    pub fn new(engine: Arc<ExposureSyncEngine>, sensor: Arc<dyn SensorControls>) -> Self {
        Self {
            engine,
            sensor,
            settings: Mutex::new(IspSettings::default()),
        }
    }

    /// Engine exposure requests go through.
    pub const fn engine(&self) -> &Arc<ExposureSyncEngine> {
        &self.engine
    }

    fn lock(&self) -> MutexGuard<'_, IspSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IspControl for IspController {
    fn set_exposure(&self, request: ExposureRequest) -> Result<()> {
        self.engine.set_exposure(request.clone())?;
        self.lock().exposure = Some(request);
        Ok(())
    }

    fn exposure(&self) -> Option<ExposureRequest> {
        self.lock().exposure.clone()
    }

    fn set_focus(&self, position: i32) -> Result<()> {
        self.sensor.apply_focus(position)?;
        self.lock().focus = Some(position);
        Ok(())
    }

    fn focus(&self) -> Option<i32> {
        self.lock().focus
    }

    fn set_white_balance(&self, gains: WhiteBalanceGains) -> Result<()> {
        self.sensor.apply_white_balance(gains)?;
        self.lock().white_balance = gains;
        Ok(())
    }

    fn white_balance(&self) -> WhiteBalanceGains {
        self.lock().white_balance
    }

    fn set_window(&self, window: MeteringWindow) -> Result<()> {
        self.sensor.apply_window(window)?;
        self.lock().window = Some(window);
        Ok(())
    }

    fn window(&self) -> Option<MeteringWindow> {
        self.lock().window
    }
}

/// What a 3A iteration wants changed. `None` leaves a setting alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AaaDecision {
    /// New exposure.
    pub exposure: Option<ExposureRequest>,
    /// New lens position.
    pub focus: Option<i32>,
    /// New white-balance gains.
    pub white_balance: Option<WhiteBalanceGains>,
}

/// A 3A algorithm: statistics in, settings out.
pub trait AaaAlgorithm: Send {
    /// Decide the next settings from one frame's statistics.
    fn process(&mut self, stats: &Statistics, current: Option<&ExposureRequest>) -> AaaDecision;
}

/// Proportional auto-exposure on mean luma.
///
/// Integration time is adjusted first; gain only moves once integration time
/// is pinned at a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeanLumaExposure {
    /// Mean luma to converge on.
    pub target: u8,
    /// Deviation from `target` that is left alone.
    pub tolerance: u8,
    /// Integration time limits in lines.
    pub integration_range: (u32, u32),
    /// Gain limits in sensor gain codes.
    pub gain_range: (u32, u32),
}

impl Default for MeanLumaExposure {
    fn default() -> Self {
        Self {
            target: 118,
            tolerance: 8,
            integration_range: (4, 2000),
            gain_range: (16, 256),
        }
    }
}

impl MeanLumaExposure {
    fn scale(value: u32, target: u8, measured: u8, (low, high): (u32, u32)) -> u32 {
        let measured = u64::from(measured.max(1));
        let scaled = u64::from(value.max(1)) * u64::from(target) / measured;
        u32::try_from(scaled).unwrap_or(u32::MAX).clamp(low, high)
    }
}

impl AaaAlgorithm for MeanLumaExposure {
    fn process(&mut self, stats: &Statistics, current: Option<&ExposureRequest>) -> AaaDecision {
        if stats.mean_luma.abs_diff(self.target) <= self.tolerance {
            return AaaDecision::default();
        }
        let (gain, integration) = current.map_or(
            (self.gain_range.0, self.integration_range.0),
            |request| {
                (
                    request.gain,
                    request.integration_time.first().copied().unwrap_or(0),
                )
            },
        );

        let next_integration =
            Self::scale(integration, self.target, stats.mean_luma, self.integration_range);
        let next_gain = if next_integration == integration {
            Self::scale(gain, self.target, stats.mean_luma, self.gain_range)
        } else {
            gain.clamp(self.gain_range.0, self.gain_range.1)
        };

        if next_gain == gain && next_integration == integration {
            return AaaDecision::default();
        }
        AaaDecision {
            exposure: Some(
                ExposureRequest::new(next_gain, next_integration)
                    .with_sequence(u64::from(stats.sequence)),
            ),
            ..AaaDecision::default()
        }
    }
}

/// Runs an [`AaaAlgorithm`] against an [`IspControl`].
pub struct AaaController<A> {
    algorithm: A,
    isp: Arc<dyn IspControl>,
    iterations: u64,
}

impl<A: std::fmt::Debug> std::fmt::Debug for AaaController<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AaaController")
            .field("algorithm", &self.algorithm)
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl<A: AaaAlgorithm> AaaController<A> {
    /// Drive `isp` with `algorithm`.
    pub fn new(algorithm: A, isp: Arc<dyn IspControl>) -> Self {
        Self {
            algorithm,
            isp,
            iterations: 0,
        }
    }

    /// Iterations run so far.
    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    /// The wrapped algorithm.
    pub const fn algorithm(&self) -> &A {
        &self.algorithm
    }

    /// One 3A iteration: decide and push the decision to the ISP.
    pub fn run(&mut self, stats: &Statistics) -> Result<AaaDecision> {
        self.iterations += 1;
        let current = self.isp.exposure();
        let decision = self.algorithm.process(stats, current.as_ref());
        trace!(
            sequence = stats.sequence,
            mean_luma = stats.mean_luma,
            ?decision,
            "3A iteration"
        );

        if let Some(request) = decision.exposure.clone() {
            debug!(
                gain = request.gain,
                integration = ?request.integration_time,
                "3A exposure update"
            );
            self.isp.set_exposure(request)?;
        }
        if let Some(position) = decision.focus {
            self.isp.set_focus(position)?;
        }
        if let Some(gains) = decision.white_balance {
            self.isp.set_white_balance(gains)?;
        }
        Ok(decision)
    }
}
