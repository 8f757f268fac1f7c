//! Frame-synchronized exposure and gain application.
//!
//! Sensors latch a new gain after `gain_lag_frames` and a new integration
//! time after `exposure_lag_frames`. [`ExposureSyncEngine`] holds the gain
//! back by the difference so both land on the same frame, and in frame-sync
//! mode defers whole requests until the capture pipeline reports a frame
//! boundary.
//!
//! The engine only ever receives notifications; it never calls back into the
//! pipeline.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, trace, warn};

use crate::bounded_queue::BoundedQueue;
use crate::delay_line::DelayLine;
use crate::error::{CameraError, Result};

/// Smallest pending-request FIFO the engine will run with.
pub const MIN_FIFO_DEPTH: usize = 2;

/// Pending-request FIFO depth used when none is configured.
pub const DEFAULT_FIFO_DEPTH: usize = 4;

/// One exposure setting produced by the control layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureRequest {
    /// Sensor analog gain code.
    pub gain: u32,
    /// Integration time(s) in sensor lines; at least one entry.
    pub integration_time: Vec<u32>,
    /// Control-layer sequence number.
    pub sequence: Option<u64>,
    /// Time the request was produced.
    pub timestamp: Option<Duration>,
}

impl ExposureRequest {
    /// Request with a single integration time.
    #[must_use]
    pub fn new(gain: u32, integration_time: u32) -> Self {
        Self {
            gain,
            integration_time: vec![integration_time],
            sequence: None,
            timestamp: None,
        }
    }

    /// Tag the request with a sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Same request with the gain replaced.
    #[must_use]
    fn with_gain(&self, gain: u32) -> Self {
        Self {
            gain,
            ..self.clone()
        }
    }
}

/// Where compensated exposure settings are written to hardware.
pub trait ExposureSink: Send + Sync {
    /// Write gain and integration time(s) to the sensor.
    fn apply_exposure(&self, request: &ExposureRequest) -> Result<()>;
}

/// Sensor latency and queueing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Frames between writing a gain and it affecting a captured frame.
    pub gain_lag_frames: u32,
    /// Frames between writing an integration time and it taking effect.
    pub exposure_lag_frames: u32,
    /// Defer requests until frame-advance notifications arrive.
    pub synchronize_to_frames: bool,
    /// Capacity of the pending-request FIFO.
    pub fifo_depth: usize,
    /// Gain the delay line reports before any history exists.
    pub initial_gain: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gain_lag_frames: 1,
            exposure_lag_frames: 2,
            synchronize_to_frames: true,
            fifo_depth: DEFAULT_FIFO_DEPTH,
            initial_gain: 0,
        }
    }
}

impl SyncConfig {
    /// Derive delay depths from the lags.
    pub fn plan(&self) -> Result<SyncPlan> {
        if self.gain_lag_frames > self.exposure_lag_frames {
            return Err(CameraError::Configuration(format!(
                "gain lag {} exceeds exposure lag {}",
                self.gain_lag_frames, self.exposure_lag_frames
            )));
        }
        let gain_delay = (self.exposure_lag_frames - self.gain_lag_frames) as usize;
        // The frame-advance notification itself can trail capture by a frame.
        let margin = u32::from(self.synchronize_to_frames);
        let horizon = self.gain_lag_frames.max(self.exposure_lag_frames) + margin;
        if self.fifo_depth < MIN_FIFO_DEPTH {
            warn!(
                requested = self.fifo_depth,
                used = MIN_FIFO_DEPTH,
                "exposure FIFO depth raised to minimum"
            );
        }
        Ok(SyncPlan {
            gain_delay,
            horizon,
            fifo_depth: self.fifo_depth.max(MIN_FIFO_DEPTH),
            frame_sync: self.synchronize_to_frames,
            bypass: !self.synchronize_to_frames && gain_delay == 0,
        })
    }
}

/// Delay depths derived from a [`SyncConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    /// Depth of the gain delay line.
    pub gain_delay: usize,
    /// Frames between a request and the frame it affects.
    pub horizon: u32,
    /// Pending-request FIFO capacity.
    pub fifo_depth: usize,
    /// Whether requests wait for frame-advance notifications.
    pub frame_sync: bool,
    /// Neither frame sync nor gain delay is needed.
    pub bypass: bool,
}

impl SyncPlan {
    const fn passthrough() -> Self {
        Self {
            gain_delay: 0,
            horizon: 0,
            fifo_depth: MIN_FIFO_DEPTH,
            frame_sync: false,
            bypass: true,
        }
    }
}

/// How the engine currently routes requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// No compensation configured; write through.
    Bypass,
    /// Not streaming: write through, but keep the gain history warm.
    Immediate,
    /// Streaming without frame sync: write through with delayed gain.
    GainDelayOnly,
    /// Streaming with frame sync: queue until the next frame boundary.
    FrameSync,
}

#[derive(Debug)]
struct EngineState {
    mode: SyncMode,
    pending: BoundedQueue<ExposureRequest>,
    gain_delay: DelayLine<u32>,
    last_request: Option<ExposureRequest>,
    last_written_gain: Option<u32>,
    frames: u64,
    applied: u64,
}

/// Aligns exposure and gain writes with the frames they affect.
///
/// Sink writes are serialized: a caller holds `writer` from the moment it
/// takes requests out of the state until they reach the sink, so writes land
/// in the order they were decided. Sinks must not call back into the engine.
pub struct ExposureSyncEngine {
    plan: SyncPlan,
    writer: Mutex<()>,
    state: Mutex<EngineState>,
    sink: Arc<dyn ExposureSink>,
}

impl std::fmt::Debug for ExposureSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureSyncEngine")
            .field("plan", &self.plan)
            .field("state", &self.lock())
            .finish_non_exhaustive()
    }
}

impl ExposureSyncEngine {
    /// Build an engine. Fails if the gain lags the exposure.
    pub fn new(config: &SyncConfig, sink: Arc<dyn ExposureSink>) -> Result<Self> {
        let plan = config.plan()?;
        info!(
            gain_delay = plan.gain_delay,
            horizon = plan.horizon,
            fifo_depth = plan.fifo_depth,
            frame_sync = plan.frame_sync,
            bypass = plan.bypass,
            "exposure sync configured"
        );
        Ok(Self::with_plan(plan, config.initial_gain, sink))
    }

    /// Engine that writes every request straight through.
    pub fn bypass(sink: Arc<dyn ExposureSink>) -> Self {
        Self::with_plan(SyncPlan::passthrough(), 0, sink)
    }

    /// Build from `config`, falling back to [`Self::bypass`] on a bad lag setup.
    pub fn new_or_bypass(config: &SyncConfig, sink: Arc<dyn ExposureSink>) -> Self {
        match Self::new(config, Arc::clone(&sink)) {
            Ok(engine) => engine,
            Err(err) => {
                error!(%err, "exposure sync disabled; settings apply uncompensated");
                Self::bypass(sink)
            }
        }
    }

    fn with_plan(plan: SyncPlan, initial_gain: u32, sink: Arc<dyn ExposureSink>) -> Self {
        let mode = if plan.bypass {
            SyncMode::Bypass
        } else {
            SyncMode::Immediate
        };
        Self {
            plan,
            writer: Mutex::new(()),
            state: Mutex::new(EngineState {
                mode,
                pending: BoundedQueue::new(plan.fifo_depth),
                gain_delay: DelayLine::new(plan.gain_delay, initial_gain),
                last_request: None,
                last_written_gain: None,
                frames: 0,
                applied: 0,
            }),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Lock order: writer, then state.
    fn serialize_writes(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Derived delay configuration.
    pub const fn plan(&self) -> SyncPlan {
        self.plan
    }

    /// Current routing mode.
    pub fn mode(&self) -> SyncMode {
        self.lock().mode
    }

    /// Requests waiting for a frame boundary.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Frame-advance notifications received.
    pub fn frames_advanced(&self) -> u64 {
        self.lock().frames
    }

    /// Writes made to the sink.
    pub fn applied_count(&self) -> u64 {
        self.lock().applied
    }

    /// Most recent request taken from the control layer and applied.
    pub fn last_request(&self) -> Option<ExposureRequest> {
        self.lock().last_request.clone()
    }

    /// Toggle between immediate and streaming operation.
    ///
    /// Leaving frame sync writes any still-pending requests, oldest first.
    pub fn set_streaming(&self, streaming: bool) -> Result<()> {
        let _writer = self.serialize_writes();
        let drained = {
            let mut state = self.lock();
            let previous = state.mode;
            state.mode = match (self.plan.bypass, streaming, self.plan.frame_sync) {
                (true, _, _) => SyncMode::Bypass,
                (false, false, _) => SyncMode::Immediate,
                (false, true, true) => SyncMode::FrameSync,
                (false, true, false) => SyncMode::GainDelayOnly,
            };
            if previous != state.mode {
                info!(from = ?previous, to = ?state.mode, "exposure sync mode changed");
            }
            let mut drained = Vec::new();
            if previous == SyncMode::FrameSync && state.mode != SyncMode::FrameSync {
                while let Ok(request) = state.pending.pop() {
                    state.gain_delay.push(request.gain);
                    state.last_request = Some(request.clone());
                    drained.push(request);
                }
            }
            drained
        };
        for request in drained {
            self.write(&request)?;
        }
        Ok(())
    }

    /// Accept a request from the control layer.
    ///
    /// In frame-sync mode the request is queued; a full queue is reported as
    /// `QueueOverflow` and the request is not recorded.
    pub fn set_exposure(&self, request: ExposureRequest) -> Result<()> {
        let _writer = self.serialize_writes();
        let write = {
            let mut state = self.lock();
            match state.mode {
                SyncMode::Bypass => {
                    state.last_request = Some(request.clone());
                    request
                }
                SyncMode::Immediate => {
                    state.gain_delay.push(request.gain);
                    state.last_request = Some(request.clone());
                    request
                }
                SyncMode::GainDelayOnly => {
                    let gain = state.gain_delay.push(request.gain);
                    let write = request.with_gain(gain);
                    state.last_request = Some(request);
                    write
                }
                SyncMode::FrameSync => {
                    if let Err(err) = state.pending.push(request) {
                        error!(
                            %err,
                            horizon = self.plan.horizon,
                            "exposure request rejected; sensor lag configuration mismatch"
                        );
                        return Err(err);
                    }
                    trace!(pending = state.pending.len(), "exposure request queued");
                    return Ok(());
                }
            }
        };
        self.write(&write)
    }

    /// A new frame boundary was observed.
    ///
    /// Applies the oldest pending request, or re-ticks the last gain through
    /// the delay line when nothing is pending.
    pub fn advance_frame(&self, timestamp: Duration) -> Result<()> {
        let _writer = self.serialize_writes();
        let write = {
            let mut state = self.lock();
            state.frames += 1;
            if state.mode != SyncMode::FrameSync {
                return Ok(());
            }
            match state.pending.pop() {
                Ok(request) => {
                    let gain = state.gain_delay.push(request.gain);
                    let write = request.with_gain(gain);
                    state.last_request = Some(request);
                    Some(write)
                }
                Err(_) => match state.last_request.clone() {
                    Some(last) => {
                        let gain = state.gain_delay.push(last.gain);
                        (state.last_written_gain != Some(gain)).then(|| last.with_gain(gain))
                    }
                    None => None,
                },
            }
        };
        match write {
            Some(request) => {
                debug!(
                    ?timestamp,
                    gain = request.gain,
                    integration = ?request.integration_time,
                    effective_in = self.plan.horizon,
                    "applying exposure on frame boundary"
                );
                self.write(&request)
            }
            None => Ok(()),
        }
    }

    /// Discard every pending request; the gain history is kept.
    pub fn flush_pending(&self) -> usize {
        let discarded = self.lock().pending.clear();
        if discarded > 0 {
            warn!(discarded, "pending exposure requests discarded after stream reset");
        }
        discarded
    }

    // Callers hold the writer lock.
    fn write(&self, request: &ExposureRequest) -> Result<()> {
        self.sink.apply_exposure(request)?;
        let mut state = self.lock();
        state.last_written_gain = Some(request.gain);
        state.applied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::mock::RecordingSensor;

    fn config(gain: u32, exposure: u32, sync: bool) -> SyncConfig {
        SyncConfig {
            gain_lag_frames: gain,
            exposure_lag_frames: exposure,
            synchronize_to_frames: sync,
            fifo_depth: 4,
            initial_gain: 0,
        }
    }

    fn engine(config: &SyncConfig) -> (ExposureSyncEngine, Arc<RecordingSensor>) {
        let sensor = Arc::new(RecordingSensor::default());
        let engine = ExposureSyncEngine::new(config, Arc::clone(&sensor) as Arc<dyn ExposureSink>)
            .expect("engine should build");
        (engine, sensor)
    }

    #[test]
    fn test_plan_depth_and_horizon() {
        let plan = config(2, 5, true).plan().expect("plan should succeed");
        assert_eq!(plan.gain_delay, 3);
        assert_eq!(plan.horizon, 6);
        assert!(!plan.bypass);

        let plan = config(2, 5, false).plan().expect("plan should succeed");
        assert_eq!(plan.horizon, 5);

        let plan = config(2, 2, false).plan().expect("plan should succeed");
        assert_eq!(plan.gain_delay, 0);
        assert!(plan.bypass);
    }

    #[test]
    fn test_gain_lag_above_exposure_lag_rejected() {
        assert!(matches!(
            config(3, 2, true).plan(),
            Err(CameraError::Configuration(_))
        ));
        let sensor = Arc::new(RecordingSensor::default());
        let engine = ExposureSyncEngine::new_or_bypass(&config(3, 2, true), sensor);
        assert_eq!(engine.mode(), SyncMode::Bypass);
    }

    #[test]
    fn test_fifo_depth_minimum() {
        let mut cfg = config(1, 1, true);
        cfg.fifo_depth = 0;
        assert_eq!(cfg.plan().expect("plan should succeed").fifo_depth, 2);
    }

    #[test]
    fn test_frame_sync_applies_in_order_once() {
        let (engine, sensor) = engine(&config(2, 2, true));
        engine.set_streaming(true).expect("mode change should succeed");
        assert_eq!(engine.mode(), SyncMode::FrameSync);

        let requests: Vec<ExposureRequest> = (1..=3)
            .map(|i| ExposureRequest::new(100 * i, 1000 * i).with_sequence(u64::from(i)))
            .collect();
        for request in &requests {
            engine
                .set_exposure(request.clone())
                .expect("enqueue should succeed");
        }
        assert!(sensor.exposures().is_empty(), "nothing written before a frame");

        for frame in 0..3 {
            engine
                .advance_frame(Duration::from_millis(33 * frame))
                .expect("frame should apply");
        }
        assert_eq!(sensor.exposures(), requests);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_frame_sync_delays_gain_only() {
        let (engine, sensor) = engine(&config(1, 3, true));
        engine.set_streaming(true).expect("mode change should succeed");
        engine
            .set_exposure(ExposureRequest::new(50, 900))
            .expect("enqueue should succeed");
        engine
            .advance_frame(Duration::ZERO)
            .expect("frame should apply");

        let written = sensor.exposures();
        assert_eq!(written.len(), 1);
        assert_eq!(written.first().map(|r| r.gain), Some(0));
        assert_eq!(
            written.first().map(|r| r.integration_time.clone()),
            Some(vec![900])
        );
    }

    #[test]
    fn test_empty_queue_keeps_delay_line_ticking() {
        let (engine, sensor) = engine(&config(1, 3, true));
        engine.set_streaming(true).expect("mode change should succeed");
        engine
            .set_exposure(ExposureRequest::new(50, 900))
            .expect("enqueue should succeed");

        for _ in 0..4 {
            engine
                .advance_frame(Duration::ZERO)
                .expect("frame should apply");
        }
        let gains: Vec<u32> = sensor.exposures().iter().map(|r| r.gain).collect();
        // Gain 50 emerges two frames after it went in; unchanged ticks write nothing.
        assert_eq!(gains, vec![0, 50]);
    }

    #[test]
    fn test_overflow_is_reported() {
        let (engine, _sensor) = engine(&config(1, 1, true));
        engine.set_streaming(true).expect("mode change should succeed");
        for i in 0..4 {
            engine
                .set_exposure(ExposureRequest::new(i, i))
                .expect("enqueue should succeed");
        }
        assert!(matches!(
            engine.set_exposure(ExposureRequest::new(9, 9)),
            Err(CameraError::QueueOverflow { capacity: 4 })
        ));
        assert_eq!(engine.pending(), 4);
    }

    #[test]
    fn test_immediate_mode_warms_delay_line() {
        let (engine, sensor) = engine(&config(1, 3, false));
        assert_eq!(engine.mode(), SyncMode::Immediate);
        engine
            .set_exposure(ExposureRequest::new(10, 100))
            .expect("apply should succeed");
        engine
            .set_exposure(ExposureRequest::new(20, 200))
            .expect("apply should succeed");
        assert_eq!(
            sensor.exposures().iter().map(|r| r.gain).collect::<Vec<_>>(),
            vec![10, 20]
        );

        engine.set_streaming(true).expect("mode change should succeed");
        assert_eq!(engine.mode(), SyncMode::GainDelayOnly);
        engine
            .set_exposure(ExposureRequest::new(30, 300))
            .expect("apply should succeed");
        let last = sensor.exposures().last().cloned().expect("write recorded");
        assert_eq!(last.gain, 10, "history from immediate mode is reused");
        assert_eq!(last.integration_time, vec![300]);
    }

    #[test]
    fn test_flush_keeps_gain_history() {
        let (engine, sensor) = engine(&config(1, 2, true));
        engine.set_streaming(true).expect("mode change should succeed");
        engine
            .set_exposure(ExposureRequest::new(40, 400))
            .expect("enqueue should succeed");
        engine
            .advance_frame(Duration::ZERO)
            .expect("frame should apply");
        engine
            .set_exposure(ExposureRequest::new(70, 700))
            .expect("enqueue should succeed");
        assert_eq!(engine.flush_pending(), 1);
        assert_eq!(engine.pending(), 0);

        engine
            .set_exposure(ExposureRequest::new(80, 800))
            .expect("enqueue should succeed");
        engine
            .advance_frame(Duration::ZERO)
            .expect("frame should apply");
        let last = sensor.exposures().last().cloned().expect("write recorded");
        assert_eq!(last.gain, 40, "delay line still holds the pre-flush gain");
        assert_eq!(last.integration_time, vec![800]);
    }

    #[test]
    fn test_leaving_frame_sync_drains_in_order() {
        let (engine, sensor) = engine(&config(2, 2, true));
        engine.set_streaming(true).expect("mode change should succeed");
        engine
            .set_exposure(ExposureRequest::new(1, 1))
            .expect("enqueue should succeed");
        engine
            .set_exposure(ExposureRequest::new(2, 2))
            .expect("enqueue should succeed");
        engine.set_streaming(false).expect("mode change should succeed");
        assert_eq!(engine.mode(), SyncMode::Immediate);
        assert_eq!(
            sensor.exposures().iter().map(|r| r.gain).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    /// Sink that blocks inside the write of gain 1 until released.
    struct StallingSink {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        gains: Mutex<Vec<u32>>,
    }

    impl ExposureSink for StallingSink {
        fn apply_exposure(&self, request: &ExposureRequest) -> Result<()> {
            if request.gain == 1 {
                let _ = self.entered.lock().expect("lock should succeed").send(());
                let _ = self
                    .release
                    .lock()
                    .expect("lock should succeed")
                    .recv_timeout(Duration::from_secs(5));
            }
            self.gains.lock().expect("lock should succeed").push(request.gain);
            Ok(())
        }
    }

    #[test]
    fn test_drain_is_not_overtaken_by_immediate_write() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let sink = Arc::new(StallingSink {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            gains: Mutex::new(Vec::new()),
        });
        let engine = Arc::new(
            ExposureSyncEngine::new(&config(2, 2, true), Arc::clone(&sink) as Arc<dyn ExposureSink>)
                .expect("engine should build"),
        );
        engine.set_streaming(true).expect("mode change should succeed");
        for gain in [1, 2] {
            engine
                .set_exposure(ExposureRequest::new(gain, gain))
                .expect("enqueue should succeed");
        }

        let draining = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.set_streaming(false))
        };
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("drain should reach the sink");
        let late = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.set_exposure(ExposureRequest::new(3, 3)))
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).expect("release should send");

        draining
            .join()
            .expect("drain thread should join")
            .expect("drain should succeed");
        late.join()
            .expect("writer thread should join")
            .expect("write should succeed");
        assert_eq!(*sink.gains.lock().expect("lock should succeed"), vec![1, 2, 3]);
        assert_eq!(engine.last_request().map(|r| r.gain), Some(3));
    }

    #[test]
    fn test_bypass_writes_through() {
        let (engine, sensor) = engine(&config(2, 2, false));
        engine.set_streaming(true).expect("mode change should succeed");
        assert_eq!(engine.mode(), SyncMode::Bypass);
        engine
            .set_exposure(ExposureRequest::new(5, 6))
            .expect("apply should succeed");
        engine
            .advance_frame(Duration::ZERO)
            .expect("frame should be ignored");
        assert_eq!(sensor.exposures(), vec![ExposureRequest::new(5, 6)]);
        assert_eq!(engine.frames_advanced(), 1);
    }
}
