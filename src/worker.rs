//! Dedicated capture thread per pipeline.
//!
//! ```text
//! Stopped --Start--> Starting --ok--> Running --Stop--> Stopping --> Stopped
//!                        |                |
//!                        +--error---------+--fatal error--> Stopping --> Stopped
//! ```
//!
//! Commands arrive over a channel and are checked between acquisitions, so a
//! stop never interrupts a frame that is still held by the handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{CameraError, Result};
use crate::pipeline::{CapturedFrame, CapturePipeline};
use crate::traits::DeviceNode;

/// Lifecycle state of a capture worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Idle; waiting for `Start`.
    Stopped,
    /// Bringing the pipeline up.
    Starting,
    /// Acquiring frames.
    Running,
    /// Tearing the pipeline down.
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Shutdown,
}

/// Consumer of captured frames.
///
/// `data` is `None` when the backend cannot expose buffer memory. The buffer
/// is released once this returns.
pub trait FrameHandler: Send {
    /// Process one frame.
    fn on_frame(&mut self, frame: &CapturedFrame, data: Option<&[u8]>);
}

impl<F> FrameHandler for F
where
    F: FnMut(&CapturedFrame, Option<&[u8]>) + Send,
{
    fn on_frame(&mut self, frame: &CapturedFrame, data: Option<&[u8]>) {
        self(frame, data);
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<WorkerState>,
    error: Mutex<Option<CameraError>>,
    frames: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state() = state;
    }

    fn record_error(&self, err: CameraError) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }
}

/// Runs a [`CapturePipeline`] on its own thread.
#[derive(Debug)]
pub struct CaptureWorker<N: DeviceNode + 'static> {
    commands: Sender<Command>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<CapturePipeline<N>>>,
}

impl<N: DeviceNode + 'static> CaptureWorker<N> {
    /// Move `pipeline` onto a new thread. The worker starts `Stopped`.
    pub fn spawn<H>(name: &str, pipeline: CapturePipeline<N>, handler: H) -> Result<Self>
    where
        H: FrameHandler + 'static,
    {
        let (commands, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState::Stopped),
            error: Mutex::new(None),
            frames: AtomicU64::new(0),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(pipeline, &receiver, &thread_shared, handler))?;
        debug!(worker = name, "capture worker spawned");
        Ok(Self {
            commands,
            shared,
            thread: Some(thread),
        })
    }

    /// Ask the worker to start streaming.
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Ask the worker to stop streaming after the current frame.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        *self.shared.state()
    }

    /// Frames handed to the handler so far.
    pub fn frames(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    /// Take the error that last stopped the worker, if any.
    pub fn take_error(&self) -> Option<CameraError> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Poll until the worker reaches `state` or `timeout` elapses.
    pub fn wait_for(&self, state: WorkerState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == state {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop streaming, join the thread, and hand the pipeline back.
    pub fn shutdown(mut self) -> Result<CapturePipeline<N>> {
        // The thread may already be gone; join reports that.
        let _ = self.commands.send(Command::Shutdown);
        let thread = self.thread.take().ok_or_else(|| {
            CameraError::DeviceIo("capture worker already joined".to_owned())
        })?;
        thread
            .join()
            .map_err(|_| CameraError::DeviceIo("capture worker panicked".to_owned()))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CameraError::DeviceIo("capture worker has exited".to_owned()))
    }
}

impl<N: DeviceNode + 'static> Drop for CaptureWorker<N> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(Command::Shutdown);
            if thread.join().is_err() {
                error!("capture worker panicked");
            }
        }
    }
}

fn run<N, H>(
    mut pipeline: CapturePipeline<N>,
    commands: &Receiver<Command>,
    shared: &Shared,
    mut handler: H,
) -> CapturePipeline<N>
where
    N: DeviceNode,
    H: FrameHandler,
{
    loop {
        let state = *shared.state();
        let command = if state == WorkerState::Running {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Command::Shutdown),
            }
        } else {
            Some(commands.recv().unwrap_or(Command::Shutdown))
        };

        match command {
            Some(Command::Start) => {
                if state != WorkerState::Stopped {
                    continue;
                }
                shared.set_state(WorkerState::Starting);
                match pipeline.start() {
                    Ok(()) => {
                        shared.set_state(WorkerState::Running);
                        info!("capture worker running");
                    }
                    Err(err) => {
                        error!(%err, "capture worker failed to start");
                        shared.record_error(err);
                        pipeline.stop();
                        shared.set_state(WorkerState::Stopped);
                    }
                }
            }
            Some(Command::Stop) => {
                if state == WorkerState::Running {
                    halt(&mut pipeline, shared);
                }
            }
            Some(Command::Shutdown) => {
                if state == WorkerState::Running {
                    halt(&mut pipeline, shared);
                }
                debug!("capture worker exiting");
                return pipeline;
            }
            None => {
                if let Err(err) = capture_one(&mut pipeline, shared, &mut handler) {
                    if err.is_fatal() {
                        error!(%err, "capture worker stopping on fatal error");
                        shared.record_error(err);
                        halt(&mut pipeline, shared);
                    } else {
                        warn!(%err, "frame lost");
                    }
                }
            }
        }
    }
}

fn capture_one<N, H>(
    pipeline: &mut CapturePipeline<N>,
    shared: &Shared,
    handler: &mut H,
) -> Result<()>
where
    N: DeviceNode,
    H: FrameHandler,
{
    let frame = pipeline.acquire()?;
    let handled = pipeline.with_frame_data(&frame, |data| handler.on_frame(&frame, Some(data)));
    if handled.is_none() {
        handler.on_frame(&frame, None);
    }
    shared.frames.fetch_add(1, Ordering::Relaxed);
    pipeline.release(&frame)
}

fn halt<N: DeviceNode>(pipeline: &mut CapturePipeline<N>, shared: &Shared) {
    shared.set_state(WorkerState::Stopping);
    pipeline.stop();
    shared.set_state(WorkerState::Stopped);
    info!("capture worker stopped");
}
