//! Background decode loop with cooperative cancellation.
//!
//! [`StreamDecoder`] owns one OS thread per session. The thread drives a
//! [`VideoPipeline`] and hands each converted picture to the frame
//! callback as a borrowed [`DecodedFrame`].
//!
//! Shutdown is never forced. `stop()` clears the running flag, wakes a
//! paused loop through the condition variable, fires the pipeline's
//! interrupter to unblock a pending read, and joins the thread.
//!
//! ```text
//! Idle ──► Opening ──► Streaming ──► Stopping ──► Stopped
//!             │                                     ▲
//!             └──────────── open failure ───────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::DecodeError;
use crate::video::pipeline::{Interrupter, PipelineFactory, ReadStatus, VideoPipeline};
use crate::video::types::{DecodedFrame, RgbBuffer, StreamSession};

/// Frame intervals kept for the fps average.
const FPS_WINDOW: usize = 60;

// ── DecoderState ─────────────────────────────────────────────────

/// Lifecycle of the current (or last) decode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderState {
    Idle,
    Opening,
    Streaming,
    Stopping,
    Stopped,
}

impl std::fmt::Display for DecoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Streaming => "streaming",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ── FrameStats ───────────────────────────────────────────────────

/// Per-session frame statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Current smoothed frames per second.
    pub fps: f64,
    /// Frames delivered since the session started.
    pub total_frames: u64,
    /// Converted bytes read from the pipeline.
    pub total_bytes: u64,
    /// Last frame width.
    pub width: u32,
    /// Last frame height.
    pub height: u32,
}

/// Rolling average over the last [`FPS_WINDOW`] frame intervals.
struct FpsMeter {
    samples: VecDeque<Duration>,
    last: Option<Instant>,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(FPS_WINDOW),
            last: None,
        }
    }

    fn tick(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last.replace(now) {
            self.samples.push_back(now.saturating_duration_since(last));
            if self.samples.len() > FPS_WINDOW {
                self.samples.pop_front();
            }
        }
        if self.samples.is_empty() {
            return 0.0;
        }
        let avg_secs = self.samples.iter().map(Duration::as_secs_f64).sum::<f64>()
            / self.samples.len() as f64;
        if avg_secs > 0.0 { 1.0 / avg_secs } else { 0.0 }
    }
}

// ── Shared state ─────────────────────────────────────────────────

type FrameCallback = Box<dyn FnMut(&DecodedFrame<'_>) + Send>;
type ErrorCallback = Box<dyn FnMut(&DecodeError) + Send>;

struct Control {
    state: DecoderState,
    paused: bool,
}

/// State shared between the owner and the decode thread.
struct Shared {
    /// Cleared by `stop()` or when the loop exits on its own.
    running: AtomicBool,
    control: Mutex<Control>,
    wake: Condvar,
    interrupter: Mutex<Option<Interrupter>>,
    on_frame: Mutex<Option<FrameCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    stats: Mutex<FrameStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            control: Mutex::new(Control {
                state: DecoderState::Idle,
                paused: false,
            }),
            wake: Condvar::new(),
            interrupter: Mutex::new(None),
            on_frame: Mutex::new(None),
            on_error: Mutex::new(None),
            stats: Mutex::new(FrameStats::default()),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: DecoderState) {
        lock(&self.control).state = state;
    }

    /// Move from `Opening` to `Streaming` unless a stop got there first.
    fn begin_streaming(&self) -> bool {
        let mut control = lock(&self.control);
        if control.state == DecoderState::Opening && self.is_running() {
            control.state = DecoderState::Streaming;
            true
        } else {
            false
        }
    }

    /// Park while paused. Returns whether the loop should continue.
    fn wait_while_paused(&self) -> bool {
        let mut control = lock(&self.control);
        while control.paused && self.is_running() {
            control = match self.wake.wait(control) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        self.is_running()
    }

    fn emit_frame(&self, frame: &DecodedFrame<'_>) {
        if let Some(cb) = lock(&self.on_frame).as_mut() {
            cb(frame);
        }
    }

    fn report_error(&self, err: &DecodeError) {
        if let Some(cb) = lock(&self.on_error).as_mut() {
            cb(err);
        }
    }
}

// ── StreamDecoder ────────────────────────────────────────────────

/// Decodes one RTMP/RTSP stream at a time on a dedicated thread.
pub struct StreamDecoder {
    factory: Arc<dyn PipelineFactory>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl StreamDecoder {
    pub fn new(factory: impl PipelineFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            shared: Arc::new(Shared::new()),
            worker: None,
        }
    }

    /// Register the frame observer. The frame is only valid during the call.
    pub fn on_frame(&self, callback: impl FnMut(&DecodedFrame<'_>) + Send + 'static) {
        *lock(&self.shared.on_frame) = Some(Box::new(callback));
    }

    /// Register the error observer. Called at most once per session.
    pub fn on_error(&self, callback: impl FnMut(&DecodeError) + Send + 'static) {
        *lock(&self.shared.on_error) = Some(Box::new(callback));
    }

    /// Begin decoding `session`. No-op while a session is running.
    pub fn start(&mut self, session: StreamSession) {
        if self.is_running() {
            debug!("decoder already running, ignoring start for {}", session.url);
            return;
        }
        // Reap a session that ended on its own.
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("previous decode thread panicked");
            }
        }

        self.shared.running.store(true, Ordering::SeqCst);
        {
            let mut control = lock(&self.shared.control);
            control.state = DecoderState::Opening;
            control.paused = false;
        }
        *lock(&self.shared.stats) = FrameStats::default();

        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);
        let spawned = thread::Builder::new()
            .name("opcon-decode".into())
            .spawn(move || run_session(&shared, factory.as_ref(), &session));

        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_state(DecoderState::Stopped);
                let err = DecodeError::OpenFailed(format!("failed to spawn decode thread: {e}"));
                error!("{err}");
                self.shared.report_error(&err);
            }
        }
    }

    /// Request shutdown and join the decode thread.
    ///
    /// Safe before `start`, after the thread already exited, and when
    /// called repeatedly.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut control = lock(&self.shared.control);
            if matches!(control.state, DecoderState::Opening | DecoderState::Streaming) {
                control.state = DecoderState::Stopping;
            }
            control.paused = false;
        }
        self.shared.wake.notify_all();

        let interrupter = lock(&self.shared.interrupter).clone();
        if let Some(interrupt) = interrupter {
            interrupt();
        }

        if handle.join().is_err() {
            warn!("decode thread panicked");
        }
        self.shared.set_state(DecoderState::Stopped);
        info!("decoder stopped");
    }

    /// Park the decode loop without closing the stream.
    pub fn pause(&self) {
        let mut control = lock(&self.shared.control);
        if control.state == DecoderState::Streaming || control.state == DecoderState::Opening {
            control.paused = true;
        }
    }

    pub fn resume(&self) {
        lock(&self.shared.control).paused = false;
        self.shared.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.control).paused
    }

    /// Whether a session thread is alive and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.shared.is_running()
    }

    pub fn state(&self) -> DecoderState {
        lock(&self.shared.control).state
    }

    pub fn stats(&self) -> FrameStats {
        lock(&self.shared.stats).clone()
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Decode thread ────────────────────────────────────────────────

fn run_session(shared: &Shared, factory: &dyn PipelineFactory, session: &StreamSession) {
    let mut pipeline = factory.create(session);
    *lock(&shared.interrupter) = pipeline.interrupter();

    // A stop that raced the interrupter install is seen here.
    let result = if shared.is_running() {
        stream(shared, pipeline.as_mut(), session)
    } else {
        Ok(())
    };

    if result.is_err() {
        shared.set_state(DecoderState::Stopping);
    }
    pipeline.release();
    *lock(&shared.interrupter) = None;

    if let Err(err) = result {
        if shared.is_running() {
            error!("decode session for {} failed: {err}", session.url);
            shared.report_error(&err);
        } else {
            debug!("ignoring error after stop request: {err}");
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.set_state(DecoderState::Stopped);
}

fn stream(
    shared: &Shared,
    pipeline: &mut dyn VideoPipeline,
    session: &StreamSession,
) -> Result<(), DecodeError> {
    info!("opening {}", session.url);
    let geometry = pipeline.open(session)?;
    let mut buffer = RgbBuffer::allocate(geometry.width, geometry.height).ok_or_else(|| {
        DecodeError::ConvertInitFailed(format!(
            "no RGB buffer for {}x{}",
            geometry.width, geometry.height
        ))
    })?;

    if !shared.begin_streaming() {
        return Ok(());
    }
    info!(
        "streaming {} {}x{} from {}",
        geometry.codec, geometry.width, geometry.height, session.url
    );

    let mut sequence: u64 = 0;
    let mut meter = FpsMeter::new();

    while shared.wait_while_paused() {
        let unit = match pipeline.read_unit()? {
            ReadStatus::Unit(unit) => unit,
            ReadStatus::WouldBlock => {
                thread::yield_now();
                continue;
            }
            ReadStatus::EndOfStream => {
                info!("end of stream on {}", session.url);
                break;
            }
        };
        if unit.stream_index != geometry.stream_index {
            continue;
        }

        let unit_bytes = unit.data.len() as u64;
        let mut emit = |picture: &RgbBuffer| {
            let fps = meter.tick(Instant::now());
            {
                let mut stats = lock(&shared.stats);
                stats.fps = fps;
                stats.total_frames += 1;
                stats.total_bytes += unit_bytes;
                stats.width = picture.width();
                stats.height = picture.height();
            }
            shared.emit_frame(&picture.frame(sequence));
            sequence += 1;
        };
        pipeline.decode_unit(unit, &mut buffer, &mut emit)?;
    }

    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
