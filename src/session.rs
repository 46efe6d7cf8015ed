//! Session state shared between the control channel and the fusion
//! pipeline, plus the builder that wires a session together.
//!
//! All cross-task flags live behind one coarse mutex; every operation on
//! it is a short lock-mutate-unlock, so contention between the control
//! task and the output tick stays invisible at video rates.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::camera::CameraSource;
use crate::control::ControlHandler;
use crate::pipeline::{Pipeline, PipelineSettings, ReadDiscipline};
use crate::record::{RecorderConfig, RecordingMuxer};
use crate::stitcher::StitchConfig;

/// Initial tuning values and optional hard limits for the step commands.
#[derive(Debug, Clone)]
pub struct TuningConfig {
    pub exposure_us: i64,
    pub iso: i64,
    pub white_balance_k: i64,
    /// When set, exposure steps clamp into this range.
    pub exposure_range_us: Option<RangeInclusive<i64>>,
    /// When set, white balance steps clamp into this range.
    pub white_balance_range_k: Option<RangeInclusive<i64>>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            exposure_us: 20_000,
            iso: 800,
            white_balance_k: 4_000,
            exposure_range_us: None,
            white_balance_range_k: None,
        }
    }
}

/// Mutable session flags, guarded by the context mutex.
#[derive(Debug)]
struct ControlState {
    order_swapped: bool,
    stitch_requested: bool,
    translate_x: i32,
    translate_y: i32,
    recording: bool,
    exposure_us: i64,
    iso: i64,
    white_balance_k: i64,
}

/// Point-in-time copy of the flags the pipeline reads each tick.
#[derive(Debug, Clone, Copy)]
pub struct ControlSnapshot {
    pub order_swapped: bool,
    pub translate_x: i32,
    pub translate_y: i32,
    pub recording: bool,
}

/// Shared session state handle.
#[derive(Debug)]
pub struct SessionContext {
    state: Mutex<ControlState>,
    exposure_range_us: Option<RangeInclusive<i64>>,
    white_balance_range_k: Option<RangeInclusive<i64>>,
    allow_host_shutdown: bool,
    cancel: CancellationToken,
}

fn clamp_to(value: i64, range: &Option<RangeInclusive<i64>>) -> i64 {
    match range {
        Some(r) => value.clamp(*r.start(), *r.end()),
        None => value,
    }
}

impl SessionContext {
    pub fn new(tuning: TuningConfig, allow_host_shutdown: bool, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(ControlState {
                order_swapped: false,
                stitch_requested: false,
                translate_x: 0,
                translate_y: 0,
                recording: false,
                exposure_us: tuning.exposure_us,
                iso: tuning.iso,
                white_balance_k: tuning.white_balance_k,
            }),
            exposure_range_us: tuning.exposure_range_us,
            white_balance_range_k: tuning.white_balance_range_k,
            allow_host_shutdown,
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Flip which camera is treated as primary. Returns the new value.
    pub fn toggle_order(&self) -> bool {
        let mut s = self.lock();
        s.order_swapped = !s.order_swapped;
        s.order_swapped
    }

    pub fn order_swapped(&self) -> bool {
        self.lock().order_swapped
    }

    /// Ask the pipeline to (re)calibrate on its next tick. Latched until
    /// consumed.
    pub fn request_stitch(&self) {
        self.lock().stitch_requested = true;
    }

    /// Consume a pending stitch request, if any.
    pub fn take_stitch_request(&self) -> bool {
        std::mem::take(&mut self.lock().stitch_requested)
    }

    /// Pixel offset applied to the secondary view before fusion.
    pub fn set_translation(&self, x: i32, y: i32) {
        let mut s = self.lock();
        s.translate_x = x;
        s.translate_y = y;
    }

    pub fn set_recording(&self, on: bool) {
        let mut s = self.lock();
        if s.recording != on {
            s.recording = on;
            tracing::info!(recording = on, "recording flag changed");
        }
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let s = self.lock();
        ControlSnapshot {
            order_swapped: s.order_swapped,
            translate_x: s.translate_x,
            translate_y: s.translate_y,
            recording: s.recording,
        }
    }

    /// Step the stored exposure, clamped to the configured range. ISO is
    /// reported alongside but never stepped. Returns the new pair.
    pub fn adjust_exposure(&self, delta_us: i64) -> (i64, i64) {
        let mut s = self.lock();
        s.exposure_us = clamp_to(s.exposure_us + delta_us, &self.exposure_range_us);
        (s.exposure_us, s.iso)
    }

    /// Step the stored white balance, clamped. Returns the new value.
    pub fn adjust_white_balance(&self, delta_k: i64) -> i64 {
        let mut s = self.lock();
        s.white_balance_k = clamp_to(s.white_balance_k + delta_k, &self.white_balance_range_k);
        s.white_balance_k
    }

    pub fn exposure(&self) -> (i64, i64) {
        let s = self.lock();
        (s.exposure_us, s.iso)
    }

    pub fn white_balance(&self) -> i64 {
        self.lock().white_balance_k
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the session. Idempotent; camera sources and tasks built on
    /// child tokens observe it.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("session closing");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Power the host down, if the session was configured to allow it.
    /// The reply to the client is sent regardless of what happens here.
    pub fn request_host_shutdown(&self) {
        if !self.allow_host_shutdown {
            tracing::warn!("host shutdown requested but not permitted by configuration");
            return;
        }
        #[cfg(unix)]
        match std::process::Command::new("shutdown").args(["-h", "now"]).spawn() {
            Ok(_) => tracing::info!("host shutdown initiated"),
            Err(e) => tracing::error!("failed to invoke shutdown: {e}"),
        }
        #[cfg(not(unix))]
        tracing::warn!("host shutdown is only supported on unix hosts");
    }
}

/// A wired session: shared context, the frame pipeline, and the command
/// handler for its control channel.
pub struct Session {
    pub context: Arc<SessionContext>,
    pub pipeline: Pipeline,
    pub handler: ControlHandler,
}

/// Builder for [`Session`]. Defaults give a 640x480 at 30 fps dual rig
/// with recording under `recordings/` and host shutdown disabled.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    width: u32,
    height: u32,
    fps: u32,
    translate_x: i32,
    translate_y: i32,
    read_discipline: ReadDiscipline,
    stitch: StitchConfig,
    record_directory: PathBuf,
    tuning: TuningConfig,
    allow_host_shutdown: bool,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            translate_x: 0,
            translate_y: 0,
            read_discipline: ReadDiscipline::Latest,
            stitch: StitchConfig::default(),
            record_directory: PathBuf::from("recordings"),
            tuning: TuningConfig::default(),
            allow_host_shutdown: false,
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-camera frame dimensions.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps.max(1);
        self
    }

    /// Initial pixel offset applied to the secondary view.
    pub fn translation(mut self, x: i32, y: i32) -> Self {
        self.translate_x = x;
        self.translate_y = y;
        self
    }

    pub fn read_discipline(mut self, discipline: ReadDiscipline) -> Self {
        self.read_discipline = discipline;
        self
    }

    pub fn stitch_config(mut self, stitch: StitchConfig) -> Self {
        self.stitch = stitch;
        self
    }

    pub fn record_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.record_directory = directory.into();
        self
    }

    pub fn tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    /// Permit the SHUTDOWN command to actually power the host down.
    pub fn allow_host_shutdown(mut self, allow: bool) -> Self {
        self.allow_host_shutdown = allow;
        self
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            width: self.width,
            height: self.height,
            discipline: self.read_discipline,
            stitch: self.stitch.clone(),
        }
    }

    fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            directory: self.record_directory.clone(),
            width: self.width,
            height: self.height,
            nominal_frame_duration_us: (1_000_000 / self.fps).max(1),
        }
    }

    fn context(&self) -> Arc<SessionContext> {
        let context = Arc::new(SessionContext::new(
            self.tuning.clone(),
            self.allow_host_shutdown,
            CancellationToken::new(),
        ));
        context.set_translation(self.translate_x, self.translate_y);
        context
    }

    /// Wire a two-camera fusion session.
    pub fn build_dual(self, cam1: CameraSource, cam2: CameraSource) -> Session {
        let context = self.context();
        let handler = ControlHandler::new(
            Arc::clone(&context),
            vec![cam1.control_sink(), cam2.control_sink()],
        );
        let muxer = RecordingMuxer::new(self.recorder_config(), 2);
        let pipeline = Pipeline::dual(self.settings(), Arc::clone(&context), cam1, cam2, muxer);
        Session {
            context,
            pipeline,
            handler,
        }
    }

    /// Wire a single-camera pass-through session.
    pub fn build_single(self, cam: CameraSource) -> Session {
        let context = self.context();
        let handler = ControlHandler::new(Arc::clone(&context), vec![cam.control_sink()]);
        let muxer = RecordingMuxer::new(self.recorder_config(), 1);
        let pipeline = Pipeline::single(self.settings(), Arc::clone(&context), cam, muxer);
        Session {
            context,
            pipeline,
            handler,
        }
    }
}
