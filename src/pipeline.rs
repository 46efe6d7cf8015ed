//! Frame fusion: the per-tick loop that turns two camera feeds into one
//! outgoing panorama.
//!
//! Each tick reads the freshest frame from both cameras, applies the
//! session's ordering and translation flags, composites through the locked
//! homography (or side by side before calibration), and drains encoded
//! packets into the recorder. A tick never fails: a camera with no frames
//! yet contributes a placeholder view instead.

use std::sync::Arc;
use std::time::Instant;

use duocam_vision::{hconcat, translate};
use image::{Rgb, RgbImage};

use crate::camera::{CameraSource, Frame};
use crate::record::RecordingMuxer;
use crate::session::{ControlSnapshot, SessionContext};
use crate::stitcher::{HomographyStitcher, StitchConfig};

/// How a tick reads from a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadDiscipline {
    /// Take the newest frame if one arrived, else reuse the previous one.
    /// Ticks run at the output rate regardless of camera rates.
    #[default]
    Latest,
    /// Wait for the next frame from each camera; the cameras pace the
    /// output.
    NextBlocking,
}

/// Static knobs shared by both pipeline shapes.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Per-camera frame width in pixels.
    pub width: u32,
    /// Per-camera frame height in pixels.
    pub height: u32,
    pub discipline: ReadDiscipline,
    pub stitch: StitchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneState {
    /// Nothing read yet.
    Unknown,
    Live,
    /// No frame ever arrived; ticks substitute a placeholder.
    Degraded,
}

/// One camera plus its read-side cache.
#[derive(Debug)]
struct CameraLane {
    label: &'static str,
    source: CameraSource,
    last: Option<Frame>,
    state: LaneState,
}

impl CameraLane {
    fn new(label: &'static str, source: CameraSource) -> Self {
        Self {
            label,
            source,
            last: None,
            state: LaneState::Unknown,
        }
    }

    /// Refresh the cached frame per the read discipline and log state
    /// transitions. The cache keeps the last frame when nothing new is
    /// available, so a stalled camera freezes rather than blanks.
    async fn refresh(&mut self, discipline: ReadDiscipline) {
        let fresh = match discipline {
            ReadDiscipline::Latest => self.source.try_latest(),
            ReadDiscipline::NextBlocking => self.source.next_frame().await,
        };
        if let Some(frame) = fresh {
            if self.state != LaneState::Live {
                tracing::info!(camera = self.label, "camera feed live");
                self.state = LaneState::Live;
            }
            self.last = Some(frame);
        } else if self.last.is_none() && self.state != LaneState::Degraded {
            tracing::warn!(camera = self.label, "no frames yet, substituting placeholder");
            self.state = LaneState::Degraded;
        }
    }
}

/// Placeholder for a camera with no frames: black field with a centered
/// red box and a white bar across its middle.
fn placeholder_view(width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::new(width.max(1), height.max(1));
    let (w, h) = img.dimensions();
    let box_w = (w / 2).max(1);
    let box_h = (h / 2).max(1);
    let x0 = (w - box_w) / 2;
    let y0 = (h - box_h) / 2;
    for y in y0..y0 + box_h {
        for x in x0..x0 + box_w {
            img.put_pixel(x, y, Rgb([180, 20, 20]));
        }
    }
    let bar_h = (box_h / 5).max(1);
    let bar_y0 = (h - bar_h) / 2;
    for y in bar_y0..bar_y0 + bar_h {
        for x in x0..x0 + box_w {
            img.put_pixel(x, y, Rgb([235, 235, 235]));
        }
    }
    img
}

/// Two-camera pipeline producing a fused panorama per tick.
#[derive(Debug)]
pub struct FrameFusionPipeline {
    settings: PipelineSettings,
    session: Arc<SessionContext>,
    cam1: CameraLane,
    cam2: CameraLane,
    stitcher: Option<HomographyStitcher>,
    muxer: RecordingMuxer,
    started: Instant,
}

impl FrameFusionPipeline {
    pub fn new(
        settings: PipelineSettings,
        session: Arc<SessionContext>,
        cam1: CameraSource,
        cam2: CameraSource,
        muxer: RecordingMuxer,
    ) -> Self {
        Self {
            settings,
            session,
            cam1: CameraLane::new("cam1", cam1),
            cam2: CameraLane::new("cam2", cam2),
            stitcher: None,
            muxer,
            started: Instant::now(),
        }
    }

    /// Produce the next outgoing frame. The canvas is always two camera
    /// widths wide and one camera height tall.
    pub async fn tick(&mut self) -> Frame {
        let snap = self.session.snapshot();

        // read in presentation order so the blocking discipline waits on
        // the primary camera first
        if snap.order_swapped {
            self.cam2.refresh(self.settings.discipline).await;
            self.cam1.refresh(self.settings.discipline).await;
        } else {
            self.cam1.refresh(self.settings.discipline).await;
            self.cam2.refresh(self.settings.discipline).await;
        }

        self.sync_recording(&snap);

        let (primary_lane, secondary_lane) = if snap.order_swapped {
            (&self.cam2, &self.cam1)
        } else {
            (&self.cam1, &self.cam2)
        };

        let timestamp_us = primary_lane
            .last
            .as_ref()
            .map(|f| f.timestamp_us)
            .unwrap_or_else(|| self.started.elapsed().as_micros() as u64);

        let primary_real = primary_lane.last.as_ref().and_then(Frame::to_image);
        let secondary_real = secondary_lane.last.as_ref().and_then(Frame::to_image);
        let has_both = primary_real.is_some() && secondary_real.is_some();

        let primary = primary_real
            .unwrap_or_else(|| placeholder_view(self.settings.width, self.settings.height));
        let mut secondary = secondary_real
            .unwrap_or_else(|| placeholder_view(self.settings.width, self.settings.height));

        if has_both && (snap.translate_x, snap.translate_y) != (0, 0) {
            secondary = translate(&secondary, snap.translate_x, snap.translate_y);
        }

        if self.session.take_stitch_request() {
            if has_both {
                match HomographyStitcher::build(&secondary, &primary, &self.settings.stitch) {
                    Ok(stitcher) => {
                        tracing::info!("stitcher calibrated");
                        self.stitcher = Some(stitcher);
                    }
                    Err(e) => {
                        tracing::warn!("stitch calibration failed, keeping previous mapping: {e}");
                    }
                }
            } else {
                // leave the request latched until both views are real
                self.session.request_stitch();
            }
        }

        let composite = match &self.stitcher {
            Some(stitcher) => match stitcher.warp(&secondary, &primary) {
                Ok(canvas) => canvas,
                Err(e) => {
                    tracing::warn!("warp failed, falling back to side-by-side: {e}");
                    hconcat(&primary, &secondary)
                }
            },
            None => hconcat(&primary, &secondary),
        };

        Frame::from_image(composite, timestamp_us)
    }

    /// Align the recorder with the session flag and drain pending encoded
    /// packets. Stream slots follow the primary/secondary assignment, so a
    /// TOGGLE also swaps which file each camera's packets land in.
    fn sync_recording(&mut self, snap: &ControlSnapshot) {
        self.muxer.set_enabled(snap.recording);
        if !self.muxer.is_enabled() {
            return;
        }
        let (primary, secondary) = if snap.order_swapped {
            (&self.cam2, &self.cam1)
        } else {
            (&self.cam1, &self.cam2)
        };
        for (stream, lane) in [(0usize, primary), (1usize, secondary)] {
            while let Some(packet) = lane.source.try_encoded() {
                if let Err(e) = self.muxer.push(stream, &packet) {
                    tracing::error!(stream, "recording write failed, stopping take: {e}");
                    self.session.set_recording(false);
                    self.muxer.set_enabled(false);
                    return;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.muxer.set_enabled(false);
        self.cam1.source.close();
        self.cam2.source.close();
    }
}

/// Single-camera pipeline passing frames straight through.
#[derive(Debug)]
pub struct PassthroughPipeline {
    settings: PipelineSettings,
    session: Arc<SessionContext>,
    cam: CameraLane,
    muxer: RecordingMuxer,
    started: Instant,
}

impl PassthroughPipeline {
    pub fn new(
        settings: PipelineSettings,
        session: Arc<SessionContext>,
        cam: CameraSource,
        muxer: RecordingMuxer,
    ) -> Self {
        Self {
            settings,
            session,
            cam: CameraLane::new("cam1", cam),
            muxer,
            started: Instant::now(),
        }
    }

    pub async fn tick(&mut self) -> Frame {
        let snap = self.session.snapshot();
        self.cam.refresh(self.settings.discipline).await;

        self.muxer.set_enabled(snap.recording);
        if self.muxer.is_enabled() {
            while let Some(packet) = self.cam.source.try_encoded() {
                if let Err(e) = self.muxer.push(0, &packet) {
                    tracing::error!("recording write failed, stopping take: {e}");
                    self.session.set_recording(false);
                    self.muxer.set_enabled(false);
                    break;
                }
            }
        }

        if self.session.take_stitch_request() {
            tracing::debug!("stitch request ignored without a second camera");
        }

        match self.cam.last.clone() {
            Some(frame) => frame,
            None => Frame::from_image(
                placeholder_view(self.settings.width, self.settings.height),
                self.started.elapsed().as_micros() as u64,
            ),
        }
    }

    fn shutdown(&mut self) {
        self.muxer.set_enabled(false);
        self.cam.source.close();
    }
}

/// Either pipeline shape behind one tick interface.
#[derive(Debug)]
pub enum Pipeline {
    Single(PassthroughPipeline),
    Dual(FrameFusionPipeline),
}

impl Pipeline {
    pub fn dual(
        settings: PipelineSettings,
        session: Arc<SessionContext>,
        cam1: CameraSource,
        cam2: CameraSource,
        muxer: RecordingMuxer,
    ) -> Self {
        Self::Dual(FrameFusionPipeline::new(settings, session, cam1, cam2, muxer))
    }

    pub fn single(
        settings: PipelineSettings,
        session: Arc<SessionContext>,
        cam: CameraSource,
        muxer: RecordingMuxer,
    ) -> Self {
        Self::Single(PassthroughPipeline::new(settings, session, cam, muxer))
    }

    /// Produce the next outgoing frame. Never fails.
    pub async fn tick(&mut self) -> Frame {
        match self {
            Self::Single(p) => p.tick().await,
            Self::Dual(p) => p.tick().await,
        }
    }

    /// Stop recording (flushing open files) and close the camera sources.
    pub fn shutdown(&mut self) {
        match self {
            Self::Single(p) => p.shutdown(),
            Self::Dual(p) => p.shutdown(),
        }
    }
}
