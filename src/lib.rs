//! Dual-camera live compositing for a stereo streaming rig.
//!
//! Two cameras publish decoded frames and encoded H.264 packets into
//! [`camera_channel`] pairs. The [`pipeline::Pipeline`] fuses the two views
//! into one panorama per tick: side by side until a STITCH command locks a
//! feature-based homography, warped through it afterwards. A control
//! channel of percent-encoded JSON requests flips the presentation order,
//! triggers calibration, steps exposure and white balance on the devices,
//! and starts or stops recording of the raw camera bitstreams into
//! fragmented MP4 files.
//!
//! # Quick Start
//!
//! ```ignore
//! use duocam::{camera_channel, SessionBuilder, ENCODED_QUEUE_CAPACITY};
//! use tokio_util::sync::CancellationToken;
//!
//! let root = CancellationToken::new();
//! let (feed1, source1) = camera_channel(ENCODED_QUEUE_CAPACITY, root.child_token());
//! let (feed2, source2) = camera_channel(ENCODED_QUEUE_CAPACITY, root.child_token());
//! // hand feed1/feed2 to the capture backends...
//!
//! let mut session = SessionBuilder::new()
//!     .resolution(640, 480)
//!     .fps(30)
//!     .build_dual(source1, source2);
//!
//! loop {
//!     let frame = session.pipeline.tick().await;
//!     // encode and publish `frame`
//! }
//! ```
//!
//! Control requests are JSON objects with a `"type"` field, e.g.
//! `{"type": "TOGGLE"}`; [`run_control_channel`] answers each with exactly
//! one JSON reply over whatever transport carries the strings.

pub mod camera;
pub mod control;
pub mod fmp4;
pub mod pipeline;
pub mod record;
pub mod session;
pub mod stitcher;

pub use camera::{
    camera_channel, CameraCommand, CameraFeed, CameraSource, ControlSink, EncodedPacket, Frame,
    ENCODED_QUEUE_CAPACITY,
};
pub use control::{
    parse_request, run_control_channel, ChannelAction, Command, ControlError, ControlHandler,
    ControlOutcome, EXPOSURE_STEP_US, WHITE_BALANCE_STEP_K,
};
pub use fmp4::{Fmp4Writer, MICRO_TIMESCALE};
pub use pipeline::{Pipeline, PipelineSettings, ReadDiscipline};
pub use record::{RecordError, RecorderConfig, RecordingMuxer};
pub use session::{ControlSnapshot, Session, SessionBuilder, SessionContext, TuningConfig};
pub use stitcher::{HomographyStitcher, StitchConfig, StitchError};
