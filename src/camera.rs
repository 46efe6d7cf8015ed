//! Camera-facing types and the channel pair connecting a hardware feed to
//! the fusion pipeline.
//!
//! The hardware layer owns the producing side ([`CameraFeed`]); the session
//! owns the consuming side ([`CameraSource`]). Between them sit three lanes:
//! a single-slot latest-frame channel (newest frame wins), a bounded
//! encoded-bitstream queue that drops the oldest packet under pressure, and
//! an unbounded control-command channel back toward the device.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use image::RgbImage;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Default capacity of the encoded-bitstream queue, in packets.
pub const ENCODED_QUEUE_CAPACITY: usize = 30;

/// A decoded RGB frame with its device capture timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Raw RGB data (3 bytes per pixel, row-major).
    pub data: Vec<u8>,
    /// Capture time in microseconds, device clock domain.
    pub timestamp_us: u64,
}

impl Frame {
    /// Create a frame, validating the buffer size.
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp_us: u64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            anyhow::bail!(
                "frame buffer size mismatch: {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
            timestamp_us,
        })
    }

    /// Wrap an image buffer as a frame.
    pub fn from_image(image: RgbImage, timestamp_us: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
            timestamp_us,
        }
    }

    /// View the pixel data as an image buffer. `None` when the fields have
    /// been put into an inconsistent state.
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

/// An encoded bitstream packet as produced by the camera's hardware encoder.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Elementary-stream bytes, passed through unmodified.
    pub data: Bytes,
    /// Capture time in microseconds, device clock domain.
    pub timestamp_us: u64,
    /// Whether this packet starts with a keyframe.
    pub is_keyframe: bool,
}

/// Absolute-value tuning commands pushed to a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraCommand {
    /// Fix exposure time and sensitivity.
    ManualExposure { exposure_us: i64, iso: i64 },
    /// Fix white balance color temperature in kelvin.
    ManualWhiteBalance { kelvin: i64 },
}

/// Bounded packet queue shared between feed and source. The oldest packet
/// is dropped when a publish would exceed capacity, so a slow consumer
/// never stalls the producer.
#[derive(Debug)]
struct PacketRing {
    packets: VecDeque<EncodedPacket>,
    capacity: usize,
    dropped: u64,
}

impl PacketRing {
    fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    fn push(&mut self, packet: EncodedPacket) -> bool {
        let mut overflowed = false;
        if self.packets.len() == self.capacity {
            self.packets.pop_front();
            self.dropped += 1;
            overflowed = true;
        }
        self.packets.push_back(packet);
        overflowed
    }

    fn pop(&mut self) -> Option<EncodedPacket> {
        self.packets.pop_front()
    }
}

/// Cloneable handle for sending tuning commands to one camera.
#[derive(Debug, Clone)]
pub struct ControlSink {
    tx: mpsc::UnboundedSender<CameraCommand>,
    cancel: CancellationToken,
}

impl ControlSink {
    /// Send a command to the device. Silently ignored once the source is
    /// closed or the feed side is gone.
    pub fn send(&self, command: CameraCommand) {
        if self.cancel.is_cancelled() {
            tracing::debug!("control send after close ignored: {:?}", command);
            return;
        }
        if self.tx.send(command).is_err() {
            tracing::debug!("camera feed gone, dropping command: {:?}", command);
        }
    }
}

/// Producer half: the hardware layer publishes frames and packets here and
/// consumes tuning commands.
#[derive(Debug)]
pub struct CameraFeed {
    frames: watch::Sender<Option<Frame>>,
    encoded: Arc<Mutex<PacketRing>>,
    commands: mpsc::UnboundedReceiver<CameraCommand>,
    cancel: CancellationToken,
}

impl CameraFeed {
    /// Publish a decoded frame; overwrites any unconsumed previous frame.
    /// Ignored once the source has been closed.
    pub fn publish_frame(&self, frame: Frame) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.frames.send(Some(frame));
    }

    /// Publish an encoded packet, dropping the oldest queued packet when
    /// the queue is full.
    pub fn publish_encoded(&self, packet: EncodedPacket) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut ring = match self.encoded.lock() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.push(packet) {
            tracing::trace!(total_dropped = ring.dropped, "encoded queue full, dropped oldest packet");
        }
    }

    /// Receive the next tuning command. Returns `None` once the source is
    /// closed.
    pub async fn next_command(&mut self) -> Option<CameraCommand> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            cmd = self.commands.recv() => cmd,
        }
    }

    /// Non-blocking variant of [`Self::next_command`] for capture loops
    /// that service commands between frames.
    pub fn try_command(&mut self) -> Option<CameraCommand> {
        self.commands.try_recv().ok()
    }

    /// Token cancelled when the consuming side tears down; producer loops
    /// should exit when it fires.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Consumer half used by the fusion pipeline.
#[derive(Debug)]
pub struct CameraSource {
    frames: watch::Receiver<Option<Frame>>,
    encoded: Arc<Mutex<PacketRing>>,
    control: ControlSink,
    cancel: CancellationToken,
}

impl CameraSource {
    /// Non-blocking read of the newest frame. Returns `None` when no new
    /// frame has arrived since the previous call.
    pub fn try_latest(&mut self) -> Option<Frame> {
        match self.frames.has_changed() {
            Ok(true) => self.frames.borrow_and_update().clone(),
            _ => None,
        }
    }

    /// Wait for the next published frame. Returns `None` when the source
    /// is closed or the feed side has gone away.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            changed = self.frames.changed() => match changed {
                Ok(()) => self.frames.borrow_and_update().clone(),
                Err(_) => None,
            },
        }
    }

    /// Non-blocking read of the next pending encoded packet.
    pub fn try_encoded(&self) -> Option<EncodedPacket> {
        let mut ring = match self.encoded.lock() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.pop()
    }

    /// Handle for pushing tuning commands; cloneable, usable from other
    /// tasks.
    pub fn control_sink(&self) -> ControlSink {
        self.control.clone()
    }

    /// Tear the source down. Idempotent; afterwards reads yield nothing
    /// and control sends are ignored.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("camera source closed");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a connected feed/source pair. `cancel` governs the lifetime of
/// both halves; session teardown cancels it.
pub fn camera_channel(
    encoded_capacity: usize,
    cancel: CancellationToken,
) -> (CameraFeed, CameraSource) {
    let (frame_tx, frame_rx) = watch::channel(None);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let ring = Arc::new(Mutex::new(PacketRing::new(encoded_capacity)));

    let feed = CameraFeed {
        frames: frame_tx,
        encoded: Arc::clone(&ring),
        commands: cmd_rx,
        cancel: cancel.clone(),
    };
    let source = CameraSource {
        frames: frame_rx,
        encoded: ring,
        control: ControlSink {
            tx: cmd_tx,
            cancel: cancel.clone(),
        },
        cancel,
    };
    (feed, source)
}
