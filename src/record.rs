//! Recording of camera bitstreams to disk, one fragmented MP4 file per
//! stream per recording take.
//!
//! Each stream keeps its own timestamp epoch: the device timestamp of the
//! first packet pushed after recording is enabled becomes the base, and
//! every container timestamp is the offset from that base plus one. The
//! two streams never share a clock. Stopping flushes and closes the files;
//! starting again opens fresh files with fresh epochs.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::camera::EncodedPacket;
use crate::fmp4::{find_parameter_sets, Fmp4Writer};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("container write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings shared by all recorded streams.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Directory receiving the .mp4 files; created on demand.
    pub directory: PathBuf,
    /// Track dimensions written into the container headers.
    pub width: u32,
    pub height: u32,
    /// Duration assigned to the first packet of each file, microseconds.
    pub nominal_frame_duration_us: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recordings"),
            width: 640,
            height: 480,
            nominal_frame_duration_us: 33_333,
        }
    }
}

/// Per-stream state: timestamp epoch, container writer and file sink.
#[derive(Debug)]
struct StreamRecorder {
    /// 1-based camera number used in file names.
    index: usize,
    base_us: Option<u64>,
    writer: Option<Fmp4Writer>,
    sink: Option<File>,
    path: Option<PathBuf>,
    packets_written: u64,
    skipped: u64,
}

impl StreamRecorder {
    fn new(index: usize) -> Self {
        Self {
            index,
            base_us: None,
            writer: None,
            sink: None,
            path: None,
            packets_written: 0,
            skipped: 0,
        }
    }

    fn push(
        &mut self,
        packet: &EncodedPacket,
        config: &RecorderConfig,
        take: u32,
    ) -> Result<Option<u64>, RecordError> {
        // the epoch anchors on the first packet seen after enable, whether
        // or not that packet is writable yet
        let base = *self.base_us.get_or_insert(packet.timestamp_us);
        let pts = packet.timestamp_us.saturating_sub(base) + 1;

        if self.writer.is_none() {
            // the file cannot start before SPS/PPS arrive (they ride along
            // with keyframes)
            let Some((sps, pps)) = find_parameter_sets(&packet.data) else {
                self.skipped += 1;
                return Ok(None);
            };

            std::fs::create_dir_all(&config.directory)?;
            let epoch_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let path = config
                .directory
                .join(format!("cam{}_{}_{}.mp4", self.index, epoch_secs, take));
            let mut file = File::create(&path)?;

            let writer = Fmp4Writer::new(
                sps,
                pps,
                config.width,
                config.height,
                config.nominal_frame_duration_us,
            );
            file.write_all(&writer.init_segment())?;

            tracing::info!(
                stream = self.index,
                path = %path.display(),
                skipped = self.skipped,
                "recording file opened"
            );
            self.writer = Some(writer);
            self.sink = Some(file);
            self.path = Some(path);
        }

        let Some(writer) = self.writer.as_mut() else {
            return Ok(None);
        };
        let Some(sink) = self.sink.as_mut() else {
            return Ok(None);
        };

        let fragment = writer.fragment(&packet.data, pts, packet.is_keyframe);
        sink.write_all(&fragment)?;
        self.packets_written += 1;
        Ok(Some(pts))
    }

    fn finish(&mut self) {
        if let Some(mut file) = self.sink.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(stream = self.index, "flush on close failed: {e}");
            }
        }
        if self.packets_written > 0 {
            if let Some(path) = &self.path {
                tracing::info!(
                    stream = self.index,
                    path = %path.display(),
                    packets = self.packets_written,
                    "recording file closed"
                );
            }
        }
        self.writer = None;
        self.base_us = None;
        self.path = None;
        self.packets_written = 0;
        self.skipped = 0;
    }
}

/// Multi-stream recorder. Disabled by default; [`RecordingMuxer::push`] is
/// a no-op until enabled.
#[derive(Debug)]
pub struct RecordingMuxer {
    config: RecorderConfig,
    streams: Vec<StreamRecorder>,
    take: u32,
    enabled: bool,
}

impl RecordingMuxer {
    pub fn new(config: RecorderConfig, stream_count: usize) -> Self {
        let streams = (1..=stream_count).map(StreamRecorder::new).collect();
        Self {
            config,
            streams,
            take: 0,
            enabled: false,
        }
    }

    /// Turn recording on or off. Turning off flushes and closes all open
    /// files; turning on starts a fresh take with fresh epochs.
    pub fn set_enabled(&mut self, on: bool) {
        if on == self.enabled {
            return;
        }
        if on {
            self.take += 1;
            self.enabled = true;
            tracing::info!(take = self.take, "recording enabled");
        } else {
            self.enabled = false;
            for stream in &mut self.streams {
                stream.finish();
            }
            tracing::info!(take = self.take, "recording stopped");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append one packet to a stream (0-based). Returns the container
    /// timestamp the packet was written at, or `None` when the packet was
    /// not written (recording off, or still waiting for parameter sets).
    pub fn push(
        &mut self,
        stream: usize,
        packet: &EncodedPacket,
    ) -> Result<Option<u64>, RecordError> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(recorder) = self.streams.get_mut(stream) else {
            tracing::warn!(stream, "push to unknown stream ignored");
            return Ok(None);
        };
        recorder.push(packet, &self.config, self.take)
    }

    pub fn packets_written(&self, stream: usize) -> u64 {
        self.streams.get(stream).map_or(0, |s| s.packets_written)
    }
}

impl Drop for RecordingMuxer {
    fn drop(&mut self) {
        self.set_enabled(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SPS: [u8; 8] = [0x67, 0x42, 0xc0, 0x1e, 0x8c, 0x68, 0x05, 0x01];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];
    const IDR: [u8; 6] = [0x65, 0x88, 0x84, 0x21, 0xa0, 0x3f];
    const SLICE: [u8; 5] = [0x41, 0x9a, 0x02, 0x05, 0xff];

    fn annex_b(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }

    fn keyframe_packet(ts: u64) -> EncodedPacket {
        EncodedPacket {
            data: Bytes::from(annex_b(&[&SPS[..], &PPS[..], &IDR[..]])),
            timestamp_us: ts,
            is_keyframe: true,
        }
    }

    fn delta_packet(ts: u64) -> EncodedPacket {
        EncodedPacket {
            data: Bytes::from(annex_b(&[&SLICE[..]])),
            timestamp_us: ts,
            is_keyframe: false,
        }
    }

    fn test_config(tag: &str) -> RecorderConfig {
        let directory = std::env::temp_dir().join(format!(
            "duocam-record-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&directory);
        RecorderConfig {
            directory,
            ..RecorderConfig::default()
        }
    }

    fn mp4_count(config: &RecorderConfig) -> usize {
        match std::fs::read_dir(&config.directory) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn test_container_timestamps_start_at_one() {
        let config = test_config("pts");
        let mut muxer = RecordingMuxer::new(config.clone(), 1);
        muxer.set_enabled(true);

        let pts0 = muxer.push(0, &keyframe_packet(5_000_000)).unwrap();
        let pts1 = muxer.push(0, &delta_packet(5_033_000)).unwrap();
        let pts2 = muxer.push(0, &delta_packet(5_066_000)).unwrap();

        assert_eq!(pts0, Some(1));
        assert_eq!(pts1, Some(33_001));
        assert_eq!(pts2, Some(66_001));
        assert_eq!(muxer.packets_written(0), 3);
    }

    #[test]
    fn test_streams_keep_independent_epochs() {
        let config = test_config("epochs");
        let mut muxer = RecordingMuxer::new(config, 2);
        muxer.set_enabled(true);

        // wildly different device clocks, both files start at 1
        assert_eq!(muxer.push(0, &keyframe_packet(1_000_000)).unwrap(), Some(1));
        assert_eq!(muxer.push(1, &keyframe_packet(9_000_000)).unwrap(), Some(1));
        assert_eq!(
            muxer.push(1, &delta_packet(9_040_000)).unwrap(),
            Some(40_001)
        );
    }

    #[test]
    fn test_restart_opens_new_files_with_new_epoch() {
        let config = test_config("restart");
        let mut muxer = RecordingMuxer::new(config.clone(), 1);

        muxer.set_enabled(true);
        assert_eq!(muxer.push(0, &keyframe_packet(100)).unwrap(), Some(1));
        muxer.set_enabled(false);
        assert_eq!(muxer.packets_written(0), 0);

        muxer.set_enabled(true);
        assert_eq!(muxer.push(0, &keyframe_packet(777_000)).unwrap(), Some(1));
        muxer.set_enabled(false);

        assert_eq!(mp4_count(&config), 2);
    }

    #[test]
    fn test_epoch_anchors_on_first_push_even_if_skipped() {
        let config = test_config("anchor");
        let mut muxer = RecordingMuxer::new(config, 1);
        muxer.set_enabled(true);

        // no parameter sets yet: skipped, but the epoch is set
        assert_eq!(muxer.push(0, &delta_packet(150_000)).unwrap(), None);
        assert_eq!(
            muxer.push(0, &keyframe_packet(200_000)).unwrap(),
            Some(50_001)
        );
    }

    #[test]
    fn test_push_while_disabled_is_ignored() {
        let config = test_config("disabled");
        let mut muxer = RecordingMuxer::new(config.clone(), 1);

        assert_eq!(muxer.push(0, &keyframe_packet(1)).unwrap(), None);
        assert_eq!(muxer.packets_written(0), 0);
        assert_eq!(mp4_count(&config), 0);
    }

    #[test]
    fn test_unwritable_directory_surfaces_io_error() {
        let mut config = test_config("unwritable");
        // block directory creation by putting a file where the directory
        // should go
        std::fs::create_dir_all(config.directory.parent().unwrap()).ok();
        let blocker = config.directory.clone();
        std::fs::write(&blocker, b"not a directory").unwrap();
        config.directory = blocker.join("sub");

        let mut muxer = RecordingMuxer::new(config, 1);
        muxer.set_enabled(true);
        assert!(matches!(
            muxer.push(0, &keyframe_packet(1)),
            Err(RecordError::Io(_))
        ));
    }
}
