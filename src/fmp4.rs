//! Fragmented MP4 writing for H.264 recordings.
//!
//! The writer produces a plain fMP4 file layout, one fragment per encoded
//! packet:
//!
//! ```text
//! ftyp moov            (initialization, carries SPS/PPS in avcC)
//! moof mdat            (packet 1)
//! moof mdat            (packet 2)
//! ...
//! ```
//!
//! Timestamps use a microsecond timescale so device capture times map to
//! container time without rescaling. The writer is pure: it returns byte
//! segments and leaves file I/O to the caller.

/// H.264 NAL unit types this module cares about.
pub const NAL_NON_IDR: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Container timescale in ticks per second (microseconds).
pub const MICRO_TIMESCALE: u32 = 1_000_000;

/// Split Annex B data into NAL unit payloads, start codes removed. Handles
/// both 3-byte and 4-byte start codes; trailing zero bytes of a unit belong
/// to the following start code and are trimmed.
pub fn annex_b_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (k, &start) in starts.iter().enumerate() {
        let mut end = if k + 1 < starts.len() {
            starts[k + 1] - 3
        } else {
            data.len()
        };
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            units.push(&data[start..end]);
        }
    }
    units
}

/// NAL unit type from the header byte.
pub fn nal_type(unit: &[u8]) -> u8 {
    unit.first().map_or(0, |b| b & 0x1f)
}

/// Extract SPS and PPS payloads if both are present in the buffer.
pub fn find_parameter_sets(data: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut sps = None;
    let mut pps = None;
    for unit in annex_b_units(data) {
        match nal_type(unit) {
            NAL_SPS => sps = Some(unit.to_vec()),
            NAL_PPS => pps = Some(unit.to_vec()),
            _ => {}
        }
    }
    Some((sps?, pps?))
}

/// True when the buffer carries an IDR slice.
pub fn contains_keyframe(data: &[u8]) -> bool {
    annex_b_units(data).iter().any(|u| nal_type(u) == NAL_IDR)
}

/// Rewrite Annex B data as length-prefixed AVCC sample data. SPS and PPS
/// units are dropped; they live in the avcC record of the init segment.
pub fn annex_b_to_avcc(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    for unit in annex_b_units(data) {
        match nal_type(unit) {
            NAL_SPS | NAL_PPS => {}
            _ => {
                out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
                out.extend_from_slice(unit);
            }
        }
    }
    out
}

fn mp4_box(fourcc: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let mut b = Vec::with_capacity(8 + content.len());
    b.extend_from_slice(&((8 + content.len()) as u32).to_be_bytes());
    b.extend_from_slice(fourcc);
    b.extend_from_slice(content);
    b
}

fn full_box(fourcc: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(4 + body.len());
    content.push(version);
    content.extend_from_slice(&flags.to_be_bytes()[1..]);
    content.extend_from_slice(body);
    mp4_box(fourcc, &content)
}

const MATRIX_IDENTITY: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// One-track fragmented MP4 writer. Construct once SPS/PPS are known, emit
/// the init segment, then one fragment per packet.
#[derive(Debug)]
pub struct Fmp4Writer {
    sps: Vec<u8>,
    pps: Vec<u8>,
    width: u32,
    height: u32,
    track_id: u32,
    sequence: u32,
    prev_dts: Option<u64>,
    default_duration: u32,
}

impl Fmp4Writer {
    /// * `default_duration_us` covers the first packet of the file, before
    ///   a decode-time delta exists (typically the nominal frame interval).
    pub fn new(sps: Vec<u8>, pps: Vec<u8>, width: u32, height: u32, default_duration_us: u32) -> Self {
        Self {
            sps,
            pps,
            width,
            height,
            track_id: 1,
            sequence: 1,
            prev_dts: None,
            default_duration: default_duration_us.max(1),
        }
    }

    /// ftyp + moov. Write this once at the start of the file.
    pub fn init_segment(&self) -> Vec<u8> {
        let mut out = self.ftyp();
        out.extend(self.moov());
        out
    }

    /// moof + mdat for one packet. `dts_us` is the container decode time in
    /// microseconds; each sample's duration is the delta since the previous
    /// sample (so durations trail the packet cadence by one packet).
    pub fn fragment(&mut self, annex_b: &[u8], dts_us: u64, is_keyframe: bool) -> Vec<u8> {
        let payload = annex_b_to_avcc(annex_b);
        let duration = match self.prev_dts {
            Some(prev) if dts_us > prev => (dts_us - prev).min(u32::MAX as u64) as u32,
            _ => self.default_duration,
        };
        self.prev_dts = Some(dts_us);

        // first pass measures the moof so trun's data offset can point at
        // the mdat payload
        let probe = self.moof(dts_us, duration, payload.len() as u32, is_keyframe, 0);
        let mut out = self.moof(
            dts_us,
            duration,
            payload.len() as u32,
            is_keyframe,
            probe.len() as u32 + 8,
        );
        out.extend(mp4_box(b"mdat", &payload));
        self.sequence += 1;
        out
    }

    fn ftyp(&self) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(b"isom"); // major brand
        content.extend_from_slice(&0u32.to_be_bytes()); // minor version
        for brand in [b"isom", b"iso6", b"avc1", b"mp41"] {
            content.extend_from_slice(brand);
        }
        mp4_box(b"ftyp", &content)
    }

    fn moov(&self) -> Vec<u8> {
        let mut content = self.mvhd();
        content.extend(self.trak());
        content.extend(self.mvex());
        mp4_box(b"moov", &content)
    }

    fn mvhd(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // creation time
        body.extend_from_slice(&0u32.to_be_bytes()); // modification time
        body.extend_from_slice(&MICRO_TIMESCALE.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // duration unknown, live file
        body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
        body.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        body.extend_from_slice(&[0; 10]); // reserved
        for m in &MATRIX_IDENTITY {
            body.extend_from_slice(&m.to_be_bytes());
        }
        body.extend_from_slice(&[0; 24]); // pre_defined
        body.extend_from_slice(&(self.track_id + 1).to_be_bytes()); // next track id
        full_box(b"mvhd", 0, 0, &body)
    }

    fn trak(&self) -> Vec<u8> {
        let mut content = self.tkhd();
        content.extend(self.mdia());
        mp4_box(b"trak", &content)
    }

    fn tkhd(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // creation time
        body.extend_from_slice(&0u32.to_be_bytes()); // modification time
        body.extend_from_slice(&self.track_id.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // reserved
        body.extend_from_slice(&0u32.to_be_bytes()); // duration unknown
        body.extend_from_slice(&[0; 8]); // reserved
        body.extend_from_slice(&0u16.to_be_bytes()); // layer
        body.extend_from_slice(&0u16.to_be_bytes()); // alternate group
        body.extend_from_slice(&0u16.to_be_bytes()); // volume, 0 for video
        body.extend_from_slice(&0u16.to_be_bytes()); // reserved
        for m in &MATRIX_IDENTITY {
            body.extend_from_slice(&m.to_be_bytes());
        }
        body.extend_from_slice(&(self.width << 16).to_be_bytes()); // 16.16 fixed
        body.extend_from_slice(&(self.height << 16).to_be_bytes());
        full_box(b"tkhd", 0, 3, &body) // enabled, in movie
    }

    fn mdia(&self) -> Vec<u8> {
        let mut content = self.mdhd();
        content.extend(self.hdlr());
        content.extend(self.minf());
        mp4_box(b"mdia", &content)
    }

    fn mdhd(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // creation time
        body.extend_from_slice(&0u32.to_be_bytes()); // modification time
        body.extend_from_slice(&MICRO_TIMESCALE.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // duration
        body.extend_from_slice(&0x55c4u16.to_be_bytes()); // language "und"
        body.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
        full_box(b"mdhd", 0, 0, &body)
    }

    fn hdlr(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
        body.extend_from_slice(b"vide");
        body.extend_from_slice(&[0; 12]); // reserved
        body.extend_from_slice(b"VideoHandler\0");
        full_box(b"hdlr", 0, 0, &body)
    }

    fn minf(&self) -> Vec<u8> {
        let mut content = full_box(b"vmhd", 0, 1, &[0; 8]); // graphics mode + opcolor
        content.extend(self.dinf());
        content.extend(self.stbl());
        mp4_box(b"minf", &content)
    }

    fn dinf(&self) -> Vec<u8> {
        let mut dref_body = Vec::new();
        dref_body.extend_from_slice(&1u32.to_be_bytes()); // entry count
        dref_body.extend(full_box(b"url ", 0, 1, &[])); // self-contained
        mp4_box(b"dinf", &full_box(b"dref", 0, 0, &dref_body))
    }

    fn stbl(&self) -> Vec<u8> {
        let mut stsd_body = Vec::new();
        stsd_body.extend_from_slice(&1u32.to_be_bytes()); // entry count
        stsd_body.extend(self.avc1());

        let mut content = full_box(b"stsd", 0, 0, &stsd_body);
        // empty sample tables; all samples live in fragments
        content.extend(full_box(b"stts", 0, 0, &0u32.to_be_bytes()));
        content.extend(full_box(b"stsc", 0, 0, &0u32.to_be_bytes()));
        content.extend(full_box(b"stsz", 0, 0, &[0u8; 8]));
        content.extend(full_box(b"stco", 0, 0, &0u32.to_be_bytes()));
        mp4_box(b"stbl", &content)
    }

    fn avc1(&self) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(&[0; 6]); // reserved
        content.extend_from_slice(&1u16.to_be_bytes()); // data reference index
        content.extend_from_slice(&[0; 16]); // pre_defined + reserved
        content.extend_from_slice(&(self.width as u16).to_be_bytes());
        content.extend_from_slice(&(self.height as u16).to_be_bytes());
        content.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi horizontal
        content.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi vertical
        content.extend_from_slice(&0u32.to_be_bytes()); // reserved
        content.extend_from_slice(&1u16.to_be_bytes()); // frame count

        let mut compressor = [0u8; 32];
        let name = b"duocam";
        compressor[0] = name.len() as u8;
        compressor[1..1 + name.len()].copy_from_slice(name);
        content.extend_from_slice(&compressor);

        content.extend_from_slice(&0x0018u16.to_be_bytes()); // depth 24-bit
        content.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
        content.extend(self.avcc());
        mp4_box(b"avc1", &content)
    }

    fn avcc(&self) -> Vec<u8> {
        let mut content = Vec::new();
        content.push(1); // configuration version
        if self.sps.len() >= 4 {
            content.extend_from_slice(&self.sps[1..4]); // profile, compat, level
        } else {
            content.extend_from_slice(&[0x42, 0xc0, 0x1e]); // Baseline 3.0
        }
        content.push(0xff); // 4-byte NAL lengths
        content.push(0xe1); // one SPS
        content.extend_from_slice(&(self.sps.len() as u16).to_be_bytes());
        content.extend_from_slice(&self.sps);
        content.push(1); // one PPS
        content.extend_from_slice(&(self.pps.len() as u16).to_be_bytes());
        content.extend_from_slice(&self.pps);
        mp4_box(b"avcC", &content)
    }

    fn mvex(&self) -> Vec<u8> {
        let mut trex_body = Vec::new();
        trex_body.extend_from_slice(&self.track_id.to_be_bytes());
        trex_body.extend_from_slice(&1u32.to_be_bytes()); // default description
        trex_body.extend_from_slice(&0u32.to_be_bytes()); // default duration
        trex_body.extend_from_slice(&0u32.to_be_bytes()); // default size
        trex_body.extend_from_slice(&0u32.to_be_bytes()); // default flags
        mp4_box(b"mvex", &full_box(b"trex", 0, 0, &trex_body))
    }

    fn moof(
        &self,
        dts_us: u64,
        duration: u32,
        sample_size: u32,
        is_keyframe: bool,
        data_offset: u32,
    ) -> Vec<u8> {
        let mfhd = full_box(b"mfhd", 0, 0, &self.sequence.to_be_bytes());

        let tfhd = full_box(b"tfhd", 0, 0x02_0000, &self.track_id.to_be_bytes()); // base-is-moof
        let tfdt = full_box(b"tfdt", 1, 0, &dts_us.to_be_bytes());

        // sample flags: keyframes depend on nothing, the rest on a prior frame
        let sample_flags: u32 = if is_keyframe { 0x0200_0000 } else { 0x0101_0000 };
        let mut trun_body = Vec::new();
        trun_body.extend_from_slice(&1u32.to_be_bytes()); // sample count
        trun_body.extend_from_slice(&data_offset.to_be_bytes());
        trun_body.extend_from_slice(&duration.to_be_bytes());
        trun_body.extend_from_slice(&sample_size.to_be_bytes());
        trun_body.extend_from_slice(&sample_flags.to_be_bytes());
        // flags: data offset + per-sample duration, size and flags
        let trun = full_box(b"trun", 0, 0x000701, &trun_body);

        let mut traf_content = tfhd;
        traf_content.extend(tfdt);
        traf_content.extend(trun);

        let mut moof_content = mfhd;
        moof_content.extend(mp4_box(b"traf", &traf_content));
        mp4_box(b"moof", &moof_content)
    }
}
