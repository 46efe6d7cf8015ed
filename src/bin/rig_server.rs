//! Rig server demo - runs the dual-camera fusion session on synthetic cameras.
//!
//! Two fake cameras render translated crops of one shared test scene, so the
//! STITCH command has real structure to calibrate against. Control requests
//! are read as lines from stdin and replies are printed to stdout, one JSON
//! object per line. The encoded bitstream packets are synthetic H.264-shaped
//! bytes; recording produces structurally valid fragmented MP4 files whose
//! payload is not decodable video.
//!
//! Usage:
//!   rig-server [OPTIONS]
//!
//! Options:
//!   --single             Run one camera in pass-through mode
//!   --width <px>         Per-camera frame width (default: 640)
//!   --height <px>        Per-camera frame height (default: 480)
//!   --fps <n>            Tick and camera rate (default: 30)
//!   --record-dir <path>  Directory for recordings (default: recordings)
//!   --translate-x <px>   Initial secondary-view x offset (default: 0)
//!   --translate-y <px>   Initial secondary-view y offset (default: 0)
//!   --blocking           Wait for every camera frame instead of sampling
//!   --allow-shutdown     Let the SHUTDOWN command power the host down
//!
//! Examples:
//!   rig-server                                   # dual rig, sampling reads
//!   echo '{"type":"PING"}' | rig-server          # one request, one reply
//!   rig-server --single --record-dir /tmp/rec    # single camera

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use duocam::{
    camera_channel, run_control_channel, CameraFeed, EncodedPacket, Frame, ReadDiscipline,
    SessionBuilder, ENCODED_QUEUE_CAPACITY,
};

/// Scene margin beyond the camera window, in pixels.
const SCENE_MARGIN_X: u32 = 32;
const SCENE_MARGIN_Y: u32 = 16;
/// Where the second camera's window sits inside the scene.
const CAM2_OFFSET: (u32, u32) = (16, 8);

struct Args {
    single: bool,
    width: u32,
    height: u32,
    fps: u32,
    record_dir: String,
    translate_x: i32,
    translate_y: i32,
    blocking: bool,
    allow_shutdown: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        single: false,
        width: 640,
        height: 480,
        fps: 30,
        record_dir: "recordings".to_string(),
        translate_x: 0,
        translate_y: 0,
        blocking: false,
        allow_shutdown: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--single" => {
                result.single = true;
                i += 1;
            }
            "--width" if i + 1 < args.len() => {
                result.width = args[i + 1].parse().unwrap_or(result.width);
                i += 2;
            }
            "--height" if i + 1 < args.len() => {
                result.height = args[i + 1].parse().unwrap_or(result.height);
                i += 2;
            }
            "--fps" if i + 1 < args.len() => {
                result.fps = args[i + 1].parse().unwrap_or(result.fps);
                i += 2;
            }
            "--record-dir" if i + 1 < args.len() => {
                result.record_dir = args[i + 1].clone();
                i += 2;
            }
            "--translate-x" if i + 1 < args.len() => {
                result.translate_x = args[i + 1].parse().unwrap_or(0);
                i += 2;
            }
            "--translate-y" if i + 1 < args.len() => {
                result.translate_y = args[i + 1].parse().unwrap_or(0);
                i += 2;
            }
            "--blocking" => {
                result.blocking = true;
                i += 1;
            }
            "--allow-shutdown" => {
                result.allow_shutdown = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    result
}

fn print_usage() {
    println!("Rig Server - dual-camera fusion session on synthetic cameras");
    println!();
    println!("Usage: rig-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --single             Run one camera in pass-through mode");
    println!("  --width <px>         Per-camera frame width (default: 640)");
    println!("  --height <px>        Per-camera frame height (default: 480)");
    println!("  --fps <n>            Tick and camera rate (default: 30)");
    println!("  --record-dir <path>  Directory for recordings (default: recordings)");
    println!("  --translate-x <px>   Initial secondary-view x offset (default: 0)");
    println!("  --translate-y <px>   Initial secondary-view y offset (default: 0)");
    println!("  --blocking           Wait for every camera frame instead of sampling");
    println!("  --allow-shutdown     Let the SHUTDOWN command power the host down");
    println!();
    println!("Examples:");
    println!("  rig-server                                   # dual rig, sampling reads");
    println!("  echo '{{\"type\":\"PING\"}}' | rig-server          # one request, one reply");
    println!("  rig-server --single --record-dir /tmp/rec    # single camera");
}

/// Shared test scene: a seeded mosaic of gray blocks, larger than one
/// camera window so both views are crops of the same structure.
fn build_scene(width: u32, height: u32) -> RgbImage {
    let scene_w = width + SCENE_MARGIN_X;
    let scene_h = height + SCENE_MARGIN_Y;
    let mut rng = StdRng::seed_from_u64(7);
    let blocks_x = scene_w.div_ceil(8);
    let blocks_y = scene_h.div_ceil(8);
    let mut shades = Vec::with_capacity((blocks_x * blocks_y) as usize);
    for _ in 0..blocks_x * blocks_y {
        shades.push(rng.random_range(40u8..=220));
    }
    RgbImage::from_fn(scene_w, scene_h, |x, y| {
        let idx = (y / 8) * blocks_x + x / 8;
        let v = shades[idx as usize];
        Rgb([v, v, v])
    })
}

/// Crop one camera window out of the scene and overlay a sweeping bar.
/// The bar moves in scene coordinates, so the two views stay exact
/// translations of each other frame after frame.
fn render_view(scene: &RgbImage, ox: u32, oy: u32, w: u32, h: u32, frame_index: u64) -> RgbImage {
    let mut view = RgbImage::from_fn(w, h, |x, y| *scene.get_pixel(x + ox, y + oy));
    let bar_scene_x = ((frame_index * 4) % (scene.width() as u64 - 4)) as i64;
    for dx in 0..4i64 {
        let vx = bar_scene_x + dx - ox as i64;
        if (0..w as i64).contains(&vx) {
            for y in 0..h {
                view.put_pixel(vx as u32, y, Rgb([250, 250, 60]));
            }
        }
    }
    view
}

/// Synthetic keyframe packet: annex-B SPS + PPS + IDR with a payload that
/// varies per frame. Shaped like H.264, not decodable as it.
fn fake_keyframe(timestamp_us: u64, frame_index: u64) -> EncodedPacket {
    const SPS: [u8; 8] = [0x67, 0x42, 0xc0, 0x1e, 0x8c, 0x68, 0x05, 0x01];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    let mut data = Vec::with_capacity(64);
    for nal in [&SPS[..], &PPS[..]] {
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(nal);
    }
    data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88]);
    data.extend_from_slice(&frame_index.to_be_bytes());

    EncodedPacket {
        data: Bytes::from(data),
        timestamp_us,
        is_keyframe: true,
    }
}

/// Drive one fake camera: publish a frame and a keyframe packet per tick
/// and log any tuning commands the control channel sends down.
async fn run_fake_camera(
    mut feed: CameraFeed,
    label: &'static str,
    scene: Arc<RgbImage>,
    offset: (u32, u32),
    size: (u32, u32),
    fps: u32,
) {
    let mut interval = tokio::time::interval(Duration::from_micros(1_000_000 / fps.max(1) as u64));
    let started = Instant::now();
    let cancel = feed.cancelled();
    let mut frame_index: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        while let Some(cmd) = feed.try_command() {
            tracing::info!(camera = label, "tuning command applied: {:?}", cmd);
        }

        let ts = started.elapsed().as_micros() as u64;
        let view = render_view(&scene, offset.0, offset.1, size.0, size.1, frame_index);
        feed.publish_frame(Frame::from_image(view, ts));
        feed.publish_encoded(fake_keyframe(ts, frame_index));
        frame_index += 1;
    }
    tracing::debug!(camera = label, "fake camera stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duocam=info".parse()?)
                .add_directive("rig_server=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args();

    println!();
    println!("========================================");
    println!("Rig Server (synthetic cameras)");
    println!("========================================");
    println!("Mode:       {}", if args.single { "single camera" } else { "dual fusion" });
    println!("Camera:     {}x{} @ {} fps", args.width, args.height, args.fps);
    println!("Recordings: {}", args.record_dir);
    println!(
        "Reads:      {}",
        if args.blocking { "blocking" } else { "latest frame" }
    );
    println!("Control:    JSON requests on stdin, replies on stdout");
    println!("========================================");
    println!();

    let scene = Arc::new(build_scene(args.width, args.height));
    let root = CancellationToken::new();

    let discipline = if args.blocking {
        ReadDiscipline::NextBlocking
    } else {
        ReadDiscipline::Latest
    };
    let builder = SessionBuilder::new()
        .resolution(args.width, args.height)
        .fps(args.fps)
        .translation(args.translate_x, args.translate_y)
        .read_discipline(discipline)
        .record_directory(&args.record_dir)
        .allow_host_shutdown(args.allow_shutdown);

    let (feed1, source1) = camera_channel(ENCODED_QUEUE_CAPACITY, root.child_token());
    tokio::spawn(run_fake_camera(
        feed1,
        "cam1",
        Arc::clone(&scene),
        (0, 0),
        (args.width, args.height),
        args.fps,
    ));

    let mut session = if args.single {
        builder.build_single(source1)
    } else {
        let (feed2, source2) = camera_channel(ENCODED_QUEUE_CAPACITY, root.child_token());
        tokio::spawn(run_fake_camera(
            feed2,
            "cam2",
            Arc::clone(&scene),
            CAM2_OFFSET,
            (args.width, args.height),
            args.fps,
        ));
        builder.build_dual(source1, source2)
    };

    // control channel: stdin lines in, stdout lines out
    let (in_tx, in_rx) = mpsc::channel::<String>(32);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
    tokio::spawn(run_control_channel(
        session.handler.clone(),
        in_rx,
        out_tx,
        session.context.cancel_token(),
    ));
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if in_tx.send(line).await.is_err() {
                break;
            }
        }
        tracing::debug!("stdin closed");
    });
    tokio::spawn(async move {
        while let Some(reply) = out_rx.recv().await {
            println!("{reply}");
        }
    });

    let cancel = session.context.cancel_token();
    let mut interval =
        tokio::time::interval(Duration::from_micros(1_000_000 / args.fps.max(1) as u64));
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c, shutting down");
                break;
            }
            _ = interval.tick() => {
                let frame = session.pipeline.tick().await;
                frames += 1;
                if frames % (args.fps.max(1) as u64 * 5) == 0 {
                    tracing::info!(
                        frames,
                        width = frame.width,
                        height = frame.height,
                        "panorama ticking"
                    );
                }
            }
        }
    }

    session.context.close();
    session.pipeline.shutdown();
    root.cancel();
    Ok(())
}
