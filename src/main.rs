// src/main.rs
//! Headless occlusion demo.
//!
//! A streaming thread generates voxel terrain around a player walking down +Z and
//! publishes chunk bounds; the main thread runs the full occlusion frame against a
//! depth‑only stand‑in for the main pass and logs what survives.
//!
//! `slop_occlusion_demo [config.json] [frames]`

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use glam::Vec3;
use log::{error, info, LevelFilter};

use slop_occlusion::depth_prepass::{DepthPrepass, DepthTarget};
use slop_occlusion::voxel::{ChunkVoxels, CHUNK_SIZE};
use slop_occlusion::{
    Camera, ChunkId, ChunkSnapshot, GpuDevice, ObjectBound, OcclusionConfig, OcclusionContext, SnapshotSender,
};

const DEFAULT_FRAMES: u64 = 240;
const VIEW_RADIUS: i32 = 6;
const PLAYER_SPEED: f32 = 0.75;
const RESOLUTIONS: [(u32, u32); 2] = [(1280, 720), (1920, 1080)];

fn main() {
    setup_diagnostics();

    if let Err(e) = run() {
        error!("Demo failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => OcclusionConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => OcclusionConfig::default(),
    };
    let frames = match args.next() {
        Some(n) => n.parse::<u64>().with_context(|| format!("frame count `{n}`"))?,
        None => DEFAULT_FRAMES,
    };
    info!("Starting occlusion demo: {frames} frames, {config:?}");

    let gpu = GpuDevice::request_headless_blocking().context("bringing up a headless GPU")?;
    let mut ctx = OcclusionContext::new(gpu.clone(), config.clone())?;
    let mut prepass = DepthPrepass::new(&gpu, config.max_objects)?;

    let running = Arc::new(AtomicBool::new(true));
    let streamer = {
        let sender = ctx.feed().sender();
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("chunk-stream".into())
            .spawn(move || stream_chunks(sender, running))
            .context("spawning the chunk streaming thread")?
    };

    let (mut width, mut height) = RESOLUTIONS[0];
    let mut target = DepthTarget::new(&gpu.device, width, height);
    ctx.resize(target.view(), width, height)?;

    let mut camera = Camera::new(
        Vec3::ZERO,
        0.0,
        -0.35,
        70f32.to_radians(),
        width as f32 / height as f32,
        0.1,
        CHUNK_SIZE as f32 * VIEW_RADIUS as f32 * 2.0,
    );

    let mut totals = (0usize, 0usize, 0usize);
    let started = Instant::now();

    for _ in 0..frames {
        let frame = ctx.begin_frame();

        if frame == frames / 2 {
            (width, height) = RESOLUTIONS[1];
            target = DepthTarget::new(&gpu.device, width, height);
            ctx.resize(target.view(), width, height)?;
            camera.set_aspect(width as f32 / height as f32);
        }

        let count = ctx.load_geometry_to_device()?;
        let player = ctx.feed().player_position();
        camera.set_position(player + Vec3::new(0.0, 28.0, -24.0));

        let proj = camera.proj_matrix();
        ctx.set_view_proj(proj, camera.view_matrix(), camera.inverse_view_matrix());
        ctx.set_global_data(proj, width, height, count);

        // Early pass against last frame's depth.
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("early") });
        ctx.compute_depth_pyramid(&mut encoder)?;
        let early = ctx.compute_culling(encoder, count, false)?;

        // "Main pass": depth of everything the early pass kept.
        let bounds = ctx.feed().bounds();
        let mut drawn: Vec<ObjectBound> = early.iter().map(|i| bounds[i as usize]).collect();
        prepass.set_boxes(&gpu.queue, &drawn)?;
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("main") });
        prepass.record(&gpu.queue, &mut encoder, &target, &camera.view_proj_matrix());

        let late_count = if config.late_culling {
            ctx.compute_depth_pyramid(&mut encoder)?;
            let late = ctx.compute_culling(encoder, count, true)?;
            if !late.is_empty() {
                // Second draw so next frame's depth holds the late objects too.
                drawn.extend(late.iter().map(|i| bounds[i as usize]));
                prepass.set_boxes(&gpu.queue, &drawn)?;
                let mut encoder = gpu
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("late_draw") });
                prepass.record(&gpu.queue, &mut encoder, &target, &camera.view_proj_matrix());
                gpu.queue.submit(Some(encoder.finish()));
            }
            late.len()
        } else {
            gpu.queue.submit(Some(encoder.finish()));
            0
        };

        totals.0 += count as usize;
        totals.1 += early.len();
        totals.2 += late_count;

        if frame % 30 == 0 {
            let sample: Vec<ChunkId> = early
                .iter()
                .take(4)
                .filter_map(|i| ctx.feed().chunk_id(i))
                .collect();
            info!(
                "frame {frame}: {}/{count} early, {late_count} late, pyramid {:?}x{} (first: {sample:?})",
                early.len(),
                ctx.pyramid_extent().unwrap_or_default(),
                ctx.pyramid_levels()
            );
        }
    }

    running.store(false, Ordering::Release);
    if streamer.join().is_err() {
        error!("chunk streaming thread panicked");
    }
    gpu.wait_idle();

    let elapsed = started.elapsed();
    let culled = totals.0.saturating_sub(totals.1 + totals.2);
    info!(
        "{frames} frames in {:.2?} ({:.2} ms/frame): {} tested, {} early, {} late, {:.1}% culled",
        elapsed,
        elapsed.as_secs_f64() * 1000.0 / frames.max(1) as f64,
        totals.0,
        totals.1,
        totals.2,
        if totals.0 == 0 { 0.0 } else { culled as f64 * 100.0 / totals.0 as f64 }
    );
    Ok(())
}

/// Terrain column height in voxels at world `(x, z)`. Every eighth chunk row along Z
/// carries a tall ridge so the camera has something to hide behind.
fn terrain_height(x: i32, z: i32) -> i32 {
    let (fx, fz) = (x as f32, z as f32);
    let hills = 10.0 + 4.0 * (fx * 0.09).sin() + 3.0 * (fz * 0.07).cos();
    let ridge = if z.div_euclid(CHUNK_SIZE as i32).rem_euclid(8) == 0 { 18.0 } else { 0.0 };
    (hills + ridge) as i32
}

fn build_chunk(id: ChunkId) -> ChunkVoxels {
    let s = CHUNK_SIZE as i32;
    ChunkVoxels::from_fn(id, |x, y, z| {
        let wx = id.x * s + x as i32;
        let wy = id.y * s + y as i32;
        let wz = id.z * s + z as i32;
        u8::from(wy < terrain_height(wx, wz))
    })
}

/// Streaming thread body: walk the player forward and publish the chunks around it.
fn stream_chunks(sender: SnapshotSender, running: Arc<AtomicBool>) {
    let mut player = Vec3::new(8.0, 0.0, 0.0);
    let mut published = 0u64;

    while running.load(Ordering::Acquire) {
        let pz = (player.z / CHUNK_SIZE as f32).floor() as i32;
        let chunks = (-VIEW_RADIUS..=VIEW_RADIUS)
            .flat_map(|cx| (pz - 1..=pz + 2 * VIEW_RADIUS).map(move |cz| (cx, cz)))
            .flat_map(|(cx, cz)| (0..3).map(move |cy| ChunkId::new(cx, cy, cz)))
            .filter_map(|id| build_chunk(id).bounds())
            .collect();

        let snapshot = ChunkSnapshot {
            chunks,
            player_position: player,
        };
        if let Err(e) = sender.publish(snapshot) {
            log::warn!("chunk streaming stopped: {e}");
            break;
        }
        published += 1;
        player.z += PLAYER_SPEED;
        thread::sleep(Duration::from_millis(8));
    }
    log::debug!("chunk streaming thread published {published} snapshots");
}

/// Sets up logging and crash reporting
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };

        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        let crash_msg = format!("=== OCCLUSION DEMO CRASH ===\nReason: {msg}\nLocation: {location}\n\nStack Trace:\n{backtrace}");
        eprintln!("\x1b[31;1m{crash_msg}\x1b[0m");

        if let Ok(mut file) = File::create("occlusion_crash.log") {
            let _ = file.write_all(crash_msg.as_bytes());
            eprintln!("Crash report saved to occlusion_crash.log");
        }
    }));
}
