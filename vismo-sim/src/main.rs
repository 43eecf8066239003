//! Feed synthetic camera frames through the motion pipeline.
//!
//! A bright square drifts across a flat gray background while the simulated
//! robot holds still; every motion observation the pipeline reports is
//! printed as one JSON line. Optionally dumps the detector's debug rasters
//! as PNG files.

use clap::*;
use nalgebra as na;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vismo::prelude::v1::{Result, *};

const WIDTH: usize = 320;
const HEIGHT: usize = 240;
const BACKGROUND: u8 = 100;
const SQUARE: u8 = 220;
const SQUARE_SIZE: usize = 30;
const FRAME_INTERVAL_MS: u32 = 66;

/// Fixed forward-looking camera: u = cx - f*y/x, v = cy + f*height/x for a
/// ground point (x, y) in robot coordinates.
fn camera_homography() -> na::Matrix3<f32> {
    let (f, cx, cy, height) = (300.0, 160.0, 120.0, 45.0);
    na::matrix![
        cx, -f, 0.0;
        cy, 0.0, f * height;
        1.0, 0.0, 0.0
    ]
}

fn synthetic_frame(timestamp_ms: u32, index: usize) -> Frame {
    let mut plane = Plane::new(WIDTH, HEIGHT);
    plane.fill(BACKGROUND);

    // Drift right, wrap around
    let x0 = (index * 8) % (WIDTH - SQUARE_SIZE);
    let y0 = (HEIGHT - SQUARE_SIZE) / 2;
    for y in y0..y0 + SQUARE_SIZE {
        for x in x0..x0 + SQUARE_SIZE {
            plane.put(x, y, SQUARE);
        }
    }

    Frame::gray(timestamp_ms, plane)
}

fn dump_debug(dir: &Path, timestamp_ms: u32, images: &DebugImageList) -> Result<()> {
    for (name, plane) in images.iter() {
        let (w, h) = plane.dim();
        let img = image::GrayImage::from_raw(w as u32, h as u32, plane.as_slice().to_vec())
            .ok_or_else(|| anyhow!("debug raster size mismatch"))?;
        img.save(dir.join(format!("{timestamp_ms}_{name}.png")))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("vismo-sim")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(
            Arg::new("frames")
                .long("frames")
                .short('n')
                .takes_value(true)
                .default_value("150"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::new("dump-debug")
                .long("dump-debug")
                .short('d')
                .takes_value(true)
                .required(false),
        )
        .get_matches();

    let frames: usize = matches.value_of("frames").unwrap().parse()?;
    let config = match matches.value_of("config") {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => MotionConfig::default(),
    };
    let debug_dir = matches.value_of("dump-debug").map(Path::new);
    if let Some(dir) = debug_dir {
        std::fs::create_dir_all(dir)?;
    }

    let homography = camera_homography();
    let provider = move |state: &RobotState, timestamp_ms: u32| PoseSnapshot {
        timestamp_ms,
        state: *state,
        camera_pose: na::Isometry3::identity(),
        ground_plane_visible: true,
        homography,
        ground_plane: GroundPlaneRegion::new(60.0, 240.0, 130.0, 300.0),
    };

    let pipeline = VisionPipeline::new(
        config,
        provider,
        ModeSchedule::default(),
        debug_dir.is_some(),
    );
    pipeline.enable_mode(VisionMode::Motion, true)?;

    // Capture thread: submit synthetic frames at a steady simulated rate
    let stop = Arc::new(AtomicBool::new(false));
    let capture = {
        let mailbox = pipeline.mailbox();
        let stop = stop.clone();
        std::thread::spawn(move || {
            for i in 0..frames {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let timestamp_ms = 1000 + i as u32 * FRAME_INTERVAL_MS;
                mailbox.submit_frame(synthetic_frame(timestamp_ms, i), RobotState::default());
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let mut reported = 0usize;
    let mut processed = 0usize;
    let mut drain = || -> Result<()> {
        while let Some(result) = pipeline.try_pop_result() {
            processed += 1;
            for obs in &result.observations {
                reported += 1;
                println!("{}", serde_json::to_string(obs)?);
            }
            if let Some(dir) = debug_dir {
                dump_debug(dir, result.timestamp_ms, &result.debug_images)?;
            }
        }
        Ok(())
    };

    while !capture.is_finished() {
        drain()?;
        std::thread::sleep(Duration::from_millis(5));
    }

    stop.store(true, Ordering::Release);
    capture
        .join()
        .map_err(|_| anyhow!("capture thread panicked"))?;

    // Let the in-flight frame finish, then pick up the tail
    std::thread::sleep(Duration::from_millis(100));
    drain()?;

    log::info!(
        "submitted {} frames, processed {}, {} motion observations",
        frames,
        processed,
        reported
    );

    Ok(())
}
