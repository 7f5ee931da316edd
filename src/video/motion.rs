use crate::bus::BusEvent;
use crate::error::Result;
use crate::securitymap::MotionConfig;
use crate::video::frame::Frame;
use crate::video::overlay::draw_motion_rectangle;
use crate::video::writer::{motion_recording_path, FrameSink};
use crate::video::WorkerEnv;
use chrono::Local;
use image::GrayImage;
use imageproc::contrast::threshold;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Pixel delta below which frame differences are ignored
const DELTA_THRESHOLD: u8 = 35;
/// Seconds dropped after startup while the camera stabilizes
const STABILIZATION_SECS: u64 = 5;
/// Bounding box padding in pixels
const BBOX_PADDING: u32 = 10;

/// Outcome of scanning a motion mask
#[derive(Debug, Clone, PartialEq)]
pub struct MotionDetection {
    /// Number of changed pixels found at stride 2
    pub changes: u32,
    /// Padded bounding box of the changed area, (min_x, min_y)..(max_x, max_y)
    pub bbox: Option<((u32, u32), (u32, u32))>,
}

/// Build the motion mask from three consecutive grayscale frames:
/// `threshold(and(|prev-next|, |next-curr|)) ▷ erode`
pub fn motion_mask(prev: &GrayImage, curr: &GrayImage, next: &GrayImage) -> GrayImage {
    let (width, height) = next.dimensions();
    if prev.dimensions() != (width, height) || curr.dimensions() != (width, height) {
        warn!("Frame dimensions changed mid-stream, skipping mask");
        return GrayImage::new(width, height);
    }

    let mut diff = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let d1 = prev.get_pixel(x, y)[0].abs_diff(next.get_pixel(x, y)[0]);
            let d2 = next.get_pixel(x, y)[0].abs_diff(curr.get_pixel(x, y)[0]);
            diff.put_pixel(x, y, image::Luma([d1 & d2]));
        }
    }

    let binary = threshold(&diff, DELTA_THRESHOLD);
    erode(&binary, Norm::LInf, 1)
}

/// Scan the mask for changed pixels.
///
/// A mask whose standard deviation reaches `max_deviation` is treated as
/// noise (snow, sudden sunlight) and rejected outright. Otherwise pixels are
/// sampled at stride 2 in both axes; the changed-pixel count and a padded
/// bounding box are returned.
pub fn detect_motion(mask: &GrayImage, max_deviation: f64) -> MotionDetection {
    let (width, height) = mask.dimensions();
    if width == 0 || height == 0 {
        return MotionDetection {
            changes: 0,
            bbox: None,
        };
    }

    let pixel_count = (width * height) as f64;
    let mean: f64 = mask.pixels().map(|p| p.0[0] as f64).sum::<f64>() / pixel_count;
    let variance: f64 = mask
        .pixels()
        .map(|p| {
            let d = p.0[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / pixel_count;
    let stddev = variance.sqrt();

    if stddev >= max_deviation {
        trace!("Mask rejected as noise (stddev {:.2})", stddev);
        return MotionDetection {
            changes: 0,
            bbox: None,
        };
    }

    let mut changes = 0u32;
    let mut min_x = width;
    let mut max_x = 0u32;
    let mut min_y = height;
    let mut max_y = 0u32;

    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            if mask.get_pixel(x, y)[0] == 255 {
                changes += 1;
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
            }
        }
    }

    if changes == 0 {
        return MotionDetection {
            changes: 0,
            bbox: None,
        };
    }

    // pad the box, clipped to the frame
    if min_x > BBOX_PADDING {
        min_x -= BBOX_PADDING;
    }
    if min_y > BBOX_PADDING {
        min_y -= BBOX_PADDING;
    }
    if max_x + BBOX_PADDING < width - 1 {
        max_x += BBOX_PADDING;
    }
    if max_y + BBOX_PADDING < height - 1 {
        max_y += BBOX_PADDING;
    }

    MotionDetection {
        changes,
        bbox: Some(((min_x, min_y), (max_x, max_y))),
    }
}

/// Run a motion detection worker until cancelled.
///
/// Registers a `motionsensor` device for its lifetime and emits
/// `pictureavailable` / `statechanged` / `videoavailable` events in order.
pub async fn run_motion_worker(
    env: WorkerEnv,
    internalid: String,
    config: MotionConfig,
    cancel: CancellationToken,
) {
    debug!("Motion '{}': started", internalid);
    env.bus.add_device(&internalid, "motionsensor");

    if let Err(e) = motion_loop(&env, &internalid, &config, &cancel).await {
        error!("Motion '{}': stopped with error: {}", internalid, e);
    }

    env.bus.remove_device(&internalid);
    debug!("Motion '{}': stopped", internalid);
}

async fn pop_or_cancel(
    consumer: &crate::video::provider::FrameConsumer,
    cancel: &CancellationToken,
) -> Option<Frame> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        frame = consumer.pop_frame() => frame,
    }
}

async fn motion_loop(
    env: &WorkerEnv,
    internalid: &str,
    config: &MotionConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let provider = env.registry.get_or_create(&config.uri).await?;
    let consumer = provider.subscribe();
    let fps = provider.fps();
    let resolution = provider.resolution();
    let max_buffer = (config.bufferduration * fps) as usize;
    debug!(
        "Motion '{}': fps={} sensitivity={} deviation={} buffer={} frames",
        internalid, fps, config.sensitivity, config.deviation, max_buffer
    );

    // seed the three-frame differencing window; the window shifts before the
    // first mask, so the first seed is only consumed
    let mut window = Vec::with_capacity(3);
    for _ in 0..3 {
        match pop_or_cancel(&consumer, cancel).await {
            Some(frame) => window.push(frame.to_gray()),
            None => {
                provider.unsubscribe(&consumer);
                return Ok(());
            }
        }
    }
    let mut next = window.pop().unwrap();
    let mut curr = window.pop().unwrap();
    let mut prev;

    let start = Instant::now();
    let mut pre_roll: VecDeque<Frame> = VecDeque::new();
    let mut recorder: Option<Box<dyn FrameSink>> = None;
    let mut record_path = PathBuf::new();
    let mut is_recording = false;
    let mut is_triggered = false;
    let mut trigger_start = start;

    while let Some(frame) = pop_or_cancel(&consumer, cancel).await {
        if !frame.validate_size() {
            warn!("Motion '{}': damaged frame skipped", internalid);
            continue;
        }

        // shift the differencing window
        prev = std::mem::replace(&mut curr, std::mem::replace(&mut next, frame.to_gray()));

        let Some(mut result_img) = frame.to_rgb_image() else {
            continue;
        };
        env.overlay.stamp(&mut result_img, frame.timestamp, &config.name);

        if !is_recording {
            while pre_roll.len() >= max_buffer.max(1) {
                pre_roll.pop_front();
            }
            pre_roll.push_back(Frame::from_rgb_image(frame.timestamp, result_img.clone()));
        }

        let mask = motion_mask(&prev, &curr, &next);

        // drop the first seconds after startup for stabilization
        if start.elapsed() < Duration::from_secs(STABILIZATION_SECS) {
            continue;
        }

        let detection = detect_motion(&mask, config.deviation as f64);
        if let Some((min, max)) = detection.bbox {
            draw_motion_rectangle(&mut result_img, min, max);
        }
        let result = Frame::from_rgb_image(frame.timestamp, result_img.clone());

        if !is_triggered {
            if detection.changes >= config.sensitivity {
                debug!(
                    "Motion '{}': triggered ({} changes)",
                    internalid, detection.changes
                );

                // snapshot picture first
                let snapshot_path = env.snapshot_dir.join(format!("{}.jpg", internalid));
                match result_img.save(&snapshot_path) {
                    Ok(()) => env.bus.emit(
                        internalid,
                        BusEvent::PictureAvailable {
                            uuid: internalid.to_string(),
                            filename: snapshot_path.to_string_lossy().to_string(),
                        },
                    ),
                    Err(e) => error!(
                        "Motion '{}': unable to write snapshot '{}': {}",
                        internalid,
                        snapshot_path.display(),
                        e
                    ),
                }

                // open the recorder and flush the pre-roll into it
                record_path = motion_recording_path(
                    &env.recordings_dir,
                    internalid,
                    Local::now().naive_local(),
                );
                trigger_start = Instant::now();
                is_triggered = true;
                match env.writers.open(&record_path, "FMP4", fps, resolution) {
                    Ok(mut sink) => {
                        debug!("Motion '{}': recording to {}", internalid, record_path.display());
                        is_recording = true;
                        while let Some(buffered) = pre_roll.pop_front() {
                            if let Err(e) = sink.append(&buffered) {
                                error!("Motion '{}': pre-roll write failed: {}", internalid, e);
                            }
                        }
                        recorder = Some(sink);
                    }
                    Err(e) => {
                        error!("Motion '{}': unable to open recorder: {}", internalid, e);
                    }
                }

                env.bus.emit(
                    internalid,
                    BusEvent::StateChanged {
                        uuid: internalid.to_string(),
                        level: 255,
                    },
                );
            }
        } else {
            let elapsed = trigger_start.elapsed();

            if is_recording && elapsed >= Duration::from_secs(config.recordduration as u64) {
                debug!("Motion '{}': stop motion recording", internalid);
                if let Some(mut sink) = recorder.take() {
                    if let Err(e) = sink.finish() {
                        error!("Motion '{}': failed to finalize recording: {}", internalid, e);
                    }
                }
                is_recording = false;
                env.bus.emit(
                    internalid,
                    BusEvent::VideoAvailable {
                        uuid: internalid.to_string(),
                        filename: record_path.to_string_lossy().to_string(),
                    },
                );
            } else if is_recording {
                if let Some(sink) = recorder.as_mut() {
                    if let Err(e) = sink.append(&result) {
                        error!("Motion '{}': frame write failed: {}", internalid, e);
                    }
                }
            }

            if elapsed >= Duration::from_secs(config.onduration as u64) {
                debug!("Motion '{}': disable motion trigger", internalid);
                is_triggered = false;
                env.bus.emit(
                    internalid,
                    BusEvent::StateChanged {
                        uuid: internalid.to_string(),
                        level: 0,
                    },
                );
            }
        }
    }

    provider.unsubscribe(&consumer);
    if let Some(mut sink) = recorder.take() {
        if let Err(e) = sink.finish() {
            error!("Motion '{}': failed to finalize recording: {}", internalid, e);
        }
    }
    Ok(())
}
