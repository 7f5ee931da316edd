use crate::error::Result;
use crate::securitymap::TimelapseConfig;
use crate::video::frame::Frame;
use crate::video::writer::timelapse_recording_path;
use crate::video::WorkerEnv;
use chrono::Local;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Wall-clock spacing between recorded timelapse frames.
///
/// One frame per second is the recording contract; frames arriving in
/// between are popped and discarded to keep the consumer queue drained.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Run a timelapse worker until cancelled.
///
/// Produces one date-stamped video file per run; the daily restart rotates
/// the output filename.
pub async fn run_timelapse_worker(
    env: WorkerEnv,
    internalid: String,
    config: TimelapseConfig,
    cancel: CancellationToken,
) {
    debug!("Timelapse '{}': started", internalid);
    if let Err(e) = timelapse_loop(&env, &internalid, &config, &cancel).await {
        error!("Timelapse '{}': stopped with error: {}", internalid, e);
    }
    debug!("Timelapse '{}': stopped", internalid);
}

async fn timelapse_loop(
    env: &WorkerEnv,
    internalid: &str,
    config: &TimelapseConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let provider = env.registry.get_or_create(&config.uri).await?;
    let consumer = provider.subscribe();
    let resolution = provider.resolution();

    let path = timelapse_recording_path(&env.recordings_dir, internalid, Local::now().date_naive());
    let mut recorder = env
        .writers
        .open(&path, &config.codec, config.fps, resolution)?;
    debug!("Timelapse '{}': recording into {}", internalid, path.display());

    let mut last_tick: Option<Instant> = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = consumer.pop_frame() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // only the once-per-second frame is recorded
        let due = last_tick.map_or(true, |tick| tick.elapsed() >= TICK_INTERVAL);
        if !due {
            continue;
        }
        last_tick = Some(Instant::now());

        if !frame.validate_size() {
            warn!("Timelapse '{}': damaged frame skipped", internalid);
            continue;
        }
        let Some(mut annotated) = frame.to_rgb_image() else {
            continue;
        };
        env.overlay
            .stamp(&mut annotated, frame.timestamp, &config.name);

        let stamped = Frame::from_rgb_image(frame.timestamp, annotated);
        if let Err(e) = recorder.append(&stamped) {
            // a damaged frame does not terminate the recording
            error!("Timelapse '{}': frame write failed: {}", internalid, e);
        }
    }

    debug!("Timelapse '{}': close recorder", internalid);
    if let Err(e) = recorder.finish() {
        error!("Timelapse '{}': failed to finalize recording: {}", internalid, e);
    }
    provider.unsubscribe(&consumer);
    Ok(())
}
