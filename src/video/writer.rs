use crate::error::{Result, WriterError};
use crate::video::frame::Frame;
use chrono::{NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(feature = "gstreamer")]
use gstreamer::prelude::*;
#[cfg(feature = "gstreamer")]
use gstreamer::Pipeline;
#[cfg(feature = "gstreamer")]
use gstreamer_app::AppSrc;

/// An open recording file accepting frames until finished.
///
/// Implementations must release the underlying file on drop even when
/// `finish` was never called.
pub trait FrameSink: Send {
    fn append(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Factory opening recording files for a codec/fps/resolution triple
pub trait WriterBackend: Send + Sync {
    fn open(
        &self,
        path: &Path,
        codec: &str,
        fps: u32,
        resolution: (u32, u32),
    ) -> Result<Box<dyn FrameSink>>;
}

/// Choose the next timelapse path for the day, picking the lowest
/// non-colliding numeric suffix.
pub fn timelapse_recording_path(dir: &Path, internalid: &str, date: NaiveDate) -> PathBuf {
    let stamp = date.format("%Y%m%d");
    let mut inc = 0u32;
    loop {
        let filename = if inc == 0 {
            format!("timelapse_{}_{}.avi", internalid, stamp)
        } else {
            format!("timelapse_{}_{}_{}.avi", internalid, stamp, inc)
        };
        let path = dir.join(filename);
        if !path.exists() {
            return path;
        }
        inc += 1;
    }
}

/// Path for a motion recording triggered at the given instant
pub fn motion_recording_path(dir: &Path, internalid: &str, start: NaiveDateTime) -> PathBuf {
    dir.join(format!(
        "motion_{}_{}.avi",
        internalid,
        start.format("%Y%m%d_%H%M%S")
    ))
}

/// GStreamer writer encoding RGB frames into an AVI container
#[cfg(feature = "gstreamer")]
pub struct GstWriterBackend;

#[cfg(feature = "gstreamer")]
impl WriterBackend for GstWriterBackend {
    fn open(
        &self,
        path: &Path,
        codec: &str,
        fps: u32,
        resolution: (u32, u32),
    ) -> Result<Box<dyn FrameSink>> {
        let sink = GstFrameSink::open(path, codec, fps, resolution)?;
        Ok(Box::new(sink))
    }
}

/// Map a 4-char codec tag onto a GStreamer encoder element
#[cfg(feature = "gstreamer")]
fn encoder_for_codec(codec: &str) -> &'static str {
    match codec {
        "FMP4" => "avenc_mpeg4",
        "MJPG" => "jpegenc",
        other => {
            tracing::warn!("Unknown codec tag '{}', falling back to FMP4", other);
            "avenc_mpeg4"
        }
    }
}

#[cfg(feature = "gstreamer")]
pub struct GstFrameSink {
    pipeline: Pipeline,
    appsrc: AppSrc,
    path: PathBuf,
    fps: u32,
    resolution: (u32, u32),
    frame_index: u64,
    finished: bool,
}

#[cfg(feature = "gstreamer")]
impl GstFrameSink {
    fn open(path: &Path, codec: &str, fps: u32, resolution: (u32, u32)) -> Result<Self> {
        gstreamer::init().map_err(|e| WriterError::Open {
            path: path.display().to_string(),
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pipeline_desc = format!(
            "appsrc name=src format=time is-live=false \
             caps=video/x-raw,format=RGB,width={},height={},framerate={}/1 ! \
             videoconvert ! {} ! avimux ! filesink location={}",
            resolution.0,
            resolution.1,
            fps.max(1),
            encoder_for_codec(codec),
            path.to_string_lossy()
        );
        debug!("Creating writer pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| WriterError::Open {
                path: path.display().to_string(),
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| WriterError::Open {
                path: path.display().to_string(),
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| WriterError::Open {
                path: path.display().to_string(),
                details: "Failed to get appsrc element".to_string(),
            })?
            .downcast::<AppSrc>()
            .map_err(|_| WriterError::Open {
                path: path.display().to_string(),
                details: "Failed to downcast to AppSrc".to_string(),
            })?;

        appsrc.set_property("format", gstreamer::Format::Time);

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| WriterError::Open {
                path: path.display().to_string(),
                details: format!("Failed to start pipeline: {}", e),
            })?;

        info!("Recording into '{}'", path.display());
        Ok(Self {
            pipeline,
            appsrc,
            path: path.to_path_buf(),
            fps: fps.max(1),
            resolution,
            frame_index: 0,
            finished: false,
        })
    }
}

#[cfg(feature = "gstreamer")]
impl FrameSink for GstFrameSink {
    fn append(&mut self, frame: &Frame) -> Result<()> {
        if (frame.width, frame.height) != self.resolution {
            return Err(WriterError::Encode {
                details: format!(
                    "Frame size {}x{} does not match recording {}x{}",
                    frame.width, frame.height, self.resolution.0, self.resolution.1
                ),
            }
            .into());
        }

        let mut buffer =
            gstreamer::Buffer::with_size(frame.data.len()).map_err(|e| WriterError::Encode {
                details: format!("Failed to create buffer: {}", e),
            })?;
        {
            let buffer_ref = buffer.get_mut().unwrap();
            let mut map = buffer_ref
                .map_writable()
                .map_err(|e| WriterError::Encode {
                    details: format!("Failed to map buffer: {}", e),
                })?;
            map.copy_from_slice(&frame.data);
        }

        let frame_duration = 1_000_000_000u64 / self.fps as u64;
        let pts = self.frame_index * frame_duration;
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gstreamer::ClockTime::from_nseconds(pts));
        buffer
            .get_mut()
            .unwrap()
            .set_duration(gstreamer::ClockTime::from_nseconds(frame_duration));

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| WriterError::Encode {
                details: format!("Failed to push buffer: {:?}", e),
            })?;
        self.frame_index += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.appsrc
            .end_of_stream()
            .map_err(|e| WriterError::Encode {
                details: format!("Failed to signal EOS: {:?}", e),
            })?;

        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gstreamer::ClockTime::from_seconds(30)) {
                match msg.view() {
                    gstreamer::MessageView::Eos(..) => break,
                    gstreamer::MessageView::Error(err) => {
                        let _ = self.pipeline.set_state(gstreamer::State::Null);
                        return Err(WriterError::Encode {
                            details: format!(
                                "Encoding error: {} ({})",
                                err.error(),
                                err.debug().unwrap_or_default()
                            ),
                        }
                        .into());
                    }
                    _ => {}
                }
            }
        }

        self.pipeline
            .set_state(gstreamer::State::Null)
            .map_err(|e| WriterError::Encode {
                details: format!("Failed to stop pipeline: {}", e),
            })?;

        info!(
            "Recording finished: '{}' ({} frames)",
            self.path.display(),
            self.frame_index
        );
        Ok(())
    }
}

#[cfg(feature = "gstreamer")]
impl Drop for GstFrameSink {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                "Recording '{}' dropped without finish, releasing writer",
                self.path.display()
            );
            let _ = self.finish();
        }
    }
}

/// Raw frame writer used where GStreamer is unavailable: a fixed header
/// followed by back-to-back RGB frames.
pub struct RawWriterBackend;

impl WriterBackend for RawWriterBackend {
    fn open(
        &self,
        path: &Path,
        _codec: &str,
        fps: u32,
        resolution: (u32, u32),
    ) -> Result<Box<dyn FrameSink>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        file.write_all(b"HGRV")?;
        file.write_all(&resolution.0.to_le_bytes())?;
        file.write_all(&resolution.1.to_le_bytes())?;
        file.write_all(&fps.to_le_bytes())?;
        info!("Recording raw frames into '{}'", path.display());
        Ok(Box::new(RawFrameSink {
            file: Some(file),
            path: path.to_path_buf(),
            frames: 0,
        }))
    }
}

pub struct RawFrameSink {
    file: Option<std::fs::File>,
    path: PathBuf,
    frames: u64,
}

impl FrameSink for RawFrameSink {
    fn append(&mut self, frame: &Frame) -> Result<()> {
        use std::io::Write;
        let file = self.file.as_mut().ok_or_else(|| WriterError::Encode {
            details: "Writer already finished".to_string(),
        })?;
        file.write_all(&frame.data)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            debug!(
                "Raw recording finished: '{}' ({} frames)",
                self.path.display(),
                self.frames
            );
        }
        Ok(())
    }
}

impl Drop for RawFrameSink {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// The default writer backend for this build
pub fn default_backend() -> std::sync::Arc<dyn WriterBackend> {
    #[cfg(feature = "gstreamer")]
    {
        std::sync::Arc::new(GstWriterBackend)
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        std::sync::Arc::new(RawWriterBackend)
    }
}
