use crate::error::{CaptureError, Result};
use crate::video::frame::Frame;
use async_trait::async_trait;
use std::time::SystemTime;
use tracing::info;

#[cfg(feature = "gstreamer")]
use gstreamer::prelude::*;
#[cfg(feature = "gstreamer")]
use gstreamer::Pipeline;
#[cfg(feature = "gstreamer")]
use gstreamer_app::AppSink;
#[cfg(feature = "gstreamer")]
use gstreamer_video::VideoInfo;

/// One open capture session yielding raw RGB frames at the source's native rate
#[async_trait]
pub trait CaptureSource: Send {
    fn resolution(&self) -> (u32, u32);
    fn fps(&self) -> u32;
    /// Wait for the next decoded frame; errors end the stream
    async fn next_frame(&mut self) -> Result<Frame>;
}

/// Factory opening capture sessions for camera uris
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Box<dyn CaptureSource>>;
}

/// GStreamer capture backend decoding any uridecodebin-supported source
#[cfg(feature = "gstreamer")]
pub struct GstCaptureBackend;

#[cfg(feature = "gstreamer")]
#[async_trait]
impl CaptureBackend for GstCaptureBackend {
    async fn open(&self, uri: &str) -> Result<Box<dyn CaptureSource>> {
        let source = GstCaptureSource::open(uri).await?;
        Ok(Box::new(source))
    }
}

#[cfg(feature = "gstreamer")]
pub struct GstCaptureSource {
    pipeline: Pipeline,
    rx: tokio::sync::mpsc::UnboundedReceiver<Frame>,
    pending: Option<Frame>,
    resolution: (u32, u32),
    fps: u32,
}

#[cfg(feature = "gstreamer")]
impl GstCaptureSource {
    async fn open(uri: &str) -> Result<Self> {
        gstreamer::init().map_err(|e| CaptureError::Open {
            uri: uri.to_string(),
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        let pipeline_desc = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink sync=false max-buffers=4 drop=true",
            uri
        );
        tracing::debug!("Creating capture pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| CaptureError::Open {
                uri: uri.to_string(),
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| CaptureError::Open {
                uri: uri.to_string(),
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::Open {
                uri: uri.to_string(),
                details: "Failed to get appsink element".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| CaptureError::Open {
                uri: uri.to_string(),
                details: "Failed to downcast to AppSink".to_string(),
            })?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                    if let Some(frame) = sample_to_frame(&sample) {
                        let _ = tx.send(frame);
                    }
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| CaptureError::Open {
                uri: uri.to_string(),
                details: format!("Failed to start pipeline: {}", e),
            })?;

        // wait for the first decoded frame to learn the negotiated caps
        let first = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                let _ = pipeline.set_state(gstreamer::State::Null);
                CaptureError::Open {
                    uri: uri.to_string(),
                    details: "No frames received from source".to_string(),
                }
            })?;

        let fps = read_pipeline_fps(&appsink).unwrap_or(25);
        let resolution = (first.width, first.height);
        info!(
            "Capture started for '{}' ({}x{} @ {} fps)",
            uri, resolution.0, resolution.1, fps
        );

        Ok(Self {
            pipeline,
            rx,
            pending: Some(first),
            resolution,
            fps,
        })
    }
}

#[cfg(feature = "gstreamer")]
fn sample_to_frame(sample: &gstreamer::Sample) -> Option<Frame> {
    let buffer = sample.buffer()?;
    let caps = sample.caps()?;
    let video_info = VideoInfo::from_caps(caps).ok()?;
    let map = buffer.map_readable().ok()?;
    Some(Frame::new(
        SystemTime::now(),
        map.as_slice().to_vec(),
        video_info.width(),
        video_info.height(),
    ))
}

#[cfg(feature = "gstreamer")]
fn read_pipeline_fps(appsink: &AppSink) -> Option<u32> {
    let pad = appsink.static_pad("sink")?;
    let caps = pad.current_caps()?;
    let video_info = VideoInfo::from_caps(&caps).ok()?;
    let fps = video_info.fps();
    if fps.denom() > 0 && fps.numer() > 0 {
        Some((fps.numer() / fps.denom()) as u32)
    } else {
        None
    }
}

#[cfg(feature = "gstreamer")]
#[async_trait]
impl CaptureSource for GstCaptureSource {
    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.rx
            .recv()
            .await
            .ok_or_else(|| CaptureError::Stopped.into())
    }
}

#[cfg(feature = "gstreamer")]
impl Drop for GstCaptureSource {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            tracing::warn!("Failed to stop capture pipeline cleanly: {}", e);
        }
    }
}

/// Synthetic capture backend producing uniform frames at a fixed rate.
///
/// Accepts uris of the form `mock://<width>x<height>@<fps>` and is the
/// default backend when the gstreamer feature is off.
pub struct SyntheticCaptureBackend;

#[async_trait]
impl CaptureBackend for SyntheticCaptureBackend {
    async fn open(&self, uri: &str) -> Result<Box<dyn CaptureSource>> {
        let (width, height, fps) = parse_mock_uri(uri).ok_or(CaptureError::InvalidUri {
            uri: uri.to_string(),
        })?;
        info!(
            "Synthetic capture started for '{}' ({}x{} @ {} fps)",
            uri, width, height, fps
        );
        Ok(Box::new(SyntheticCaptureSource {
            width,
            height,
            fps,
            interval: tokio::time::interval(std::time::Duration::from_millis(
                (1000 / fps as u64).max(1),
            )),
        }))
    }
}

fn parse_mock_uri(uri: &str) -> Option<(u32, u32, u32)> {
    let spec = uri.strip_prefix("mock://")?;
    let (dims, fps) = spec.split_once('@')?;
    let (width, height) = dims.split_once('x')?;
    let width = width.parse().ok()?;
    let height = height.parse().ok()?;
    let fps: u32 = fps.parse().ok()?;
    if width == 0 || height == 0 || fps == 0 {
        return None;
    }
    Some((width, height, fps))
}

pub struct SyntheticCaptureSource {
    width: u32,
    height: u32,
    fps: u32,
    interval: tokio::time::Interval,
}

#[async_trait]
impl CaptureSource for SyntheticCaptureSource {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        self.interval.tick().await;
        let data = vec![128u8; (self.width * self.height * 3) as usize];
        Ok(Frame::new(SystemTime::now(), data, self.width, self.height))
    }
}

/// The default capture backend for this build
pub fn default_backend() -> std::sync::Arc<dyn CaptureBackend> {
    #[cfg(feature = "gstreamer")]
    {
        std::sync::Arc::new(GstCaptureBackend)
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        std::sync::Arc::new(SyntheticCaptureBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_uri_parsing() {
        assert_eq!(parse_mock_uri("mock://320x240@10"), Some((320, 240, 10)));
        assert_eq!(parse_mock_uri("mock://64x48@1"), Some((64, 48, 1)));
        assert!(parse_mock_uri("mock://0x48@1").is_none());
        assert!(parse_mock_uri("mock://64x48").is_none());
        assert!(parse_mock_uri("rtsp://camera/stream").is_none());
    }

    #[tokio::test]
    async fn test_synthetic_source_yields_frames() {
        let backend = SyntheticCaptureBackend;
        let mut source = backend.open("mock://32x24@20").await.unwrap();
        assert_eq!(source.resolution(), (32, 24));
        assert_eq!(source.fps(), 20);

        let frame = source.next_frame().await.unwrap();
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 24);
        assert!(frame.validate_size());
    }

    #[tokio::test]
    async fn test_invalid_uri_fails_open() {
        let backend = SyntheticCaptureBackend;
        let result = backend.open("bogus://nope").await;
        assert!(result.is_err());
    }
}
