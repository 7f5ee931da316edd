pub mod capture;
pub mod frame;
pub mod motion;
pub mod overlay;
pub mod provider;
pub mod recordings;
pub mod supervisor;
pub mod timelapse;
pub mod writer;

use crate::bus::BusConnection;
use overlay::OverlayRenderer;
use provider::ProviderRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use writer::WriterBackend;

/// Everything a camera worker needs from the surrounding application
#[derive(Clone)]
pub struct WorkerEnv {
    pub bus: BusConnection,
    pub registry: Arc<ProviderRegistry>,
    pub writers: Arc<dyn WriterBackend>,
    pub recordings_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub overlay: Arc<OverlayRenderer>,
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::error::{CaptureError, Result};
    use crate::video::capture::{CaptureBackend, CaptureSource};
    use crate::video::frame::Frame;
    use crate::video::writer::{FrameSink, WriterBackend};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::time::SystemTime;

    /// Capture backend replaying a scripted frame generator at a fixed rate
    pub struct ScriptedBackend {
        pub width: u32,
        pub height: u32,
        pub fps: u32,
        pub generator: fn(u64, u32, u32) -> Vec<u8>,
    }

    #[async_trait]
    impl CaptureBackend for ScriptedBackend {
        async fn open(&self, uri: &str) -> Result<Box<dyn CaptureSource>> {
            if uri.starts_with("fail://") {
                return Err(CaptureError::InvalidUri {
                    uri: uri.to_string(),
                }
                .into());
            }
            Ok(Box::new(ScriptedSource {
                width: self.width,
                height: self.height,
                fps: self.fps,
                generator: self.generator,
                index: 0,
                interval: tokio::time::interval(std::time::Duration::from_millis(
                    1000 / self.fps as u64,
                )),
            }))
        }
    }

    pub struct ScriptedSource {
        width: u32,
        height: u32,
        fps: u32,
        generator: fn(u64, u32, u32) -> Vec<u8>,
        index: u64,
        interval: tokio::time::Interval,
    }

    #[async_trait]
    impl CaptureSource for ScriptedSource {
        fn resolution(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        fn fps(&self) -> u32 {
            self.fps
        }

        async fn next_frame(&mut self) -> Result<Frame> {
            self.interval.tick().await;
            let data = (self.generator)(self.index, self.width, self.height);
            self.index += 1;
            Ok(Frame::new(SystemTime::now(), data, self.width, self.height))
        }
    }

    /// Writer backend recording appended frame counts per file in memory
    #[derive(Default)]
    pub struct RecordingWriterBackend {
        pub files: Arc<Mutex<Vec<RecordedFile>>>,
    }

    #[derive(Debug, Clone)]
    pub struct RecordedFile {
        pub path: PathBuf,
        pub frames: usize,
        pub finished: bool,
    }

    impl WriterBackend for RecordingWriterBackend {
        fn open(
            &self,
            path: &Path,
            _codec: &str,
            _fps: u32,
            _resolution: (u32, u32),
        ) -> Result<Box<dyn FrameSink>> {
            let files = Arc::clone(&self.files);
            let index = {
                let mut guard = files.lock();
                guard.push(RecordedFile {
                    path: path.to_path_buf(),
                    frames: 0,
                    finished: false,
                });
                guard.len() - 1
            };
            Ok(Box::new(RecordingSink { files, index }))
        }
    }

    struct RecordingSink {
        files: Arc<Mutex<Vec<RecordedFile>>>,
        index: usize,
    }

    impl FrameSink for RecordingSink {
        fn append(&mut self, _frame: &Frame) -> Result<()> {
            self.files.lock()[self.index].frames += 1;
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.files.lock()[self.index].finished = true;
            Ok(())
        }
    }

    /// Uniform mid-gray frame generator
    pub fn static_frames(_index: u64, width: u32, height: u32) -> Vec<u8> {
        vec![128u8; (width * height * 3) as usize]
    }
}
