use crate::error::Result;
use crate::video::capture::CaptureBackend;
use crate::video::frame::Frame;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-consumer frame queue shared between the provider and the consumer
struct ConsumerShared {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    detached: AtomicBool,
    depth: usize,
}

/// A subscriber's end of the frame fan-out: a bounded queue with a
/// cancellation-aware blocking pop.
pub struct FrameConsumer {
    shared: Arc<ConsumerShared>,
}

impl FrameConsumer {
    /// Wait for the next frame. Returns `None` once the provider stopped or
    /// this consumer was unsubscribed; workers treat that as the stop signal.
    pub async fn pop_frame(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.shared.queue.lock().pop_front() {
                return Some(frame);
            }
            if self.shared.detached.load(Ordering::Acquire) {
                return None;
            }
            // notify_one stores a permit, so a push between the check above
            // and this await still wakes us
            self.shared.notify.notified().await;
        }
    }

    /// Number of frames currently queued
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

/// Owns one capture session per uri and multicasts decoded frames to all
/// subscribed consumers. When a consumer's queue is full the oldest frame is
/// dropped for that consumer.
pub struct FrameProvider {
    uri: String,
    resolution: (u32, u32),
    fps: u32,
    queue_depth: usize,
    running: Arc<AtomicBool>,
    consumers: Arc<Mutex<Vec<Arc<ConsumerShared>>>>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FrameProvider {
    /// Open the capture session and start the producer task.
    /// Fails when the uri cannot be opened.
    pub async fn start(
        backend: &dyn CaptureBackend,
        uri: &str,
        queue_depth: usize,
    ) -> Result<Arc<Self>> {
        let mut source = backend.open(uri).await?;
        let resolution = source.resolution();
        let fps = source.fps();

        let provider = Arc::new(Self {
            uri: uri.to_string(),
            resolution,
            fps,
            queue_depth,
            running: Arc::new(AtomicBool::new(true)),
            consumers: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let running = Arc::clone(&provider.running);
        let consumers = Arc::clone(&provider.consumers);
        let cancel = provider.cancel.clone();
        let task_uri = provider.uri.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = source.next_frame() => match frame {
                        Ok(frame) => Self::multicast(&consumers, frame),
                        Err(e) => {
                            warn!("Frame provider '{}' stream ended: {}", task_uri, e);
                            break;
                        }
                    }
                }
            }
            running.store(false, Ordering::Release);
            // wake all blocked consumers so their pops return the sentinel
            for consumer in consumers.lock().iter() {
                consumer.detached.store(true, Ordering::Release);
                consumer.notify.notify_one();
            }
            debug!("Frame provider '{}' stopped", task_uri);
        });
        *provider.task.lock() = Some(task);

        info!(
            "Frame provider started for '{}' ({}x{} @ {} fps)",
            uri, resolution.0, resolution.1, fps
        );
        Ok(provider)
    }

    fn multicast(consumers: &Mutex<Vec<Arc<ConsumerShared>>>, frame: Frame) {
        for consumer in consumers.lock().iter() {
            let mut queue = consumer.queue.lock();
            if queue.len() >= consumer.depth {
                queue.pop_front();
            }
            queue.push_back(frame.clone());
            drop(queue);
            consumer.notify.notify_one();
        }
    }

    /// Add a consumer; it receives frames from the next produced frame onward
    pub fn subscribe(&self) -> FrameConsumer {
        let shared = Arc::new(ConsumerShared {
            queue: Mutex::new(VecDeque::with_capacity(self.queue_depth)),
            notify: Notify::new(),
            detached: AtomicBool::new(!self.running.load(Ordering::Acquire)),
            depth: self.queue_depth,
        });
        self.consumers.lock().push(Arc::clone(&shared));
        FrameConsumer { shared }
    }

    /// Remove a consumer and wake its blocked pop
    pub fn unsubscribe(&self, consumer: &FrameConsumer) {
        self.consumers
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &consumer.shared));
        consumer.shared.detached.store(true, Ordering::Release);
        consumer.shared.notify.notify_one();
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Terminate the producer and wake all consumers
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Uri-keyed registry deduplicating frame providers.
///
/// Providers persist until shutdown; workers hold a consumer handle and the
/// registry remains the sole owner.
pub struct ProviderRegistry {
    backend: Arc<dyn CaptureBackend>,
    queue_depth: usize,
    providers: tokio::sync::Mutex<HashMap<String, Arc<FrameProvider>>>,
}

impl ProviderRegistry {
    pub fn new(backend: Arc<dyn CaptureBackend>, queue_depth: usize) -> Self {
        Self {
            backend,
            queue_depth,
            providers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Return the provider for a uri, creating and starting it on first use
    pub async fn get_or_create(&self, uri: &str) -> Result<Arc<FrameProvider>> {
        let mut providers = self.providers.lock().await;
        if let Some(existing) = providers.get(uri) {
            debug!("Frame provider already exists for '{}'", uri);
            return Ok(Arc::clone(existing));
        }

        debug!("Creating new frame provider for '{}'", uri);
        let provider = FrameProvider::start(self.backend.as_ref(), uri, self.queue_depth).await?;
        providers.insert(uri.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Stop every provider (process shutdown)
    pub async fn stop_all(&self) {
        let mut providers = self.providers.lock().await;
        for (uri, provider) in providers.drain() {
            debug!("Stopping frame provider '{}'", uri);
            provider.stop().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.providers.lock().await.len()
    }
}
