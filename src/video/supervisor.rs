use crate::securitymap::{MotionConfig, Securitymap, TimelapseConfig};
use crate::video::motion::run_motion_worker;
use crate::video::timelapse::run_timelapse_worker;
use crate::video::WorkerEnv;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Handle to a spawned camera worker task
struct WorkerHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Launches, stops and restarts the per-camera workers.
///
/// Each worker is its own task, so a panic inside one recording pipeline
/// cannot take the controller down; the supervisor observes the outcome when
/// it joins the task.
pub struct WorkerSupervisor {
    env: WorkerEnv,
    motions: Mutex<HashMap<String, WorkerHandle>>,
    timelapses: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerSupervisor {
    pub fn new(env: WorkerEnv) -> Self {
        Self {
            env,
            motions: Mutex::new(HashMap::new()),
            timelapses: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn workers for every enabled config entry
    pub async fn launch_all(&self, map: &Securitymap) {
        for (internalid, timelapse) in &map.timelapses {
            self.launch_timelapse(internalid, timelapse.clone()).await;
        }
        for (internalid, motion) in &map.motions {
            self.launch_motion(internalid, motion.clone()).await;
        }
    }

    pub async fn launch_timelapse(&self, internalid: &str, config: TimelapseConfig) {
        debug!("Launch timelapse '{}'", internalid);
        if !config.enabled {
            debug!("Timelapse '{}' is disabled, not launched", internalid);
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_timelapse_worker(
            self.env.clone(),
            internalid.to_string(),
            config,
            cancel.clone(),
        ));
        let previous = self
            .timelapses
            .lock()
            .await
            .insert(internalid.to_string(), WorkerHandle { cancel, task });
        if let Some(previous) = previous {
            warn!("Timelapse '{}' was already running, stopping stale worker", internalid);
            Self::stop_handle(internalid, previous).await;
        }
    }

    pub async fn launch_motion(&self, internalid: &str, config: MotionConfig) {
        debug!("Launch motion '{}'", internalid);
        if !config.enabled {
            debug!("Motion '{}' is disabled, not launched", internalid);
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_motion_worker(
            self.env.clone(),
            internalid.to_string(),
            config,
            cancel.clone(),
        ));
        let previous = self
            .motions
            .lock()
            .await
            .insert(internalid.to_string(), WorkerHandle { cancel, task });
        if let Some(previous) = previous {
            warn!("Motion '{}' was already running, stopping stale worker", internalid);
            Self::stop_handle(internalid, previous).await;
        }
    }

    pub async fn stop_timelapse(&self, internalid: &str) {
        if let Some(handle) = self.timelapses.lock().await.remove(internalid) {
            Self::stop_handle(internalid, handle).await;
        }
    }

    pub async fn stop_motion(&self, internalid: &str) {
        if let Some(handle) = self.motions.lock().await.remove(internalid) {
            Self::stop_handle(internalid, handle).await;
        }
    }

    async fn stop_handle(internalid: &str, handle: WorkerHandle) {
        handle.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, handle.task).await {
            Ok(Ok(())) => debug!("Worker '{}' stopped", internalid),
            Ok(Err(e)) => error!("Worker '{}' exited abnormally: {}", internalid, e),
            Err(_) => warn!("Worker '{}' did not stop within {:?}", internalid, STOP_TIMEOUT),
        }
    }

    /// Stop and relaunch all timelapse workers, rotating their output files
    /// to the new date.
    pub async fn restart_timelapses(&self, map: &Securitymap) {
        info!("Restarting timelapse workers for filename rotation");
        let running: Vec<String> = self.timelapses.lock().await.keys().cloned().collect();
        for internalid in running {
            self.stop_timelapse(&internalid).await;
        }
        for (internalid, timelapse) in &map.timelapses {
            self.launch_timelapse(internalid, timelapse.clone()).await;
        }
    }

    /// Restart a single worker after a config edit (rename)
    pub async fn restart_motion(&self, internalid: &str, config: MotionConfig) {
        self.stop_motion(internalid).await;
        self.launch_motion(internalid, config).await;
    }

    pub async fn restart_timelapse(&self, internalid: &str, config: TimelapseConfig) {
        self.stop_timelapse(internalid).await;
        self.launch_timelapse(internalid, config).await;
    }

    /// Stop every worker (process shutdown)
    pub async fn stop_all(&self) {
        let timelapses: Vec<String> = self.timelapses.lock().await.keys().cloned().collect();
        for internalid in timelapses {
            self.stop_timelapse(&internalid).await;
        }
        let motions: Vec<String> = self.motions.lock().await.keys().cloned().collect();
        for internalid in motions {
            self.stop_motion(&internalid).await;
        }
    }

    pub async fn motion_count(&self) -> usize {
        self.motions.lock().await.len()
    }

    pub async fn timelapse_count(&self) -> usize {
        self.timelapses.lock().await.len()
    }
}
