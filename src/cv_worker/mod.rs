//! CvWorker - Capture/Detect/Count Pipeline
//!
//! ## Responsibilities
//!
//! - Own the frame source, detector client, counting engine and Re-ID
//!   gallery on a single task (single-writer, no locks)
//! - Drive open -> fetch -> detect -> count -> publish, frame by frame
//! - Persist promoted crossings before broadcasting them
//! - Expose a read-only status snapshot and the newest preview frame
//! - Apply reconfiguration, reset and gallery administration at frame
//!   boundaries via a command channel
//!
//! Frames are never queued: the preview watch always holds the newest
//! frame, and a slow store or subscriber cannot back-pressure capture.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::counting::{CounterStats, CountingEngine, EngineConfig};
use crate::detector::{DetectorConfig, HttpDetector, PersonDetector};
#[cfg(test)]
use crate::detector::Observation;
use crate::error::{Error, Result};
use crate::event_store::{CrossingEvent, EventStore, NewEvent};
use crate::frame_source::{
    backoff_delay, CameraStatus, Frame, FrameResult, FrameSource, HttpFrameSource,
};
use crate::realtime_hub::{HubMessage, RealtimeHub, StatusMessage};
use crate::reid::{
    EmbeddingExtractor, GalleryConfig, HistogramEmbedder, PersonGallery, PersonSummary,
};

/// Frames averaged by the fps EWMA.
const FPS_WINDOW: f64 = 30.0;
/// Consecutive read failures before the source is torn down and reopened.
const MAX_READ_FAILURES: u32 = 3;
/// Command queue depth.
const COMMAND_BUFFER: usize = 16;

/// Everything the worker needs to run one configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub config_id: Option<i64>,
    pub frame_url: String,
    pub masked_url: String,
    /// None means "frame width / 2", resolved from the first frame.
    pub line_x: Option<f32>,
    pub engine: EngineConfig,
    pub detector_url: String,
    pub detector: DetectorConfig,
    pub reid: Option<GalleryConfig>,
    pub gallery_path: PathBuf,
}

/// Read-only worker snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub camera_status: CameraStatus,
    pub model_loaded: bool,
    pub fps: f64,
    pub in_count: u64,
    pub out_count: u64,
    pub active_tracks: usize,
    pub config_id: Option<i64>,
    pub dropped_store_writes: u64,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            camera_status: CameraStatus::Offline,
            model_loaded: false,
            fps: 0.0,
            in_count: 0,
            out_count: 0,
            active_tracks: 0,
            config_id: None,
            dropped_store_writes: 0,
        }
    }
}

/// Commands handled at frame boundaries.
enum WorkerCommand {
    Reconfigure {
        config: Box<WorkerConfig>,
        reset: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        clear_gallery: bool,
        reply: oneshot::Sender<CounterStats>,
    },
    ClearGallery {
        reply: oneshot::Sender<()>,
    },
    CleanupGallery {
        max_age_days: i64,
        reply: oneshot::Sender<usize>,
    },
    GallerySummaries {
        reply: oneshot::Sender<Vec<PersonSummary>>,
    },
    GalleryPerson {
        person_id: String,
        reply: oneshot::Sender<Option<PersonSummary>>,
    },
    Shutdown,
}

/// Cloneable handle to the worker task.
#[derive(Clone)]
pub struct WorkerHandle {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    status_rx: watch::Receiver<WorkerStatus>,
    frame_rx: watch::Receiver<Option<Bytes>>,
}

impl WorkerHandle {
    pub fn status(&self) -> WorkerStatus {
        self.status_rx.borrow().clone()
    }

    /// Newest preview frame receiver (for the MJPEG feed).
    pub fn frames(&self) -> watch::Receiver<Option<Bytes>> {
        self.frame_rx.clone()
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Internal("cv worker is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("cv worker dropped the request".to_string()))
    }

    /// Swap the configuration. The new source is opened and validated
    /// before the old one is closed; on failure the old setup keeps
    /// running and the error is returned.
    pub async fn reconfigure(&self, config: WorkerConfig, reset: bool) -> Result<()> {
        self.send(|reply| WorkerCommand::Reconfigure {
            config: Box::new(config),
            reset,
            reply,
        })
        .await?
    }

    /// Zero counters and clear track state. Stored events are preserved.
    pub async fn reset(&self, clear_gallery: bool) -> Result<CounterStats> {
        self.send(|reply| WorkerCommand::Reset {
            clear_gallery,
            reply,
        })
        .await
    }

    pub async fn clear_gallery(&self) -> Result<()> {
        self.send(|reply| WorkerCommand::ClearGallery { reply }).await
    }

    pub async fn cleanup_gallery(&self, max_age_days: i64) -> Result<usize> {
        self.send(|reply| WorkerCommand::CleanupGallery {
            max_age_days,
            reply,
        })
        .await
    }

    pub async fn gallery_summaries(&self) -> Result<Vec<PersonSummary>> {
        self.send(|reply| WorkerCommand::GallerySummaries { reply }).await
    }

    pub async fn gallery_person(&self, person_id: String) -> Result<Option<PersonSummary>> {
        self.send(|reply| WorkerCommand::GalleryPerson { person_id, reply })
            .await
    }

    /// Stop the worker at the next frame boundary.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(WorkerCommand::Shutdown).await;
    }
}

/// Builds a frame source for a configuration. Swappable for tests.
pub type SourceFactory = Box<dyn Fn(&WorkerConfig) -> Box<dyn FrameSource> + Send>;
/// Builds a detector for a configuration. Swappable for tests.
pub type DetectorFactory = Box<dyn Fn(&WorkerConfig) -> Box<dyn PersonDetector> + Send>;

/// CvWorker entry points.
pub struct CvWorker;

impl CvWorker {
    /// Spawn with the production HTTP source and detector.
    pub fn spawn(
        store: EventStore,
        hub: std::sync::Arc<RealtimeHub>,
        initial: Option<WorkerConfig>,
    ) -> WorkerHandle {
        Self::spawn_with(
            store,
            hub,
            initial,
            Box::new(|config| {
                Box::new(HttpFrameSource::new(
                    config.frame_url.clone(),
                    config.masked_url.clone(),
                ))
            }),
            Box::new(|config| {
                Box::new(HttpDetector::new(
                    config.detector_url.clone(),
                    config.detector.clone(),
                ))
            }),
        )
    }

    /// Spawn with custom source/detector factories.
    pub fn spawn_with(
        store: EventStore,
        hub: std::sync::Arc<RealtimeHub>,
        initial: Option<WorkerConfig>,
        source_factory: SourceFactory,
        detector_factory: DetectorFactory,
    ) -> WorkerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(WorkerStatus::default());
        let (frame_tx, frame_rx) = watch::channel(None);

        let gallery = initial.as_ref().and_then(|config| {
            config
                .reid
                .clone()
                .map(|gc| PersonGallery::load(gc, &config.gallery_path))
        });
        let engine_config = initial
            .as_ref()
            .map(|c| c.engine.clone())
            .unwrap_or_default();
        let line_resolved = initial
            .as_ref()
            .map(|c| c.line_x.is_some())
            .unwrap_or(false);
        let camera_status = if initial.is_some() {
            CameraStatus::Initializing
        } else {
            CameraStatus::Offline
        };

        let worker = Worker {
            store,
            hub,
            cmd_rx,
            status_tx,
            frame_tx,
            source_factory,
            detector_factory,
            config: initial,
            source: None,
            detector: None,
            engine: CountingEngine::new(engine_config),
            gallery,
            embedder: HistogramEmbedder::new(),
            line_resolved,
            camera_status,
            model_loaded: false,
            fps: 0.0,
            last_frame_at: None,
            read_failures: 0,
            open_failures: 0,
            dropped_store_writes: 0,
            started: Instant::now(),
        };

        tokio::spawn(worker.run());

        WorkerHandle {
            cmd_tx,
            status_rx,
            frame_rx,
        }
    }
}

struct Worker {
    store: EventStore,
    hub: std::sync::Arc<RealtimeHub>,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    status_tx: watch::Sender<WorkerStatus>,
    frame_tx: watch::Sender<Option<Bytes>>,
    source_factory: SourceFactory,
    detector_factory: DetectorFactory,

    config: Option<WorkerConfig>,
    source: Option<Box<dyn FrameSource>>,
    detector: Option<Box<dyn PersonDetector>>,
    engine: CountingEngine,
    gallery: Option<PersonGallery>,
    embedder: HistogramEmbedder,
    line_resolved: bool,

    camera_status: CameraStatus,
    model_loaded: bool,
    fps: f64,
    last_frame_at: Option<Instant>,
    read_failures: u32,
    open_failures: u32,
    dropped_store_writes: u64,
    started: Instant,
}

impl Worker {
    async fn run(mut self) {
        tracing::info!("CV worker starting");
        if let Some(config) = &self.config {
            let detector = (self.detector_factory)(config);
            self.model_loaded = detector.healthy().await;
            self.detector = Some(detector);
        }
        self.push_status();

        loop {
            // Commands apply at frame boundaries.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(cmd) => {
                        if !self.handle_command(cmd).await {
                            self.teardown().await;
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.teardown().await;
                        return;
                    }
                }
            }

            if self.config.is_none() {
                // Unconfigured: the control plane stays responsive while
                // capture waits for settings.
                match self.cmd_rx.recv().await {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            self.teardown().await;
                            return;
                        }
                        continue;
                    }
                    None => {
                        self.teardown().await;
                        return;
                    }
                }
            }

            if self.source.is_none() {
                if !self.try_open().await {
                    // Back off, but keep answering commands meanwhile.
                    let wait = backoff_delay(self.open_failures);
                    match tokio::time::timeout(wait, self.cmd_rx.recv()).await {
                        Ok(Some(cmd)) => {
                            if !self.handle_command(cmd).await {
                                self.teardown().await;
                                return;
                            }
                        }
                        Ok(None) => {
                            self.teardown().await;
                            return;
                        }
                        Err(_) => {}
                    }
                }
                continue;
            }

            self.process_next_frame().await;
        }
    }

    async fn teardown(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.close().await;
        }
        self.save_gallery();
        tracing::info!(uptime_sec = self.started.elapsed().as_secs(), "CV worker stopped");
    }

    /// Returns false when the worker should exit.
    async fn handle_command(&mut self, cmd: WorkerCommand) -> bool {
        match cmd {
            WorkerCommand::Reconfigure {
                config,
                reset,
                reply,
            } => {
                let result = self.reconfigure(*config, reset).await;
                let _ = reply.send(result);
            }
            WorkerCommand::Reset {
                clear_gallery,
                reply,
            } => {
                self.engine.reset();
                if let Some(gallery) = self.gallery.as_mut() {
                    if clear_gallery {
                        gallery.clear();
                    } else {
                        gallery.clear_counted();
                    }
                }
                self.push_status();
                self.hub
                    .publish(HubMessage::Status(StatusMessage::notice("Counters reset")));
                let _ = reply.send(self.engine.stats());
            }
            WorkerCommand::ClearGallery { reply } => {
                if let Some(gallery) = self.gallery.as_mut() {
                    gallery.clear();
                }
                self.save_gallery();
                let _ = reply.send(());
            }
            WorkerCommand::CleanupGallery {
                max_age_days,
                reply,
            } => {
                let removed = self
                    .gallery
                    .as_mut()
                    .map(|g| g.cleanup(max_age_days))
                    .unwrap_or(0);
                if removed > 0 {
                    self.save_gallery();
                }
                let _ = reply.send(removed);
            }
            WorkerCommand::GallerySummaries { reply } => {
                let summaries = self
                    .gallery
                    .as_ref()
                    .map(|g| g.summaries())
                    .unwrap_or_default();
                let _ = reply.send(summaries);
            }
            WorkerCommand::GalleryPerson { person_id, reply } => {
                let summary = self.gallery.as_ref().and_then(|g| g.summary(&person_id));
                let _ = reply.send(summary);
            }
            WorkerCommand::Shutdown => return false,
        }
        true
    }

    /// Open a new source and detector for `config`, then swap. The old
    /// source keeps running until the new one has proven it can deliver.
    async fn reconfigure(&mut self, config: WorkerConfig, reset: bool) -> Result<()> {
        let mut new_source = (self.source_factory)(&config);
        new_source.open().await?;

        if let Some(old) = self.source.as_mut() {
            old.close().await;
        }
        self.source = Some(new_source);

        let detector = (self.detector_factory)(&config);
        self.model_loaded = detector.healthy().await;
        self.detector = Some(detector);

        if reset {
            self.engine.reset();
            if let Some(gallery) = self.gallery.as_mut() {
                gallery.clear_counted();
            }
        }
        self.engine.set_config(config.engine.clone());
        self.line_resolved = config.line_x.is_some();
        if let Some(line_x) = config.line_x {
            self.engine.set_line_x(line_x);
        }

        match &config.reid {
            Some(gc) => {
                if let Some(gallery) = self.gallery.as_mut() {
                    gallery.set_config(gc.clone());
                } else {
                    self.gallery = Some(PersonGallery::load(gc.clone(), &config.gallery_path));
                }
            }
            None => {
                self.save_gallery();
                self.gallery = None;
            }
        }

        self.camera_status = CameraStatus::Online;
        self.read_failures = 0;
        self.open_failures = 0;
        tracing::info!(
            config_id = ?config.config_id,
            source = %config.masked_url,
            "Worker reconfigured"
        );
        self.config = Some(config);
        self.push_status();
        self.hub.publish(HubMessage::Status(StatusMessage::notice(
            "Camera source changed",
        )));
        Ok(())
    }

    async fn try_open(&mut self) -> bool {
        let config = self.config.as_ref().expect("config present");
        let mut source = (self.source_factory)(config);
        self.camera_status = CameraStatus::Initializing;
        self.push_status();

        match source.open().await {
            Ok(()) => {
                self.source = Some(source);
                self.camera_status = CameraStatus::Online;
                self.open_failures = 0;
                self.read_failures = 0;
                self.push_status();
                true
            }
            Err(e) => {
                self.open_failures += 1;
                self.camera_status = CameraStatus::Offline;
                self.push_status();
                tracing::warn!(
                    failures = self.open_failures,
                    retry_in_ms = backoff_delay(self.open_failures).as_millis() as u64,
                    error = %e,
                    "Camera open failed"
                );
                false
            }
        }
    }

    async fn process_next_frame(&mut self) {
        let result = self
            .source
            .as_mut()
            .expect("source present")
            .next_frame()
            .await;

        match result {
            FrameResult::Frame(frame) => {
                self.camera_status = CameraStatus::Online;
                self.read_failures = 0;
                self.handle_frame(frame).await;
            }
            FrameResult::TransientError(reason) => {
                self.read_failures += 1;
                self.camera_status = CameraStatus::Offline;
                tracing::warn!(failures = self.read_failures, reason = %reason, "Frame read failed");
                if self.read_failures >= MAX_READ_FAILURES {
                    if let Some(source) = self.source.as_mut() {
                        source.close().await;
                    }
                    self.source = None;
                    self.open_failures = 1;
                } else {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                self.push_status();
            }
            FrameResult::EndOfStream => {
                tracing::info!("Frame source ended");
                if let Some(source) = self.source.as_mut() {
                    source.close().await;
                }
                self.source = None;
                self.open_failures += 1;
                self.camera_status = CameraStatus::Offline;
                self.push_status();
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let now = self.started.elapsed();

        let observations = match self
            .detector
            .as_mut()
            .expect("detector present")
            .process(&frame.jpeg)
            .await
        {
            Ok(observations) => {
                self.model_loaded = true;
                observations
            }
            Err(e) => {
                tracing::warn!(error = %e, "Detection failed, skipping frame");
                self.update_fps();
                self.push_status();
                return;
            }
        };

        // Line position defaults to mid-frame once the width is known.
        if !self.line_resolved {
            if let Ok(decoded) = image::load_from_memory(&frame.jpeg) {
                let line_x = decoded.width() as f32 / 2.0;
                self.engine.set_line_x(line_x);
                self.line_resolved = true;
                tracing::info!(line_x = line_x, "Counting line placed at frame center");
            }
        }

        let reid_enabled = self.gallery.is_some();
        let mut decoded: Option<RgbImage> = None;

        for obs in &observations {
            let embedding = if reid_enabled && self.engine.is_new_track(obs.track_id) {
                if decoded.is_none() {
                    decoded = image::load_from_memory(&frame.jpeg)
                        .ok()
                        .map(|img| img.to_rgb8());
                }
                decoded
                    .as_ref()
                    .and_then(|img| crop_patch(img, obs.bbox))
                    .map(|patch| self.embedder.embed(&patch))
            } else {
                None
            };

            let crossing =
                self.engine
                    .observe(obs, embedding.as_deref(), self.gallery.as_mut(), now);

            if let Some(crossing) = crossing {
                self.publish_crossing(crossing).await;
            }
        }

        self.engine.maybe_cleanup(now);

        let flush_due = self
            .gallery
            .as_mut()
            .map(|g| g.take_flush_due())
            .unwrap_or(false);
        if flush_due {
            self.save_gallery();
        }

        self.frame_tx.send_replace(Some(frame.jpeg));
        self.update_fps();
        self.push_status();
    }

    /// Store first, then broadcast: a subscriber that sees the event can
    /// immediately read it back. A write that exhausts its retries is
    /// broadcast anyway with a placeholder id.
    async fn publish_crossing(&mut self, crossing: crate::counting::Crossing) {
        let new_event = NewEvent {
            timestamp: Utc::now(),
            track_id: crossing.track_id,
            person_id: crossing.person_id.clone(),
            direction: crossing.direction,
        };

        let id = match self.store.insert(&new_event).await {
            Ok(id) => id,
            Err(e) => {
                self.dropped_store_writes += 1;
                tracing::error!(
                    error = %e,
                    dropped = self.dropped_store_writes,
                    "Event dropped from persistence"
                );
                -1
            }
        };

        self.hub.publish(HubMessage::Event(CrossingEvent {
            id,
            timestamp: new_event.timestamp,
            track_id: new_event.track_id,
            person_id: new_event.person_id,
            direction: new_event.direction,
        }));
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_frame_at {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant_fps = 1.0 / dt;
                self.fps += (instant_fps - self.fps) / FPS_WINDOW;
            }
        }
        self.last_frame_at = Some(now);
    }

    fn save_gallery(&self) {
        let Some(gallery) = self.gallery.as_ref() else {
            return;
        };
        let Some(config) = self.config.as_ref() else {
            return;
        };
        if let Err(e) = gallery.save(&config.gallery_path) {
            tracing::warn!(path = %config.gallery_path.display(), error = %e, "Gallery snapshot failed");
        }
    }

    fn push_status(&self) {
        let stats = self.engine.stats();
        self.status_tx.send_replace(WorkerStatus {
            camera_status: self.camera_status,
            model_loaded: self.model_loaded,
            fps: self.fps,
            in_count: stats.in_count,
            out_count: stats.out_count,
            active_tracks: stats.active_tracks,
            config_id: self.config.as_ref().and_then(|c| c.config_id),
            dropped_store_writes: self.dropped_store_writes,
        });
    }
}

/// Clamp a bbox to the image and crop the person patch.
fn crop_patch(image: &RgbImage, bbox: (f32, f32, f32, f32)) -> Option<RgbImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x1 = bbox.0.clamp(0.0, w) as u32;
    let y1 = bbox.1.clamp(0.0, h) as u32;
    let x2 = bbox.2.clamp(0.0, w) as u32;
    let y2 = bbox.3.clamp(0.0, h) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(image::imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::Direction;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Source that replays a scripted frame sequence, then ends.
    struct ScriptedSource {
        frames: Arc<Mutex<VecDeque<Bytes>>>,
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn open(&mut self) -> Result<()> {
            if self.frames.lock().unwrap().is_empty() {
                Err(Error::CameraUnreachable("script exhausted".to_string()))
            } else {
                Ok(())
            }
        }

        async fn next_frame(&mut self) -> FrameResult {
            match self.frames.lock().unwrap().pop_front() {
                Some(jpeg) => FrameResult::Frame(Frame {
                    jpeg,
                    captured_at: Utc::now(),
                }),
                None => FrameResult::EndOfStream,
            }
        }

        async fn close(&mut self) {}

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Detector that replays scripted per-frame observations.
    struct ScriptedDetector {
        batches: Arc<Mutex<VecDeque<Vec<Observation>>>>,
    }

    #[async_trait]
    impl PersonDetector for ScriptedDetector {
        async fn process(&mut self, _jpeg: &[u8]) -> Result<Vec<Observation>> {
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn healthy(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn obs(track_id: i64, cx: f32) -> Observation {
        Observation {
            track_id,
            bbox: (cx - 25.0, 100.0, cx + 25.0, 300.0),
            confidence: 0.9,
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            config_id: Some(1),
            frame_url: "scripted://".to_string(),
            masked_url: "scripted://".to_string(),
            line_x: Some(400.0),
            engine: EngineConfig {
                line_x: 400.0,
                ..EngineConfig::default()
            },
            detector_url: String::new(),
            detector: DetectorConfig::default(),
            reid: None,
            gallery_path: PathBuf::from("/tmp/unused-gallery.json"),
        }
    }

    async fn store() -> EventStore {
        let pool = sqlx::sqlite::SqlitePool::connect("sqlite::memory:")
            .await
            .unwrap();
        let store = EventStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn pipeline_counts_and_persists_a_crossing() {
        let store = store().await;
        let hub = Arc::new(RealtimeHub::new());
        let mut sub = hub.subscribe();

        let frames: Arc<Mutex<VecDeque<Bytes>>> = Arc::new(Mutex::new(
            (0..2).map(|_| Bytes::from_static(b"\xff\xd8fake")).collect(),
        ));
        let batches: Arc<Mutex<VecDeque<Vec<Observation>>>> = Arc::new(Mutex::new(
            vec![vec![obs(1, 300.0)], vec![obs(1, 500.0)]].into(),
        ));

        let handle = CvWorker::spawn_with(
            store.clone(),
            hub.clone(),
            Some(config()),
            Box::new({
                let frames = frames.clone();
                move |_| {
                    Box::new(ScriptedSource {
                        frames: frames.clone(),
                    })
                }
            }),
            Box::new({
                let batches = batches.clone();
                move |_| {
                    Box::new(ScriptedDetector {
                        batches: batches.clone(),
                    })
                }
            }),
        );

        // The hub sees the event after it is stored.
        let message = tokio::time::timeout(Duration::from_secs(5), loop_recv(&mut sub))
            .await
            .expect("event broadcast");
        let HubMessage::Event(event) = message else {
            panic!("expected event message");
        };
        assert_eq!(event.track_id, 1);
        assert_eq!(event.direction, Direction::In);
        assert!(event.id > 0);

        let stored = store.recent(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, event.id);

        // The status watch catches up shortly after the broadcast.
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.status().in_count != 1 {
            assert!(Instant::now() < deadline, "status never updated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
    }

    async fn loop_recv(
        sub: &mut crate::realtime_hub::Subscription,
    ) -> HubMessage {
        loop {
            match sub.receiver.recv().await {
                Ok(msg @ HubMessage::Event(_)) => return msg,
                Ok(_) => continue,
                Err(e) => panic!("hub closed: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn unconfigured_worker_answers_commands() {
        let store = store().await;
        let hub = Arc::new(RealtimeHub::new());
        let handle = CvWorker::spawn(store, hub, None);

        let stats = handle.reset(false).await.unwrap();
        assert_eq!(stats.in_count, 0);

        let persons = handle.gallery_summaries().await.unwrap();
        assert!(persons.is_empty());

        assert_eq!(handle.status().camera_status, CameraStatus::Offline);
        handle.shutdown().await;
    }

    #[test]
    fn crop_patch_clamps_to_image_bounds() {
        let image = RgbImage::new(100, 100);
        let patch = crop_patch(&image, (-10.0, -10.0, 50.0, 120.0)).unwrap();
        assert_eq!(patch.width(), 50);
        assert_eq!(patch.height(), 100);
        assert!(crop_patch(&image, (90.0, 90.0, 80.0, 80.0)).is_none());
    }
}
