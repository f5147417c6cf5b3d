// Live video pipeline: capture, processing, and statistics workers around a
// bounded frame buffer.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nocturne_types::{EngineError, Result};

use crate::driver::{ControlKind, RoiFormat};
use crate::frame::{CameraFrame, ImageFormat};
use crate::hardware::HardwareInterface;

const CAPTURE_WAIT_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Error,
}

/// What to do with a new frame when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    #[default]
    DropOldest,
    DropIncoming,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    /// 0 means full frame.
    pub width: u32,
    pub height: u32,
    pub start_x: u32,
    pub start_y: u32,
    pub binning: u32,
    pub format: ImageFormat,
    pub fps: f64,
    pub exposure_micros: i64,
    pub gain: i64,
    pub buffer_size: usize,
    pub drop_policy: DropPolicy,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            start_x: 0,
            start_y: 0,
            binning: 1,
            format: ImageFormat::Raw16,
            fps: 30.0,
            exposure_micros: 33_000,
            gain: 0,
            buffer_size: 10,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

impl VideoSettings {
    fn validate(&self) -> Result<()> {
        if self.binning < 1 || self.binning > 8 {
            return Err(EngineError::Validation(format!(
                "binning {} outside [1, 8]",
                self.binning
            )));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::Validation("buffer size must be positive".into()));
        }
        if self.fps <= 0.0 {
            return Err(EngineError::Validation(format!(
                "frame rate {} must be positive",
                self.fps
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VideoStatistics {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub actual_fps: f64,
    /// MB/s over the last statistics window.
    pub data_rate: f64,
}

pub type StatisticsCallback = Arc<dyn Fn(&VideoStatistics) + Send + Sync>;

#[derive(Default)]
struct StatsInner {
    received: u64,
    processed: u64,
    dropped: u64,
    window_frames: u64,
    window_bytes: u64,
    actual_fps: f64,
    data_rate: f64,
}

struct Recording {
    file: File,
    path: PathBuf,
    codec: String,
    frames: u64,
}

struct VideoInner {
    hardware: Arc<HardwareInterface>,
    state: StdRwLock<VideoState>,
    settings: StdRwLock<VideoSettings>,
    buffer: StdMutex<VecDeque<Arc<CameraFrame>>>,
    stats: StdMutex<StatsInner>,
    stats_interval: StdRwLock<Duration>,
    stats_cb: StdMutex<Option<StatisticsCallback>>,
    recording: StdMutex<Option<Recording>>,
}

pub struct VideoManager {
    inner: Arc<VideoInner>,
    cancel: StdMutex<CancellationToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl VideoManager {
    pub fn new(hardware: Arc<HardwareInterface>) -> Self {
        Self {
            inner: Arc::new(VideoInner {
                hardware,
                state: StdRwLock::new(VideoState::Idle),
                settings: StdRwLock::new(VideoSettings::default()),
                buffer: StdMutex::new(VecDeque::new()),
                stats: StdMutex::new(StatsInner::default()),
                stats_interval: StdRwLock::new(Duration::from_secs(1)),
                stats_cb: StdMutex::new(None),
                recording: StdMutex::new(None),
            }),
            cancel: StdMutex::new(CancellationToken::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub async fn start_video(&self, settings: VideoSettings) -> Result<()> {
        settings.validate()?;
        if self.state() != VideoState::Idle {
            return Err(EngineError::InvalidOperation(format!(
                "video pipeline is not idle (state {:?})",
                self.state()
            )));
        }
        self.inner.set_state(VideoState::Starting);

        let info = self
            .inner
            .hardware
            .camera_info()
            .await
            .ok_or_else(|| EngineError::Resource("camera not connected".into()))?;
        let width = if settings.width == 0 {
            info.max_width / settings.binning
        } else {
            settings.width
        };
        let height = if settings.height == 0 {
            info.max_height / settings.binning
        } else {
            settings.height
        };

        let configure = async {
            self.inner
                .hardware
                .set_roi(RoiFormat {
                    start_x: settings.start_x,
                    start_y: settings.start_y,
                    width,
                    height,
                    binning: settings.binning,
                    format: settings.format,
                })
                .await?;
            self.inner
                .hardware
                .set_control(ControlKind::Exposure, settings.exposure_micros, false)
                .await?;
            self.inner
                .hardware
                .set_control(ControlKind::Gain, settings.gain, false)
                .await?;
            self.inner.hardware.start_video_capture().await
        };
        if let Err(e) = configure.await {
            self.inner.set_state(VideoState::Error);
            return Err(e);
        }

        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = settings.clone();
        *self.inner.stats.lock().unwrap_or_else(|e| e.into_inner()) = StatsInner::default();

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();

        // Capture hands frames to processing over a one-slot channel so the
        // buffer-size invariant bounds the whole pipeline.
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(1);
        let frame_len = width as usize * height as usize * settings.format.bytes_per_pixel();

        let capture = {
            let inner = self.inner.clone();
            let token = token.clone();
            tokio::spawn(async move {
                inner.capture_worker(token, frame_tx, frame_len).await;
            })
        };
        let processing = {
            let inner = self.inner.clone();
            let token = token.clone();
            let dims = (width, height);
            let settings = settings.clone();
            tokio::spawn(async move {
                inner.processing_worker(token, frame_rx, dims, settings).await;
            })
        };
        let statistics = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.statistics_worker(token).await;
            })
        };

        let mut workers = self.workers.lock().await;
        workers.clear();
        workers.extend([capture, processing, statistics]);
        self.inner.set_state(VideoState::Streaming);
        debug!(width, height, "video streaming started");
        Ok(())
    }

    /// Signals the workers, joins them, and drains the buffer.
    pub async fn stop_video(&self) -> Result<()> {
        if matches!(self.state(), VideoState::Idle) {
            return Ok(());
        }
        self.inner.set_state(VideoState::Stopping);
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        let _ = self.inner.hardware.stop_video_capture().await;
        self.stop_recording().ok();
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner.set_state(VideoState::Idle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frames and recording
    // ------------------------------------------------------------------

    /// Dequeues the next frame in arrival order.
    pub fn latest_frame(&self) -> Option<Arc<CameraFrame>> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn frames_buffered(&self) -> usize {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn start_recording(&self, path: &Path, codec: &str) -> Result<()> {
        if self.state() != VideoState::Streaming {
            return Err(EngineError::InvalidOperation(
                "recording requires an active stream".into(),
            ));
        }
        let mut recording = self
            .inner
            .recording
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if recording.is_some() {
            return Err(EngineError::InvalidOperation(
                "recording already active".into(),
            ));
        }
        let file = File::create(path)?;
        *recording = Some(Recording {
            file,
            path: path.to_path_buf(),
            codec: codec.to_string(),
            frames: 0,
        });
        Ok(())
    }

    /// Stops recording and returns `(path, codec, frames_written)`.
    pub fn stop_recording(&self) -> Result<(PathBuf, String, u64)> {
        let mut recording = self
            .inner
            .recording
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match recording.take() {
            Some(rec) => Ok((rec.path, rec.codec, rec.frames)),
            None => Err(EngineError::InvalidOperation("no recording active".into())),
        }
    }

    // ------------------------------------------------------------------
    // State and statistics
    // ------------------------------------------------------------------

    pub fn state(&self) -> VideoState {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == VideoState::Streaming
    }

    pub fn statistics(&self) -> VideoStatistics {
        let stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
        VideoStatistics {
            frames_received: stats.received,
            frames_processed: stats.processed,
            frames_dropped: stats.dropped,
            actual_fps: stats.actual_fps,
            data_rate: stats.data_rate,
        }
    }

    pub fn reset_statistics(&self) {
        *self.inner.stats.lock().unwrap_or_else(|e| e.into_inner()) = StatsInner::default();
    }

    pub fn settings(&self) -> VideoSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Exposure, gain, and frame-rate updates are only accepted while idle.
    pub fn update_settings(&self, settings: VideoSettings) -> Result<()> {
        settings.validate()?;
        if self.state() != VideoState::Idle {
            return Err(EngineError::InvalidOperation(
                "settings can only change while the pipeline is idle".into(),
            ));
        }
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    pub fn set_statistics_interval(&self, interval: Duration) {
        *self
            .inner
            .stats_interval
            .write()
            .unwrap_or_else(|e| e.into_inner()) = interval;
    }

    pub fn set_statistics_callback(&self, callback: StatisticsCallback) {
        *self
            .inner
            .stats_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }
}

impl VideoInner {
    fn set_state(&self, state: VideoState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    async fn capture_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
        frame_tx: mpsc::Sender<Vec<u8>>,
        frame_len: usize,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.hardware.video_data(frame_len, CAPTURE_WAIT_MS).await {
                Ok(data) => {
                    {
                        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                        stats.received += 1;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = frame_tx.send(data) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(EngineError::Timeout(_)) => {
                    // no frame inside the wait window; try again
                }
                Err(e) => {
                    warn!(error = %e, "video capture error");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    }
                }
            }
        }
    }

    async fn processing_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut frame_rx: mpsc::Receiver<Vec<u8>>,
        dims: (u32, u32),
        settings: VideoSettings,
    ) {
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => return,
                received = frame_rx.recv() => match received {
                    Some(data) => data,
                    None => return,
                },
            };

            let bytes = data.len() as u64;
            let frame = Arc::new(CameraFrame {
                width: dims.0,
                height: dims.1,
                binning: settings.binning,
                format: settings.format,
                is_dark: false,
                exposure_secs: settings.exposure_micros as f64 / 1_000_000.0,
                captured_at: Utc::now(),
                data,
            });

            {
                let mut recording = self.recording.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(rec) = recording.as_mut() {
                    if rec.file.write_all(&frame.data).is_ok() {
                        rec.frames += 1;
                    }
                }
            }

            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.len() >= settings.buffer_size {
                match settings.drop_policy {
                    DropPolicy::DropOldest => {
                        buffer.pop_front();
                        stats.dropped += 1;
                    }
                    DropPolicy::DropIncoming => {
                        stats.dropped += 1;
                        continue;
                    }
                }
            }
            buffer.push_back(frame);
            stats.processed += 1;
            stats.window_frames += 1;
            stats.window_bytes += bytes;
        }
    }

    async fn statistics_worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut window_start = Instant::now();
        loop {
            let interval = *self
                .stats_interval
                .read()
                .unwrap_or_else(|e| e.into_inner());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let elapsed = window_start.elapsed().as_secs_f64().max(f64::EPSILON);
            window_start = Instant::now();
            let snapshot = {
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.actual_fps = stats.window_frames as f64 / elapsed;
                stats.data_rate = stats.window_bytes as f64 / elapsed / (1024.0 * 1024.0);
                stats.window_frames = 0;
                stats.window_bytes = 0;
                VideoStatistics {
                    frames_received: stats.received,
                    frames_processed: stats.processed,
                    frames_dropped: stats.dropped,
                    actual_fps: stats.actual_fps,
                    data_rate: stats.data_rate,
                }
            };
            let callback = self
                .stats_cb
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(callback) = callback {
                callback(&snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCamera;

    async fn manager() -> VideoManager {
        let hw = Arc::new(HardwareInterface::new(Arc::new(SimulatedCamera::new(1))));
        hw.initialize().await.unwrap();
        hw.connect_first().await.unwrap();
        VideoManager::new(hw)
    }

    fn quick_settings() -> VideoSettings {
        VideoSettings {
            width: 32,
            height: 24,
            format: ImageFormat::Raw8,
            exposure_micros: 2_000,
            buffer_size: 4,
            ..VideoSettings::default()
        }
    }

    #[tokio::test]
    async fn streaming_delivers_frames_fifo() {
        let video = manager().await;
        video.start_video(quick_settings()).await.unwrap();
        assert!(video.is_streaming());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let first = video.latest_frame().expect("frame available");
        assert_eq!(first.data.len(), 32 * 24);
        video.stop_video().await.unwrap();
        assert_eq!(video.state(), VideoState::Idle);
        assert_eq!(video.frames_buffered(), 0);
    }

    #[tokio::test]
    async fn start_requires_idle() {
        let video = manager().await;
        video.start_video(quick_settings()).await.unwrap();
        assert!(video.start_video(quick_settings()).await.is_err());
        video.stop_video().await.unwrap();
    }

    #[tokio::test]
    async fn buffer_never_exceeds_capacity() {
        let video = manager().await;
        video.start_video(quick_settings()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(video.frames_buffered() <= 4);
        let stats = video.statistics();
        assert!(stats.frames_received >= stats.frames_processed);
        // received - processed is bounded by the buffer plus in-flight work
        assert!(stats.frames_received - stats.frames_processed <= 4 + 3);
        video.stop_video().await.unwrap();
    }

    #[tokio::test]
    async fn settings_update_rejected_while_streaming() {
        let video = manager().await;
        video.start_video(quick_settings()).await.unwrap();
        assert!(video.update_settings(quick_settings()).is_err());
        video.stop_video().await.unwrap();
        assert!(video.update_settings(quick_settings()).is_ok());
    }

    #[tokio::test]
    async fn recording_requires_streaming() {
        let video = manager().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.nvr");
        assert!(video.start_recording(&path, "raw").is_err());

        video.start_video(quick_settings()).await.unwrap();
        video.start_recording(&path, "raw").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (saved, codec, frames) = video.stop_recording().unwrap();
        assert_eq!(saved, path);
        assert_eq!(codec, "raw");
        assert!(frames > 0);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        video.stop_video().await.unwrap();
    }

    #[tokio::test]
    async fn statistics_callback_reports_fps() {
        let video = manager().await;
        video.set_statistics_interval(Duration::from_millis(50));
        let reported = Arc::new(StdMutex::new(Vec::new()));
        let sink = reported.clone();
        video.set_statistics_callback(Arc::new(move |stats| {
            sink.lock().unwrap().push(stats.actual_fps);
        }));
        video.start_video(quick_settings()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        video.stop_video().await.unwrap();
        assert!(!reported.lock().unwrap().is_empty());
    }
}
