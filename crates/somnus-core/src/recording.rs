use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RecordingConfig;
use crate::db::{with_db, SharedDatabase};
use crate::error::{CoreError, Result};
use crate::gateway::{AnalysisGateway, EncodedAudio};
use crate::sanitize::sanitize_html;
use crate::schema::AnalysisData;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no audio input is available: {0}")]
    Unavailable(String),

    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio stream is inactive or has no live tracks")]
    InactiveStream,

    #[error("no audio was captured")]
    EmptyCapture,

    #[error("recorder failed: {0}")]
    Recorder(String),
}

/// Pushed by a running recorder, one per timeslice.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Chunk(Vec<u8>),
    Error(String),
}

/// Source of audio streams (a microphone, a file replay, a test fake).
#[async_trait]
pub trait AudioInput: Send + Sync {
    fn name(&self) -> &str;

    async fn acquire(&self) -> std::result::Result<Box<dyn InputStream>, CaptureError>;
}

/// An acquired audio stream plus its time-sliced recorder.
#[async_trait]
pub trait InputStream: Send {
    fn is_active(&self) -> bool;

    fn live_audio_tracks(&self) -> usize;

    fn mime_type(&self) -> &str;

    /// Begin buffering; every `timeslice` a chunk is pushed into `sink`.
    fn start_recording(
        &mut self,
        timeslice: Duration,
        sink: mpsc::UnboundedSender<RecorderEvent>,
    ) -> std::result::Result<(), CaptureError>;

    /// Stop the recorder. The final partial chunk is in `sink` when this returns.
    /// Calling it twice is a no-op.
    async fn stop_recording(&mut self);

    /// Stop every track. Idempotent.
    fn release(&mut self);

    /// Join buffered chunks into one clip of `mime_type`.
    fn assemble(&self, chunks: Vec<Vec<u8>>) -> std::result::Result<Vec<u8>, CaptureError> {
        Ok(chunks.concat())
    }
}

/// Fullscreen/dimming hooks requested while tracking.
pub trait DisplayControl: Send + Sync {
    fn enter_focus(&self) -> Result<()>;
    fn exit_focus(&self) -> Result<()>;
}

pub struct NoopDisplay;

impl DisplayControl for NoopDisplay {
    fn enter_focus(&self) -> Result<()> {
        Ok(())
    }

    fn exit_focus(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Idle,
    Requesting,
    Tracking,
    Analyzing,
    Results,
    Error,
}

impl RecordingStatus {
    /// Requesting, tracking and analyzing hold the microphone or await the model.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecordingStatus::Requesting | RecordingStatus::Tracking | RecordingStatus::Analyzing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEntry {
    pub at: String,
    pub message: String,
}

impl DebugEntry {
    fn now(message: impl Into<String>) -> Self {
        Self {
            at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResults {
    pub session: AnalysisData,
    /// Sanitized HTML.
    pub suggestions: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSnapshot {
    pub status: RecordingStatus,
    pub elapsed_seconds: u64,
    pub chunk_count: usize,
    pub results: Option<SessionResults>,
    pub error: Option<String>,
    pub playback_path: Option<String>,
    pub debug_log: Vec<DebugEntry>,
}

/// Captured audio on its way to the model, detached from the controller.
pub struct AnalysisJob {
    epoch: u64,
    /// The controller's live epoch; a reset bumps it and the job stops short of saving.
    current_epoch: Arc<AtomicU64>,
    audio: Vec<u8>,
    mime_type: String,
    duration_seconds: f64,
    gateway: Arc<dyn AnalysisGateway>,
    db: SharedDatabase,
    playback_dir: Option<PathBuf>,
}

pub struct AnalysisOutcome {
    epoch: u64,
    result: Result<SessionResults>,
    playback_path: Option<PathBuf>,
    log: Vec<DebugEntry>,
}

impl AnalysisJob {
    pub async fn run(self) -> AnalysisOutcome {
        let mut log = Vec::new();
        let mut playback_path = None;

        if let Some(dir) = &self.playback_dir {
            match write_playback_copy(dir, self.epoch, &self.mime_type, &self.audio).await {
                Ok(path) => {
                    log.push(DebugEntry::now(format!(
                        "saved playback copy to {}",
                        path.display()
                    )));
                    playback_path = Some(path);
                }
                Err(e) => warn!("failed to write playback copy: {e}"),
            }
        }

        let result = self.analyze(&mut log).await;
        AnalysisOutcome {
            epoch: self.epoch,
            result,
            playback_path,
            log,
        }
    }

    async fn analyze(&self, log: &mut Vec<DebugEntry>) -> Result<SessionResults> {
        let encoded = EncodedAudio {
            mime_type: self.mime_type.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&self.audio),
        };
        log.push(DebugEntry::now(format!(
            "sending {} bytes ({} encoded) to {}",
            self.audio.len(),
            encoded.data.len(),
            self.gateway.name()
        )));

        let analysis = self
            .gateway
            .analyze_audio(&encoded, self.duration_seconds)
            .await?;
        let date = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let session = analysis.into_record(date);
        log.push(DebugEntry::now(format!(
            "analysis received: score {}, {} events, {} stages",
            session.sleep_score,
            session.events.len(),
            session.stages.len()
        )));

        if self.current_epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(CoreError::Task(
                "recording was reset before the session was saved".to_string(),
            ));
        }
        let stored = session.clone();
        with_db(&self.db, move |db| db.put_session(&stored)).await?;
        log.push(DebugEntry::now(format!("session {} saved", session.date)));

        let html = self.gateway.suggestions(&session).await?;
        log.push(DebugEntry::now("suggestions received"));

        Ok(SessionResults {
            session,
            suggestions: sanitize_html(&html),
        })
    }
}

async fn write_playback_copy(
    dir: &std::path::Path,
    epoch: u64,
    mime_type: &str,
    audio: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let path = dir.join(format!("{stamp}-{epoch}.{}", extension_for(mime_type)));
    tokio::fs::write(&path, audio).await?;
    Ok(path)
}

fn extension_for(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or_default().trim();
    match base {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/flac" => "flac",
        _ => "bin",
    }
}

/// One overnight recording session, from microphone request to rendered results.
pub struct RecordingController {
    input: Arc<dyn AudioInput>,
    gateway: Arc<dyn AnalysisGateway>,
    db: SharedDatabase,
    display: Arc<dyn DisplayControl>,
    timeslice: Duration,
    playback_dir: Option<PathBuf>,

    status: RecordingStatus,
    epoch: Arc<AtomicU64>,
    stream: Option<Box<dyn InputStream>>,
    events: Option<mpsc::UnboundedReceiver<RecorderEvent>>,
    chunks: Vec<Vec<u8>>,
    elapsed: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
    playback_path: Option<PathBuf>,
    results: Option<SessionResults>,
    error: Option<String>,
    debug_log: Vec<DebugEntry>,
}

impl RecordingController {
    /// `playback_dir` is only used when `keep_playback_copy` is set.
    pub fn new(
        input: Arc<dyn AudioInput>,
        gateway: Arc<dyn AnalysisGateway>,
        db: SharedDatabase,
        config: &RecordingConfig,
        playback_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            input,
            gateway,
            db,
            display: Arc::new(NoopDisplay),
            timeslice: Duration::from_millis(config.timeslice_ms.max(1)),
            playback_dir: playback_dir.filter(|_| config.keep_playback_copy),
            status: RecordingStatus::Idle,
            epoch: Arc::new(AtomicU64::new(0)),
            stream: None,
            events: None,
            chunks: Vec::new(),
            elapsed: Arc::new(AtomicU64::new(0)),
            ticker: None,
            playback_path: None,
            results: None,
            error: None,
            debug_log: Vec::new(),
        }
    }

    pub fn with_display(mut self, display: Arc<dyn DisplayControl>) -> Self {
        self.display = display;
        self
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed.load(Ordering::Relaxed)
    }

    pub fn results(&self) -> Option<&SessionResults> {
        self.results.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn debug_log(&self) -> &[DebugEntry] {
        &self.debug_log
    }

    pub fn snapshot(&self) -> RecordingSnapshot {
        RecordingSnapshot {
            status: self.status,
            elapsed_seconds: self.elapsed_seconds(),
            chunk_count: self.chunks.len(),
            results: self.results.clone(),
            error: self.error.clone(),
            playback_path: self
                .playback_path
                .as_ref()
                .map(|p| p.display().to_string()),
            debug_log: self.debug_log.clone(),
        }
    }

    fn log(&mut self, message: impl Into<String>) {
        let entry = DebugEntry::now(message);
        debug!(status = ?self.status, "{}", entry.message);
        self.debug_log.push(entry);
    }

    /// Request the microphone and begin tracking.
    pub async fn start(&mut self) -> Result<()> {
        if self.status != RecordingStatus::Idle {
            return Err(CoreError::InvalidInput(format!(
                "cannot start recording while {:?}",
                self.status
            )));
        }

        self.status = RecordingStatus::Requesting;
        self.log(format!("requesting audio input '{}'", self.input.name()));

        let mut stream = match self.input.acquire().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(e)),
        };

        if !stream.is_active() || stream.live_audio_tracks() == 0 {
            stream.release();
            return Err(self.fail(CaptureError::InactiveStream));
        }
        self.log(format!(
            "stream acquired: {} live track(s), {}",
            stream.live_audio_tracks(),
            stream.mime_type()
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = stream.start_recording(self.timeslice, tx) {
            stream.release();
            return Err(self.fail(e));
        }

        self.stream = Some(stream);
        self.events = Some(rx);
        self.chunks.clear();
        self.elapsed.store(0, Ordering::Relaxed);
        self.ticker = Some(spawn_ticker(self.elapsed.clone()));
        self.status = RecordingStatus::Tracking;
        self.log(format!("recording in {} ms slices", self.timeslice.as_millis()));
        info!(input = self.input.name(), "recording started");

        if let Err(e) = self.display.enter_focus() {
            warn!("could not enter focus mode: {e}");
        }
        Ok(())
    }

    /// Drain pending recorder events. A recorder error ends the session.
    pub fn poll(&mut self) -> RecordingStatus {
        let mut failure = None;
        if let Some(rx) = self.events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                match event {
                    RecorderEvent::Chunk(bytes) => {
                        if !bytes.is_empty() {
                            self.chunks.push(bytes);
                        }
                    }
                    RecorderEvent::Error(message) => {
                        failure = Some(message);
                        break;
                    }
                }
            }
        }

        if let Some(message) = failure {
            if self.status == RecordingStatus::Tracking {
                self.fail(CaptureError::Recorder(message));
            }
        }
        self.status
    }

    /// Stop tracking and hand the captured audio off for analysis.
    ///
    /// Leaves the controller in `Analyzing`; the returned job runs without
    /// borrowing the controller and its outcome goes to [`Self::finish_analysis`].
    pub async fn begin_analysis(&mut self) -> Result<AnalysisJob> {
        if self.status != RecordingStatus::Tracking {
            return Err(CoreError::InvalidInput(format!(
                "cannot stop recording while {:?}",
                self.status
            )));
        }

        if let Some(stream) = self.stream.as_mut() {
            stream.stop_recording().await;
        }
        self.poll();
        if self.status != RecordingStatus::Tracking {
            return Err(CoreError::Capture(CaptureError::Recorder(
                self.error.clone().unwrap_or_default(),
            )));
        }

        let mime_type = self
            .stream
            .as_ref()
            .map(|s| s.mime_type().to_string())
            .unwrap_or_default();
        let chunks = std::mem::take(&mut self.chunks);
        let assembled = match self.stream.as_ref() {
            Some(stream) if !chunks.is_empty() => stream.assemble(chunks),
            _ => Err(CaptureError::EmptyCapture),
        };

        self.stop_capture();
        let duration_seconds = self.elapsed_seconds();
        self.log(format!("recording stopped after {duration_seconds} s"));

        let audio = match assembled {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => return Err(self.fail(CaptureError::EmptyCapture)),
            Err(e) => return Err(self.fail(e)),
        };

        self.status = RecordingStatus::Analyzing;
        self.log(format!("assembled {} bytes of {mime_type}", audio.len()));
        info!(bytes = audio.len(), duration_seconds, "analyzing recording");

        Ok(AnalysisJob {
            epoch: self.epoch.load(Ordering::SeqCst),
            current_epoch: self.epoch.clone(),
            audio,
            mime_type,
            duration_seconds: duration_seconds as f64,
            gateway: self.gateway.clone(),
            db: self.db.clone(),
            playback_dir: self.playback_dir.clone(),
        })
    }

    /// Apply a finished job. Outcomes from before the last reset are discarded.
    pub async fn finish_analysis(&mut self, outcome: AnalysisOutcome) -> Result<()> {
        if outcome.epoch != self.epoch.load(Ordering::SeqCst)
            || self.status != RecordingStatus::Analyzing {
            debug!(epoch = outcome.epoch, "discarding stale analysis outcome");
            if let Some(path) = outcome.playback_path {
                remove_playback_copy(&path).await;
            }
            return Ok(());
        }

        self.debug_log.extend(outcome.log);
        self.playback_path = outcome.playback_path;
        match outcome.result {
            Ok(results) => {
                info!(
                    date = %results.session.date,
                    score = results.session.sleep_score,
                    "session analyzed"
                );
                self.results = Some(results);
                self.status = RecordingStatus::Results;
                self.log("results ready");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                error!("analysis failed: {message}");
                self.status = RecordingStatus::Error;
                self.error = Some(message.clone());
                self.log(format!("error: {message}"));
                Err(e)
            }
        }
    }

    /// Stop, analyze, persist and fetch suggestions in one call.
    pub async fn stop(&mut self) -> Result<()> {
        let job = self.begin_analysis().await?;
        let outcome = job.run().await;
        self.finish_analysis(outcome).await
    }

    /// Return to `Idle` from any state, dropping everything the session held.
    pub async fn reset(&mut self) {
        self.stop_capture();
        if let Some(path) = self.playback_path.take() {
            remove_playback_copy(&path).await;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.events = None;
        self.chunks.clear();
        self.elapsed.store(0, Ordering::Relaxed);
        self.results = None;
        self.error = None;
        self.debug_log.clear();
        self.status = RecordingStatus::Idle;
        debug!(epoch, "recording controller reset");
    }

    fn stop_capture(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
            if let Err(e) = self.display.exit_focus() {
                warn!("could not exit focus mode: {e}");
            }
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    fn fail(&mut self, cause: CaptureError) -> CoreError {
        self.stop_capture();
        let message = cause.to_string();
        warn!("recording failed: {message}");
        self.status = RecordingStatus::Error;
        self.error = Some(message.clone());
        self.log(format!("error: {message}"));
        CoreError::Capture(cause)
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

fn spawn_ticker(elapsed: Arc<AtomicU64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(1);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            elapsed.fetch_add(1, Ordering::Relaxed);
        }
    })
}

async fn remove_playback_copy(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed playback copy"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove playback copy: {e}"),
    }
}
