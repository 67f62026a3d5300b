use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use somnus_core::recording::{AudioInput, CaptureError, InputStream, RecorderEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::mime_for_path;

/// Replay rate: 16 kHz mono 16-bit PCM.
const REPLAY_BYTES_PER_SECOND: usize = 32_000;

/// Replays an audio file as if it were being recorded live.
pub struct FileInput {
    path: PathBuf,
}

impl FileInput {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl AudioInput for FileInput {
    fn name(&self) -> &str {
        "file"
    }

    async fn acquire(&self) -> Result<Box<dyn InputStream>, CaptureError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            CaptureError::Unavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), bytes = data.len(), "loaded replay file");

        Ok(Box::new(FileStream {
            data: Arc::new(data),
            mime_type: mime_for_path(&self.path),
            position: Arc::new(AtomicUsize::new(0)),
            slice_bytes: REPLAY_BYTES_PER_SECOND,
            task: None,
            sink: None,
            released: false,
        }))
    }
}

struct FileStream {
    data: Arc<Vec<u8>>,
    mime_type: &'static str,
    position: Arc<AtomicUsize>,
    slice_bytes: usize,
    task: Option<JoinHandle<()>>,
    sink: Option<mpsc::UnboundedSender<RecorderEvent>>,
    released: bool,
}

/// Take the next slice, advancing the shared cursor.
fn next_slice(data: &[u8], position: &AtomicUsize, slice_bytes: usize) -> Option<Vec<u8>> {
    let start = position.load(Ordering::SeqCst);
    if start >= data.len() {
        return None;
    }
    let end = (start + slice_bytes).min(data.len());
    position.store(end, Ordering::SeqCst);
    Some(data[start..end].to_vec())
}

#[async_trait]
impl InputStream for FileStream {
    fn is_active(&self) -> bool {
        !self.released && !self.data.is_empty()
    }

    fn live_audio_tracks(&self) -> usize {
        usize::from(self.is_active())
    }

    fn mime_type(&self) -> &str {
        self.mime_type
    }

    fn start_recording(
        &mut self,
        timeslice: Duration,
        sink: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), CaptureError> {
        if self.released {
            return Err(CaptureError::InactiveStream);
        }
        let per_slice = (REPLAY_BYTES_PER_SECOND as u128 * timeslice.as_millis() / 1000) as usize;
        self.slice_bytes = per_slice.max(1);

        let data = self.data.clone();
        let position = self.position.clone();
        let slice_bytes = self.slice_bytes;
        let tx = sink.clone();
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);
            loop {
                interval.tick().await;
                match next_slice(&data, &position, slice_bytes) {
                    Some(chunk) => {
                        if tx.send(RecorderEvent::Chunk(chunk)).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }));
        self.sink = Some(sink);
        Ok(())
    }

    async fn stop_recording(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(sink) = self.sink.take() {
            if let Some(chunk) = next_slice(&self.data, &self.position, self.slice_bytes) {
                let _ = sink.send(RecorderEvent::Chunk(chunk));
            }
        }
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.sink = None;
        self.released = true;
    }
}
