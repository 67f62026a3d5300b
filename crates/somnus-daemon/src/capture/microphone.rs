use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use somnus_core::recording::{AudioInput, CaptureError, InputStream, RecorderEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default input device through cpal, recorded as 16-bit mono WAV.
pub struct MicrophoneInput;

impl MicrophoneInput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MicrophoneInput {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Shared {
    samples: Mutex<Vec<i16>>,
    recording: AtomicBool,
    active: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn push(&self, mono: impl Iterator<Item = i16>) {
        if !self.recording.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(mut buf) = self.samples.lock() {
            buf.extend(mono);
        }
    }

    fn drain_bytes(&self) -> Vec<u8> {
        let samples = match self.samples.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => return Vec::new(),
        };
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn take_failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|mut f| f.take())
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[async_trait]
impl AudioInput for MicrophoneInput {
    fn name(&self) -> &str {
        "microphone"
    }

    async fn acquire(&self) -> Result<Box<dyn InputStream>, CaptureError> {
        let shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        // cpal streams are not Send; the stream lives on its own thread until released.
        let thread_shared = shared.clone();
        std::thread::spawn(move || {
            let stream = match open_stream(thread_shared.clone()) {
                Ok((stream, sample_rate)) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = stop_rx.recv();
            drop(stream);
            thread_shared.active.store(false, Ordering::SeqCst);
            debug!("microphone stream closed");
        });

        let sample_rate = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| CaptureError::Recorder(format!("audio thread failed: {e}")))?
            .map_err(|_| CaptureError::Recorder("audio thread exited".to_string()))??;

        info!(sample_rate, "microphone opened");
        Ok(Box::new(MicrophoneStream {
            shared,
            sample_rate,
            stop_tx: Some(stop_tx),
            task: None,
            sink: None,
        }))
    }
}

fn open_stream(shared: Arc<Shared>) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::Unavailable("no default input device".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Unavailable(format!("no usable input config: {e}")))?;

    let sample_format = supported.sample_format();
    let config = supported.config();
    let sample_rate = config.sample_rate.0;
    let channels = usize::from(config.channels.max(1));

    let err_shared = shared.clone();
    let on_error = move |e: cpal::StreamError| {
        warn!("microphone stream error: {e}");
        err_shared.active.store(false, Ordering::SeqCst);
        if let Ok(mut failure) = err_shared.failure.lock() {
            failure.get_or_insert_with(|| e.to_string());
        }
    };

    let build_err = |e: cpal::BuildStreamError| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::Unavailable("input device disappeared".to_string())
        }
        // Backends surface a blocked microphone as a backend-specific error.
        other => CaptureError::PermissionDenied(other.to_string()),
    };

    let stream = match sample_format {
        SampleFormat::F32 => {
            let s = shared.clone();
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _| {
                        s.push(data.chunks(channels).map(|frame| {
                            f32_to_i16(frame.iter().sum::<f32>() / frame.len() as f32)
                        }))
                    },
                    on_error,
                    None,
                )
                .map_err(build_err)?
        }
        SampleFormat::I16 => {
            let s = shared.clone();
            device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _| {
                        s.push(data.chunks(channels).map(|frame| {
                            (frame.iter().map(|v| i32::from(*v)).sum::<i32>() / frame.len() as i32)
                                as i16
                        }))
                    },
                    on_error,
                    None,
                )
                .map_err(build_err)?
        }
        other => {
            return Err(CaptureError::Unavailable(format!(
                "unsupported input sample format: {other:?}"
            )))
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::PermissionDenied(format!("failed to start input: {e}")))?;
    shared.active.store(true, Ordering::SeqCst);
    Ok((stream, sample_rate))
}

struct MicrophoneStream {
    shared: Arc<Shared>,
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
    sink: Option<mpsc::UnboundedSender<RecorderEvent>>,
}

#[async_trait]
impl InputStream for MicrophoneStream {
    fn is_active(&self) -> bool {
        self.stop_tx.is_some() && self.shared.active.load(Ordering::SeqCst)
    }

    fn live_audio_tracks(&self) -> usize {
        usize::from(self.is_active())
    }

    fn mime_type(&self) -> &str {
        "audio/wav"
    }

    fn start_recording(
        &mut self,
        timeslice: Duration,
        sink: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), CaptureError> {
        if !self.is_active() {
            return Err(CaptureError::InactiveStream);
        }
        self.shared.recording.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let tx = sink.clone();
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);
            loop {
                interval.tick().await;
                if let Some(message) = shared.take_failure() {
                    let _ = tx.send(RecorderEvent::Error(message));
                    break;
                }
                let chunk = shared.drain_bytes();
                if !chunk.is_empty() && tx.send(RecorderEvent::Chunk(chunk)).is_err() {
                    break;
                }
            }
        }));
        self.sink = Some(sink);
        Ok(())
    }

    async fn stop_recording(&mut self) {
        self.shared.recording.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(sink) = self.sink.take() {
            let chunk = self.shared.drain_bytes();
            if !chunk.is_empty() {
                let _ = sink.send(RecorderEvent::Chunk(chunk));
            }
        }
    }

    fn release(&mut self) {
        self.shared.recording.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.sink = None;
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }

    fn assemble(&self, chunks: Vec<Vec<u8>>) -> Result<Vec<u8>, CaptureError> {
        encode_wav(&chunks.concat(), self.sample_rate)
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Wrap little-endian 16-bit mono PCM in a WAV container.
fn encode_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, CaptureError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = Vec::new();
    let mut writer = hound::WavWriter::new(Cursor::new(&mut out), spec)
        .map_err(|e| CaptureError::Recorder(format!("failed to start WAV: {e}")))?;
    for pair in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
            .map_err(|e| CaptureError::Recorder(format!("failed to write WAV: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| CaptureError::Recorder(format!("failed to finish WAV: {e}")))?;
    Ok(out)
}
