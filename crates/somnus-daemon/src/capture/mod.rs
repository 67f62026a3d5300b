pub mod file;
#[cfg(feature = "microphone")]
pub mod microphone;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use somnus_core::config::RecordingConfig;
use somnus_core::recording::{AudioInput, CaptureError, InputStream};
use tracing::{info, warn};

/// Pick the audio input named by `recording.input`.
///
/// `microphone` needs the `microphone` feature; without it the input is
/// still created but every acquire reports it unavailable.
pub fn create_audio_input(config: &RecordingConfig) -> Result<Arc<dyn AudioInput>, CaptureError> {
    match config.input.as_str() {
        "file" => {
            let path = config.input_file.as_deref().ok_or_else(|| {
                CaptureError::Unavailable("recording.input_file is required for the file input".to_string())
            })?;
            info!(path, "using file replay audio input");
            Ok(Arc::new(file::FileInput::new(PathBuf::from(path))))
        }
        "microphone" => microphone_input(),
        other => Err(CaptureError::Unavailable(format!(
            "unknown audio input '{other}' (expected microphone or file)"
        ))),
    }
}

#[cfg(feature = "microphone")]
fn microphone_input() -> Result<Arc<dyn AudioInput>, CaptureError> {
    info!("using cpal microphone audio input");
    Ok(Arc::new(microphone::MicrophoneInput::new()))
}

#[cfg(not(feature = "microphone"))]
fn microphone_input() -> Result<Arc<dyn AudioInput>, CaptureError> {
    warn!("built without the `microphone` feature; recording will be unavailable");
    Ok(Arc::new(UnavailableInput))
}

/// Stand-in when no capture backend is compiled in.
pub struct UnavailableInput;

#[async_trait]
impl AudioInput for UnavailableInput {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn acquire(&self) -> Result<Box<dyn InputStream>, CaptureError> {
        Err(CaptureError::Unavailable(
            "this build has no microphone support".to_string(),
        ))
    }
}

/// MIME type for a recording file, from its extension.
pub fn mime_for_path(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "wav" => "audio/wav",
        "webm" => "audio/webm",
        "ogg" | "oga" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}
