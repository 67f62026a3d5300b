use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, GatewayConfig, GatewayMode, ModelConfig};
use crate::error::{CoreError, Result};
use crate::schema::{AnalysisData, EventKind, SleepAnalysis, StageKind};

// -- Types --

/// Recorded audio in transport-safe form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAudio {
    pub mime_type: String,
    /// Standard base64 of the whole clip.
    pub data: String,
}

/// The boundary between this system and the hosted generative model.
///
/// Narrative results are HTML fragments returned exactly as the model wrote
/// them; callers must sanitize before rendering.
#[async_trait]
pub trait AnalysisGateway: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn analyze_audio(&self, audio: &EncodedAudio, duration_seconds: f64)
        -> Result<SleepAnalysis>;

    async fn suggestions(&self, session: &AnalysisData) -> Result<String>;

    async fn weekly_narrative(&self, sessions: &[AnalysisData]) -> Result<String>;

    async fn monthly_narrative(&self, sessions: &[AnalysisData]) -> Result<String>;
}

// -- Wire contract --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum GatewayRequest {
    AnalyzeAudio(AnalyzeAudioPayload),
    GetSuggestions(SuggestionsPayload),
    GetWeeklyNarrative(NarrativePayload),
    GetMonthlyNarrative(NarrativePayload),
}

impl GatewayRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            GatewayRequest::AnalyzeAudio(_) => "analyzeAudio",
            GatewayRequest::GetSuggestions(_) => "getSuggestions",
            GatewayRequest::GetWeeklyNarrative(_) => "getWeeklyNarrative",
            GatewayRequest::GetMonthlyNarrative(_) => "getMonthlyNarrative",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeAudioPayload {
    pub audio: EncodedAudio,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionsPayload {
    pub session: AnalysisData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativePayload {
    pub sessions: Vec<AnalysisData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextReply {
    pub text: String,
}

/// Successful gateway response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GatewayReply {
    Analysis(SleepAnalysis),
    Text(TextReply),
}

/// Body of every non-200 gateway response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFailure {
    pub error: String,
}

/// Route one wire request to the matching gateway operation.
pub async fn dispatch(gateway: &dyn AnalysisGateway, request: GatewayRequest) -> Result<GatewayReply> {
    let operation = request.operation();
    debug!(operation, backend = gateway.name(), "dispatching gateway request");

    let reply = match request {
        GatewayRequest::AnalyzeAudio(p) => {
            GatewayReply::Analysis(gateway.analyze_audio(&p.audio, p.duration).await?)
        }
        GatewayRequest::GetSuggestions(p) => GatewayReply::Text(TextReply {
            text: gateway.suggestions(&p.session).await?,
        }),
        GatewayRequest::GetWeeklyNarrative(p) => GatewayReply::Text(TextReply {
            text: gateway.weekly_narrative(&p.sessions).await?,
        }),
        GatewayRequest::GetMonthlyNarrative(p) => GatewayReply::Text(TextReply {
            text: gateway.monthly_narrative(&p.sessions).await?,
        }),
    };
    Ok(reply)
}

/// Build the gateway the configured mode asks for.
pub fn from_config(config: &AppConfig) -> Arc<dyn AnalysisGateway> {
    match config.gateway.mode {
        GatewayMode::Direct => Arc::new(GeminiGateway::new(&config.model)),
        GatewayMode::Remote => Arc::new(HttpGateway::new(&config.gateway)),
    }
}

// -- Prompts --

const ANALYZE_AUDIO_PROMPT: &str = r#"You are a sleep analyst. The attached audio is an overnight bedroom recording.
Listen to the whole recording and produce a sleep analysis as JSON matching the response schema.

- "sleepScore": integer 0-100 for overall sleep quality.
- "summary": two or three sentences describing the night in plain language.
- "events": every notable sound, in chronological order. "time" is the offset in seconds from the start of the recording, "duration" its length in seconds, "type" one of Snore, Talk, Cough, Fart, Movement, Other.
- "stages": an estimated hypnogram. Stages must be contiguous, start at 0, and end at the total duration. "stage" is one of Awake, Light, Deep, REM.
- "duration": the total recording length in seconds."#;

const SUGGESTIONS_PROMPT: &str = r#"You are a friendly sleep coach. Based on the sleep session below, write 3 to 5 practical, specific suggestions to improve the user's sleep.
Respond with an HTML fragment only (use <h3>, <p>, <ul>, <li>, <strong>). No <html>, <head> or <body> tags, no markdown, no code fences."#;

const WEEKLY_PROMPT: &str = r#"You are a sleep coach writing a weekly review. Using the sessions below from the past 7 days, describe trends in score and duration, recurring sound events, and give one focus for next week.
Respond with an HTML fragment only (use <h3>, <p>, <ul>, <li>, <strong>). No markdown, no code fences."#;

const MONTHLY_PROMPT: &str = r#"You are a sleep coach writing a monthly review. Using the sessions below from the past 30 days, summarise how sleep quality developed over the month, the best and worst nights, recurring disturbances, and two habits to work on.
Respond with an HTML fragment only (use <h3>, <p>, <ul>, <li>, <strong>). No markdown, no code fences."#;

/// Plain-text digest of sessions for the narrative prompts.
pub fn describe_sessions(sessions: &[AnalysisData]) -> String {
    if sessions.is_empty() {
        return "No sleep sessions were recorded in this period.".to_string();
    }

    let mut context = String::from("## Sleep Sessions\n\n");
    for s in sessions {
        let hours = s.duration / 3600.0;
        context.push_str(&format!(
            "### {} (score {}/100, {hours:.1} h)\n{}\n",
            s.date, s.sleep_score, s.summary
        ));

        let mut counts: Vec<(EventKind, usize)> = EventKind::ALL
            .iter()
            .map(|k| (*k, s.events.iter().filter(|e| e.kind == *k).count()))
            .filter(|(_, n)| *n > 0)
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        if !counts.is_empty() {
            let parts: Vec<String> = counts
                .iter()
                .map(|(k, n)| format!("{} x{n}", k.as_str()))
                .collect();
            context.push_str(&format!("Events: {}\n", parts.join(", ")));
        }
        context.push('\n');
    }
    context
}

fn describe_session(session: &AnalysisData) -> String {
    let mut context = describe_sessions(std::slice::from_ref(session));
    for stage in StageKind::ALL {
        let minutes: f64 = session
            .stages
            .iter()
            .filter(|s| s.stage == stage)
            .map(|s| s.length())
            .sum::<f64>()
            / 60.0;
        context.push_str(&format!("{}: {minutes:.0} min\n", stage.as_str()));
    }
    for event in &session.events {
        context.push_str(&format!(
            "- [{:.0}s] {}: {}\n",
            event.time,
            event.kind.as_str(),
            event.description
        ));
    }
    context
}

/// `responseSchema` for the structured audio-analysis call.
pub fn analysis_schema() -> serde_json::Value {
    let event_kinds: Vec<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
    let stage_kinds: Vec<&str> = StageKind::ALL.iter().map(|k| k.as_str()).collect();

    serde_json::json!({
        "type": "OBJECT",
        "properties": {
            "sleepScore": { "type": "INTEGER" },
            "summary": { "type": "STRING" },
            "events": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "time": { "type": "NUMBER" },
                        "type": { "type": "STRING", "enum": event_kinds },
                        "description": { "type": "STRING" },
                        "duration": { "type": "NUMBER" }
                    },
                    "required": ["time", "type", "description", "duration"]
                }
            },
            "stages": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "stage": { "type": "STRING", "enum": stage_kinds },
                        "startTime": { "type": "NUMBER" },
                        "endTime": { "type": "NUMBER" }
                    },
                    "required": ["stage", "startTime", "endTime"]
                }
            },
            "duration": { "type": "NUMBER" }
        },
        "required": ["sleepScore", "summary", "events", "stages", "duration"]
    })
}

// -- Hosted model client --

/// Talks to the Gemini `generateContent` REST API directly.
pub struct GeminiGateway {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    temperature: f32,
}

impl GeminiGateway {
    /// The API key is read from the environment variable named in `config`.
    pub fn new(config: &ModelConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "model API key not set; analysis calls will fail");
        }
        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            api_key_env: config.api_key_env.clone(),
            temperature: config.temperature,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            CoreError::Gateway(format!(
                "model API key is not configured (set {})",
                self.api_key_env
            ))
        })
    }

    pub async fn health_check(&self) -> bool {
        let Ok(key) = self.api_key() else {
            return false;
        };
        let url = format!("{}/v1beta/models/{}", self.base_url, self.model);
        matches!(
            self.client.get(&url).header("x-goog-api-key", key).send().await,
            Ok(r) if r.status().is_success()
        )
    }

    async fn generate(
        &self,
        parts: Vec<serde_json::Value>,
        response_schema: Option<serde_json::Value>,
    ) -> Result<String> {
        let key = self.api_key()?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );

        let mut generation_config = serde_json::json!({ "temperature": self.temperature });
        if let Some(schema) = response_schema {
            generation_config["responseMimeType"] = "application/json".into();
            generation_config["responseSchema"] = schema;
        }

        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Gateway(format!("model request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body_text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(body_text);
            return Err(CoreError::Gateway(format!("model returned {status}: {message}")));
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::Gateway(format!("parse model response: {e}")))?;

        extract_text(&resp_json)
            .ok_or_else(|| CoreError::Gateway("model returned no content".to_string()))
    }

    async fn narrative(&self, prompt: &str, context: String) -> Result<String> {
        let text = format!("{prompt}\n\n{context}");
        self.generate(vec![serde_json::json!({ "text": text })], None)
            .await
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_text(response: &serde_json::Value) -> Option<String> {
    let parts = response["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait]
impl AnalysisGateway for GeminiGateway {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn analyze_audio(
        &self,
        audio: &EncodedAudio,
        duration_seconds: f64,
    ) -> Result<SleepAnalysis> {
        info!(
            model = %self.model,
            mime_type = %audio.mime_type,
            encoded_bytes = audio.data.len(),
            duration_seconds,
            "requesting audio analysis"
        );
        let prompt = format!(
            "{ANALYZE_AUDIO_PROMPT}\n\nThe recording lasted {duration_seconds:.0} seconds."
        );
        let parts = vec![
            serde_json::json!({ "text": prompt }),
            serde_json::json!({
                "inline_data": { "mime_type": audio.mime_type, "data": audio.data }
            }),
        ];
        let text = self.generate(parts, Some(analysis_schema())).await?;
        serde_json::from_str(text.trim())
            .map_err(|e| CoreError::Gateway(format!("failed to parse analysis JSON: {e}")))
    }

    async fn suggestions(&self, session: &AnalysisData) -> Result<String> {
        self.narrative(SUGGESTIONS_PROMPT, describe_session(session))
            .await
    }

    async fn weekly_narrative(&self, sessions: &[AnalysisData]) -> Result<String> {
        self.narrative(WEEKLY_PROMPT, describe_sessions(sessions))
            .await
    }

    async fn monthly_narrative(&self, sessions: &[AnalysisData]) -> Result<String> {
        self.narrative(MONTHLY_PROMPT, describe_sessions(sessions))
            .await
    }
}

// -- Proxy client --

/// Reaches the model through a gateway proxy endpoint (`POST {type, payload}`).
pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: config.endpoint.clone(),
        }
    }

    /// Check that the proxy's host answers `GET /health`.
    pub async fn health_check(&self) -> bool {
        let Ok(url) = reqwest::Url::parse(&self.endpoint).and_then(|u| u.join("/health")) else {
            return false;
        };
        matches!(self.client.get(url).send().await, Ok(r) if r.status().is_success())
    }

    async fn call<T: DeserializeOwned>(&self, request: &GatewayRequest) -> Result<T> {
        let operation = request.operation();
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| CoreError::Gateway(format!("{operation} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<GatewayFailure>()
                .await
                .map(|f| f.error)
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("{operation} failed with status {status}"));
            return Err(CoreError::Gateway(message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CoreError::Gateway(format!("parse {operation} response: {e}")))
    }
}

#[async_trait]
impl AnalysisGateway for HttpGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn analyze_audio(
        &self,
        audio: &EncodedAudio,
        duration_seconds: f64,
    ) -> Result<SleepAnalysis> {
        let request = GatewayRequest::AnalyzeAudio(AnalyzeAudioPayload {
            audio: audio.clone(),
            duration: duration_seconds,
        });
        self.call(&request).await
    }

    async fn suggestions(&self, session: &AnalysisData) -> Result<String> {
        let request = GatewayRequest::GetSuggestions(SuggestionsPayload {
            session: session.clone(),
        });
        Ok(self.call::<TextReply>(&request).await?.text)
    }

    async fn weekly_narrative(&self, sessions: &[AnalysisData]) -> Result<String> {
        let request = GatewayRequest::GetWeeklyNarrative(NarrativePayload {
            sessions: sessions.to_vec(),
        });
        Ok(self.call::<TextReply>(&request).await?.text)
    }

    async fn monthly_narrative(&self, sessions: &[AnalysisData]) -> Result<String> {
        let request = GatewayRequest::GetMonthlyNarrative(NarrativePayload {
            sessions: sessions.to_vec(),
        });
        Ok(self.call::<TextReply>(&request).await?.text)
    }
}
