//! Integration tests for the somnus HTTP API
//!
//! Tests cover:
//! - Health endpoint
//! - Alarm CRUD, toggle and ringing state
//! - Gateway proxy endpoint (wire contract and error shape)
//! - Session listing/deletion and dashboard aggregates
//! - Recording lifecycle, navigation lock, and remote gateway failure

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use somnus_core::config::{AppConfig, GatewayConfig};
use somnus_core::db::{lock_db, Database};
use somnus_core::gateway::{AnalysisGateway, EncodedAudio, HttpGateway};
use somnus_core::recording::AudioInput;
use somnus_core::schema::{AnalysisData, EventKind, SleepAnalysis, SleepEvent};
use somnus_core::{CoreError, Result};
use somnus_daemon::capture::file::FileInput;
use somnus_daemon::capture::UnavailableInput;
use somnus_daemon::{build_router, AppState};
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot` method

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct FakeGateway {
    narratives: AtomicUsize,
}

#[async_trait]
impl AnalysisGateway for FakeGateway {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn analyze_audio(&self, audio: &EncodedAudio, duration: f64) -> Result<SleepAnalysis> {
        Ok(SleepAnalysis {
            sleep_score: 88,
            summary: format!("analyzed {} bytes of {}", audio.data.len(), audio.mime_type),
            events: vec![SleepEvent {
                time: 5.0,
                kind: EventKind::Talk,
                description: "mumbling".to_string(),
                duration: 2.0,
            }],
            stages: vec![],
            duration,
        })
    }

    async fn suggestions(&self, _session: &AnalysisData) -> Result<String> {
        Ok("<p>Wind down earlier</p><script>x()</script>".to_string())
    }

    async fn weekly_narrative(&self, sessions: &[AnalysisData]) -> Result<String> {
        self.narratives.fetch_add(1, Ordering::SeqCst);
        Ok(format!("<p>{} nights this week</p>", sessions.len()))
    }

    async fn monthly_narrative(&self, _sessions: &[AnalysisData]) -> Result<String> {
        Err(CoreError::Gateway("monthly quota exhausted".to_string()))
    }
}

struct TestApp {
    state: AppState,
    _dir: TempDir,
}

impl TestApp {
    fn with(gateway: Arc<dyn AnalysisGateway>, input: Option<Arc<dyn AudioInput>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.base_dir = dir.path().display().to_string();
        config.recording.keep_playback_copy = false;

        let db = Database::open_in_memory().unwrap().into_shared();
        let input = input.unwrap_or_else(|| Arc::new(UnavailableInput));
        Self {
            state: AppState::new(&config, db, gateway, input),
            _dir: dir,
        }
    }

    fn new() -> Self {
        Self::with(Arc::new(FakeGateway::default()), None)
    }

    fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        (status, extract_json(response.into_body()).await)
    }

    async fn wait_for_outcome(&self) -> Value {
        for _ in 0..100 {
            let (_, snapshot) = self.call("GET", "/api/recording", None).await;
            if snapshot["status"] == "results" || snapshot["status"] == "error" {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("recording never finished analyzing");
    }
}

/// Extract JSON body; empty bodies become `null`.
async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

fn session(date: &str, score: u32, duration: f64) -> AnalysisData {
    AnalysisData {
        date: date.to_string(),
        sleep_score: score,
        summary: String::new(),
        events: vec![],
        stages: vec![],
        duration,
    }
}

fn days_ago(days: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::days(days))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn replay_input(dir: &TempDir) -> Arc<dyn AudioInput> {
    let path = dir.path().join("night.wav");
    std::fs::write(&path, vec![7u8; 4000]).unwrap();
    Arc::new(FileInput::new(path))
}

/// Serve `router` on an ephemeral local port and return its base URL.
async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = TestApp::new();
    let (status, body) = app.call("GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "somnus");
    assert_eq!(body["gateway"], "fake");
    assert!(body["version"].is_string());
}

// =============================================================================
// Alarms
// =============================================================================

#[tokio::test]
async fn test_alarm_crud_round_trip() {
    let app = TestApp::new();

    let (status, created) = app
        .call(
            "POST",
            "/api/alarms",
            Some(json!({ "time": "06:30", "label": "Work", "days": [1, 2, 3, 4, 5] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["time"], "06:30");
    assert_eq!(created["isActive"], true);
    let id = created["id"].as_str().unwrap().to_string();

    app.call("POST", "/api/alarms", Some(json!({ "time": "05:45" })))
        .await;
    let (_, list) = app.call("GET", "/api/alarms", None).await;
    let times: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["time"].as_str().unwrap())
        .collect();
    assert_eq!(times, vec!["05:45", "06:30"]);

    let (status, toggled) = app
        .call("POST", &format!("/api/alarms/{id}/toggle"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["isActive"], false);

    let (status, updated) = app
        .call(
            "PUT",
            &format!("/api/alarms/{id}"),
            Some(json!({ "time": "07:00", "label": "Late start", "days": [6] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["time"], "07:00");
    assert_eq!(updated["isActive"], false);

    // persisted, not just cached
    let stored = lock_db(&app.state.db).get_alarm(&id).unwrap().unwrap();
    assert_eq!(stored.label, "Late start");

    let (status, _) = app.call("DELETE", &format!("/api/alarms/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = app.call("DELETE", &format!("/api/alarms/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_alarm_rejects_malformed_time() {
    let app = TestApp::new();
    let (status, body) = app
        .call("POST", "/api/alarms", Some(json!({ "time": "7:5" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("HH:MM"));

    let (status, _) = app
        .call("POST", "/api/alarms", Some(json!({ "time": "07:05", "days": [9] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_nothing_ringing_initially() {
    let app = TestApp::new();
    let (status, body) = app.call("GET", "/api/alarms/ringing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_null());

    let (_, dismissed) = app.call("POST", "/api/alarms/ringing/dismiss", None).await;
    assert!(dismissed.is_null());
    let (_, snoozed) = app.call("POST", "/api/alarms/ringing/snooze", None).await;
    assert!(snoozed.is_null());
}

// =============================================================================
// Gateway proxy endpoint
// =============================================================================

#[tokio::test]
async fn test_gateway_dispatches_text_operation() {
    let app = TestApp::new();
    let (status, body) = app
        .call(
            "POST",
            "/api/gateway",
            Some(json!({ "type": "getWeeklyNarrative", "payload": { "sessions": [] } })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "text": "<p>0 nights this week</p>" }));
}

#[tokio::test]
async fn test_gateway_dispatches_analysis() {
    let app = TestApp::new();
    let (status, body) = app
        .call(
            "POST",
            "/api/gateway",
            Some(json!({
                "type": "analyzeAudio",
                "payload": { "audio": { "mimeType": "audio/wav", "data": "AAAA" }, "duration": 60.0 }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sleepScore"], 88);
    assert_eq!(body["events"][0]["type"], "Talk");
    assert_eq!(body["duration"], 60.0);
}

#[tokio::test]
async fn test_gateway_error_shape() {
    let app = TestApp::new();

    let (status, body) = app
        .call(
            "POST",
            "/api/gateway",
            Some(json!({ "type": "getMonthlyNarrative", "payload": { "sessions": [] } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("monthly quota exhausted"));

    let (status, body) = app
        .call(
            "POST",
            "/api/gateway",
            Some(json!({ "type": "formatDisk", "payload": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_gateway_disabled() {
    let mut app = TestApp::new();
    app.state.serve_gateway = false;
    let (status, body) = app
        .call(
            "POST",
            "/api/gateway",
            Some(json!({ "type": "getWeeklyNarrative", "payload": { "sessions": [] } })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_http_gateway_through_served_proxy() {
    let app = TestApp::new();
    let base = serve(app.router()).await;

    let client = HttpGateway::new(&GatewayConfig {
        endpoint: format!("{base}/api/gateway"),
        ..GatewayConfig::default()
    });
    assert!(client.health_check().await);

    let text = client
        .weekly_narrative(&[session(&days_ago(1), 70, 100.0)])
        .await
        .unwrap();
    assert_eq!(text, "<p>1 nights this week</p>");

    let err = client.monthly_narrative(&[]).await.unwrap_err();
    assert!(err.to_string().contains("monthly quota exhausted"));
}

// =============================================================================
// Sessions and dashboard
// =============================================================================

#[tokio::test]
async fn test_sessions_newest_first_and_delete() {
    let app = TestApp::new();
    {
        let db = lock_db(&app.state.db);
        db.put_session(&session("2024-05-01T06:00:00.000Z", 70, 100.0))
            .unwrap();
        db.put_session(&session("2024-05-03T06:00:00.000Z", 80, 100.0))
            .unwrap();
    }

    let (_, list) = app.call("GET", "/api/sessions", None).await;
    assert_eq!(list[0]["date"], "2024-05-03T06:00:00.000Z");
    assert_eq!(list[1]["date"], "2024-05-01T06:00:00.000Z");

    let (status, _) = app
        .call("DELETE", "/api/sessions/2024-05-01T06:00:00.000Z", None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app
        .call("DELETE", "/api/sessions/2024-05-01T06:00:00.000Z", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, list) = app.call("GET", "/api/sessions", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_dashboard_week_means() {
    let app = TestApp::new();
    {
        let db = lock_db(&app.state.db);
        db.put_session(&session(&days_ago(1), 70, 25200.0)).unwrap();
        db.put_session(&session(&days_ago(2), 80, 28800.0)).unwrap();
        db.put_session(&session(&days_ago(3), 90, 21600.0)).unwrap();
        db.put_session(&session(&days_ago(40), 10, 3600.0)).unwrap();
    }

    let (status, body) = app.call("GET", "/api/dashboard?window=week", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["window"], "week");
    assert_eq!(body["sessionCount"], 3);
    assert_eq!(body["averageScore"], 80.0);
    assert_eq!(body["averageDuration"], 25200.0);

    let (_, body) = app.call("GET", "/api/dashboard?window=year", None).await;
    assert_eq!(body["sessionCount"], 4);

    // selection sticks until changed
    let (_, body) = app.call("GET", "/api/dashboard", None).await;
    assert_eq!(body["window"], "year");

    let (status, _) = app.call("GET", "/api/dashboard?window=decade", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_dashboard_narrative_cached_and_sanitized() {
    let gateway = Arc::new(FakeGateway::default());
    let app = TestApp::with(gateway.clone(), None);

    let (status, body) = app
        .call("GET", "/api/dashboard/narrative?window=week", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["html"], "<p>0 nights this week</p>");
    assert_eq!(body["cached"], false);
    let (_, body) = app
        .call("GET", "/api/dashboard/narrative?window=week", None)
        .await;
    assert_eq!(body["cached"], true);
    assert_eq!(body["html"], "<p>0 nights this week</p>");
    assert_eq!(gateway.narratives.load(Ordering::SeqCst), 1);

    let (status, body) = app
        .call("GET", "/api/dashboard/narrative?window=year", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["html"].is_null());

    let (status, body) = app
        .call("GET", "/api/dashboard/narrative?window=month", None)
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].is_string());
}

// =============================================================================
// Recording lifecycle
// =============================================================================

#[tokio::test]
async fn test_recording_session_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let app = TestApp::with(Arc::new(FakeGateway::default()), Some(replay_input(&dir)));

    let (status, snapshot) = app.call("POST", "/api/recording/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["status"], "tracking");

    let (_, view) = app.call("GET", "/api/view", None).await;
    assert_eq!(view, json!({ "view": "tracking", "locked": true }));
    let (status, body) = app
        .call("POST", "/api/view", Some(json!({ "view": "dashboard" })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let (status, snapshot) = app.call("POST", "/api/recording/stop", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(snapshot["status"], "analyzing");

    let outcome = app.wait_for_outcome().await;
    assert_eq!(outcome["status"], "results");
    assert_eq!(outcome["results"]["session"]["sleepScore"], 88);
    let suggestions = outcome["results"]["suggestions"].as_str().unwrap();
    assert!(suggestions.contains("Wind down earlier"));
    assert!(!suggestions.contains("script"));

    let (_, sessions) = app.call("GET", "/api/sessions", None).await;
    assert_eq!(sessions.as_array().unwrap().len(), 1);

    let (status, view) = app
        .call("POST", "/api/view", Some(json!({ "view": "dashboard" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["locked"], false);

    let (_, snapshot) = app.call("POST", "/api/recording/reset", None).await;
    assert_eq!(snapshot["status"], "idle");
    assert!(snapshot["results"].is_null());
}

#[tokio::test]
async fn test_start_without_microphone_reports_unavailable() {
    let app = TestApp::new();
    let (status, body) = app.call("POST", "/api/recording/start", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());

    let (_, snapshot) = app.call("GET", "/api/recording", None).await;
    assert_eq!(snapshot["status"], "error");
    assert!(!snapshot["debugLog"].as_array().unwrap().is_empty());

    // error does not lock navigation
    let (status, _) = app
        .call("POST", "/api/view", Some(json!({ "view": "alarms" })))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_stop_when_idle_is_rejected() {
    let app = TestApp::new();
    let (status, body) = app.call("POST", "/api/recording/stop", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_remote_gateway_failure_lands_in_error() {
    // A gateway proxy that always fails like an overloaded upstream.
    let failing = Router::new().route(
        "/api/gateway",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "model overloaded" })),
            )
        }),
    );
    let base = serve(failing).await;
    let remote = HttpGateway::new(&GatewayConfig {
        endpoint: format!("{base}/api/gateway"),
        ..GatewayConfig::default()
    });

    let dir = tempfile::tempdir().unwrap();
    let app = TestApp::with(Arc::new(remote), Some(replay_input(&dir)));

    app.call("POST", "/api/recording/start", None).await;
    let (status, _) = app.call("POST", "/api/recording/stop", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let outcome = app.wait_for_outcome().await;
    assert_eq!(outcome["status"], "error");
    let message = outcome["error"].as_str().unwrap();
    assert!(!message.is_empty());
    assert!(message.contains("model overloaded"));
    assert!(outcome["results"].is_null());

    let (_, sessions) = app.call("GET", "/api/sessions", None).await;
    assert!(sessions.as_array().unwrap().is_empty());
}
