use std::sync::{Arc, Mutex};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use somnus_core::alarm::AlarmManager;
use somnus_core::config::AppConfig;
use somnus_core::dashboard::{Dashboard, DashboardSummary, TimeWindow};
use somnus_core::db::{with_db, SharedDatabase};
use somnus_core::gateway::{dispatch, AnalysisGateway, GatewayReply, GatewayRequest};
use somnus_core::recording::{
    AudioInput, CaptureError, RecordingController, RecordingSnapshot, RecordingStatus,
};
use somnus_core::schema::{Alarm, AnalysisData, NewAlarm};
use somnus_core::shell::{Shell, View};
use somnus_core::CoreError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared across handlers and background loops.
#[derive(Clone)]
pub struct AppState {
    pub db: SharedDatabase,
    pub alarms: Arc<AlarmManager>,
    pub recording: Arc<tokio::sync::Mutex<RecordingController>>,
    pub dashboard: Arc<tokio::sync::Mutex<Dashboard>>,
    pub shell: Arc<Mutex<Shell>>,
    pub gateway: Arc<dyn AnalysisGateway>,
    pub serve_gateway: bool,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        db: SharedDatabase,
        gateway: Arc<dyn AnalysisGateway>,
        input: Arc<dyn AudioInput>,
    ) -> Self {
        let playback_dir = config.playback_dir().ok();
        let controller = RecordingController::new(
            input,
            gateway.clone(),
            db.clone(),
            &config.recording,
            playback_dir,
        );
        Self {
            alarms: Arc::new(AlarmManager::new(db.clone(), &config.alarm)),
            db,
            recording: Arc::new(tokio::sync::Mutex::new(controller)),
            dashboard: Arc::new(tokio::sync::Mutex::new(Dashboard::new())),
            shell: Arc::new(Mutex::new(Shell::new())),
            gateway,
            serve_gateway: config.server.serve_gateway,
        }
    }

    fn lock_shell(&self) -> std::sync::MutexGuard<'_, Shell> {
        self.shell.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sync_shell(&self, status: RecordingStatus) {
        self.lock_shell().sync(status);
    }

    async fn load_sessions(&self) -> Result<Vec<AnalysisData>, ApiError> {
        Ok(with_db(&self.db, |db| db.get_all_sessions()).await?)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/gateway", post(gateway_endpoint))
        .route("/api/alarms", get(list_alarms).post(create_alarm))
        .route("/api/alarms/ringing", get(ringing_alarm))
        .route("/api/alarms/ringing/dismiss", post(dismiss_alarm))
        .route("/api/alarms/ringing/snooze", post(snooze_alarm))
        .route("/api/alarms/:id", put(update_alarm).delete(delete_alarm))
        .route("/api/alarms/:id/toggle", post(toggle_alarm))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:date", delete(delete_session))
        .route("/api/dashboard", get(dashboard_summary))
        .route("/api/dashboard/narrative", get(dashboard_narrative))
        .route("/api/recording", get(recording_status))
        .route("/api/recording/start", post(start_recording))
        .route("/api/recording/stop", post(stop_recording))
        .route("/api/recording/reset", post(reset_recording))
        .route("/api/view", get(current_view).post(select_view))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// -- Errors --

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{0}")]
    BadRequest(String),

    #[error("gateway endpoint is disabled on this server")]
    GatewayDisabled,
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::GatewayDisabled => StatusCode::NOT_FOUND,
            ApiError::Core(e) => match e {
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::Duplicate(_) | CoreError::NavigationLocked => StatusCode::CONFLICT,
                CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                CoreError::Gateway(_) => StatusCode::BAD_GATEWAY,
                CoreError::Capture(c) => match c {
                    CaptureError::Unavailable(_) | CaptureError::InactiveStream => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    CaptureError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                    CaptureError::EmptyCapture => StatusCode::UNPROCESSABLE_ENTITY,
                    CaptureError::Recorder(_) => StatusCode::INTERNAL_SERVER_ERROR,
                },
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(%status, "request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// -- Health and gateway --

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    module: &'static str,
    version: &'static str,
    gateway: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        module: "somnus",
        version: env!("CARGO_PKG_VERSION"),
        gateway: state.gateway.name(),
    })
}

async fn gateway_endpoint(
    State(state): State<AppState>,
    payload: Result<Json<GatewayRequest>, JsonRejection>,
) -> ApiResult<Json<GatewayReply>> {
    if !state.serve_gateway {
        return Err(ApiError::GatewayDisabled);
    }
    let Json(request) = payload?;
    let reply = dispatch(state.gateway.as_ref(), request).await?;
    Ok(Json(reply))
}

// -- Alarms --

async fn list_alarms(State(state): State<AppState>) -> Json<Vec<Alarm>> {
    Json(state.alarms.alarms())
}

async fn create_alarm(
    State(state): State<AppState>,
    payload: Result<Json<NewAlarm>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Alarm>)> {
    let Json(new) = payload?;
    let alarm = state.alarms.create(new).await?;
    Ok((StatusCode::CREATED, Json(alarm)))
}

async fn update_alarm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<NewAlarm>, JsonRejection>,
) -> ApiResult<Json<Alarm>> {
    let Json(changes) = payload?;
    Ok(Json(state.alarms.update(&id, changes).await?))
}

async fn toggle_alarm(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Alarm>> {
    Ok(Json(state.alarms.toggle(&id).await?))
}

async fn delete_alarm(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.alarms.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ringing_alarm(State(state): State<AppState>) -> Json<Option<Alarm>> {
    Json(state.alarms.ringing())
}

async fn dismiss_alarm(State(state): State<AppState>) -> Json<Option<Alarm>> {
    Json(state.alarms.dismiss(chrono::Local::now().naive_local()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnoozeResponse {
    alarm: Alarm,
    rings_at: chrono::NaiveDateTime,
}

async fn snooze_alarm(State(state): State<AppState>) -> Json<Option<SnoozeResponse>> {
    let snoozed = state
        .alarms
        .snooze(chrono::Local::now().naive_local())
        .map(|(alarm, rings_at)| SnoozeResponse { alarm, rings_at });
    Json(snoozed)
}

// -- Sessions and dashboard --

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<AnalysisData>>> {
    Ok(Json(state.load_sessions().await?))
}

async fn delete_session(State(state): State<AppState>, Path(date): Path<String>) -> ApiResult<StatusCode> {
    let key = date.clone();
    let removed = with_db(&state.db, move |db| db.delete_session(&key)).await?;
    if !removed {
        return Err(CoreError::NotFound(format!("session {date}")).into());
    }
    state.dashboard.lock().await.invalidate();
    info!(date = %date, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    window: Option<String>,
}

impl WindowQuery {
    fn parse(&self) -> ApiResult<Option<TimeWindow>> {
        self.window
            .as_deref()
            .map(str::parse::<TimeWindow>)
            .transpose()
            .map_err(ApiError::from)
    }
}

async fn dashboard_summary(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<DashboardSummary>> {
    let window = query.parse()?;
    let sessions = state.load_sessions().await?;
    let mut dashboard = state.dashboard.lock().await;
    if let Some(window) = window {
        dashboard.select(window);
    }
    Ok(Json(dashboard.summary(&sessions, chrono::Utc::now())))
}

#[derive(Debug, Serialize)]
struct NarrativeResponse {
    window: TimeWindow,
    html: Option<String>,
    /// Served from the per-window cache without calling the model.
    cached: bool,
}

async fn dashboard_narrative(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<NarrativeResponse>> {
    let window = query.parse()?;
    let sessions = state.load_sessions().await?;
    let mut dashboard = state.dashboard.lock().await;
    if let Some(window) = window {
        dashboard.select(window);
    }
    let cached = dashboard.cached_narrative(dashboard.window()).is_some();
    let html = dashboard
        .narrative(state.gateway.as_ref(), &sessions, chrono::Utc::now())
        .await?;
    Ok(Json(NarrativeResponse {
        window: dashboard.window(),
        html,
        cached,
    }))
}

// -- Recording --

async fn recording_status(State(state): State<AppState>) -> Json<RecordingSnapshot> {
    let mut ctl = state.recording.lock().await;
    let status = ctl.poll();
    state.sync_shell(status);
    Json(ctl.snapshot())
}

async fn start_recording(State(state): State<AppState>) -> ApiResult<Json<RecordingSnapshot>> {
    let mut ctl = state.recording.lock().await;
    let result = ctl.start().await;
    state.sync_shell(ctl.status());
    result?;
    Ok(Json(ctl.snapshot()))
}

/// Stop capture and analyze in the background; poll `GET /api/recording` for the outcome.
async fn stop_recording(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<RecordingSnapshot>)> {
    let mut ctl = state.recording.lock().await;
    let job = ctl.begin_analysis().await;
    state.sync_shell(ctl.status());
    let job = job?;
    let snapshot = ctl.snapshot();
    drop(ctl);

    let bg = state.clone();
    tokio::spawn(async move {
        let outcome = job.run().await;
        let mut ctl = bg.recording.lock().await;
        match ctl.finish_analysis(outcome).await {
            Ok(()) => bg.dashboard.lock().await.invalidate(),
            Err(e) => warn!("recording analysis failed: {e}"),
        }
        bg.sync_shell(ctl.status());
    });

    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn reset_recording(State(state): State<AppState>) -> Json<RecordingSnapshot> {
    let mut ctl = state.recording.lock().await;
    ctl.reset().await;
    state.sync_shell(ctl.status());
    Json(ctl.snapshot())
}

// -- View --

#[derive(Debug, Serialize)]
struct ViewResponse {
    view: View,
    locked: bool,
}

#[derive(Debug, Deserialize)]
struct SelectView {
    view: View,
}

async fn current_view(State(state): State<AppState>) -> Json<ViewResponse> {
    let status = state.recording.lock().await.poll();
    let mut shell = state.lock_shell();
    shell.sync(status);
    Json(ViewResponse {
        view: shell.current(),
        locked: shell.is_locked(),
    })
}

async fn select_view(
    State(state): State<AppState>,
    payload: Result<Json<SelectView>, JsonRejection>,
) -> ApiResult<Json<ViewResponse>> {
    let Json(SelectView { view }) = payload?;
    let mut shell = state.lock_shell();
    shell.select(view)?;
    Ok(Json(ViewResponse {
        view: shell.current(),
        locked: shell.is_locked(),
    }))
}
