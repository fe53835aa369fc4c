use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::{
    aggregate::{self, Aggregator, DailyAggregate, SiteStat},
    engine::{Engine, SignalOutcome},
    error::TrackerError,
    goals::{self, GoalProgress},
    notify::{NotificationPage, Notifier},
    pomodoro::Pomodoro,
    session::ActiveSession,
    settings::{self, Settings, SettingsUpdate},
    signal,
    store::Store,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Mutex<Engine>>,
    pub aggregator: Aggregator,
    pub notifier: Notifier,
    pub pomodoro: Pomodoro,
}

impl AppState {
    fn store(&self) -> &Store {
        self.aggregator.store()
    }
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn fail(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn db_error(context: &str, err: TrackerError) -> Response {
    error!("{context} failed: {err}");
    fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/signal", post(post_signal).options(options_ok))
        .route("/now", get(get_now))
        .route("/stats/day", get(get_stats_day))
        .route("/history", get(get_history))
        .route("/goals/progress", get(get_goals_progress))
        .route(
            "/settings",
            get(get_settings).post(post_settings).options(options_ok),
        )
        .route("/focus", post(post_focus).options(options_ok))
        .route("/settings/export", get(get_settings_export))
        .route(
            "/settings/import",
            post(post_settings_import).options(options_ok),
        )
        .route("/data/clear", post(post_data_clear).options(options_ok))
        .route("/notifications", get(get_notifications))
        .route("/pomodoro", get(get_pomodoro))
        .route("/pomodoro/start", post(post_pomodoro_start).options(options_ok))
        .route("/pomodoro/stop", post(post_pomodoro_stop).options(options_ok))
        .with_state(state)
        .layer(cors)
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> Response {
    ok(HealthInfo {
        service: "tracker_core",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn post_signal(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let signal = match signal::parse(payload) {
        Ok(s) => s,
        Err(err) => return fail(StatusCode::BAD_REQUEST, err.code()),
    };
    let outcome: SignalOutcome = {
        let mut engine = state.engine.lock().await;
        engine.handle(signal, Local::now()).await
    };
    if outcome.unrecognized {
        return fail(StatusCode::OK, "unrecognized_signal");
    }
    ok(outcome)
}

#[derive(Serialize)]
struct NowSnapshot {
    session: Option<ActiveSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_ms: Option<u64>,
    today_total_ms: u64,
}

async fn get_now(State(state): State<AppState>) -> Response {
    let now = Local::now();
    let session = { state.engine.lock().await.current().cloned() };
    let elapsed_ms = session
        .as_ref()
        .map(|s| now.timestamp_millis().saturating_sub(s.started_at_ms).max(0) as u64);
    let today_total_ms = match state.aggregator.load(now.date_naive()).await {
        Ok(day) => day.map(|d| d.total_time).unwrap_or(0),
        Err(err) => return db_error("load today", err),
    };
    ok(NowSnapshot {
        session,
        elapsed_ms,
        today_total_ms,
    })
}

#[derive(Deserialize)]
struct DateQuery {
    /// Date in YYYY-MM-DD; today when absent.
    date: Option<String>,
}

impl DateQuery {
    fn resolve(&self) -> Result<NaiveDate, Response> {
        match &self.date {
            None => Ok(Local::now().date_naive()),
            Some(s) => aggregate::parse_date(s)
                .map_err(|_| fail(StatusCode::BAD_REQUEST, "invalid_date")),
        }
    }
}

#[derive(Serialize)]
struct SiteRow {
    domain: String,
    #[serde(flatten)]
    stat: SiteStat,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DayStats {
    date: String,
    total_time: u64,
    sites_visited: usize,
    productive_time: u64,
    sites: Vec<SiteRow>,
}

impl DayStats {
    fn from_day(day: &DailyAggregate) -> Self {
        Self {
            date: aggregate::date_key(day.date),
            total_time: day.total_time,
            sites_visited: day.sites.len(),
            productive_time: day.productive_time(),
            sites: day
                .top_sites()
                .into_iter()
                .map(|(domain, stat)| SiteRow {
                    domain: domain.to_string(),
                    stat: stat.clone(),
                })
                .collect(),
        }
    }
}

async fn get_stats_day(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    let date = match q.resolve() {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match state.aggregator.load(date).await {
        Ok(day) => ok(DayStats::from_day(
            &day.unwrap_or_else(|| DailyAggregate::empty(date)),
        )),
        Err(err) => db_error("load day", err),
    }
}

/// Without `date`, lists the archived dates instead.
async fn get_history(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    if q.date.is_none() {
        return match state.aggregator.history_dates().await {
            Ok(dates) => ok(dates
                .into_iter()
                .map(aggregate::date_key)
                .collect::<Vec<_>>()),
            Err(err) => db_error("list history", err),
        };
    }
    let date = match q.resolve() {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match state.aggregator.load_history(date).await {
        Ok(Some(day)) => ok(DayStats::from_day(&day)),
        Ok(None) => fail(StatusCode::NOT_FOUND, "not_found"),
        Err(err) => db_error("load history", err),
    }
}

async fn get_goals_progress(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    let date = match q.resolve() {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let settings = match settings::load_or_init(state.store()).await {
        Ok(s) => s,
        Err(err) => return db_error("load settings", err),
    };
    let day = match state.aggregator.load(date).await {
        Ok(day) => day.unwrap_or_else(|| DailyAggregate::empty(date)),
        Err(err) => return db_error("load day", err),
    };
    let progress: Vec<GoalProgress> = goals::progress(&settings, &day);
    ok(progress)
}

async fn get_settings(State(state): State<AppState>) -> Response {
    match settings::load_or_init(state.store()).await {
        Ok(s) => ok(s),
        Err(err) => db_error("load settings", err),
    }
}

async fn post_settings(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let update: SettingsUpdate = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return fail(StatusCode::BAD_REQUEST, "invalid_settings"),
    };
    if update.focus_timer_seconds == Some(0) {
        return fail(StatusCode::BAD_REQUEST, "invalid_focus_timer");
    }
    match settings::update(state.store(), update).await {
        Ok(s) => ok(s),
        Err(err) => db_error("update settings", err),
    }
}

#[derive(Deserialize)]
struct FocusRequest {
    enabled: bool,
}

async fn post_focus(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let req: FocusRequest = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return fail(StatusCode::BAD_REQUEST, "invalid_focus"),
    };
    if let Err(err) = settings::set_focus_mode(state.store(), req.enabled).await {
        return db_error("set focus mode", err);
    }
    let settings: Settings = settings::load_or_default(state.store()).await;
    ok(settings)
}

async fn get_settings_export(State(state): State<AppState>) -> Response {
    match settings::export(state.store()).await {
        Ok(doc) => ok(doc),
        Err(err) => db_error("export settings", err),
    }
}

async fn post_settings_import(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    match settings::import(state.store(), payload).await {
        Ok(s) => ok(s),
        Err(TrackerError::InvalidImport(_)) | Err(TrackerError::Json(_)) => {
            fail(StatusCode::BAD_REQUEST, "invalid_import")
        }
        Err(err) => db_error("import settings", err),
    }
}

async fn post_data_clear(State(state): State<AppState>) -> Response {
    match settings::clear_all(state.store()).await {
        Ok(()) => Json(OkResponse::<Value> { ok: true, data: None }).into_response(),
        Err(err) => db_error("clear data", err),
    }
}

#[derive(Deserialize)]
struct NotificationsQuery {
    #[serde(default)]
    after: u64,
    #[serde(default = "default_notifications_limit")]
    limit: usize,
}

fn default_notifications_limit() -> usize {
    50
}

async fn get_notifications(
    State(state): State<AppState>,
    Query(q): Query<NotificationsQuery>,
) -> Response {
    let page: NotificationPage = state.notifier.page(q.after, q.limit.min(200)).await;
    ok(page)
}

async fn get_pomodoro(State(state): State<AppState>) -> Response {
    ok(state.pomodoro.snapshot().await)
}

#[derive(Deserialize, Default)]
struct PomodoroStart {
    #[serde(default)]
    seconds: Option<u64>,
}

async fn post_pomodoro_start(State(state): State<AppState>, body: Option<Json<Value>>) -> Response {
    let req: PomodoroStart = match body {
        None => PomodoroStart::default(),
        Some(Json(v)) => match serde_json::from_value(v) {
            Ok(r) => r,
            Err(_) => return fail(StatusCode::BAD_REQUEST, "invalid_seconds"),
        },
    };
    match state.pomodoro.start(req.seconds).await {
        Ok(s) => ok(s),
        Err(err) => {
            warn!("pomodoro start rejected: {}", err.code());
            fail(StatusCode::CONFLICT, err.code())
        }
    }
}

async fn post_pomodoro_stop(State(state): State<AppState>) -> Response {
    ok(state.pomodoro.stop().await)
}
