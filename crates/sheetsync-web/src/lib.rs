//! Axum control surface for the sheet sync: sheet commands, schedule control and monitoring reads.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sheetsync_core::{DailyMetrics, DateKey, DateRange, Outcome, RunStatus, SyncError};
use sheetsync_sync::{
    build_service, AutoUpdateScheduler, SchedulerError, SweepMode, SyncConfig, SyncService,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "sheetsync-web";

#[derive(Clone)]
pub struct Services {
    pub sync: Arc<SyncService>,
    pub scheduler: Arc<AutoUpdateScheduler>,
}

impl Services {
    pub fn new(sync: Arc<SyncService>, scheduler: Arc<AutoUpdateScheduler>) -> Self {
        Self { sync, scheduler }
    }
}

/// Either wired services or the configuration error that prevented wiring them.
#[derive(Clone)]
pub struct AppState {
    services: Result<Services, SyncError>,
}

impl AppState {
    pub fn ready(services: Services) -> Self {
        Self { services: Ok(services) }
    }

    pub fn unavailable(err: SyncError) -> Self {
        Self { services: Err(err) }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        match build_service(config) {
            Ok(service) => {
                let sync = Arc::new(service);
                let scheduler = Arc::new(AutoUpdateScheduler::new(sync.clone(), config.schedule.clone()));
                Self::ready(Services::new(sync, scheduler))
            }
            Err(err) => {
                warn!(error = %err, "sync service unavailable; sheet routes will answer 503");
                Self::unavailable(err)
            }
        }
    }

    pub fn services(&self) -> Result<&Services, ApiError> {
        self.services.as_ref().map_err(|err| ApiError::Sync(err.clone()))
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Sync(SyncError),
    Scheduler(SchedulerError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        ApiError::Scheduler(err)
    }
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
            ApiError::Sync(
                SyncError::InvalidDateKey(_) | SyncError::InvalidRange { .. } | SyncError::InvalidInput(_),
            ) => StatusCode::BAD_REQUEST,
            ApiError::Sync(SyncError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Scheduler(SchedulerError::AlreadyRunning | SchedulerError::NotRunning) => StatusCode::CONFLICT,
            ApiError::Scheduler(SchedulerError::Scheduler(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Sync(err) => err.to_string(),
            ApiError::Scheduler(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.message(), "request failed");
        }
        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct DateBody {
    date: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeriodBody {
    start_date: String,
    end_date: String,
    #[serde(default)]
    reconcile: bool,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    date: String,
    #[serde(default)]
    sheet: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeriodQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

impl PeriodQuery {
    fn range(&self) -> ApiResult<DateRange> {
        let (Some(start), Some(end)) = (self.start_date.as_deref(), self.end_date.as_deref()) else {
            return Err(ApiError::BadRequest("startDate and endDate are required".into()));
        };
        Ok(DateRange::new(DateKey::parse(start)?, DateKey::parse(end)?)?)
    }
}

/// Single period total served on its own monitoring route.
#[derive(Debug, Clone, Copy)]
enum PeriodMetric {
    TotalIntegratedUsers,
    NewIntegratedUsers,
    ConvertedIntegratedUsers,
    PhysicalCardRequests,
    OnlineAutoIssuedCards,
}

impl PeriodMetric {
    const ALL: [PeriodMetric; 5] = [
        PeriodMetric::TotalIntegratedUsers,
        PeriodMetric::NewIntegratedUsers,
        PeriodMetric::ConvertedIntegratedUsers,
        PeriodMetric::PhysicalCardRequests,
        PeriodMetric::OnlineAutoIssuedCards,
    ];

    fn field(self) -> &'static str {
        match self {
            PeriodMetric::TotalIntegratedUsers => "total_integrated_users",
            PeriodMetric::NewIntegratedUsers => "new_integrated_users",
            PeriodMetric::ConvertedIntegratedUsers => "converted_integrated_users",
            PeriodMetric::PhysicalCardRequests => "physical_card_requests",
            PeriodMetric::OnlineAutoIssuedCards => "online_auto_issued_cards",
        }
    }

    fn route(self) -> &'static str {
        match self {
            PeriodMetric::TotalIntegratedUsers => "/monitoring/total-integrated-users",
            PeriodMetric::NewIntegratedUsers => "/monitoring/new-integrated-users",
            PeriodMetric::ConvertedIntegratedUsers => "/monitoring/converted-integrated-users",
            PeriodMetric::PhysicalCardRequests => "/monitoring/physical-card-requests",
            PeriodMetric::OnlineAutoIssuedCards => "/monitoring/online-auto-issued-cards",
        }
    }

    fn value(self, metrics: &DailyMetrics) -> u64 {
        match self {
            PeriodMetric::TotalIntegratedUsers => metrics.total_integrated_users,
            PeriodMetric::NewIntegratedUsers => metrics.new_integrated_users,
            PeriodMetric::ConvertedIntegratedUsers => metrics.converted_integrated_users,
            PeriodMetric::PhysicalCardRequests => metrics.physical_card_requests,
            PeriodMetric::OnlineAutoIssuedCards => metrics.online_auto_issued_cards,
        }
    }
}

#[derive(Debug, Serialize)]
struct SchedulerAck {
    running: bool,
}

pub fn app(state: AppState) -> Router {
    let router = PeriodMetric::ALL.into_iter().fold(Router::<Arc<AppState>>::new(), |router, metric| {
        router.route(
            metric.route(),
            get(move |state: State<Arc<AppState>>, query: Query<PeriodQuery>| {
                period_metric_handler(state, query, metric)
            }),
        )
    });
    router
        .route("/health", get(health_handler))
        .route("/sheets/setup-headers", post(setup_headers_handler))
        .route("/sheets/update-daily/{date}", post(update_daily_handler))
        .route("/sheets/update-specific-date", post(update_specific_date_handler))
        .route("/sheets/update-now", post(update_now_handler))
        .route("/sheets/update-period", post(update_period_handler))
        .route("/sheets/resolve-duplicates", post(resolve_duplicates_handler))
        .route("/sheets/start-auto-update", post(start_auto_update_handler))
        .route("/sheets/stop-auto-update", post(stop_auto_update_handler))
        .route("/sheets/auto-update-status", get(auto_update_status_handler))
        .route("/monitoring/daily/{date}", get(daily_metrics_handler))
        .route("/monitoring/all-metrics", get(all_metrics_handler))
        .with_state(Arc::new(state))
}

/// Serves until ctrl-c, starting the schedule first when enabled.
pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config);
    let scheduler = state.services.as_ref().ok().map(|s| s.scheduler.clone());
    if config.scheduler_enabled {
        match &scheduler {
            Some(scheduler) => scheduler.start().await.context("starting auto update")?,
            None => warn!("scheduler enabled but the sync service is not configured"),
        }
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
        })
        .await
        .context("http server")?;

    if let Some(scheduler) = scheduler {
        if scheduler.status().await.running {
            scheduler.stop().await.context("stopping auto update")?;
        }
    }
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()?).await
}

fn report_response<T: Serialize>(failed: bool, reason: Option<String>, body: T) -> Response {
    if failed {
        let body = json!({ "error": reason.unwrap_or_default(), "report": body });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    } else {
        Json(body).into_response()
    }
}

fn failure_reason(outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::Failed { reason } => Some(reason.clone()),
        _ => None,
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "configured": state.services.is_ok() }))
}

async fn setup_headers_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let services = state.services()?;
    let sheets = services.sync.setup_headers().await;
    let failed = !sheets.is_empty() && sheets.iter().all(|s| s.outcome.is_failed());
    let reason = sheets.iter().find_map(|s| failure_reason(&s.outcome));
    Ok(report_response(failed, reason, json!({ "sheets": sheets })))
}

async fn sync_one(state: &AppState, date: &str) -> ApiResult<Response> {
    let services = state.services()?;
    let date = DateKey::parse(date)?;
    let report = services.sync.sync_date(date, false).await;
    Ok(report_response(report.outcome.is_failed(), failure_reason(&report.outcome), report))
}

async fn update_daily_handler(State(state): State<Arc<AppState>>, Path(date): Path<String>) -> ApiResult<Response> {
    sync_one(&state, &date).await
}

async fn update_specific_date_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DateBody>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    sync_one(&state, &body.date).await
}

async fn update_now_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let services = state.services()?;
    let report = services.sync.sync_today().await;
    Ok(report_response(report.outcome.is_failed(), failure_reason(&report.outcome), report))
}

async fn update_period_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PeriodBody>, JsonRejection>,
) -> ApiResult<Response> {
    let services = state.services()?;
    let Json(body) = body?;
    let range = DateRange::for_sweep(DateKey::parse(&body.start_date)?, DateKey::parse(&body.end_date)?)?;
    let mode = if body.reconcile { SweepMode::Reconcile } else { SweepMode::Routine };
    let report = services.sync.sweep(range, mode).await;
    let status = report.status();
    let reason = report.entries.iter().find_map(|e| failure_reason(&e.outcome));
    let body = json!({ "status": status, "counts": report.counts(), "report": report });
    Ok(report_response(status == RunStatus::Failed, reason, body))
}

async fn resolve_duplicates_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ResolveBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let services = state.services()?;
    let Json(body) = body?;
    let date = DateKey::parse(&body.date)?;
    let results = services.sync.resolve_duplicates(date, body.sheet.as_deref()).await?;
    let removed: usize = results.iter().map(|r| r.removed).sum();
    Ok(Json(json!({ "date": date, "removed": removed, "sheets": results })))
}

async fn start_auto_update_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<SchedulerAck>> {
    state.services()?.scheduler.start().await?;
    Ok(Json(SchedulerAck { running: true }))
}

async fn stop_auto_update_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<SchedulerAck>> {
    state.services()?.scheduler.stop().await?;
    Ok(Json(SchedulerAck { running: false }))
}

async fn auto_update_status_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let status = state.services()?.scheduler.status().await;
    Ok(Json(status).into_response())
}

async fn daily_metrics_handler(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let services = state.services()?;
    let date = DateKey::parse(&date)?;
    let metrics = services.sync.fetch_daily_metrics(date).await?;
    Ok(Json(json!({ "date": date, "metrics": metrics })))
}

async fn all_metrics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let services = state.services()?;
    let range = query.range()?;
    let totals = services.sync.fetch_period_totals(range).await?;
    Ok(Json(json!({ "startDate": range.start, "endDate": range.end, "metrics": totals })))
}

async fn period_metric_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
    metric: PeriodMetric,
) -> ApiResult<Json<serde_json::Value>> {
    let services = state.services()?;
    let range = query.range()?;
    let totals = services.sync.fetch_period_totals(range).await?;
    let mut body = serde_json::Map::new();
    body.insert(
        "period".into(),
        json!({ "startDate": range.start, "endDate": range.end }),
    );
    body.insert(metric.field().into(), json!(metric.value(&totals)));
    Ok(Json(serde_json::Value::Object(body)))
}
