use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use server_api::{
    attendance_day_report, attendance_export_rows, login, my_attendance, process_scan,
    record_attendance, ApiContext, ExportKind, ExportRows, SchoolClock,
};
use shared::{
    domain::{ClassroomId, StudentId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttendanceDayReport, AttendanceRecordPayload, LoginResponse, ScanOutcome,
        TeacherAttendanceReport,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod config;
mod export;
mod printable;

use config::{load_settings, prepare_database_url};
use export::{export_filename, student_csv, teacher_csv, ExportPeriod};
use printable::print_document;

const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ScanForm {
    qr_data: String,
}

#[derive(Debug, Deserialize)]
struct DayReportQuery {
    user_id: i64,
    date: Option<String>,
    classroom_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RecordForm {
    status: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    user_id: i64,
    export_type: Option<String>,
    month: Option<String>,
    year: Option<String>,
    classroom_id: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let clock = SchoolClock::from_utc_offset_hours(settings.tz_offset_hours)?;
    let api = ApiContext { storage, clock };

    let state = AppState { api };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(http_login))
        .route("/teacher/scan/process", post(http_process_scan))
        .route("/teacher/attendance", get(http_day_report))
        .route("/teacher/attendance/:student_id", post(http_record_attendance))
        .route("/teacher/my_attendance", get(http_my_attendance))
        .route("/admin/attendance/export", get(http_export))
        .route("/admin/attendance/print", get(http_print))
        .layer(RequestBodyLimitLayer::new(MAX_CONTENT_LENGTH))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let response = login(&state.api, &req.username)
        .await
        .map_err(api_error_response)?;
    Ok(Json(response))
}

async fn http_process_scan(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Form(form): Form<ScanForm>,
) -> Result<Json<ScanOutcome>, (StatusCode, Json<ApiError>)> {
    let outcome = process_scan(&state.api, UserId(q.user_id), &form.qr_data)
        .await
        .map_err(api_error_response)?;
    Ok(Json(outcome))
}

async fn http_day_report(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DayReportQuery>,
) -> Result<Json<AttendanceDayReport>, (StatusCode, Json<ApiError>)> {
    let date = state.api.clock.resolve_date(q.date.as_deref());
    let report = attendance_day_report(
        &state.api,
        UserId(q.user_id),
        Some(date),
        q.classroom_id.map(ClassroomId),
    )
    .await
    .map_err(api_error_response)?;
    Ok(Json(report))
}

async fn http_record_attendance(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Form(form): Form<RecordForm>,
) -> Result<Json<AttendanceRecordPayload>, (StatusCode, Json<ApiError>)> {
    let status = form
        .status
        .as_deref()
        .map(str::trim)
        .filter(|status| !status.is_empty())
        .ok_or_else(|| {
            api_error_response(ApiError::new(
                ErrorCode::Validation,
                "field 'status' is required",
            ))
        })?;
    let record = record_attendance(
        &state.api,
        UserId(q.user_id),
        StudentId(student_id),
        status,
        form.notes.as_deref(),
    )
    .await
    .map_err(api_error_response)?;
    Ok(Json(record))
}

async fn http_my_attendance(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<TeacherAttendanceReport>, (StatusCode, Json<ApiError>)> {
    let report = my_attendance(&state.api, UserId(q.user_id))
        .await
        .map_err(api_error_response)?;
    Ok(Json(report))
}

async fn http_export(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ExportQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let kind = ExportKind::parse(q.export_type.as_deref());
    let period = ExportPeriod::resolve(
        q.month.as_deref(),
        q.year.as_deref(),
        state.api.clock.today(),
    );
    let rows = attendance_export_rows(
        &state.api,
        UserId(q.user_id),
        kind,
        period.start,
        period.end,
        q.classroom_id.map(ClassroomId),
    )
    .await
    .map_err(api_error_response)?;

    let csv = match rows {
        ExportRows::Student(rows) => student_csv(&rows),
        ExportRows::Teacher(rows) => teacher_csv(&rows),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/csv; charset=utf-8"),
    );
    let filename = export_filename(kind, period);
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok((StatusCode::OK, headers, csv))
}

async fn http_print(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DayReportQuery>,
) -> Result<Html<String>, (StatusCode, Json<ApiError>)> {
    let date = state.api.clock.resolve_date(q.date.as_deref());
    let report = attendance_day_report(
        &state.api,
        UserId(q.user_id),
        Some(date),
        q.classroom_id.map(ClassroomId),
    )
    .await
    .map_err(api_error_response)?;

    let title = format!("Laporan Absensi {}", date.format("%d/%m/%Y"));
    let generated_at = state.api.clock.now().format("%d/%m/%Y %H:%M").to_string();
    Ok(Html(print_document(&title, &report, &generated_at)))
}

fn api_error_response(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
