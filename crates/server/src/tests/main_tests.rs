use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use server_api::{ApiContext, SchoolClock};
use shared::domain::{QrEnvelope, SchoolId, UserId, UserRole};
use storage::Storage;
use tower::ServiceExt;

use super::{build_router, AppState};

struct TestApp {
    router: Router,
    school: SchoolId,
    teacher_user: UserId,
    admin_user: UserId,
    student_user: UserId,
}

async fn spawn_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let school = storage
        .create_school("SMA Nusantara", "SMA001", None)
        .await
        .expect("school");
    let admin_user = storage
        .create_user("admin.sma", UserRole::Admin, Some(school))
        .await
        .expect("admin");
    let teacher_user = storage
        .create_user("guru.rina", UserRole::Teacher, Some(school))
        .await
        .expect("teacher user");
    storage
        .create_teacher(school, teacher_user, Some("1985010"), "Rina Kusuma")
        .await
        .expect("teacher");
    let student_user = storage
        .create_user("siswa.alice", UserRole::Student, Some(school))
        .await
        .expect("student user");
    let classroom = storage
        .create_classroom(school, "10A", Some("10"))
        .await
        .expect("classroom");
    storage
        .create_student(school, "2210", "Alice Hartono", Some(classroom))
        .await
        .expect("student");

    let api = ApiContext {
        storage,
        clock: SchoolClock::from_utc_offset_hours(7).expect("clock"),
    };
    TestApp {
        router: build_router(Arc::new(AppState { api })),
        school,
        teacher_user,
        admin_user,
        student_user,
    }
}

fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn text_body(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

#[tokio::test]
async fn healthz_answers_ok() {
    let app = spawn_app().await;
    let response = app.router.oneshot(get("/healthz")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text_body(response).await, "ok");
}

#[tokio::test]
async fn login_resolves_known_usernames() {
    let app = spawn_app().await;

    let response = app
        .router
        .clone()
        .oneshot(json_post("/login", json!({ "username": "guru.rina" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["user_id"], app.teacher_user.0);
    assert_eq!(body["role"], "teacher");
    assert_eq!(body["school_id"], app.school.0);

    let response = app
        .router
        .oneshot(json_post("/login", json!({ "username": "nobody" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn scan_endpoint_records_student_attendance() {
    let app = spawn_app().await;
    let payload = QrEnvelope::student_payload("2210", app.school);
    let uri = format!("/teacher/scan/process?user_id={}", app.teacher_user.0);
    let body = format!("qr_data={payload}");

    let response = app
        .router
        .oneshot(form_post(&uri, &body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = json_body(response).await;
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["message"], "Absensi Alice Hartono berhasil dicatat");
    assert_eq!(outcome["student_name"], "Alice Hartono");
    assert_eq!(outcome["status"], "hadir");
    assert_eq!(outcome["already_recorded"], false);
}

#[tokio::test]
async fn scan_rejections_still_answer_200() {
    let app = spawn_app().await;
    let uri = format!("/teacher/scan/process?user_id={}", app.teacher_user.0);

    let response = app
        .router
        .oneshot(form_post(&uri, "qr_data=STUDENT%3A2210"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = json_body(response).await;
    assert_eq!(outcome["success"], false);
    assert_eq!(outcome["message"], "Format QR tidak valid");
}

#[tokio::test]
async fn scan_operator_failures_map_to_http_statuses() {
    let app = spawn_app().await;
    let payload = QrEnvelope::student_payload("2210", app.school);
    let body = format!("qr_data={payload}");

    let response = app
        .router
        .clone()
        .oneshot(form_post("/teacher/scan/process?user_id=999", &body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let uri = format!("/teacher/scan/process?user_id={}", app.student_user.0);
    let response = app
        .router
        .oneshot(form_post(&uri, &body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let error = json_body(response).await;
    assert_eq!(error["code"], "forbidden");
}

#[tokio::test]
async fn day_report_lists_records_and_summary() {
    let app = spawn_app().await;
    let payload = QrEnvelope::student_payload("2210", app.school);
    let scan_uri = format!("/teacher/scan/process?user_id={}", app.teacher_user.0);
    app.router
        .clone()
        .oneshot(form_post(&scan_uri, &format!("qr_data={payload}")))
        .await
        .expect("response");

    let uri = format!("/teacher/attendance?user_id={}", app.teacher_user.0);
    let response = app.router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let report = json_body(response).await;
    assert_eq!(report["records"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["records"][0]["student_name"], "Alice Hartono");
    assert_eq!(report["summary"]["hadir"], 1);
}

#[tokio::test]
async fn manual_record_requires_a_status_field() {
    let app = spawn_app().await;
    let uri = format!("/teacher/attendance/1?user_id={}", app.teacher_user.0);

    let response = app
        .router
        .clone()
        .oneshot(form_post(&uri, "notes=demam"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = json_body(response).await;
    assert_eq!(error["code"], "validation");
    assert!(error["message"]
        .as_str()
        .is_some_and(|message| message.contains("'status'")));

    let response = app
        .router
        .oneshot(form_post(&uri, "status=izin&notes=demam"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let record = json_body(response).await;
    assert_eq!(record["status"], "izin");
    assert_eq!(record["notes"], "demam");
}

#[tokio::test]
async fn my_attendance_requires_a_teacher_profile() {
    let app = spawn_app().await;

    let uri = format!("/teacher/my_attendance?user_id={}", app.admin_user.0);
    let response = app
        .router
        .clone()
        .oneshot(get(&uri))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let uri = format!("/teacher/my_attendance?user_id={}", app.teacher_user.0);
    let response = app.router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let report = json_body(response).await;
    assert_eq!(report["full_name"], "Rina Kusuma");
}

#[tokio::test]
async fn export_is_admin_only_and_downloads_csv() {
    let app = spawn_app().await;
    let payload = QrEnvelope::student_payload("2210", app.school);
    let scan_uri = format!("/teacher/scan/process?user_id={}", app.teacher_user.0);
    app.router
        .clone()
        .oneshot(form_post(&scan_uri, &format!("qr_data={payload}")))
        .await
        .expect("response");

    let uri = format!("/admin/attendance/export?user_id={}", app.teacher_user.0);
    let response = app
        .router
        .clone()
        .oneshot(get(&uri))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let uri = format!(
        "/admin/attendance/export?user_id={}&month=3&year=2026",
        app.admin_user.0
    );
    let response = app.router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/csv; charset=utf-8")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok()),
        Some("attachment; filename=\"absensi_siswa_03_2026.csv\"")
    );
    let csv = text_body(response).await;
    assert!(csv.starts_with("\"Nama Siswa\",\"Kelas\","));
}

#[tokio::test]
async fn export_falls_back_to_the_current_month_on_bogus_period() {
    let app = spawn_app().await;
    let clock = SchoolClock::from_utc_offset_hours(7).expect("clock");
    let today = clock.today();

    let uri = format!(
        "/admin/attendance/export?user_id={}&export_type=teacher&month=13&year=abc",
        app.admin_user.0
    );
    let response = app.router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let expected = format!(
        "attachment; filename=\"absensi_guru_{:02}_{}.csv\"",
        chrono::Datelike::month(&today),
        chrono::Datelike::year(&today)
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok()),
        Some(expected.as_str())
    );
    let csv = text_body(response).await;
    assert!(csv.starts_with("\"Nama Guru\",\"Tanggal\","));
}

#[tokio::test]
async fn print_view_renders_html_with_print_rules() {
    let app = spawn_app().await;
    let payload = QrEnvelope::student_payload("2210", app.school);
    let scan_uri = format!("/teacher/scan/process?user_id={}", app.teacher_user.0);
    app.router
        .clone()
        .oneshot(form_post(&scan_uri, &format!("qr_data={payload}")))
        .await
        .expect("response");

    let uri = format!("/admin/attendance/print?user_id={}", app.teacher_user.0);
    let response = app.router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/html")));
    let html = text_body(response).await;
    assert!(html.contains("window.print(); window.close();"));
    assert!(html.contains(".no-print"));
    assert!(html.contains("Alice Hartono"));
}
