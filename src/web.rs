use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;
use tower_http::services::ServeDir;
use tracing::{debug, error};

use crate::app::AppState;
use crate::error::AppError;
use crate::model::{
    CardRecord,
    DbSafetyReport,
    Listing,
    ScanAccepted,
    ScanEventRecord,
    ScanSubmission,
};
use crate::normalize::{normalize_text, normalize_uid};

// Column widths of the stored text fields.
const SCANNED_AT_MAX_LEN: usize = 40;
const SOURCE_MAX_LEN: usize = 40;
const TARGET_FIELD_MAX_LEN: usize = 80;

pub fn router(state: AppState) -> Router {
    let static_files = ServeDir::new(&state.config.static_dir);
    Router::new()
        .route(
            "/api/scans",
            axum::routing::get(list_scans).post(submit_scan),
        )
        .route(
            "/api/cards",
            axum::routing::get(list_cards).post(post_not_found),
        )
        .route(
            "/api/safety/db",
            axum::routing::get(db_safety).post(post_not_found),
        )
        .fallback_service(axum::routing::get_service(static_files).post(post_not_found))
        .with_state(state)
}

// OPTIONS is answered here with 204; every other response, errors included,
// gets the permissive headers stamped on.
pub async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        cors_headers(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    cors_headers(response.headers_mut());
    response
}

fn cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
}

async fn submit_scan(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ScanAccepted>), AppError> {
    let submission: ScanSubmission = serde_json::from_slice(&body).map_err(|err| {
        error!("failed to parse scan body: {}", err);
        AppError::BadRequest("Invalid JSON body".to_string())
    })?;

    let uid = normalize_uid(submission.uid.as_deref().unwrap_or(""));
    if uid.is_empty() {
        return Err(AppError::BadRequest("uid is required".to_string()));
    }

    let scanned_at = normalize_text(
        submission.scanned_at.as_deref().unwrap_or(""),
        &Utc::now().to_rfc3339(),
        SCANNED_AT_MAX_LEN,
    );
    let source = normalize_text(
        submission.source.as_deref().unwrap_or(""),
        &state.config.default_source,
        SOURCE_MAX_LEN,
    );
    let target_field = match submission.target_field {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(normalize_text(&text, "", TARGET_FIELD_MAX_LEN)),
        Some(other) => Some(normalize_text(&other.to_string(), "", TARGET_FIELD_MAX_LEN)),
    };

    let outcome = state
        .repo
        .record_scan(uid.clone(), scanned_at, source, target_field)
        .await
        .map_err(|err| {
            error!("failed to record scan: {}", err);
            AppError::Internal(err)
        })?;
    debug!(
        card_id = outcome.card_id,
        event_id = outcome.event_id,
        uid = %uid,
        "scan recorded"
    );

    Ok((
        StatusCode::CREATED,
        Json(ScanAccepted {
            ok: true,
            event_id: outcome.event_id,
            uid,
        }),
    ))
}

async fn list_scans(
    State(state): State<AppState>,
) -> Result<Json<Listing<ScanEventRecord>>, AppError> {
    let items = state.repo.recent_scans().await.map_err(|err| {
        error!("failed to fetch recent scans: {}", err);
        AppError::Internal(err)
    })?;
    Ok(Json(Listing {
        count: items.len(),
        items,
    }))
}

async fn list_cards(
    State(state): State<AppState>,
) -> Result<Json<Listing<CardRecord>>, AppError> {
    let items = state.repo.recent_cards().await.map_err(|err| {
        error!("failed to fetch recent cards: {}", err);
        AppError::Internal(err)
    })?;
    Ok(Json(Listing {
        count: items.len(),
        items,
    }))
}

async fn db_safety(State(state): State<AppState>) -> Result<Json<DbSafetyReport>, AppError> {
    let report = state.repo.integrity_report().await.map_err(|err| {
        error!("failed to build db safety report: {}", err);
        AppError::Internal(err)
    })?;
    Ok(Json(report))
}

async fn post_not_found() -> AppError {
    AppError::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::app::build_router;
    use crate::config::AppConfig;
    use crate::db::SqliteRepo;

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("create tempdir");
        let mut config = AppConfig::default();
        config.db_path = dir.path().join("scans.db").to_string_lossy().into_owned();
        config.static_dir = dir.path().join("static").to_string_lossy().into_owned();
        let repo = SqliteRepo::new(&config.db_path);
        repo.ensure_schema().await.expect("apply schema");
        (dir, AppState { config, repo })
    }

    async fn test_app() -> (tempfile::TempDir, Router) {
        let (dir, state) = test_state().await;
        let config = state.config.clone();
        (dir, build_router(state, &config))
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.expect("request must run")
    }

    async fn post_scan(app: &Router, body: &str) -> Response {
        send(
            app,
            Request::builder()
                .method("POST")
                .uri("/api/scans")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("body must be JSON")
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = send(
            app,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        let status = response.status();
        (status, body_json(response).await)
    }

    #[tokio::test]
    async fn fresh_scan_returns_created_with_ids() {
        let (_dir, app) = test_app().await;
        let response = post_scan(&app, r#"{"uid": "  ab cd  "}"#).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["event_id"], json!(1));
        assert_eq!(body["uid"], json!("AB CD"));
    }

    #[tokio::test]
    async fn omitted_fields_fall_back_to_defaults() {
        let (_dir, app) = test_app().await;
        post_scan(&app, r#"{"uid": "aa"}"#).await;

        let (status, body) = get_json(&app, "/api/scans").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], json!(1));
        let item = &body["items"][0];
        assert_eq!(item["uid"], json!("AA"));
        assert_eq!(item["source"], json!("web-serial"));
        assert!(item["scanned_at"].as_str().is_some_and(|s| !s.is_empty()));
        assert_eq!(item["target_field"], Value::Null);
    }

    #[tokio::test]
    async fn repeat_scans_update_their_card() {
        let (_dir, app) = test_app().await;
        post_scan(&app, r#"{"uid": "aa", "scanned_at": "t1"}"#).await;
        post_scan(&app, r#"{"uid": "AA", "scanned_at": "t2"}"#).await;

        let (_, body) = get_json(&app, "/api/cards").await;
        assert_eq!(body["count"], json!(1));
        let card = &body["items"][0];
        assert_eq!(card["uid"], json!("AA"));
        assert_eq!(card["total_scans"], json!(2));
        assert_eq!(card["first_seen_at"], json!("t1"));
        assert_eq!(card["last_seen_at"], json!("t2"));
    }

    #[tokio::test]
    async fn missing_uid_is_rejected_without_writes() {
        let (_dir, app) = test_app().await;
        let response = post_scan(&app, "{}").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("uid is required"));

        let (_, scans) = get_json(&app, "/api/scans").await;
        assert_eq!(scans["count"], json!(0));
    }

    #[tokio::test]
    async fn blank_and_overlong_uids_are_rejected() {
        let (_dir, app) = test_app().await;
        let response = post_scan(&app, r#"{"uid": "   "}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let long_uid = "a".repeat(65);
        let response = post_scan(&app, &format!(r#"{{"uid": "{long_uid}"}}"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("uid is required"));
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_without_writes() {
        let (_dir, app) = test_app().await;
        let response = post_scan(&app, "not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("Invalid JSON body"));

        let (_, scans) = get_json(&app, "/api/scans").await;
        assert_eq!(scans["count"], json!(0));
    }

    #[tokio::test]
    async fn mistyped_fields_are_rejected_as_invalid_json() {
        let (_dir, app) = test_app().await;
        let response = post_scan(&app, r#"{"uid": 7}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("Invalid JSON body"));
    }

    #[tokio::test]
    async fn target_field_accepts_any_json_value_as_text() {
        let (_dir, app) = test_app().await;
        post_scan(&app, r#"{"uid": "a1", "target_field": "badge"}"#).await;
        post_scan(&app, r#"{"uid": "a2", "target_field": 42}"#).await;
        post_scan(&app, r#"{"uid": "a3", "target_field": true}"#).await;
        post_scan(&app, r#"{"uid": "a4", "target_field": null}"#).await;
        post_scan(&app, r#"{"uid": "a5", "target_field": {"a": 1}}"#).await;

        let (_, body) = get_json(&app, "/api/scans").await;
        let fields: Vec<Value> = body["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["target_field"].clone())
            .collect();
        // Newest first.
        assert_eq!(
            fields,
            vec![
                json!("{\"a\":1}"),
                Value::Null,
                json!("true"),
                json!("42"),
                json!("badge"),
            ]
        );
    }

    #[tokio::test]
    async fn overlong_text_fields_are_truncated() {
        let (_dir, app) = test_app().await;
        let source = "s".repeat(60);
        let target = "t".repeat(100);
        post_scan(
            &app,
            &format!(r#"{{"uid": "aa", "source": "{source}", "target_field": "{target}"}}"#),
        )
        .await;

        let (_, body) = get_json(&app, "/api/scans").await;
        let item = &body["items"][0];
        assert_eq!(item["source"].as_str().unwrap().len(), 40);
        assert_eq!(item["target_field"].as_str().unwrap().len(), 80);
    }

    #[tokio::test]
    async fn recent_scans_list_newest_first_with_count() {
        let (_dir, app) = test_app().await;
        post_scan(&app, r#"{"uid": "first"}"#).await;
        post_scan(&app, r#"{"uid": "second"}"#).await;

        let (_, body) = get_json(&app, "/api/scans").await;
        assert_eq!(body["count"], json!(2));
        assert_eq!(body["items"][0]["uid"], json!("SECOND"));
        assert_eq!(body["items"][1]["uid"], json!("FIRST"));
    }

    #[tokio::test]
    async fn safety_report_reads_healthy() {
        let (_dir, app) = test_app().await;
        post_scan(&app, r#"{"uid": "aa"}"#).await;

        let (status, body) = get_json(&app, "/api/safety/db").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["engine"], json!("sqlite"));
        assert_eq!(body["foreign_keys_enabled"], json!(true));
        assert_eq!(body["orphan_events"], json!(0));
        assert_eq!(body["duplicate_uids"], json!([]));
        assert_eq!(body["is_safe"], json!(true));
    }

    #[tokio::test]
    async fn options_preflight_gets_204_and_cors_headers() {
        let (_dir, app) = test_app().await;
        let response = send(
            &app,
            Request::builder()
                .method("OPTIONS")
                .uri("/api/scans")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(headers["access-control-allow-headers"], "Content-Type");
        assert_eq!(headers["access-control-allow-methods"], "GET,POST,OPTIONS");
    }

    #[tokio::test]
    async fn api_and_error_responses_carry_cors_headers() {
        let (_dir, app) = test_app().await;
        let response = send(
            &app,
            Request::builder()
                .uri("/api/cards")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.headers()["access-control-allow-origin"], "*");

        let response = post_scan(&app, "{}").await;
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn post_to_unknown_route_returns_json_404() {
        let (_dir, app) = test_app().await;
        let response = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("Not found"));
    }

    #[tokio::test]
    async fn post_to_get_only_route_returns_json_404() {
        let (_dir, app) = test_app().await;
        let response = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/cards")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("Not found"));
    }

    #[tokio::test]
    async fn unmatched_get_serves_static_files() {
        let (_dir, state) = test_state().await;
        let static_dir = std::path::PathBuf::from(&state.config.static_dir);
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(static_dir.join("hello.txt"), "hi from disk").unwrap();
        let config = state.config.clone();
        let app = build_router(state, &config);

        let response = send(
            &app,
            Request::builder()
                .uri("/hello.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hi from disk");

        let response = send(
            &app,
            Request::builder()
                .uri("/missing.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_paths_cannot_escape_the_root() {
        let (_dir, app) = test_app().await;
        let response = send(
            &app,
            Request::builder()
                .uri("/../Cargo.toml")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
