use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use credgate_auth::manager::Manager;
use credgate_auth::record::AuthRecord;
use credgate_auth::{LoginOptions, ManagerError};
use credgate_common::GlobalConfig;
use credgate_providers::{antigravity, codex, kiro};
use credgate_usage::UsageHub;

#[derive(Clone)]
pub struct ManagementState {
    pub manager: Arc<Manager>,
    pub usage: UsageHub,
    pub config: Arc<GlobalConfig>,
    pub client: wreq::Client,
}

pub fn management_router(state: ManagementState) -> Router {
    Router::new()
        .route("/auth-files", get(list_auth_files))
        .route("/auth-files/session-bindings", get(session_bindings))
        .route("/auth-files/priority", put(set_priority))
        .route("/auth-files/disabled", put(set_disabled))
        .route("/auth-files/refresh", post(force_refresh))
        .route("/auth-files/import", post(import_auth_file))
        .route("/auth-files/codex-quota", post(codex_quota))
        .route("/auth-files/kiro-quota", post(kiro_quota))
        .route("/auth-files/antigravity-quota", post(antigravity_quota))
        .route("/auth-files/{id}", delete(delete_auth_file))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            management_auth,
        ))
        .with_state(state)
}

async fn management_auth(
    State(state): State<ManagementState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.management_password.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let provided = extract_bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    if provided != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

async fn list_auth_files(State(state): State<ManagementState>) -> impl IntoResponse {
    let mut views = Vec::new();
    for record in state.manager.list().await {
        views.push(record_view(&state, &record));
    }
    Json(serde_json::json!({ "auth_files": views }))
}

async fn session_bindings(State(state): State<ManagementState>) -> impl IntoResponse {
    let statuses = state.manager.session_bindings();
    Json(serde_json::json!({ "session_bindings": statuses }))
}

#[derive(Debug, Deserialize)]
struct SetPriorityBody {
    id: String,
    priority: i32,
}

async fn set_priority(
    State(state): State<ManagementState>,
    Json(body): Json<SetPriorityBody>,
) -> Response {
    match state.manager.set_priority(&body.id, body.priority).await {
        Ok(record) => ok_record(&state, &record),
        Err(err) => manager_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct SetDisabledBody {
    id: String,
    disabled: bool,
}

async fn set_disabled(
    State(state): State<ManagementState>,
    Json(body): Json<SetDisabledBody>,
) -> Response {
    match state.manager.set_disabled(&body.id, body.disabled).await {
        Ok(record) => ok_record(&state, &record),
        Err(err) => manager_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct RecordIdBody {
    id: String,
}

async fn force_refresh(
    State(state): State<ManagementState>,
    Json(body): Json<RecordIdBody>,
) -> Response {
    match state.manager.force_refresh(&body.id).await {
        Ok(record) => ok_record(&state, &record),
        Err(err) => manager_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    #[serde(default = "default_import_provider")]
    provider: String,
    path: PathBuf,
    #[serde(default)]
    label: Option<String>,
}

fn default_import_provider() -> String {
    kiro::PROVIDER_NAME.to_string()
}

async fn import_auth_file(
    State(state): State<ManagementState>,
    Json(body): Json<ImportBody>,
) -> Response {
    if body.provider != kiro::PROVIDER_NAME {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "unsupported_import_provider",
                "detail": format!("token import is only supported for {}", kiro::PROVIDER_NAME),
            })),
        )
            .into_response();
    }

    let options = LoginOptions {
        label: body.label,
        ..LoginOptions::default()
    };
    let record = match kiro::import_token_file(&body.path, &options) {
        Ok(record) => record,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "import_failed", "detail": err.to_string() })),
            )
                .into_response();
        }
    };
    match state.manager.register(record).await {
        Ok(record) => ok_record(&state, &record),
        Err(err) => manager_error(err),
    }
}

async fn delete_auth_file(
    State(state): State<ManagementState>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.delete(&id).await {
        Ok(()) => {
            state.usage.forget(&id);
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        Err(err) => manager_error(err),
    }
}

async fn codex_quota(
    State(state): State<ManagementState>,
    Json(body): Json<RecordIdBody>,
) -> Response {
    let Some(record) = state.manager.get(&body.id).await else {
        return manager_error(ManagerError::NotFound { id: body.id });
    };
    match codex::probe_codex_quota(&state.client, &record).await {
        Ok(snapshot) => {
            state.usage.codex.update(&record.id, snapshot);
            ok_record(&state, &record)
        }
        Err(err) => probe_error("codex", err),
    }
}

async fn kiro_quota(
    State(state): State<ManagementState>,
    Json(body): Json<RecordIdBody>,
) -> Response {
    let Some(record) = state.manager.get(&body.id).await else {
        return manager_error(ManagerError::NotFound { id: body.id });
    };
    match kiro::probe_kiro_usage(&state.client, &record).await {
        Ok(snapshot) => {
            state.usage.kiro.update(&record.id, snapshot);
            ok_record(&state, &record)
        }
        Err(err) => probe_error("kiro", err),
    }
}

async fn antigravity_quota(
    State(state): State<ManagementState>,
    Json(body): Json<RecordIdBody>,
) -> Response {
    let Some(record) = state.manager.get(&body.id).await else {
        return manager_error(ManagerError::NotFound { id: body.id });
    };
    match antigravity::probe_antigravity_quota(&state.client, &record).await {
        Ok(snapshot) => {
            state.usage.antigravity.update(&record.id, snapshot);
            ok_record(&state, &record)
        }
        Err(err) => probe_error("antigravity", err),
    }
}

fn ok_record(state: &ManagementState, record: &AuthRecord) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "auth_file": record_view(state, record) })),
    )
        .into_response()
}

fn record_view(state: &ManagementState, record: &AuthRecord) -> serde_json::Value {
    let snapshot = match record.provider.as_str() {
        codex::PROVIDER_NAME => state
            .usage
            .codex
            .get(&record.id)
            .and_then(|snap| serde_json::to_value(snap).ok()),
        kiro::PROVIDER_NAME => state
            .usage
            .kiro
            .get(&record.id)
            .and_then(|snap| serde_json::to_value(snap).ok()),
        antigravity::PROVIDER_NAME => state
            .usage
            .antigravity
            .get(&record.id)
            .and_then(|snap| serde_json::to_value(snap).ok()),
        _ => None,
    };

    serde_json::json!({
        "id": record.id,
        "provider": record.provider,
        "label": record.label,
        "status": record.status,
        "disabled": record.disabled,
        "priority": record.priority(),
        "metadata": record.metadata,
        "attributes": record.attributes,
        "quota": record.quota,
        "model_states": record.model_states,
        "session_count": state.manager.selector().session_count(&record.id),
        "quota_snapshot": snapshot,
        "created_at": format_rfc3339(record.created_at),
        "updated_at": format_rfc3339(record.updated_at),
    })
}

fn format_rfc3339(value: time::OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

fn manager_error(err: ManagerError) -> Response {
    match err {
        ManagerError::NotFound { id } => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "auth_file_not_found", "id": id })),
        )
            .into_response(),
        ManagerError::UnknownProvider { provider } => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "unknown_provider", "provider": provider })),
        )
            .into_response(),
        ManagerError::Authenticator(err) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": "authenticator_error", "detail": err.to_string() })),
        )
            .into_response(),
        other => {
            warn!(error = %other, "management mutation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal_error", "detail": other.to_string() })),
            )
                .into_response()
        }
    }
}

fn probe_error(provider: &str, err: credgate_auth::AuthError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({
            "error": "quota_probe_failed",
            "provider": provider,
            "detail": err.to_string(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use credgate_auth::manager::ManagerConfig;
    use credgate_auth::{AuthenticatorRegistry, RequestContext, TokenStore, header_set};
    use tower::ServiceExt;

    const PASSWORD: &str = "test-management-password";

    async fn test_state() -> (ManagementState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("auth"));
        let manager = Arc::new(Manager::new(
            store,
            AuthenticatorRegistry::new(),
            ManagerConfig::default(),
        ));
        let mut config = credgate_common::GlobalConfigPatch::default()
            .into_config()
            .unwrap();
        config.management_password = Some(PASSWORD.to_string());
        let state = ManagementState {
            manager,
            usage: UsageHub::new(),
            config: Arc::new(config),
            client: wreq::Client::new(),
        };
        (state, dir)
    }

    fn request(method: &str, path: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("Authorization", format!("Bearer {PASSWORD}"));
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        builder
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn session_ctx(session_id: &str) -> RequestContext {
        let mut headers = Vec::new();
        header_set(&mut headers, "session_id", session_id);
        RequestContext::new(headers, b"{}".to_vec())
    }

    #[tokio::test]
    async fn requests_without_password_are_rejected() {
        let (state, _dir) = test_state().await;
        let router = management_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/auth-files")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (state, _dir) = test_state().await;
        let router = management_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/auth-files")
                    .header("Authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_includes_computed_fields() {
        let (state, _dir) = test_state().await;
        let mut record = AuthRecord::new("codex-a.json", "codex");
        record.metadata.insert("priority".into(), 10.into());
        state.manager.register(record).await.unwrap();

        let router = management_router(state);
        let response = router
            .oneshot(request("GET", "/auth-files", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json["auth_files"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "codex-a.json");
        assert_eq!(rows[0]["priority"], 10);
        assert_eq!(rows[0]["status"], "active");
        assert_eq!(rows[0]["session_count"], 0);
        assert!(rows[0].get("storage").is_none());
    }

    #[tokio::test]
    async fn session_bindings_report_counts_per_record() {
        let (state, _dir) = test_state().await;
        state
            .manager
            .register(AuthRecord::new("auth-1", "codex"))
            .await
            .unwrap();
        state
            .manager
            .pick("codex", "gpt-test", &session_ctx("s1"))
            .await
            .unwrap();
        state
            .manager
            .pick("codex", "gpt-test", &session_ctx("s2"))
            .await
            .unwrap();

        let router = management_router(state);
        let response = router
            .oneshot(request("GET", "/auth-files/session-bindings", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json["session_bindings"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["auth_id"], "auth-1");
        assert_eq!(rows[0]["session_count"], 2);
        assert!(rows[0]["last_used_at"].is_string());
    }

    #[tokio::test]
    async fn priority_mutation_round_trips() {
        let (state, _dir) = test_state().await;
        state
            .manager
            .register(AuthRecord::new("auth-1", "codex"))
            .await
            .unwrap();

        let router = management_router(state.clone());
        let response = router
            .oneshot(request(
                "PUT",
                "/auth-files/priority",
                Some(serde_json::json!({"id": "auth-1", "priority": 5})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["auth_file"]["priority"], 5);
        assert_eq!(json["auth_file"]["metadata"]["priority"], 5);

        assert_eq!(state.manager.get("auth-1").await.unwrap().priority(), 5);
    }

    #[tokio::test]
    async fn disabling_purges_bindings() {
        let (state, _dir) = test_state().await;
        state
            .manager
            .register(AuthRecord::new("auth-1", "codex"))
            .await
            .unwrap();
        state
            .manager
            .pick("codex", "gpt-test", &session_ctx("s1"))
            .await
            .unwrap();

        let router = management_router(state.clone());
        let response = router
            .oneshot(request(
                "PUT",
                "/auth-files/disabled",
                Some(serde_json::json!({"id": "auth-1", "disabled": true})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["auth_file"]["status"], "disabled");
        assert!(state.manager.session_bindings().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_yield_404() {
        let (state, _dir) = test_state().await;
        let router = management_router(state);

        let refresh = router
            .clone()
            .oneshot(request(
                "POST",
                "/auth-files/refresh",
                Some(serde_json::json!({"id": "ghost"})),
            ))
            .await
            .unwrap();
        assert_eq!(refresh.status(), StatusCode::NOT_FOUND);

        let removed = router
            .oneshot(request("DELETE", "/auth-files/ghost", None))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_record_and_snapshots() {
        let (state, _dir) = test_state().await;
        state
            .manager
            .register(AuthRecord::new("codex-a.json", "codex"))
            .await
            .unwrap();
        state.usage.codex.update(
            "codex-a.json",
            credgate_usage::CodexQuotaSnapshot::default(),
        );

        let router = management_router(state.clone());
        let response = router
            .oneshot(request("DELETE", "/auth-files/codex-a.json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.manager.get("codex-a.json").await.is_none());
        assert!(state.usage.codex.get("codex-a.json").is_none());
    }

    #[tokio::test]
    async fn import_rejects_unknown_provider() {
        let (state, _dir) = test_state().await;
        let router = management_router(state);
        let response = router
            .oneshot(request(
                "POST",
                "/auth-files/import",
                Some(serde_json::json!({"provider": "codex", "path": "/tmp/x"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn import_registers_kiro_token_file() {
        let (state, dir) = test_state().await;
        let token_path = dir.path().join("kiro-auth-token.json");
        std::fs::write(
            &token_path,
            br#"{"accessToken":"at","refreshToken":"rt","profileArn":"arn:x","authMethod":"social"}"#,
        )
        .unwrap();

        let router = management_router(state.clone());
        let response = router
            .oneshot(request(
                "POST",
                "/auth-files/import",
                Some(serde_json::json!({
                    "path": token_path.to_string_lossy(),
                    "label": "imported-account"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["auth_file"]["provider"], "kiro");
        assert_eq!(json["auth_file"]["label"], "imported-account");
        assert!(
            state
                .manager
                .get("kiro-imported-account.json")
                .await
                .is_some()
        );
    }
}
