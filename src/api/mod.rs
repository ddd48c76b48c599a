//! モデル一覧を返すHTTP API
//!
//! `GET /v1/models/` は登録済みモデルをJSON配列で返す。
//! リクエストごとに登録簿のセッションを開き、応答前に閉じる。

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::registry::{ModelRecord, ModelStore, StoreError};

/// ハンドラ間で共有する状態
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ModelStore>,
}

impl AppState {
    pub fn new(store: ModelStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// APIのエラー
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// ブロッキング処理のタスクが異常終了した
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("Request failed: {}", self);
        let body = Json(json!({ "detail": self.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

/// ルーターを構築
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models/", get(list_models))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// 登録済みモデルの一覧
async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelRecord>>, ApiError> {
    let store = Arc::clone(&state.store);
    let models = tokio::task::spawn_blocking(move || {
        let session = store.session()?;
        session.all_models()
    })
    .await??;
    tracing::debug!("Listed {} models", models.len());
    Ok(Json(models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::sample_record;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn initialized_state(dir: &tempfile::TempDir) -> AppState {
        let store = ModelStore::new(dir.path().join("models.db"));
        store.init().unwrap();
        AppState::new(store)
    }

    #[tokio::test]
    async fn empty_registry_returns_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(router(initialized_state(&dir)), "/v1/models/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn lists_registered_model() {
        let dir = tempfile::tempdir().unwrap();
        let state = initialized_state(&dir);
        state.store.session().unwrap().insert_model(&sample_record("escola")).unwrap();

        let (status, body) = get_json(router(state), "/v1/models/").await;

        assert_eq!(status, StatusCode::OK);
        let models = body.as_array().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0]["name"], "escola");
        assert_eq!(models[0]["class_names"], json!(["biblioteca", "cantina", "quadra"]));
        assert_eq!(models[0]["num_epochs"], 7);
    }

    #[tokio::test]
    async fn path_without_trailing_slash_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(router(initialized_state(&dir)), "/v1/models").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_array());
    }

    #[tokio::test]
    async fn database_error_returns_500_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(ModelStore::new(dir.path().join("missing_table.db")));

        let (status, body) = get_json(router(state), "/v1/models/").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("query failed"));
    }
}
