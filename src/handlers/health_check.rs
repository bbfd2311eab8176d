use axum::http::StatusCode;

/// 死活監視エンドポイント
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}
