use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, Request, Response};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tower_sessions::cookie::SameSite;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer};
use tracing::Span;
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt};

mod azure_b2c;
mod common;
mod config;
mod handlers;
mod state;
mod token_cache;

use crate::azure_b2c::B2cClient;
use crate::common::install_response_messages;
use crate::config::AppConfig;
use crate::handlers::create_routes;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // アプリケーション設定の読み込み
    let mut app_config = AppConfig::load()?;
    let web_server_port = app_config.web.port;

    // ログの設定
    LogTracer::init().map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize LogTracer");
        e
    })?;
    let subscriber = create_subscriber("b2c-auth-backend", &app_config.log_level);
    set_global_default(subscriber).map_err(|e| {
        tracing::error!(error = %e, "Failed to set global default subscriber");
        e
    })?;
    tracing::info!("Starting the application...");

    // レスポンスメッセージテーブルをプロセス全体にインストール
    install_response_messages(std::mem::take(&mut app_config.response_messages));

    // B2Cクライアントの構築とJWK公開鍵リフレッシュタスクの起動
    let shutdown_token = CancellationToken::new();
    let b2c = Arc::new(B2cClient::new(app_config.azure_ad_b2c).map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize the B2C client");
        e
    })?);
    Arc::clone(&b2c).spawn_jwks_refresh_task(shutdown_token.clone());

    // ルーターの作成
    let app_state = AppState { b2c };
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_name("b2c_auth_session")
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnSessionEnd);
    let x_request_id = HeaderName::from_static("x-request-id");
    let router = create_routes(app_state)
        .layer(session_layer)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_span)
                .on_response(on_response),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    // Webサーバーの起動
    tracing::info!("Starting the web server on port {}", web_server_port);
    let listener = TcpListener::bind(format!("0.0.0.0:{}", web_server_port)).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_token.clone()))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to start the web server");
            e
        })?;

    // Webサーバーが優雅にシャットダウンされたかをログに出力
    if shutdown_token.is_cancelled() {
        tracing::info!("Application has been shut down gracefully");
    } else {
        tracing::warn!("Application has been shut down unexpectedly");
    }

    Ok(())
}

/// ログ購読者を作成する。
///
/// # Arguments
///
/// * `name` - アプリケーション名
/// * `level` - ログレベル
///
/// # Returns
///
/// 作成したログ購読者
fn create_subscriber(name: &str, level: &str) -> impl tracing::Subscriber + Send + Sync {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let formatting_layer = BunyanFormattingLayer::new(name.into(), std::io::stdout);
    Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
}

/// シャットダウンシグナルを受け取るまで待機する非同期関数
///
/// # Arguments
///
/// * `token` - シャットダウン用のキャンセレーショントークン
async fn shutdown_signal(token: CancellationToken) {
    use tokio::signal;

    // Ctrl+Cシグナルの待機
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    // SIGTERMシグナルの待機（Unix系OSのみ）
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    // Windowsやその他のOSではSIGTERMが利用できないため、永遠に完了しないFutureを使用
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    // `ctrl_c`と`terminate`のいずれかが完了するまで待機
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    token.cancel();
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or("unknown");
    tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri().path(),
    )
}

fn on_response(response: &Response<Body>, latency: Duration, _span: &Span) {
    let status = response.status();
    if status.is_server_error() {
        tracing::error!(%status, latency_ms = latency.as_millis(), "request failed");
    } else if status.is_client_error() {
        tracing::warn!(%status, latency_ms = latency.as_millis(), "client error");
    } else {
        tracing::info!(%status, latency_ms = latency.as_millis(), "request completed");
    }
}
