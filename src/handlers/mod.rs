mod callback;
mod health_check;
mod sign_in;
mod sign_out;

use axum::{Router, routing};

use self::callback::callback;
use self::health_check::health_check;
use self::sign_in::sign_in;
use self::sign_out::sign_out;

use crate::state::AppState;

/// 認証ルートのベースパス
pub const AUTHENTICATION_BASE: &str = "/authenticationapi/Authentication";

/// サインインアクションの絶対パス
pub const SIGN_IN_PATH: &str = "/authenticationapi/Authentication/SignIn";

/// サインアウトアクションの絶対パス
pub const SIGN_OUT_PATH: &str = "/authenticationapi/Authentication/SignOut";

/// セッションに保存するIDトークンのキー
const ID_TOKEN_SESSION_KEY: &str = "id_token";

/// リダイレクト間で保持するstateパラメーターのキー
const STATE_SESSION_KEY: &str = "oidc_state";

/// リダイレクト間で保持するnonceのキー
const NONCE_SESSION_KEY: &str = "oidc_nonce";

/// ルートを作成する。
///
/// # Arguments
///
/// * `app_state` - アプリケーションの状態
///
/// # Returns
///
/// 作成したルーター
pub fn create_routes(app_state: AppState) -> Router {
    let callback_path = app_state.b2c.redirect_path().to_string();
    Router::new()
        .nest(AUTHENTICATION_BASE, authentication_routes())
        .merge(callback_routes(&callback_path))
        .merge(public_routes())
        .with_state(app_state)
}

/// サインインとサインアウトのルートを作成する。
fn authentication_routes() -> Router<AppState> {
    Router::new()
        .route("/SignIn", routing::get(sign_in))
        .route("/SignOut", routing::get(sign_out))
}

/// B2Cアプリ登録に登録したリダイレクトURIのパスにコールバックルートを作成する。
fn callback_routes(path: &str) -> Router<AppState> {
    Router::new().route(path, routing::get(callback))
}

/// 公開ルートを作成する。
fn public_routes() -> Router<AppState> {
    Router::new().route("/health-check", routing::get(health_check))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt as _;
    use secrecy::SecretString;
    use tower::ServiceExt as _;
    use tower_sessions::{MemoryStore, SessionManagerLayer};
    use url::Url;

    use crate::azure_b2c::B2cClient;
    use crate::common::{AUTHENTICATION_003, AUTHENTICATION_202, install_test_messages};
    use crate::config::{AzureAdB2c, ClientId};

    fn b2c_settings() -> AzureAdB2c {
        AzureAdB2c {
            aad_instance: Url::parse("https://contoso.b2clogin.com/tfp").unwrap(),
            tenant_id: "contoso.onmicrosoft.com".into(),
            client_id: ClientId("11111111-2222-3333-4444-555555555555".into()),
            client_secret: SecretString::new("secret".into()),
            sign_in_policy_id: "B2C_1_signin".into(),
            redirect_uri: Url::parse("https://localhost:5001/signin-oidc").unwrap(),
            issuer: "https://contoso.b2clogin.com/99999999-8888-7777-6666-555555555555/v2.0/"
                .into(),
            scopes: "openid offline_access".into(),
            jwk_cache_ttl: 86400,
            refresh_jwks_interval: 3600,
        }
    }

    fn test_app() -> Router {
        install_test_messages();
        let b2c = Arc::new(B2cClient::new(b2c_settings()).unwrap());
        let session_layer = SessionManagerLayer::new(MemoryStore::default()).with_secure(false);
        create_routes(AppState { b2c }).layer(session_layer)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }

    fn parse_envelope(body: &[u8]) -> HashMap<String, serde_json::Value> {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (status, _, _) = get(test_app(), "/health-check").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn sign_in_without_a_session_redirects_to_the_authorize_endpoint() {
        let (status, headers, _) =
            get(test_app(), "/authenticationapi/Authentication/SignIn").await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        let location = headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap();
        assert!(location.starts_with(
            "https://contoso.b2clogin.com/tfp/contoso.onmicrosoft.com/B2C_1_signin/oauth2/v2.0/authorize"
        ));
        assert!(location.contains("client_id=11111111-2222-3333-4444-555555555555"));
        assert!(location.contains("state="));
        assert!(location.contains("nonce="));
        // state/nonceを保持するセッションクッキーが発行される
        assert!(headers.get(header::SET_COOKIE).is_some());
    }

    #[tokio::test]
    async fn sign_out_without_a_session_returns_the_202_envelope() {
        let (status, _, body) =
            get(test_app(), "/authenticationapi/Authentication/SignOut").await;

        assert_eq!(status, StatusCode::OK);
        let envelope = parse_envelope(&body);
        assert_eq!(envelope["ResponseCode"], AUTHENTICATION_202);
        assert_eq!(envelope["StatusCode"], 200);
    }

    #[tokio::test]
    async fn callback_without_a_pending_sign_in_returns_the_failure_envelope() {
        let (status, _, body) = get(test_app(), "/signin-oidc?code=abc&state=xyz").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = parse_envelope(&body);
        assert_eq!(envelope["ResponseCode"], AUTHENTICATION_003);
        assert_eq!(envelope["StatusCode"], 500);
    }

    #[tokio::test]
    async fn callback_with_a_provider_error_returns_the_failure_envelope() {
        let (status, _, body) = get(
            test_app(),
            "/signin-oidc?error=access_denied&error_description=AADB2C90091",
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = parse_envelope(&body);
        assert_eq!(envelope["ResponseCode"], AUTHENTICATION_003);
    }
}
