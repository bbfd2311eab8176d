use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use secrecy::SecretString;
use serde::Deserialize;
use tower_sessions::Session;

use crate::{
    azure_b2c::{B2cError, IdToken},
    common::{AppError, AppResult},
    state::AppState,
    token_cache::TokenCache,
};

use super::{ID_TOKEN_SESSION_KEY, NONCE_SESSION_KEY, SIGN_IN_PATH, STATE_SESSION_KEY};

/// 認可エンドポイントからのコールバックで受け取るクエリパラメーター
#[derive(Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// 認可コードを受け取り、トークンと交換してサインインフローを完了する。
///
/// 取得したIDトークンはセッションに保存し、トークンセットはプロセス全体の
/// トークンキャッシュに保存した上で、サインインアクションへ戻す。
pub async fn callback(
    State(app_state): State<AppState>,
    session: Session,
    Query(params): Query<CallbackParams>,
) -> AppResult<Response> {
    // B2Cがエラーを通知した場合は、受け取った内容ごとシステム障害として処理する
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        return Err(B2cError::RemoteFailure(format!("{error}: {description}")).into());
    }

    let code = params
        .code
        .ok_or_else(|| AppError::Handler("Authorization code missing from callback".into()))?;
    let state = params
        .state
        .ok_or_else(|| AppError::Handler("State parameter missing from callback".into()))?;

    // サインインリクエストで保存したstateと照合
    let expected_state: String = session
        .remove(STATE_SESSION_KEY)
        .await?
        .ok_or_else(|| AppError::Handler("No pending sign-in request for this session".into()))?;
    if state != expected_state {
        return Err(AppError::Handler(
            "State parameter does not match the sign-in request".into(),
        ));
    }
    let expected_nonce: String = session
        .remove(NONCE_SESSION_KEY)
        .await?
        .ok_or_else(|| AppError::Handler("No nonce recorded for this session".into()))?;

    // 認可コードをトークンと交換し、IDトークンを検証する
    let token_set = app_state.b2c.exchange_code(&code).await?;
    let id_token = IdToken(SecretString::new(token_set.id_token.clone().into()));
    let claims = app_state
        .b2c
        .verify_id_token(&id_token, &expected_nonce)
        .await?;

    // トークンセットを、検証済みのsubをキーとしてプロセス全体のキャッシュに保存
    let cache = TokenCache::new(&claims.sub);
    if cache.load().await.is_some() {
        tracing::debug!("Overwriting the cached token set for a returning user");
    }
    let blob = serde_json::to_vec(&token_set)
        .map_err(|e| AppError::Handler(format!("Failed to serialize token set: {e}")))?;
    cache.persist(blob).await;

    // IDトークンをセッションに保存してサインインアクションへ戻す
    session.insert(ID_TOKEN_SESSION_KEY, &token_set.id_token).await?;
    Ok(Redirect::to(SIGN_IN_PATH).into_response())
}
