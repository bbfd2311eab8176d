use axum::{
    extract::State,
    response::{IntoResponse, Redirect, Response},
};
use tower_sessions::Session;

use crate::{
    azure_b2c::{generate_nonce, generate_state},
    common::{AUTHENTICATION_201, ApiResponse, AppResult},
    state::AppState,
};

use super::{ID_TOKEN_SESSION_KEY, NONCE_SESSION_KEY, STATE_SESSION_KEY};

/// B2Cにトークンを要求する。
///
/// サインインフローでは、コールバックでユーザーが認証された後に
/// このアクションが2回目に呼び出される。
///
/// # Returns
///
/// 認証済みであればIDトークンをメッセージに含めたJSONレスポンス、
/// 未認証であれば認可エンドポイントへのリダイレクト
pub async fn sign_in(State(app_state): State<AppState>, session: Session) -> AppResult<Response> {
    // 認証済みであれば、セッションに保存したIDトークンを返す
    if let Some(id_token) = session.get::<String>(ID_TOKEN_SESSION_KEY).await? {
        return Ok(
            ApiResponse::with_message_arg(AUTHENTICATION_201, Some(&id_token)).into_response(),
        );
    }

    // 未認証であれば、認可エンドポイントへリダイレクトしてサインインフローを開始する
    let state = generate_state();
    let nonce = generate_nonce();
    session.insert(STATE_SESSION_KEY, &state).await?;
    session.insert(NONCE_SESSION_KEY, &nonce).await?;
    let authorize_url = app_state.b2c.authorize_url(&state, &nonce)?;
    Ok(Redirect::to(authorize_url.as_str()).into_response())
}
