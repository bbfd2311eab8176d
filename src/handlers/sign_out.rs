use axum::{
    extract::State,
    response::{IntoResponse, Redirect, Response},
};
use tower_sessions::Session;

use crate::{
    common::{AUTHENTICATION_202, ApiResponse, AppResult},
    state::AppState,
};

use super::{ID_TOKEN_SESSION_KEY, SIGN_OUT_PATH};

/// 現在のユーザーコンテキストからサインアウトする。
pub async fn sign_out(State(app_state): State<AppState>, session: Session) -> AppResult<Response> {
    // 認証済みであれば、セッションを破棄してB2Cのエンドセッションエンドポイントへ
    if session
        .get::<String>(ID_TOKEN_SESSION_KEY)
        .await?
        .is_some()
    {
        session.flush().await?;
        let mut post_logout = app_state.b2c.settings().redirect_uri.clone();
        post_logout.set_path(SIGN_OUT_PATH);
        post_logout.set_query(None);
        let end_session_url = app_state.b2c.end_session_url(post_logout.as_str())?;
        return Ok(Redirect::to(end_session_url.as_str()).into_response());
    }

    // すでにサインアウトしている場合は成功メッセージで応答する
    Ok(ApiResponse::from_code(AUTHENTICATION_202).into_response())
}
