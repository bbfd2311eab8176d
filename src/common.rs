use std::collections::HashMap;
use std::sync::OnceLock;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::azure_b2c::B2cError;
use crate::config::ConfigError;

pub type AppResult<T> = Result<T, AppError>;

/// 認証に成功したときのレスポンスコード
pub const AUTHENTICATION_201: &str = "AUTHENTICATION_201";

/// サインアウトに成功した、またはすでにサインアウトしているときのレスポンスコード
pub const AUTHENTICATION_202: &str = "AUTHENTICATION_202";

/// システム障害を示すレスポンスコード
pub const AUTHENTICATION_003: &str = "AUTHENTICATION_003";

/// メッセージテーブルに`AUTHENTICATION_003`のエントリがないときに使用するメッセージ
const SYSTEM_FAILURE_MESSAGE: &str = "The request cannot be processed at the moment.";

/// 設定から読み込んだレスポンスメッセージテーブル
///
/// 起動時に一度だけインストールされ、以後は読み取り専用。
static RESPONSE_MESSAGES: OnceLock<HashMap<String, String>> = OnceLock::new();

/// レスポンスメッセージテーブルをプロセス全体にインストールする。
///
/// 2回目以降の呼び出しは無視される。
pub fn install_response_messages(messages: HashMap<String, String>) {
    let _ = RESPONSE_MESSAGES.set(messages);
}

fn lookup_response_message(response_code: &str) -> Option<String> {
    RESPONSE_MESSAGES
        .get()
        .and_then(|messages| messages.get(response_code).cloned())
}

/// レスポンスコードに対応するメッセージを返す。
///
/// メッセージ中の`{0}`プレースホルダーは`arg`で置換する。
/// テーブルにエントリがない場合は、レスポンスコードをそのまま返す。
pub fn response_message(response_code: &str, arg: Option<&str>) -> String {
    let template =
        lookup_response_message(response_code).unwrap_or_else(|| response_code.to_string());
    match arg {
        Some(arg) => template.replace("{0}", arg),
        None => template,
    }
}

/// レスポンスコードに対応するHTTPステータスコードを返す。
///
/// 成功コード（`AUTHENTICATION_201`、`AUTHENTICATION_202`）は200、それ以外は500。
pub fn status_code_for(response_code: &str) -> StatusCode {
    match response_code {
        AUTHENTICATION_201 | AUTHENTICATION_202 => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// すべてのルートが返すフラットなレスポンスエンベロープ
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiResponse {
    pub status_code: u16,
    pub response_code: String,
    pub response_message: String,
}

impl ApiResponse {
    /// レスポンスコードからエンベロープを構築する。
    pub fn from_code(response_code: &str) -> Self {
        Self::with_message_arg(response_code, None)
    }

    /// レスポンスコードからエンベロープを構築し、メッセージの`{0}`を`arg`で置換する。
    pub fn with_message_arg(response_code: &str, arg: Option<&str>) -> Self {
        Self {
            status_code: status_code_for(response_code).as_u16(),
            response_code: response_code.to_string(),
            response_message: response_message(response_code, arg),
        }
    }

    /// システム障害を示す固定のエラーエンベロープを構築する。
    pub fn system_failure() -> Self {
        Self {
            status_code: status_code_for(AUTHENTICATION_003).as_u16(),
            response_code: AUTHENTICATION_003.to_string(),
            response_message: lookup_response_message(AUTHENTICATION_003)
                .unwrap_or_else(|| SYSTEM_FAILURE_MESSAGE.to_string()),
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        (status_code_for(&self.response_code), axum::Json(self)).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    B2c(#[from] B2cError),
    #[error("{0}")]
    Session(#[from] tower_sessions::session::Error),
    #[error("{0}")]
    Handler(String),
}

impl IntoResponse for AppError {
    /// ハンドラで処理されなかったすべてのエラーをここで受け止め、
    /// ログに記録した上で固定のシステム障害エンベロープに変換する。
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Unhandled error, returning the system failure response");
        ApiResponse::system_failure().into_response()
    }
}

#[cfg(test)]
pub(crate) fn install_test_messages() {
    let mut messages = HashMap::new();
    messages.insert(
        AUTHENTICATION_201.to_string(),
        "Authentication successful. Token: {0}".to_string(),
    );
    messages.insert(
        AUTHENTICATION_202.to_string(),
        "Signed out successfully.".to_string(),
    );
    install_response_messages(messages);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_map_to_http_200() {
        assert_eq!(status_code_for(AUTHENTICATION_201), StatusCode::OK);
        assert_eq!(status_code_for(AUTHENTICATION_202), StatusCode::OK);
    }

    #[test]
    fn any_other_code_maps_to_http_500() {
        assert_eq!(
            status_code_for(AUTHENTICATION_003),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_code_for("AUTHENTICATION_999"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn envelope_serializes_with_pascal_case_keys() {
        install_test_messages();
        let envelope = ApiResponse::from_code(AUTHENTICATION_202);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["StatusCode"], 200);
        assert_eq!(json["ResponseCode"], AUTHENTICATION_202);
        assert_eq!(json["ResponseMessage"], "Signed out successfully.");
    }

    #[test]
    fn message_argument_replaces_placeholder() {
        install_test_messages();
        let envelope = ApiResponse::with_message_arg(AUTHENTICATION_201, Some("eyJhbGciO..."));
        assert_eq!(
            envelope.response_message,
            "Authentication successful. Token: eyJhbGciO..."
        );
    }

    #[test]
    fn missing_message_falls_back_to_the_code() {
        install_test_messages();
        assert_eq!(
            response_message("AUTHENTICATION_999", None),
            "AUTHENTICATION_999"
        );
    }

    #[test]
    fn system_failure_uses_the_fixed_fallback_message() {
        // テストのメッセージテーブルはAUTHENTICATION_003のエントリを持たない
        install_test_messages();
        let envelope = ApiResponse::system_failure();
        assert_eq!(envelope.status_code, 500);
        assert_eq!(envelope.response_code, AUTHENTICATION_003);
        assert_eq!(envelope.response_message, SYSTEM_FAILURE_MESSAGE);
    }
}
