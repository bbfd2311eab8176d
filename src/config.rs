use std::collections::HashMap;

use config::Config;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

type ConfigResult<T> = Result<T, ConfigError>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    LoadError(config::ConfigError),
    #[error("{0}")]
    DeserializeError(config::ConfigError),
}

#[derive(Deserialize)]
pub struct AppConfig {
    /// 最小ログレベル
    pub log_level: String,
    pub web: WebConfig,
    pub azure_ad_b2c: AzureAdB2c,
    /// レスポンスコードをキー、ユーザー向けメッセージを値としたメッセージテーブル
    ///
    /// メッセージ中の`{0}`プレースホルダーは、レスポンス構築時に引数で置換される。
    pub response_messages: HashMap<String, String>,
}

impl AppConfig {
    pub fn load() -> ConfigResult<Self> {
        let config = Config::builder()
            .add_source(config::File::with_name("config.yaml"))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()
            .map_err(ConfigError::LoadError)?;
        config
            .try_deserialize()
            .map_err(ConfigError::DeserializeError)
    }
}

#[derive(Deserialize)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Clone, Deserialize)]
pub struct ClientId(pub String);

/// Azure AD B2Cテナントの設定
#[derive(Clone, Deserialize)]
pub struct AzureAdB2c {
    /// B2CディレクトリのAADインスタンス
    ///
    /// 通常は`https://{B2CDirectoryName}.b2clogin.com/tfp`の形式
    pub aad_instance: Url,

    /// B2Cディレクトリのテナント名
    ///
    /// 通常は`{B2CDirectoryName}.onmicrosoft.com`の形式
    pub tenant_id: String,

    /// B2Cアプリ登録のクライアントID
    pub client_id: ClientId,

    /// トークンを取得するためのクライアントシークレット
    pub client_secret: SecretString,

    /// B2Cディレクトリのサインインポリシー名
    ///
    /// 通常は`B2C_1_{PolicyName}`の形式
    pub sign_in_policy_id: String,

    /// B2Cアプリ登録に登録したリダイレクトURI
    ///
    /// 認可コードを受け取るコールバックルートは、このURIのパスに登録される。
    pub redirect_uri: Url,

    /// 発行されるIDトークンの発行者（iss）
    ///
    /// B2Cの発行者はテナントGUIDを含むため、テナント名からは導出できない。
    pub issuer: String,

    /// B2Cアプリ登録で定義したAPIスコープ（スペース区切り）
    pub scopes: String,

    /// キャッシュしたJWK公開鍵のTTL（秒）
    pub jwk_cache_ttl: u64,

    /// バックグラウンドでJWK公開鍵をリフレッシュする間隔（秒）
    pub refresh_jwks_interval: u64,
}

impl AzureAdB2c {
    /// B2Cのオーソリティ
    ///
    /// `{aad_instance}/{tenant_id}/{sign_in_policy_id}/v2.0`の形式
    pub fn authority(&self) -> String {
        format!("{}/v2.0", self.policy_base())
    }

    /// ポリシー固有のエンドポイントのベースURL
    pub fn policy_base(&self) -> String {
        format!(
            "{}/{}/{}",
            self.aad_instance.as_str().trim_end_matches('/'),
            self.tenant_id,
            self.sign_in_policy_id
        )
    }
}
