use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::AzureAdB2c;

pub type B2cResult<T> = Result<T, B2cError>;

/// トークンエンドポイントへの接続タイムアウト
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// B2Cエンドポイントからの応答を待つタイムアウト
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// 他のリクエストがJWK公開鍵をリフレッシュしているときに処理を遅延させる時間
const JWKS_REFRESH_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum B2cError {
    /// B2Cエンドポイントの構築に失敗
    #[error("Failed to construct B2C endpoint URL: {0}")]
    InvalidEndpointUrl(url::ParseError),

    /// JWK公開鍵セットの取得に失敗
    #[error("Failed to fetch JWKs from {0}")]
    JwksFetchError(Url),

    /// JWK公開鍵セットのパースに失敗
    #[error("Failed to parse JWKs from {0}: {1}")]
    JwksResponseParseError(Url, reqwest::Error),

    /// 特定のkidを持つJWK公開鍵が存在しない
    #[error("DecodingKey not found for kid: {0}")]
    DecodingKeyNotFound(Kid),

    /// JWKから復号鍵の作成に失敗
    #[error("Failed to create decoding key for kid {0}: {1}")]
    CreateDecodingKeyError(Kid, jsonwebtoken::errors::Error),

    /// トークンのヘッダのデコードに失敗
    #[error("Failed to decode JWT header: {0}")]
    TokenHeaderDecodeError(#[from] jsonwebtoken::errors::Error),

    /// トークンのヘッダにkidが存在しない
    #[error("JWT header missing 'kid'")]
    TokenHeaderMissingKid,

    /// トークンがRS256アルゴリズムを使用していない
    #[error("Unsupported JWT alg: {0:?}")]
    UnsupportedTokenAlgorithm(Algorithm),

    /// JWTの署名またはクレームの検証に失敗
    #[error("Failed to verify JWT signature or claims")]
    VerifyTokenError,

    /// IDトークンのnonceがサインインリクエストのnonceと一致しない
    #[error("Nonce in the ID token does not match the sign-in request")]
    NonceMismatch,

    /// トークンエンドポイントへのリクエストに失敗
    #[error("Failed to request tokens from {0}: {1}")]
    TokenRequestError(Url, reqwest::Error),

    /// トークンエンドポイントがエラーステータスを返した
    #[error("Token endpoint returned status {0}: {1}")]
    TokenEndpointError(u16, String),

    /// トークンエンドポイントのレスポンスのパースに失敗
    #[error("Failed to parse token endpoint response: {0}")]
    TokenResponseParseError(reqwest::Error),

    /// 認可サーバーがコールバックでエラーを通知した
    #[error("Authentication failed at the identity provider: {0}")]
    RemoteFailure(String),

    /// HTTPクライアントの構築に失敗
    #[error("Failed to build HTTP client: {0}")]
    HttpClientBuildError(reqwest::Error),
}

/// 検証済みIDトークンのクレーム
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub aud: String,
    pub iss: String,
    pub exp: usize,
    pub nonce: Option<String>,
    pub name: Option<String>,
    pub emails: Option<Vec<String>>,
}

/// サインインフローで取得したIDトークン
pub struct IdToken(pub SecretString);

/// トークンエンドポイントのレスポンス
///
/// このトークンセットをシリアライズしたものが、プロセス全体のトークンキャッシュに
/// 保存されるブロブとなる。
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenSet {
    pub id_token: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// JWK (Json Web Key)
///
/// B2Cが公開している、IDトークンの署名を検証するための公開鍵。
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct Jwk {
    /// JWK公開鍵を識別するID
    pub kid: String,
    /// JWK公開鍵の種類（RSAなど）
    pub kty: String,
    /// RSA公開鍵のモジュラス
    pub n: String,
    /// RSA公開鍵の指数
    pub e: String,
    /// JWK公開鍵の用途
    #[serde(rename = "use")]
    pub use_: Option<String>,
}

/// キャッシュしたJWK
#[derive(Debug)]
struct CachedJwk {
    jwk: Jwk,
    /// JWK公開鍵を最後に確認した時刻
    last_seen_at: Instant,
}

/// JWK公開鍵のキーID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Kid(String);

impl std::fmt::Display for Kid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// kidをキーに持ち、キャッシュしたJWK公開鍵を値に持つハッシュマップ
///
/// JWK公開鍵はローテーションされるため、複数のJWK公開鍵が同時に公開されている。
type CachedJwkMap = HashMap<Kid, CachedJwk>;

#[derive(Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

/// B2CのJWKsエンドポイントからJWK公開鍵セットを取得する。
#[derive(Clone)]
struct JwksProvider {
    client: reqwest::Client,
}

impl JwksProvider {
    fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, jwks_uri: &Url) -> B2cResult<JwksResponse> {
        let response = self
            .client
            .get(jwks_uri.to_string())
            .send()
            .await
            .map_err(|_| B2cError::JwksFetchError(jwks_uri.clone()))?;
        response
            .json::<JwksResponse>()
            .await
            .map_err(|e| B2cError::JwksResponseParseError(jwks_uri.clone(), e))
    }
}

struct RefreshState {
    last_refreshed_at: Option<Instant>,
    refreshing: bool,
}

struct JwksCache {
    /// kidをキーとしたJWK公開鍵キャッシュ
    entries: RwLock<CachedJwkMap>,
    /// JWK公開鍵キャッシュのTTL
    ttl: Duration,
    /// JWK公開鍵キャッシュのリフレッシュ状態
    refresh_state: Mutex<RefreshState>,
    /// オンデマンドでリフレッシュしてから、次にリフレッシュするまでの最小時間
    refresh_interval: Duration,
}

/// JWK公開鍵キャッシュのリフレッシュ結果
enum JwksCacheRefreshResult {
    /// 他のリクエストがリフレッシュ中
    Refreshing,
    /// 最近リフレッシュされた
    RecentlyRefreshed,
    /// リフレッシュした
    Refreshed,
}

/// Azure AD B2Cに対するOpenID Connectクライアント
///
/// 認可エンドポイントへのリダイレクトURL構築、認可コードとトークンの交換、
/// JWK公開鍵によるIDトークンの検証、エンドセッションURLの構築を担う。
/// 署名とクレームの検証は`jsonwebtoken`に委譲する。
pub struct B2cClient {
    settings: AzureAdB2c,
    http: reqwest::Client,
    provider: JwksProvider,
    cache: JwksCache,
}

impl B2cClient {
    /// コンストラクタ
    ///
    /// JWK公開鍵キャッシュは空の状態で構築され、最初の検証時または
    /// バックグラウンドタスクによって満たされる。
    pub fn new(settings: AzureAdB2c) -> B2cResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(B2cError::HttpClientBuildError)?;
        let cache = JwksCache {
            entries: RwLock::new(CachedJwkMap::new()),
            ttl: Duration::from_secs(settings.jwk_cache_ttl),
            refresh_state: Mutex::new(RefreshState {
                last_refreshed_at: None,
                refreshing: false,
            }),
            refresh_interval: Duration::from_secs(settings.refresh_jwks_interval),
        };
        Ok(Self {
            settings,
            http: http.clone(),
            provider: JwksProvider::new(http),
            cache,
        })
    }

    pub fn settings(&self) -> &AzureAdB2c {
        &self.settings
    }

    /// 認可コードを受け取るコールバックルートのパス
    pub fn redirect_path(&self) -> &str {
        self.settings.redirect_uri.path()
    }

    fn policy_endpoint(&self, suffix: &str) -> B2cResult<Url> {
        Url::parse(&format!("{}/{}", self.settings.policy_base(), suffix))
            .map_err(B2cError::InvalidEndpointUrl)
    }

    /// サインインフローを開始する認可エンドポイントのURLを構築する。
    ///
    /// # Arguments
    ///
    /// * `state` - CSRF対策のstateパラメーター
    /// * `nonce` - IDトークンに含めることを要求するnonce
    ///
    /// # Returns
    ///
    /// 構築した認可エンドポイントのURL
    pub fn authorize_url(&self, state: &str, nonce: &str) -> B2cResult<Url> {
        let mut url = self.policy_endpoint("oauth2/v2.0/authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id.0)
            .append_pair("response_type", "code")
            .append_pair("response_mode", "query")
            .append_pair("redirect_uri", self.settings.redirect_uri.as_str())
            .append_pair("scope", &self.settings.scopes)
            .append_pair("state", state)
            .append_pair("nonce", nonce);
        Ok(url)
    }

    /// サインアウトフローを完了するエンドセッションエンドポイントのURLを構築する。
    ///
    /// # Arguments
    ///
    /// * `post_logout_redirect_uri` - サインアウト後にB2Cが戻るURI
    pub fn end_session_url(&self, post_logout_redirect_uri: &str) -> B2cResult<Url> {
        let mut url = self.policy_endpoint("oauth2/v2.0/logout")?;
        url.query_pairs_mut()
            .append_pair("post_logout_redirect_uri", post_logout_redirect_uri);
        Ok(url)
    }

    fn token_endpoint(&self) -> B2cResult<Url> {
        self.policy_endpoint("oauth2/v2.0/token")
    }

    fn jwks_endpoint(&self) -> B2cResult<Url> {
        self.policy_endpoint("discovery/v2.0/keys")
    }

    /// 認可コードをトークンと交換する。
    ///
    /// # Arguments
    ///
    /// * `code` - コールバックで受け取った認可コード
    ///
    /// # Returns
    ///
    /// トークンエンドポイントが発行したトークンセット
    pub async fn exchange_code(&self, code: &str) -> B2cResult<TokenSet> {
        let uri = self.token_endpoint()?;
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", &self.settings.client_id.0),
            (
                "client_secret",
                self.settings.client_secret.expose_secret(),
            ),
            ("scope", &self.settings.scopes),
            ("code", code),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
        ];
        let response = self
            .http
            .post(uri.to_string())
            .form(&params)
            .send()
            .await
            .map_err(|e| B2cError::TokenRequestError(uri.clone(), e))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".into());
            return Err(B2cError::TokenEndpointError(status.as_u16(), body));
        }
        response
            .json::<TokenSet>()
            .await
            .map_err(B2cError::TokenResponseParseError)
    }

    /// IDトークンを検証する。
    ///
    /// # Arguments
    ///
    /// * `token` - 検証するIDトークン
    /// * `expected_nonce` - サインインリクエストで送信したnonce
    ///
    /// # Returns
    ///
    /// 検証に成功したIDトークンから取得したクレーム
    pub async fn verify_id_token(
        &self,
        token: &IdToken,
        expected_nonce: &str,
    ) -> B2cResult<Claims> {
        // IDトークンのヘッダーをデコードしてkidを取得
        // このkidを信用してはならない。あくまでJWK公開鍵を特定するために使用するだけ。
        let header = decode_header(token.0.expose_secret())?;
        let kid = Kid(header.kid.ok_or(B2cError::TokenHeaderMissingKid)?);

        // B2CはRS256以外のRSA署名アルゴリズムをサポートしていない。
        // ヘッダに記録されているアルゴリズムは信用してはならないため検証する。
        if header.alg != Algorithm::RS256 {
            return Err(B2cError::UnsupportedTokenAlgorithm(header.alg));
        }

        // JWK公開鍵キャッシュからkidに対応する復号鍵を取得
        let decoding_key = self.get_decoding_key(&kid).await?;

        // 検証パラメーターを設定
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.settings.client_id.0]);
        validation.set_issuer(&[&self.settings.issuer]);

        // デコードと検証
        let token_data = decode::<Claims>(token.0.expose_secret(), &decoding_key, &validation)
            .map_err(|_| B2cError::VerifyTokenError)?;

        // サインインリクエストで送信したnonceと照合
        match token_data.claims.nonce.as_deref() {
            Some(nonce) if nonce == expected_nonce => Ok(token_data.claims),
            _ => Err(B2cError::NonceMismatch),
        }
    }

    /// 指定したキーIDに対応する復号鍵を検索する。
    async fn find_decoding_key(&self, key_id: &Kid) -> Option<DecodingKey> {
        let cache = self.cache.entries.read().await;
        let cached_jwk = cache.get(key_id)?;
        decoding_key_from_jwk(&cached_jwk.jwk).ok()
    }

    /// 指定したキーIDに対応する復号鍵を返す。
    ///
    /// キャッシュに存在しない場合は、JWK公開鍵キャッシュを条件付きでリフレッシュして
    /// から再度検索する。
    async fn get_decoding_key(&self, key_id: &Kid) -> B2cResult<DecodingKey> {
        if let Some(key) = self.find_decoding_key(key_id).await {
            return Ok(key);
        }

        match self.maybe_refresh_jwks_cache().await {
            Ok(JwksCacheRefreshResult::Refreshing) => {
                tracing::info!("JWK cache is already refreshing");
                tokio::time::sleep(JWKS_REFRESH_RETRY_DELAY).await;
            }
            Ok(JwksCacheRefreshResult::RecentlyRefreshed) => {
                tracing::info!("JWK cache was recently refreshed");
            }
            Ok(JwksCacheRefreshResult::Refreshed) => {
                tracing::info!("JWK cache refreshed");
            }
            Err(err) => {
                tracing::error!(error = %err, "Error refreshing JWK cache");
            }
        }

        self.find_decoding_key(key_id)
            .await
            .ok_or_else(|| B2cError::DecodingKeyNotFound(key_id.clone()))
    }

    async fn maybe_refresh_jwks_cache(&self) -> B2cResult<JwksCacheRefreshResult> {
        let mut state = self.cache.refresh_state.lock().await;

        let now = Instant::now();

        // 他のリクエストがリフレッシュしている場合は終了
        if state.refreshing {
            drop(state);
            return Ok(JwksCacheRefreshResult::Refreshing);
        }

        // 直近でリフレッシュ済みの場合は終了
        if let Some(last) = state.last_refreshed_at
            && now.duration_since(last) < self.cache.refresh_interval
        {
            return Ok(JwksCacheRefreshResult::RecentlyRefreshed);
        }

        // リフレッシュ開始
        state.refreshing = true;
        drop(state); // ロック解放

        let result = self.refresh_jwks_cache().await;

        // リフレッシュ終了
        let mut state = self.cache.refresh_state.lock().await;
        state.refreshing = false;
        if result.is_ok() {
            state.last_refreshed_at = Some(Instant::now());
        }
        result.map(|_| JwksCacheRefreshResult::Refreshed)
    }

    /// JWK公開鍵キャッシュをリフレッシュする。
    ///
    /// フェッチしたJWK公開鍵をキャッシュにマージし、既存の鍵は`last_seen_at`を更新する。
    pub async fn refresh_jwks_cache(&self) -> B2cResult<()> {
        let jwks_uri = self.jwks_endpoint()?;
        let fetched = self.provider.fetch(&jwks_uri).await?;
        let now = Instant::now();
        let mut cache = self.cache.entries.write().await;
        for key in fetched.keys {
            cache
                .entry(Kid(key.kid.clone()))
                .and_modify(|cached| {
                    cached.last_seen_at = now;
                })
                .or_insert(CachedJwk {
                    jwk: key,
                    last_seen_at: now,
                });
        }
        Ok(())
    }

    /// 古くなったJWK公開鍵をキャッシュから削除する。
    ///
    /// ただし、TTLを超過した場合でも、`last_seen_at`が最も新しいJWK公開鍵は最低1つ残す。
    async fn cleanup_expired_jwks_cache(&self) {
        let mut cache = self.cache.entries.write().await;
        let now = Instant::now();

        let original = std::mem::take(&mut *cache);
        let (mut retained, expired): (CachedJwkMap, CachedJwkMap) = original
            .into_iter()
            .partition(|(_, cached_jwk)| now.duration_since(cached_jwk.last_seen_at) < self.cache.ttl);
        // TTLを超えていないJWK公開鍵が存在しない場合、last_seen_atが最も新しいJWKを1つ残す
        if retained.is_empty()
            && let Some((kid, jwk)) = expired
                .into_iter()
                .max_by_key(|(_, cached_jwk)| cached_jwk.last_seen_at)
        {
            tracing::warn!(
                kid = %kid,
                "All JWKs expired by TTL, retaining the most recent one"
            );
            retained.insert(kid, jwk);
        }
        *cache = retained;
    }

    /// バックグラウンドで定期的にJWK公開鍵を更新するタスクを起動する。
    pub fn spawn_jwks_refresh_task(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.cache.refresh_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("JWK refresh task is shutting down.");
                        break;
                    }
                    _ = interval.tick() => {
                        tracing::info!("Refresh JWKs cache");
                        if let Err(e) = self.refresh_jwks_cache().await {
                            tracing::error!(error = %e, "Error refreshing JWKs");
                        }
                        tracing::info!("Cleanup expired JWKs cache");
                        self.cleanup_expired_jwks_cache().await;
                    }
                }
            }
        });
    }
}

/// JWK公開鍵から復号鍵を取得する。
fn decoding_key_from_jwk(jwk: &Jwk) -> B2cResult<DecodingKey> {
    DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
        .map_err(|e| B2cError::CreateDecodingKeyError(Kid(jwk.kid.clone()), e))
}

/// CSRF対策のstateパラメーターを生成する。
pub fn generate_state() -> String {
    random_url_safe(16)
}

/// IDトークンに含めることを要求するnonceを生成する。
pub fn generate_nonce() -> String {
    random_url_safe(32)
}

fn random_url_safe(len: usize) -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}
