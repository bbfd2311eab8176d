use std::collections::HashMap;
use std::sync::LazyLock;

use tokio::sync::RwLock;

/// キャッシュIDのサフィックス
const TOKEN_CACHE_SUFFIX: &str = "_TokenCache";

/// プロセス全体で共有するトークンキャッシュ
///
/// `{user_id}_TokenCache`をキー、シリアライズしたトークンセットを値として、
/// プロセスの生存期間にわたって保持する。書き込みは排他、読み取りは並行。
/// エントリはトークンリフレッシュのたびに上書きされ、明示的に削除されることはない。
static TOKEN_CACHE: LazyLock<RwLock<HashMap<String, Vec<u8>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// 特定のユーザーのトークンキャッシュエントリへのハンドル
pub struct TokenCache {
    cache_id: String,
}

impl TokenCache {
    /// コンストラクタ
    ///
    /// # Arguments
    ///
    /// * `user_id` - サインインしたユーザーのsubクレーム
    pub fn new(user_id: &str) -> Self {
        Self {
            cache_id: format!("{user_id}{TOKEN_CACHE_SUFFIX}"),
        }
    }

    /// キャッシュからトークンブロブを読み取る。
    pub async fn load(&self) -> Option<Vec<u8>> {
        let cache = TOKEN_CACHE.read().await;
        cache.get(&self.cache_id).cloned()
    }

    /// トークンブロブをキャッシュに書き込む。既存のブロブは上書きする。
    pub async fn persist(&self, blob: Vec<u8>) {
        let mut cache = TOKEN_CACHE.write().await;
        cache.insert(self.cache_id.clone(), blob);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_returns_none_for_an_unknown_user() {
        let cache = TokenCache::new("unknown-user");
        assert!(cache.load().await.is_none());
    }

    #[tokio::test]
    async fn persist_then_load_returns_the_blob() {
        let cache = TokenCache::new("roundtrip-user");
        cache.persist(vec![1, 2, 3]).await;
        assert_eq!(cache.load().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn persist_overwrites_the_previous_blob() {
        let cache = TokenCache::new("overwrite-user");
        cache.persist(vec![1; 8]).await;
        cache.persist(vec![2; 8]).await;
        assert_eq!(cache.load().await, Some(vec![2; 8]));
    }

    #[tokio::test]
    async fn entries_are_isolated_per_user() {
        let first = TokenCache::new("isolated-user-a");
        let second = TokenCache::new("isolated-user-b");
        first.persist(vec![0xAA; 8]).await;
        second.persist(vec![0xBB; 8]).await;
        assert_eq!(first.load().await, Some(vec![0xAA; 8]));
        assert_eq!(second.load().await, Some(vec![0xBB; 8]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_never_observe_a_torn_blob() {
        const BLOB_LEN: usize = 4096;
        const ROUNDS: usize = 200;

        let writers: Vec<_> = [0xAAu8, 0xBBu8]
            .into_iter()
            .map(|fill| {
                tokio::spawn(async move {
                    let cache = TokenCache::new("contended-user");
                    for _ in 0..ROUNDS {
                        cache.persist(vec![fill; BLOB_LEN]).await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                tokio::spawn(async move {
                    let cache = TokenCache::new("contended-user");
                    for _ in 0..ROUNDS {
                        if let Some(blob) = cache.load().await {
                            assert_eq!(blob.len(), BLOB_LEN);
                            let first = blob[0];
                            assert!(blob.iter().all(|&byte| byte == first));
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in writers.into_iter().chain(readers) {
            task.await.unwrap();
        }
    }
}
