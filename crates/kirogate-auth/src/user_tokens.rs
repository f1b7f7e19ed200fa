//! Multi-tenant mode: per-user token cache keyed by the caller-supplied
//! refresh secret, with LRU eviction.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AuthResult;
use crate::refresh::{TokenInfo, TokenRefresher};

const DEFAULT_MAX_ENTRIES: usize = 100;

#[derive(Debug)]
struct Entry {
    token: TokenInfo,
}

#[derive(Debug, Default)]
struct Inner {
    cache: HashMap<String, Entry>,
    /// LRU order, oldest first.
    order: Vec<String>,
}

/// Bounded cache of user-supplied refresh secrets to minted access tokens.
#[derive(Debug)]
pub struct UserTokenCache {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl Default for UserTokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl UserTokenCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries,
        }
    }

    /// Return a cached token for this refresh secret, refreshing through the
    /// social flow when missing or expired.
    pub async fn get_or_refresh(
        &self,
        refresh_token: &str,
        refresher: &TokenRefresher,
    ) -> AuthResult<TokenInfo> {
        let key = cache_key(refresh_token);

        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.cache.get(&key) {
                if !entry.token.is_expired() {
                    let token = entry.token.clone();
                    touch(&mut inner.order, &key);
                    debug!("serving cached user token");
                    return Ok(token);
                }
            }
        }

        debug!("refreshing user token");
        let token = refresher.refresh_social(refresh_token).await?;

        let mut inner = self.inner.lock().await;
        let existed = inner.cache.contains_key(&key);
        if !existed && inner.cache.len() >= self.max_entries {
            evict_oldest(&mut inner);
        }
        inner.cache.insert(key.clone(), Entry { token: token.clone() });
        if existed {
            touch(&mut inner.order, &key);
        } else {
            inner.order.push(key);
        }
        Ok(token)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.cache.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Test seam: install a token without hitting the identity service.
    #[cfg(test)]
    async fn insert_for_test(&self, refresh_token: &str, token: TokenInfo) {
        let key = cache_key(refresh_token);
        let mut inner = self.inner.lock().await;
        let existed = inner.cache.contains_key(&key);
        if !existed && inner.cache.len() >= self.max_entries {
            evict_oldest(&mut inner);
        }
        inner.cache.insert(key.clone(), Entry { token });
        if !existed {
            inner.order.push(key);
        }
    }
}

/// A prefix of the secret is enough for uniqueness without keeping the whole
/// value as a map key.
fn cache_key(refresh_token: &str) -> String {
    refresh_token.chars().take(32).collect()
}

fn touch(order: &mut Vec<String>, key: &str) {
    if let Some(position) = order.iter().position(|entry| entry == key) {
        let entry = order.remove(position);
        order.push(entry);
    }
}

fn evict_oldest(inner: &mut Inner) {
    if inner.order.is_empty() {
        return;
    }
    let oldest = inner.order.remove(0);
    inner.cache.remove(&oldest);
    debug!("evicted oldest user token entry");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn token(access: &str, ttl_secs: i64) -> TokenInfo {
        let expires_at = if ttl_secs >= 0 {
            SystemTime::now() + Duration::from_secs(ttl_secs as u64)
        } else {
            SystemTime::now() - Duration::from_secs(ttl_secs.unsigned_abs())
        };
        TokenInfo {
            access_token: access.to_string(),
            refresh_token: format!("rt-{access}"),
            expires_at,
            profile_arn: None,
        }
    }

    #[tokio::test]
    async fn lru_evicts_oldest_at_capacity() {
        let cache = UserTokenCache::new(2);
        cache.insert_for_test("user-a", token("a", 3600)).await;
        cache.insert_for_test("user-b", token("b", 3600)).await;
        cache.insert_for_test("user-c", token("c", 3600)).await;
        assert_eq!(cache.len().await, 2);

        let inner = cache.inner.lock().await;
        assert!(!inner.cache.contains_key(&cache_key("user-a")));
        assert!(inner.cache.contains_key(&cache_key("user-c")));
    }

    #[tokio::test]
    async fn key_is_a_bounded_prefix() {
        let long = "x".repeat(200);
        assert_eq!(cache_key(&long).len(), 32);
        assert_eq!(cache_key("short"), "short");
    }

    #[tokio::test]
    async fn touch_moves_entry_to_back() {
        let mut order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        touch(&mut order, "a");
        assert_eq!(order, vec!["b", "c", "a"]);
    }
}
