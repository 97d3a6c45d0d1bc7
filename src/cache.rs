use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::formats::Format;
use crate::structs::{PlayerResponse, PoTokenProvider};
use crate::VideoError;

/// Extracted state for one video, cached between API calls.
#[derive(Clone)]
pub(crate) struct VideoSession {
    pub response: PlayerResponse,
    pub player_url: Option<String>,
    pub formats: Vec<Format>,
    pub created_at: Instant,
    pub last_access: Instant,
}

struct SessionCacheInner {
    map: HashMap<String, VideoSession>,
    // Recency order, least recently used at the front.
    order: VecDeque<String>,
}

/// Bounded video session cache. Entries expire lazily on `get` once their
/// TTL has passed and are evicted eagerly on `put` when the cache is full.
pub(crate) struct SessionCache {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<SessionCacheInner>,
}

impl SessionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            inner: Mutex::new(SessionCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, video_id: &str) -> Option<VideoSession> {
        let mut inner = self.inner.lock().expect("session cache poisoned");

        let expired = match inner.map.get(video_id) {
            Some(session) => session.created_at.elapsed() >= self.ttl,
            None => return None,
        };

        if expired {
            inner.map.remove(video_id);
            inner.order.retain(|key| key != video_id);
            log::debug!("session cache: expired {video_id}");
            return None;
        }

        inner.order.retain(|key| key != video_id);
        inner.order.push_back(video_id.to_string());

        let session = inner.map.get_mut(video_id)?;
        session.last_access = Instant::now();
        Some(session.clone())
    }

    pub fn put(&self, video_id: &str, session: VideoSession) {
        if self.max_entries == 0 {
            return;
        }

        let mut inner = self.inner.lock().expect("session cache poisoned");

        if inner.map.contains_key(video_id) {
            inner.order.retain(|key| key != video_id);
        } else if inner.map.len() >= self.max_entries {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
                log::debug!("session cache: evicted {evicted}");
            }
        }

        inner.map.insert(video_id.to_string(), session);
        inner.order.push_back(video_id.to_string());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("session cache poisoned").map.len()
    }
}

/// Client-keyed proof-of-origin token cache. The first non-empty token per
/// client is retained; empty or errored lookups are not cached.
pub(crate) struct PoTokenCache {
    provider: Option<Arc<dyn PoTokenProvider>>,
    tokens: tokio::sync::Mutex<HashMap<String, String>>,
}

impl PoTokenCache {
    pub fn new(provider: Option<Arc<dyn PoTokenProvider>>) -> Self {
        Self {
            provider,
            tokens: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Resolve a token for `client_id`. `Ok(None)` means the provider is
    /// missing or returned an empty token.
    pub async fn token_for(&self, client_id: &str) -> Result<Option<String>, VideoError> {
        let provider = match &self.provider {
            Some(provider) => provider,
            None => return Ok(None),
        };

        {
            let tokens = self.tokens.lock().await;
            if let Some(token) = tokens.get(client_id) {
                return Ok(Some(token.clone()));
            }
        }

        let token = provider.get_token(client_id).await?;
        if token.is_empty() {
            return Ok(None);
        }

        let mut tokens = self.tokens.lock().await;
        // A racing fetch may have landed first; the earliest token wins.
        let token = tokens
            .entry(client_id.to_string())
            .or_insert(token)
            .clone();
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> VideoSession {
        VideoSession {
            response: PlayerResponse::default(),
            player_url: None,
            formats: Vec::new(),
            created_at: Instant::now(),
            last_access: Instant::now(),
        }
    }

    #[test]
    fn evicts_least_recently_used_on_put() {
        let cache = SessionCache::new(Duration::from_secs(60), 2);
        cache.put("aaaaaaaaaaa", session());
        cache.put("bbbbbbbbbbb", session());

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("aaaaaaaaaaa").is_some());

        cache.put("ccccccccccc", session());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("bbbbbbbbbbb").is_none());
        assert!(cache.get("aaaaaaaaaaa").is_some());
        assert!(cache.get("ccccccccccc").is_some());
    }

    #[test]
    fn expires_on_get() {
        let cache = SessionCache::new(Duration::from_millis(0), 4);
        cache.put("aaaaaaaaaaa", session());
        assert!(cache.get("aaaaaaaaaaa").is_none());
        assert_eq!(cache.len(), 0);
    }
}
