//! Access-token cache.
//!
//! Tokens are valid for roughly two hours; the cache persists them across
//! runs and treats anything within the safety margin of expiry as stale.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, WeChatError};

/// Seconds subtracted from the advertised lifetime so a token is never
/// used right at its expiry edge.
const EXPIRY_MARGIN_SECS: i64 = 200;

#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    /// Unix seconds after which the token must not be used.
    expires_at: i64,
}

pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// A cached token that is still comfortably inside its lifetime, or
    /// `None`. A corrupt cache file reads as a miss.
    pub fn current(&self) -> Option<String> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let cached: CachedToken = match serde_json::from_str(&text) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Token cache malformed, ignoring");
                return None;
            }
        };
        if chrono::Utc::now().timestamp() >= cached.expires_at {
            debug!("Cached access token expired");
            return None;
        }
        Some(cached.access_token)
    }

    pub fn store(&self, access_token: &str, expires_in_secs: i64) -> Result<()> {
        let cached = CachedToken {
            access_token: access_token.to_string(),
            expires_at: chrono::Utc::now().timestamp()
                + (expires_in_secs - EXPIRY_MARGIN_SECS).max(0),
        };
        let io_err = |source: std::io::Error| WeChatError::TokenCache {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(&cached)
            .map_err(|err| io_err(std::io::Error::other(err)))?;
        std::fs::write(&self.path, json).map_err(io_err)
    }

    /// Drop the cached token so the next call re-authenticates.
    pub fn invalidate(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "Token cache invalidation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_current_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(&dir.path().join("wechat_token.json"));
        cache.store("tok-1", 7200).unwrap();
        assert_eq!(cache.current().as_deref(), Some("tok-1"));
    }

    #[test]
    fn expired_token_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(&dir.path().join("wechat_token.json"));
        // Lifetime shorter than the safety margin expires immediately.
        cache.store("tok-1", 100).unwrap();
        assert!(cache.current().is_none());
    }

    #[test]
    fn corrupt_cache_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wechat_token.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(TokenCache::new(&path).current().is_none());
    }

    #[test]
    fn invalidate_clears_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(&dir.path().join("wechat_token.json"));
        cache.store("tok-1", 7200).unwrap();
        cache.invalidate();
        assert!(cache.current().is_none());
        // Invalidating an absent cache is a no-op.
        cache.invalidate();
    }
}
