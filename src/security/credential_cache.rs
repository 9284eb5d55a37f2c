use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One cached credential for a target authority.
#[derive(Debug, Clone)]
pub struct CachedCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Per-authority credential cache with absolute expiry.
///
/// `get` serves an entry strictly while `now < expires_at`; expired entries
/// are left in place and superseded by the next `put` (never evicted). The
/// cache is shared across requests via `Clone` and is the only cross-request
/// mutable state in the proxy. Concurrent misses for the same authority may
/// each trigger a refresh; last `put` wins, which is fine because every
/// refresh yields an equally valid token.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    entries: Arc<RwLock<HashMap<String, CachedCredential>>>,
    ttl: Duration,
}

impl CredentialCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::milliseconds(ttl_ms as i64),
        }
    }

    /// Get the credential for `authority`, or `None` when absent or expired.
    pub async fn get(&self, authority: &str) -> Option<String> {
        let entries = self.entries.read().await;
        match entries.get(authority) {
            Some(entry) if Utc::now() < entry.expires_at => Some(entry.token.clone()),
            Some(entry) => {
                debug!(
                    authority = %authority,
                    expired_at = %entry.expires_at,
                    "cached credential expired"
                );
                None
            }
            None => None,
        }
    }

    /// Store a fresh credential, overwriting any previous entry whole.
    pub async fn put(&self, authority: &str, token: String) {
        let expires_at = Utc::now() + self.ttl;
        let mut entries = self.entries.write().await;
        entries.insert(
            authority.to_string(),
            CachedCredential { token, expires_at },
        );
        debug!(authority = %authority, expires_at = %expires_at, "credential cached");
    }
}
