//! Process-local TTL cache for verified API keys.
//!
//! Key revocations propagate by TTL expiry only; there is no push-based
//! invalidation.

use loragate_values::KeyRecord;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default entry lifetime: 30 minutes.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(1800);

/// Default cache capacity.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// SHA-256 hex digest of a raw bearer token.
pub fn hash_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")
}

/// TTL cache over key hashes.
pub struct KeyCache {
    entries: Mutex<HashMap<String, (KeyRecord, Instant)>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl KeyCache {
    /// Cache with explicit TTL and capacity.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        info!(
            ttl_seconds = ttl.as_secs(),
            max_entries, "initialized API key cache"
        );
        Self { entries: Mutex::new(HashMap::new()), ttl, max_entries }
    }

    /// Look up a fresh cached record for a key hash.
    pub fn get(&self, key_hash: &str) -> Option<KeyRecord> {
        let mut entries = self.entries.lock();
        match entries.get(key_hash) {
            Some((record, inserted_at)) if inserted_at.elapsed() < self.ttl => {
                debug!(key_hash = &key_hash[..8.min(key_hash.len())], "API key cache hit");
                Some(record.clone())
            }
            Some(_) => {
                entries.remove(key_hash);
                None
            }
            None => None,
        }
    }

    /// Insert a verified record, evicting expired entries first and the
    /// oldest entry if still at capacity.
    pub fn insert(&self, key_hash: String, record: KeyRecord) {
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() < self.ttl);
        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, (_, inserted_at))| *inserted_at)
                .map(|(hash, _)| hash.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key_hash, (record, Instant::now()));
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
