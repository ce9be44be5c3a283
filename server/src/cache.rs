//! Short-TTL in-memory cache for read-heavy public endpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

pub struct TtlCache {
    max_entries: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a live entry; expired values are dropped on access.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone())
            }
            Some(_) => {}
            None => return None,
        }
        entries.remove(key);
        None
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            // Full of live entries: drop whatever expired, else skip the
            // write. The next sweep restores headroom.
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= self.max_entries {
                return;
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweep. Aborted by the caller on shutdown.
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_live_values_only() {
        let cache = TtlCache::new(16);
        cache.set("k", b"v".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(b"v".to_vec()));

        cache.set("gone", b"x".to_vec(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn sweep_clears_expired_entries() {
        let cache = TtlCache::new(16);
        cache.set("a", b"1".to_vec(), Duration::from_millis(0));
        cache.set("b", b"2".to_vec(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(b"2".to_vec()));
    }

    #[test]
    fn cap_prefers_existing_keys() {
        let cache = TtlCache::new(2);
        cache.set("a", b"1".to_vec(), Duration::from_secs(60));
        cache.set("b", b"2".to_vec(), Duration::from_secs(60));
        cache.set("c", b"3".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get("c"), None);
        // Overwriting a resident key always succeeds.
        cache.set("a", b"9".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some(b"9".to_vec()));
    }
}
