//! The search-response cache (`RRObj` in the source): a fingerprint-keyed
//! store of completed (and in-flight) search responses, with TTL expiry and
//! a one-way `completed` flag.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use ldap3_proto::control::LdapControl;
use ldap3_proto::proto::{LdapResult, LdapSearchRequest, LdapSearchResultEntry};
use tokio::sync::Mutex;

/// Canonical cache key: a digest of every field of a decoded search
/// request except `messageID` (which lives on the envelope, not on
/// `LdapSearchRequest`, so it never participates). Two requests hash equal
/// iff they share base DN, scope, deref-aliases, size/time limits,
/// types-only flag, filter tree, and attribute list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn of(search: &LdapSearchRequest) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        search.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }
}

/// One stored partial response. `SearchResultReference` is cached under the
/// same rule as `SearchResultEntry` (Open Question, resolved in
/// DESIGN.md): appended to the entry, never itself completing it.
#[derive(Debug, Clone)]
pub enum CachedResponse {
    Entry(LdapSearchResultEntry, Vec<LdapControl>),
    Reference(Vec<String>, Vec<LdapControl>),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub request: LdapSearchRequest,
    pub responses: Vec<CachedResponse>,
    pub completed: bool,
    pub result: Option<(LdapResult, Vec<LdapControl>)>,
    inserted_at: Instant,
}

impl CacheEntry {
    pub fn new(request: LdapSearchRequest) -> Self {
        Self {
            request,
            responses: Vec::new(),
            completed: false,
            result: None,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// The single shared cache instance. Every mutation goes through its own
/// `tokio::sync::Mutex` — the one piece of state genuinely shared across
/// every Connection Pair.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs.max(1)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live (non-expired) entry, completed or in-progress.
    pub async fn get(&self, key: Fingerprint) -> Option<CacheEntry> {
        let mut guard = self.entries.lock().await;
        match guard.get(&key) {
            Some(entry) if !entry.is_expired(self.ttl) => Some(entry.clone()),
            Some(_) => {
                guard.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Inserts a brand-new non-completed entry, or overwrites whatever was
    /// there (step 4 of the request-path algorithm).
    pub async fn set(&self, key: Fingerprint, entry: CacheEntry) {
        self.entries.lock().await.insert(key, entry);
    }

    /// Appends a partial response to an entry if it still exists and has
    /// not yet completed. A completed entry is never mutated again
    /// (completion monotonicity, invariant 4/5 of the data model).
    pub async fn append(&self, key: Fingerprint, response: CachedResponse) {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.get_mut(&key) {
            if !entry.completed {
                entry.responses.push(response);
            }
        }
    }

    /// Marks an entry completed. Idempotent-safe: once `completed` is true
    /// this is a no-op on the flag, matching "never transitions back to
    /// false".
    pub async fn complete(&self, key: Fingerprint, result: LdapResult, ctrl: Vec<LdapControl>) {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.get_mut(&key) {
            if !entry.completed {
                entry.completed = true;
                entry.result = Some((result, ctrl));
            }
        }
    }

    /// Evicts entries older than the configured TTL. Called opportunistically
    /// by the housekeeping loop whenever no pairs are currently active.
    pub async fn purge(&self) {
        let ttl = self.ttl;
        self.entries.lock().await.retain(|_, e| !e.is_expired(ttl));
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3_proto::proto::{LdapDerefAliases, LdapFilter, LdapResultCode, LdapSearchScope};

    fn search(base: &str) -> LdapSearchRequest {
        LdapSearchRequest {
            base: base.to_string(),
            scope: LdapSearchScope::Subtree,
            aliases: LdapDerefAliases::Never,
            sizelimit: 0,
            timelimit: 0,
            typesonly: false,
            filter: LdapFilter::Present("objectClass".to_string()),
            attrs: vec![],
        }
    }

    #[test]
    fn fingerprint_ignores_nothing_but_is_deterministic() {
        let a = Fingerprint::of(&search("dc=example"));
        let b = Fingerprint::of(&search("dc=example"));
        let c = Fingerprint::of(&search("dc=other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn completion_is_monotonic_and_replay_preserves_order() {
        let cache = ResponseCache::new(60);
        let key = Fingerprint::of(&search("dc=example"));
        cache.set(key, CacheEntry::new(search("dc=example"))).await;

        cache
            .append(
                key,
                CachedResponse::Entry(
                    LdapSearchResultEntry {
                        dn: "uid=bob,dc=example".to_string(),
                        attributes: vec![],
                    },
                    vec![],
                ),
            )
            .await;

        cache
            .complete(
                key,
                LdapResult {
                    code: LdapResultCode::Success,
                    matcheddn: String::new(),
                    message: String::new(),
                    referral: vec![],
                },
                vec![],
            )
            .await;

        // further appends after completion are dropped.
        cache
            .append(
                key,
                CachedResponse::Entry(
                    LdapSearchResultEntry {
                        dn: "uid=carol,dc=example".to_string(),
                        attributes: vec![],
                    },
                    vec![],
                ),
            )
            .await;

        let entry = cache.get(key).await.unwrap();
        assert!(entry.completed);
        assert_eq!(entry.responses.len(), 1);
    }

    #[tokio::test]
    async fn purge_evicts_only_expired_entries() {
        let cache = ResponseCache::new(1);
        let key = Fingerprint::of(&search("dc=example"));
        cache.set(key, CacheEntry::new(search("dc=example"))).await;
        cache.purge().await;
        assert_eq!(cache.len().await, 1);
    }
}
