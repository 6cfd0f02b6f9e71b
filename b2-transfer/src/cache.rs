//! Pools of short-lived upload URLs.
//!
//! B2 issues upload URLs that must be used by one writer at a time, so the
//! pool hands out exclusive leases: checkout removes the entry, and only a
//! successful use returns it. Failed leases are simply dropped, which is
//! the eviction the protocol requires after any upload error.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use api_kit::Secret;
use http::Uri;
use parking_lot::Mutex;

/// How long the service honors an upload URL.
pub(crate) const UPLOAD_URL_TTL: Duration = Duration::from_secs(3600);

/// An exclusive lease on one upload URL and its matching token.
#[derive(Debug, Clone)]
pub struct UrlLease {
    url: Uri,
    token: Secret,
    issued: Instant,
}

impl UrlLease {
    pub(crate) fn new(url: Uri, token: Secret) -> Self {
        UrlLease {
            url,
            token,
            issued: Instant::now(),
        }
    }

    /// The upload URL.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The authorization token scoped to this URL.
    pub fn token(&self) -> &Secret {
        &self.token
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.issued.elapsed() >= ttl
    }
}

/// A keyed pool of leases, bounded per key.
#[derive(Debug)]
pub(crate) struct UrlPool<K> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<K, Vec<UrlLease>>>,
}

impl<K> UrlPool<K>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new(ttl: Duration, capacity: usize) -> Self {
        UrlPool {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Take an unexpired lease for this key, when one is pooled.
    pub(crate) fn checkout(&self, key: &K) -> Option<UrlLease> {
        let mut entries = self.entries.lock();
        let pool = entries.get_mut(key)?;

        while let Some(lease) = pool.pop() {
            if !lease.expired(self.ttl) {
                return Some(lease);
            }
        }

        None
    }

    /// Return a lease after a successful use.
    pub(crate) fn checkin(&self, key: &K, lease: UrlLease) {
        if lease.expired(self.ttl) {
            return;
        }

        let mut entries = self.entries.lock();
        let pool = entries.entry(key.clone()).or_default();
        if pool.len() < self.capacity {
            pool.push(lease);
        }
    }

    /// Discard every lease for this key.
    pub(crate) fn purge(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    /// Discard every lease in the pool.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    fn pooled(&self, key: &K) -> usize {
        self.entries.lock().get(key).map_or(0, Vec::len)
    }
}
