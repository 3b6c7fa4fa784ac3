//! Persisted token cache
//!
//! Records are keyed by (account id, scope set). Reads share a read lock;
//! every mutation takes the write lock and writes a snapshot through the
//! secure store before releasing it, so the on-disk order of snapshots
//! matches the order of mutations. Memory only changes once its snapshot is
//! written.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::tokens::{ScopeSet, TokenRecord};
use crate::storage::{load_json, store_json, SecureStore, StorageResult};

const CACHE_KEY: &str = "token_cache";

type Records = HashMap<String, Vec<TokenRecord>>;

/// Metadata of an expired record, without its secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleToken {
    pub expires_at: DateTime<Utc>,
    pub refreshable: bool,
}

pub struct TokenCache {
    records: RwLock<Records>,
    store: Arc<dyn SecureStore>,
}

impl TokenCache {
    /// Load the cache snapshot from `store` (empty if none was saved).
    pub fn open(store: Arc<dyn SecureStore>) -> StorageResult<Self> {
        let snapshot: Vec<TokenRecord> = load_json(store.as_ref(), CACHE_KEY)?.unwrap_or_default();
        tracing::debug!("Loaded {} cached token record(s)", snapshot.len());

        let mut records = Records::new();
        for record in snapshot {
            insert(&mut records, record);
        }

        Ok(Self {
            records: RwLock::new(records),
            store,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Valid token for `account_id` covering `scopes` at `now`.
    ///
    /// An exact scope-set match wins; otherwise any valid record whose scopes
    /// are a superset is served. Expired records are never returned.
    pub fn get(
        &self,
        account_id: &str,
        scopes: &ScopeSet,
        now: DateTime<Utc>,
    ) -> Option<TokenRecord> {
        let guard = self.read();
        let records = guard.get(account_id)?;

        let valid = |r: &&TokenRecord| !r.is_expired_at(now);
        records
            .iter()
            .filter(valid)
            .find(|r| &r.scopes == scopes)
            .or_else(|| records.iter().filter(valid).find(|r| r.scopes.covers(scopes)))
            .cloned()
    }

    /// Expiry metadata for the exact key if that record has expired at `now`.
    pub fn peek_expired(
        &self,
        account_id: &str,
        scopes: &ScopeSet,
        now: DateTime<Utc>,
    ) -> Option<StaleToken> {
        let guard = self.read();
        guard
            .get(account_id)?
            .iter()
            .find(|r| &r.scopes == scopes && r.is_expired_at(now))
            .map(|r| StaleToken {
                expires_at: r.expires_at,
                refreshable: r.refreshable,
            })
    }

    /// Insert or overwrite the record for its (account, scopes) key.
    pub fn put(&self, record: TokenRecord) -> StorageResult<()> {
        tracing::debug!(
            "Caching token for {} [{}] until {}",
            record.account_id,
            record.scopes,
            record.expires_at
        );
        self.mutate(|records| insert(records, record))
    }

    /// Drop the record for one key. Returns whether anything was removed.
    pub fn remove(&self, account_id: &str, scopes: &ScopeSet) -> StorageResult<bool> {
        self.mutate(|records| {
            let removed = match records.get_mut(account_id) {
                Some(slot) => {
                    let before = slot.len();
                    slot.retain(|r| &r.scopes != scopes);
                    before != slot.len()
                }
                None => false,
            };
            records.retain(|_, slot| !slot.is_empty());
            removed
        })
    }

    /// Remove records expired at `now` that cannot be refreshed.
    ///
    /// Expired refresh-capable records stay so the next acquisition can
    /// refresh them; `get` never serves them either way.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let evicted = self.mutate(|records| {
            let mut evicted = 0;
            for slot in records.values_mut() {
                let before = slot.len();
                slot.retain(|r| r.refreshable || !r.is_expired_at(now));
                evicted += before - slot.len();
            }
            records.retain(|_, slot| !slot.is_empty());
            evicted
        })?;
        if evicted > 0 {
            tracing::debug!("Evicted {} expired token record(s)", evicted);
        }
        Ok(evicted)
    }

    /// Remove every record owned by `account_id`.
    pub fn clear(&self, account_id: &str) -> StorageResult<usize> {
        self.mutate(|records| records.remove(account_id).map_or(0, |slot| slot.len()))
    }

    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `change` to a copy, persist the copy, then install it.
    ///
    /// Unchanged copies are not written. A failed write leaves memory as it
    /// was.
    fn mutate<T>(&self, change: impl FnOnce(&mut Records) -> T) -> StorageResult<T> {
        let mut guard = self.write();
        let mut next = guard.clone();
        let out = change(&mut next);
        if next != *guard {
            let snapshot: Vec<&TokenRecord> = next.values().flatten().collect();
            store_json(self.store.as_ref(), CACHE_KEY, &snapshot)?;
            *guard = next;
        }
        Ok(out)
    }
}

fn insert(records: &mut Records, record: TokenRecord) {
    let slot = records.entry(record.account_id.clone()).or_default();
    match slot.iter_mut().find(|r| r.scopes == record.scopes) {
        Some(existing) => *existing = record,
        None => slot.push(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::AccessToken;
    use crate::storage::MemoryStore;
    use crate::testing::FlakyStore;
    use chrono::Duration;

    fn record(
        account: &str,
        token: &str,
        scopes: &[&str],
        expires_at: DateTime<Utc>,
        refreshable: bool,
    ) -> TokenRecord {
        TokenRecord {
            account_id: account.to_string(),
            access_token: AccessToken::new(token),
            expires_at,
            scopes: ScopeSet::new(scopes),
            refreshable,
        }
    }

    fn cache() -> (TokenCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (TokenCache::open(store.clone()).unwrap(), store)
    }

    fn read() -> ScopeSet {
        ScopeSet::new(["read"])
    }

    #[test]
    fn test_get_returns_valid_record() {
        let (cache, _) = cache();
        let now = Utc::now();
        let later = now + Duration::hours(1);
        cache.put(record("u1", "T1", &["read"], later, false)).unwrap();

        let hit = cache.get("u1", &read(), now).unwrap();
        assert_eq!(hit.access_token.secret(), "T1");
        assert!(cache.get("u2", &read(), now).is_none());
        assert!(cache.get("u1", &ScopeSet::new(["write"]), now).is_none());
    }

    #[test]
    fn test_get_never_returns_expired() {
        let (cache, _) = cache();
        let now = Utc::now();
        let expiry = now + Duration::seconds(5);
        cache.put(record("u1", "T1", &["read"], expiry, true)).unwrap();

        assert!(cache.get("u1", &read(), now + Duration::seconds(4)).is_some());
        assert!(cache.get("u1", &read(), expiry).is_none());
        assert!(cache.get("u1", &read(), now + Duration::days(1)).is_none());
    }

    #[test]
    fn test_put_overwrites_same_key() {
        let (cache, _) = cache();
        let now = Utc::now();
        cache.put(record("u1", "old", &["read"], now + Duration::hours(1), false)).unwrap();
        cache.put(record("u1", "new", &["READ "], now + Duration::hours(2), false)).unwrap();

        assert_eq!(cache.len(), 1);
        let hit = cache.get("u1", &read(), now).unwrap();
        assert_eq!(hit.access_token.secret(), "new");
    }

    #[test]
    fn test_get_prefers_exact_then_superset() {
        let (cache, _) = cache();
        let now = Utc::now();
        let later = now + Duration::hours(1);
        cache.put(record("u1", "wide", &["read", "write"], later, false)).unwrap();

        let hit = cache.get("u1", &read(), now).unwrap();
        assert_eq!(hit.access_token.secret(), "wide");

        cache.put(record("u1", "exact", &["read"], later, false)).unwrap();
        let hit = cache.get("u1", &read(), now).unwrap();
        assert_eq!(hit.access_token.secret(), "exact");
    }

    #[test]
    fn test_peek_expired_reports_metadata_only() {
        let (cache, _) = cache();
        let now = Utc::now();
        let expiry = now - Duration::minutes(1);
        cache.put(record("u1", "T1", &["read"], expiry, true)).unwrap();

        let stale = cache.peek_expired("u1", &read(), now).unwrap();
        assert_eq!(
            stale,
            StaleToken {
                expires_at: expiry,
                refreshable: true
            }
        );
        assert!(cache.peek_expired("u1", &read(), now - Duration::hours(1)).is_none());
    }

    #[test]
    fn test_evict_expired_keeps_refreshable() {
        let (cache, _) = cache();
        let now = Utc::now();
        let past = now - Duration::seconds(1);
        cache.put(record("u1", "dead", &["a"], past, false)).unwrap();
        cache.put(record("u1", "stale", &["b"], past, true)).unwrap();
        cache.put(record("u2", "live", &["a"], now + Duration::hours(1), false)).unwrap();

        assert_eq!(cache.evict_expired(now).unwrap(), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.peek_expired("u1", &ScopeSet::new(["b"]), now).is_some());
        assert!(cache.peek_expired("u1", &ScopeSet::new(["a"]), now).is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let (cache, _) = cache();
        let now = Utc::now();
        let later = now + Duration::hours(1);
        cache.put(record("u1", "a", &["a"], later, false)).unwrap();
        cache.put(record("u1", "b", &["b"], later, false)).unwrap();
        cache.put(record("u2", "c", &["a"], later, false)).unwrap();

        assert!(cache.remove("u1", &ScopeSet::new(["a"])).unwrap());
        assert!(!cache.remove("u1", &ScopeSet::new(["a"])).unwrap());
        assert_eq!(cache.clear("u1").unwrap(), 1);
        assert_eq!(cache.clear("u1").unwrap(), 0);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("u2", &ScopeSet::new(["a"]), now).is_some());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let (cache, store) = cache();
        let now = Utc::now();
        cache.put(record("u1", "T1", &["read"], now + Duration::hours(1), true)).unwrap();
        drop(cache);

        let reopened = TokenCache::open(store).unwrap();
        let hit = reopened.get("u1", &read(), now).unwrap();
        assert_eq!(hit.access_token.secret(), "T1");
        assert!(hit.refreshable);
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let store = FlakyStore::new();
        let cache = TokenCache::open(store.clone()).unwrap();
        let now = Utc::now();
        let later = now + Duration::hours(1);
        cache.put(record("u1", "T1", &["read"], later, false)).unwrap();

        store.set_failing(true);
        assert!(cache.put(record("u1", "T2", &["read"], later, false)).is_err());
        assert!(cache.put(record("u2", "X", &["read"], later, false)).is_err());
        assert!(cache.clear("u1").is_err());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("u1", &read(), now).unwrap().access_token.secret(), "T1");
        assert!(cache.get("u2", &read(), now).is_none());

        store.set_failing(false);
        let reopened = TokenCache::open(store).unwrap();
        assert_eq!(reopened.get("u1", &read(), now).unwrap().access_token.secret(), "T1");
    }
}
