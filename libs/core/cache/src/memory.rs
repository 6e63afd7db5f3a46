//! In-process binding of [`CacheStore`] for tests and local runs.
//!
//! Expiry is evaluated lazily against `tokio::time::Instant`, so tests can
//! drive TTLs with a paused clock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{CacheError, CacheResult};
use crate::store::{CacheStore, ttl_secs};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// [`CacheStore`] held in a mutex-guarded map.
#[derive(Clone, Default)]
pub struct InMemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut map = self.lock();
        live(&mut map, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| !e.is_live(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn expiry(ttl: Duration) -> Instant {
    Instant::now() + Duration::from_secs(ttl_secs(ttl))
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut map = self.lock();
        match live(&mut map, key, Instant::now()) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        let now = Instant::now();
        let mut map = self.lock();
        Ok(keys
            .iter()
            .map(|key| match live(&mut map, key, now) {
                Some(Entry { value: Value::Str(s), .. }) => Some(s.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(expiry(ttl)),
            },
        );
        Ok(())
    }

    async fn get_del(&self, key: &str) -> CacheResult<Option<String>> {
        let mut map = self.lock();
        let is_list = match live(&mut map, key, Instant::now()) {
            None => return Ok(None),
            Some(entry) => matches!(entry.value, Value::List(_)),
        };
        if is_list {
            return Err(CacheError::WrongType(key.to_string()));
        }

        match map.remove(key) {
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut map = self.lock();
        Ok(live(&mut map, key, Instant::now()).is_some())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        let now = Instant::now();
        let mut map = self.lock();
        let mut removed = 0;
        for key in keys {
            if map.remove(key).is_some_and(|entry| entry.is_live(now)) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut map = self.lock();
        match live(&mut map, key, Instant::now()) {
            Some(entry) => {
                entry.expires_at = Some(expiry(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_push(&self, key: &str, values: &[String]) -> CacheResult<u64> {
        let mut map = self.lock();
        match live(&mut map, key, Instant::now()) {
            Some(Entry { value: Value::List(list), .. }) => {
                list.extend(values.iter().cloned());
                Ok(list.len() as u64)
            }
            Some(_) => Err(CacheError::WrongType(key.to_string())),
            None if values.is_empty() => Ok(0),
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(values.to_vec()),
                        expires_at: None,
                    },
                );
                Ok(values.len() as u64)
            }
        }
    }

    async fn list_range(&self, key: &str, offset: u64, limit: u64) -> CacheResult<Vec<String>> {
        let mut map = self.lock();
        match live(&mut map, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::List(list), .. }) => Ok(list
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn list_len(&self, key: &str) -> CacheResult<u64> {
        let mut map = self.lock();
        match live(&mut map, key, Instant::now()) {
            None => Ok(0),
            Some(Entry { value: Value::List(list), .. }) => Ok(list.len() as u64),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let now = Instant::now();
        let map = self.lock();
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Redis-style glob: `*` any run, `?` any single char, `\` escapes.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some((pi, ti));
                pi += 1;
                continue;
            }
            Some('?') => {
                pi += 1;
                ti += 1;
                continue;
            }
            Some('\\') if p.get(pi + 1) == Some(&t[ti]) => {
                pi += 2;
                ti += 1;
                continue;
            }
            Some(c) if *c != '\\' && *c == t[ti] => {
                pi += 1;
                ti += 1;
                continue;
            }
            _ => {}
        }

        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("delivery:pending:*", "delivery:pending:abc"));
        assert!(glob_match("query:companies:*", "query:companies:9f"));
        assert!(!glob_match("query:companies:*", "query:invites:9f"));
        assert!(glob_match("job:?", "job:1"));
        assert!(!glob_match("job:?", "job:12"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
        assert!(glob_match("literal\\*", "literal*"));
        assert!(!glob_match("literal\\*", "literalx"));
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let store = InMemoryCacheStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.del(&["k".to_string(), "missing".to_string()]).await.unwrap(), 1);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let store = InMemoryCacheStore::new();
        store.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_refreshes_ttl() {
        let store = InMemoryCacheStore::new();
        store.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.expire("k", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.exists("k").await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_operations() {
        let store = InMemoryCacheStore::new();
        let items: Vec<String> = (0..5).map(|i| format!("i{i}")).collect();

        assert_eq!(store.list_push("l", &items[..3]).await.unwrap(), 3);
        assert_eq!(store.list_push("l", &items[3..]).await.unwrap(), 5);
        assert_eq!(store.list_push("l", &[]).await.unwrap(), 5);
        assert_eq!(store.list_len("l").await.unwrap(), 5);

        assert_eq!(store.list_range("l", 1, 2).await.unwrap(), vec!["i1", "i2"]);
        assert_eq!(store.list_range("l", 4, 10).await.unwrap(), vec!["i4"]);
        assert!(store.list_range("l", 9, 10).await.unwrap().is_empty());
        assert!(store.list_range("missing", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = InMemoryCacheStore::new();
        store.set_ex("s", "v", Duration::from_secs(10)).await.unwrap();
        let err = store.list_push("s", &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, CacheError::WrongType(_)));
    }

    #[tokio::test]
    async fn test_get_del_is_destructive() {
        let store = InMemoryCacheStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.get_del("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get_del("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_keys() {
        let store = InMemoryCacheStore::new();
        for key in ["a:1", "a:2", "b:1"] {
            store.set_ex(key, "v", Duration::from_secs(10)).await.unwrap();
        }

        assert_eq!(store.scan_keys("a:*").await.unwrap(), vec!["a:1", "a:2"]);
        assert_eq!(store.scan_keys("*").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_get_many_and_set_many() {
        let store = InMemoryCacheStore::new();
        store
            .set_many_ex(
                &[("x".to_string(), "1".to_string()), ("y".to_string(), "2".to_string())],
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        let values = store
            .get_many(&["x".to_string(), "nope".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("2".to_string())]);
    }
}
