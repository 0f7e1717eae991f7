use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::catalog::{Catalog, DbUser};

/// Read-mostly cache mapping API keys to users.
///
/// One instance is created at startup and shared by every request through
/// the server state; the request path only takes the read lock.
#[derive(Debug, Default)]
pub struct ApiKeyCache {
    keys: RwLock<HashMap<String, DbUser>>,
}

impl ApiKeyCache {
    pub fn new() -> Self {
        ApiKeyCache {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_user(&self, key: &str) -> Option<DbUser> {
        self.keys.read().unwrap().get(key).cloned()
    }

    /// Add a key/user mapping. An already cached key is left untouched.
    pub fn add_key(&self, key: &str, user: &DbUser) {
        let mut keys = self.keys.write().unwrap();
        keys.entry(key.to_string()).or_insert_with(|| user.clone());
    }

    pub fn remove_key(&self, key: &str) {
        self.keys.write().unwrap().remove(key);
    }

    /// Swap the whole mapping, dropping any key that no longer exists.
    pub fn replace_all(&self, users: Vec<DbUser>) {
        let fresh: HashMap<String, DbUser> = users
            .into_iter()
            .map(|user| (user.apikey.clone(), user))
            .collect();
        *self.keys.write().unwrap() = fresh;
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically reload users from the catalog so rotated or revoked keys
/// fall out of the cache. Spawned at startup when user monitoring is
/// enabled.
pub async fn monitor_users(catalog: Catalog, cache: Arc<ApiKeyCache>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match catalog.list_users().await {
            Ok(users) => {
                debug!(users = users.len(), "refreshed api key cache");
                cache.replace_all(users);
            }
            Err(err) => warn!(error = %err, "could not refresh api key cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str, key: &str) -> DbUser {
        DbUser {
            id: id.to_string(),
            name: id.to_string(),
            apikey: key.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn add_key_does_not_clobber_an_existing_mapping() {
        let cache = ApiKeyCache::new();
        cache.add_key("k1", &user("alice", "k1"));
        cache.add_key("k1", &user("mallory", "k1"));

        assert_eq!(cache.get_user("k1").unwrap().id, "alice");
    }

    #[test]
    fn replace_all_drops_stale_keys() {
        let cache = ApiKeyCache::new();
        cache.add_key("old", &user("alice", "old"));

        cache.replace_all(vec![user("alice", "new")]);

        assert!(cache.get_user("old").is_none());
        assert_eq!(cache.get_user("new").unwrap().id, "alice");
    }
}
