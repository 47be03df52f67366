//! Credential-store collaborator: an internally synchronized username →
//! password map behind a bounded checkout pool.
//!
//! The pool models the external store's connection limit: `checkout` blocks
//! the calling worker while every connection is handed out (back-pressure
//! absorbed internally, never surfaced to a client), and the guard returns
//! its connection on every exit path.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::Deserialize;
use tracing::info;

use crate::error::{ServerError, ServerResult};

/// Lock a mutex, recovering the data if a worker panicked while holding it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A registration attempt for a name that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict;

pub struct CredentialStore {
    users: Mutex<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Warm-start the map from a TOML credentials file:
    ///
    /// ```toml
    /// [users]
    /// alice = "secret"
    /// ```
    pub fn load(path: &Path) -> ServerResult<Self> {
        #[derive(Deserialize)]
        struct CredentialFile {
            #[serde(default)]
            users: HashMap<String, String>,
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        let file: CredentialFile = toml::from_str(&raw)?;
        info!(count = file.users.len(), "loaded credential store");
        Ok(Self {
            users: Mutex::new(file.users),
        })
    }

    pub fn lookup(&self, user: &str) -> Option<String> {
        lock_unpoisoned(&self.users).get(user).cloned()
    }

    /// Insert a new credential pair. Both values travel as parameters; no
    /// statement text is ever assembled from request input.
    pub fn insert(&self, user: &str, passwd: &str) -> Result<(), Conflict> {
        match lock_unpoisoned(&self.users).entry(user.to_string()) {
            Entry::Occupied(_) => Err(Conflict),
            Entry::Vacant(v) => {
                v.insert(passwd.to_string());
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.users).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One checked-out store connection.
pub struct StoreConn {
    store: Arc<CredentialStore>,
}

impl StoreConn {
    pub fn lookup(&self, user: &str) -> Option<String> {
        self.store.lookup(user)
    }

    pub fn insert(&self, user: &str, passwd: &str) -> Result<(), Conflict> {
        self.store.insert(user, passwd)
    }
}

pub struct StorePool {
    idle: Mutex<Vec<StoreConn>>,
    ready: Condvar,
}

impl StorePool {
    pub fn new(size: usize, store: Arc<CredentialStore>) -> Self {
        let idle = (0..size.max(1))
            .map(|_| StoreConn {
                store: store.clone(),
            })
            .collect();
        Self {
            idle: Mutex::new(idle),
            ready: Condvar::new(),
        }
    }

    /// Blocks until a connection is free. Scoped: the guard gives it back
    /// when dropped, including on early-return paths.
    pub fn checkout(&self) -> StoreGuard<'_> {
        let mut idle = lock_unpoisoned(&self.idle);
        loop {
            if let Some(conn) = idle.pop() {
                return StoreGuard { pool: self, conn };
            }
            idle = match self.ready.wait(idle) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn give_back(&self, conn: StoreConn) {
        lock_unpoisoned(&self.idle).push(conn);
        self.ready.notify_one();
    }
}

pub struct StoreGuard<'a> {
    pool: &'a StorePool,
    conn: StoreConn,
}

impl Deref for StoreGuard<'_> {
    type Target = StoreConn;

    fn deref(&self) -> &StoreConn {
        &self.conn
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.pool.give_back(StoreConn {
            store: self.conn.store.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn seeded() -> Arc<CredentialStore> {
        let store = CredentialStore::new();
        store.insert("alice", "secret").unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_lookup_and_conflict() {
        let store = seeded();
        assert_eq!(store.lookup("alice").as_deref(), Some("secret"));
        assert_eq!(store.lookup("bob"), None);

        assert_eq!(store.insert("alice", "other"), Err(Conflict));
        assert_eq!(store.lookup("alice").as_deref(), Some("secret"));

        store.insert("bob", "pw").unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_checkout_release_cycle() {
        let pool = StorePool::new(1, seeded());
        {
            let conn = pool.checkout();
            assert_eq!(conn.lookup("alice").as_deref(), Some("secret"));
        }
        // Released on drop; a second checkout does not block.
        let _again = pool.checkout();
    }

    #[test]
    fn test_exhausted_pool_blocks_then_wakes() {
        let pool = Arc::new(StorePool::new(1, seeded()));
        let guard = pool.checkout();

        let contender = {
            let pool = pool.clone();
            thread::spawn(move || {
                let conn = pool.checkout();
                conn.lookup("alice").is_some()
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(contender.join().unwrap());
    }
}
