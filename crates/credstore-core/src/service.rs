//! Async front of the store.
//!
//! Key derivation and file IO are blocking, so every operation runs on the
//! blocking pool. Work on one database name is serialized through a per-name
//! async mutex; different names proceed concurrently and only share the key
//! cache.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error};
use zeroize::Zeroizing;

use crate::account::Database;
use crate::archive;
use crate::error::{ErrorKind, IoContext, Result, StoreError};
use crate::file_store::FileStore;

/// What the password prompt is told after an unlock attempt.
#[derive(Debug)]
pub enum PromptOutcome {
    Opened(Database),
    IncorrectPassword,
    Corrupted,
    Failed(String),
    /// A newer attempt for the same database was started; this result was
    /// dropped.
    Superseded,
}

impl From<Result<Database>> for PromptOutcome {
    fn from(result: Result<Database>) -> Self {
        match result {
            Ok(database) => PromptOutcome::Opened(database),
            Err(e) => match e.kind() {
                ErrorKind::IncorrectPassword => PromptOutcome::IncorrectPassword,
                ErrorKind::Corrupted => PromptOutcome::Corrupted,
                _ => PromptOutcome::Failed(e.to_string()),
            },
        }
    }
}

struct Inner {
    store: Arc<FileStore>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    attempts: Mutex<HashMap<String, u64>>,
    in_flight: Mutex<usize>,
    loading: watch::Sender<bool>,
}

/// Cheap to clone; clones share locks, attempt counters and the loading signal.
#[derive(Clone)]
pub struct DatabaseService {
    inner: Arc<Inner>,
}

/// Holds the loading signal up while blocking work is in flight.
struct LoadingGuard<'a> {
    inner: &'a Inner,
}

impl<'a> LoadingGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        let mut count = inner.in_flight.lock();
        *count += 1;
        if *count == 1 {
            inner.loading.send_replace(true);
        }
        Self { inner }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.inner.in_flight.lock();
        *count -= 1;
        if *count == 0 {
            self.inner.loading.send_replace(false);
        }
    }
}

impl DatabaseService {
    pub fn new(store: FileStore) -> Self {
        let (loading, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store: Arc::new(store),
                locks: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(0),
                loading,
            }),
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    /// `true` while any derivation or file operation is running.
    pub fn loading(&self) -> watch::Receiver<bool> {
        self.inner.loading.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        *self.inner.loading.borrow()
    }

    pub async fn list(&self) -> Result<Vec<Database>> {
        self.blocking(|store| store.list()).await
    }

    pub async fn create(&self, database: &Database) -> Result<()> {
        let _guard = self.lock_names([database.name.as_str()]).await;
        let database = database.clone();
        self.blocking(move |store| store.create(&database)).await
    }

    pub async fn open(&self, name: &str, password: &str) -> Result<Database> {
        let _guard = self.lock_names([name]).await;
        let name = name.to_string();
        let password = Zeroizing::new(password.to_string());
        self.blocking(move |store| store.open(&name, &password)).await
    }

    /// One password attempt from the prompt. Only the newest attempt per
    /// database reports its result; older ones finish their derivation and
    /// come back as [`PromptOutcome::Superseded`].
    pub async fn unlock(&self, name: &str, password: &str) -> PromptOutcome {
        let attempt = self.next_attempt(name);
        let result = self.open(name, password).await;
        if !self.is_latest_attempt(name, attempt) {
            debug!(database = %name, attempt, "dropping superseded unlock attempt");
            return PromptOutcome::Superseded;
        }
        result.into()
    }

    /// Persists `database`, which was loaded as `old_name`.
    pub async fn save(&self, old_name: &str, database: &Database) -> Result<()> {
        let _guard = self.lock_names([old_name, database.name.as_str()]).await;
        let renamed = old_name != database.name;
        let owned = old_name.to_string();
        let database = database.clone();
        self.blocking(move |store| store.save(&owned, &database)).await?;
        if renamed {
            self.forget_name(old_name);
        }
        Ok(())
    }

    /// Removes `name`. When the password is known its cached keys go too.
    pub async fn delete(&self, name: &str, password: Option<&str>) -> Result<()> {
        let _guard = self.lock_names([name]).await;
        let owned = name.to_string();
        self.blocking(move |store| store.delete(&owned)).await?;
        if let Some(password) = password {
            self.inner.store.key_cache().invalidate(password);
        }
        self.forget_name(name);
        Ok(())
    }

    /// Locks an open database in memory and forgets the keys of its password.
    pub fn close(&self, database: &mut Database) {
        if let Some(password) = database.password() {
            self.inner.store.key_cache().invalidate(password);
        }
        database.close();
    }

    pub async fn export(&self, name: &str, dest: PathBuf) -> Result<()> {
        let _guard = self.lock_names([name]).await;
        let name = name.to_string();
        self.blocking(move |store| archive::export_to_file(store, &name, &dest))
            .await
    }

    /// Imports every database in the archive at `src`.
    pub async fn import(&self, src: PathBuf) -> Result<Vec<String>> {
        let bundle = self
            .blocking(move |_| {
                let file = File::open(&src).io_context(|| format!("open {}", src.display()))?;
                archive::read_bundle(file)
            })
            .await?;
        let names = bundle.names();
        let _guard = self.lock_names(names.iter().map(String::as_str)).await;
        self.blocking(move |store| archive::install_bundle(store, bundle))
            .await
    }

    fn next_attempt(&self, name: &str) -> u64 {
        let mut attempts = self.inner.attempts.lock();
        let counter = attempts.entry(name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn is_latest_attempt(&self, name: &str, attempt: u64) -> bool {
        self.inner.attempts.lock().get(name).copied() == Some(attempt)
    }

    /// Drops the lock and attempt counter of a name that no longer exists.
    /// Must be called while holding that name's lock; entries someone else
    /// is still waiting on are kept.
    fn forget_name(&self, name: &str) {
        let mut locks = self.inner.locks.lock();
        // One reference in the map, one in the caller's guard.
        if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            locks.remove(name);
            self.inner.attempts.lock().remove(name);
        }
    }

    /// Takes the async locks of `names` in sorted order so two callers
    /// locking overlapping sets cannot deadlock.
    async fn lock_names<'a, I>(&self, names: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut names: Vec<&str> = names.into_iter().collect();
        names.sort_unstable();
        names.dedup();
        let locks: Vec<Arc<AsyncMutex<()>>> = {
            let mut map = self.inner.locks.lock();
            names
                .iter()
                .map(|name| Arc::clone(map.entry((*name).to_string()).or_default()))
                .collect()
        };
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&FileStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _loading = LoadingGuard::new(&self.inner);
        let store = Arc::clone(&self.inner.store);
        match tokio::task::spawn_blocking(move || f(&store)).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "store task failed");
                Err(StoreError::Internal(e.to_string()))
            }
        }
    }
}
