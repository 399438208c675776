//! Process wide memo of derived keys.
//!
//! Deriving a key costs 100k PBKDF2 rounds, so keys are remembered per
//! (password, salt) until the owning database is closed, deleted or the
//! password turns out to be wrong. Concurrent requests for the same entry
//! share a single derivation.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::kdf::{derive_key, DerivedKey, Salt};

/// Key cache seam used by the file store. Implementations must be safe to
/// share between blocking worker threads.
pub trait KeyCache: Send + Sync {
    fn get_or_derive(&self, password: &str, salt: &Salt) -> Arc<DerivedKey>;

    /// Drops every key derived from `password`, whatever the salt.
    fn invalidate(&self, password: &str);
}

pub type Deriver = dyn Fn(&str, &Salt) -> DerivedKey + Send + Sync;

type Fingerprint = [u8; 32];
type Slot = Arc<OnceLock<Arc<DerivedKey>>>;

pub struct SharedKeyCache {
    entries: Mutex<HashMap<(Fingerprint, Salt), Slot>>,
    deriver: Arc<Deriver>,
}

impl SharedKeyCache {
    pub fn new() -> Self {
        Self::with_deriver(Arc::new(derive_key))
    }

    /// Builds a cache around a custom derivation function.
    pub fn with_deriver(deriver: Arc<Deriver>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            deriver,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for SharedKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCache for SharedKeyCache {
    fn get_or_derive(&self, password: &str, salt: &Salt) -> Arc<DerivedKey> {
        let slot = {
            let mut entries = self.entries.lock();
            entries
                .entry((fingerprint(password), *salt))
                .or_default()
                .clone()
        };
        // Map lock released; callers racing on the same slot block inside
        // get_or_init until the first derivation finishes.
        slot.get_or_init(|| {
            debug!("deriving database key");
            Arc::new((self.deriver)(password, salt))
        })
        .clone()
    }

    fn invalidate(&self, password: &str) {
        let target = fingerprint(password);
        self.entries.lock().retain(|(fp, _), _| *fp != target);
    }
}

fn fingerprint(password: &str) -> Fingerprint {
    Sha256::digest(password.as_bytes()).into()
}
