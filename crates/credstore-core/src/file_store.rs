//! Two-files-per-database storage.
//!
//! Every database `N` lives in the storage directory as `N.bin` (the 16 byte
//! salt) and `N.db` (the token holding the encrypted account map). The set of
//! `*.db` files is the catalog. New files are always written to a staging file
//! in the same directory, synced and renamed into place, so a reader never
//! sees a half written `.db` or `.bin`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::account::Database;
use crate::error::{IoContext, Result, StoreError};
use crate::kdf::{Salt, SALT_LEN};
use crate::key_cache::KeyCache;
use crate::records;
use crate::token::{self, TokenError, TokenPolicy};
use crate::validation::is_valid_name;

pub const DB_EXTENSION: &str = "db";
pub const SALT_EXTENSION: &str = "bin";

const STAGING_PREFIX: &str = ".credstore-";
const STAGING_SUFFIX: &str = ".staging";

pub struct FileStore {
    root: PathBuf,
    keys: Arc<dyn KeyCache>,
    policy: TokenPolicy,
}

impl FileStore {
    /// Opens (creating if needed) the storage directory at `root`.
    pub fn open_dir(root: impl AsRef<Path>, keys: Arc<dyn KeyCache>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).io_context(|| format!("create {}", root.display()))?;
        restrict_dir_permissions(&root);
        cleanup_staging_files(&root);
        Ok(Self {
            root,
            keys,
            policy: TokenPolicy::never_expires(),
        })
    }

    pub fn with_policy(mut self, policy: TokenPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_cache(&self) -> &Arc<dyn KeyCache> {
        &self.keys
    }

    pub fn db_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{DB_EXTENSION}"))
    }

    pub fn salt_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{SALT_EXTENSION}"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.db_path(name).is_file()
    }

    /// Catalog names, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let entries =
            fs::read_dir(&self.root).io_context(|| format!("list {}", self.root.display()))?;
        let suffix = format!(".{DB_EXTENSION}");
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.io_context(|| format!("list {}", self.root.display()))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(&suffix) {
                if is_valid_name(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// One locked [`Database`] per catalog entry.
    pub fn list(&self) -> Result<Vec<Database>> {
        Ok(self.names()?.into_iter().map(Database::locked).collect())
    }

    pub fn read_salt(&self, name: &str) -> Result<Salt> {
        let path = self.salt_path(name);
        let bytes = fs::read(&path).io_context(|| format!("read {}", path.display()))?;
        bytes.as_slice().try_into().map_err(|_| {
            StoreError::Corrupted(format!(
                "{} holds {} bytes, expected {SALT_LEN}",
                path.display(),
                bytes.len()
            ))
        })
    }

    pub fn read_token(&self, name: &str) -> Result<String> {
        let path = self.db_path(name);
        let bytes = fs::read(&path).io_context(|| format!("read {}", path.display()))?;
        String::from_utf8(bytes)
            .map_err(|_| StoreError::Corrupted(format!("{} is not UTF-8", path.display())))
    }

    /// Writes the salt and token files of a new database.
    pub fn create(&self, database: &Database) -> Result<()> {
        let name = checked_name(database)?;
        if self.exists(name) {
            return Err(StoreError::NameTaken(name.to_string()));
        }
        let (_, salt) = database.credentials()?;
        let token = self.seal(database)?;
        self.install_pair(name, salt, &token)?;
        info!(database = %name, accounts = database.records.len(), "database created");
        Ok(())
    }

    /// Decrypts `name` with `password`. A wrong password evicts the key it
    /// produced from the cache.
    pub fn open(&self, name: &str, password: &str) -> Result<Database> {
        ensure_valid(name)?;
        if !self.exists(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let salt = self.read_salt(name)?;
        let token = self.read_token(name)?;
        let key = self.keys.get_or_derive(password, &salt);
        let plaintext = match token::decrypt(&key, &token, &self.policy) {
            Ok(text) => text,
            Err(TokenError::InvalidSignature) => {
                warn!(database = %name, "incorrect password");
                self.keys.invalidate(password);
                return Err(StoreError::IncorrectPassword);
            }
            Err(e) => return Err(e.into()),
        };
        let records = records::load(&plaintext)?;
        Ok(Database::new(name, password, salt, records))
    }

    /// Replaces the database stored as `old_name` with `database`, which may
    /// carry a new name, password or salt.
    ///
    /// Every new file is staged before anything is replaced. With a new name
    /// the old files are deleted only after the new pair is in place. With the
    /// same name the salt file (only when the salt changed) and then the token
    /// are renamed over the old ones; if the token cannot be installed the
    /// previous salt is put back.
    pub fn save(&self, old_name: &str, database: &Database) -> Result<()> {
        ensure_valid(old_name)?;
        let name = checked_name(database)?;
        let (_, salt) = database.credentials()?;
        let renamed = name != old_name;
        if renamed && self.exists(name) {
            return Err(StoreError::NameTaken(name.to_string()));
        }
        let token = self.seal(database)?;

        if renamed {
            self.install_pair(name, salt, &token)?;
            self.delete(old_name)?;
        } else {
            self.replace_in_place(name, salt, &token)?;
        }
        info!(database = %name, previous = %old_name, "database saved");
        Ok(())
    }

    fn replace_in_place(&self, name: &str, salt: &Salt, token: &str) -> Result<()> {
        let salt_path = self.salt_path(name);
        let previous_salt = fs::read(&salt_path).ok();
        let salt_changed = previous_salt.as_deref() != Some(salt.as_slice());

        let staged_token = self.stage(token.as_bytes())?;
        let staged_salt = if salt_changed {
            Some(self.stage(salt)?)
        } else {
            None
        };
        let rollback = match (&staged_salt, &previous_salt) {
            (Some(_), Some(previous)) => Some(self.stage(previous)?),
            _ => None,
        };

        if let Some(staged) = staged_salt {
            self.persist(staged, &salt_path, true)?;
        }
        if let Err(e) = self.persist(staged_token, &self.db_path(name), true) {
            if salt_changed {
                warn!(database = %name, "token install failed, restoring previous salt");
                match rollback {
                    Some(previous) => {
                        if let Err(restore) = self.persist(previous, &salt_path, true) {
                            warn!(database = %name, error = %restore, "cannot restore salt");
                        }
                    }
                    None => {
                        let _ = fs::remove_file(&salt_path);
                    }
                }
            }
            return Err(e);
        }
        fsync_dir(&self.root)
    }

    /// Removes both files of `name`. Missing files are not an error.
    pub fn delete(&self, name: &str) -> Result<()> {
        ensure_valid(name)?;
        // .db first so the catalog drops the entry before its salt goes away
        for path in [self.db_path(name), self.salt_path(name)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StoreError::Io {
                        context: format!("remove {}", path.display()),
                        source: e,
                    })
                }
            }
        }
        info!(database = %name, "database deleted");
        Ok(())
    }

    /// Installs a salt/token pair under a name that is not in the catalog.
    pub(crate) fn install_pair(&self, name: &str, salt: &[u8], token: &str) -> Result<()> {
        let staged_salt = self.stage(salt)?;
        let staged_token = self.stage(token.as_bytes())?;
        let salt_path = self.salt_path(name);
        // A stray .bin without its .db is not a database and may be replaced.
        self.persist(staged_salt, &salt_path, true)?;
        if let Err(e) = self.persist(staged_token, &self.db_path(name), false) {
            let _ = fs::remove_file(&salt_path);
            return Err(e);
        }
        fsync_dir(&self.root)
    }

    fn seal(&self, database: &Database) -> Result<String> {
        let (password, salt) = database.credentials()?;
        let key = self.keys.get_or_derive(password, salt);
        let plaintext = records::dump(&database.records)?;
        Ok(token::encrypt(&key, &plaintext)?)
    }

    fn stage(&self, bytes: &[u8]) -> Result<NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.root)
            .io_context(|| format!("stage file in {}", self.root.display()))?;
        staged
            .write_all(bytes)
            .and_then(|_| staged.as_file().sync_all())
            .io_context(|| format!("write {}", staged.path().display()))?;
        Ok(staged)
    }

    fn persist(&self, staged: NamedTempFile, dest: &Path, overwrite: bool) -> Result<()> {
        let result = if overwrite {
            staged.persist(dest)
        } else {
            staged.persist_noclobber(dest)
        };
        result
            .map(|_| ())
            .map_err(|e| e.error)
            .io_context(|| format!("install {}", dest.display()))
    }
}

fn ensure_valid(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

fn checked_name(database: &Database) -> Result<&str> {
    ensure_valid(&database.name)?;
    Ok(&database.name)
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
}

/// Removes staging files left behind by an interrupted write.
fn cleanup_staging_files(root: &Path) {
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX) {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new()
            .read(true)
            .open(path)
            .io_context(|| format!("open {}", path.display()))?;
        dir.sync_all()
            .io_context(|| format!("sync {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, RecordMap};
    use crate::kdf::{DerivedKey, SALT_LEN};
    use crate::key_cache::SharedKeyCache;
    use tempfile::tempdir;

    // Cheap deterministic deriver so the unit tests skip the 100k rounds.
    fn fast_cache() -> Arc<dyn KeyCache> {
        Arc::new(SharedKeyCache::with_deriver(Arc::new(|password: &str, salt: &Salt| {
            let mut bytes = [0u8; 32];
            bytes[..SALT_LEN].copy_from_slice(salt);
            bytes[SALT_LEN..].copy_from_slice(salt);
            // Both halves depend on the password so a wrong one fails the MAC.
            for (i, b) in password.bytes().enumerate() {
                bytes[i % 32] ^= b;
                bytes[(i + SALT_LEN) % 32] ^= b.rotate_left(3);
            }
            DerivedKey::from_bytes(bytes)
        })))
    }

    fn records() -> RecordMap {
        let mut map = RecordMap::new();
        let acc = Account::new("root", "u", "e", "p", "2020-01-01", "c");
        map.insert(acc.account_name.clone(), acc);
        map
    }

    fn store(dir: &Path) -> FileStore {
        FileStore::open_dir(dir, fast_cache()).unwrap()
    }

    #[test]
    fn create_writes_both_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let salt = [9u8; SALT_LEN];
        store
            .create(&Database::new("main", "pw1", salt, records()))
            .unwrap();
        assert_eq!(fs::read(dir.path().join("main.bin")).unwrap(), salt);
        assert!(dir.path().join("main.db").is_file());
        assert_eq!(store.names().unwrap(), vec!["main".to_string()]);
    }

    #[test]
    fn create_refuses_existing_name() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let db = Database::new("main", "pw1", [1u8; SALT_LEN], RecordMap::new());
        store.create(&db).unwrap();
        assert!(matches!(store.create(&db), Err(StoreError::NameTaken(_))));
    }

    #[test]
    fn create_requires_an_open_database() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(
            store.create(&Database::locked("main")),
            Err(StoreError::Locked(_))
        ));
        assert!(store.names().unwrap().is_empty());
    }

    #[test]
    fn unsafe_names_never_reach_the_filesystem() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let db = Database::new("../escape", "pw", [1u8; SALT_LEN], RecordMap::new());
        assert!(matches!(store.create(&db), Err(StoreError::InvalidName(_))));
    }

    #[test]
    fn open_round_trip_and_wrong_password() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .create(&Database::new("main", "pw1", [2u8; SALT_LEN], records()))
            .unwrap();
        let before = fs::read(dir.path().join("main.db")).unwrap();

        let opened = store.open("main", "pw1").unwrap();
        assert!(opened.is_open());
        assert_eq!(opened.records, records());

        assert!(matches!(
            store.open("main", "wrong"),
            Err(StoreError::IncorrectPassword)
        ));
        assert_eq!(fs::read(dir.path().join("main.db")).unwrap(), before);
    }

    #[test]
    fn open_missing_database() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            store(dir.path()).open("ghost", "pw"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn short_salt_is_corruption() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .create(&Database::new("main", "pw1", [2u8; SALT_LEN], records()))
            .unwrap();
        fs::write(dir.path().join("main.bin"), b"short").unwrap();
        assert!(matches!(store.open("main", "pw1"), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn authenticated_garbage_is_corruption() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let salt = [4u8; SALT_LEN];
        store
            .create(&Database::new("main", "pw1", salt, RecordMap::new()))
            .unwrap();
        let key = store.key_cache().get_or_derive("pw1", &salt);
        let token = token::encrypt(&key, "{definitely not json").unwrap();
        fs::write(dir.path().join("main.db"), token).unwrap();
        assert!(matches!(store.open("main", "pw1"), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn save_with_new_name_moves_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .create(&Database::new("test", "pw1", [5u8; SALT_LEN], RecordMap::new()))
            .unwrap();
        let renamed = Database::new("test2", "pw2", [6u8; SALT_LEN], records());
        store.save("test", &renamed).unwrap();

        assert!(!dir.path().join("test.db").exists());
        assert!(!dir.path().join("test.bin").exists());
        assert_eq!(store.open("test2", "pw2").unwrap().records, records());
    }

    #[test]
    fn save_in_place_keeps_name() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let salt = [7u8; SALT_LEN];
        store
            .create(&Database::new("main", "pw1", salt, RecordMap::new()))
            .unwrap();
        store
            .save("main", &Database::new("main", "pw2", salt, records()))
            .unwrap();
        assert_eq!(store.names().unwrap(), vec!["main".to_string()]);
        assert_eq!(store.open("main", "pw2").unwrap().records, records());
        assert!(matches!(
            store.open("main", "pw1"),
            Err(StoreError::IncorrectPassword)
        ));
    }

    #[test]
    fn save_onto_other_database_is_refused() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .create(&Database::new("a", "pw", [1u8; SALT_LEN], RecordMap::new()))
            .unwrap();
        store
            .create(&Database::new("b", "pw", [2u8; SALT_LEN], RecordMap::new()))
            .unwrap();
        let clash = Database::new("b", "pw", [1u8; SALT_LEN], records());
        assert!(matches!(store.save("a", &clash), Err(StoreError::NameTaken(_))));
        assert!(store.open("a", "pw").unwrap().records.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .create(&Database::new("main", "pw", [1u8; SALT_LEN], RecordMap::new()))
            .unwrap();
        store.delete("main").unwrap();
        store.delete("main").unwrap();
        store.delete("never-existed").unwrap();
        assert!(store.names().unwrap().is_empty());
    }

    #[test]
    fn list_ignores_unrelated_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .create(&Database::new("main", "pw", [1u8; SALT_LEN], RecordMap::new()))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("orphan.bin"), [0u8; SALT_LEN]).unwrap();
        fs::create_dir(dir.path().join("folder.db")).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "main");
        assert!(!listed[0].is_open());
    }

    #[test]
    fn leftover_staging_files_are_swept() {
        let dir = tempdir().unwrap();
        let leftover = dir.path().join(".credstore-abc123.staging");
        fs::write(&leftover, b"partial").unwrap();
        let _store = store(dir.path());
        assert!(!leftover.exists());
    }

    #[test]
    fn no_staging_files_remain_after_writes() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .create(&Database::new("main", "pw", [1u8; SALT_LEN], records()))
            .unwrap();
        store
            .save("main", &Database::new("main", "pw", [3u8; SALT_LEN], records()))
            .unwrap();
        let mut files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec!["main.bin".to_string(), "main.db".to_string()]);
        assert_eq!(store.read_salt("main").unwrap(), [3u8; SALT_LEN]);
    }

    #[test]
    fn invalid_old_name_is_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fresh = Database::new("fresh", "pw", [1u8; SALT_LEN], records());
        assert!(matches!(
            store.save("bad/name", &fresh),
            Err(StoreError::InvalidName(_))
        ));
        assert!(!dir.path().join("fresh.db").exists());
        assert!(!dir.path().join("fresh.bin").exists());
    }

    // A non-empty directory where the token goes makes the final rename fail.
    fn block_path(path: &Path) {
        let _ = fs::remove_file(path);
        fs::create_dir(path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();
    }

    #[test]
    fn failed_in_place_save_restores_salt() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let salt = [8u8; SALT_LEN];
        store
            .create(&Database::new("main", "pw", salt, records()))
            .unwrap();
        block_path(&dir.path().join("main.db"));

        let changed = Database::new("main", "pw2", [9u8; SALT_LEN], RecordMap::new());
        assert!(matches!(store.save("main", &changed), Err(StoreError::Io { .. })));
        assert_eq!(store.read_salt("main").unwrap(), salt);
        assert!(dir.path().join("main.db").join("occupied").is_file());
    }

    #[test]
    fn failed_rename_save_keeps_old_pair() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let salt = [6u8; SALT_LEN];
        store
            .create(&Database::new("test", "pw", salt, records()))
            .unwrap();
        let old_token = fs::read(dir.path().join("test.db")).unwrap();
        block_path(&dir.path().join("test2.db"));

        let renamed = Database::new("test2", "pw", salt, RecordMap::new());
        assert!(store.save("test", &renamed).is_err());

        assert_eq!(fs::read(dir.path().join("test.db")).unwrap(), old_token);
        assert_eq!(store.read_salt("test").unwrap(), salt);
        assert!(!dir.path().join("test2.bin").exists());
        assert_eq!(store.open("test", "pw").unwrap().records, records());
    }
}
